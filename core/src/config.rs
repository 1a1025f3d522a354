//! Filter configuration.
//!
//! [`FilterConfig`] gathers everything needed to build a [`crate::DvlFilter`]: the initial state
//! and its uncertainty, the process noise, the sensor trust policy, the transducer mounting angle,
//! and what a run should do when a filter step fails. Every field has a default, so a config file
//! only needs to name the values it changes. Files are read and written as JSON or TOML depending
//! on their extension.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use clap::ValueEnum;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::Quaternion;
use crate::measurements::TrustPolicy;
use crate::vehicle::DEFAULT_MOUNTING_ANGLE_DEG;
use crate::{NavigationState, STATE_DIM, StateIndex, StateVector};

/// What a run does with a sample whose filter step fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Drop the sample and keep the previous estimate.
    #[default]
    Skip,
    /// Drop the sample and reset the covariance to its initial value.
    ResetCovariance,
    /// Stop processing.
    Abort,
}

/// Initial state estimate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialStateConfig {
    pub delta_time: f64,
    pub velocity: [f64; 3],
    pub acceleration: [f64; 3],
    pub imu_acc_offset: [f64; 3],
    pub sounding_z: f64,
    /// Roll, pitch, yaw in degrees
    pub attitude_deg: [f64; 3],
}

impl Default for InitialStateConfig {
    fn default() -> Self {
        InitialStateConfig {
            delta_time: 0.0,
            velocity: [0.0; 3],
            acceleration: [0.0; 3],
            imu_acc_offset: [0.0; 3],
            sounding_z: 0.0,
            attitude_deg: [0.0; 3],
        }
    }
}

impl InitialStateConfig {
    pub fn to_state(&self) -> NavigationState {
        let [roll, pitch, yaw] = self.attitude_deg;
        NavigationState {
            delta_time: self.delta_time,
            velocity: Vector3::from(self.velocity),
            acceleration: Vector3::from(self.acceleration),
            imu_acc_offset: Vector3::from(self.imu_acc_offset),
            sounding_z: self.sounding_z,
            rotation: Quaternion::from_ypr(yaw.to_radians(), pitch.to_radians(), roll.to_radians()),
        }
    }
}

/// Diagonal of the initial state covariance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialCovariance {
    /// Variance of every state not listed below
    pub default: f64,
    pub imu_acc_offset: f64,
}

impl Default for InitialCovariance {
    fn default() -> Self {
        InitialCovariance {
            default: 1.0,
            imu_acc_offset: 1e-4,
        }
    }
}

impl InitialCovariance {
    pub fn diagonal(&self) -> StateVector {
        let mut diag = StateVector::from_element(self.default);
        for idx in [
            StateIndex::ImuAccOffsetX,
            StateIndex::ImuAccOffsetY,
            StateIndex::ImuAccOffsetZ,
        ] {
            diag[idx as usize] = self.imu_acc_offset;
        }
        diag
    }
}

/// Diagonal of the process noise covariance `Q`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessNoise {
    /// Variance of every state not listed below
    pub default: f64,
    pub sounding_z: f64,
    pub imu_acc_offset: f64,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        ProcessNoise {
            default: 1e-4,
            sounding_z: 1e-3,
            imu_acc_offset: 7e-6,
        }
    }
}

impl ProcessNoise {
    pub fn diagonal(&self) -> StateVector {
        let mut diag = StateVector::from_element(self.default);
        diag[StateIndex::SoundingZ as usize] = self.sounding_z;
        for idx in [
            StateIndex::ImuAccOffsetX,
            StateIndex::ImuAccOffsetY,
            StateIndex::ImuAccOffsetZ,
        ] {
            diag[idx as usize] = self.imu_acc_offset;
        }
        diag
    }
}

/// Complete filter configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Beam depression angle below the horizontal plane, degrees
    pub mounting_angle_deg: f64,
    pub on_failure: FailurePolicy,
    pub initial_state: InitialStateConfig,
    pub initial_covariance: InitialCovariance,
    pub process_noise: ProcessNoise,
    pub trust: TrustPolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            mounting_angle_deg: DEFAULT_MOUNTING_ANGLE_DEG,
            on_failure: FailurePolicy::default(),
            initial_state: InitialStateConfig::default(),
            initial_covariance: InitialCovariance::default(),
            process_noise: ProcessNoise::default(),
            trust: TrustPolicy::default(),
        }
    }
}

impl FilterConfig {
    /// Checks that every variance is usable and the mounting angle points the beams downward.
    pub fn validate(&self) -> io::Result<()> {
        let q = self.process_noise.diagonal();
        let p0 = self.initial_covariance.diagonal();
        for i in 0..STATE_DIM {
            if !(q[i].is_finite() && q[i] >= 0.0) || !(p0[i].is_finite() && p0[i] >= 0.0) {
                return Err(invalid(format!(
                    "non-finite or negative variance for state {}",
                    StateIndex::ALL[i].name()
                )));
            }
        }
        let trust = &self.trust;
        for (name, v) in [
            ("imu_rotation", trust.imu_rotation),
            ("imu_acceleration", trust.imu_acceleration),
            ("range", trust.range),
            ("velocity", trust.velocity),
            ("delta_time", trust.delta_time),
        ] {
            if v.is_nan() || v < 0.0 {
                return Err(invalid(format!("invalid trust variance {name} = {v}")));
            }
        }
        if !(self.mounting_angle_deg > 0.0 && self.mounting_angle_deg <= 90.0) {
            return Err(invalid(format!(
                "mounting angle {} deg is outside (0, 90]",
                self.mounting_angle_deg
            )));
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension()),
        }
    }

    /// Generic read: choose format by file extension (.json/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        let config = match extension(p).as_deref() {
            Some("json") => Self::from_json(p)?,
            Some("toml") => Self::from_toml(p)?,
            _ => return Err(unsupported_extension()),
        };
        config.validate()?;
        Ok(config)
    }
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "unsupported file extension")
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
