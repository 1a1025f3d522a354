//! Sensor samples and the sensor trust policy.
//!
//! One [`SensorSample`] holds everything the vehicle logs at a single instant: the sample
//! spacing, the IMU health code, attitude and acceleration, and the four DVL beam readings with
//! their lock status. [`TrustPolicy::assess`] turns a sample into an [`Observation`]: the
//! observation vector the filter consumes and a variance for every channel. Channels whose
//! sensor reports itself unhealthy get [`UNTRUSTED_VARIANCE`], which removes them from the
//! update.

use std::fmt::{self, Display};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::Quaternion;
use crate::vehicle::Beam;
use crate::{ObservationIndex, ObservationVector};

/// Variance marking a channel as carrying no information.
pub const UNTRUSTED_VARIANCE: f64 = f64::INFINITY;

/// Lock state reported by a DVL transducer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeamStatus {
    /// Bottom lock ('L'); velocity and range are valid.
    Locked,
    /// Any other status code, kept for diagnostics.
    Unlocked(char),
}

impl BeamStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, BeamStatus::Locked)
    }

    pub fn code(self) -> char {
        match self {
            BeamStatus::Locked => 'L',
            BeamStatus::Unlocked(c) => c,
        }
    }
}

impl From<char> for BeamStatus {
    fn from(c: char) -> Self {
        if c == 'L' {
            BeamStatus::Locked
        } else {
            BeamStatus::Unlocked(c)
        }
    }
}

impl Display for BeamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A single transducer's reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeamReading {
    /// Along-beam velocity (m/s)
    pub velocity: f64,
    /// Slant range to the seabed (m)
    pub range: f64,
    pub status: BeamStatus,
}

impl Default for BeamReading {
    fn default() -> Self {
        BeamReading {
            velocity: 0.0,
            range: 0.0,
            status: BeamStatus::Unlocked(' '),
        }
    }
}

/// Everything logged at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSample {
    /// Time since the previous sample (s)
    pub delta_time: f64,
    /// IMU health code; zero is healthy
    pub imu_status: i32,
    /// Attitude (radians)
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    /// Body-frame acceleration: x longitudinal, y transverse, z vertical (m/s^2)
    pub acceleration: Vector3<f64>,
    /// Readings in bow, starboard, port, stern order
    pub beams: [BeamReading; 4],
}

impl Default for SensorSample {
    fn default() -> Self {
        SensorSample {
            delta_time: 0.0,
            imu_status: 0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            acceleration: Vector3::zeros(),
            beams: [BeamReading::default(); 4],
        }
    }
}

impl SensorSample {
    pub fn imu_ok(&self) -> bool {
        self.imu_status == 0
    }

    pub fn beam(&self, beam: Beam) -> &BeamReading {
        &self.beams[beam as usize]
    }
}

impl Display for SensorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SensorSample(dt: {:.3}, imu: {}, beams: [{}{}{}{}])",
            self.delta_time,
            self.imu_status,
            self.beams[0].status,
            self.beams[1].status,
            self.beams[2].status,
            self.beams[3].status
        )
    }
}

/// Observation vector plus the variance of every channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub values: ObservationVector,
    pub variances: ObservationVector,
}

impl Observation {
    /// Number of channels that will take part in the update.
    pub fn trusted_channels(&self) -> usize {
        self.variances.iter().filter(|v| v.is_finite()).count()
    }

    fn set(&mut self, index: ObservationIndex, value: f64, variance: f64) {
        self.values[index as usize] = value;
        self.variances[index as usize] = variance;
    }
}

/// Nominal variances for healthy sensors.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    /// Variance of each IMU quaternion component
    pub imu_rotation: f64,
    /// Variance of each IMU acceleration axis ((m/s^2)^2)
    pub imu_acceleration: f64,
    /// Variance of a locked beam's slant range (m^2)
    pub range: f64,
    /// Variance of a locked beam's along-beam velocity ((m/s)^2)
    pub velocity: f64,
    /// Variance of the logged sample spacing; zero means exact
    pub delta_time: f64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy {
            imu_rotation: 1e-7,
            imu_acceleration: 1.4e-4,
            range: 3.9e-4,
            velocity: 4.2e-3,
            delta_time: 0.0,
        }
    }
}

impl TrustPolicy {
    /// Build the observation and its per-channel variances for one sample.
    ///
    /// An unhealthy IMU untrusts all seven IMU channels and leaves their values at zero. Each
    /// beam is judged on its own lock status, which covers both its velocity and its range.
    pub fn assess(&self, sample: &SensorSample) -> Observation {
        let mut obs = Observation {
            values: ObservationVector::zeros(),
            variances: ObservationVector::from_element(UNTRUSTED_VARIANCE),
        };

        if sample.imu_ok() {
            let q = Quaternion::from_ypr(sample.yaw, sample.pitch, sample.roll);
            obs.set(ObservationIndex::ImuQi, q.qi, self.imu_rotation);
            obs.set(ObservationIndex::ImuQj, q.qj, self.imu_rotation);
            obs.set(ObservationIndex::ImuQk, q.qk, self.imu_rotation);
            obs.set(ObservationIndex::ImuQr, q.qr, self.imu_rotation);
            obs.set(
                ObservationIndex::ImuAccX,
                sample.acceleration[0],
                self.imu_acceleration,
            );
            obs.set(
                ObservationIndex::ImuAccY,
                sample.acceleration[1],
                self.imu_acceleration,
            );
            obs.set(
                ObservationIndex::ImuAccZ,
                sample.acceleration[2],
                self.imu_acceleration,
            );
        }

        for beam in Beam::ALL {
            let reading = sample.beam(beam);
            let (velocity_var, range_var) = if reading.status.is_locked() {
                (self.velocity, self.range)
            } else {
                (UNTRUSTED_VARIANCE, UNTRUSTED_VARIANCE)
            };
            obs.set(beam.velocity_index(), reading.velocity, velocity_var);
            obs.set(beam.range_index(), reading.range, range_var);
        }

        obs.set(
            ObservationIndex::DeltaTime,
            sample.delta_time,
            self.delta_time,
        );
        obs
    }
}
