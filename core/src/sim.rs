//! Sensor log ingestion, filter playback, and synthetic scenarios.
//!
//! This module provides:
//! - [`DvlLogRecord`], one row of a vehicle's DVL/IMU CSV log, with [`read_log`] and [`write_log`]
//! - [`NavigationResult`], one row of filter output, with [`write_results`] and [`read_results`]
//! - [`run_filter`], which plays a log through a [`DvlFilter`] and applies the configured
//!   [`FailurePolicy`] to failed steps
//! - [`Scenario`] and [`synthesize`], which generate noisy logs with a known ground truth

use std::io;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::NavigationState;
use crate::config::{FailurePolicy, FilterConfig};
use crate::filter::DvlFilter;
use crate::geometry::{Quaternion, dot};
use crate::linearize::MIN_VERTICAL_COMPONENT;
use crate::measurements::{BeamReading, SensorSample};
use crate::vehicle::{Beam, DEFAULT_MOUNTING_ANGLE_DEG, SOUNDING_AXIS, TransducerGeometry};

/// Beam status code written for a beam with bottom lock.
pub const LOCKED: char = 'L';
/// Beam status code written by [`synthesize`] for a beam without bottom lock.
pub const NO_LOCK: char = 'N';

/// One row of a DVL/IMU log.
///
/// Columns are read by position, not by header name. Angles are in degrees. `imu_ok` is a health
/// code where zero means healthy. `imu_cal` and `dvl_ok` are carried through but not consulted by
/// the filter: beam health comes from the per-beam status characters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DvlLogRecord {
    /// Time since the previous row (s)
    pub delta_t: f64,
    pub imu_ok: i32,
    pub imu_cal: char,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    /// Forward acceleration (m/s^2)
    pub acc_longitudinal: f64,
    /// Starboard acceleration (m/s^2)
    pub acc_transverse: f64,
    /// Downward acceleration (m/s^2)
    pub acc_vertical: f64,
    pub dvl_ok: f64,
    pub vel_bow: f64,
    pub vel_starboard: f64,
    pub vel_port: f64,
    pub vel_stern: f64,
    pub range_bow: f64,
    pub range_starboard: f64,
    pub range_port: f64,
    pub range_stern: f64,
    pub status_bow: char,
    pub status_starboard: char,
    pub status_port: char,
    pub status_stern: char,
}

impl DvlLogRecord {
    /// Convert to a filter input, turning degrees into radians.
    pub fn to_sample(&self) -> SensorSample {
        let beam = |velocity: f64, range: f64, status: char| BeamReading {
            velocity,
            range,
            status: status.into(),
        };
        SensorSample {
            delta_time: self.delta_t,
            imu_status: self.imu_ok,
            roll: self.roll.to_radians(),
            pitch: self.pitch.to_radians(),
            yaw: self.yaw.to_radians(),
            acceleration: Vector3::new(
                self.acc_longitudinal,
                self.acc_transverse,
                self.acc_vertical,
            ),
            beams: [
                beam(self.vel_bow, self.range_bow, self.status_bow),
                beam(self.vel_starboard, self.range_starboard, self.status_starboard),
                beam(self.vel_port, self.range_port, self.status_port),
                beam(self.vel_stern, self.range_stern, self.status_stern),
            ],
        }
    }
}

/// Reads a DVL log, skipping the header line.
///
/// Rows that cannot be parsed are logged at `warn` and skipped; only a file that cannot be opened
/// is an error.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<DvlLogRecord>> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open log {}", path.display()))?;

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (i, row) in rdr.records().enumerate() {
        // header is line 1
        let line = i + 2;
        let parsed = row
            .map_err(anyhow::Error::from)
            .and_then(|r| r.deserialize::<DvlLogRecord>(None).map_err(anyhow::Error::from));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("{}:{}: skipping malformed row: {}", path.display(), line, e);
                skipped += 1;
            }
        }
    }
    info!(
        "read {} rows from {} ({} skipped)",
        records.len(),
        path.display(),
        skipped
    );
    Ok(records)
}

/// Writes a DVL log with a header line.
pub fn write_log<P: AsRef<Path>>(records: &[DvlLogRecord], path: P) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// One row of filter output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationResult {
    /// Row index in the input log
    pub sample: usize,
    /// Sum of the finite logged sample spacings up to this row (s)
    pub elapsed: f64,
    /// False when the filter step failed and the row was dropped
    pub accepted: bool,
    pub delta_time: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub imu_acc_offset_x: f64,
    pub imu_acc_offset_y: f64,
    pub imu_acc_offset_z: f64,
    pub sounding_z: f64,
    pub rot_qi: f64,
    pub rot_qj: f64,
    pub rot_qk: f64,
    pub rot_qr: f64,
}

impl NavigationResult {
    pub fn new(sample: usize, elapsed: f64, accepted: bool, state: &NavigationState) -> Self {
        NavigationResult {
            sample,
            elapsed,
            accepted,
            delta_time: state.delta_time,
            vel_x: state.velocity[0],
            vel_y: state.velocity[1],
            vel_z: state.velocity[2],
            acc_x: state.acceleration[0],
            acc_y: state.acceleration[1],
            acc_z: state.acceleration[2],
            imu_acc_offset_x: state.imu_acc_offset[0],
            imu_acc_offset_y: state.imu_acc_offset[1],
            imu_acc_offset_z: state.imu_acc_offset[2],
            sounding_z: state.sounding_z,
            rot_qi: state.rotation.qi,
            rot_qj: state.rotation.qj,
            rot_qk: state.rotation.qk,
            rot_qr: state.rotation.qr,
        }
    }
}

/// Writes filter output with a header line.
pub fn write_results<P: AsRef<Path>>(results: &[NavigationResult], path: P) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads filter output written by [`write_results`].
pub fn read_results<P: AsRef<Path>>(path: P) -> Result<Vec<NavigationResult>> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open results {}", path.display()))?;
    let mut results = Vec::new();
    for row in rdr.deserialize() {
        let result: NavigationResult = row?;
        results.push(result);
    }
    Ok(results)
}

/// Plays a log through a freshly built filter, one output row per input row.
///
/// A failed step is handled according to `config.on_failure`: the row is marked not accepted and
/// the previous estimate is reported, the covariance is optionally reset, or the run stops with
/// an error naming the row.
pub fn run_filter(records: &[DvlLogRecord], config: &FilterConfig) -> Result<Vec<NavigationResult>> {
    let mut filter = DvlFilter::new(config).context("invalid filter configuration")?;
    let mut results = Vec::with_capacity(records.len());
    let mut elapsed = 0.0;
    let mut rejected = 0usize;

    for (i, record) in records.iter().enumerate() {
        // a non-finite spacing fails its step below and must not poison later rows
        if record.delta_t.is_finite() {
            elapsed += record.delta_t;
        }
        let accepted = match filter.process(&record.to_sample()) {
            Ok(_) => true,
            Err(e) => {
                rejected += 1;
                match config.on_failure {
                    FailurePolicy::Skip => {
                        warn!("sample {}: {}; skipped", i, e);
                    }
                    FailurePolicy::ResetCovariance => {
                        warn!("sample {}: {}; skipped and covariance reset", i, e);
                        filter.reset_covariance();
                    }
                    FailurePolicy::Abort => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("filter step failed at sample {}", i)));
                    }
                }
                false
            }
        };
        results.push(NavigationResult::new(i, elapsed, accepted, &filter.state()));
    }
    info!(
        "processed {} samples ({} rejected); final {}",
        records.len(),
        rejected,
        filter.state()
    );
    Ok(results)
}

/// A vehicle moving with constant body acceleration over a flat seabed at fixed attitude.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub samples: usize,
    /// Sample spacing (s)
    pub delta_time: f64,
    /// Body acceleration: longitudinal, transverse, vertical (m/s^2)
    pub acceleration: [f64; 3],
    /// Body velocity at the first sample (m/s)
    pub initial_velocity: [f64; 3],
    /// Vertical distance to the seabed at the first sample (m)
    pub sounding: f64,
    /// Roll, pitch, yaw (degrees)
    pub attitude_deg: [f64; 3],
    pub mounting_angle_deg: f64,
    /// Standard deviations of the additive sensor noise
    pub velocity_noise: f64,
    pub range_noise: f64,
    pub acceleration_noise: f64,
    pub attitude_noise_deg: f64,
    /// Probability that a beam loses lock on any one sample
    pub beam_dropout: f64,
    /// Probability that the IMU reports a fault on any one sample
    pub imu_dropout: f64,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            samples: 200,
            delta_time: 0.2,
            acceleration: [0.1, 0.0, 0.0],
            initial_velocity: [0.0; 3],
            sounding: 10.0,
            attitude_deg: [0.0; 3],
            mounting_angle_deg: DEFAULT_MOUNTING_ANGLE_DEG,
            velocity_noise: 0.0,
            range_noise: 0.0,
            acceleration_noise: 0.0,
            attitude_noise_deg: 0.0,
            beam_dropout: 0.0,
            imu_dropout: 0.0,
        }
    }
}

impl Scenario {
    /// True body velocity at each sample.
    pub fn true_velocities(&self) -> Vec<Vector3<f64>> {
        let v0 = Vector3::from(self.initial_velocity);
        let a = Vector3::from(self.acceleration);
        (0..self.samples)
            .map(|k| v0 + a * (k as f64 * self.delta_time))
            .collect()
    }
}

fn normal(std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, std_dev).map_err(|e| anyhow!("invalid noise level {}: {}", std_dev, e))
}

fn check_probability(name: &str, p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(anyhow!("{} must be a probability, got {}", name, p))
    }
}

/// Generate a log for `scenario`, reproducible from `seed`.
///
/// The truth follows the same Euler step the filter uses, so a noise-free scenario is
/// reproduced exactly. Beams whose rotated direction has no downward component never get lock.
pub fn synthesize(scenario: &Scenario, seed: u64) -> Result<Vec<DvlLogRecord>> {
    check_probability("beam_dropout", scenario.beam_dropout)?;
    check_probability("imu_dropout", scenario.imu_dropout)?;
    let velocity_noise = normal(scenario.velocity_noise)?;
    let range_noise = normal(scenario.range_noise)?;
    let acceleration_noise = normal(scenario.acceleration_noise)?;
    let attitude_noise = normal(scenario.attitude_noise_deg)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let geometry = TransducerGeometry::from_mounting_angle(scenario.mounting_angle_deg);
    let [roll, pitch, yaw] = scenario.attitude_deg;
    let rotation = Quaternion::from_ypr(yaw.to_radians(), pitch.to_radians(), roll.to_radians());
    let beams = Beam::ALL.map(|b| rotation.rotate(geometry.direction(b)));
    let a = Vector3::from(scenario.acceleration);

    let mut velocity = Vector3::from(scenario.initial_velocity);
    let mut sounding = scenario.sounding;
    let mut records = Vec::with_capacity(scenario.samples);
    for _ in 0..scenario.samples {
        let mut readings = [(0.0, 0.0, NO_LOCK); 4];
        for (reading, direction) in readings.iter_mut().zip(beams.iter()) {
            let vertical = dot(&SOUNDING_AXIS, direction);
            let dropped = rng.random::<f64>() < scenario.beam_dropout;
            let v = velocity.dot(direction) + velocity_noise.sample(&mut rng);
            if vertical < MIN_VERTICAL_COMPONENT {
                *reading = (v, 0.0, NO_LOCK);
                continue;
            }
            let r = sounding / vertical + range_noise.sample(&mut rng);
            *reading = (v, r, if dropped { NO_LOCK } else { LOCKED });
        }
        let imu_fault = rng.random::<f64>() < scenario.imu_dropout;
        let acc = a + Vector3::from_fn(|_, _| acceleration_noise.sample(&mut rng));
        let [bow, starboard, port, stern] = readings;
        records.push(DvlLogRecord {
            delta_t: scenario.delta_time,
            imu_ok: i32::from(imu_fault),
            imu_cal: 'C',
            roll: roll + attitude_noise.sample(&mut rng),
            pitch: pitch + attitude_noise.sample(&mut rng),
            yaw: yaw + attitude_noise.sample(&mut rng),
            acc_longitudinal: acc[0],
            acc_transverse: acc[1],
            acc_vertical: acc[2],
            dvl_ok: 0.0,
            vel_bow: bow.0,
            vel_starboard: starboard.0,
            vel_port: port.0,
            vel_stern: stern.0,
            range_bow: bow.1,
            range_starboard: starboard.1,
            range_port: port.1,
            range_stern: stern.1,
            status_bow: bow.2,
            status_starboard: starboard.2,
            status_port: port.2,
            status_stern: stern.2,
        });

        sounding -= velocity[2] * scenario.delta_time;
        velocity += a * scenario.delta_time;
    }
    Ok(records)
}
