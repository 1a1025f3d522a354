//! The assembled DVL/IMU navigation filter.
//!
//! [`DvlFilter`] owns a [`DvlModel`] inside the generic [`ExtendedKalmanFilter`] engine together
//! with a [`TrustPolicy`]. Each call to [`DvlFilter::process`] assesses one sensor sample, loads the
//! resulting per-channel variances into the engine, and runs one predict/update cycle.

use std::fmt::{self, Display};

use log::debug;

use crate::config::FilterConfig;
use crate::kalman::{ExtendedKalmanFilter, FilterError};
use crate::linearize::DvlModel;
use crate::measurements::{Observation, SensorSample, TrustPolicy};
use crate::vehicle::TransducerGeometry;
use crate::{NavigationState, OBS_DIM, ObservationIndex, ObservationVector, STATE_DIM, StateVector};

/// Measurement variance loaded into every channel before the first sample.
pub const DEFAULT_MEASUREMENT_VARIANCE: f64 = 1e-4;

/// Engine specialised to the navigation model.
pub type DvlEngine = ExtendedKalmanFilter<DvlModel, STATE_DIM, OBS_DIM>;

#[derive(Clone, Debug)]
pub struct DvlFilter {
    engine: DvlEngine,
    trust: TrustPolicy,
    initial_covariance: StateVector,
}

impl Display for DvlFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DvlFilter({})", self.state())
    }
}

impl DvlFilter {
    /// Build a filter from a configuration.
    ///
    /// Fails with [`FilterError::InvalidConfig`] when [`FilterConfig::validate`] rejects the
    /// configuration.
    pub fn new(config: &FilterConfig) -> Result<Self, FilterError> {
        config
            .validate()
            .map_err(|e| FilterError::InvalidConfig {
                reason: e.to_string(),
            })?;
        let model = DvlModel::new(TransducerGeometry::from_mounting_angle(
            config.mounting_angle_deg,
        ));
        let initial_state = StateVector::from(config.initial_state.to_state());
        let initial_covariance = config.initial_covariance.diagonal();
        let mut engine = ExtendedKalmanFilter::new(model, initial_state, initial_covariance);

        let q = config.process_noise.diagonal();
        for i in 0..STATE_DIM {
            engine.set_process_noise(i, q[i])?;
        }
        let mut r = ObservationVector::from_element(DEFAULT_MEASUREMENT_VARIANCE);
        r[ObservationIndex::DeltaTime as usize] = 0.0;
        engine.set_measurement_variances(&r)?;
        Ok(DvlFilter {
            engine,
            trust: config.trust,
            initial_covariance,
        })
    }

    /// Assess one sensor sample and fold it into the estimate.
    ///
    /// On error the estimate is unchanged.
    pub fn process(&mut self, sample: &SensorSample) -> Result<NavigationState, FilterError> {
        let observation = self.trust.assess(sample);
        debug!(
            "{} with {} of {} channels trusted",
            sample,
            observation.trusted_channels(),
            OBS_DIM
        );
        self.step_observation(&observation)
    }

    /// Run one filter cycle against an already-assessed observation.
    ///
    /// An invalid variance on any channel is rejected before the engine is touched.
    pub fn step_observation(
        &mut self,
        observation: &Observation,
    ) -> Result<NavigationState, FilterError> {
        self.engine.set_measurement_variances(&observation.variances)?;
        self.engine.step(&observation.values)?;
        Ok(self.state())
    }

    /// Current estimate with named fields.
    pub fn state(&self) -> NavigationState {
        NavigationState::from(self.engine.get_estimate())
    }

    /// Reset the covariance to its configured initial value, keeping the estimate.
    pub fn reset_covariance(&mut self) {
        self.engine.reset_covariance(&self.initial_covariance);
    }

    pub fn trust_policy(&self) -> &TrustPolicy {
        &self.trust
    }

    pub fn engine(&self) -> &DvlEngine {
        &self.engine
    }
}
