//! Fixed-size Extended Kalman Filter engine
//!
//! This module contains a model-agnostic EKF. The engine owns the state estimate, its
//! covariance, the process noise `Q`, and the per-channel measurement variances (the diagonal of
//! `R`); the nonlinear model is injected by value through the [`StateSpaceModel`] trait.
//!
//! # Mathematical Background
//!
//! ## Predict Step
//!
//! $$
//! \begin{aligned}
//! \bar{x}_{k+1} &= f(x_k) \\\\
//! \bar{P}_{k+1} &= F_k P_k F_k^T + Q
//! \end{aligned}
//! $$
//!
//! ## Update Step
//!
//! The observation function and its Jacobian are evaluated at the predicted state. Only the
//! *active* channels take part: a channel with infinite variance carries no information, and a
//! channel the model reports as unobservable has no prediction.
//!
//! $$
//! \begin{aligned}
//! S_k &= H_k \bar{P}_k H_k^T + R_k \\\\
//! K_k &= \bar{P}_k H_k^T S_k^{-1} \\\\
//! x_k &= \bar{x}_k + K_k (z_k - h(\bar{x}_k)) \\\\
//! P_k &= (I - K_k H_k) \bar{P}_k (I - K_k H_k)^T + K_k R_k K_k^T
//! \end{aligned}
//! $$
//!
//! The covariance update uses the Joseph form for numerical stability.
//!
//! # Failure semantics
//!
//! [`ExtendedKalmanFilter::step`] is transactional: when it returns an error the state and
//! covariance are exactly what they were before the call, and the caller decides whether to skip
//! the sample, reset the covariance, or stop.

use std::fmt::{self, Debug, Display};

use log::trace;
use nalgebra::{DMatrix, DVector, SMatrix, SVector};
use thiserror::Error;

use crate::StateSpaceModel;
use crate::linalg::{robust_spd_solve, symmetrize};

/// Diagonal regularization added after every covariance propagation and update.
const COVARIANCE_EPSILON: f64 = 1e-9;

/// Errors raised by the filter engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    /// The innovation covariance could not be inverted.
    #[error("innovation covariance is singular or not finite")]
    SingularInnovation,
    /// The update produced a non-finite state or covariance.
    #[error("filter update produced a non-finite state")]
    NonFiniteState,
    /// A trusted observation channel carried a non-finite value.
    #[error("observation channel {index} is not finite")]
    NonFiniteObservation { index: usize },
    /// A variance was negative or NaN.
    #[error("invalid variance {variance} for channel {index}")]
    InvalidVariance { index: usize, variance: f64 },
    /// A state or channel index past the end of its vector.
    #[error("index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },
    /// The filter configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Extended Kalman Filter over a model with `N` states and `M` observation channels.
#[derive(Clone)]
pub struct ExtendedKalmanFilter<S, const N: usize, const M: usize>
where
    S: StateSpaceModel<N, M>,
{
    model: S,
    /// State estimate
    mean_state: SVector<f64, N>,
    /// State covariance
    covariance: SMatrix<f64, N, N>,
    /// Process noise covariance
    process_noise: SMatrix<f64, N, N>,
    /// Per-channel measurement variances (diagonal of R)
    measurement_noise: SVector<f64, M>,
}

impl<S, const N: usize, const M: usize> Debug for ExtendedKalmanFilter<S, N, M>
where
    S: StateSpaceModel<N, M>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("measurement_noise", &self.measurement_noise)
            .finish()
    }
}

impl<S, const N: usize, const M: usize> Display for ExtendedKalmanFilter<S, N, M>
where
    S: StateSpaceModel<N, M>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKalmanFilter")
            .field("state_size", &N)
            .field("observation_size", &M)
            .field("mean_state", &self.mean_state.as_slice())
            .field("covariance_diagonal", &self.covariance.diagonal().as_slice())
            .finish()
    }
}

fn check_variance(index: usize, variance: f64) -> Result<(), FilterError> {
    if variance.is_nan() || variance < 0.0 {
        return Err(FilterError::InvalidVariance { index, variance });
    }
    Ok(())
}

impl<S, const N: usize, const M: usize> ExtendedKalmanFilter<S, N, M>
where
    S: StateSpaceModel<N, M>,
{
    /// Create a new filter.
    ///
    /// The process noise starts at zero and every measurement variance at zero; set them with
    /// [`Self::set_process_noise`] and [`Self::set_measurement_variance`].
    ///
    /// # Arguments
    /// * `model` - the state-space model, owned by the filter
    /// * `initial_state` - the initial state estimate
    /// * `covariance_diagonal` - the initial state uncertainty (diagonal covariance elements)
    pub fn new(
        model: S,
        initial_state: SVector<f64, N>,
        covariance_diagonal: SVector<f64, N>,
    ) -> Self {
        ExtendedKalmanFilter {
            model,
            mean_state: initial_state,
            covariance: SMatrix::from_diagonal(&covariance_diagonal),
            process_noise: SMatrix::zeros(),
            measurement_noise: SVector::zeros(),
        }
    }

    /// Set the process noise variance of state `i`.
    pub fn set_process_noise(&mut self, i: usize, variance: f64) -> Result<(), FilterError> {
        if i >= N {
            return Err(FilterError::IndexOutOfRange { index: i, len: N });
        }
        check_variance(i, variance)?;
        self.process_noise[(i, i)] = variance;
        Ok(())
    }

    /// Set the variance for future measurements on channel `i`.
    ///
    /// `0` means the channel is exactly known, `s * s` means standard deviation `s`, and
    /// `f64::INFINITY` means the channel is completely untrusted and is left out of the update.
    pub fn set_measurement_variance(&mut self, i: usize, variance: f64) -> Result<(), FilterError> {
        if i >= M {
            return Err(FilterError::IndexOutOfRange { index: i, len: M });
        }
        check_variance(i, variance)?;
        self.measurement_noise[i] = variance;
        Ok(())
    }

    /// Replace every measurement variance at once.
    ///
    /// All channels are checked before any is written, so on error the previous variances stay.
    pub fn set_measurement_variances(
        &mut self,
        variances: &SVector<f64, M>,
    ) -> Result<(), FilterError> {
        for (i, &variance) in variances.iter().enumerate() {
            check_variance(i, variance)?;
        }
        self.measurement_noise = *variances;
        Ok(())
    }

    pub fn measurement_variances(&self) -> &SVector<f64, M> {
        &self.measurement_noise
    }

    /// Current value of state `i`.
    pub fn get_state(&self, i: usize) -> Result<f64, FilterError> {
        if i >= N {
            return Err(FilterError::IndexOutOfRange { index: i, len: N });
        }
        Ok(self.mean_state[i])
    }

    pub fn get_estimate(&self) -> SVector<f64, N> {
        self.mean_state
    }

    pub fn get_certainty(&self) -> SMatrix<f64, N, N> {
        self.covariance
    }

    /// Replace the covariance with a diagonal one, keeping the state estimate.
    pub fn reset_covariance(&mut self, covariance_diagonal: &SVector<f64, N>) {
        self.covariance = SMatrix::from_diagonal(covariance_diagonal);
    }

    /// Run one predict + update cycle against observation `z`.
    pub fn step(&mut self, z: &SVector<f64, M>) -> Result<(), FilterError> {
        // Predict
        let transition = self.model.evaluate(&self.mean_state);
        let predicted_state = transition.fx;
        let mut predicted_covariance =
            transition.f * self.covariance * transition.f.transpose() + self.process_noise;
        predicted_covariance = 0.5 * (predicted_covariance + predicted_covariance.transpose());
        for i in 0..N {
            predicted_covariance[(i, i)] += COVARIANCE_EPSILON;
        }

        // Observation around the predicted state
        let observation = self.model.evaluate(&predicted_state);
        let active: Vec<usize> = (0..M)
            .filter(|&i| self.measurement_noise[i].is_finite() && !observation.unobservable[i])
            .collect();
        if let Some(&index) = active.iter().find(|&&i| !z[i].is_finite()) {
            return Err(FilterError::NonFiniteObservation { index });
        }
        if active.is_empty() {
            trace!("no trusted channels; prediction only");
            return self.commit(predicted_state, predicted_covariance);
        }

        let m = active.len();
        let h = DMatrix::<f64>::from_fn(m, N, |r, c| observation.h[(active[r], c)]);
        let r_noise = DMatrix::<f64>::from_diagonal(&DVector::from_iterator(
            m,
            active.iter().map(|&i| self.measurement_noise[i]),
        ));
        let innovation =
            DVector::<f64>::from_iterator(m, active.iter().map(|&i| z[i] - observation.hx[i]));
        let p = DMatrix::<f64>::from_column_slice(N, N, predicted_covariance.as_slice());

        // Innovation covariance: S = H * P * H^T + R
        let s = &h * &p * h.transpose() + &r_noise;
        // Kalman gain: K = P * H^T * S^(-1) = (S^(-1) * H * P)^T, S and P symmetric
        let k = robust_spd_solve(&symmetrize(&s), &(&h * &p))
            .ok_or(FilterError::SingularInnovation)?
            .transpose();

        let correction = &k * innovation;
        let updated_state = SVector::<f64, N>::from_fn(|i, _| predicted_state[i] + correction[i]);

        // Joseph form: P = (I - K*H)*P*(I - K*H)^T + K*R*K^T
        let i_kh = DMatrix::<f64>::identity(N, N) - &k * &h;
        let updated = symmetrize(&(&i_kh * &p * i_kh.transpose() + &k * &r_noise * k.transpose()));
        let mut updated_covariance = SMatrix::<f64, N, N>::from_fn(|r, c| updated[(r, c)]);
        for i in 0..N {
            updated_covariance[(i, i)] += COVARIANCE_EPSILON;
        }
        trace!("updated with {} of {} channels", m, M);
        self.commit(updated_state, updated_covariance)
    }

    fn commit(
        &mut self,
        state: SVector<f64, N>,
        covariance: SMatrix<f64, N, N>,
    ) -> Result<(), FilterError> {
        if !state.iter().all(|v| v.is_finite()) || !covariance.iter().all(|v| v.is_finite()) {
            return Err(FilterError::NonFiniteState);
        }
        self.mean_state = state;
        self.covariance = covariance;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Linearization;
    use assert_approx_eq::assert_approx_eq;

    /// Constant-velocity 1-D tracker: state [position, velocity], both observed directly.
    #[derive(Clone, Debug)]
    struct ConstantVelocity {
        dt: f64,
    }

    impl StateSpaceModel<2, 2> for ConstantVelocity {
        fn evaluate(&self, state: &SVector<f64, 2>) -> Linearization<2, 2> {
            let mut lin = Linearization::identity(state);
            lin.fx[0] += state[1] * self.dt;
            lin.f[(0, 1)] = self.dt;
            lin.hx = *state;
            lin.h = SMatrix::identity();
            lin
        }
    }

    /// Model whose second channel never has a prediction.
    struct HalfBlind;

    impl StateSpaceModel<1, 2> for HalfBlind {
        fn evaluate(&self, state: &SVector<f64, 1>) -> Linearization<1, 2> {
            let mut lin = Linearization::identity(state);
            lin.hx[0] = state[0];
            lin.h[(0, 0)] = 1.0;
            lin.unobservable[1] = true;
            lin
        }
    }

    fn tracker() -> ExtendedKalmanFilter<ConstantVelocity, 2, 2> {
        let mut ekf = ExtendedKalmanFilter::new(
            ConstantVelocity { dt: 1.0 },
            SVector::<f64, 2>::zeros(),
            SVector::<f64, 2>::from_element(1.0),
        );
        ekf.set_process_noise(0, 1e-4).unwrap();
        ekf.set_process_noise(1, 1e-4).unwrap();
        ekf.set_measurement_variance(0, 0.01).unwrap();
        ekf.set_measurement_variance(1, 0.01).unwrap();
        ekf
    }

    #[test]
    fn tracker_converges() {
        let mut ekf = tracker();
        for k in 1..=50 {
            let t = k as f64;
            let z = SVector::<f64, 2>::new(2.0 * t, 2.0);
            ekf.step(&z).unwrap();
        }
        assert_approx_eq!(ekf.get_state(1).unwrap(), 2.0, 1e-3);
        assert_approx_eq!(ekf.get_state(0).unwrap(), 100.0, 1e-2);
        let p = ekf.get_certainty();
        assert!(p[(0, 0)] < 0.01);
        assert_approx_eq!(p[(0, 1)], p[(1, 0)], 1e-15);
    }

    #[test]
    fn infinite_variance_channel_is_ignored() {
        let mut ekf = tracker();
        ekf.set_measurement_variance(1, f64::INFINITY).unwrap();
        // velocity channel would drag the estimate to 1000 if it were used
        let z = SVector::<f64, 2>::new(0.0, 1000.0);
        ekf.step(&z).unwrap();
        assert!(ekf.get_state(1).unwrap().abs() < 1e-9);
    }

    #[test]
    fn untrusted_non_finite_value_is_allowed() {
        let mut ekf = tracker();
        ekf.set_measurement_variance(1, f64::INFINITY).unwrap();
        let z = SVector::<f64, 2>::new(0.5, f64::NAN);
        assert!(ekf.step(&z).is_ok());
    }

    #[test]
    fn trusted_non_finite_value_is_rejected() {
        let mut ekf = tracker();
        let before = ekf.get_estimate();
        let z = SVector::<f64, 2>::new(0.5, f64::NAN);
        assert_eq!(
            ekf.step(&z),
            Err(FilterError::NonFiniteObservation { index: 1 })
        );
        assert_eq!(ekf.get_estimate(), before);
    }

    #[test]
    fn all_untrusted_only_predicts() {
        let mut ekf = ExtendedKalmanFilter::new(
            ConstantVelocity { dt: 0.5 },
            SVector::<f64, 2>::new(1.0, 4.0),
            SVector::<f64, 2>::from_element(1.0),
        );
        ekf.set_measurement_variance(0, f64::INFINITY).unwrap();
        ekf.set_measurement_variance(1, f64::INFINITY).unwrap();
        let before = ekf.get_certainty();
        ekf.step(&SVector::<f64, 2>::zeros()).unwrap();
        assert_approx_eq!(ekf.get_state(0).unwrap(), 3.0, 1e-12);
        assert_approx_eq!(ekf.get_state(1).unwrap(), 4.0, 1e-12);
        assert!(ekf.get_certainty()[(0, 0)] > before[(0, 0)]);
    }

    #[test]
    fn zero_variance_channel_is_matched_exactly() {
        let mut ekf = tracker();
        ekf.set_measurement_variance(0, 0.0).unwrap();
        ekf.step(&SVector::<f64, 2>::new(3.0, 0.0)).unwrap();
        assert_approx_eq!(ekf.get_state(0).unwrap(), 3.0, 1e-6);
    }

    #[test]
    fn unobservable_channel_is_skipped() {
        let mut ekf = ExtendedKalmanFilter::new(
            HalfBlind,
            SVector::<f64, 1>::zeros(),
            SVector::<f64, 1>::from_element(1.0),
        );
        ekf.set_measurement_variance(0, 0.1).unwrap();
        ekf.set_measurement_variance(1, 0.1).unwrap();
        // the blind channel's value is garbage and must not matter
        ekf.step(&SVector::<f64, 2>::new(1.0, f64::NAN)).unwrap();
        assert!(ekf.get_state(0).unwrap() > 0.5);
    }

    #[test]
    fn singular_innovation_leaves_state_untouched() {
        let mut ekf = ExtendedKalmanFilter::new(
            ConstantVelocity { dt: 1.0 },
            SVector::<f64, 2>::new(1.0, 1.0),
            SVector::<f64, 2>::new(f64::INFINITY, 1.0),
        );
        ekf.set_measurement_variance(0, 0.1).unwrap();
        ekf.set_measurement_variance(1, 0.1).unwrap();
        let before = ekf.get_estimate();
        assert_eq!(
            ekf.step(&SVector::<f64, 2>::new(2.0, 1.0)),
            Err(FilterError::SingularInnovation)
        );
        assert_eq!(ekf.get_estimate(), before);

        ekf.reset_covariance(&SVector::<f64, 2>::from_element(1.0));
        assert!(ekf.step(&SVector::<f64, 2>::new(2.0, 1.0)).is_ok());
    }

    #[test]
    fn variance_validation() {
        let mut ekf = tracker();
        assert_eq!(
            ekf.set_measurement_variance(0, -1.0),
            Err(FilterError::InvalidVariance {
                index: 0,
                variance: -1.0
            })
        );
        assert!(matches!(
            ekf.set_measurement_variance(1, f64::NAN),
            Err(FilterError::InvalidVariance { index: 1, .. })
        ));
        assert_eq!(
            ekf.set_measurement_variance(2, 1.0),
            Err(FilterError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(
            ekf.set_process_noise(5, 1.0),
            Err(FilterError::IndexOutOfRange { index: 5, len: 2 })
        );
        assert!(ekf.get_state(2).is_err());
        assert!(ekf.set_measurement_variance(0, f64::INFINITY).is_ok());
    }

    #[test]
    fn bulk_variance_update_is_all_or_nothing() {
        let mut ekf = tracker();
        assert!(matches!(
            ekf.set_measurement_variances(&SVector::<f64, 2>::new(5.0, -1.0)),
            Err(FilterError::InvalidVariance { index: 1, .. })
        ));
        assert_eq!(ekf.measurement_variances(), &SVector::<f64, 2>::new(0.01, 0.01));

        ekf.set_measurement_variances(&SVector::<f64, 2>::new(5.0, f64::INFINITY))
            .unwrap();
        assert_eq!(ekf.measurement_variances()[0], 5.0);
        assert!(ekf.measurement_variances()[1].is_infinite());
    }
}
