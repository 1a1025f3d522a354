//! DVL/IMU navigation filter for underwater vehicles
//!
//! This crate estimates the velocity, acceleration, height above the seabed, and orientation of
//! an underwater vehicle by fusing a four-beam Doppler Velocity Log (DVL) with an inertial
//! measurement unit (IMU) in an Extended Kalman Filter (EKF). The crate is organised around a
//! navigation state-space model (the state and observation definitions, the transition and
//! observation functions, and their Jacobians) and a per-sample sensor trust policy that maps
//! sensor health flags to measurement variances. A model-agnostic EKF engine consumes both.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): fixed-size vectors and matrices for the model and the filter.
//! - [`csv`](https://crates.io/crates/csv) and [`serde`](https://crates.io/crates/serde): sensor log ingestion and result output.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): synthetic sensor logs for testing.
//!
//! ## Crate overview
//!
//! - [geometry]: dot product and quaternion rotation helpers.
//! - [vehicle]: the fixed body-frame beam directions of the DVL head.
//! - [linearize]: the navigation model, i.e. `f`, `F`, `h` and `H`.
//! - [measurements]: sensor samples and the sensor trust policy.
//! - [kalman]: the generic fixed-size Extended Kalman Filter engine.
//! - [linalg]: robust symmetric positive-definite solves used by the engine.
//! - [filter]: the assembled DVL filter.
//! - [config]: serializable filter configuration.
//! - [sim]: CSV log ingestion, result output, and synthetic scenario generation.
//!
//! ## State and observation definitions
//!
//! The filter state is the 15-element vector
//!
//! $$
//! x = [\Delta t, v_x, v_y, v_z, a_x, a_y, a_z, b_x, b_y, b_z, s_z, q_i, q_j, q_k, q_r]
//! $$
//!
//! where $v$ and $a$ are body-frame velocity and acceleration, $b$ is the additive accelerometer
//! offset, $s_z$ is the sounding (vertical distance to the seabed), and $q$ is the body rotation.
//! $\Delta t$ is carried as a state so the transition can use the sample spacing reported by the
//! logger rather than a fixed constant.
//!
//! The observation is the 16-element vector of four along-beam velocities, four slant ranges,
//! three IMU accelerations, four IMU quaternion components, and the sample spacing. Each
//! observation channel carries its own variance for every sample; an infinite variance removes the
//! channel from that update entirely.
//!
//! ## Approximations
//!
//! - The seabed is locally flat under each beam; slant range is `sounding / cos(beam tilt)`.
//! - Orientation is treated as an errorless input to the beam geometry: the beam rows of `H` are
//!   zero against the quaternion states.
//! - No error is propagated into the time state: every `∂f/∂Δt` entry of `F` is zero.
//! - The sounding propagates as `s_z -= v_z Δt`. This sign convention has not been checked
//!   against a recorded fixture.
pub mod config;
pub mod filter;
pub mod geometry;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod measurements;
pub mod sim;
pub mod vehicle;

use std::fmt::{self, Debug, Display};

use nalgebra::{SMatrix, SVector, Vector3};

use crate::geometry::Quaternion;

pub use crate::filter::DvlFilter;
pub use crate::kalman::{ExtendedKalmanFilter, FilterError};
pub use crate::linearize::DvlModel;

/// Number of filter states.
pub const STATE_DIM: usize = 15;
/// Number of observation channels.
pub const OBS_DIM: usize = 16;

pub type StateVector = SVector<f64, STATE_DIM>;
pub type ObservationVector = SVector<f64, OBS_DIM>;
pub type TransitionJacobian = SMatrix<f64, STATE_DIM, STATE_DIM>;
pub type ObservationJacobian = SMatrix<f64, OBS_DIM, STATE_DIM>;

/// Position of each quantity in the state vector.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateIndex {
    DeltaTime,
    VelX,
    VelY,
    VelZ,
    AccX,
    AccY,
    AccZ,
    ImuAccOffsetX,
    ImuAccOffsetY,
    ImuAccOffsetZ,
    SoundingZ,
    RotQi,
    RotQj,
    RotQk,
    RotQr,
}

impl StateIndex {
    pub const ALL: [StateIndex; STATE_DIM] = [
        StateIndex::DeltaTime,
        StateIndex::VelX,
        StateIndex::VelY,
        StateIndex::VelZ,
        StateIndex::AccX,
        StateIndex::AccY,
        StateIndex::AccZ,
        StateIndex::ImuAccOffsetX,
        StateIndex::ImuAccOffsetY,
        StateIndex::ImuAccOffsetZ,
        StateIndex::SoundingZ,
        StateIndex::RotQi,
        StateIndex::RotQj,
        StateIndex::RotQk,
        StateIndex::RotQr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StateIndex::DeltaTime => "delta_time",
            StateIndex::VelX => "vel_x",
            StateIndex::VelY => "vel_y",
            StateIndex::VelZ => "vel_z",
            StateIndex::AccX => "acc_x",
            StateIndex::AccY => "acc_y",
            StateIndex::AccZ => "acc_z",
            StateIndex::ImuAccOffsetX => "imu_acc_offset_x",
            StateIndex::ImuAccOffsetY => "imu_acc_offset_y",
            StateIndex::ImuAccOffsetZ => "imu_acc_offset_z",
            StateIndex::SoundingZ => "sounding_z",
            StateIndex::RotQi => "rot_qi",
            StateIndex::RotQj => "rot_qj",
            StateIndex::RotQk => "rot_qk",
            StateIndex::RotQr => "rot_qr",
        }
    }
}

/// Position of each channel in the observation vector.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObservationIndex {
    VelBow,
    VelStarboard,
    VelPort,
    VelStern,
    RangeBow,
    RangeStarboard,
    RangePort,
    RangeStern,
    ImuAccX,
    ImuAccY,
    ImuAccZ,
    ImuQi,
    ImuQj,
    ImuQk,
    ImuQr,
    DeltaTime,
}

impl ObservationIndex {
    pub const ALL: [ObservationIndex; OBS_DIM] = [
        ObservationIndex::VelBow,
        ObservationIndex::VelStarboard,
        ObservationIndex::VelPort,
        ObservationIndex::VelStern,
        ObservationIndex::RangeBow,
        ObservationIndex::RangeStarboard,
        ObservationIndex::RangePort,
        ObservationIndex::RangeStern,
        ObservationIndex::ImuAccX,
        ObservationIndex::ImuAccY,
        ObservationIndex::ImuAccZ,
        ObservationIndex::ImuQi,
        ObservationIndex::ImuQj,
        ObservationIndex::ImuQk,
        ObservationIndex::ImuQr,
        ObservationIndex::DeltaTime,
    ];

    /// The seven channels derived from the IMU.
    pub const IMU: [ObservationIndex; 7] = [
        ObservationIndex::ImuQi,
        ObservationIndex::ImuQj,
        ObservationIndex::ImuQk,
        ObservationIndex::ImuQr,
        ObservationIndex::ImuAccX,
        ObservationIndex::ImuAccY,
        ObservationIndex::ImuAccZ,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObservationIndex::VelBow => "vel_bow",
            ObservationIndex::VelStarboard => "vel_starboard",
            ObservationIndex::VelPort => "vel_port",
            ObservationIndex::VelStern => "vel_stern",
            ObservationIndex::RangeBow => "range_bow",
            ObservationIndex::RangeStarboard => "range_starboard",
            ObservationIndex::RangePort => "range_port",
            ObservationIndex::RangeStern => "range_stern",
            ObservationIndex::ImuAccX => "imu_acc_x",
            ObservationIndex::ImuAccY => "imu_acc_y",
            ObservationIndex::ImuAccZ => "imu_acc_z",
            ObservationIndex::ImuQi => "imu_qi",
            ObservationIndex::ImuQj => "imu_qj",
            ObservationIndex::ImuQk => "imu_qk",
            ObservationIndex::ImuQr => "imu_qr",
            ObservationIndex::DeltaTime => "delta_time",
        }
    }
}

/// Output of a state-space model evaluated at one state estimate.
///
/// `fx` and `f` describe the transition, `hx` and `h` the observation. A channel flagged in
/// `unobservable` has no meaningful prediction at this state (its `hx` entry and `h` row are
/// zero) and must be left out of the update.
#[derive(Clone, Debug, PartialEq)]
pub struct Linearization<const N: usize, const M: usize> {
    pub fx: SVector<f64, N>,
    pub f: SMatrix<f64, N, N>,
    pub hx: SVector<f64, M>,
    pub h: SMatrix<f64, M, N>,
    pub unobservable: [bool; M],
}

impl<const N: usize, const M: usize> Linearization<N, M> {
    /// Identity transition and an all-zero observation, everything observable.
    pub fn identity(state: &SVector<f64, N>) -> Self {
        Linearization {
            fx: *state,
            f: SMatrix::<f64, N, N>::identity(),
            hx: SVector::<f64, M>::zeros(),
            h: SMatrix::<f64, M, N>::zeros(),
            unobservable: [false; M],
        }
    }
}

/// A nonlinear state-space model with `N` states and `M` observation channels.
///
/// Implementations must be pure: the same state always yields the same linearization. The
/// filter engine holds the model by value and calls [`StateSpaceModel::evaluate`] once around
/// the prior estimate (for the transition) and once around the predicted estimate (for the
/// observation).
pub trait StateSpaceModel<const N: usize, const M: usize> {
    fn evaluate(&self, state: &SVector<f64, N>) -> Linearization<N, M>;
}

/// Named view of the filter state vector.
#[derive(Clone, Copy, PartialEq)]
pub struct NavigationState {
    /// Sample spacing in seconds
    pub delta_time: f64,
    /// Body-frame velocity (m/s)
    pub velocity: Vector3<f64>,
    /// Body-frame acceleration (m/s^2)
    pub acceleration: Vector3<f64>,
    /// Additive accelerometer offset (m/s^2)
    pub imu_acc_offset: Vector3<f64>,
    /// Vertical distance from the vehicle to the seabed (m)
    pub sounding_z: f64,
    /// Body rotation
    pub rotation: Quaternion,
}

impl Default for NavigationState {
    fn default() -> Self {
        NavigationState {
            delta_time: 0.0,
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            imu_acc_offset: Vector3::zeros(),
            sounding_z: 0.0,
            rotation: Quaternion::identity(),
        }
    }
}

impl Debug for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavigationState")
            .field("delta_time", &self.delta_time)
            .field("velocity", &[self.velocity[0], self.velocity[1], self.velocity[2]])
            .field(
                "acceleration",
                &[self.acceleration[0], self.acceleration[1], self.acceleration[2]],
            )
            .field(
                "imu_acc_offset",
                &[
                    self.imu_acc_offset[0],
                    self.imu_acc_offset[1],
                    self.imu_acc_offset[2],
                ],
            )
            .field("sounding_z", &self.sounding_z)
            .field("rotation", &self.rotation)
            .finish()
    }
}

impl Display for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NavigationState(vel: [{:.4}, {:.4}, {:.4}] m/s, acc: [{:.4}, {:.4}, {:.4}] m/s^2, sounding: {:.3} m, dt: {:.3} s)",
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.acceleration[0],
            self.acceleration[1],
            self.acceleration[2],
            self.sounding_z,
            self.delta_time
        )
    }
}

impl From<&StateVector> for NavigationState {
    fn from(x: &StateVector) -> Self {
        use StateIndex::*;
        NavigationState {
            delta_time: x[DeltaTime as usize],
            velocity: Vector3::new(x[VelX as usize], x[VelY as usize], x[VelZ as usize]),
            acceleration: Vector3::new(x[AccX as usize], x[AccY as usize], x[AccZ as usize]),
            imu_acc_offset: Vector3::new(
                x[ImuAccOffsetX as usize],
                x[ImuAccOffsetY as usize],
                x[ImuAccOffsetZ as usize],
            ),
            sounding_z: x[SoundingZ as usize],
            rotation: Quaternion::new(
                x[RotQi as usize],
                x[RotQj as usize],
                x[RotQk as usize],
                x[RotQr as usize],
            ),
        }
    }
}

impl From<StateVector> for NavigationState {
    fn from(x: StateVector) -> Self {
        NavigationState::from(&x)
    }
}

impl From<&NavigationState> for StateVector {
    fn from(state: &NavigationState) -> Self {
        use StateIndex::*;
        let mut x = StateVector::zeros();
        x[DeltaTime as usize] = state.delta_time;
        x[VelX as usize] = state.velocity[0];
        x[VelY as usize] = state.velocity[1];
        x[VelZ as usize] = state.velocity[2];
        x[AccX as usize] = state.acceleration[0];
        x[AccY as usize] = state.acceleration[1];
        x[AccZ as usize] = state.acceleration[2];
        x[ImuAccOffsetX as usize] = state.imu_acc_offset[0];
        x[ImuAccOffsetY as usize] = state.imu_acc_offset[1];
        x[ImuAccOffsetZ as usize] = state.imu_acc_offset[2];
        x[SoundingZ as usize] = state.sounding_z;
        x[RotQi as usize] = state.rotation.qi;
        x[RotQj as usize] = state.rotation.qj;
        x[RotQk as usize] = state.rotation.qk;
        x[RotQr as usize] = state.rotation.qr;
        x
    }
}

impl From<NavigationState> for StateVector {
    fn from(state: NavigationState) -> Self {
        StateVector::from(&state)
    }
}
