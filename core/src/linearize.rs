//! Navigation state-space model: transition, observation and their Jacobians
//!
//! This module provides the nonlinear model the Extended Kalman Filter linearizes at every
//! sample. All functions are pure functions of the state vector (and the immutable transducer
//! geometry); none of them allocate.
//!
//! # State transition
//!
//! A first-order Euler step of length $\Delta t$, where $\Delta t$ is itself a state:
//!
//! $$
//! \begin{aligned}
//! v(+) &= v(-) + a \Delta t \\\\
//! s_z(+) &= s_z(-) - v_z \Delta t
//! \end{aligned}
//! $$
//!
//! Every other state is a random walk and carries forward unchanged. The Jacobian $F$ is the
//! identity plus $\partial v_i / \partial a_i = \Delta t$ and $\partial s_z / \partial v_z =
//! -\Delta t$. The $\partial(\cdot)/\partial \Delta t$ entries are not actually zero but are left
//! at zero: the time state is pinned by its own direct observation and no error is propagated
//! into it from the other states.
//!
//! # Observation
//!
//! With $d_b = R(q) \hat{d}_b$ the rotated direction of beam $b$ and $\hat{z}$ the sounding axis:
//!
//! $$
//! \begin{aligned}
//! h_{vel,b} &= v \cdot d_b \\\\
//! h_{range,b} &= s_z / (\hat{z} \cdot d_b) \\\\
//! h_{imu,acc} &= a + b_{acc}
//! \end{aligned}
//! $$
//!
//! The range row assumes a flat seabed under each beam. The sample spacing and the quaternion
//! are observed directly. Beam rows are zero against the quaternion states: orientation is fed
//! into the beam geometry as if it were errorless and is never corrected through beam feedback.
//!
//! # Degenerate geometry
//!
//! A beam whose rotated direction has (almost) no component along the sounding axis, or points
//! away from the seabed, can not see it. Its range channel is reported as unobservable rather than dividing by
//! (nearly) zero.

use log::debug;
use nalgebra::Vector3;

use crate::geometry::{Quaternion, dot};
use crate::vehicle::{Beam, SOUNDING_AXIS, TransducerGeometry};
use crate::{
    Linearization, OBS_DIM, ObservationIndex as O, ObservationJacobian, ObservationVector,
    STATE_DIM, StateIndex as S, StateSpaceModel, StateVector, TransitionJacobian,
};

/// Smallest sounding-axis component a rotated beam may have before its range is gated out.
pub const MIN_VERTICAL_COMPONENT: f64 = 1e-6;

/// State transition `f(x)`.
///
/// # Example
/// ```rust
/// use dvlnav::linearize::state_transition;
/// use dvlnav::{NavigationState, StateVector, StateIndex};
/// use nalgebra::Vector3;
///
/// let mut state = NavigationState::default();
/// state.delta_time = 0.5;
/// state.acceleration = Vector3::new(2.0, 0.0, 0.0);
/// let fx = state_transition(&StateVector::from(state));
/// assert_eq!(fx[StateIndex::VelX as usize], 1.0);
/// ```
pub fn state_transition(x: &StateVector) -> StateVector {
    let dt = x[S::DeltaTime as usize];
    let mut fx = *x;
    fx[S::VelX as usize] += x[S::AccX as usize] * dt;
    fx[S::VelY as usize] += x[S::AccY as usize] * dt;
    fx[S::VelZ as usize] += x[S::AccZ as usize] * dt;
    fx[S::SoundingZ as usize] -= x[S::VelZ as usize] * dt;
    fx
}

/// State transition Jacobian `F = ∂f/∂x`.
pub fn state_transition_jacobian(x: &StateVector) -> TransitionJacobian {
    let dt = x[S::DeltaTime as usize];
    let mut f = TransitionJacobian::identity();
    // d(a*b)/da = b
    f[(S::VelX as usize, S::AccX as usize)] = dt;
    f[(S::VelY as usize, S::AccY as usize)] = dt;
    f[(S::VelZ as usize, S::AccZ as usize)] = dt;
    f[(S::SoundingZ as usize, S::VelZ as usize)] = -dt;
    f
}

/// Beam directions rotated into the current pose.
fn rotated_beams(geometry: &TransducerGeometry, rotation: &Quaternion) -> [Vector3<f64>; 4] {
    Beam::ALL.map(|beam| rotation.rotate(geometry.direction(beam)))
}

fn rotation_of(x: &StateVector) -> Quaternion {
    Quaternion::new(
        x[S::RotQi as usize],
        x[S::RotQj as usize],
        x[S::RotQk as usize],
        x[S::RotQr as usize],
    )
}

/// Observation function `h(x)` together with its Jacobian `H = ∂h/∂x`.
///
/// Range channels whose beam is level or points upward are flagged in the
/// returned mask; their `hx` entries and `H` rows are left at zero.
pub fn observation(
    geometry: &TransducerGeometry,
    x: &StateVector,
) -> (ObservationVector, ObservationJacobian, [bool; OBS_DIM]) {
    let mut hx = ObservationVector::zeros();
    let mut h = ObservationJacobian::zeros();
    let mut unobservable = [false; OBS_DIM];

    let velocity = Vector3::new(x[S::VelX as usize], x[S::VelY as usize], x[S::VelZ as usize]);
    let sounding = x[S::SoundingZ as usize];
    let beams = rotated_beams(geometry, &rotation_of(x));

    for (beam, dir) in Beam::ALL.iter().zip(beams.iter()) {
        let vel_row = beam.velocity_index() as usize;
        hx[vel_row] = dot(&velocity, dir);
        h[(vel_row, S::VelX as usize)] = dir[0];
        h[(vel_row, S::VelY as usize)] = dir[1];
        h[(vel_row, S::VelZ as usize)] = dir[2];

        let range_row = beam.range_index() as usize;
        let vertical = dot(&SOUNDING_AXIS, dir);
        if vertical < MIN_VERTICAL_COMPONENT {
            debug!("{beam} beam does not point at the seabed ({vertical:e}); range gated out");
            unobservable[range_row] = true;
            continue;
        }
        hx[range_row] = sounding / vertical;
        h[(range_row, S::SoundingZ as usize)] = 1.0 / vertical;
    }

    let accel_rows = [
        (O::ImuAccX, S::AccX, S::ImuAccOffsetX),
        (O::ImuAccY, S::AccY, S::ImuAccOffsetY),
        (O::ImuAccZ, S::AccZ, S::ImuAccOffsetZ),
    ];
    for (row, acc, offset) in accel_rows {
        hx[row as usize] = x[acc as usize] + x[offset as usize];
        h[(row as usize, acc as usize)] = 1.0;
        h[(row as usize, offset as usize)] = 1.0;
    }

    // directly observed
    let direct = [
        (O::DeltaTime, S::DeltaTime),
        (O::ImuQi, S::RotQi),
        (O::ImuQj, S::RotQj),
        (O::ImuQk, S::RotQk),
        (O::ImuQr, S::RotQr),
    ];
    for (row, col) in direct {
        hx[row as usize] = x[col as usize];
        h[(row as usize, col as usize)] = 1.0;
    }

    (hx, h, unobservable)
}

/// The DVL/IMU navigation model.
///
/// Holds the transducer geometry by value; evaluating the model never mutates it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DvlModel {
    geometry: TransducerGeometry,
}

impl DvlModel {
    pub fn new(geometry: TransducerGeometry) -> Self {
        DvlModel { geometry }
    }

    pub fn geometry(&self) -> &TransducerGeometry {
        &self.geometry
    }
}

impl StateSpaceModel<STATE_DIM, OBS_DIM> for DvlModel {
    fn evaluate(&self, state: &StateVector) -> Linearization<STATE_DIM, OBS_DIM> {
        let (hx, h, unobservable) = observation(&self.geometry, state);
        Linearization {
            fx: state_transition(state),
            f: state_transition_jacobian(state),
            hx,
            h,
            unobservable,
        }
    }
}
