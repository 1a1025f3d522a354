//! Transducer mounting geometry
//!
//! The DVL head carries four transducers (bow, starboard, port, stern) whose beams point
//! outward and down at a fixed depression angle below the vehicle's horizontal plane. With the
//! vehicle at zero rotation the body-frame beam directions are
//!
//! ```text
//! bow       ( cos θ,      0, sin θ)
//! starboard (     0,  cos θ, sin θ)
//! port      (     0, -cos θ, sin θ)
//! stern     (-cos θ,      0, sin θ)
//! ```
//!
//! where the body `z` axis is the sounding axis (pointing at the seabed). The directions are
//! immutable once built and are handed to the navigation model by value, so independent filter
//! instances never share geometry.

use std::fmt::{self, Display};

use nalgebra::Vector3;

use crate::ObservationIndex;

/// Depression angle of every beam below the horizontal plane, in degrees.
pub const DEFAULT_MOUNTING_ANGLE_DEG: f64 = 65.0;

/// Sounding axis in the body frame.
pub const SOUNDING_AXIS: Vector3<f64> = Vector3::new(0.0, 0.0, 1.0);

/// One of the four DVL transducers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Beam {
    Bow,
    Starboard,
    Port,
    Stern,
}

impl Beam {
    pub const ALL: [Beam; 4] = [Beam::Bow, Beam::Starboard, Beam::Port, Beam::Stern];

    /// Observation slot holding this beam's along-beam velocity.
    pub fn velocity_index(self) -> ObservationIndex {
        match self {
            Beam::Bow => ObservationIndex::VelBow,
            Beam::Starboard => ObservationIndex::VelStarboard,
            Beam::Port => ObservationIndex::VelPort,
            Beam::Stern => ObservationIndex::VelStern,
        }
    }

    /// Observation slot holding this beam's slant range.
    pub fn range_index(self) -> ObservationIndex {
        match self {
            Beam::Bow => ObservationIndex::RangeBow,
            Beam::Starboard => ObservationIndex::RangeStarboard,
            Beam::Port => ObservationIndex::RangePort,
            Beam::Stern => ObservationIndex::RangeStern,
        }
    }
}

impl Display for Beam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Beam::Bow => "bow",
            Beam::Starboard => "starboard",
            Beam::Port => "port",
            Beam::Stern => "stern",
        };
        f.write_str(name)
    }
}

/// Body-frame unit directions of the four beams at zero rotation.
#[derive(Clone, Debug, PartialEq)]
pub struct TransducerGeometry {
    pub bow: Vector3<f64>,
    pub starboard: Vector3<f64>,
    pub port: Vector3<f64>,
    pub stern: Vector3<f64>,
}

impl Default for TransducerGeometry {
    fn default() -> Self {
        TransducerGeometry::from_mounting_angle(DEFAULT_MOUNTING_ANGLE_DEG)
    }
}

impl TransducerGeometry {
    /// Builds the beam directions for a head whose beams are depressed `angle_deg` degrees
    /// below the horizontal plane.
    pub fn from_mounting_angle(angle_deg: f64) -> Self {
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        TransducerGeometry {
            bow: Vector3::new(cos, 0.0, sin),
            starboard: Vector3::new(0.0, cos, sin),
            port: Vector3::new(0.0, -cos, sin),
            stern: Vector3::new(-cos, 0.0, sin),
        }
    }

    pub fn direction(&self, beam: Beam) -> &Vector3<f64> {
        match beam {
            Beam::Bow => &self.bow,
            Beam::Starboard => &self.starboard,
            Beam::Port => &self.port,
            Beam::Stern => &self.stern,
        }
    }
}
