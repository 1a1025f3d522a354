//! Rotation and vector helpers
//!
//! Small, allocation-free helpers used by the navigation model to place the sonar beams in the
//! current vehicle pose. Vectors are plain [`nalgebra::Vector3`]; rotations are stored as a
//! four-component [`Quaternion`] in the `(i, j, k, r)` order the filter state uses.
//!
//! The rotation is applied through the rotation-matrix form of the quaternion sandwich product
//! $v' = q v q^{*}$:
//!
//! $$
//! R(q) = \begin{bmatrix}
//! 1 - 2s(q_j^2 + q_k^2) & 2s(q_i q_j - q_k q_r) & 2s(q_i q_k + q_j q_r) \\\\
//! 2s(q_i q_j + q_k q_r) & 1 - 2s(q_i^2 + q_k^2) & 2s(q_j q_k - q_i q_r) \\\\
//! 2s(q_i q_k - q_j q_r) & 2s(q_j q_k + q_i q_r) & 1 - 2s(q_i^2 + q_j^2)
//! \end{bmatrix}, \qquad s = \lVert q \rVert^{-2}
//! $$
//!
//! so a quaternion that has drifted away from unit length inside the filter still yields a
//! proper rotation.

use std::fmt::{self, Display};

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Dot product of two 3-vectors.
#[inline]
pub fn dot(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.dot(b)
}

/// Rotation quaternion with vector part `(qi, qj, qk)` and scalar part `qr`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub qi: f64,
    pub qj: f64,
    pub qk: f64,
    pub qr: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::identity()
    }
}

impl Display for Quaternion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Quaternion(i: {:.6}, j: {:.6}, k: {:.6}, r: {:.6})",
            self.qi, self.qj, self.qk, self.qr
        )
    }
}

impl Quaternion {
    pub fn new(qi: f64, qj: f64, qk: f64, qr: f64) -> Self {
        Quaternion { qi, qj, qk, qr }
    }

    /// The zero rotation.
    pub fn identity() -> Self {
        Quaternion::new(0.0, 0.0, 0.0, 1.0)
    }

    /// Builds a rotation from yaw, pitch and roll (radians, ZYX convention).
    ///
    /// Uses the half-angle product formula. Angles are unconstrained; wrapping falls out of the
    /// trigonometric functions.
    ///
    /// # Example
    /// ```rust
    /// use dvlnav::geometry::Quaternion;
    /// let q = Quaternion::from_ypr(0.0, 0.0, 0.0);
    /// assert_eq!(q, Quaternion::identity());
    /// ```
    pub fn from_ypr(yaw: f64, pitch: f64, roll: f64) -> Self {
        let (sy, cy) = (yaw * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        let (sr, cr) = (roll * 0.5).sin_cos();
        Quaternion {
            qi: cy * cp * sr - sy * sp * cr,
            qj: sy * cp * sr + cy * sp * cr,
            qk: sy * cp * cr - cy * sp * sr,
            qr: cy * cp * cr + sy * sp * sr,
        }
    }

    pub fn norm_squared(&self) -> f64 {
        self.qi * self.qi + self.qj * self.qj + self.qk * self.qk + self.qr * self.qr
    }

    pub fn norm(&self) -> f64 {
        self.norm_squared().sqrt()
    }

    /// Negates the vector part.
    pub fn conjugate(&self) -> Self {
        Quaternion::new(-self.qi, -self.qj, -self.qk, self.qr)
    }

    /// Rotates `v` by this quaternion.
    ///
    /// The quaternion does not need to be unit length; it is normalized implicitly through the
    /// `1/|q|^2` scale. A zero quaternion leaves `v` unchanged.
    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let norm_squared = self.norm_squared();
        let s = if norm_squared > 0.0 {
            1.0 / norm_squared
        } else {
            0.0
        };
        let Quaternion { qi, qj, qk, qr } = *self;
        let (x, y, z) = (v[0], v[1], v[2]);
        Vector3::new(
            (1.0 - 2.0 * s * (qj * qj + qk * qk)) * x
                + 2.0 * s * (qi * qj - qk * qr) * y
                + 2.0 * s * (qi * qk + qj * qr) * z,
            2.0 * s * (qi * qj + qk * qr) * x
                + (1.0 - 2.0 * s * (qi * qi + qk * qk)) * y
                + 2.0 * s * (qj * qk - qi * qr) * z,
            2.0 * s * (qi * qk - qj * qr) * x
                + 2.0 * s * (qj * qk + qi * qr) * y
                + (1.0 - 2.0 * s * (qi * qi + qj * qj)) * z,
        )
    }
}

impl From<Quaternion> for UnitQuaternion<f64> {
    fn from(q: Quaternion) -> Self {
        UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(q.qr, q.qi, q.qj, q.qk))
    }
}

impl From<UnitQuaternion<f64>> for Quaternion {
    fn from(q: UnitQuaternion<f64>) -> Self {
        Quaternion::new(q.i, q.j, q.k, q.w)
    }
}
