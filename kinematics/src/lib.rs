//! # Stewart platform kinematics
//!
//! Forward and inverse kinematics for the 6-actuator parallel platforms that
//! carry the mirror panels.
//!
//! The forward path recovers the panel pose and the mirror-pad coordinates
//! from six measured actuator lengths by Newton-Raphson on the squared
//! axis-to-axis distances. The inverse paths are analytic and run either from
//! a panel pose or directly from known pad coordinates.
//!
//! All lengths are in mm. Pose rotations are length-scaled angles, i.e. the
//! rotation angle multiplied by the payload radius, so that every pose
//! component carries the same unit.
//!
//! ```
//! use pas_kinematics::{ActuatorLengths, PanelKind, Solver, StewartPlatform};
//!
//! let platform = StewartPlatform::new(PanelKind::Opt);
//! let lengths = ActuatorLengths::uniform(427.919);
//! let (pose, _pads) = platform.forward(&lengths, &Solver::default())?;
//! let (back, _) = platform.lengths_from_pose(&pose);
//! # Ok::<(), pas_kinematics::KinematicsError>(())
//! ```

mod error;
mod kind;
mod platform;

pub use error::KinematicsError;
pub use kind::PanelKind;
pub use platform::{Solver, StewartPlatform};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base triangle radius [mm].
pub const BASE_RADIUS: f64 = 320.;
/// Payload triangle radius [mm]; also the angle scale of [`Pose`] rotations.
pub const PAYLOAD_RADIUS: f64 = 320.;
/// Actuator length with the platform in its reference position [mm].
pub const NOMINAL_ACTUATOR_LENGTH: f64 = 427.919;
/// Bracket height [mm]; one at each end of an actuator makes up the
/// axis-to-axis distance.
pub const BRACKET_THICKNESS: f64 = 25.4 * 1.875;
/// Actuator axis to pad [mm].
pub const JOINT_THICKNESS: f64 = 73.254;
/// Pad thickness [mm].
pub const PAD_THICKNESS: f64 = 6.2;
/// Panel facet thickness [mm].
pub const PANEL_THICKNESS: f64 = 33.4;
/// Distance between the primary and secondary mirror vertices [mm].
pub const MIRROR_DISTANCE: f64 = 8701.56;

/// Pad plane to actuator axis plane offset along the pad normals [mm].
pub(crate) const STANDOFF: f64 = JOINT_THICKNESS + PAD_THICKNESS + PANEL_THICKNESS;

/// Panel pose: translation and length-scaled rotation of the pad triangle
/// with respect to the platform base.
///
/// Rotations compose in the X->Z->Y order (X applied first), each angle being
/// the stored value divided by [`PAYLOAD_RADIUS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rot_x: f64,
    pub rot_y: f64,
    pub rot_z: f64,
}

impl Pose {
    pub fn from_array(a: [f64; 6]) -> Self {
        Self {
            x: a[0],
            y: a[1],
            z: a[2],
            rot_x: a[3],
            rot_y: a[4],
            rot_z: a[5],
        }
    }
    pub fn to_array(self) -> [f64; 6] {
        [self.x, self.y, self.z, self.rot_x, self.rot_y, self.rot_z]
    }
    /// Largest absolute component.
    pub fn amax(&self) -> f64 {
        self.to_array().iter().fold(0., |m, x| m.max(x.abs()))
    }
}

impl std::ops::Sub for Pose {
    type Output = Pose;
    fn sub(self, rhs: Pose) -> Pose {
        let a = self.to_array();
        let b = rhs.to_array();
        Pose::from_array([
            a[0] - b[0],
            a[1] - b[1],
            a[2] - b[2],
            a[3] - b[3],
            a[4] - b[4],
            a[5] - b[5],
        ])
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.4}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}]",
            self.x, self.y, self.z, self.rot_x, self.rot_y, self.rot_z
        )
    }
}

/// The six actuator lengths of one platform [mm].
///
/// Actuators are counted clockwise looking from the base towards the panel,
/// starting at the top right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorLengths(pub [f64; 6]);

impl ActuatorLengths {
    pub fn uniform(length: f64) -> Self {
        Self([length; 6])
    }
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.0.iter()
    }
    /// Largest absolute component.
    pub fn amax(&self) -> f64 {
        self.0.iter().fold(0., |m, x| m.max(x.abs()))
    }
}

impl From<[f64; 6]> for ActuatorLengths {
    fn from(value: [f64; 6]) -> Self {
        Self(value)
    }
}

impl std::ops::Index<usize> for ActuatorLengths {
    type Output = f64;
    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

impl std::ops::Add for ActuatorLengths {
    type Output = ActuatorLengths;
    fn add(self, rhs: ActuatorLengths) -> ActuatorLengths {
        let mut out = self.0;
        out.iter_mut().zip(&rhs.0).for_each(|(a, b)| *a += b);
        ActuatorLengths(out)
    }
}

impl fmt::Display for ActuatorLengths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.4}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}]",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Coordinates of the three mirror pads.
///
/// Pads are counted counter-clockwise looking from the base towards the
/// panel, the bottom pad first. This is the opposite winding from the
/// actuators; the platform remaps internally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PadCoordinates(pub [Vector3<f64>; 3]);

impl PadCoordinates {
    pub fn pad(&self, i: usize) -> Vector3<f64> {
        self.0[i]
    }
    pub fn centroid(&self) -> Vector3<f64> {
        (self.0[0] + self.0[1] + self.0[2]) / 3.
    }
}

/// Coordinate axes, for building elementary rotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Elementary rotation matrix about `axis` by `angle` [rad].
pub fn rotation(axis: Axis, angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    match axis {
        Axis::X => Matrix3::new(1., 0., 0., 0., c, -s, 0., s, c),
        Axis::Y => Matrix3::new(c, 0., s, 0., 1., 0., -s, 0., c),
        Axis::Z => Matrix3::new(c, -s, 0., s, c, 0., 0., 0., 1.),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_orthonormal() {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let r = rotation(axis, 0.3);
            let should_be_eye = r * r.transpose();
            assert!((should_be_eye - Matrix3::identity()).norm() < 1e-14);
            assert!((r.determinant() - 1.).abs() < 1e-14);
        }
    }

    #[test]
    fn rotation_z_quarter_turn() {
        let r = rotation(Axis::Z, std::f64::consts::FRAC_PI_2);
        let v = r * Vector3::new(1., 0., 0.);
        assert!((v - Vector3::new(0., 1., 0.)).norm() < 1e-14);
    }

    #[test]
    fn pose_roundtrips_through_array() {
        let pose = Pose::from_array([1., 2., 3., 4., 5., 6.]);
        assert_eq!(pose.to_array(), [1., 2., 3., 4., 5., 6.]);
        assert_eq!((pose - pose).amax(), 0.);
    }
}
