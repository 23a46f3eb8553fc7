//! Panel reference frames and panel/telescope coordinate transformations.
//!
//! One frame is precomputed per ring for a reference panel; every other panel
//! in the ring is that frame rotated about z by the panel's azimuthal offset.

use log::debug;
use nalgebra::{Matrix3, Vector3};
use pas_kinematics::{
    rotation, ActuatorLengths, Axis, PadCoordinates, PanelKind, Solver, StewartPlatform,
    NOMINAL_ACTUATOR_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::{GeometryError, MirrorId, PanelPosition};

/// An orthonormal panel frame in mirror coordinates: basis columns are the
/// panel x, y and surface-normal axes, the origin sits at the actuator base
/// triangle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PanelFrame {
    pub basis: Matrix3<f64>,
    pub origin: Vector3<f64>,
}

/// Precomputed reference frames and ring constants for one mirror.
#[derive(Debug, Clone)]
pub struct MirrorFrames {
    mirror: MirrorId,
    /// Per-ring azimuthal panel width [rad].
    width: [f64; 2],
    /// Per-ring azimuthal offset of the reference panel [rad].
    offset: [f64; 2],
    frames: [PanelFrame; 2],
}

impl MirrorFrames {
    /// Precomputes the per-ring panel frames of a mirror.
    ///
    /// For each ring: the origin starts at the pad centroid on the mirror
    /// surface, the frame z-axis is the surface normal there, x and y are the
    /// mirror axes projected off the normal. The origin is then shifted from
    /// the surface down to the actuator base triangle using one forward
    /// kinematics solve at the nominal actuator length.
    pub fn new(mirror: MirrorId) -> Result<Self, GeometryError> {
        let prescription = mirror.prescription();
        let mut width = [0f64; 2];
        let mut offset = [0f64; 2];
        let mut frames = [PanelFrame {
            basis: Matrix3::identity(),
            origin: Vector3::zeros(),
        }; 2];

        // the flat payload is a good enough stand-in for the surface-to-base
        // shift of every panel kind
        let platform = StewartPlatform::new(PanelKind::Opt);
        let (pose, _) = platform.forward(
            &ActuatorLengths::uniform(NOMINAL_ACTUATOR_LENGTH),
            &Solver::default(),
        )?;
        let centre = Vector3::new(pose.x, pose.y, pose.z);

        for (i, ring) in prescription.rings.iter().enumerate() {
            width[i] = ring.panel_width();
            // note the sign: the reference panel x1x1 sits half a panel back
            // from pi
            offset[i] = PI - width[i] / 2.;

            let mut origin = (ring.pads[0] + ring.pads[1] + ring.pads[2]) / 3.;
            let normal = prescription.normal(&origin);
            let mut basis = Matrix3::zeros();
            basis.set_column(2, &normal);
            for axis in 0..2 {
                let mut v = Vector3::zeros();
                v[axis] = 1.;
                v -= v.dot(&normal) * normal;
                basis.set_column(axis, &v.normalize());
            }

            // the surface centroid expressed in the panel frame is the panel
            // centre; walk it back to put the origin on the base triangle
            origin -= basis * centre;
            frames[i] = PanelFrame { basis, origin };
            debug!(
                "{mirror} ring {}: width = {:.4} rad, origin = [{:.2}, {:.2}, {:.2}]",
                i + 1,
                width[i],
                frames[i].origin.x,
                frames[i].origin.y,
                frames[i].origin.z
            );
        }

        Ok(Self {
            mirror,
            width,
            offset,
            frames,
        })
    }

    pub fn mirror(&self) -> MirrorId {
        self.mirror
    }

    /// Azimuthal offset of a panel from the reference panel of its ring.
    ///
    /// Panel numbering increases against the +z rotation, hence the minus
    /// sign.
    pub fn azimuthal_offset(&self, pos: PanelPosition) -> f64 {
        let ring = pos.ring() as usize - 1;
        let quad_panels = (pos.ring_panels() / 4) as f64;
        self.offset[ring]
            - (quad_panels * (pos.quadrant() as f64 - 1.) + pos.panel() as f64 - 1.)
                * self.width[ring]
    }

    fn panel_frame(&self, pos: PanelPosition) -> PanelFrame {
        let ring = pos.ring() as usize - 1;
        let z_rot = rotation(Axis::Z, self.azimuthal_offset(pos));
        PanelFrame {
            basis: z_rot * self.frames[ring].basis,
            origin: z_rot * self.frames[ring].origin,
        }
    }

    /// Mirror-frame coordinates to the frame of the given panel.
    pub fn to_panel_frame(&self, pos: PanelPosition, v: &Vector3<f64>) -> Vector3<f64> {
        let frame = self.panel_frame(pos);
        frame.basis.transpose() * (v - frame.origin)
    }

    /// Inverse of [`Self::to_panel_frame`].
    pub fn to_mirror_frame(&self, pos: PanelPosition, v: &Vector3<f64>) -> Vector3<f64> {
        let frame = self.panel_frame(pos);
        frame.basis * v + frame.origin
    }

    /// Ideal pad coordinates of the given panel in the mirror frame.
    pub fn ideal_pads(&self, pos: PanelPosition) -> PadCoordinates {
        let ring = &self.mirror.prescription().rings[pos.ring() as usize - 1];
        let z_rot = rotation(Axis::Z, self.azimuthal_offset(pos));
        PadCoordinates([
            z_rot * ring.pads[0],
            z_rot * ring.pads[1],
            z_rot * ring.pads[2],
        ])
    }

    /// Panel kind of the given panel's ring.
    pub fn panel_kind(&self, pos: PanelPosition) -> PanelKind {
        self.mirror.prescription().rings[pos.ring() as usize - 1].kind
    }
}

/// Applies a rigid mirror-frame perturbation to a point: rotate about z, x,
/// then y, then translate. `coords` is `[x, y, z, rx, ry, rz]` (mm, rad) and
/// is zero-extended when shorter.
pub fn apply_pose_delta(v: &Vector3<f64>, coords: &[f64]) -> Vector3<f64> {
    let mut tr = [0f64; 6];
    tr[..coords.len().min(6)].copy_from_slice(&coords[..coords.len().min(6)]);
    let rotated = rotation(Axis::Y, tr[4]) * rotation(Axis::X, tr[3]) * rotation(Axis::Z, tr[5]) * v;
    rotated + Vector3::new(tr[0], tr[1], tr[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(raw: u32) -> PanelPosition {
        PanelPosition::from_raw(raw).unwrap()
    }

    #[test]
    fn frame_transform_round_trip() {
        let frames = MirrorFrames::new(MirrorId::Primary).unwrap();
        let v = Vector3::new(3000., -200., 150.);
        for raw in [1111, 1123, 1214, 1428] {
            let there = frames.to_panel_frame(pos(raw), &v);
            let back = frames.to_mirror_frame(pos(raw), &there);
            assert!((back - v).norm() < 1e-9, "panel {raw}: {back} != {v}");
        }
    }

    #[test]
    fn azimuthal_offset_steps_by_one_panel_width() {
        let frames = MirrorFrames::new(MirrorId::Secondary).unwrap();
        let width = 2. * PI / 16.;
        let a = frames.azimuthal_offset(pos(2121));
        let b = frames.azimuthal_offset(pos(2122));
        assert!((a - b - width).abs() < 1e-12);
        // quadrant boundary is seamless
        let c = frames.azimuthal_offset(pos(2128));
        let d = frames.azimuthal_offset(pos(2221));
        assert!((c - d - width).abs() < 1e-12);
    }

    #[test]
    fn full_ring_of_offsets_is_periodic() {
        let frames = MirrorFrames::new(MirrorId::Primary).unwrap();
        let first = frames.azimuthal_offset(pos(1111));
        let mut p = pos(1111);
        for _ in 0..16 {
            p = p.neighbor(crate::Direction::Negative);
        }
        assert_eq!(p, pos(1111));
        let again = frames.azimuthal_offset(p);
        assert!((first - again).abs() < 1e-12);
    }

    #[test]
    fn panel_origin_sits_behind_the_surface() {
        let frames = MirrorFrames::new(MirrorId::Primary).unwrap();
        let ring = &MirrorId::Primary.prescription().rings[0];
        let centroid = (ring.pads[0] + ring.pads[1] + ring.pads[2]) / 3.;
        // the base triangle is below the mirror surface for the primary
        let origin_panel = frames.to_panel_frame(pos(1111), &{
            let z_rot = rotation(Axis::Z, frames.azimuthal_offset(pos(1111)));
            z_rot * centroid
        });
        assert!(origin_panel.z > 500., "panel centre z = {}", origin_panel.z);
    }

    #[test]
    fn ideal_pads_line_up_with_the_panel_frame() {
        let frames = MirrorFrames::new(MirrorId::Secondary).unwrap();
        for raw in [2111, 2122, 2213] {
            let pads = frames.ideal_pads(pos(raw));
            // pads of a panel live near its own frame origin
            let local = frames.to_panel_frame(pos(raw), &pads.centroid());
            assert!(local.x.abs() < 1e-6, "panel {raw}: x = {}", local.x);
            assert!(local.y.abs() < 1e-6, "panel {raw}: y = {}", local.y);
        }
    }

    #[test]
    fn pose_delta_pure_translation() {
        let v = Vector3::new(1., 2., 3.);
        let moved = apply_pose_delta(&v, &[10., -5., 0.5]);
        assert!((moved - Vector3::new(11., -3., 3.5)).norm() < 1e-12);
    }

    #[test]
    fn pose_delta_rotation_order() {
        let v = Vector3::x();
        // a quarter turn about z then a quarter turn about x sends x to z
        let moved = apply_pose_delta(&v, &[0., 0., 0., PI / 2., 0., PI / 2.]);
        assert!((moved - Vector3::z()).norm() < 1e-12);
    }
}
