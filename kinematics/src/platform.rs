use log::trace;
use nalgebra::{Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::{
    rotation, ActuatorLengths, Axis, KinematicsError, PadCoordinates, PanelKind, Pose,
    BASE_RADIUS, BRACKET_THICKNESS, JOINT_THICKNESS, PAYLOAD_RADIUS, STANDOFF,
};

// Pads are counted counter-clockwise, actuators clockwise; this involution
// maps one winding onto the other.
const PAD_MAP: [usize; 3] = [1, 0, 2];

/// Newton-Raphson settings for [`StewartPlatform::forward`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Solver {
    /// Convergence threshold on the L1 norm of the residual and of the step.
    pub tol: f64,
    /// Hard iteration cap; exceeding it is a numerical failure.
    pub max_iter: usize,
}

impl Default for Solver {
    fn default() -> Self {
        Self {
            tol: 1e-12,
            max_iter: 200,
        }
    }
}

/// An orthonormal frame built from three non-collinear points: x from the
/// second point to their barycenter, z normal to their plane, y = z ^ x.
#[derive(Debug, Clone, Copy)]
struct Frame {
    x: Vector3<f64>,
    y: Vector3<f64>,
    z: Vector3<f64>,
}

impl Frame {
    fn from_points(p: &[Vector3<f64>; 3]) -> Self {
        let origin = (p[0] + p[1] + p[2]) / 3.;
        let x = (origin - p[1]).normalize();
        let z = (p[2] - p[1]).cross(&(p[0] - p[1])).normalize();
        let y = z.cross(&x);
        Self { x, y, z }
    }
    fn to_local(&self, v: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(self.x.dot(v), self.y.dot(v), self.z.dot(v))
    }
    fn to_global(&self, v: &Vector3<f64>) -> Vector3<f64> {
        v.x * self.x + v.y * self.y + v.z * self.z
    }
}

/// A 6-actuator parallel platform carrying one panel of a given kind.
///
/// The attachment coordinates of the actuators on the base and on the payload
/// are fixed by the base and payload radii; everything else is computed.
#[derive(Debug, Clone)]
pub struct StewartPlatform {
    kind: PanelKind,
    /// Actuator attachment points on the base, base frame, z = 0.
    base: [Vector3<f64>; 6],
    /// Actuator attachment points on the payload, payload frame, z = 0.
    payload: [Vector3<f64>; 6],
}

impl StewartPlatform {
    pub fn new(kind: PanelKind) -> Self {
        let mut base = [Vector3::zeros(); 6];
        let mut payload = [Vector3::zeros(); 6];
        // base pairs straddle the triangle corners, payload pairs sit on the
        // edge midlines, giving the usual alternating hexagon
        for i in 0..3 {
            let b = Vector3::new(
                BASE_RADIUS * (2. * i as f64 * PI / 3.).cos(),
                BASE_RADIUS * (2. * i as f64 * PI / 3.).sin(),
                0.,
            );
            base[2 * i] = b;
            base[(2 * i + 5) % 6] = b;
            let p = Vector3::new(
                PAYLOAD_RADIUS * (2. * i as f64 * PI / 3. + PI / 3.).cos(),
                PAYLOAD_RADIUS * (2. * i as f64 * PI / 3. + PI / 3.).sin(),
                0.,
            );
            payload[2 * i] = p;
            payload[2 * i + 1] = p;
        }
        Self {
            kind,
            base,
            payload,
        }
    }

    pub fn kind(&self) -> PanelKind {
        self.kind
    }

    /// Pads in the payload frame, actuator winding order, before any offset.
    fn payload_pads(&self) -> [Vector3<f64>; 3] {
        [self.payload[0], self.payload[2], self.payload[4]]
    }

    /// Solves the forward kinematics: panel pose and pad coordinates from
    /// actuator lengths.
    ///
    /// Newton-Raphson on the six squared axis-to-axis distances, with the
    /// analytic Jacobian and an LU solve per step. Errors if the Jacobian
    /// goes singular or the iteration cap is hit.
    pub fn forward(
        &self,
        lengths: &ActuatorLengths,
        solver: &Solver,
    ) -> Result<(Pose, PadCoordinates), KinematicsError> {
        let mut axis_len = [0f64; 6];
        for (axis, length) in axis_len.iter_mut().zip(lengths.iter()) {
            // two brackets complete the actuator into the axis-to-axis strut
            *axis = length + 2. * BRACKET_THICKNESS;
        }

        // internal pose guess (x, y, z, phi, theta, psi); mean axis length
        // seeds z
        let mut a = [5., 0., 0., 0.1, 0.1, 0.1];
        a[2] = axis_len.iter().sum::<f64>() / 6.;

        // reference geometry: pads in the payload frame, actuator axes offset
        // from them along the pad normals
        let pads0 = self.payload_pads();
        let norms = self.kind.pad_normals();
        let mut axes0 = [Vector3::zeros(); 3];
        for i in 0..3 {
            axes0[i] = pads0[i] + STANDOFF * norms[i];
        }
        let axes_frame = Frame::from_points(&axes0);
        // pad normals carried along in the axes frame
        let norm_axes = [
            axes_frame.to_local(&norms[0]),
            axes_frame.to_local(&norms[1]),
            axes_frame.to_local(&norms[2]),
        ];
        // axes coordinates in their own frame are the payload attachment
        // points the iteration works with
        let centroid = (axes0[0] + axes0[1] + axes0[2]) / 3.;
        let mut ax = [0f64; 6];
        let mut ay = [0f64; 6];
        for i in 0..3 {
            let c = axes0[i] - centroid;
            ax[2 * i] = c.dot(&axes_frame.x);
            ax[2 * i + 1] = ax[2 * i];
            ay[2 * i] = c.dot(&axes_frame.y);
            ay[2 * i + 1] = ay[2 * i];
        }

        let mut u = [0f64; 6];
        let mut v = [0f64; 6];
        let mut w = [0f64; 6];
        let mut xbar = [0f64; 6];
        let mut ybar = [0f64; 6];
        let mut iter = 0usize;
        loop {
            let (s3, c3) = a[3].sin_cos();
            let (s4, c4) = a[4].sin_cos();
            let (s5, c5) = a[5].sin_cos();
            // X->Z->Y rotation, X applied first
            let ux = c3 * c4;
            let uy = s3 * s5 - c3 * s4 * c5;
            let vx = s4;
            let vy = c4 * c5;
            let wx = -s3 * c4;
            let wy = c3 * s5 + s3 * s4 * c5;

            // residual of the squared strut lengths, sign flipped so the LU
            // solve yields the step directly
            let mut f = Vector6::zeros();
            for i in 0..6 {
                xbar[i] = a[0] - self.base[i].x;
                ybar[i] = a[1] - self.base[i].y;
                u[i] = ux * ax[i] + uy * ay[i];
                v[i] = vx * ax[i] + vy * ay[i];
                w[i] = wx * ax[i] + wy * ay[i];
                f[i] = axis_len[i] * axis_len[i]
                    - (xbar[i] + u[i]) * (xbar[i] + u[i])
                    - (ybar[i] + v[i]) * (ybar[i] + v[i])
                    - (a[2] + w[i]) * (a[2] + w[i]);
            }

            let residual: f64 = f.iter().map(|x| x.abs()).sum();
            trace!("forward kinematics iteration {iter}: |f| = {residual:.3e}");
            if residual < solver.tol {
                break;
            }
            if iter >= solver.max_iter {
                return Err(KinematicsError::NoConvergence {
                    max_iter: solver.max_iter,
                    residual,
                });
            }

            let mut jf = Matrix6::zeros();
            for i in 0..6 {
                jf[(i, 0)] = 2. * (xbar[i] + u[i]);
                jf[(i, 1)] = 2. * (ybar[i] + v[i]);
                jf[(i, 2)] = 2. * (a[2] + w[i]);
                jf[(i, 3)] = 2. * (xbar[i] * w[i] - a[2] * u[i]);
                jf[(i, 4)] = 2.
                    * (-(xbar[i] + u[i]) * (c3 * s4 * ax[i] + c3 * c4 * c5 * ay[i])
                        + (ybar[i] + v[i]) * (c4 * ax[i] - s4 * c5 * ay[i])
                        + (a[2] + w[i]) * (-s3 * s4 * ax[i] + s3 * c4 * c5 * ay[i]));
                jf[(i, 5)] = 2.
                    * ay[i]
                    * ((xbar[i] + u[i]) * (s3 * c5 + c3 * s4 * s5)
                        - (ybar[i] + v[i]) * c4 * s5
                        + (a[2] + w[i]) * (c3 * c5 - s3 * s4 * s5));
            }

            let step = jf
                .lu()
                .solve(&f)
                .ok_or(KinematicsError::SingularJacobian { iter })?;
            if step.iter().map(|x| x.abs()).sum::<f64>() < solver.tol {
                break;
            }
            for (ai, si) in a.iter_mut().zip(step.iter()) {
                *ai += si;
            }
            iter += 1;
        }

        // payload-side strut endpoints in the base frame
        let mut act = [Vector3::zeros(); 6];
        for i in 0..6 {
            act[i] = Vector3::new(a[0] + u[i], a[1] + v[i], a[2] + w[i]);
        }

        // pads sit off the axes plane along the carried normals, plus the
        // base-side joint offset in z
        let axes_sol = [act[0], act[2], act[4]];
        let frame_sol = Frame::from_points(&axes_sol);
        let mut pads = [Vector3::zeros(); 3];
        for i in 0..3 {
            let n = frame_sol.to_global(&norm_axes[i]);
            pads[i] = act[2 * i] - STANDOFF * n;
            pads[i].z += JOINT_THICKNESS;
        }

        // panel centre from the axes plane normal; exact for flat payloads,
        // a tilt-free approximation for curved ones
        let plane_norm = (axes_sol[1] - axes_sol[0])
            .cross(&(axes_sol[2] - axes_sol[0]))
            .normalize();
        let centre = Vector3::new(a[0], a[1], a[2]) + STANDOFF * plane_norm
            + Vector3::new(0., 0., JOINT_THICKNESS);

        let pose = Pose {
            x: centre.x,
            y: centre.y,
            z: centre.z,
            rot_x: a[5] * PAYLOAD_RADIUS,
            rot_y: a[3] * PAYLOAD_RADIUS,
            rot_z: a[4] * PAYLOAD_RADIUS,
        };
        Ok((pose, external_pads(&pads)))
    }

    /// Actuator lengths from a panel pose; analytic, no iteration involved.
    pub fn lengths_from_pose(&self, pose: &Pose) -> (ActuatorLengths, PadCoordinates) {
        let r = rotation(Axis::Y, pose.rot_y / PAYLOAD_RADIUS)
            * rotation(Axis::Z, pose.rot_z / PAYLOAD_RADIUS)
            * rotation(Axis::X, pose.rot_x / PAYLOAD_RADIUS);
        let t = Vector3::new(pose.x, pose.y, pose.z);
        let pads0 = self.payload_pads();
        let pads = [
            r * pads0[0] + t,
            r * pads0[1] + t,
            r * pads0[2] + t,
        ];
        let lengths = self.lengths_from_internal_pads(&pads);
        (lengths, external_pads(&pads))
    }

    /// Actuator lengths from known pad coordinates.
    pub fn lengths_from_pads(&self, pads: &PadCoordinates) -> ActuatorLengths {
        let internal = [
            pads.0[PAD_MAP[0]],
            pads.0[PAD_MAP[1]],
            pads.0[PAD_MAP[2]],
        ];
        self.lengths_from_internal_pads(&internal)
    }

    fn lengths_from_internal_pads(&self, pads: &[Vector3<f64>; 3]) -> ActuatorLengths {
        let frame = Frame::from_points(pads);
        let norms = self.kind.pad_normals();
        let mut lengths = [0f64; 6];
        for i in 0..3 {
            // + because the pad normals point towards the base
            let axis_end = pads[i] + STANDOFF * frame.to_global(&norms[i]);
            for k in 0..2 {
                let j = 2 * i + k;
                let strut =
                    axis_end - Vector3::new(self.base[j].x, self.base[j].y, JOINT_THICKNESS);
                lengths[j] = strut.norm() - 2. * BRACKET_THICKNESS;
            }
        }
        ActuatorLengths(lengths)
    }
}

fn external_pads(internal: &[Vector3<f64>; 3]) -> PadCoordinates {
    PadCoordinates([
        internal[PAD_MAP[0]],
        internal[PAD_MAP[1]],
        internal[PAD_MAP[2]],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NOMINAL_ACTUATOR_LENGTH;

    fn nominal() -> ActuatorLengths {
        ActuatorLengths::uniform(NOMINAL_ACTUATOR_LENGTH)
    }

    #[test]
    fn forward_at_nominal_lengths_is_centred() {
        let platform = StewartPlatform::new(PanelKind::Opt);
        let (pose, pads) = platform.forward(&nominal(), &Solver::default()).unwrap();
        assert!(pose.x.abs() < 1e-6);
        assert!(pose.y.abs() < 1e-6);
        assert!(pose.rot_x.abs() < 1e-6);
        assert!(pose.rot_y.abs() < 1e-6);
        assert!(pose.rot_z.abs() < 1e-6);
        // pads level for a flat payload
        assert!((pads.pad(0).z - pads.pad(1).z).abs() < 1e-9);
        assert!((pads.pad(0).z - pads.pad(2).z).abs() < 1e-9);
    }

    #[test]
    fn pose_roundtrip_on_optical_table() {
        let platform = StewartPlatform::new(PanelKind::Opt);
        let mut lengths = nominal();
        lengths.0[0] += 1.5;
        lengths.0[3] -= 0.7;
        lengths.0[5] += 0.2;
        let (pose, _) = platform.forward(&lengths, &Solver::default()).unwrap();
        let (back, _) = platform.lengths_from_pose(&pose);
        for i in 0..6 {
            assert!(
                (back[i] - lengths[i]).abs() < 1e-6,
                "actuator {i}: {} != {}",
                back[i],
                lengths[i]
            );
        }
    }

    #[test]
    fn pad_roundtrip_on_curved_panels() {
        for kind in [PanelKind::P1, PanelKind::P2, PanelKind::S1, PanelKind::S2] {
            let platform = StewartPlatform::new(kind);
            let mut lengths = nominal();
            lengths.0[1] += 0.9;
            lengths.0[2] -= 1.1;
            lengths.0[4] += 0.4;
            let (_, pads) = platform.forward(&lengths, &Solver::default()).unwrap();
            let back = platform.lengths_from_pads(&pads);
            for i in 0..6 {
                assert!(
                    (back[i] - lengths[i]).abs() < 1e-6,
                    "{kind} actuator {i}: {} != {}",
                    back[i],
                    lengths[i]
                );
            }
        }
    }

    #[test]
    fn iteration_cap_is_enforced() {
        let platform = StewartPlatform::new(PanelKind::P1);
        let solver = Solver {
            tol: 1e-12,
            max_iter: 1,
        };
        let err = platform.forward(&nominal(), &solver).unwrap_err();
        assert!(matches!(err, KinematicsError::NoConvergence { .. }));
    }

    #[test]
    fn lengths_from_pose_matches_pads_route() {
        let platform = StewartPlatform::new(PanelKind::Opt);
        let pose = Pose {
            x: 1.2,
            y: -0.4,
            z: NOMINAL_ACTUATOR_LENGTH + 2. * BRACKET_THICKNESS + STANDOFF + JOINT_THICKNESS,
            rot_x: 0.3,
            rot_y: -0.2,
            rot_z: 0.5,
        };
        let (lengths, pads) = platform.lengths_from_pose(&pose);
        let again = platform.lengths_from_pads(&pads);
        for i in 0..6 {
            assert!((lengths[i] - again[i]).abs() < 1e-9);
        }
    }
}
