//! Rigid-motion fitting for the whole-mirror pose estimate.
//!
//! The minimizer is a plain Gauss-Newton loop over a caller-supplied residual
//! closure, so the fitting context is captured explicitly instead of being
//! routed through shared state.

use nalgebra::{DMatrix, DVector, Vector3};
use pas_geometry::apply_pose_delta;

use crate::AlignmentError;

const STEP_SIZE: f64 = 1e-6;
const STEP_TOLERANCE: f64 = 1e-10;

/// Minimizes `|residual(p)|^2` over the six pose parameters, starting from
/// `start`. The Jacobian is taken numerically by central differences.
pub fn gauss_newton<F>(
    residual: F,
    start: [f64; 6],
    max_iter: usize,
) -> Result<[f64; 6], AlignmentError>
where
    F: Fn(&[f64; 6]) -> DVector<f64>,
{
    let mut params = start;
    for _ in 0..max_iter {
        let r = residual(&params);
        let mut jacobian = DMatrix::zeros(r.len(), 6);
        for k in 0..6 {
            let mut plus = params;
            plus[k] += STEP_SIZE;
            let mut minus = params;
            minus[k] -= STEP_SIZE;
            jacobian.set_column(k, &((residual(&plus) - residual(&minus)) / (2. * STEP_SIZE)));
        }
        let jt = jacobian.transpose();
        let step = (&jt * &jacobian).lu().solve(&(&jt * &r)).ok_or_else(|| {
            AlignmentError::NumericalFailure("pose fit normal equations are singular".into())
        })?;
        for (p, s) in params.iter_mut().zip(step.iter()) {
            *p -= s;
        }
        if step.amax() < STEP_TOLERANCE {
            return Ok(params);
        }
    }
    Err(AlignmentError::NumericalFailure(format!(
        "pose fit did not converge within {max_iter} iterations"
    )))
}

/// Fits the rigid pose delta `[x, y, z, rx, ry, rz]` that carries the
/// reference points onto the measured points in the least-squares sense.
pub fn fit_rigid_motion(
    reference: &[Vector3<f64>],
    measured: &[Vector3<f64>],
) -> Result<[f64; 6], AlignmentError> {
    if reference.len() != measured.len() || reference.len() < 3 {
        return Err(AlignmentError::InvalidArgument(format!(
            "rigid fit needs at least 3 point pairs, got {} and {}",
            reference.len(),
            measured.len()
        )));
    }
    let residual = |p: &[f64; 6]| {
        let mut r = DVector::zeros(3 * reference.len());
        for (i, (a, b)) in reference.iter().zip(measured).enumerate() {
            r.rows_mut(3 * i, 3).copy_from(&(apply_pose_delta(a, p) - b));
        }
        r
    };
    gauss_newton(residual, [0.; 6], 50)
}
