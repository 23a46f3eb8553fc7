//! The least-squares step shared by every alignment mode.

use nalgebra::{DMatrix, DVector};

use crate::AlignmentError;

/// Solves `b * x = y` in the least-squares sense by thin SVD.
///
/// Rejects underdetermined systems up front: with fewer readings than
/// unknowns the pseudo-inverse would happily return the minimum-norm
/// solution, which is not a correction we want to send to hardware.
pub(crate) fn least_squares(
    b: &DMatrix<f64>,
    y: &DVector<f64>,
) -> Result<DVector<f64>, AlignmentError> {
    if y.len() < b.ncols() {
        return Err(AlignmentError::Underdetermined {
            rows: y.len(),
            cols: b.ncols(),
        });
    }
    let svd = b
        .clone()
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(|| {
            AlignmentError::NumericalFailure(
                "singular value decomposition did not converge".into(),
            )
        })?;
    svd.solve(y, 1e-10)
        .map_err(|e| AlignmentError::NumericalFailure(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_an_exact_solution() {
        // a full-rank 8x6 system with a known solution
        let mut b = DMatrix::zeros(8, 6);
        for i in 0..8 {
            for j in 0..6 {
                b[(i, j)] = ((i * 7 + j * 3) % 11) as f64 - 5. + if i == j { 10. } else { 0. };
            }
        }
        let x_true = DVector::from_vec(vec![0.2, -0.1, 0.15, -0.05, 0.3, 0.]);
        let y = &b * &x_true;
        let x = least_squares(&b, &y).unwrap();
        assert!((x - x_true).amax() < 1e-9);
    }

    #[test]
    fn rejects_underdetermined_systems() {
        let b = DMatrix::<f64>::identity(4, 6);
        let y = DVector::zeros(4);
        let err = least_squares(&b, &y).unwrap_err();
        assert!(matches!(
            err,
            AlignmentError::Underdetermined { rows: 4, cols: 6 }
        ));
    }
}
