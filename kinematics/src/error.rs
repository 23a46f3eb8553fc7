use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum KinematicsError {
    #[error(
        "Newton-Raphson did not converge within {max_iter} iterations (residual {residual:.3e})"
    )]
    NoConvergence { max_iter: usize, residual: f64 },
    #[error("singular Jacobian in Newton-Raphson iteration {iter}")]
    SingularJacobian { iter: usize },
}
