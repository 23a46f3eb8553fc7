use pas_geometry::GeometryError;
use pas_interface::DeviceError;
use pas_kinematics::KinematicsError;
use thiserror::Error;

/// Everything an alignment operation can fail with.
///
/// All of these are returned to the caller; none abort the process. A failed
/// calculate phase leaves any previously staged motion untouched.
#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("underdetermined system: {rows} sensor readings for {cols} unknowns")]
    Underdetermined { rows: usize, cols: usize },
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
    #[error(
        "panel {panel}: projected sensor deviation {deviation:.1} px exceeds \
         the safety radius of {radius:.1} px"
    )]
    SafetyViolation {
        panel: u32,
        deviation: f64,
        radius: f64,
    },
    #[error("topology exhausted: {0}")]
    TopologyExhausted(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}
