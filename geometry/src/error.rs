use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("invalid panel position {0}")]
    InvalidPosition(u32),
    #[error("invalid mirror number {0}, expected 1 (primary), 2 (secondary) or 3 (test bench)")]
    InvalidMirror(u32),
    #[error("cannot parse edge address {0:?}")]
    InvalidEdge(String),
    #[error("panels {0} and {1} are not ring neighbors")]
    NotRingAdjacent(u32, u32),
    #[error(transparent)]
    Kinematics(#[from] pas_kinematics::KinematicsError),
}
