//! # Panel alignment engine
//!
//! The controller tree and the alignment solvers of the panel alignment
//! system. [`SensorController`], [`PanelController`] and [`EdgeController`]
//! wrap the devices of one mirror; [`MirrorController`] sits on top and runs
//! the whole-mirror operations: rigid motion to a target pose, sector and
//! full-ring alignment solves, and the sequential edge-by-edge walk.
//!
//! All corrective motion is two-phase: a calculate call reads the sensors,
//! solves the least-squares system, checks the result against the collision
//! safety radii and stages it; a follow-up execute call dispatches the staged
//! motion and clears the stage.
//!
//! The [`simulator`] module provides in-process device stand-ins driven by
//! the same response matrices the calibration store serves, for dry runs and
//! the integration tests.

mod edge;
mod error;
mod fit;
mod mirror;
mod panel;
mod sensor;
pub mod simulator;
mod solve;

pub use edge::{EdgeController, ALIGNMENT_TOLERANCE};
pub use error::AlignmentError;
pub use fit::{fit_rigid_motion, gauss_newton};
pub use mirror::{MirrorController, OperationTag, WalkOutcome, MAX_EDGE_ITERATIONS};
pub use panel::PanelController;
pub use sensor::{SensorController, SENSOR_CENTER};
