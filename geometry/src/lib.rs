//! # Mirror geometry
//!
//! Everything about where panels sit on a segmented mirror:
//!
//! * the aspheric surface prescription of each mirror and the ideal pad
//!   coordinates of each panel ring ([`prescription`]);
//! * the panel position encoding and the cyclic ring topology, including
//!   neighbor and edge arithmetic ([`position`]);
//! * the per-ring panel reference frames and the transformations between
//!   panel and telescope coordinates ([`frames`]).
//!
//! The telescope frame has its z-axis running from the primary towards the
//! secondary mirror; each mirror is described in its own frame with the
//! surface vertex near z = 0. All lengths are in mm, all angles in radians
//! unless stated otherwise.

mod error;
pub mod frames;
pub mod position;
pub mod prescription;

pub use error::GeometryError;
pub use frames::{apply_pose_delta, MirrorFrames, PanelFrame};
pub use position::{Direction, Edge, PanelPosition};
pub use prescription::{MirrorId, Prescription, RingGeometry};
