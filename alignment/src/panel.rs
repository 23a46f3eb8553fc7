//! One mirror panel and its six actuators.
//!
//! All motion entry points reduce a request to a delta-length vector, run the
//! sensor-projection safety check against every adjacent edge, dispatch the
//! move and wait for the device to leave Busy. The raw dispatch path without
//! the check is reserved for execute phases that already checked at calculate
//! time.

use log::{debug, info};
use nalgebra::Vector6;
use pas_geometry::PanelPosition;
use pas_interface::{
    wait_while_busy, DeviceProxy, DeviceState, Field, Identity, Op, Polling,
};
use pas_kinematics::{ActuatorLengths, PadCoordinates, Pose, Solver, StewartPlatform};
use std::sync::{Arc, Mutex, Weak};

use crate::edge::EdgeController;
use crate::AlignmentError;

pub struct PanelController {
    position: PanelPosition,
    identity: Identity,
    device: Arc<dyn DeviceProxy>,
    platform: StewartPlatform,
    solver: Solver,
    polling: Polling,
    edges: Mutex<Vec<Weak<EdgeController>>>,
}

impl PanelController {
    pub fn new(
        position: PanelPosition,
        device: Arc<dyn DeviceProxy>,
        polling: Polling,
    ) -> Arc<Self> {
        let kind = position
            .mirror()
            .prescription()
            .ring(position.ring())
            .map(|r| r.kind)
            .unwrap_or(pas_kinematics::PanelKind::Opt);
        Arc::new(Self {
            position,
            identity: Identity {
                name: format!("Panel_{position}"),
                position: position.as_u32(),
                serial: 0,
                address: position.to_string(),
            },
            device,
            platform: StewartPlatform::new(kind),
            solver: Solver::default(),
            polling,
            edges: Mutex::new(Vec::new()),
        })
    }

    pub fn position(&self) -> PanelPosition {
        self.position
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn state(&self) -> DeviceState {
        self.device.state().await
    }

    pub(crate) fn attach_edge(&self, edge: Weak<EdgeController>) {
        self.edges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(edge);
    }

    fn adjacent_edges(&self) -> Vec<Arc<EdgeController>> {
        self.edges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Current lengths of the six actuators [mm].
    pub async fn actuator_lengths(&self) -> Result<ActuatorLengths, AlignmentError> {
        let mut lengths = [0f64; 6];
        for (i, length) in lengths.iter_mut().enumerate() {
            *length = self.device.data(Field::ActuatorLength(i)).await?;
        }
        Ok(ActuatorLengths(lengths))
    }

    /// Residual delta the last motion of one actuator failed to apply [mm].
    pub(crate) async fn missed_delta(&self, actuator: usize) -> Result<f64, AlignmentError> {
        Ok(self
            .device
            .data(Field::ActuatorMissedDelta(actuator))
            .await?)
    }

    /// Panel pose and pad coordinates recovered from the current actuator
    /// lengths by forward kinematics.
    pub async fn read_position(&self) -> Result<(Pose, PadCoordinates), AlignmentError> {
        let lengths = self.actuator_lengths().await?;
        let (pose, pads) = self.platform.forward(&lengths, &self.solver)?;
        debug!("{}: pose = {pose}", self.identity);
        Ok((pose, pads))
    }

    pub fn platform(&self) -> &StewartPlatform {
        &self.platform
    }

    /// Projects a candidate delta-length motion through every adjacent
    /// edge's response matrix and rejects it if any sensor's laser spot
    /// would leave its camera safety radius.
    pub async fn check_for_collision(
        &self,
        delta: &ActuatorLengths,
    ) -> Result<(), AlignmentError> {
        let current = self.actuator_lengths().await?;
        debug!(
            "{}: collision check for delta {delta} from {current}",
            self.identity
        );
        for edge in self.adjacent_edges() {
            edge.check_motion(self.position, delta).await?;
        }
        debug!("{}: collision check passed", self.identity);
        Ok(())
    }

    /// Raw dispatch of a delta-length motion, no safety check, no wait.
    pub(crate) async fn dispatch_delta_lengths(
        &self,
        delta: &ActuatorLengths,
    ) -> Result<(), AlignmentError> {
        info!("{}: moving actuators by {delta}", self.identity);
        self.device.operate(Op::MoveDeltaLengths, &delta.0).await?;
        Ok(())
    }

    /// Moves all actuators by the given deltas and waits for completion.
    pub async fn move_delta_lengths(&self, delta: &ActuatorLengths) -> Result<(), AlignmentError> {
        self.check_for_collision(delta).await?;
        self.dispatch_delta_lengths(delta).await?;
        wait_while_busy(self.device.as_ref(), &self.polling).await?;
        Ok(())
    }

    /// Moves all actuators to the given absolute lengths.
    pub async fn move_to_lengths(&self, target: &ActuatorLengths) -> Result<(), AlignmentError> {
        let current = self.actuator_lengths().await?;
        let mut delta = [0f64; 6];
        for i in 0..6 {
            delta[i] = target[i] - current[i];
        }
        self.move_delta_lengths(&ActuatorLengths(delta)).await
    }

    /// Moves the panel to an absolute pose in its own frame.
    pub async fn move_to_coords(&self, target: &Pose) -> Result<(), AlignmentError> {
        let (lengths, _) = self.platform.lengths_from_pose(target);
        info!(
            "{}: target pose {target} -> target lengths {lengths}",
            self.identity
        );
        self.move_to_lengths(&lengths).await
    }

    /// Moves the panel by a pose delta relative to its current position.
    pub async fn move_delta_coords(&self, delta: &Pose) -> Result<(), AlignmentError> {
        let (current, _) = self.read_position().await?;
        let target = Pose::from_array({
            let c = current.to_array();
            let d = delta.to_array();
            [
                c[0] + d[0],
                c[1] + d[1],
                c[2] + d[2],
                c[3] + d[3],
                c[4] + d[4],
                c[5] + d[5],
            ]
        });
        self.move_to_coords(&target).await
    }

    /// Immediately stops any motion in progress.
    pub async fn stop(&self) -> Result<(), AlignmentError> {
        self.device.operate(Op::Stop, &[]).await?;
        Ok(())
    }

    /// Re-homes the actuators in the given direction; only allowed from On.
    pub async fn find_home(&self, direction: i32) -> Result<(), AlignmentError> {
        let state = self.device.state().await;
        if state != DeviceState::On {
            return Err(AlignmentError::InvalidState(format!(
                "panel {} is {state}, find-home needs On",
                self.position
            )));
        }
        self.device.operate(Op::FindHome, &[direction as f64]).await?;
        Ok(())
    }

    pub(crate) async fn wait_done(&self) -> Result<DeviceState, AlignmentError> {
        Ok(wait_while_busy(self.device.as_ref(), &self.polling).await?)
    }
}

/// Helper for slicing a stacked multi-panel solution vector.
pub(crate) fn lengths_from_segment(x: &nalgebra::DVector<f64>, offset: usize) -> ActuatorLengths {
    let mut out = [0f64; 6];
    for (i, v) in out.iter_mut().enumerate() {
        *v = x[offset + i];
    }
    ActuatorLengths(out)
}

/// Converts actuator lengths to a dense vector for matrix products.
pub(crate) fn as_vector(lengths: &ActuatorLengths) -> Vector6<f64> {
    Vector6::from_row_slice(&lengths.0)
}
