//! The shared boundary between adjacent panels and its alignment solve.
//!
//! An edge owns the sensors along one panel boundary and references the
//! panels on either side. Its core operation is `align`: read the sensors,
//! assemble the response (and, for three-panel edges, constraint) system,
//! solve it by least squares and stage the corrective motion for a follow-up
//! execute call.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use pas_geometry::{Edge, PanelPosition};
use pas_interface::{DeviceState, Identity};
use pas_kinematics::ActuatorLengths;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::panel::{as_vector, lengths_from_segment, PanelController};
use crate::sensor::{SensorController, SENSOR_CENTER};
use crate::solve::least_squares;
use crate::AlignmentError;

/// A calculated correction below this bound, per actuator, counts as aligned
/// [mm].
pub const ALIGNMENT_TOLERANCE: f64 = 0.05;

/// Weight applied to overlap-constraint rows in the three-panel solve; the
/// constraint must win against measurement noise along the degenerate
/// direction of the shared boundary.
const CONSTRAINT_WEIGHT: f64 = std::f64::consts::SQRT_2;

pub struct EdgeController {
    edge: Edge,
    identity: Identity,
    sensors: Vec<Arc<SensorController>>,
    panels: BTreeMap<PanelPosition, Arc<PanelController>>,
    staged: Mutex<Option<Vec<(PanelPosition, ActuatorLengths)>>>,
    aligned: AtomicBool,
    state: Mutex<DeviceState>,
}

impl EdgeController {
    /// Builds the edge and registers it with its panels for collision checks.
    pub fn build(
        edge: Edge,
        mut sensors: Vec<Arc<SensorController>>,
        panels: Vec<Arc<PanelController>>,
    ) -> Arc<Self> {
        // sensor order is the position order along the edge; it fixes the row
        // layout of every assembled system
        sensors.sort_by_key(|s| s.identity().position);
        let address = edge.to_string();
        let controller = Arc::new(Self {
            edge,
            identity: Identity {
                name: address.clone(),
                position: 0,
                serial: 0,
                address,
            },
            sensors,
            panels: panels
                .iter()
                .map(|p| (p.position(), Arc::clone(p)))
                .collect(),
            staged: Mutex::new(None),
            aligned: AtomicBool::new(false),
            state: Mutex::new(DeviceState::On),
        });
        for panel in &panels {
            panel.attach_edge(Arc::downgrade(&controller));
        }
        controller
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn edge(&self) -> &Edge {
        &self.edge
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn sensors(&self) -> &[Arc<SensorController>] {
        &self.sensors
    }

    pub fn panel(&self, position: PanelPosition) -> Option<&Arc<PanelController>> {
        self.panels.get(&position)
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Whether the last calculated correction was below
    /// [`ALIGNMENT_TOLERANCE`]. Executing a motion does not reset this; only
    /// the next calculate call re-evaluates it.
    pub fn is_aligned(&self) -> bool {
        self.aligned.load(Ordering::SeqCst)
    }

    /// The sensors currently contributing readings, in row order.
    pub async fn visible_sensors(&self) -> Vec<Arc<SensorController>> {
        let mut out = Vec::with_capacity(self.sensors.len());
        for sensor in &self.sensors {
            if sensor.is_visible().await {
                out.push(Arc::clone(sensor));
            } else {
                warn!(
                    "{}: sensor {} is off or in a fatal error state, ignoring it",
                    self.identity,
                    sensor.identity()
                );
            }
        }
        out
    }

    async fn read_stacked(
        sensors: &[Arc<SensorController>],
    ) -> Result<(DVector<f64>, DVector<f64>), AlignmentError> {
        let mut centroids = DVector::zeros(2 * sensors.len());
        let mut widths = DVector::zeros(2 * sensors.len());
        for (i, sensor) in sensors.iter().enumerate() {
            let reading = sensor.read().await?;
            centroids.rows_mut(2 * i, 2).copy_from(&reading.centroid);
            widths.rows_mut(2 * i, 2).copy_from(&reading.spot_width);
        }
        Ok((centroids, widths))
    }

    fn aligned_stacked(sensors: &[Arc<SensorController>]) -> Result<DVector<f64>, AlignmentError> {
        let mut out = DVector::zeros(2 * sensors.len());
        for (i, sensor) in sensors.iter().enumerate() {
            out.rows_mut(2 * i, 2).copy_from(&sensor.aligned_readings()?);
        }
        Ok(out)
    }

    fn systematic_stacked(sensors: &[Arc<SensorController>]) -> DVector<f64> {
        let mut out = DVector::zeros(2 * sensors.len());
        for (i, sensor) in sensors.iter().enumerate() {
            out.rows_mut(2 * i, 2).copy_from(&sensor.systematic_offsets());
        }
        out
    }

    fn response_stacked(
        sensors: &[Arc<SensorController>],
        panel: PanelPosition,
    ) -> Result<DMatrix<f64>, AlignmentError> {
        let mut out = DMatrix::zeros(2 * sensors.len(), 6);
        for (i, sensor) in sensors.iter().enumerate() {
            // sensors that do not see this panel keep their zero rows, so the
            // row layout stays aligned with the reading vectors
            if sensor.side_of(panel).is_some() {
                out.view_mut((2 * i, 0), (2, 6)).copy_from(&sensor.response(panel)?);
            }
        }
        Ok(out)
    }

    /// Response of this edge's visible sensors to the given panel's
    /// actuators; 2 rows per visible sensor, zero rows for sensors that do
    /// not see the panel.
    pub async fn response_matrix(
        &self,
        panel: PanelPosition,
    ) -> Result<DMatrix<f64>, AlignmentError> {
        Self::response_stacked(&self.visible_sensors().await, panel)
    }

    /// Centroids and spot widths of all visible sensors, freshly exposed.
    pub async fn current_readings(
        &self,
    ) -> Result<(DVector<f64>, DVector<f64>), AlignmentError> {
        Self::read_stacked(&self.visible_sensors().await).await
    }

    /// Aligned (nominal) centroids over the visible sensors.
    pub async fn aligned_readings(&self) -> Result<DVector<f64>, AlignmentError> {
        Self::aligned_stacked(&self.visible_sensors().await)
    }

    /// Ring systematic offsets over the visible sensors.
    pub async fn systematic_offsets(&self) -> DVector<f64> {
        Self::systematic_stacked(&self.visible_sensors().await)
    }

    /// Rejects a candidate motion of `panel` if it would push any visible
    /// sensor's laser spot outside that sensor's camera safety radius.
    pub(crate) async fn check_motion(
        &self,
        panel: PanelPosition,
        delta: &ActuatorLengths,
    ) -> Result<(), AlignmentError> {
        let sensors = self.visible_sensors().await;
        if sensors.is_empty() {
            debug!("{}: no visible sensors, skipping collision check", self.identity);
            return Ok(());
        }
        let delta = as_vector(delta);
        for sensor in &sensors {
            let current = sensor.read().await?.centroid;
            let projected = match sensor.side_of(panel) {
                Some(_) => current + sensor.response(panel)? * delta,
                None => current,
            };
            let deviation = (projected - SENSOR_CENTER).norm();
            let radius = sensor.safety_radius().await?;
            debug!(
                "{}: sensor {} projected deviation {deviation:.1} px [{radius:.1}]",
                self.identity,
                sensor.identity()
            );
            if deviation > radius {
                return Err(AlignmentError::SafetyViolation {
                    panel: panel.as_u32(),
                    deviation,
                    radius,
                });
            }
        }
        Ok(())
    }

    /// Aligns this edge.
    ///
    /// With `moveit` the given panel is the one being moved; otherwise the
    /// panel is held fixed and the edge's other two panels move under the
    /// overlap constraint. A calculate call (`execute == false`) solves and
    /// stages the motion; the follow-up execute call dispatches and clears
    /// the stage.
    ///
    /// Rejected while the edge is Off (stopped) or Busy (another alignment
    /// in flight); no device is touched in that case.
    pub async fn align(
        &self,
        panel: PanelPosition,
        align_frac: f64,
        moveit: bool,
        execute: bool,
    ) -> Result<(), AlignmentError> {
        let prior = self.enter_busy("align")?;
        let result = self.align_inner(panel, align_frac, moveit, execute).await;
        self.leave_busy(prior);
        result
    }

    /// Claims the edge for one operation, rejecting while Off or Busy.
    fn enter_busy(&self, op: &str) -> Result<DeviceState, AlignmentError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            DeviceState::Off | DeviceState::Busy => Err(AlignmentError::InvalidState(format!(
                "edge {} is {}, {op} rejected",
                self.identity, *state
            ))),
            prior => {
                *state = DeviceState::Busy;
                Ok(prior)
            }
        }
    }

    /// Restores the pre-operation state, unless a stop flipped the edge Off
    /// in the meantime.
    fn leave_busy(&self, prior: DeviceState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == DeviceState::Busy {
            *state = prior;
        }
    }

    async fn align_inner(
        &self,
        panel: PanelPosition,
        align_frac: f64,
        moveit: bool,
        execute: bool,
    ) -> Result<(), AlignmentError> {
        if !(0. < align_frac && align_frac <= 1.) {
            return Err(AlignmentError::InvalidArgument(format!(
                "align_frac {align_frac} outside (0, 1]"
            )));
        }
        if !self.panels.contains_key(&panel) {
            return Err(AlignmentError::InvalidArgument(format!(
                "panel {panel} is not part of edge {}",
                self.identity
            )));
        }

        if execute {
            return self.execute_staged().await;
        }

        info!(
            "{}: aligning, {} panel {panel}",
            self.identity,
            if moveit { "moving" } else { "keeping fixed" }
        );

        let sensors = self.visible_sensors().await;
        let (current, _widths) = Self::read_stacked(&sensors).await?;
        let target = Self::aligned_stacked(&sensors)? - Self::systematic_stacked(&sensors);
        if current.is_empty() {
            return Err(AlignmentError::Underdetermined { rows: 0, cols: 6 });
        }

        let movers: Vec<PanelPosition> = if moveit {
            vec![panel]
        } else {
            self.panels.keys().copied().filter(|p| *p != panel).collect()
        };

        let (b, y) = if moveit {
            let b = Self::response_stacked(&sensors, panel)?;
            let y = &target - &current;
            (b, y)
        } else {
            self.fixed_panel_system(&sensors, &movers, &target, &current)
                .await?
        };

        debug!("{}: solving a {}x{} system", self.identity, b.nrows(), b.ncols());
        let mut x = least_squares(&b, &y)?;

        // safety gate before anything is staged; each mover checks its own
        // segment of the scaled solution
        for (m, mover) in movers.iter().enumerate() {
            let delta = lengths_from_segment(&(&x * align_frac), 6 * m);
            if let Some(p) = self.panels.get(mover) {
                p.check_for_collision(&delta).await?;
            }
        }

        if align_frac < 1. {
            info!(
                "{}: fractional motion of {align_frac} requested",
                self.identity
            );
        }
        x *= align_frac;
        info!("{}: least-squares solution:\n{x}", self.identity);

        self.aligned.store(x.amax() < ALIGNMENT_TOLERANCE, Ordering::SeqCst);
        let stage: Vec<(PanelPosition, ActuatorLengths)> = movers
            .iter()
            .enumerate()
            .map(|(m, mover)| (*mover, lengths_from_segment(&x, 6 * m)))
            .collect();
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(stage);
        info!(
            "{}: calculation done, call again with execute to apply the motion",
            self.identity
        );
        Ok(())
    }

    /// The three-panel system: responses of the two movers side by side, with
    /// weighted constraint rows for the sensors both movers share.
    async fn fixed_panel_system(
        &self,
        sensors: &[Arc<SensorController>],
        movers: &[PanelPosition],
        target: &DVector<f64>,
        current: &DVector<f64>,
    ) -> Result<(DMatrix<f64>, DVector<f64>), AlignmentError> {
        if movers.len() != 2 {
            return Err(AlignmentError::InvalidArgument(format!(
                "edge {} has {} panels, the fixed-panel solve needs exactly 3",
                self.identity,
                movers.len() + 1
            )));
        }

        let mut a = DMatrix::zeros(2 * sensors.len(), 12);
        for (m, mover) in movers.iter().enumerate() {
            a.view_mut((0, 6 * m), (2 * sensors.len(), 6))
                .copy_from(&Self::response_stacked(sensors, *mover)?);
        }

        // overlap sensors see both movers and pin their relative motion
        let overlap: Vec<&Arc<SensorController>> = sensors
            .iter()
            .filter(|s| s.side_of(movers[0]).is_some() && s.side_of(movers[1]).is_some())
            .collect();
        let mut c = DMatrix::zeros(2 * overlap.len(), 12);
        let mut overlap_current = DVector::zeros(2 * overlap.len());
        let mut overlap_target = DVector::zeros(2 * overlap.len());
        for (k, sensor) in overlap.iter().enumerate() {
            for (m, mover) in movers.iter().enumerate() {
                c.view_mut((2 * k, 6 * m), (2, 6)).copy_from(&sensor.response(*mover)?);
            }
            overlap_current
                .rows_mut(2 * k, 2)
                .copy_from(&sensor.read().await?.centroid);
            overlap_target
                .rows_mut(2 * k, 2)
                .copy_from(&(sensor.aligned_readings()? - sensor.systematic_offsets()));
        }

        let mut b = DMatrix::zeros(a.nrows() + c.nrows(), 12);
        b.view_mut((0, 0), (a.nrows(), 12)).copy_from(&a);
        b.view_mut((a.nrows(), 0), (c.nrows(), 12))
            .copy_from(&(CONSTRAINT_WEIGHT * &c));
        let mut y = DVector::zeros(a.nrows() + c.nrows());
        y.rows_mut(0, a.nrows()).copy_from(&(target - current));
        y.rows_mut(a.nrows(), c.nrows())
            .copy_from(&(CONSTRAINT_WEIGHT * (overlap_target - overlap_current)));
        Ok((b, y))
    }

    async fn execute_staged(&self) -> Result<(), AlignmentError> {
        let stage = self
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                AlignmentError::InvalidState(format!(
                    "{}: no calculated motion, call align with execute=false first",
                    self.identity
                ))
            })?;
        // the stage is already cleared; a mid-dispatch failure aborts the
        // remaining panels but never restores it
        for (position, delta) in stage {
            let panel = self.panels.get(&position).ok_or_else(|| {
                AlignmentError::InvalidState(format!(
                    "{}: staged panel {position} is no longer attached",
                    self.identity
                ))
            })?;
            info!(
                "{}: moving actuators of panel {position} by {delta}",
                self.identity
            );
            panel.dispatch_delta_lengths(&delta).await?;
        }
        Ok(())
    }

    /// Measures the response matrix of this edge's sensors to one panel by
    /// stepping each actuator in turn and differencing the readings. Missed
    /// motion reported by the actuator is taken out of the step size. The
    /// panel is stepped back after every column.
    ///
    /// Rejected while the edge is Off or Busy, like [`Self::align`].
    pub async fn calibrate_response(
        &self,
        panel: PanelPosition,
        step: f64,
    ) -> Result<DMatrix<f64>, AlignmentError> {
        let prior = self.enter_busy("response calibration")?;
        let result = self.calibrate_inner(panel, step).await;
        self.leave_busy(prior);
        result
    }

    async fn calibrate_inner(
        &self,
        panel: PanelPosition,
        step: f64,
    ) -> Result<DMatrix<f64>, AlignmentError> {
        if step == 0. {
            return Err(AlignmentError::InvalidArgument("zero calibration step".into()));
        }
        let mover = self.panels.get(&panel).ok_or_else(|| {
            AlignmentError::InvalidArgument(format!(
                "panel {panel} is not part of edge {}",
                self.identity
            ))
        })?;

        let sensors = self.visible_sensors().await;
        if sensors.is_empty() {
            return Err(AlignmentError::Underdetermined { rows: 0, cols: 6 });
        }
        let (baseline, _) = Self::read_stacked(&sensors).await?;
        let mut response = DMatrix::zeros(baseline.len(), 6);

        for j in 0..6 {
            if self.state() == DeviceState::Off {
                return Err(AlignmentError::InvalidState(format!(
                    "{}: stopped during response calibration",
                    self.identity
                )));
            }
            info!("{}: stepping actuator {} by {step} mm", self.identity, j + 1);
            let mut delta = [0f64; 6];
            delta[j] = step;
            mover.dispatch_delta_lengths(&ActuatorLengths(delta)).await?;
            mover.wait_done().await?;
            let missed = mover.missed_delta(j).await?;
            let (stepped, _) = Self::read_stacked(&sensors).await?;

            delta[j] = -step;
            mover.dispatch_delta_lengths(&ActuatorLengths(delta)).await?;
            mover.wait_done().await?;

            response.set_column(j, &((stepped - &baseline) / (step - missed)));
            debug!("{}: response column {} measured", self.identity, j + 1);
        }
        info!(
            "{}: response matrix for panel {panel}:\n{response}",
            self.identity
        );
        Ok(response)
    }

    /// Stops every panel of this edge.
    pub async fn stop(&self) -> Result<(), AlignmentError> {
        self.set_state(DeviceState::Off);
        for panel in self.panels.values() {
            panel.stop().await?;
        }
        Ok(())
    }
}
