//! Whole-mirror alignment: selection, staged motion, the sector and ring
//! solves and the sequential edge walker.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix6, Vector2, Vector3};
use pas_geometry::{
    apply_pose_delta, Direction, Edge, MirrorFrames, MirrorId, PanelPosition,
};
use pas_interface::{DeviceState, Identity, Polling, SensorReading};
use pas_kinematics::{ActuatorLengths, PadCoordinates, NOMINAL_ACTUATOR_LENGTH, Solver};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::edge::EdgeController;
use crate::fit::fit_rigid_motion;
use crate::panel::{lengths_from_segment, PanelController};
use crate::sensor::SensorController;
use crate::solve::least_squares;
use crate::AlignmentError;

/// How many calculate/execute rounds the sequential walker gives one edge
/// before declaring it non-convergent.
pub const MAX_EDGE_ITERATIONS: usize = 20;

/// Which operation produced a staged whole-mirror motion. An execute call
/// must carry the same tag as the calculate call that staged it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationTag {
    MoveToCoords,
    AlignSector,
    AlignRing,
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationTag::MoveToCoords => "move-to-coords",
            OperationTag::AlignSector => "align-sector",
            OperationTag::AlignRing => "align-ring",
        };
        write!(f, "{name}")
    }
}

/// How a sequential alignment walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Every requested edge converged.
    Done,
    /// The mirror left the On state mid-walk.
    Aborted,
}

struct MirrorStage {
    op: OperationTag,
    moves: Vec<(PanelPosition, ActuatorLengths)>,
}

#[derive(Default)]
struct Selection {
    panels: BTreeSet<PanelPosition>,
    edges: BTreeSet<String>,
    sensors: BTreeSet<i32>,
}

pub struct MirrorController {
    mirror: MirrorId,
    identity: Identity,
    frames: MirrorFrames,
    panels: BTreeMap<PanelPosition, Arc<PanelController>>,
    edges: BTreeMap<String, Arc<EdgeController>>,
    sensors: BTreeMap<i32, Arc<SensorController>>,
    selection: Mutex<Selection>,
    staged: Mutex<Option<MirrorStage>>,
    cur_coords: Mutex<[f64; 6]>,
    state: Mutex<DeviceState>,
    polling: Polling,
}

impl MirrorController {
    pub fn new(
        mirror: MirrorId,
        panels: Vec<Arc<PanelController>>,
        edges: Vec<Arc<EdgeController>>,
        sensors: Vec<Arc<SensorController>>,
        polling: Polling,
    ) -> Result<Arc<Self>, AlignmentError> {
        let frames = MirrorFrames::new(mirror)?;
        Ok(Arc::new(Self {
            mirror,
            identity: Identity {
                name: format!("Mirror_{}", mirror.position()),
                position: mirror.position(),
                serial: 0,
                address: mirror.to_string(),
            },
            frames,
            panels: panels.into_iter().map(|p| (p.position(), p)).collect(),
            edges: edges
                .into_iter()
                .map(|e| (e.address().to_string(), e))
                .collect(),
            sensors: sensors.into_iter().map(|s| (s.serial(), s)).collect(),
            selection: Mutex::new(Selection::default()),
            staged: Mutex::new(None),
            cur_coords: Mutex::new([0.; 6]),
            state: Mutex::new(DeviceState::On),
            polling,
        }))
    }

    pub fn mirror(&self) -> MirrorId {
        self.mirror
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn frames(&self) -> &MirrorFrames {
        &self.frames
    }

    pub fn panel(&self, position: PanelPosition) -> Option<&Arc<PanelController>> {
        self.panels.get(&position)
    }

    pub fn edge(&self, address: &str) -> Option<&Arc<EdgeController>> {
        self.edges.get(address)
    }

    pub fn sensor(&self, serial: i32) -> Option<&Arc<SensorController>> {
        self.sensors.get(&serial)
    }

    fn own_state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Off once stopped, Busy while any child panel is moving, otherwise On.
    pub async fn state(&self) -> DeviceState {
        let own = self.own_state();
        if own == DeviceState::Off {
            return own;
        }
        for panel in self.panels.values() {
            if panel.state().await == DeviceState::Busy {
                return DeviceState::Busy;
            }
        }
        own
    }

    /// Last fitted whole-mirror pose `[x, y, z, rx, ry, rz]` (mm, rad).
    pub fn coords(&self) -> [f64; 6] {
        *self.cur_coords.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Motion operations are rejected while the mirror is stopped or any
    /// panel is still moving.
    async fn ensure_ready(&self, op: &str) -> Result<(), AlignmentError> {
        let state = self.state().await;
        if matches!(state, DeviceState::Off | DeviceState::Busy) {
            return Err(AlignmentError::InvalidState(format!(
                "{}: mirror is {state}, {op} rejected",
                self.identity
            )));
        }
        Ok(())
    }

    /* =========== selection =========== */

    pub fn select_all(&self) {
        let mut sel = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        sel.panels = self.panels.keys().copied().collect();
        sel.edges = self.edges.keys().cloned().collect();
        sel.sensors = self.sensors.keys().copied().collect();
    }

    /// Replaces the panel selection from an operator-supplied list of panel
    /// positions. Unknown entries are logged and skipped.
    pub fn set_panel_selection(&self, selection: &str) {
        let mut picked = BTreeSet::new();
        for token in selection_tokens(selection) {
            match token.parse::<u32>().ok().and_then(|raw| {
                PanelPosition::from_raw(raw)
                    .ok()
                    .filter(|p| self.panels.contains_key(p))
            }) {
                Some(pos) => {
                    picked.insert(pos);
                    info!("{}: selected panel {pos}", self.identity);
                }
                None => warn!(
                    "{}: unable to find panel \"{token}\", skipping",
                    self.identity
                ),
            }
        }
        self.selection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .panels = picked;
    }

    /// Replaces the edge selection from a list of edge addresses.
    pub fn set_edge_selection(&self, selection: &str) {
        let mut picked = BTreeSet::new();
        for token in selection_tokens(selection) {
            if self.edges.contains_key(&token) {
                info!("{}: selected edge {token}", self.identity);
                picked.insert(token);
            } else {
                warn!("{}: unable to find edge \"{token}\", skipping", self.identity);
            }
        }
        self.selection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .edges = picked;
    }

    /// Replaces the sensor selection from a list of sensor serials.
    pub fn set_sensor_selection(&self, selection: &str) {
        let mut picked = BTreeSet::new();
        for token in selection_tokens(selection) {
            match token
                .parse::<i32>()
                .ok()
                .filter(|serial| self.sensors.contains_key(serial))
            {
                Some(serial) => {
                    info!("{}: selected sensor {serial}", self.identity);
                    picked.insert(serial);
                }
                None => warn!(
                    "{}: unable to find sensor \"{token}\", skipping",
                    self.identity
                ),
            }
        }
        self.selection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sensors = picked;
    }

    fn selected_panels(&self) -> Vec<Arc<PanelController>> {
        let sel = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        sel.panels
            .iter()
            .filter_map(|p| self.panels.get(p).cloned())
            .collect()
    }

    fn selected_sensors(&self) -> Vec<Arc<SensorController>> {
        let sel = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        sel.sensors
            .iter()
            .filter_map(|s| self.sensors.get(s).cloned())
            .collect()
    }

    /* =========== readout =========== */

    /// Reads the pose of every selected panel from its actuator lengths.
    pub async fn read_position_all(
        &self,
    ) -> Result<Vec<(PanelPosition, pas_kinematics::Pose)>, AlignmentError> {
        let mut out = Vec::new();
        for panel in self.selected_panels() {
            let (pose, pads) = panel.read_position().await?;
            debug!(
                "{}: panel {} pads in the mirror frame: {:?}",
                self.identity,
                panel.position(),
                [
                    self.frames.to_mirror_frame(panel.position(), &pads.pad(0)),
                    self.frames.to_mirror_frame(panel.position(), &pads.pad(1)),
                    self.frames.to_mirror_frame(panel.position(), &pads.pad(2)),
                ]
            );
            out.push((panel.position(), pose));
        }
        Ok(out)
    }

    /// Reads every selected sensor once.
    pub async fn read_sensors(&self) -> Result<Vec<(i32, SensorReading)>, AlignmentError> {
        let sensors = self.selected_sensors();
        if sensors.is_empty() {
            return Err(AlignmentError::InvalidArgument(
                "no sensors selected, nothing to read".into(),
            ));
        }
        let mut out = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            if self.own_state() == DeviceState::Off {
                warn!("{}: stop detected, readings stopped", self.identity);
                break;
            }
            out.push((sensor.serial(), sensor.read().await?));
        }
        Ok(out)
    }

    /// Sets the collision safety radius on every sensor [px].
    pub async fn set_safety_radius(&self, radius: f64) -> Result<(), AlignmentError> {
        if radius <= 0. {
            return Err(AlignmentError::InvalidArgument(format!(
                "safety radius {radius} must be positive"
            )));
        }
        for sensor in self.sensors.values() {
            sensor.set_safety_radius(radius).await?;
        }
        Ok(())
    }

    /// Fits the rigid whole-mirror pose from every panel's measured pad
    /// coordinates against its nominal ones, and remembers it.
    pub async fn update_coords(&self) -> Result<[f64; 6], AlignmentError> {
        let mut reference = Vec::with_capacity(3 * self.panels.len());
        let mut measured = Vec::with_capacity(3 * self.panels.len());
        let solver = Solver::default();
        for panel in self.panels.values() {
            let pos = panel.position();
            let (_, nominal) = panel
                .platform()
                .forward(&ActuatorLengths::uniform(NOMINAL_ACTUATOR_LENGTH), &solver)?;
            let (_, current) = panel.read_position().await?;
            for pad in 0..3 {
                reference.push(self.frames.to_mirror_frame(pos, &nominal.pad(pad)));
                measured.push(self.frames.to_mirror_frame(pos, &current.pad(pad)));
            }
        }
        let coords = fit_rigid_motion(&reference, &measured)?;
        info!(
            "{}: fitted mirror pose [{:.4}, {:.4}, {:.4}, {:.6}, {:.6}, {:.6}]",
            self.identity, coords[0], coords[1], coords[2], coords[3], coords[4], coords[5]
        );
        *self.cur_coords.lock().unwrap_or_else(|e| e.into_inner()) = coords;
        Ok(coords)
    }

    /* =========== staged motion =========== */

    fn stage(&self, op: OperationTag, moves: Vec<(PanelPosition, ActuatorLengths)>) {
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(MirrorStage { op, moves });
        info!(
            "{}: {op} calculation done, call again with execute to apply the motion",
            self.identity
        );
    }

    async fn execute_staged(&self, op: OperationTag) -> Result<(), AlignmentError> {
        let stage = {
            let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
            match staged.take() {
                Some(s) if s.op == op => s,
                Some(s) => {
                    // a mismatched execute leaves the stage in place
                    let err = AlignmentError::InvalidState(format!(
                        "{}: staged motion was calculated by {}, not {op}",
                        self.identity, s.op
                    ));
                    *staged = Some(s);
                    return Err(err);
                }
                None => {
                    return Err(AlignmentError::InvalidState(format!(
                        "{}: no calculated motion, call {op} with execute=false first",
                        self.identity
                    )))
                }
            }
        };
        // the stage is cleared at this point; a dispatch failure aborts the
        // remaining panels but never restores it
        for (position, delta) in stage.moves {
            if self.own_state() == DeviceState::Off {
                warn!("{}: stop detected, aborting dispatch", self.identity);
                break;
            }
            let panel = self.panels.get(&position).ok_or_else(|| {
                AlignmentError::InvalidState(format!(
                    "{}: staged panel {position} is no longer attached",
                    self.identity
                ))
            })?;
            panel.dispatch_delta_lengths(&delta).await?;
        }
        Ok(())
    }

    /* =========== whole-mirror motion =========== */

    /// Moves the whole mirror rigidly to the target pose, two-phase.
    ///
    /// For every panel: pad coordinates go from the panel frame to the
    /// mirror frame, get the rigid delta applied, come back, and the inverse
    /// kinematics yields the actuator deltas.
    pub async fn move_to_coords(
        &self,
        target: &[f64; 6],
        execute: bool,
    ) -> Result<(), AlignmentError> {
        self.ensure_ready("move-to-coords").await?;
        if execute {
            return self.execute_staged(OperationTag::MoveToCoords).await;
        }

        let current = self.update_coords().await?;
        let mut delta = [0f64; 6];
        for i in 0..6 {
            delta[i] = target[i] - current[i];
        }
        info!(
            "{}: rigid motion by [{:.4}, {:.4}, {:.4}, {:.6}, {:.6}, {:.6}]",
            self.identity, delta[0], delta[1], delta[2], delta[3], delta[4], delta[5]
        );

        let mut moves = Vec::with_capacity(self.panels.len());
        for panel in self.panels.values() {
            let pos = panel.position();
            let (_, pads) = panel.read_position().await?;
            let mut moved = [Vector3::zeros(); 3];
            for pad in 0..3 {
                let trf = self.frames.to_mirror_frame(pos, &pads.pad(pad));
                moved[pad] = self
                    .frames
                    .to_panel_frame(pos, &apply_pose_delta(&trf, &delta));
            }
            let target_lengths = panel.platform().lengths_from_pads(&PadCoordinates(moved));
            let current_lengths = panel.actuator_lengths().await?;
            let mut delta_lengths = [0f64; 6];
            for i in 0..6 {
                delta_lengths[i] = target_lengths[i] - current_lengths[i];
            }
            let delta_lengths = ActuatorLengths(delta_lengths);
            info!(
                "{}: panel {pos} calculated actuator motion {delta_lengths}",
                self.identity
            );
            moves.push((pos, delta_lengths));
        }
        self.stage(OperationTag::MoveToCoords, moves);
        Ok(())
    }

    /* =========== sector alignment =========== */

    /// Aligns an arbitrary selection of panels against an arbitrary
    /// selection of sensors, two-phase.
    ///
    /// Sensors seen by two selected panels are internal to the sector; they
    /// are added automatically unless the caller already selected one.
    pub async fn align_sector(
        &self,
        align_frac: f64,
        execute: bool,
    ) -> Result<(), AlignmentError> {
        self.ensure_ready("align-sector").await?;
        check_align_frac(align_frac)?;
        if execute {
            return self.execute_staged(OperationTag::AlignSector).await;
        }

        let movers = self.selected_panels();
        if movers.is_empty() {
            return Err(AlignmentError::InvalidArgument(
                "no panels selected for sector alignment".into(),
            ));
        }

        let mut align_sensors = Vec::new();
        for sensor in self.selected_sensors() {
            if sensor.is_visible().await {
                align_sensors.push(sensor);
            } else {
                warn!(
                    "{}: selected sensor {} is not visible, ignoring it",
                    self.identity,
                    sensor.identity()
                );
            }
        }

        // sensors watching two movers constrain the sector internally
        let mut user_overlap = false;
        let mut overlap = Vec::new();
        for sensor in self.sensors.values() {
            let seen = movers
                .iter()
                .filter(|p| sensor.side_of(p.position()).is_some())
                .count();
            if seen == 2 {
                if align_sensors.iter().any(|s| s.serial() == sensor.serial()) {
                    user_overlap = true;
                } else {
                    overlap.push(Arc::clone(sensor));
                }
            }
        }
        if user_overlap {
            info!("{}: using user-selected internal sensors", self.identity);
        } else if overlap.is_empty() {
            warn!(
                "{}: no internal sensors found; expected only for a single-panel sector",
                self.identity
            );
        } else {
            info!(
                "{}: no user-selected internal sensors, adding all {} visible ones",
                self.identity,
                overlap.len()
            );
            for sensor in overlap {
                if sensor.is_visible().await {
                    align_sensors.push(sensor);
                }
            }
        }

        let n_rows = 2 * align_sensors.len();
        let n_cols = 6 * movers.len();
        let mut b = DMatrix::zeros(n_rows, n_cols);
        let mut y = DVector::zeros(n_rows);
        for (m, sensor) in align_sensors.iter().enumerate() {
            let reading = sensor.read().await?;
            let target = sensor.aligned_readings()? - sensor.systematic_offsets();
            y.rows_mut(2 * m, 2).copy_from(&(target - reading.centroid));
            for (p, mover) in movers.iter().enumerate() {
                if sensor.side_of(mover.position()).is_some() {
                    b.view_mut((2 * m, 6 * p), (2, 6))
                        .copy_from(&sensor.response(mover.position())?);
                }
            }
        }

        let mut x = least_squares(&b, &y)?;
        x *= align_frac;
        debug!("{}: sector solution:\n{x}", self.identity);

        let mut moves = Vec::with_capacity(movers.len());
        for (p, mover) in movers.iter().enumerate() {
            let delta = lengths_from_segment(&x, 6 * p);
            mover.check_for_collision(&delta).await?;
            info!(
                "{}: will move panel {} actuators by {delta}",
                self.identity,
                mover.position()
            );
            moves.push((mover.position(), delta));
        }
        self.stage(OperationTag::AlignSector, moves);
        Ok(())
    }

    /* =========== ring alignment =========== */

    /// Aligns a full closed ring while holding one panel fixed, two-phase.
    ///
    /// Walks the ring edge by edge, accumulating each edge's response into a
    /// block-cyclic global system. The fixed panel's columns are replaced by
    /// an identity block for a per-sensor-slot systematic offset, solved
    /// simultaneously with every other panel's correction and written back
    /// to the sensors.
    pub async fn align_ring(
        &self,
        fixed: PanelPosition,
        align_frac: f64,
        execute: bool,
    ) -> Result<(), AlignmentError> {
        self.ensure_ready("align-ring").await?;
        check_align_frac(align_frac)?;
        if execute {
            return self.execute_staged(OperationTag::AlignRing).await;
        }
        if !self.panels.contains_key(&fixed) {
            return Err(AlignmentError::InvalidArgument(format!(
                "fixed panel {fixed} is not attached to this mirror"
            )));
        }

        // the whole ring must be present before anything moves
        let mut cur = fixed;
        loop {
            let next = cur.neighbor(Direction::Positive);
            if !self.panels.contains_key(&next) {
                return Err(AlignmentError::InvalidArgument(format!(
                    "panel {next} of the ring is not attached to this mirror"
                )));
            }
            if next == fixed {
                break;
            }
            cur = next;
        }

        let n = fixed.ring_panels() as usize;
        info!(
            "{}: traversing the ring of {n} panels from fixed panel {fixed}",
            self.identity
        );

        // one pass over the ring collecting every edge's readings and blocks
        struct EdgeBlock {
            misalign: DVector<f64>,
            resp_cur: DMatrix<f64>,
            resp_next: DMatrix<f64>,
        }
        let mut blocks = Vec::with_capacity(n);
        let mut edges_to_fit = Vec::with_capacity(n);
        let mut movers = Vec::with_capacity(n - 1);
        let mut cur = fixed;
        for _ in 0..n {
            let next = cur.neighbor(Direction::Positive);
            let address = Edge::between(cur, next).to_string();
            let edge = self.edges.get(&address).ok_or_else(|| {
                AlignmentError::InvalidArgument(format!(
                    "ring edge {address} is not attached to this mirror"
                ))
            })?;
            info!("{}: next edge to align is {address}", self.identity);
            let (current, _) = edge.current_readings().await?;
            let aligned = edge.aligned_readings().await?;
            blocks.push(EdgeBlock {
                misalign: aligned - current,
                resp_cur: edge.response_matrix(cur).await?,
                resp_next: edge.response_matrix(next).await?,
            });
            edges_to_fit.push(Arc::clone(edge));
            if next != fixed {
                movers.push(next);
            }
            cur = next;
        }

        // diagnostic closure operator over the ring; each step folds in the
        // ratio of this edge's leading response to the previous edge's
        let mut t = Matrix6::<f64>::identity();
        let mut prev: Option<Matrix6<f64>> = None;
        for block in &blocks {
            let square = |m: &DMatrix<f64>| -> Option<Matrix6<f64>> {
                (m.nrows() == 6).then(|| Matrix6::from_iterator(m.iter().copied()))
            };
            if let (Some(p), Some(c)) = (prev.and_then(|p| p.try_inverse()), square(&block.resp_cur))
            {
                t = Matrix6::identity() - c * p * t;
            }
            prev = square(&block.resp_next);
        }
        debug!(
            "{}: ring closure operator norm {:.4}",
            self.identity,
            t.norm()
        );

        let total_rows: usize = blocks.iter().map(|b| b.misalign.len()).sum();
        let mut glob = DMatrix::zeros(total_rows, 6 * n);
        let mut misalign = DVector::zeros(total_rows);
        let mut row = 0;
        for (i, block) in blocks.iter().enumerate() {
            let rows = block.misalign.len();
            misalign.rows_mut(row, rows).copy_from(&block.misalign);
            glob.view_mut((row, 6 * i), (rows, 6)).copy_from(&block.resp_cur);
            glob.view_mut((row, 6 * ((i + 1) % n)), (rows, 6))
                .copy_from(&block.resp_next);
            // the fixed panel does not move; its columns carry the
            // systematic-offset term instead, one slot per sensor axis
            glob.view_mut((row, 0), (rows, 6)).fill(0.);
            for r in 0..rows.min(6) {
                glob[(row + r, r)] = 1.;
            }
            row += rows;
        }

        let x = least_squares(&glob, &misalign)?;
        let systematic = x.rows(0, 6).into_owned();
        info!(
            "{}: calculated systematic offsets:\n{systematic}",
            self.identity
        );
        // distribute over the same visible-sensor ordering the system rows
        // were assembled from; an invisible sensor keeps its old offsets
        for edge in &edges_to_fit {
            for (k, sensor) in edge.visible_sensors().await.iter().take(3).enumerate() {
                sensor.set_systematic_offsets(Vector2::new(
                    systematic[2 * k],
                    systematic[2 * k + 1],
                ));
            }
        }

        if align_frac < 1. {
            info!("{}: fractional motion of {align_frac} requested", self.identity);
        }
        let mut moves = Vec::with_capacity(movers.len());
        for (m, mover) in movers.iter().enumerate() {
            let delta = lengths_from_segment(&(&x * align_frac), 6 * (m + 1));
            if let Some(panel) = self.panels.get(mover) {
                panel.check_for_collision(&delta).await?;
            }
            info!(
                "{}: panel {mover} calculated change in actuator lengths {delta}",
                self.identity
            );
            moves.push((*mover, delta));
        }
        self.stage(OperationTag::AlignRing, moves);
        Ok(())
    }

    /* =========== sequential alignment =========== */

    /// Walks the ring from `start` to `end` in `dir`, converging each edge
    /// in turn by repeated calculate/execute rounds, re-touching every
    /// already-visited edge at each step.
    pub async fn align_sequential(
        &self,
        start: &str,
        end: &str,
        dir: Direction,
    ) -> Result<WalkOutcome, AlignmentError> {
        self.ensure_ready("align-sequential").await?;
        for address in [start, end] {
            if !self.edges.contains_key(address) {
                return Err(AlignmentError::InvalidArgument(format!(
                    "edge {address} is not attached to this mirror"
                )));
            }
        }

        // collect the ordered chain of edges before anything moves
        let mut chain = vec![start.to_string()];
        let mut cur: Edge = start.parse()?;
        while chain.last().map(String::as_str) != Some(end) {
            let next = cur.ring_neighbor(dir)?;
            let address = next.to_string();
            if chain.contains(&address) {
                return Err(AlignmentError::TopologyExhausted(format!(
                    "went around the full ring from {start} without reaching {end}"
                )));
            }
            if !self.edges.contains_key(&address) {
                return Err(AlignmentError::TopologyExhausted(format!(
                    "next edge {address} is not attached to this mirror"
                )));
            }
            chain.push(address);
            cur = next;
        }
        info!(
            "{}: edges to align sequentially: {}",
            self.identity,
            chain.join(", ")
        );

        let mut to_align: VecDeque<String> = VecDeque::new();
        for address in chain {
            if self.own_state() == DeviceState::Off {
                warn!("{}: stop detected, walk aborted", self.identity);
                return Ok(WalkOutcome::Aborted);
            }
            to_align.push_front(address);
            info!(
                "{}: aligning edge {} and all previous edges",
                self.identity,
                to_align.front().map(String::as_str).unwrap_or_default()
            );
            for address in &to_align {
                if !self.converge_edge(address, dir).await? {
                    return Ok(WalkOutcome::Aborted);
                }
            }
        }
        Ok(WalkOutcome::Done)
    }

    /// One edge's convergence loop; `Ok(false)` means the mirror was stopped.
    async fn converge_edge(&self, address: &str, dir: Direction) -> Result<bool, AlignmentError> {
        let edge = self.edges.get(address).ok_or_else(|| {
            AlignmentError::InvalidArgument(format!("edge {address} is not attached"))
        })?;
        // the trailing panel moves, aligning itself to the leading one
        let (mover, _) = edge.edge().ordered_panels(dir)?;
        let panel = self.panels.get(&mover).ok_or_else(|| {
            AlignmentError::InvalidArgument(format!(
                "moving panel {mover} of edge {address} is not attached"
            ))
        })?;

        for iteration in 1..=MAX_EDGE_ITERATIONS {
            if self.own_state() == DeviceState::Off {
                return Ok(false);
            }
            debug!(
                "{}: edge {address} alignment iteration {iteration}",
                self.identity
            );
            edge.align(mover, 1., true, false).await?;
            edge.align(mover, 1., true, true).await?;
            panel.wait_done().await?;
            if edge.is_aligned() {
                info!("{}: edge {address} aligned", self.identity);
                return Ok(true);
            }
        }
        Err(AlignmentError::NumericalFailure(format!(
            "edge {address} did not converge within {MAX_EDGE_ITERATIONS} iterations"
        )))
    }

    /// Stops all motion and parks the mirror Off until restarted.
    pub async fn stop(&self) -> Result<(), AlignmentError> {
        warn!("{}: stopping motion of all edges and panels", self.identity);
        self.set_state(DeviceState::Off);
        for edge in self.edges.values() {
            edge.stop().await?;
        }
        Ok(())
    }

    /// Returns the mirror to service after a stop.
    pub fn restart(&self) {
        self.set_state(DeviceState::On);
    }

    pub fn polling(&self) -> &Polling {
        &self.polling
    }
}

fn check_align_frac(align_frac: f64) -> Result<(), AlignmentError> {
    if 0. < align_frac && align_frac <= 1. {
        Ok(())
    } else {
        Err(AlignmentError::InvalidArgument(format!(
            "align_frac {align_frac} outside (0, 1]"
        )))
    }
}

/// Splits an operator-supplied selection list on the accepted delimiters,
/// tolerating optional surrounding brackets.
fn selection_tokens(selection: &str) -> Vec<String> {
    let trimmed = selection.trim();
    let trimmed = trimmed.strip_prefix('[').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(']').unwrap_or(trimmed);
    trimmed
        .split(|c: char| " ,;:\"'{}".contains(c))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_tokens_tolerate_messy_input() {
        assert_eq!(
            selection_tokens("[1111, 1112; 1113]"),
            vec!["1111", "1112", "1113"]
        );
        assert_eq!(
            selection_tokens("  '2111+2112'  {2112+2121} "),
            vec!["2111+2112", "2112+2121"]
        );
        assert!(selection_tokens("[]").is_empty());
    }

    #[test]
    fn align_frac_bounds() {
        assert!(check_align_frac(1.).is_ok());
        assert!(check_align_frac(0.3).is_ok());
        assert!(check_align_frac(0.).is_err());
        assert!(check_align_frac(1.5).is_err());
        assert!(check_align_frac(-0.1).is_err());
    }
}
