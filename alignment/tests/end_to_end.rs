//! Closed-loop alignment against the simulated plant.

use nalgebra::{SMatrix, Vector2};
use pas_alignment::simulator::{SimCalibration, SimPanel, SimSensor};
use pas_alignment::{
    AlignmentError, EdgeController, MirrorController, PanelController, SensorController,
    WalkOutcome,
};
use pas_geometry::{Direction, Edge, MirrorId, PanelPosition};
use pas_interface::{CalibrationStore, DeviceProxy, DeviceState, Identity, Polling, Side};
use pas_kinematics::NOMINAL_ACTUATOR_LENGTH;
use std::collections::HashMap;
use std::sync::Arc;

const CENTER: Vector2<f64> = Vector2::new(160., 120.);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Response rows `2k` and `2k+1` (mod 6) of a diagonal sensitivity, so any
/// three consecutive sensors of an edge stack to an invertible 6x6 system.
fn laser_response(k: usize) -> SMatrix<f64, 2, 6> {
    let mut m = SMatrix::zeros();
    m[(0, 2 * k % 6)] = 1.;
    m[(1, (2 * k + 1) % 6)] = 1.;
    m
}

fn webcam_response(k: usize) -> SMatrix<f64, 2, 6> {
    -0.5 * laser_response(k)
}

struct Rig {
    mirror: Arc<MirrorController>,
    sim_panels: HashMap<u32, Arc<SimPanel>>,
    sim_sensors: HashMap<i32, Arc<SimSensor>>,
    edges: HashMap<String, Arc<EdgeController>>,
    store: Arc<SimCalibration>,
}

/// Wires simulated panels and sensors into a controller tree. Every edge
/// gets `sensors_per_edge` sensors, laser on its lower-numbered panel,
/// webcam on the other, serials `10 * edge_index + k + 1`.
fn build_rig(
    mirror_id: MirrorId,
    panel_raws: &[u32],
    edge_pairs: &[(u32, u32)],
    sensors_per_edge: usize,
    aligned: Vector2<f64>,
) -> Rig {
    init_logs();
    let polling = Polling::default();

    let store = Arc::new(SimCalibration::default());
    for (i, _) in edge_pairs.iter().enumerate() {
        for k in 0..sensors_per_edge {
            let serial = (10 * i + k + 1) as i32;
            store.insert_aligned(serial, aligned);
            store.insert_response(serial, Side::Laser, laser_response(k));
            store.insert_response(serial, Side::Webcam, webcam_response(k));
        }
    }

    let mut sim_panels = HashMap::new();
    let mut panel_ctrls: HashMap<u32, Arc<PanelController>> = HashMap::new();
    for &raw in panel_raws {
        let position = PanelPosition::from_raw(raw).unwrap();
        let sim = SimPanel::new(position);
        let device: Arc<dyn DeviceProxy> = sim.clone();
        sim_panels.insert(raw, sim);
        panel_ctrls.insert(raw, PanelController::new(position, device, polling));
    }

    let mut sim_sensors = HashMap::new();
    let mut edge_ctrls = HashMap::new();
    let mut sensor_ctrls = Vec::new();
    for (i, &(a, b)) in edge_pairs.iter().enumerate() {
        let edge = Edge::between(
            PanelPosition::from_raw(a).unwrap(),
            PanelPosition::from_raw(b).unwrap(),
        );
        let lo = edge.panels()[0];
        let hi = edge.panels()[1];
        let mut sensors = Vec::new();
        for k in 0..sensors_per_edge {
            let serial = (10 * i + k + 1) as i32;
            let sim = SimSensor::new(
                serial,
                Arc::clone(&sim_panels[&lo.as_u32()]),
                laser_response(k),
                Arc::clone(&sim_panels[&hi.as_u32()]),
                webcam_response(k),
                aligned,
            );
            sim_sensors.insert(serial, Arc::clone(&sim));
            let device: Arc<dyn DeviceProxy> = sim;
            let sensor = SensorController::new(
                Identity {
                    name: format!("Sensor_{serial}"),
                    position: k as u32,
                    serial,
                    address: String::new(),
                },
                device,
                Arc::clone(&store) as Arc<dyn CalibrationStore>,
                lo,
                hi,
            );
            sensor_ctrls.push(Arc::clone(&sensor));
            sensors.push(sensor);
        }
        let controller = EdgeController::build(
            edge.clone(),
            sensors,
            vec![
                Arc::clone(&panel_ctrls[&lo.as_u32()]),
                Arc::clone(&panel_ctrls[&hi.as_u32()]),
            ],
        );
        edge_ctrls.insert(edge.to_string(), controller);
    }

    let mirror = MirrorController::new(
        mirror_id,
        panel_ctrls.values().cloned().collect(),
        edge_ctrls.values().cloned().collect(),
        sensor_ctrls,
        polling,
    )
    .unwrap();

    Rig {
        mirror,
        sim_panels,
        sim_sensors,
        edges: edge_ctrls,
        store,
    }
}

fn assert_nominal(sim: &SimPanel, tol: f64) {
    for (i, l) in sim.lengths().iter().enumerate() {
        assert!(
            (l - NOMINAL_ACTUATOR_LENGTH).abs() < tol,
            "actuator {i} off nominal by {}",
            l - NOMINAL_ACTUATOR_LENGTH
        );
    }
}

#[tokio::test]
async fn edge_alignment_converges_on_a_misaligned_panel() -> anyhow::Result<()> {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    let mover = PanelPosition::from_raw(2111)?;
    rig.sim_panels[&2111].displace(&[0.4, -0.3, 0.2, 0.1, -0.2, 0.3]);

    let edge = &rig.edges["2111+2112"];
    edge.align(mover, 1., true, false).await?;
    assert!(!edge.is_aligned(), "0.4 mm off must not count as aligned");
    edge.align(mover, 1., true, true).await?;
    assert_nominal(&rig.sim_panels[&2111], 1e-6);

    edge.align(mover, 1., true, false).await?;
    assert!(edge.is_aligned());
    Ok(())
}

#[tokio::test]
async fn executing_twice_needs_a_second_calculation() {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    let mover = PanelPosition::from_raw(2111).unwrap();
    let edge = &rig.edges["2111+2112"];

    // execute with nothing staged
    let err = edge.align(mover, 1., true, true).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));

    edge.align(mover, 1., true, false).await.unwrap();
    edge.align(mover, 1., true, true).await.unwrap();
    // the stage is consumed by the execute
    let err = edge.align(mover, 1., true, true).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
}

#[tokio::test]
async fn a_stopped_edge_rejects_alignment() {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    let mover = PanelPosition::from_raw(2111).unwrap();
    rig.sim_panels[&2111].displace(&[0.4, 0., 0., 0., 0., 0.]);

    let edge = &rig.edges["2111+2112"];
    edge.stop().await.unwrap();
    assert_eq!(edge.state(), DeviceState::Off);

    let err = edge.align(mover, 1., true, false).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
    // rejected before anything was read or moved, and still Off
    assert!(rig.store.recorded().is_empty());
    assert_eq!(edge.state(), DeviceState::Off);

    // back in service after an explicit restart
    edge.set_state(DeviceState::On);
    edge.align(mover, 1., true, false).await.unwrap();
    edge.align(mover, 1., true, true).await.unwrap();
    assert_nominal(&rig.sim_panels[&2111], 1e-6);
}

#[tokio::test]
async fn a_stopped_mirror_rejects_motion_operations() {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    rig.mirror.stop().await.unwrap();

    rig.mirror.set_panel_selection("2111");
    rig.mirror.set_sensor_selection("1, 2, 3");
    let err = rig.mirror.align_sector(1., false).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
    let err = rig
        .mirror
        .move_to_coords(&[0.1, 0., 0., 0., 0., 0.], false)
        .await
        .unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
    let err = rig
        .mirror
        .align_sequential("2111+2112", "2111+2112", Direction::Negative)
        .await
        .unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
    assert_nominal(&rig.sim_panels[&2111], 1e-12);
}

#[tokio::test]
async fn one_sensor_cannot_determine_six_actuators() {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        1,
        CENTER,
    );
    let mover = PanelPosition::from_raw(2111).unwrap();
    let err = rig.edges["2111+2112"]
        .align(mover, 1., true, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AlignmentError::Underdetermined { rows: 2, cols: 6 }
    ));
}

#[tokio::test]
async fn safety_radius_vetoes_an_off_center_target() {
    // the calibrated target sits 40 px off the camera center
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        Vector2::new(200., 120.),
    );
    rig.mirror.set_safety_radius(10.).await.unwrap();

    let mover = PanelPosition::from_raw(2111).unwrap();
    let edge = &rig.edges["2111+2112"];
    let err = edge.align(mover, 1., true, false).await.unwrap_err();
    assert!(matches!(err, AlignmentError::SafetyViolation { .. }));
    // nothing was staged
    let err = edge.align(mover, 1., true, true).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
}

#[tokio::test]
async fn sequential_walk_aligns_a_chain_of_edges() -> anyhow::Result<()> {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112, 2121, 2122, 2131],
        &[(2111, 2112), (2112, 2121), (2121, 2122), (2122, 2131)],
        3,
        CENTER,
    );
    rig.sim_panels[&2111].displace(&[0.5, 0.2, -0.4, 0.1, 0.3, -0.2]);

    let outcome = rig
        .mirror
        .align_sequential("2111+2112", "2122+2131", Direction::Negative)
        .await?;
    assert_eq!(outcome, WalkOutcome::Done);
    assert_nominal(&rig.sim_panels[&2111], 1e-6);
    for edge in rig.edges.values() {
        assert!(edge.is_aligned(), "edge {} not aligned", edge.address());
    }
    Ok(())
}

#[tokio::test]
async fn sector_alignment_moves_the_selected_panel() -> anyhow::Result<()> {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    rig.sim_panels[&2111].displace(&[-0.3, 0.2, 0.1, -0.1, 0.2, -0.2]);

    rig.mirror.set_panel_selection("2111");
    rig.mirror.set_sensor_selection("1, 2, 3");
    rig.mirror.align_sector(1., false).await?;
    rig.mirror.align_sector(1., true).await?;
    assert_nominal(&rig.sim_panels[&2111], 1e-6);
    Ok(())
}

fn secondary_ring_one() -> (Vec<u32>, Vec<(u32, u32)>) {
    let panels = vec![2111, 2112, 2121, 2122, 2131, 2132, 2141, 2142];
    let edges = panels
        .iter()
        .enumerate()
        .map(|(i, &p)| (p, panels[(i + 1) % panels.len()]))
        .collect();
    (panels, edges)
}

#[tokio::test]
async fn ring_alignment_holds_the_fixed_panel_and_closes_the_ring() -> anyhow::Result<()> {
    let (panels, edges) = secondary_ring_one();
    let rig = build_rig(MirrorId::Secondary, &panels, &edges, 3, CENTER);
    let fixed = PanelPosition::from_raw(2111)?;
    rig.sim_panels[&2112].displace(&[0.3, -0.2, 0.1, 0.2, -0.1, 0.2]);

    rig.mirror.align_ring(fixed, 1., false).await?;
    rig.mirror.align_ring(fixed, 1., true).await?;

    assert_nominal(&rig.sim_panels[&2111], 1e-9);
    // after the correction every edge closes up to its systematic offset
    for edge in rig.edges.values() {
        let (current, _) = edge.current_readings().await?;
        let aligned = edge.aligned_readings().await?;
        let systematic = edge.systematic_offsets().await;
        let residual = (aligned - current - systematic).norm();
        assert!(
            residual < 1e-6,
            "edge {} residual {residual}",
            edge.address()
        );
    }
    Ok(())
}

#[tokio::test]
async fn ring_systematic_offsets_land_on_visible_sensors() -> anyhow::Result<()> {
    let (panels, edges) = secondary_ring_one();
    // four sensors per edge, so one can drop out and the system stays
    // determined; the calibrated targets sit 5 px off the plant's aligned
    // centroids, which only the systematic term can absorb
    let rig = build_rig(MirrorId::Secondary, &panels, &edges, 4, CENTER);
    let offset = Vector2::new(5., 0.);
    for i in 0..edges.len() {
        for k in 0..4 {
            rig.store.insert_aligned((10 * i + k + 1) as i32, CENTER + offset);
        }
        // the first sensor of every edge goes dark
        rig.sim_sensors[&((10 * i + 1) as i32)]
            .set_state(DeviceState::Off)
            .await?;
    }

    let fixed = PanelPosition::from_raw(2111)?;
    rig.mirror.align_ring(fixed, 1., false).await?;
    rig.mirror.align_ring(fixed, 1., true).await?;

    // the whole misalignment is systematic; no panel moves
    for sim in rig.sim_panels.values() {
        assert_nominal(sim, 1e-6);
    }
    for i in 0..edges.len() {
        let dark = rig.mirror.sensor((10 * i + 1) as i32).unwrap();
        assert_eq!(dark.systematic_offsets(), Vector2::zeros());
        for k in 1..4 {
            let sensor = rig.mirror.sensor((10 * i + k + 1) as i32).unwrap();
            let got = sensor.systematic_offsets();
            assert!(
                (got - offset).norm() < 1e-6,
                "sensor {} offsets {got:?}",
                10 * i + k + 1
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn mirror_stage_is_tagged_by_its_operation() -> anyhow::Result<()> {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    let target = [0.1, 0., 0.05, 0., 0., 0.];
    rig.mirror.move_to_coords(&target, false).await?;

    // an execute under a different operation must not consume the stage
    let fixed = PanelPosition::from_raw(2111)?;
    let err = rig.mirror.align_ring(fixed, 1., true).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));

    rig.mirror.move_to_coords(&target, true).await?;
    let moved = rig.sim_panels[&2111]
        .lengths()
        .iter()
        .any(|l| (l - NOMINAL_ACTUATOR_LENGTH).abs() > 1e-3);
    assert!(moved, "rigid motion left the actuators untouched");

    // the stage was consumed
    let err = rig.mirror.move_to_coords(&target, true).await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidState(_)));
    Ok(())
}

#[tokio::test]
async fn reading_with_an_empty_selection_is_rejected() {
    let rig = build_rig(
        MirrorId::Secondary,
        &[2111, 2112],
        &[(2111, 2112)],
        3,
        CENTER,
    );
    let err = rig.mirror.read_sensors().await.unwrap_err();
    assert!(matches!(err, AlignmentError::InvalidArgument(_)));

    rig.mirror.select_all();
    let readings = rig.mirror.read_sensors().await.unwrap();
    assert_eq!(readings.len(), 3);
    for (_, reading) in readings {
        assert!((reading.centroid - CENTER).norm() < 1e-9);
    }
}
