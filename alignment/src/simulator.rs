//! In-process device simulation.
//!
//! Panels move instantly and sensors derive their centroid from the actuator
//! lengths of the two panels they watch through the same response matrices
//! the calibration store hands out, so closed-loop alignment runs against a
//! self-consistent plant. Used by the integration tests and handy for dry
//! runs of alignment sequences.

use async_trait::async_trait;
use nalgebra::{SMatrix, Vector2, Vector6};
use pas_geometry::PanelPosition;
use pas_interface::{
    CalibrationStore, DeviceError, DeviceProxy, DeviceState, Field, Identity, Op, SensorReading,
    Side,
};
use pas_kinematics::NOMINAL_ACTUATOR_LENGTH;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SPOT_WIDTH: f64 = 18.;
const DEFAULT_SAFETY_RADIUS: f64 = 100.;

/// A panel device whose actuators move instantly.
pub struct SimPanel {
    identity: Identity,
    lengths: Mutex<[f64; 6]>,
    state: Mutex<DeviceState>,
}

impl SimPanel {
    pub fn new(position: PanelPosition) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity {
                name: format!("SimPanel_{position}"),
                position: position.as_u32(),
                serial: 0,
                address: position.to_string(),
            },
            lengths: Mutex::new([NOMINAL_ACTUATOR_LENGTH; 6]),
            state: Mutex::new(DeviceState::On),
        })
    }

    pub fn lengths(&self) -> [f64; 6] {
        *self.lengths.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offsets the actuators without going through the device surface, to
    /// set up a misaligned starting point.
    pub fn displace(&self, delta: &[f64; 6]) {
        let mut lengths = self.lengths.lock().unwrap_or_else(|e| e.into_inner());
        for (l, d) in lengths.iter_mut().zip(delta) {
            *l += d;
        }
    }

    fn check_operable(&self) -> Result<(), DeviceError> {
        let state = *self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state {
            DeviceState::Off | DeviceState::FatalError => Err(DeviceError::BadState(
                self.identity.to_string(),
                state,
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceProxy for SimPanel {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn set_state(&self, state: DeviceState) -> Result<(), DeviceError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        Ok(())
    }

    async fn data(&self, field: Field) -> Result<f64, DeviceError> {
        match field {
            Field::ActuatorLength(i) if i < 6 => Ok(self.lengths()[i]),
            Field::ActuatorMissedDelta(i) if i < 6 => Ok(0.),
            _ => Err(DeviceError::NoSuchField(self.identity.to_string(), field)),
        }
    }

    async fn set_data(&self, field: Field, value: f64) -> Result<(), DeviceError> {
        match field {
            Field::ActuatorLength(i) if i < 6 => {
                self.lengths.lock().unwrap_or_else(|e| e.into_inner())[i] = value;
                Ok(())
            }
            _ => Err(DeviceError::NoSuchField(self.identity.to_string(), field)),
        }
    }

    async fn operate(&self, op: Op, args: &[f64]) -> Result<(), DeviceError> {
        match op {
            Op::MoveDeltaLengths => {
                self.check_operable()?;
                let mut lengths = self.lengths.lock().unwrap_or_else(|e| e.into_inner());
                for (l, d) in lengths.iter_mut().zip(args) {
                    *l += d;
                }
                Ok(())
            }
            Op::MoveToLengths => {
                self.check_operable()?;
                let mut lengths = self.lengths.lock().unwrap_or_else(|e| e.into_inner());
                for (l, t) in lengths.iter_mut().zip(args) {
                    *l = *t;
                }
                Ok(())
            }
            Op::FindHome => {
                self.check_operable()?;
                *self.lengths.lock().unwrap_or_else(|e| e.into_inner()) =
                    [NOMINAL_ACTUATOR_LENGTH; 6];
                Ok(())
            }
            Op::Stop => Ok(()),
            Op::ReadSensor => Err(DeviceError::NoSuchOp(self.identity.to_string(), op)),
        }
    }
}

/// A sensor device whose centroid follows its two panels linearly.
pub struct SimSensor {
    identity: Identity,
    laser: Arc<SimPanel>,
    webcam: Arc<SimPanel>,
    laser_response: SMatrix<f64, 2, 6>,
    webcam_response: SMatrix<f64, 2, 6>,
    aligned: Vector2<f64>,
    centroid: Mutex<Vector2<f64>>,
    safety_radius: Mutex<f64>,
    state: Mutex<DeviceState>,
}

impl SimSensor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        serial: i32,
        laser: Arc<SimPanel>,
        laser_response: SMatrix<f64, 2, 6>,
        webcam: Arc<SimPanel>,
        webcam_response: SMatrix<f64, 2, 6>,
        aligned: Vector2<f64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity {
                name: format!("SimSensor_{serial}"),
                position: serial as u32,
                serial,
                address: String::new(),
            },
            laser,
            webcam,
            laser_response,
            webcam_response,
            aligned,
            centroid: Mutex::new(aligned),
            safety_radius: Mutex::new(DEFAULT_SAFETY_RADIUS),
            state: Mutex::new(DeviceState::On),
        })
    }

    fn expose(&self) -> Vector2<f64> {
        let deviation = |panel: &SimPanel, response: &SMatrix<f64, 2, 6>| {
            let lengths = panel.lengths();
            let mut delta = Vector6::zeros();
            for (i, l) in lengths.iter().enumerate() {
                delta[i] = l - NOMINAL_ACTUATOR_LENGTH;
            }
            response * delta
        };
        self.aligned
            + deviation(&self.laser, &self.laser_response)
            + deviation(&self.webcam, &self.webcam_response)
    }
}

#[async_trait]
impl DeviceProxy for SimSensor {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn set_state(&self, state: DeviceState) -> Result<(), DeviceError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        Ok(())
    }

    async fn data(&self, field: Field) -> Result<f64, DeviceError> {
        let centroid = *self.centroid.lock().unwrap_or_else(|e| e.into_inner());
        match field {
            Field::CentroidX => Ok(centroid.x),
            Field::CentroidY => Ok(centroid.y),
            Field::SpotWidthX | Field::SpotWidthY => Ok(SPOT_WIDTH),
            Field::SafetyRadius => {
                Ok(*self.safety_radius.lock().unwrap_or_else(|e| e.into_inner()))
            }
            _ => Err(DeviceError::NoSuchField(self.identity.to_string(), field)),
        }
    }

    async fn set_data(&self, field: Field, value: f64) -> Result<(), DeviceError> {
        match field {
            Field::SafetyRadius => {
                *self.safety_radius.lock().unwrap_or_else(|e| e.into_inner()) = value;
                Ok(())
            }
            _ => Err(DeviceError::NoSuchField(self.identity.to_string(), field)),
        }
    }

    async fn operate(&self, op: Op, _args: &[f64]) -> Result<(), DeviceError> {
        match op {
            Op::ReadSensor => {
                let state = self.state().await;
                if matches!(state, DeviceState::Off | DeviceState::FatalError) {
                    return Err(DeviceError::BadState(self.identity.to_string(), state));
                }
                *self.centroid.lock().unwrap_or_else(|e| e.into_inner()) = self.expose();
                Ok(())
            }
            _ => Err(DeviceError::NoSuchOp(self.identity.to_string(), op)),
        }
    }
}

/// An in-memory calibration store, updatable while in use.
#[derive(Default)]
pub struct SimCalibration {
    aligned: Mutex<HashMap<i32, Vector2<f64>>>,
    responses: Mutex<HashMap<(i32, Side), SMatrix<f64, 2, 6>>>,
    log: Mutex<Vec<(i32, SensorReading)>>,
}

impl SimCalibration {
    pub fn insert_aligned(&self, serial: i32, aligned: Vector2<f64>) {
        self.aligned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(serial, aligned);
    }

    pub fn insert_response(&self, serial: i32, side: Side, response: SMatrix<f64, 2, 6>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((serial, side), response);
    }

    /// Readings recorded so far, in order.
    pub fn recorded(&self) -> Vec<(i32, SensorReading)> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CalibrationStore for SimCalibration {
    fn aligned_readings(&self, serial: i32) -> Option<Vector2<f64>> {
        self.aligned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&serial)
            .copied()
    }

    fn response_matrix(&self, serial: i32, side: Side) -> Option<SMatrix<f64, 2, 6>> {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(serial, side))
            .copied()
    }

    fn record_reading(&self, serial: i32, reading: &SensorReading) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((serial, *reading));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(raw: u32) -> PanelPosition {
        PanelPosition::from_raw(raw).unwrap()
    }

    #[tokio::test]
    async fn panel_moves_instantly() {
        let panel = SimPanel::new(pos(1111));
        panel
            .operate(Op::MoveDeltaLengths, &[1., 0., 0., 0., 0., -2.])
            .await
            .unwrap();
        assert_eq!(panel.lengths()[0], NOMINAL_ACTUATOR_LENGTH + 1.);
        assert_eq!(panel.lengths()[5], NOMINAL_ACTUATOR_LENGTH - 2.);
        panel.operate(Op::FindHome, &[1.]).await.unwrap();
        assert_eq!(panel.lengths(), [NOMINAL_ACTUATOR_LENGTH; 6]);
    }

    #[tokio::test]
    async fn panel_off_rejects_motion() {
        let panel = SimPanel::new(pos(1111));
        panel.set_state(DeviceState::Off).await.unwrap();
        let err = panel
            .operate(Op::MoveDeltaLengths, &[1.; 6])
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::BadState(_, DeviceState::Off)));
    }

    #[tokio::test]
    async fn sensor_follows_the_laser_panel() {
        let laser = SimPanel::new(pos(1111));
        let webcam = SimPanel::new(pos(1112));
        let response = SMatrix::<f64, 2, 6>::from_row_slice(&[
            1., 0., 0., 0., 0., 0., //
            0., 1., 0., 0., 0., 0.,
        ]);
        let sensor = SimSensor::new(
            7,
            Arc::clone(&laser),
            response,
            webcam,
            SMatrix::zeros(),
            Vector2::new(160., 120.),
        );
        sensor.operate(Op::ReadSensor, &[]).await.unwrap();
        assert_eq!(sensor.data(Field::CentroidX).await.unwrap(), 160.);

        laser.displace(&[0.5, -0.25, 0., 0., 0., 0.]);
        sensor.operate(Op::ReadSensor, &[]).await.unwrap();
        assert_eq!(sensor.data(Field::CentroidX).await.unwrap(), 160.5);
        assert_eq!(sensor.data(Field::CentroidY).await.unwrap(), 119.75);
    }
}
