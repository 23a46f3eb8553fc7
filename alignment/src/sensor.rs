//! Edge-mounted optical position sensor.
//!
//! Each sensor watches the laser of one adjacent panel with the camera of the
//! other, so every sensor knows two panels, one per side. Calibration data
//! (aligned readings and per-side response sub-matrices) comes from the
//! [`CalibrationStore`]; raw readings go back to it for audit.

use log::debug;
use nalgebra::{SMatrix, Vector2};
use pas_geometry::PanelPosition;
use pas_interface::{
    CalibrationStore, DeviceProxy, DeviceState, Field, Identity, Op, SensorReading, Side,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::AlignmentError;

/// Nominal center of the sensor camera [px].
pub const SENSOR_CENTER: Vector2<f64> = Vector2::new(160., 120.);

pub struct SensorController {
    identity: Identity,
    device: Arc<dyn DeviceProxy>,
    store: Arc<dyn CalibrationStore>,
    sides: HashMap<u32, Side>,
    systematic: Mutex<Vector2<f64>>,
}

impl SensorController {
    pub fn new(
        identity: Identity,
        device: Arc<dyn DeviceProxy>,
        store: Arc<dyn CalibrationStore>,
        laser_panel: PanelPosition,
        webcam_panel: PanelPosition,
    ) -> Arc<Self> {
        let mut sides = HashMap::new();
        sides.insert(laser_panel.as_u32(), Side::Laser);
        sides.insert(webcam_panel.as_u32(), Side::Webcam);
        Arc::new(Self {
            identity,
            device,
            store,
            sides,
            systematic: Mutex::new(Vector2::zeros()),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn serial(&self) -> i32 {
        self.identity.serial
    }

    /// Which side of this sensor the given panel is on, if any.
    pub fn side_of(&self, panel: PanelPosition) -> Option<Side> {
        self.sides.get(&panel.as_u32()).copied()
    }

    pub async fn state(&self) -> DeviceState {
        self.device.state().await
    }

    /// A sensor contributes to alignment only while it is neither off nor in
    /// a fatal error state.
    pub async fn is_visible(&self) -> bool {
        !matches!(
            self.device.state().await,
            DeviceState::Off | DeviceState::FatalError
        )
    }

    /// Exposes one image and returns the processed reading; the raw values
    /// are recorded to the calibration store for audit.
    pub async fn read(&self) -> Result<SensorReading, AlignmentError> {
        self.device.operate(Op::ReadSensor, &[]).await?;
        let reading = SensorReading {
            centroid: Vector2::new(
                self.device.data(Field::CentroidX).await?,
                self.device.data(Field::CentroidY).await?,
            ),
            spot_width: Vector2::new(
                self.device.data(Field::SpotWidthX).await?,
                self.device.data(Field::SpotWidthY).await?,
            ),
        };
        debug!(
            "{}: centroid = [{:.2}, {:.2}] px",
            self.identity, reading.centroid.x, reading.centroid.y
        );
        self.store.record_reading(self.serial(), &reading);
        Ok(reading)
    }

    /// Nominal centroid with everything aligned, from calibration.
    pub fn aligned_readings(&self) -> Result<Vector2<f64>, AlignmentError> {
        self.store.aligned_readings(self.serial()).ok_or_else(|| {
            AlignmentError::InvalidArgument(format!(
                "no aligned readings calibrated for sensor {}",
                self.identity
            ))
        })
    }

    /// This sensor's 2x6 response to the given panel's actuators.
    pub fn response(&self, panel: PanelPosition) -> Result<SMatrix<f64, 2, 6>, AlignmentError> {
        let side = self.side_of(panel).ok_or_else(|| {
            AlignmentError::InvalidArgument(format!(
                "sensor {} does not see panel {panel}",
                self.identity
            ))
        })?;
        self.store
            .response_matrix(self.serial(), side)
            .ok_or_else(|| {
                AlignmentError::InvalidArgument(format!(
                    "no response matrix calibrated for sensor {} side {side:?}",
                    self.identity
                ))
            })
    }

    /// Ring-level systematic offset, set by the full-ring alignment solve.
    pub fn systematic_offsets(&self) -> Vector2<f64> {
        *self.systematic.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_systematic_offsets(&self, offsets: Vector2<f64>) {
        *self.systematic.lock().unwrap_or_else(|e| e.into_inner()) = offsets;
    }

    /// Collision safety radius of this sensor's camera [px].
    pub async fn safety_radius(&self) -> Result<f64, AlignmentError> {
        Ok(self.device.data(Field::SafetyRadius).await?)
    }

    pub async fn set_safety_radius(&self, radius: f64) -> Result<(), AlignmentError> {
        self.device.set_data(Field::SafetyRadius, radius).await?;
        Ok(())
    }
}
