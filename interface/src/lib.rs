//! # Device and calibration contracts
//!
//! The alignment engine never talks to hardware or storage directly; it goes
//! through the two traits defined here. [`DeviceProxy`] stands in for an
//! actuator board, a sensor head or any other addressable device and exposes
//! a uniform state/data/operate surface. [`CalibrationStore`] hands out the
//! per-sensor calibration products (nominal aligned readings and response
//! sub-matrices) and accepts reading records for audit.
//!
//! Device calls are async; long device motions are awaited by polling the
//! device state at a configured cadence with a hard deadline, see
//! [`wait_while_busy`].

use async_trait::async_trait;
use nalgebra::{SMatrix, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The operational state a device reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    On,
    Off,
    Busy,
    /// Degraded but still usable.
    OperableError,
    /// Unusable until serviced.
    FatalError,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::On => "On",
            DeviceState::Off => "Off",
            DeviceState::Busy => "Busy",
            DeviceState::OperableError => "OperableError",
            DeviceState::FatalError => "FatalError",
        };
        write!(f, "{name}")
    }
}

/// How a device is addressed and displayed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    /// Position code, e.g. a panel position for panels.
    pub position: u32,
    pub serial: i32,
    /// Topological address, e.g. `1111+1112` for an edge.
    pub address: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.serial)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Scalar data channels a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// Current length of one actuator [mm].
    ActuatorLength(usize),
    /// Leftover delta of the last motion of one actuator [mm].
    ActuatorMissedDelta(usize),
    /// Image centroid along x [px].
    CentroidX,
    /// Image centroid along y [px].
    CentroidY,
    /// Laser spot width along x [px].
    SpotWidthX,
    /// Laser spot width along y [px].
    SpotWidthY,
    /// Collision safety radius [px].
    SafetyRadius,
}

/// Commands a device executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Move all actuators by the given deltas [mm].
    MoveDeltaLengths,
    /// Move all actuators to the given absolute lengths [mm].
    MoveToLengths,
    /// Expose and analyze one sensor image.
    ReadSensor,
    /// Immediately stop all motion.
    Stop,
    /// Re-home all actuators.
    FindHome,
}

#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("device {0} is in state {1}, operation rejected")]
    BadState(String, DeviceState),
    #[error("device {0} does not expose {1:?}")]
    NoSuchField(String, Field),
    #[error("device {0} does not support {1:?}")]
    NoSuchOp(String, Op),
    #[error("device {0} did not leave Busy within {1:?}")]
    PollTimeout(String, Duration),
    #[error("device {0} failed: {1}")]
    Failed(String, String),
}

/// Uniform async surface of every device the engine drives.
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    fn identity(&self) -> &Identity;
    async fn state(&self) -> DeviceState;
    async fn set_state(&self, state: DeviceState) -> Result<(), DeviceError>;
    async fn data(&self, field: Field) -> Result<f64, DeviceError>;
    async fn set_data(&self, field: Field, value: f64) -> Result<(), DeviceError>;
    async fn operate(&self, op: Op, args: &[f64]) -> Result<(), DeviceError>;
}

/// Cadence and deadline for waiting out a busy device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Polling {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            deadline: Duration::from_secs(120),
        }
    }
}

/// Sleeps until the device leaves [`DeviceState::Busy`], polling at the
/// configured cadence. Errors with [`DeviceError::PollTimeout`] once the
/// deadline has passed.
pub async fn wait_while_busy(
    device: &dyn DeviceProxy,
    polling: &Polling,
) -> Result<DeviceState, DeviceError> {
    let start = tokio::time::Instant::now();
    loop {
        let state = device.state().await;
        if state != DeviceState::Busy {
            log::debug!(
                "{}: left Busy as {state} after {:?}",
                device.identity(),
                start.elapsed()
            );
            return Ok(state);
        }
        if start.elapsed() > polling.deadline {
            return Err(DeviceError::PollTimeout(
                device.identity().to_string(),
                polling.deadline,
            ));
        }
        tokio::time::sleep(polling.interval).await;
    }
}

/// One processed sensor image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Laser spot centroid [px].
    pub centroid: Vector2<f64>,
    /// Laser spot width [px].
    pub spot_width: Vector2<f64>,
}

/// Which side of a sensor a panel is on: the laser emitter sits on one panel,
/// the camera looks from the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Laser,
    Webcam,
}

/// Calibration products and the reading audit sink.
///
/// Response sub-matrices map the 6 actuator deltas of a panel to the 2
/// centroid deltas of a sensor, one matrix per (sensor, side).
pub trait CalibrationStore: Send + Sync {
    /// Nominal centroid of the sensor with everything aligned [px].
    fn aligned_readings(&self, serial: i32) -> Option<Vector2<f64>>;
    /// 2x6 response of the sensor to the panel on the given side.
    fn response_matrix(&self, serial: i32, side: Side) -> Option<SMatrix<f64, 2, 6>>;
    /// Records a reading for audit; best effort, never fails the caller.
    fn record_reading(&self, serial: i32, reading: &SensorReading);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlipsToOn(AtomicU32);

    #[async_trait]
    impl DeviceProxy for FlipsToOn {
        fn identity(&self) -> &Identity {
            static IDENTITY: std::sync::OnceLock<Identity> = std::sync::OnceLock::new();
            IDENTITY.get_or_init(|| Identity {
                name: "test".into(),
                ..Default::default()
            })
        }
        async fn state(&self) -> DeviceState {
            if self.0.fetch_sub(1, Ordering::SeqCst) > 1 {
                DeviceState::Busy
            } else {
                DeviceState::On
            }
        }
        async fn set_state(&self, _: DeviceState) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn data(&self, field: Field) -> Result<f64, DeviceError> {
            Err(DeviceError::NoSuchField("test".into(), field))
        }
        async fn set_data(&self, field: Field, _: f64) -> Result<(), DeviceError> {
            Err(DeviceError::NoSuchField("test".into(), field))
        }
        async fn operate(&self, op: Op, _: &[f64]) -> Result<(), DeviceError> {
            Err(DeviceError::NoSuchOp("test".into(), op))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_not_busy() {
        let device = FlipsToOn(AtomicU32::new(3));
        let polling = Polling::default();
        let state = wait_while_busy(&device, &polling).await.unwrap();
        assert_eq!(state, DeviceState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_a_stuck_device() {
        let device = FlipsToOn(AtomicU32::new(u32::MAX));
        let polling = Polling {
            interval: Duration::from_millis(100),
            deadline: Duration::from_secs(1),
        };
        let err = wait_while_busy(&device, &polling).await.unwrap_err();
        assert!(matches!(err, DeviceError::PollTimeout(_, _)));
    }
}
