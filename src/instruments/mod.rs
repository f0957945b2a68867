//! Instrument Adapters
//!
//! Typed adapters that implement the capability traits over a
//! `PropertyClient`, plus `DeviceSet`, the bundle of trait objects handed to
//! procedures.
//!
//! | Adapter | Server devices | Capabilities |
//! |---------|----------------|--------------|
//! | `PhaseLoopController` | `PLC` | SetpointActuator, PhaseInterlock |
//! | `NomicCamera` | `NOMIC`, `Warm.NOMIC_FW2` | CameraControl, NullMonitor |
//! | `Telescope` | `LBTO`, `Warm.NIL_OPW`, `PLC` beam 2 | PointingControl |

pub mod nomic;
pub mod phase_loop;
pub mod telescope;

pub use nomic::NomicCamera;
pub use phase_loop::PhaseLoopController;
pub use telescope::Telescope;

use crate::device::capabilities::{
    CameraControl, NullMonitor, PhaseInterlock, PointingControl, SetpointActuator,
};
use crate::device::PropertyClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which set of path-length actuators the phase loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PztSource {
    /// Science beam PZTs (normal operation)
    #[default]
    Ubc,
    /// NAC source PZTs (daytime testing)
    Nac,
}

impl PztSource {
    /// Prefix of the controller's settings property (`UBCSettings`).
    pub fn settings_prefix(&self) -> &'static str {
        match self {
            PztSource::Ubc => "UBC",
            PztSource::Nac => "NAC",
        }
    }

    /// Value of the `forNAC` element of a setpoint command.
    pub fn for_nac(&self) -> f64 {
        match self {
            PztSource::Ubc => 0.0,
            PztSource::Nac => 1.0,
        }
    }
}

/// Devices available to a procedure, by capability.
#[derive(Clone)]
pub struct DeviceSet {
    /// OPD setpoint actuator
    pub actuator: Arc<dyn SetpointActuator>,
    /// Null flux measurement
    pub null_monitor: Arc<dyn NullMonitor>,
    /// Phase loop state
    pub interlock: Arc<dyn PhaseInterlock>,
    /// Science camera
    pub camera: Arc<dyn CameraControl>,
    /// Telescope and beam alignment
    pub pointing: Arc<dyn PointingControl>,
}

impl DeviceSet {
    /// Build the standard adapters over one server connection.
    pub fn from_client(client: Arc<dyn PropertyClient>, source: PztSource) -> Self {
        let plc = Arc::new(PhaseLoopController::new(client.clone(), source));
        let camera = Arc::new(NomicCamera::new(client.clone()));
        let telescope = Arc::new(Telescope::new(client, source));
        Self {
            actuator: plc.clone(),
            null_monitor: camera.clone(),
            interlock: plc,
            camera,
            pointing: telescope,
        }
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet").finish_non_exhaustive()
    }
}
