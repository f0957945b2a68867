//! Phase loop controller (PLC) adapter.
//!
//! The setpoint is read back from `PLC.<src>Settings.PLSetpoint` and commanded
//! through the separate `PLC.PLSetpoint` property, which is much faster than
//! rewriting the whole settings vector.

use super::PztSource;
use crate::device::capabilities::{PhaseInterlock, SetpointActuator};
use crate::device::{PropertyClient, PropertyUpdate};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Property carrying setpoint commands.
pub const SETPOINT_COMMAND: (&str, &str) = ("PLC", "PLSetpoint");
/// Phase loop closed switch.
pub const LOOP_CLOSED: &str = "PLC.CloseLoop.Yes";

/// Adapter for the phase loop controller.
pub struct PhaseLoopController {
    client: Arc<dyn PropertyClient>,
    source: PztSource,
}

impl PhaseLoopController {
    /// Create an adapter driving the given PZT source.
    pub fn new(client: Arc<dyn PropertyClient>, source: PztSource) -> Self {
        Self { client, source }
    }

    /// PZT source in use.
    pub fn source(&self) -> PztSource {
        self.source
    }

    fn setpoint_path(&self) -> String {
        format!("PLC.{}Settings.PLSetpoint", self.source.settings_prefix())
    }
}

#[async_trait]
impl SetpointActuator for PhaseLoopController {
    async fn setpoint(&self) -> Result<f64> {
        self.client.get_number(&self.setpoint_path()).await
    }

    async fn command_setpoint(&self, degrees: f64) -> Result<()> {
        debug!(setpoint = degrees, source = ?self.source, "Commanding setpoint");
        self.client
            .set(
                PropertyUpdate::new(SETPOINT_COMMAND.0, SETPOINT_COMMAND.1)
                    .number("PLSetpoint", degrees)
                    .number("forNAC", self.source.for_nac()),
            )
            .await
    }
}

#[async_trait]
impl PhaseInterlock for PhaseLoopController {
    async fn is_loop_closed(&self) -> Result<bool> {
        // The loop state is only reported for the science PZTs.
        match self.source {
            PztSource::Ubc => self.client.get_switch(LOOP_CLOSED).await,
            PztSource::Nac => Ok(true),
        }
    }

    async fn open_loop(&self) -> Result<()> {
        self.client.set_switch(LOOP_CLOSED, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimulatedServer, SimulatorConfig};

    #[tokio::test]
    async fn commands_reach_settings_readback() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig::default()));
        let plc = PhaseLoopController::new(server.clone(), PztSource::Ubc);

        plc.command_setpoint(42.0).await.unwrap();
        assert_eq!(plc.setpoint().await.unwrap(), 42.0);

        let log = server.command_log().await;
        let last = log.last().unwrap();
        assert_eq!(last.to_string(), "PLC.PLSetpoint.PLSetpoint=42;forNAC=0");
    }

    #[tokio::test]
    async fn nac_source_reports_loop_closed() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig::default()));
        server.set_loop_closed(false).await;
        let plc = PhaseLoopController::new(server.clone(), PztSource::Nac);
        assert!(plc.is_loop_closed().await.unwrap());

        let ubc = PhaseLoopController::new(server, PztSource::Ubc);
        assert!(!ubc.is_loop_closed().await.unwrap());
    }
}
