//! Telescope pointing and PHASECAM beam alignment adapter.

use super::PztSource;
use crate::device::capabilities::{PointingControl, TelescopeSide};
use crate::device::{PropertyClient, PropertyUpdate};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// AO status value reported while the loop is running.
pub const AO_RUNNING: &str = "AORunning";

/// Adapter for the telescope control system and PHASECAM alignment.
pub struct Telescope {
    client: Arc<dyn PropertyClient>,
    source: PztSource,
}

impl Telescope {
    /// Create an adapter; `source` selects which PLC settings hold beam 2.
    pub fn new(client: Arc<dyn PropertyClient>, source: PztSource) -> Self {
        Self { client, source }
    }

    fn beam2_path(&self) -> String {
        format!("PLC.{}Settings.Beam2_y", self.source.settings_prefix())
    }
}

#[async_trait]
impl PointingControl for Telescope {
    async fn offset_pointing(
        &self,
        dx_arcsec: f64,
        dy_arcsec: f64,
        side: TelescopeSide,
    ) -> Result<()> {
        debug!(dx_arcsec, dy_arcsec, side = side.as_str(), "Offsetting telescope");
        self.client
            .set(
                PropertyUpdate::new("LBTO", "OffsetPointing")
                    .text("CoordSys", "DETXY")
                    .number("OffsetX", dx_arcsec)
                    .number("OffsetY", dy_arcsec)
                    .text("Side", side.as_str())
                    .text("Type", "REL"),
            )
            .await
    }

    async fn ao_loops_closed(&self) -> Result<bool> {
        let left = self.client.get_text("LBTO.AOStatus.L_AOStatus").await?;
        let right = self.client.get_text("LBTO.AOStatus.R_AOStatus").await?;
        Ok(left == AO_RUNNING && right == AO_RUNNING)
    }

    async fn opw_position(&self) -> Result<i64> {
        Ok(self
            .client
            .get_number("Warm.NIL_OPW_status.PosNum")
            .await?
            .round() as i64)
    }

    async fn move_opw(&self, position: i64) -> Result<()> {
        self.client
            .set_text("Warm.NIL_OPW.command", &position.to_string())
            .await
    }

    async fn beam2_y(&self) -> Result<f64> {
        self.client.get_number(&self.beam2_path()).await
    }

    async fn set_beam2_y(&self, y: f64) -> Result<()> {
        self.client.set_number(&self.beam2_path(), y).await
    }
}
