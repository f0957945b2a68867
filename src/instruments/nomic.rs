//! NOMIC science camera adapter.
//!
//! The camera is driven by text commands written to `NOMIC.Command.text`.
//! Commands used by the procedures:
//!
//! | Command | Meaning |
//! |---------|---------|
//! | `<0/1> contacq` | continuous acquisition off/on |
//! | `<0/1> savedata` | write frames to disk |
//! | `<0/1> loglevel` | camera log verbosity |
//! | `<0/1> autodispwhat` | display raw or background-subtracted frames |
//! | `<dit> <coadds> <n> lbtintpar` | integration parameters |
//! | `go` | integrate the configured sequence (blocks until done) |
//! | `rawbg` | use the last frame as display background |
//!
//! The null flux comes from the camera's ROI statistics: ROI 3 sits on the
//! source, ROIs 1 and 2 on empty sky.

use crate::device::capabilities::{CameraControl, NullMonitor, Roi};
use crate::device::{PropertyClient, PropertyUpdate};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Camera command line property.
pub const COMMAND: &str = "NOMIC.Command.text";
/// Integration time (s).
pub const INT_TIME: &str = "NOMIC.CamInfo.IntTime";
/// Integration in progress.
pub const INTEGRATING: &str = "NOMIC.CamInfo.Go";
/// Next frame file index.
pub const FILE_INDEX: &str = "NOMIC.CamInfo.FIndex";
/// Filter wheel 2 command.
pub const FILTER_WHEEL_2: &str = "Warm.NOMIC_FW2.command";

/// Adapter for the NOMIC camera.
pub struct NomicCamera {
    client: Arc<dyn PropertyClient>,
}

impl NomicCamera {
    /// Create an adapter over a server connection.
    pub fn new(client: Arc<dyn PropertyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CameraControl for NomicCamera {
    async fn send_command(&self, command: &str) -> Result<()> {
        debug!(command, "NOMIC command");
        self.client.set_text(COMMAND, command).await
    }

    async fn integration_time(&self) -> Result<f64> {
        self.client.get_number(INT_TIME).await
    }

    async fn is_integrating(&self) -> Result<bool> {
        self.client.get_switch(INTEGRATING).await
    }

    async fn file_index(&self) -> Result<i64> {
        Ok(self.client.get_number(FILE_INDEX).await?.round() as i64)
    }

    async fn set_fits_keyword(&self, keyword: &str, value: &str, comment: &str) -> Result<()> {
        self.client
            .set(
                PropertyUpdate::new("NOMIC", "EditFITS")
                    .text("Keyword", keyword)
                    .text("Value", value)
                    .text("Comment", comment),
            )
            .await
    }

    async fn fits_keyword(&self, keyword: &str) -> Result<String> {
        self.client
            .get_text(&format!("NOMIC.FITSKeywords.{}", keyword))
            .await
    }

    async fn move_filter_wheel(&self, position: &str) -> Result<()> {
        self.client.set_text(FILTER_WHEEL_2, position).await
    }

    async fn query_roi(&self, id: u32) -> Result<Roi> {
        self.client
            .set(
                PropertyUpdate::new("NOMIC", "QueryROI")
                    .number("ROIID", id as f64)
                    .number("X", 0.0)
                    .number("Y", 0.0)
                    .number("H", 0.0)
                    .number("W", 0.0),
            )
            .await?;
        Ok(Roi {
            id,
            x: self.client.get_number("NOMIC.QueryROI.X").await?,
            y: self.client.get_number("NOMIC.QueryROI.Y").await?,
            h: self.client.get_number("NOMIC.QueryROI.H").await?,
            w: self.client.get_number("NOMIC.QueryROI.W").await?,
        })
    }

    async fn define_roi(&self, roi: Roi) -> Result<()> {
        self.client
            .set(
                PropertyUpdate::new("NOMIC", "DefROI")
                    .number("ROIID", roi.id as f64)
                    .number("X", roi.x)
                    .number("Y", roi.y)
                    .number("H", roi.h)
                    .number("W", roi.w),
            )
            .await
    }
}

#[async_trait]
impl NullMonitor for NomicCamera {
    async fn read_null(&self) -> Result<f64> {
        let on_source = self.client.get_number("NOMIC.NullingStats.Mean3").await?;
        let bg1 = self.client.get_number("NOMIC.NullingStats.Mean1").await?;
        let bg2 = self.client.get_number("NOMIC.NullingStats.Mean2").await?;
        Ok(on_source - 0.5 * (bg1 + bg2))
    }

    async fn integration_time(&self) -> Result<f64> {
        self.client.get_number(INT_TIME).await
    }
}

// =============================================================================
// Command Sequences
// =============================================================================

/// `<dit> 1 <n> lbtintpar` with the DIT formatted the way the camera expects.
pub fn integration_parameters(dit: f64, n_sequences: u32) -> String {
    format!("{:.6} 1 {} lbtintpar", dit, n_sequences)
}

/// Stop continuous acquisition and saving, single-frame integration.
pub async fn safe_state(camera: &dyn CameraControl, dit: f64) -> Result<()> {
    camera.send_command("0 contacq").await?;
    camera.send_command("0 savedata").await?;
    camera.send_command("0 loglevel").await?;
    camera.send_command("0 autodispwhat").await?;
    camera.send_command(&integration_parameters(dit, 1)).await
}

/// Configure an integration of `n_sequences` frames.
pub async fn setup_sequence(
    camera: &dyn CameraControl,
    dit: f64,
    save: bool,
    n_sequences: u32,
) -> Result<()> {
    camera
        .send_command(&format!("{} savedata", u8::from(save)))
        .await?;
    camera.send_command("1 autodispwhat").await?;
    camera
        .send_command(&integration_parameters(dit, n_sequences))
        .await
}

/// Return the camera to unsaved continuous acquisition.
pub async fn continuous_mode(camera: &dyn CameraControl, dit: f64, settle: Duration) -> Result<()> {
    camera.send_command("0 savedata").await?;
    camera.send_command("1 autodispwhat").await?;
    camera.send_command(&integration_parameters(dit, 1)).await?;
    tokio::time::sleep(settle).await;
    camera.send_command("1 contacq").await
}

/// Integrate one frame and use it as the display background.
pub async fn take_display_background(
    camera: &dyn CameraControl,
    dit: f64,
    settle: Duration,
) -> Result<()> {
    safe_state(camera, dit).await?;
    setup_sequence(camera, dit, false, 1).await?;
    tokio::time::sleep(settle).await;
    camera.send_command("go").await?;
    camera.send_command("rawbg").await?;
    camera.send_command("0 loglevel").await?;
    continuous_mode(camera, dit, Duration::ZERO).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{FluxModel, SimulatedServer, SimulatorConfig};

    #[test]
    fn formats_integration_parameters() {
        assert_eq!(integration_parameters(0.05, 500), "0.050000 1 500 lbtintpar");
    }

    #[tokio::test]
    async fn null_is_background_subtracted() {
        let config = SimulatorConfig {
            flux_model: FluxModel::Quadratic {
                null_setpoint: 0.0,
                curvature: 0.0,
                floor: 25.0,
            },
            background_adu: 100.0,
            noise_adu: 0.0,
            ..SimulatorConfig::default()
        };
        let server = Arc::new(SimulatedServer::new(config));
        let camera = NomicCamera::new(server);
        let null = camera.read_null().await.unwrap();
        assert!((null - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn go_advances_file_index() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig::default()));
        let camera = NomicCamera::new(server);
        let start = camera.file_index().await.unwrap();
        setup_sequence(&camera, 0.01, true, 7).await.unwrap();
        camera.send_command("go").await.unwrap();
        assert_eq!(camera.file_index().await.unwrap(), start + 7);
    }

    #[tokio::test]
    async fn roi_round_trip() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig::default()));
        let camera = NomicCamera::new(server);
        let roi = camera.query_roi(2).await.unwrap();
        camera
            .define_roi(Roi {
                y: roi.y + 10.0,
                ..roi
            })
            .await
            .unwrap();
        assert_eq!(camera.query_roi(2).await.unwrap().y, roi.y + 10.0);
    }
}
