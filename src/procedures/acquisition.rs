//! Camera Acquisitions
//!
//! Darks, nulls, photometry and backgrounds share one integration flow:
//!
//! 1. Read the DIT the operator set on the camera
//! 2. Label the frames (`FLAG=DRK` plus the blank filter for darks, `OBSTYPE`
//!    otherwise)
//! 3. Safe state, sequence setup, `go`
//! 4. If the integration fails, count the frames already written from the
//!    file index and retry the remainder, up to `max_recovery_attempts` times
//! 5. Restore the labels and return the camera to continuous acquisition
//!
//! Null acquisitions run the OPD dither pattern alongside the integration
//! when it is enabled.

use super::dither::{DitherHandle, DitherReport, OpdDither};
use super::{
    Procedure, ProcedureContext, ProcedureProgress, ProcedureResult, ProcedureState,
    ProcedureTypeInfo, StepResult,
};
use crate::config::{CameraConfig, DitherConfig};
use crate::device::capabilities::CameraControl;
use crate::error::NomicError;
use crate::instruments::nomic::{continuous_mode, safe_state, setup_sequence};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};

/// FITS comment of the `FLAG` keyword.
const FLAG_COMMENT: &str = "SCI/CAL/DRK/FLT";
/// FITS comment of the `OBSTYPE` keyword.
const OBSTYPE_COMMENT: &str = "observation type";
/// `OBSTYPE` once an acquisition is over.
const OBSTYPE_UNDEFINED: &str = "4";

/// What an acquisition records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionKind {
    /// Detector darks behind the blank filter
    Dark,
    /// Nulled science frames
    Null,
    /// Photometry with one side nodded away
    Photometry,
    /// Off-source sky background
    Background,
}

impl AcquisitionKind {
    /// `OBSTYPE` header value; darks are labelled through `FLAG` instead.
    pub fn obstype(&self) -> Option<&'static str> {
        match self {
            AcquisitionKind::Dark => None,
            AcquisitionKind::Null => Some("2"),
            AcquisitionKind::Photometry => Some("0"),
            AcquisitionKind::Background => Some("3"),
        }
    }

    /// Configured number of frames for this kind.
    pub fn n_sequences(&self, camera: &CameraConfig) -> u32 {
        match self {
            AcquisitionKind::Dark => camera.n_sequences_dark,
            AcquisitionKind::Null => camera.n_sequences_null,
            AcquisitionKind::Photometry => camera.n_sequences_phot,
            AcquisitionKind::Background => camera.n_sequences_bkgd,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionKind::Dark => "dark",
            AcquisitionKind::Null => "null",
            AcquisitionKind::Photometry => "photometry",
            AcquisitionKind::Background => "background",
        }
    }
}

impl fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcquisitionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dark" | "darks" => Ok(AcquisitionKind::Dark),
            "null" => Ok(AcquisitionKind::Null),
            "photometry" | "phot" => Ok(AcquisitionKind::Photometry),
            "background" | "bkgd" => Ok(AcquisitionKind::Background),
            other => Err(anyhow!(
                "unknown acquisition kind '{}': expected dark, null, photometry or background",
                other
            )),
        }
    }
}

/// Frame accounting of one acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCount {
    /// Frames requested
    pub requested: u32,
    /// Frames written
    pub taken: u32,
    /// Retries after a failed integration
    pub recovery_attempts: u32,
}

/// One camera acquisition.
pub struct Acquisition {
    kind: AcquisitionKind,
    camera_config: CameraConfig,
    dither_config: Option<DitherConfig>,
    n_sequences: u32,
    state: ProcedureState,
    dit: f64,
    previous_flag: Option<String>,
    labelled: bool,
    frames: FrameCount,
    dither: Option<DitherHandle>,
    dither_report: Option<DitherReport>,
}

impl Acquisition {
    /// Acquisition of `kind` with the configured frame count.
    pub fn new(kind: AcquisitionKind, camera: CameraConfig) -> Self {
        let n_sequences = kind.n_sequences(&camera);
        Self {
            kind,
            camera_config: camera,
            dither_config: None,
            n_sequences,
            state: ProcedureState::Idle,
            dit: 0.0,
            previous_flag: None,
            labelled: false,
            frames: FrameCount::default(),
            dither: None,
            dither_report: None,
        }
    }

    /// Override the number of frames.
    pub fn with_frames(mut self, n_sequences: u32) -> Self {
        self.n_sequences = n_sequences;
        self
    }

    /// Dither the OPD during null acquisitions; ignored for other kinds and
    /// when the dither is disabled.
    pub fn with_dither(mut self, dither: DitherConfig) -> Self {
        if self.kind == AcquisitionKind::Null && dither.enabled {
            self.dither_config = Some(dither);
        }
        self
    }

    /// Kind of this acquisition.
    pub fn kind(&self) -> AcquisitionKind {
        self.kind
    }

    /// Frame accounting so far.
    pub fn frames(&self) -> FrameCount {
        self.frames
    }

    async fn label(&mut self, camera: &dyn CameraControl) -> Result<()> {
        match self.kind.obstype() {
            None => {
                safe_state(camera, self.dit).await?;
                info!(filter = %self.camera_config.dark_filter, "Moving in blank filter");
                camera
                    .move_filter_wheel(&self.camera_config.dark_filter)
                    .await?;
                camera.set_fits_keyword("FLAG", "DRK", FLAG_COMMENT).await?;
            }
            Some(obstype) => {
                camera
                    .set_fits_keyword("OBSTYPE", obstype, OBSTYPE_COMMENT)
                    .await?;
            }
        }
        self.labelled = true;
        Ok(())
    }

    async fn restore_labels(&mut self, camera: &dyn CameraControl) -> Result<()> {
        if !self.labelled {
            return Ok(());
        }
        match self.kind {
            AcquisitionKind::Dark => {
                info!(filter = %self.camera_config.open_filter, "Opening filter wheel 2");
                camera
                    .move_filter_wheel(&self.camera_config.open_filter)
                    .await?;
                let flag = self.previous_flag.as_deref().unwrap_or("SCI");
                camera.set_fits_keyword("FLAG", flag, FLAG_COMMENT).await?;
            }
            _ => {
                camera
                    .set_fits_keyword("OBSTYPE", OBSTYPE_UNDEFINED, OBSTYPE_COMMENT)
                    .await?;
            }
        }
        self.labelled = false;
        Ok(())
    }

    /// Integrate, retrying the remaining frames after a failure.
    async fn integrate(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let camera = ctx.devices().camera.clone();
        let camera = camera.as_ref();
        let settle = self.camera_config.settle();
        let requested = self.frames.requested;

        loop {
            ctx.check_cancelled()?;
            let remaining = requested.saturating_sub(self.frames.taken);
            if remaining == 0 {
                return Ok(());
            }
            ctx.update_progress(ProcedureProgress::running(
                self.frames.taken as usize,
                requested as usize,
                "integrate",
                format!("Taking {} {} frames", remaining, self.kind),
            ));

            let start_index = camera.file_index().await?;
            safe_state(camera, self.dit).await?;
            setup_sequence(camera, self.dit, self.camera_config.save_data, remaining).await?;
            tokio::time::sleep(settle).await;

            match camera.send_command("go").await {
                Ok(()) => {
                    self.frames.taken += remaining;
                    return Ok(());
                }
                Err(e) => {
                    let written = (camera.file_index().await? - start_index)
                        .clamp(0, i64::from(remaining));
                    self.frames.taken += written as u32;
                    warn!(
                        kind = %self.kind,
                        written,
                        taken = self.frames.taken,
                        requested,
                        "Integration failed: {:#}",
                        e
                    );
                    continuous_mode(camera, self.dit, settle).await?;
                    if self.frames.recovery_attempts >= self.camera_config.max_recovery_attempts {
                        return Err(e).context(format!(
                            "{} acquisition failed after {} recovery attempts ({} of {} frames taken)",
                            self.kind, self.frames.recovery_attempts, self.frames.taken, requested
                        ));
                    }
                    self.frames.recovery_attempts += 1;
                    info!(
                        attempt = self.frames.recovery_attempts,
                        remaining = requested - self.frames.taken,
                        "Retrying remaining frames"
                    );
                }
            }
        }
    }

    async fn stop_dither(&mut self) -> Result<()> {
        if let Some(handle) = self.dither.take() {
            let report = handle.stop().await?;
            info!(
                steps = report.steps,
                drift_warnings = report.drift_warnings,
                end = ?report.end,
                "OPD dither stopped"
            );
            self.dither_report = Some(report);
        }
        Ok(())
    }
}

#[async_trait]
impl Procedure for Acquisition {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo::new(
            "acquisition",
            "Acquisition",
            "Take darks, nulls, photometry or backgrounds with NOMIC",
            &["CameraControl", "SetpointActuator"],
        )
    }

    fn type_id(&self) -> &str {
        "acquisition"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        if self.n_sequences == 0 {
            return Err(anyhow!("{} acquisition needs at least one frame", self.kind));
        }
        if ctx.devices().camera.is_integrating().await? {
            return Err(NomicError::CameraBusy.into());
        }

        let mut warnings = Vec::new();
        if self.kind == AcquisitionKind::Null && self.dither_config.is_none() {
            warnings.push("OPD dither disabled for this null acquisition".to_string());
        }
        if !self.camera_config.save_data {
            warnings.push(format!("{} frames will not be saved", self.kind));
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        let camera = ctx.devices().camera.as_ref();
        self.dit = camera.integration_time().await?;
        self.frames = FrameCount {
            requested: self.n_sequences,
            ..FrameCount::default()
        };
        self.dither_report = None;
        if self.kind == AcquisitionKind::Dark {
            self.previous_flag = camera.fits_keyword("FLAG").await.ok();
        }
        info!(
            kind = %self.kind,
            frames = self.n_sequences,
            dit = self.dit,
            save = self.camera_config.save_data,
            dither = self.dither_config.is_some(),
            "Setting up NOMIC"
        );
        Ok(())
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        let started = Instant::now();
        let camera = ctx.devices().camera.clone();

        self.label(camera.as_ref()).await?;
        if let Some(dither) = self.dither_config.clone() {
            self.dither = Some(OpdDither::new(dither).spawn(ctx.devices().clone()));
            tokio::time::sleep(self.camera_config.settle()).await;
        }

        let outcome = self.integrate(&ctx).await;
        self.stop_dither().await?;
        if let Err(e) = outcome {
            self.state = ProcedureState::after_error(&e);
            return Err(e);
        }
        self.state = ProcedureState::Completed;
        info!(kind = %self.kind, frames = self.frames.taken, "Integration finished");

        let mut result = ProcedureResult::success("acquisition", &ctx.procedure_id)
            .with_data("kind", self.kind.as_str())
            .with_data("dit", self.dit)
            .with_data("frames_requested", self.frames.requested)
            .with_data("frames_taken", self.frames.taken)
            .with_data("recovery_attempts", self.frames.recovery_attempts)
            .with_step(
                StepResult::success("integrate", 0, started.elapsed())
                    .with_data("frames", self.frames.taken),
            );
        if self.frames.recovery_attempts > 0 {
            result = result.with_warning(format!(
                "Integration recovered after {} failure(s)",
                self.frames.recovery_attempts
            ));
        }
        if let Some(report) = &self.dither_report {
            result = result
                .with_data("dither_steps", report.steps)
                .with_data("dither_drift_warnings", report.drift_warnings);
        }
        Ok(result)
    }

    async fn finalize(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let camera = ctx.devices().camera.clone();
        let dither = self.stop_dither().await;
        let labels = self.restore_labels(camera.as_ref()).await;
        continuous_mode(camera.as_ref(), self.dit, self.camera_config.settle()).await?;
        dither?;
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_and_label() {
        assert_eq!("darks".parse::<AcquisitionKind>().unwrap(), AcquisitionKind::Dark);
        assert_eq!("NULL".parse::<AcquisitionKind>().unwrap(), AcquisitionKind::Null);
        assert!("flat".parse::<AcquisitionKind>().is_err());
        assert_eq!(AcquisitionKind::Null.obstype(), Some("2"));
        assert_eq!(AcquisitionKind::Photometry.obstype(), Some("0"));
        assert_eq!(AcquisitionKind::Background.obstype(), Some("3"));
        assert_eq!(AcquisitionKind::Dark.obstype(), None);
    }

    #[test]
    fn frame_counts_follow_config() {
        let camera = CameraConfig::default();
        let acq = Acquisition::new(AcquisitionKind::Photometry, camera.clone());
        assert_eq!(acq.n_sequences, camera.n_sequences_phot);
        let acq = Acquisition::new(AcquisitionKind::Dark, camera).with_frames(7);
        assert_eq!(acq.n_sequences, 7);
    }

    #[test]
    fn dither_only_for_nulls() {
        let camera = CameraConfig::default();
        let acq = Acquisition::new(AcquisitionKind::Dark, camera.clone())
            .with_dither(DitherConfig::default());
        assert!(acq.dither_config.is_none());
        let acq = Acquisition::new(AcquisitionKind::Null, camera)
            .with_dither(DitherConfig::default());
        assert!(acq.dither_config.is_some());
    }
}
