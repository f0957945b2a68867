//! Telescope Nods and Background Offsets
//!
//! A nod moves the target between two detector positions. Before moving,
//! the camera takes a fresh display background so the nodded frames can be
//! monitored. For a nod of both sides the PHASECAM pupil wheel, the
//! PHASECAM beam 2 position and the NOMIC ROIs follow the target; a
//! single-side nod only moves that side of the telescope.
//!
//! A background offset moves both sides far enough that the target leaves
//! the field, then waits for the AO loops to recover.

use super::{
    Procedure, ProcedureContext, ProcedureProgress, ProcedureResult, ProcedureState,
    ProcedureTypeInfo, StepResult,
};
use crate::config::{CameraConfig, TelescopeConfig};
use crate::device::capabilities::TelescopeSide;
use crate::error::NomicError;
use crate::instruments::nomic::take_display_background;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// ROIs that follow the target: two background regions and the source.
pub const NOD_ROIS: [u32; 3] = [1, 2, 3];

/// Direction of a nod along detector Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodDirection {
    /// +Y
    Up,
    /// -Y
    Down,
}

impl NodDirection {
    /// +1 for up, -1 for down.
    pub fn sign(&self) -> f64 {
        match self {
            NodDirection::Up => 1.0,
            NodDirection::Down => -1.0,
        }
    }

    /// The other direction.
    pub fn opposite(&self) -> Self {
        match self {
            NodDirection::Up => NodDirection::Down,
            NodDirection::Down => NodDirection::Up,
        }
    }
}

impl fmt::Display for NodDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodDirection::Up => "up",
            NodDirection::Down => "down",
        })
    }
}

impl FromStr for NodDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "up" => Ok(NodDirection::Up),
            "down" => Ok(NodDirection::Down),
            other => Err(anyhow!("unknown nod direction '{}': expected up or down", other)),
        }
    }
}

/// ROI shift in pixels for a nod throw, truncated toward zero.
pub fn roi_shift_pixels(nod_throw_arcsec: f64, pixel_scale_arcsec: f64) -> f64 {
    (nod_throw_arcsec / pixel_scale_arcsec).trunc()
}

/// Nod the telescope and move the instrument along with it.
pub struct Nod {
    direction: NodDirection,
    side: TelescopeSide,
    move_telescope: bool,
    telescope: TelescopeConfig,
    camera: CameraConfig,
    state: ProcedureState,
    dit: f64,
}

impl Nod {
    /// Nod both sides in `direction`.
    pub fn new(direction: NodDirection, telescope: TelescopeConfig, camera: CameraConfig) -> Self {
        Self {
            direction,
            side: TelescopeSide::Both,
            move_telescope: true,
            telescope,
            camera,
            state: ProcedureState::Idle,
            dit: 0.0,
        }
    }

    /// Nod one side only.
    pub fn with_side(mut self, side: TelescopeSide) -> Self {
        self.side = side;
        self
    }

    /// Leave the telescope alone and only move PHASECAM and the ROIs, e.g.
    /// after the telescope was nodded by hand.
    pub fn without_telescope(mut self) -> Self {
        self.move_telescope = false;
        self
    }

    /// Direction of this nod.
    pub fn direction(&self) -> NodDirection {
        self.direction
    }

    fn report(&self, ctx: &ProcedureContext, step: usize, name: &str, message: &str) {
        ctx.update_progress(ProcedureProgress::running(step, 4, name, message));
    }
}

#[async_trait]
impl Procedure for Nod {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo::new(
            "nod",
            "Nod",
            "Nod the telescope and follow with PHASECAM and the NOMIC ROIs",
            &["CameraControl", "PointingControl", "PhaseInterlock"],
        )
    }

    fn type_id(&self) -> &str {
        "nod"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        if self.telescope.pixel_scale_arcsec.is_nan() || self.telescope.pixel_scale_arcsec <= 0.0 {
            return Err(anyhow!("pixel_scale_arcsec must be positive"));
        }
        if ctx.devices().camera.is_integrating().await? {
            return Err(NomicError::CameraBusy.into());
        }
        let mut warnings = Vec::new();
        if !self.move_telescope && self.side != TelescopeSide::Both {
            warnings.push(format!(
                "Nod of the {} side without moving the telescope does nothing",
                self.side.as_str()
            ));
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        self.dit = ctx.devices().camera.integration_time().await?;
        info!(
            direction = %self.direction,
            side = self.side.as_str(),
            move_telescope = self.move_telescope,
            nod_throw = self.telescope.nod_throw,
            "Nodding"
        );
        Ok(())
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        let started = Instant::now();
        let devices = ctx.devices().clone();
        let sign = self.direction.sign();
        let both = self.side == TelescopeSide::Both;
        let mut result = ProcedureResult::success("nod", &ctx.procedure_id)
            .with_data("direction", self.direction.to_string())
            .with_data("side", self.side.as_str())
            .with_data("move_telescope", self.move_telescope);

        self.report(&ctx, 0, "background", "Taking display background");
        take_display_background(devices.camera.as_ref(), self.dit, self.camera.settle()).await?;
        result = result.with_step(StepResult::success("background", 0, started.elapsed()));

        // Positions are read before the loop opens.
        let positions = if both {
            Some((
                devices.pointing.opw_position().await?,
                devices.pointing.beam2_y().await?,
            ))
        } else {
            None
        };

        self.report(&ctx, 1, "open_loop", "Opening phase loop");
        devices.interlock.open_loop().await?;

        if let Some((opw, _)) = positions {
            let target = opw - (sign as i64) * self.telescope.opw_offset_nod;
            devices.pointing.move_opw(target).await?;
            result = result.with_data("opw_position", target);
        }

        if self.move_telescope {
            self.report(&ctx, 2, "offset", "Offsetting telescope");
            let dy = sign * self.telescope.nod_throw;
            devices.pointing.offset_pointing(0.0, dy, self.side).await?;
            result = result
                .with_data("offset_y_arcsec", dy)
                .with_step(StepResult::success("offset", 1, started.elapsed()));
        }

        if let Some((_, beam2_y)) = positions {
            self.report(&ctx, 3, "phasecam", "Moving PHASECAM beam 2 and ROIs");
            let beam2 = beam2_y + sign * self.telescope.phasecam_beam2_offset_nod;
            devices.pointing.set_beam2_y(beam2).await?;

            let shift = sign
                * roi_shift_pixels(self.telescope.nod_throw, self.telescope.pixel_scale_arcsec);
            for id in NOD_ROIS {
                let mut roi = devices.camera.query_roi(id).await?;
                roi.y += shift;
                debug!(roi = id, y = roi.y, "Moving ROI");
                devices.camera.define_roi(roi).await?;
            }
            result = result
                .with_data("beam2_y", beam2)
                .with_data("roi_shift_pixels", shift)
                .with_step(StepResult::success("phasecam", 2, started.elapsed()));
        }

        self.state = ProcedureState::Completed;
        info!(direction = %self.direction, "Nod finished");
        Ok(result)
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        Ok(())
    }
}

/// Move both sides off source for a sky background.
pub struct BackgroundOffset {
    direction: NodDirection,
    telescope: TelescopeConfig,
    camera: CameraConfig,
    state: ProcedureState,
    dit: f64,
}

impl BackgroundOffset {
    /// Offset in `direction` by `off_throw`.
    pub fn new(direction: NodDirection, telescope: TelescopeConfig, camera: CameraConfig) -> Self {
        Self {
            direction,
            telescope,
            camera,
            state: ProcedureState::Idle,
            dit: 0.0,
        }
    }

    async fn wait_for_ao(&self, ctx: &ProcedureContext) -> Result<Duration> {
        let started = Instant::now();
        let timeout = self.camera.loop_wait_timeout();
        while !ctx.devices().pointing.ao_loops_closed().await? {
            ctx.check_cancelled()?;
            if started.elapsed() >= timeout {
                return Err(NomicError::Timeout {
                    what: "AO loops to close".to_string(),
                    seconds: timeout.as_secs_f64(),
                }
                .into());
            }
            debug!("Waiting for AO loops to close");
            tokio::time::sleep(self.camera.loop_poll_interval()).await;
        }
        Ok(started.elapsed())
    }
}

#[async_trait]
impl Procedure for BackgroundOffset {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo::new(
            "background_offset",
            "Background Offset",
            "Offset both sides off source and wait for the AO loops",
            &["CameraControl", "PointingControl", "PhaseInterlock"],
        )
    }

    fn type_id(&self) -> &str {
        "background_offset"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        if ctx.devices().camera.is_integrating().await? {
            return Err(NomicError::CameraBusy.into());
        }
        Ok(Vec::new())
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        self.dit = ctx.devices().camera.integration_time().await?;
        info!(
            direction = %self.direction,
            off_throw = self.telescope.off_throw,
            "Offsetting the telescope"
        );
        Ok(())
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        let devices = ctx.devices().clone();

        take_display_background(devices.camera.as_ref(), self.dit, self.camera.settle()).await?;
        devices.interlock.open_loop().await?;
        let dy = self.direction.sign() * self.telescope.off_throw;
        devices
            .pointing
            .offset_pointing(0.0, dy, TelescopeSide::Both)
            .await?;

        ctx.update_progress(ProcedureProgress::running(1, 2, "ao_wait", "Waiting for AO loops"));
        let waited = match self.wait_for_ao(&ctx).await {
            Ok(waited) => waited,
            Err(e) => {
                self.state = ProcedureState::Failed;
                return Err(e);
            }
        };
        info!(waited_sec = waited.as_secs_f64(), "AO loops closed, offset finished");
        self.state = ProcedureState::Completed;

        Ok(ProcedureResult::success("background_offset", &ctx.procedure_id)
            .with_data("direction", self.direction.to_string())
            .with_data("offset_y_arcsec", dy)
            .with_data("ao_wait_sec", waited.as_secs_f64()))
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_signs() {
        assert_eq!(NodDirection::Up.sign(), 1.0);
        assert_eq!(NodDirection::Down.sign(), -1.0);
        assert_eq!(NodDirection::Up.opposite(), NodDirection::Down);
        assert_eq!("DOWN".parse::<NodDirection>().unwrap(), NodDirection::Down);
        assert!("left".parse::<NodDirection>().is_err());
    }

    #[test]
    fn roi_shift_truncates() {
        assert_eq!(roi_shift_pixels(2.3, 0.018), 127.0);
        assert_eq!(roi_shift_pixels(0.01, 0.018), 0.0);
    }
}
