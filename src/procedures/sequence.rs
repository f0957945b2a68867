//! Automated Nulling Sequence
//!
//! One target's worth of nulling observations:
//!
//! ```text
//! for each nod position:
//!     setpoint search → null acquisition
//!     (not after the last) nod up/down → settle → wait for phase loop
//! photometry:  nod left side down → wait AO → photometry → nod left side up → wait AO
//! background:  offset up → wait AO → background → offset down → wait AO
//! nod back to the starting position if needed
//! ```
//!
//! Each step is a full procedure run with its own finalization. The first
//! failing step aborts the sequence.

use super::acquisition::{Acquisition, AcquisitionKind};
use super::loop_wait::{wait_ao_loop, wait_phase_loop};
use super::nod::{BackgroundOffset, Nod, NodDirection};
use super::setpoint_search::SetpointSearch;
use super::{
    run_lifecycle, Procedure, ProcedureContext, ProcedureProgress, ProcedureResult,
    ProcedureState, ProcedureTypeInfo, StepResult,
};
use crate::config::ObservingConfig;
use crate::device::capabilities::TelescopeSide;
use crate::error::NomicError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Instant;
use tracing::info;

/// Full nulling observation of one target.
pub struct NullingSequence {
    config: ObservingConfig,
    state: ProcedureState,
    steps: Vec<StepResult>,
    warnings: Vec<String>,
    setpoints: Vec<f64>,
    null_frames: u32,
    wait_frames: u32,
    started: Option<Instant>,
}

impl NullingSequence {
    /// Create a sequence from the observing configuration.
    pub fn new(config: ObservingConfig) -> Self {
        Self {
            config,
            state: ProcedureState::Idle,
            steps: Vec::new(),
            warnings: Vec::new(),
            setpoints: Vec::new(),
            null_frames: 0,
            wait_frames: 0,
            started: None,
        }
    }

    /// Number of sub-procedures the sequence will run.
    pub fn planned_steps(&self) -> usize {
        let n = self.config.sequence.nod_positions as usize;
        let nods = n.saturating_sub(1);
        let mut steps = 2 * n + nods;
        // Nods alternate up/down, so an odd count leaves the telescope off start.
        if nods % 2 == 1 {
            steps += 1;
        }
        if self.config.sequence.take_photometry {
            steps += 3;
        }
        if self.config.sequence.take_background {
            steps += 3;
        }
        steps
    }

    fn elapsed(&self) -> std::time::Duration {
        self.started.map(|t| t.elapsed()).unwrap_or_default()
    }

    async fn run_step(
        &mut self,
        ctx: &ProcedureContext,
        name: String,
        procedure: &mut dyn Procedure,
    ) -> Result<ProcedureResult> {
        let index = self.steps.len();
        ctx.check_cancelled()?;
        ctx.update_progress(ProcedureProgress::running(
            index,
            self.planned_steps(),
            &name,
            format!("Running {}", name),
        ));

        let step_started = Instant::now();
        match run_lifecycle(procedure, ctx.child(&name)).await {
            Ok(result) => {
                self.warnings
                    .extend(result.warnings.iter().map(|w| format!("{}: {}", name, w)));
                self.steps.push(
                    StepResult::success(name, index, step_started.elapsed())
                        .with_data("procedure", result.procedure_type.as_str()),
                );
                Ok(result)
            }
            Err(e) => {
                self.steps.push(StepResult::failure(
                    name.clone(),
                    index,
                    step_started.elapsed(),
                    format!("{:#}", e),
                ));
                Err(e).with_context(|| format!("sequence step '{}' failed", name))
            }
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(self.config.sequence.nod_settle()).await;
    }

    async fn observe_nulls(&mut self, ctx: &ProcedureContext) -> Result<i32> {
        let n = self.config.sequence.nod_positions;
        let mut direction = NodDirection::Up;
        let mut nod_offset = 0;

        for position in 1..=n {
            let mut search = SetpointSearch::new(self.config.setpoint.clone());
            let result = self
                .run_step(ctx, format!("setpoint_{}", position), &mut search)
                .await?;
            if let Some(setpoint) = result.get_f64("final_setpoint") {
                self.setpoints.push(setpoint);
            }

            let mut null = Acquisition::new(AcquisitionKind::Null, self.config.camera.clone())
                .with_dither(self.config.dither.clone());
            let result = self
                .run_step(ctx, format!("null_{}", position), &mut null)
                .await?;
            self.null_frames += result.get_i64("frames_taken").unwrap_or(0) as u32;

            if position < n {
                let mut nod = Nod::new(
                    direction,
                    self.config.telescope.clone(),
                    self.config.camera.clone(),
                );
                self.run_step(ctx, format!("nod_{}_{}", position, direction), &mut nod)
                    .await?;
                nod_offset += direction.sign() as i32;
                direction = direction.opposite();

                self.settle().await;
                self.wait_frames += wait_phase_loop(
                    ctx.devices(),
                    &self.config.camera,
                    self.config.sequence.background_while_waiting,
                )
                .await?;
            }
        }
        Ok(nod_offset)
    }

    async fn observe_photometry(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let telescope = &self.config.telescope;
        let camera = &self.config.camera;

        let mut away = Nod::new(NodDirection::Down, telescope.clone(), camera.clone())
            .with_side(TelescopeSide::Left);
        self.run_step(ctx, "photometry_nod_away".to_string(), &mut away)
            .await?;
        self.settle().await;
        wait_ao_loop(ctx.devices(), &self.config.camera, false).await?;
        self.settle().await;

        let mut phot = Acquisition::new(AcquisitionKind::Photometry, self.config.camera.clone());
        self.run_step(ctx, "photometry".to_string(), &mut phot).await?;

        let mut back = Nod::new(
            NodDirection::Up,
            self.config.telescope.clone(),
            self.config.camera.clone(),
        )
        .with_side(TelescopeSide::Left);
        self.run_step(ctx, "photometry_nod_back".to_string(), &mut back)
            .await?;
        self.settle().await;
        wait_ao_loop(ctx.devices(), &self.config.camera, false).await?;
        Ok(())
    }

    async fn observe_background(&mut self, ctx: &ProcedureContext) -> Result<()> {
        let mut off = BackgroundOffset::new(
            NodDirection::Up,
            self.config.telescope.clone(),
            self.config.camera.clone(),
        );
        self.run_step(ctx, "background_offset".to_string(), &mut off)
            .await?;
        self.settle().await;

        let mut bkgd = Acquisition::new(AcquisitionKind::Background, self.config.camera.clone());
        self.run_step(ctx, "background".to_string(), &mut bkgd)
            .await?;

        let mut back = BackgroundOffset::new(
            NodDirection::Down,
            self.config.telescope.clone(),
            self.config.camera.clone(),
        );
        self.run_step(ctx, "background_return".to_string(), &mut back)
            .await?;
        self.settle().await;
        Ok(())
    }
}

#[async_trait]
impl Procedure for NullingSequence {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo::new(
            "nulling_sequence",
            "Nulling Sequence",
            "Setpoint searches, nulls and nods, then photometry and background",
            &[
                "SetpointActuator",
                "NullMonitor",
                "PhaseInterlock",
                "CameraControl",
                "PointingControl",
            ],
        )
    }

    fn type_id(&self) -> &str {
        "nulling_sequence"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        self.config
            .validate()
            .map_err(|e| anyhow!("invalid observing configuration: {}", e))?;
        if self.config.sequence.nod_positions == 0 {
            return Err(anyhow!("nod_positions must be at least 1"));
        }
        if ctx.devices().camera.is_integrating().await? {
            return Err(NomicError::CameraBusy.into());
        }
        let mut warnings = Vec::new();
        if !self.config.camera.save_data {
            warnings.push("Camera data will not be saved".to_string());
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        self.steps.clear();
        self.warnings.clear();
        self.setpoints.clear();
        self.null_frames = 0;
        self.wait_frames = 0;
        info!(
            nod_positions = self.config.sequence.nod_positions,
            photometry = self.config.sequence.take_photometry,
            background = self.config.sequence.take_background,
            steps = self.planned_steps(),
            "Starting nulling sequence"
        );
        Ok(())
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        self.started = Some(Instant::now());

        let outcome = async {
            let nod_offset = self.observe_nulls(&ctx).await?;
            if self.config.sequence.take_photometry {
                self.observe_photometry(&ctx).await?;
            }
            if self.config.sequence.take_background {
                self.observe_background(&ctx).await?;
            }
            if nod_offset != 0 {
                let direction = if nod_offset > 0 {
                    NodDirection::Down
                } else {
                    NodDirection::Up
                };
                let mut reset = Nod::new(
                    direction,
                    self.config.telescope.clone(),
                    self.config.camera.clone(),
                );
                self.run_step(&ctx, "nod_to_start".to_string(), &mut reset)
                    .await?;
                wait_ao_loop(ctx.devices(), &self.config.camera, false).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = outcome {
            self.state = ProcedureState::after_error(&e);
            return Err(e);
        }
        self.state = ProcedureState::Completed;
        info!(
            positions = self.setpoints.len(),
            null_frames = self.null_frames,
            elapsed_sec = self.elapsed().as_secs_f64(),
            "Nulling sequence finished"
        );

        Ok(ProcedureResult::success("nulling_sequence", &ctx.procedure_id)
            .with_data("positions", self.setpoints.len())
            .with_data("setpoints", self.setpoints.clone())
            .with_data("null_frames", self.null_frames)
            .with_data("background_frames_while_waiting", self.wait_frames)
            .with_warnings(self.warnings.clone())
            .with_steps(self.steps.clone()))
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_every_step() {
        let mut config = ObservingConfig::default();
        config.sequence.nod_positions = 4;
        let seq = NullingSequence::new(config.clone());
        // 4 searches + 4 nulls + 3 nods + 3 photometry + 3 background + nod back
        assert_eq!(seq.planned_steps(), 18);

        config.sequence.take_photometry = false;
        config.sequence.take_background = false;
        config.sequence.nod_positions = 1;
        assert_eq!(NullingSequence::new(config.clone()).planned_steps(), 2);

        config.sequence.nod_positions = 3;
        assert_eq!(NullingSequence::new(config).planned_steps(), 8);
    }
}
