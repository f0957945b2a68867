//! Observing procedures and the lifecycle that runs them.
//!
//! Every procedure goes through validate → prepare → execute → finalize.
//! `finalize` puts the camera, PHASECAM and the telescope back the way the
//! procedure found them and runs even when `execute` failed or was cancelled.
//!
//! ```text
//!   NullingSequence
//!     ├─ SetpointSearch ─ Acquisition(Null) ─ Nod ─ wait_phase_loop ─ ...
//!     └─ run_lifecycle() per step, on a child ProcedureContext
//!                       │
//!   DeviceSet: SetpointActuator, NullMonitor, PhaseInterlock,
//!              CameraControl, PointingControl
//! ```
//!
//! ```rust,ignore
//! let (ctx, _progress, cancel) = ProcedureContext::new("run-1", devices);
//! let mut search = SetpointSearch::new(config.setpoint.clone());
//! let result = execute_procedure_safely(&mut search, ctx, EmergencyStopFlag::new()).await?;
//! println!("{}", result.summary());
//! ```

pub mod acquisition;
pub mod dither;
pub mod loop_wait;
pub mod nod;
pub mod result;
pub mod safety;
pub mod sequence;
pub mod setpoint_search;

pub use result::{
    CheckStatus, PhaseTimings, ProcedureResult, QualityCheck, QualityMetrics, ResultValue,
    StepResult,
};
pub use safety::{EmergencyStopFlag, RunGuard};

use crate::error::NomicError;
use crate::instruments::DeviceSet;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Static description of a procedure, shown by `nomic-ops list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureTypeInfo {
    /// Identifier, same as `Procedure::type_id`.
    pub type_id: String,
    /// Display name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Device capabilities the procedure drives.
    pub capabilities: Vec<String>,
}

impl ProcedureTypeInfo {
    pub(crate) fn new(type_id: &str, name: &str, description: &str, capabilities: &[&str]) -> Self {
        Self {
            type_id: type_id.to_owned(),
            name: name.to_owned(),
            description: description.to_owned(),
            capabilities: capabilities.iter().map(|c| (*c).to_owned()).collect(),
        }
    }
}

/// Where a procedure is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    /// Not started.
    #[default]
    Idle,
    /// In `validate`.
    Validating,
    /// In `prepare`.
    Preparing,
    /// In `execute`.
    Running,
    /// In `finalize`.
    Finalizing,
    /// Finished successfully.
    Completed,
    /// Ended with an error.
    Failed,
    /// Stopped by a `CancelHandle`.
    Cancelled,
}

impl ProcedureState {
    /// State to record after `execute` returned `err`.
    pub fn after_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<NomicError>() {
            Some(NomicError::Cancelled) => ProcedureState::Cancelled,
            _ => ProcedureState::Failed,
        }
    }
}

/// Latest progress of a running procedure, published on a `watch` channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcedureProgress {
    /// Lifecycle state.
    pub state: ProcedureState,
    /// Index of the current step.
    pub step: usize,
    /// 0 when the number of steps is not known in advance.
    pub total_steps: usize,
    /// Name of the current step.
    pub step_name: String,
    /// Operator-facing status text.
    pub message: String,
}

impl ProcedureProgress {
    /// Progress of a running procedure at `step` of `total`.
    pub fn running(step: usize, total: usize, step_name: &str, message: impl Into<String>) -> Self {
        Self {
            state: ProcedureState::Running,
            step,
            total_steps: total,
            step_name: step_name.to_owned(),
            message: message.into(),
        }
    }

    /// Completed fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            (self.step as f64 / self.total_steps as f64).min(1.0)
        }
    }
}

/// An observing procedure.
///
/// `validate` may return warnings that do not stop the run. `execute` checks
/// for cancellation between device operations. `finalize` is called once
/// `execute` was entered, whatever it returned.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Static description of this procedure type.
    fn type_info() -> ProcedureTypeInfo
    where
        Self: Sized;

    /// Identifier used in results and logs.
    fn type_id(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> ProcedureState;

    /// Check parameters and device state; returned strings are warnings.
    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>>;

    /// Read the settings the run starts from (DIT, current setpoint, flags).
    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()>;

    /// Run the procedure.
    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult>;

    /// Restore camera, PHASECAM and FITS keywords.
    async fn finalize(&mut self, ctx: &ProcedureContext) -> Result<()>;
}

/// Requests cooperative cancellation, e.g. from the Ctrl-C handler.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Devices, progress reporting and cancellation for one run.
///
/// Clones and [`child`](Self::child) contexts share all three.
#[derive(Clone)]
pub struct ProcedureContext {
    /// Id of this run; `parent/step` for sequence steps.
    pub procedure_id: String,
    devices: DeviceSet,
    progress_tx: Arc<watch::Sender<ProcedureProgress>>,
    cancel_rx: watch::Receiver<bool>,
}

impl ProcedureContext {
    /// Context plus the receiving end of its progress channel and a handle
    /// that cancels it.
    pub fn new(
        procedure_id: impl Into<String>,
        devices: DeviceSet,
    ) -> (Self, watch::Receiver<ProcedureProgress>, CancelHandle) {
        let (progress_tx, progress_rx) = watch::channel(ProcedureProgress::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = Self {
            procedure_id: procedure_id.into(),
            devices,
            progress_tx: Arc::new(progress_tx),
            cancel_rx,
        };
        let cancel = CancelHandle {
            tx: Arc::new(cancel_tx),
        };
        (ctx, progress_rx, cancel)
    }

    /// Context for the step `name` of a sequence: id `parent/name`.
    pub fn child(&self, name: &str) -> Self {
        let mut child = self.clone();
        child.procedure_id = format!("{}/{}", self.procedure_id, name);
        child
    }

    /// Device capabilities.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Publish progress to the `watch` receiver.
    pub fn update_progress(&self, progress: ProcedureProgress) {
        self.progress_tx.send_replace(progress);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// `Err(NomicError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(NomicError::Cancelled.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProcedureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureContext")
            .field("procedure_id", &self.procedure_id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Run a top-level procedure.
///
/// Refuses to start while `emergency` is set. A panic inside the procedure
/// sets it, so later runs are refused until an operator resets it.
pub async fn execute_procedure_safely(
    procedure: &mut dyn Procedure,
    ctx: ProcedureContext,
    emergency: EmergencyStopFlag,
) -> Result<ProcedureResult> {
    if let Some(reason) = emergency.reason() {
        anyhow::bail!("emergency stop active: {}", reason);
    }

    let guard = emergency.guard(procedure.type_id());
    let outcome = run_lifecycle(procedure, ctx).await;
    guard.disarm();
    outcome
}

/// The lifecycle without the emergency-stop guard; sequences run their steps
/// through this.
pub(crate) async fn run_lifecycle(
    procedure: &mut dyn Procedure,
    ctx: ProcedureContext,
) -> Result<ProcedureResult> {
    let started_at = Utc::now();
    let id = procedure.type_id().to_owned();

    let warnings = procedure.validate(&ctx).await?;
    for warning in &warnings {
        tracing::warn!(procedure = %id, "{}", warning);
    }

    let phase = Instant::now();
    procedure.prepare(&ctx).await?;
    let prepare_sec = phase.elapsed().as_secs_f64();

    let phase = Instant::now();
    let executed = procedure.execute(ctx.clone()).await;
    let execute_sec = phase.elapsed().as_secs_f64();

    let phase = Instant::now();
    let finalized = procedure.finalize(&ctx).await;
    let finalize_sec = phase.elapsed().as_secs_f64();

    // An execute error wins over a finalize error.
    let mut result = match (executed, finalized) {
        (Ok(result), Ok(())) => result,
        (Ok(_), Err(e)) => {
            tracing::error!(procedure = %id, "finalize failed: {:#}", e);
            return Err(e);
        }
        (Err(e), Ok(())) => return Err(e),
        (Err(e), Err(finalize_err)) => {
            tracing::error!(procedure = %id, "finalize failed: {:#}", finalize_err);
            return Err(e);
        }
    };

    let mut all_warnings = warnings;
    all_warnings.append(&mut result.warnings);
    result.warnings = all_warnings;
    result.timing = PhaseTimings {
        started_at: Some(started_at),
        finished_at: Some(Utc::now()),
        prepare_sec,
        execute_sec,
        finalize_sec,
    };
    Ok(result)
}
