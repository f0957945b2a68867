//! OPD Setpoint Search
//!
//! Finds the phase loop setpoint that minimizes the null flux:
//! 1. Scan `n_points` setpoints spaced `scan_step` apart around the estimate,
//!    averaging `n_img` flux samples at each, then return to the scan center
//! 2. Fit a parabola to (setpoint, mean flux)
//! 3. Take the vertex as the new estimate, or the lower-flux scan boundary if
//!    the fit is not a minimum inside the scanned range
//! 4. An iteration whose estimate moved by at most one scan step counts as a
//!    success; any other resets the count and the recorded estimates
//! 5. Stop after `n_confirm + 1` consecutive successes and move to the mean
//!    of the recorded estimates
//!
//! Every command is bounded by `max_step_deg`; larger moves are split.
//! The phase loop interlock is checked before the first scan, at the start
//! of every iteration and before the final move. An open loop aborts the
//! search with `InterlockOpen` and no further setpoint is commanded.
//!
//! # Configuration
//!
//! ```toml
//! [setpoint]
//! half_range_deg = 360.0
//! n_points = 5
//! n_img = 3
//! max_step_deg = 45.0
//! n_confirm = 2
//! ```

use super::{
    Procedure, ProcedureContext, ProcedureProgress, ProcedureResult, ProcedureState,
    ProcedureTypeInfo, QualityMetrics, StepResult,
};
use crate::config::SetpointConfig;
use crate::device::capabilities::{NullMonitor, PhaseInterlock, SetpointActuator};
use crate::error::NomicError;
use crate::numeric::{self, Parabola};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Pure Search Steps
// =============================================================================

/// Spacing between scan positions: `2 * half_range / (n_points - 1)`.
pub fn scan_step(half_range: f64, n_points: usize) -> f64 {
    if n_points < 2 {
        return 0.0;
    }
    2.0 * half_range / (n_points - 1) as f64
}

/// Scan positions centered on `center`, lowest first, without the
/// return-to-center step.
pub fn scan_candidates(center: f64, half_range: f64, n_points: usize) -> Vec<f64> {
    numeric::centered_grid(center, scan_step(half_range, n_points), n_points)
}

/// Setpoints to command to get from `from` to `to` without any single step
/// exceeding `max_step`. The last element is always `to`.
pub fn bounded_path(from: f64, to: f64, max_step: f64) -> Vec<f64> {
    let mut path = Vec::new();
    if max_step.is_finite() && max_step > 0.0 {
        let mut current = from;
        while (to - current).abs() > max_step {
            current += (to - current).signum() * max_step;
            path.push(current);
        }
    }
    path.push(to);
    path
}

/// Why the search fell back to a scan boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Fitted curvature is negative (a maximum)
    WrongCurvature,
    /// Fitted curvature is exactly zero
    ZeroCurvature,
    /// The vertex lies outside the scanned range
    VertexOutOfRange,
    /// The least-squares system was singular or underdetermined
    FitFailed,
}

/// Outcome of the decision rule for one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetpointDecision {
    /// The fitted minimum inside the scan range
    Vertex {
        /// New estimate (deg)
        setpoint: f64,
        /// Fitted parabola
        fit: Parabola,
    },
    /// The scan boundary with the lower flux
    Boundary {
        /// New estimate (deg)
        setpoint: f64,
        /// Why the vertex was not used
        reason: FallbackReason,
        /// Fitted parabola, when the fit succeeded
        fit: Option<Parabola>,
    },
}

impl SetpointDecision {
    /// New setpoint estimate.
    pub fn setpoint(&self) -> f64 {
        match self {
            SetpointDecision::Vertex { setpoint, .. }
            | SetpointDecision::Boundary { setpoint, .. } => *setpoint,
        }
    }

    /// Whether the vertex was used.
    pub fn is_vertex(&self) -> bool {
        matches!(self, SetpointDecision::Vertex { .. })
    }

    /// Fitted parabola, if any.
    pub fn fit(&self) -> Option<Parabola> {
        match self {
            SetpointDecision::Vertex { fit, .. } => Some(*fit),
            SetpointDecision::Boundary { fit, .. } => *fit,
        }
    }
}

/// Decision rule: the parabola vertex if the fit is a minimum inside
/// `[first, last]` candidate, otherwise the boundary candidate with the lower
/// flux (the first on a tie).
///
/// `candidates` must be sorted ascending and pair up with `flux`.
pub fn decide_setpoint(candidates: &[f64], flux: &[f64]) -> SetpointDecision {
    let n = candidates.len().min(flux.len());
    let (first, last) = match n {
        0 => (f64::NAN, f64::NAN),
        _ => (candidates[0], candidates[n - 1]),
    };
    let boundary = if n == 0 || flux[0] <= flux[n - 1] {
        first
    } else {
        last
    };
    let fallback = |reason, fit| SetpointDecision::Boundary {
        setpoint: boundary,
        reason,
        fit,
    };

    let Some(fit) = numeric::fit_parabola(&candidates[..n], &flux[..n]) else {
        return fallback(FallbackReason::FitFailed, None);
    };
    if fit.a == 0.0 {
        return fallback(FallbackReason::ZeroCurvature, Some(fit));
    }
    if fit.a < 0.0 {
        return fallback(FallbackReason::WrongCurvature, Some(fit));
    }
    match fit.vertex() {
        Some(vertex) if vertex >= first && vertex <= last => SetpointDecision::Vertex {
            setpoint: vertex,
            fit,
        },
        Some(_) => fallback(FallbackReason::VertexOutOfRange, Some(fit)),
        None => fallback(FallbackReason::FitFailed, Some(fit)),
    }
}

/// An iteration confirms the estimate only when the scan found a vertex
/// within one scan step of its center. A boundary fallback never does.
pub fn iteration_succeeded(decision: &SetpointDecision, offset: f64, step: f64) -> bool {
    decision.is_vertex() && offset <= step
}

// =============================================================================
// Iteration Record
// =============================================================================

/// Everything measured and decided in one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIteration {
    /// Iteration number (1-based)
    pub index: u32,
    /// Scan center (deg)
    pub center: f64,
    /// Scan positions (deg)
    pub candidates: Vec<f64>,
    /// Mean flux per position (ADU)
    pub mean_flux: Vec<f64>,
    /// Population standard deviation per position (ADU)
    pub flux_std: Vec<f64>,
    /// Goodness of fit, when a fit exists
    pub r_squared: Option<f64>,
    /// Decision taken
    pub decision: SetpointDecision,
    /// |center - new estimate| (deg)
    pub offset: f64,
    /// Whether the offset was within one scan step
    pub success: bool,
}

// =============================================================================
// Procedure Implementation
// =============================================================================

/// Iterative parabolic setpoint search.
pub struct SetpointSearch {
    /// Typed configuration
    params: SetpointConfig,

    /// Start from this setpoint instead of the controller's current one
    initial_setpoint: Option<f64>,

    /// Current state
    state: ProcedureState,

    /// Scan center of the first iteration (from prepare)
    start_setpoint: f64,

    /// Actuator setpoint when the search started (from prepare)
    start_position: f64,

    /// Camera integration time (from prepare)
    dit: f64,

    /// Completed iterations
    iterations: Vec<SearchIteration>,

    /// Final setpoint, once converged
    final_setpoint: Option<f64>,
}

impl SetpointSearch {
    /// Create a search with the given parameters.
    pub fn new(params: SetpointConfig) -> Self {
        Self {
            params,
            initial_setpoint: None,
            state: ProcedureState::Idle,
            start_setpoint: 0.0,
            start_position: 0.0,
            dit: 0.0,
            iterations: Vec::new(),
            final_setpoint: None,
        }
    }

    /// Start the scan at `setpoint` instead of the current controller setpoint.
    pub fn with_initial_setpoint(mut self, setpoint: f64) -> Self {
        self.initial_setpoint = Some(setpoint);
        self
    }

    /// Iterations performed so far.
    pub fn iterations(&self) -> &[SearchIteration] {
        &self.iterations
    }

    /// Converged setpoint, if the search completed.
    pub fn final_setpoint(&self) -> Option<f64> {
        self.final_setpoint
    }

    async fn require_loop_closed(&self, interlock: &dyn PhaseInterlock, when: &str) -> Result<()> {
        if interlock.is_loop_closed().await? {
            Ok(())
        } else {
            warn!(when, "Phase loop open, aborting setpoint search");
            Err(NomicError::InterlockOpen(format!("setpoint search aborted {}", when)).into())
        }
    }

    /// Command every setpoint of the bounded path; returns the new position.
    async fn move_bounded(
        &self,
        actuator: &dyn SetpointActuator,
        from: f64,
        to: f64,
    ) -> Result<f64> {
        for setpoint in bounded_path(from, to, self.params.max_step_deg) {
            actuator.command_setpoint(setpoint).await?;
        }
        Ok(to)
    }

    /// Average `n_img` null samples, one per integration.
    async fn sample_flux(&self, monitor: &dyn NullMonitor) -> Result<(f64, f64)> {
        let dit = Duration::from_secs_f64(self.dit.max(0.0));
        let mut samples = Vec::with_capacity(self.params.n_img);
        for _ in 0..self.params.n_img {
            let read_start = Instant::now();
            samples.push(monitor.read_null().await?);
            tokio::time::sleep(dit.saturating_sub(read_start.elapsed())).await;
        }
        Ok((numeric::mean(&samples), numeric::std_dev(&samples)))
    }

    async fn run_search(&mut self, ctx: &ProcedureContext) -> Result<f64> {
        let devices = ctx.devices().clone();
        let actuator = devices.actuator.as_ref();
        let interlock = devices.interlock.as_ref();
        let step = scan_step(self.params.half_range_deg, self.params.n_points);
        let max_iterations = self.params.max_iterations;
        let confirmations_needed = self.params.n_confirm as usize + 1;

        let mut estimate = self.start_setpoint;
        let mut position = self.start_position;
        let mut confirmed: Vec<f64> = Vec::new();

        self.require_loop_closed(interlock, "before the first scan")
            .await?;

        let mut index = 0u32;
        while confirmed.len() < confirmations_needed {
            if index >= max_iterations {
                self.move_bounded(actuator, position, estimate).await?;
                return Err(NomicError::SetpointNotConverged {
                    iterations: index,
                    last_setpoint: estimate,
                }
                .into());
            }
            index += 1;
            self.require_loop_closed(interlock, &format!("at iteration {}", index))
                .await?;

            let candidates =
                scan_candidates(estimate, self.params.half_range_deg, self.params.n_points);
            let mut mean_flux = Vec::with_capacity(candidates.len());
            let mut flux_std = Vec::with_capacity(candidates.len());
            for (i, &candidate) in candidates.iter().enumerate() {
                ctx.check_cancelled()?;
                ctx.update_progress(ProcedureProgress::running(
                    (index - 1) as usize,
                    max_iterations as usize,
                    "scan",
                    format!(
                        "Iteration {}: position {}/{} at {:.1} deg",
                        index,
                        i + 1,
                        candidates.len(),
                        candidate
                    ),
                ));
                position = self.move_bounded(actuator, position, candidate).await?;
                let (mean, std) = self.sample_flux(devices.null_monitor.as_ref()).await?;
                debug!(setpoint = candidate, flux = mean, std, "Scan sample");
                mean_flux.push(mean);
                flux_std.push(std);
            }
            position = self.move_bounded(actuator, position, estimate).await?;

            let decision = decide_setpoint(&candidates, &mean_flux);
            let new_estimate = decision.setpoint();
            let offset = (estimate - new_estimate).abs();
            let success = iteration_succeeded(&decision, offset, step);
            if success {
                confirmed.push(new_estimate);
                info!(
                    iteration = index,
                    setpoint = new_estimate,
                    confirmations = confirmed.len(),
                    "Setpoint iteration succeeded"
                );
            } else {
                confirmed.clear();
                info!(
                    iteration = index,
                    setpoint = new_estimate,
                    offset,
                    "Setpoint iteration failed"
                );
            }
            if let SetpointDecision::Boundary { reason, .. } = &decision {
                debug!(?reason, "Boundary fallback");
            }

            self.iterations.push(SearchIteration {
                index,
                center: estimate,
                r_squared: decision
                    .fit()
                    .map(|fit| fit.r_squared(&candidates, &mean_flux)),
                candidates,
                mean_flux,
                flux_std,
                decision,
                offset,
                success,
            });
            estimate = new_estimate;
        }

        self.require_loop_closed(interlock, "before the final move")
            .await?;
        let final_setpoint = numeric::mean(&confirmed);
        self.move_bounded(actuator, position, final_setpoint).await?;
        info!(setpoint = final_setpoint, iterations = index, "Setpoint search finished");
        Ok(final_setpoint)
    }
}

#[async_trait]
impl Procedure for SetpointSearch {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo::new(
            "setpoint_search",
            "Setpoint Search",
            "Find the OPD setpoint of the deepest null by iterated parabola fits",
            &[
                "SetpointActuator",
                "NullMonitor",
                "PhaseInterlock",
                "CameraControl",
            ],
        )
    }

    fn type_id(&self) -> &str {
        "setpoint_search"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        let p = &self.params;
        if p.n_points < 3 || p.n_points % 2 == 0 {
            return Err(anyhow!("n_points must be odd and at least 3, got {}", p.n_points));
        }
        if p.half_range_deg.is_nan() || p.half_range_deg <= 0.0 {
            return Err(anyhow!("half_range_deg must be positive"));
        }
        if p.max_step_deg.is_nan() || p.max_step_deg <= 0.0 {
            return Err(anyhow!("max_step_deg must be positive"));
        }
        if p.n_img == 0 {
            return Err(anyhow!("n_img must be at least 1"));
        }

        if ctx.devices().camera.is_integrating().await? {
            return Err(NomicError::CameraBusy.into());
        }

        let mut warnings = Vec::new();
        if p.max_step_deg > scan_step(p.half_range_deg, p.n_points) {
            warnings.push(format!(
                "max_step_deg {} exceeds the scan step; scan moves are not subdivided",
                p.max_step_deg
            ));
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        let devices = ctx.devices();
        self.dit = devices.null_monitor.integration_time().await?;
        self.start_position = devices.actuator.setpoint().await?;
        self.start_setpoint = self.initial_setpoint.unwrap_or(self.start_position);
        self.iterations.clear();
        self.final_setpoint = None;

        devices
            .camera
            .send_command(&format!(
                "1 contacq {} savedata",
                u8::from(self.params.save_data)
            ))
            .await?;
        info!(
            setpoint = self.start_setpoint,
            dit = self.dit,
            n_img = self.params.n_img,
            half_range = self.params.half_range_deg,
            n_points = self.params.n_points,
            "Searching setpoint"
        );
        Ok(())
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        let started = Instant::now();

        let outcome = self.run_search(&ctx).await;
        let final_setpoint = match outcome {
            Ok(setpoint) => setpoint,
            Err(e) => {
                self.state = ProcedureState::after_error(&e);
                return Err(e);
            }
        };
        self.final_setpoint = Some(final_setpoint);
        self.state = ProcedureState::Completed;

        let mut quality = QualityMetrics::default();
        let vertex_count = self
            .iterations
            .iter()
            .filter(|it| it.decision.is_vertex())
            .count();
        if vertex_count == self.iterations.len() {
            quality.add_pass("fit", "Every scan produced a usable parabola");
        } else {
            quality.add_warning(
                "fit",
                format!(
                    "{} of {} scans fell back to a boundary",
                    self.iterations.len() - vertex_count,
                    self.iterations.len()
                ),
            );
        }
        if let Some(r2) = self.iterations.last().and_then(|it| it.r_squared) {
            quality.add_minimum("final_fit_r_squared", r2, 0.5);
        }

        let steps = self.iterations.iter().map(|it| {
            let name = format!("iteration_{}", it.index);
            StepResult::success(name, (it.index - 1) as usize, Duration::ZERO)
                .with_data("center", it.center)
                .with_data("setpoint", it.decision.setpoint())
                .with_data("offset", it.offset)
                .with_data("success", it.success)
        });

        let iterations_json = serde_json::to_value(&self.iterations)?;
        Ok(ProcedureResult::success("setpoint_search", &ctx.procedure_id)
            .with_quality(quality)
            .with_data("initial_setpoint", self.start_setpoint)
            .with_data("final_setpoint", final_setpoint)
            .with_data("iterations", self.iterations.len())
            .with_data(
                "scan_step",
                scan_step(self.params.half_range_deg, self.params.n_points),
            )
            .with_data("search_seconds", started.elapsed().as_secs_f64())
            .with_data("iteration_log", iterations_json)
            .with_steps(steps.collect::<Vec<_>>()))
    }

    async fn finalize(&mut self, ctx: &ProcedureContext) -> Result<()> {
        if self.params.save_data {
            ctx.devices().camera.send_command("0 savedata").await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_step_spans_full_range() {
        assert_eq!(scan_step(360.0, 5), 180.0);
        assert_eq!(scan_step(10.0, 3), 10.0);
    }

    #[test]
    fn candidates_are_symmetric() {
        let c = scan_candidates(100.0, 360.0, 5);
        assert_eq!(c, vec![-260.0, -80.0, 100.0, 280.0, 460.0]);
    }

    #[test]
    fn bounded_path_splits_large_moves() {
        let path = bounded_path(0.0, 100.0, 45.0);
        assert_eq!(path, vec![45.0, 90.0, 100.0]);

        let path = bounded_path(10.0, -80.0, 45.0);
        assert_eq!(path, vec![-35.0, -80.0]);

        assert_eq!(bounded_path(5.0, 5.0, 45.0), vec![5.0]);
        assert_eq!(bounded_path(0.0, 30.0, 45.0), vec![30.0]);
    }

    #[test]
    fn bounded_path_never_exceeds_step() {
        for &(from, to, max) in &[(0.0, 1234.5, 45.0), (-720.0, 359.9, 7.5), (3.0, -3.0, 0.5)] {
            let path = bounded_path(from, to, max);
            let mut prev = from;
            for &p in &path {
                assert!((p - prev).abs() <= max + 1e-9);
                prev = p;
            }
            assert_eq!(*path.last().unwrap(), to);
        }
    }

    #[test]
    fn decides_vertex_for_minimum_inside_range() {
        let xs = scan_candidates(0.0, 360.0, 5);
        let ys: Vec<f64> = xs.iter().map(|x| 0.01 * (x - 50.0).powi(2) + 20.0).collect();
        let decision = decide_setpoint(&xs, &ys);
        assert!(decision.is_vertex());
        assert!((decision.setpoint() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn negative_curvature_takes_lower_boundary() {
        let xs = scan_candidates(0.0, 360.0, 5);
        let ys: Vec<f64> = xs.iter().map(|x| -0.01 * (x - 30.0).powi(2) + 5000.0).collect();
        let decision = decide_setpoint(&xs, &ys);
        match decision {
            SetpointDecision::Boundary { setpoint, reason, .. } => {
                assert_eq!(reason, FallbackReason::WrongCurvature);
                // Flux at -360 is lower than at +360 for a maximum at +30.
                assert_eq!(setpoint, -360.0);
            }
            other => panic!("expected boundary, got {:?}", other),
        }
    }

    #[test]
    fn vertex_outside_range_takes_boundary() {
        let xs = scan_candidates(0.0, 360.0, 5);
        let ys: Vec<f64> = xs.iter().map(|x| 0.001 * (x - 2000.0).powi(2)).collect();
        let decision = decide_setpoint(&xs, &ys);
        assert_eq!(
            decision,
            SetpointDecision::Boundary {
                setpoint: 360.0,
                reason: FallbackReason::VertexOutOfRange,
                fit: decision.fit(),
            }
        );
    }

    #[test]
    fn boundary_tie_takes_first_candidate() {
        let xs = scan_candidates(10.0, 360.0, 5);
        let ys: Vec<f64> = xs.iter().map(|x| 900.0 - (x - 10.0).powi(2) / 100.0).collect();
        let decision = decide_setpoint(&xs, &ys);
        assert!(!decision.is_vertex());
        assert_eq!(decision.setpoint(), -350.0);
    }

    #[test]
    fn boundary_fallback_never_confirms() {
        let xs = scan_candidates(0.0, 360.0, 3);
        let step = scan_step(360.0, 3);
        let ys: Vec<f64> = xs.iter().map(|x| 0.01 * (x - 5000.0).powi(2) + 40.0).collect();
        let decision = decide_setpoint(&xs, &ys);
        assert_eq!(decision.setpoint(), 360.0);

        // The boundary sits exactly one step from the center.
        let offset = decision.setpoint().abs();
        assert_eq!(offset, step);
        assert!(!iteration_succeeded(&decision, offset, step));
        assert!(!iteration_succeeded(&decision, 0.0, step));

        let ys: Vec<f64> = xs.iter().map(|x| 0.01 * (x - 100.0).powi(2) + 40.0).collect();
        let decision = decide_setpoint(&xs, &ys);
        assert!(iteration_succeeded(&decision, 100.0, step));
        assert!(!iteration_succeeded(&decision, step + 1.0, step));
    }
}
