//! What a procedure run reports back.
//!
//! A [`ProcedureResult`] is what the CLI prints (or dumps with `--json`) and
//! what the nulling sequence reads setpoints and frame counts from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of one procedure run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureResult {
    /// `type_id` of the procedure that ran
    pub procedure_type: String,
    /// Context id the run was started with
    pub execution_id: String,
    /// Whether the run completed.
    pub success: bool,
    /// Error text of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Named outputs: setpoints, frame counts, iteration logs.
    #[serde(default)]
    pub data: BTreeMap<String, ResultValue>,
    /// Non-fatal problems, validation warnings first.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Step breakdown.
    #[serde(default)]
    pub steps: Vec<StepResult>,
    /// Checks on the procedure's own output.
    #[serde(default)]
    pub checks: QualityMetrics,
    /// Lifecycle timings.
    #[serde(default)]
    pub timing: PhaseTimings,
}

impl ProcedureResult {
    /// Successful, empty result.
    pub fn success(procedure_type: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            execution_id: execution_id.into(),
            success: true,
            error: None,
            data: BTreeMap::new(),
            warnings: Vec::new(),
            steps: Vec::new(),
            checks: QualityMetrics::default(),
            timing: PhaseTimings::default(),
        }
    }

    /// Result for a run that ended in `error`.
    pub fn failure(
        procedure_type: impl Into<String>,
        execution_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::success(procedure_type, execution_id);
        result.success = false;
        result.error = Some(error.into());
        result
    }

    /// Add a named output.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Add a warning.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Add several warnings.
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Attach quality checks.
    pub fn with_quality(mut self, checks: QualityMetrics) -> Self {
        self.checks = checks;
        self
    }

    /// Add a step.
    pub fn with_step(mut self, step: StepResult) -> Self {
        self.steps.push(step);
        self
    }

    /// Add several steps.
    pub fn with_steps(mut self, steps: impl IntoIterator<Item = StepResult>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Numeric output; integers widen to `f64`.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(ResultValue::as_f64)
    }

    /// Integer output.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.data.get(key) {
            Some(ResultValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// One-line report for the terminal.
    pub fn summary(&self) -> String {
        match (&self.error, self.success) {
            (Some(error), false) => format!("{}: failed ({})", self.procedure_type, error),
            (None, false) => format!("{}: failed", self.procedure_type),
            _ => {
                let mut line = format!(
                    "{}: ok in {:.1}s",
                    self.procedure_type,
                    self.timing.total_sec()
                );
                if !self.checks.is_empty() {
                    line.push_str(&format!(
                        ", checks {}/{} passed",
                        self.checks.passed,
                        self.checks.len()
                    ));
                }
                if !self.warnings.is_empty() {
                    line.push_str(&format!(", {} warning(s)", self.warnings.len()));
                }
                line
            }
        }
    }
}

/// Wall-clock span of a run and the time spent in each lifecycle phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseTimings {
    /// When `validate` started.
    pub started_at: Option<DateTime<Utc>>,
    /// When `finalize` returned.
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds in `prepare`.
    pub prepare_sec: f64,
    /// Seconds in `execute`.
    pub execute_sec: f64,
    /// Seconds in `finalize`.
    pub finalize_sec: f64,
}

impl PhaseTimings {
    /// Seconds between start and finish, 0 for a run that never started.
    pub fn total_sec(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

/// Pass/warn/fail checks a procedure ran on its own output, e.g. the
/// quality of the last parabola fit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Checks that passed.
    pub passed: u32,
    /// Checks that warned.
    pub warned: u32,
    /// Checks that failed.
    pub failed: u32,
    /// Every check, in order.
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

impl QualityMetrics {
    /// Record a passed check.
    pub fn add_pass(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.record(name.into(), CheckStatus::Pass, message.into(), None);
    }

    /// Record a warning.
    pub fn add_warning(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.record(name.into(), CheckStatus::Warning, message.into(), None);
    }

    /// Pass when `value >= minimum`, fail otherwise.
    pub fn add_minimum(&mut self, name: impl Into<String>, value: f64, minimum: f64) {
        let status = if value >= minimum {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        let message = format!("{:.4} (minimum {:.4})", value, minimum);
        self.record(name.into(), status, message, Some(value));
    }

    /// Number of recorded checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether no check was recorded.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Fraction of checks passed, warnings counting half; 1.0 with no checks.
    pub fn score(&self) -> f64 {
        if self.checks.is_empty() {
            return 1.0;
        }
        (f64::from(self.passed) + 0.5 * f64::from(self.warned)) / self.checks.len() as f64
    }

    fn record(&mut self, name: String, status: CheckStatus, message: String, value: Option<f64>) {
        match status {
            CheckStatus::Pass => self.passed += 1,
            CheckStatus::Warning => self.warned += 1,
            CheckStatus::Fail => self.failed += 1,
        }
        self.checks.push(QualityCheck {
            name,
            status,
            message,
            value,
        });
    }
}

/// One recorded check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Check name.
    pub name: String,
    /// Outcome.
    pub status: CheckStatus,
    /// Human-readable detail.
    pub message: String,
    /// Measured value, for threshold checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Passed.
    Pass,
    /// Passed with a warning.
    Warning,
    /// Failed.
    Fail,
}

/// One entry of a procedure's step breakdown: a search iteration, a nod
/// stage, or a sub-procedure of the nulling sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name, e.g. `setpoint_1`.
    pub name: String,
    /// Position in the breakdown.
    pub index: usize,
    /// Whether the step completed.
    pub success: bool,
    /// Seconds since the owning procedure started executing.
    pub elapsed_sec: f64,
    /// Named step outputs.
    #[serde(default)]
    pub data: BTreeMap<String, ResultValue>,
    /// Error text of a failed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// Completed step.
    pub fn success(name: impl Into<String>, index: usize, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            index,
            success: true,
            elapsed_sec: elapsed.as_secs_f64(),
            data: BTreeMap::new(),
            error: None,
        }
    }

    /// Failed step.
    pub fn failure(
        name: impl Into<String>,
        index: usize,
        elapsed: Duration,
        error: impl Into<String>,
    ) -> Self {
        let mut step = Self::success(name, index, elapsed);
        step.success = false;
        step.error = Some(error.into());
        step
    }

    /// Add a named output.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A single named output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    /// Flag.
    Bool(bool),
    /// Count or index.
    Integer(i64),
    /// Measurement.
    Float(f64),
    /// Label.
    Text(String),
    /// Setpoints of a sequence, fluxes of a scan.
    Series(Vec<f64>),
    /// Structured logs such as the search iterations.
    Json(serde_json::Value),
}

impl ResultValue {
    /// Numeric value; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Float(v) => Some(*v),
            ResultValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

macro_rules! integer_value {
    ($($t:ty),*) => {
        $(impl From<$t> for ResultValue {
            fn from(v: $t) -> Self {
                ResultValue::Integer(v as i64)
            }
        })*
    };
}

integer_value!(i32, i64, u32, usize);

impl From<bool> for ResultValue {
    fn from(v: bool) -> Self {
        ResultValue::Bool(v)
    }
}

impl From<f64> for ResultValue {
    fn from(v: f64) -> Self {
        ResultValue::Float(v)
    }
}

impl From<String> for ResultValue {
    fn from(v: String) -> Self {
        ResultValue::Text(v)
    }
}

impl From<&str> for ResultValue {
    fn from(v: &str) -> Self {
        ResultValue::Text(v.to_owned())
    }
}

impl From<Vec<f64>> for ResultValue {
    fn from(v: Vec<f64>) -> Self {
        ResultValue::Series(v)
    }
}

impl From<serde_json::Value> for ResultValue {
    fn from(v: serde_json::Value) -> Self {
        ResultValue::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_outputs_read_back_as_numbers() {
        let result = ProcedureResult::success("setpoint_search", "run-1")
            .with_data("final_setpoint", 131.5)
            .with_data("iterations", 4usize)
            .with_data("pzt", "UBC");

        assert_eq!(result.get_f64("final_setpoint"), Some(131.5));
        assert_eq!(result.get_i64("iterations"), Some(4));
        assert_eq!(result.get_f64("iterations"), Some(4.0));
        assert_eq!(result.get_f64("pzt"), None);
        assert_eq!(result.get_i64("final_setpoint"), None);
    }

    #[test]
    fn failed_summary_names_the_error() {
        let result =
            ProcedureResult::failure("acquisition", "run-2", "camera is still integrating");
        assert!(!result.success);
        assert_eq!(
            result.summary(),
            "acquisition: failed (camera is still integrating)"
        );
    }

    #[test]
    fn checks_are_counted_and_scored() {
        let mut checks = QualityMetrics::default();
        assert_eq!(checks.score(), 1.0);

        checks.add_pass("fit", "every scan produced a vertex");
        checks.add_warning("drift", "setpoint drifted during dither");
        checks.add_minimum("final_fit_r_squared", 0.2, 0.5);

        assert_eq!((checks.passed, checks.warned, checks.failed), (1, 1, 1));
        assert_eq!(checks.checks[2].status, CheckStatus::Fail);
        assert!((checks.score() - 0.5).abs() < 1e-12);

        let summary = ProcedureResult::success("setpoint_search", "run-3")
            .with_quality(checks)
            .with_warning("boundary fallback")
            .summary();
        assert!(summary.contains("checks 1/3 passed"), "{}", summary);
        assert!(summary.contains("1 warning(s)"), "{}", summary);
    }

    #[test]
    fn json_output_is_flat() {
        let result = ProcedureResult::success("nod", "run-4")
            .with_step(StepResult::success("offset", 0, Duration::from_millis(1500)))
            .with_data("direction", "up")
            .with_data("setpoints", vec![130.0, 131.0]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["data"]["direction"], "up");
        assert_eq!(json["data"]["setpoints"][1], 131.0);
        assert_eq!(json["steps"][0]["elapsed_sec"], 1.5);
        assert!(json.get("error").is_none());
    }
}
