//! Observing Configuration using Figment
//!
//! Strongly-typed configuration for the operating procedures. Configuration
//! is layered:
//! 1. Built-in defaults (the standard nulling setup)
//! 2. A TOML file, usually `config/nomic_ops.toml`
//! 3. Environment variables prefixed with `NOMIC_OPS_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use nomic_ops::config::ObservingConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // NOMIC_OPS_TELESCOPE__NOD_THROW=1.5 overrides [telescope] nod_throw
//! let config = ObservingConfig::load()?;
//! config.validate()?;
//! println!("Nod throw: {} arcsec", config.telescope.nod_throw);
//! # Ok(())
//! # }
//! ```

use crate::device::simulated::SimulatorConfig;
use crate::error::{AppResult, NomicError};
use crate::instruments::PztSource;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/nomic_ops.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NOMIC_OPS_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservingConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Setpoint search
    #[serde(default)]
    pub setpoint: SetpointConfig,
    /// NOMIC camera acquisitions
    #[serde(default)]
    pub camera: CameraConfig,
    /// Telescope nods and offsets
    #[serde(default)]
    pub telescope: TelescopeConfig,
    /// OPD dither pattern
    #[serde(default)]
    pub dither: DitherConfig,
    /// Automated observing sequence
    #[serde(default)]
    pub sequence: SequenceConfig,
    /// Simulated device-control server
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single-line
    Compact,
    /// JSON lines
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Setpoint search parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetpointConfig {
    /// Scan half range around the estimate (deg)
    #[serde(default = "default_half_range")]
    pub half_range_deg: f64,
    /// Number of scan positions (odd, at least 3)
    #[serde(default = "default_n_points")]
    pub n_points: usize,
    /// Flux samples averaged per position
    #[serde(default = "default_n_img")]
    pub n_img: usize,
    /// Largest single setpoint command step (deg)
    #[serde(default = "default_max_step")]
    pub max_step_deg: f64,
    /// Successful confirmations required beyond the first
    #[serde(default = "default_n_confirm")]
    pub n_confirm: u32,
    /// Iteration cap
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Save camera frames during the search
    #[serde(default)]
    pub save_data: bool,
    /// PZTs driven by the phase loop controller
    #[serde(default)]
    pub pzt: PztSource,
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            half_range_deg: default_half_range(),
            n_points: default_n_points(),
            n_img: default_n_img(),
            max_step_deg: default_max_step(),
            n_confirm: default_n_confirm(),
            max_iterations: default_max_iterations(),
            save_data: false,
            pzt: PztSource::default(),
        }
    }
}

/// NOMIC acquisition parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Write frames to disk
    #[serde(default = "default_true")]
    pub save_data: bool,
    /// Dark frames per acquisition
    #[serde(default = "default_n_dark")]
    pub n_sequences_dark: u32,
    /// Null frames per nod position
    #[serde(default = "default_n_null")]
    pub n_sequences_null: u32,
    /// Photometry frames
    #[serde(default = "default_n_phot")]
    pub n_sequences_phot: u32,
    /// Background frames
    #[serde(default = "default_n_bkgd")]
    pub n_sequences_bkgd: u32,
    /// Background frames per batch while waiting for the phase loop
    #[serde(default = "default_n_wait")]
    pub n_wait_phase_loop: u32,
    /// Background frames per batch while waiting for the AO loops
    #[serde(default = "default_n_wait")]
    pub n_wait_ao_loop: u32,
    /// Retries of a failed integration
    #[serde(default = "default_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Pause before `go` and before re-enabling continuous mode (s)
    #[serde(default = "default_command_settle")]
    pub command_settle_sec: f64,
    /// Filter wheel 2 position for darks
    #[serde(default = "default_dark_filter")]
    pub dark_filter: String,
    /// Filter wheel 2 position for science
    #[serde(default = "default_open_filter")]
    pub open_filter: String,
    /// Loop status poll interval (s)
    #[serde(default = "default_loop_poll")]
    pub loop_poll_interval_sec: f64,
    /// Give up waiting for a loop after this long (s)
    #[serde(default = "default_loop_timeout")]
    pub loop_wait_timeout_sec: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            save_data: true,
            n_sequences_dark: default_n_dark(),
            n_sequences_null: default_n_null(),
            n_sequences_phot: default_n_phot(),
            n_sequences_bkgd: default_n_bkgd(),
            n_wait_phase_loop: default_n_wait(),
            n_wait_ao_loop: default_n_wait(),
            max_recovery_attempts: default_recovery_attempts(),
            command_settle_sec: default_command_settle(),
            dark_filter: default_dark_filter(),
            open_filter: default_open_filter(),
            loop_poll_interval_sec: default_loop_poll(),
            loop_wait_timeout_sec: default_loop_timeout(),
        }
    }
}

impl CameraConfig {
    /// Command settle pause.
    pub fn settle(&self) -> Duration {
        secs(self.command_settle_sec)
    }

    /// Loop status poll interval.
    pub fn loop_poll_interval(&self) -> Duration {
        secs(self.loop_poll_interval_sec)
    }

    /// Loop wait timeout.
    pub fn loop_wait_timeout(&self) -> Duration {
        secs(self.loop_wait_timeout_sec)
    }
}

/// Telescope nod parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelescopeConfig {
    /// Single nod offset (arcsec)
    #[serde(default = "default_nod_throw")]
    pub nod_throw: f64,
    /// Offset used for background frames (arcsec)
    #[serde(default = "default_off_throw")]
    pub off_throw: f64,
    /// PHASECAM pupil wheel move per nod (encoder steps)
    #[serde(default = "default_opw_offset")]
    pub opw_offset_nod: i64,
    /// PHASECAM beam 2 shift per nod (pixels)
    #[serde(default = "default_beam2_offset")]
    pub phasecam_beam2_offset_nod: f64,
    /// NOMIC plate scale (arcsec per pixel)
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale_arcsec: f64,
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            nod_throw: default_nod_throw(),
            off_throw: default_off_throw(),
            opw_offset_nod: default_opw_offset(),
            phasecam_beam2_offset_nod: default_beam2_offset(),
            pixel_scale_arcsec: default_pixel_scale(),
        }
    }
}

/// OPD dither parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DitherConfig {
    /// Dither during null acquisitions
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Offsets applied after each step, in rad at 11 µm
    #[serde(default = "default_pattern")]
    pub pattern_rad: Vec<f64>,
    /// Frames taken at each step
    #[serde(default = "default_ndits")]
    pub frames_per_step: Vec<u32>,
    /// Offset from nominal before the first step, in rad at 11 µm
    #[serde(default)]
    pub initial_offset_rad: f64,
    /// Longest wait for one step's frames (s)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_sec: f64,
    /// Warn when the setpoint moved by more than this between steps (deg)
    #[serde(default = "default_drift_warn")]
    pub drift_warn_deg: f64,
    /// Frame index poll interval (s)
    #[serde(default = "default_dither_poll")]
    pub poll_interval_sec: f64,
    /// Stop after this many passes through the pattern; unset runs until stopped
    #[serde(default)]
    pub cycles: Option<u32>,
}

impl Default for DitherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern_rad: default_pattern(),
            frames_per_step: default_ndits(),
            initial_offset_rad: 0.0,
            step_timeout_sec: default_step_timeout(),
            drift_warn_deg: default_drift_warn(),
            poll_interval_sec: default_dither_poll(),
            cycles: None,
        }
    }
}

impl DitherConfig {
    /// Offsets applied at each step, in degrees of K-band phase.
    pub fn offsets_deg(&self) -> Vec<f64> {
        self.pattern_rad.iter().map(|&rad| rad_to_deg_k(rad)).collect()
    }

    /// Initial offset in degrees of K-band phase.
    pub fn initial_offset_deg(&self) -> f64 {
        rad_to_deg_k(self.initial_offset_rad)
    }

    /// Longest wait for one step's frames.
    pub fn step_timeout(&self) -> Duration {
        secs(self.step_timeout_sec)
    }

    /// Frame index poll interval.
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_sec)
    }
}

/// Phase at 11 µm in radians to setpoint degrees at K band.
pub fn rad_to_deg_k(rad: f64) -> f64 {
    rad * 5.0 * 180.0 / std::f64::consts::PI
}

/// Automated sequence parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Nod positions observed (null + nod each)
    #[serde(default = "default_nod_positions")]
    pub nod_positions: u32,
    /// Finish with photometry
    #[serde(default = "default_true")]
    pub take_photometry: bool,
    /// Finish with an off-source background
    #[serde(default = "default_true")]
    pub take_background: bool,
    /// Pause after each nod before checking the phase loop (s)
    #[serde(default = "default_nod_settle")]
    pub nod_settle_sec: f64,
    /// Take background frames while waiting for loops
    #[serde(default = "default_true")]
    pub background_while_waiting: bool,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            nod_positions: default_nod_positions(),
            take_photometry: true,
            take_background: true,
            nod_settle_sec: default_nod_settle(),
            background_while_waiting: true,
        }
    }
}

impl SequenceConfig {
    /// Pause after each nod.
    pub fn nod_settle(&self) -> Duration {
        secs(self.nod_settle_sec)
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

// Default value functions
fn default_name() -> String {
    "nomic-ops".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_half_range() -> f64 {
    360.0
}

fn default_n_points() -> usize {
    5
}

fn default_n_img() -> usize {
    3
}

fn default_max_step() -> f64 {
    45.0
}

fn default_n_confirm() -> u32 {
    2
}

fn default_max_iterations() -> u32 {
    20
}

fn default_n_dark() -> u32 {
    500
}

fn default_n_null() -> u32 {
    2000
}

fn default_n_phot() -> u32 {
    500
}

fn default_n_bkgd() -> u32 {
    1000
}

fn default_n_wait() -> u32 {
    100
}

fn default_recovery_attempts() -> u32 {
    2
}

fn default_command_settle() -> f64 {
    0.3
}

fn default_dark_filter() -> String {
    "Blank+tape".to_string()
}

fn default_open_filter() -> String {
    "Open".to_string()
}

fn default_loop_poll() -> f64 {
    1.0
}

fn default_loop_timeout() -> f64 {
    1800.0
}

fn default_nod_throw() -> f64 {
    2.3
}

fn default_off_throw() -> f64 {
    5.0
}

fn default_opw_offset() -> i64 {
    1300
}

fn default_beam2_offset() -> f64 {
    2.0
}

fn default_pixel_scale() -> f64 {
    0.018
}

fn default_pattern() -> Vec<f64> {
    vec![-0.2, 0.2, 0.2, -0.2]
}

fn default_ndits() -> Vec<u32> {
    vec![50, 50, 50, 50]
}

fn default_step_timeout() -> f64 {
    900.0
}

fn default_drift_warn() -> f64 {
    2.9
}

fn default_dither_poll() -> f64 {
    0.1
}

fn default_nod_positions() -> u32 {
    4
}

fn default_nod_settle() -> f64 {
    2.0
}

impl ObservingConfig {
    /// Load from `config/nomic_ops.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path; a missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Provider stack used by `load_from`.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(ObservingConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)?;

        let sp = &self.setpoint;
        if sp.n_points < 3 || sp.n_points % 2 == 0 {
            return Err(NomicError::Configuration(format!(
                "setpoint.n_points must be odd and at least 3, got {}",
                sp.n_points
            )));
        }
        if sp.half_range_deg.is_nan() || sp.half_range_deg <= 0.0 {
            return Err(NomicError::Configuration(format!(
                "setpoint.half_range_deg must be positive, got {}",
                sp.half_range_deg
            )));
        }
        if sp.max_step_deg.is_nan() || sp.max_step_deg <= 0.0 {
            return Err(NomicError::Configuration(format!(
                "setpoint.max_step_deg must be positive, got {}",
                sp.max_step_deg
            )));
        }
        if sp.n_img == 0 {
            return Err(NomicError::Configuration(
                "setpoint.n_img must be at least 1".to_string(),
            ));
        }
        if sp.max_iterations == 0 {
            return Err(NomicError::Configuration(
                "setpoint.max_iterations must be at least 1".to_string(),
            ));
        }

        let dither = &self.dither;
        if dither.pattern_rad.is_empty() {
            return Err(NomicError::Configuration(
                "dither.pattern_rad must not be empty".to_string(),
            ));
        }
        if dither.pattern_rad.len() != dither.frames_per_step.len() {
            return Err(NomicError::Configuration(format!(
                "dither.pattern_rad has {} steps but dither.frames_per_step has {}",
                dither.pattern_rad.len(),
                dither.frames_per_step.len()
            )));
        }
        if dither.frames_per_step.iter().any(|&n| n == 0) {
            return Err(NomicError::Configuration(
                "dither.frames_per_step entries must be positive".to_string(),
            ));
        }

        if self.telescope.pixel_scale_arcsec <= 0.0 {
            return Err(NomicError::Configuration(format!(
                "telescope.pixel_scale_arcsec must be positive, got {}",
                self.telescope.pixel_scale_arcsec
            )));
        }
        if self.camera.n_wait_phase_loop == 0 || self.camera.n_wait_ao_loop == 0 {
            return Err(NomicError::Configuration(
                "camera.n_wait_* batch sizes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
