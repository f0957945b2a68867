//! Instrument Capabilities
//!
//! Fine-grained capability traits the operating procedures are written
//! against. Instead of one monolithic "instrument" interface, each procedure
//! asks only for what it touches:
//!
//! - The setpoint search needs `SetpointActuator + NullMonitor + PhaseInterlock`
//! - Acquisitions need `CameraControl`
//! - Nods need `CameraControl + PointingControl + PhaseInterlock`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! The adapters in `crate::instruments` implement these over any
//! `PropertyClient`; tests may implement them directly.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability: OPD Setpoint Actuation
///
/// The phase loop controller steers the path-length actuator toward a
/// setpoint in degrees of phase (K band).
///
/// # Contract
/// - `command_setpoint` issues exactly one command; callers are responsible
///   for limiting step size (see `procedures::setpoint_search::bounded_path`)
/// - `setpoint` returns the controller's current setpoint
#[async_trait]
pub trait SetpointActuator: Send + Sync {
    /// Current setpoint in degrees.
    async fn setpoint(&self) -> Result<f64>;

    /// Command a new setpoint in degrees.
    async fn command_setpoint(&self, degrees: f64) -> Result<()>;
}

/// Capability: Null Flux Measurement
///
/// Produces the scalar the setpoint search minimizes.
///
/// # Contract
/// - `read_null` returns on-source flux minus the mean background flux of the
///   latest frame, in ADU
/// - A fresh frame is available every `integration_time` seconds
#[async_trait]
pub trait NullMonitor: Send + Sync {
    /// Background-subtracted flux at the null position.
    async fn read_null(&self) -> Result<f64>;

    /// Detector integration time in seconds.
    async fn integration_time(&self) -> Result<f64>;
}

/// Capability: Phase Loop Interlock
///
/// Data taken while the phase loop is open are meaningless for nulling;
/// procedures check this before trusting a measurement.
#[async_trait]
pub trait PhaseInterlock: Send + Sync {
    /// Whether the phase loop is currently closed.
    async fn is_loop_closed(&self) -> Result<bool>;

    /// Open the phase loop (before telescope motion).
    async fn open_loop(&self) -> Result<()>;
}

/// Detector region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// ROI identifier on the camera display
    pub id: u32,
    /// Lower-left X in pixels
    pub x: f64,
    /// Lower-left Y in pixels
    pub y: f64,
    /// Height in pixels
    pub h: f64,
    /// Width in pixels
    pub w: f64,
}

/// Capability: Camera Control
///
/// Command-driven science camera.
///
/// # Contract
/// - `send_command` passes one command line to the camera (e.g. `"0 contacq"`)
///   and returns when it completed; a `go` returns after the integration
/// - `file_index` increases by one per saved frame
#[async_trait]
pub trait CameraControl: Send + Sync {
    /// Send a raw camera command line.
    async fn send_command(&self, command: &str) -> Result<()>;

    /// Integration time (DIT) in seconds as set by the operator.
    async fn integration_time(&self) -> Result<f64>;

    /// Whether an integration is in progress.
    async fn is_integrating(&self) -> Result<bool>;

    /// Index of the next frame file.
    async fn file_index(&self) -> Result<i64>;

    /// Write a keyword into the headers of subsequent frames.
    async fn set_fits_keyword(&self, keyword: &str, value: &str, comment: &str) -> Result<()>;

    /// Current value of a header keyword.
    async fn fits_keyword(&self, keyword: &str) -> Result<String>;

    /// Move filter wheel 2 to a named position.
    async fn move_filter_wheel(&self, position: &str) -> Result<()>;

    /// Read back the geometry of a display ROI.
    async fn query_roi(&self, id: u32) -> Result<Roi>;

    /// Define (or move) a display ROI.
    async fn define_roi(&self, roi: Roi) -> Result<()>;
}

/// Side of the binocular telescope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelescopeSide {
    /// Both sides together
    Both,
    /// Left side only
    Left,
    /// Right side only
    Right,
}

impl TelescopeSide {
    /// Name used by the telescope control system.
    pub fn as_str(&self) -> &'static str {
        match self {
            TelescopeSide::Both => "both",
            TelescopeSide::Left => "left",
            TelescopeSide::Right => "right",
        }
    }
}

/// Capability: Telescope Pointing and Beam Alignment
///
/// # Contract
/// - Offsets are relative, in arcsec, in detector coordinates
/// - `offset_pointing` returns once the offset was accepted, not when the
///   AO loops have recovered; use `ao_loops_closed` for that
#[async_trait]
pub trait PointingControl: Send + Sync {
    /// Relative pointing offset in detector XY.
    async fn offset_pointing(&self, dx_arcsec: f64, dy_arcsec: f64, side: TelescopeSide)
        -> Result<()>;

    /// Whether both adaptive-optics loops are running.
    async fn ao_loops_closed(&self) -> Result<bool>;

    /// PHASECAM pupil wheel encoder position.
    async fn opw_position(&self) -> Result<i64>;

    /// Move the PHASECAM pupil wheel.
    async fn move_opw(&self, position: i64) -> Result<()>;

    /// PHASECAM beam 2 Y position in pixels.
    async fn beam2_y(&self) -> Result<f64>;

    /// Set PHASECAM beam 2 Y position in pixels.
    async fn set_beam2_y(&self, y: f64) -> Result<()>;
}
