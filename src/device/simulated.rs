//! Simulated Device-Control Server
//!
//! An in-process `PropertyClient` holding the property tree of the camera,
//! phase loop controller and telescope, with just enough physics to exercise
//! the operating procedures:
//!
//! - Null flux follows a configurable `FluxModel` of the active setpoint,
//!   plus a constant sky background in the ROIs and optional uniform noise
//! - Camera commands are parsed and `go` advances the frame index
//! - Opening the phase loop or offsetting the telescope interrupts the loops
//!   for a configurable number of status polls
//! - Every accepted update is appended to a command log for assertions
//!
//! # Example
//!
//! ```rust,ignore
//! let server = Arc::new(SimulatedServer::new(SimulatorConfig::default()));
//! let devices = DeviceSet::from_client(server.clone(), PztSource::Ubc);
//! devices.actuator.command_setpoint(45.0).await?;
//! assert_eq!(server.setpoint_commands().await, vec![45.0]);
//! ```

use super::capabilities::{Roi, TelescopeSide};
use super::{PropertyClient, PropertyPath, PropertyUpdate, PropertyValue};
use crate::error::NomicError;
use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

// =============================================================================
// Configuration
// =============================================================================

/// Null flux as a function of the OPD setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FluxModel {
    /// `floor + curvature * (s - null_setpoint)^2`
    Quadratic {
        /// Setpoint of the minimum (deg)
        null_setpoint: f64,
        /// ADU per deg^2
        curvature: f64,
        /// Flux at the minimum (ADU)
        floor: f64,
    },
    /// Two-beam fringe: `floor + amplitude * (1 - cos(2π (s - null) / period)) / 2`
    Fringe {
        /// Setpoint of the dark fringe (deg)
        null_setpoint: f64,
        /// Peak-to-trough flux (ADU)
        amplitude: f64,
        /// Flux at the dark fringe (ADU)
        floor: f64,
        /// Fringe period in setpoint degrees
        period_deg: f64,
    },
}

impl FluxModel {
    /// Noise-free null flux at `setpoint`.
    pub fn flux(&self, setpoint: f64) -> f64 {
        match *self {
            FluxModel::Quadratic {
                null_setpoint,
                curvature,
                floor,
            } => floor + curvature * (setpoint - null_setpoint).powi(2),
            FluxModel::Fringe {
                null_setpoint,
                amplitude,
                floor,
                period_deg,
            } => {
                let phase = 2.0 * PI * (setpoint - null_setpoint) / period_deg;
                floor + amplitude * 0.5 * (1.0 - phase.cos())
            }
        }
    }

    /// Setpoint of the modelled null.
    pub fn null_setpoint(&self) -> f64 {
        match *self {
            FluxModel::Quadratic { null_setpoint, .. }
            | FluxModel::Fringe { null_setpoint, .. } => null_setpoint,
        }
    }
}

/// Configuration for the simulated server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Setpoint both PZT sources start at (deg)
    #[serde(default)]
    pub initial_setpoint: f64,

    /// Null flux model
    #[serde(default = "default_flux_model")]
    pub flux_model: FluxModel,

    /// Sky background in every ROI (ADU)
    #[serde(default = "default_background")]
    pub background_adu: f64,

    /// Half-width of uniform noise added to each ROI mean (ADU)
    #[serde(default = "default_noise")]
    pub noise_adu: f64,

    /// RNG seed for reproducible noise
    #[serde(default)]
    pub seed: Option<u64>,

    /// Initial detector integration time (s)
    #[serde(default = "default_integration_time")]
    pub integration_time_sec: f64,

    /// Wall-clock time spent per frame during `go` (s)
    #[serde(default)]
    pub frame_time_sec: f64,

    /// Frame index of the first file
    #[serde(default = "default_file_index")]
    pub initial_file_index: i64,

    /// Status polls reporting the AO loops paused after a pointing offset
    #[serde(default)]
    pub ao_recovery_polls: u32,

    /// Interlock polls reporting open before the phase loop closes again;
    /// `None` keeps it open until closed explicitly
    #[serde(default = "default_phase_recovery")]
    pub phase_recovery_polls: Option<u32>,

    /// Force the phase loop open once this many setpoint commands were received
    #[serde(default)]
    pub open_loop_after_setpoint_commands: Option<usize>,
}

fn default_flux_model() -> FluxModel {
    FluxModel::Fringe {
        null_setpoint: 130.0,
        amplitude: 5000.0,
        floor: 40.0,
        period_deg: 1800.0,
    }
}

fn default_background() -> f64 {
    1000.0
}

fn default_noise() -> f64 {
    2.0
}

fn default_integration_time() -> f64 {
    0.05
}

fn default_file_index() -> i64 {
    1000
}

fn default_phase_recovery() -> Option<u32> {
    Some(0)
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            initial_setpoint: 0.0,
            flux_model: default_flux_model(),
            background_adu: default_background(),
            noise_adu: default_noise(),
            seed: None,
            integration_time_sec: default_integration_time(),
            frame_time_sec: 0.0,
            initial_file_index: default_file_index(),
            ao_recovery_polls: 0,
            phase_recovery_polls: default_phase_recovery(),
            open_loop_after_setpoint_commands: None,
        }
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Camera acquisition settings as last commanded.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraSettings {
    /// Continuous acquisition enabled
    pub continuous: bool,
    /// Frames written to disk
    pub save_data: bool,
    /// Frames per `go`
    pub sequence_length: u32,
    /// Number of completed `go` commands
    pub integrations: u32,
}

struct ServerState {
    values: HashMap<String, PropertyValue>,
    log: Vec<PropertyUpdate>,
    rng: StdRng,
    loop_closed: bool,
    loop_reclose_in: Option<u32>,
    ao_pause_polls: u32,
    nac_active: bool,
    setpoint_command_count: usize,
    pending_go_failures: u32,
    camera: CameraSettings,
    rois: HashMap<u32, Roi>,
    offsets: HashMap<&'static str, (f64, f64)>,
}

/// In-process device-control server.
pub struct SimulatedServer {
    config: SimulatorConfig,
    state: Mutex<ServerState>,
}

impl SimulatedServer {
    /// Create a server with its initial property tree.
    pub fn new(config: SimulatorConfig) -> Self {
        let mut values = HashMap::new();
        let mut put = |path: &str, value: PropertyValue| {
            values.insert(path.to_string(), value);
        };
        put(
            "PLC.UBCSettings.PLSetpoint",
            PropertyValue::Number(config.initial_setpoint),
        );
        put(
            "PLC.NACSettings.PLSetpoint",
            PropertyValue::Number(config.initial_setpoint),
        );
        put("PLC.UBCSettings.Beam2_y", PropertyValue::Number(150.0));
        put("PLC.NACSettings.Beam2_y", PropertyValue::Number(150.0));
        put(
            "NOMIC.CamInfo.IntTime",
            PropertyValue::Number(config.integration_time_sec),
        );
        put("NOMIC.CamInfo.Go", PropertyValue::Switch(false));
        put(
            "NOMIC.CamInfo.FIndex",
            PropertyValue::Number(config.initial_file_index as f64),
        );
        put("NOMIC.Command.text", PropertyValue::Text(String::new()));
        put("NOMIC.FITSKeywords.FLAG", PropertyValue::Text("SCI".into()));
        put("NOMIC.FITSKeywords.OBSTYPE", PropertyValue::Text("4".into()));
        put(
            "Warm.NOMIC_FW2_status.PosName",
            PropertyValue::Text("Open".into()),
        );
        put("Warm.NIL_OPW_status.PosNum", PropertyValue::Number(20000.0));

        let rois = [
            Roi { id: 1, x: 60.0, y: 120.0, h: 20.0, w: 20.0 },
            Roi { id: 2, x: 140.0, y: 120.0, h: 20.0, w: 20.0 },
            Roi { id: 3, x: 100.0, y: 120.0, h: 20.0, w: 20.0 },
        ]
        .into_iter()
        .map(|roi| (roi.id, roi))
        .collect();

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let state = ServerState {
            values,
            log: Vec::new(),
            rng,
            loop_closed: true,
            loop_reclose_in: None,
            ao_pause_polls: 0,
            nac_active: false,
            setpoint_command_count: 0,
            pending_go_failures: 0,
            camera: CameraSettings {
                continuous: true,
                save_data: false,
                sequence_length: 1,
                integrations: 0,
            },
            rois,
            offsets: HashMap::new(),
        };

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// All accepted updates, oldest first.
    pub async fn command_log(&self) -> Vec<PropertyUpdate> {
        self.state.lock().await.log.clone()
    }

    /// Values of every setpoint command received, in order.
    pub async fn setpoint_commands(&self) -> Vec<f64> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|u| u.property_key() == "PLC.PLSetpoint")
            .filter_map(|u| match u.get("PLSetpoint") {
                Some(PropertyValue::Number(v)) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Force the phase loop state; an open loop stays open until closed again.
    pub async fn set_loop_closed(&self, closed: bool) {
        let mut state = self.state.lock().await;
        state.loop_closed = closed;
        state.loop_reclose_in = None;
    }

    /// Make the next `count` camera `go` commands fail half way.
    pub async fn fail_next_integrations(&self, count: u32) {
        self.state.lock().await.pending_go_failures = count;
    }

    /// Accumulated relative pointing offset of one side (arcsec).
    pub async fn pointing_offset(&self, side: TelescopeSide) -> (f64, f64) {
        let key = match side {
            TelescopeSide::Right => "right",
            _ => "left",
        };
        self.state
            .lock()
            .await
            .offsets
            .get(key)
            .copied()
            .unwrap_or((0.0, 0.0))
    }

    /// Camera acquisition settings as last commanded.
    pub async fn camera_settings(&self) -> CameraSettings {
        self.state.lock().await.camera
    }

    /// Setpoint of the PZT source last commanded.
    pub async fn active_setpoint(&self) -> f64 {
        let state = self.state.lock().await;
        Self::active_setpoint_of(&state)
    }

    fn active_setpoint_of(state: &ServerState) -> f64 {
        let key = if state.nac_active {
            "PLC.NACSettings.PLSetpoint"
        } else {
            "PLC.UBCSettings.PLSetpoint"
        };
        match state.values.get(key) {
            Some(PropertyValue::Number(v)) => *v,
            _ => 0.0,
        }
    }

    fn noise(&self, state: &mut ServerState) -> f64 {
        if self.config.noise_adu > 0.0 {
            state
                .rng
                .gen_range(-self.config.noise_adu..=self.config.noise_adu)
        } else {
            0.0
        }
    }

    fn poll_loop_closed(state: &mut ServerState) -> bool {
        if !state.loop_closed {
            match state.loop_reclose_in {
                Some(0) => {
                    state.loop_closed = true;
                    state.loop_reclose_in = None;
                }
                Some(n) => state.loop_reclose_in = Some(n - 1),
                None => {}
            }
        }
        state.loop_closed
    }

    fn ao_status(state: &mut ServerState, left: bool) -> PropertyValue {
        if left && state.ao_pause_polls > 0 {
            state.ao_pause_polls -= 1;
            return PropertyValue::Text("AOPaused".into());
        }
        if state.ao_pause_polls > 0 {
            PropertyValue::Text("AOPaused".into())
        } else {
            PropertyValue::Text("AORunning".into())
        }
    }

    fn file_index(state: &ServerState) -> i64 {
        match state.values.get("NOMIC.CamInfo.FIndex") {
            Some(PropertyValue::Number(v)) => v.round() as i64,
            _ => 0,
        }
    }

    fn advance_file_index(state: &mut ServerState, frames: i64) {
        let next = Self::file_index(state) + frames;
        state.values.insert(
            "NOMIC.CamInfo.FIndex".into(),
            PropertyValue::Number(next as f64),
        );
    }

    // -------------------------------------------------------------------------
    // Update handlers
    // -------------------------------------------------------------------------

    fn apply_setpoint(&self, state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        let setpoint = required_number(update, "PLSetpoint")?;
        let for_nac = match update.get("forNAC") {
            Some(PropertyValue::Number(v)) => *v != 0.0,
            _ => false,
        };
        let key = if for_nac {
            "PLC.NACSettings.PLSetpoint"
        } else {
            "PLC.UBCSettings.PLSetpoint"
        };
        state
            .values
            .insert(key.to_string(), PropertyValue::Number(setpoint));
        state.nac_active = for_nac;
        state.setpoint_command_count += 1;

        if let Some(limit) = self.config.open_loop_after_setpoint_commands {
            if state.setpoint_command_count >= limit && state.loop_closed {
                debug!(after = limit, "Simulated phase loop opened");
                state.loop_closed = false;
                state.loop_reclose_in = None;
            }
        }
        Ok(())
    }

    fn apply_loop_switch(&self, state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        let closed = match update.get("Yes") {
            Some(PropertyValue::Switch(v)) => *v,
            _ => return Err(rejected(update, "expected switch element 'Yes'")),
        };
        state.loop_closed = closed;
        state.loop_reclose_in = if closed {
            None
        } else {
            self.config.phase_recovery_polls
        };
        Ok(())
    }

    fn apply_fits_edit(state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        let keyword = required_text(update, "Keyword")?;
        let value = required_text(update, "Value")?;
        state.values.insert(
            format!("NOMIC.FITSKeywords.{}", keyword),
            PropertyValue::Text(value),
        );
        Ok(())
    }

    fn apply_roi_query(state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        let id = required_number(update, "ROIID")? as u32;
        let roi = *state
            .rois
            .get(&id)
            .ok_or_else(|| rejected(update, &format!("unknown ROI {}", id)))?;
        for (element, value) in [("X", roi.x), ("Y", roi.y), ("H", roi.h), ("W", roi.w)] {
            state.values.insert(
                format!("NOMIC.QueryROI.{}", element),
                PropertyValue::Number(value),
            );
        }
        Ok(())
    }

    fn apply_roi_definition(state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        let roi = Roi {
            id: required_number(update, "ROIID")? as u32,
            x: required_number(update, "X")?,
            y: required_number(update, "Y")?,
            h: required_number(update, "H")?,
            w: required_number(update, "W")?,
        };
        state.rois.insert(roi.id, roi);
        Ok(())
    }

    fn apply_offset(&self, state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        let dx = required_number(update, "OffsetX")?;
        let dy = required_number(update, "OffsetY")?;
        let side = required_text(update, "Side")?;
        let sides: &[&'static str] = match side.as_str() {
            "both" => &["left", "right"],
            "left" => &["left"],
            "right" => &["right"],
            other => return Err(rejected(update, &format!("unknown side '{}'", other))),
        };
        for &side in sides {
            let entry = state.offsets.entry(side).or_insert((0.0, 0.0));
            entry.0 += dx;
            entry.1 += dy;
        }
        state.ao_pause_polls = self.config.ao_recovery_polls;
        Ok(())
    }

    fn apply_generic(state: &mut ServerState, update: &PropertyUpdate) -> Result<()> {
        for (element, value) in &update.elements {
            let key = format!("{}.{}", update.property_key(), element);
            match state.values.get(&key) {
                Some(existing) if existing.kind() == value.kind() => {}
                Some(existing) => {
                    return Err(NomicError::TypeMismatch {
                        path: key,
                        expected: existing.kind(),
                        actual: value.kind(),
                    }
                    .into())
                }
                None => return Err(NomicError::PropertyNotFound(key).into()),
            }
        }
        for (element, value) in &update.elements {
            state.values.insert(
                format!("{}.{}", update.property_key(), element),
                value.clone(),
            );
        }
        Ok(())
    }

    /// Execute a camera command line such as `"1 contacq 0 savedata"`.
    async fn run_camera_command(&self, line: &str) -> Result<()> {
        let mut args: Vec<f64> = Vec::new();
        for token in line.split_whitespace() {
            if let Ok(v) = token.parse::<f64>() {
                args.push(v);
                continue;
            }
            let expected = match token {
                "contacq" | "savedata" | "loglevel" | "autodispwhat" | "obssequences" => 1,
                "lbtintpar" => 3,
                "go" | "rawbg" => 0,
                other => {
                    return Err(NomicError::Rejected {
                        path: "NOMIC.Command".into(),
                        reason: format!("unknown camera command '{}'", other),
                    }
                    .into())
                }
            };
            if args.len() != expected {
                return Err(NomicError::Rejected {
                    path: "NOMIC.Command".into(),
                    reason: format!(
                        "'{}' takes {} argument(s), got {}",
                        token,
                        expected,
                        args.len()
                    ),
                }
                .into());
            }
            match token {
                "contacq" => self.state.lock().await.camera.continuous = args[0] != 0.0,
                "savedata" => self.state.lock().await.camera.save_data = args[0] != 0.0,
                "obssequences" => {
                    self.state.lock().await.camera.sequence_length = args[0].max(0.0) as u32
                }
                "lbtintpar" => {
                    let mut state = self.state.lock().await;
                    state.values.insert(
                        "NOMIC.CamInfo.IntTime".into(),
                        PropertyValue::Number(args[0]),
                    );
                    state.camera.sequence_length = args[2].max(0.0) as u32;
                }
                "go" => self.integrate().await?,
                _ => {}
            }
            args.clear();
        }
        if !args.is_empty() {
            return Err(NomicError::Rejected {
                path: "NOMIC.Command".into(),
                reason: format!("dangling arguments in '{}'", line),
            }
            .into());
        }
        Ok(())
    }

    async fn integrate(&self) -> Result<()> {
        let (frames, fail) = {
            let mut state = self.state.lock().await;
            state
                .values
                .insert("NOMIC.CamInfo.Go".into(), PropertyValue::Switch(true));
            let fail = state.pending_go_failures > 0;
            if fail {
                state.pending_go_failures -= 1;
            }
            (state.camera.sequence_length as i64, fail)
        };

        let to_take = if fail { frames / 2 } else { frames };
        let frame_time = Duration::from_secs_f64(self.config.frame_time_sec.max(0.0));
        for _ in 0..to_take {
            if !frame_time.is_zero() {
                tokio::time::sleep(frame_time).await;
            }
            Self::advance_file_index(&mut *self.state.lock().await, 1);
        }

        let mut state = self.state.lock().await;
        state
            .values
            .insert("NOMIC.CamInfo.Go".into(), PropertyValue::Switch(false));
        if fail {
            return Err(NomicError::Rejected {
                path: "NOMIC.Command".into(),
                reason: format!("integration aborted after {} of {} frames", to_take, frames),
            }
            .into());
        }
        state.camera.integrations += 1;
        Ok(())
    }
}

fn required_number(update: &PropertyUpdate, element: &str) -> Result<f64> {
    match update.get(element) {
        Some(PropertyValue::Number(v)) => Ok(*v),
        _ => Err(rejected(update, &format!("expected number element '{}'", element))),
    }
}

fn required_text(update: &PropertyUpdate, element: &str) -> Result<String> {
    match update.get(element) {
        Some(PropertyValue::Text(v)) => Ok(v.clone()),
        _ => Err(rejected(update, &format!("expected text element '{}'", element))),
    }
}

fn rejected(update: &PropertyUpdate, reason: &str) -> anyhow::Error {
    NomicError::Rejected {
        path: update.property_key(),
        reason: reason.to_string(),
    }
    .into()
}

#[async_trait]
impl PropertyClient for SimulatedServer {
    async fn get(&self, path: &PropertyPath) -> Result<PropertyValue> {
        let mut state = self.state.lock().await;
        let key = path.to_string();
        let value = match key.as_str() {
            "PLC.CloseLoop.Yes" => PropertyValue::Switch(Self::poll_loop_closed(&mut state)),
            "LBTO.AOStatus.L_AOStatus" => Self::ao_status(&mut state, true),
            "LBTO.AOStatus.R_AOStatus" => Self::ao_status(&mut state, false),
            "NOMIC.NullingStats.Mean1" | "NOMIC.NullingStats.Mean2" => {
                let noise = self.noise(&mut state);
                PropertyValue::Number(self.config.background_adu + noise)
            }
            "NOMIC.NullingStats.Mean3" => {
                let setpoint = Self::active_setpoint_of(&state);
                let noise = self.noise(&mut state);
                PropertyValue::Number(
                    self.config.background_adu + self.config.flux_model.flux(setpoint) + noise,
                )
            }
            _ => state
                .values
                .get(&key)
                .cloned()
                .ok_or_else(|| NomicError::PropertyNotFound(key.clone()))?,
        };
        trace!(path = %key, value = %value, "get");
        Ok(value)
    }

    async fn set(&self, update: PropertyUpdate) -> Result<()> {
        trace!(update = %update, "set");
        if update.property_key() == "NOMIC.Command" {
            let line = required_text(&update, "text")?;
            self.state.lock().await.log.push(update.clone());
            return self.run_camera_command(&line).await;
        }

        let mut state = self.state.lock().await;
        match update.property_key().as_str() {
            "PLC.PLSetpoint" => self.apply_setpoint(&mut state, &update)?,
            "PLC.CloseLoop" => self.apply_loop_switch(&mut state, &update)?,
            "NOMIC.EditFITS" => Self::apply_fits_edit(&mut state, &update)?,
            "NOMIC.QueryROI" => Self::apply_roi_query(&mut state, &update)?,
            "NOMIC.DefROI" => Self::apply_roi_definition(&mut state, &update)?,
            "LBTO.OffsetPointing" => self.apply_offset(&mut state, &update)?,
            "Warm.NOMIC_FW2" => {
                let position = required_text(&update, "command")?;
                state.values.insert(
                    "Warm.NOMIC_FW2_status.PosName".into(),
                    PropertyValue::Text(position),
                );
            }
            "Warm.NIL_OPW" => {
                let command = required_text(&update, "command")?;
                let position: f64 = command
                    .trim()
                    .parse()
                    .map_err(|_| rejected(&update, "OPW position must be an integer"))?;
                state.values.insert(
                    "Warm.NIL_OPW_status.PosNum".into(),
                    PropertyValue::Number(position),
                );
            }
            _ => Self::apply_generic(&mut state, &update)?,
        }
        state.log.push(update);
        Ok(())
    }
}
