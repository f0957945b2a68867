//! Waiting for the phase loop or the AO loops to close.
//!
//! While a loop is open the camera can keep taking background frames in
//! batches, up to `n_sequences_null` frames in total. After the batch
//! window the camera goes back to continuous acquisition and the wait
//! continues quietly until the loop closes or the wait times out.

use crate::config::CameraConfig;
use crate::error::NomicError;
use crate::instruments::nomic::{continuous_mode, safe_state, setup_sequence};
use crate::instruments::DeviceSet;
use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Loop a wait is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// PHASECAM phase loop
    Phase,
    /// Adaptive optics loops on both sides
    AdaptiveOptics,
}

impl LoopKind {
    fn name(self) -> &'static str {
        match self {
            LoopKind::Phase => "phase loop",
            LoopKind::AdaptiveOptics => "AO loop",
        }
    }

    async fn is_closed(self, devices: &DeviceSet) -> Result<bool> {
        match self {
            LoopKind::Phase => devices.interlock.is_loop_closed().await,
            LoopKind::AdaptiveOptics => devices.pointing.ao_loops_closed().await,
        }
    }
}

/// Parameters of one wait.
#[derive(Debug, Clone)]
pub struct LoopWait {
    /// Loop to wait for
    pub kind: LoopKind,
    /// Take background frames while waiting
    pub take_background: bool,
    /// Save the background frames
    pub save_data: bool,
    /// Frames per background batch
    pub n_wait_frames: u32,
    /// Stop taking backgrounds after this many frames
    pub max_background_frames: u32,
    /// Pause before each batch and before returning to continuous mode
    pub settle: Duration,
    /// Loop state poll interval
    pub poll_interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl LoopWait {
    /// Wait for `kind` with the camera settings from `camera`.
    pub fn new(kind: LoopKind, camera: &CameraConfig, take_background: bool) -> Self {
        let n_wait_frames = match kind {
            LoopKind::Phase => camera.n_wait_phase_loop,
            LoopKind::AdaptiveOptics => camera.n_wait_ao_loop,
        };
        Self {
            kind,
            take_background,
            save_data: camera.save_data,
            n_wait_frames,
            max_background_frames: camera.n_sequences_null,
            settle: camera.settle(),
            poll_interval: camera.loop_poll_interval(),
            timeout: camera.loop_wait_timeout(),
        }
    }

    /// Block until the loop is closed; returns background frames taken.
    pub async fn run(&self, devices: &DeviceSet) -> Result<u32> {
        let name = self.kind.name();
        if self.kind.is_closed(devices).await? {
            info!("{} closed, continuing", name);
            return Ok(0);
        }
        info!(take_background = self.take_background, "Waiting for {} to close", name);

        let started = Instant::now();
        let mut frames_taken = 0;
        if self.take_background {
            frames_taken = self.take_backgrounds(devices).await?;
        }

        while !self.kind.is_closed(devices).await? {
            if started.elapsed() >= self.timeout {
                return Err(NomicError::Timeout {
                    what: format!("{} to close", name),
                    seconds: self.timeout.as_secs_f64(),
                }
                .into());
            }
            debug!("{} still open", name);
            tokio::time::sleep(self.poll_interval).await;
        }

        info!(frames_taken, "{} closed", name);
        Ok(frames_taken)
    }

    async fn take_backgrounds(&self, devices: &DeviceSet) -> Result<u32> {
        let camera = devices.camera.as_ref();
        let dit = camera.integration_time().await?;

        if self.kind == LoopKind::Phase {
            camera
                .set_fits_keyword("OBSTYPE", "2", "observation type")
                .await?;
        }
        safe_state(camera, dit).await?;
        setup_sequence(camera, dit, self.save_data, self.n_wait_frames).await?;

        let mut frames_taken = 0;
        while frames_taken < self.max_background_frames && !self.kind.is_closed(devices).await? {
            info!(
                frames = self.n_wait_frames,
                "{} still open, taking background frames",
                self.kind.name()
            );
            tokio::time::sleep(self.settle).await;
            camera.send_command("go").await?;
            frames_taken += self.n_wait_frames;
        }

        continuous_mode(camera, dit, self.settle).await?;
        if self.kind == LoopKind::Phase {
            camera
                .set_fits_keyword("OBSTYPE", "4", "observation type")
                .await?;
        }
        Ok(frames_taken)
    }
}

/// Wait for the phase loop; returns background frames taken.
pub async fn wait_phase_loop(
    devices: &DeviceSet,
    camera: &CameraConfig,
    take_background: bool,
) -> Result<u32> {
    LoopWait::new(LoopKind::Phase, camera, take_background)
        .run(devices)
        .await
}

/// Wait for both AO loops; returns background frames taken.
pub async fn wait_ao_loop(
    devices: &DeviceSet,
    camera: &CameraConfig,
    take_background: bool,
) -> Result<u32> {
    LoopWait::new(LoopKind::AdaptiveOptics, camera, take_background)
        .run(devices)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimulatedServer, SimulatorConfig};
    use crate::instruments::PztSource;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn fast_camera() -> CameraConfig {
        CameraConfig {
            n_wait_phase_loop: 10,
            n_sequences_null: 30,
            command_settle_sec: 0.0,
            loop_poll_interval_sec: 0.001,
            loop_wait_timeout_sec: 1.0,
            ..CameraConfig::default()
        }
    }

    #[tokio::test]
    async fn closed_loop_returns_immediately() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig::default()));
        let devices = DeviceSet::from_client(server.clone(), PztSource::Ubc);
        let frames = wait_phase_loop(&devices, &fast_camera(), true).await.unwrap();
        assert_eq!(frames, 0);
        assert!(server.command_log().await.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn takes_background_batches_until_limit() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig {
            phase_recovery_polls: Some(10),
            ..SimulatorConfig::default()
        }));
        let devices = DeviceSet::from_client(server.clone(), PztSource::Ubc);
        devices.interlock.open_loop().await.unwrap();
        let frames = wait_phase_loop(&devices, &fast_camera(), true).await.unwrap();
        assert_eq!(frames, 30);
        assert_eq!(server.camera_settings().await.integrations, 3);
        assert!(server.camera_settings().await.continuous);
        assert!(logs_contain("phase loop still open, taking background frames"));
    }

    #[tokio::test]
    async fn times_out_when_loop_stays_open() {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig {
            phase_recovery_polls: None,
            ..SimulatorConfig::default()
        }));
        server.set_loop_closed(false).await;
        let devices = DeviceSet::from_client(server, PztSource::Ubc);
        let mut camera = fast_camera();
        camera.loop_wait_timeout_sec = 0.02;
        let err = wait_phase_loop(&devices, &camera, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NomicError>(),
            Some(NomicError::Timeout { .. })
        ));
    }
}
