//! OPD Dither
//!
//! Steps the phase loop setpoint through a fixed pattern while the camera
//! integrates a null sequence. Each step waits until the camera has written
//! that step's frames (tracked through `NOMIC.CamInfo.FIndex`), then moves
//! the setpoint by the step's offset and records the accumulated offset in
//! the `spdthpos` FITS keyword.
//!
//! The pattern is configured in radians of phase at 11 µm and commanded in
//! degrees of K-band phase (`offset_deg = rad * 5 * 180 / π`).
//!
//! A dither runs until stopped, until `cycles` passes through the pattern
//! have completed, or until one step's frames fail to arrive within
//! `step_timeout_sec`. A timeout ends the dither with a warning, not an error.

use crate::config::DitherConfig;
use crate::device::capabilities::SetpointActuator;
use crate::instruments::DeviceSet;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Setpoint change of one fringe (deg, K band).
pub const FRINGE_DEG: f64 = 360.0;

/// Keyword holding the current dither offset.
pub const DITHER_KEYWORD: &str = "spdthpos";

/// Move the setpoint by one fringe, or back by one if `inverse`.
///
/// Returns the new setpoint.
pub async fn offset_setpoint(actuator: &dyn SetpointActuator, inverse: bool) -> Result<f64> {
    let offset = if inverse { -FRINGE_DEG } else { FRINGE_DEG };
    let setpoint = actuator.setpoint().await? + offset;
    actuator.command_setpoint(setpoint).await?;
    info!(setpoint, offset, "Setpoint offset by one fringe");
    Ok(setpoint)
}

/// How a dither ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitherEnd {
    /// Stopped by the caller
    Stopped,
    /// Completed the configured number of cycles
    Completed,
    /// A step's frames did not arrive in time
    TimedOut,
}

/// Summary of a finished dither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DitherReport {
    /// Pattern steps applied
    pub steps: u32,
    /// Complete passes through the pattern
    pub cycles: u32,
    /// Steps where the setpoint had moved since the last command
    pub drift_warnings: u32,
    /// Setpoint after the last step (deg)
    pub last_setpoint: f64,
    /// Reason the dither ended
    pub end: DitherEnd,
}

/// OPD dither pattern runner.
#[derive(Debug, Clone)]
pub struct OpdDither {
    config: DitherConfig,
}

impl OpdDither {
    /// Create a dither from its configuration.
    pub fn new(config: DitherConfig) -> Self {
        Self { config }
    }

    /// Run on a background task; stop it with the returned handle.
    pub fn spawn(self, devices: DeviceSet) -> DitherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(&devices, stop_rx).await });
        DitherHandle { stop_tx, task }
    }

    /// Run until `stop` turns true or the pattern ends.
    pub async fn run(
        &self,
        devices: &DeviceSet,
        mut stop: watch::Receiver<bool>,
    ) -> Result<DitherReport> {
        let actuator = devices.actuator.as_ref();
        let camera = devices.camera.as_ref();
        let offsets = self.config.offsets_deg();
        let initial = self.config.initial_offset_deg();
        if offsets.is_empty() || offsets.len() != self.config.frames_per_step.len() {
            return Err(anyhow!(
                "dither pattern has {} offsets but {} frame counts",
                offsets.len(),
                self.config.frames_per_step.len()
            ));
        }

        let mut commanded = actuator.setpoint().await?;
        let mut file_number = camera.file_index().await?;
        camera
            .set_fits_keyword(DITHER_KEYWORD, &format_offset(initial), keyword_comment())
            .await?;
        if initial != 0.0 {
            commanded += initial;
            actuator.command_setpoint(commanded).await?;
        }
        info!(
            setpoint = commanded,
            file_index = file_number,
            steps = offsets.len(),
            "OPD dither started"
        );

        let mut report = DitherReport {
            steps: 0,
            cycles: 0,
            drift_warnings: 0,
            last_setpoint: commanded,
            end: DitherEnd::Stopped,
        };

        loop {
            let mut position = initial;
            let steps = offsets.iter().zip(&self.config.frames_per_step);
            for (i, (&offset, &frames)) in steps.enumerate() {
                file_number += i64::from(frames);
                match self.wait_for_frames(devices, file_number, &mut stop).await? {
                    FrameWait::Arrived => {}
                    FrameWait::Stopped => {
                        report.end = DitherEnd::Stopped;
                        return Ok(report);
                    }
                    FrameWait::TimedOut => {
                        warn!(
                            step = i,
                            timeout = self.config.step_timeout_sec,
                            "OPD dither timed out waiting for frames; restart the dither pattern"
                        );
                        report.end = DitherEnd::TimedOut;
                        return Ok(report);
                    }
                }

                let current = actuator.setpoint().await?;
                if (current - commanded).abs() > self.config.drift_warn_deg {
                    warn!(
                        expected = commanded,
                        current, "Setpoint changed between two dither positions"
                    );
                    report.drift_warnings += 1;
                }
                commanded = current + offset;
                position += offset;
                camera
                    .set_fits_keyword(DITHER_KEYWORD, &format_offset(position), keyword_comment())
                    .await?;
                actuator.command_setpoint(commanded).await?;
                debug!(step = i, setpoint = commanded, offset = position, "Dither step");
                report.steps += 1;
                report.last_setpoint = commanded;
            }

            report.cycles += 1;
            if let Some(cycles) = self.config.cycles {
                if report.cycles >= cycles {
                    report.end = DitherEnd::Completed;
                    return Ok(report);
                }
            }
        }
    }

    async fn wait_for_frames(
        &self,
        devices: &DeviceSet,
        file_number: i64,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<FrameWait> {
        let started = Instant::now();
        let timeout = self.config.step_timeout();
        loop {
            if *stop.borrow() {
                return Ok(FrameWait::Stopped);
            }
            if devices.camera.file_index().await? >= file_number {
                return Ok(FrameWait::Arrived);
            }
            if started.elapsed() >= timeout {
                return Ok(FrameWait::TimedOut);
            }
            tokio::select! {
                changed = stop.changed() => {
                    // Sender gone: nobody can stop us any more, keep polling.
                    if changed.is_err() {
                        tokio::time::sleep(self.config.poll_interval()).await;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }
}

enum FrameWait {
    Arrived,
    Stopped,
    TimedOut,
}

fn format_offset(degrees: f64) -> String {
    format!("{:.4}", degrees)
}

fn keyword_comment() -> &'static str {
    "setpoint dither position (offset from nominal setpoint) in deg"
}

/// Handle to a dither running on a background task.
pub struct DitherHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Result<DitherReport>>,
}

impl DitherHandle {
    /// Whether the dither has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the dither and wait for it to finish.
    pub async fn stop(self) -> Result<DitherReport> {
        self.stop_tx.send_replace(true);
        self.task
            .await
            .map_err(|e| anyhow!("dither task failed: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimulatedServer, SimulatorConfig};
    use crate::instruments::PztSource;
    use std::sync::Arc;

    fn setup(initial_setpoint: f64) -> (Arc<SimulatedServer>, DeviceSet) {
        let server = Arc::new(SimulatedServer::new(SimulatorConfig {
            initial_setpoint,
            ..SimulatorConfig::default()
        }));
        let devices = DeviceSet::from_client(server.clone(), PztSource::Ubc);
        (server, devices)
    }

    #[tokio::test]
    async fn offset_setpoint_moves_one_fringe() {
        let (server, devices) = setup(100.0);
        assert_eq!(offset_setpoint(devices.actuator.as_ref(), false).await.unwrap(), 460.0);
        assert_eq!(offset_setpoint(devices.actuator.as_ref(), true).await.unwrap(), 100.0);
        assert_eq!(server.setpoint_commands().await, vec![460.0, 100.0]);
    }

    #[tokio::test]
    async fn stops_while_waiting_for_frames() {
        let (server, devices) = setup(10.0);
        let dither = OpdDither::new(DitherConfig {
            poll_interval_sec: 0.001,
            ..DitherConfig::default()
        });
        let handle = dither.spawn(devices);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = handle.stop().await.unwrap();
        assert_eq!(report.end, DitherEnd::Stopped);
        assert_eq!(report.steps, 0);
        assert!(server.setpoint_commands().await.is_empty());
    }

    #[tokio::test]
    async fn completes_pattern_as_frames_arrive() {
        let (server, devices) = setup(10.0);
        let dither = OpdDither::new(DitherConfig {
            poll_interval_sec: 0.001,
            step_timeout_sec: 5.0,
            cycles: Some(1),
            ..DitherConfig::default()
        });
        let (_tx, rx) = watch::channel(false);
        let camera = devices.camera.clone();
        let integrate = async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            camera.send_command("0.05 1 200 lbtintpar").await?;
            camera.send_command("go").await
        };
        let (report, integrated) = tokio::join!(dither.run(&devices, rx), integrate);
        integrated.unwrap();
        let report = report.unwrap();
        assert_eq!(report.end, DitherEnd::Completed);
        assert_eq!(report.steps, 4);
        assert_eq!(report.drift_warnings, 0);

        let commands = server.setpoint_commands().await;
        assert_eq!(commands.len(), 4);
        assert!((commands[0] - (10.0 - 57.29577951308232)).abs() < 1e-9);
        assert!((commands[3] - 10.0).abs() < 1e-9);
        assert_eq!(
            devices.camera.fits_keyword(DITHER_KEYWORD).await.unwrap(),
            "0.0000"
        );
    }

    #[tokio::test]
    async fn times_out_without_frames() {
        let (_server, devices) = setup(10.0);
        let dither = OpdDither::new(DitherConfig {
            step_timeout_sec: 0.01,
            poll_interval_sec: 0.001,
            ..DitherConfig::default()
        });
        let (_tx, rx) = watch::channel(false);
        let report = dither.run(&devices, rx).await.unwrap();
        assert_eq!(report.end, DitherEnd::TimedOut);
    }
}
