//! Shared harness for the integration tests: a noise-free simulator with a
//! quadratic null and an observing configuration with no waits.

#![allow(dead_code)]

use nomic_ops::config::ObservingConfig;
use nomic_ops::device::simulated::{FluxModel, SimulatedServer, SimulatorConfig};
use nomic_ops::device::PropertyValue;
use nomic_ops::instruments::{DeviceSet, PztSource};
use nomic_ops::procedures::ProcedureContext;
use std::sync::Arc;

pub const NULL_SETPOINT: f64 = 130.0;

/// Simulator whose null flux is `40 + 0.01 (s - 130)^2`, without noise.
pub fn quiet_simulator() -> SimulatorConfig {
    SimulatorConfig {
        initial_setpoint: 0.0,
        flux_model: FluxModel::Quadratic {
            null_setpoint: NULL_SETPOINT,
            curvature: 0.01,
            floor: 40.0,
        },
        noise_adu: 0.0,
        seed: Some(7),
        integration_time_sec: 0.0,
        ..SimulatorConfig::default()
    }
}

/// Default observing setup with every pause and frame count shrunk.
pub fn fast_config() -> ObservingConfig {
    let mut config = ObservingConfig::default();
    config.camera.command_settle_sec = 0.0;
    config.camera.loop_poll_interval_sec = 0.001;
    config.camera.loop_wait_timeout_sec = 5.0;
    config.camera.n_sequences_dark = 10;
    config.camera.n_sequences_null = 20;
    config.camera.n_sequences_phot = 10;
    config.camera.n_sequences_bkgd = 10;
    config.camera.n_wait_phase_loop = 5;
    config.camera.n_wait_ao_loop = 5;
    config.dither.frames_per_step = vec![5, 5, 5, 5];
    config.dither.poll_interval_sec = 0.001;
    config.dither.step_timeout_sec = 5.0;
    config.sequence.nod_settle_sec = 0.0;
    config.simulator = quiet_simulator();
    config
}

pub fn devices(config: SimulatorConfig) -> (Arc<SimulatedServer>, DeviceSet) {
    let server = Arc::new(SimulatedServer::new(config));
    let devices = DeviceSet::from_client(server.clone(), PztSource::Ubc);
    (server, devices)
}

pub fn context(devices: DeviceSet) -> ProcedureContext {
    let (ctx, _progress, _cancel) = ProcedureContext::new("test", devices);
    ctx
}

/// Text values of `element` across logged updates of `property_key`.
pub async fn logged_texts(
    server: &SimulatedServer,
    property_key: &str,
    element: &str,
) -> Vec<String> {
    server
        .command_log()
        .await
        .iter()
        .filter(|u| u.property_key() == property_key)
        .filter_map(|u| match u.get(element) {
            Some(PropertyValue::Text(v)) => Some(v.clone()),
            _ => None,
        })
        .collect()
}

/// Values written to FITS keyword `keyword`, in order.
pub async fn fits_history(server: &SimulatedServer, keyword: &str) -> Vec<String> {
    server
        .command_log()
        .await
        .iter()
        .filter(|u| u.property_key() == "NOMIC.EditFITS")
        .filter(|u| matches!(u.get("Keyword"), Some(PropertyValue::Text(k)) if k == keyword))
        .filter_map(|u| match u.get("Value") {
            Some(PropertyValue::Text(v)) => Some(v.clone()),
            _ => None,
        })
        .collect()
}
