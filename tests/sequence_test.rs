//! End-to-end run of the nulling sequence against the simulator.

mod common;

use common::{context, devices, fast_config, fits_history, NULL_SETPOINT};
use nomic_ops::device::capabilities::TelescopeSide;
use nomic_ops::device::simulated::SimulatorConfig;
use nomic_ops::procedures::sequence::NullingSequence;
use nomic_ops::procedures::{execute_procedure_safely, EmergencyStopFlag, ResultValue};

fn assert_on_start(offset: (f64, f64)) {
    assert!(offset.0.abs() < 1e-9 && offset.1.abs() < 1e-9, "offset {:?}", offset);
}

fn step_names(result: &nomic_ops::procedures::ProcedureResult) -> Vec<String> {
    result.steps.iter().map(|s| s.name.clone()).collect()
}

#[tokio::test]
async fn test_two_position_sequence() {
    let config = fast_config();
    let (server, devices) = devices(SimulatorConfig {
        phase_recovery_polls: Some(2),
        ao_recovery_polls: 2,
        ..config.simulator.clone()
    });
    let mut sequence = NullingSequence::new(config.clone());
    assert_eq!(sequence.planned_steps(), 12);

    let ctx = context(devices);
    let result = execute_procedure_safely(&mut sequence, ctx, EmergencyStopFlag::new())
        .await
        .expect("sequence should complete");

    assert_eq!(
        step_names(&result),
        vec![
            "setpoint_1",
            "null_1",
            "nod_1_up",
            "setpoint_2",
            "null_2",
            "photometry_nod_away",
            "photometry",
            "photometry_nod_back",
            "background_offset",
            "background",
            "background_return",
            "nod_to_start",
        ]
    );
    assert!(result.steps.iter().all(|s| s.success));

    match result.data.get("setpoints") {
        Some(ResultValue::Series(setpoints)) => {
            assert_eq!(setpoints.len(), 2);
            for setpoint in setpoints {
                assert!((setpoint - NULL_SETPOINT).abs() < 1e-6, "got {}", setpoint);
            }
        }
        other => panic!("expected setpoints, got {:?}", other),
    }
    assert_eq!(result.get_i64("null_frames"), Some(40));
    // The loop reopens after the nod: one batch of 5 frames before it closes.
    assert_eq!(result.get_i64("background_frames_while_waiting"), Some(5));

    // Up, then photometry away and back on the left, background out and
    // back, then down to the start.
    assert_on_start(server.pointing_offset(TelescopeSide::Left).await);
    assert_on_start(server.pointing_offset(TelescopeSide::Right).await);

    let obstypes = fits_history(&server, "OBSTYPE").await;
    assert!(obstypes.iter().any(|o| o == "0"));
    assert!(obstypes.iter().any(|o| o == "3"));
    assert_eq!(obstypes.last().map(String::as_str), Some("4"));
}

#[tokio::test]
async fn test_single_position_without_extras() {
    let mut config = fast_config();
    config.sequence.nod_positions = 1;
    config.sequence.take_photometry = false;
    config.sequence.take_background = false;
    let (server, devices) = devices(config.simulator.clone());

    let mut sequence = NullingSequence::new(config);
    let ctx = context(devices);
    let result = execute_procedure_safely(&mut sequence, ctx, EmergencyStopFlag::new())
        .await
        .unwrap();

    assert_eq!(step_names(&result), vec!["setpoint_1", "null_1"]);
    assert_eq!(result.get_i64("positions"), Some(1));
    assert_eq!(server.pointing_offset(TelescopeSide::Left).await, (0.0, 0.0));
}

#[tokio::test]
async fn test_failed_step_stops_the_sequence() {
    let config = fast_config();
    let (_server, devices) = devices(SimulatorConfig {
        open_loop_after_setpoint_commands: Some(1),
        phase_recovery_polls: None,
        ..config.simulator.clone()
    });

    let mut sequence = NullingSequence::new(config);
    let ctx = context(devices);
    let err = execute_procedure_safely(&mut sequence, ctx, EmergencyStopFlag::new())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("setpoint_1"));
}
