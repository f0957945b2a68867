//! Integration tests for the iterative setpoint search against the simulator.

mod common;

use common::{context, devices, quiet_simulator, NULL_SETPOINT};
use nomic_ops::config::SetpointConfig;
use nomic_ops::device::simulated::{FluxModel, SimulatorConfig};
use nomic_ops::device::PropertyClient;
use nomic_ops::error::NomicError;
use nomic_ops::procedures::setpoint_search::SetpointSearch;
use nomic_ops::procedures::{
    execute_procedure_safely, EmergencyStopFlag, Procedure, ProcedureState,
};

fn assert_bounded(start: f64, commands: &[f64], max_step: f64) {
    let mut previous = start;
    for &setpoint in commands {
        assert!(
            (setpoint - previous).abs() <= max_step + 1e-9,
            "step {} -> {} exceeds {}",
            previous,
            setpoint,
            max_step
        );
        previous = setpoint;
    }
}

#[tokio::test]
async fn test_converges_on_quadratic_null() {
    let (server, devices) = devices(quiet_simulator());
    let mut search = SetpointSearch::new(SetpointConfig::default());

    let result = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .expect("search should converge");

    let final_setpoint = result.get_f64("final_setpoint").unwrap();
    assert!((final_setpoint - NULL_SETPOINT).abs() < 1e-6, "got {}", final_setpoint);
    assert_eq!(search.state(), ProcedureState::Completed);
    assert_eq!(search.final_setpoint(), Some(final_setpoint));

    // First scan centered on 0 finds 130 within one step (180), then two
    // scans centered on 130 confirm it.
    assert_eq!(search.iterations().len(), 3);
    assert!(search.iterations().iter().all(|it| it.success));
    assert!(search.iterations().iter().all(|it| it.decision.is_vertex()));
    assert_eq!(result.get_i64("iterations"), Some(3));
    assert_eq!(result.get_f64("scan_step"), Some(180.0));

    let commands = server.setpoint_commands().await;
    assert_bounded(0.0, &commands, 45.0);
    assert!((commands.last().copied().unwrap() - final_setpoint).abs() < 1e-9);
    assert!((server.active_setpoint().await - NULL_SETPOINT).abs() < 1e-6);
}

#[tokio::test]
async fn test_scan_visits_every_candidate_and_returns_to_center() {
    let (server, devices) = devices(quiet_simulator());
    let mut search = SetpointSearch::new(SetpointConfig {
        max_iterations: 1,
        ..SetpointConfig::default()
    });

    let err = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NomicError>(),
        Some(NomicError::SetpointNotConverged { iterations: 1, .. })
    ));

    let commands = server.setpoint_commands().await;
    for candidate in [-360.0, -180.0, 0.0, 180.0, 360.0] {
        assert!(commands.contains(&candidate), "{} never commanded", candidate);
    }
    let iteration = &search.iterations()[0];
    assert_eq!(iteration.candidates, vec![-360.0, -180.0, 0.0, 180.0, 360.0]);
    assert_eq!(iteration.center, 0.0);
}

#[tokio::test]
async fn test_negative_curvature_falls_back_and_gives_up() {
    let (server, devices) = devices(SimulatorConfig {
        flux_model: FluxModel::Quadratic {
            null_setpoint: NULL_SETPOINT,
            curvature: -0.01,
            floor: 5000.0,
        },
        ..quiet_simulator()
    });
    let mut search = SetpointSearch::new(SetpointConfig {
        max_iterations: 3,
        ..SetpointConfig::default()
    });

    let err = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap_err();

    // A maximum at 130 pushes every scan to its lower boundary, 360 deg
    // further each time, so no iteration ever succeeds.
    match err.downcast_ref::<NomicError>() {
        Some(NomicError::SetpointNotConverged {
            iterations,
            last_setpoint,
        }) => {
            assert_eq!(*iterations, 3);
            assert_eq!(*last_setpoint, -1080.0);
        }
        other => panic!("expected SetpointNotConverged, got {:?}", other),
    }
    assert!(search.iterations().iter().all(|it| !it.success));
    assert!(search.iterations().iter().all(|it| !it.decision.is_vertex()));
    assert_eq!(search.state(), ProcedureState::Failed);

    let commands = server.setpoint_commands().await;
    assert_bounded(0.0, &commands, 45.0);
    assert_eq!(commands.last().copied(), Some(-1080.0));
}

#[tokio::test]
async fn test_null_beyond_three_point_scan_never_converges() {
    let (server, devices) = devices(SimulatorConfig {
        flux_model: FluxModel::Quadratic {
            null_setpoint: 5000.0,
            curvature: 0.01,
            floor: 40.0,
        },
        ..quiet_simulator()
    });
    let mut search = SetpointSearch::new(SetpointConfig {
        n_points: 3,
        max_iterations: 3,
        ..SetpointConfig::default()
    });

    let err = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap_err();

    // Each scan walks one step (360 deg) toward the null at its upper
    // boundary; being one step away must not count as a confirmation.
    match err.downcast_ref::<NomicError>() {
        Some(NomicError::SetpointNotConverged {
            iterations,
            last_setpoint,
        }) => {
            assert_eq!(*iterations, 3);
            assert_eq!(*last_setpoint, 1080.0);
        }
        other => panic!("expected SetpointNotConverged, got {:?}", other),
    }
    let iterations = search.iterations();
    assert!(iterations.iter().all(|it| !it.decision.is_vertex()));
    assert!(iterations.iter().all(|it| !it.success));
    assert_eq!(
        iterations.iter().map(|it| it.center).collect::<Vec<_>>(),
        vec![0.0, 360.0, 720.0]
    );
    assert_eq!(search.final_setpoint(), None);

    let commands = server.setpoint_commands().await;
    assert_bounded(0.0, &commands, 45.0);
    assert_eq!(commands.last().copied(), Some(1080.0));
}

#[tokio::test]
async fn test_open_loop_blocks_any_motion() {
    let (server, devices) = devices(SimulatorConfig {
        phase_recovery_polls: None,
        ..quiet_simulator()
    });
    server.set_loop_closed(false).await;
    let mut search = SetpointSearch::new(SetpointConfig::default());

    let err = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NomicError>(),
        Some(NomicError::InterlockOpen(_))
    ));
    assert!(server.setpoint_commands().await.is_empty());
}

#[tokio::test]
async fn test_loop_opening_mid_search_stops_at_next_iteration() {
    let (server, devices) = devices(SimulatorConfig {
        open_loop_after_setpoint_commands: Some(3),
        ..quiet_simulator()
    });
    let mut search = SetpointSearch::new(SetpointConfig::default());

    let err = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NomicError>(),
        Some(NomicError::InterlockOpen(_))
    ));

    // The first scan completes (0 -> -360 -> ... -> 360 -> 0 in 45 deg steps),
    // nothing is commanded after the check at iteration 2.
    let commands = server.setpoint_commands().await;
    assert_eq!(commands.len(), 8 + 4 * 4 + 8);
    assert_eq!(commands.last().copied(), Some(0.0));
    assert_eq!(search.iterations().len(), 1);
}

#[tokio::test]
async fn test_busy_camera_is_rejected_before_moving() {
    let (server, devices) = devices(quiet_simulator());
    server.set_switch("NOMIC.CamInfo.Go", true).await.unwrap();
    let mut search = SetpointSearch::new(SetpointConfig::default());

    let err = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NomicError>(),
        Some(NomicError::CameraBusy)
    ));
    assert!(server.setpoint_commands().await.is_empty());
}

#[tokio::test]
async fn test_initial_setpoint_override_and_save_flag() {
    let (server, devices) = devices(quiet_simulator());
    let mut search = SetpointSearch::new(SetpointConfig {
        save_data: true,
        ..SetpointConfig::default()
    })
    .with_initial_setpoint(100.0);

    let result = execute_procedure_safely(&mut search, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap();
    assert_eq!(result.get_f64("initial_setpoint"), Some(100.0));
    assert_eq!(search.iterations()[0].center, 100.0);
    assert_bounded(0.0, &server.setpoint_commands().await, 45.0);

    let commands = server.command_log().await;
    let lines: Vec<String> = commands
        .iter()
        .filter(|u| u.property_key() == "NOMIC.Command")
        .filter_map(|u| match u.get("text") {
            Some(nomic_ops::device::PropertyValue::Text(t)) => Some(t.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(lines.first().map(String::as_str), Some("1 contacq 1 savedata"));
    assert_eq!(lines.last().map(String::as_str), Some("0 savedata"));
}
