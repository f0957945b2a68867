//! Integration tests for telescope nods and background offsets.

mod common;

use common::{context, devices, fast_config, quiet_simulator};
use nomic_ops::device::capabilities::TelescopeSide;
use nomic_ops::device::simulated::SimulatorConfig;
use nomic_ops::procedures::loop_wait::wait_ao_loop;
use nomic_ops::procedures::nod::{roi_shift_pixels, BackgroundOffset, Nod, NodDirection, NOD_ROIS};
use nomic_ops::procedures::{execute_procedure_safely, EmergencyStopFlag};

#[test]
fn test_roi_shift_truncates_to_whole_pixels() {
    assert_eq!(roi_shift_pixels(2.3, 0.018), 127.0);
    assert_eq!(roi_shift_pixels(5.0, 0.018), 277.0);
    assert_eq!(roi_shift_pixels(0.01, 0.018), 0.0);
}

#[test]
fn test_directions_parse() {
    assert_eq!("UP".parse::<NodDirection>().unwrap(), NodDirection::Up);
    assert_eq!("down".parse::<NodDirection>().unwrap(), NodDirection::Down);
    assert!("left".parse::<NodDirection>().is_err());
    assert_eq!(NodDirection::Up.opposite(), NodDirection::Down);
}

#[tokio::test]
async fn test_nod_up_moves_telescope_phasecam_and_rois() {
    let config = fast_config();
    let (server, devices) = devices(quiet_simulator());
    let rois_before = {
        let mut rois = Vec::new();
        for id in NOD_ROIS {
            rois.push(devices.camera.query_roi(id).await.unwrap());
        }
        rois
    };
    let opw_before = devices.pointing.opw_position().await.unwrap();
    let beam2_before = devices.pointing.beam2_y().await.unwrap();

    let mut nod = Nod::new(
        NodDirection::Up,
        config.telescope.clone(),
        config.camera.clone(),
    );
    let ctx = context(devices.clone());
    let result = execute_procedure_safely(&mut nod, ctx, EmergencyStopFlag::new())
        .await
        .unwrap();

    assert_eq!(server.pointing_offset(TelescopeSide::Left).await, (0.0, 2.3));
    assert_eq!(server.pointing_offset(TelescopeSide::Right).await, (0.0, 2.3));
    assert_eq!(
        devices.pointing.opw_position().await.unwrap(),
        opw_before - 1300
    );
    assert_eq!(devices.pointing.beam2_y().await.unwrap(), beam2_before + 2.0);
    for before in rois_before {
        let after = devices.camera.query_roi(before.id).await.unwrap();
        assert_eq!(after.y, before.y + 127.0);
        assert_eq!(after.x, before.x);
    }
    assert_eq!(result.get_f64("roi_shift_pixels"), Some(127.0));

    // The display background was refreshed and the camera is free running again.
    let camera = server.camera_settings().await;
    assert_eq!(camera.integrations, 1);
    assert!(camera.continuous);
}

#[tokio::test]
async fn test_single_side_nod_leaves_phasecam_alone() {
    let config = fast_config();
    let (server, devices) = devices(quiet_simulator());
    let roi_before = devices.camera.query_roi(3).await.unwrap();
    let opw_before = devices.pointing.opw_position().await.unwrap();

    let mut nod = Nod::new(
        NodDirection::Down,
        config.telescope.clone(),
        config.camera.clone(),
    )
    .with_side(TelescopeSide::Left);
    execute_procedure_safely(&mut nod, context(devices.clone()), EmergencyStopFlag::new())
        .await
        .unwrap();

    assert_eq!(server.pointing_offset(TelescopeSide::Left).await, (0.0, -2.3));
    assert_eq!(server.pointing_offset(TelescopeSide::Right).await, (0.0, 0.0));
    assert_eq!(devices.pointing.opw_position().await.unwrap(), opw_before);
    assert_eq!(devices.camera.query_roi(3).await.unwrap(), roi_before);
}

#[tokio::test]
async fn test_nod_without_telescope_moves_only_phasecam() {
    let config = fast_config();
    let (server, devices) = devices(quiet_simulator());
    let opw_before = devices.pointing.opw_position().await.unwrap();

    let mut nod = Nod::new(
        NodDirection::Down,
        config.telescope.clone(),
        config.camera.clone(),
    )
    .without_telescope();
    let ctx = context(devices.clone());
    let result = execute_procedure_safely(&mut nod, ctx, EmergencyStopFlag::new())
        .await
        .unwrap();

    assert_eq!(server.pointing_offset(TelescopeSide::Left).await, (0.0, 0.0));
    assert_eq!(
        devices.pointing.opw_position().await.unwrap(),
        opw_before + 1300
    );
    assert_eq!(result.get_f64("roi_shift_pixels"), Some(-127.0));
}

#[tokio::test]
async fn test_background_offset_waits_for_ao() {
    let config = fast_config();
    let (server, devices) = devices(SimulatorConfig {
        ao_recovery_polls: 4,
        ..quiet_simulator()
    });

    let mut off = BackgroundOffset::new(
        NodDirection::Up,
        config.telescope.clone(),
        config.camera.clone(),
    );
    execute_procedure_safely(&mut off, context(devices.clone()), EmergencyStopFlag::new())
        .await
        .unwrap();
    assert_eq!(server.pointing_offset(TelescopeSide::Left).await, (0.0, 5.0));
    assert_eq!(server.pointing_offset(TelescopeSide::Right).await, (0.0, 5.0));
    assert!(devices.pointing.ao_loops_closed().await.unwrap());

    let mut back = BackgroundOffset::new(
        NodDirection::Down,
        config.telescope.clone(),
        config.camera.clone(),
    );
    execute_procedure_safely(&mut back, context(devices), EmergencyStopFlag::new())
        .await
        .unwrap();
    assert_eq!(server.pointing_offset(TelescopeSide::Left).await, (0.0, 0.0));
}

#[test]
fn test_ao_wait_returns_once_loops_recover() {
    tokio_test::block_on(async {
        let config = fast_config();
        let (_server, devices) = devices(SimulatorConfig {
            ao_recovery_polls: 3,
            ..quiet_simulator()
        });
        devices
            .pointing
            .offset_pointing(0.0, 1.0, TelescopeSide::Both)
            .await
            .unwrap();
        let frames = wait_ao_loop(&devices, &config.camera, false).await.unwrap();
        assert_eq!(frames, 0);
        assert!(devices.pointing.ao_loops_closed().await.unwrap());
    });
}
