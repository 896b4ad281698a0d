//! Capture session tests against the mock driver.

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::json;
use serial_test::serial;

use common::*;
use spreads::device::exif::read_orientation;
use spreads::{DeviceError, Signal, SpreadsError, TargetPage, WorkflowError};

fn capture_nums(pages: &[spreads::Page]) -> Vec<u32> {
    pages.iter().map(|p| p.capture_num).collect()
}

#[test]
fn test_three_shots_with_two_devices() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("three shots");

    for _ in 0..3 {
        let shot = workflow.capture(false).unwrap();
        assert_eq!(shot.len(), 2);
    }

    let pages = workflow.pages();
    assert_eq!(capture_nums(&pages), vec![0, 1, 2, 3, 4, 5]);
    for page in &pages {
        assert_eq!(page.sequence_num, page.capture_num);
        assert_eq!(page.raw_image, format!("data/raw/{:03}.jpg", page.capture_num));
        assert!(workflow.path().join(&page.raw_image).is_file());
    }
    workflow.validate(false).unwrap();

    let executed = harness.events(Signal::CaptureExecuted);
    assert_eq!(executed.len(), 3);
    for event in &executed {
        assert_eq!(event.payload["pages"].as_array().unwrap().len(), 2);
        assert_eq!(event.payload["retake"], json!(false));
    }
}

#[test]
fn test_retake_replaces_last_shot() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("retake");
    for _ in 0..3 {
        workflow.capture(false).unwrap();
    }
    let before = std::fs::read(workflow.path().join("data/raw/004.jpg")).unwrap();

    let shot = workflow.capture(true).unwrap();
    assert_eq!(capture_nums(&shot), vec![4, 5]);

    let pages = workflow.pages();
    assert_eq!(capture_nums(&pages), vec![0, 1, 2, 3, 4, 5]);
    let after = std::fs::read(workflow.path().join("data/raw/004.jpg")).unwrap();
    assert_ne!(before, after);
    workflow.validate(false).unwrap();

    let retakes: Vec<_> = harness
        .events(Signal::CaptureExecuted)
        .into_iter()
        .filter(|e| e.payload["retake"] == json!(true))
        .collect();
    assert_eq!(retakes.len(), 1);
}

#[test]
fn test_capture_after_removal_fills_gap() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("gap");
    for _ in 0..3 {
        workflow.capture(false).unwrap();
    }

    let pages = workflow.pages();
    workflow
        .remove_pages(&[pages[2].clone(), pages[3].clone()])
        .unwrap();
    assert_eq!(capture_nums(&workflow.pages()), vec![0, 1, 4, 5]);
    assert!(!workflow.path().join("data/raw/002.jpg").exists());

    let shot = workflow.capture(false).unwrap();
    assert_eq!(capture_nums(&shot), vec![2, 3]);

    let pages = workflow.pages();
    assert_eq!(capture_nums(&pages), vec![0, 1, 2, 3, 4, 5]);
    let sequence: Vec<u32> = pages.iter().map(|p| p.sequence_num).collect();
    assert_eq!(sequence, vec![0, 1, 2, 3, 4, 5]);
    workflow.validate(false).unwrap();
}

#[test]
fn test_retake_after_removals_only_replaces_whole_spread() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("retake after removal");
    for _ in 0..3 {
        workflow.capture(false).unwrap();
    }
    let pages = workflow.pages();
    workflow.remove_pages(&[pages[2].clone()]).unwrap();
    workflow
        .remove_pages(&[pages[4].clone(), pages[5].clone()])
        .unwrap();
    assert_eq!(capture_nums(&workflow.pages()), vec![0, 1, 3]);
    let lone = std::fs::read(workflow.path().join("data/raw/003.jpg")).unwrap();

    // The last shot is gone, so the latest whole spread is retaken
    let shot = workflow.capture(true).unwrap();
    assert_eq!(capture_nums(&shot), vec![0, 1]);
    assert_eq!(capture_nums(&workflow.pages()), vec![0, 1, 3]);
    assert_eq!(
        std::fs::read(workflow.path().join("data/raw/003.jpg")).unwrap(),
        lone
    );
    workflow.validate(false).unwrap();
}

#[test]
fn test_retake_of_half_removed_shot_keeps_remaining_page() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("half shot");
    workflow.capture(false).unwrap();
    workflow.capture(false).unwrap();
    let pages = workflow.pages();
    workflow.remove_pages(&[pages[3].clone()]).unwrap();
    let kept = std::fs::read(workflow.path().join("data/raw/002.jpg")).unwrap();

    let shot = workflow.capture(true).unwrap();
    assert_eq!(capture_nums(&shot), vec![0, 1]);
    assert_eq!(capture_nums(&workflow.pages()), vec![0, 1, 2]);
    assert_eq!(
        std::fs::read(workflow.path().join("data/raw/002.jpg")).unwrap(),
        kept
    );
    workflow.validate(false).unwrap();
}

#[test]
fn test_retake_without_whole_spread_shoots_fresh_pair() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("no spread");
    workflow.capture(false).unwrap();
    let pages = workflow.pages();
    workflow.remove_pages(&[pages[1].clone()]).unwrap();
    let kept = std::fs::read(workflow.path().join("data/raw/000.jpg")).unwrap();

    let shot = workflow.capture(true).unwrap();
    assert_eq!(capture_nums(&shot), vec![2, 3]);
    assert_eq!(capture_nums(&workflow.pages()), vec![0, 2, 3]);
    assert_eq!(
        std::fs::read(workflow.path().join("data/raw/000.jpg")).unwrap(),
        kept
    );
    workflow.validate(false).unwrap();
}

#[test]
#[serial]
fn test_sequential_capture_is_slower_than_parallel() {
    let run = |parallel: bool| {
        let harness = TestHarness::builder()
            .delay(Duration::from_millis(100))
            .parallel(parallel)
            .build();
        let workflow = harness.prepared_workflow("timing");
        let started = Instant::now();
        let shot = workflow.capture(false).unwrap();
        let elapsed = started.elapsed();
        let layout: Vec<(u32, String)> = shot
            .iter()
            .map(|p| (p.capture_num, p.raw_image.clone()))
            .collect();
        (elapsed, layout)
    };

    let (sequential, sequential_pages) = run(false);
    let (parallel, parallel_pages) = run(true);
    assert!(sequential >= Duration::from_millis(200), "{:?}", sequential);
    assert!(parallel < Duration::from_millis(150), "{:?}", parallel);
    assert_eq!(sequential_pages, parallel_pages);
}

#[test]
fn test_prepare_without_devices_fails() {
    let harness = TestHarness::builder().targets(vec![]).build();
    let workflow = harness.create_workflow("empty");

    let err = workflow.prepare_capture(false).unwrap_err();
    assert!(matches!(err, SpreadsError::Device(DeviceError::NotFound(_))));
    assert!(!workflow.is_prepared());
}

#[test]
fn test_single_device_on_pair_driver_fails() {
    let harness = TestHarness::builder()
        .targets(vec![Some(TargetPage::Even)])
        .build();
    let workflow = harness.create_workflow("lonely");

    let err = workflow.prepare_capture(false).unwrap_err();
    assert!(matches!(err, SpreadsError::Device(DeviceError::MissingTargetPage)));
    assert_eq!(err.to_string(), "Device error: missing target page");
}

#[test]
fn test_single_device_numbers_consecutively() {
    let harness = TestHarness::builder()
        .targets(vec![None])
        .target_pages(false)
        .build();
    let workflow = harness.prepared_workflow("single");

    workflow.capture(false).unwrap();
    workflow.capture(false).unwrap();
    assert_eq!(capture_nums(&workflow.pages()), vec![0, 1]);
}

#[test]
fn test_failed_shot_leaves_no_pages() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("jam");
    *harness.rig.fail_device.lock() = Some(1);

    let err = workflow.capture(false).unwrap_err();
    assert!(matches!(err, SpreadsError::Device(DeviceError::Failed(_))));
    assert!(workflow.pages().is_empty());
    assert!(workflow.is_prepared());
    assert!(harness.events(Signal::CaptureExecuted).is_empty());

    let staging = workflow.path().join(".staging");
    let leftovers = std::fs::read_dir(&staging).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
    workflow.validate(false).unwrap();

    *harness.rig.fail_device.lock() = None;
    let shot = workflow.capture(false).unwrap();
    assert_eq!(capture_nums(&shot), vec![0, 1]);
}

#[test]
fn test_prepare_is_idempotent_unless_reset() {
    let harness = TestHarness::builder()
        .plugin("beep", |recorder| beep_plugin(recorder, false))
        .build();
    let workflow = harness.create_workflow("idempotent");

    workflow.prepare_capture(false).unwrap();
    workflow.prepare_capture(false).unwrap();
    assert_eq!(harness.recorder.count("beep.prepare:2"), 1);
    assert_eq!(harness.rig.prepares.load(Ordering::SeqCst), 2);

    workflow.prepare_capture(true).unwrap();
    assert_eq!(harness.recorder.count("beep.finish"), 1);
    assert_eq!(harness.recorder.count("beep.prepare:2"), 2);
    assert!(workflow.is_prepared());
}

#[test]
fn test_prepare_retries_transient_failure_once() {
    let harness = TestHarness::new();
    harness.rig.transient_failures.store(1, Ordering::SeqCst);
    let workflow = harness.create_workflow("flaky");

    workflow.prepare_capture(false).unwrap();
    assert_eq!(harness.rig.prepares.load(Ordering::SeqCst), 3);
}

#[test]
fn test_capture_hooks_run_in_order() {
    let harness = TestHarness::builder()
        .plugin("beep", |recorder| beep_plugin(recorder, false))
        .build();
    let workflow = harness.prepared_workflow("hooks");
    workflow.capture(false).unwrap();
    workflow.finish_capture().unwrap();

    assert_eq!(
        harness.recorder.calls(),
        vec!["beep.prepare:2", "beep.capture:2", "beep.finish"]
    );
}

#[test]
fn test_finish_capture_aggregates_failures() {
    let harness = TestHarness::builder()
        .plugin("beep", |recorder| beep_plugin(recorder, true))
        .build();
    let workflow = harness.prepared_workflow("aggregate");
    harness.rig.fail_finish.store(true, Ordering::SeqCst);

    let err = workflow.finish_capture().unwrap_err();
    match err {
        SpreadsError::Aggregate { errors } => assert_eq!(errors.len(), 3),
        other => panic!("expected aggregate error, got {:?}", other),
    }
    assert_eq!(harness.rig.finishes.load(Ordering::SeqCst), 2);
    assert!(!workflow.is_prepared());
    assert!(workflow.status().step_done);
}

#[test]
fn test_capture_start_spans_the_session() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("session");
    assert!(workflow.capture_start().is_none());

    workflow.capture(false).unwrap();
    let start = workflow.capture_start().unwrap();
    workflow.capture(false).unwrap();
    assert_eq!(workflow.capture_start(), Some(start));

    workflow.finish_capture().unwrap();
    assert!(workflow.capture_start().is_none());
}

#[test]
fn test_flip_swaps_file_assignment_only() {
    let harness = TestHarness::new();
    let workflow = harness.create_workflow("flipped");
    workflow
        .update_configuration(&json!({"device": {"flip_target_pages": true}}))
        .unwrap();
    workflow.prepare_capture(false).unwrap();
    workflow.capture(false).unwrap();

    // The even device now writes the odd-numbered file but keeps its own
    // orientation
    let odd_file = std::fs::read(workflow.path().join("data/raw/001.jpg")).unwrap();
    let even_file = std::fs::read(workflow.path().join("data/raw/000.jpg")).unwrap();
    assert_eq!(read_orientation(&odd_file), Some(8));
    assert_eq!(read_orientation(&even_file), Some(6));
}

#[test]
fn test_capture_requires_prepare() {
    let harness = TestHarness::new();
    let workflow = harness.create_workflow("unprepared");

    let err = workflow.capture(false).unwrap_err();
    assert!(matches!(err, SpreadsError::Workflow(WorkflowError::NotPrepared)));

    workflow.prepare_capture(false).unwrap();
    let err = workflow.process().unwrap_err();
    assert!(matches!(
        err,
        SpreadsError::Workflow(WorkflowError::IllegalTransition { .. })
    ));
}

#[test]
fn test_disconnected_device_blocks_capture() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("unplugged");
    harness.rig.connected.store(false, Ordering::SeqCst);

    let err = workflow.capture(false).unwrap_err();
    assert!(matches!(err, SpreadsError::Device(DeviceError::NotFound(_))));
    assert_eq!(harness.rig.captures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_aborts_next_shot_only() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("cancelled");

    assert!(workflow.cancel());
    assert!(matches!(workflow.capture(false), Err(SpreadsError::Cancelled)));
    assert!(workflow.pages().is_empty());

    workflow.capture(false).unwrap();
    assert_eq!(workflow.pages().len(), 2);
}

#[test]
fn test_prepare_clears_pending_cancel() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("stale cancel");

    assert!(workflow.cancel());
    workflow.prepare_capture(false).unwrap();
    assert!(!workflow.is_cancelled());
    assert_eq!(workflow.capture(false).unwrap().len(), 2);
}

#[test]
#[serial]
fn test_concurrent_prepares_of_two_workflows_finish() {
    let harness = TestHarness::new();
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    for title in ["left", "right"] {
        let workflow = harness.create_workflow(title);
        let done_tx = done_tx.clone();
        std::thread::spawn(move || {
            let all_prepared = (0..20).all(|_| {
                let prepared = workflow.prepare_capture(false).is_ok();
                let _ = workflow.finish_capture();
                prepared
            });
            let _ = done_tx.send(all_prepared);
        });
    }

    for _ in 0..2 {
        let all_prepared = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("prepare_capture deadlocked");
        assert!(all_prepared);
    }
}

#[test]
fn test_preparing_second_workflow_finishes_first() {
    let harness = TestHarness::new();
    let first = harness.prepared_workflow("first");
    let second = harness.prepared_workflow("second");

    assert!(!first.is_prepared());
    assert!(second.is_prepared());
    assert_eq!(harness.rig.finishes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_configuration_reaches_prepared_devices() {
    let harness = TestHarness::new();
    let workflow = harness.prepared_workflow("live");

    let diff = workflow
        .update_configuration(&json!({"device": {"upside_down": true}}))
        .unwrap();
    assert_eq!(diff, json!({"device": {"upside_down": true}}));
    let updates = harness.rig.config_updates.lock().clone();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0], diff);
}

#[test]
#[serial]
fn test_interval_trigger_drives_captures() {
    let harness = TestHarness::builder().activate("intervaltrigger").build();
    let workflow = harness.create_workflow("pedal");
    workflow
        .update_configuration(&json!({"intervaltrigger": {"interval": 0.05}}))
        .unwrap();
    workflow.prepare_capture(false).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while workflow.pages().len() < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    workflow.finish_capture().unwrap();
    let captured = workflow.pages().len();
    assert!(captured >= 4, "only {} pages captured", captured);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(workflow.pages().len(), captured);
    workflow.validate(false).unwrap();
}
