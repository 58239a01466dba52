// tests/lifecycle.rs
//! Restart and shutdown sequencing against a running service

mod common;

use common::{sh, started_service, test_config, wait_for_status, wait_until};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskflow_engine::runtime::ExecutorStatus;
use taskflow_engine::{
    EngineError, LifecyclePhase, RestartManager, ShutdownManager, TaskStatus,
};
use tempfile::tempdir;

#[test]
fn test_shutdown_returns_after_active_tasks_finish() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), 3);
    config.lifecycle.shutdown_wait_timeout = "30s".to_string();
    let service = started_service(config);

    let ids: Vec<_> = (0..3)
        .map(|_| service.submit_task(sh("sleep 0.5")).unwrap())
        .collect();
    for id in &ids {
        wait_for_status(&service, id, TaskStatus::Running);
    }

    let shutdown = ShutdownManager::new(Arc::clone(&service));
    shutdown.start().unwrap();
    let report = shutdown.shutdown().unwrap();

    assert!(report.is_clean(), "{:?}", report);
    for id in &ids {
        assert_eq!(service.get_task(id).unwrap().status, TaskStatus::Completed);
    }
    assert_eq!(service.phase(), LifecyclePhase::Stopped);

    let names: Vec<_> = report.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "stop accepting submissions",
            "wait for active tasks",
            "stop monitoring",
            "stop worker pool",
            "stop sandbox executor",
            "release resources",
        ]
    );
}

#[test]
fn test_shutdown_rejected_while_restarting() {
    let dir = tempdir().unwrap();
    let service = started_service(test_config(dir.path(), 1));
    service.submit_task(sh("sleep 1")).unwrap();

    let restart = Arc::new(RestartManager::new(Arc::clone(&service)));
    restart.start().unwrap();
    let shutdown = ShutdownManager::new(Arc::clone(&service));
    shutdown.start().unwrap();

    let background = {
        let restart = Arc::clone(&restart);
        thread::spawn(move || restart.restart())
    };
    assert!(wait_until(Duration::from_secs(5), || {
        service.phase() == LifecyclePhase::Restarting
    }));

    assert!(matches!(
        shutdown.shutdown(),
        Err(EngineError::LifecycleConflict("restart"))
    ));
    assert!(matches!(
        restart.restart(),
        Err(EngineError::LifecycleConflict("restart"))
    ));

    background.join().unwrap().unwrap();
    assert_eq!(service.phase(), LifecyclePhase::Idle);

    // Restart leaves the engine running, so a shutdown is allowed now
    assert_eq!(service.get_executor_status(), ExecutorStatus::Running);
    assert!(shutdown.shutdown().unwrap().is_clean());
}

#[test]
fn test_force_shutdown_is_prompt() {
    let dir = tempdir().unwrap();
    let service = started_service(test_config(dir.path(), 2));
    let a = service.submit_task(sh("sleep 30")).unwrap();
    let b = service.submit_task(sh("sleep 30")).unwrap();
    wait_for_status(&service, &a, TaskStatus::Running);

    let shutdown = ShutdownManager::new(Arc::clone(&service));
    shutdown.start().unwrap();

    let started = Instant::now();
    let report = shutdown.force_shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.forced);
    assert_eq!(report.tasks_cancelled, 2);

    for id in [&a, &b] {
        assert_eq!(service.get_task(id).unwrap().status, TaskStatus::Cancelled);
    }
    assert_eq!(service.get_executor_status(), ExecutorStatus::Stopped);
}

#[test]
fn test_force_during_graceful_escalates() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), 1);
    config.lifecycle.shutdown_wait_timeout = "60s".to_string();
    let service = started_service(config);
    let id = service.submit_task(sh("sleep 30")).unwrap();
    wait_for_status(&service, &id, TaskStatus::Running);

    let shutdown = Arc::new(ShutdownManager::new(Arc::clone(&service)));
    shutdown.start().unwrap();

    let started = Instant::now();
    let graceful = {
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || shutdown.shutdown())
    };
    assert!(wait_until(Duration::from_secs(5), || {
        service.phase() == LifecyclePhase::ShuttingDown
    }));

    assert!(matches!(
        shutdown.force_shutdown(),
        Err(EngineError::LifecycleConflict("shutdown"))
    ));

    let report = graceful.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(report.is_clean());
    assert_eq!(service.get_task(&id).unwrap().status, TaskStatus::Cancelled);
}
