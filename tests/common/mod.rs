// tests/common/mod.rs
//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskflow_engine::utils::config::{IsolationKind, SandboxConfig};
use taskflow_engine::{EngineConfig, Service, Task, TaskStatus};

/// Configuration rooted in `root` with isolation off and short timings
pub fn test_config(root: &Path, workers: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.threadpool.max_workers = workers;
    config.threadpool.max_queue = 32;
    config.monitoring.interval = "50ms".to_string();
    config.monitoring.process_limit = 20;
    config.sandbox = SandboxConfig::default().with_root(root);
    config.sandbox.isolation.strategy = IsolationKind::None;
    config.sandbox.kill_grace = "200ms".to_string();
    config.lifecycle.restart_attempts = 2;
    config.lifecycle.restart_backoff = "10ms".to_string();
    config
}

pub fn started_service(config: EngineConfig) -> Arc<Service> {
    let service = Arc::new(Service::new(config, None).expect("service builds"));
    service.start().expect("service starts");
    service
}

pub fn sh(script: &str) -> Task {
    Task::new(script, "sh").with_args(["-c", script])
}

pub fn wait_for_status(service: &Service, id: &str, status: TaskStatus) -> Task {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let task = service.get_task(id).expect("task exists");
        if task.status == status {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {} stuck in {} waiting for {}",
            id,
            task.status,
            status
        );
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
