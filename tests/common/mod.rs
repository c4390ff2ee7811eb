#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use fibra::{Scheduler, SchedulerConfig};

pub fn scheduler(workers: usize) -> Arc<Scheduler> {
    Scheduler::new(SchedulerConfig {
        num_workers: workers,
        ..SchedulerConfig::default()
    })
    .unwrap()
}

pub fn scheduler_with(config: SchedulerConfig) -> Arc<Scheduler> {
    Scheduler::new(config).unwrap()
}

/// 轮询直到条件成立，超过 5 秒视为失败
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::yield_now();
    }
}
