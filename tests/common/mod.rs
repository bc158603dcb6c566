//! Shared utilities for integration tests.
//!
//! Builds engines with fast retry pacing and waits on frontend progress
//! with a bounded timeout.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use target_engine::config::RetryConfig;
use target_engine::test_utils::{MockBackend, MockFrontend};
use target_engine::{Device, DeviceConfig, Engine, EngineConfig};

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Engine whose queue-full sweep retries within a few milliseconds.
pub fn fast_engine() -> Arc<Engine> {
    let config = EngineConfig {
        retry: RetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        },
        ..EngineConfig::for_test()
    };
    Arc::new(Engine::with_defaults(config))
}

pub fn disk(name: &str, max_sectors: u32) -> DeviceConfig {
    DeviceConfig {
        max_sectors,
        ..DeviceConfig::named(name)
    }
}

/// Engine with one device backed by a manual mock backend.
pub fn manual_setup(max_sectors: u32) -> (Arc<Engine>, Arc<Device>, Arc<MockBackend>) {
    let engine = fast_engine();
    let backend = MockBackend::new();
    let device = engine
        .add_device(disk("manual", max_sectors), backend.clone())
        .expect("Failed to attach device");
    (engine, device, backend)
}

/// Await `future`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("Timed out")
}

pub async fn released(frontend: &MockFrontend, n: usize) {
    within(frontend.wait_releases(n)).await;
}

/// Yield until `check` holds.
pub async fn until(mut check: impl FnMut() -> bool) {
    within(async {
        while !check() {
            tokio::task::yield_now().await;
        }
    })
    .await;
}
