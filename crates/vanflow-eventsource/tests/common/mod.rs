#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vanflow_session::{BackoffPolicy, Container, ContainerConfig, MemoryBus};

/// Start a container on `bus` with a short reconnect delay.
pub fn container(bus: &MemoryBus, name: &str, cancel: &CancellationToken) -> Container {
    let container = Container::new(
        Arc::new(bus.clone()),
        ContainerConfig {
            container_id: name.to_string(),
            backoff: BackoffPolicy::constant(Duration::from_millis(5)),
        },
    );
    container.start(cancel.clone());
    container
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
