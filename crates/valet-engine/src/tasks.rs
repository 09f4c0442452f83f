//! Background loops: event polling and inventory refresh.
//!
//! Both run until the shutdown channel flips. A failed iteration is logged
//! and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::inventory::Inventory;

/// Every `interval`, apply queued events batch by batch until none are left.
pub async fn run_event_loop(engine: Engine, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                loop {
                    match engine.process_events().await {
                        Ok(report) if report.total() > 0 => {
                            debug!(events = report.total(), "event batch applied");
                        }
                        Ok(_) => break,
                        Err(err) => {
                            warn!(error = %err, retryable = err.is_retryable(), "event batch failed");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("event loop shutting down");
                break;
            }
        }
    }
}

/// Pull the inventory every `interval`.
pub async fn run_inventory_refresh(
    engine: Engine,
    inventory: Arc<dyn Inventory>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match engine.refresh_inventory(inventory.as_ref()).await {
                    Ok(changed) => debug!(changed, "inventory refreshed"),
                    Err(err) => warn!(error = %err, "inventory refresh failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("inventory refresh shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::COMPUTE_NODE_UPDATE;
    use crate::testing::{config, event, static_inventory};
    use valet_state::StateStore;

    #[tokio::test]
    async fn event_loop_drains_queue_until_shutdown() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = Engine::new(&config(), store.clone());
        engine.refresh_inventory(&static_inventory()).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_event_loop(
            engine.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        store
            .put_event(&event(
                1,
                COMPUTE_NODE_UPDATE,
                serde_json::json!({"host": "h1", "vcpus": 4}),
            ))
            .unwrap();

        let mut drained = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.list_events(10).unwrap().is_empty() {
                drained = true;
                break;
            }
        }
        assert!(drained);
        let vcpus = engine.lock().await.topology().host("h1").map(|h| h.original.vcpus);
        assert_eq!(vcpus, Some(4));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn refresh_loop_populates_topology() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = Engine::new(&config(), store);
        let inventory: Arc<dyn Inventory> = Arc::new(static_inventory());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_inventory_refresh(
            engine.clone(),
            inventory,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        let mut hosts = 0;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            hosts = engine.lock().await.topology().hosts().count();
            if hosts > 0 {
                break;
            }
        }
        assert_eq!(hosts, 4);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
