//! Bounded ingest channel in front of the engine. The event source sends into it; the
//! loop hands each event to the worker pool.

use std::sync::Arc;

use hotrank_core::ActionEvent;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::Engine;

/// Spawn the ingest loop. Returns the sender for events and a handle resolving to the
/// number of events accepted once every sender is dropped.
pub fn spawn_ingest(engine: Arc<Engine>, cap: usize) -> (mpsc::Sender<ActionEvent>, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::channel::<ActionEvent>(cap.max(1));
    let handle = tokio::spawn(async move {
        let mut accepted = 0u64;
        while let Some(ev) = rx.recv().await {
            accepted += 1;
            counter!("events_received_total", 1u64);
            engine.submit(ev);
        }
        debug!("event channel closed; exiting ingest loop");
        info!(accepted, "ingest loop stopped");
        accepted
    });
    (tx, handle)
}
