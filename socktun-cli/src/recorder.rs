//! Keeps the selected profile in step with the session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use socktun_engine::{
    run_blocking, EventHandler, LoggingEventHandler, ProfileStore, SelectedProfile, SessionEvent,
};
use tracing::warn;

/// Writes every status notification into the store's selected slot
///
/// Once frozen, notifications are only logged, so the status recorded
/// before daemon teardown survives for the next start.
pub struct StoreRecorder {
    store: Arc<dyn ProfileStore>,
    frozen: AtomicBool,
    log: LoggingEventHandler,
}

impl StoreRecorder {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            frozen: AtomicBool::new(false),
            log: LoggingEventHandler,
        }
    }

    /// Stop recording
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventHandler for StoreRecorder {
    async fn on_event(&self, event: SessionEvent) {
        if let SessionEvent::Status(ref notification) = event {
            if let Some(ref endpoint) = notification.endpoint {
                if !self.frozen.load(Ordering::SeqCst) {
                    let selected = SelectedProfile {
                        endpoint: endpoint.clone(),
                        status: Some(notification.status),
                    };
                    let result =
                        run_blocking(&self.store, move |store| store.select(selected)).await;
                    if let Err(e) = result {
                        warn!("Failed to record status {}: {}", notification.status, e);
                    }
                }
            }
        }
        self.log.on_event(event).await;
    }
}
