//! A controller wired to mock media and storage, plus event helpers.

use call_controller::actors::{ActorMetrics, CallControllerHandle};
use call_controller::config::Config;
use call_controller::media::engine::mock::MockMediaEngine;
use call_controller::media::{MediaEngine, RouterRegistry};
use call_controller::record::CallRecord;
use call_controller::signaling::CallEvent;
use call_controller::store::mock::MockCallRecordStore;
use call_controller::store::CallRecordStore;
use common::types::CallId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long helpers wait before failing a test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller plus the mocks behind it.
pub struct TestController {
    pub controller: CallControllerHandle,
    pub engine: Arc<MockMediaEngine>,
    pub registry: Arc<RouterRegistry>,
    pub store: Arc<MockCallRecordStore>,
    pub metrics: Arc<ActorMetrics>,
}

impl TestController {
    /// Controller over a healthy mock engine and store.
    #[must_use]
    pub fn start(config: &Config) -> Self {
        Self::with_mocks(config, MockMediaEngine::new(), MockCallRecordStore::new())
    }

    #[must_use]
    pub fn with_mocks(config: &Config, engine: MockMediaEngine, store: MockCallRecordStore) -> Self {
        let engine = Arc::new(engine);
        let registry = Arc::new(RouterRegistry::from_config(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            config,
        ));
        let store = Arc::new(store);
        let metrics = ActorMetrics::new();
        let controller = CallControllerHandle::new(
            config,
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn CallRecordStore>,
            Arc::clone(&metrics),
        );
        Self {
            controller,
            engine,
            registry,
            store,
            metrics,
        }
    }

    /// Wait until the call's record has been saved.
    pub async fn wait_for_record(&self, call_id: CallId) -> CallRecord {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                if let Some(record) = self.store.get(&call_id).await {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("call record was not saved in time")
    }

    /// Wait until the call's router is gone from the registry.
    pub async fn wait_for_release(&self, call_id: CallId) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.registry.handle_for(&call_id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("router was not released in time");
    }

    /// Wait until the controller supervises no calls.
    pub async fn wait_for_idle(&self) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let status = self.controller.get_status().await.expect("status");
                if status.call_count == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("calls did not drain in time");
    }
}

impl Drop for TestController {
    fn drop(&mut self) {
        self.controller.cancel();
    }
}

/// Collects outbound events for one subscriber.
pub struct EventCollector {
    receiver: broadcast::Receiver<CallEvent>,
    seen: Vec<CallEvent>,
}

impl EventCollector {
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<CallEvent>) -> Self {
        Self {
            receiver,
            seen: Vec::new(),
        }
    }

    /// Wait for the first event matching `predicate`, keeping the ones before it.
    pub async fn wait_for(&mut self, predicate: impl Fn(&CallEvent) -> bool) -> CallEvent {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                match self.receiver.recv().await {
                    Ok(event) => {
                        self.seen.push(event.clone());
                        if predicate(&event) {
                            return event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event channel closed")
                    }
                }
            }
        })
        .await
        .expect("expected event did not arrive in time")
    }

    /// Wait for `CallEnded` for `call_id`.
    pub async fn wait_for_end(&mut self, call_id: CallId) -> CallEvent {
        self.wait_for(|e| matches!(e, CallEvent::CallEnded { call_id: id, .. } if *id == call_id))
            .await
    }

    /// Drain whatever is already buffered.
    pub fn drain(&mut self) -> &[CallEvent] {
        while let Ok(event) = self.receiver.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    /// Events observed so far, in order.
    #[must_use]
    pub fn seen(&self) -> &[CallEvent] {
        &self.seen
    }
}
