//! In-process media engine.
//!
//! Keeps the full router/transport/consumer topology in memory and allocates
//! transport ports from the configured range. It forwards no packets; a
//! deployment wires a real SFU adapter behind [`MediaEngine`] instead. The
//! binary uses it so the controller runs standalone.

use super::engine::{
    CodecCapability, ConsumerId, MediaEngine, RouterId, TransportDirection, TransportId,
};
use super::{MediaError, WorkerId};
use crate::config::Config;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct TransportState {
    port: u16,
    direction: TransportDirection,
    outgoing_bitrate: u32,
}

#[derive(Debug)]
struct RouterState {
    worker: WorkerId,
    codecs: Vec<CodecCapability>,
    transports: HashMap<TransportId, TransportState>,
    /// Consumer -> (producer transport, consumer transport).
    consumers: HashMap<ConsumerId, (TransportId, TransportId)>,
}

#[derive(Debug, Default)]
struct EngineState {
    routers: HashMap<RouterId, RouterState>,
    ports_in_use: BTreeSet<u16>,
    next_port: u16,
}

/// Bookkeeping engine with real port-range and bitrate accounting.
#[derive(Debug)]
pub struct InProcessEngine {
    min_port: u16,
    max_port: u16,
    initial_outgoing_bitrate: u32,
    min_outgoing_bitrate: u32,
    next_id: AtomicU64,
    state: Mutex<EngineState>,
}

impl InProcessEngine {
    /// Create an engine for the given port range and bitrate bounds.
    #[must_use]
    pub fn new(
        min_port: u16,
        max_port: u16,
        initial_outgoing_bitrate: u32,
        min_outgoing_bitrate: u32,
    ) -> Self {
        Self {
            min_port,
            max_port,
            initial_outgoing_bitrate,
            min_outgoing_bitrate,
            next_id: AtomicU64::new(0),
            state: Mutex::new(EngineState {
                next_port: min_port,
                ..EngineState::default()
            }),
        }
    }

    /// Create an engine from validated configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rtc_min_port,
            config.rtc_max_port,
            config.initial_outgoing_bitrate,
            config.min_outgoing_bitrate,
        )
    }

    /// Number of open routers.
    pub async fn router_count(&self) -> usize {
        self.state.lock().await.routers.len()
    }

    /// Number of open transports across all routers.
    pub async fn transport_count(&self) -> usize {
        self.state
            .lock()
            .await
            .routers
            .values()
            .map(|r| r.transports.len())
            .sum()
    }

    /// Number of live consumers on `router`.
    pub async fn consumer_count(&self, router: &RouterId) -> usize {
        self.state
            .lock()
            .await
            .routers
            .get(router)
            .map_or(0, |r| r.consumers.len())
    }

    /// Number of ports currently bound.
    pub async fn ports_in_use(&self) -> usize {
        self.state.lock().await.ports_in_use.len()
    }

    /// Worker hosting `router`, if open.
    pub async fn router_worker(&self, router: &RouterId) -> Option<WorkerId> {
        self.state.lock().await.routers.get(router).map(|r| r.worker)
    }

    /// Codec set `router` was created with.
    pub async fn router_codecs(&self, router: &RouterId) -> Option<Vec<CodecCapability>> {
        self.state
            .lock()
            .await
            .routers
            .get(router)
            .map(|r| r.codecs.clone())
    }

    /// Current outgoing bitrate of a transport.
    pub async fn transport_bitrate(&self, router: &RouterId, transport: &TransportId) -> Option<u32> {
        self.state
            .lock()
            .await
            .routers
            .get(router)
            .and_then(|r| r.transports.get(transport))
            .map(|t| t.outgoing_bitrate)
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }

    fn allocate_port(&self, state: &mut EngineState) -> Result<u16, MediaError> {
        let span = u32::from(self.max_port) - u32::from(self.min_port) + 1;
        let mut candidate = state.next_port;
        for _ in 0..span {
            if candidate < self.min_port || candidate > self.max_port {
                candidate = self.min_port;
            }
            if state.ports_in_use.insert(candidate) {
                state.next_port = candidate.checked_add(1).unwrap_or(self.min_port);
                return Ok(candidate);
            }
            candidate = candidate.checked_add(1).unwrap_or(self.min_port);
        }
        Err(MediaError::PortsExhausted)
    }
}

#[async_trait::async_trait]
impl MediaEngine for InProcessEngine {
    async fn create_router(
        &self,
        worker: WorkerId,
        codecs: &[CodecCapability],
    ) -> Result<RouterId, MediaError> {
        let router_id = RouterId(self.next_id("router"));
        let mut state = self.state.lock().await;
        state.routers.insert(
            router_id.clone(),
            RouterState {
                worker,
                codecs: codecs.to_vec(),
                transports: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        debug!(
            target: "cc.media.engine",
            router_id = %router_id,
            worker = %worker,
            "Router created"
        );
        Ok(router_id)
    }

    async fn create_transport(
        &self,
        router: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportId, MediaError> {
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(router) {
            return Err(MediaError::RouterNotFound(router.to_string()));
        }
        let port = self.allocate_port(&mut state)?;
        let transport_id = TransportId(self.next_id("transport"));
        let initial = self.initial_outgoing_bitrate.max(self.min_outgoing_bitrate);
        if let Some(router_state) = state.routers.get_mut(router) {
            router_state.transports.insert(
                transport_id.clone(),
                TransportState {
                    port,
                    direction,
                    outgoing_bitrate: initial,
                },
            );
        }
        Ok(transport_id)
    }

    async fn connect_producer_consumer(
        &self,
        router: &RouterId,
        producer: &TransportId,
        consumer: &TransportId,
    ) -> Result<ConsumerId, MediaError> {
        let consumer_id = ConsumerId(self.next_id("consumer"));
        let mut state = self.state.lock().await;
        let router_state = state
            .routers
            .get_mut(router)
            .ok_or_else(|| MediaError::RouterNotFound(router.to_string()))?;

        let producer_ok = router_state
            .transports
            .get(producer)
            .is_some_and(|t| t.direction == TransportDirection::Ingress);
        let consumer_ok = router_state
            .transports
            .get(consumer)
            .is_some_and(|t| t.direction == TransportDirection::Egress);
        if !producer_ok || !consumer_ok {
            return Err(MediaError::Engine(
                "producer must be ingress and consumer must be egress".to_string(),
            ));
        }

        router_state
            .consumers
            .insert(consumer_id.clone(), (producer.clone(), consumer.clone()));
        Ok(consumer_id)
    }

    async fn close_transport(
        &self,
        router: &RouterId,
        transport: &TransportId,
    ) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        let freed = state.routers.get_mut(router).and_then(|r| {
            r.consumers
                .retain(|_, (p, c)| p != transport && c != transport);
            r.transports.remove(transport).map(|t| t.port)
        });
        if let Some(port) = freed {
            state.ports_in_use.remove(&port);
        }
        Ok(())
    }

    async fn close_router(&self, router: &RouterId) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if let Some(router_state) = state.routers.remove(router) {
            for transport in router_state.transports.values() {
                state.ports_in_use.remove(&transport.port);
            }
            debug!(
                target: "cc.media.engine",
                router_id = %router,
                "Router closed"
            );
        }
        Ok(())
    }
}
