//! Media engine capability.
//!
//! The SFU is treated as a capability exposing exactly five operations. Call
//! sites hold only the opaque IDs returned here, so swapping the engine never
//! touches the session state machine.

use super::{MediaError, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media kind of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// A codec a router is willing to forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapability {
    pub kind: MediaKind,
    /// Full MIME type, e.g. `audio/opus`.
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

impl CodecCapability {
    /// Parse `kind/name/clock_rate[/channels]`, e.g. `audio/opus/48000/2`.
    #[must_use]
    pub fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.split('/');
        let kind = match parts.next()? {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => return None,
        };
        let name = parts.next().filter(|n| !n.is_empty())?;
        let clock_rate = parts.next()?.parse().ok()?;
        let channels = match parts.next() {
            Some(c) => Some(c.parse().ok()?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }

        let prefix = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        Some(Self {
            kind,
            mime_type: format!("{prefix}/{name}"),
            clock_rate,
            channels,
        })
    }
}

/// Direction of a participant transport relative to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Participant publishes (producer side).
    Ingress,
    /// Participant receives (consumer side).
    Egress,
}

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(RouterId);
opaque_id!(TransportId);
opaque_id!(ConsumerId);

/// SFU capability used by the router registry.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a router on `worker` offering `codecs`.
    async fn create_router(
        &self,
        worker: WorkerId,
        codecs: &[CodecCapability],
    ) -> Result<RouterId, MediaError>;

    /// Create one participant transport on `router`.
    async fn create_transport(
        &self,
        router: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportId, MediaError>;

    /// Forward the producer on `producer` to a new consumer on `consumer`.
    async fn connect_producer_consumer(
        &self,
        router: &RouterId,
        producer: &TransportId,
        consumer: &TransportId,
    ) -> Result<ConsumerId, MediaError>;

    /// Close a transport; consumers fed by its producer close with it.
    async fn close_transport(
        &self,
        router: &RouterId,
        transport: &TransportId,
    ) -> Result<(), MediaError>;

    /// Close a router and anything still attached to it.
    async fn close_router(&self, router: &RouterId) -> Result<(), MediaError>;
}

/// Mock media engine for testing.
///
/// Counts every operation and can be told to fail specific ones.
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Mock engine with per-operation counters and failure injection.
    #[derive(Debug, Default)]
    pub struct MockMediaEngine {
        next_id: AtomicU64,
        routers_created: AtomicUsize,
        routers_closed: AtomicUsize,
        transports_created: AtomicUsize,
        transports_closed: AtomicUsize,
        connections: AtomicUsize,
        unreachable_workers: HashSet<usize>,
        /// Router creations still to fail, on any worker.
        router_failures: AtomicUsize,
        fail_transports: AtomicBool,
        fail_close_router: AtomicBool,
        transport_delay: Option<Duration>,
    }

    impl MockMediaEngine {
        /// Engine where every operation succeeds.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Engine that cannot reach the given worker indexes.
        #[must_use]
        pub fn with_unreachable_workers(workers: impl IntoIterator<Item = usize>) -> Self {
            Self {
                unreachable_workers: workers.into_iter().collect(),
                ..Self::default()
            }
        }

        /// Engine whose transport creation sleeps first (for in-flight cancellation tests).
        #[must_use]
        pub fn with_transport_delay(delay: Duration) -> Self {
            Self {
                transport_delay: Some(delay),
                ..Self::default()
            }
        }

        /// Make the next `count` router creations fail, whichever worker they target.
        pub fn fail_next_routers(&self, count: usize) {
            self.router_failures.store(count, Ordering::SeqCst);
        }

        /// Make subsequent transport creation fail.
        pub fn fail_transports(&self, fail: bool) {
            self.fail_transports.store(fail, Ordering::SeqCst);
        }

        /// Make subsequent router close calls fail.
        pub fn fail_close_router(&self, fail: bool) {
            self.fail_close_router.store(fail, Ordering::SeqCst);
        }

        pub fn routers_created(&self) -> usize {
            self.routers_created.load(Ordering::SeqCst)
        }

        pub fn routers_closed(&self) -> usize {
            self.routers_closed.load(Ordering::SeqCst)
        }

        pub fn transports_created(&self) -> usize {
            self.transports_created.load(Ordering::SeqCst)
        }

        pub fn transports_closed(&self) -> usize {
            self.transports_closed.load(Ordering::SeqCst)
        }

        pub fn connections(&self) -> usize {
            self.connections.load(Ordering::SeqCst)
        }

        /// Transports created and not yet closed.
        pub fn live_transports(&self) -> usize {
            self.transports_created()
                .saturating_sub(self.transports_closed())
        }

        fn next(&self, prefix: &str) -> String {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            format!("{prefix}-{n}")
        }
    }

    #[async_trait::async_trait]
    impl MediaEngine for MockMediaEngine {
        async fn create_router(
            &self,
            worker: WorkerId,
            _codecs: &[CodecCapability],
        ) -> Result<RouterId, MediaError> {
            if self.unreachable_workers.contains(&worker.0) {
                return Err(MediaError::WorkerUnreachable(worker));
            }
            if self
                .router_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MediaError::WorkerUnreachable(worker));
            }
            self.routers_created.fetch_add(1, Ordering::SeqCst);
            Ok(RouterId(self.next(&format!("router-w{}", worker.0))))
        }

        async fn create_transport(
            &self,
            _router: &RouterId,
            _direction: TransportDirection,
        ) -> Result<TransportId, MediaError> {
            if let Some(delay) = self.transport_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_transports.load(Ordering::SeqCst) {
                return Err(MediaError::Engine("mock transport failure".to_string()));
            }
            self.transports_created.fetch_add(1, Ordering::SeqCst);
            Ok(TransportId(self.next("transport")))
        }

        async fn connect_producer_consumer(
            &self,
            _router: &RouterId,
            _producer: &TransportId,
            _consumer: &TransportId,
        ) -> Result<ConsumerId, MediaError> {
            self.connections.fetch_add(1, Ordering::SeqCst);
            Ok(ConsumerId(self.next("consumer")))
        }

        async fn close_transport(
            &self,
            _router: &RouterId,
            _transport: &TransportId,
        ) -> Result<(), MediaError> {
            self.transports_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_router(&self, _router: &RouterId) -> Result<(), MediaError> {
            if self.fail_close_router.load(Ordering::SeqCst) {
                return Err(MediaError::Engine("mock close failure".to_string()));
            }
            self.routers_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

}
