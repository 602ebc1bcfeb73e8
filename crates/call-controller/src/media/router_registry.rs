//! Router registry.
//!
//! Arena of per-call routers keyed by [`CallId`]. Each entry owns the
//! participant transports and the consumer fan-out between them. Sessions only
//! ever hold a [`RouterHandle`]; the registry is the single owner of media
//! topology.
//!
//! Each entry sits behind its own lock so attach, detach and release on one
//! call serialize without blocking other calls. Release takes the entry out
//! of the arena before tearing it down, so a second release is a no-op and an
//! attach racing a release observes `RouterReleased` instead of leaking
//! transports.

use super::engine::{
    CodecCapability, ConsumerId, MediaEngine, RouterId, TransportDirection, TransportId,
};
use super::worker_pool::WorkerPool;
use super::{MediaError, WorkerId};
use crate::config::Config;
use crate::observability::metrics;
use crate::session::CallType;
use common::types::{CallId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Reference to a call's router. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterHandle {
    pub call_id: CallId,
    pub worker: WorkerId,
    pub router_id: RouterId,
}

/// Result of attaching a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Transports were created and connected.
    Attached,
    /// The participant already had transports; nothing changed.
    AlreadyAttached,
}

#[derive(Debug)]
struct ParticipantTransports {
    ingress: TransportId,
    egress: TransportId,
    /// Consumers on this participant's egress, keyed by producing participant.
    consumers: Vec<(UserId, ConsumerId)>,
}

#[derive(Debug)]
struct RouterEntry {
    worker: WorkerId,
    router_id: RouterId,
    participants: BTreeMap<UserId, ParticipantTransports>,
    released: bool,
}

/// Per-call router arena backed by a [`MediaEngine`] and a [`WorkerPool`].
pub struct RouterRegistry {
    engine: Arc<dyn MediaEngine>,
    pool: WorkerPool,
    audio_codecs: Vec<CodecCapability>,
    video_codecs: Vec<CodecCapability>,
    routers: Mutex<HashMap<CallId, Arc<Mutex<RouterEntry>>>>,
}

impl std::fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRegistry")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl RouterRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        pool: WorkerPool,
        audio_codecs: Vec<CodecCapability>,
        video_codecs: Vec<CodecCapability>,
    ) -> Self {
        Self {
            engine,
            pool,
            audio_codecs,
            video_codecs,
            routers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry with the pool and codec sets from `config`.
    #[must_use]
    pub fn from_config(engine: Arc<dyn MediaEngine>, config: &Config) -> Self {
        Self::new(
            engine,
            WorkerPool::new(config.worker_pool_size, config.max_routers_per_worker)
                .with_retry_after(Duration::from_secs(config.worker_retry_seconds)),
            config.audio_codecs.clone(),
            config.video_codecs.clone(),
        )
    }

    /// The worker pool backing this registry.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn codecs_for(&self, call_type: CallType) -> &[CodecCapability] {
        match call_type {
            CallType::Audio => &self.audio_codecs,
            CallType::Video => &self.video_codecs,
        }
    }

    async fn lookup(&self, call_id: &CallId) -> Option<Arc<Mutex<RouterEntry>>> {
        self.routers.lock().await.get(call_id).cloned()
    }

    /// Create (or return the existing) router for `call_id`.
    ///
    /// A worker whose router creation fails is marked unreachable and the
    /// next least-loaded worker is tried, at most once per worker. A success
    /// marks the worker reachable, which brings a worker back after its
    /// retry window.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NoWorkerAvailable` when no worker could host the router.
    #[instrument(skip_all, name = "cc.media.acquire_router", fields(call_id = %call_id))]
    pub async fn acquire_router(
        &self,
        call_id: CallId,
        call_type: CallType,
    ) -> Result<RouterHandle, MediaError> {
        if let Some(existing) = self.handle_for(&call_id).await {
            return Ok(existing);
        }

        for _ in 0..self.pool.size() {
            let worker = self.pool.assign()?;
            let start = Instant::now();
            let created = self
                .engine
                .create_router(worker, self.codecs_for(call_type))
                .await;
            metrics::record_media_operation("create_router", start.elapsed());

            let router_id = match created {
                Ok(router_id) => {
                    self.pool.mark_reachable(worker);
                    router_id
                }
                Err(e) => {
                    warn!(
                        target: "cc.media.registry",
                        worker = %worker,
                        error = %e,
                        "Router creation failed, trying next worker"
                    );
                    self.pool.release(worker);
                    self.pool.mark_unreachable(worker);
                    continue;
                }
            };

            let mut routers = self.routers.lock().await;
            if let Some(existing) = routers.get(&call_id).cloned() {
                drop(routers);
                // Lost a race for the same call; discard ours.
                let _ = self.engine.close_router(&router_id).await;
                self.pool.release(worker);
                let existing = existing.lock().await;
                return Ok(RouterHandle {
                    call_id,
                    worker: existing.worker,
                    router_id: existing.router_id.clone(),
                });
            }
            routers.insert(
                call_id,
                Arc::new(Mutex::new(RouterEntry {
                    worker,
                    router_id: router_id.clone(),
                    participants: BTreeMap::new(),
                    released: false,
                })),
            );
            drop(routers);

            metrics::set_worker_router_count(worker.0, self.pool.router_count(worker));
            info!(
                target: "cc.media.registry",
                router_id = %router_id,
                worker = %worker,
                "Router acquired"
            );
            return Ok(RouterHandle {
                call_id,
                worker,
                router_id,
            });
        }

        Err(MediaError::NoWorkerAvailable)
    }

    /// Create ingress/egress transports for `user` and connect them to every
    /// participant already on the router, in both directions.
    ///
    /// On failure everything created for `user` is closed again.
    ///
    /// # Errors
    ///
    /// `RouterNotFound` if the call has no router, `RouterReleased` if it was
    /// released, or the engine error that aborted the attach.
    #[instrument(skip_all, name = "cc.media.attach", fields(call_id = %handle.call_id, user_id = %user))]
    pub async fn attach_participant(
        &self,
        handle: &RouterHandle,
        user: &UserId,
    ) -> Result<AttachOutcome, MediaError> {
        let entry = self
            .lookup(&handle.call_id)
            .await
            .ok_or_else(|| MediaError::RouterNotFound(handle.router_id.to_string()))?;
        let mut entry = entry.lock().await;

        if entry.released {
            return Err(MediaError::RouterReleased(entry.router_id.to_string()));
        }
        if entry.participants.contains_key(user) {
            return Ok(AttachOutcome::AlreadyAttached);
        }

        let start = Instant::now();
        let router_id = entry.router_id.clone();
        let ingress = self
            .engine
            .create_transport(&router_id, TransportDirection::Ingress)
            .await?;
        let egress = match self
            .engine
            .create_transport(&router_id, TransportDirection::Egress)
            .await
        {
            Ok(egress) => egress,
            Err(e) => {
                self.close_transport_logged(&router_id, &ingress).await;
                return Err(e);
            }
        };

        let mut transports = ParticipantTransports {
            ingress,
            egress,
            consumers: Vec::new(),
        };

        if let Err(e) = self.connect_mesh(&mut entry, user, &mut transports).await {
            for other in entry.participants.values_mut() {
                other.consumers.retain(|(producer, _)| producer != user);
            }
            self.close_transport_logged(&router_id, &transports.ingress)
                .await;
            self.close_transport_logged(&router_id, &transports.egress)
                .await;
            return Err(e);
        }

        entry.participants.insert(user.clone(), transports);
        metrics::record_media_operation("attach_participant", start.elapsed());
        debug!(
            target: "cc.media.registry",
            participants = entry.participants.len(),
            "Participant attached"
        );
        Ok(AttachOutcome::Attached)
    }

    async fn connect_mesh(
        &self,
        entry: &mut RouterEntry,
        user: &UserId,
        new: &mut ParticipantTransports,
    ) -> Result<(), MediaError> {
        let router_id = &entry.router_id;
        for (other_id, other) in &mut entry.participants {
            let inbound = self
                .engine
                .connect_producer_consumer(router_id, &other.ingress, &new.egress)
                .await?;
            new.consumers.push((other_id.clone(), inbound));

            let outbound = self
                .engine
                .connect_producer_consumer(router_id, &new.ingress, &other.egress)
                .await?;
            other.consumers.push((user.clone(), outbound));
        }
        Ok(())
    }

    /// Close `user`'s transports and the consumers fed by them.
    ///
    /// Returns `false` if the call or participant had nothing attached.
    #[instrument(skip_all, name = "cc.media.detach", fields(call_id = %call_id, user_id = %user))]
    pub async fn detach_participant(&self, call_id: &CallId, user: &UserId) -> bool {
        let Some(entry) = self.lookup(call_id).await else {
            return false;
        };
        let mut entry = entry.lock().await;
        let Some(transports) = entry.participants.remove(user) else {
            return false;
        };
        for other in entry.participants.values_mut() {
            other.consumers.retain(|(producer, _)| producer != user);
        }

        let start = Instant::now();
        let router_id = entry.router_id.clone();
        self.close_transport_logged(&router_id, &transports.ingress)
            .await;
        self.close_transport_logged(&router_id, &transports.egress)
            .await;
        metrics::record_media_operation("detach_participant", start.elapsed());
        true
    }

    /// Detach every participant, close the router and free its worker slot.
    ///
    /// Exactly one call per router does the work; later calls return `false`.
    #[instrument(skip_all, name = "cc.media.release", fields(call_id = %call_id))]
    pub async fn release_router(&self, call_id: &CallId) -> bool {
        let Some(entry) = self.routers.lock().await.remove(call_id) else {
            return false;
        };
        let mut entry = entry.lock().await;
        entry.released = true;

        let start = Instant::now();
        let router_id = entry.router_id.clone();
        let participants = std::mem::take(&mut entry.participants);
        for transports in participants.values() {
            self.close_transport_logged(&router_id, &transports.ingress)
                .await;
            self.close_transport_logged(&router_id, &transports.egress)
                .await;
        }

        if let Err(e) = self.engine.close_router(&router_id).await {
            warn!(
                target: "cc.media.registry",
                router_id = %router_id,
                error = %e,
                "Router close failed"
            );
        }
        self.pool.release(entry.worker);
        metrics::set_worker_router_count(entry.worker.0, self.pool.router_count(entry.worker));
        metrics::record_media_operation("release_router", start.elapsed());

        info!(
            target: "cc.media.registry",
            router_id = %router_id,
            worker = %entry.worker,
            "Router released"
        );
        true
    }

    async fn close_transport_logged(&self, router: &RouterId, transport: &TransportId) {
        if let Err(e) = self.engine.close_transport(router, transport).await {
            warn!(
                target: "cc.media.registry",
                router_id = %router,
                transport_id = %transport,
                error = %e,
                "Transport close failed"
            );
        }
    }

    /// Handle for the call's router, if one is registered.
    pub async fn handle_for(&self, call_id: &CallId) -> Option<RouterHandle> {
        let entry = self.lookup(call_id).await?;
        let entry = entry.lock().await;
        Some(RouterHandle {
            call_id: *call_id,
            worker: entry.worker,
            router_id: entry.router_id.clone(),
        })
    }

    /// Number of routers currently registered.
    pub async fn router_count(&self) -> usize {
        self.routers.lock().await.len()
    }

    /// Participants with transports on the call's router.
    pub async fn attached_participants(&self, call_id: &CallId) -> Vec<UserId> {
        match self.lookup(call_id).await {
            Some(entry) => entry.lock().await.participants.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Transports open on the call's router (two per attached participant).
    pub async fn active_transport_count(&self, call_id: &CallId) -> usize {
        match self.lookup(call_id).await {
            Some(entry) => entry.lock().await.participants.len() * 2,
            None => 0,
        }
    }

    /// Consumers open on the call's router.
    pub async fn consumer_count(&self, call_id: &CallId) -> usize {
        match self.lookup(call_id).await {
            Some(entry) => entry
                .lock()
                .await
                .participants
                .values()
                .map(|p| p.consumers.len())
                .sum(),
            None => 0,
        }
    }
}
