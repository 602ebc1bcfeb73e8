//! Per-call media pipeline.
//!
//! The session actor commits state transitions and then enqueues media work
//! here without awaiting it. Commands for one call run strictly in order on a
//! dedicated task, so an attach never overlaps the release of the same router.
//!
//! `release()` also trips a token that makes the pipeline skip any attach
//! still queued, so a forced end is not held up behind pending media work.

use super::router_registry::{AttachOutcome, RouterHandle, RouterRegistry};
use crate::actors::messages::SessionMessage;
use crate::actors::metrics::{ActorType, MailboxMonitor};
use crate::signaling::CallEvent;
use common::types::UserId;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Media work queued by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCommand {
    /// Create transports for the user and connect them to the mesh.
    Attach(UserId),
    /// Close the user's transports.
    Detach(UserId),
    /// Tear down the router. Always the last command processed.
    Release,
}

/// Handle for enqueueing media work. Never blocks.
#[derive(Debug, Clone)]
pub struct MediaPipelineHandle {
    sender: mpsc::UnboundedSender<MediaCommand>,
    release_requested: CancellationToken,
}

impl MediaPipelineHandle {
    /// Queue an attach for `user`.
    pub fn attach(&self, user: UserId) {
        self.enqueue(MediaCommand::Attach(user));
    }

    /// Queue a detach for `user`.
    pub fn detach(&self, user: UserId) {
        self.enqueue(MediaCommand::Detach(user));
    }

    /// Queue the router release and skip any attach not yet started.
    pub fn release(&self) {
        self.release_requested.cancel();
        self.enqueue(MediaCommand::Release);
    }

    fn enqueue(&self, command: MediaCommand) {
        if self.sender.send(command).is_err() {
            debug!(
                target: "cc.media.pipeline",
                "Pipeline already finished, command dropped"
            );
        }
    }
}

/// Ordered executor of one call's media commands.
pub struct MediaPipeline {
    router: RouterHandle,
    registry: Arc<RouterRegistry>,
    receiver: mpsc::UnboundedReceiver<MediaCommand>,
    release_requested: CancellationToken,
    /// Weak so the pipeline never keeps a finished session's mailbox open.
    session: mpsc::WeakSender<SessionMessage>,
    events: broadcast::Sender<CallEvent>,
    queue: MailboxMonitor,
}

impl MediaPipeline {
    /// Spawn the pipeline for `router`.
    pub fn spawn(
        router: RouterHandle,
        registry: Arc<RouterRegistry>,
        session: &mpsc::Sender<SessionMessage>,
        events: broadcast::Sender<CallEvent>,
    ) -> (MediaPipelineHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let release_requested = CancellationToken::new();
        let call_id = router.call_id;

        let pipeline = Self {
            router,
            registry,
            receiver,
            release_requested: release_requested.clone(),
            session: session.downgrade(),
            events,
            queue: MailboxMonitor::new(ActorType::Pipeline, call_id.to_string()),
        };

        let task = tokio::spawn(
            pipeline
                .run()
                .instrument(tracing::info_span!("cc.media.pipeline", call_id = %call_id)),
        );

        (
            MediaPipelineHandle {
                sender,
                release_requested,
            },
            task,
        )
    }

    async fn run(mut self) {
        debug!(
            target: "cc.media.pipeline",
            router_id = %self.router.router_id,
            "Media pipeline started"
        );

        while let Some(command) = self.receiver.recv().await {
            self.queue.record_received(self.receiver.len());
            let released = self.execute(command).await;
            self.queue.record_handled();
            if released {
                debug!(
                    target: "cc.media.pipeline",
                    commands = self.queue.messages_processed(),
                    peak_queue = self.queue.peak_depth(),
                    "Media pipeline finished"
                );
                return;
            }
        }

        // Session dropped its handle without releasing (e.g. it panicked).
        warn!(
            target: "cc.media.pipeline",
            router_id = %self.router.router_id,
            "Pipeline closed without release, releasing router"
        );
        self.release().await;
    }

    /// Run one command. Returns `true` once the router has been released.
    async fn execute(&self, command: MediaCommand) -> bool {
        match command {
            MediaCommand::Attach(user) => {
                if self.release_requested.is_cancelled() {
                    debug!(
                        target: "cc.media.pipeline",
                        user_id = %user,
                        "Release pending, attach skipped"
                    );
                } else {
                    self.attach(user).await;
                }
                false
            }
            MediaCommand::Detach(user) => {
                self.registry
                    .detach_participant(&self.router.call_id, &user)
                    .await;
                false
            }
            MediaCommand::Release => {
                self.release().await;
                true
            }
        }
    }

    async fn attach(&self, user: UserId) {
        match self.registry.attach_participant(&self.router, &user).await {
            Ok(AttachOutcome::Attached) => {
                let _ = self.events.send(CallEvent::MediaReady {
                    call_id: self.router.call_id,
                    user_id: user,
                });
            }
            Ok(AttachOutcome::AlreadyAttached) => {}
            Err(e) => {
                if self.release_requested.is_cancelled() {
                    return;
                }
                warn!(
                    target: "cc.media.pipeline",
                    user_id = %user,
                    error = %e,
                    "Media attach failed"
                );
                let _ = self.events.send(CallEvent::MediaFailed {
                    call_id: self.router.call_id,
                    user_id: user.clone(),
                    error: e.to_string(),
                });
                if let Some(session) = self.session.upgrade() {
                    let _ = session
                        .send(SessionMessage::MediaFailed {
                            user_id: user,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    async fn release(&self) {
        if self.registry.release_router(&self.router.call_id).await {
            info!(
                target: "cc.media.pipeline",
                router_id = %self.router.router_id,
                "Media released"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::engine::mock::MockMediaEngine;
    use crate::media::worker_pool::WorkerPool;
    use crate::session::CallType;
    use common::types::CallId;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<MockMediaEngine>,
        registry: Arc<RouterRegistry>,
        router: RouterHandle,
        session_tx: mpsc::Sender<SessionMessage>,
        session_rx: mpsc::Receiver<SessionMessage>,
        events: broadcast::Sender<CallEvent>,
    }

    async fn fixture(engine: MockMediaEngine) -> Fixture {
        let engine = Arc::new(engine);
        let registry = Arc::new(RouterRegistry::new(
            Arc::clone(&engine) as Arc<dyn crate::media::MediaEngine>,
            WorkerPool::new(1, 10),
            Vec::new(),
            Vec::new(),
        ));
        let router = registry
            .acquire_router(CallId::new(), CallType::Audio)
            .await
            .unwrap();
        let (session_tx, session_rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(16);
        Fixture {
            engine,
            registry,
            router,
            session_tx,
            session_rx,
            events,
        }
    }

    #[tokio::test]
    async fn test_commands_run_in_order_and_release_ends_pipeline() {
        let f = fixture(MockMediaEngine::new()).await;
        let mut events = f.events.subscribe();
        let (handle, task) = MediaPipeline::spawn(
            f.router.clone(),
            Arc::clone(&f.registry),
            &f.session_tx,
            f.events.clone(),
        );

        handle.attach(UserId::from("alice"));
        handle.attach(UserId::from("bob"));

        let first = events.recv().await.unwrap();
        assert!(matches!(first, CallEvent::MediaReady { ref user_id, .. } if user_id.as_str() == "alice"));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, CallEvent::MediaReady { ref user_id, .. } if user_id.as_str() == "bob"));
        assert_eq!(f.engine.connections(), 2);

        handle.detach(UserId::from("alice"));
        handle.release();
        task.await.unwrap();

        assert_eq!(f.engine.routers_closed(), 1);
        assert_eq!(f.engine.live_transports(), 0);
        assert_eq!(f.registry.router_count().await, 0);

        // Commands after release are dropped silently
        handle.attach(UserId::from("carol"));
    }

    #[tokio::test]
    async fn test_attach_failure_notifies_session() {
        let mut f = fixture(MockMediaEngine::new()).await;
        f.engine.fail_transports(true);
        let (handle, _task) = MediaPipeline::spawn(
            f.router.clone(),
            Arc::clone(&f.registry),
            &f.session_tx,
            f.events.clone(),
        );

        handle.attach(UserId::from("alice"));

        let msg = tokio::time::timeout(Duration::from_secs(1), f.session_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            msg,
            SessionMessage::MediaFailed { ref user_id, .. } if user_id.as_str() == "alice"
        ));
    }

    #[tokio::test]
    async fn test_dropped_handle_still_releases() {
        let f = fixture(MockMediaEngine::new()).await;
        let (handle, task) = MediaPipeline::spawn(
            f.router.clone(),
            Arc::clone(&f.registry),
            &f.session_tx,
            f.events.clone(),
        );
        handle.attach(UserId::from("alice"));
        drop(handle);
        task.await.unwrap();

        assert_eq!(f.engine.routers_closed(), 1);
        assert_eq!(f.engine.live_transports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_skips_queued_attaches() {
        let f = fixture(MockMediaEngine::with_transport_delay(Duration::from_millis(100))).await;
        let (handle, task) = MediaPipeline::spawn(
            f.router.clone(),
            Arc::clone(&f.registry),
            &f.session_tx,
            f.events.clone(),
        );

        handle.attach(UserId::from("alice"));
        handle.attach(UserId::from("bob"));
        handle.attach(UserId::from("carol"));
        handle.release();
        task.await.unwrap();

        // Token tripped before the pipeline ran; nothing was attached
        assert_eq!(f.engine.transports_created(), 0);
        assert_eq!(f.engine.routers_closed(), 1);
    }
}
