//! `CallControllerActor` - singleton supervisor for call session actors.
//!
//! The `CallControllerActor` is the top-level actor in the hierarchy:
//!
//! - Singleton per controller instance
//! - Registers a `CallSessionActor` for every started call
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Router acquisition runs in the caller's task inside
//! [`CallControllerHandle::initiate_call`], so the controller's own loop never
//! awaits the media engine.
//!
//! Live sessions are also published in a shared index that only the actor
//! writes. Per-call signaling and quality reports look their session up there
//! and go straight to it, without queueing behind controller work.
//!
//! # Graceful Shutdown
//!
//! On shutdown the controller:
//! 1. Stops accepting new calls
//! 2. Cancels every session token (each call ends with reason `shutdown`)
//! 3. Waits for sessions to persist their records, up to a deadline
//! 4. Cancels the root token and exits

use super::call::{CallSessionActor, CallSessionHandle, SessionContext};
use super::messages::{ControllerMessage, ControllerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::Config;
use crate::errors::CallError;
use crate::media::{RouterHandle, RouterRegistry};
use crate::observability::metrics;
use crate::record::RecordBuilder;
use crate::session::{
    validate_participants, CallSetup, CallSnapshot, DeviceInfo, QualitySample, Resolution,
};
use crate::signaling::{CallEvent, InitiateCall, SignalingEvent};
use crate::store::CallRecordStore;
use common::types::{CallId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// Outbound event buffer. Slow subscribers see `Lagged`, never block sessions.
const EVENT_CHANNEL_BUFFER: usize = 1024;

/// Deadline used when the root token is cancelled directly.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// How often finished session tasks are reaped when the mailbox is idle.
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(5);

/// Live sessions by call, written by the actor and read by every handle.
type SessionIndex = Arc<RwLock<HashMap<CallId, CallSessionHandle>>>;

/// Handle to the `CallControllerActor`.
///
/// This is the public interface used by the signaling gateway.
#[derive(Clone)]
pub struct CallControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    registry: Arc<RouterRegistry>,
    events: broadcast::Sender<CallEvent>,
    sessions: SessionIndex,
}

impl CallControllerHandle {
    /// Spawn the controller actor and return a handle to it.
    #[must_use]
    pub fn new(
        config: &Config,
        registry: Arc<RouterRegistry>,
        store: Arc<dyn CallRecordStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let sessions: SessionIndex = Arc::new(RwLock::new(HashMap::new()));

        let context = SessionContext {
            registry: Arc::clone(&registry),
            records: RecordBuilder::new(store),
            events: events.clone(),
            metrics: Arc::clone(&metrics),
            ring_timeout: Duration::from_secs(config.ring_timeout_seconds),
            controller: sender.downgrade(),
        };

        let actor = CallControllerActor::new(
            config.controller_id.clone(),
            config.max_active_calls,
            receiver,
            cancel_token.clone(),
            Arc::clone(&sessions),
            context,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            registry,
            events,
            sessions,
        }
    }

    /// Start a call: validate, place a router, then spawn the session.
    ///
    /// # Errors
    ///
    /// `InvalidParticipants` before anything is allocated;
    /// `ResourceExhausted` when no worker can host the router;
    /// `Draining` / `CapacityExceeded` from the controller, in which case
    /// the router is released again.
    #[instrument(skip_all, name = "cc.controller.initiate", fields(chat_id = %request.chat_id))]
    pub async fn initiate_call(&self, request: InitiateCall) -> Result<CallSnapshot, CallError> {
        validate_participants(&request.initiator_id, &request.receiver_ids)?;
        if self.cancel_token.is_cancelled() {
            return Err(CallError::Draining);
        }

        let call_id = CallId::new();
        let router = self
            .registry
            .acquire_router(call_id, request.call_type)
            .await?;

        match self.register(request.into_setup(call_id), router).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.registry.release_router(&call_id).await;
                Err(e)
            }
        }
    }

    async fn register(&self, setup: CallSetup, router: RouterHandle) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| ControllerMessage::RegisterCall {
            setup: Box::new(setup),
            router,
            respond_to,
        })
        .await?
    }

    /// Handle of a live session, read from the session index.
    ///
    /// # Errors
    ///
    /// `CallNotFound` if the call never existed or has already ended;
    /// `Draining` once shutdown has removed it.
    pub async fn session(&self, call_id: CallId) -> Result<CallSessionHandle, CallError> {
        if let Some(handle) = self.sessions.read().await.get(&call_id) {
            return Ok(handle.clone());
        }
        if self.cancel_token.is_cancelled() {
            Err(CallError::Draining)
        } else {
            Err(CallError::CallNotFound(call_id.to_string()))
        }
    }

    pub async fn accept(
        &self,
        call_id: CallId,
        user_id: UserId,
        device_info: Option<DeviceInfo>,
    ) -> Result<CallSnapshot, CallError> {
        self.session(call_id)
            .await?
            .accept(user_id, device_info)
            .await
    }

    pub async fn reject(&self, call_id: CallId, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.resolve(call_id, user_id, Resolution::Rejected).await
    }

    pub async fn mark_busy(&self, call_id: CallId, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.resolve(call_id, user_id, Resolution::Busy).await
    }

    pub async fn mark_missed(
        &self,
        call_id: CallId,
        user_id: UserId,
    ) -> Result<CallSnapshot, CallError> {
        self.resolve(call_id, user_id, Resolution::Missed).await
    }

    async fn resolve(
        &self,
        call_id: CallId,
        user_id: UserId,
        resolution: Resolution,
    ) -> Result<CallSnapshot, CallError> {
        self.session(call_id)
            .await?
            .resolve(user_id, resolution)
            .await
    }

    pub async fn mark_ringing(
        &self,
        call_id: CallId,
        user_id: UserId,
    ) -> Result<CallSnapshot, CallError> {
        self.session(call_id).await?.mark_ringing(user_id).await
    }

    pub async fn leave(&self, call_id: CallId, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.session(call_id).await?.leave(user_id).await
    }

    pub async fn force_end(&self, call_id: CallId, reason: String) -> Result<CallSnapshot, CallError> {
        self.session(call_id).await?.force_end(reason).await
    }

    /// Fold a quality sample into the call's aggregate.
    ///
    /// Touches neither the controller nor the session mailbox. Returns whether
    /// the sample was kept (only while the call is `Active`).
    pub async fn report_quality(
        &self,
        call_id: CallId,
        sample: &QualitySample,
    ) -> Result<bool, CallError> {
        Ok(self.session(call_id).await?.report_quality(sample))
    }

    pub async fn snapshot(&self, call_id: CallId) -> Result<CallSnapshot, CallError> {
        self.session(call_id).await?.snapshot().await
    }

    /// Route one gateway event.
    ///
    /// Returns the call snapshot after the event, or `None` for quality
    /// reports, which never touch the session mailbox.
    #[instrument(
        skip_all,
        name = "cc.controller.dispatch",
        fields(event = event.kind(), call_id = ?event.call_id())
    )]
    pub async fn dispatch(&self, event: SignalingEvent) -> Result<Option<CallSnapshot>, CallError> {
        let kind = event.kind();
        let start = Instant::now();

        let result = match event {
            SignalingEvent::Initiate(request) => self.initiate_call(request).await.map(Some),
            SignalingEvent::Accept {
                call_id,
                user_id,
                device_info,
            } => self.accept(call_id, user_id, device_info).await.map(Some),
            SignalingEvent::Reject { call_id, user_id } => {
                self.reject(call_id, user_id).await.map(Some)
            }
            SignalingEvent::Busy { call_id, user_id } => {
                self.mark_busy(call_id, user_id).await.map(Some)
            }
            SignalingEvent::Missed { call_id, user_id } => {
                self.mark_missed(call_id, user_id).await.map(Some)
            }
            SignalingEvent::Ringing { call_id, user_id } => {
                self.mark_ringing(call_id, user_id).await.map(Some)
            }
            SignalingEvent::Leave { call_id, user_id } => {
                self.leave(call_id, user_id).await.map(Some)
            }
            SignalingEvent::QualityReport {
                call_id,
                user_id,
                sample,
            } => self.report_quality(call_id, &sample).await.map(|kept| {
                if !kept {
                    debug!(
                        target: "cc.controller",
                        user_id = %user_id,
                        "Quality sample ignored, call not active"
                    );
                }
                None
            }),
            SignalingEvent::ForceEnd { call_id, reason } => {
                self.force_end(call_id, reason).await.map(Some)
            }
        };

        metrics::record_signaling_latency(kind, start.elapsed());
        if let Err(e) = &result {
            metrics::record_error(kind, e.label(), e.error_code());
            debug!(
                target: "cc.controller",
                error = %e,
                "Signaling event rejected"
            );
        }
        result
    }

    /// Subscribe to outbound call events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn get_status(&self) -> Result<ControllerStatus, CallError> {
        self.request(|respond_to| ControllerMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting calls, end every live call and wait up to `deadline`
    /// for their records to be written.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|e| self.unavailable(&format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| self.unavailable(&format!("response receive failed: {e}")))
    }

    fn unavailable(&self, detail: &str) -> CallError {
        if self.cancel_token.is_cancelled() {
            CallError::Draining
        } else {
            CallError::Internal(detail.to_string())
        }
    }
}

/// Internal state for a supervised call.
struct ManagedCall {
    handle: CallSessionHandle,
    task_handle: JoinHandle<()>,
}

/// The `CallControllerActor` implementation.
pub struct CallControllerActor {
    controller_id: String,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Root token; every session holds a child.
    cancel_token: CancellationToken,
    calls: HashMap<CallId, ManagedCall>,
    sessions: SessionIndex,
    accepting_new: bool,
    max_active_calls: usize,
    context: SessionContext,
    mailbox: MailboxMonitor,
}

impl CallControllerActor {
    fn new(
        controller_id: String,
        max_active_calls: usize,
        receiver: mpsc::Receiver<ControllerMessage>,
        cancel_token: CancellationToken,
        sessions: SessionIndex,
        context: SessionContext,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Controller, &controller_id);

        Self {
            controller_id,
            receiver,
            cancel_token,
            calls: HashMap::new(),
            sessions,
            accepting_new: true,
            max_active_calls,
            context,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "cc.actor.controller", fields(controller_id = %self.controller_id))]
    async fn run(mut self) {
        info!(
            target: "cc.actor.controller",
            max_active_calls = self.max_active_calls,
            "CallControllerActor started"
        );

        let mut supervision = tokio::time::interval(SUPERVISION_INTERVAL);

        loop {
            self.check_call_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cc.actor.controller",
                        "CallControllerActor received cancellation signal"
                    );
                    self.drain_calls(DEFAULT_SHUTDOWN_DEADLINE).await;
                    break;
                }

                _ = supervision.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            let shutting_down = matches!(message, ControllerMessage::Shutdown { .. });
                            self.handle_message(message).await;
                            self.mailbox.record_handled();
                            self.context.metrics.record_message_processed();
                            if shutting_down {
                                self.cancel_token.cancel();
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "cc.actor.controller",
                                "CallControllerActor channel closed, exiting"
                            );
                            self.drain_calls(DEFAULT_SHUTDOWN_DEADLINE).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.controller",
            calls_remaining = self.calls.len(),
            messages_processed = self.mailbox.messages_processed(),
            "CallControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::RegisterCall {
                setup,
                router,
                respond_to,
            } => {
                let result = self.register_call(*setup, router).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::CallEnded { call_id } => {
                self.remove_call(call_id).await;
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.drain_calls(deadline).await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Spawn the session actor and publish it. The router is already placed.
    async fn register_call(
        &mut self,
        setup: CallSetup,
        router: RouterHandle,
    ) -> Result<CallSnapshot, CallError> {
        if !self.accepting_new {
            return Err(CallError::Draining);
        }

        if self.calls.len() >= self.max_active_calls {
            warn!(
                target: "cc.actor.controller",
                call_count = self.calls.len(),
                max_active_calls = self.max_active_calls,
                "Rejecting call, controller at capacity"
            );
            return Err(CallError::CapacityExceeded);
        }

        let call_id = setup.call_id;
        if self.calls.contains_key(&call_id) {
            return Err(CallError::Internal("call id already registered".to_string()));
        }

        let (handle, task_handle, snapshot) = CallSessionActor::spawn(
            setup,
            router,
            self.cancel_token.child_token(),
            self.context.clone(),
        )?;

        // Published before the caller gets the snapshot back
        self.sessions.write().await.insert(call_id, handle.clone());
        self.calls.insert(
            call_id,
            ManagedCall {
                handle,
                task_handle,
            },
        );
        self.context.metrics.call_started();

        info!(
            target: "cc.actor.controller",
            call_id = %call_id,
            total_calls = self.calls.len(),
            "Call session started"
        );

        Ok(snapshot)
    }

    /// Forget an ended call. The task is awaited in the background so the
    /// message loop is never blocked on it.
    async fn remove_call(&mut self, call_id: CallId) {
        let Some(managed) = self.calls.remove(&call_id) else {
            return;
        };
        self.sessions.write().await.remove(&call_id);
        self.context.metrics.call_removed();

        let metrics = Arc::clone(&self.context.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "cc.actor.controller",
                        call_id = %call_id,
                        "Call session task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    if e.is_panic() {
                        metrics.record_panic(ActorType::Call);
                    }
                    warn!(
                        target: "cc.actor.controller",
                        call_id = %call_id,
                        error = ?e,
                        "Call session task failed during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cc.actor.controller",
                        call_id = %call_id,
                        "Call session task cleanup timed out"
                    );
                }
            }
        });

        debug!(
            target: "cc.actor.controller",
            call_id = %call_id,
            total_calls = self.calls.len(),
            "Call session removed"
        );
    }

    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            controller_id: self.controller_id.clone(),
            call_count: self.calls.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
            workers: self.context.registry.pool().loads(),
        }
    }

    /// End every live call and wait for the sessions to finish.
    async fn drain_calls(&mut self, deadline: Duration) {
        info!(
            target: "cc.actor.controller",
            call_count = self.calls.len(),
            deadline_secs = deadline.as_secs(),
            "Draining calls"
        );

        self.accepting_new = false;
        self.sessions.write().await.clear();

        for managed in self.calls.values() {
            managed.handle.cancel();
        }

        let deadline_at = tokio::time::Instant::now() + deadline;
        let mut timed_out = 0usize;
        for (call_id, managed) in self.calls.drain() {
            match tokio::time::timeout_at(deadline_at, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if e.is_panic() {
                        self.context.metrics.record_panic(ActorType::Call);
                    }
                    warn!(
                        target: "cc.actor.controller",
                        call_id = %call_id,
                        error = ?e,
                        "Call session task failed during shutdown"
                    );
                }
                Err(_) => {
                    timed_out += 1;
                }
            }
            self.context.metrics.call_removed();
        }

        if timed_out > 0 {
            warn!(
                target: "cc.actor.controller",
                timed_out,
                "Shutdown deadline passed before all calls finished"
            );
        } else {
            info!(target: "cc.actor.controller", "All calls drained");
        }
    }

    /// Reap finished session tasks; a task that finished without its end
    /// notification being processed is either a panic or a race with it.
    async fn check_call_health(&mut self) {
        let finished: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(call_id, _)| *call_id)
            .collect();

        for call_id in finished {
            if let Some(managed) = self.calls.remove(&call_id) {
                self.sessions.write().await.remove(&call_id);
                match managed.task_handle.await {
                    Ok(()) => {
                        debug!(
                            target: "cc.actor.controller",
                            call_id = %call_id,
                            "Call session exited"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "cc.actor.controller",
                                call_id = %call_id,
                                error = ?join_error,
                                "Call session panicked - investigation required"
                            );
                            self.context.metrics.record_panic(ActorType::Call);
                        }
                    }
                }
                self.context.metrics.call_removed();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::engine::mock::MockMediaEngine;
    use crate::media::MediaEngine;
    use crate::session::{CallState, CallType};
    use crate::store::mock::MockCallRecordStore;
    use common::types::ChatId;
    use std::sync::atomic::Ordering;

    fn test_config(max_active_calls: usize) -> Config {
        let vars: HashMap<String, String> = [
            ("MEDIA_WORKER_POOL_SIZE", "2"),
            ("MEDIA_RTC_MIN_PORT", "40000"),
            ("MEDIA_RTC_MAX_PORT", "40100"),
            ("MEDIA_INITIAL_OUTGOING_BITRATE", "600000"),
            ("MEDIA_MIN_OUTGOING_BITRATE", "100000"),
            ("CALL_CONTROLLER_ID", "cc-test"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain(std::iter::once((
            "CALL_MAX_ACTIVE_CALLS".to_string(),
            max_active_calls.to_string(),
        )))
        .collect();
        Config::from_vars(&vars).unwrap()
    }

    struct Fixture {
        engine: Arc<MockMediaEngine>,
        store: Arc<MockCallRecordStore>,
        metrics: Arc<ActorMetrics>,
        controller: CallControllerHandle,
    }

    fn fixture_with(engine: MockMediaEngine, max_active_calls: usize) -> Fixture {
        let config = test_config(max_active_calls);
        let engine = Arc::new(engine);
        let registry = Arc::new(RouterRegistry::from_config(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            &config,
        ));
        let store = Arc::new(MockCallRecordStore::new());
        let metrics = ActorMetrics::new();
        let controller = CallControllerHandle::new(
            &config,
            registry,
            Arc::clone(&store) as Arc<dyn CallRecordStore>,
            Arc::clone(&metrics),
        );
        Fixture {
            engine,
            store,
            metrics,
            controller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockMediaEngine::new(), 100)
    }

    fn initiate(receivers: &[&str]) -> InitiateCall {
        InitiateCall {
            chat_id: ChatId::from("chat-1"),
            call_type: CallType::Video,
            initiator_id: UserId::from("alice"),
            receiver_ids: receivers.iter().map(|r| UserId::from(*r)).collect(),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_initiate_and_lookup() {
        let f = fixture();
        let snap = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        assert_eq!(snap.state, CallState::Ringing);

        let again = f.controller.snapshot(snap.call_id).await.unwrap();
        assert_eq!(again.call_id, snap.call_id);

        let status = f.controller.get_status().await.unwrap();
        assert_eq!(status.call_count, 1);
        assert_eq!(status.router_count(), 1);
        assert!(!status.is_draining);
        assert_eq!(status.controller_id, "cc-test");

        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_unknown_call_not_found() {
        let f = fixture();
        let err = f
            .controller
            .accept(CallId::new(), UserId::from("bob"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CallNotFound(_)));
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_invalid_participants_allocate_nothing() {
        let f = fixture();
        let err = f
            .controller
            .initiate_call(initiate(&["alice"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidParticipants(_)));
        assert_eq!(f.engine.routers_created(), 0);
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_capacity_exceeded_releases_router() {
        let f = fixture_with(MockMediaEngine::new(), 1);
        f.controller.initiate_call(initiate(&["bob"])).await.unwrap();

        let err = f
            .controller
            .initiate_call(initiate(&["carol"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CapacityExceeded));
        assert_eq!(f.engine.routers_created(), 2);
        assert_eq!(f.engine.routers_closed(), 1);

        let status = f.controller.get_status().await.unwrap();
        assert_eq!(status.router_count(), 1);
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_ended_call_is_removed() {
        let f = fixture();
        let snap = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        f.controller
            .reject(snap.call_id, UserId::from("bob"))
            .await
            .unwrap();

        // The session notifies the controller once its record is written
        let mut removed = false;
        for _ in 0..100 {
            if f.controller.get_status().await.unwrap().call_count == 0 {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed);
        assert_eq!(f.store.save_attempts(), 1);

        let err = f
            .controller
            .accept(snap.call_id, UserId::from("bob"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CallNotFound(_)));
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_dispatch_quality_report_returns_none() {
        let f = fixture();
        let snap = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        f.controller
            .dispatch(SignalingEvent::Accept {
                call_id: snap.call_id,
                user_id: UserId::from("bob"),
                device_info: None,
            })
            .await
            .unwrap();

        let result = f
            .controller
            .dispatch(SignalingEvent::QualityReport {
                call_id: snap.call_id,
                user_id: UserId::from("bob"),
                sample: QualitySample {
                    bitrate_kbps: 800,
                    packet_loss: 0.0,
                    latency_ms: 30,
                },
            })
            .await
            .unwrap();
        assert!(result.is_none());

        let snap = f.controller.snapshot(snap.call_id).await.unwrap();
        assert_eq!(snap.quality.unwrap().sample_count, 1);
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_quality_reports_bypass_every_mailbox() {
        let f = fixture();
        let snap = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        f.controller
            .accept(snap.call_id, UserId::from("bob"), None)
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let before = f.metrics.total_messages_processed.load(Ordering::Relaxed);
        let sample = QualitySample {
            bitrate_kbps: 500,
            packet_loss: 0.02,
            latency_ms: 40,
        };
        for _ in 0..50 {
            assert!(f.controller.report_quality(snap.call_id, &sample).await.unwrap());
        }
        let after = f.metrics.total_messages_processed.load(Ordering::Relaxed);
        assert_eq!(before, after);

        let snap = f.controller.snapshot(snap.call_id).await.unwrap();
        assert_eq!(snap.quality.unwrap().sample_count, 50);
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_quality_report_for_unknown_call() {
        let f = fixture();
        let sample = QualitySample {
            bitrate_kbps: 500,
            packet_loss: 0.0,
            latency_ms: 40,
        };
        let err = f
            .controller
            .report_quality(CallId::new(), &sample)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CallNotFound(_)));
        f.controller.cancel();
    }

    #[tokio::test]
    async fn test_lookups_after_shutdown_report_draining() {
        let f = fixture();
        let snap = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        f.controller.shutdown(Duration::from_secs(5)).await.unwrap();

        let err = f.controller.snapshot(snap.call_id).await.unwrap_err();
        assert!(matches!(err, CallError::Draining));
    }

    #[tokio::test]
    async fn test_shutdown_ends_calls_and_refuses_new_ones() {
        let f = fixture();
        let first = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        let second = f
            .controller
            .initiate_call(initiate(&["carol", "dave"]))
            .await
            .unwrap();

        f.controller.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(f.controller.is_cancelled());

        for call_id in [first.call_id, second.call_id] {
            let record = f.store.get(&call_id).await.unwrap();
            assert_eq!(record.end_reason, "shutdown");
        }
        assert_eq!(f.engine.routers_closed(), 2);

        let err = f
            .controller
            .initiate_call(initiate(&["bob"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Draining));
    }

    #[tokio::test]
    async fn test_cancellation_token_propagates() {
        let f = fixture();
        let snap = f.controller.initiate_call(initiate(&["bob"])).await.unwrap();
        let session = f.controller.session(snap.call_id).await.unwrap();
        assert!(!session.is_cancelled());

        f.controller.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.is_cancelled());
    }
}
