//! `CallSessionActor` - per-call actor that owns one [`CallSession`].
//!
//! Each `CallSessionActor`:
//! - Serializes every mutation of its call through a bounded mailbox
//! - Commits the transition first, then queues media work on its
//!   [`MediaPipeline`] and fans out [`CallEvent`]s
//! - Ends the call when ringing outlasts the ring timeout, when media setup
//!   fails, or when its token is cancelled
//! - Hands the ended call to the record builder, tells the controller and exits
//!
//! Quality reports never enter the mailbox; the handle writes them straight
//! into the shared accumulator.

use super::messages::{ControllerMessage, SessionMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::errors::CallError;
use crate::media::{MediaPipeline, MediaPipelineHandle, RouterHandle, RouterRegistry};
use crate::observability::metrics;
use crate::record::RecordBuilder;
use crate::session::{
    end_reason, CallSession, CallSetup, CallSnapshot, CallState, DeviceInfo, QualitySample,
    Resolution, SessionEffect, SharedCallState,
};
use crate::signaling::CallEvent;
use chrono::Utc;
use common::types::{CallId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mailbox size per call. Signaling for one call is low volume.
const CALL_CHANNEL_BUFFER: usize = 64;

/// How often a ringing call checks its ring timeout.
const RING_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long an ended call waits for its router release.
const MEDIA_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared dependencies handed to every session by the controller.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<RouterRegistry>,
    pub records: RecordBuilder,
    pub events: broadcast::Sender<CallEvent>,
    pub metrics: Arc<ActorMetrics>,
    pub ring_timeout: Duration,
    /// Weak so a session never keeps the controller mailbox open.
    pub controller: mpsc::WeakSender<ControllerMessage>,
}

/// Handle to a `CallSessionActor`.
#[derive(Debug, Clone)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    call_id: CallId,
    shared: Arc<SharedCallState>,
}

impl CallSessionHandle {
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Current call state, read without a mailbox round trip.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    pub async fn accept(
        &self,
        user_id: UserId,
        device_info: Option<DeviceInfo>,
    ) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::Accept {
            user_id,
            device_info,
            respond_to,
        })
        .await?
    }

    /// Apply a gateway-decided reject, busy or missed outcome.
    pub async fn resolve(
        &self,
        user_id: UserId,
        resolution: Resolution,
    ) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::Resolve {
            user_id,
            resolution,
            respond_to,
        })
        .await?
    }

    pub async fn mark_ringing(&self, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::MarkRinging {
            user_id,
            respond_to,
        })
        .await?
    }

    pub async fn leave(&self, user_id: UserId) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::Leave {
            user_id,
            respond_to,
        })
        .await?
    }

    pub async fn force_end(&self, reason: String) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::ForceEnd { reason, respond_to })
            .await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|respond_to| SessionMessage::GetSnapshot { respond_to })
            .await
    }

    /// Fold a quality sample into the running aggregate.
    ///
    /// Returns `false` when the call is not `Active`; the sample is dropped.
    #[must_use]
    pub fn report_quality(&self, sample: &QualitySample) -> bool {
        self.shared.report_quality(sample)
    }

    /// Cancel the actor. The call ends with reason `shutdown`.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| CallError::CallNotFound(self.call_id.to_string()))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }
}

/// The `CallSessionActor` implementation.
pub struct CallSessionActor {
    call_id: CallId,
    session: CallSession,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    pipeline: MediaPipelineHandle,
    pipeline_task: Option<JoinHandle<()>>,
    /// Last call state seen, for transition metrics.
    observed_state: CallState,
    ringing_since: Instant,
    context: SessionContext,
    mailbox: MailboxMonitor,
}

impl CallSessionActor {
    /// Create the session, start its media pipeline and spawn the actor.
    ///
    /// The initial effects (initiator attach, ringing notification) are
    /// applied before the task starts. Returns the handle, the task join
    /// handle and the initial snapshot.
    ///
    /// # Errors
    ///
    /// `InvalidParticipants` for a malformed participant list. Nothing is
    /// spawned in that case and the router is left to the caller.
    pub fn spawn(
        setup: CallSetup,
        router: RouterHandle,
        cancel_token: CancellationToken,
        context: SessionContext,
    ) -> Result<(CallSessionHandle, JoinHandle<()>, CallSnapshot), CallError> {
        let call_id = setup.call_id;
        let (session, effects) = CallSession::initiate(setup, Utc::now())?;
        let shared = session.shared();

        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);
        let (pipeline, pipeline_task) = MediaPipeline::spawn(
            router,
            Arc::clone(&context.registry),
            &sender,
            context.events.clone(),
        );

        let mut actor = Self {
            call_id,
            session,
            receiver,
            cancel_token: cancel_token.clone(),
            pipeline,
            pipeline_task: Some(pipeline_task),
            observed_state: CallState::Ringing,
            ringing_since: Instant::now(),
            context,
            mailbox: MailboxMonitor::new(ActorType::Call, call_id.to_string()),
        };
        actor.apply(effects);
        metrics::record_call_transition(CallState::Ringing.as_str());
        let snapshot = actor.session.snapshot();

        let task_handle = tokio::spawn(actor.run());

        let handle = CallSessionHandle {
            sender,
            cancel_token,
            call_id,
            shared,
        };
        Ok((handle, task_handle, snapshot))
    }

    #[instrument(skip_all, name = "cc.actor.call", fields(call_id = %self.call_id))]
    async fn run(mut self) {
        info!(target: "cc.actor.call", "CallSessionActor started");

        let mut ring_check = tokio::time::interval(RING_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cc.actor.call",
                        "CallSessionActor received cancellation signal"
                    );
                    self.end_now(end_reason::SHUTDOWN);
                }

                _ = ring_check.tick() => {
                    self.check_ring_timeout();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_handled();
                            self.context.metrics.record_message_processed();
                        }
                        None => {
                            warn!(
                                target: "cc.actor.call",
                                "CallSessionActor channel closed before call ended"
                            );
                            self.end_now(end_reason::SHUTDOWN);
                        }
                    }
                }
            }

            if self.session.state() == CallState::Ended {
                break;
            }
        }

        self.finish().await;

        info!(
            target: "cc.actor.call",
            messages_processed = self.mailbox.messages_processed(),
            "CallSessionActor stopped"
        );
    }

    fn handle_message(&mut self, message: SessionMessage) {
        let now = Utc::now();
        match message {
            SessionMessage::Accept {
                user_id,
                device_info,
                respond_to,
            } => {
                let result = self.session.accept(&user_id, device_info, now);
                let _ = respond_to.send(self.commit(result, "accepted"));
            }

            SessionMessage::Resolve {
                user_id,
                resolution,
                respond_to,
            } => {
                let result = self.session.resolve(&user_id, resolution, now);
                let label = match resolution {
                    Resolution::Rejected => "rejected",
                    Resolution::Busy => "busy",
                    Resolution::Missed => "missed",
                };
                let _ = respond_to.send(self.commit(result, label));
            }

            SessionMessage::MarkRinging {
                user_id,
                respond_to,
            } => {
                let result = self.session.mark_ringing(&user_id);
                let _ = respond_to.send(self.commit(result, "ringing"));
            }

            SessionMessage::Leave {
                user_id,
                respond_to,
            } => {
                let result = self.session.leave(&user_id, now);
                let _ = respond_to.send(self.commit(result, "left"));
            }

            SessionMessage::ForceEnd { reason, respond_to } => {
                let result = self.session.force_end(&reason, now);
                let _ = respond_to.send(self.commit(result, "force_ended"));
            }

            SessionMessage::MediaFailed { user_id, error } => {
                warn!(
                    target: "cc.actor.call",
                    user_id = %user_id,
                    error = %error,
                    "Media setup failed, ending call"
                );
                self.end_now(end_reason::MEDIA_FAILURE);
            }

            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.session.snapshot());
            }
        }
    }

    /// Apply the effects of a committed transition and record it.
    fn commit(
        &mut self,
        result: Result<Vec<SessionEffect>, CallError>,
        transition: &'static str,
    ) -> Result<CallSnapshot, CallError> {
        let effects = match result {
            Ok(effects) => effects,
            Err(e) => {
                debug!(
                    target: "cc.actor.call",
                    transition,
                    error = %e,
                    "Transition rejected"
                );
                return Err(e);
            }
        };

        metrics::record_call_transition(transition);
        self.apply(effects);

        let state = self.session.state();
        if state != self.observed_state {
            metrics::record_call_transition(state.as_str());
            info!(
                target: "cc.actor.call",
                from = self.observed_state.as_str(),
                to = state.as_str(),
                "Call state changed"
            );
            self.observed_state = state;
        }

        Ok(self.session.snapshot())
    }

    fn apply(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::AttachMedia(user) => self.pipeline.attach(user),
                SessionEffect::DetachMedia(user) => self.pipeline.detach(user),
                SessionEffect::ReleaseMedia => self.pipeline.release(),
                SessionEffect::Notify(event) => {
                    if let CallEvent::CallEnded {
                        ref reason,
                        duration_seconds,
                        ..
                    } = event
                    {
                        metrics::record_call_ended(reason, duration_seconds);
                    }
                    // No subscribers is not an error
                    let _ = self.context.events.send(event);
                }
            }
        }
    }

    /// Force-end from inside the actor. A no-op once the call has ended.
    fn end_now(&mut self, reason: &str) {
        if self.session.state() == CallState::Ended {
            return;
        }
        let result = self.session.force_end(reason, Utc::now());
        if let Err(e) = self.commit(result, "force_ended") {
            warn!(
                target: "cc.actor.call",
                reason,
                error = %e,
                "Failed to end call"
            );
        }
    }

    fn check_ring_timeout(&mut self) {
        if self.session.state() == CallState::Ringing
            && self.ringing_since.elapsed() >= self.context.ring_timeout
        {
            info!(
                target: "cc.actor.call",
                ring_timeout_secs = self.context.ring_timeout.as_secs(),
                "Ring timeout reached"
            );
            self.end_now(end_reason::TIMEOUT);
        }
    }

    /// Teardown after `Ended`: refuse queued requests, persist the record,
    /// wait for the router release and notify the controller.
    async fn finish(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            self.reject_after_end(message);
        }

        self.context.metrics.call_ended();

        let snapshot = self.session.snapshot();
        if self.context.records.finalize(&snapshot).await.is_err() {
            self.context.metrics.record_persist_failure();
        }

        if let Some(task) = self.pipeline_task.take() {
            match tokio::time::timeout(MEDIA_RELEASE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if e.is_panic() {
                        error!(
                            target: "cc.actor.call",
                            error = ?e,
                            "Media pipeline panicked"
                        );
                        self.context.metrics.record_panic(ActorType::Pipeline);
                    }
                }
                Err(_) => {
                    warn!(
                        target: "cc.actor.call",
                        "Router release timed out"
                    );
                }
            }
        }

        if let Some(controller) = self.context.controller.upgrade() {
            if controller
                .try_send(ControllerMessage::CallEnded {
                    call_id: self.call_id,
                })
                .is_err()
            {
                // Supervision picks the finished task up on its next pass
                debug!(
                    target: "cc.actor.call",
                    "Controller mailbox unavailable for end notification"
                );
            }
        }
    }

    fn reject_after_end(&self, message: SessionMessage) {
        let gone = || CallError::CallNotFound(self.call_id.to_string());
        match message {
            SessionMessage::Accept { respond_to, .. }
            | SessionMessage::Resolve { respond_to, .. }
            | SessionMessage::MarkRinging { respond_to, .. }
            | SessionMessage::Leave { respond_to, .. }
            | SessionMessage::ForceEnd { respond_to, .. } => {
                let _ = respond_to.send(Err(gone()));
            }
            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.session.snapshot());
            }
            SessionMessage::MediaFailed { .. } => {}
        }
    }
}
