//! Call session state machine.
//!
//! `CallSession` is the authoritative per-call state. It performs no I/O:
//! each transition returns the [`SessionEffect`]s the owning actor must carry
//! out (media attach/detach/release, outbound events). Media work is thus
//! always scheduled after the transition that authorized it.
//!
//! ```text
//! call:        Ringing ──first accept──▶ Active ──▶ Ended
//!                 └───────────────────────────────▲
//! participant: Unanswered ─▶ Ringing ─▶ Accepted ─▶ Left
//!                  └──────────┴──▶ Rejected | Missed | Busy
//! ```
//!
//! The session ends when no participant is `Accepted`, or when at most one
//! is and nobody is still pending. On end, remaining `Accepted` participants
//! become `Left` and pending ones become `Missed`.

pub mod participant;
pub mod quality;

pub use participant::{
    DeviceInfo, ParticipantRole, ParticipantState, ParticipantStatus, ParticipantStatusCell,
};
pub use quality::{QualityAccumulator, QualitySample, QualitySnapshot, SharedCallState};

use crate::errors::CallError;
use crate::signaling::CallEvent;
use chrono::{DateTime, Utc};
use common::types::{CallId, ChatId, UserId};
use participant::Participant;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// End reasons produced by the session itself.
pub mod end_reason {
    /// At least one receiver joined and everyone hung up.
    pub const COMPLETED: &str = "completed";
    /// No receiver ever joined.
    pub const UNANSWERED: &str = "unanswered";
    /// Nobody answered before the ring timeout.
    pub const TIMEOUT: &str = "timeout";
    /// Media could not be set up for a participant.
    pub const MEDIA_FAILURE: &str = "media_failure";
    /// The controller is shutting down.
    pub const SHUTDOWN: &str = "shutdown";
}

/// Media type of a call; selects the router codec set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Call-level state. `Ended` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CallState {
    Ringing = 0,
    Active = 1,
    Ended = 2,
}

impl CallState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ringing,
            1 => Self::Active,
            _ => Self::Ended,
        }
    }
}

/// Receiver outcomes decided by the signaling gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Rejected,
    Busy,
    Missed,
}

impl Resolution {
    const fn status(self) -> ParticipantStatus {
        match self {
            Self::Rejected => ParticipantStatus::Rejected,
            Self::Busy => ParticipantStatus::Busy,
            Self::Missed => ParticipantStatus::Missed,
        }
    }
}

/// Metadata recorded when a call is ended from outside the normal flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationInfo {
    pub reason: String,
    pub retry_count: u32,
}

/// Everything needed to create a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSetup {
    pub call_id: CallId,
    pub chat_id: ChatId,
    pub call_type: CallType,
    pub initiator_id: UserId,
    pub receiver_ids: Vec<UserId>,
    /// Gateway-side retries of the initiate request.
    pub retry_count: u32,
}

/// Work the session owner performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    AttachMedia(UserId),
    DetachMedia(UserId),
    ReleaseMedia,
    Notify(CallEvent),
}

/// Serializable view of a session, returned to the gateway after each event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub chat_id: ChatId,
    pub call_type: CallType,
    pub state: CallState,
    pub participants: Vec<ParticipantState>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub quality: Option<QualitySnapshot>,
    pub end_reason: Option<String>,
    pub termination: Option<TerminationInfo>,
}

impl CallSnapshot {
    /// Status of `user`, if they are a participant.
    #[must_use]
    pub fn status_of(&self, user: &UserId) -> Option<ParticipantStatus> {
        self.participants
            .iter()
            .find(|p| &p.user_id == user)
            .map(|p| p.status)
    }
}

/// Reject malformed initiate requests before any resource is allocated.
///
/// # Errors
///
/// `InvalidParticipants` if there are no receivers, the initiator is among
/// them, or a receiver is listed twice.
pub fn validate_participants(initiator: &UserId, receivers: &[UserId]) -> Result<(), CallError> {
    if receivers.is_empty() {
        return Err(CallError::InvalidParticipants(
            "receiver list is empty".to_string(),
        ));
    }
    if receivers.contains(initiator) {
        return Err(CallError::InvalidParticipants(
            "initiator cannot be a receiver".to_string(),
        ));
    }
    let mut seen = HashSet::with_capacity(receivers.len());
    for receiver in receivers {
        if !seen.insert(receiver) {
            return Err(CallError::InvalidParticipants(format!(
                "duplicate receiver {receiver}"
            )));
        }
    }
    Ok(())
}

/// Authoritative state of one call.
#[derive(Debug)]
pub struct CallSession {
    id: CallId,
    chat_id: ChatId,
    call_type: CallType,
    state: CallState,
    /// Initiator first, then receivers in request order.
    participants: Vec<Participant>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    retry_count: u32,
    shared: Arc<SharedCallState>,
    final_quality: Option<QualitySnapshot>,
    end_reason: Option<String>,
    termination: Option<TerminationInfo>,
}

impl CallSession {
    /// Create a session in `Ringing` with the initiator already `Accepted`.
    ///
    /// # Errors
    ///
    /// `InvalidParticipants` for a malformed participant list.
    pub fn initiate(
        setup: CallSetup,
        now: DateTime<Utc>,
    ) -> Result<(Self, Vec<SessionEffect>), CallError> {
        validate_participants(&setup.initiator_id, &setup.receiver_ids)?;

        let mut participants = Vec::with_capacity(setup.receiver_ids.len() + 1);
        participants.push(Participant::initiator(setup.initiator_id.clone(), now));
        participants.extend(setup.receiver_ids.iter().cloned().map(Participant::receiver));

        let session = Self {
            id: setup.call_id,
            chat_id: setup.chat_id.clone(),
            call_type: setup.call_type,
            state: CallState::Ringing,
            participants,
            started_at: now,
            ended_at: None,
            retry_count: setup.retry_count,
            shared: Arc::new(SharedCallState::default()),
            final_quality: None,
            end_reason: None,
            termination: None,
        };

        let effects = vec![
            SessionEffect::AttachMedia(setup.initiator_id.clone()),
            SessionEffect::Notify(CallEvent::Ringing {
                call_id: setup.call_id,
                chat_id: setup.chat_id,
                call_type: setup.call_type,
                initiator_id: setup.initiator_id,
                receiver_ids: setup.receiver_ids,
            }),
        ];
        Ok((session, effects))
    }

    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// State shared with handles for lock-free quality reporting.
    #[must_use]
    pub fn shared(&self) -> Arc<SharedCallState> {
        Arc::clone(&self.shared)
    }

    /// Number of participants currently `Accepted`.
    #[must_use]
    pub fn accepted_count(&self) -> usize {
        self.count(|s| s == ParticipantStatus::Accepted)
    }

    fn count(&self, pred: impl Fn(ParticipantStatus) -> bool) -> usize {
        self.participants
            .iter()
            .filter(|p| pred(p.status.load()))
            .count()
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.state == CallState::Ended {
            return Err(CallError::InvalidTransition(format!(
                "call {} already ended",
                self.id
            )));
        }
        Ok(())
    }

    fn participant_mut(&mut self, user: &UserId) -> Result<&mut Participant, CallError> {
        self.participants
            .iter_mut()
            .find(|p| &p.user_id == user)
            .ok_or_else(|| CallError::ParticipantNotFound(user.to_string()))
    }

    fn updated(&self, user: &UserId, status: ParticipantStatus) -> SessionEffect {
        SessionEffect::Notify(CallEvent::ParticipantUpdated {
            call_id: self.id,
            user_id: user.clone(),
            status,
        })
    }

    /// Record that the receiver's device is ringing.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the receiver is `Unanswered`.
    pub fn mark_ringing(&mut self, user: &UserId) -> Result<Vec<SessionEffect>, CallError> {
        self.ensure_live()?;
        let participant = self.participant_mut(user)?;
        participant
            .status
            .transition(&[ParticipantStatus::Unanswered], ParticipantStatus::Ringing)
            .map_err(|current| blocked(user, "ring", current))?;
        Ok(vec![self.updated(user, ParticipantStatus::Ringing)])
    }

    /// Accept the call for `user`.
    ///
    /// The first acceptance moves the call from `Ringing` to `Active`.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the participant already answered (including
    /// duplicate accepts) or the call ended; `ParticipantNotFound` for
    /// strangers.
    pub fn accept(
        &mut self,
        user: &UserId,
        device_info: Option<DeviceInfo>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEffect>, CallError> {
        self.ensure_live()?;
        let participant = self.participant_mut(user)?;
        participant
            .status
            .transition(
                &[ParticipantStatus::Unanswered, ParticipantStatus::Ringing],
                ParticipantStatus::Accepted,
            )
            .map_err(|current| blocked(user, "accept", current))?;
        participant.joined_at = Some(now);
        participant.device_info = device_info;

        if self.state == CallState::Ringing {
            self.state = CallState::Active;
            self.shared.set_state(CallState::Active);
        }

        Ok(vec![
            self.updated(user, ParticipantStatus::Accepted),
            SessionEffect::AttachMedia(user.clone()),
        ])
    }

    /// Apply a gateway-decided negative outcome (reject, busy, missed).
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the receiver is still pending.
    pub fn resolve(
        &mut self,
        user: &UserId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEffect>, CallError> {
        self.ensure_live()?;
        let status = resolution.status();
        self.participant_mut(user)?
            .status
            .transition(
                &[ParticipantStatus::Unanswered, ParticipantStatus::Ringing],
                status,
            )
            .map_err(|current| blocked(user, status.as_str(), current))?;

        let mut effects = vec![self.updated(user, status)];
        self.end_if_settled(now, &mut effects);
        Ok(effects)
    }

    /// `user` hangs up.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the participant is `Accepted`.
    pub fn leave(
        &mut self,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEffect>, CallError> {
        self.ensure_live()?;
        let participant = self.participant_mut(user)?;
        participant
            .status
            .transition(&[ParticipantStatus::Accepted], ParticipantStatus::Left)
            .map_err(|current| blocked(user, "leave", current))?;
        participant.left_at = Some(now);

        let mut effects = vec![
            self.updated(user, ParticipantStatus::Left),
            SessionEffect::DetachMedia(user.clone()),
        ];
        self.end_if_settled(now, &mut effects);
        Ok(effects)
    }

    /// End the call immediately from any live state.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the call already ended.
    pub fn force_end(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEffect>, CallError> {
        self.ensure_live()?;
        self.termination = Some(TerminationInfo {
            reason: reason.to_string(),
            retry_count: self.retry_count,
        });
        let mut effects = Vec::new();
        self.end(reason, now, &mut effects);
        Ok(effects)
    }

    fn end_if_settled(&mut self, now: DateTime<Utc>, effects: &mut Vec<SessionEffect>) {
        let accepted = self.accepted_count();
        let pending = self.count(ParticipantStatus::is_pending);
        if accepted == 0 || (accepted <= 1 && pending == 0) {
            let reason = if self.any_receiver_joined() {
                end_reason::COMPLETED
            } else {
                end_reason::UNANSWERED
            };
            self.end(reason, now, effects);
        }
    }

    fn any_receiver_joined(&self) -> bool {
        self.participants
            .iter()
            .any(|p| p.role == ParticipantRole::Receiver && p.joined_at.is_some())
    }

    fn end(&mut self, reason: &str, now: DateTime<Utc>, effects: &mut Vec<SessionEffect>) {
        for participant in &mut self.participants {
            if participant
                .status
                .transition(&[ParticipantStatus::Accepted], ParticipantStatus::Left)
                .is_ok()
            {
                participant.left_at = Some(now);
            } else {
                let _ = participant.status.transition(
                    &[ParticipantStatus::Unanswered, ParticipantStatus::Ringing],
                    ParticipantStatus::Missed,
                );
            }
        }

        self.state = CallState::Ended;
        self.shared.set_state(CallState::Ended);
        self.ended_at = Some(now);
        self.final_quality = self.shared.quality();
        self.end_reason = Some(reason.to_string());

        effects.push(SessionEffect::ReleaseMedia);
        effects.push(SessionEffect::Notify(CallEvent::CallEnded {
            call_id: self.id,
            reason: reason.to_string(),
            duration_seconds: elapsed_seconds(self.started_at, now),
        }));
    }

    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            chat_id: self.chat_id.clone(),
            call_type: self.call_type,
            state: self.state,
            participants: self.participants.iter().map(Participant::snapshot).collect(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            quality: if self.state == CallState::Ended {
                self.final_quality
            } else {
                self.shared.quality()
            },
            end_reason: self.end_reason.clone(),
            termination: self.termination.clone(),
        }
    }
}

fn blocked(user: &UserId, action: &str, current: ParticipantStatus) -> CallError {
    CallError::InvalidTransition(format!(
        "cannot {action} for {user}: participant is {}",
        current.as_str()
    ))
}

/// Whole seconds between `start` and `end`, floored; zero if `end` precedes `start`.
#[must_use]
pub fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds())
        .map(|ms| ms / 1000)
        .unwrap_or(0)
}
