//! Signaling gateway boundary.
//!
//! The gateway owns the real-time transport; this module only defines the
//! events it delivers ([`SignalingEvent`]) and the events it fans out to
//! clients ([`CallEvent`]). Both are JSON-tagged by `type`.

use crate::session::{
    CallSetup, CallType, DeviceInfo, ParticipantStatus, QualitySample,
};
use common::types::{CallId, ChatId, UserId};
use serde::{Deserialize, Serialize};

/// Request to start a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateCall {
    pub chat_id: ChatId,
    pub call_type: CallType,
    pub initiator_id: UserId,
    pub receiver_ids: Vec<UserId>,
    /// How many times the gateway already retried this request.
    #[serde(default)]
    pub retry_count: u32,
}

impl InitiateCall {
    /// Bind the request to a freshly allocated call id.
    #[must_use]
    pub fn into_setup(self, call_id: CallId) -> CallSetup {
        CallSetup {
            call_id,
            chat_id: self.chat_id,
            call_type: self.call_type,
            initiator_id: self.initiator_id,
            receiver_ids: self.receiver_ids,
            retry_count: self.retry_count,
        }
    }
}

/// Inbound event from the signaling gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    Initiate(InitiateCall),
    Accept {
        call_id: CallId,
        user_id: UserId,
        #[serde(default)]
        device_info: Option<DeviceInfo>,
    },
    Reject {
        call_id: CallId,
        user_id: UserId,
    },
    Busy {
        call_id: CallId,
        user_id: UserId,
    },
    Missed {
        call_id: CallId,
        user_id: UserId,
    },
    /// The receiver's device started ringing.
    Ringing {
        call_id: CallId,
        user_id: UserId,
    },
    Leave {
        call_id: CallId,
        user_id: UserId,
    },
    QualityReport {
        call_id: CallId,
        user_id: UserId,
        sample: QualitySample,
    },
    ForceEnd {
        call_id: CallId,
        reason: String,
    },
}

impl SignalingEvent {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Initiate(_) => "initiate",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Busy { .. } => "busy",
            Self::Missed { .. } => "missed",
            Self::Ringing { .. } => "ringing",
            Self::Leave { .. } => "leave",
            Self::QualityReport { .. } => "quality_report",
            Self::ForceEnd { .. } => "force_end",
        }
    }

    /// Target call; `None` for `Initiate`.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Initiate(_) => None,
            Self::Accept { call_id, .. }
            | Self::Reject { call_id, .. }
            | Self::Busy { call_id, .. }
            | Self::Missed { call_id, .. }
            | Self::Ringing { call_id, .. }
            | Self::Leave { call_id, .. }
            | Self::QualityReport { call_id, .. }
            | Self::ForceEnd { call_id, .. } => Some(*call_id),
        }
    }
}

/// Outbound event for the gateway to broadcast to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    Ringing {
        call_id: CallId,
        chat_id: ChatId,
        call_type: CallType,
        initiator_id: UserId,
        receiver_ids: Vec<UserId>,
    },
    ParticipantUpdated {
        call_id: CallId,
        user_id: UserId,
        status: ParticipantStatus,
    },
    MediaReady {
        call_id: CallId,
        user_id: UserId,
    },
    MediaFailed {
        call_id: CallId,
        user_id: UserId,
        error: String,
    },
    CallEnded {
        call_id: CallId,
        reason: String,
        duration_seconds: u64,
    },
}
