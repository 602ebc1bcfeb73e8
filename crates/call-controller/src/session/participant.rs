//! Participant state and the single-writer status cell.

use chrono::{DateTime, Utc};
use common::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Role of a participant in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Initiator,
    Receiver,
}

/// Per-participant status.
///
/// `Rejected`, `Missed` and `Busy` are sticky; `Left` is reached only from
/// `Accepted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ParticipantStatus {
    Unanswered = 0,
    /// The receiver's device acknowledged the ring.
    Ringing = 1,
    Accepted = 2,
    Rejected = 3,
    Missed = 4,
    Busy = 5,
    Left = 6,
}

impl ParticipantStatus {
    /// Still waiting for the participant to answer.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Unanswered | Self::Ringing)
    }

    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unanswered => "unanswered",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Busy => "busy",
            Self::Left => "left",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unanswered,
            1 => Self::Ringing,
            2 => Self::Accepted,
            3 => Self::Rejected,
            4 => Self::Missed,
            5 => Self::Busy,
            // Only values written by `store` are ever read back.
            _ => Self::Left,
        }
    }
}

/// Status cell with compare-and-set transitions.
///
/// The first writer to move a participant out of an allowed status wins;
/// everyone else observes the status it left behind.
#[derive(Debug)]
pub struct ParticipantStatusCell(AtomicU8);

impl ParticipantStatusCell {
    #[must_use]
    pub fn new(status: ParticipantStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[must_use]
    pub fn load(&self) -> ParticipantStatus {
        ParticipantStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the current status is one of `allowed_from`.
    ///
    /// Returns the previous status on success, or the status that blocked
    /// the transition.
    pub fn transition(
        &self,
        allowed_from: &[ParticipantStatus],
        to: ParticipantStatus,
    ) -> Result<ParticipantStatus, ParticipantStatus> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let status = ParticipantStatus::from_u8(current);
            if !allowed_from.contains(&status) {
                return Err(status);
            }
            match self.0.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(status),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Client device that answered the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// Point-in-time view of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub device_info: Option<DeviceInfo>,
}

/// A participant as owned by the session.
#[derive(Debug)]
pub(crate) struct Participant {
    pub(crate) user_id: UserId,
    pub(crate) role: ParticipantRole,
    pub(crate) status: ParticipantStatusCell,
    pub(crate) joined_at: Option<DateTime<Utc>>,
    pub(crate) left_at: Option<DateTime<Utc>>,
    pub(crate) device_info: Option<DeviceInfo>,
}

impl Participant {
    pub(crate) fn initiator(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            role: ParticipantRole::Initiator,
            status: ParticipantStatusCell::new(ParticipantStatus::Accepted),
            joined_at: Some(now),
            left_at: None,
            device_info: None,
        }
    }

    pub(crate) fn receiver(user_id: UserId) -> Self {
        Self {
            user_id,
            role: ParticipantRole::Receiver,
            status: ParticipantStatusCell::new(ParticipantStatus::Unanswered),
            joined_at: None,
            left_at: None,
            device_info: None,
        }
    }

    pub(crate) fn snapshot(&self) -> ParticipantState {
        ParticipantState {
            user_id: self.user_id.clone(),
            role: self.role,
            status: self.status.load(),
            joined_at: self.joined_at,
            left_at: self.left_at,
            device_info: self.device_info.clone(),
        }
    }
}
