//! Message types for actor communication.
//!
//! Requests carry a `respond_to` oneshot; fire-and-forget notifications
//! (`CallEnded`, `MediaFailed`) do not.

use crate::errors::CallError;
use crate::media::{RouterHandle, WorkerLoad};
use crate::session::{CallSetup, CallSnapshot, DeviceInfo, Resolution};
use common::types::{CallId, UserId};
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages handled by the `CallControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Spawn a session for a call whose router is already acquired.
    RegisterCall {
        setup: Box<CallSetup>,
        router: RouterHandle,
        respond_to: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },

    /// A session reached `Ended` and is exiting.
    CallEnded { call_id: CallId },

    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Stop accepting calls and end every live session.
    Shutdown {
        /// How long to wait for sessions to finish.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Messages handled by a `CallSessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    Accept {
        user_id: UserId,
        device_info: Option<DeviceInfo>,
        respond_to: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },

    /// Reject, busy or missed, as decided by the gateway.
    Resolve {
        user_id: UserId,
        resolution: Resolution,
        respond_to: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },

    MarkRinging {
        user_id: UserId,
        respond_to: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },

    Leave {
        user_id: UserId,
        respond_to: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },

    ForceEnd {
        reason: String,
        respond_to: oneshot::Sender<Result<CallSnapshot, CallError>>,
    },

    /// Sent by the media pipeline when an attach could not be completed.
    MediaFailed { user_id: UserId, error: String },

    GetSnapshot {
        respond_to: oneshot::Sender<CallSnapshot>,
    },
}

/// Controller status for health and capacity reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub controller_id: String,
    /// Sessions currently supervised (including ones finishing up).
    pub call_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
    pub workers: Vec<WorkerLoad>,
}

impl ControllerStatus {
    /// Routers hosted across all workers.
    #[must_use]
    pub fn router_count(&self) -> usize {
        self.workers.iter().map(|w| w.router_count).sum()
    }
}
