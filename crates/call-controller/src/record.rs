//! Call record builder.
//!
//! Derives the immutable call-log entry from an ended session and hands it to
//! the store once. A failed save is logged and counted; the session is torn
//! down regardless and the save is not retried here.

use crate::errors::CallError;
use crate::observability::metrics;
use crate::session::{
    elapsed_seconds, CallSnapshot, CallState, CallType, ParticipantRole, ParticipantState,
    QualitySnapshot, TerminationInfo,
};
use crate::store::CallRecordStore;
use chrono::{DateTime, Utc};
use common::types::{CallId, ChatId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Durable entry for one finished call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub chat_id: ChatId,
    pub call_type: CallType,
    pub final_state: CallState,
    pub participants: Vec<ParticipantState>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Whole seconds, floored.
    pub duration_seconds: u64,
    /// No receiver ever accepted.
    pub missed: bool,
    pub end_reason: String,
    pub quality: Option<QualitySnapshot>,
    pub termination: Option<TerminationInfo>,
}

impl CallRecord {
    /// Build the record for an ended call.
    ///
    /// # Errors
    ///
    /// `CallError::Internal` if the snapshot is not of an ended call.
    pub fn from_snapshot(snapshot: &CallSnapshot) -> Result<Self, CallError> {
        let end_time = match (snapshot.state, snapshot.ended_at) {
            (CallState::Ended, Some(end_time)) => end_time,
            _ => {
                return Err(CallError::Internal(format!(
                    "call {} has not ended",
                    snapshot.call_id
                )))
            }
        };

        let missed = !snapshot
            .participants
            .iter()
            .any(|p| p.role == ParticipantRole::Receiver && p.joined_at.is_some());

        Ok(Self {
            call_id: snapshot.call_id,
            chat_id: snapshot.chat_id.clone(),
            call_type: snapshot.call_type,
            final_state: snapshot.state,
            participants: snapshot.participants.clone(),
            start_time: snapshot.started_at,
            end_time,
            duration_seconds: elapsed_seconds(snapshot.started_at, end_time),
            missed,
            end_reason: snapshot.end_reason.clone().unwrap_or_default(),
            quality: snapshot.quality,
            termination: snapshot.termination.clone(),
        })
    }
}

/// Builds records and hands them to the store.
#[derive(Clone)]
pub struct RecordBuilder {
    store: Arc<dyn CallRecordStore>,
}

impl RecordBuilder {
    #[must_use]
    pub fn new(store: Arc<dyn CallRecordStore>) -> Self {
        Self { store }
    }

    /// Build and save the record for an ended call.
    ///
    /// # Errors
    ///
    /// `Internal` if the call has not ended, `PersistenceFailure` if the
    /// store rejected the record.
    #[instrument(skip_all, name = "cc.record.finalize", fields(call_id = %snapshot.call_id))]
    pub async fn finalize(&self, snapshot: &CallSnapshot) -> Result<CallRecord, CallError> {
        let record = CallRecord::from_snapshot(snapshot)?;

        match self.store.save(&record).await {
            Ok(()) => {
                metrics::record_call_record_persisted("success");
                info!(
                    target: "cc.record",
                    duration_seconds = record.duration_seconds,
                    missed = record.missed,
                    end_reason = %record.end_reason,
                    "Call record saved"
                );
                Ok(record)
            }
            Err(e) => {
                metrics::record_call_record_persisted("failure");
                warn!(
                    target: "cc.record",
                    error = %e,
                    "Failed to persist call record"
                );
                Err(e.into())
            }
        }
    }
}
