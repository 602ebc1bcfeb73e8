//! Call record persistence.
//!
//! The controller hands each finished call's record to a [`CallRecordStore`]
//! exactly once. Durable backends live outside this crate; the in-memory
//! store serves the call-log query path in single-node deployments and tests.

use crate::record::CallRecord;
use common::types::{CallId, ChatId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;

/// Persistence failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    /// Backend unreachable or rejected the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record for this call was already saved.
    #[error("record already exists for call {0}")]
    Duplicate(CallId),
}

/// Durable sink and query surface for call records.
#[async_trait::async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Persist one record.
    async fn save(&self, record: &CallRecord) -> Result<(), PersistenceError>;

    /// Records `user` took part in, newest first.
    async fn list_by_user(&self, user: &UserId) -> Result<Vec<CallRecord>, PersistenceError>;

    /// Records for `chat`, newest first.
    async fn list_by_chat(&self, chat: &ChatId) -> Result<Vec<CallRecord>, PersistenceError>;
}

/// Store keeping every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryCallRecordStore {
    records: RwLock<Vec<CallRecord>>,
}

impl InMemoryCallRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Record for `call_id`, if saved.
    pub async fn get(&self, call_id: &CallId) -> Option<CallRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| &r.call_id == call_id)
            .cloned()
    }

    async fn filtered(&self, pred: impl Fn(&CallRecord) -> bool) -> Vec<CallRecord> {
        let mut matching: Vec<CallRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| pred(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matching
    }
}

#[async_trait::async_trait]
impl CallRecordStore for InMemoryCallRecordStore {
    async fn save(&self, record: &CallRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.call_id == record.call_id) {
            return Err(PersistenceError::Duplicate(record.call_id));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn list_by_user(&self, user: &UserId) -> Result<Vec<CallRecord>, PersistenceError> {
        Ok(self
            .filtered(|r| r.participants.iter().any(|p| &p.user_id == user))
            .await)
    }

    async fn list_by_chat(&self, chat: &ChatId) -> Result<Vec<CallRecord>, PersistenceError> {
        Ok(self.filtered(|r| &r.chat_id == chat).await)
    }
}

/// Mock store for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory store that counts saves and can be told to fail them.
    #[derive(Debug, Default)]
    pub struct MockCallRecordStore {
        inner: InMemoryCallRecordStore,
        save_attempts: AtomicUsize,
        fail_saves: AtomicBool,
    }

    impl MockCallRecordStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Store whose saves always fail with `Unavailable`.
        #[must_use]
        pub fn failing() -> Self {
            let store = Self::default();
            store.fail_saves.store(true, Ordering::SeqCst);
            store
        }

        pub fn save_attempts(&self) -> usize {
            self.save_attempts.load(Ordering::SeqCst)
        }

        /// Successfully stored records.
        pub async fn saved(&self) -> usize {
            self.inner.len().await
        }

        pub async fn get(&self, call_id: &CallId) -> Option<CallRecord> {
            self.inner.get(call_id).await
        }
    }

    #[async_trait::async_trait]
    impl CallRecordStore for MockCallRecordStore {
        async fn save(&self, record: &CallRecord) -> Result<(), PersistenceError> {
            self.save_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("mock failure".to_string()));
            }
            self.inner.save(record).await
        }

        async fn list_by_user(&self, user: &UserId) -> Result<Vec<CallRecord>, PersistenceError> {
            self.inner.list_by_user(user).await
        }

        async fn list_by_chat(&self, chat: &ChatId) -> Result<Vec<CallRecord>, PersistenceError> {
            self.inner.list_by_chat(chat).await
        }
    }
}
