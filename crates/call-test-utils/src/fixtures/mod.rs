//! Pre-configured test data fixtures for Call Controller testing.
//!
//! Provides builders and test data for:
//! - Controller configuration
//! - Users
//! - `InitiateCall` requests

use call_controller::config::Config;
use call_controller::session::CallType;
use call_controller::signaling::InitiateCall;
use common::types::{ChatId, UserId};
use std::collections::HashMap;
use uuid::Uuid;

/// Minimal valid configuration variables.
#[must_use]
pub fn test_config_vars() -> HashMap<String, String> {
    HashMap::from([
        ("MEDIA_WORKER_POOL_SIZE".to_string(), "2".to_string()),
        ("MEDIA_RTC_MIN_PORT".to_string(), "40000".to_string()),
        ("MEDIA_RTC_MAX_PORT".to_string(), "40999".to_string()),
        (
            "MEDIA_INITIAL_OUTGOING_BITRATE".to_string(),
            "600000".to_string(),
        ),
        (
            "MEDIA_MIN_OUTGOING_BITRATE".to_string(),
            "100000".to_string(),
        ),
        ("CALL_CONTROLLER_ID".to_string(), "cc-test".to_string()),
    ])
}

/// Configuration builder over [`test_config_vars`].
#[derive(Debug, Clone)]
pub struct TestConfig {
    vars: HashMap<String, String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: test_config_vars(),
        }
    }

    #[must_use]
    pub fn with_workers(self, count: usize) -> Self {
        self.with_var("MEDIA_WORKER_POOL_SIZE", count)
    }

    #[must_use]
    pub fn with_max_routers_per_worker(self, count: usize) -> Self {
        self.with_var("MEDIA_MAX_ROUTERS_PER_WORKER", count)
    }

    #[must_use]
    pub fn with_ring_timeout_seconds(self, seconds: u64) -> Self {
        self.with_var("CALL_RING_TIMEOUT_SECONDS", seconds)
    }

    #[must_use]
    pub fn with_max_active_calls(self, count: usize) -> Self {
        self.with_var("CALL_MAX_ACTIVE_CALLS", count)
    }

    /// Set the RTC port range, inclusive.
    #[must_use]
    pub fn with_port_range(self, min: u16, max: u16) -> Self {
        self.with_var("MEDIA_RTC_MIN_PORT", min)
            .with_var("MEDIA_RTC_MAX_PORT", max)
    }

    #[must_use]
    pub fn with_var(mut self, key: &str, value: impl ToString) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Build the config. Panics on invalid values (test-only crate).
    #[must_use]
    pub fn build(&self) -> Config {
        Config::from_vars(&self.vars).expect("test config should be valid")
    }
}

/// Shorthand for a user id.
#[must_use]
pub fn user(id: &str) -> UserId {
    UserId::from(id)
}

/// Builder for `InitiateCall` requests.
#[derive(Debug, Clone)]
pub struct TestCall {
    chat_id: ChatId,
    call_type: CallType,
    initiator: UserId,
    receivers: Vec<UserId>,
    retry_count: u32,
}

impl TestCall {
    /// Audio call from `initiator` to `receivers` in a random chat.
    #[must_use]
    pub fn audio(initiator: &str, receivers: &[&str]) -> Self {
        Self {
            chat_id: ChatId::from(format!("chat-{}", Uuid::new_v4()).as_str()),
            call_type: CallType::Audio,
            initiator: user(initiator),
            receivers: receivers.iter().map(|r| user(r)).collect(),
            retry_count: 0,
        }
    }

    /// Video call from `initiator` to `receivers` in a random chat.
    #[must_use]
    pub fn video(initiator: &str, receivers: &[&str]) -> Self {
        Self {
            call_type: CallType::Video,
            ..Self::audio(initiator, receivers)
        }
    }

    #[must_use]
    pub fn in_chat(mut self, chat_id: &str) -> Self {
        self.chat_id = ChatId::from(chat_id);
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    #[must_use]
    pub fn build(self) -> InitiateCall {
        InitiateCall {
            chat_id: self.chat_id,
            call_type: self.call_type,
            initiator_id: self.initiator,
            receiver_ids: self.receivers,
            retry_count: self.retry_count,
        }
    }
}
