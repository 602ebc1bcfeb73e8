//! In-process actor counters and mailbox depth tracking.
//!
//! Depth bands per actor type:
//!
//! | Actor      | Normal | Elevated | Critical |
//! |------------|--------|----------|----------|
//! | Controller | 0-100  | 101-500  | > 500    |
//! | Call       | 0-16   | 17-48    | > 48     |
//! | Pipeline   | 0-32   | 33-128   | > 128    |
//!
//! A call mailbox only sees signaling for one call, so even a modest backlog
//! there is worth a log line.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Kinds of long-lived task, used as the `actor_type` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorType {
    /// The singleton `CallControllerActor`.
    Controller,
    /// One `CallSessionActor` per call.
    Call,
    /// One `MediaPipeline` per call.
    Pipeline,
}

/// Upper bounds of the normal and elevated depth bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthBands {
    pub normal: usize,
    pub elevated: usize,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Call => "call",
            Self::Pipeline => "pipeline",
        }
    }

    #[must_use]
    pub const fn bands(self) -> DepthBands {
        match self {
            Self::Controller => DepthBands {
                normal: 100,
                elevated: 500,
            },
            Self::Call => DepthBands {
                normal: 16,
                elevated: 48,
            },
            Self::Pipeline => DepthBands {
                normal: 32,
                elevated: 128,
            },
        }
    }

    #[must_use]
    pub const fn level(self, depth: usize) -> MailboxLevel {
        let bands = self.bands();
        if depth > bands.elevated {
            MailboxLevel::Critical
        } else if depth > bands.normal {
            MailboxLevel::Elevated
        } else {
            MailboxLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxLevel {
    Normal,
    Elevated,
    Critical,
}

/// Queue depth of one actor's mailbox.
///
/// The owning actor calls [`record_received`](Self::record_received) with the
/// receiver's remaining length right after taking a message, and
/// [`record_handled`](Self::record_handled) once it has been processed. The
/// depth counts the message in flight too.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor: ActorType,
    label: String,
    queued: AtomicUsize,
    high_water: AtomicUsize,
    handled: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor: ActorType, label: impl Into<String>) -> Self {
        Self {
            actor,
            label: label.into(),
            queued: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            handled: AtomicU64::new(0),
        }
    }

    /// A message was taken off the queue with `backlog` still waiting behind it.
    pub fn record_received(&self, backlog: usize) {
        let depth = backlog.saturating_add(1);
        self.queued.store(depth, Ordering::Relaxed);
        let previous_high = self.high_water.fetch_max(depth, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor.as_str(), depth);

        match self.actor.level(depth) {
            MailboxLevel::Critical => warn!(
                target: "cc.actor.mailbox",
                actor_type = self.actor.as_str(),
                actor = %self.label,
                depth,
                limit = self.actor.bands().elevated,
                "Mailbox backlog critical"
            ),
            // Log only on a new high, not on every message in the band.
            MailboxLevel::Elevated if depth > previous_high => debug!(
                target: "cc.actor.mailbox",
                actor_type = self.actor.as_str(),
                actor = %self.label,
                depth,
                "Mailbox backlog building"
            ),
            _ => {}
        }
    }

    /// The in-flight message was processed.
    pub fn record_handled(&self) {
        let depth = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1))
            .map_or(0, |before| before - 1);
        self.handled.fetch_add(1, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor.as_str(), depth);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.actor.level(self.current_depth())
    }
}

/// Counters shared by the controller and every call session.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_calls: AtomicUsize,
    pub calls_started: AtomicU64,
    pub calls_ended: AtomicU64,
    /// Records the store refused.
    pub records_failed: AtomicU64,
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A session was registered with the controller.
    pub fn call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
        let active = self.active_calls.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_calls_active(active);
    }

    /// The controller stopped supervising a session.
    pub fn call_removed(&self) {
        let active = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .map_or(0, |before| before - 1);
        metrics::set_calls_active(active);
    }

    /// A session reached `Ended`.
    pub fn call_ended(&self) {
        self.calls_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self, actor: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_actor_panic(actor.as_str());
        error!(
            target: "cc.actor.panic",
            actor_type = actor.as_str(),
            total_panics = total,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn persist_failures(&self) -> u64 {
        self.records_failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_follow_bands() {
        assert_eq!(ActorType::Call.level(0), MailboxLevel::Normal);
        assert_eq!(ActorType::Call.level(16), MailboxLevel::Normal);
        assert_eq!(ActorType::Call.level(17), MailboxLevel::Elevated);
        assert_eq!(ActorType::Call.level(49), MailboxLevel::Critical);
        assert_eq!(ActorType::Controller.level(500), MailboxLevel::Elevated);
        assert_eq!(ActorType::Pipeline.as_str(), "pipeline");
    }

    #[test]
    fn test_monitor_tracks_depth_and_high_water() {
        let monitor = MailboxMonitor::new(ActorType::Call, "call-1");
        monitor.record_received(3);
        assert_eq!(monitor.current_depth(), 4);
        monitor.record_handled();
        monitor.record_received(1);
        monitor.record_handled();

        assert_eq!(monitor.current_depth(), 1);
        assert_eq!(monitor.peak_depth(), 4);
        assert_eq!(monitor.messages_processed(), 2);
    }

    #[test]
    fn test_handled_on_empty_mailbox_stays_at_zero() {
        let monitor = MailboxMonitor::new(ActorType::Controller, "cc-test");
        monitor.record_handled();
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_monitor_reports_critical_backlog() {
        let monitor = MailboxMonitor::new(ActorType::Call, "call-1");
        monitor.record_received(19);
        assert_eq!(monitor.current_level(), MailboxLevel::Elevated);

        monitor.record_received(59);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
        assert_eq!(monitor.peak_depth(), 60);
    }

    #[tokio::test]
    async fn test_depth_follows_real_receiver_backlog() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(128);
        for i in 0..60 {
            tx.send(i).await.unwrap();
        }
        let monitor = MailboxMonitor::new(ActorType::Call, "call-1");

        rx.recv().await.unwrap();
        monitor.record_received(rx.len());
        assert_eq!(monitor.current_depth(), 60);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
        monitor.record_handled();

        while rx.len() > 10 {
            rx.recv().await.unwrap();
        }
        rx.recv().await.unwrap();
        monitor.record_received(rx.len());
        assert_eq!(monitor.current_depth(), 10);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
        assert_eq!(monitor.peak_depth(), 60);
    }

    #[test]
    fn test_active_calls_never_underflow() {
        let metrics = ActorMetrics::new();
        metrics.call_started();
        metrics.call_started();
        metrics.call_ended();
        metrics.call_removed();
        assert_eq!(metrics.call_count(), 1);

        metrics.call_removed();
        metrics.call_removed();
        assert_eq!(metrics.call_count(), 0);
        assert_eq!(metrics.calls_started.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.calls_ended.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panics_and_persist_failures_counted() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Pipeline);
        metrics.record_persist_failure();
        metrics.record_persist_failure();

        assert_eq!(metrics.panic_count(), 1);
        assert_eq!(metrics.persist_failures(), 2);
    }
}
