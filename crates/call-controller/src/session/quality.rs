//! Lock-free call quality aggregation.
//!
//! Stat reports arrive far more often than signaling and must never queue
//! behind it. Handles write straight into [`SharedCallState`], which gates
//! samples on the call being `Active`.

use super::CallState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// One periodic media stat report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub bitrate_kbps: u32,
    /// Fraction of packets lost, `0.0..=1.0`.
    pub packet_loss: f64,
    pub latency_ms: u32,
}

/// Running averages over every accepted sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub avg_bitrate_kbps: f64,
    pub avg_packet_loss: f64,
    pub avg_latency_ms: f64,
    pub sample_count: u64,
}

const PPM: f64 = 1_000_000.0;

/// Atomic running sums. Best effort: a snapshot racing a write may see a
/// partially applied sample.
#[derive(Debug, Default)]
pub struct QualityAccumulator {
    bitrate_sum: AtomicU64,
    loss_ppm_sum: AtomicU64,
    latency_sum: AtomicU64,
    count: AtomicU64,
}

impl QualityAccumulator {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn record(&self, sample: &QualitySample) {
        let loss = if sample.packet_loss.is_finite() {
            sample.packet_loss.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.bitrate_sum
            .fetch_add(u64::from(sample.bitrate_kbps), Ordering::Relaxed);
        self.loss_ppm_sum
            .fetch_add((loss * PPM).round() as u64, Ordering::Relaxed);
        self.latency_sum
            .fetch_add(u64::from(sample.latency_ms), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Averages so far, or `None` if no sample was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> Option<QualitySnapshot> {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some(QualitySnapshot {
            avg_bitrate_kbps: self.bitrate_sum.load(Ordering::Relaxed) as f64 / n,
            avg_packet_loss: self.loss_ppm_sum.load(Ordering::Relaxed) as f64 / PPM / n,
            avg_latency_ms: self.latency_sum.load(Ordering::Relaxed) as f64 / n,
            sample_count: count,
        })
    }
}

/// Call state mirrored outside the session actor, plus the quality sums.
#[derive(Debug)]
pub struct SharedCallState {
    state: AtomicU8,
    quality: QualityAccumulator,
}

impl Default for SharedCallState {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(CallState::Ringing as u8),
            quality: QualityAccumulator::default(),
        }
    }
}

impl SharedCallState {
    #[must_use]
    pub fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CallState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record `sample` if the call is `Active`. Returns whether it was kept.
    pub fn report_quality(&self, sample: &QualitySample) -> bool {
        if self.state() != CallState::Active {
            return false;
        }
        self.quality.record(sample);
        true
    }

    #[must_use]
    pub fn quality(&self) -> Option<QualitySnapshot> {
        self.quality.snapshot()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn sample(bitrate_kbps: u32, packet_loss: f64, latency_ms: u32) -> QualitySample {
        QualitySample {
            bitrate_kbps,
            packet_loss,
            latency_ms,
        }
    }

    #[test]
    fn test_empty_accumulator_has_no_snapshot() {
        assert!(QualityAccumulator::default().snapshot().is_none());
    }

    #[test]
    fn test_averages() {
        let acc = QualityAccumulator::default();
        acc.record(&sample(500, 0.02, 40));
        acc.record(&sample(700, 0.04, 60));

        let snap = acc.snapshot().unwrap();
        assert_eq!(snap.sample_count, 2);
        assert_eq!(snap.avg_bitrate_kbps, 600.0);
        assert_eq!(snap.avg_latency_ms, 50.0);
        assert!((snap.avg_packet_loss - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_loss_is_clamped() {
        let acc = QualityAccumulator::default();
        acc.record(&sample(100, 7.5, 10));
        acc.record(&sample(100, f64::NAN, 10));

        let snap = acc.snapshot().unwrap();
        assert!((snap.avg_packet_loss - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_samples_only_kept_while_active() {
        let shared = SharedCallState::default();
        assert!(!shared.report_quality(&sample(100, 0.0, 10)));

        shared.set_state(CallState::Active);
        assert!(shared.report_quality(&sample(100, 0.0, 10)));

        shared.set_state(CallState::Ended);
        assert!(!shared.report_quality(&sample(100, 0.0, 10)));
        assert_eq!(shared.quality().unwrap().sample_count, 1);
    }
}
