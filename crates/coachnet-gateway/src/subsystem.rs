//! What every bus subsystem owned by the facade has in common.
//!
//! Subsystems differ in how they know their own health. A transport or a
//! filter can answer immediately; the recorder has to take its buffer lock
//! first. [`HealthReading`] carries either form and [`settle`] turns both into
//! one awaited [`HealthReport`], so the facade never has to know which kind
//! of subsystem it is asking.
//!
//! [`StopLatch`] is the stop-sequence bookkeeping each subsystem uses to treat
//! a repeated delivery of the same emergency stop as one event.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use coachnet_types::{GatewayError, HealthReport, SafetyClassification, StopSignal};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Health
// ────────────────────────────────────────────────────────────────────────────

/// A subsystem's answer to "how are you?".
pub enum HealthReading {
    /// Known without suspending.
    Ready(HealthReport),
    /// Has to be awaited.
    Pending(BoxFuture<'static, HealthReport>),
}

impl From<HealthReport> for HealthReading {
    fn from(report: HealthReport) -> Self {
        HealthReading::Ready(report)
    }
}

/// Resolve a reading. A pending reading that times out or panics becomes a
/// `Failed` report; this never returns an error.
pub async fn settle(name: &str, reading: HealthReading, timeout: Duration) -> HealthReport {
    match reading {
        HealthReading::Ready(report) => report,
        HealthReading::Pending(future) => {
            match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
                Ok(Ok(report)) => report,
                Ok(Err(_)) => {
                    warn!(subsystem = %name, "health check panicked");
                    HealthReport::failed("health check panicked")
                }
                Err(_) => {
                    let err = GatewayError::HealthCheckTimeout(name.to_string());
                    warn!(subsystem = %name, error = %err, "health check timed out");
                    HealthReport::failed(err.to_string())
                }
            }
        }
    }
}

/// A bus subsystem the facade aggregates health over.
pub trait Subsystem: Send + Sync {
    /// Short kind label, e.g. `"transport"`.
    fn kind(&self) -> &'static str;

    fn classification(&self) -> SafetyClassification;

    fn read_health(&self) -> HealthReading;
}

// ────────────────────────────────────────────────────────────────────────────
// Stop bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Halted flag plus the highest stop sequence seen.
#[derive(Debug, Default)]
pub struct StopLatch {
    halted: AtomicBool,
    last_stop: AtomicU64,
}

impl StopLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `signal`. Returns `false` when its sequence was already seen.
    pub fn latch(&self, signal: &StopSignal) -> bool {
        self.halted.store(true, Ordering::Release);
        self.last_stop.fetch_max(signal.sequence, Ordering::AcqRel) < signal.sequence
    }

    /// Release after an authorized reset. Returns `true` if it was halted.
    pub fn release(&self) -> bool {
        self.halted.swap(false, Ordering::AcqRel)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn last_stop(&self) -> u64 {
        self.last_stop.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(sequence: u64) -> StopSignal {
        StopSignal {
            sequence,
            reason: "test".into(),
        }
    }

    async fn never() -> HealthReport {
        std::future::pending().await
    }

    async fn explode() -> HealthReport {
        panic!("sensor unplugged")
    }

    #[tokio::test]
    async fn ready_and_pending_settle_the_same_way() {
        let ready = settle("a", HealthReport::degraded("x").into(), Duration::from_millis(10)).await;
        let pending = settle(
            "b",
            HealthReading::Pending(Box::pin(async { HealthReport::degraded("x") })),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(ready, pending);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_reading_is_a_failure() {
        let report = settle(
            "recorder",
            HealthReading::Pending(Box::pin(never())),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(report.level, coachnet_types::HealthLevel::Failed);
        assert!(report.detail.as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_reading_is_a_failure() {
        let report = settle(
            "recorder",
            HealthReading::Pending(Box::pin(explode())),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(report.level, coachnet_types::HealthLevel::Failed);
    }

    #[test]
    fn latch_dedupes_sequences() {
        let latch = StopLatch::new();
        assert!(latch.latch(&signal(1)));
        assert!(!latch.latch(&signal(1)));
        assert!(latch.is_halted());
        assert!(latch.release());
        assert!(!latch.release());
        assert!(latch.latch(&signal(2)));
        assert_eq!(latch.last_stop(), 2);
    }
}
