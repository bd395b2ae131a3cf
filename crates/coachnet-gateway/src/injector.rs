//! [`FrameInjector`] – rate-limited diagnostic injection.
//!
//! Injection puts arbitrary frames on a bus for diagnostics. It goes through
//! the same interlock, filter and transport as a normal send, but each
//! logical bus is additionally capped by a `governor` token bucket so a
//! runaway script cannot flood the coach network.

use std::any::Any;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use coachnet_kernel::{Component, ComponentSpec};
use coachnet_types::{GatewayError, HealthReport, SafetyClassification, StopSignal};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::subsystem::{HealthReading, StopLatch, Subsystem};

/// Default cap per logical bus.
pub const DEFAULT_FRAMES_PER_SECOND: u32 = 50;

pub struct FrameInjector {
    limiter: DefaultKeyedRateLimiter<String>,
    frames_per_second: u32,
    classification: SafetyClassification,
    latch: StopLatch,
}

impl FrameInjector {
    /// An injector allowing `frames_per_second` per logical bus, with a burst
    /// of the same size.
    pub fn new(
        frames_per_second: u32,
        classification: SafetyClassification,
    ) -> Result<Self, GatewayError> {
        let rate = NonZeroU32::new(frames_per_second).ok_or_else(|| {
            GatewayError::Config("injector frames_per_second must be at least 1".to_string())
        })?;
        Ok(Self {
            limiter: RateLimiter::keyed(Quota::per_second(rate)),
            frames_per_second,
            classification,
            latch: StopLatch::new(),
        })
    }

    pub fn spec(name: &str, classification: SafetyClassification, frames_per_second: u32) -> ComponentSpec {
        ComponentSpec::new(name, classification, move |_deps| async move {
            let injector = FrameInjector::new(frames_per_second, classification)?;
            info!(frames_per_second, "injector ready");
            Ok(Arc::new(injector) as Arc<dyn Component>)
        })
        .tag("diagnostics")
    }

    pub fn frames_per_second(&self) -> u32 {
        self.frames_per_second
    }

    /// Take one token for `logical_bus`.
    pub fn admit(&self, logical_bus: &str) -> Result<(), GatewayError> {
        if self.latch.is_halted() {
            return Err(GatewayError::Blocked {
                reason: "injector halted".to_string(),
            });
        }
        self.limiter.check_key(&logical_bus.to_string()).map_err(|_| {
            warn!(%logical_bus, limit = self.frames_per_second, "injection rate limit exceeded");
            GatewayError::RateLimited(logical_bus.to_string())
        })
    }

    fn report(&self) -> HealthReport {
        HealthReport::healthy().with_detail(json!({
            "frames_per_second": self.frames_per_second,
            "halted": self.latch.is_halted(),
        }))
    }
}

impl Subsystem for FrameInjector {
    fn kind(&self) -> &'static str {
        "injector"
    }

    fn classification(&self) -> SafetyClassification {
        self.classification
    }

    fn read_health(&self) -> HealthReading {
        HealthReading::Ready(self.report())
    }
}

#[async_trait]
impl Component for FrameInjector {
    async fn health_check(&self) -> HealthReport {
        self.report()
    }

    async fn emergency_stop(&self, signal: &StopSignal) -> Result<(), GatewayError> {
        if self.latch.latch(signal) {
            info!(sequence = signal.sequence, "injector halted");
        } else {
            debug!(sequence = signal.sequence, "duplicate stop ignored");
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), GatewayError> {
        self.latch.release();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_capped_per_bus() {
        let injector = FrameInjector::new(2, SafetyClassification::Maintenance).unwrap();
        assert!(injector.admit("house").is_ok());
        assert!(injector.admit("house").is_ok());
        assert!(matches!(injector.admit("house"), Err(GatewayError::RateLimited(ref bus)) if bus == "house"));
        // Buses have independent buckets.
        assert!(injector.admit("chassis").is_ok());
    }

    #[test]
    fn zero_rate_is_a_config_error() {
        assert!(matches!(
            FrameInjector::new(0, SafetyClassification::Maintenance),
            Err(GatewayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn halted_injector_refuses() {
        let injector = FrameInjector::new(10, SafetyClassification::Maintenance).unwrap();
        injector
            .emergency_stop(&StopSignal {
                sequence: 1,
                reason: "test".into(),
            })
            .await
            .unwrap();
        assert!(matches!(injector.admit("house"), Err(GatewayError::Blocked { .. })));
        injector.resume().await.unwrap();
        assert!(injector.admit("house").is_ok());
    }
}
