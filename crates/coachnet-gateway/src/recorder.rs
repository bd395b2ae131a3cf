//! [`FrameRecorder`] – bounded capture of bus traffic.
//!
//! While recording, every frame the facade sends or injects is appended to a
//! ring buffer; once full, the oldest frame is overwritten and counted as
//! dropped. The buffer sits behind an async mutex, so the recorder reports
//! its health asynchronously.
//!
//! Recording continues through an emergency stop: the capture around a stop
//! is what an operator wants to look at afterwards.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coachnet_kernel::{Component, ComponentSpec};
use coachnet_types::{BusFrame, FrameDirection, HealthReport, SafetyClassification};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use crate::subsystem::{HealthReading, Subsystem};

pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedFrame {
    pub at: DateTime<Utc>,
    pub direction: FrameDirection,
    pub frame: BusFrame,
}

#[derive(Debug, Default)]
struct Buffer {
    frames: VecDeque<RecordedFrame>,
    dropped: u64,
}

pub struct FrameRecorder {
    capacity: usize,
    recording: AtomicBool,
    buffer: Arc<Mutex<Buffer>>,
    classification: SafetyClassification,
}

impl FrameRecorder {
    pub fn new(capacity: usize, classification: SafetyClassification) -> Self {
        Self {
            capacity: capacity.max(1),
            recording: AtomicBool::new(false),
            buffer: Arc::new(Mutex::new(Buffer::default())),
            classification,
        }
    }

    pub fn spec(
        name: &str,
        classification: SafetyClassification,
        capacity: usize,
        autostart: bool,
    ) -> ComponentSpec {
        ComponentSpec::new(name, classification, move |_deps| async move {
            let recorder = FrameRecorder::new(capacity, classification);
            if autostart {
                recorder.start();
            }
            Ok(Arc::new(recorder) as Arc<dyn Component>)
        })
        .tag("diagnostics")
    }

    pub fn start(&self) {
        if !self.recording.swap(true, Ordering::AcqRel) {
            info!(capacity = self.capacity, "recording started");
        }
    }

    pub fn stop(&self) {
        if self.recording.swap(false, Ordering::AcqRel) {
            info!("recording stopped");
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Append `frame` if recording.
    pub async fn record(&self, direction: FrameDirection, frame: &BusFrame) {
        if !self.is_recording() {
            return;
        }
        let mut buffer = self.buffer.lock().await;
        if buffer.frames.len() == self.capacity {
            buffer.frames.pop_front();
            buffer.dropped += 1;
        }
        buffer.frames.push_back(RecordedFrame {
            at: Utc::now(),
            direction,
            frame: frame.clone(),
        });
    }

    /// Recorded frames, oldest first.
    pub async fn snapshot(&self) -> Vec<RecordedFrame> {
        self.buffer.lock().await.frames.iter().cloned().collect()
    }

    pub async fn clear(&self) {
        let mut buffer = self.buffer.lock().await;
        buffer.frames.clear();
        buffer.dropped = 0;
    }

    fn pending_report(&self) -> HealthReading {
        let buffer = Arc::clone(&self.buffer);
        let capacity = self.capacity;
        let recording = self.is_recording();
        HealthReading::Pending(Box::pin(async move {
            let buffer = buffer.lock().await;
            let detail = json!({
                "recording": recording,
                "frames": buffer.frames.len(),
                "capacity": capacity,
                "dropped": buffer.dropped,
            });
            if buffer.dropped > 0 {
                HealthReport::degraded(format!("{} frames overwritten", buffer.dropped))
                    .with_detail(detail)
            } else {
                HealthReport::healthy().with_detail(detail)
            }
        }))
    }
}

impl Subsystem for FrameRecorder {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    fn classification(&self) -> SafetyClassification {
        self.classification
    }

    fn read_health(&self) -> HealthReading {
        self.pending_report()
    }
}

#[async_trait]
impl Component for FrameRecorder {
    async fn health_check(&self) -> HealthReport {
        match self.pending_report() {
            HealthReading::Ready(report) => report,
            HealthReading::Pending(future) => future.await,
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachnet_types::HealthLevel;

    fn frame(id: u32) -> BusFrame {
        BusFrame::new("house", id, vec![0xAA])
    }

    #[tokio::test]
    async fn records_only_while_started() {
        let recorder = FrameRecorder::new(8, SafetyClassification::Maintenance);
        recorder.record(FrameDirection::Sent, &frame(1)).await;
        assert!(recorder.snapshot().await.is_empty());

        recorder.start();
        recorder.record(FrameDirection::Sent, &frame(2)).await;
        recorder.record(FrameDirection::Injected, &frame(3)).await;
        recorder.stop();
        recorder.record(FrameDirection::Sent, &frame(4)).await;

        let frames = recorder.snapshot().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].direction, FrameDirection::Injected);
    }

    #[tokio::test]
    async fn ring_buffer_overwrites_oldest_and_degrades() {
        let recorder = FrameRecorder::new(2, SafetyClassification::Maintenance);
        recorder.start();
        for id in 1..=3 {
            recorder.record(FrameDirection::Sent, &frame(id)).await;
        }
        let ids: Vec<u32> = recorder.snapshot().await.iter().map(|r| r.frame.id).collect();
        assert_eq!(ids, vec![2, 3]);

        let report = recorder.health_check().await;
        assert_eq!(report.level, HealthLevel::Degraded);
        assert_eq!(report.detail["dropped"], 1);

        recorder.clear().await;
        assert_eq!(recorder.health_check().await.level, HealthLevel::Healthy);
    }

    #[test]
    fn health_reading_is_asynchronous() {
        let recorder = FrameRecorder::new(2, SafetyClassification::Maintenance);
        assert!(matches!(recorder.read_health(), HealthReading::Pending(_)));
    }
}
