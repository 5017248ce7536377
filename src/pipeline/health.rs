//! Health monitoring and metrics for stream pipelines

use crate::assets::DROP_ALERT_PERCENT;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Health metrics for one stream
///
/// Written by the worker thread and the delivery mailbox, read by anyone.
/// All fields use atomic operations for thread-safe access.
pub struct StreamHealth {
    /// Frames received from the decoder
    pub frames_decoded: AtomicU64,

    /// Converted frames handed to the delivery mailbox
    pub frames_published: AtomicU64,

    /// Frames replaced in the mailbox before the consumer took them
    pub frame_drops: AtomicU64,

    /// Times the decoder asked for more input
    pub decoder_stalls: AtomicU64,

    /// Frames skipped because conversion failed
    pub convert_failures: AtomicU64,

    /// Total bytes of converted pixels
    pub bytes_converted: AtomicU64,

    /// Frame buffer (re)allocations
    pub buffer_allocations: AtomicU64,

    /// Worker resource releases, one per completed run
    pub releases: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last converted frame
    pub last_frame_time: AtomicU64,
}

impl StreamHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frames_decoded: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            frame_drops: AtomicU64::new(0),
            decoder_stalls: AtomicU64::new(0),
            convert_failures: AtomicU64::new(0),
            bytes_converted: AtomicU64::new(0),
            buffer_allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a converted frame handed to delivery
    pub fn record_published(&self, size: usize) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_converted.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a dropped frame
    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoder_stall(&self) {
        self.decoder_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_convert_failure(&self) {
        self.convert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation(&self) {
        self.buffer_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn decoder_stalls(&self) -> u64 {
        self.decoder_stalls.load(Ordering::Relaxed)
    }

    pub fn convert_failures(&self) -> u64 {
        self.convert_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_converted(&self) -> u64 {
        self.bytes_converted.load(Ordering::Relaxed)
    }

    pub fn buffer_allocations(&self) -> u64 {
        self.buffer_allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Get the timestamp of the last frame (Unix microseconds)
    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Calculate the frame drop rate as a percentage
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let published = self.frames_published();
        if published == 0 {
            return 0.0;
        }
        (drops as f64 / published as f64) * 100.0
    }

    /// Check if the stream has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_decoded: self.frames_decoded(),
            frames_published: self.frames_published(),
            frame_drops: self.frame_drops(),
            decoder_stalls: self.decoder_stalls(),
            convert_failures: self.convert_failures(),
            bytes_converted: self.bytes_converted(),
            buffer_allocations: self.buffer_allocations(),
            releases: self.releases(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub frames_decoded: u64,
    pub frames_published: u64,
    pub frame_drops: u64,
    pub decoder_stalls: u64,
    pub convert_failures: u64,
    pub bytes_converted: u64,
    pub buffer_allocations: u64,
    pub releases: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} decoded, {} published ({} drops, {:.2}%), {} stalls, {} convert failures, {} bytes, {} allocations",
            self.frames_decoded,
            self.frames_published,
            self.frame_drops,
            self.frame_drop_rate,
            self.decoder_stalls,
            self.convert_failures,
            self.bytes_converted,
            self.buffer_allocations
        )
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// Stream has stalled (no frames for threshold duration)
    Stalled { duration: Duration },

    /// High frame drop rate detected
    HighDropRate { rate: f64 },

    /// Frames were skipped by the converter
    ConvertFailures { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Stream stalled for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High frame drop rate: {:.2}%", rate)
            }
            HealthAlert::ConvertFailures { count } => {
                write!(f, "Convert failures: {}", count)
            }
        }
    }
}

/// Health monitoring service
///
/// Periodically checks stream health and sends alerts tagged with the caller's
/// key when issues are detected. Ends when the alert receiver is dropped.
pub struct HealthMonitor<K> {
    key: K,
    health: Arc<StreamHealth>,
    alert_tx: mpsc::Sender<(K, HealthAlert)>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
}

impl<K: Clone + Send + 'static> HealthMonitor<K> {
    /// Create a new health monitor
    pub fn new(key: K, health: Arc<StreamHealth>, alert_tx: mpsc::Sender<(K, HealthAlert)>) -> Self {
        Self {
            key,
            health,
            alert_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: DROP_ALERT_PERCENT,
        }
    }

    /// Configure the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Configure the stall threshold
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Configure the drop rate threshold
    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// Run one round of checks, returns the alerts raised
    fn check(&self, last_convert_failures: &mut u64) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        if self.health.is_stalled(self.stall_threshold) {
            alerts.push(HealthAlert::Stalled {
                duration: self.stall_threshold,
            });
        }

        let drop_rate = self.health.frame_drop_rate();
        if drop_rate > self.drop_rate_threshold {
            alerts.push(HealthAlert::HighDropRate { rate: drop_rate });
        }

        let convert_failures = self.health.convert_failures();
        if convert_failures > *last_convert_failures {
            alerts.push(HealthAlert::ConvertFailures {
                count: convert_failures - *last_convert_failures,
            });
            *last_convert_failures = convert_failures;
        }

        alerts
    }

    /// Run the health monitor until the receiver goes away
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_convert_failures = 0u64;

        loop {
            interval.tick().await;

            for alert in self.check(&mut last_convert_failures) {
                if self.alert_tx.send((self.key.clone(), alert)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = StreamHealth::new();

        // Record some frames
        health.record_decoded();
        health.record_decoded();
        health.record_published(1000);
        health.record_published(2000);

        assert_eq!(health.frames_decoded(), 2);
        assert_eq!(health.frames_published(), 2);
        assert_eq!(health.bytes_converted(), 3000);
        assert_eq!(health.frame_drops(), 0);

        // Record a drop
        health.record_frame_drop();

        assert_eq!(health.frame_drops(), 1);
        assert_eq!(health.frame_drop_rate(), 50.0);
        assert!(health.summary().to_string().contains("2 published (1 drops"));
    }

    #[test]
    fn test_stall_detection() {
        let health = StreamHealth::new();

        // Should not be stalled immediately
        assert!(!health.is_stalled(Duration::from_secs(1)));

        // Record a frame to update last_frame_time
        health.record_published(1000);

        // Simulate stall by not recording frames
        std::thread::sleep(Duration::from_millis(150));

        // Should be stalled after 150ms if threshold is 100ms
        assert!(health.is_stalled(Duration::from_millis(100)));
    }

    #[test]
    fn test_monitor_reports_new_convert_failures_once() {
        let health = Arc::new(StreamHealth::new());
        let (tx, _rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(0usize, health.clone(), tx)
            .with_stall_threshold(Duration::from_secs(60));
        let mut seen = 0;

        health.record_convert_failure();
        health.record_convert_failure();
        assert_eq!(
            monitor.check(&mut seen),
            vec![HealthAlert::ConvertFailures { count: 2 }]
        );
        assert!(monitor.check(&mut seen).is_empty());
    }

    #[test]
    fn test_monitor_drop_rate_threshold() {
        let health = Arc::new(StreamHealth::new());
        let (tx, _rx) = mpsc::channel(8);
        for _ in 0..4 {
            health.record_published(100);
        }
        health.record_frame_drop();
        let mut seen = 0;

        // 25% of published frames dropped
        let relaxed = HealthMonitor::new(0usize, health.clone(), tx.clone())
            .with_stall_threshold(Duration::from_secs(60));
        assert!(relaxed.check(&mut seen).is_empty());

        let strict = HealthMonitor::new(0usize, health, tx)
            .with_stall_threshold(Duration::from_secs(60))
            .with_drop_rate_threshold(20.0);
        assert_eq!(
            strict.check(&mut seen),
            vec![HealthAlert::HighDropRate { rate: 25.0 }]
        );
    }

    #[tokio::test]
    async fn test_monitor_sends_alerts_with_key() {
        let health = Arc::new(StreamHealth::new());
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new("cam-3", health, tx)
            .with_check_interval(Duration::from_millis(10))
            .with_stall_threshold(Duration::ZERO);

        let task = tokio::spawn(async move { monitor.run().await });
        tokio::time::sleep(Duration::from_millis(2)).await;

        let (key, alert) = rx.recv().await.unwrap();
        assert_eq!(key, "cam-3");
        assert!(matches!(alert, HealthAlert::Stalled { .. }));

        drop(rx);
        task.await.unwrap();
    }
}
