//! Request idle-time tracking.
//!
//! The monitor is purely observational: it never delays or rejects a request.
//! Every inbound request moves the last-activity mark; a periodic check adds
//! any gap of at least one interval to the total idle time and logs it.

use crate::metrics;
use orbit_transport::{Method, RequestHook, Uri};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default check interval, which is also the idle threshold.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Tracks the last request time and the accumulated idle time.
///
/// Times are kept as milliseconds since the monitor was created, so both
/// counters are plain atomics shared between request handlers and the
/// periodic check.
#[derive(Debug)]
pub struct ActivityMonitor {
    epoch: Instant,
    interval: Duration,
    last_activity_ms: AtomicU64,
    total_idle_ms: AtomicU64,
}

impl ActivityMonitor {
    /// Create a monitor checking every `interval` (at least 1 ms).
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval: interval.max(Duration::from_millis(1)),
            last_activity_ms: AtomicU64::new(0),
            total_idle_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn millis_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Mark activity now.
    pub fn record_activity(&self) {
        self.record_activity_at(Instant::now());
    }

    /// Mark activity at `at`. The mark never moves backwards.
    pub fn record_activity_at(&self, at: Instant) {
        let ms = self.millis_at(at);
        self.last_activity_ms.fetch_max(ms, Ordering::AcqRel);
    }

    /// Total idle time observed so far.
    #[must_use]
    pub fn total_idle(&self) -> Duration {
        Duration::from_millis(self.total_idle_ms.load(Ordering::Acquire))
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let now = self.millis_at(Instant::now());
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Run the periodic check now.
    pub fn check_idle(&self) -> Option<Duration> {
        self.check_idle_at(Instant::now())
    }

    /// Run the periodic check as of `now`.
    ///
    /// If the gap since the last activity is at least one interval, the gap
    /// is added to the total and the mark is reset to `now`. Returns the gap
    /// that was counted.
    pub fn check_idle_at(&self, now: Instant) -> Option<Duration> {
        let now_ms = self.millis_at(now);
        let interval_ms = self.interval.as_millis() as u64;

        let mut last = self.last_activity_ms.load(Ordering::Acquire);
        loop {
            let gap = now_ms.saturating_sub(last);
            if gap < interval_ms {
                return None;
            }
            // A request landing between the load and the swap wins.
            match self.last_activity_ms.compare_exchange(
                last,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let total = self.total_idle_ms.fetch_add(gap, Ordering::AcqRel) + gap;
                    info!("Service is idle. Total idle time: {} seconds", total as f64 / 1000.0);
                    metrics::record_idle(total);
                    return Some(Duration::from_millis(gap));
                }
                Err(current) => last = current,
            }
        }
    }

    /// Run the check every interval until the returned task is aborted.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + monitor.interval, monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_ms = monitor.interval.as_millis() as u64, "Activity monitor started");
            loop {
                ticker.tick().await;
                monitor.check_idle();
            }
        })
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_INTERVAL)
    }
}

impl RequestHook for ActivityMonitor {
    fn on_request(&self, _method: &Method, _uri: &Uri) {
        self.record_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_gap_shorter_than_interval_is_not_idle() {
        let monitor = ActivityMonitor::new(Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(monitor.check_idle_at(start + Duration::from_secs(59)), None);
        assert_eq!(monitor.total_idle(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_gap_accumulates_and_resets() {
        let monitor = ActivityMonitor::new(Duration::from_secs(60));
        let start = Instant::now();

        let counted = monitor.check_idle_at(start + Duration::from_secs(60));
        assert_eq!(counted, Some(Duration::from_secs(60)));
        assert_eq!(monitor.total_idle(), Duration::from_secs(60));

        // The mark moved to the check; the next gap starts from there.
        assert_eq!(monitor.check_idle_at(start + Duration::from_secs(90)), None);
        let counted = monitor.check_idle_at(start + Duration::from_secs(150));
        assert_eq!(counted, Some(Duration::from_secs(90)));
        assert_eq!(monitor.total_idle(), Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_metric_keeps_partial_seconds() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let monitor = ActivityMonitor::new(Duration::from_secs(60));
        let start = Instant::now();

        ::metrics::with_local_recorder(&recorder, || {
            monitor.check_idle_at(start + Duration::from_millis(60_900));
            monitor.check_idle_at(start + Duration::from_millis(121_300));
        });

        assert_eq!(monitor.total_idle(), Duration::from_millis(121_300));
        assert!(handle
            .render()
            .contains("orbit_idle_milliseconds_total 121300"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_the_gap() {
        let monitor = ActivityMonitor::new(Duration::from_secs(60));
        let start = Instant::now();

        monitor.record_activity_at(start + Duration::from_secs(50));
        assert_eq!(monitor.check_idle_at(start + Duration::from_secs(60)), None);
        assert_eq!(monitor.check_idle_at(start + Duration::from_secs(109)), None);
        assert_eq!(
            monitor.check_idle_at(start + Duration::from_secs(110)),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_mark_never_moves_backwards() {
        let monitor = ActivityMonitor::new(Duration::from_secs(60));
        let start = Instant::now();

        monitor.record_activity_at(start + Duration::from_secs(30));
        monitor.record_activity_at(start + Duration::from_secs(10));
        assert_eq!(monitor.check_idle_at(start + Duration::from_secs(80)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_ticks() {
        let monitor = Arc::new(ActivityMonitor::new(Duration::from_secs(60)));
        let task = monitor.spawn();

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(monitor.total_idle(), Duration::from_secs(60));

        // A request just before the next tick keeps that period busy.
        time::sleep(Duration::from_secs(58)).await;
        monitor.on_request(&Method::GET, &Uri::from_static("/countries"));
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(monitor.total_idle(), Duration::from_secs(60));

        task.abort();
    }
}
