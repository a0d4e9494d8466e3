//! Request accounting and the periodic throughput report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counts dispatch attempts. Written by every worker, read by the reporter.
#[derive(Debug, Default)]
pub struct RequestCounter {
    requests: AtomicU64,
    failures: AtomicU64,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed attempt, successful or not.
    pub fn record(&self, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSample {
    /// Requests completed since the previous sample.
    pub delta: u64,
    pub failed_delta: u64,
    pub total: u64,
}

/// Samples a [`RequestCounter`] and reports the delta between readings.
#[derive(Debug)]
pub struct ThroughputReporter {
    counter: Arc<RequestCounter>,
    previous_requests: u64,
    previous_failures: u64,
}

impl ThroughputReporter {
    pub fn new(counter: Arc<RequestCounter>) -> Self {
        Self {
            counter,
            previous_requests: 0,
            previous_failures: 0,
        }
    }

    pub fn sample(&mut self) -> ThroughputSample {
        let total = self.counter.requests();
        let failures = self.counter.failures();
        let sample = ThroughputSample {
            delta: total.saturating_sub(self.previous_requests),
            failed_delta: failures.saturating_sub(self.previous_failures),
            total,
        };
        self.previous_requests = total;
        self.previous_failures = failures;
        sample
    }

    /// Log one sample per `period` until cancelled.
    pub async fn run(mut self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = self.sample();
                    let per_second = sample.delta as f64 / period.as_secs_f64();
                    info!(
                        req_per_sec = per_second.round() as u64,
                        failed = sample.failed_delta,
                        total = sample.total,
                        "throughput"
                    );
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn concurrent_records_are_not_lost() {
        const WORKERS: u64 = 8;
        const PER_WORKER: u64 = 10_000;

        let counter = Arc::new(RequestCounter::new());
        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for i in 0..PER_WORKER {
                        counter.record(!(w == 0 && i % 2 == 0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.requests(), WORKERS * PER_WORKER);
        assert_eq!(counter.failures(), PER_WORKER / 2);
    }

    #[test]
    fn samples_report_deltas() {
        let counter = Arc::new(RequestCounter::new());
        let mut reporter = ThroughputReporter::new(Arc::clone(&counter));

        for _ in 0..5 {
            counter.record(true);
        }
        counter.record(false);
        assert_eq!(
            reporter.sample(),
            ThroughputSample {
                delta: 6,
                failed_delta: 1,
                total: 6
            }
        );

        counter.record(true);
        assert_eq!(
            reporter.sample(),
            ThroughputSample {
                delta: 1,
                failed_delta: 0,
                total: 7
            }
        );
        assert_eq!(reporter.sample().delta, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let counter = Arc::new(RequestCounter::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            ThroughputReporter::new(counter).run(Duration::from_secs(1), cancel.clone()),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
