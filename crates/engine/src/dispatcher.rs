//! Fixed-size worker pool turning generated queries into outbound requests.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::{QueryError, QueryRegistry};
use crate::reporter::RequestCounter;
use crate::state::StateWatcher;
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker {worker} failed to generate a query: {source}")]
    Query {
        worker: usize,
        #[source]
        source: QueryError,
    },
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    EndOfInput,
    /// The state publisher went away before publishing anything.
    NoState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    /// Requests sent, whatever their outcome.
    pub attempts: u64,
    pub exit: WorkerExit,
}

/// Build the shared token bucket gating sends, or `None` when
/// `per_second` is not a usable rate.
pub fn rate_limiter(per_second: f64, burst: u32) -> Option<DefaultDirectRateLimiter> {
    if !(per_second.is_finite() && per_second > 0.0) {
        return None;
    }
    let period = Duration::try_from_secs_f64(1.0 / per_second).ok()?;
    let quota = Quota::with_period(period)?.allow_burst(NonZeroU32::new(burst.max(1))?);
    Some(RateLimiter::direct(quota))
}

struct Shared {
    registry: Arc<QueryRegistry>,
    transport: Arc<dyn Transport>,
    counter: Arc<RequestCounter>,
    limiter: Option<DefaultDirectRateLimiter>,
}

pub struct Dispatcher {
    registry: Arc<QueryRegistry>,
    transport: Arc<dyn Transport>,
    counter: Arc<RequestCounter>,
    limiter: Option<DefaultDirectRateLimiter>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<QueryRegistry>,
        transport: Arc<dyn Transport>,
        counter: Arc<RequestCounter>,
        workers: usize,
    ) -> Self {
        Self {
            registry,
            transport,
            counter,
            limiter: None,
            workers: workers.max(1),
        }
    }

    /// Gate every send, across all workers, on `limiter`.
    pub fn with_rate_limiter(mut self, limiter: DefaultDirectRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run the pool until every worker stops.
    ///
    /// Workers stop on cancellation or when the registry reports end of
    /// input. A generation failure stops the whole pool and is returned.
    pub async fn run(
        self,
        watcher: StateWatcher,
        cancel: CancellationToken,
    ) -> Result<Vec<WorkerReport>, DispatchError> {
        let workers = self.workers;
        let shared = Arc::new(Shared {
            registry: self.registry,
            transport: self.transport,
            counter: self.counter,
            limiter: self.limiter,
        });
        let pool_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            tasks.spawn(run_worker(
                worker,
                Arc::clone(&shared),
                watcher.clone(),
                pool_cancel.clone(),
            ));
        }
        info!(workers, "dispatcher started");

        let mut reports = Vec::with_capacity(workers);
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(DispatchError::from).and_then(|result| result) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    pool_cancel.cancel();
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        reports.sort_by_key(|report| report.worker);
        Ok(reports)
    }
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    mut watcher: StateWatcher,
    cancel: CancellationToken,
) -> Result<WorkerReport, DispatchError> {
    let mut attempts = 0u64;
    let stopped = |exit: WorkerExit, attempts: u64| -> Result<WorkerReport, DispatchError> {
        Ok(WorkerReport {
            worker,
            attempts,
            exit,
        })
    };

    let mut state = tokio::select! {
        first = watcher.first() => match first {
            Some(state) => state,
            None => return stopped(WorkerExit::NoState, attempts),
        },
        _ = cancel.cancelled() => return stopped(WorkerExit::Cancelled, attempts),
    };

    let mut buf = Vec::with_capacity(512);
    loop {
        if cancel.is_cancelled() {
            return stopped(WorkerExit::Cancelled, attempts);
        }
        if let Some(newer) = watcher.newer() {
            state = newer;
        }

        buf.clear();
        if let Err(err) = shared.registry.query(&mut buf, &state) {
            if err.is_end_of_input() {
                info!(worker, attempts, "query input exhausted, worker stopping");
                return stopped(WorkerExit::EndOfInput, attempts);
            }
            error!(worker, "failed to generate query: {err}");
            return Err(DispatchError::Query {
                worker,
                source: err,
            });
        }

        if let Some(limiter) = &shared.limiter {
            tokio::select! {
                _ = limiter.until_ready() => {}
                _ = cancel.cancelled() => return stopped(WorkerExit::Cancelled, attempts),
            }
        }

        // A send already started is completed and counted, even after cancel.
        let outcome = shared.transport.send(&buf).await;
        let ok = match outcome {
            Ok(status) if (200..300).contains(&status) => true,
            Ok(status) => {
                debug!(worker, status, "target answered with non-success status");
                false
            }
            Err(err) => {
                debug!(worker, "request failed: {err}");
                false
            }
        };
        shared.counter.record(ok);
        attempts += 1;

        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdAllocator;
    use crate::registry::{GenerateError, RandomQuery};
    use crate::rng::SharedRng;
    use crate::state::{self, ChainFacts, ChainState, StatePublisher};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::num::NonZeroU64;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        sent: AtomicU64,
        fail_every: Option<u64>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, body: &[u8]) -> Result<u16, TransportError> {
            assert!(!body.is_empty());
            let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
            match self.fail_every {
                Some(every) if n % every == 0 => Ok(503),
                _ => Ok(200),
            }
        }
    }

    /// Generator that signals end of input on exactly one invocation.
    fn ends_on_call(call: u64, calls: Arc<AtomicU64>) -> RandomQuery {
        RandomQuery::new(
            "eth_blockNumber",
            NonZeroU64::new(1).unwrap(),
            move |out: &mut Vec<u8>, _: &ChainState| -> Result<(), GenerateError> {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == call {
                    return Err(GenerateError::EndOfInput);
                }
                out.extend_from_slice(b"{}\n");
                Ok(())
            },
        )
    }

    fn published() -> (StatePublisher, StateWatcher) {
        let (publisher, watcher) = state::channel();
        publisher.publish(ChainState::empty(
            SharedRng::from_seed(5),
            Arc::new(IdAllocator::new()),
        ));
        (publisher, watcher)
    }

    async fn wait_for_requests(counter: &RequestCounter, at_least: u64) {
        while counter.requests() < at_least {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn worker_stops_after_end_of_input() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut registry = QueryRegistry::new();
        registry.add(ends_on_call(3, Arc::clone(&calls))).unwrap();
        let transport = Arc::new(CountingTransport::default());
        let counter = Arc::new(RequestCounter::new());
        let (_publisher, watcher) = published();

        let reports = Dispatcher::new(
            Arc::new(registry),
            transport.clone(),
            Arc::clone(&counter),
            1,
        )
        .run(watcher, CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(
            reports,
            vec![WorkerReport {
                worker: 0,
                attempts: 2,
                exit: WorkerExit::EndOfInput
            }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.sent.load(Ordering::Relaxed), 2);
        assert_eq!(counter.requests(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhausted_worker_does_not_stop_the_pool() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut registry = QueryRegistry::new();
        registry.add(ends_on_call(2, Arc::clone(&calls))).unwrap();
        let transport = Arc::new(CountingTransport::default());
        let counter = Arc::new(RequestCounter::new());
        let (_publisher, watcher) = published();
        let cancel = CancellationToken::new();

        let pool = tokio::spawn(
            Dispatcher::new(Arc::new(registry), transport.clone(), Arc::clone(&counter), 3)
                .run(watcher, cancel.clone()),
        );
        wait_for_requests(&counter, 200).await;
        cancel.cancel();
        let reports = pool.await.unwrap().unwrap();

        let exhausted: Vec<_> = reports
            .iter()
            .filter(|r| r.exit == WorkerExit::EndOfInput)
            .collect();
        assert_eq!(exhausted.len(), 1);
        assert!(exhausted[0].attempts <= 1);
        assert_eq!(
            reports
                .iter()
                .filter(|r| r.exit == WorkerExit::Cancelled)
                .count(),
            2
        );

        let attempts: u64 = reports.iter().map(|r| r.attempts).sum();
        assert_eq!(attempts, counter.requests());
        assert_eq!(attempts, transport.sent.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn generation_failure_stops_every_worker() {
        let mut registry = QueryRegistry::new();
        registry.add(RandomQuery::new(
            "eth_getBalance",
            NonZeroU64::new(1).unwrap(),
            |_: &mut Vec<u8>, _: &ChainState| -> Result<(), GenerateError> {
                Err(GenerateError::MissingInput("address"))
            },
        )).unwrap();
        let (_publisher, watcher) = published();
        let cancel = CancellationToken::new();

        let result = Dispatcher::new(
            Arc::new(registry),
            Arc::new(CountingTransport::default()),
            Arc::new(RequestCounter::new()),
            4,
        )
        .run(watcher, cancel.clone())
        .await;

        assert!(matches!(result, Err(DispatchError::Query { .. })));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn workers_wait_for_first_state_and_honour_cancel() {
        let mut registry = QueryRegistry::new();
        registry.add(ends_on_call(u64::MAX, Arc::new(AtomicU64::new(0)))).unwrap();
        let (_publisher, watcher) = state::channel();
        let cancel = CancellationToken::new();
        let counter = Arc::new(RequestCounter::new());

        let pool = tokio::spawn(
            Dispatcher::new(
                Arc::new(registry),
                Arc::new(CountingTransport::default()),
                Arc::clone(&counter),
                2,
            )
            .run(watcher, cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.requests(), 0);

        cancel.cancel();
        let reports = pool.await.unwrap().unwrap();
        assert!(reports
            .iter()
            .all(|r| r.exit == WorkerExit::Cancelled && r.attempts == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_workers_pick_up_newer_state() {
        let mut registry = QueryRegistry::new();
        registry
            .add(RandomQuery::new(
                "eth_blockNumber",
                NonZeroU64::new(1).unwrap(),
                |out: &mut Vec<u8>, state: &ChainState| -> Result<(), GenerateError> {
                    if state.block_number() == 2 {
                        return Err(GenerateError::EndOfInput);
                    }
                    out.extend_from_slice(b"{}\n");
                    Ok(())
                },
            ))
            .unwrap();
        let counter = Arc::new(RequestCounter::new());
        let (publisher, watcher) = state::channel();
        let first = publisher.publish(ChainState::empty(
            SharedRng::from_seed(3),
            Arc::new(IdAllocator::new()),
        ));

        let pool = tokio::spawn(
            Dispatcher::new(
                Arc::new(registry),
                Arc::new(CountingTransport::default()),
                Arc::clone(&counter),
                4,
            )
            .run(watcher, CancellationToken::new()),
        );
        wait_for_requests(&counter, 100).await;
        assert!(!pool.is_finished());

        publisher.publish(first.with_facts(ChainFacts {
            block_number: 2,
            ..ChainFacts::default()
        }));
        let reports = tokio::time::timeout(Duration::from_secs(5), pool)
            .await
            .expect("every worker observes the new snapshot")
            .unwrap()
            .unwrap();

        assert_eq!(reports.len(), 4);
        assert!(reports.iter().all(|r| r.exit == WorkerExit::EndOfInput));
    }

    #[tokio::test]
    async fn send_in_flight_at_cancel_is_counted() {
        struct SlowTransport {
            started: tokio::sync::Notify,
        }

        #[async_trait]
        impl Transport for SlowTransport {
            async fn send(&self, _: &[u8]) -> Result<u16, TransportError> {
                self.started.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(200)
            }
        }

        let mut registry = QueryRegistry::new();
        registry
            .add(ends_on_call(u64::MAX, Arc::new(AtomicU64::new(0))))
            .unwrap();
        let transport = Arc::new(SlowTransport {
            started: tokio::sync::Notify::new(),
        });
        let counter = Arc::new(RequestCounter::new());
        let (_publisher, watcher) = published();
        let cancel = CancellationToken::new();

        let pool = tokio::spawn(
            Dispatcher::new(Arc::new(registry), transport.clone(), Arc::clone(&counter), 1)
                .run(watcher, cancel.clone()),
        );
        transport.started.notified().await;
        cancel.cancel();
        let reports = pool.await.unwrap().unwrap();

        assert_eq!(reports[0].exit, WorkerExit::Cancelled);
        assert_eq!(reports[0].attempts, 1);
        assert_eq!(counter.requests(), 1);
    }

    #[tokio::test]
    async fn failed_sends_are_counted() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut registry = QueryRegistry::new();
        registry.add(ends_on_call(11, calls)).unwrap();
        let counter = Arc::new(RequestCounter::new());
        let (_publisher, watcher) = published();

        Dispatcher::new(
            Arc::new(registry),
            Arc::new(CountingTransport {
                sent: AtomicU64::new(0),
                fail_every: Some(2),
            }),
            Arc::clone(&counter),
            1,
        )
        .run(watcher, CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(counter.requests(), 10);
        assert_eq!(counter.failures(), 5);
    }

    #[tokio::test]
    async fn rate_limit_gates_sends() {
        let mut registry = QueryRegistry::new();
        registry.add(ends_on_call(u64::MAX, Arc::new(AtomicU64::new(0)))).unwrap();
        let counter = Arc::new(RequestCounter::new());
        let (_publisher, watcher) = published();
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(CountingTransport::default()),
            Arc::clone(&counter),
            4,
        )
        .with_rate_limiter(rate_limiter(50.0, 1).unwrap());
        let pool = tokio::spawn(dispatcher.run(watcher, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        pool.await.unwrap().unwrap();

        let sent = counter.requests();
        assert!(sent >= 1, "no requests were sent");
        assert!(sent <= 30, "rate limit exceeded: {sent} requests in 300ms");
    }

    #[test]
    fn unusable_rates_build_no_limiter() {
        assert!(rate_limiter(0.0, 10).is_none());
        assert!(rate_limiter(-3.0, 10).is_none());
        assert!(rate_limiter(f64::NAN, 10).is_none());
        assert!(rate_limiter(f64::INFINITY, 10).is_none());
        assert!(rate_limiter(250.0, 10).is_some());
    }
}
