use std::sync::Arc;
use std::time::{Duration, Instant};

use rpcflood_chain::ChainClient;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, FloodConfig};
use crate::dispatcher::{rate_limiter, DispatchError, Dispatcher, WorkerExit, WorkerReport};
use crate::id::IdAllocator;
use crate::producer::{RefreshError, StateProducer};
use crate::registry::QueryRegistry;
use crate::reporter::{RequestCounter, ThroughputReporter};
use crate::rng::SharedRng;
use crate::state::{self, ChainState};
use crate::transport::Transport;

/// Failures that end a run. None of them is retried.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chain state refresh failed: {0}")]
    Refresh(#[from] RefreshError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("engine task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub requests: u64,
    pub failures: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn requests_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.requests as f64 / secs
    }
}

/// Wires the state producer, the worker pool and the reporter together.
pub struct Engine<C> {
    config: FloodConfig,
    client: C,
    registry: QueryRegistry,
    transport: Arc<dyn Transport>,
}

impl<C> Engine<C>
where
    C: ChainClient + 'static,
{
    pub fn new(
        config: FloodConfig,
        client: C,
        registry: QueryRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            client,
            registry,
            transport,
        })
    }

    pub fn config(&self) -> &FloodConfig {
        &self.config
    }

    /// Flood the target until `cancel` fires, every worker runs out of input,
    /// or a component fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary, EngineError> {
        let Self {
            config,
            client,
            registry,
            transport,
        } = self;
        let started = Instant::now();

        let rng = match config.seed {
            Some(seed) => SharedRng::from_seed(seed),
            None => SharedRng::from_entropy(),
        };
        let seed_state = ChainState::empty(rng, Arc::new(IdAllocator::new()));
        let (publisher, watcher) = state::channel();

        let registry = match config.max_queries {
            Some(max) => registry.with_budget(max),
            None => registry,
        };
        let counter = Arc::new(RequestCounter::new());
        let mut dispatcher = Dispatcher::new(
            Arc::new(registry),
            transport,
            Arc::clone(&counter),
            config.workers,
        );
        if let Some(rate) = config.rate_limit {
            match rate_limiter(rate, config.rate_limit_burst) {
                Some(limiter) => dispatcher = dispatcher.with_rate_limiter(limiter),
                None => warn!(rate, "ignoring unusable rate limit"),
            }
        }

        info!(
            workers = config.workers,
            rate_limit = ?config.rate_limit,
            max_queries = ?config.max_queries,
            "starting flood"
        );

        let run_cancel = cancel.child_token();
        let producer = StateProducer::new(client, config.max_samples);
        let mut producer_task = tokio::spawn(producer.run(
            seed_state,
            publisher,
            config.refresh_intervals(),
            run_cancel.clone(),
        ));
        let mut dispatch_task = tokio::spawn(dispatcher.run(watcher, run_cancel.clone()));
        let reporter_task = tokio::spawn(
            ThroughputReporter::new(Arc::clone(&counter))
                .run(config.report_interval(), run_cancel.clone()),
        );

        let outcome = tokio::select! {
            joined = &mut dispatch_task => {
                run_cancel.cancel();
                // Workers also stop when the producer dies before publishing,
                // so its failure takes precedence over the pool's result.
                let refreshed = flatten(producer_task.await);
                refreshed.and(flatten(joined).map(log_reports))
            }
            joined = &mut producer_task => match flatten(joined) {
                Ok(()) => flatten(dispatch_task.await).map(log_reports),
                Err(err) => {
                    run_cancel.cancel();
                    match flatten(dispatch_task.await) {
                        Ok(reports) => log_reports(reports),
                        Err(dispatch) => warn!("dispatcher failed while stopping: {dispatch}"),
                    }
                    Err(err)
                }
            },
        };

        run_cancel.cancel();
        reporter_task.await?;

        if let Err(err) = &outcome {
            error!("flood stopped: {err}");
        }
        outcome.map(|()| {
            let summary = RunSummary {
                requests: counter.requests(),
                failures: counter.failures(),
                elapsed: started.elapsed(),
            };
            info!(
                requests = summary.requests,
                failures = summary.failures,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "flood finished"
            );
            summary
        })
    }
}

fn flatten<T, E>(joined: Result<Result<T, E>, JoinError>) -> Result<T, EngineError>
where
    EngineError: From<E>,
{
    Ok(joined??)
}

fn log_reports(reports: Vec<WorkerReport>) {
    let exhausted = reports
        .iter()
        .filter(|report| report.exit == WorkerExit::EndOfInput)
        .count();
    info!(workers = reports.len(), exhausted, "dispatcher stopped");
}
