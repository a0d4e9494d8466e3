//! Periodic refresh of the chain-state snapshot from a live node.

use std::collections::HashSet;
use std::time::Duration;

use rpcflood_chain::{Block, ChainClient, ChainError, Receipt};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::state::{ChainFacts, ChainState, StatePublisher};

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The head block carries no transactions; retry after a backoff.
    #[error("block {number} contains no transactions")]
    EmptyBlock { number: u64 },
    #[error("chain client failure: {0}")]
    Chain(#[from] ChainError),
}

/// Wait times of the refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshIntervals {
    pub refresh: Duration,
    pub empty_block_backoff: Duration,
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        Self {
            refresh: Duration::from_secs(15),
            empty_block_backoff: Duration::from_secs(5),
        }
    }
}

pub struct StateProducer<C> {
    client: C,
    max_samples: usize,
}

impl<C: ChainClient> StateProducer<C> {
    pub fn new(client: C, max_samples: usize) -> Self {
        Self {
            client,
            max_samples: max_samples.max(1),
        }
    }

    /// Build a fresh snapshot from the current head block.
    ///
    /// The result shares `previous`'s random source and id allocator.
    pub async fn refresh(&self, previous: &ChainState) -> Result<ChainState, RefreshError> {
        let block = self.client.latest_block().await?;
        if block.transactions.is_empty() {
            return Err(RefreshError::EmptyBlock {
                number: block.number,
            });
        }
        let receipts = self.client.block_receipts(&block).await?;
        Ok(previous.with_facts(sample_facts(&block, &receipts, self.max_samples)))
    }

    /// Refresh until cancelled, publishing each new snapshot.
    ///
    /// Empty blocks are retried after the backoff while the previous snapshot
    /// stays published. Any other failure ends the loop.
    pub async fn run(
        self,
        seed: ChainState,
        publisher: StatePublisher,
        intervals: RefreshIntervals,
        cancel: CancellationToken,
    ) -> Result<(), RefreshError> {
        let mut current = seed;
        loop {
            let refreshed = tokio::select! {
                refreshed = self.refresh(&current) => refreshed,
                _ = cancel.cancelled() => return Ok(()),
            };
            let wait = match refreshed {
                Ok(state) => {
                    info!(
                        block = state.block_number(),
                        transactions = state.facts().transactions.len(),
                        addresses = state.facts().addresses.len(),
                        topics = state.facts().topics.len(),
                        "published new chain state"
                    );
                    publisher.publish(state.clone());
                    current = state;
                    intervals.refresh
                }
                Err(RefreshError::EmptyBlock { number }) => {
                    debug!(block = number, "head block is empty, backing off");
                    intervals.empty_block_backoff
                }
                Err(err) => {
                    error!("failed to refresh chain state: {err}");
                    return Err(err);
                }
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

fn sample_facts(block: &Block, receipts: &[Receipt], max_samples: usize) -> ChainFacts {
    let mut transactions = Sampler::new(max_samples);
    let mut addresses = Sampler::new(max_samples);
    let mut contracts = Sampler::new(max_samples);
    let mut topics = Sampler::new(max_samples);

    for tx in &block.transactions {
        transactions.push(&tx.hash);
        if let Some(from) = &tx.from {
            addresses.push(from);
        }
        if let Some(to) = &tx.to {
            addresses.push(to);
        }
    }
    for receipt in receipts {
        if let Some(created) = &receipt.contract_address {
            contracts.push(created);
        }
        for log in &receipt.logs {
            contracts.push(&log.address);
            for topic in &log.topics {
                topics.push(topic);
            }
        }
    }

    ChainFacts {
        block_number: block.number,
        block_hash: Some(block.hash.clone()),
        transactions: transactions.finish(),
        addresses: addresses.finish(),
        contracts: contracts.finish(),
        topics: topics.finish(),
    }
}

/// Order-preserving, deduplicating, capped collector.
struct Sampler<'a> {
    seen: HashSet<&'a str>,
    items: Vec<String>,
    cap: usize,
}

impl<'a> Sampler<'a> {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
            cap,
        }
    }

    fn push(&mut self, value: &'a str) {
        if self.items.len() < self.cap && self.seen.insert(value) {
            self.items.push(value.to_string());
        }
    }

    fn finish(self) -> Vec<String> {
        self.items
    }
}
