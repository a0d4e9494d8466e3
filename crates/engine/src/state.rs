//! Immutable chain-state snapshots and the latest-value cell that carries
//! them from the refresher to the workers.
//!
//! Every worker reads the cell without draining it, so a published snapshot
//! reaches all workers. Publishing never blocks and never waits on readers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::id::IdAllocator;
use crate::rng::SharedRng;

/// Chain facts sampled from one refresh of the head block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainFacts {
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub transactions: Vec<String>,
    pub addresses: Vec<String>,
    /// Addresses known to hold code: log emitters and created contracts.
    pub contracts: Vec<String>,
    pub topics: Vec<String>,
}

/// Snapshot used by query generators to produce plausible arguments.
///
/// The random source and the id allocator are process-wide; every snapshot
/// derived through [`ChainState::with_facts`] shares them.
#[derive(Debug, Clone)]
pub struct ChainState {
    facts: ChainFacts,
    rng: SharedRng,
    ids: Arc<IdAllocator>,
}

impl ChainState {
    /// State without chain facts. Seeds the first refresh.
    pub fn empty(rng: SharedRng, ids: Arc<IdAllocator>) -> Self {
        Self {
            facts: ChainFacts::default(),
            rng,
            ids,
        }
    }

    /// New snapshot carrying `facts` and this snapshot's shared handles.
    pub fn with_facts(&self, facts: ChainFacts) -> Self {
        Self {
            facts,
            rng: self.rng.clone(),
            ids: Arc::clone(&self.ids),
        }
    }

    pub fn facts(&self) -> &ChainFacts {
        &self.facts
    }

    pub fn rng(&self) -> &SharedRng {
        &self.rng
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    /// Next JSON-RPC request id.
    pub fn next_id(&self) -> u64 {
        self.ids.next()
    }

    pub fn block_number(&self) -> u64 {
        self.facts.block_number
    }

    pub fn block_hash(&self) -> Option<&str> {
        self.facts.block_hash.as_deref()
    }

    pub fn rand_below(&self, bound: u64) -> u64 {
        self.rng.below(bound)
    }

    pub fn random_transaction(&self) -> Option<&str> {
        self.rng.pick(&self.facts.transactions).map(String::as_str)
    }

    pub fn random_address(&self) -> Option<&str> {
        self.rng.pick(&self.facts.addresses).map(String::as_str)
    }

    /// A contract address, falling back to any known address.
    pub fn random_contract(&self) -> Option<&str> {
        self.rng
            .pick(&self.facts.contracts)
            .map(String::as_str)
            .or_else(|| self.random_address())
    }

    pub fn random_topic(&self) -> Option<&str> {
        self.rng.pick(&self.facts.topics).map(String::as_str)
    }
}

/// Create the latest-value cell shared by the refresher and the workers.
pub fn channel() -> (StatePublisher, StateWatcher) {
    let (tx, rx) = watch::channel(None);
    (StatePublisher { tx }, StateWatcher { rx })
}

/// Write side of the state cell.
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<Option<Arc<ChainState>>>,
}

impl StatePublisher {
    /// Replace the current snapshot. Readers holding the previous one keep it
    /// until they look again.
    pub fn publish(&self, state: ChainState) -> Arc<ChainState> {
        let state = Arc::new(state);
        self.tx.send_replace(Some(Arc::clone(&state)));
        state
    }
}

/// Read side of the state cell. Clone one per worker.
#[derive(Debug, Clone)]
pub struct StateWatcher {
    rx: watch::Receiver<Option<Arc<ChainState>>>,
}

impl StateWatcher {
    /// Wait until a snapshot is available.
    ///
    /// Returns `None` if the publisher went away without ever publishing.
    pub async fn first(&mut self) -> Option<Arc<ChainState>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        }
    }

    /// The newest snapshot if one was published since the last look.
    /// Never blocks.
    pub fn newer(&mut self) -> Option<Arc<ChainState>> {
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<Arc<ChainState>> {
        self.rx.borrow().clone()
    }
}
