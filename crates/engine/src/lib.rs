//! Load generator core for Ethereum-style JSON-RPC endpoints.
//!
//! A [`StateProducer`] keeps a recent [`ChainState`] snapshot published in a
//! latest-value cell. A pool of workers reads it, asks the weighted
//! [`QueryRegistry`] for a request built from it, and sends that request over
//! a [`Transport`]. A [`ThroughputReporter`] logs the achieved request rate.
//! [`Engine`] wires the pieces together under one cancellation token.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod id;
pub mod producer;
pub mod queries;
pub mod registry;
pub mod reporter;
pub mod rng;
pub mod state;
pub mod transport;

pub use config::{ConfigError, FloodConfig};
pub use dispatcher::{rate_limiter, DispatchError, Dispatcher, WorkerExit, WorkerReport};
pub use engine::{Engine, EngineError, RunSummary};
pub use id::IdAllocator;
pub use producer::{RefreshError, RefreshIntervals, StateProducer};
pub use queries::{install, InstallError, DEFAULT_METHODS};
pub use registry::{
    Generate, GenerateError, QueryError, QueryRegistry, RandomQuery, WeightOverflow,
};
pub use reporter::{RequestCounter, ThroughputReporter, ThroughputSample};
pub use rng::SharedRng;
pub use state::{ChainFacts, ChainState, StatePublisher, StateWatcher};
pub use transport::{HttpTransport, Transport, TransportError};

pub use tokio_util::sync::CancellationToken;
