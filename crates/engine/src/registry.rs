//! Weighted registry of JSON-RPC query generators.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::state::ChainState;

#[derive(Debug, Error)]
pub enum GenerateError {
    /// The generator has nothing left to produce. Stop asking.
    #[error("query generator exhausted its input")]
    EndOfInput,
    #[error("chain state has no {0} to build a query from")]
    MissingInput(&'static str),
    #[error("failed to encode query: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no query generators registered")]
    NoGeneratorsRegistered,
    /// The draw fell outside the cumulative weights. Indicates a bug in
    /// weighted selection, never a runtime condition.
    #[error("weighted selection found no generator for draw {draw} of {total}")]
    SelectionOutOfRange { draw: u64, total: u64 },
    #[error("`{method}` generator failed: {source}")]
    Generate {
        method: String,
        #[source]
        source: GenerateError,
    },
}

/// The summed weights no longer fit in a `u64`.
#[derive(Debug, Error)]
#[error("adding `{method}` with weight {weight} overflows the total weight")]
pub struct WeightOverflow {
    pub method: String,
    pub weight: u64,
}

impl QueryError {
    pub fn is_end_of_input(&self) -> bool {
        matches!(
            self,
            QueryError::Generate {
                source: GenerateError::EndOfInput,
                ..
            }
        )
    }
}

/// Writes one serialized request built from `state` into `out`.
pub trait Generate: Send + Sync {
    fn generate(&self, out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError>;
}

impl<F> Generate for F
where
    F: Fn(&mut Vec<u8>, &ChainState) -> Result<(), GenerateError> + Send + Sync,
{
    fn generate(&self, out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
        self(out, state)
    }
}

/// A named generator with its selection weight.
#[derive(Clone)]
pub struct RandomQuery {
    method: String,
    weight: NonZeroU64,
    generator: Arc<dyn Generate>,
}

impl RandomQuery {
    pub fn new(
        method: impl Into<String>,
        weight: NonZeroU64,
        generator: impl Generate + 'static,
    ) -> Self {
        Self {
            method: method.into(),
            weight,
            generator: Arc::new(generator),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn weight(&self) -> NonZeroU64 {
        self.weight
    }
}

impl fmt::Debug for RandomQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomQuery")
            .field("method", &self.method)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Generators kept sorted ascending by weight.
///
/// Built once during setup, then shared read-only between workers.
#[derive(Debug, Default, Clone)]
pub struct QueryRegistry {
    queries: Vec<RandomQuery>,
    total_weight: u64,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `query` at its weight-ordered position. Equal weights keep
    /// insertion order. The registry is unchanged on overflow.
    pub fn add(&mut self, query: RandomQuery) -> Result<(), WeightOverflow> {
        self.total_weight = self
            .total_weight
            .checked_add(query.weight.get())
            .ok_or_else(|| WeightOverflow {
                method: query.method.clone(),
                weight: query.weight.get(),
            })?;
        let idx = self
            .queries
            .partition_point(|existing| existing.weight <= query.weight);
        self.queries.insert(idx, query);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn queries(&self) -> &[RandomQuery] {
        &self.queries
    }

    /// Pick a generator in proportion to its weight and write its request.
    pub fn query(&self, out: &mut Vec<u8>, state: &ChainState) -> Result<(), QueryError> {
        if self.queries.is_empty() {
            return Err(QueryError::NoGeneratorsRegistered);
        }
        let draw = state.rand_below(self.total_weight);
        let query = self.select(draw)?;
        query
            .generator
            .generate(out, state)
            .map_err(|source| QueryError::Generate {
                method: query.method.clone(),
                source,
            })
    }

    /// Entry covering `draw`: the first whose cumulative weight exceeds it.
    /// Entry `i` thus owns exactly `weight_i` of the draws in
    /// `[0, total_weight)`.
    pub fn select(&self, draw: u64) -> Result<&RandomQuery, QueryError> {
        let mut cumulative = 0u64;
        for query in &self.queries {
            cumulative += query.weight.get();
            if draw < cumulative {
                return Ok(query);
            }
        }
        Err(QueryError::SelectionOutOfRange {
            draw,
            total: self.total_weight,
        })
    }

    /// Cap the total number of generated queries across all generators.
    /// Once `max` queries were produced every generator yields
    /// [`GenerateError::EndOfInput`].
    pub fn with_budget(self, max: u64) -> Self {
        let budget = Arc::new(QueryBudget::new(max));
        let queries = self
            .queries
            .into_iter()
            .map(|query| RandomQuery {
                generator: Arc::new(Budgeted {
                    inner: query.generator,
                    budget: Arc::clone(&budget),
                }),
                ..query
            })
            .collect();
        Self {
            queries,
            total_weight: self.total_weight,
        }
    }
}

#[derive(Debug)]
struct QueryBudget {
    remaining: AtomicU64,
}

impl QueryBudget {
    fn new(max: u64) -> Self {
        Self {
            remaining: AtomicU64::new(max),
        }
    }

    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

struct Budgeted {
    inner: Arc<dyn Generate>,
    budget: Arc<QueryBudget>,
}

impl Generate for Budgeted {
    fn generate(&self, out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
        if !self.budget.take() {
            return Err(GenerateError::EndOfInput);
        }
        self.inner.generate(out, state)
    }
}
