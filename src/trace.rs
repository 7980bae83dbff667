//! Multi-hop traversal engine.
//!
//! Starting from a seed address and its transfers, the engine classifies the
//! seed's outgoing edges, then asks the injected [`TransferFetcher`] for the
//! transfers of every newly discovered destination and repeats, up to a hop
//! budget. All discovered edges are merged into one flat list annotated with
//! their hop depth.
//!
//! ## Guarantees
//!
//! - Every address is expanded at most once per traversal. A shared visited
//!   set is consulted before any work for an address and is passed by
//!   reference through the whole traversal, so cycles terminate.
//! - The first path that reaches an address in depth-first order fixes its
//!   hop. A later, deeper or shallower, path to an already expanded address
//!   is ignored.
//! - A failing fetch prunes only that branch. Siblings are still explored and
//!   the traversal itself never fails because of the fetch capability.

use crate::aggregate_graph::aggregate_edges;
use crate::config::{ClassificationConfig, TracerConfig};
use crate::ethereum::canonical_address;
use crate::schemas::{Edge, TransferRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Caller misuse; reported instead of returning an empty result
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("max_hop must be >= 1, got {0}")]
    InvalidMaxHop(u32),

    #[error("Seed address must not be empty")]
    EmptySeed,
}

/// Failure of the fetch capability
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Address unavailable: {0}")]
    Unavailable(String),
}

/// Source of an address's transfer records (normal, internal and token).
///
/// This is the only I/O boundary of the traversal. Implementations own
/// pagination, deduplication, retries and rate limiting.
#[async_trait]
pub trait TransferFetcher: Send + Sync {
    async fn fetch(&self, address: &str) -> Result<Vec<TransferRecord>, FetchError>;
}

/// Traverse outgoing transfers from `seed`, at most `max_hop` levels deep.
///
/// `seed_records` are the seed's own transfers. With `max_hop == 1`, or
/// without a fetcher, only the seed's edges are classified and `fetch` is
/// never called. `visited` is shared with the caller: addresses already in it
/// are not expanded, and every address expanded here is added to it.
pub async fn traverse(
    seed_records: &[TransferRecord],
    seed: &str,
    fetcher: Option<&dyn TransferFetcher>,
    max_hop: u32,
    rules: &ClassificationConfig,
    visited: &mut HashSet<String>,
) -> Result<Vec<Edge>, TraceError> {
    if max_hop < 1 {
        return Err(TraceError::InvalidMaxHop(max_hop));
    }
    let seed = canonical_address(seed);
    if seed.is_empty() {
        return Err(TraceError::EmptySeed);
    }

    if !visited.insert(seed.clone()) {
        debug!("Seed {} already expanded, nothing to do", seed);
        return Ok(Vec::new());
    }

    let mut edges = aggregate_edges(seed_records, &seed, 1, rules);
    debug!("Seed {}: {} direct edges", seed, edges.len());

    let fetcher = match fetcher {
        Some(f) if max_hop > 1 && !edges.is_empty() => f,
        _ => return Ok(edges),
    };

    // Depth-first work stack, pushed in reverse so destinations are expanded
    // in the order the aggregator produced them
    let mut stack: Vec<(String, u32)> = Vec::new();
    push_destinations(&mut stack, &edges, 2);

    let mut fetch_failures = 0usize;

    while let Some((address, hop)) = stack.pop() {
        if visited.contains(&address) {
            debug!("Skipping {} at hop {}: already expanded", address, hop);
            continue;
        }

        let records = match fetcher.fetch(&address).await {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    "Failed to fetch transfers for {} at hop {}: {}; pruning branch",
                    address, hop, e
                );
                fetch_failures += 1;
                continue;
            }
        };

        visited.insert(address.clone());

        let sub_edges = aggregate_edges(&records, &address, hop, rules);
        debug!(
            "Expanded {} at hop {}: {} records, {} edges",
            address,
            hop,
            records.len(),
            sub_edges.len()
        );

        if hop < max_hop {
            push_destinations(&mut stack, &sub_edges, hop + 1);
        }
        edges.extend(sub_edges);
    }

    info!(
        "Traced {} edges from {} (max_hop={}, {} addresses expanded, {} fetch failures)",
        edges.len(),
        seed,
        max_hop,
        visited.len(),
        fetch_failures
    );

    Ok(edges)
}

/// Push each distinct destination of `edges` for expansion at `hop`
fn push_destinations(stack: &mut Vec<(String, u32)>, edges: &[Edge], hop: u32) {
    let mut seen = HashSet::new();
    let distinct: Vec<&str> = edges
        .iter()
        .map(|e| e.dst.as_str())
        .filter(|dst| seen.insert(*dst))
        .collect();

    for dst in distinct.into_iter().rev() {
        stack.push((dst.to_string(), hop));
    }
}

/// Traversal engine bound to a fetch capability and classification policy
pub struct FlowTracer {
    fetcher: Option<Arc<dyn TransferFetcher>>,
    max_hop: u32,
    rules: ClassificationConfig,
}

impl FlowTracer {
    pub fn new(fetcher: Arc<dyn TransferFetcher>, max_hop: u32, rules: ClassificationConfig) -> Self {
        Self {
            fetcher: Some(fetcher),
            max_hop,
            rules,
        }
    }

    /// Create a tracer without a fetcher; only the seed's own edges are produced
    pub fn offline(rules: ClassificationConfig) -> Self {
        Self {
            fetcher: None,
            max_hop: 1,
            rules,
        }
    }

    pub fn from_config(fetcher: Arc<dyn TransferFetcher>, config: &TracerConfig) -> Self {
        Self::new(
            fetcher,
            config.traversal.max_hop,
            config.classification.clone(),
        )
    }

    pub fn with_max_hop(mut self, max_hop: u32) -> Self {
        self.max_hop = max_hop;
        self
    }

    pub fn max_hop(&self) -> u32 {
        self.max_hop
    }

    /// Trace from `seed` with a fresh visited set
    pub async fn trace(
        &self,
        seed: &str,
        seed_records: &[TransferRecord],
    ) -> Result<Vec<Edge>, TraceError> {
        let mut visited = HashSet::new();
        self.trace_with_visited(seed, seed_records, &mut visited)
            .await
    }

    /// Trace from `seed`, sharing `visited` with earlier traversals
    pub async fn trace_with_visited(
        &self,
        seed: &str,
        seed_records: &[TransferRecord],
        visited: &mut HashSet<String>,
    ) -> Result<Vec<Edge>, TraceError> {
        traverse(
            seed_records,
            seed,
            self.fetcher.as_deref(),
            self.max_hop,
            &self.rules,
            visited,
        )
        .await
    }
}

/// In-memory fetch capability.
///
/// Serves scripted per-address responses, records every call, and can be
/// built from a stored transfer set for offline tracing. Unknown addresses
/// yield no transfers.
#[derive(Default)]
pub struct MemoryFetcher {
    responses: HashMap<String, Result<Vec<TransferRecord>, String>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `records` under both endpoints of every transfer
    pub fn from_records(records: &[TransferRecord]) -> Self {
        let mut fetcher = Self::new();
        for record in records {
            let mut endpoints = vec![canonical_address(&record.from)];
            let to = canonical_address(&record.to);
            if !to.is_empty() && to != endpoints[0] {
                endpoints.push(to);
            }
            for endpoint in endpoints.into_iter().filter(|e| !e.is_empty()) {
                if let Ok(list) = fetcher
                    .responses
                    .entry(endpoint)
                    .or_insert_with(|| Ok(Vec::new()))
                {
                    list.push(record.clone());
                }
            }
        }
        fetcher
    }

    pub fn with_records(mut self, address: &str, records: Vec<TransferRecord>) -> Self {
        self.responses
            .insert(canonical_address(address), Ok(records));
        self
    }

    pub fn with_failure(mut self, address: &str, message: &str) -> Self {
        self.responses
            .insert(canonical_address(address), Err(message.to_string()));
        self
    }

    /// Addresses fetched so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn call_count(&self, address: &str) -> usize {
        let key = canonical_address(address);
        self.calls().iter().filter(|c| **c == key).count()
    }
}

#[async_trait]
impl TransferFetcher for MemoryFetcher {
    async fn fetch(&self, address: &str) -> Result<Vec<TransferRecord>, FetchError> {
        let key = canonical_address(address);
        match self.calls.lock() {
            Ok(mut calls) => calls.push(key.clone()),
            Err(poisoned) => poisoned.into_inner().push(key.clone()),
        }

        match self.responses.get(&key) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(message)) => Err(FetchError::Unavailable(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}
