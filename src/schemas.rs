//! Data schemas for the flow tracer.
//!
//! This module is the canonical definition of the records flowing through the
//! tracer: transfer records coming out of the fetch capability, the edges the
//! traversal produces, and the metadata persisted alongside a run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

// ============================================================================
// PART A: Transfer Schema
// ============================================================================

/// Source category of a transfer, one per explorer action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// Top-level transaction (`txlist`)
    Normal,
    /// Contract-internal value transfer (`txlistinternal`)
    Internal,
    /// BEP-20 token transfer (`tokentx`)
    Token,
}

impl TransferKind {
    pub const ALL: [TransferKind; 3] = [Self::Normal, Self::Internal, Self::Token];

    /// Explorer API action that lists this kind of transfer
    pub fn action(&self) -> &'static str {
        match self {
            TransferKind::Normal => "txlist",
            TransferKind::Internal => "txlistinternal",
            TransferKind::Token => "tokentx",
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::Normal => write!(f, "normal"),
            TransferKind::Internal => write!(f, "internal"),
            TransferKind::Token => write!(f, "token"),
        }
    }
}

impl std::str::FromStr for TransferKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TransferKind::Normal),
            "internal" => Ok(TransferKind::Internal),
            "token" => Ok(TransferKind::Token),
            other => Err(format!("unknown transfer kind: {other}")),
        }
    }
}

/// One ledger transfer as supplied by the fetch capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    /// Transaction hash
    pub hash: String,

    /// Sender address, as reported by the source
    pub from: String,

    /// Recipient address; empty for contract creations
    pub to: String,

    /// Amount in native units (BNB, or whole tokens for token transfers)
    pub value: f64,

    pub kind: TransferKind,

    pub block_number: Option<u64>,

    /// Block timestamp (UTC)
    pub timestamp: Option<DateTime<Utc>>,

    pub token_symbol: Option<String>,
}

impl TransferRecord {
    /// Minimal record; optional metadata is left empty
    pub fn new(
        hash: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            hash: hash.into(),
            from: from.into(),
            to: to.into(),
            value,
            kind: TransferKind::Normal,
            block_number: None,
            timestamp: None,
            token_symbol: None,
        }
    }

    /// Key under which duplicate records collapse.
    ///
    /// A token transfer shares its hash with the enclosing transaction, so the
    /// kind and both endpoints take part in the key.
    pub fn dedup_key(&self) -> (TransferKind, String, String, String) {
        (
            self.kind,
            self.hash.to_lowercase(),
            self.from.to_lowercase(),
            self.to.to_lowercase(),
        )
    }
}

/// Keep records whose timestamp falls within `[start, end]` (whole days, UTC).
///
/// With no bounds every record is kept. With any bound, records lacking a
/// timestamp are dropped.
pub fn filter_by_date_range(
    records: Vec<TransferRecord>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<TransferRecord> {
    if start.is_none() && end.is_none() {
        return records;
    }

    records
        .into_iter()
        .filter(|record| {
            let Some(date) = record.timestamp.map(|ts| ts.date_naive()) else {
                return false;
            };
            start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
        })
        .collect()
}

// ============================================================================
// PART B: Edge Schema (Traversal Output)
// ============================================================================

/// Aggregated directed edge between two addresses at one hop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// Source address (canonical lower-case)
    pub src: String,

    /// Destination address (canonical lower-case)
    pub dst: String,

    /// Sum of transfer values from `src` to `dst`, native units
    pub value_total: f64,

    /// Number of transfers from `src` to `dst`
    pub tx_count: u64,

    /// Depth from the seed; 1 for the seed's own transfers
    pub hop: u32,

    /// High cumulative value moved in many transfers
    pub laundering: bool,

    /// Near-zero dust transfer
    pub poisoning: bool,
}

/// Sort edges by `(src, dst, hop)` for stable presentation
pub fn sort_edges(edges: &mut [Edge]) {
    edges.sort_by(|a, b| (&a.src, &a.dst, a.hop).cmp(&(&b.src, &b.dst, b.hop)));
}

/// Edge as persisted, with its storage identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEdge {
    pub edge_id: i64,

    #[serde(flatten)]
    pub edge: Edge,
}

// ============================================================================
// PART C: Summary Metrics
// ============================================================================

/// Headline numbers for one trace run
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TraceSummary {
    /// Transfers of the seed address that entered the trace
    pub total_transfers: usize,

    /// Sum of the seed transfers' values, native units
    pub total_value: f64,

    pub edge_count: usize,
    pub laundering_edges: usize,
    pub poisoning_edges: usize,

    /// Deepest hop present in the edge set (0 when empty)
    pub max_hop: u32,
}

impl TraceSummary {
    pub fn from_trace(records: &[TransferRecord], edges: &[Edge]) -> Self {
        Self {
            total_transfers: records.len(),
            total_value: records
                .iter()
                .map(|r| r.value)
                .filter(|v| v.is_finite())
                .sum(),
            edge_count: edges.len(),
            laundering_edges: edges.iter().filter(|e| e.laundering).count(),
            poisoning_edges: edges.iter().filter(|e| e.poisoning).count(),
            max_hop: edges.iter().map(|e| e.hop).max().unwrap_or(0),
        }
    }
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Run metadata for reproducibility and auditing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Schema version used
    pub schema_version: String,

    /// Run timestamp
    pub run_timestamp: DateTime<Utc>,

    /// Seed address (canonical)
    pub seed: String,

    pub max_hop: u32,

    /// Date filter applied to the seed transfers
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,

    pub summary: TraceSummary,

    /// Tool version
    pub tracer_version: String,
}

impl RunMetadata {
    pub fn new(seed: &str, max_hop: u32, summary: TraceSummary) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_timestamp: Utc::now(),
            seed: seed.to_string(),
            max_hop,
            date_from: None,
            date_to: None,
            summary,
            tracer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
