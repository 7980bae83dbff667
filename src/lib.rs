//! BNB Smart Chain Fund Flow Tracer
//!
//! Traces fund flow outward from a seed address by following outgoing
//! transfers a bounded number of hops, aggregating them into directed edges
//! and flagging edges that match two heuristics:
//!
//! - **laundering**: high cumulative value moved in many transfers
//! - **poisoning**: near-zero "dust" transfers used for address poisoning
//!
//! # Components
//!
//! 1. **Aggregation** ([`aggregate_graph`]): groups one address's outgoing transfers into classified edges
//! 2. **Traversal** ([`trace`]): depth-bounded, cycle-safe expansion over an injected [`TransferFetcher`]
//! 3. **Fetching** ([`bscscan`]): paginated, rate-limited BscScan client implementing the fetcher
//! 4. **Storage** ([`store`]): Parquet persistence of raw transfers and edges, CSV export
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bsc_flow_tracer::bscscan::BscScanClient;
//! use bsc_flow_tracer::config::TracerConfig;
//! use bsc_flow_tracer::trace::FlowTracer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TracerConfig::load()?;
//!     let client = Arc::new(BscScanClient::new(
//!         config.bscscan_base_url.clone(),
//!         config.bscscan_api_key.clone(),
//!         config.rate_limits.clone(),
//!     )?);
//!
//!     let seed = "0x8894e0a0c962cb723c1976a4421c95949be2d4e3";
//!     let records = client.get_transactions(seed).await?;
//!     let edges = FlowTracer::from_config(client, &config)
//!         .trace(seed, &records)
//!         .await?;
//!     println!("Traced {} edges", edges.len());
//!     Ok(())
//! }
//! ```

pub mod aggregate_graph;
pub mod bscscan;
pub mod config;
pub mod ethereum;
pub mod schemas;
pub mod store;
pub mod trace;

// Re-export commonly used types
pub use config::TracerConfig;
pub use schemas::{Edge, StoredEdge, TraceSummary, TransferKind, TransferRecord};
pub use trace::{FetchError, FlowTracer, MemoryFetcher, TraceError, TransferFetcher};
