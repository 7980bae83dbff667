//! BNB Smart Chain Fund Flow Tracer CLI
//!
//! Fetches a seed address's transfers, traces outgoing fund flow a bounded
//! number of hops and flags laundering and address-poisoning edges.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bsc_flow_tracer::bscscan::BscScanClient;
use bsc_flow_tracer::config::{PathConfig, TracerConfig};
use bsc_flow_tracer::ethereum::{canonical_address, ValidatedAddress};
use bsc_flow_tracer::schemas::{
    filter_by_date_range, sort_edges, Edge, RunMetadata, TraceSummary, TransferRecord,
};
use bsc_flow_tracer::store::{
    export_edges_csv, insert_edges, insert_transfers, read_edges_parquet, read_transfers_parquet,
};
use bsc_flow_tracer::trace::{FlowTracer, MemoryFetcher};

#[derive(Parser)]
#[command(name = "bsc-flow-tracer")]
#[command(version)]
#[command(about = "Multi-hop fund flow tracer for BNB Smart Chain addresses", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output directory for data files
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a seed address's transfers and trace outgoing fund flow
    Trace {
        /// Seed address (0x-prefixed)
        address: String,

        /// Hop budget (overrides config)
        #[arg(short, long)]
        max_hop: Option<u32>,

        /// Keep seed transfers on or after this date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Keep seed transfers on or before this date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Also export the traced edges as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Trace offline over a stored raw transfers file
    TraceFile {
        /// Seed address
        address: String,

        /// Input transfers file (defaults to the stored raw transfers)
        #[arg(short, long)]
        transfers: Option<PathBuf>,

        /// Hop budget (overrides config)
        #[arg(short, long)]
        max_hop: Option<u32>,

        /// Export the traced edges as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Export stored edges as CSV
    Export {
        /// Input edges file (defaults to the stored edges)
        #[arg(short, long)]
        edges: Option<PathBuf>,

        /// Output CSV path
        #[arg(long, default_value = "edges.csv")]
        output: PathBuf,
    },

    /// Show stored data and record counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => TracerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => TracerConfig::load().context("Failed to load config from environment")?,
    };

    if let Some(dir) = &cli.output_dir {
        config.paths = PathConfig::rooted_at(dir.clone());
    }

    match cli.command {
        Commands::Trace {
            address,
            max_hop,
            from,
            to,
            csv,
        } => {
            apply_max_hop(&mut config, max_hop)?;
            config.ensure_directories()?;
            cmd_trace(&config, &address, from, to, csv.as_deref()).await?;
        }
        Commands::TraceFile {
            address,
            transfers,
            max_hop,
            csv,
        } => {
            apply_max_hop(&mut config, max_hop)?;
            let transfers = transfers.unwrap_or_else(|| config.paths.transfers_file());
            cmd_trace_file(&config, &address, &transfers, csv.as_deref()).await?;
        }
        Commands::Export { edges, output } => {
            let edges = edges.unwrap_or_else(|| config.paths.edges_file());
            cmd_export(&edges, &output)?;
        }
        Commands::Status => {
            cmd_status(&config)?;
        }
    }

    Ok(())
}

fn apply_max_hop(config: &mut TracerConfig, max_hop: Option<u32>) -> Result<()> {
    if let Some(max_hop) = max_hop {
        config.traversal.max_hop = max_hop;
        config.validate()?;
    }
    Ok(())
}

async fn cmd_trace(
    config: &TracerConfig,
    address: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    csv: Option<&Path>,
) -> Result<()> {
    info!("=== Tracing Fund Flow ===");

    let seed = ValidatedAddress::parse(address)
        .with_context(|| format!("Invalid seed address {:?}", address))?;
    info!("Seed: {} (max_hop={})", seed, config.traversal.max_hop);
    let seed = seed.canonical();

    let client = Arc::new(
        BscScanClient::new(
            config.bscscan_base_url.clone(),
            config.bscscan_api_key.clone(),
            config.rate_limits.clone(),
        )
        .context("Failed to build BscScan client")?,
    );

    let records = client
        .get_transactions(&seed)
        .await
        .with_context(|| format!("Failed to fetch transfers for {}", seed))?;

    let fetched = records.len();
    let records = filter_by_date_range(records, from, to);
    if records.len() < fetched {
        info!(
            "Date filter kept {} of {} seed transfers",
            records.len(),
            fetched
        );
    }

    if records.is_empty() {
        warn!("No transactions found for {}", seed);
        return Ok(());
    }

    let inserted = insert_transfers(&records, &config.paths.transfers_file())
        .context("Failed to store raw transfers")?;
    info!("Stored {} new raw transfers", inserted);

    let tracer = FlowTracer::from_config(client, config);
    let mut edges = tracer.trace(&seed, &records).await?;
    sort_edges(&mut edges);

    let stored = insert_edges(&edges, &config.paths.edges_file()).context("Failed to store edges")?;
    info!("Stored {} edges", stored.len());

    let summary = TraceSummary::from_trace(&records, &edges);
    log_summary(&summary, &edges);

    let mut metadata = RunMetadata::new(&seed, config.traversal.max_hop, summary);
    metadata.date_from = from;
    metadata.date_to = to;
    let metadata_path = config.paths.metadata_dir.join("trace_metadata.json");
    metadata.save(&metadata_path)?;
    info!("Metadata saved to {:?}", metadata_path);

    if let Some(path) = csv {
        export_edges_csv(&edges, path).context("Failed to export CSV")?;
    }

    Ok(())
}

async fn cmd_trace_file(
    config: &TracerConfig,
    address: &str,
    transfers_path: &Path,
    csv: Option<&Path>,
) -> Result<()> {
    info!("=== Tracing Stored Transfers ===");

    if !transfers_path.exists() {
        anyhow::bail!(
            "Transfers file not found: {:?}. Run trace first.",
            transfers_path
        );
    }

    let records = read_transfers_parquet(transfers_path).context("Failed to read transfers")?;
    info!("Loaded {} stored transfers", records.len());

    let seed = canonical_address(address);
    let seed_records: Vec<TransferRecord> = records
        .iter()
        .filter(|r| canonical_address(&r.from) == seed || canonical_address(&r.to) == seed)
        .cloned()
        .collect();

    if seed_records.is_empty() {
        warn!("No stored transactions found for {}", seed);
        return Ok(());
    }

    let fetcher = Arc::new(MemoryFetcher::from_records(&records));
    let tracer = FlowTracer::from_config(fetcher, config);
    let mut edges = tracer.trace(&seed, &seed_records).await?;
    sort_edges(&mut edges);

    log_summary(&TraceSummary::from_trace(&seed_records, &edges), &edges);

    if let Some(path) = csv {
        export_edges_csv(&edges, path).context("Failed to export CSV")?;
    }

    Ok(())
}

fn cmd_export(edges_path: &Path, output: &Path) -> Result<()> {
    info!("=== Exporting Edges ===");

    if !edges_path.exists() {
        anyhow::bail!("Edges file not found: {:?}. Run trace first.", edges_path);
    }

    let stored = read_edges_parquet(edges_path).context("Failed to read edges")?;
    export_edges_csv(stored.iter().map(|s| &s.edge), output).context("Failed to export CSV")?;

    Ok(())
}

fn log_summary(summary: &TraceSummary, edges: &[Edge]) {
    info!("Total tx: {}", summary.total_transfers);
    info!("Total value: {}", summary.total_value);
    info!(
        "Edge count: {} (deepest hop {})",
        summary.edge_count, summary.max_hop
    );
    info!(
        "Flagged: {} laundering, {} poisoning",
        summary.laundering_edges, summary.poisoning_edges
    );

    for edge in edges.iter().filter(|e| e.laundering || e.poisoning) {
        let flag = match (edge.laundering, edge.poisoning) {
            (true, true) => "laundering+poisoning",
            (true, false) => "laundering",
            _ => "poisoning",
        };
        info!(
            "  [{}] hop {} {} -> {}: {} over {} tx",
            flag, edge.hop, edge.src, edge.dst, edge.value_total, edge.tx_count
        );
    }
}

fn cmd_status(config: &TracerConfig) -> Result<()> {
    info!("=== Tracer Status ===");
    info!("Data directory: {:?}", config.paths.data_dir);

    let transfers_path = config.paths.transfers_file();
    if transfers_path.exists() {
        let size_kb = std::fs::metadata(&transfers_path)?.len() / 1024;
        let count = read_transfers_parquet(&transfers_path)
            .map(|v| v.len())
            .unwrap_or(0);
        info!("  ✓ Transfers: {} records ({} KB)", count, size_kb);
    } else {
        info!("  ✗ Transfers: not found");
    }

    let edges_path = config.paths.edges_file();
    if edges_path.exists() {
        let size_kb = std::fs::metadata(&edges_path)?.len() / 1024;
        match read_edges_parquet(&edges_path) {
            Ok(edges) => {
                let laundering = edges.iter().filter(|e| e.edge.laundering).count();
                let poisoning = edges.iter().filter(|e| e.edge.poisoning).count();
                info!(
                    "  ✓ Edges: {} records ({} KB), {} laundering, {} poisoning",
                    edges.len(),
                    size_kb,
                    laundering,
                    poisoning
                );
            }
            Err(e) => warn!("  ! Edges: unreadable ({})", e),
        }
    } else {
        info!("  ✗ Edges: not found");
    }

    let metadata_path = config.paths.metadata_dir.join("trace_metadata.json");
    if metadata_path.exists() {
        info!("  ✓ trace_metadata.json");
    } else {
        info!("  ✗ trace_metadata.json");
    }

    Ok(())
}
