//! Persistence of raw transfers and traced edges.
//!
//! Raw transfers are kept in one Parquet file and merged on insert: a record
//! whose dedup key is already stored is ignored. Edges are appended to a
//! second Parquet file under an incrementing `edge_id`.

use crate::schemas::{Edge, StoredEdge, TransferKind, TransferRecord};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

// ============================================================================
// Raw transfers
// ============================================================================

/// Write transfers to Parquet, replacing the file
pub fn write_transfers_parquet(records: &[TransferRecord], output_path: &Path) -> Result<(), StoreError> {
    let hashes: Vec<&str> = records.iter().map(|r| r.hash.as_str()).collect();
    let from_addrs: Vec<&str> = records.iter().map(|r| r.from.as_str()).collect();
    let to_addrs: Vec<&str> = records.iter().map(|r| r.to.as_str()).collect();
    let values: Vec<f64> = records.iter().map(|r| r.value).collect();
    let kinds: Vec<String> = records.iter().map(|r| r.kind.to_string()).collect();
    let blocks: Vec<Option<i64>> = records
        .iter()
        .map(|r| r.block_number.map(|b| b as i64))
        .collect();
    let timestamps: Vec<Option<String>> = records
        .iter()
        .map(|r| r.timestamp.map(|t| t.to_rfc3339()))
        .collect();
    let symbols: Vec<Option<&str>> = records.iter().map(|r| r.token_symbol.as_deref()).collect();

    let df = DataFrame::new(vec![
        Column::new("hash".into(), hashes),
        Column::new("from".into(), from_addrs),
        Column::new("to".into(), to_addrs),
        Column::new("value".into(), values),
        Column::new("kind".into(), kinds),
        Column::new("block_number".into(), blocks),
        Column::new("timestamp".into(), timestamps),
        Column::new("token_symbol".into(), symbols),
    ])?;

    // Sort by block, then hash for determinism
    let mut df = df.sort(["block_number", "hash"], SortMultipleOptions::default())?;

    let file = std::fs::File::create(output_path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)?;

    info!("Wrote {} transfers to {:?}", records.len(), output_path);
    Ok(())
}

/// Read transfers from Parquet
pub fn read_transfers_parquet(path: &Path) -> Result<Vec<TransferRecord>, StoreError> {
    let file = std::fs::File::open(path)?;
    let df = ParquetReader::new(file).finish()?;

    let hashes = df.column("hash")?.str()?;
    let from_addrs = df.column("from")?.str()?;
    let to_addrs = df.column("to")?.str()?;
    let values = df.column("value")?.f64()?;
    let kinds = df.column("kind")?.str()?;
    let blocks = df.column("block_number")?.i64()?;
    let timestamps = df.column("timestamp")?.str()?;
    let symbols = df.column("token_symbol")?.str()?;

    let mut result = Vec::with_capacity(df.height());

    for i in 0..df.height() {
        result.push(TransferRecord {
            hash: hashes.get(i).unwrap_or_default().to_string(),
            from: from_addrs.get(i).unwrap_or_default().to_string(),
            to: to_addrs.get(i).unwrap_or_default().to_string(),
            value: values.get(i).unwrap_or(0.0),
            kind: kinds
                .get(i)
                .and_then(|k| k.parse().ok())
                .unwrap_or(TransferKind::Normal),
            block_number: blocks.get(i).and_then(|b| u64::try_from(b).ok()),
            timestamp: timestamps
                .get(i)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            token_symbol: symbols.get(i).map(str::to_string),
        });
    }

    Ok(result)
}

/// Merge `records` into the stored transfers, ignoring ones already present.
///
/// Returns the number of newly stored records.
pub fn insert_transfers(records: &[TransferRecord], path: &Path) -> Result<usize, StoreError> {
    let mut stored = if path.exists() {
        read_transfers_parquet(path)?
    } else {
        Vec::new()
    };

    let mut seen: HashSet<_> = stored.iter().map(TransferRecord::dedup_key).collect();
    let before = stored.len();
    stored.extend(
        records
            .iter()
            .filter(|r| seen.insert(r.dedup_key()))
            .cloned(),
    );
    let inserted = stored.len() - before;

    let ignored = records.len() - inserted;
    if ignored > 0 {
        info!("Ignored {} transfers already stored", ignored);
    }

    write_transfers_parquet(&stored, path)?;
    Ok(inserted)
}

// ============================================================================
// Edges
// ============================================================================

/// Write stored edges to Parquet, replacing the file
pub fn write_edges_parquet(edges: &[StoredEdge], output_path: &Path) -> Result<(), StoreError> {
    let ids: Vec<i64> = edges.iter().map(|e| e.edge_id).collect();
    let srcs: Vec<&str> = edges.iter().map(|e| e.edge.src.as_str()).collect();
    let dsts: Vec<&str> = edges.iter().map(|e| e.edge.dst.as_str()).collect();
    let totals: Vec<f64> = edges.iter().map(|e| e.edge.value_total).collect();
    let counts: Vec<i64> = edges.iter().map(|e| e.edge.tx_count as i64).collect();
    let hops: Vec<i64> = edges.iter().map(|e| i64::from(e.edge.hop)).collect();
    let laundering: Vec<bool> = edges.iter().map(|e| e.edge.laundering).collect();
    let poisoning: Vec<bool> = edges.iter().map(|e| e.edge.poisoning).collect();

    let mut df = DataFrame::new(vec![
        Column::new("edge_id".into(), ids),
        Column::new("src".into(), srcs),
        Column::new("dst".into(), dsts),
        Column::new("value_total".into(), totals),
        Column::new("tx_count".into(), counts),
        Column::new("hop".into(), hops),
        Column::new("laundering".into(), laundering),
        Column::new("poisoning".into(), poisoning),
    ])?;

    let file = std::fs::File::create(output_path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)?;

    info!("Wrote {} edges to {:?}", edges.len(), output_path);
    Ok(())
}

/// Read stored edges from Parquet
pub fn read_edges_parquet(path: &Path) -> Result<Vec<StoredEdge>, StoreError> {
    let file = std::fs::File::open(path)?;
    let df = ParquetReader::new(file).finish()?;

    let ids = df.column("edge_id")?.i64()?;
    let srcs = df.column("src")?.str()?;
    let dsts = df.column("dst")?.str()?;
    let totals = df.column("value_total")?.f64()?;
    let counts = df.column("tx_count")?.i64()?;
    let hops = df.column("hop")?.i64()?;
    let laundering = df.column("laundering")?.bool()?;
    let poisoning = df.column("poisoning")?.bool()?;

    let mut result = Vec::with_capacity(df.height());

    for i in 0..df.height() {
        result.push(StoredEdge {
            edge_id: ids.get(i).unwrap_or(0),
            edge: Edge {
                src: srcs.get(i).unwrap_or_default().to_string(),
                dst: dsts.get(i).unwrap_or_default().to_string(),
                value_total: totals.get(i).unwrap_or(0.0),
                tx_count: counts.get(i).and_then(|c| u64::try_from(c).ok()).unwrap_or(0),
                hop: hops.get(i).and_then(|h| u32::try_from(h).ok()).unwrap_or(0),
                laundering: laundering.get(i).unwrap_or(false),
                poisoning: poisoning.get(i).unwrap_or(false),
            },
        });
    }

    Ok(result)
}

/// Append `edges` to the stored edges, assigning incrementing ids.
///
/// Returns the newly stored edges with their ids.
pub fn insert_edges(edges: &[Edge], path: &Path) -> Result<Vec<StoredEdge>, StoreError> {
    let mut stored = if path.exists() {
        read_edges_parquet(path)?
    } else {
        Vec::new()
    };

    let next_id = stored.iter().map(|e| e.edge_id).max().unwrap_or(0) + 1;
    let inserted: Vec<StoredEdge> = edges
        .iter()
        .cloned()
        .zip(next_id..)
        .map(|(edge, edge_id)| StoredEdge { edge_id, edge })
        .collect();

    stored.extend(inserted.iter().cloned());
    write_edges_parquet(&stored, path)?;

    Ok(inserted)
}

/// Export edges as CSV with the presentation columns
pub fn export_edges_csv<'a>(
    edges: impl IntoIterator<Item = &'a Edge>,
    output_path: &Path,
) -> Result<usize, StoreError> {
    let mut writer = csv::Writer::from_path(output_path)?;
    let mut count = 0usize;
    for edge in edges {
        writer.serialize(edge)?;
        count += 1;
    }
    writer.flush()?;

    if count == 0 {
        warn!("No edges to export; wrote empty CSV to {:?}", output_path);
    } else {
        info!("Exported {} edges to {:?}", count, output_path);
    }
    Ok(count)
}
