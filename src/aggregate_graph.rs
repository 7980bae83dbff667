//! Edge aggregation and classification.
//!
//! Groups a batch of transfer records by destination for one source address,
//! totals each group and flags it with the laundering and poisoning
//! heuristics. Malformed records degrade to zero value or are skipped; a
//! batch never fails as a whole.

use crate::config::ClassificationConfig;
use crate::ethereum::canonical_address;
use crate::schemas::{Edge, TransferRecord};
use std::collections::HashMap;
use tracing::debug;

/// Aggregate the outgoing transfers of `source` into one edge per destination.
///
/// Addresses are compared and stored in canonical lower-case form. Every
/// produced edge carries `hop`. Edges come out in first-seen destination
/// order; callers needing a stable order sort with
/// [`sort_edges`](crate::schemas::sort_edges).
pub fn aggregate_edges(
    records: &[TransferRecord],
    source: &str,
    hop: u32,
    rules: &ClassificationConfig,
) -> Vec<Edge> {
    let src = canonical_address(source);
    if src.is_empty() || records.is_empty() {
        return Vec::new();
    }

    struct EdgeValue {
        dst: String,
        value_total: f64,
        tx_count: u64,
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<EdgeValue> = Vec::new();
    let mut skipped = 0usize;

    for record in records {
        if canonical_address(&record.from) != src {
            continue;
        }

        let dst = canonical_address(&record.to);
        if dst.is_empty() {
            skipped += 1;
            continue;
        }

        let slot = *index.entry(dst.clone()).or_insert_with(|| {
            groups.push(EdgeValue {
                dst,
                value_total: 0.0,
                tx_count: 0,
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        group.value_total += sanitize_value(record.value);
        group.tx_count += 1;
    }

    if skipped > 0 {
        debug!(
            "Skipped {} outgoing transfers from {} without a recipient",
            skipped, src
        );
    }

    groups
        .into_iter()
        .map(|group| {
            let (laundering, poisoning) = rules.classify(group.value_total, group.tx_count);
            Edge {
                src: src.clone(),
                dst: group.dst,
                value_total: group.value_total,
                tx_count: group.tx_count,
                hop,
                laundering,
                poisoning,
            }
        })
        .collect()
}

/// NaN and infinite amounts count as zero
fn sanitize_value(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
