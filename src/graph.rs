//! Build ordering for dependent caches.
//!
//! A cache may read a column another cache generates; the consumer must
//! compile and backfill after its producer, and its target-side triggers
//! must fire after the producer's (encoded as the level in the trigger
//! name). Ordering is a stable Kahn topological sort: ready nodes are
//! taken in input order, so independent caches keep their declaration
//! order and the output is deterministic. A cycle is reported as an
//! explicit error naming every cache still stuck in it.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::TableId;
use crate::error::PgDenormError;

/// One cache as the sequencer sees it.
#[derive(Debug, Clone)]
pub struct CacheNode {
    pub name: String,
    /// Target table the cache writes to.
    pub target: TableId,
    /// Generated column names on the target, winner and helper columns
    /// included.
    pub provides: BTreeSet<String>,
    /// Columns the cache's query reads, per table.
    pub reads: BTreeMap<TableId, BTreeSet<String>>,
}

/// The computed ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOrder {
    /// Indexes into the input slice, producers before consumers.
    pub sequence: Vec<usize>,
    /// Per input index: 0 for caches with no producer, otherwise one more
    /// than the deepest producer's level.
    pub levels: Vec<usize>,
}

/// Topologically order the caches.
pub fn order_caches(nodes: &[CacheNode]) -> Result<BuildOrder, PgDenormError> {
    let n = nodes.len();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];

    for (consumer_idx, consumer) in nodes.iter().enumerate() {
        for (producer_idx, producer) in nodes.iter().enumerate() {
            if producer_idx == consumer_idx {
                continue;
            }
            if consumes(consumer, producer) {
                edges[producer_idx].push(consumer_idx);
                indegree[consumer_idx] += 1;
            }
        }
    }

    let mut sequence = Vec::with_capacity(n);
    let mut levels = vec![0usize; n];
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    while let Some(next) = ready.first().copied() {
        ready.remove(0);
        sequence.push(next);
        for &consumer in &edges[next] {
            levels[consumer] = levels[consumer].max(levels[next] + 1);
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                // Keep input order among newly ready nodes.
                let pos = ready.partition_point(|&i| i < consumer);
                ready.insert(pos, consumer);
            }
        }
    }

    if sequence.len() != n {
        let stuck: Vec<String> = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| nodes[i].name.clone())
            .collect();
        return Err(PgDenormError::CircularDependency(stuck));
    }
    Ok(BuildOrder { sequence, levels })
}

/// Whether `consumer` reads any column `producer` generates.
fn consumes(consumer: &CacheNode, producer: &CacheNode) -> bool {
    consumer
        .reads
        .get(&producer.target)
        .is_some_and(|columns| !columns.is_disjoint(&producer.provides))
}
