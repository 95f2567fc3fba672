//! Schema catalog: the set of keys any rank has ever seen, synchronized
//! across all ranks before each gather round so that every rank agrees on
//! which keys exist and can backfill the ones it has nothing for.
//!
//! Mirrors the original `SynchDict` behavior: every rank allgathers its
//! local view, rank 0 resolves the union keeping whichever dtype it saw
//! first for each key (in rank order, so rank 0's own dtype wins whenever
//! rank 0 observed the key at all) and logging a warning on disagreement
//! rather than failing, and the resolved catalog is broadcast back so every
//! rank ends the round with byte-identical state.

use std::collections::BTreeMap;

use aggregator_classify::KeyKind;
use aggregator_collective::CollectiveBus;
use aggregator_value::{Dtype, Result};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub kind: KeyKind,
    pub dtype: Dtype,
}

/// The resolved set of keys every rank agrees exist, kept in sorted order
/// so iteration order never depends on insertion order or rank.
#[derive(Debug, Default, Clone)]
pub struct SchemaCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        SchemaCatalog::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted key iteration — the catalog never exposes insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&CatalogEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Record this rank's local observation of `key`. The first dtype
    /// observed for a key wins; a later disagreement is logged as a warning
    /// and otherwise ignored rather than forcing a promotion.
    pub fn observe(&mut self, key: &str, entry: CatalogEntry) {
        match self.entries.get(key) {
            None => {
                self.entries.insert(key.to_string(), entry);
            }
            Some(existing) if existing.dtype != entry.dtype => {
                warn!(
                    target: "aggregator::catalog",
                    key = %key,
                    kept = ?existing.dtype,
                    seen = ?entry.dtype,
                    "local dtype disagreement for key, keeping first-observed dtype"
                );
            }
            Some(_) => {}
        }
    }

    fn snapshot(&self) -> Vec<(String, CatalogEntry)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn replace_with(&mut self, entries: Vec<(String, CatalogEntry)>) {
        self.entries = entries.into_iter().collect();
    }

    /// Union every rank's local catalog on rank 0, then broadcast the
    /// merged result back to all ranks. `all_gather` returns contributions
    /// in rank order, so resolving in that same order means rank 0's
    /// (the master's) dtype for a key always wins whenever rank 0 observed
    /// it; a later rank's disagreement is logged as a warning and otherwise
    /// dropped rather than forcing a promotion.
    pub fn synchronize<B: CollectiveBus>(&mut self, bus: &B) -> Result<()> {
        let local = self.snapshot();
        let all = bus.all_gather(local)?;

        let merged = if bus.is_root() {
            let mut merged: BTreeMap<String, CatalogEntry> = BTreeMap::new();
            for (rank, per_rank) in all.into_iter().enumerate() {
                for (key, entry) in per_rank {
                    match merged.get(&key) {
                        None => {
                            merged.insert(key, entry);
                        }
                        Some(existing) if existing.dtype != entry.dtype => {
                            warn!(
                                target: "aggregator::catalog",
                                key = %key,
                                rank = rank,
                                kept = ?existing.dtype,
                                seen = ?entry.dtype,
                                "dtype mismatch across ranks, keeping the master's dtype"
                            );
                        }
                        Some(_) => {}
                    }
                }
            }
            Some(merged.into_iter().collect::<Vec<_>>())
        } else {
            None
        };

        let resolved = bus.broadcast(0, merged)?;
        self.replace_with(resolved);
        Ok(())
    }
}
