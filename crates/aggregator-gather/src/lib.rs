//! The gather engine: synchronizes the schema catalog, collects every
//! rank's buffered columns onto the root, and produces one strictly
//! time-ordered round. Persisting that round (with its own late-key
//! backfill-via-prepend logic) is the file writer monitor's job, not the
//! engine's — see `aggregator-store`.

use std::collections::BTreeMap;

use aggregator_buffer::WorkerBuffer;
use aggregator_catalog::{CatalogEntry, SchemaCatalog};
use aggregator_classify::KeyKind;
use aggregator_collective::{CollectiveBus, ReduceOp};
use aggregator_events::EventId;
use aggregator_value::{Dtype, NdArray, Result, Scalar, Value};
use tracing::{debug, info};

/// One finished, time-ordered gather round, root-side only.
pub struct GatheredRound {
    pub event_ids: Vec<EventId>,
    pub fields: BTreeMap<String, Vec<Value>>,
}

impl GatheredRound {
    pub fn len(&self) -> usize {
        self.event_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }
}

/// Drives one rank's side of the collective gather protocol and, on the
/// root, assembles the finished round.
#[derive(Default)]
pub struct GatherEngine {
    catalog: SchemaCatalog,
}

impl GatherEngine {
    pub fn new() -> Self {
        GatherEngine::default()
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Run one full gather round. Every rank must call this in lockstep.
    /// Returns `Some(round)` on the root, `None` on every other rank.
    pub fn gather<B: CollectiveBus>(
        &mut self,
        bus: &B,
        worker: &mut WorkerBuffer,
    ) -> Result<Option<GatheredRound>> {
        for (key, kind, _) in worker.columns() {
            if let Some(dtype) = worker.column_dtype(key) {
                self.catalog.observe(
                    key,
                    CatalogEntry {
                        kind: kind.clone(),
                        dtype,
                    },
                );
            }
        }
        self.catalog.synchronize(bus)?;

        let local_len = worker.len();
        let local_ids = worker.event_ids().to_vec();
        let all_ids = bus.gather(0, local_ids)?;

        let keys: Vec<String> = self.catalog.keys().map(str::to_string).collect();
        let mut gathered: BTreeMap<String, Option<Vec<Option<Vec<Value>>>>> = BTreeMap::new();
        for key in &keys {
            let local_contribution = worker.take_column(key);
            debug!(
                target: "aggregator::gather",
                key = %key,
                rank = bus.rank(),
                present = local_contribution.is_some(),
                "gathering column"
            );
            let per_rank = bus.gather(0, local_contribution)?;
            gathered.insert(key.clone(), per_rank);
        }

        worker.clear();

        if !bus.is_root() {
            return Ok(None);
        }

        let all_ids = all_ids.expect("root did not receive gathered event ids");
        let per_rank_counts: Vec<usize> = all_ids.iter().map(|v| v.len()).collect();
        let mut flat_ids: Vec<EventId> = Vec::new();
        for rank_ids in &all_ids {
            flat_ids.extend_from_slice(rank_ids);
        }

        if flat_ids.is_empty() {
            info!(target: "aggregator::gather", "zero-length round, dropping");
            return Ok(Some(GatheredRound {
                event_ids: Vec::new(),
                fields: BTreeMap::new(),
            }));
        }

        let mut order: Vec<usize> = (0..flat_ids.len()).collect();
        order.sort_by_key(|&i| (flat_ids[i].event_time, flat_ids[i].fiducials));

        let sorted_ids: Vec<EventId> = order.iter().map(|&i| flat_ids[i]).collect();

        let mut fields = BTreeMap::new();
        for key in &keys {
            let entry = self.catalog.get(key).expect("catalog entry for gathered key");
            let per_rank = gathered.remove(key).flatten().unwrap_or_default();
            let flat = if let KeyKind::Variable { len_key } = &entry.kind {
                // The companion length key may sort either side of this key
                // lexically, so look it up without removing it — its own
                // entry in `keys` still needs to be flattened normally too.
                let length_per_rank = gathered.get(len_key).cloned().flatten().unwrap_or_default();
                flatten_variable_column(&per_rank, &per_rank_counts, &length_per_rank, entry.dtype)
            } else {
                flatten_column(&per_rank, &per_rank_counts, &entry.kind, entry.dtype)
            };
            let sorted: Vec<Value> = order.iter().map(|&i| flat[i].clone()).collect();
            fields.insert(key.clone(), sorted);
        }

        info!(
            target: "aggregator::gather",
            events = sorted_ids.len(),
            keys = fields.len(),
            "gather round complete"
        );

        Ok(Some(GatheredRound {
            event_ids: sorted_ids,
            fields,
        }))
    }
}

/// Flattens one key's per-rank contributions (rank-major) into a single
/// event-major `Vec<Value>`, backfilling the ranks that reported `None`
/// (never having observed this key at all) using the shape of whichever
/// rank did report real data this round. A `Length` key's missing fallback
/// is always `0`, matching the per-event backfill the buffer already does;
/// any other kind falls back to its dtype's missing sentinel.
fn flatten_column(per_rank: &[Option<Vec<Value>>], per_rank_counts: &[usize], kind: &KeyKind, dtype: Dtype) -> Vec<Value> {
    let reference = if matches!(kind, KeyKind::Length) {
        Value::Scalar(Scalar::Int(0))
    } else {
        per_rank
            .iter()
            .flatten()
            .find_map(|v| v.first())
            .map(Value::missing_like)
            .unwrap_or(Value::Scalar(Scalar::missing(dtype)))
    };

    let mut out = Vec::new();
    for (rank, contribution) in per_rank.iter().enumerate() {
        let count = per_rank_counts[rank];
        match contribution {
            Some(values) => out.extend(values.iter().cloned()),
            None => out.extend(std::iter::repeat(reference.clone()).take(count)),
        }
    }
    out
}

/// Restores one-row-per-event correspondence for a `Variable`-kind column
/// before the cross-rank sort: per rank, walks that rank's companion length
/// array (one entry per event) and either inserts an empty row wherever the
/// length is `0` or consumes the next row from that rank's sparse sequence
/// of real values, which the buffer never backfilled. A rank that never
/// observed the key at all (no length data either) contributes an empty row
/// for every one of its events.
fn flatten_variable_column(
    per_rank: &[Option<Vec<Value>>],
    per_rank_counts: &[usize],
    length_per_rank: &[Option<Vec<Value>>],
    dtype: Dtype,
) -> Vec<Value> {
    let empty_row = || Value::Fixed(NdArray::missing_like(&[0], dtype));

    let mut out = Vec::new();
    for (rank, &count) in per_rank_counts.iter().enumerate() {
        let lengths = length_per_rank.get(rank).and_then(Option::as_ref);
        let rows = per_rank.get(rank).and_then(Option::as_ref);

        match lengths {
            Some(lengths) => {
                let mut next_row = 0usize;
                for len_value in lengths {
                    let len = match len_value {
                        Value::Scalar(Scalar::Int(n)) => *n,
                        _ => 0,
                    };
                    if len == 0 {
                        out.push(empty_row());
                        continue;
                    }
                    match rows.and_then(|rows| rows.get(next_row)) {
                        Some(row) => {
                            out.push(row.clone());
                            next_row += 1;
                        }
                        None => out.push(empty_row()),
                    }
                }
            }
            None => out.extend(std::iter::repeat_with(empty_row).take(count)),
        }
    }
    out
}

/// Collective reduction with identity-element synthesis: a rank that
/// passes `None` still participates in the collective call, contributing
/// the operator's identity (0 for sum) or a value drawn from the global
/// min/max of the ranks that did contribute, so a missing contributor
/// never wins a `min`/`max` comparison it shouldn't.
pub fn reduce<B: CollectiveBus>(bus: &B, op: ReduceOp, value: Option<f64>) -> Result<Option<f64>> {
    let contributions = bus.all_gather(value)?;
    let present: Vec<f64> = contributions.iter().filter_map(|v| *v).collect();
    let global_min = present.iter().copied().fold(f64::INFINITY, f64::min);
    let global_max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let local = value.unwrap_or(match op {
        ReduceOp::Sum => 0.0,
        ReduceOp::Min => global_max,
        ReduceOp::Max => global_min,
    });
    bus.reduce(0, op, local)
}
