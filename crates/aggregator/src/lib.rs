//! Public facade: the single handle a calling script drives through one
//! event loop. Wires the per-worker buffer, the gather engine, the backing
//! store, and any extra monitors together behind `new`/`event`/`gather`/
//! `save`/`close`, matching the collective lockstep contract every other
//! crate in this workspace was built around — every rank must call
//! `event`/`gather`/`close` the same number of times, in the same order.

use std::collections::BTreeMap;

use aggregator_buffer::WorkerBuffer;
use aggregator_collective::{CollectiveBus, ReduceOp};
use aggregator_gather::GatherEngine;
use aggregator_monitor::{Monitor, MonitorRegistry, RoundAggregate};
use aggregator_store::{HierarchicalStore, StoreWriterMonitor};
use aggregator_value::{AggregatorError, Result};
use tracing::info;

pub use aggregator_events::EventRecord;
pub use aggregator_value::{Dtype, Scalar, Value};

/// A reduced scalar, meaningful on the root rank only — every other rank's
/// call to `sum`/`min`/`max` still participates in the collective (it must,
/// or the bus deadlocks) but its return value carries no information.
pub type ReduceValue = f64;

fn to_anyhow(e: anyhow::Error) -> AggregatorError {
    AggregatorError::CollectiveFailure(e.to_string())
}

/// The aggregator itself: one instance per rank, all driven in lockstep.
pub struct Aggregator<B: CollectiveBus, S: HierarchicalStore + Send + 'static> {
    bus: B,
    filename: String,
    keys_to_save: Vec<String>,
    keys_to_drop: Vec<String>,
    worker: WorkerBuffer,
    engine: GatherEngine,
    writer: StoreWriterMonitor<S>,
    monitors: MonitorRegistry,
    final_gather_done: bool,
    break_after_bound: Option<u64>,
}

impl<B: CollectiveBus, S: HierarchicalStore + Send + 'static> Aggregator<B, S> {
    /// `keys_to_save` and `filters` (a drop-list) mirror the original
    /// constructor's keyword filters: an empty `keys_to_save` keeps every
    /// key not explicitly dropped, a non-empty one keeps only matching
    /// keys (exact or `/`-prefixed ancestor).
    pub fn new(
        bus: B,
        store: S,
        filename: impl Into<String>,
        keys_to_save: Vec<String>,
        filters: Vec<String>,
    ) -> Result<Self> {
        Ok(Aggregator {
            bus,
            filename: filename.into(),
            keys_to_save,
            keys_to_drop: filters,
            worker: WorkerBuffer::new(),
            engine: GatherEngine::new(),
            writer: StoreWriterMonitor::new(store),
            monitors: MonitorRegistry::new(),
            final_gather_done: true,
            break_after_bound: None,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    fn keep_key(&self, key: &str) -> bool {
        if self.keys_to_drop.iter().any(|d| d == key) {
            return false;
        }
        if self.keys_to_save.is_empty() {
            return true;
        }
        self.keys_to_save
            .iter()
            .any(|k| k == key || key.starts_with(&format!("{k}/")))
    }

    /// Buffer one finished event, dropping any field the key filter
    /// excludes before it reaches the worker buffer.
    pub fn event(&mut self, kv: EventRecord) -> Result<()> {
        let id = kv.id.ok_or(AggregatorError::MissingTimestamp)?;
        let mut record = EventRecord {
            id: Some(id),
            fields: BTreeMap::new(),
        };
        for (key, value) in kv.fields {
            if self.keep_key(&key) {
                record.fields.insert(key, value);
            }
        }
        self.worker.append(record)?;
        self.final_gather_done = false;
        Ok(())
    }

    /// Run one full gather round: synchronize the schema catalog, collect
    /// every rank's buffered columns onto the root, sort by event time,
    /// and fan the finished round out to the backing store and every
    /// registered monitor. Every rank must call this together.
    pub fn gather(&mut self) -> Result<()> {
        let round = self.engine.gather(&self.bus, &mut self.worker)?;
        if let Some(round) = round {
            if !round.is_empty() {
                let aggregate = RoundAggregate {
                    event_ids: &round.event_ids,
                    fields: &round.fields,
                };
                self.writer.on_gather(&aggregate).map_err(to_anyhow)?;
                self.monitors.fan_out(&aggregate).map_err(to_anyhow)?;
                info!(target: "aggregator", events = round.len(), "round persisted");
            }
        }
        self.final_gather_done = true;
        Ok(())
    }

    /// Write a one-off summary record outside the per-event loop (a
    /// run-level constant, a normalization factor). Root-only; every other
    /// rank's call is a silent no-op.
    pub fn save(&mut self, kv: EventRecord) -> Result<()> {
        if !self.bus.is_root() {
            return Ok(());
        }
        for (key, value) in kv.fields {
            self.writer.store_mut().create_carray(&key, value)?;
        }
        Ok(())
    }

    pub fn add_monitor(&mut self, monitor: impl Monitor + 'static) {
        self.monitors.register(Box::new(monitor));
    }

    pub fn sum(&self, value: Option<f64>) -> Result<ReduceValue> {
        Ok(aggregator_gather::reduce(&self.bus, ReduceOp::Sum, value)?.unwrap_or(0.0))
    }

    pub fn min(&self, value: Option<f64>) -> Result<ReduceValue> {
        Ok(aggregator_gather::reduce(&self.bus, ReduceOp::Min, value)?.unwrap_or(0.0))
    }

    pub fn max(&self, value: Option<f64>) -> Result<ReduceValue> {
        Ok(aggregator_gather::reduce(&self.bus, ReduceOp::Max, value)?.unwrap_or(0.0))
    }

    /// Records the coordinated global event bound. The aggregator itself
    /// never owns the event source, so this is informational only; the
    /// caller's `aggregator_source::ShardedEvents::break_after` is what
    /// actually truncates the stream with the same bound.
    pub fn break_after(&mut self, n_events: u64) {
        info!(target: "aggregator", n_events, "break_after bound recorded");
        self.break_after_bound = Some(n_events);
    }

    pub fn break_after_bound(&self) -> Option<u64> {
        self.break_after_bound
    }

    /// Flush any buffered-but-ungathered events with one final round, then
    /// release the backing store.
    pub fn close(mut self) -> Result<()> {
        if !self.final_gather_done {
            self.gather()?;
        }
        self.writer.into_store().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_collective::ThreadBus;
    use aggregator_store::{HierarchicalStore, InMemoryStore};
    use pretty_assertions::assert_eq;
    use std::thread;

    fn rec(sec: u32, nsec: u32, fid: u32, fields: &[(&str, Value)]) -> EventRecord {
        let mut r = EventRecord::with_timestamp(sec, nsec, fid);
        for (k, v) in fields {
            r.set(*k, v.clone()).unwrap();
        }
        r
    }

    #[test]
    fn event_gather_round_trips_through_the_store() {
        let buses = ThreadBus::new_group(2);
        let handles: Vec<_> = buses
            .into_iter()
            .map(|bus| {
                thread::spawn(move || {
                    let rank = bus.rank() as u32;
                    let mut agg = Aggregator::new(bus, InMemoryStore::new(), "run.h5", vec![], vec![]).unwrap();
                    agg.event(rec(1, rank, rank, &[("ebeam/charge", Value::Scalar(Scalar::Float(3.0)))]))
                        .unwrap();
                    agg.gather().unwrap();
                    agg.close().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn key_filter_drops_excluded_fields_before_buffering() {
        let buses = ThreadBus::new_group(1);
        let bus = buses.into_iter().next().unwrap();
        let mut agg = Aggregator::new(
            bus,
            InMemoryStore::new(),
            "run.h5",
            vec!["ebeam".to_string()],
            vec![],
        )
        .unwrap();
        agg.event(rec(
            1,
            0,
            0,
            &[
                ("ebeam/charge", Value::Scalar(Scalar::Float(1.0))),
                ("phase_cav/fit_time_1", Value::Scalar(Scalar::Float(2.0))),
            ],
        ))
        .unwrap();
        agg.gather().unwrap();
        let store = agg.writer.store();
        assert!(store.rows("ebeam/charge").is_some());
        assert!(store.rows("phase_cav/fit_time_1").is_none());
        agg.close().unwrap();
    }

    #[test]
    fn save_writes_only_on_root() {
        let buses = ThreadBus::new_group(2);
        let handles: Vec<_> = buses
            .into_iter()
            .map(|bus| {
                thread::spawn(move || {
                    let is_root = bus.is_root();
                    let mut agg = Aggregator::new(bus, InMemoryStore::new(), "run.h5", vec![], vec![]).unwrap();
                    let mut summary = EventRecord::new();
                    summary.set("calibration/scale", Value::Scalar(Scalar::Float(1.5))).unwrap();
                    agg.save(summary).unwrap();
                    let has_node = agg.writer.store().get_node("calibration/scale").is_some();
                    agg.close().unwrap();
                    (is_root, has_node)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (is_root, has_node) in results {
            assert_eq!(has_node, is_root);
        }
    }

    #[test]
    fn close_flushes_pending_events() {
        let buses = ThreadBus::new_group(1);
        let bus = buses.into_iter().next().unwrap();
        let mut agg = Aggregator::new(bus, InMemoryStore::new(), "run.h5", vec![], vec![]).unwrap();
        agg.event(rec(1, 0, 0, &[("a", Value::Scalar(Scalar::Int(1)))])).unwrap();
        agg.close().unwrap();
    }

    fn arange(n: i64) -> Vec<i64> {
        (0..n).collect()
    }

    fn ragged(vals: &[i64]) -> Value {
        Value::Ragged(aggregator_value::NdArray::new(
            vec![vals.len()],
            aggregator_value::ArrayData::Int(vals.to_vec()),
        ))
    }

    fn fixed(vals: &[i64]) -> Value {
        Value::Fixed(aggregator_value::NdArray::new(
            vec![vals.len()],
            aggregator_value::ArrayData::Int(vals.to_vec()),
        ))
    }

    /// spec.md §8 scenario 4: a `ragged_` key always carries a row (empty or
    /// not), while its `var_`/`_len` counterpart is only set on the events
    /// that actually produced data, concatenates flat on disk, and recovers
    /// its per-event lengths (including the `0`s for skipped events) purely
    /// from the buffer's auto-derived length companion.
    #[test]
    fn ragged_and_variable_keys_round_trip_through_the_store() {
        let size = 2u32;
        let buses = ThreadBus::new_group(size as i32);
        let handles: Vec<_> = buses
            .into_iter()
            .map(|bus| {
                thread::spawn(move || {
                    let rank = bus.rank() as u32;
                    let mut agg = Aggregator::new(bus, InMemoryStore::new(), "run.h5", vec![], vec![]).unwrap();
                    for nevt in 0..2u32 {
                        let x = rank as i64 + size as i64 * nevt as i64;
                        let nsec = nevt * size + rank;
                        let mut r = EventRecord::with_timestamp(1, nsec, nsec);
                        let values = arange(x);
                        r.set("ragged_dset", ragged(&values)).unwrap();
                        if x % 3 != 0 {
                            r.set("var_dset", fixed(&values)).unwrap();
                        }
                        agg.event(r).unwrap();
                    }
                    agg.gather().unwrap();
                    let rows = if rank == 0 {
                        let store = agg.writer.store();
                        Some((
                            store.rows("ragged_dset").unwrap().to_vec(),
                            store.rows("var_dset").unwrap().to_vec(),
                            store.rows("var_dset_len").unwrap().to_vec(),
                        ))
                    } else {
                        None
                    };
                    agg.close().unwrap();
                    rows
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (ragged_rows, var_rows, len_rows) = results.into_iter().flatten().next().unwrap();

        assert_eq!(ragged_rows, vec![ragged(&[]), ragged(&[0]), ragged(&[0, 1]), ragged(&[])]);
        assert_eq!(
            var_rows,
            vec![
                Value::Scalar(Scalar::Int(0)),
                Value::Scalar(Scalar::Int(0)),
                Value::Scalar(Scalar::Int(1)),
            ]
        );
        assert_eq!(
            len_rows,
            vec![
                Value::Scalar(Scalar::Int(0)),
                Value::Scalar(Scalar::Int(1)),
                Value::Scalar(Scalar::Int(2)),
                Value::Scalar(Scalar::Int(0)),
            ]
        );
    }

    #[test]
    fn sum_reduces_across_ranks() {
        let buses = ThreadBus::new_group(3);
        let handles: Vec<_> = buses
            .into_iter()
            .map(|bus| {
                thread::spawn(move || {
                    let agg = Aggregator::new(bus, InMemoryStore::new(), "run.h5", vec![], vec![]).unwrap();
                    agg.sum(Some(2.0)).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], 6.0);
    }
}
