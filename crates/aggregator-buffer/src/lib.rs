//! Per-worker buffer: accumulates finished [`EventRecord`]s between gather
//! rounds, backfilling every column an event didn't set with its
//! missing-sentinel shape so every column stays exactly as long as the
//! event history. `Variable`-kind columns are the exception: they hold only
//! the sparse sequence of events that actually set them, with no backfill,
//! and their companion `_len` column is derived automatically from the
//! value's own shape rather than by the caller.

use std::collections::BTreeMap;

use aggregator_classify::{classify, KeyKind};
use aggregator_events::{EventId, EventRecord};
use aggregator_value::{AggregatorError, Dtype, Result, Scalar, Value};

#[derive(Debug, Clone)]
struct ColumnState {
    kind: KeyKind,
    dtype: Dtype,
    values: Vec<Value>,
}

/// The `dlist` of the original implementation: one column per key, each
/// exactly as long as `event_ids`, rebuilt fresh after every gather.
#[derive(Debug, Default)]
pub struct WorkerBuffer {
    event_ids: Vec<EventId>,
    columns: BTreeMap<String, ColumnState>,
}

impl WorkerBuffer {
    pub fn new() -> Self {
        WorkerBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.event_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }

    pub fn event_ids(&self) -> &[EventId] {
        &self.event_ids
    }

    pub fn column_kind(&self, key: &str) -> Option<&KeyKind> {
        self.columns.get(key).map(|c| &c.kind)
    }

    pub fn column_dtype(&self, key: &str) -> Option<Dtype> {
        self.columns.get(key).map(|c| c.dtype)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &KeyKind, &[Value])> {
        self.columns
            .iter()
            .map(|(k, c)| (k.as_str(), &c.kind, c.values.as_slice()))
    }

    /// Append one finished event.
    ///
    /// A `Variable`-kind value's companion `_len` value is derived here from
    /// the value's own first-dimension length, not taken from the caller
    /// (callers may not set a `_len` key directly at all — see
    /// `EventRecord::set`). The per-event backfill that follows is
    /// `KeyKind`-aware: a `Variable` column absent this event is left alone
    /// (it only ever holds the sparse sequence of events that set it), a
    /// `Length` column absent this event backfills with `0`, and every other
    /// column backfills with its own missing-sentinel shape.
    pub fn append(&mut self, record: EventRecord) -> Result<()> {
        let id = record.id.ok_or(AggregatorError::MissingTimestamp)?;
        let mut fields = record.fields;

        let derived_lengths: Vec<(String, i64)> = fields
            .iter()
            .filter_map(|(key, value)| match classify(key) {
                KeyKind::Variable { len_key } => {
                    let len = value.shape().and_then(|s| s.first().copied()).unwrap_or(0) as i64;
                    Some((len_key, len))
                }
                _ => None,
            })
            .collect();
        for (len_key, len) in derived_lengths {
            fields.insert(len_key, Value::Scalar(Scalar::Int(len)));
        }

        let prior_count = self.event_ids.len();
        for (key, column) in self.columns.iter_mut() {
            if fields.contains_key(key) {
                continue;
            }
            match &column.kind {
                KeyKind::Variable { .. } => {}
                KeyKind::Length => column.values.push(Value::Scalar(Scalar::Int(0))),
                KeyKind::Fixed | KeyKind::Ragged => {
                    if let Some(filler) = column.values.last().map(Value::missing_like) {
                        column.values.push(filler);
                    }
                }
            }
        }

        for (key, value) in fields {
            let kind = classify(&key);
            let dtype = value.dtype();
            let column = self.columns.entry(key).or_insert_with(|| match &kind {
                KeyKind::Variable { .. } => ColumnState {
                    kind: kind.clone(),
                    dtype,
                    values: Vec::new(),
                },
                KeyKind::Length => ColumnState {
                    kind: kind.clone(),
                    dtype,
                    values: vec![Value::Scalar(Scalar::Int(0)); prior_count],
                },
                KeyKind::Fixed | KeyKind::Ragged => {
                    let missing = value.missing_like();
                    ColumnState {
                        kind: kind.clone(),
                        dtype,
                        values: vec![missing; prior_count],
                    }
                }
            });
            column.values.push(value);
        }

        self.event_ids.push(id);
        Ok(())
    }

    /// Remove and return one column's accumulated history, leaving the
    /// column registered (so its `KeyKind` survives) but empty.
    pub fn take_column(&mut self, key: &str) -> Option<Vec<Value>> {
        self.columns.get_mut(key).map(|c| std::mem::take(&mut c.values))
    }

    /// Clear every column and the event history after a gather round,
    /// keeping each column's `KeyKind` for future backfill decisions.
    pub fn clear(&mut self) {
        self.event_ids.clear();
        for column in self.columns.values_mut() {
            column.values.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rec(sec: u32, nsec: u32, fid: u32, fields: &[(&str, Value)]) -> EventRecord {
        let mut r = EventRecord::with_timestamp(sec, nsec, fid);
        for (k, v) in fields {
            r.set(*k, v.clone()).unwrap();
        }
        r
    }

    #[test]
    fn late_arriving_key_backfills_prior_events() {
        let mut buf = WorkerBuffer::new();
        buf.append(rec(1, 0, 0, &[("a", Value::Scalar(Scalar::Int(1)))])).unwrap();
        buf.append(rec(1, 1, 1, &[("a", Value::Scalar(Scalar::Int(2))), ("b", Value::Scalar(Scalar::Float(9.0)))]))
            .unwrap();

        let b_col = buf
            .columns()
            .find(|(k, _, _)| *k == "b")
            .map(|(_, _, v)| v.to_vec())
            .unwrap();
        assert_eq!(b_col.len(), 2);
        match &b_col[0] {
            Value::Scalar(Scalar::Float(v)) => assert!(v.is_nan()),
            other => panic!("expected missing float, got {other:?}"),
        }
        assert_eq!(b_col[1], Value::Scalar(Scalar::Float(9.0)));
    }

    #[test]
    fn missing_key_on_later_event_backfills_forward() {
        let mut buf = WorkerBuffer::new();
        buf.append(rec(1, 0, 0, &[("a", Value::Scalar(Scalar::Int(1)))])).unwrap();
        buf.append(rec(1, 1, 1, &[])).unwrap();

        let a_col = buf
            .columns()
            .find(|(k, _, _)| *k == "a")
            .map(|(_, _, v)| v.to_vec())
            .unwrap();
        assert_eq!(a_col[0], Value::Scalar(Scalar::Int(1)));
        assert_eq!(a_col[1], Value::Scalar(Scalar::Int(aggregator_value::MISSING_INT)));
    }

    fn var_row(values: &[i64]) -> Value {
        Value::Fixed(aggregator_value::NdArray::new(
            vec![values.len()],
            aggregator_value::ArrayData::Int(values.to_vec()),
        ))
    }

    #[test]
    fn variable_length_is_derived_not_taken_from_caller() {
        let mut buf = WorkerBuffer::new();
        buf.append(rec(1, 0, 0, &[("det/var_hits", var_row(&[1, 2, 3]))])).unwrap();

        let len_col = buf
            .columns()
            .find(|(k, _, _)| *k == "det/var_hits_len")
            .map(|(_, _, v)| v.to_vec())
            .unwrap();
        assert_eq!(len_col, vec![Value::Scalar(Scalar::Int(3))]);
    }

    #[test]
    fn variable_column_skips_backfill_and_stays_sparse() {
        let mut buf = WorkerBuffer::new();
        buf.append(rec(1, 0, 0, &[("det/var_hits", var_row(&[1, 2]))])).unwrap();
        buf.append(rec(1, 1, 1, &[])).unwrap();
        buf.append(rec(1, 2, 2, &[("det/var_hits", var_row(&[3]))])).unwrap();

        let hits_col = buf
            .columns()
            .find(|(k, _, _)| *k == "det/var_hits")
            .map(|(_, _, v)| v.to_vec())
            .unwrap();
        // No backfill for the event that omitted it: the column stays
        // shorter than the event history.
        assert_eq!(hits_col.len(), 2);
        assert_eq!(hits_col[0], var_row(&[1, 2]));
        assert_eq!(hits_col[1], var_row(&[3]));

        let len_col = buf
            .columns()
            .find(|(k, _, _)| *k == "det/var_hits_len")
            .map(|(_, _, v)| v.to_vec())
            .unwrap();
        assert_eq!(
            len_col,
            vec![
                Value::Scalar(Scalar::Int(2)),
                Value::Scalar(Scalar::Int(0)),
                Value::Scalar(Scalar::Int(1)),
            ]
        );
    }

    #[test]
    fn length_column_late_to_appear_backfills_with_zero_not_missing_sentinel() {
        let mut buf = WorkerBuffer::new();
        buf.append(rec(1, 0, 0, &[])).unwrap();
        buf.append(rec(1, 1, 1, &[("det/var_hits", var_row(&[7]))])).unwrap();

        let len_col = buf
            .columns()
            .find(|(k, _, _)| *k == "det/var_hits_len")
            .map(|(_, _, v)| v.to_vec())
            .unwrap();
        assert_eq!(
            len_col,
            vec![Value::Scalar(Scalar::Int(0)), Value::Scalar(Scalar::Int(1))]
        );
    }

    #[test]
    fn clear_preserves_column_kind() {
        let mut buf = WorkerBuffer::new();
        buf.append(rec(1, 0, 0, &[("ragged_peaks", Value::Ragged(aggregator_value::NdArray::new(
            vec![2],
            aggregator_value::ArrayData::Int(vec![1, 2]),
        )))]))
            .unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.column_kind("ragged_peaks"), Some(&KeyKind::Ragged));
    }
}
