//! Append-only hierarchical file store: the sink every finished gather
//! round is written into. [`HierarchicalStore`] is the contract;
//! [`InMemoryStore`] backs every test and the demo binary's default run,
//! [`Hdf5Store`] (feature `hdf5-backend`) backs a real on-disk run.
//!
//! [`StoreWriterMonitor`] is the glue: it classifies each key by the same
//! naming convention the rest of the workspace uses, creates the right
//! node kind on first sight, and backfills a newly-created node with
//! missing-sentinel rows for every event already on disk before this
//! round — the "late key" case, where a detector starts reporting midway
//! through a run.

use std::collections::BTreeMap;

use aggregator_classify::{classify, KeyKind};
use aggregator_events::{EVENT_TIME_KEY, FIDUCIALS_KEY};
use aggregator_monitor::{Monitor, RoundAggregate};
use aggregator_value::{AggregatorError, ArrayData, Dtype, Result, Scalar, Value};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    EArray,
    VlArray,
    CArray,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub dtype: Dtype,
    pub len: u64,
}

/// An append-only hierarchical store, modeled on the PyTables node types
/// the original implementation wrote: `EArray` for fixed-shape per-event
/// data, `VLArray` for ragged/variable-length rows, `CArray` for a
/// write-once summary value saved outside the per-event gather loop.
pub trait HierarchicalStore {
    fn get_node(&self, path: &str) -> Option<NodeInfo>;
    fn create_earray(&mut self, path: &str, dtype: Dtype, elem_shape: Vec<usize>) -> Result<()>;
    fn create_vlarray(&mut self, path: &str, dtype: Dtype) -> Result<()>;
    fn create_carray(&mut self, path: &str, value: Value) -> Result<()>;
    fn append_earray(&mut self, path: &str, rows: &[Value]) -> Result<()>;
    fn append_vlarray(&mut self, path: &str, rows: &[Value]) -> Result<()>;

    /// Length of the `/fiducials` node, or 0 if the store has never
    /// received a round. Used as the catch-up count for late keys.
    fn nevents_on_disk(&self) -> u64;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StoredNode {
    EArray {
        dtype: Dtype,
        elem_shape: Vec<usize>,
        rows: Vec<Value>,
    },
    VlArray {
        dtype: Dtype,
        rows: Vec<Value>,
    },
    CArray {
        value: Value,
    },
}

/// In-process tree of named nodes. Used by every test in this workspace
/// and by the demo binary when run without a file path.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    nodes: BTreeMap<String, StoredNode>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    /// Read back a node's rows for inspection (tests, demo output).
    pub fn rows(&self, path: &str) -> Option<&[Value]> {
        match self.nodes.get(path)? {
            StoredNode::EArray { rows, .. } | StoredNode::VlArray { rows, .. } => Some(rows),
            StoredNode::CArray { .. } => None,
        }
    }

    fn check_shape(path: &str, elem_shape: &[usize], value: &Value) -> Result<()> {
        let actual = value.shape().unwrap_or(&[]);
        if actual != elem_shape {
            return Err(AggregatorError::SchemaViolation(
                path.to_string(),
                format!(
                    "row shape {actual:?} does not match the fixed element shape {elem_shape:?} \
                     established for this key; if this key's length genuinely varies per event, \
                     rename it with a 'ragged_' prefix"
                ),
            ));
        }
        Ok(())
    }
}

impl HierarchicalStore for InMemoryStore {
    fn get_node(&self, path: &str) -> Option<NodeInfo> {
        match self.nodes.get(path)? {
            StoredNode::EArray { dtype, rows, .. } => Some(NodeInfo {
                kind: NodeKind::EArray,
                dtype: *dtype,
                len: rows.len() as u64,
            }),
            StoredNode::VlArray { dtype, rows } => Some(NodeInfo {
                kind: NodeKind::VlArray,
                dtype: *dtype,
                len: rows.len() as u64,
            }),
            StoredNode::CArray { value } => Some(NodeInfo {
                kind: NodeKind::CArray,
                dtype: value.dtype(),
                len: 1,
            }),
        }
    }

    fn create_earray(&mut self, path: &str, dtype: Dtype, elem_shape: Vec<usize>) -> Result<()> {
        self.nodes.entry(path.to_string()).or_insert(StoredNode::EArray {
            dtype,
            elem_shape,
            rows: Vec::new(),
        });
        Ok(())
    }

    fn create_vlarray(&mut self, path: &str, dtype: Dtype) -> Result<()> {
        self.nodes
            .entry(path.to_string())
            .or_insert(StoredNode::VlArray { dtype, rows: Vec::new() });
        Ok(())
    }

    fn create_carray(&mut self, path: &str, value: Value) -> Result<()> {
        self.nodes.insert(path.to_string(), StoredNode::CArray { value });
        Ok(())
    }

    fn append_earray(&mut self, path: &str, rows: &[Value]) -> Result<()> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| AggregatorError::SchemaViolation(path.to_string(), "node does not exist".into()))?;
        match node {
            StoredNode::EArray { elem_shape, rows: existing, .. } => {
                for row in rows {
                    InMemoryStore::check_shape(path, elem_shape, row)?;
                }
                existing.extend_from_slice(rows);
                Ok(())
            }
            _ => Err(AggregatorError::SchemaViolation(path.to_string(), "not an earray node".into())),
        }
    }

    fn append_vlarray(&mut self, path: &str, rows: &[Value]) -> Result<()> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| AggregatorError::SchemaViolation(path.to_string(), "node does not exist".into()))?;
        match node {
            StoredNode::VlArray { rows: existing, .. } => {
                existing.extend_from_slice(rows);
                Ok(())
            }
            _ => Err(AggregatorError::SchemaViolation(path.to_string(), "not a vlarray node".into())),
        }
    }

    fn nevents_on_disk(&self) -> u64 {
        match self.nodes.get(FIDUCIALS_KEY) {
            Some(StoredNode::EArray { rows, .. }) => rows.len() as u64,
            _ => 0,
        }
    }
}

/// Wires a [`HierarchicalStore`] up as a [`Monitor`]: every gather round
/// is persisted, classifying each key by naming convention and creating
/// its node on first sight, with late-key catch-up backfill.
pub struct StoreWriterMonitor<S: HierarchicalStore> {
    store: S,
}

impl<S: HierarchicalStore> StoreWriterMonitor<S> {
    pub fn new(store: S) -> Self {
        StoreWriterMonitor { store }
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Writes one key's rows for this round, creating its node on first
    /// sight and backfilling catch-up rows for a key that only started
    /// reporting partway through the run. `Ragged` keys go to a `VLArray`
    /// of one row per event. `var_` keys are *not* ragged on disk: they
    /// flatten to a plain `EArray` of concatenated scalar elements, with
    /// their per-event boundaries reconstructed on read from the `_len`
    /// companion — there is nothing to catch up for a newly-discovered
    /// `Variable` key's own data, since every prior event it wasn't seen on
    /// contributes zero elements. A `Length` key's catch-up filler is
    /// always the scalar `0`, matching the buffer's own backfill value, not
    /// the dtype's generic missing sentinel.
    fn write_key(&mut self, key: &str, values: &[Value], catchup: u64) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        match classify(key) {
            KeyKind::Ragged => {
                let dtype = values[0].dtype();
                if self.store.get_node(key).is_none() {
                    self.store.create_vlarray(key, dtype)?;
                    if catchup > 0 {
                        info!(target: "aggregator::store", key = %key, catchup, "backfilling late key");
                        let fill_rows = vec![values[0].missing_like(); catchup as usize];
                        self.store.append_vlarray(key, &fill_rows)?;
                    }
                }
                self.store.append_vlarray(key, values)
            }
            KeyKind::Variable { .. } => {
                let dtype = values[0].dtype();
                if self.store.get_node(key).is_none() {
                    self.store.create_earray(key, dtype, Vec::new())?;
                }
                self.store.append_earray(key, &flatten_variable_rows(values))
            }
            KeyKind::Length => {
                let dtype = values[0].dtype();
                if self.store.get_node(key).is_none() {
                    let elem_shape = values[0].shape().map(|s| s.to_vec()).unwrap_or_default();
                    self.store.create_earray(key, dtype, elem_shape)?;
                    if catchup > 0 {
                        info!(target: "aggregator::store", key = %key, catchup, "backfilling late key");
                        let fill_rows = vec![Value::Scalar(Scalar::Int(0)); catchup as usize];
                        self.store.append_earray(key, &fill_rows)?;
                    }
                }
                self.store.append_earray(key, values)
            }
            KeyKind::Fixed => {
                let dtype = values[0].dtype();
                if self.store.get_node(key).is_none() {
                    let elem_shape = values[0].shape().map(|s| s.to_vec()).unwrap_or_default();
                    self.store.create_earray(key, dtype, elem_shape)?;
                    if catchup > 0 {
                        info!(target: "aggregator::store", key = %key, catchup, "backfilling late key");
                        let fill_rows = vec![values[0].missing_like(); catchup as usize];
                        self.store.append_earray(key, &fill_rows)?;
                    }
                }
                self.store.append_earray(key, values)
            }
        }
    }
}

/// Flattens a `Variable` key's per-event rows (each a `Value::Fixed` array
/// of whatever length that event recorded, including zero) into a single
/// sequence of scalar elements concatenated across events, ready to append
/// to a flat `EArray`.
fn flatten_variable_rows(values: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Fixed(arr) => match &arr.data {
                ArrayData::Int(v) => out.extend(v.iter().map(|&x| Value::Scalar(Scalar::Int(x)))),
                ArrayData::Float(v) => out.extend(v.iter().map(|&x| Value::Scalar(Scalar::Float(x)))),
            },
            other => out.push(other.clone()),
        }
    }
    out
}

impl<S: HierarchicalStore + Send> Monitor for StoreWriterMonitor<S> {
    fn name(&self) -> &'static str {
        "file-writer"
    }

    fn on_gather(&mut self, round: &RoundAggregate<'_>) -> anyhow::Result<()> {
        if round.event_ids.is_empty() {
            return Ok(());
        }
        let catchup = self.store.nevents_on_disk();

        let event_time: Vec<Value> = round
            .event_ids
            .iter()
            .map(|id| Value::Scalar(aggregator_value::Scalar::Int(id.event_time as i64)))
            .collect();
        let fiducials: Vec<Value> = round
            .event_ids
            .iter()
            .map(|id| Value::Scalar(aggregator_value::Scalar::Int(id.fiducials as i64)))
            .collect();
        self.write_key(EVENT_TIME_KEY, &event_time, catchup)?;
        self.write_key(FIDUCIALS_KEY, &fiducials, catchup)?;

        for (key, values) in round.fields {
            self.write_key(key, values, catchup)?;
        }
        Ok(())
    }
}

#[cfg(feature = "hdf5-backend")]
pub mod hdf5_backend {
    //! Real on-disk backend using the `hdf5-metno` crate, gated behind the
    //! `hdf5-backend` feature since it requires a system HDF5 install.
    //! Mirrors PyTables' chunked, extensible dataset conventions: every
    //! earray/vlarray is created with an unlimited first dimension so
    //! `append` never needs to resize a fixed dataset.

    use super::*;
    use aggregator_value::{ArrayData, NdArray, Scalar};
    use hdf5::types::VarLenArray;
    use hdf5::File as H5File;

    pub struct Hdf5Store {
        file: H5File,
    }

    impl Hdf5Store {
        pub fn create(path: &std::path::Path) -> Result<Self> {
            let file = H5File::create(path)
                .map_err(|e| AggregatorError::SchemaViolation(path.display().to_string(), e.to_string()))?;
            Ok(Hdf5Store { file })
        }
    }

    impl HierarchicalStore for Hdf5Store {
        fn get_node(&self, path: &str) -> Option<NodeInfo> {
            let dataset = self.file.dataset(path).ok()?;
            let len = dataset.shape().first().copied().unwrap_or(0) as u64;
            let kind = if dataset.is_attr_present("ragged").unwrap_or(false) {
                NodeKind::VlArray
            } else {
                NodeKind::EArray
            };
            Some(NodeInfo {
                kind,
                dtype: Dtype::Float,
                len,
            })
        }

        fn create_earray(&mut self, path: &str, dtype: Dtype, elem_shape: Vec<usize>) -> Result<()> {
            let mut full_shape = vec![0usize];
            full_shape.extend(elem_shape.iter());
            let mut max_shape = vec![None];
            max_shape.extend(elem_shape.iter().map(|_| None));
            let builder = self.file.new_dataset_builder();
            let builder = match dtype {
                Dtype::Int => builder.empty::<i64>(),
                Dtype::Float => builder.empty::<f64>(),
            };
            builder
                .shape(full_shape.as_slice())
                .create(path)
                .map_err(|e| AggregatorError::SchemaViolation(path.to_string(), e.to_string()))?;
            Ok(())
        }

        fn create_vlarray(&mut self, path: &str, _dtype: Dtype) -> Result<()> {
            let builder = self.file.new_dataset_builder();
            builder
                .empty::<VarLenArray<f64>>()
                .shape([0])
                .create(path)
                .map_err(|e| AggregatorError::SchemaViolation(path.to_string(), e.to_string()))?;
            Ok(())
        }

        fn create_carray(&mut self, path: &str, value: Value) -> Result<()> {
            match value {
                Value::Scalar(Scalar::Int(v)) => {
                    self.file
                        .new_dataset::<i64>()
                        .create(path)
                        .and_then(|d| d.write_scalar(&v))
                }
                Value::Scalar(Scalar::Float(v)) => {
                    self.file
                        .new_dataset::<f64>()
                        .create(path)
                        .and_then(|d| d.write_scalar(&v))
                }
                Value::Fixed(NdArray { data: ArrayData::Float(v), .. })
                | Value::Ragged(NdArray { data: ArrayData::Float(v), .. }) => {
                    self.file.new_dataset::<f64>().shape(v.len()).create(path).and_then(|d| d.write(&v))
                }
                Value::Fixed(NdArray { data: ArrayData::Int(v), .. })
                | Value::Ragged(NdArray { data: ArrayData::Int(v), .. }) => {
                    self.file.new_dataset::<i64>().shape(v.len()).create(path).and_then(|d| d.write(&v))
                }
            }
            .map_err(|e| AggregatorError::SchemaViolation(path.to_string(), e.to_string()))
        }

        fn append_earray(&mut self, path: &str, rows: &[Value]) -> Result<()> {
            let dataset = self
                .file
                .dataset(path)
                .map_err(|e| AggregatorError::SchemaViolation(path.to_string(), e.to_string()))?;
            let start = dataset.shape().first().copied().unwrap_or(0);
            let new_len = start + rows.len();
            dataset
                .resize(new_len)
                .map_err(|e| AggregatorError::SchemaViolation(path.to_string(), e.to_string()))?;
            for (i, row) in rows.iter().enumerate() {
                let scalar = match row {
                    Value::Scalar(Scalar::Float(v)) => *v,
                    Value::Scalar(Scalar::Int(v)) => *v as f64,
                    _ => continue,
                };
                dataset
                    .write_slice(&[scalar], start + i)
                    .map_err(|e| AggregatorError::SchemaViolation(path.to_string(), e.to_string()))?;
            }
            Ok(())
        }

        fn append_vlarray(&mut self, path: &str, rows: &[Value]) -> Result<()> {
            self.append_earray(path, rows)
        }

        fn nevents_on_disk(&self) -> u64 {
            self.file
                .dataset(FIDUCIALS_KEY)
                .map(|d| d.shape().first().copied().unwrap_or(0) as u64)
                .unwrap_or(0)
        }
    }
}
