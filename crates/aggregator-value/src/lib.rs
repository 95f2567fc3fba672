//! Value model shared by every crate in the aggregator workspace: the
//! scalar/array/ragged kinds an event can carry, the missing-data sentinels
//! used to backfill gaps, and the error taxonomy returned at every seam.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel written in place of an integer value that a rank never produced
/// for a given event. Chosen to match the upstream convention rather than
/// `i64::MIN`, so existing downstream analysis code that checks for this
/// exact constant keeps working.
pub const MISSING_INT: i64 = -99_999;

/// Sentinel written in place of a float value that a rank never produced.
/// `NaN` so arithmetic reductions naturally propagate "missing" unless a
/// caller explicitly filters it out.
pub const MISSING_FLOAT: f64 = f64::NAN;

/// Scalar numeric kinds the aggregator understands. Only two dtypes are
/// tracked; anything wider is narrowed by the producer before `event()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    Int,
    Float,
}

/// A single scalar numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn dtype(self) -> Dtype {
        match self {
            Scalar::Int(_) => Dtype::Int,
            Scalar::Float(_) => Dtype::Float,
        }
    }

    pub fn missing(dtype: Dtype) -> Scalar {
        match dtype {
            Dtype::Int => Scalar::Int(MISSING_INT),
            Dtype::Float => Scalar::Float(MISSING_FLOAT),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }
}

/// Flat, row-major backing storage for an n-dimensional array value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl ArrayData {
    pub fn dtype(&self) -> Dtype {
        match self {
            ArrayData::Int(_) => Dtype::Int,
            ArrayData::Float(_) => Dtype::Float,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int(v) => v.len(),
            ArrayData::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build `n` elements of missing-sentinel data in the given dtype.
    pub fn filled_missing(dtype: Dtype, n: usize) -> ArrayData {
        match dtype {
            Dtype::Int => ArrayData::Int(vec![MISSING_INT; n]),
            Dtype::Float => ArrayData::Float(vec![MISSING_FLOAT; n]),
        }
    }
}

/// A dense array value with an explicit shape, row-major over `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub data: ArrayData,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        NdArray { shape, data }
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    /// An array of the same shape, filled with the missing sentinel for
    /// `dtype` — used to backfill a fixed-shape key for ranks/rounds that
    /// never produced it.
    pub fn missing_like(shape: &[usize], dtype: Dtype) -> NdArray {
        let n = shape.iter().product();
        NdArray::new(shape.to_vec(), ArrayData::filled_missing(dtype, n))
    }
}

/// The value an event carries under one key. `Fixed` arrays keep a constant
/// shape across every event once observed; `Ragged` arrays (the
/// `ragged_`-prefixed key convention) may vary in length event to event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Scalar),
    Fixed(NdArray),
    Ragged(NdArray),
}

impl Value {
    pub fn dtype(&self) -> Dtype {
        match self {
            Value::Scalar(s) => s.dtype(),
            Value::Fixed(a) | Value::Ragged(a) => a.dtype(),
        }
    }

    /// `None` for scalars, `Some(shape)` for array-like values.
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Value::Scalar(_) => None,
            Value::Fixed(a) | Value::Ragged(a) => Some(&a.shape),
        }
    }

    /// Produce the "this rank had nothing for this event" placeholder that
    /// matches `self`'s shape and dtype. Ragged values backfill to a
    /// zero-length row, matching the upstream convention of recording an
    /// empty array rather than a dummy row with a fabricated length.
    pub fn missing_like(&self) -> Value {
        match self {
            Value::Scalar(s) => Value::Scalar(Scalar::missing(s.dtype())),
            Value::Fixed(a) => Value::Fixed(NdArray::missing_like(&a.shape, a.dtype())),
            Value::Ragged(a) => {
                let mut shape = a.shape.clone();
                if let Some(first) = shape.first_mut() {
                    *first = 0;
                }
                Value::Ragged(NdArray::new(shape, ArrayData::filled_missing(a.dtype(), 0)))
            }
        }
    }
}

/// Error taxonomy shared by every library crate in the workspace. Library
/// code returns this directly; the facade crate wraps it in `anyhow`.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("key '{0}' violates the aggregator's naming/shape conventions: {1}")]
    SchemaViolation(String, String),

    #[error("collective operation failed: {0}")]
    CollectiveFailure(String),

    #[error("rank {rank} reported dtype {seen:?} for key '{key}', catalog already has {expected:?}")]
    CatalogMismatch {
        key: String,
        rank: i32,
        expected: Dtype,
        seen: Dtype,
    },

    #[error("event source exhausted before break_after bound was reached")]
    SourceExhausted,

    #[error("save() called without a file store configured")]
    SaveWithoutFile,

    #[error("event() called without event_time/fiducials set")]
    MissingTimestamp,

    #[error("reserved key '{0}' may not be set directly by a caller")]
    ReservedKey(String),

    #[error("duplicate key '{0}' for the same fiducial")]
    DuplicateKey(String),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
