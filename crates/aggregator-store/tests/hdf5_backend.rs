//! Exercises the real on-disk backend. Only compiled with `--features
//! hdf5-backend`, which requires a system HDF5 install to link against —
//! not part of the default test run.

#![cfg(feature = "hdf5-backend")]

use aggregator_store::hdf5_backend::Hdf5Store;
use aggregator_store::HierarchicalStore;
use aggregator_value::{Dtype, Scalar, Value};

#[test]
fn carray_round_trips_a_scalar_summary_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.h5");
    let mut store = Hdf5Store::create(&path).unwrap();
    store
        .create_carray("calibration/scale", Value::Scalar(Scalar::Float(1.5)))
        .unwrap();
    let node = store.get_node("calibration/scale").unwrap();
    assert_eq!(node.dtype, Dtype::Float);
}

#[test]
fn earray_append_grows_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.h5");
    let mut store = Hdf5Store::create(&path).unwrap();
    store.create_earray("ebeam/charge", Dtype::Float, vec![]).unwrap();
    store
        .append_earray(
            "ebeam/charge",
            &[Value::Scalar(Scalar::Float(1.0)), Value::Scalar(Scalar::Float(2.0))],
        )
        .unwrap();
    let node = store.get_node("ebeam/charge").unwrap();
    assert_eq!(node.len, 2);
}
