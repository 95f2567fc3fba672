//! Standalone demonstration of the full pipeline: `ranks` simulated worker
//! processes run one `Aggregator` each over an in-process `ThreadBus`,
//! sourcing synthetic detector readings and a ragged hit list, gathering at
//! a fixed cadence, and closing onto an in-memory store whose final shape
//! is reported on exit.
//!
//! Not a benchmark and not a stand-in for running under real MPI — `--ranks`
//! only changes how many `std::thread`s simulate ranks, never a process
//! count.

use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use aggregator::{Aggregator, EventRecord, Scalar, Value};
use aggregator_collective::{CollectiveBus, ThreadBus};
use aggregator_monitor::{Monitor, RoundAggregate};
use aggregator_source::{DefaultDetectorCapture, DetectorSource, EventSource, RawEvent, ShardedEvents};
use aggregator_store::InMemoryStore;
use aggregator_value::{ArrayData, NdArray};

#[derive(Parser, Debug)]
#[command(about = "Runs a multi-rank aggregator pipeline over synthetic events")]
struct Args {
    /// Number of simulated ranks (rank 0 is the gather root).
    #[arg(long, default_value_t = 4)]
    ranks: i32,

    /// Total number of events in the shared stream, sharded round-robin
    /// across ranks.
    #[arg(long, default_value_t = 24)]
    events: u64,

    /// How many locally-buffered events trigger a gather round.
    #[arg(long = "gather-interval", default_value_t = 6)]
    gather_interval: u64,

    /// Optional coordinated bound; truncates the shared stream early.
    #[arg(long = "break-after")]
    break_after: Option<u64>,
}

/// Rolls a fresh `spmd-demo.log` in the working directory and returns the
/// `WorkerGuard` the caller must keep alive for the process's lifetime —
/// dropping it stops the non-blocking writer's background flush thread.
fn configure_logging() -> Result<WorkerGuard> {
    let log_dir = Path::new(".");
    let log_path = log_dir.join("spmd-demo.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(&log_path);
    }

    let file_appender = tracing_appender::rolling::never(log_dir, "spmd-demo.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("spmd_demo=info".parse().unwrap()))
        .with_target(true)
        .with_writer(nb_writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(guard)
}

/// Synthetic shared event stream: `total` events at one-nanosecond spacing.
struct SyntheticSource {
    next: u32,
    total: u32,
}

impl EventSource for SyntheticSource {
    fn advance(&mut self) -> Option<RawEvent> {
        if self.next >= self.total {
            return None;
        }
        let raw = RawEvent {
            sec: 1,
            nsec: self.next,
            fiducials: self.next,
        };
        self.next += 1;
        Some(raw)
    }
}

/// Deterministic per-rank detector readings, derived from the fiducial so
/// every rank produces reproducible, rank-distinguishable values without
/// any real acquisition hardware behind it.
struct SyntheticDetectors {
    rank: i32,
}

impl DetectorSource for SyntheticDetectors {
    fn read_scalar(&self, detector: &str, field: &str) -> Option<Scalar> {
        match (detector, field) {
            ("EBeam", "charge") => Some(Scalar::Float(self.rank as f64 + 0.1)),
            ("EBeam", "L3_energy") => Some(Scalar::Float(3500.0 + self.rank as f64)),
            _ => None,
        }
    }

    fn evr_codes(&self, detector: &str) -> Option<Vec<u32>> {
        match detector {
            "evr0" if self.rank % 2 == 0 => Some(vec![140]),
            "evr0" => Some(vec![]),
            _ => None,
        }
    }
}

/// Prints a one-line summary of each finished round to the log, standing in
/// for a live-plotting client or cache pusher in a real deployment.
struct LoggingMonitor;

impl Monitor for LoggingMonitor {
    fn name(&self) -> &'static str {
        "demo-logger"
    }

    fn on_gather(&mut self, round: &RoundAggregate<'_>) -> anyhow::Result<()> {
        info!(
            target: "spmd_demo",
            events = round.event_ids.len(),
            keys = round.fields.len(),
            "round observed by live monitor"
        );
        Ok(())
    }
}

fn run_rank(bus: ThreadBus, total_events: u64, gather_interval: u64, break_after: Option<u64>) -> Result<()> {
    let rank = bus.rank();
    let size = bus.size();
    let is_root = bus.is_root();

    let mut shard = ShardedEvents::new(
        SyntheticSource {
            next: 0,
            total: total_events as u32,
        },
        rank,
        size,
    );
    if let Some(bound) = break_after {
        shard.break_after(bound);
    }

    let mut agg: Aggregator<ThreadBus, InMemoryStore> =
        Aggregator::new(bus, InMemoryStore::new(), "spmd-demo.h5", vec![], vec![])
            .context("failed to construct aggregator")?;
    agg.add_monitor(LoggingMonitor);
    if let Some(bound) = break_after {
        agg.break_after(bound);
    }

    let capture = DefaultDetectorCapture::new().with_ebeam("EBeam").with_evr("evr0", &[140]);
    let detectors = SyntheticDetectors { rank };

    let mut owned = 0u64;
    while let Some(raw) = shard.advance() {
        let mut record = EventRecord::with_timestamp(raw.sec, raw.nsec, raw.fiducials);
        capture.capture(&detectors, &mut record)?;

        // A ragged key: each rank reports a different number of "hits" per
        // event, the scenario `ragged_`-prefixed keys exist for.
        let n_hits = (raw.fiducials as usize % 3) + rank as usize;
        let hits: Vec<i64> = (0..n_hits as i64).collect();
        record.set(
            "ragged_hits/values",
            Value::Ragged(NdArray::new(vec![n_hits], ArrayData::Int(hits))),
        )?;

        agg.event(record)?;
        owned += 1;
        if owned % gather_interval == 0 {
            agg.gather()?;
        }
    }

    if is_root {
        let mut summary = EventRecord::new();
        summary.set("calibration/scale", Value::Scalar(Scalar::Float(1.0)))?;
        agg.save(summary)?;
    }

    let total = agg.sum(Some(owned as f64))?;
    if is_root {
        info!(target: "spmd_demo", total_events_processed = total, "sum reduce across ranks");
    }

    agg.close()?;
    info!(target: "spmd_demo", rank, owned, "rank finished");
    Ok(())
}

fn main() -> Result<()> {
    let _log_guard = configure_logging()?;
    let args = Args::parse();

    info!(
        target: "spmd_demo",
        ranks = args.ranks,
        events = args.events,
        gather_interval = args.gather_interval,
        "starting simulated SPMD run"
    );

    let buses = ThreadBus::new_group(args.ranks);
    let handles: Vec<_> = buses
        .into_iter()
        .map(|bus| {
            let events = args.events;
            let interval = args.gather_interval;
            let break_after = args.break_after;
            thread::spawn(move || run_rank(bus, events, interval, break_after))
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("a rank thread panicked"))??;
    }

    info!(target: "spmd_demo", "run complete");
    Ok(())
}
