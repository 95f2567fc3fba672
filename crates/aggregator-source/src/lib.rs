//! Event sourcing contracts: the [`EventSource`] trait a real acquisition
//! library implements, the round-robin sharding that turns a shared event
//! stream into one rank's share of it, and default-detector capture for
//! the handful of machine-parameter detectors every experiment records.
//!
//! The acquisition library itself, and the concrete detector decoding it
//! does, are out of scope here — only the contracts and the sharding
//! arithmetic belong to the aggregator.

use aggregator_events::EventRecord;
use aggregator_value::{Scalar, Value};

/// One event as handed to the aggregator by the acquisition layer, before
/// any detector fields have been captured into it.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub sec: u32,
    pub nsec: u32,
    pub fiducials: u32,
}

/// A shared stream of events every rank observes identically; ownership of
/// each event is decided by [`ShardedEvents`], not by the source itself.
pub trait EventSource {
    fn advance(&mut self) -> Option<RawEvent>;
}

/// A source of per-event detector readings. `None` means the detector or
/// field was absent for this event, mirroring the `hasattr` guards the
/// original capture code used.
pub trait DetectorSource {
    fn read_scalar(&self, detector: &str, field: &str) -> Option<Scalar>;
    fn evr_codes(&self, detector: &str) -> Option<Vec<u32>>;
}

/// Shards a shared event stream across `size` ranks by round-robin: the
/// *m*-th event yielded by the underlying source is owned by rank `m % size`.
/// A coordinated `break_after` bound stops every rank at the same global
/// event count; since ownership is already round-robin, a bound not evenly
/// divisible by `size` naturally gives the first `n_events % size` ranks
/// one extra event without any separate remainder logic.
pub struct ShardedEvents<S> {
    source: S,
    rank: i32,
    size: i32,
    nevent: i64,
    bound: Option<u64>,
}

impl<S: EventSource> ShardedEvents<S> {
    pub fn new(source: S, rank: i32, size: i32) -> Self {
        ShardedEvents {
            source,
            rank,
            size,
            nevent: -1,
            bound: None,
        }
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    /// Set the coordinated global event bound. Every rank must call this
    /// with the same value, or ranks will disagree about when the stream
    /// ends.
    pub fn break_after(&mut self, n_events: u64) {
        self.bound = Some(n_events);
    }

    /// Advance to this rank's next owned event, or `None` once the
    /// underlying source is exhausted or the break bound is reached.
    pub fn advance(&mut self) -> Option<RawEvent> {
        loop {
            if let Some(bound) = self.bound {
                if (self.nevent + 1) as u64 >= bound {
                    return None;
                }
            }
            let raw = self.source.advance()?;
            self.nevent += 1;
            if (self.nevent as u64) % (self.size as u64) == self.rank as u64 {
                return Some(raw);
            }
        }
    }
}

const EBEAM_FIELDS: &[&str] = &[
    "charge",
    "dump_charge",
    "L3_energy",
    "photon_energy",
    "pk_curr_bc2",
    "LTU_pos_x",
    "LTU_pos_y",
    "LTU_ang_x",
    "LTU_ang_y",
    "und_pos_x",
    "und_pos_y",
    "und_ang_x",
    "und_ang_y",
    "XTCAV_ampl",
    "XTCAV_phase",
    "LTU_250",
    "LTU_450",
];

const PHASE_CAV_FIELDS: &[&str] = &["charge1", "charge2", "fit_time_1", "fit_time_2"];

const GAS_DETECTOR_FIELDS: &[&str] = &[
    "f_11_ENRC",
    "f_12_ENRC",
    "f_21_ENRC",
    "f_22_ENRC",
    "f_63_ENRC",
    "f_64_ENRC",
];

/// Captures the handful of machine-parameter detectors every experiment
/// records by default: electron beam parameters (`ebeam/*`), the phase
/// cavity (`phase_cav/*`), the gas detector (`gas_detector/*`), and the
/// union of event-code trigger bits across all configured EVR detectors
/// (`evr/code_<n>`). Every field is independently optional — a detector
/// not present on this event simply contributes nothing.
pub struct DefaultDetectorCapture {
    ebeam: Option<String>,
    phase_cav: Option<String>,
    gas_detector: Option<String>,
    evr_detectors: Vec<String>,
    evr_codes: Vec<u32>,
}

impl DefaultDetectorCapture {
    pub fn new() -> Self {
        DefaultDetectorCapture {
            ebeam: None,
            phase_cav: None,
            gas_detector: None,
            evr_detectors: Vec::new(),
            evr_codes: Vec::new(),
        }
    }

    pub fn with_ebeam(mut self, name: impl Into<String>) -> Self {
        self.ebeam = Some(name.into());
        self
    }

    pub fn with_phase_cavity(mut self, name: impl Into<String>) -> Self {
        self.phase_cav = Some(name.into());
        self
    }

    pub fn with_gas_detector(mut self, name: impl Into<String>) -> Self {
        self.gas_detector = Some(name.into());
        self
    }

    /// Register an EVR detector and the full set of codes it might report,
    /// used to emit a stable `evr/code_<n>` key set even for codes that
    /// don't fire on every event.
    pub fn with_evr(mut self, name: impl Into<String>, known_codes: &[u32]) -> Self {
        self.evr_detectors.push(name.into());
        for &c in known_codes {
            if !self.evr_codes.contains(&c) {
                self.evr_codes.push(c);
            }
        }
        self.evr_codes.sort_unstable();
        self
    }

    pub fn capture(&self, source: &dyn DetectorSource, record: &mut EventRecord) -> aggregator_value::Result<()> {
        if let Some(name) = &self.ebeam {
            for field in EBEAM_FIELDS {
                if let Some(v) = source.read_scalar(name, field) {
                    record.set(format!("ebeam/{field}"), Value::Scalar(v))?;
                }
            }
        }
        if let Some(name) = &self.phase_cav {
            for field in PHASE_CAV_FIELDS {
                if let Some(v) = source.read_scalar(name, field) {
                    record.set(format!("phase_cav/{field}"), Value::Scalar(v))?;
                }
            }
        }
        if let Some(name) = &self.gas_detector {
            for field in GAS_DETECTOR_FIELDS {
                if let Some(v) = source.read_scalar(name, field) {
                    record.set(format!("gas_detector/{field}"), Value::Scalar(v))?;
                }
            }
        }
        for name in &self.evr_detectors {
            if let Some(fired) = source.evr_codes(name) {
                for &code in &self.evr_codes {
                    let bit = if fired.contains(&code) { 1 } else { 0 };
                    record.set(format!("evr/code_{code}"), Value::Scalar(Scalar::Int(bit)))?;
                }
            }
        }
        Ok(())
    }
}

impl Default for DefaultDetectorCapture {
    fn default() -> Self {
        DefaultDetectorCapture::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        n: u32,
    }

    impl EventSource for FixedSource {
        fn advance(&mut self) -> Option<RawEvent> {
            if self.n == 0 {
                return None;
            }
            self.n -= 1;
            Some(RawEvent {
                sec: 1,
                nsec: self.n,
                fiducials: self.n,
            })
        }
    }

    #[test]
    fn round_robin_assigns_events_to_ranks() {
        let mut shard0 = ShardedEvents::new(FixedSource { n: 7 }, 0, 3);
        let mut count0 = 0;
        while shard0.advance().is_some() {
            count0 += 1;
        }
        let mut shard1 = ShardedEvents::new(FixedSource { n: 7 }, 1, 3);
        let mut count1 = 0;
        while shard1.advance().is_some() {
            count1 += 1;
        }
        // 7 events over 3 ranks: ranks 0 and 1 get 3, rank 2 gets 2.
        assert_eq!(count0, 3);
        assert_eq!(count1, 3);
    }

    #[test]
    fn break_after_stops_every_rank_at_the_same_global_count() {
        let mut shard = ShardedEvents::new(FixedSource { n: 100 }, 0, 4);
        shard.break_after(5);
        let mut count = 0;
        while shard.advance().is_some() {
            count += 1;
        }
        assert_eq!(count, 2); // rank 0 owns global events 0 and 4 of [0,5)
    }

    struct MockDetectors;

    impl DetectorSource for MockDetectors {
        fn read_scalar(&self, detector: &str, field: &str) -> Option<Scalar> {
            match (detector, field) {
                ("EBeam", "charge") => Some(Scalar::Float(1.5)),
                _ => None,
            }
        }

        fn evr_codes(&self, detector: &str) -> Option<Vec<u32>> {
            match detector {
                "evr0" => Some(vec![140]),
                _ => None,
            }
        }
    }

    #[test]
    fn default_capture_skips_absent_fields() {
        let capture = DefaultDetectorCapture::new()
            .with_ebeam("EBeam")
            .with_evr("evr0", &[140, 141]);
        let mut record = EventRecord::with_timestamp(1, 0, 0);
        capture.capture(&MockDetectors, &mut record).unwrap();

        assert_eq!(record.fields.get("ebeam/charge"), Some(&Value::Scalar(Scalar::Float(1.5))));
        assert!(!record.fields.contains_key("ebeam/dump_charge"));
        assert_eq!(record.fields.get("evr/code_140"), Some(&Value::Scalar(Scalar::Int(1))));
        assert_eq!(record.fields.get("evr/code_141"), Some(&Value::Scalar(Scalar::Int(0))));
    }
}
