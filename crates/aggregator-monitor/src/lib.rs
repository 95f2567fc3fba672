//! Monitor fan-out: callbacks invoked on the master after every gather
//! round with the newly-produced, time-ordered aggregate. A file-writing
//! store is itself wired in as a monitor by the facade crate; anything
//! else (a live-plotting client, a cache pusher) implements the same
//! trait.

use std::collections::BTreeMap;

use aggregator_events::EventId;
use aggregator_value::Value;

/// One gather round's resolved, time-ordered data, keyed by field name.
/// Every `Vec<Value>` in `fields` has the same length as `event_ids`.
pub struct RoundAggregate<'a> {
    pub event_ids: &'a [EventId],
    pub fields: &'a BTreeMap<String, Vec<Value>>,
}

pub trait Monitor: Send {
    fn name(&self) -> &'static str;

    fn on_gather(&mut self, round: &RoundAggregate<'_>) -> anyhow::Result<()>;
}

/// Holds every registered [`Monitor`] and fans a round out to each in
/// registration order.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Vec<Box<dyn Monitor>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        MonitorRegistry::default()
    }

    pub fn register(&mut self, monitor: Box<dyn Monitor>) {
        tracing::info!(target: "aggregator::monitor", monitor = monitor.name(), "registering monitor");
        self.monitors.push(monitor);
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn fan_out(&mut self, round: &RoundAggregate<'_>) -> anyhow::Result<()> {
        for monitor in &mut self.monitors {
            monitor.on_gather(round)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_value::Scalar;

    struct RecordingMonitor {
        rounds_seen: usize,
    }

    impl Monitor for RecordingMonitor {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn on_gather(&mut self, round: &RoundAggregate<'_>) -> anyhow::Result<()> {
            self.rounds_seen += round.event_ids.len();
            Ok(())
        }
    }

    #[test]
    fn fan_out_invokes_every_registered_monitor() {
        let mut registry = MonitorRegistry::new();
        registry.register(Box::new(RecordingMonitor { rounds_seen: 0 }));
        registry.register(Box::new(RecordingMonitor { rounds_seen: 0 }));

        let ids = vec![EventId::from_parts(1, 0, 0), EventId::from_parts(1, 1, 1)];
        let mut fields = BTreeMap::new();
        fields.insert(
            "ebeam/charge".to_string(),
            vec![Value::Scalar(Scalar::Float(1.0)), Value::Scalar(Scalar::Float(2.0))],
        );
        let round = RoundAggregate {
            event_ids: &ids,
            fields: &fields,
        };

        registry.fan_out(&round).unwrap();
    }

    #[test]
    fn empty_registry_reports_empty() {
        let registry = MonitorRegistry::new();
        assert!(registry.is_empty());
    }
}
