//! Prometheus metrics for the pipeline components.
//!
//! Every component receives its metrics struct at construction time, built
//! against an explicit [`Registry`]. Registration therefore happens exactly
//! once per process and tests can use throwaway registries.

use prometheus::{Counter, IntCounter, IntGauge, Registry};

#[derive(Clone)]
pub struct CollectorMetrics {
    pub errors_total: IntCounter,
    pub events_collected_total: IntCounter,
    pub collect_duration_total: Counter,
}

impl CollectorMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let errors_total = IntCounter::new(
            "cf_audit_event_collector_errors_total",
            "Number of errors encountered by the audit event collector",
        )?;
        let events_collected_total = IntCounter::new(
            "cf_audit_event_collector_events_collected_total",
            "Number of events collected and saved to the DB by the audit event collector",
        )?;
        let collect_duration_total = Counter::new(
            "cf_audit_event_collector_collect_duration_total",
            "Number of seconds spent collecting events by the audit event collector",
        )?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(events_collected_total.clone()))?;
        registry.register(Box::new(collect_duration_total.clone()))?;
        Ok(Self {
            errors_total,
            events_collected_total,
            collect_duration_total,
        })
    }
}

#[derive(Clone)]
pub struct ShipperMetrics {
    pub errors_total: IntCounter,
    pub events_shipped_total: IntCounter,
    pub latest_event_timestamp: IntGauge,
    pub ship_duration_total: Counter,
}

impl ShipperMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let errors_total = IntCounter::new(
            "cf_audit_events_to_splunk_shipper_errors_total",
            "Number of errors encountered by the Splunk shipper",
        )?;
        let events_shipped_total = IntCounter::new(
            "cf_audit_events_to_splunk_shipper_events_shipped_total",
            "Number of audit events shipped to Splunk",
        )?;
        let latest_event_timestamp = IntGauge::new(
            "cf_audit_events_to_splunk_shipper_latest_event_timestamp",
            "Unix epoch seconds of most recent event shipped to Splunk",
        )?;
        let ship_duration_total = Counter::new(
            "cf_audit_events_to_splunk_shipper_ship_duration_total",
            "Number of seconds spent shipping events by the Splunk shipper",
        )?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(events_shipped_total.clone()))?;
        registry.register(Box::new(latest_event_timestamp.clone()))?;
        registry.register(Box::new(ship_duration_total.clone()))?;
        Ok(Self {
            errors_total,
            events_shipped_total,
            latest_event_timestamp,
            ship_duration_total,
        })
    }
}

#[derive(Clone)]
pub struct InformerMetrics {
    pub events_total: IntGauge,
    pub latest_event_timestamp: IntGauge,
}

impl InformerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let events_total = IntGauge::new(
            "informer_cf_audit_events_total",
            "Number of audit events in the database",
        )?;
        let latest_event_timestamp = IntGauge::new(
            "informer_latest_cf_audit_event_timestamp",
            "Unix epoch seconds of most recent event in the database",
        )?;
        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(latest_event_timestamp.clone()))?;
        Ok(Self {
            events_total,
            latest_event_timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_against_one_registry() {
        let registry = Registry::new();
        CollectorMetrics::new(&registry).unwrap();
        ShipperMetrics::new(&registry).unwrap();
        InformerMetrics::new(&registry).unwrap();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"cf_audit_event_collector_errors_total".to_string()));
        assert!(names.contains(&"cf_audit_events_to_splunk_shipper_events_shipped_total".to_string()));
        assert!(names.contains(&"informer_cf_audit_events_total".to_string()));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        CollectorMetrics::new(&registry).unwrap();
        assert!(CollectorMetrics::new(&registry).is_err());
    }
}
