//! Stats emission as a thin, swappable backend: gauges and counters keyed by
//! tags, called unconditionally by the controller but never hard-depended on
//! by name.

use std::collections::BTreeMap;

pub type Tags = BTreeMap<String, String>;

pub trait MetricsSink: Send + Sync {
    fn gauge(&self, metric: &str, value: f64, tags: &Tags);
    fn increment(&self, metric: &str, tags: &Tags);
}

/// Discards everything — the default when no metrics backend is configured.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn gauge(&self, _metric: &str, _value: f64, _tags: &Tags) {}
    fn increment(&self, _metric: &str, _tags: &Tags) {}
}

/// Logs every call at debug via the `log` crate — useful for local runs and
/// tests where wiring up a real metrics backend isn't worth it.
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn gauge(&self, metric: &str, value: f64, tags: &Tags) {
        crate::errors::debug!("gauge {metric}={value} {tags:?}");
    }

    fn increment(&self, metric: &str, tags: &Tags) {
        crate::errors::debug!("increment {metric} {tags:?}");
    }
}

pub fn tag(key: &str, value: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(key.to_string(), value.to_string());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_sink_does_not_panic() {
        let sink = LoggingMetricsSink;
        sink.gauge("s3_mirror_sync_seconds", 1.5, &tag("repo", "fedora/39"));
        sink.increment("s3_mirror_sync_failures", &tag("repo", "fedora/39"));
    }

    #[test]
    fn test_null_sink_does_not_panic() {
        let sink = NullMetricsSink;
        sink.gauge("anything", 0.0, &Tags::new());
    }
}
