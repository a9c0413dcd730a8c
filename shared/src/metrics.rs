//! Metric and self-metric types produced by schedulers and ingress, and
//! consumed by `ChannelManager` (§1, §7).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `BTreeMap` rather than `HashMap` so two metrics with the same label set
/// compare and serialize deterministically — label order shouldn't be an
/// accident of hash iteration when it ends up in a test assertion or a log
/// line.
pub type LabelMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Gauge(f64),
    /// Non-numeric payload, used by `ScriptTask` RAW/RAW_JSON results and by
    /// scrape/probe status strings that carry an error message.
    Text(String),
}

/// One produced data point. This is deliberately thin — §1 puts concrete
/// on-the-wire sink serialization out of scope, so `Metric` only carries
/// what every sink needs to decide routing and labeling; a sink's own
/// encoder is responsible for turning it into bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub labels: LabelMap,
    pub value: MetricValue,
    /// Unix seconds.
    pub timestamp: u64,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, value: f64, timestamp: u64) -> Self {
        Self {
            name: name.into(),
            labels: LabelMap::new(),
            value: MetricValue::Gauge(value),
            timestamp,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.labels.extend(labels);
        self
    }
}

/// Per-round aggregation of task outcomes a scheduler reduces into one
/// self-metric (§7): `module_status`, `script_status`, `exporter_status`,
/// `detect_status`, each carrying `ok_list`/`error_list`/`skip_list`.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub ok_list: Vec<String>,
    pub error_list: Vec<(String, String)>,
    pub skip_list: Vec<String>,
}

impl StatusReport {
    pub fn record_ok(&mut self, task_id: impl Into<String>) {
        self.ok_list.push(task_id.into());
    }

    pub fn record_error(&mut self, task_id: impl Into<String>, message: impl Into<String>) {
        self.error_list.push((task_id.into(), message.into()));
    }

    pub fn record_skip(&mut self, task_id: impl Into<String>) {
        self.skip_list.push(task_id.into());
    }

    /// Reduce into the single self-metric `ChannelManager` fans out once per
    /// scheduling round, named per §7 (`module_status` etc).
    pub fn into_metric(self, metric_name: &str, timestamp: u64) -> Metric {
        let error_count = self.error_list.len();
        let mut metric = Metric::gauge(metric_name, error_count as f64, timestamp)
            .with_label("ok_list", self.ok_list.join(","))
            .with_label("skip_list", self.skip_list.join(","));
        if !self.error_list.is_empty() {
            let joined = self
                .error_list
                .iter()
                .map(|(id, msg)| format!("{id}:{msg}"))
                .collect::<Vec<_>>()
                .join(",");
            metric = metric.with_label("error_list", joined);
        } else {
            metric = metric.with_label("error_list", "");
        }
        metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_reduces_to_metric() {
        let mut report = StatusReport::default();
        report.record_ok("t1");
        report.record_error("t2", "timeout");
        report.record_skip("t3");

        let metric = report.into_metric("module_status", 1000);
        assert_eq!(metric.value, MetricValue::Gauge(1.0));
        assert_eq!(metric.labels.get("ok_list").unwrap(), "t1");
        assert_eq!(metric.labels.get("error_list").unwrap(), "t2:timeout");
        assert_eq!(metric.labels.get("skip_list").unwrap(), "t3");
    }

    #[test]
    fn metric_builder_accumulates_labels() {
        let m = Metric::gauge("rtt_ms", 12.5, 42)
            .with_label("host", "h1")
            .with_labels(vec![("app".to_string(), "a1".to_string())]);
        assert_eq!(m.labels.len(), 2);
    }
}
