//! Periodic HTTP scraping with per-target failover and text-format
//! decoding (§4.8).
//!
//! Ticking and per-task `ScheduleState` are the same shape as
//! `module_scheduler.rs`; what's new here is the `reqwest::Client` fetch
//! (same client idiom `channel/sinks.rs`'s `RemoteHttpSink` already uses
//! for outbound HTTP) and the two text decoders (§4.8 PROM / JSON_METRIC).
//! Like `module_scheduler.rs`, each due task's fetch-and-decode runs under
//! a `tokio::spawn`'d unit rather than inline in the tick loop, so the
//! worker pool actually bounds *concurrent* scrapes instead of serializing
//! them behind one permit at a time (mirrors `probe_scheduler.rs`'s
//! TCP/HTTP dispatch).

use crate::channel::ChannelManager;
use crate::registry::FamilyHandle;
use shared::config::{ScrapeTask, ScrapeType};
use shared::metrics::{Metric, StatusReport};
use shared::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct ScheduleState {
    last_begin: u64,
    /// Index into `task.target` currently believed reachable; advanced on
    /// failure so the next attempt tries the next configured target.
    active_index: usize,
}

type SharedStates = Arc<tokio::sync::Mutex<HashMap<String, ScheduleState>>>;

pub struct ScrapeScheduler {
    registry: FamilyHandle<ScrapeTask>,
    channel: Arc<ChannelManager>,
    client: reqwest::Client,
    worker_pool: Arc<Semaphore>,
    base_factor: Duration,
    states: SharedStates,
    report: Arc<Mutex<StatusReport>>,
}

impl ScrapeScheduler {
    pub fn new(
        registry: FamilyHandle<ScrapeTask>,
        channel: Arc<ChannelManager>,
        worker_pool_size: usize,
        base_factor: Duration,
    ) -> Self {
        Self {
            registry,
            channel,
            client: reqwest::Client::new(),
            worker_pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            base_factor,
            states: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            report: Arc::new(Mutex::new(StatusReport::default())),
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.base_factor);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }

    async fn tick(&self) {
        let snapshot = self.registry.current();
        let now = current_timestamp();

        for task in &snapshot.tasks {
            let due = {
                let mut states = self.states.lock().await;
                let state = states
                    .entry(task.id.clone())
                    .or_insert_with(|| ScheduleState { last_begin: 0, active_index: 0 });
                if now >= state.last_begin + task.interval as u64 {
                    state.last_begin = now;
                    true
                } else {
                    false
                }
            };
            if !due {
                continue;
            }

            let permit = match self.worker_pool.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    self.report.lock().unwrap().record_skip(task.id.clone());
                    continue;
                }
            };

            let active_index = {
                let states = self.states.lock().await;
                states.get(&task.id).map(|s| s.active_index).unwrap_or(0)
            };

            tokio::spawn(scrape_task_unit(
                task.clone(),
                active_index,
                self.client.clone(),
                self.channel.clone(),
                self.states.clone(),
                self.report.clone(),
                permit,
            ));
        }

        let report = std::mem::take(&mut *self.report.lock().unwrap());
        let status = report.into_metric("exporter_status", now);
        self.channel.send_to_all(vec![status]).await;
    }
}

/// One spawned scrape-and-decode unit, holding its worker-pool permit for
/// the duration of the fetch. Failover (advancing `active_index` on error)
/// and the `exporter_status`/`scrape.<id>.status` bookkeeping both still
/// apply per task, just concurrently across tasks instead of serialized.
async fn scrape_task_unit(
    task: ScrapeTask,
    start_index: usize,
    client: reqwest::Client,
    channel: Arc<ChannelManager>,
    states: SharedStates,
    report: Arc<Mutex<StatusReport>>,
    permit: OwnedSemaphorePermit,
) {
    let now = current_timestamp();
    match scrape_once(&client, &task, start_index).await {
        Ok((metrics, used_index)) => {
            {
                let mut states = states.lock().await;
                if let Some(state) = states.get_mut(&task.id) {
                    state.active_index = used_index;
                }
            }
            report.lock().unwrap().record_ok(task.id.clone());
            if task.emit_status {
                let status = Metric::gauge(format!("scrape.{}.status", task.id), 1.0, now)
                    .with_label("target", task.target[used_index].clone());
                let _ = channel.send(vec![status], &task.outputs).await;
            }
            if !metrics.is_empty() {
                let _ = channel.send(metrics, &task.outputs).await;
            }
        }
        Err(e) => {
            // Failover: advance to the next configured target so the next
            // tick tries a different one.
            let mut states = states.lock().await;
            if let Some(state) = states.get_mut(&task.id) {
                state.active_index = (state.active_index + 1) % task.target.len().max(1);
            }
            drop(states);
            report.lock().unwrap().record_error(task.id.clone(), e.to_string());
            if task.emit_status {
                let status = Metric::gauge(format!("scrape.{}.status", task.id), 0.0, now)
                    .with_label("error", e.to_string());
                let _ = channel.send(vec![status], &task.outputs).await;
            }
        }
    }
    drop(permit);
}

async fn scrape_once(client: &reqwest::Client, task: &ScrapeTask, start_index: usize) -> anyhow::Result<(Vec<Metric>, usize)> {
    let n = task.target.len();
    let mut last_err = None;
    for offset in 0..n {
        let index = (start_index + offset) % n;
        let url = format!("{}{}", task.target[index], task.path);
        match fetch(client, task, &url).await {
            Ok(body) => {
                let now = current_timestamp();
                let metrics = match task.scrape_type {
                    ScrapeType::Prom => parse_prometheus(&body, now),
                    ScrapeType::JsonMetric => parse_json_metric(&body, now)?,
                };
                let metrics = apply_filters_and_labels(metrics, &task.filters, &task.labels);
                return Ok((metrics, index));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no targets configured")))
}

async fn fetch(client: &reqwest::Client, task: &ScrapeTask, url: &str) -> anyhow::Result<String> {
    let mut builder = client
        .request(task.method.parse().unwrap_or(reqwest::Method::GET), url)
        .timeout(Duration::from_secs(task.timeout as u64));
    for (k, v) in &task.headers {
        builder = builder.header(k, v);
    }
    let response = builder.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("scrape target {} returned {}", url, response.status());
    }
    Ok(response.text().await?)
}

fn parse_prometheus(body: &str, timestamp: u64) -> Vec<Metric> {
    let mut metrics = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, labels, value)) = shared::utils::parse_prometheus_line(line) {
            metrics.push(Metric::gauge(name, value, timestamp).with_labels(labels));
        }
    }
    metrics
}

fn parse_json_metric(body: &str, timestamp: u64) -> anyhow::Result<Vec<Metric>> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let array = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("expected a JSON array of metric objects"))?;
    let mut metrics = Vec::new();
    for item in array {
        let Some(name) = item.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(val) = item.get("value").and_then(|v| v.as_f64()) else {
            continue;
        };
        let mut metric = Metric::gauge(name.to_string(), val, timestamp);
        if let Some(tags) = item.get("tags").and_then(|v| v.as_object()) {
            for (k, v) in tags {
                if let Some(s) = v.as_str() {
                    metric = metric.with_label(k.clone(), s.to_string());
                }
            }
        }
        metrics.push(metric);
    }
    Ok(metrics)
}

fn apply_filters_and_labels(
    metrics: Vec<Metric>,
    filters: &[String],
    labels: &[(String, String)],
) -> Vec<Metric> {
    metrics
        .into_iter()
        .filter(|m| filters.is_empty() || filters.iter().any(|f| m.name.contains(f.as_str())))
        .map(|m| m.with_labels(labels.iter().cloned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_text_parses_labels() {
        let body = "http_requests_total{method=\"GET\",code=\"200\"} 42\n# comment\nmem_free 100\n";
        let metrics = parse_prometheus(body, 0);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].labels.get("method").unwrap(), "GET");
    }

    #[test]
    fn json_metric_parses_tags() {
        let body = r#"[{"name":"cpu","value":12.5,"tags":{"host":"h1"}}]"#;
        let metrics = parse_json_metric(body, 0).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].labels.get("host").unwrap(), "h1");
    }

    #[test]
    fn filters_keep_only_matching_names() {
        let metrics = vec![Metric::gauge("cpu_usage", 1.0, 0), Metric::gauge("mem_free", 2.0, 0)];
        let filtered = apply_filters_and_labels(metrics, &["cpu".to_string()], &[]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "cpu_usage");
    }
}
