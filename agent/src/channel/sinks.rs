//! Concrete `SinkWriter` implementations, one per destination kind from the
//! `Output` pair's sink-type tag (§3, §4.5). Payload encoding on the wire is
//! explicitly out of scope (§1); each sink here picks the simplest encoding
//! that lets it actually deliver something, not a contractual format.

use super::SinkWriter;
use shared::error::MonitoringError;
use shared::metrics::Metric;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Newline-delimited JSON append to a local rotated file, representing a
/// "local rotated files" output (§3 Output kinds).
pub struct LocalFileSink {
    path: PathBuf,
}

impl LocalFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SinkWriter for LocalFileSink {
    async fn write(&self, metrics: &[Metric]) -> shared::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(MonitoringError::eio)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(MonitoringError::eio)?;

        let mut buf = Vec::new();
        for metric in metrics {
            serde_json::to_writer(&mut buf, metric).map_err(MonitoringError::eparse)?;
            buf.push(b'\n');
        }
        file.write_all(&buf).await.map_err(MonitoringError::eio)?;
        file.flush().await.map_err(MonitoringError::eio)?;
        Ok(())
    }
}

/// POSTs a JSON batch to a remote HTTP endpoint, representing a "remote HTTP
/// endpoint" output.
pub struct RemoteHttpSink {
    client: reqwest::Client,
    url: String,
}

impl RemoteHttpSink {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> shared::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitoringError::EConfig(format!("building HTTP sink client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl SinkWriter for RemoteHttpSink {
    async fn write(&self, metrics: &[Metric]) -> shared::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(metrics)
            .send()
            .await
            .map_err(MonitoringError::econn)?;

        if !response.status().is_success() {
            return Err(MonitoringError::EConn(format!(
                "remote sink {} returned status {}",
                self.url,
                response.status()
            ))
            .into());
        }
        Ok(())
    }
}

/// Emits each metric as a structured log line, representing a "log
/// aggregator endpoint" output — the receiving side (e.g. a log shipper
/// tailing this process's output) does the actual aggregation.
pub struct LogAggregatorSink {
    target: String,
}

impl LogAggregatorSink {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait::async_trait]
impl SinkWriter for LogAggregatorSink {
    async fn write(&self, metrics: &[Metric]) -> shared::Result<()> {
        for metric in metrics {
            info!(
                target: "metric",
                sink = %self.target,
                name = %metric.name,
                timestamp = metric.timestamp,
                value = ?metric.value,
                "metric"
            );
        }
        Ok(())
    }
}

/// Convenience constructor used by wiring code (`context.rs`) to build the
/// three built-in sink kinds from a sink-type tag found in config.
pub fn build_sink(
    kind: &str,
    target: &str,
    timeout: std::time::Duration,
) -> shared::Result<Arc<dyn SinkWriter>> {
    match kind {
        "local-file" => Ok(Arc::new(LocalFileSink::new(target))),
        "remote-http" => Ok(Arc::new(RemoteHttpSink::new(target, timeout)?)),
        "log-aggregator" => Ok(Arc::new(LogAggregatorSink::new(target))),
        other => Err(MonitoringError::EConfig(format!("unknown sink kind '{other}'")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::metrics::Metric;

    #[tokio::test]
    async fn local_file_sink_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let sink = LocalFileSink::new(&path);

        sink.write(&[Metric::gauge("m1", 1.0, 10)]).await.unwrap();
        sink.write(&[Metric::gauge("m2", 2.0, 20)]).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"m1\""));
        assert!(content.contains("\"m2\""));
    }

    #[tokio::test]
    async fn log_aggregator_sink_never_fails() {
        let sink = LogAggregatorSink::new("test-target");
        let result = sink.write(&[Metric::gauge("m1", 1.0, 10)]).await;
        assert!(result.is_ok());
    }
}
