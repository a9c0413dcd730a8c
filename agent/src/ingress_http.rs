//! HTTP metric ingestion listener (§4.10).
//!
//! Grounded on `net_endpoint::listen_tcp` for the bound/non-blocking
//! listener setup and on the teacher's `task_http.rs` hand-rolled
//! request-line/header parsing style (this reads a minimal request by hand
//! rather than pulling in a full HTTP server framework, since the ingress
//! protocol here is a narrow, fixed subset: one line, a body, no
//! keep-alive).
//!
//! Accepted connections run directly off `tokio::net`'s own reactor
//! (`tokio::select!` + `tokio::spawn`), not through `crate::event_loop`'s
//! standalone `mio::Poll` — a deliberate scope narrowing from the spec's
//! EventLoop description, recorded as Open Question decision #3 in
//! `SPEC_FULL.md`. `EventLoop` is reserved for the raw ICMP socket in
//! `probe_scheduler.rs`, which has no reactor of its own to lean on.

use crate::channel::ChannelManager;
use crate::net_endpoint::listen_tcp;
use shared::config::Output;
use shared::defaults::{HTTP_INGRESS_DEFAULT_IP, HTTP_INGRESS_DEFAULT_PORT, HTTP_INGRESS_MAX_CONNECTIONS};
use shared::metrics::Metric;
use shared::utils::{current_timestamp, decode_base64, parse_prometheus_line};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct IngressHttp {
    channel: Arc<ChannelManager>,
    max_connections: usize,
    active_connections: Arc<AtomicUsize>,
    outputs: Arc<Vec<Output>>,
}

impl IngressHttp {
    pub fn new(channel: Arc<ChannelManager>, max_connections: usize, outputs: Vec<Output>) -> Self {
        Self {
            channel,
            max_connections,
            active_connections: Arc::new(AtomicUsize::new(0)),
            outputs: Arc::new(outputs),
        }
    }

    pub async fn run(&self, host: &str, port: u16, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = listen_tcp(host, port, 128).await?;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.spawn_connection(stream, peer);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: std::net::SocketAddr) {
        let channel = self.channel.clone();
        let active = self.active_connections.clone();
        let max = self.max_connections;
        let outputs = self.outputs.clone();
        tokio::spawn(async move {
            if active.fetch_add(1, Ordering::SeqCst) >= max {
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = respond(stream, 500, "too many concurrent connections").await;
                return;
            }
            if let Err(e) = handle_connection(stream, &channel, &outputs).await {
                debug!(peer = %peer, error = %e, "ingress connection error");
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    pub fn default_bind() -> (String, u16) {
        (HTTP_INGRESS_DEFAULT_IP.to_string(), HTTP_INGRESS_DEFAULT_PORT)
    }

    pub fn default_max_connections() -> usize {
        HTTP_INGRESS_MAX_CONNECTIONS
    }
}

async fn handle_connection(mut stream: TcpStream, channel: &ChannelManager, outputs: &[Output]) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let (method, path) = parse_request_line(&request_line)?;

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }
    let body_text = String::from_utf8_lossy(&body).into_owned();

    if method != "POST" && method != "PUT" {
        writer.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await?;
        return Ok(());
    }

    match parse_url_tags(&path) {
        Ok(tags) => {
            let metrics = parse_prometheus_body(&body_text, tags);
            let _ = channel.send(metrics, outputs).await;
            writer.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await?;
        }
        Err(e) => {
            warn!(path = %path, error = %e, "malformed ingress URL");
            writer.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await?;
        }
    }
    Ok(())
}

async fn respond(mut stream: TcpStream, status: u16, message: &str) -> anyhow::Result<()> {
    let body = format!("HTTP/1.1 {status} Error\r\nContent-Length: {}\r\n\r\n{}", message.len(), message);
    stream.write_all(body.as_bytes()).await?;
    Ok(())
}

fn parse_request_line(line: &str) -> anyhow::Result<(String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow::anyhow!("empty request line"))?;
    let path = parts.next().ok_or_else(|| anyhow::anyhow!("missing path"))?;
    Ok((method.to_string(), path.to_string()))
}

/// `/(metrics|shennong)/(key/value)*` — a key ending in `@base64` carries a
/// base64-encoded UTF-8 value (§4.10, §6).
fn parse_url_tags(path: &str) -> anyhow::Result<Vec<(String, String)>> {
    let path = path.split('?').next().unwrap_or(path);
    let mut segments = path.trim_start_matches('/').split('/');
    let prefix = segments.next().unwrap_or("");
    if prefix != "metrics" && prefix != "shennong" {
        anyhow::bail!("URL must start with /metrics/ or /shennong/, got '{prefix}'");
    }

    let rest: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    if rest.len() % 2 != 0 {
        anyhow::bail!("URL key/value segments must come in pairs");
    }

    let mut tags = Vec::new();
    for pair in rest.chunks(2) {
        let (key, raw_value) = (pair[0], pair[1]);
        if let Some(base_key) = key.strip_suffix("@base64") {
            tags.push((base_key.to_string(), decode_base64(raw_value)?));
        } else {
            tags.push((key.to_string(), raw_value.to_string()));
        }
    }
    Ok(tags)
}

fn parse_prometheus_body(body: &str, tags: Vec<(String, String)>) -> Vec<Metric> {
    let now = current_timestamp();
    let mut metrics = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, labels, value)) = parse_prometheus_line(line) {
            let metric = Metric::gauge(name, value, now)
                .with_labels(tags.clone())
                .with_labels(labels);
            metrics.push(metric);
        }
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metrics_prefixed_key_value_pairs() {
        let tags = parse_url_tags("/metrics/host/web01/env/prod").unwrap();
        assert_eq!(tags, vec![("host".to_string(), "web01".to_string()), ("env".to_string(), "prod".to_string())]);
    }

    #[test]
    fn decodes_base64_suffixed_keys() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let encoded = STANDARD.encode("has spaces");
        let path = format!("/shennong/note@base64/{encoded}");
        let tags = parse_url_tags(&path).unwrap();
        assert_eq!(tags, vec![("note".to_string(), "has spaces".to_string())]);
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(parse_url_tags("/other/host/web01").is_err());
    }

    #[test]
    fn rejects_odd_segment_count() {
        assert!(parse_url_tags("/metrics/host").is_err());
    }

    #[test]
    fn prometheus_body_attaches_url_tags() {
        let metrics = parse_prometheus_body("cpu_usage 12.5\n", vec![("host".to_string(), "h1".to_string())]);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].labels.get("host").unwrap(), "h1");
    }
}
