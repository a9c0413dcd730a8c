//! S4 — POSTing `m{k="v"} 1` to `/metrics/host/h1/app/a1` yields a metric
//! named `m` carrying tags `{host:h1, app:a1, k:v}` — URL path tags and
//! Prometheus label-syntax tags both land on the same metric (§8 S4).

use super::mock_sink::MockSink;
use crate::channel::{ChannelManager, OverflowPolicy};
use crate::ingress_http::IngressHttp;
use shared::metrics::MetricValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn prometheus_body_and_url_tags_merge_on_one_metric() {
    let channel = Arc::new(ChannelManager::new(16, Duration::from_secs(3600)));
    channel.start();
    let (sink, captured) = MockSink::new();
    channel
        .register("mock", sink, OverflowPolicy::EvictOldest)
        .await
        .unwrap();

    let ingress = Arc::new(IngressHttp::new(
        channel.clone(),
        10,
        vec![("mock".to_string(), serde_json::json!({}))],
    ));
    let port = 18199;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = {
        let ingress = ingress.clone();
        tokio::spawn(async move { ingress.run("127.0.0.1", port, shutdown_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body = "m{k=\"v\"} 1\n";
    let request = format!(
        "POST /metrics/host/h1/app/a1 HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;

    let metrics = captured.lock().unwrap();
    let merged = metrics
        .iter()
        .find(|m| m.name == "m")
        .expect("mock sink received the ingested metric");
    assert_eq!(merged.value, MetricValue::Gauge(1.0));
    assert_eq!(merged.labels.get("host").unwrap(), "h1");
    assert_eq!(merged.labels.get("app").unwrap(), "a1");
    assert_eq!(merged.labels.get("k").unwrap(), "v");
}
