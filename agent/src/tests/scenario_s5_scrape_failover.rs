//! S5 — two ScrapeTasks against independent mock targets, one returning 200
//! and one 500 on every request: across several ticks the 500 task's
//! per-task status carries an error, the 200 task's stays healthy (§8 S5).
//!
//! `ScrapeScheduler`'s combined `exporter_status` self-metric is reduced
//! once per tick and routed with no `outputs` (there's no dedicated sink for
//! it yet), so this scenario observes the per-task `scrape.<id>.status`
//! metric instead, which already rides each task's own `outputs`.

use super::mock_sink::MockSink;
use crate::channel::{ChannelManager, OverflowPolicy};
use crate::registry::FamilyRegistry;
use crate::scrape_scheduler::ScrapeScheduler;
use shared::config::{ScrapeTask, ScrapeType, TasksSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_fixed_response_server(status_line: &'static str, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!("{status_line}\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    port
}

#[tokio::test]
async fn failing_target_and_healthy_target_report_independent_status() {
    let ok_port = spawn_fixed_response_server("HTTP/1.1 200 OK", "cpu_usage 1\n").await;
    let err_port = spawn_fixed_response_server("HTTP/1.1 500 Internal Server Error", "boom").await;

    let channel = Arc::new(ChannelManager::new(16, Duration::from_secs(3600)));
    channel.start();
    let (sink, captured) = MockSink::new();
    channel
        .register("mock", sink, OverflowPolicy::EvictOldest)
        .await
        .unwrap();

    let make_task = |id: &str, port: u16| ScrapeTask {
        id: id.to_string(),
        target: vec![format!("http://127.0.0.1:{port}")],
        path: "/metrics".to_string(),
        method: "GET".to_string(),
        headers: vec![],
        interval: 1,
        timeout: 2,
        scrape_type: ScrapeType::Prom,
        filters: vec![],
        labels: vec![],
        outputs: vec![("mock".to_string(), serde_json::json!({}))],
        emit_status: true,
    };

    let tasks = vec![make_task("healthy", ok_port), make_task("failing", err_port)];
    let registry: FamilyRegistry<ScrapeTask> = FamilyRegistry::new(TasksSnapshot::new(tasks, String::new()));
    let scheduler = Arc::new(ScrapeScheduler::new(registry.subscribe(), channel.clone(), 4, Duration::from_millis(200)));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;

    let metrics = captured.lock().unwrap();
    let healthy_status = metrics
        .iter()
        .filter(|m| m.name == "scrape.healthy.status")
        .last()
        .expect("healthy task reported its status");
    assert_eq!(healthy_status.value, shared::metrics::MetricValue::Gauge(1.0));

    let failing_status = metrics
        .iter()
        .filter(|m| m.name == "scrape.failing.status")
        .last()
        .expect("failing task reported its status");
    assert_eq!(failing_status.value, shared::metrics::MetricValue::Gauge(0.0));
    assert!(failing_status.labels.contains_key("error"));
}
