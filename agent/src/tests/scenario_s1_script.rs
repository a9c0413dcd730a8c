//! S1 — a ScriptTask running `/bin/echo hello` on a 2s interval reports its
//! stdout and exit code to its configured sink within one tick (§8 S1).

use super::mock_sink::MockSink;
use crate::channel::{ChannelManager, OverflowPolicy};
use crate::registry::FamilyRegistry;
use crate::script_scheduler::ScriptScheduler;
use shared::config::{ResultFormat, ScriptTask, TasksSnapshot};
use shared::metrics::MetricValue;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn script_echo_reports_output_and_exit_code() {
    let channel = Arc::new(ChannelManager::new(16, Duration::from_secs(3600)));
    channel.start();
    let (sink, captured) = MockSink::new();
    channel
        .register("mock", sink, OverflowPolicy::EvictOldest)
        .await
        .unwrap();

    let task = ScriptTask {
        id: "s1".into(),
        name: "s1".into(),
        command: "/bin/echo hello".into(),
        user: None,
        interval: 2,
        timeout: 5,
        first_schedule: None,
        result_format: ResultFormat::Raw,
        filters: vec![],
        labels: vec![],
        report_status: 0,
        time_window: None,
        outputs: vec![("mock".to_string(), serde_json::json!({}))],
    };
    let registry: FamilyRegistry<ScriptTask> = FamilyRegistry::new(TasksSnapshot::new(vec![task], String::new()));
    let scheduler = Arc::new(ScriptScheduler::new(registry.subscribe(), channel.clone(), 5, 64 * 1024));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(Duration::from_millis(100), shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run_handle)
        .await
        .expect("scheduler shut down within the grace period")
        .unwrap();

    let metrics = captured.lock().unwrap();
    let echoed = metrics
        .iter()
        .find(|m| m.name == "script.s1")
        .expect("mock sink received the script's output metric");
    match &echoed.value {
        MetricValue::Text(body) => assert_eq!(body, "hello\n"),
        other => panic!("expected a Text metric, got {other:?}"),
    }
    assert_eq!(echoed.labels.get("exit_code").unwrap(), "0");
}
