//! External-process scheduler with output capture, timeout kill, and
//! result parsing (§4.7).
//!
//! Each tick's lifecycle is implemented as the state machine §9 asks for
//! (`{Starting, Running, Draining, Killed, Reaped}`) rather than the
//! source's implicit coroutine-per-child (`ProcessWorker`'s
//! `create`/`wait(NOWAIT)`/`kill`/`exitWhy` shape in
//! `original_source/core/cms/common/ProcessWorker.h`). Spawning and
//! lifetime tracking otherwise follow the teacher's own `is_running`
//! per-task overrun guard in `scheduler.rs` (P3: a task cannot be
//! dispatched while its prior run is still running).

use shared::config::{ResultFormat, ScriptTask};
use shared::error::MonitoringError;
use shared::metrics::{Metric, MetricValue, StatusReport};
use shared::utils::current_timestamp;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::channel::ChannelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Starting,
    Running,
    Draining,
    Killed,
    Reaped,
}

struct RunningChild {
    child: Child,
    state: ChildState,
    expected_finish: u64,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
}

struct TaskState {
    last_begin: u64,
    running: Option<RunningChild>,
}

pub struct ScriptScheduler {
    registry: crate::registry::FamilyHandle<ScriptTask>,
    channel: Arc<ChannelManager>,
    max_procs: usize,
    max_output_len: usize,
    in_flight: AtomicUsize,
    states: tokio::sync::Mutex<HashMap<String, TaskState>>,
}

impl ScriptScheduler {
    pub fn new(
        registry: crate::registry::FamilyHandle<ScriptTask>,
        channel: Arc<ChannelManager>,
        max_procs: usize,
        max_output_len: usize,
    ) -> Self {
        Self {
            registry,
            channel,
            max_procs,
            max_output_len,
            in_flight: AtomicUsize::new(0),
            states: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, base_factor: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(base_factor);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.kill_all_and_reap().await;
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let snapshot = self.registry.current();
        let now = current_timestamp();
        let mut report = StatusReport::default();

        let mut states = self.states.lock().await;
        for task in &snapshot.tasks {
            let state = states.entry(task.id.clone()).or_insert_with(|| TaskState {
                last_begin: 0,
                running: None,
            });

            if let Some(running) = state.running.as_mut() {
                self.advance_running(task, running, now, &mut report).await;
                if matches!(running.state, ChildState::Reaped) {
                    let finished = state.running.take().unwrap();
                    self.finish(task, finished, &mut report).await;
                }
                continue;
            }

            // Predicate gate: not due, or time window excludes now, or the
            // process pool is saturated (§4.7 step 1).
            if now < state.last_begin + task.interval as u64 {
                continue;
            }
            if task
                .time_window
                .as_ref()
                .map(|w| !w.contains((now % 86400) as u32))
                .unwrap_or(false)
            {
                continue;
            }
            if self.in_flight.load(Ordering::SeqCst) >= self.max_procs {
                report.record_skip(task.id.clone());
                continue;
            }

            match self.spawn(task, now).await {
                Ok(running) => {
                    state.last_begin = now;
                    state.running = Some(running);
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => report.record_error(task.id.clone(), e.to_string()),
            }
        }
        drop(states);

        let status = report.into_metric("script_status", now);
        self.channel.send_to_all(vec![status]).await;
    }

    async fn spawn(&self, task: &ScriptTask, now: u64) -> anyhow::Result<RunningChild> {
        let mut parts = shell_words_split(&task.command);
        if parts.is_empty() {
            return Err(MonitoringError::EConfig("empty command".into()).into());
        }
        let program = parts.remove(0);
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        #[cfg(unix)]
        if let Some(user) = &task.user {
            if let Some(uid) = resolve_uid(user) {
                use std::os::unix::process::CommandExt;
                cmd.uid(uid);
            }
        }

        let child = cmd.spawn().map_err(MonitoringError::eio)?;
        Ok(RunningChild {
            child,
            state: ChildState::Running,
            expected_finish: now + task.timeout as u64,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
        })
    }

    /// Non-blocking try-wait plus partial-output drain (§4.7 step 3).
    async fn advance_running(
        &self,
        task: &ScriptTask,
        running: &mut RunningChild,
        now: u64,
        report: &mut StatusReport,
    ) {
        if let Some(stdout) = running.child.stdout.as_mut() {
            let mut chunk = [0u8; 4096];
            if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(1), stdout.read(&mut chunk)).await {
                running.stdout_buf.extend_from_slice(&chunk[..n]);
            }
        }

        if running.stdout_buf.len() > self.max_output_len {
            warn!(task = %task.id, "script output exceeded max length, killing");
            let _ = running.child.start_kill();
            running.state = ChildState::Killed;
            report.record_error(task.id.clone(), "E_OutputTooLong".to_string());
        }

        match running.child.try_wait() {
            Ok(Some(_)) => {
                running.state = ChildState::Draining;
                if let Some(stderr) = running.child.stderr.as_mut() {
                    let mut buf = Vec::new();
                    let _ = tokio::time::timeout(Duration::from_millis(50), stderr.read_to_end(&mut buf)).await;
                    running.stderr_buf = buf;
                }
                running.state = ChildState::Reaped;
            }
            Ok(None) => {
                if now >= running.expected_finish && !matches!(running.state, ChildState::Killed) {
                    // P1: a script timeout always leads to a kill attempt.
                    let _ = running.child.start_kill();
                    running.state = ChildState::Killed;
                }
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "try_wait failed");
            }
        }

        if matches!(running.state, ChildState::Killed) {
            if let Ok(Some(_)) = running.child.try_wait() {
                running.state = ChildState::Reaped;
            }
        }
    }

    async fn finish(&self, task: &ScriptTask, mut running: RunningChild, report: &mut StatusReport) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let exit_code = running
            .child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|s| s.code())
            .unwrap_or(-1);

        let mut output = String::from_utf8_lossy(&running.stdout_buf).into_owned();
        if output.is_empty() {
            output = String::from_utf8_lossy(&running.stderr_buf).into_owned();
        }

        let metrics = build_metrics(task, exit_code, &output);
        if metrics.is_empty() {
            report.record_error(task.id.clone(), "no output".to_string());
        } else {
            report.record_ok(task.id.clone());
            let _ = self.channel.send(metrics, &task.outputs).await;
        }
    }

    async fn kill_all_and_reap(&self) {
        let mut states = self.states.lock().await;
        for state in states.values_mut() {
            if let Some(running) = state.running.as_mut() {
                let _ = running.child.start_kill();
                let _ = running.child.wait().await;
            }
        }
    }
}

fn build_metrics(task: &ScriptTask, exit_code: i32, output: &str) -> Vec<Metric> {
    let now = current_timestamp();
    match task.result_format {
        ResultFormat::Raw => vec![Metric {
            name: format!("script.{}", task.id),
            labels: Default::default(),
            value: MetricValue::Text(output.to_string()),
            timestamp: now,
        }
        .with_label("exit_code", exit_code.to_string())
        .with_labels(task.labels.clone())],

        ResultFormat::RawJson => {
            let status = if task.report_status != 0 {
                Some(exit_code.to_string())
            } else {
                None
            };
            let mut metric = Metric::gauge(format!("script.{}", task.id), exit_code as f64, now)
                .with_label("result", output.to_string());
            if let Some(status) = status {
                metric = metric.with_label("status", status);
            }
            vec![metric.with_labels(task.labels.clone())]
        }

        ResultFormat::Prometheus => {
            let (mut metrics, parse_ok) = parse_prometheus_text(output, now);
            let status_metric = Metric::gauge("__argus_script_status__", metrics.len() as f64, now)
                .with_label("error_code", if parse_ok { "0" } else { "1" }.to_string());
            let status_metric = if !parse_ok || task.report_status == 2 {
                status_metric.with_label("__argus_script_raw_msg__", output.to_string())
            } else {
                status_metric
            };
            metrics.push(status_metric);
            metrics
                .into_iter()
                .map(|m| m.with_labels(task.labels.clone()))
                .collect()
        }

        ResultFormat::Json => match serde_json::from_str::<serde_json::Value>(output) {
            Ok(value) => vec![Metric::gauge(format!("script.{}", task.id), 0.0, now)
                .with_label("json", value.to_string())
                .with_labels(task.labels.clone())],
            Err(e) => vec![Metric::gauge(format!("script.{}", task.id), 1.0, now)
                .with_label("error", e.to_string())
                .with_labels(task.labels.clone())],
        },

        ResultFormat::Text => vec![Metric {
            name: format!("script.{}", task.id),
            labels: Default::default(),
            value: MetricValue::Text(output.to_string()),
            timestamp: now,
        }
        .with_labels(task.labels.clone())],
    }
}

fn parse_prometheus_text(text: &str, timestamp: u64) -> (Vec<Metric>, bool) {
    let mut metrics = Vec::new();
    let mut ok = true;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match shared::utils::parse_prometheus_line(line) {
            Some((name, labels, value)) => {
                metrics.push(Metric::gauge(name, value, timestamp).with_labels(labels))
            }
            None => ok = false,
        }
    }
    (metrics, ok)
}

fn shell_words_split(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

/// Resolves a configured `ScriptTask.user` to a uid via the system's
/// passwd database (`getpwnam`). A lookup miss or OS error is logged and
/// treated like "no user configured" — the child still runs, as the
/// agent's own uid, rather than failing the whole task dispatch.
#[cfg(unix)]
fn resolve_uid(user: &str) -> Option<u32> {
    match nix::unistd::User::from_name(user) {
        Ok(Some(u)) => Some(u.uid.as_raw()),
        Ok(None) => {
            warn!(user, "configured script user not found, running as agent's own uid");
            None
        }
        Err(e) => {
            warn!(user, error = %e, "user lookup failed, running as agent's own uid");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn resolve_uid_finds_root() {
        assert_eq!(resolve_uid("root"), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_uid_returns_none_for_unknown_user() {
        assert_eq!(resolve_uid("definitely-not-a-real-user-argus-test"), None);
    }

    #[test]
    fn prometheus_parser_extracts_gauges_and_flags_bad_lines() {
        let (metrics, ok) = parse_prometheus_text("cpu_usage 42.5\nnotanumber\nmem_free 100", 0);
        assert_eq!(metrics.len(), 2);
        assert!(!ok);
    }

    #[test]
    fn raw_json_format_attaches_status_when_reported() {
        let task = ScriptTask {
            id: "s1".into(),
            name: "n".into(),
            command: "/bin/true".into(),
            user: None,
            interval: 1,
            timeout: 1,
            first_schedule: None,
            result_format: ResultFormat::RawJson,
            filters: vec![],
            labels: vec![],
            report_status: 1,
            time_window: None,
            outputs: vec![],
        };
        let metrics = build_metrics(&task, 0, "hello");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].labels.get("result").unwrap(), "hello");
        assert_eq!(metrics[0].labels.get("status").unwrap(), "0");
    }

    #[test]
    fn shell_split_handles_simple_commands() {
        assert_eq!(shell_words_split("/bin/echo hello"), vec!["/bin/echo", "hello"]);
    }
}
