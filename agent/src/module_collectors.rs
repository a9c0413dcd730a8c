//! Concrete `ModuleScheduler::Collector` implementations: the host-resident
//! CPU/memory/disk/process counters §4.6 calls "in-process collectors"
//! without naming a concrete source. Grounded on `sysinfo`, the crate other
//! repos in the retrieval pack (meilisearch, tasker-core) already reach for
//! to read these same host counters — the teacher has no equivalent of its
//! own since its tasks are all network probes, not host metrics.

use crate::module_scheduler::Collector;
use shared::config::ModuleTask;
use shared::metrics::Metric;
use shared::utils::current_timestamp;
use std::sync::Mutex;
use sysinfo::{Disks, ProcessesToUpdate, System};

/// `task.args.kind` selects which host counter a `ModuleTask` reports.
/// Unknown kinds are a configuration error, not a silently empty result.
pub struct HostCollector {
    system: Mutex<System>,
}

impl HostCollector {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for HostCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Collector for HostCollector {
    async fn collect(&self, task: &ModuleTask) -> anyhow::Result<Vec<Metric>> {
        let kind = task.args.get("kind").and_then(|v| v.as_str()).unwrap_or("cpu");
        let now = current_timestamp();
        let mut system = self.system.lock().unwrap();

        match kind {
            "cpu" => {
                system.refresh_cpu_usage();
                let usage = system.global_cpu_usage() as f64;
                Ok(vec![Metric::gauge(task.name.clone(), usage, now)])
            }
            "memory" => {
                system.refresh_memory();
                let used = system.used_memory() as f64;
                let total = system.total_memory().max(1) as f64;
                let percent = used / total * 100.0;
                Ok(vec![Metric::gauge(task.name.clone(), percent, now)
                    .with_label("used_bytes", used.to_string())
                    .with_label("total_bytes", total.to_string())])
            }
            "disk" => {
                let disks = Disks::new_with_refreshed_list();
                let mut metrics = Vec::new();
                for disk in disks.list() {
                    let total = disk.total_space().max(1) as f64;
                    let available = disk.available_space() as f64;
                    let percent = (total - available) / total * 100.0;
                    metrics.push(
                        Metric::gauge(task.name.clone(), percent, now)
                            .with_label("mount", disk.mount_point().to_string_lossy().into_owned()),
                    );
                }
                Ok(metrics)
            }
            "process_count" => {
                system.refresh_processes(ProcessesToUpdate::All, true);
                Ok(vec![Metric::gauge(
                    task.name.clone(),
                    system.processes().len() as f64,
                    now,
                )])
            }
            other => anyhow::bail!("module task '{}' has unknown collector kind '{other}'", task.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: &str) -> ModuleTask {
        ModuleTask {
            id: "t1".into(),
            name: "t1.metric".into(),
            interval: 10,
            time_window: None,
            schedule_expr: Default::default(),
            args: serde_json::json!({ "kind": kind }),
            outputs: vec![],
        }
    }

    #[tokio::test]
    async fn cpu_kind_produces_one_gauge() {
        let collector = HostCollector::new();
        let metrics = collector.collect(&task("cpu")).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "t1.metric");
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let collector = HostCollector::new();
        assert!(collector.collect(&task("bogus")).await.is_err());
    }
}
