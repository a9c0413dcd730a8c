//! Top-N slowest-task leaderboard and agent self-metric attribution (§4.12).
//!
//! Grounded on the teacher's `TaskScheduler` duration bookkeeping in
//! `scheduler.rs` (it times each task execution to feed its own status
//! metrics); this factors that timing concern out into a standalone
//! component schedulers call around their critical sections, per §9's
//! "capability interface" guidance, rather than each scheduler keeping its
//! own ad hoc timing map.

use shared::defaults::RESOURCE_MONITOR_TOP_N;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    name: String,
    duration: Duration,
}

pub struct ResourceMonitor {
    top_n: usize,
    running: Mutex<HashMap<String, Instant>>,
    completed: Mutex<Vec<Entry>>,
}

/// Returned by `begin`; `end()` records the elapsed duration and removes
/// the task from the running set.
pub struct RunHandle<'a> {
    monitor: &'a ResourceMonitor,
    name: String,
    started: Instant,
}

impl ResourceMonitor {
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            running: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn begin(&self, task_name: impl Into<String>) -> RunHandle<'_> {
        let name = task_name.into();
        let started = Instant::now();
        self.running.lock().unwrap().insert(name.clone(), started);
        RunHandle {
            monitor: self,
            name,
            started,
        }
    }

    fn record(&self, name: String, duration: Duration) {
        self.running.lock().unwrap().remove(&name);
        let mut completed = self.completed.lock().unwrap();
        completed.push(Entry { name, duration });
        completed.sort_by(|a, b| b.duration.cmp(&a.duration));
        completed.truncate(self.top_n.max(1) * 4); // keep a little slack before trimming to N on print
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Formatted leaderboard of the slowest `n` completed tasks, newest
    /// duplicate entries winning ties by recency of insertion.
    pub fn print_top(&self, n: usize) -> String {
        let completed = self.completed.lock().unwrap();
        let mut lines = vec![format!("top {} slowest tasks:", n.min(completed.len()))];
        for entry in completed.iter().take(n) {
            lines.push(format!("  {:>8.2?}  {}", entry.duration, entry.name));
        }
        lines.join("\n")
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(RESOURCE_MONITOR_TOP_N)
    }
}

impl<'a> RunHandle<'a> {
    pub fn end(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.monitor.record(self.name.clone(), elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn begin_end_records_duration_and_clears_running() {
        let monitor = ResourceMonitor::new(5);
        let handle = monitor.begin("task-a");
        assert_eq!(monitor.running_count(), 1);
        sleep(Duration::from_millis(5));
        let elapsed = handle.end();
        assert!(elapsed >= Duration::from_millis(5));
        assert_eq!(monitor.running_count(), 0);
    }

    #[test]
    fn print_top_orders_by_duration_descending() {
        let monitor = ResourceMonitor::new(5);
        monitor.record("fast".into(), Duration::from_millis(1));
        monitor.record("slow".into(), Duration::from_millis(50));
        let report = monitor.print_top(2);
        let slow_pos = report.find("slow").unwrap();
        let fast_pos = report.find("fast").unwrap();
        assert!(slow_pos < fast_pos);
    }
}
