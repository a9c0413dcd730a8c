//! `TaskRegistry` (C4): versioned, thread-safe store of task definitions
//! keyed by family (§4.4).
//!
//! The teacher holds its single task family behind `Arc<RwLock<TasksConfig>>`
//! and has callers read a cloned snapshot; this generalizes that pattern to
//! four families and swaps the lock for a `tokio::sync::watch` channel, which
//! gives `Get`/`Subscribe` for free: the channel always holds the latest
//! value (satisfying R4 — snapshots are immutable once observed, identified
//! by `Arc` pointer rather than content) and `changed()` is the push
//! notification §4.4 asks for.

use shared::config::{ModuleTask, ProbeTask, ScrapeTask, ScriptTask, TasksSnapshot};
use std::sync::Arc;
use tokio::sync::watch;

/// One family's slice of the registry. Generic so the same swap/subscribe
/// machinery serves all four task families.
pub struct FamilyRegistry<T> {
    tx: watch::Sender<Arc<TasksSnapshot<T>>>,
}

impl<T> FamilyRegistry<T> {
    pub fn new(initial: TasksSnapshot<T>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Atomic replace; returns the previous snapshot. Readers holding the
    /// old `Arc` keep a perfectly valid, never-mutated view (R4).
    pub fn swap(&self, snapshot: TasksSnapshot<T>) -> Arc<TasksSnapshot<T>> {
        let previous = self.tx.borrow().clone();
        let _ = self.tx.send(Arc::new(snapshot));
        previous
    }

    /// A shared read-only reference to the current snapshot. Cheap: just an
    /// `Arc` clone, no lock held across the caller's scheduling tick.
    pub fn current(&self) -> Arc<TasksSnapshot<T>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> FamilyHandle<T> {
        FamilyHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// A scheduler's private handle into one family: reads are wait-free,
/// `changed()` is how `ConfigWatcher`'s swaps are observed as push
/// notifications without polling the registry.
pub struct FamilyHandle<T> {
    rx: watch::Receiver<Arc<TasksSnapshot<T>>>,
}

impl<T> FamilyHandle<T> {
    pub fn current(&self) -> Arc<TasksSnapshot<T>> {
        self.rx.borrow().clone()
    }

    /// Resolves once the registry has been swapped at least once since the
    /// last call. Schedulers that want to react immediately to a config
    /// change race this against their tick interval in `select!`.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl<T> Clone for FamilyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// The registry proper: one `FamilyRegistry` per task family (§3, §4.4).
/// Built once at startup and handed to `ConfigWatcher` (which owns the
/// writer side via `swap`) and to each scheduler (which only ever reads).
pub struct TaskRegistry {
    pub modules: FamilyRegistry<ModuleTask>,
    pub scripts: FamilyRegistry<ScriptTask>,
    pub scrapes: FamilyRegistry<ScrapeTask>,
    pub probes: FamilyRegistry<ProbeTask>,
}

impl TaskRegistry {
    pub fn empty() -> Self {
        Self {
            modules: FamilyRegistry::new(TasksSnapshot::new(Vec::new(), String::new())),
            scripts: FamilyRegistry::new(TasksSnapshot::new(Vec::new(), String::new())),
            scrapes: FamilyRegistry::new(TasksSnapshot::new(Vec::new(), String::new())),
            probes: FamilyRegistry::new(TasksSnapshot::new(Vec::new(), String::new())),
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_previous_and_current_sees_new() {
        let registry: FamilyRegistry<ModuleTask> =
            FamilyRegistry::new(TasksSnapshot::new(Vec::new(), "v0".into()));
        let previous = registry.swap(TasksSnapshot::new(Vec::new(), "v1".into()));
        assert_eq!(previous.fingerprint, "v0");
        assert_eq!(registry.current().fingerprint, "v1");
    }

    #[test]
    fn old_snapshot_handle_survives_swap_unmutated() {
        let registry: FamilyRegistry<ModuleTask> =
            FamilyRegistry::new(TasksSnapshot::new(Vec::new(), "v0".into()));
        let held = registry.current();
        registry.swap(TasksSnapshot::new(Vec::new(), "v1".into()));
        assert_eq!(held.fingerprint, "v0"); // R4: the old reference never mutates
        assert_eq!(registry.current().fingerprint, "v1");
    }

    #[tokio::test]
    async fn subscriber_observes_change() {
        let registry: FamilyRegistry<ModuleTask> =
            FamilyRegistry::new(TasksSnapshot::new(Vec::new(), "v0".into()));
        let mut handle = registry.subscribe();
        registry.swap(TasksSnapshot::new(Vec::new(), "v1".into()));
        assert!(handle.changed().await);
        assert_eq!(handle.current().fingerprint, "v1");
    }
}
