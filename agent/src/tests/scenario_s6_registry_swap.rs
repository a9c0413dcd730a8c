//! S6 — a config swap never lets a reader observe a snapshot that mixes
//! fields from before and after the swap: a handle holds one `Arc` for the
//! whole snapshot, so a reader sees either everything from the old
//! generation or everything from the new one (§8 S6, R4).

use crate::registry::FamilyRegistry;
use shared::config::{ResultFormat, ScriptTask, TasksSnapshot};

fn make_task(id: &str, command: &str) -> ScriptTask {
    ScriptTask {
        id: id.to_string(),
        name: id.to_string(),
        command: command.to_string(),
        user: None,
        interval: 1,
        timeout: 1,
        first_schedule: None,
        result_format: ResultFormat::Raw,
        filters: vec![],
        labels: vec![],
        report_status: 0,
        time_window: None,
        outputs: vec![],
    }
}

#[test]
fn a_held_snapshot_never_mixes_generations() {
    let registry: FamilyRegistry<ScriptTask> = FamilyRegistry::new(TasksSnapshot::new(
        vec![make_task("a", "/bin/true")],
        "v0".to_string(),
    ));

    let held = registry.current();
    registry.swap(TasksSnapshot::new(vec![make_task("b", "/bin/false")], "v1".to_string()));

    // The handle obtained before the swap still sees only the old
    // generation: old id, old fingerprint, old command — no field from `v1`.
    assert_eq!(held.fingerprint, "v0");
    assert_eq!(held.tasks.len(), 1);
    assert_eq!(held.tasks[0].id, "a");
    assert_eq!(held.tasks[0].command, "/bin/true");

    // A fresh read after the swap sees only the new generation, entirely.
    let after = registry.current();
    assert_eq!(after.fingerprint, "v1");
    assert_eq!(after.tasks[0].id, "b");
    assert_eq!(after.tasks[0].command, "/bin/false");
}

#[tokio::test]
async fn a_subscriber_handle_also_flips_atomically() {
    let registry: FamilyRegistry<ScriptTask> = FamilyRegistry::new(TasksSnapshot::new(
        vec![make_task("a", "/bin/true")],
        "v0".to_string(),
    ));
    let mut handle = registry.subscribe();
    assert_eq!(handle.current().tasks[0].id, "a");

    registry.swap(TasksSnapshot::new(vec![make_task("b", "/bin/false")], "v1".to_string()));
    assert!(handle.changed().await);

    let snapshot = handle.current();
    assert_eq!(snapshot.fingerprint, "v1");
    assert_eq!(snapshot.tasks[0].id, "b");
    assert_eq!(snapshot.tasks[0].command, "/bin/false");
}
