mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use modrun::errors::{ErrorKind, ModrunError};
use modrun::registry::history::{backup_path, read_history};
use modrun::registry::{INTERRUPTED_BY_RESTART, Run, RunQuery, RunRegistry, RunStatus};

type TestResult = Result<(), Box<dyn Error>>;

fn finished_run(target: &str, hours_ago: i64, exit_code: i32) -> Result<Run, ModrunError> {
    let mut run = Run::new(target);
    run.mark_running()?;
    run.mark_exited(exit_code)?;
    let at = Utc::now() - chrono::Duration::hours(hours_ago);
    run.created_at = at;
    run.started_at = Some(at);
    run.completed_at = Some(at + chrono::Duration::seconds(1));
    Ok(run)
}

#[test]
fn lifecycle_queued_running_completed() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let run = Run::new("job.sh").with_parameter("env", json!("prod"));
    let id = run.id.clone();
    registry.create(run)?;

    registry.modify(&id, |r| r.mark_running())?;
    registry.modify(&id, |r| r.set_progress(40))?;
    registry.modify(&id, |r| r.mark_exited(0))?;

    let run = registry.get(&id)?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.exit_code, Some(0));
    assert_eq!(run.progress, Some(100));
    assert_eq!(run.parameters.get("env"), Some(&json!("prod")));
    let started = run.started_at.expect("started");
    let completed = run.completed_at.expect("completed");
    assert!(run.created_at <= started && started <= completed);
    Ok(())
}

#[test]
fn non_zero_exit_fails_the_run() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let run = Run::new("job.sh");
    let id = run.id.clone();
    registry.create(run)?;

    registry.modify(&id, |r| r.mark_running())?;
    registry.modify(&id, |r| r.mark_exited(3))?;

    let run = registry.get(&id)?;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.exit_code, Some(3));
    assert!(run.error.as_deref().unwrap_or_default().contains('3'));
    Ok(())
}

#[test]
fn terminal_runs_reject_every_update() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let run = finished_run("job.sh", 0, 0)?;
    let id = run.id.clone();
    registry.create(run.clone())?;

    let err = registry.update(run.clone()).expect_err("identical update still conflicts");
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    let mut changed = run.clone();
    changed.error = Some("late".to_string());
    assert!(registry.update(changed).is_err());

    let err = registry
        .modify(&id, |r| r.mark_cancelled(None))
        .expect_err("cannot cancel a completed run");
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    assert_eq!(registry.get(&id)?, run);
    Ok(())
}

#[test]
fn illegal_transitions_leave_the_run_untouched() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let run = Run::new("job.sh");
    let id = run.id.clone();
    registry.create(run.clone())?;

    assert!(registry.modify(&id, |r| r.mark_exited(0)).is_err());
    assert!(registry.modify(&id, |r| r.set_progress(10)).is_err());

    let mut renamed = run.clone();
    renamed.target = "other.sh".to_string();
    assert!(registry.update(renamed).is_err());

    assert_eq!(registry.get(&id)?, run);
    Ok(())
}

#[test]
fn duplicate_and_unknown_ids_are_errors() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let run = Run::new("job.sh");
    registry.create(run.clone())?;

    assert_eq!(registry.create(run).expect_err("duplicate").kind(), ErrorKind::StateConflict);
    assert_eq!(registry.get("missing").expect_err("unknown").kind(), ErrorKind::RunNotFound);
    assert_eq!(
        registry.modify("missing", |r| r.mark_running()).expect_err("unknown").kind(),
        ErrorKind::RunNotFound
    );
    Ok(())
}

#[test]
fn list_is_newest_first_with_filters_and_paging() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let mut ids = Vec::new();
    for (i, target) in ["a.sh", "b.sh", "a.sh", "a.sh"].iter().enumerate() {
        let run = finished_run(target, 10 - i as i64, if i == 2 { 1 } else { 0 })?;
        ids.push(run.id.clone());
        registry.create(run)?;
    }

    let all: Vec<String> = registry.list(&RunQuery::new()).into_iter().map(|r| r.id).collect();
    assert_eq!(all, vec![ids[3].clone(), ids[2].clone(), ids[1].clone(), ids[0].clone()]);

    let a_runs = registry.list(&RunQuery::new().target("a.sh"));
    assert_eq!(a_runs.len(), 3);

    let failed = registry.list(&RunQuery::new().status(RunStatus::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, ids[2]);

    let page: Vec<String> = registry
        .list(&RunQuery::new().offset(1).limit(2))
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(page, vec![ids[2].clone(), ids[1].clone()]);
    Ok(())
}

#[test]
fn eviction_drops_only_old_terminal_runs() -> TestResult {
    init_tracing();
    let registry = RunRegistry::new();
    let old = finished_run("job.sh", 48, 0)?;
    let recent = finished_run("job.sh", 1, 0)?;
    let mut stale_queued = Run::new("job.sh");
    stale_queued.created_at = Utc::now() - chrono::Duration::hours(72);

    registry.create(old.clone())?;
    registry.create(recent.clone())?;
    registry.create(stale_queued.clone())?;

    let evicted = registry.evict_older_than(Duration::from_secs(24 * 3600), true);

    assert_eq!(evicted, 1);
    assert!(!registry.contains(&old.id));
    assert!(registry.contains(&recent.id));
    assert!(registry.contains(&stale_queued.id));

    assert_eq!(registry.evict_older_than(Duration::from_secs(24 * 3600), false), 1);
    assert_eq!(registry.len(), 1);
    Ok(())
}

#[tokio::test]
async fn history_round_trips_and_reconciles_interrupted_runs() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state").join("runs.json");

    let registry = RunRegistry::with_history(&path);
    let done = finished_run("done.sh", 1, 0)?;
    let mut running = Run::new("long.sh");
    running.mark_running()?;
    let queued = Run::new("later.sh");
    registry.create(done.clone())?;
    registry.create(running.clone())?;
    registry.create(queued.clone())?;

    assert!(registry.snapshot().await?);
    assert!(!registry.is_dirty());
    assert!(!registry.snapshot().await?, "nothing changed since the last snapshot");

    let restored = RunRegistry::load(&path).await?;
    assert_eq!(restored.len(), 3);
    assert_eq!(restored.get(&done.id)?, done);
    for id in [&running.id, &queued.id] {
        let run = restored.get(id)?;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED_BY_RESTART));
        run.validate()?;
    }
    assert!(restored.is_dirty());
    Ok(())
}

#[tokio::test]
async fn snapshots_rotate_backups_and_survive_a_corrupt_file() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("runs.json");
    let registry = RunRegistry::with_history(&path);

    let first = finished_run("one.sh", 2, 0)?;
    registry.create(first.clone())?;
    registry.snapshot().await?;
    registry.create(finished_run("two.sh", 1, 0)?)?;
    registry.snapshot().await?;

    assert!(backup_path(&path, 1).exists());
    let backup = read_history(&backup_path(&path, 1))?.expect("backup readable");
    assert_eq!(backup.runs.len(), 1);

    std::fs::write(&path, "{ not json")?;
    let restored = RunRegistry::load(&path).await?;
    assert_eq!(restored.len(), 1);
    assert!(restored.contains(&first.id));
    Ok(())
}

#[tokio::test]
async fn loading_a_missing_file_gives_an_empty_registry() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let registry = RunRegistry::load(dir.path().join("absent.json")).await?;

    assert!(registry.is_empty());
    assert!(!registry.is_dirty());
    Ok(())
}

#[test]
fn status_parses_both_spellings_of_cancelled() {
    assert_eq!("cancelled".parse::<RunStatus>(), Ok(RunStatus::Cancelled));
    assert_eq!("Canceled".parse::<RunStatus>(), Ok(RunStatus::Cancelled));
    assert!("done".parse::<RunStatus>().is_err());
}
