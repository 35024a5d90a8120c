mod common;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;

use modrun::output::OutputBroadcaster;
use modrun::output::markers::{parse_progress, parse_severity};
use modrun::types::{Severity, StreamSource};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn every_subscriber_sees_every_line_in_order() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(100);
    let mut first = broadcaster.subscribe("run-1");
    let mut second = broadcaster.subscribe("run-1");

    for i in 0..20 {
        broadcaster.append_line("run-1", format!("line {i}"), StreamSource::Stdout);
    }
    broadcaster.close_run("run-1");

    for sub in [&mut first, &mut second] {
        let mut seen = Vec::new();
        while let Some(line) = with_timeout(sub.recv()).await {
            seen.push(line.text);
        }
        let expected: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
        assert_eq!(seen, expected);
    }
    Ok(())
}

#[tokio::test]
async fn late_subscriber_misses_earlier_lines_without_replay() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(100);
    broadcaster.append_line("run-1", "before", StreamSource::Stdout);

    let mut live = broadcaster.subscribe("run-1");
    let mut replayed = broadcaster.subscribe_with_replay("run-1");
    broadcaster.append_line("run-1", "after", StreamSource::Stdout);
    broadcaster.close_run("run-1");

    assert_eq!(with_timeout(live.recv()).await.map(|l| l.text).as_deref(), Some("after"));
    assert!(with_timeout(live.recv()).await.is_none());

    let texts: Vec<String> = std::iter::from_fn(|| replayed.try_recv().map(|l| l.text)).collect();
    assert_eq!(texts, vec!["before".to_string(), "after".to_string()]);
    Ok(())
}

#[tokio::test]
async fn ring_buffer_keeps_a_contiguous_suffix() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(5);
    for i in 0..12 {
        broadcaster.append_line("run-1", format!("{i}"), StreamSource::Stdout);
    }

    let all = broadcaster.get_snapshot("run-1", None, None);
    let seqs: Vec<u64> = all.iter().map(|l| l.seq).collect();
    assert_eq!(seqs, vec![7, 8, 9, 10, 11]);

    let tail = broadcaster.get_snapshot("run-1", Some(2), None);
    let texts: Vec<&str> = tail.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["10", "11"]);

    assert_eq!(broadcaster.buffered_len("run-1"), 5);
    Ok(())
}

#[tokio::test]
async fn snapshot_since_filters_by_timestamp() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(100);
    broadcaster.append_line("run-1", "old", StreamSource::Stdout);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let marker = broadcaster.append_line("run-1", "new", StreamSource::Stderr);
    broadcaster.append_line("run-1", "newer", StreamSource::Stdout);

    let since = broadcaster.get_snapshot("run-1", None, Some(marker.timestamp));
    let texts: Vec<&str> = since.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["new", "newer"]);
    assert_eq!(since[0].source, StreamSource::Stderr);
    Ok(())
}

#[tokio::test]
async fn closed_runs_end_new_subscriptions_immediately() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(10);
    broadcaster.append_line("run-1", "only line", StreamSource::Stdout);
    broadcaster.close_run("run-1");

    assert!(broadcaster.is_closed("run-1"));
    assert_eq!(broadcaster.subscriber_count("run-1"), 0);

    let mut sub = broadcaster.subscribe_with_replay("run-1");
    assert_eq!(with_timeout(sub.recv()).await.map(|l| l.text).as_deref(), Some("only line"));
    assert!(with_timeout(sub.recv()).await.is_none());
    Ok(())
}

#[tokio::test]
async fn cleanup_releases_the_buffer() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(10);
    broadcaster.append_line("run-1", "x", StreamSource::Stdout);
    broadcaster.append_line("run-2", "y", StreamSource::Stdout);

    assert!(broadcaster.cleanup_run("run-1"));
    assert!(!broadcaster.cleanup_run("run-1"));
    assert_eq!(broadcaster.run_ids(), vec!["run-2".to_string()]);
    assert!(broadcaster.get_snapshot("run-1", None, None).is_empty());
    Ok(())
}

#[tokio::test]
async fn subscribing_after_cleanup_ends_at_once_without_a_new_buffer() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(10);
    broadcaster.append_line("run-1", "x", StreamSource::Stdout);
    broadcaster.close_run("run-1");
    assert!(broadcaster.cleanup_run("run-1"));

    let mut replayed = broadcaster.subscribe_with_replay("run-1");
    let mut live = broadcaster.subscribe("run-1");
    assert!(with_timeout(replayed.recv()).await.is_none());
    assert!(with_timeout(live.recv()).await.is_none());

    broadcaster.close_run("run-1");
    assert!(broadcaster.is_closed("run-1"));
    assert!(broadcaster.run_ids().is_empty());
    Ok(())
}

#[tokio::test]
async fn abandoned_subscriptions_to_silent_runs_are_pruned() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(10);
    let abandoned = broadcaster.subscribe("never-ran");
    let _held = broadcaster.subscribe("waiting");
    broadcaster.append_line("busy", "x", StreamSource::Stdout);
    drop(abandoned);

    assert_eq!(broadcaster.prune_idle(), 1);
    let mut remaining = broadcaster.run_ids();
    remaining.sort();
    assert_eq!(remaining, vec!["busy".to_string(), "waiting".to_string()]);
    Ok(())
}

#[tokio::test]
async fn lines_are_appended_to_the_run_log_file() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let broadcaster = OutputBroadcaster::with_log_dir(10, dir.path().join("logs"))?;

    broadcaster.append_line("run-1", "hello", StreamSource::Stdout);
    broadcaster.append_line("run-1", "[ERROR] boom", StreamSource::Stderr);
    broadcaster.close_run("run-1");
    with_timeout(broadcaster.flush()).await;

    let path = broadcaster.log_path("run-1").expect("file logging enabled");
    assert_eq!(path, dir.path().join("logs").join("run-1.log"));
    let contents = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("[stdout] [INFO] hello"), "got {}", lines[0]);
    assert!(lines[1].ends_with("[stderr] [ERROR] [ERROR] boom"), "got {}", lines[1]);
    Ok(())
}

#[tokio::test]
async fn appended_lines_carry_parsed_severity() -> TestResult {
    init_tracing();
    let broadcaster = OutputBroadcaster::new(10);

    let warn = broadcaster.append_line("run-1", "WARNING: disk almost full", StreamSource::Stderr);
    let plain = broadcaster.append_line("run-1", "just text", StreamSource::Stdout);

    assert_eq!(warn.level, Severity::Warning);
    assert_eq!(plain.level, Severity::Info);
    Ok(())
}

#[test]
fn severity_markers_are_recognised() {
    assert_eq!(parse_severity("[debug] details"), Severity::Debug);
    assert_eq!(parse_severity("step 3 [ERROR] failed"), Severity::Error);
    assert_eq!(parse_severity("fatal: cannot continue"), Severity::Critical);
    assert_eq!(parse_severity("warn: retrying"), Severity::Warning);
    assert_eq!(parse_severity("an error happened"), Severity::Info);
}

#[test]
fn progress_markers_are_clamped_percentages() {
    assert_eq!(parse_progress("PROGRESS: 42%"), Some(42));
    assert_eq!(parse_progress("[progress] 7"), Some(7));
    assert_eq!(parse_progress("progress: 150"), Some(100));
    assert_eq!(parse_progress("progress: 33.9%"), Some(33));
    assert_eq!(parse_progress("made some progress"), None);
}
