mod common;
use crate::common::{eventually, init_tracing, with_timeout};
#[cfg(target_os = "linux")]
use crate::common::process_alive;

use std::error::Error;
use std::time::Duration;

use modrun::errors::ErrorKind;
use modrun::exec::{
    ConcurrentBackend, DryRunBackend, ExecutionBackend, HostCapabilities, SpawnRequest,
    SynchronousBackend, TerminationOutcome, ThreadBackedBackend, build_backend,
    resolve_mode_with,
};
use modrun::types::ExecutionMode;

type TestResult = Result<(), Box<dyn Error>>;

fn sh(script: &str) -> SpawnRequest {
    SpawnRequest::new("sh").args(["-c", script])
}

async fn run_to_end(backend: &dyn ExecutionBackend, request: &SpawnRequest) -> Result<(i32, Vec<String>, Vec<String>), Box<dyn Error>> {
    let spawned = backend.spawn(request).await?;
    let stdout = tokio::spawn(spawned.stdout.collect_lines());
    let stderr = tokio::spawn(spawned.stderr.collect_lines());
    let code = backend.wait(&spawned.handle).await?;
    Ok((code, stdout.await?, stderr.await?))
}

#[tokio::test]
async fn echo_hello_exits_zero_with_captured_stdout() -> TestResult {
    init_tracing();
    let backend = ConcurrentBackend::new();

    let (code, stdout, stderr) = run_to_end(&backend, &SpawnRequest::new("echo").arg("hello")).await?;

    assert_eq!(code, 0);
    assert_eq!(stdout, vec!["hello".to_string()]);
    assert!(stderr.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_real_mode_reports_the_exit_code() -> TestResult {
    init_tracing();
    let backends: Vec<Box<dyn ExecutionBackend>> = vec![
        Box::new(ConcurrentBackend::new()),
        Box::new(ThreadBackedBackend::new()),
        Box::new(SynchronousBackend::new()),
    ];

    for backend in backends {
        let (code, stdout, stderr) =
            run_to_end(backend.as_ref(), &sh("echo out; echo err >&2; exit 3")).await?;
        assert_eq!(code, 3, "mode {}", backend.mode());
        assert_eq!(stdout, vec!["out".to_string()], "mode {}", backend.mode());
        assert_eq!(stderr, vec!["err".to_string()], "mode {}", backend.mode());
    }
    Ok(())
}

#[tokio::test]
async fn missing_program_is_target_not_found() -> TestResult {
    init_tracing();
    let backend = ConcurrentBackend::new();

    let err = backend
        .spawn(&SpawnRequest::new("definitely-not-a-real-program-modrun"))
        .await
        .expect_err("spawn should fail");

    assert_eq!(err.kind(), ErrorKind::TargetNotFound);
    Ok(())
}

#[tokio::test]
async fn working_directory_and_env_are_applied() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let backend = ConcurrentBackend::new();
    let request = sh("pwd; echo \"$MODRUN_TEST_VALUE\"")
        .current_dir(dir.path())
        .env("MODRUN_TEST_VALUE", "42");

    let (code, stdout, _) = run_to_end(&backend, &request).await?;

    assert_eq!(code, 0);
    let expected = dir.path().canonicalize()?;
    assert_eq!(std::path::Path::new(&stdout[0]).canonicalize()?, expected);
    assert_eq!(stdout[1], "42");
    Ok(())
}

#[tokio::test]
async fn dry_run_never_spawns() -> TestResult {
    init_tracing();
    let backend = DryRunBackend::new();

    let (code, stdout, stderr) =
        run_to_end(&backend, &SpawnRequest::new("rm").args(["-rf", "/nonexistent"])).await?;

    assert_eq!(code, 0);
    assert!(stdout.is_empty());
    assert!(stderr.is_empty());
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(backend.mode(), ExecutionMode::DryRun);
    Ok(())
}

#[tokio::test]
async fn terminate_stops_a_sleeping_process_gracefully() -> TestResult {
    init_tracing();
    let backend = ConcurrentBackend::new();
    let spawned = backend.spawn(&SpawnRequest::new("sleep").arg("30")).await?;

    let outcome = backend
        .terminate(&spawned.handle, Duration::from_secs(2))
        .await?;

    assert_eq!(outcome, TerminationOutcome::Graceful);
    assert!(spawned.handle.has_exited());

    let again = backend
        .terminate(&spawned.handle, Duration::from_secs(2))
        .await?;
    assert_eq!(again, TerminationOutcome::AlreadyExited);
    Ok(())
}

#[tokio::test]
async fn terminate_escalates_when_sigterm_is_ignored() -> TestResult {
    init_tracing();
    let backend = ConcurrentBackend::new();
    let spawned = backend
        .spawn(&sh("trap '' TERM; echo ready; sleep 30"))
        .await?;
    let mut stdout = spawned.stdout;
    assert_eq!(stdout.next_line().await.as_deref(), Some("ready"));

    let outcome = backend
        .terminate(&spawned.handle, Duration::from_millis(200))
        .await?;

    assert_eq!(outcome, TerminationOutcome::Forced);
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn terminate_reaches_the_children_of_a_script() -> TestResult {
    init_tracing();
    let backends: Vec<Box<dyn ExecutionBackend>> = vec![
        Box::new(ConcurrentBackend::new()),
        Box::new(ThreadBackedBackend::new()),
    ];

    for backend in backends {
        let spawned = backend.spawn(&sh("sleep 30 & echo $!; wait")).await?;
        let mut stdout = spawned.stdout;
        let sleeper: u32 = stdout.next_line().await.ok_or("no pid printed")?.trim().parse()?;
        assert!(process_alive(sleeper), "mode {}", backend.mode());

        let outcome = backend
            .terminate(&spawned.handle, Duration::from_secs(2))
            .await?;

        assert_eq!(outcome, TerminationOutcome::Graceful, "mode {}", backend.mode());
        with_timeout(eventually(|| !process_alive(sleeper))).await;
    }
    Ok(())
}

#[test]
fn thread_backed_processes_share_a_small_blocking_pool() -> TestResult {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(4)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let backend = ThreadBackedBackend::new();
        let requests: Vec<SpawnRequest> = (0..6)
            .map(|i| sh(&format!("echo out-{i}; echo err-{i} >&2; exit {i}")))
            .collect();

        let results = with_timeout(futures_util::future::join_all(
            requests.iter().map(|request| run_to_end(&backend, request)),
        ))
        .await;

        for (i, result) in results.into_iter().enumerate() {
            let (code, stdout, stderr) = result?;
            assert_eq!(code, i as i32);
            assert_eq!(stdout, vec![format!("out-{i}")]);
            assert_eq!(stderr, vec![format!("err-{i}")]);
        }
        assert_eq!(backend.live_processes(), 0);
        Ok(())
    })
}

#[tokio::test]
async fn cleanup_kills_live_processes() -> TestResult {
    init_tracing();
    let backend = ConcurrentBackend::new();
    let spawned = backend.spawn(&SpawnRequest::new("sleep").arg("30")).await?;
    assert_eq!(backend.live_processes(), 1);

    backend.cleanup().await;

    tokio::time::timeout(Duration::from_secs(2), spawned.handle.wait()).await?;
    Ok(())
}

#[test]
fn mode_resolution_prefers_config_then_env_then_probe() {
    init_tracing();
    let caps = HostCapabilities {
        runtime_available: true,
        multi_thread_runtime: true,
        async_process_spawn: true,
    };

    let mode = resolve_mode_with(Some(ExecutionMode::DryRun), Some("synchronous"), &caps)
        .expect("config mode is valid");
    assert_eq!(mode, ExecutionMode::DryRun);

    let mode = resolve_mode_with(None, Some("thread_backed"), &caps).expect("env mode is valid");
    assert_eq!(mode, ExecutionMode::ThreadBacked);

    let mode = resolve_mode_with(None, Some("bogus"), &caps).expect("bad env value is ignored");
    assert_eq!(mode, ExecutionMode::Concurrent);

    let mode = resolve_mode_with(None, None, &caps).expect("auto-detect");
    assert_eq!(mode, ExecutionMode::Concurrent);
}

#[test]
fn unusable_mode_is_reported_with_a_remedy() {
    init_tracing();
    let no_runtime = HostCapabilities {
        runtime_available: false,
        multi_thread_runtime: false,
        async_process_spawn: true,
    };

    assert_eq!(no_runtime.recommended_mode(), ExecutionMode::Synchronous);
    let err = resolve_mode_with(Some(ExecutionMode::Concurrent), None, &no_runtime)
        .expect_err("concurrent needs a runtime");
    assert_eq!(err.kind(), ErrorKind::ModeMisconfigured);
    assert!(err.to_string().contains("concurrent"));
}

#[test]
fn build_backend_matches_the_mode() {
    for mode in [
        ExecutionMode::Concurrent,
        ExecutionMode::ThreadBacked,
        ExecutionMode::Synchronous,
        ExecutionMode::DryRun,
    ] {
        assert_eq!(build_backend(mode).mode(), mode);
    }
}
