// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod output;
pub mod registry;
pub mod resources;
pub mod types;

use std::time::Duration;

use anyhow::{Result, bail};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cli::{BatchArgs, CliArgs, Command, ExecArgs, RunsArgs};
use crate::config::{Settings, load_or_default};
use crate::engine::{Engine, ExecutionOptions, ExecutionOutcome, Orchestrator, StreamingRun, WorkItem};
use crate::exec::{HostCapabilities, SpawnRequest, resolve_mode};
use crate::output::LogLine;
use crate::registry::history::read_history;
use crate::registry::{RunQuery, RunRegistry, RunStatus};
use crate::resources::ResourceGate;
use crate::types::StreamSource;

const BACKGROUND_POLL: Duration = Duration::from_millis(100);

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let settings = load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Exec(exec) => run_exec(settings, exec).await,
        Command::Batch(batch) => run_batch(settings, batch).await,
        Command::Runs(query) => list_runs(&settings, query).await,
        Command::Serve => serve(settings).await,
        Command::Probe => probe(&settings).await,
    }
}

fn split_command(command: &[String]) -> Result<SpawnRequest> {
    let Some((program, args)) = command.split_first() else {
        bail!("no program given");
    };
    Ok(SpawnRequest::new(program).args(args.iter().cloned()))
}

async fn run_exec(settings: Settings, exec: ExecArgs) -> Result<i32> {
    let mut request = split_command(&exec.command)?;
    if let Some(cwd) = exec.cwd {
        request = request.current_dir(cwd);
    }

    let mut options = ExecutionOptions::new();
    if let Some(pattern) = exec.pattern {
        options = options.pattern(pattern);
    }
    if exec.stream {
        options = options.stream();
    }
    if exec.background {
        options = options.background();
    }
    if exec.pooled {
        options = options.pooled();
    }
    if let Some(timeout) = exec.timeout {
        options = options.timeout(timeout);
    }

    let engine = Engine::build(settings).await?;
    let result = exec_outcome(engine.orchestrator(), request, options).await;
    engine.shutdown().await?;
    result
}

async fn exec_outcome(
    orchestrator: &Orchestrator,
    request: SpawnRequest,
    options: ExecutionOptions,
) -> Result<i32> {
    match orchestrator.execute(request, options).await? {
        ExecutionOutcome::Simple(output) | ExecutionOutcome::Pooled(output) => {
            if !output.stdout.is_empty() {
                println!("{}", output.stdout);
            }
            if !output.stderr.is_empty() {
                eprintln!("{}", output.stderr);
            }
            Ok(output.exit_code)
        }
        ExecutionOutcome::Streaming(run) => stream_to_terminal(run).await,
        ExecutionOutcome::FireAndForget { run_id } => {
            println!("{run_id}");
            wait_until_terminal(orchestrator, &run_id).await
        }
        other => bail!("pattern '{}' is not available from `exec`", other.pattern()),
    }
}

fn print_line(line: &LogLine) {
    match line.source {
        StreamSource::Stdout => println!("{}", line.text),
        StreamSource::Stderr => eprintln!("{}", line.text),
    }
}

async fn stream_to_terminal(run: StreamingRun) -> Result<i32> {
    let mut subscription = run.subscribe();
    let token = run.token().clone();

    loop {
        tokio::select! {
            line = subscription.recv() => match line {
                Some(line) => print_line(&line),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !token.is_cancelled() => {
                warn!(run_id = %run.run_id(), "interrupted; cancelling run");
                token.cancel();
            }
        }
    }

    Ok(run.wait().await?)
}

async fn wait_until_terminal(orchestrator: &Orchestrator, run_id: &str) -> Result<i32> {
    loop {
        let run = orchestrator.registry().get(run_id)?;
        if run.is_terminal() {
            info!(run_id = %run_id, status = %run.status, "background run finished");
            if let Some(error) = &run.error {
                eprintln!("{}: {error}", run.status);
            }
            return Ok(match (run.status, run.exit_code) {
                (RunStatus::Completed, _) => 0,
                (_, Some(code)) if code > 0 => code,
                _ => 1,
            });
        }
        sleep(BACKGROUND_POLL).await;
    }
}

async fn run_batch(settings: Settings, batch: BatchArgs) -> Result<i32> {
    let request = split_command(&batch.command)?;
    let items = batch
        .items
        .iter()
        .enumerate()
        .map(|(i, args)| {
            let args = args.split_whitespace().map(str::to_string).collect();
            WorkItem::new(format!("item-{}", i + 1), args)
        })
        .collect();

    let mut options = ExecutionOptions::new().batch(items);
    if let Some(limit) = batch.max_concurrent {
        options = options.max_concurrent(limit);
    }
    if let Some(timeout) = batch.timeout {
        options = options.timeout(timeout);
    }

    let engine = Engine::build(settings).await?;
    let outcome = engine.orchestrator().execute(request, options).await;
    engine.shutdown().await?;

    let ExecutionOutcome::Batch(results) = outcome? else {
        bail!("batch execution returned a non-batch outcome");
    };

    let mut failed = 0usize;
    for result in &results {
        match (&result.output, &result.error) {
            (Some(output), _) => println!("{}\tok\trun={}", result.id, output.run_id),
            (None, error) => {
                failed += 1;
                println!(
                    "{}\tfailed\t{}",
                    result.id,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    info!(total = results.len(), failed, "batch finished");
    Ok(if failed == 0 { 0 } else { 1 })
}

async fn list_runs(settings: &Settings, query: RunsArgs) -> Result<i32> {
    let Some(path) = settings.history.path.clone() else {
        bail!("no [history].path configured");
    };

    let history = tokio::task::spawn_blocking(move || read_history(&path)).await??;
    let registry = RunRegistry::new();
    for run in history.map(|h| h.runs).unwrap_or_default() {
        let id = run.id.clone();
        if let Err(e) = registry.create(run) {
            warn!(run_id = %id, error = %e, "skipping invalid history entry");
        }
    }

    let mut filter = RunQuery::new().limit(query.limit);
    if let Some(target) = query.target {
        filter = filter.target(target);
    }
    if let Some(status) = query.status {
        filter = filter.status(status);
    }

    for run in registry.list(&filter) {
        let exit = run
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}\texit={}",
            run.id,
            run.created_at.to_rfc3339(),
            run.target,
            run.status,
            exit
        );
    }
    Ok(0)
}

async fn serve(settings: Settings) -> Result<i32> {
    let engine = Engine::build(settings).await?;
    let started = engine.start_periodic_tasks();
    info!(started, "serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.shutdown().await?;

    for (name, stats) in engine.orchestrator().scheduler().all_statistics() {
        println!(
            "{name}\truns={}\terrors={}",
            stats.run_count, stats.error_count
        );
    }
    Ok(0)
}

async fn probe(settings: &Settings) -> Result<i32> {
    let caps = HostCapabilities::probe();
    let mode = resolve_mode(settings.executor.mode)?;
    let gate = ResourceGate::new(settings.resources);
    let sample = gate.sample().await;

    println!("execution mode: {mode}");
    println!("capabilities:   {caps:?}");
    match sample.cpu_percent {
        Some(cpu) => println!("cpu:            {cpu:.1}%"),
        None => println!("cpu:            unknown"),
    }
    match sample.available_memory_mb() {
        Some(mb) => println!("memory:         {mb} MiB available"),
        None => println!("memory:         unknown"),
    }
    match gate.check().await {
        Ok(()) => println!("admission:      admit"),
        Err(e) => println!("admission:      deny ({e})"),
    }
    Ok(0)
}
