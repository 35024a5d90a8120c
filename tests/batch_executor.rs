mod common;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use modrun::engine::{BoundedBatchExecutor, WorkItem};
use modrun::errors::{ErrorKind, ModrunError};

type TestResult = Result<(), Box<dyn Error>>;

fn numbered(n: usize) -> Vec<WorkItem<usize>> {
    (0..n).map(|i| WorkItem::new(format!("item-{i}"), i)).collect()
}

#[tokio::test]
async fn results_keep_input_order_regardless_of_completion_order() -> TestResult {
    init_tracing();
    let executor = BoundedBatchExecutor::new(8);

    let results = executor
        .run_batch(
            numbered(6),
            |item: WorkItem<usize>| async move {
                // Later items finish first.
                tokio::time::sleep(Duration::from_millis(10 * (6 - item.payload) as u64)).await;
                Ok(item.payload * 10)
            },
            None,
        )
        .await?;

    let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["item-0", "item-1", "item-2", "item-3", "item-4", "item-5"]);
    let outputs: Vec<usize> = results.iter().filter_map(|r| r.output).collect();
    assert_eq!(outputs, vec![0, 10, 20, 30, 40, 50]);
    Ok(())
}

#[tokio::test]
async fn never_more_than_the_limit_run_at_once() -> TestResult {
    init_tracing();
    let executor = BoundedBatchExecutor::new(8);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (c, p) = (Arc::clone(&current), Arc::clone(&peak));
    let results = executor
        .run_batch(
            numbered(12),
            move |_item: WorkItem<usize>| {
                let current = Arc::clone(&c);
                let peak = Arc::clone(&p);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Some(3),
        )
        .await?;

    assert_eq!(results.len(), 12);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert!(executor.peak_in_flight() <= 3);
    assert_eq!(executor.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn failures_and_panics_are_isolated_per_item() -> TestResult {
    init_tracing();
    let executor = BoundedBatchExecutor::default();

    let results = executor
        .run_batch(
            numbered(5),
            |item: WorkItem<usize>| async move {
                match item.payload {
                    2 => Err(ModrunError::NonZeroExit {
                        code: 2,
                        stderr: "bad input".to_string(),
                    }),
                    4 => panic!("exploded on item four"),
                    n => Ok(n),
                }
            },
            None,
        )
        .await?;

    assert_eq!(results.len(), 5);
    for index in [0, 1, 3] {
        assert!(results[index].success);
        assert_eq!(results[index].output, Some(index));
    }

    assert!(!results[2].success);
    assert_eq!(results[2].error_kind, Some(ErrorKind::NonZeroExit));
    assert!(results[2].error.as_deref().unwrap_or_default().contains("bad input"));

    assert!(!results[4].success);
    assert_eq!(results[4].error_kind, Some(ErrorKind::Panicked));
    assert!(results[4].error.as_deref().unwrap_or_default().contains("exploded on item four"));
    Ok(())
}

#[tokio::test]
async fn empty_batch_returns_no_results() -> TestResult {
    init_tracing();
    let executor = BoundedBatchExecutor::default();

    let results = executor
        .run_batch(Vec::<WorkItem<()>>::new(), |_item| async { Ok(()) }, None)
        .await?;

    assert!(results.is_empty());
    Ok(())
}

#[tokio::test]
async fn zero_limit_is_rejected() -> TestResult {
    init_tracing();
    let executor = BoundedBatchExecutor::default();

    let err = executor
        .run_batch(numbered(2), |item: WorkItem<usize>| async move { Ok(item.payload) }, Some(0))
        .await
        .expect_err("limit 0 is invalid");

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    Ok(())
}

#[tokio::test]
async fn shutdown_aborts_running_batches_and_refuses_new_ones() -> TestResult {
    init_tracing();
    let executor = Arc::new(BoundedBatchExecutor::new(2));
    let started = Arc::new(AtomicUsize::new(0));

    let running = {
        let executor = Arc::clone(&executor);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            executor
                .run_batch(
                    numbered(4),
                    move |_item: WorkItem<usize>| {
                        let started = Arc::clone(&started);
                        async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(())
                        }
                    },
                    None,
                )
                .await
        })
    };

    common::eventually(|| started.load(Ordering::SeqCst) == 2).await;
    executor.shutdown();

    let outcome = with_timeout(running).await?;
    assert_eq!(outcome.expect_err("batch was aborted").kind(), ErrorKind::ExecutorShutDown);

    let err = executor
        .run_batch(numbered(1), |item: WorkItem<usize>| async move { Ok(item.payload) }, None)
        .await
        .expect_err("executor is shut down");
    assert_eq!(err.kind(), ErrorKind::ExecutorShutDown);
    assert!(executor.is_shut_down());
    Ok(())
}
