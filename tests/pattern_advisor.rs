mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::time::Duration;

use modrun::engine::{ExecutionOptions, Pattern, PatternRequest, WorkItem, advise};
use modrun::errors::ErrorKind;
use modrun::exec::SpawnRequest;

type TestResult = Result<(), Box<dyn Error>>;

fn one_item() -> Vec<WorkItem<Vec<String>>> {
    vec![WorkItem::new("only", vec!["a".to_string()])]
}

#[test]
fn hints_are_ranked() {
    init_tracing();
    assert_eq!(advise(&ExecutionOptions::new()), Pattern::Simple);
    assert_eq!(advise(&ExecutionOptions::new().pooled()), Pattern::Pooled);
    assert_eq!(advise(&ExecutionOptions::new().background().pooled()), Pattern::FireAndForget);
    assert_eq!(advise(&ExecutionOptions::new().stream().background()), Pattern::Streaming);
    assert_eq!(advise(&ExecutionOptions::new().batch(one_item()).stream()), Pattern::BatchConcurrent);
    assert_eq!(
        advise(&ExecutionOptions::new().every(Duration::from_secs(1)).batch(one_item())),
        Pattern::Periodic
    );
}

#[test]
fn explicit_pattern_with_matching_hint_is_accepted() -> TestResult {
    init_tracing();
    let target = SpawnRequest::new("job");

    let request = PatternRequest::from_options(
        &target,
        &ExecutionOptions::new().pattern(Pattern::Streaming).stream(),
    )?;

    assert_eq!(request, PatternRequest::Streaming { timeout: None });
    Ok(())
}

#[test]
fn explicit_pattern_conflicting_with_hints_is_rejected() {
    init_tracing();
    let target = SpawnRequest::new("job");

    let err = PatternRequest::from_options(
        &target,
        &ExecutionOptions::new().pattern(Pattern::Pooled).background(),
    )
    .expect_err("pooled and background conflict");

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(err.to_string().contains("fire_and_forget"));
}

#[test]
fn pattern_specific_fields_must_match_the_pattern() {
    init_tracing();
    let target = SpawnRequest::new("job");

    for options in [
        ExecutionOptions::new().max_concurrent(2),
        ExecutionOptions::new().task_name("tick").stream(),
        ExecutionOptions::new().pattern(Pattern::BatchConcurrent),
        ExecutionOptions::new().pattern(Pattern::Periodic),
        ExecutionOptions::new().every(Duration::ZERO),
        ExecutionOptions::new().batch(one_item()).max_concurrent(0),
        ExecutionOptions::new().timeout(Duration::ZERO),
    ] {
        let err = PatternRequest::from_options(&target, &options)
            .expect_err(&format!("{options:?} should be rejected"));
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    let err = PatternRequest::from_options(&SpawnRequest::new("  "), &ExecutionOptions::new())
        .expect_err("empty program");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn periodic_name_defaults_to_the_program() -> TestResult {
    init_tracing();
    let target = SpawnRequest::new("heartbeat");

    let request = PatternRequest::from_options(
        &target,
        &ExecutionOptions::new().every(Duration::from_secs(30)).timeout(Duration::from_secs(5)),
    )?;

    assert_eq!(
        request,
        PatternRequest::Periodic {
            name: "heartbeat".to_string(),
            interval: Duration::from_secs(30),
            timeout: Some(Duration::from_secs(5)),
        }
    );
    assert_eq!(request.pattern(), Pattern::Periodic);
    Ok(())
}

#[test]
fn batch_request_carries_items_and_limit() -> TestResult {
    init_tracing();
    let target = SpawnRequest::new("worker");

    let request = PatternRequest::from_options(
        &target,
        &ExecutionOptions::new().batch(one_item()).max_concurrent(3),
    )?;

    assert_eq!(
        request,
        PatternRequest::BatchConcurrent {
            items: one_item(),
            max_concurrent: Some(3),
            timeout: None,
        }
    );
    Ok(())
}

#[test]
fn pattern_names_parse_with_aliases() {
    assert_eq!("simple".parse::<Pattern>(), Ok(Pattern::Simple));
    assert_eq!("stream".parse::<Pattern>(), Ok(Pattern::Streaming));
    assert_eq!("Batch-Concurrent".parse::<Pattern>(), Ok(Pattern::BatchConcurrent));
    assert_eq!("background".parse::<Pattern>(), Ok(Pattern::FireAndForget));
    assert_eq!("periodic".parse::<Pattern>(), Ok(Pattern::Periodic));
    assert_eq!("pooled".parse::<Pattern>(), Ok(Pattern::Pooled));
    assert!("parallel".parse::<Pattern>().is_err());

    for pattern in [
        Pattern::Simple,
        Pattern::Streaming,
        Pattern::BatchConcurrent,
        Pattern::FireAndForget,
        Pattern::Periodic,
        Pattern::Pooled,
    ] {
        assert_eq!(pattern.as_str().parse::<Pattern>(), Ok(pattern));
    }
}
