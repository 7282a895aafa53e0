//! Process-level tests: real forked replicas talking through shared channels.

use procflow::logging::WorkerLogging;
use procflow::{
    BoundedChannel, ChannelConfig, ControlSignal, Message, Pipeline, ProcflowError, Step, TerminationReason,
    WorkerPool, WorkerSpec, run_until_exit,
};
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

/// Generous bound for anything that must finish "in bounded time".
const BOUND: Duration = Duration::from_secs(10);

type Chan = BoundedChannel<u64>;

fn none() -> Vec<Chan> {
    Vec::new()
}

/// Read until end-of-stream or `timeout`.
fn collect(channel: &Chan, timeout: Duration) -> (Vec<u64>, bool) {
    let deadline = Instant::now() + timeout;
    let mut items = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match channel.get(Some(remaining)).unwrap() {
            Some(Message::Item(v)) => items.push(v),
            Some(Message::EndOfStream) => return (items, true),
            None => break,
        }
    }
    (items, false)
}

/// Body that emits an increasing counter every few milliseconds until exit.
fn ticker(_: &(), _: &[Chan], outputs: &[Chan], control: &ControlSignal) {
    let mut n = 0;
    run_until_exit(control, || {
        n += 1;
        outputs[0].put(n)?;
        thread::sleep(Duration::from_millis(5));
        Ok(Step::Continue)
    });
}

#[test]
fn test_capacity_one_delivers_all_then_sentinel() {
    let control = ControlSignal::new().unwrap();
    let link = Chan::new(1).unwrap();
    let results = Chan::new(0).unwrap();

    let producer = WorkerSpec::builder("producer", ())
        .body(|_: &(), _: &[Chan], outputs: &[Chan], _| {
            for item in 1..=3 {
                outputs[0].put(item).unwrap();
            }
            outputs[0].put_end_of_stream().unwrap();
        })
        .output(link.clone())
        .control(&control)
        .build()
        .unwrap();

    let consumer = WorkerSpec::builder("consumer", ())
        .body(|_: &(), inputs: &[Chan], outputs: &[Chan], control: &ControlSignal| {
            run_until_exit(control, || match inputs[0].recv()? {
                Message::Item(v) => {
                    outputs[0].put(v)?;
                    Ok(Step::Continue)
                }
                Message::EndOfStream => Ok(Step::EndOfStream),
            });
            outputs[0].put_end_of_stream().unwrap();
        })
        .input(link.clone())
        .output(results.clone())
        .control(&control)
        .build()
        .unwrap();

    let mut producer = WorkerPool::create(producer).unwrap();
    let mut consumer = WorkerPool::create(consumer).unwrap();
    consumer.start_workers().unwrap();
    producer.start_workers().unwrap();

    let (items, ended) = collect(&results, BOUND);
    assert_eq!(items, vec![1, 2, 3]);
    assert!(ended, "consumer never forwarded the sentinel");

    let exits: Vec<_> = producer
        .join_workers()
        .into_iter()
        .chain(consumer.join_workers())
        .collect();
    assert_eq!(exits.len(), 2);
    assert!(exits.iter().all(|e| e.is_clean()), "{:?}", exits);
}

#[test]
fn test_drain_without_consumers_terminates() {
    let mut pipeline = Pipeline::new().unwrap();
    let channel: Chan = pipeline.channel("lonely", 32).unwrap();

    let started = Instant::now();
    let report = pipeline.shutdown_within(BOUND);
    assert!(started.elapsed() < BOUND);
    assert_eq!(report.drained.len(), 1);
    assert_eq!(report.drained[0].1.filled, 32);
    assert_eq!(report.drained[0].1.discarded, 0);
    assert!(channel.is_empty());
}

#[test]
fn test_drain_of_full_channel_terminates() {
    let control = ControlSignal::new().unwrap();
    let channel = Chan::new(4).unwrap();
    for i in 0..4 {
        channel.put(i).unwrap();
    }
    control.request_exit();

    let report = channel.fill_and_drain().unwrap();
    assert_eq!(report.filled, 0);
    assert_eq!(report.discarded, 4);
    assert!(channel.is_empty());
}

#[test]
fn test_pool_spawns_exactly_count_processes() {
    let control = ControlSignal::new().unwrap();
    let results = Chan::new(0).unwrap();
    let spec = WorkerSpec::builder("reporter", ())
        .count(4)
        .body(|_: &(), _: &[Chan], outputs: &[Chan], _| {
            outputs[0].put(u64::from(std::process::id())).unwrap();
        })
        .output(results.clone())
        .control(&control)
        .build()
        .unwrap();
    let mut pool = WorkerPool::create(spec).unwrap();
    pool.start_workers().unwrap();

    let spawned: HashSet<u64> = pool.pids().into_iter().map(|p| p as u64).collect();
    assert_eq!(spawned.len(), 4);
    assert!(!spawned.contains(&u64::from(std::process::id())));

    let exits = pool.join_workers();
    assert_eq!(exits.len(), 4);
    let (reported, _) = collect(&results, Duration::from_millis(200));
    let reported: HashSet<u64> = reported.into_iter().collect();
    assert_eq!(reported, spawned);
}

#[test]
fn test_unbounded_channel_grows_across_processes() {
    let control = ControlSignal::new().unwrap();
    let results = Chan::with_config(ChannelConfig::with_capacity(0).with_slot_size(32)).unwrap();
    let spec = WorkerSpec::builder("flood", ())
        .count(2)
        .body(|_: &(), _: &[Chan], outputs: &[Chan], _| {
            let base = u64::from(std::process::id()) * 10_000;
            for i in 0..3_000 {
                outputs[0].put(base + i).unwrap();
            }
        })
        .output(results.clone())
        .control(&control)
        .build()
        .unwrap();
    let mut pool = WorkerPool::create(spec).unwrap();
    pool.start_workers().unwrap();

    // Nobody reads until both replicas are done, so they must never block.
    let exits = pool.join_workers();
    assert!(exits.iter().all(|e| e.is_clean()), "{:?}", exits);
    assert_eq!(results.len(), 6_000);

    let (items, _) = collect(&results, Duration::from_millis(200));
    assert_eq!(items.len(), 6_000);
    for exit in &exits {
        let base = exit.pid as u64 * 10_000;
        let mine: Vec<u64> = items.iter().copied().filter(|v| v / 10_000 == exit.pid as u64).collect();
        assert_eq!(mine, (base..base + 3_000).collect::<Vec<_>>());
    }
}

#[test]
fn test_paused_replicas_do_not_touch_channels() {
    let mut pipeline = Pipeline::new().unwrap();
    let ticks: Chan = pipeline.channel("ticks", 0).unwrap();
    let spec = WorkerSpec::builder("ticker", ())
        .count(2)
        .body(ticker)
        .output(ticks.clone())
        .control(pipeline.control())
        .build()
        .unwrap();
    pipeline.add_pool(WorkerPool::create(spec).unwrap());

    pipeline.control().pause();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(ticks.is_empty(), "paused replicas produced output");

    pipeline.control().resume();
    let deadline = Instant::now() + BOUND;
    while ticks.len() < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(ticks.len() >= 4, "replicas did not resume");

    pipeline.control().pause();
    // Let in-flight units finish before sampling.
    thread::sleep(Duration::from_millis(100));
    let frozen = ticks.len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(ticks.len(), frozen);

    let report = pipeline.shutdown_within(BOUND);
    assert!(report.is_clean(), "{:?}", report);
}

#[test]
fn test_shutdown_while_paused_terminates() {
    let mut pipeline = Pipeline::new().unwrap();
    let ticks: Chan = pipeline.channel("ticks", 8).unwrap();
    let spec = WorkerSpec::builder("ticker", ())
        .body(ticker)
        .output(ticks.clone())
        .control(pipeline.control())
        .build()
        .unwrap();
    pipeline.add_pool(WorkerPool::create(spec).unwrap());
    pipeline.start().unwrap();
    pipeline.control().pause();

    let report = pipeline.shutdown_within(BOUND);
    assert!(report.is_clean(), "{:?}", report);
}

#[test]
fn test_reverse_order_shutdown_releases_blocked_chain() {
    // producer -> first -> relay x2 -> second -> nobody
    let mut pipeline = Pipeline::new().unwrap();
    let first: Chan = pipeline.channel("first", 2).unwrap();
    let second: Chan = pipeline.channel("second", 2).unwrap();

    let producer = WorkerSpec::builder("producer", ())
        .body(|_: &(), _: &[Chan], outputs: &[Chan], control: &ControlSignal| {
            let mut n = 0;
            run_until_exit(control, || {
                n += 1;
                outputs[0].put(n)?;
                Ok(Step::Continue)
            });
        })
        .output(first.clone())
        .control(pipeline.control())
        .build()
        .unwrap();
    let relay = WorkerSpec::builder("relay", ())
        .count(2)
        .body(|_: &(), inputs: &[Chan], outputs: &[Chan], control: &ControlSignal| {
            run_until_exit(control, || match inputs[0].recv()? {
                Message::Item(v) => {
                    outputs[0].put(v)?;
                    Ok(Step::Continue)
                }
                Message::EndOfStream => Ok(Step::EndOfStream),
            });
        })
        .input(first.clone())
        .output(second.clone())
        .control(pipeline.control())
        .build()
        .unwrap();
    pipeline.add_pool(WorkerPool::create(producer).unwrap());
    pipeline.add_pool(WorkerPool::create(relay).unwrap());
    pipeline.start().unwrap();

    // Wait until the chain is backed up: both channels full.
    let deadline = Instant::now() + BOUND;
    while (first.len() < 2 || second.len() < 2) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(second.len(), 2);

    let started = Instant::now();
    let report = pipeline.shutdown_within(BOUND);
    assert!(started.elapsed() < BOUND);
    assert!(report.still_running.is_empty(), "{:?}", report);
    assert_eq!(report.exits.len(), 3);
    assert!(report.exits.iter().all(|e| e.is_clean()), "{:?}", report);
    let order: Vec<&str> = report.drained.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(order, vec!["second", "first"]);
}

#[test]
fn test_failed_units_do_not_kill_replica() {
    let mut pipeline = Pipeline::new().unwrap();
    let results: Chan = pipeline.channel("results", 0).unwrap();
    let spec = WorkerSpec::builder("flaky", ())
        .body(|_: &(), _: &[Chan], outputs: &[Chan], control: &ControlSignal| {
            let mut n = 0u64;
            run_until_exit(control, || {
                n += 1;
                match n % 3 {
                    1 => Err(ProcflowError::InvalidChannel("bad unit".into())),
                    2 => panic!("unit {} exploded", n),
                    _ => {
                        outputs[0].put(n)?;
                        Ok(Step::Continue)
                    }
                }
            });
        })
        .output(results.clone())
        .control(pipeline.control())
        .build()
        .unwrap();
    pipeline.add_pool(WorkerPool::create(spec).unwrap());
    pipeline.start().unwrap();

    // Unit 9 only runs if units 1, 2, 4, 5, 7, 8 failed without killing the process.
    let deadline = Instant::now() + BOUND;
    let mut seen = Vec::new();
    while !seen.contains(&9) && Instant::now() < deadline {
        if let Some(Message::Item(v)) = results.get(Some(Duration::from_millis(50))).unwrap() {
            seen.push(v);
        }
    }
    assert!(seen.starts_with(&[3, 6, 9]), "{:?}", seen);

    let report = pipeline.shutdown_within(BOUND);
    assert_eq!(report.exits.len(), 1);
    assert_eq!(report.exits[0].reason, TerminationReason::Completed);
}

#[test]
fn test_setup_failure_only_affects_its_replicas() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let logs = dir.path().join("logs");

    let control = ControlSignal::new().unwrap();
    let broken = WorkerSpec::builder("broken", ())
        .count(2)
        .body(|_: &(), _: &[Chan], _: &[Chan], _| {})
        .control(&control)
        .logging(WorkerLogging::to_dir(&blocker))
        .build()
        .unwrap();
    let healthy = WorkerSpec::builder("healthy", ())
        .body(|_: &(), _: &[Chan], _: &[Chan], _| tracing::warn!("healthy replica ran"))
        .control(&control)
        .logging(WorkerLogging::to_dir(&logs))
        .build()
        .unwrap();

    let mut broken = WorkerPool::create(broken).unwrap();
    let mut healthy = WorkerPool::create(healthy).unwrap();
    broken.start_workers().unwrap();
    healthy.start_workers().unwrap();
    let healthy_pid = healthy.pids()[0];

    let broken_exits = broken.join_workers();
    assert_eq!(broken_exits.len(), 2);
    assert!(
        broken_exits
            .iter()
            .all(|e| e.reason == TerminationReason::SetupFailed)
    );

    let healthy_exits = healthy.join_workers();
    assert_eq!(healthy_exits[0].reason, TerminationReason::Completed);

    let log = logs.join(format!("healthy_{}.log", healthy_pid));
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("healthy replica ran"));
}

#[test]
fn test_invalid_specs_never_reach_a_pool() {
    let control = ControlSignal::new().unwrap();
    let zero = WorkerSpec::builder("zero", ())
        .count(0)
        .body(|_: &(), _: &[Chan], _: &[Chan], _| {})
        .control(&control)
        .build();
    assert!(matches!(zero, Err(ProcflowError::InvalidSpec(_))));

    let bodiless = WorkerSpec::<(), u64, u64>::create(
        "bodiless",
        1,
        None,
        (),
        none(),
        none(),
        &control,
        WorkerLogging::default(),
    );
    assert!(matches!(bodiless, Err(ProcflowError::InvalidSpec(_))));
}

#[test]
fn test_pipeline_can_run_again_after_reset() {
    let mut pipeline = Pipeline::new().unwrap();
    let ticks: Chan = pipeline.channel("ticks", 4).unwrap();
    let spec = WorkerSpec::builder("ticker", ())
        .body(ticker)
        .output(ticks.clone())
        .control(pipeline.control())
        .build()
        .unwrap();
    pipeline.add_pool(WorkerPool::create(spec).unwrap());

    for round in 0..2 {
        pipeline.start().unwrap();
        let first = ticks.get(Some(BOUND)).unwrap();
        assert!(
            matches!(first, Some(Message::Item(1))),
            "round {}: {:?}",
            round,
            first
        );
        let report = pipeline.shutdown_within(BOUND);
        assert!(report.is_clean(), "round {}: {:?}", round, report);
        pipeline.reset().unwrap();
    }
}
