//! Scheduling, timers, sequencing and shutdown across the event loop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use gale::{Failure, Future, Status};
use rand::Rng;

use common::{await_future, start_topology};

#[test]
fn test_repeat_runs_step_once_per_round_until_stop() {
    let cpus = start_topology(&[&[0]]);
    let cpu = cpus.get(0).unwrap();

    let executions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(AtomicUsize::new(10));
    let seen = executions.clone();
    let left = counter.clone();
    let done = cpu.repeat(move |cpu| {
        seen.fetch_add(1, Ordering::SeqCst);
        let status = if left.load(Ordering::SeqCst) == 0 {
            Status::<()>::Stop
        } else {
            left.fetch_sub(1, Ordering::SeqCst);
            Status::Continue
        };
        Future::ready(cpu, status)
    });

    assert!(await_future(&done, Duration::from_secs(1))
        .unwrap()
        .is_none());
    // ten CONTINUE rounds plus the STOP round
    assert_eq!(executions.load(Ordering::SeqCst), 11);
    cpus.halt();
}

#[test]
fn test_sleep_callback_never_runs_early() {
    let cpus = start_topology(&[&[0]]);
    let cpu = cpus.get(0).unwrap();

    let submitted = Instant::now();
    let delay = Duration::from_millis(50);
    let fired_after = cpu.sleep(delay, move || submitted.elapsed());

    let elapsed = await_future(&fired_after, Duration::from_secs(1)).unwrap();
    assert!(elapsed >= delay, "fired after {elapsed:?}, wanted >= {delay:?}");
    cpus.halt();
}

#[test]
fn test_timers_fire_among_other_tasks() {
    let cpus = start_topology(&[&[0]]);
    let cpu = cpus.get(0).unwrap();

    let counts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..5 {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(10..50));
        let counts = counts.clone();
        cpu.sleep(delay, move || {
            assert!(start.elapsed() >= delay);
            counts.fetch_add(1, Ordering::SeqCst)
        });
        cpu.schedule(|| 2 + 2);
    }
    let late = counts.clone();
    cpu.sleep(Duration::from_millis(500), move || {
        late.fetch_add(1, Ordering::SeqCst)
    });

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(counts.load(Ordering::SeqCst), 5);

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(counts.load(Ordering::SeqCst), 6);
    cpus.halt();
}

#[test]
fn test_sequence_keeps_input_order_across_cpus() {
    let cpus = start_topology(&[&[0, 1, 2]]);
    let cpu0 = cpus.get(0).unwrap().clone();
    let cpu2 = cpus.get(2).unwrap().clone();

    let futures: Vec<Future<usize>> = (0..5)
        .map(|i| {
            if i % 2 == 0 {
                Future::ready(&cpu0, i)
            } else {
                cpu2.schedule(move || i)
            }
        })
        .collect();

    let result = await_future(&cpu0.sequence(futures), Duration::from_secs(1)).unwrap();
    assert_eq!(result, vec![0, 1, 2, 3, 4]);
    cpus.halt();
}

#[test]
fn test_sequence_fails_with_first_input_failure() {
    let cpus = start_topology(&[&[0, 1, 2]]);
    let cpu0 = cpus.get(0).unwrap().clone();
    let cpu2 = cpus.get(2).unwrap().clone();

    let futures = vec![
        Future::ready(&cpu0, 0),
        Future::failed(&cpu2, Failure::Invariant("bad argument")),
        Future::ready(&cpu2, 1),
    ];

    let failure = await_future(&cpu0.sequence(futures), Duration::from_secs(1)).unwrap_err();
    assert!(matches!(failure, Failure::Invariant("bad argument")));
    cpus.halt();
}

#[test]
fn test_sequence_reports_earliest_failed_index() {
    let cpus = start_topology(&[&[0]]);
    let cpu = cpus.get(0).unwrap().clone();

    // The index-2 failure completes first (constant future), but index 1
    // resolves later to a failure that must win.
    let slow_failure: Future<usize> = Future::pending(&cpu);
    let futures = vec![
        Future::ready(&cpu, 0),
        slow_failure.clone(),
        Future::failed(&cpu, Failure::Invariant("late loser")),
    ];
    let aggregate = cpu.sequence(futures);

    let resolver = slow_failure.clone();
    cpu.sleep(Duration::from_millis(20), move || {
        resolver
            .set_failure(Failure::Invariant("early winner"))
            .unwrap();
    });

    let failure = await_future(&aggregate, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(failure, Failure::Invariant("early winner")));
    cpus.halt();
}

#[test]
fn test_halt_fails_pending_futures_with_shutdown() {
    let cpus = start_topology(&[&[0]]);
    let cpu = cpus.get(0).unwrap().clone();

    let parked = cpu.sleep(Duration::from_secs(3600), || ());
    let (tx, rx) = mpsc::channel();
    parked.on_failure(move |e| tx.send(e).unwrap()).unwrap();

    // Let the loop arm the timer before tearing everything down.
    std::thread::sleep(Duration::from_millis(50));
    cpus.halt();

    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Failure::Shutdown
    ));
}

#[test]
fn test_submissions_after_halt_fail_with_shutdown() {
    let cpus = start_topology(&[&[0]]);
    let cpu = cpus.get(0).unwrap().clone();
    cpus.halt();

    let scheduled = cpu.schedule(|| 1);
    let (tx, rx) = mpsc::channel();
    scheduled.on_failure(move |e| tx.send(e).unwrap()).unwrap();
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Failure::Shutdown
    ));
}

#[test]
fn test_cross_cpu_submissions_from_one_thread_stay_ordered() {
    let cpus = start_topology(&[&[0, 1]]);
    let cpu1 = cpus.get(1).unwrap();
    let (tx, rx) = mpsc::channel();

    for i in 0..200 {
        let tx = tx.clone();
        cpu1.schedule(move || tx.send(i).unwrap());
    }
    let received: Vec<i32> = (0..200)
        .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(received, (0..200).collect::<Vec<_>>());
    cpus.halt();
}
