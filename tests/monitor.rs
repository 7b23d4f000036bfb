//! Integration tests for [`ReentrantMonitor`] and its condition.
//!
//! These tests drive real OS threads through the public API and check the externally
//! observable guarantees: mutual exclusion, balanced reentrancy, no lost wake-ups, exact
//! signal delivery and a clean queue after cancellations.

use objmonitor::{context, ContextId, Error, ReentrantMonitor, Result};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small deterministic xorshift generator so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Outcomes of one worker's acquisition attempts.
#[derive(Debug, Default)]
struct Tally {
    acquired: u64,
    timed_out: u64,
    interrupted: u64,
}

/// Polls `check` under the lock until it holds, releasing between attempts.
fn wait_under_lock(monitor: &ReentrantMonitor, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        monitor.lock()?;
        if check() {
            return Ok(());
        }
        monitor.unlock()?;
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_mutual_exclusion() {
    init_logging();
    const THREADS: usize = 8;
    const ITERATIONS: u64 = 2_000;

    let monitor = Arc::new(ReentrantMonitor::new());
    let counter = Arc::new(AtomicU64::new(0));
    let inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let monitor = Arc::clone(&monitor);
            let counter = Arc::clone(&counter);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let _guard = monitor.lock_guard().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    // Split load/store loses updates unless the lock serializes them.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), THREADS as u64 * ITERATIONS);
    assert!(!monitor.is_locked());
    assert!(!monitor.has_queued_contexts());
    assert_eq!(monitor.queue_length(), 0);
}

#[test]
fn test_reentrancy_balanced() -> Result<()> {
    let monitor = ReentrantMonitor::new();
    for depth in 1..=50 {
        monitor.lock()?;
        assert_eq!(monitor.acquisitions(), Some(depth));
    }
    for depth in (0..50).rev() {
        monitor.unlock()?;
        assert_eq!(monitor.is_locked(), depth > 0);
    }

    let err = monitor.unlock().unwrap_err();
    assert!(err.is_illegal_state());
    Ok(())
}

#[test]
fn test_acquisitions_visible_to_owner_only() -> Result<()> {
    let monitor = Arc::new(ReentrantMonitor::new());
    monitor.lock()?;
    monitor.lock()?;

    let other = Arc::clone(&monitor);
    let (seen, owner) = thread::spawn(move || (other.acquisitions(), other.owner()))
        .join()
        .unwrap();

    assert_eq!(seen, None);
    assert_eq!(owner, Some(context::current_id()));
    assert_eq!(monitor.acquisitions(), Some(2));

    let other = Arc::clone(&monitor);
    let err = thread::spawn(move || other.unlock()).join().unwrap();
    assert!(matches!(err, Err(Error::IllegalState { .. })));

    monitor.unlock()?;
    monitor.unlock()?;
    Ok(())
}

#[test]
fn test_no_lost_wakeup() {
    init_logging();
    for _ in 0..50 {
        let monitor = Arc::new(ReentrantMonitor::new());
        let ready = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                monitor.lock().unwrap();
                while !ready.load(Ordering::SeqCst) {
                    monitor.wait(None).unwrap();
                }
                monitor.unlock().unwrap();
                done_tx.send(()).unwrap();
            })
        };

        monitor.lock().unwrap();
        ready.store(true, Ordering::SeqCst);
        monitor.notify().unwrap();
        monitor.unlock().unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("waiter missed the notification");
        waiter.join().unwrap();
    }
}

#[test]
fn test_signal_after_park_is_not_lost() {
    init_logging();
    for _ in 0..20 {
        let monitor = Arc::new(ReentrantMonitor::new());
        let value = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                monitor.lock().unwrap();
                monitor.new_condition().await_signal().unwrap();
                let seen = value.load(Ordering::Relaxed);
                value.store(seen * 10 + 2, Ordering::Relaxed);
                monitor.unlock().unwrap();
                done_tx.send(seen).unwrap();
            })
        };

        let condition = monitor.new_condition();
        wait_under_lock(&monitor, || condition.has_waiters().unwrap()).unwrap();
        value.store(value.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        condition.signal().unwrap();
        monitor.unlock().unwrap();

        let seen = done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("parked waiter missed the signal");
        waiter.join().unwrap();

        assert_eq!(seen, 1);
        monitor.lock().unwrap();
        assert_eq!(value.load(Ordering::Relaxed), 12);
        monitor.unlock().unwrap();
    }
}

#[test]
fn test_signal_wakes_exactly_as_many_as_signalled() {
    init_logging();
    const WAITERS: usize = 5;
    const SIGNALS: usize = 2;

    let monitor = Arc::new(ReentrantMonitor::new());
    let waiting = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let monitor = Arc::clone(&monitor);
            let waiting = Arc::clone(&waiting);
            thread::spawn(move || {
                monitor.lock().unwrap();
                waiting.fetch_add(1, Ordering::SeqCst);
                let signalled = monitor
                    .new_condition()
                    .await_timeout(Duration::from_millis(1_500))
                    .unwrap();
                assert!(monitor.is_held_by_current_context());
                monitor.unlock().unwrap();
                signalled
            })
        })
        .collect();

    wait_under_lock(&monitor, || waiting.load(Ordering::SeqCst) == WAITERS).unwrap();
    let condition = monitor.new_condition();
    assert_eq!(condition.wait_queue_length().unwrap(), WAITERS);
    for _ in 0..SIGNALS {
        condition.signal().unwrap();
    }
    assert_eq!(condition.wait_queue_length().unwrap(), WAITERS - SIGNALS);
    monitor.unlock().unwrap();

    let signalled = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|signalled| *signalled)
        .count();
    assert_eq!(signalled, SIGNALS);
    assert!(!monitor.is_locked());
}

#[test]
fn test_signal_all_wakes_every_waiter_once() {
    const WAITERS: usize = 4;

    let monitor = Arc::new(ReentrantMonitor::new());
    let waiting = Arc::new(AtomicUsize::new(0));
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let monitor = Arc::clone(&monitor);
            let waiting = Arc::clone(&waiting);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                monitor.lock().unwrap();
                monitor.lock().unwrap();
                waiting.fetch_add(1, Ordering::SeqCst);
                monitor.new_condition().await_signal().unwrap();
                assert_eq!(monitor.acquisitions(), Some(2));
                woken.fetch_add(1, Ordering::SeqCst);
                monitor.unlock().unwrap();
                monitor.unlock().unwrap();
            })
        })
        .collect();

    wait_under_lock(&monitor, || waiting.load(Ordering::SeqCst) == WAITERS).unwrap();
    monitor.notify_all().unwrap();
    assert!(!monitor.new_condition().has_waiters().unwrap());
    monitor.unlock().unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn test_signalled_waiter_requeues_behind_signaller() {
    let monitor = Arc::new(ReentrantMonitor::new());
    let (id_tx, id_rx) = mpsc::channel::<ContextId>();

    let waiter = {
        let monitor = Arc::clone(&monitor);
        thread::spawn(move || {
            monitor.lock().unwrap();
            id_tx.send(context::current_id()).unwrap();
            let outcome = monitor.wait(None).unwrap();
            assert!(outcome.signalled);
            assert_eq!(monitor.acquisitions(), Some(1));
            monitor.unlock().unwrap();
            outcome.notifier
        })
    };

    let waiter_id = id_rx.recv().unwrap();
    let condition = monitor.new_condition();
    wait_under_lock(&monitor, || condition.has_waiters().unwrap()).unwrap();
    assert_eq!(condition.waiting_contexts().unwrap(), vec![waiter_id]);

    condition.signal().unwrap();
    assert!(monitor.is_queued(waiter_id));
    assert_eq!(monitor.owner(), Some(context::current_id()));
    monitor.unlock().unwrap();

    let notifier = waiter.join().unwrap();
    assert_eq!(notifier, Some(context::current_id()));
    assert_eq!(monitor.previous_owner(), Some(context::current_id()));
}

#[test]
fn test_cancellation_leaves_queue_consistent() {
    init_logging();
    const THREADS: usize = 6;
    const OPERATIONS: usize = 300;

    let monitor = Arc::new(ReentrantMonitor::new());
    let counter = Arc::new(AtomicU64::new(0));
    let start = Arc::new(Barrier::new(THREADS + 1));
    let running = Arc::new(AtomicBool::new(true));
    let (handle_tx, handle_rx) = mpsc::channel();

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let monitor = Arc::clone(&monitor);
            let counter = Arc::clone(&counter);
            let start = Arc::clone(&start);
            let handle_tx = handle_tx.clone();
            thread::spawn(move || {
                handle_tx.send(context::current()).unwrap();
                drop(handle_tx);
                start.wait();

                let mut tally = Tally::default();
                let mut rng = Rng(0x9E37_79B9_7F4A_7C15 ^ (i as u64 + 1));
                for _ in 0..OPERATIONS {
                    let acquired = match rng.below(3) {
                        0 => monitor.lock().map(|()| true),
                        1 => monitor.lock_interruptibly().map(|()| true),
                        _ => monitor.try_lock_for(Duration::from_micros(rng.below(200))),
                    };
                    match acquired {
                        Ok(true) => {
                            assert_eq!(monitor.acquisitions(), Some(1));
                            let value = counter.load(Ordering::Relaxed);
                            // Hold the lock long enough for waiters to queue up behind it.
                            thread::sleep(Duration::from_micros(20));
                            counter.store(value + 1, Ordering::Relaxed);
                            monitor.unlock().unwrap();
                            tally.acquired += 1;
                        }
                        Ok(false) => tally.timed_out += 1,
                        Err(Error::Interrupted) => tally.interrupted += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    let _ = context::interrupted();
                }
                tally
            })
        })
        .collect();
    drop(handle_tx);

    let handles: Vec<_> = handle_rx.iter().collect();
    let interrupter = {
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut rng = Rng(0x2545_F491_4F6C_DD1D);
            while running.load(Ordering::SeqCst) {
                handles[rng.below(handles.len() as u64) as usize].interrupt();
                thread::sleep(Duration::from_micros(50));
            }
        })
    };

    start.wait();
    let mut total = Tally::default();
    for worker in workers {
        let tally = worker.join().unwrap();
        total.acquired += tally.acquired;
        total.timed_out += tally.timed_out;
        total.interrupted += tally.interrupted;
    }
    running.store(false, Ordering::SeqCst);
    interrupter.join().unwrap();

    assert_eq!(
        total.acquired + total.timed_out + total.interrupted,
        (THREADS * OPERATIONS) as u64
    );
    assert!(total.timed_out > 0, "no acquisition timed out: {total:?}");
    assert!(total.interrupted > 0, "no acquisition was interrupted: {total:?}");
    assert_eq!(counter.load(Ordering::SeqCst), total.acquired);
    assert!(!monitor.is_locked());
    assert!(!monitor.has_queued_contexts());
    assert!(monitor.queued_contexts().is_empty());

    monitor.lock().unwrap();
    assert_eq!(monitor.acquisitions(), Some(1));
    monitor.unlock().unwrap();
}

#[test]
fn test_interrupted_waiter_does_not_consume_signal() {
    let monitor = Arc::new(ReentrantMonitor::new());
    let waiting = Arc::new(AtomicUsize::new(0));
    let (handle_tx, handle_rx) = mpsc::channel();

    let interrupted = {
        let monitor = Arc::clone(&monitor);
        let waiting = Arc::clone(&waiting);
        thread::spawn(move || {
            monitor.lock().unwrap();
            handle_tx.send(context::current()).unwrap();
            waiting.fetch_add(1, Ordering::SeqCst);
            let result = monitor.new_condition().await_signal();
            assert!(monitor.is_held_by_current_context());
            monitor.unlock().unwrap();
            result
        })
    };
    let patient = {
        let monitor = Arc::clone(&monitor);
        let waiting = Arc::clone(&waiting);
        thread::spawn(move || {
            monitor.lock().unwrap();
            waiting.fetch_add(1, Ordering::SeqCst);
            let signalled = monitor
                .new_condition()
                .await_timeout(Duration::from_secs(5))
                .unwrap();
            monitor.unlock().unwrap();
            signalled
        })
    };

    wait_under_lock(&monitor, || waiting.load(Ordering::SeqCst) == 2).unwrap();
    monitor.unlock().unwrap();

    handle_rx.recv().unwrap().interrupt();
    assert!(matches!(interrupted.join().unwrap(), Err(Error::Interrupted)));

    monitor.lock().unwrap();
    monitor.notify().unwrap();
    monitor.unlock().unwrap();
    assert!(patient.join().unwrap());
}
