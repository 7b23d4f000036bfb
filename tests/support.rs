//! Integration tests for [`MonitorSupport`]: object locking through lock words.
//!
//! Covers the thin/inflated state machine as seen from the outside: objects stay thin
//! while uncontended, inflate on contention, deep recursion or waits, and behave the same
//! either way.

use objmonitor::{
    context, CountingHooks, Error, LockShape, LockWordSlot, LockWordStorage, MonitorConfig,
    MonitorSupport, Result,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn nest(support: &MonitorSupport, object: &LockWordSlot, depth: u32) -> Result<()> {
    for _ in 0..depth {
        support.enter(object)?;
    }
    assert!(support.holds_lock(object));
    assert_eq!(support.owner(object), Some(context::current_id()));
    for _ in 0..depth {
        support.exit(object)?;
    }
    Ok(())
}

#[test]
fn test_thin_and_inflated_behave_alike() -> Result<()> {
    for config in [MonitorConfig::new(), MonitorConfig::always_inflated()] {
        let support = MonitorSupport::with_config(config);
        let object = LockWordSlot::new();

        nest(&support, &object, 300)?;
        assert!(!support.is_locked(&object));
        assert!(support.is_inflated(&object));

        let err = support.exit(&object).unwrap_err();
        assert!(err.is_illegal_state());

        // The second round reuses whatever shape the first one left behind.
        nest(&support, &object, 300)?;
        assert!(!support.is_locked(&object));
    }
    Ok(())
}

#[test]
fn test_shallow_nesting_stays_thin() -> Result<()> {
    let hooks = Arc::new(CountingHooks::new());
    let support = MonitorSupport::new().with_hooks(hooks.clone());
    let object = LockWordSlot::new();

    nest(&support, &object, 256)?;
    assert!(!support.is_inflated(&object));
    assert_eq!(object.load().shape(), LockShape::Unlocked);
    assert_eq!(hooks.inflations(), 0);

    nest(&support, &object, 257)?;
    assert!(support.is_inflated(&object));
    assert_eq!(hooks.inflations(), 1);
    Ok(())
}

#[test]
#[should_panic(expected = "monitor recursion overflow")]
fn test_recursion_limit_panics() {
    let support = MonitorSupport::with_config(MonitorConfig::new().with_max_recursion(10));
    let object = LockWordSlot::new();
    for _ in 0..11 {
        let _ = support.enter(&object);
    }
}

#[test]
fn test_contended_objects_exclude() {
    init_logging();
    const THREADS: usize = 8;
    const ITERATIONS: u64 = 1_000;
    const OBJECTS: u64 = 4;

    let hooks = Arc::new(CountingHooks::new());
    let support = Arc::new(MonitorSupport::new().with_hooks(hooks.clone()));
    let counters: Arc<Vec<AtomicU64>> = Arc::new((0..OBJECTS).map(|_| AtomicU64::new(0)).collect());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let support = Arc::clone(&support);
            let counters = Arc::clone(&counters);
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    let id = (i + t as u64) % OBJECTS;
                    let object = support.slot_for(id);
                    let _guard = support.enter_guard(object.as_ref()).unwrap();
                    let counter = &counters[id as usize];
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let total: u64 = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, THREADS as u64 * ITERATIONS);
    assert_eq!(support.slot_count(), OBJECTS as usize);
    for id in 0..OBJECTS {
        assert!(!support.is_locked(support.slot_for(id).as_ref()));
        assert!(support.release_slot(id));
    }
    assert_eq!(support.slot_count(), 0);
    assert!(hooks.inflations() as usize <= support.monitor_count());
}

#[test]
fn test_bounded_buffer() {
    init_logging();
    const ITEMS: u64 = 500;
    const CAPACITY: usize = 4;

    let support = Arc::new(MonitorSupport::new());
    let object = Arc::new(AtomicU64::new(0));
    let buffer = Arc::new(Mutex::new(VecDeque::new()));

    let producer = {
        let support = Arc::clone(&support);
        let object = Arc::clone(&object);
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || {
            for item in 0..ITEMS {
                support.enter(object.as_ref()).unwrap();
                while buffer.lock().unwrap().len() == CAPACITY {
                    support.wait(object.as_ref(), None).unwrap();
                }
                buffer.lock().unwrap().push_back(item);
                support.notify_all(object.as_ref()).unwrap();
                support.exit(object.as_ref()).unwrap();
            }
        })
    };

    let mut received = Vec::new();
    while received.len() < ITEMS as usize {
        support.enter(object.as_ref()).unwrap();
        loop {
            let next = buffer.lock().unwrap().pop_front();
            match next {
                Some(item) => {
                    received.push(item);
                    break;
                }
                None => {
                    support.wait(object.as_ref(), None).unwrap();
                }
            }
        }
        support.notify_all(object.as_ref()).unwrap();
        support.exit(object.as_ref()).unwrap();
    }

    producer.join().unwrap();
    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
    assert!(support.is_inflated(object.as_ref()));
    assert!(!support.is_locked(object.as_ref()));
}

#[test]
fn test_wait_requires_lock_and_restores_depth() -> Result<()> {
    let support = MonitorSupport::new();
    let object = LockWordSlot::new();

    assert!(matches!(
        support.wait(&object, Some(Duration::from_millis(1))),
        Err(Error::IllegalState { .. })
    ));
    assert!(support.notify(&object).unwrap_err().is_illegal_state());

    support.enter(&object)?;
    support.enter(&object)?;
    support.enter(&object)?;
    assert!(!support.wait(&object, Some(Duration::from_millis(10)))?);
    assert_eq!(
        support.monitor_of(&object).and_then(|m| m.acquisitions()),
        Some(3)
    );
    for _ in 0..3 {
        support.exit(&object)?;
    }
    assert!(!support.is_locked(&object));
    Ok(())
}

#[test]
fn test_interrupt_enter() {
    let support = Arc::new(MonitorSupport::new());
    let object = Arc::new(LockWordSlot::new());
    support.enter(object.as_ref()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let blocked = {
        let support = Arc::clone(&support);
        let object = Arc::clone(&object);
        thread::spawn(move || {
            tx.send(context::current()).unwrap();
            support.enter_interruptibly(object.as_ref())
        })
    };

    let handle = rx.recv().unwrap();
    let monitor = loop {
        if let Some(monitor) = support.monitor_of(object.as_ref()) {
            if monitor.is_queued(handle.id()) {
                break monitor;
            }
        }
        thread::sleep(Duration::from_millis(1));
    };
    handle.interrupt();

    assert!(matches!(blocked.join().unwrap(), Err(Error::Interrupted)));
    assert!(!monitor.has_queued_contexts());
    assert_eq!(support.owner(object.as_ref()), Some(context::current_id()));
    support.exit(object.as_ref()).unwrap();
}

#[test]
fn test_single_threaded_mode() -> Result<()> {
    let support = MonitorSupport::with_config(MonitorConfig::single_threaded());
    let object = LockWordSlot::new();

    support.enter(&object)?;
    assert!(support.try_enter(&object)?);
    assert!(support.holds_lock(&object));
    assert!(!support.is_locked(&object));
    support.notify_all(&object)?;
    assert!(!support.wait(&object, Some(Duration::from_millis(1)))?);
    assert!(support.wait(&object, None).unwrap_err().is_illegal_state());
    support.exit(&object)?;
    support.exit(&object)?;
    assert_eq!(support.monitor_count(), 0);
    Ok(())
}
