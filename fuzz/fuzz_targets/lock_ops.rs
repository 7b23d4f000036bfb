#![no_main]

use libfuzzer_sys::fuzz_target;
use objmonitor::{LockWordSlot, MonitorConfig, MonitorSupport};
use std::time::Duration;

// Replays a byte string as a sequence of lock operations on a few objects and checks
// that the observed depth always matches a simple model.
fuzz_target!(|data: &[u8]| {
    let config = match data.first() {
        Some(b) if b & 1 == 1 => MonitorConfig::always_inflated(),
        _ => MonitorConfig::new(),
    };
    let support = MonitorSupport::with_config(config);
    let objects = [LockWordSlot::new(), LockWordSlot::new(), LockWordSlot::new()];
    let mut depth = [0u32; 3];

    for &op in data.iter().skip(1) {
        let i = usize::from(op >> 6) % objects.len();
        let object = &objects[i];
        match op & 0x7 {
            0 | 1 | 2 => {
                support.enter(object).unwrap();
                depth[i] += 1;
            }
            3 => {
                assert!(support.try_enter(object).unwrap());
                depth[i] += 1;
            }
            4 | 5 => {
                let result = support.exit(object);
                if depth[i] == 0 {
                    assert!(result.unwrap_err().is_illegal_state());
                } else {
                    result.unwrap();
                    depth[i] -= 1;
                }
            }
            6 => {
                let result = support.wait(object, Some(Duration::ZERO));
                if depth[i] == 0 {
                    assert!(result.unwrap_err().is_illegal_state());
                } else {
                    assert!(!result.unwrap());
                }
            }
            _ => {
                let result = support.notify_all(object);
                assert_eq!(result.is_ok(), depth[i] > 0);
            }
        }
        assert_eq!(support.holds_lock(object), depth[i] > 0);
        assert_eq!(
            support.monitor_of(object).and_then(|m| m.acquisitions()).unwrap_or(depth[i]),
            depth[i]
        );
    }
});
