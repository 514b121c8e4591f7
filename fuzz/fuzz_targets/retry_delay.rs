#![no_main]

use libfuzzer_sys::fuzz_target;
use std::time::Duration;
use stowage_retry::{BackoffConfig, BackoffKind, delay_for_attempt};

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, kind_byte, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1;
    let kind = match kind_byte % 4 {
        0 => BackoffKind::Immediate,
        1 => BackoffKind::Exponential,
        2 => BackoffKind::Linear,
        _ => BackoffKind::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);
    let jitter = f64::from(jitter_byte) / 255.0;

    let config = BackoffConfig {
        kind,
        max_attempts: 100,
        base_delay,
        max_delay,
        jitter,
        ..Default::default()
    };

    let delay = delay_for_attempt(&config, attempt);

    // Invariants:
    // 1. Jitter can stretch a delay by at most 2x; the cap holds within
    //    that band.
    assert!(delay <= max_delay * 2);

    // 2. Immediate means immediate.
    if kind == BackoffKind::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }

    // 3. Without jitter, constant backoff is exactly the (capped) base.
    if kind == BackoffKind::Constant && jitter == 0.0 {
        assert_eq!(delay, base_delay.min(max_delay));
    }
});
