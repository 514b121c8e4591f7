#![no_main]

use libfuzzer_sys::fuzz_target;
use stowage_types::path;

fuzz_target!(|data: (&str, u8)| {
    let (raw, hint) = data;
    let as_directory = match hint % 3 {
        0 => None,
        1 => Some(false),
        _ => Some(true),
    };

    if let Ok(normalized) = path::normalize(raw, as_directory) {
        // Invariants:
        // 1. Rooted, forward slashes only, no duplicate separators.
        assert!(normalized.starts_with('/'));
        assert!(!normalized.contains('\\'));
        assert!(!normalized.contains("//"));

        // 2. No traversal segment survives normalization.
        assert!(normalized.split('/').all(|segment| segment != ".."));

        // 3. Normalization is idempotent.
        assert_eq!(
            path::normalize(&normalized, as_directory).expect("renormalize"),
            normalized
        );

        // 4. Parent of any normalized path is itself normalized.
        let parent = path::parent(&normalized);
        assert!(parent.starts_with('/'));
        assert!(parent.ends_with('/'));
    }
});
