#![no_main]

use libfuzzer_sys::fuzz_target;
use stowage_encrypt::decrypt_credential;

fuzz_target!(|data: (&str, &str)| {
    let (ciphertext, passphrase) = data;

    // Arbitrary ciphertext must never panic; it either decodes to a valid
    // envelope (vanishingly unlikely) or fails cleanly.
    let _ = decrypt_credential(ciphertext, passphrase);
});
