//! Streaming base64 JSON bodies for blob creation.
//!
//! Blob creation posts `{"content":"<base64>","encoding":"base64"}`. The
//! content may be up to the backend's 100 MiB blob limit, so the body is
//! produced as a stream: a JSON prefix, base64 emitted block by block with a
//! 3-byte carry between reads, and a closing suffix. Peak memory stays at a
//! small multiple of the block size no matter how large the input is.

use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Input read size per block. Multiple of 3 so carry only forms at EOF
/// boundaries within a block, not between full blocks.
const BLOCK: usize = 48 * 1024;

enum Phase {
    Prefix,
    Content,
    Suffix,
    Done,
}

/// A `Read` producing the JSON blob body from a streaming source.
pub struct JsonBase64Body<R> {
    source: R,
    phase: Phase,
    /// Up to two leftover input bytes awaiting a 3-byte group.
    carry: [u8; 2],
    carry_len: usize,
    /// Encoded output not yet handed to the caller.
    pending: Vec<u8>,
    pending_pos: usize,
    /// Bytes read from the source so far.
    consumed: u64,
    /// Hard cap; exceeding it aborts the stream mid-flight.
    limit: Option<u64>,
}

impl<R: Read> JsonBase64Body<R> {
    pub fn new(source: R, limit: Option<u64>) -> Self {
        Self {
            source,
            phase: Phase::Prefix,
            carry: [0; 2],
            carry_len: 0,
            pending: Vec::new(),
            pending_pos: 0,
            consumed: 0,
            limit,
        }
    }

    /// Refill `pending` according to the current phase.
    fn refill(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        self.pending_pos = 0;
        match self.phase {
            Phase::Prefix => {
                self.pending.extend_from_slice(b"{\"content\":\"");
                self.phase = Phase::Content;
            }
            Phase::Content => {
                let mut block = vec![0u8; BLOCK];
                block[..self.carry_len].copy_from_slice(&self.carry[..self.carry_len]);
                let n = self.source.read(&mut block[self.carry_len..])?;
                if n == 0 {
                    // Source drained; the suffix phase flushes the carry
                    // (with padding) and closes the JSON.
                    self.phase = Phase::Suffix;
                    return self.refill();
                }
                self.consumed += n as u64;
                if let Some(limit) = self.limit {
                    if self.consumed > limit {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("input exceeds the {limit}-byte blob limit"),
                        ));
                    }
                }

                // Emit the 3-aligned prefix; up to two bytes wait in the
                // carry for the next read.
                let filled = self.carry_len + n;
                let aligned = filled - (filled % 3);
                let encoded = BASE64.encode(&block[..aligned]);
                self.pending.extend_from_slice(encoded.as_bytes());
                self.carry[..filled - aligned].copy_from_slice(&block[aligned..filled]);
                self.carry_len = filled - aligned;
            }
            Phase::Suffix => {
                if self.carry_len > 0 {
                    let encoded = BASE64.encode(&self.carry[..self.carry_len]);
                    self.pending.extend_from_slice(encoded.as_bytes());
                    self.carry_len = 0;
                }
                self.pending.extend_from_slice(b"\",\"encoding\":\"base64\"}");
                self.phase = Phase::Done;
            }
            Phase::Done => {}
        }
        Ok(())
    }
}

impl<R: Read> Read for JsonBase64Body<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pending_pos < self.pending.len() {
                let n = (self.pending.len() - self.pending_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }
            if matches!(self.phase, Phase::Done) {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_all(input: &[u8], limit: Option<u64>) -> std::io::Result<String> {
        let mut body = JsonBase64Body::new(std::io::Cursor::new(input.to_vec()), limit);
        let mut out = String::new();
        body.read_to_string(&mut out)?;
        Ok(out)
    }

    #[test]
    fn empty_input() {
        let out = encode_all(b"", None).expect("encode");
        assert_eq!(out, r#"{"content":"","encoding":"base64"}"#);
    }

    #[test]
    fn small_input_matches_direct_encoding() {
        let out = encode_all(b"hello, world!", None).expect("encode");
        let expected = format!(
            r#"{{"content":"{}","encoding":"base64"}}"#,
            BASE64.encode(b"hello, world!")
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn multi_block_input_round_trips() {
        // Bigger than one block and not 3-aligned, so the carry matters.
        let input: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let out = encode_all(&input, None).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
        assert_eq!(value["encoding"], "base64");
        let decoded = BASE64
            .decode(value["content"].as_str().expect("content"))
            .expect("decode");
        assert_eq!(decoded, input);
    }

    #[test]
    fn over_limit_fails_mid_stream() {
        let input = vec![0u8; 10_000];
        let err = encode_all(&input, Some(4096)).expect_err("limit");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn tiny_reads_still_produce_valid_output() {
        struct OneByte<R>(R);
        impl<R: Read> Read for OneByte<R> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = buf.len().min(1);
                self.0.read(&mut buf[..n])
            }
        }
        let input = b"abcdefghij";
        let mut body = JsonBase64Body::new(OneByte(std::io::Cursor::new(input.to_vec())), None);
        let mut out = String::new();
        body.read_to_string(&mut out).expect("read");
        let value: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
        let decoded = BASE64
            .decode(value["content"].as_str().expect("content"))
            .expect("decode");
        assert_eq!(decoded, input);
    }

    proptest! {
        #[test]
        fn arbitrary_inputs_round_trip(input in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let out = encode_all(&input, None).expect("encode");
            let value: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
            let decoded = BASE64
                .decode(value["content"].as_str().expect("content"))
                .expect("decode");
            prop_assert_eq!(decoded, input);
        }
    }
}
