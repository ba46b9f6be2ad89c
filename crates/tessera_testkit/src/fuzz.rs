//! Fuzz testing harnesses for Tessera.
//!
//! Each target feeds arbitrary bytes to one decoder. Decoders must either
//! succeed or return an error; they never panic.

use tessera_core::commit::Commit;
use tessera_core::layout::{Block, Header, LogScan, Snapshot};
use tessera_core::{DigestAlgorithm, Payload};
use tessera_storage::InMemoryBackend;

/// Fuzz target for commit record parsing.
///
/// A record that parses and is intact must encode back to the same bytes.
pub fn fuzz_commit_parse(data: &[u8]) {
    for algorithm in [DigestAlgorithm::Sha256, DigestAlgorithm::Blake3] {
        if let Ok(parsed) = Commit::parse(data, algorithm) {
            if parsed.is_intact() {
                if let Ok(encoded) = parsed.commit.encode() {
                    assert_eq!(encoded, data, "intact commit must re-encode identically");
                }
            }
        }
    }
}

/// Fuzz target for snapshot decoding.
pub fn fuzz_snapshot_decode(data: &[u8]) {
    let _ = Snapshot::decode(data, 0, None, tessera_core::checksum::DEFAULT_GROUP_SIZE);
}

/// Fuzz target for log header and block decoding.
pub fn fuzz_layout_decode(data: &[u8]) {
    let _ = Header::decode(data);
    let _ = Block::peek_len(data);
    let _ = Block::decode(data);
}

/// Fuzz target for scanning a whole log file.
///
/// A scan that succeeds never reports a block past the published end.
pub fn fuzz_log_scan(data: &[u8]) {
    let backend = InMemoryBackend::with_data(data.to_vec());
    if let Ok(scan) = LogScan::read(&backend) {
        for block in &scan.blocks {
            assert!(block.offset + block.len <= scan.size, "block beyond file end");
        }
    }
}

/// Fuzz target for payload decoding.
///
/// A payload that decodes must survive a round trip.
pub fn fuzz_payload_decode(data: &[u8]) {
    if let Ok(payload) = Payload::decode(data) {
        if let Ok(encoded) = payload.encode() {
            let decoded = Payload::decode(&encoded).expect("re-decode of own encoding");
            assert_eq!(decoded, payload, "payload roundtrip mismatch");
        }
    }
}

/// Runs every target over one input.
pub fn fuzz_all(data: &[u8]) {
    fuzz_commit_parse(data);
    fuzz_snapshot_decode(data);
    fuzz_layout_decode(data);
    fuzz_log_scan(data);
    fuzz_payload_decode(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_inputs_do_not_panic() {
        let inputs: [&[u8]; 6] = [
            b"",
            b"TCMT",
            b"TSNP\x01\x00\x01\x00",
            b"TSHD\xff\xff\xff\xff",
            b"TBLK\x00\x00\x00\x10",
            &[0xFF; 300],
        ];
        for input in inputs {
            fuzz_all(input);
        }
    }

    proptest! {
        #![proptest_config(crate::generators::PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn random_bytes_do_not_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            fuzz_all(&data);
        }

        #[test]
        fn magic_prefixed_bytes_do_not_panic(
            magic in prop::sample::select(vec![&b"TSHD"[..], b"TBLK", b"TCMT", b"TSNP"]),
            tail in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut data = magic.to_vec();
            data.extend(tail);
            fuzz_all(&data);
        }
    }
}
