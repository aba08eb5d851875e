//! # Payload Codec
//!
//! Turns a [`Batch`] into the bytes a chain link carries and back.
//!
//! Encoding is JSON. If the JSON is larger than the configured limit it is
//! gzip-compressed, and if that still doesn't fit the write is refused; the
//! codec never truncates. Decoding tries gunzip first and falls back to
//! plain JSON, so links written before compression existed still read.
//! Anything that decodes to neither comes back as [`DecodedPayload::Raw`]
//! instead of an error, which lets history reads keep walking past foreign
//! or damaged payloads.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::error::{AuditError, AuditResult};

/// Largest decompressed payload we will inflate. A 4 KiB gzip stream can
/// claim far more than any real batch.
const MAX_INFLATED_BYTES: u64 = 16 * 1024 * 1024;

/// gzip magic number.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How the payload bytes are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// UTF-8 JSON.
    Plain,
    /// gzip-compressed JSON.
    Gzip,
}

/// Output of [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Bytes to place in the data-carrier output.
    pub bytes: Vec<u8>,
    /// Whether compression was needed.
    pub encoding: Encoding,
}

impl EncodedPayload {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Output of [`decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DecodedPayload {
    /// A well-formed batch.
    Batch {
        /// The decoded batch.
        batch: Batch,
        /// How it was stored.
        encoding: Encoding,
    },
    /// Bytes that are not a batch in any supported encoding.
    Raw {
        /// The payload, hex-encoded.
        hex: String,
        /// Why structured decoding failed.
        reason: String,
    },
}

impl DecodedPayload {
    /// The batch, if decoding succeeded.
    pub fn batch(&self) -> Option<&Batch> {
        match self {
            Self::Batch { batch, .. } => Some(batch),
            Self::Raw { .. } => None,
        }
    }

    /// `true` for the raw fallback.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw { .. })
    }
}

/// Encodes a batch, compressing only when the JSON exceeds
/// `max_payload_bytes`.
///
/// A batch whose JSON is exactly `max_payload_bytes` long is stored plain.
pub fn encode(batch: &Batch, max_payload_bytes: usize) -> AuditResult<EncodedPayload> {
    let json = serde_json::to_vec(batch).map_err(|e| AuditError::Serialization(e.to_string()))?;
    if json.len() <= max_payload_bytes {
        return Ok(EncodedPayload {
            bytes: json,
            encoding: Encoding::Plain,
        });
    }

    let compressed = gzip(&json)?;
    if compressed.len() > max_payload_bytes {
        return Err(AuditError::PayloadTooLarge {
            size: compressed.len(),
            limit: max_payload_bytes,
        });
    }

    tracing::debug!(
        plain = json.len(),
        compressed = compressed.len(),
        limit = max_payload_bytes,
        "payload compressed to fit"
    );
    Ok(EncodedPayload {
        bytes: compressed,
        encoding: Encoding::Gzip,
    })
}

/// Decodes a payload, degrading to [`DecodedPayload::Raw`] on failure.
pub fn decode(bytes: &[u8]) -> DecodedPayload {
    match decode_strict(bytes) {
        Ok((batch, encoding)) => DecodedPayload::Batch { batch, encoding },
        Err(e) => DecodedPayload::Raw {
            hex: hex::encode(bytes),
            reason: e.to_string(),
        },
    }
}

/// Decodes a payload, returning [`AuditError::Decode`] on failure.
pub fn decode_strict(bytes: &[u8]) -> AuditResult<(Batch, Encoding)> {
    if let Ok(inflated) = gunzip(bytes) {
        if let Ok(batch) = serde_json::from_slice::<Batch>(&inflated) {
            return Ok((batch, Encoding::Gzip));
        }
    }
    serde_json::from_slice::<Batch>(bytes)
        .map(|batch| (batch, Encoding::Plain))
        .map_err(|e| AuditError::Decode(e.to_string()))
}

fn gzip(data: &[u8]) -> AuditResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| AuditError::Serialization(format!("gzip: {e}")))?;
    encoder
        .finish()
        .map_err(|e| AuditError::Serialization(format!("gzip: {e}")))
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "not gzip"));
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_INFLATED_BYTES)
        .read_to_end(&mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::LogEntry;
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    fn entry(v: Value) -> LogEntry {
        LogEntry::new(v.as_object().cloned().unwrap_or_else(Map::new))
    }

    fn batch_of(n: usize) -> Batch {
        let entries = (0..n)
            .map(|i| entry(json!({"action": "tool_call", "tokens_in": i, "details": "web_search"})))
            .collect();
        Batch::new("agent-test", Utc::now(), entries)
    }

    #[test]
    fn small_batch_roundtrips_plain() {
        let batch = batch_of(2);
        let encoded = encode(&batch, 4096).unwrap();
        assert_eq!(encoded.encoding, Encoding::Plain);
        assert_eq!(decode(&encoded.bytes).batch(), Some(&batch));
    }

    #[test]
    fn large_batch_roundtrips_compressed() {
        let batch = batch_of(100);
        let encoded = encode(&batch, 4096).unwrap();
        assert_eq!(encoded.encoding, Encoding::Gzip);
        assert!(encoded.bytes.starts_with(&GZIP_MAGIC));
        assert!(encoded.len() <= 4096);

        match decode(&encoded.bytes) {
            DecodedPayload::Batch { batch: b, encoding } => {
                assert_eq!(b, batch);
                assert_eq!(encoding, Encoding::Gzip);
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn exact_limit_stays_plain_and_one_less_compresses() {
        let batch = batch_of(10);
        let plain_len = serde_json::to_vec(&batch).unwrap().len();

        let at_limit = encode(&batch, plain_len).unwrap();
        assert_eq!(at_limit.encoding, Encoding::Plain);
        assert_eq!(at_limit.len(), plain_len);

        let over = encode(&batch, plain_len - 1).unwrap();
        assert_eq!(over.encoding, Encoding::Gzip);
        assert_eq!(decode(&over.bytes).batch(), Some(&batch));
    }

    #[test]
    fn still_too_large_after_compression_fails() {
        let batch = batch_of(3);
        let err = encode(&batch, 16).unwrap_err();
        match err {
            AuditError::PayloadTooLarge { size, limit } => {
                assert_eq!(limit, 16);
                assert!(size > 16);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn incompressible_payload_is_refused() {
        use rand::{distributions::Alphanumeric, Rng};
        let noise: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8_000)
            .map(char::from)
            .collect();
        let batch = Batch::new("agent", Utc::now(), vec![entry(json!({ "blob": noise }))]);
        assert!(matches!(
            encode(&batch, 4096),
            Err(AuditError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_degrades_to_raw() {
        let decoded = decode(b"\x01\x02not json");
        match decoded {
            DecodedPayload::Raw { hex, reason } => {
                assert_eq!(hex, hex::encode(b"\x01\x02not json"));
                assert!(!reason.is_empty());
            }
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn json_that_is_not_a_batch_is_raw() {
        assert!(decode(br#"{"hello": "world"}"#).is_raw());
    }

    #[test]
    fn corrupt_gzip_degrades_to_raw() {
        let batch = batch_of(100);
        let mut encoded = encode(&batch, 4096).unwrap().bytes;
        let mid = encoded.len() / 2;
        encoded.truncate(mid);
        assert!(decode(&encoded).is_raw());
        assert!(matches!(decode_strict(&encoded), Err(AuditError::Decode(_))));
    }
}
