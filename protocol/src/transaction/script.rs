//! Data-carrier scripts.
//!
//! A chain link stores its payload in a zero-value output whose locking
//! script is `OP_RETURN <push>`. Some wallets prefix `OP_FALSE` to make the
//! output provably unspendable; readers accept both forms.

use thiserror::Error;

/// `OP_FALSE` / `OP_0`.
pub const OP_FALSE: u8 = 0x00;
/// Next byte holds the push length.
pub const OP_PUSHDATA1: u8 = 0x4c;
/// Next two bytes (LE) hold the push length.
pub const OP_PUSHDATA2: u8 = 0x4d;
/// Next four bytes (LE) hold the push length.
pub const OP_PUSHDATA4: u8 = 0x4e;
/// Marks the output as data, not value.
pub const OP_RETURN: u8 = 0x6a;

/// Failures while extracting data from a carrier script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The script does not start with the data-carrier marker.
    #[error("script is not a data carrier")]
    NotDataCarrier,

    /// A push declared more bytes than the script holds.
    #[error("push at offset {offset} wants {wanted} bytes, {available} available")]
    TruncatedPush {
        /// Offset of the push opcode.
        offset: usize,
        /// Declared push length.
        wanted: usize,
        /// Bytes left.
        available: usize,
    },

    /// A non-push opcode appeared after the marker.
    #[error("unexpected opcode {opcode:#04x} at offset {offset}")]
    UnexpectedOpcode {
        /// The opcode.
        opcode: u8,
        /// Where it was found.
        offset: usize,
    },
}

/// Encodes `data` as a single minimal push.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xFF {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xFFFF {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Builds `OP_RETURN <payload>`.
pub fn data_carrier_script(payload: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(payload.len() + 6);
    script.push(OP_RETURN);
    push_data(&mut script, payload);
    script
}

/// `true` if the script begins with `OP_RETURN` or `OP_FALSE OP_RETURN`.
pub fn is_data_carrier(script: &[u8]) -> bool {
    marker_len(script).is_some()
}

fn marker_len(script: &[u8]) -> Option<usize> {
    match script {
        [OP_RETURN, ..] => Some(1),
        [OP_FALSE, OP_RETURN, ..] => Some(2),
        _ => None,
    }
}

/// Extracts the payload from a carrier script, concatenating every push
/// after the marker.
pub fn extract_payload(script: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let mut pos = marker_len(script).ok_or(ScriptError::NotDataCarrier)?;
    let mut payload = Vec::new();

    while pos < script.len() {
        let offset = pos;
        let opcode = script[pos];
        pos += 1;

        let (len, header) = match opcode {
            0x01..=0x4b => (opcode as usize, 0),
            OP_PUSHDATA1 => (read_len(script, pos, 1, offset)?, 1),
            OP_PUSHDATA2 => (read_len(script, pos, 2, offset)?, 2),
            OP_PUSHDATA4 => (read_len(script, pos, 4, offset)?, 4),
            OP_FALSE => (0, 0),
            other => {
                return Err(ScriptError::UnexpectedOpcode {
                    opcode: other,
                    offset,
                })
            }
        };
        pos += header;

        let available = script.len().saturating_sub(pos);
        if len > available {
            return Err(ScriptError::TruncatedPush {
                offset,
                wanted: len,
                available,
            });
        }
        payload.extend_from_slice(&script[pos..pos + len]);
        pos += len;
    }

    Ok(payload)
}

fn read_len(script: &[u8], pos: usize, width: usize, offset: usize) -> Result<usize, ScriptError> {
    let available = script.len().saturating_sub(pos);
    if available < width {
        return Err(ScriptError::TruncatedPush {
            offset,
            wanted: width,
            available,
        });
    }
    let bytes = &script[pos..pos + width];
    let mut arr = [0u8; 4];
    arr[..width].copy_from_slice(bytes);
    Ok(u32::from_le_bytes(arr) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_push_uses_direct_length() {
        let script = data_carrier_script(b"hi");
        assert_eq!(script, vec![OP_RETURN, 2, b'h', b'i']);
    }

    #[test]
    fn push_opcode_boundaries() {
        for (len, header) in [(75usize, 1usize), (76, 2), (255, 2), (256, 3), (65_535, 3), (65_536, 5)] {
            let mut script = Vec::new();
            push_data(&mut script, &vec![0xAA; len]);
            assert_eq!(script.len(), len + header, "push of {len} bytes");
        }
    }

    #[test]
    fn extract_roundtrips_all_push_sizes() {
        for len in [1usize, 75, 76, 300, 70_000] {
            let payload = vec![0x5A; len];
            let script = data_carrier_script(&payload);
            assert_eq!(extract_payload(&script).unwrap(), payload);
        }
    }

    #[test]
    fn accepts_op_false_prefix() {
        let mut script = vec![OP_FALSE];
        script.extend(data_carrier_script(b"payload"));
        assert!(is_data_carrier(&script));
        assert_eq!(extract_payload(&script).unwrap(), b"payload");
    }

    #[test]
    fn multiple_pushes_are_concatenated() {
        let mut script = vec![OP_RETURN];
        push_data(&mut script, b"abc");
        push_data(&mut script, b"def");
        assert_eq!(extract_payload(&script).unwrap(), b"abcdef");
    }

    #[test]
    fn rejects_non_carrier_scripts() {
        // P2PKH prefix.
        assert!(!is_data_carrier(&[0x76, 0xa9, 0x14]));
        assert_eq!(
            extract_payload(&[0x76, 0xa9]).unwrap_err(),
            ScriptError::NotDataCarrier
        );
    }

    #[test]
    fn truncated_push_is_an_error() {
        let script = vec![OP_RETURN, 10, 1, 2, 3];
        assert!(matches!(
            extract_payload(&script).unwrap_err(),
            ScriptError::TruncatedPush { wanted: 10, .. }
        ));
    }

    #[test]
    fn unexpected_opcode_is_an_error() {
        let script = vec![OP_RETURN, 0x76];
        assert!(matches!(
            extract_payload(&script).unwrap_err(),
            ScriptError::UnexpectedOpcode { opcode: 0x76, .. }
        ));
    }
}
