//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Line codec: command encoding and telemetry decoding."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use serde::Serialize;
use serde_json::Value;

use crate::types::{json_kind, Command, Telemetry};
use crate::{DecodeError, EncodeError};

/// Encode a command as one newline-terminated JSON object.
pub fn encode(command: &Command) -> Result<Vec<u8>, EncodeError> {
    encode_line(command)
}

/// Encode any wire record (commands, or telemetry written by an emulated
/// device) as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(record: &T) -> Result<Vec<u8>, EncodeError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Keep printable ASCII (0x20..=0x7E) only. Serial noise, `\r` and stray
/// control bytes are removed before parsing.
pub fn sanitize(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|byte| (0x20..=0x7E).contains(byte))
        .map(char::from)
        .collect()
}

/// Decode one framed line into a telemetry record.
pub fn decode(raw: &[u8]) -> Result<Telemetry, DecodeError> {
    let line = sanitize(raw);
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::empty());
    }
    let value: Value =
        serde_json::from_str(line).map_err(|err| DecodeError::malformed(err.to_string()))?;
    match value {
        Value::Object(map) => Ok(Telemetry::from_object(map)),
        other => Err(DecodeError::malformed(format!(
            "expected JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Sample};
    use crate::DecodeErrorKind;

    #[test]
    fn encodes_newline_terminated_object() {
        let bytes = encode(&Command::Dir(Direction::Backward)).unwrap();
        assert_eq!(bytes, b"{\"dir\":\"b\"}\n");
    }

    #[test]
    fn decodes_through_injected_noise() {
        let raw = b"\x00\x1b{\"bemf\":10,\xff\"target\":9,\"rate\":8,\x07\"current\":7}\r\n";
        match decode(raw).unwrap() {
            Telemetry::Sample(sample) => assert_eq!(sample, Sample::new(10, 9, 8, 7)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_and_whitespace_lines_are_empty_frames() {
        for raw in [&b""[..], b"\r\n", b"\x00\x01\x02", b"   "] {
            let err = decode(raw).unwrap_err();
            assert!(err.is_empty_frame(), "{raw:?}");
        }
    }

    #[test]
    fn garbage_is_malformed() {
        for raw in [&b"{\"bemf\":"[..], b"hello", b"[1,2,3]", b"\"text\"", b"}{"] {
            let err = decode(raw).unwrap_err();
            assert_eq!(err.kind, DecodeErrorKind::MalformedFrame, "{raw:?}");
        }
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes() {
        let mut state: u32 = 0x1234_5678;
        for _ in 0..2_000 {
            let len = (state % 64) as usize;
            let mut line = Vec::with_capacity(len);
            for _ in 0..len {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                line.push((state & 0xff) as u8);
            }
            let _ = decode(&line);
        }
    }
}
