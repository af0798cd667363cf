//! Line protocol spoken to plugins.
//!
//! Every message from the bridge is one compact JSON object followed by `\n`:
//!
//! | Channel | Line                                            |
//! |---------|-------------------------------------------------|
//! | Frames  | `{"frames":[{"data":<frame>},{"data":<frame>}]}` |
//! | Raw     | `{"data":"<base64 of device bytes>"}`           |
//!
//! A tick that collected several frames still produces a single line, so a
//! plugin only needs one read-line-and-parse loop for both channels. Plugins
//! write raw bytes back; that direction has no framing at all.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LINE_DELIMITER: u8 = b'\n';

/// One frame inside a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEntry {
    pub data: Value,
}

#[derive(Serialize)]
struct FrameBatch<'a> {
    frames: &'a [FrameEntry],
}

#[derive(Serialize)]
struct RawChunk {
    data: String,
}

/// Encodes serialized frames as one broadcast line.
pub fn encode_frames(entries: &[FrameEntry]) -> serde_json::Result<Bytes> {
    let mut line = serde_json::to_vec(&FrameBatch { frames: entries })?;
    line.push(LINE_DELIMITER);
    Ok(Bytes::from(line))
}

/// Encodes a raw device chunk as one relay line.
pub fn encode_raw(bytes: &[u8]) -> Bytes {
    let chunk = RawChunk {
        data: STANDARD.encode(bytes),
    };
    // A struct holding a single string always serializes.
    let mut line = serde_json::to_vec(&chunk).unwrap_or_default();
    line.push(LINE_DELIMITER);
    Bytes::from(line)
}

/// A decoded line, as a plugin sees it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PluginMessage {
    Frames { frames: Vec<FrameEntry> },
    Raw { data: String },
}

impl PluginMessage {
    /// Decoded bytes of a raw relay line, `None` for frame broadcasts.
    pub fn raw_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            PluginMessage::Raw { data } => Some(STANDARD.decode(data)),
            PluginMessage::Frames { .. } => None,
        }
    }
}

/// Parses one line received from the bridge; the trailing newline is optional.
pub fn decode_line(line: &str) -> serde_json::Result<PluginMessage> {
    serde_json::from_str(line.trim_end_matches(['\r', '\n']))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_batch_is_one_line() {
        let entries = vec![
            FrameEntry { data: json!({"t": 1}) },
            FrameEntry { data: json!({"t": 2}) },
        ];
        let line = encode_frames(&entries).unwrap();
        assert_eq!(
            &line[..],
            b"{\"frames\":[{\"data\":{\"t\":1}},{\"data\":{\"t\":2}}]}\n"
        );
        assert_eq!(line.iter().filter(|&&b| b == LINE_DELIMITER).count(), 1);
    }

    #[test]
    fn test_raw_chunk_is_base64() {
        assert_eq!(&encode_raw(&[0x41, 0x42])[..], b"{\"data\":\"QUI=\"}\n");
        assert_eq!(&encode_raw(&[])[..], b"{\"data\":\"\"}\n");
    }

    #[test]
    fn test_decode_distinguishes_channels() {
        let raw = decode_line("{\"data\":\"QUI=\"}\n").unwrap();
        assert_eq!(raw.raw_bytes().unwrap().unwrap(), vec![0x41, 0x42]);

        let frames = decode_line(r#"{"frames":[{"data":[1,2]}]}"#).unwrap();
        assert_eq!(
            frames,
            PluginMessage::Frames {
                frames: vec![FrameEntry { data: json!([1, 2]) }]
            }
        );
        assert!(frames.raw_bytes().is_none());
    }

    #[test]
    fn test_binary_payload_survives_relay() {
        let bytes: Vec<u8> = (0..=255).collect();
        let line = encode_raw(&bytes);
        let text = std::str::from_utf8(&line).unwrap();
        let decoded = decode_line(text).unwrap().raw_bytes().unwrap().unwrap();
        assert_eq!(decoded, bytes);
    }
}
