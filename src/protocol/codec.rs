//! Event codec
//!
//! Encodes `StreamEvent`s as SSE frames and decodes them back from an
//! arbitrarily chunked byte stream. The decoder also accepts bare
//! newline-delimited JSON. Anything that is not one of the known event
//! types is reported as an error, never defaulted.

use std::collections::VecDeque;

use serde_json::Value;

use super::event::StreamEvent;
use crate::error::CodecError;

const KNOWN_TYPES: [&str; 5] = [
    "system",
    "assistant",
    "result",
    "permission_request",
    "error",
];

/// Serialize an event to its JSON object form.
pub fn encode_json(event: &StreamEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Serialize an event as a complete SSE frame.
pub fn encode_sse(event: &StreamEvent) -> Result<String, CodecError> {
    let json = encode_json(event)?;
    Ok(format!("event: {}\ndata: {json}\n\n", event.kind()))
}

/// Decode one JSON payload into an event.
pub fn decode(data: &str) -> Result<StreamEvent, CodecError> {
    let data = data.trim();
    if data.is_empty() {
        return Err(CodecError::Empty);
    }

    let value: Value =
        serde_json::from_str(data).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?;
    if !KNOWN_TYPES.contains(&event_type) {
        return Err(CodecError::UnknownType(event_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Incremental decoder for SSE / NDJSON byte streams
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
    ready: VecDeque<Result<StreamEvent, CodecError>>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every frame it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, CodecError>> {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            match String::from_utf8(raw) {
                Ok(line) => self.process_line(line.trim_end_matches(['\n', '\r'])),
                Err(_) => self.ready.push_back(Err(CodecError::InvalidUtf8)),
            }
        }

        self.ready.drain(..).collect()
    }

    /// Flush a trailing frame left without its terminating blank line.
    pub fn finish(&mut self) -> Vec<Result<StreamEvent, CodecError>> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            match String::from_utf8(raw) {
                Ok(line) => self.process_line(line.trim_end_matches('\r')),
                Err(_) => self.ready.push_back(Err(CodecError::InvalidUtf8)),
            }
        }
        self.dispatch();
        self.ready.drain(..).collect()
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            // keep-alive comment
            return;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
            return;
        }
        if line.starts_with("id:") || line.starts_with("retry:") {
            return;
        }
        if line.trim_start().starts_with('{') && self.data_lines.is_empty() {
            self.ready.push_back(decode(line));
            return;
        }
        self.ready
            .push_back(Err(CodecError::Malformed(format!("unexpected line: {line}"))));
    }

    fn dispatch(&mut self) {
        let name = self.event_name.take();
        if self.data_lines.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        let decoded = decode(&data).and_then(|event| match name {
            Some(name) if name != event.kind() => Err(CodecError::EventMismatch {
                declared: name,
                actual: event.kind().to_string(),
            }),
            _ => Ok(event),
        });
        self.ready.push_back(decoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::{ContentBlock, ErrorCode};

    fn text_event(text: &str) -> StreamEvent {
        StreamEvent::Assistant {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    #[test]
    fn test_encode_sse_frame_layout() {
        let frame = encode_sse(&text_event("hi")).unwrap();
        assert!(frame.starts_with("event: assistant\ndata: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode(r#"{"type":"heartbeat"}"#).unwrap_err();
        assert_eq!(err, CodecError::UnknownType("heartbeat".to_string()));
    }

    #[test]
    fn test_decode_rejects_missing_type_and_garbage() {
        assert_eq!(decode(r#"{"content":[]}"#).unwrap_err(), CodecError::MissingType);
        assert_eq!(decode("   ").unwrap_err(), CodecError::Empty);
        assert!(matches!(decode("{nope"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_known_type_with_bad_fields() {
        assert!(matches!(
            decode(r#"{"type":"assistant","content":"not a list"}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_decoder_handles_frames_split_across_chunks() {
        let a = encode_sse(&text_event("one")).unwrap();
        let b = encode_sse(&StreamEvent::error(ErrorCode::Cancelled, "stop")).unwrap();
        let all = format!("{a}: ping\n\n{b}");
        let (left, right) = all.as_bytes().split_at(7);

        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.feed(left);
        assert!(frames.is_empty());
        frames.extend(decoder.feed(right));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &text_event("one"));
        assert!(frames[1].as_ref().unwrap().is_terminal());
    }

    #[test]
    fn test_decoder_accepts_ndjson_lines() {
        let line = format!("{}\n", encode_json(&text_event("plain")).unwrap());
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(line.as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &text_event("plain"));
    }

    #[test]
    fn test_decoder_flags_event_name_mismatch() {
        let json = encode_json(&text_event("x")).unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(format!("event: result\ndata: {json}\n\n").as_bytes());
        assert!(matches!(
            frames[0],
            Err(CodecError::EventMismatch { .. })
        ));
    }

    #[test]
    fn test_decoder_handles_crlf_and_finish() {
        let json = encode_json(&text_event("tail")).unwrap();
        let mut decoder = FrameDecoder::new();
        assert!(decoder
            .feed(format!("event: assistant\r\ndata: {json}\r\n").as_bytes())
            .is_empty());
        let frames = decoder.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &text_event("tail"));
    }

    #[test]
    fn test_decoder_reports_stray_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"garbage line\n");
        assert!(matches!(frames[0], Err(CodecError::Malformed(_))));
    }
}
