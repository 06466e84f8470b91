//! Wire codec for the adapter plugin protocol
//!
//! Inbound frames are newline-terminated text of the form
//! `name_correlator_payload`, where `name` is a dotted lowercase identifier,
//! `correlator` is either the decimal invoker id echoed from a request or the
//! literal `e` for an unsolicited event, and `payload` is everything up to the
//! newline. The payload is decoded as JSON when possible and kept as a plain
//! string otherwise.
//!
//! Outbound requests are `action;invokerId`, optionally followed by
//! `;argument` where the argument is raw text or a JSON document.
//!
//! A stream socket gives no guarantee that a read ends on a frame boundary,
//! so [`FrameDecoder`] buffers bytes and only yields complete lines.

use crate::error::FrameError;
use serde_json::Value;

/// Longest partial frame kept while waiting for its newline.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Correlator of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlator {
    /// Response to the request issued with this invoker id.
    Invoker(u64),
    /// Unsolicited event pushed by the plugin.
    Event,
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub name: String,
    pub correlator: Correlator,
    pub payload: Value,
}

impl Frame {
    /// Parses a single line, without its trailing newline.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let (name, rest) = line
            .split_once('_')
            .ok_or_else(|| FrameError::MissingSeparator(line.to_string()))?;
        let (correlator, payload) = rest
            .split_once('_')
            .ok_or_else(|| FrameError::MissingSeparator(line.to_string()))?;

        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_lowercase() || b == b'.') {
            return Err(FrameError::InvalidName(name.to_string()));
        }

        let correlator = if correlator == "e" {
            Correlator::Event
        } else if !correlator.is_empty() && correlator.bytes().all(|b| b.is_ascii_digit()) {
            correlator
                .parse::<u64>()
                .map(Correlator::Invoker)
                .map_err(|_| FrameError::InvalidCorrelator(correlator.to_string()))?
        } else {
            return Err(FrameError::InvalidCorrelator(correlator.to_string()));
        };

        Ok(Self {
            name: name.to_string(),
            correlator,
            payload: decode_payload(payload),
        })
    }

    pub fn is_event(&self) -> bool {
        self.correlator == Correlator::Event
    }
}

/// JSON when it parses, the raw text otherwise.
pub fn decode_payload(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

/// Incremental line splitter over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    /// Inside an overlong frame that was dropped; skip to the next newline.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held for an incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Yields the next complete frame, or `None` when only a partial frame
    /// (or nothing) is buffered. Blank lines are skipped.
    ///
    /// A frame exceeding [`MAX_FRAME_LEN`] is reported once as
    /// [`FrameError::TooLong`]; the rest of it, up to its newline, is dropped.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                if self.discarding {
                    self.buffer.clear();
                    self.scanned = 0;
                    return None;
                }
                if self.buffer.len() > MAX_FRAME_LEN {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Some(Err(FrameError::TooLong(len)));
                }
                self.scanned = self.buffer.len();
                return None;
            };

            let newline = self.scanned + offset;
            self.scanned = 0;
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            return Some(match String::from_utf8(line) {
                Ok(text) => Frame::parse(&text),
                Err(_) => Err(FrameError::InvalidUtf8),
            });
        }
    }
}

/// Argument attached to an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestArg {
    Text(String),
    Json(Value),
}

impl From<&str> for RequestArg {
    fn from(text: &str) -> Self {
        RequestArg::Text(text.to_string())
    }
}

impl From<String> for RequestArg {
    fn from(text: String) -> Self {
        RequestArg::Text(text)
    }
}

impl From<Value> for RequestArg {
    fn from(value: Value) -> Self {
        RequestArg::Json(value)
    }
}

/// Encodes a request without its line terminator.
pub fn encode_request(action: &str, invoker_id: u64, arg: Option<&RequestArg>) -> String {
    match arg {
        None => format!("{action};{invoker_id}"),
        Some(RequestArg::Text(text)) => format!("{action};{invoker_id};{text}"),
        Some(RequestArg::Json(value)) => format!("{action};{invoker_id};{value}"),
    }
}

/// Pending-call key for an action and invoker.
pub fn call_key(action: &str, invoker_id: u64) -> String {
    format!("{action}_{invoker_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_request_forms() {
        assert_eq!(encode_request("save", 42, None), "save;42");
        assert_eq!(
            encode_request("chat", 7, Some(&"park closes soon".into())),
            "chat;7;park closes soon"
        );
        assert_eq!(
            encode_request("chat", 7, Some(&json!({"message": "hi"}).into())),
            r#"chat;7;{"message":"hi"}"#
        );
    }

    #[test]
    fn test_response_and_event_frames() {
        let response = Frame::parse(r#"save_42_"scenario1""#).unwrap();
        assert_eq!(response.name, "save");
        assert_eq!(response.correlator, Correlator::Invoker(42));
        assert_eq!(response.payload, json!("scenario1"));

        let event = Frame::parse("chat_e_hello").unwrap();
        assert!(event.is_event());
        assert_eq!(event.payload, json!("hello"));
    }

    #[test]
    fn test_payload_may_contain_separators() {
        let frame = Frame::parse(r#"player.list_3_[{"name":"a_b","group":"admin"}]"#).unwrap();
        assert_eq!(frame.name, "player.list");
        assert_eq!(frame.payload[0]["name"], "a_b");

        let frame = Frame::parse("chat_e_snake_case_text").unwrap();
        assert_eq!(frame.payload, json!("snake_case_text"));
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(matches!(
            Frame::parse("chat"),
            Err(FrameError::MissingSeparator(_))
        ));
        assert!(matches!(
            Frame::parse("Chat_e_hi"),
            Err(FrameError::InvalidName(_))
        ));
        assert!(matches!(
            Frame::parse("chat_x1_hi"),
            Err(FrameError::InvalidCorrelator(_))
        ));
    }

    #[test]
    fn test_decoder_splits_concatenated_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"chat_e_one\nchat_e_two\r\n\nsave_1_\"x\"\n");

        let names: Vec<_> = std::iter::from_fn(|| decoder.next_frame())
            .map(|f| f.unwrap().payload)
            .collect();
        assert_eq!(names, vec![json!("one"), json!("two"), json!("x")]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_decoder_holds_partial_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"scenario_5_{\"name\":\"Fo");
        assert!(decoder.next_frame().is_none());

        decoder.extend(b"rest\",\"status\":\"inProgress\"}\nchat_e_par");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload["name"], "Forest");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.pending_len(), "chat_e_par".len());
    }

    #[test]
    fn test_decoder_drops_overlong_frame_once() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"chat_e_");
        decoder.extend(&vec![b'a'; MAX_FRAME_LEN]);
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(FrameError::TooLong(len))) if len == MAX_FRAME_LEN + 7
        ));
        assert_eq!(decoder.pending_len(), 0);

        decoder.extend(b"still the dropped frame");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.pending_len(), 0);

        decoder.extend(b" tail\nchat_e_next\n");
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, json!("next"));
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_decoder_assembles_frame_from_small_reads() {
        let mut decoder = FrameDecoder::new();
        let payload = "x".repeat(4096);
        let frame = format!("chat_e_{payload}\nchat_e_after\n");
        for chunk in frame.as_bytes().chunks(3) {
            decoder.extend(chunk);
            if let Some(result) = decoder.next_frame() {
                assert_eq!(result.unwrap().payload, json!(payload));
                break;
            }
        }
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, json!("after"));
    }

    #[test]
    fn test_decoder_recovers_after_bad_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"garbage\nchat_e_ok\n");
        assert!(decoder.next_frame().unwrap().is_err());
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, json!("ok"));
    }
}
