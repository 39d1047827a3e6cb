use serde::Deserialize;
use tracing::debug;

use super::stream_transport::StreamEvent;

/// Prefix marking an event line in the response body.
const FRAME_PREFIX: &str = "data: ";

/// Optional end marker. Completion comes from the HTTP exchange, not from this.
const DONE_SENTINEL: &str = "[DONE]";

/// Error text used when an error frame carries no message.
const DEFAULT_ERROR_MESSAGE: &str = "Error";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Token {
        #[serde(default)]
        content: Option<String>,
    },
    ToolCall {
        #[serde(default)]
        tool: Option<String>,
    },
    Error {
        #[serde(default)]
        content: Option<String>,
    },
}

impl WireFrame {
    fn into_event(self) -> Option<StreamEvent> {
        match self {
            WireFrame::Token { content } => content
                .filter(|text| !text.is_empty())
                .map(StreamEvent::Token),
            WireFrame::ToolCall { tool } => tool.map(StreamEvent::ToolCall),
            WireFrame::Error { content } => Some(StreamEvent::Error(
                content
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            )),
        }
    }
}

/// Decodes frames from a response body that only ever grows.
///
/// The decoder remembers how many bytes it has consumed and looks only at the
/// suffix appended since. The cursor stops after the last complete line, so a
/// frame split across observations is decoded once, when its newline arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    consumed: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the body already decoded.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Decode every complete line appended to `body` since the last call.
    pub fn observe(&mut self, body: &[u8]) -> Vec<StreamEvent> {
        if body.len() < self.consumed {
            debug!(
                len = body.len(),
                consumed = self.consumed,
                "Response body shrank, ignoring observation"
            );
            return Vec::new();
        }

        let unread = &body[self.consumed..];
        let Some(last_newline) = unread.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        self.consumed += last_newline + 1;

        unread[..last_newline]
            .split(|b| *b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Final observation once the body is complete: also decodes a last line
    /// that has no trailing newline.
    pub fn finish(&mut self, body: &[u8]) -> Vec<StreamEvent> {
        let mut events = self.observe(body);
        if body.len() > self.consumed {
            let rest = &body[self.consumed..];
            self.consumed = body.len();
            events.extend(decode_line(rest));
        }
        events
    }
}

fn decode_line(line: &[u8]) -> Option<StreamEvent> {
    let line = std::str::from_utf8(line).ok()?;
    let payload = line.strip_prefix(FRAME_PREFIX)?.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }

    match serde_json::from_str::<WireFrame>(payload) {
        Ok(frame) => frame.into_event(),
        Err(e) => {
            debug!(error = %e, "Dropping malformed frame");
            None
        }
    }
}
