use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ids::next_message_pair;
use super::message::{Message, MessageList};
use crate::services::{ChatRequest, StreamEvent, StreamEvents, StreamHandle, StreamOpener};

/// Content given to a reply that completed without any text.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "No response.";

/// Prefix of the line appended to a reply when the stream reports an error.
pub const ERROR_MARKER: &str = "⚠️";

/// Status of a stream lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Active,
    Completed,
    Cancelled,
    Failed(String),
}

/// Why a send was refused. A refused send changes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("A reply is still streaming in conversation {conversation_id}")]
    AlreadyStreaming { conversation_id: String },
}

struct InFlight {
    conversation_id: String,
    assistant_id: String,
    events: StreamEvents,
    handle: StreamHandle,
    last_error: Option<String>,
}

/// Turns a user prompt into a user/assistant message pair and fills the
/// assistant message from the event stream.
///
/// Holds at most one in-flight stream. The caller owns the `MessageList` and
/// passes it to every call, so all mutation happens on the caller's task.
pub struct MessageAssembler {
    opener: Arc<dyn StreamOpener>,
    in_flight: Option<InFlight>,
    last_status: Option<StreamStatus>,
}

impl MessageAssembler {
    pub fn new(opener: Arc<dyn StreamOpener>) -> Self {
        Self {
            opener,
            in_flight: None,
            last_status: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Conversation whose reply is currently streaming.
    pub fn streaming_conversation(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|f| f.conversation_id.as_str())
    }

    /// Outcome of the most recent stream, or `Active` while one runs.
    pub fn last_status(&self) -> Option<&StreamStatus> {
        self.last_status.as_ref()
    }

    /// Append the prompt and an empty reply to `messages` and open a stream.
    /// Returns the id of the reply.
    pub fn send(
        &mut self,
        conversation_id: &str,
        messages: &mut MessageList,
        text: &str,
    ) -> Result<String, SendRejection> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendRejection::EmptyMessage);
        }
        if let Some(in_flight) = &self.in_flight {
            debug!(
                conv_id = %conversation_id,
                streaming = %in_flight.conversation_id,
                "Rejecting send while a reply is streaming"
            );
            return Err(SendRejection::AlreadyStreaming {
                conversation_id: in_flight.conversation_id.clone(),
            });
        }

        let (user_id, assistant_id) = next_message_pair();
        messages.push(Message::user(user_id, text));
        messages.push(Message::pending_assistant(assistant_id.clone()));

        let events = self.opener.open(ChatRequest::new(text));
        let handle = events.handle();
        info!(conv_id = %conversation_id, message_id = %assistant_id, "Stream started");

        self.in_flight = Some(InFlight {
            conversation_id: conversation_id.to_string(),
            assistant_id: assistant_id.clone(),
            events,
            handle,
            last_error: None,
        });
        self.last_status = Some(StreamStatus::Active);
        Ok(assistant_id)
    }

    /// Wait for the next event, apply it to `messages` and return it.
    ///
    /// Returns `None` once the stream has settled (or when nothing is
    /// streaming); the reply is sealed at that point.
    pub async fn next_event(&mut self, messages: &mut MessageList) -> Option<StreamEvent> {
        let in_flight = self.in_flight.as_mut()?;
        let event = in_flight.events.next().await;

        match event {
            Some(event) => {
                self.apply(messages, &event);
                Some(event)
            }
            None => {
                self.settle(messages);
                None
            }
        }
    }

    /// Abort the in-flight stream, keeping whatever content arrived.
    pub fn stop(&mut self, messages: &mut MessageList) -> bool {
        let Some(in_flight) = self.in_flight.take() else {
            return false;
        };
        in_flight.handle.abort();
        messages.update(&in_flight.assistant_id, |m| m.seal());
        info!(conv_id = %in_flight.conversation_id, "Stream stopped by user");
        self.last_status = Some(StreamStatus::Cancelled);
        true
    }

    fn apply(&mut self, messages: &mut MessageList, event: &StreamEvent) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        let id = in_flight.assistant_id.as_str();

        match event {
            StreamEvent::Token(text) => {
                messages.update(id, |m| m.append_content(text));
            }
            StreamEvent::ToolCall(name) => {
                debug!(message_id = %id, tool = %name, "Tool call");
                messages.update(id, |m| m.push_tool(name.as_str()));
            }
            StreamEvent::Error(message) => {
                warn!(message_id = %id, error = %message, "Stream reported error");
                messages.update(id, |m| append_error_annotation(m, message));
                in_flight.last_error = Some(message.clone());
            }
            StreamEvent::Done => {
                messages.update(id, |m| {
                    if m.content().is_empty() {
                        m.append_content(EMPTY_RESPONSE_PLACEHOLDER);
                    }
                    m.seal();
                });
                in_flight.last_error = None;
                self.last_status = Some(StreamStatus::Completed);
                self.finish();
            }
        }
    }

    /// The event stream ended. Without a `Done` this is a failure; the
    /// error annotation is already in place.
    fn settle(&mut self, messages: &mut MessageList) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        messages.update(&in_flight.assistant_id, |m| m.seal());

        let status = if in_flight.handle.is_aborted() {
            StreamStatus::Cancelled
        } else {
            StreamStatus::Failed(
                in_flight
                    .last_error
                    .unwrap_or_else(|| "Stream closed".to_string()),
            )
        };
        info!(conv_id = %in_flight.conversation_id, status = ?status, "Stream ended");
        self.last_status = Some(status);
    }

    fn finish(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            info!(conv_id = %in_flight.conversation_id, "Stream completed");
        }
    }
}

fn append_error_annotation(message: &mut Message, error: &str) {
    let separator = if message.content().is_empty() || message.content().ends_with('\n') {
        ""
    } else {
        "\n"
    };
    message.append_content(&format!("{separator}{ERROR_MARKER} {error}"));
}
