//! Chat transport collaborator.
//!
//! The runtime never talks to a chat service directly. It pulls [`Update`]s
//! through a [`Transport`] and scripts push [`OutgoingMessage`]s back through
//! the same handle. [`crate::telegram::TelegramTransport`] is the production
//! implementation; [`MemoryTransport`] records traffic for tests and for the
//! local console.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be delivered.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The chat service rejected the request.
    #[error("API error {code}: {description}")]
    Api {
        /// Error code reported by the service.
        code: i64,
        /// Human readable description.
        description: String,
    },

    /// The response could not be decoded.
    #[error("unable to decode response: {0}")]
    Decode(String),

    /// The transport has been shut down.
    #[error("transport is closed")]
    Closed,
}

/// Sender of a message or callback query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct User {
    /// Service-wide user id.
    pub id: u64,
    /// Public handle, if the user has one.
    pub username: Option<String>,
    /// Display name.
    pub first_name: String,
}

/// A text message received in a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Chat the message belongs to.
    pub chat_id: u64,
    /// Message id within the chat.
    pub message_id: i64,
    /// Message text. Non-text messages carry an empty string.
    pub text: String,
    /// Sender, absent for channel posts.
    pub from: Option<User>,
}

/// A button press on an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackQuery {
    /// Query id, used to acknowledge the press.
    pub id: String,
    /// Chat the pressed keyboard lives in.
    pub chat_id: u64,
    /// Message carrying the keyboard.
    pub message_id: Option<i64>,
    /// Raw payload, `command;data`.
    pub data: String,
    /// User who pressed the button.
    pub from: Option<User>,
}

/// One inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// A message was posted.
    Message(IncomingMessage),
    /// An inline button was pressed.
    CallbackQuery(CallbackQuery),
}

impl Update {
    /// Chat the event is addressed to.
    #[must_use]
    pub const fn chat_id(&self) -> u64 {
        match self {
            Self::Message(message) => message.chat_id,
            Self::CallbackQuery(query) => query.chat_id,
        }
    }
}

/// A button that sends a callback query when pressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    /// Button label.
    pub text: String,
    /// Payload delivered back as [`CallbackQuery::data`].
    pub callback_data: String,
}

/// A button that sends its label as a message when pressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyButton {
    /// Button label.
    pub text: String,
}

/// Keyboard attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keyboard {
    /// Buttons under the message.
    Inline(Vec<Vec<InlineButton>>),
    /// Buttons replacing the user's keyboard.
    Reply(Vec<Vec<ReplyButton>>),
}

/// A message a script wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Destination chat.
    pub chat_id: u64,
    /// Message text.
    pub text: String,
    /// Optional keyboard.
    pub keyboard: Option<Keyboard>,
}

impl OutgoingMessage {
    /// Plain text message without a keyboard.
    #[must_use]
    pub fn text(chat_id: u64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            keyboard: None,
        }
    }
}

/// Source of inbound events and sink of outbound messages.
pub trait Transport: Send + Sync {
    /// Fetch pending updates, possibly blocking for a bounded time.
    ///
    /// # Errors
    ///
    /// Returns an error if the updates cannot be fetched.
    fn poll(&self) -> Result<Vec<Update>, TransportError>;

    /// Send a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be delivered.
    fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Acknowledge a callback query so the client stops its spinner.
    ///
    /// # Errors
    ///
    /// Returns an error if the acknowledgement cannot be delivered.
    fn answer_callback(&self, query_id: &str) -> Result<(), TransportError>;
}

/// In-memory transport.
///
/// Updates pushed with [`MemoryTransport::push`] are handed out by the next
/// [`Transport::poll`]; everything sent is recorded.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inbox: Mutex<VecDeque<Update>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    answered: Mutex<Vec<String>>,
}

impl MemoryTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an inbound update.
    pub fn push(&self, update: Update) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(update);
    }

    /// Messages sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages sent so far to one chat.
    #[must_use]
    pub fn sent_to(&self, chat_id: u64) -> Vec<OutgoingMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.chat_id == chat_id)
            .collect()
    }

    /// Remove and return the messages sent so far.
    pub fn take_sent(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Callback query ids acknowledged so far.
    #[must_use]
    pub fn answered(&self) -> Vec<String> {
        self.answered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for MemoryTransport {
    fn poll(&self) -> Result<Vec<Update>, TransportError> {
        Ok(self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect())
    }

    fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        tracing::trace!(chat_id = message.chat_id, text = %message.text, "Recorded outgoing message");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    fn answer_callback(&self, query_id: &str) -> Result<(), TransportError> {
        self.answered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn message(chat_id: u64, text: &str) -> Update {
        Update::Message(IncomingMessage {
            chat_id,
            message_id: 1,
            text: text.to_string(),
            from: None,
        })
    }

    #[test]
    fn poll_drains_pushed_updates_in_order() {
        let transport = MemoryTransport::new();
        transport.push(message(1, "first"));
        transport.push(message(2, "second"));

        let updates = transport.poll().expect("poll");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].chat_id(), 1);
        assert_eq!(updates[1].chat_id(), 2);
        assert!(transport.poll().expect("poll").is_empty());
    }

    #[test]
    fn sent_messages_are_recorded_per_chat() {
        let transport = MemoryTransport::new();
        transport
            .send_message(OutgoingMessage::text(7, "hi"))
            .expect("send");
        transport
            .send_message(OutgoingMessage::text(8, "there"))
            .expect("send");

        assert_eq!(transport.sent_to(7), vec![OutgoingMessage::text(7, "hi")]);
        assert_eq!(transport.take_sent().len(), 2);
        assert!(transport.sent().is_empty());
    }
}
