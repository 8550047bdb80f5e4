//! Telegram Bot API transport (HTTP long polling).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::transport::{
    CallbackQuery, IncomingMessage, Keyboard, OutgoingMessage, Transport, TransportError, Update,
    User,
};

/// Default Bot API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Extra time the HTTP client waits beyond the long-poll timeout.
const HTTP_GRACE: Duration = Duration::from_secs(10);

/// Transport speaking the Telegram Bot API.
pub struct TelegramTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    poll_timeout: Duration,
    offset: AtomicI64,
}

impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("token", &"<redacted>")
            .field("poll_timeout", &self.poll_timeout)
            .field("offset", &self.offset.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TelegramTransport {
    /// Create a transport for `token` against the public API.
    ///
    /// No request is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty or the HTTP client cannot be
    /// built.
    pub fn new(token: &str, poll_timeout: Duration) -> Result<Self, TransportError> {
        Self::with_api_url(DEFAULT_API_URL, token, poll_timeout)
    }

    /// Create a transport against a custom Bot API server.
    ///
    /// # Errors
    ///
    /// See [`TelegramTransport::new`].
    pub fn with_api_url(
        api_url: &str,
        token: &str,
        poll_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TransportError::Api {
                code: 401,
                description: "empty bot token".to_string(),
            });
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(poll_timeout + HTTP_GRACE)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{token}", api_url.trim_end_matches('/')),
            poll_timeout,
            offset: AtomicI64::new(0),
        })
    }

    /// Ask the API who the bot is. Useful to validate the token.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the token is rejected.
    pub fn get_me(&self) -> Result<User, TransportError> {
        let user: ApiUser = self.call("getMe", &json!({}))?;
        Ok(user.into())
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &impl Serialize,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .map_err(|e| TransportError::Http(e.without_url().to_string()))?;

        let envelope: ApiResponse<T> = response
            .json()
            .map_err(|e| TransportError::Decode(e.without_url().to_string()))?;

        match envelope {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse {
                error_code,
                description,
                ..
            } => Err(TransportError::Api {
                code: error_code.unwrap_or_default(),
                description: description.unwrap_or_else(|| format!("`{method}` failed")),
            }),
        }
    }
}

impl Transport for TelegramTransport {
    fn poll(&self) -> Result<Vec<Update>, TransportError> {
        let body = json!({
            "offset": self.offset.load(Ordering::Acquire),
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        let raw: Vec<ApiUpdate> = self.call("getUpdates", &body)?;

        if let Some(last) = raw.iter().map(|u| u.update_id).max() {
            self.offset.fetch_max(last + 1, Ordering::AcqRel);
        }

        let updates: Vec<Update> = raw.into_iter().filter_map(convert_update).collect();
        if !updates.is_empty() {
            tracing::debug!(count = updates.len(), "Received updates");
        }
        Ok(updates)
    }

    fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": message.chat_id as i64,
            "text": message.text,
        });
        if let Some(keyboard) = &message.keyboard {
            body["reply_markup"] = reply_markup(keyboard);
        }

        let _: serde_json::Value = self.call("sendMessage", &body)?;
        tracing::trace!(chat_id = message.chat_id, "Sent message");
        Ok(())
    }

    fn answer_callback(&self, query_id: &str) -> Result<(), TransportError> {
        let _: bool = self.call(
            "answerCallbackQuery",
            &json!({ "callback_query_id": query_id }),
        )?;
        Ok(())
    }
}

fn reply_markup(keyboard: &Keyboard) -> serde_json::Value {
    match keyboard {
        Keyboard::Inline(rows) => json!({
            "inline_keyboard": rows.iter().map(|row| {
                row.iter()
                    .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
                    .collect::<Vec<_>>()
            }).collect::<Vec<_>>(),
        }),
        Keyboard::Reply(rows) => json!({
            "keyboard": rows.iter().map(|row| {
                row.iter().map(|b| json!({ "text": b.text })).collect::<Vec<_>>()
            }).collect::<Vec<_>>(),
            "resize_keyboard": true,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiUpdate {
    update_id: i64,
    message: Option<ApiMessage>,
    callback_query: Option<ApiCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    chat: ApiChat,
    from: Option<ApiUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

impl From<ApiUser> for User {
    fn from(user: ApiUser) -> Self {
        Self {
            id: user.id as u64,
            username: user.username,
            first_name: user.first_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiCallbackQuery {
    id: String,
    from: ApiUser,
    message: Option<ApiMessage>,
    data: Option<String>,
}

/// Chat ids are signed on the wire (groups are negative). They are carried
/// as `u64` with the same bit pattern.
fn convert_update(update: ApiUpdate) -> Option<Update> {
    if let Some(message) = update.message {
        return Some(Update::Message(IncomingMessage {
            chat_id: message.chat.id as u64,
            message_id: message.message_id,
            text: message.text.unwrap_or_default(),
            from: message.from.map(User::from),
        }));
    }

    let query = update.callback_query?;
    let Some(message) = query.message else {
        tracing::debug!(update_id = update.update_id, "Ignoring callback query without a message");
        return None;
    };
    Some(Update::CallbackQuery(CallbackQuery {
        id: query.id,
        chat_id: message.chat.id as u64,
        message_id: Some(message.message_id),
        data: query.data.unwrap_or_default(),
        from: Some(query.from.into()),
    }))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::{InlineButton, ReplyButton};

    fn parse(json: &str) -> Option<Update> {
        convert_update(serde_json::from_str(json).expect("update json"))
    }

    #[test]
    fn message_update_converts() {
        let update = parse(
            r#"{ "update_id": 10, "message": { "message_id": 5, "chat": { "id": 99 },
                 "from": { "id": 1, "first_name": "Ann", "username": "ann" }, "text": "/quiz" } }"#,
        );

        assert_eq!(
            update,
            Some(Update::Message(IncomingMessage {
                chat_id: 99,
                message_id: 5,
                text: "/quiz".to_string(),
                from: Some(User {
                    id: 1,
                    username: Some("ann".to_string()),
                    first_name: "Ann".to_string(),
                }),
            }))
        );
    }

    #[test]
    fn group_chat_id_keeps_bit_pattern() {
        let update = parse(
            r#"{ "update_id": 1, "message": { "message_id": 1, "chat": { "id": -1001 } } }"#,
        )
        .expect("update");

        assert_eq!(update.chat_id() as i64, -1001);
    }

    #[test]
    fn callback_update_converts() {
        let update = parse(
            r#"{ "update_id": 11, "callback_query": { "id": "abc",
                 "from": { "id": 1, "first_name": "Ann" },
                 "message": { "message_id": 6, "chat": { "id": 99 } }, "data": "quiz;answer_2" } }"#,
        );

        let Some(Update::CallbackQuery(query)) = update else {
            panic!("expected callback query");
        };
        assert_eq!(query.id, "abc");
        assert_eq!(query.chat_id, 99);
        assert_eq!(query.data, "quiz;answer_2");
    }

    #[test]
    fn inline_mode_callback_is_ignored() {
        let update = parse(
            r#"{ "update_id": 12, "callback_query": { "id": "abc",
                 "from": { "id": 1, "first_name": "Ann" }, "data": "x;y" } }"#,
        );
        assert!(update.is_none());
    }

    #[test]
    fn keyboards_render_as_reply_markup() {
        let inline = reply_markup(&Keyboard::Inline(vec![vec![InlineButton {
            text: "A".to_string(),
            callback_data: "quiz;a".to_string(),
        }]]));
        assert_eq!(inline["inline_keyboard"][0][0]["callback_data"], "quiz;a");

        let reply = reply_markup(&Keyboard::Reply(vec![vec![ReplyButton {
            text: "yes".to_string(),
        }]]));
        assert_eq!(reply["keyboard"][0][0]["text"], "yes");
        assert_eq!(reply["resize_keyboard"], true);
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(TelegramTransport::new("  ", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn debug_output_hides_token() {
        let transport = TelegramTransport::new("123:secret", Duration::from_secs(1)).expect("transport");
        assert!(!format!("{transport:?}").contains("secret"));
    }
}
