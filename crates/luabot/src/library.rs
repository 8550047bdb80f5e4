//! Host API exposed to bot scripts.
//!
//! Every sandbox gets the same set of globals before any command factory
//! runs:
//!
//! | Global | Purpose |
//! |--------|---------|
//! | `MakeCoroutine(fn [, policy])` | wrap `fn` as a resumable coroutine |
//! | `CoroutineStep.Step` / `.Done` | status codes a coroutine yields |
//! | `CoroutinePolicy.*` | `EnqueueNext`, `RejectNext`, `SyncExecute` |
//! | `SendMessage(text [, keyboard])` | reply in the session's chat |
//! | `ChatId()` | id of the session's chat |
//! | `Log(text)` | write to the host log |
//!
//! A keyboard is a list of rows, each a list of `{ text = ..., data = ... }`
//! buttons. Rows whose buttons carry `data` become an inline keyboard and
//! the data is delivered back as a callback query; without `data` the
//! buttons form a reply keyboard.

use std::fmt;

use mlua::{Lua, Table, Thread, UserData, Value};

use crate::sandbox::SandboxContext;
use crate::session::coroutine::{CoroutinePolicy, DONE, STEP};
use crate::transport::{InlineButton, Keyboard, OutgoingMessage, ReplyButton};

/// A coroutine created by a script, not yet handed to the session.
pub(crate) struct PendingCoroutine {
    pub(crate) thread: Thread,
    pub(crate) policy: CoroutinePolicy,
}

impl UserData for PendingCoroutine {}

/// Lua code and host functions installed into every sandbox.
///
/// The host functions are fixed. Extra Lua helpers can be layered on with
/// [`RuntimeLibrary::with_preamble`]; the preamble runs after the host
/// functions are registered and before the first command factory.
#[derive(Default, Clone)]
pub struct RuntimeLibrary {
    /// Lua code run once per sandbox before the command factories.
    pub lua_preamble: String,
}

impl RuntimeLibrary {
    /// Create a library with only the host functions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Lua preamble.
    #[must_use]
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.lua_preamble = preamble.into();
        self
    }

    /// Merge another library into this one.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.lua_preamble.is_empty() {
            if !self.lua_preamble.is_empty() {
                self.lua_preamble.push_str("\n\n");
            }
            self.lua_preamble.push_str(&other.lua_preamble);
        }
        self
    }

    /// Register the host API in `lua`.
    pub(crate) fn install(&self, lua: &Lua, context: &SandboxContext) -> mlua::Result<()> {
        let globals = lua.globals();

        let step = lua.create_table()?;
        step.set("Step", STEP)?;
        step.set("Done", DONE)?;
        globals.set("CoroutineStep", step)?;

        let policies = lua.create_table()?;
        for (name, value) in CoroutinePolicy::ALL {
            policies.set(name, value)?;
        }
        globals.set("CoroutinePolicy", policies)?;

        let make_coroutine =
            lua.create_function(|lua, (function, policy): (mlua::Function, Option<i64>)| {
                let policy = match policy {
                    None => CoroutinePolicy::default(),
                    Some(value) => CoroutinePolicy::try_from(value).map_err(|value| {
                        mlua::Error::RuntimeError(format!("unknown coroutine policy {value}"))
                    })?,
                };
                let thread = lua.create_thread(function)?;
                Ok(PendingCoroutine { thread, policy })
            })?;
        globals.set("MakeCoroutine", make_coroutine)?;

        let chat_id = context.chat_id;
        let transport = context.transport.clone();
        let send_message =
            lua.create_function(move |_, (text, keyboard): (String, Option<Table>)| {
                let keyboard = keyboard.map(keyboard_from_lua).transpose()?;
                let message = OutgoingMessage {
                    chat_id,
                    text,
                    keyboard,
                };
                match transport.send_message(message) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        tracing::warn!(chat_id, error = %e, "Failed to send script message");
                        Ok(false)
                    }
                }
            })?;
        globals.set("SendMessage", send_message)?;

        // Lua integers are signed; group chat ids keep their bit pattern.
        let chat_id_fn = lua.create_function(move |_, ()| Ok(chat_id as i64))?;
        globals.set("ChatId", chat_id_fn)?;

        let log = lua.create_function(move |_, text: String| {
            tracing::info!(target: "luabot::script", chat_id, "{text}");
            Ok(())
        })?;
        globals.set("Log", log)?;

        Ok(())
    }

    /// Run the Lua preamble, if any, after [`RuntimeLibrary::install`].
    pub(crate) fn run_preamble(&self, lua: &Lua) -> mlua::Result<()> {
        if self.lua_preamble.is_empty() {
            return Ok(());
        }
        lua.load(self.lua_preamble.as_str())
            .set_name("=preamble")
            .set_mode(mlua::ChunkMode::Text)
            .exec()
    }
}

impl fmt::Debug for RuntimeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLibrary")
            .field("lua_preamble_len", &self.lua_preamble.len())
            .finish()
    }
}

fn keyboard_from_lua(rows: Table) -> mlua::Result<Keyboard> {
    let mut inline = Vec::new();
    let mut reply = Vec::new();

    for row in rows.sequence_values::<Table>() {
        let mut inline_row = Vec::new();
        let mut reply_row = Vec::new();

        for button in row?.sequence_values::<Table>() {
            let button = button?;
            let text: String = button.get("text")?;
            match button.get::<Value>("data")? {
                Value::Nil => reply_row.push(ReplyButton { text }),
                Value::String(data) => inline_row.push(InlineButton {
                    text,
                    callback_data: data.to_str()?.to_string(),
                }),
                other => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "button data must be a string, got {}",
                        other.type_name()
                    )));
                }
            }
        }

        inline.push(inline_row);
        reply.push(reply_row);
    }

    let inline_count: usize = inline.iter().map(Vec::len).sum();
    let reply_count: usize = reply.iter().map(Vec::len).sum();

    match (inline_count, reply_count) {
        (_, 0) => Ok(Keyboard::Inline(inline)),
        (0, _) => Ok(Keyboard::Reply(reply)),
        _ => Err(mlua::Error::RuntimeError(
            "keyboard mixes inline buttons and reply buttons".to_string(),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn eval_keyboard(source: &str) -> mlua::Result<Keyboard> {
        let lua = Lua::new();
        let table: Table = lua.load(source).eval()?;
        keyboard_from_lua(table)
    }

    #[test]
    fn buttons_with_data_form_inline_keyboard() {
        let keyboard = eval_keyboard(
            r#"return { { { text = "A", data = "quiz;a" }, { text = "B", data = "quiz;b" } } }"#,
        )
        .expect("keyboard");

        assert_eq!(
            keyboard,
            Keyboard::Inline(vec![vec![
                InlineButton {
                    text: "A".to_string(),
                    callback_data: "quiz;a".to_string(),
                },
                InlineButton {
                    text: "B".to_string(),
                    callback_data: "quiz;b".to_string(),
                },
            ]])
        );
    }

    #[test]
    fn buttons_without_data_form_reply_keyboard() {
        let keyboard =
            eval_keyboard(r#"return { { { text = "yes" } }, { { text = "no" } } }"#).expect("keyboard");

        assert_eq!(
            keyboard,
            Keyboard::Reply(vec![
                vec![ReplyButton {
                    text: "yes".to_string()
                }],
                vec![ReplyButton {
                    text: "no".to_string()
                }],
            ])
        );
    }

    #[test]
    fn mixed_keyboard_is_rejected() {
        let result = eval_keyboard(r#"return { { { text = "A", data = "x;1" }, { text = "B" } } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn merged_preambles_keep_order() {
        let library = RuntimeLibrary::new()
            .with_preamble("A = 1")
            .merge(RuntimeLibrary::new().with_preamble("B = A + 1"));
        assert_eq!(library.lua_preamble, "A = 1\n\nB = A + 1");
    }
}
