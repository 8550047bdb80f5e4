//! # luabot
//!
//! A runtime for Telegram bots whose behavior lives in Lua scripts.
//!
//! Each `.lua` file in a bot's script folder defines one command. The file
//! is a factory chunk returning a table of handlers:
//!
//! ```lua
//! local quiz = {}
//!
//! function quiz.Message(msg)
//!     SendMessage("2 + 2 = ?", { { { text = "4", data = "quiz;answer_4" } } })
//! end
//!
//! function quiz.CallbackQuery(data)
//!     SendMessage(data == "answer_4" and "Right!" or "Nope")
//! end
//!
//! return quiz
//! ```
//!
//! - Scripts are compiled once per bot into a [`BytecodeMap`].
//! - Every chat gets its own Lua state, built from that map, driven by a
//!   [`Session`] on its own thread ([`SessionThread`]).
//! - Handlers may return a coroutine (`MakeCoroutine`) that the session
//!   resumes on later ticks, which lets scripts run long workflows without
//!   blocking the chat.
//! - Sessions idle longer than the activity timeout are closed by the
//!   [`BotRuntime`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! use luabot::{BotRuntime, RuntimeConfig, TelegramTransport};
//!
//! fn main() -> Result<(), luabot::Error> {
//!     let config = RuntimeConfig::default();
//!     let transport = Arc::new(TelegramTransport::new("123:token", config.poll_timeout())?);
//!     let runtime = BotRuntime::create("scripts", transport, config);
//!
//!     runtime.run(&AtomicBool::new(false));
//!     Ok(())
//! }
//! ```

// Unsafe code is denied, and allowed only on the items that need it:
// loading binary chunks into a sandbox and the Windows DPAPI bindings.
#![deny(unsafe_code)]

pub mod bytecode;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod credentials;
mod error;
mod library;
pub mod project;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod source;
pub mod telegram;
pub mod transport;
pub mod workers;

pub use bytecode::{BytecodeMap, ENGINE_TAG, PersistedBytecode};
pub use cache::{BytecodeCache, CacheKey, FilesystemCache, InMemoryCache, NoCache};
pub use compiler::{CompileError, Compiler, compile, compile_dir};
pub use config::RuntimeConfig;
pub use credentials::{CredentialError, CredentialStore, platform_store};
pub use error::Error;
pub use library::RuntimeLibrary;
pub use project::{ProjectArchive, ProjectError};
pub use runtime::{BotRuntime, RuntimeStatus};
pub use sandbox::{
    CallOutcome, HandlerArg, LuaSandbox, SandboxContext, SandboxError, SandboxFactory,
    SandboxLimits, ScriptError, ScriptSandbox,
};
pub use session::{
    CoroutineHandle, CoroutinePolicy, CoroutineStatus, DispatchError, Session, SessionStats,
    SessionThread,
};
pub use source::{DirectorySource, MemorySource, ScriptFile, ScriptSource, SourceError};
pub use telegram::TelegramTransport;
pub use transport::{
    CallbackQuery, IncomingMessage, Keyboard, MemoryTransport, OutgoingMessage, Transport,
    TransportError, Update, User,
};
pub use workers::{TaskFailure, TaskOutcome, WorkerPool};
