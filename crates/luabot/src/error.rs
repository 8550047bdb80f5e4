//! Error types for luabot.

use crate::cache::CacheError;
use crate::compiler::CompileError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::project::ProjectError;
use crate::sandbox::SandboxError;
use crate::transport::TransportError;

/// Errors that can occur while building or running a bot.
///
/// Per-event script failures are not represented here: they are logged by the
/// session that observed them and never leave it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Script compilation failed.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The configuration file is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A per-chat sandbox could not be constructed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A project archive could not be turned into a runtime.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// The chat transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The credential store failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The bytecode cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The runtime has no usable bytecode and cannot open sessions.
    #[error("runtime is degraded and cannot accept sessions: {0}")]
    RuntimeDegraded(String),

    /// Bytecode was produced by a different engine.
    #[error("incompatible bytecode: produced by `{found}`, running `{expected}`")]
    IncompatibleBytecode {
        /// Engine tag stored with the bytecode.
        found: String,
        /// Engine tag of this build.
        expected: String,
    },

    /// A session worker thread could not be started.
    #[error("failed to start session thread for chat {chat_id}: {source}")]
    SessionThread {
        /// Chat the session belongs to.
        chat_id: u64,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
