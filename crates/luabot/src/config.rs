//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration file:
//!
//! ```json
//! {
//!   "activity_timeout_secs": 60,
//!   "poll_interval_ms": 100,
//!   "poll_timeout_secs": 30,
//!   "max_sync_steps": 10000,
//!   "memory_limit_bytes": 67108864,
//!   "execution_timeout_ms": 10000,
//!   "strip_debug_info": false,
//!   "cache_dir": null
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{BytecodeCache, FilesystemCache, NoCache};
use crate::compiler::Compiler;
use crate::sandbox::SandboxLimits;

/// Error loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config `{path}`: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON.
    #[error("invalid config `{path}`: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Tunables of a bot runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Idle time after which a chat's session is closed.
    pub activity_timeout_secs: u64,
    /// Pause between two poll cycles.
    pub poll_interval_ms: u64,
    /// Long-poll timeout passed to the chat service.
    pub poll_timeout_secs: u64,
    /// Resume bound for `SyncExecute` coroutines.
    pub max_sync_steps: u32,
    /// Interpreter memory limit per chat.
    pub memory_limit_bytes: Option<usize>,
    /// Time limit for one handler call or coroutine resume.
    pub execution_timeout_ms: Option<u64>,
    /// Strip debug information from compiled scripts.
    pub strip_debug_info: bool,
    /// Directory for the bytecode cache; no caching when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: 60,
            poll_interval_ms: 100,
            poll_timeout_secs: 30,
            max_sync_steps: 10_000,
            memory_limit_bytes: Some(64 * 1024 * 1024),
            execution_timeout_ms: Some(10_000),
            strip_debug_info: false,
            cache_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Read a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!(path = %path.display(), ?config, "Loaded runtime config");
        Ok(config)
    }

    /// Idle timeout as a duration.
    #[must_use]
    pub const fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }

    /// Pause between poll cycles as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Long-poll timeout as a duration.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Sandbox limits derived from this configuration.
    #[must_use]
    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            execution_timeout: self.execution_timeout_ms.map(Duration::from_millis),
            max_memory_bytes: self.memory_limit_bytes,
        }
    }

    /// Compiler configured from this configuration.
    #[must_use]
    pub fn compiler(&self) -> Compiler {
        Compiler::new().with_strip_debug_info(self.strip_debug_info)
    }

    /// Bytecode cache selected by `cache_dir`.
    ///
    /// An unusable cache directory is logged and caching is disabled.
    #[must_use]
    pub fn cache(&self) -> Box<dyn BytecodeCache> {
        let Some(dir) = &self.cache_dir else {
            return Box::new(NoCache);
        };
        match FilesystemCache::new(dir) {
            Ok(cache) => Box::new(cache),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Bytecode cache disabled");
                Box::new(NoCache)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.activity_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn load_reads_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("luabot.json");
        std::fs::write(&path, r#"{ "activity_timeout_secs": 5, "strip_debug_info": true }"#)
            .expect("write");

        let config = RuntimeConfig::load(&path).expect("load");
        assert_eq!(config.activity_timeout_secs, 5);
        assert!(config.strip_debug_info);
        assert_eq!(config.max_sync_steps, RuntimeConfig::default().max_sync_steps);
    }

    #[test]
    fn unknown_file_and_bad_json_are_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            RuntimeConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ nope").expect("write");
        assert!(matches!(
            RuntimeConfig::load(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn limits_follow_config() {
        let config = RuntimeConfig {
            execution_timeout_ms: None,
            memory_limit_bytes: Some(1024),
            ..RuntimeConfig::default()
        };
        let limits = config.sandbox_limits();
        assert!(limits.execution_timeout.is_none());
        assert_eq!(limits.max_memory_bytes, Some(1024));
    }
}
