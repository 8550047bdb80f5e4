//! Script compiler: Lua sources to a [`BytecodeMap`].
//!
//! Compilation is all-or-nothing. The first script that fails to parse
//! aborts the batch, so a bot never starts with a command set that is
//! silently missing entries. Two scripts with the same stem are rejected
//! rather than resolved by iteration order.

use std::collections::BTreeMap;
use std::path::Path;

use mlua::{ChunkMode, Lua};

use crate::bytecode::{BytecodeMap, PersistedBytecode};
use crate::cache::{BytecodeCache, CacheKey};
use crate::source::{DirectorySource, ScriptFile, ScriptSource, SourceError};

/// Error type for compilation.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The script source could not be read.
    #[error("unable to read scripts: {0}")]
    Source(#[from] SourceError),

    /// A script failed to parse.
    #[error("unable to load script `{origin}`: {message}")]
    Syntax {
        /// Command name of the script.
        command: String,
        /// File the script came from.
        origin: String,
        /// Parser message.
        message: String,
    },

    /// Two scripts map to the same command name.
    #[error("duplicate command `{command}` in `{first}` and `{second}`")]
    DuplicateCommand {
        /// Colliding command name.
        command: String,
        /// First file with the name.
        first: String,
        /// Second file with the name.
        second: String,
    },

    /// A file stem is not usable as a command name.
    #[error("`{origin}` does not have a valid command name: {reason}")]
    InvalidCommandName {
        /// File the script came from.
        origin: String,
        /// Why the name was refused.
        reason: &'static str,
    },
}

/// Compile every script of `source` with default settings.
///
/// # Errors
///
/// See [`Compiler::compile`].
pub fn compile(source: &dyn ScriptSource) -> Result<BytecodeMap, CompileError> {
    Compiler::new().compile(source)
}

/// Compile every script in a directory with default settings.
///
/// # Errors
///
/// See [`Compiler::compile`].
pub fn compile_dir(root: impl AsRef<Path>) -> Result<BytecodeMap, CompileError> {
    compile(&DirectorySource::new(root.as_ref()))
}

/// Turns script sources into bytecode maps.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    strip_debug_info: bool,
}

impl Compiler {
    /// Create a compiler that keeps debug information.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip debug information (line numbers, local names) from chunks.
    ///
    /// Stripped chunks are smaller but script errors lose their locations.
    #[must_use]
    pub const fn with_strip_debug_info(mut self, strip: bool) -> Self {
        self.strip_debug_info = strip;
        self
    }

    /// Compile every script of `source`.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered: unreadable source, invalid or
    /// duplicate command name, or a script that fails to parse. No partial
    /// map is returned.
    pub fn compile(&self, source: &dyn ScriptSource) -> Result<BytecodeMap, CompileError> {
        let scripts = source.list()?;
        let map = self.compile_scripts(&scripts)?;

        tracing::info!(
            source = %source.describe(),
            commands = map.len(),
            "Compiled bot scripts"
        );

        Ok(map)
    }

    /// Compile `source`, reusing a cached result when the scripts are unchanged.
    ///
    /// A cache entry that cannot be decoded is ignored and overwritten.
    /// Failure to store the fresh result is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// See [`Compiler::compile`].
    pub fn compile_cached(
        &self,
        source: &dyn ScriptSource,
        cache: &dyn BytecodeCache,
    ) -> Result<BytecodeMap, CompileError> {
        let scripts = source.list()?;
        let key = CacheKey::from_scripts(&scripts, self.strip_debug_info);

        if let Some(bytes) = cache.get(&key) {
            match PersistedBytecode::from_bytes(&bytes) {
                Ok(persisted) => {
                    tracing::debug!(key = %key.to_hex(), "Bytecode cache hit");
                    return Ok(persisted.into_map());
                }
                Err(e) => {
                    tracing::warn!(key = %key.to_hex(), error = %e, "Discarding unusable cache entry");
                }
            }
        }

        let map = self.compile_scripts(&scripts)?;

        match PersistedBytecode::new(&map).to_bytes() {
            Ok(bytes) => {
                if let Err(e) = cache.put(&key, bytes) {
                    tracing::warn!(key = %key.to_hex(), error = %e, "Failed to store compiled bytecode");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode compiled bytecode"),
        }

        tracing::info!(
            source = %source.describe(),
            commands = map.len(),
            "Compiled bot scripts"
        );

        Ok(map)
    }

    fn compile_scripts(&self, scripts: &[ScriptFile]) -> Result<BytecodeMap, CompileError> {
        let mut origins: BTreeMap<&str, &str> = BTreeMap::new();
        for script in scripts {
            validate_command_name(script)?;
            if let Some(first) = origins.insert(&script.name, &script.origin) {
                return Err(CompileError::DuplicateCommand {
                    command: script.name.clone(),
                    first: first.to_string(),
                    second: script.origin.clone(),
                });
            }
        }

        // Loading a text chunk only parses it, so one state serves the whole batch.
        let lua = Lua::new();
        let mut map = BytecodeMap::new();

        for script in scripts {
            let function = lua
                .load(script.contents.as_slice())
                .set_name(script.origin.as_str())
                .set_mode(ChunkMode::Text)
                .into_function()
                .map_err(|e| CompileError::Syntax {
                    command: script.name.clone(),
                    origin: script.origin.clone(),
                    message: e.to_string(),
                })?;

            let bytecode = function.dump(self.strip_debug_info);
            tracing::trace!(command = %script.name, size = bytecode.len(), "Compiled command");
            map.insert(script.name.clone(), bytecode);
        }

        Ok(map)
    }
}

/// Command names end up in callback payloads (`command;data`) and in
/// `/command` messages, so they must survive both.
fn validate_command_name(script: &ScriptFile) -> Result<(), CompileError> {
    let reason = if script.name.is_empty() {
        Some("empty name")
    } else if script.name.contains(char::REPLACEMENT_CHARACTER) {
        Some("name is not valid UTF-8")
    } else if script.name.contains(';') {
        Some("name contains `;`")
    } else if script.name.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        Some("name contains whitespace, `/` or `@`")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CompileError::InvalidCommandName {
            origin: script.origin.clone(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::source::MemorySource;

    #[test]
    fn compiles_each_script_under_its_stem() {
        let source = MemorySource::new("mem")
            .with_script("greet", "return { Message = function(m) end }")
            .with_script("help", "return {}");

        let map = compile(&source).expect("compile");
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["greet", "help"]);
        assert!(map.get("greet").is_some_and(|b| !b.is_empty()));
        assert!(map.is_compatible());
    }

    #[test]
    fn syntax_error_names_the_script() {
        let source = MemorySource::new("mem")
            .with_script("good", "return {}")
            .with_script("bad", "return {");

        let err = compile(&source).expect_err("syntax error");
        match err {
            CompileError::Syntax { command, .. } => assert_eq!(command, "bad"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_stems_are_rejected() {
        let mut source = MemorySource::new("mem");
        for origin in ["scripts/a/greet.lua", "scripts/b/greet.lua"] {
            source.push(ScriptFile {
                name: "greet".to_string(),
                origin: origin.to_string(),
                contents: b"return {}".to_vec(),
            });
        }

        let err = compile(&source).expect_err("duplicate");
        assert!(matches!(err, CompileError::DuplicateCommand { ref command, .. } if command == "greet"));
    }

    #[test]
    fn separator_in_name_is_rejected() {
        let source = MemorySource::new("mem").with_script("quiz;2", "return {}");
        let err = compile(&source).expect_err("invalid name");
        assert!(matches!(err, CompileError::InvalidCommandName { .. }));
    }

    #[test]
    fn binary_sources_are_refused() {
        let bytecode = compile(&MemorySource::new("mem").with_script("a", "return {}"))
            .expect("compile")
            .get("a")
            .expect("chunk")
            .to_vec();

        let source = MemorySource::new("mem").with_script("sneaky", bytecode);
        assert!(matches!(compile(&source), Err(CompileError::Syntax { .. })));
    }

    #[test]
    fn stripping_shrinks_chunks() {
        let script = "local function add(a, b)\n  return a + b\nend\nreturn { add = add }";
        let source = MemorySource::new("mem").with_script("math", script);

        let full = Compiler::new().compile(&source).expect("compile");
        let stripped = Compiler::new()
            .with_strip_debug_info(true)
            .compile(&source)
            .expect("compile");

        let full_len = full.get("math").map(<[u8]>::len).unwrap_or_default();
        let stripped_len = stripped.get("math").map(<[u8]>::len).unwrap_or_default();
        assert!(stripped_len < full_len);
    }

    #[test]
    fn cached_compile_reuses_previous_result() {
        let cache = InMemoryCache::new();
        let source = MemorySource::new("mem").with_script("greet", "return {}");
        let compiler = Compiler::new();

        let first = compiler.compile_cached(&source, &cache).expect("compile");
        let key = CacheKey::from_scripts(&source.list().expect("list"), false);
        assert!(cache.get(&key).is_some());

        let second = compiler.compile_cached(&source, &cache).expect("cache hit");
        assert_eq!(first, second);
    }

    #[test]
    fn cached_compile_still_fails_fast() {
        let cache = InMemoryCache::new();
        let source = MemorySource::new("mem").with_script("bad", "return {");

        assert!(Compiler::new().compile_cached(&source, &cache).is_err());
        let key = CacheKey::from_scripts(&source.list().expect("list"), false);
        assert!(cache.get(&key).is_none());
    }
}
