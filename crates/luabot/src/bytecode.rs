//! Compiled command bytecode and its persisted form.
//!
//! A [`BytecodeMap`] maps each command name to the Lua bytecode of its
//! factory chunk. The map is produced once per bot configuration and shared
//! read-only by every session created from it.
//!
//! ## File Format
//!
//! Bytecode maps are stored as JSON with the `.bcmap` extension:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "engine": "Lua 5.4/luabot 0.3.0",
//!   "created_at": { "secs_since_epoch": 1234567890, "nanos_since_epoch": 0 },
//!   "commands": { "greet": "G0x1YVQA..." }
//! }
//! ```
//!
//! Chunks are base64 encoded. Loading refuses maps produced by a different
//! engine, since Lua does not validate the contents of binary chunks.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Interpreter dialect the bytecode targets.
pub const LUA_DIALECT: &str = "Lua 5.4";

/// Tag identifying the engine that produces and accepts bytecode.
pub const ENGINE_TAG: &str = concat!("Lua 5.4/luabot ", env!("CARGO_PKG_VERSION"));

/// Current on-disk format version for persisted bytecode maps.
pub const FORMAT_VERSION: u32 = 1;

/// Check whether bytecode produced under `tag` can be loaded by this build.
///
/// The dialect must match exactly and the luabot version must agree on
/// major.minor.
#[must_use]
pub fn is_compatible_engine(tag: &str) -> bool {
    let Some((dialect, version)) = tag.split_once("/luabot ") else {
        return false;
    };
    if dialect != LUA_DIALECT {
        return false;
    }

    let current: Vec<&str> = env!("CARGO_PKG_VERSION").split('.').collect();
    let stored: Vec<&str> = version.split('.').collect();

    current.len() >= 2 && stored.len() >= 2 && current[..2] == stored[..2]
}

/// Mapping from command name to compiled bytecode.
///
/// Iteration order is sorted by command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeMap {
    engine: String,
    chunks: BTreeMap<String, Vec<u8>>,
}

impl Default for BytecodeMap {
    fn default() -> Self {
        Self {
            engine: ENGINE_TAG.to_string(),
            chunks: BTreeMap::new(),
        }
    }
}

impl BytecodeMap {
    /// Create an empty map tagged with this build's engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a map from stored parts.
    ///
    /// The engine tag is kept as given; use [`BytecodeMap::is_compatible`]
    /// before handing the map to a sandbox.
    #[must_use]
    pub fn from_parts(engine: impl Into<String>, chunks: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            engine: engine.into(),
            chunks,
        }
    }

    pub(crate) fn insert(&mut self, name: String, bytecode: Vec<u8>) -> Option<Vec<u8>> {
        self.chunks.insert(name, bytecode)
    }

    /// Engine tag the bytecode was produced by.
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Whether this build can load the bytecode.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        is_compatible_engine(&self.engine)
    }

    /// Bytecode for a command.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.chunks.get(name).map(Vec::as_slice)
    }

    /// Whether a command is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.chunks.contains_key(name)
    }

    /// Command names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chunks.keys().map(String::as_str)
    }

    /// `(name, bytecode)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.chunks
            .iter()
            .map(|(name, bytecode)| (name.as_str(), bytecode.as_slice()))
    }

    /// Number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the map holds no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Persisted bytecode map for saving to disk or to a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBytecode {
    /// On-disk format version.
    pub format_version: u32,

    /// Engine tag of the producer.
    pub engine: String,

    /// When the map was compiled.
    pub created_at: SerializableSystemTime,

    /// Base64-encoded chunks keyed by command name.
    #[serde(with = "base64_chunks")]
    pub commands: BTreeMap<String, Vec<u8>>,
}

/// A wrapper around `SystemTime` that implements `Serialize` and `Deserialize`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SerializableSystemTime {
    /// Seconds since the Unix epoch.
    pub secs_since_epoch: u64,
    /// Nanoseconds within the second.
    pub nanos_since_epoch: u32,
}

impl From<SystemTime> for SerializableSystemTime {
    fn from(time: SystemTime) -> Self {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs_since_epoch: duration.as_secs(),
            nanos_since_epoch: duration.subsec_nanos(),
        }
    }
}

impl From<SerializableSystemTime> for SystemTime {
    fn from(time: SerializableSystemTime) -> Self {
        SystemTime::UNIX_EPOCH
            + std::time::Duration::new(time.secs_since_epoch, time.nanos_since_epoch)
    }
}

impl PersistedBytecode {
    /// Capture a bytecode map for persistence.
    #[must_use]
    pub fn new(map: &BytecodeMap) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            engine: map.engine.clone(),
            created_at: SystemTime::now().into(),
            commands: map.chunks.clone(),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse JSON bytes and check engine compatibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a persisted map, or if the map
    /// was produced by an incompatible engine.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let persisted: Self = serde_json::from_slice(bytes)?;
        persisted.check_compatible()?;
        Ok(persisted)
    }

    /// Save to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        tracing::debug!(
            path = %path.display(),
            commands = self.commands.len(),
            "Bytecode map saved to disk"
        );

        Ok(())
    }

    /// Load from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The file is not valid JSON
    /// - The bytecode was produced by an incompatible engine
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let persisted = Self::from_bytes(&bytes)?;

        tracing::debug!(
            path = %path.display(),
            commands = persisted.commands.len(),
            engine = %persisted.engine,
            "Bytecode map loaded from disk"
        );

        Ok(persisted)
    }

    fn check_compatible(&self) -> Result<(), Error> {
        if self.format_version != FORMAT_VERSION || !is_compatible_engine(&self.engine) {
            return Err(Error::IncompatibleBytecode {
                found: format!("{} (format {})", self.engine, self.format_version),
                expected: format!("{ENGINE_TAG} (format {FORMAT_VERSION})"),
            });
        }
        Ok(())
    }

    /// Convert into a bytecode map.
    #[must_use]
    pub fn into_map(self) -> BytecodeMap {
        BytecodeMap::from_parts(self.engine, self.commands)
    }
}

/// Serde module for base64 encoding/decoding of the chunk map.
mod base64_chunks {
    use std::collections::BTreeMap;

    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

    pub fn serialize<S>(chunks: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        chunks
            .iter()
            .map(|(name, bytes)| (name.as_str(), ENGINE.encode(bytes)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, chunk)| {
                ENGINE
                    .decode(&chunk)
                    .map(|bytes| (name, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
