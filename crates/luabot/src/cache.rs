//! Bytecode caching for faster bot start-up.
//!
//! Compiling every script on each start is cheap for small bots but adds up
//! for projects with many commands. The cache stores persisted
//! [`BytecodeMap`](crate::BytecodeMap)s keyed by a hash of the script
//! sources, so an unchanged bot skips compilation entirely.
//!
//! # Example
//!
//! ```rust,ignore
//! use luabot::{Compiler, DirectorySource, cache::FilesystemCache};
//!
//! let cache = FilesystemCache::new("/tmp/luabot-cache")?;
//! let source = DirectorySource::new("scripts");
//!
//! // First call compiles and stores; later calls with the same sources hit.
//! let bytecode = Compiler::new().compile_cached(&source, &cache)?;
//! ```

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::bytecode::ENGINE_TAG;
use crate::source::ScriptFile;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O error when reading or writing cache files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Cache entry is corrupted or invalid.
    #[error("Cache entry corrupted: {0}")]
    Corrupted(String),
}

/// Trait for bytecode caching implementations.
pub trait BytecodeCache: Send + Sync {
    /// Get persisted bytecode for the given cache key.
    ///
    /// Returns `None` if the key is not in the cache.
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;

    /// Store persisted bytecode with the given cache key.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache operation fails.
    fn put(&self, key: &CacheKey, persisted: Vec<u8>) -> Result<(), CacheError>;
}

/// Cache key identifying one set of script sources.
///
/// The key includes:
/// - Hash of all script names and contents
/// - Engine tag (bytecode is only valid for the engine that produced it)
/// - Whether debug information was stripped
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Hash of the scripts (sorted by name for determinism).
    pub sources_hash: [u8; 32],
    /// Engine tag of the compiler.
    pub engine: &'static str,
    /// Whether debug information was stripped from the chunks.
    pub stripped: bool,
}

impl CacheKey {
    /// Compute a cache key from a list of scripts.
    ///
    /// The scripts are sorted by name before hashing so the key does not
    /// depend on directory iteration order.
    #[must_use]
    pub fn from_scripts(scripts: &[ScriptFile], stripped: bool) -> Self {
        let mut hasher = Sha256::new();

        let mut sorted: Vec<_> = scripts.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.origin.cmp(&b.origin)));

        for script in sorted {
            hasher.update((script.name.len() as u64).to_le_bytes());
            hasher.update(script.name.as_bytes());
            hasher.update((script.contents.len() as u64).to_le_bytes());
            hasher.update(&script.contents);
        }

        Self {
            sources_hash: hasher.finalize().into(),
            engine: ENGINE_TAG,
            stripped,
        }
    }

    /// Full hash of the key, including the engine tag.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.sources_hash);
        hasher.update(self.engine.as_bytes());
        hasher.update([u8::from(self.stripped)]);
        hasher.finalize().into()
    }

    /// Get a hex string representation of the full cache key.
    ///
    /// This is used as a filename in filesystem caches.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest())
    }
}

/// Filesystem-based bytecode cache.
///
/// Caches persisted bytecode maps as `.bcmap` files in a directory.
/// Files are named by the hex-encoded cache key hash.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    cache_dir: PathBuf,
}

impl FilesystemCache {
    /// Create a new filesystem cache at the given directory.
    ///
    /// Creates the directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(cache_dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    /// Get the path for a cache entry.
    fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.bcmap", key.to_hex()))
    }
}

impl BytecodeCache for FilesystemCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        fs::read(self.cache_path(key)).ok()
    }

    fn put(&self, key: &CacheKey, persisted: Vec<u8>) -> Result<(), CacheError> {
        let path = self.cache_path(key);

        // Write to a temp file first, then rename for atomicity
        let temp_path = path.with_extension("bcmap.tmp");
        fs::write(&temp_path, &persisted)?;
        fs::rename(&temp_path, &path)?;

        Ok(())
    }
}

/// In-memory bytecode cache.
///
/// Useful for tests, or for hosts that rebuild the same bot repeatedly
/// within a single process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    cache: Arc<Mutex<HashMap<[u8; 32], Vec<u8>>>>,
}

impl InMemoryCache {
    /// Create a new in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BytecodeCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let cache = self.cache.lock().ok()?;
        cache.get(&key.digest()).cloned()
    }

    fn put(&self, key: &CacheKey, persisted: Vec<u8>) -> Result<(), CacheError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|e| CacheError::Corrupted(format!("Cache lock poisoned: {e}")))?;

        cache.insert(key.digest(), persisted);
        Ok(())
    }
}

/// A cache implementation that never caches anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl BytecodeCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Option<Vec<u8>> {
        None
    }

    fn put(&self, _key: &CacheKey, _persisted: Vec<u8>) -> Result<(), CacheError> {
        Ok(())
    }
}
