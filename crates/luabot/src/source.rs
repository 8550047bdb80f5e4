//! Script sources feeding the compiler.
//!
//! A [`ScriptSource`] enumerates the `.lua` files of a bot, one command per
//! file. The command name is the file stem.

use std::path::{Path, PathBuf};

/// File extension of command scripts.
pub const SCRIPT_EXTENSION: &str = "lua";

/// Error type for script source operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The script folder does not exist.
    #[error("script folder `{0}` does not exist")]
    NotFound(PathBuf),

    /// The script root is not a directory.
    #[error("`{0}` is not a directory")]
    NotADirectory(PathBuf),

    /// A script could not be read.
    #[error("failed to read `{path}`: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// One script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    /// Command name derived from the file stem.
    pub name: String,
    /// Where the file came from, for diagnostics and chunk names.
    pub origin: String,
    /// Raw file contents.
    pub contents: Vec<u8>,
}

/// Something that can enumerate command scripts.
pub trait ScriptSource: Send + Sync {
    /// List every script file with its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn list(&self) -> Result<Vec<ScriptFile>, SourceError>;

    /// Human readable description of the source, for logs.
    fn describe(&self) -> String;
}

/// Scripts stored as regular files directly inside one directory.
///
/// Subdirectories are not descended into.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Create a source over `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory scanned by this source.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScriptSource for DirectorySource {
    fn list(&self) -> Result<Vec<ScriptFile>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::NotFound(self.root.clone()));
        }
        if !self.root.is_dir() {
            return Err(SourceError::NotADirectory(self.root.clone()));
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| self.root.clone(), Path::to_path_buf);
                SourceError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            let path = entry.path();

            if !entry.file_type().is_file() || !has_script_extension(path) {
                continue;
            }

            let contents = std::fs::read(path).map_err(|source| SourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;

            files.push(ScriptFile {
                name: stem_of(path),
                origin: path.display().to_string(),
                contents,
            });
        }

        Ok(files)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Scripts held in memory, e.g. read out of a project archive.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    label: String,
    files: Vec<ScriptFile>,
}

impl MemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            files: Vec::new(),
        }
    }

    /// Add a script by command name.
    #[must_use]
    pub fn with_script(mut self, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.push(ScriptFile {
            name: name.to_string(),
            origin: format!("{}/{name}.{SCRIPT_EXTENSION}", self.label),
            contents: contents.into(),
        });
        self
    }

    /// Add a script file.
    pub fn push(&mut self, file: ScriptFile) {
        self.files.push(file);
    }

    /// Number of scripts held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no scripts are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ScriptSource for MemorySource {
    fn list(&self) -> Result<Vec<ScriptFile>, SourceError> {
        Ok(self.files.clone())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Whether a path names a script file.
pub(crate) fn has_script_extension(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION)
}

/// File stem of a path; non UTF-8 stems are kept lossily and rejected by the compiler.
pub(crate) fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
