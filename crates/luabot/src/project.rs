//! Project archives.
//!
//! A project is a zip file bundling a bot:
//!
//! ```text
//! manifest.json        { "format": "LUABOT_PROJECT_v1", "name": ..., "created_at": ... }
//! scripts/**.lua       command scripts, one command per file stem
//! bot.key              bot token sealed by the credential store (optional)
//! ```
//!
//! The archive is read fully into memory when opened.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::bytecode::SerializableSystemTime;
use crate::compiler::CompileError;
use crate::credentials::CredentialError;
use crate::source::{ScriptFile, ScriptSource, SourceError, has_script_extension, stem_of};
use crate::transport::TransportError;

/// Format header of project manifests.
pub const PROJECT_FORMAT: &str = "LUABOT_PROJECT_v1";

/// Manifest entry name.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Sealed token entry name.
pub const KEY_FILE: &str = "bot.key";

/// Folder holding the scripts.
pub const SCRIPTS_DIR: &str = "scripts/";

/// Error type for project operations.
///
/// Each way a project can fail to become a running bot has its own variant.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    /// The archive could not be opened or is not a zip file.
    #[error("failed to open project `{path}`: {message}")]
    ArchiveOpen {
        /// Archive path.
        path: PathBuf,
        /// Underlying error.
        message: String,
    },

    /// The manifest is missing or names another format.
    #[error("unsupported project format: {0}")]
    UnsupportedFormat(String),

    /// The project's scripts did not compile.
    #[error("failed to compile project scripts: {0}")]
    Compile(#[from] CompileError),

    /// No token was given and the archive holds none.
    #[error("no bot token supplied and the project has no `{KEY_FILE}`")]
    CredentialMissing,

    /// The sealed token decrypted to something that is not a token.
    #[error("bot token in project is corrupt: {0}")]
    CredentialCorrupt(String),

    /// The sealed token could not be decrypted on this machine.
    #[error("failed to decrypt bot token: {0}")]
    Decryption(#[source] CredentialError),

    /// The token could not be sealed while packing.
    #[error("failed to encrypt bot token: {0}")]
    Encryption(#[source] CredentialError),

    /// The transport could not be created from the token.
    #[error("failed to connect transport: {0}")]
    Transport(#[from] TransportError),

    /// Reading the script folder failed while packing.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Writing the archive failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manifest stored at the root of an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Must equal [`PROJECT_FORMAT`].
    pub format: String,
    /// Project name.
    pub name: String,
    /// When the archive was packed.
    pub created_at: SerializableSystemTime,
}

/// A project archive loaded into memory.
#[derive(Debug, Clone)]
pub struct ProjectArchive {
    path: PathBuf,
    manifest: Manifest,
    scripts: Vec<ScriptFile>,
    encrypted_key: Option<Vec<u8>>,
}

impl ProjectArchive {
    /// Read an archive.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError::ArchiveOpen`] if the file is unreadable or not
    /// a zip, and [`ProjectError::UnsupportedFormat`] if the manifest is
    /// missing or names another format.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let path = path.as_ref();
        let open_error = |message: String| ProjectError::ArchiveOpen {
            path: path.to_path_buf(),
            message,
        };

        let file = std::fs::File::open(path).map_err(|e| open_error(e.to_string()))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| open_error(e.to_string()))?;

        let mut manifest = None;
        let mut scripts = Vec::new();
        let mut encrypted_key = None;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| open_error(e.to_string()))?;
            if !entry.is_file() {
                continue;
            }

            let name = entry.name().to_string();
            let wanted = name == MANIFEST_FILE
                || name == KEY_FILE
                || (name.starts_with(SCRIPTS_DIR) && has_script_extension(Path::new(&name)));
            if !wanted {
                continue;
            }

            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| open_error(format!("{name}: {e}")))?;

            match name.as_str() {
                MANIFEST_FILE => manifest = Some(contents),
                KEY_FILE => encrypted_key = Some(contents),
                _ => scripts.push(ScriptFile {
                    name: stem_of(Path::new(&name)),
                    origin: format!("{}:{name}", path.display()),
                    contents,
                }),
            }
        }

        let manifest = manifest
            .ok_or_else(|| ProjectError::UnsupportedFormat(format!("missing `{MANIFEST_FILE}`")))?;
        let manifest: Manifest = serde_json::from_slice(&manifest)
            .map_err(|e| ProjectError::UnsupportedFormat(format!("invalid manifest: {e}")))?;
        if manifest.format != PROJECT_FORMAT {
            return Err(ProjectError::UnsupportedFormat(manifest.format));
        }

        scripts.sort_by(|a, b| a.origin.cmp(&b.origin));

        tracing::debug!(
            path = %path.display(),
            name = %manifest.name,
            scripts = scripts.len(),
            has_key = encrypted_key.is_some(),
            "Opened project archive"
        );

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            scripts,
            encrypted_key,
        })
    }

    /// Archive path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Scripts found under `scripts/`, at any depth.
    #[must_use]
    pub fn scripts(&self) -> &[ScriptFile] {
        &self.scripts
    }

    /// Sealed bot token, if the project carries one.
    #[must_use]
    pub fn encrypted_key(&self) -> Option<&[u8]> {
        self.encrypted_key.as_deref()
    }

    /// Pack a script folder into an archive.
    ///
    /// Every `.lua` file under `scripts_dir` is stored below `scripts/`,
    /// keeping its relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be read or the archive cannot be
    /// written.
    pub fn write(
        path: impl AsRef<Path>,
        name: &str,
        scripts_dir: impl AsRef<Path>,
        encrypted_key: Option<&[u8]>,
    ) -> Result<(), ProjectError> {
        let path = path.as_ref();
        let scripts_dir = scripts_dir.as_ref();
        if !scripts_dir.is_dir() {
            return Err(SourceError::NotFound(scripts_dir.to_path_buf()).into());
        }

        let mut writer = zip::ZipWriter::new(std::fs::File::create(path)?);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let manifest = Manifest {
            format: PROJECT_FORMAT.to_string(),
            name: name.to_string(),
            created_at: SystemTime::now().into(),
        };
        writer
            .start_file(MANIFEST_FILE, options)
            .map_err(zip_io)?;
        writer.write_all(&serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?)?;

        let mut count = 0usize;
        for entry in walkdir::WalkDir::new(scripts_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| SourceError::Io {
                path: e.path().map_or_else(|| scripts_dir.to_path_buf(), Path::to_path_buf),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() || !has_script_extension(entry.path()) {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(scripts_dir)
                .unwrap_or(entry.path());
            let entry_name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let contents = std::fs::read(entry.path()).map_err(|source| SourceError::Io {
                path: entry.path().to_path_buf(),
                source,
            })?;

            writer
                .start_file(format!("{SCRIPTS_DIR}{entry_name}"), options)
                .map_err(zip_io)?;
            writer.write_all(&contents)?;
            count += 1;
        }

        if let Some(key) = encrypted_key {
            writer.start_file(KEY_FILE, options).map_err(zip_io)?;
            writer.write_all(key)?;
        }

        writer.finish().map_err(zip_io)?;

        tracing::info!(
            path = %path.display(),
            name,
            scripts = count,
            has_key = encrypted_key.is_some(),
            "Packed project archive"
        );
        Ok(())
    }
}

impl ScriptSource for ProjectArchive {
    fn list(&self) -> Result<Vec<ScriptFile>, SourceError> {
        Ok(self.scripts.clone())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn zip_io(error: zip::result::ZipError) -> std::io::Error {
    match error {
        zip::result::ZipError::Io(e) => e,
        other => std::io::Error::other(other),
    }
}
