//! Runtime supervisor.
//!
//! A [`BotRuntime`] owns the compiled scripts of one bot and the table of
//! live sessions, one per chat. It routes updates from the transport to the
//! right session, ticks coroutines and closes sessions that went idle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! use luabot::{BotRuntime, MemoryTransport, RuntimeConfig};
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let runtime = BotRuntime::create("scripts", transport, RuntimeConfig::default());
//!
//! let stop = AtomicBool::new(false);
//! runtime.run(&stop);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::bytecode::BytecodeMap;
use crate::config::RuntimeConfig;
use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::library::RuntimeLibrary;
use crate::project::{ProjectArchive, ProjectError};
use crate::sandbox::{SandboxContext, SandboxFactory};
use crate::session::{Session, SessionStats, SessionThread};
use crate::source::DirectorySource;
use crate::transport::{Transport, TransportError, Update};

/// Whether a runtime can serve chats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Scripts compiled; sessions can be opened.
    Ready,
    /// Scripts failed to compile. The runtime stays up but opens no session.
    Degraded {
        /// Why the runtime is degraded.
        reason: String,
    },
}

/// Supervisor of every session of one bot.
pub struct BotRuntime {
    bytecode: Option<Arc<BytecodeMap>>,
    status: RuntimeStatus,
    factory: SandboxFactory,
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<u64, Arc<SessionThread>>>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for BotRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRuntime")
            .field("status", &self.status)
            .field(
                "commands",
                &self.bytecode.as_ref().map(|b| b.names().collect::<Vec<_>>()),
            )
            .field("sessions", &self.lock_sessions().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BotRuntime {
    /// Compile the scripts in `scripts_root` and build a runtime.
    ///
    /// A compile failure is logged and yields a [`RuntimeStatus::Degraded`]
    /// runtime rather than an error, so the host keeps running and can
    /// report the problem.
    pub fn create(
        scripts_root: impl AsRef<Path>,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
    ) -> Self {
        let source = DirectorySource::new(scripts_root.as_ref());
        let cache = config.cache();

        match config.compiler().compile_cached(&source, cache.as_ref()) {
            Ok(bytecode) => Self::with_bytecode(Arc::new(bytecode), transport, config),
            Err(e) => {
                tracing::error!(
                    scripts = %source.root().display(),
                    error = %e,
                    "Failed to compile bot scripts; runtime is degraded"
                );
                Self::degraded(e.to_string(), transport, config)
            }
        }
    }

    /// Build a runtime from already compiled scripts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleBytecode`] if the bytecode was produced by
    /// another engine.
    pub fn from_bytecode(
        bytecode: BytecodeMap,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
    ) -> Result<Self, Error> {
        if !bytecode.is_compatible() {
            return Err(Error::IncompatibleBytecode {
                found: bytecode.engine().to_string(),
                expected: crate::bytecode::ENGINE_TAG.to_string(),
            });
        }
        Ok(Self::with_bytecode(Arc::new(bytecode), transport, config))
    }

    /// Build a runtime from a project archive.
    ///
    /// The bot token is `external_api_key` when it is not blank, otherwise
    /// the archive's sealed token opened with `credentials`. `connect` turns
    /// the token into a transport.
    ///
    /// # Errors
    ///
    /// Every failure is fatal and reported through its own
    /// [`ProjectError`] variant.
    pub fn create_from_project<C>(
        archive_path: impl AsRef<Path>,
        external_api_key: &str,
        credentials: &dyn CredentialStore,
        connect: C,
        config: RuntimeConfig,
    ) -> Result<Self, ProjectError>
    where
        C: FnOnce(&str) -> Result<Arc<dyn Transport>, TransportError>,
    {
        let archive = ProjectArchive::open(archive_path)?;
        let token = resolve_token(external_api_key, archive.encrypted_key(), credentials)?;

        let cache = config.cache();
        let bytecode = config.compiler().compile_cached(&archive, cache.as_ref())?;
        let transport = connect(&token)?;

        tracing::info!(
            project = %archive.manifest().name,
            path = %archive.path().display(),
            commands = bytecode.len(),
            "Loaded project"
        );

        Ok(Self::with_bytecode(Arc::new(bytecode), transport, config))
    }

    fn with_bytecode(
        bytecode: Arc<BytecodeMap>,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            factory: SandboxFactory::new().with_limits(config.sandbox_limits()),
            bytecode: Some(bytecode),
            status: RuntimeStatus::Ready,
            transport,
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn degraded(reason: String, transport: Arc<dyn Transport>, config: RuntimeConfig) -> Self {
        Self {
            factory: SandboxFactory::new().with_limits(config.sandbox_limits()),
            bytecode: None,
            status: RuntimeStatus::Degraded { reason },
            transport,
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Install an extra runtime library into every future sandbox.
    #[must_use]
    pub fn with_library(mut self, library: RuntimeLibrary) -> Self {
        self.factory = std::mem::take(&mut self.factory).with_library(library);
        self
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> &RuntimeStatus {
        &self.status
    }

    /// Whether sessions can be opened.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.status, RuntimeStatus::Ready)
    }

    /// Compiled scripts, unless degraded.
    #[must_use]
    pub fn bytecode(&self) -> Option<&Arc<BytecodeMap>> {
        self.bytecode.as_ref()
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Transport used for polling and by every script.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<SessionThread>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, chat_id: u64) -> Option<Arc<SessionThread>> {
        self.lock_sessions().get(&chat_id).cloned()
    }

    fn live_sessions(&self) -> Vec<Arc<SessionThread>> {
        self.lock_sessions().values().cloned().collect()
    }

    /// Open a session for `chat_id` unless one exists.
    ///
    /// Returns `true` if a session was created. The sandbox is built
    /// without holding the session table lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeDegraded`] on a degraded runtime, and an
    /// error if the sandbox or its thread cannot be created.
    pub fn init_new_session(&self, chat_id: u64) -> Result<bool, Error> {
        let bytecode = match (&self.status, &self.bytecode) {
            (RuntimeStatus::Ready, Some(bytecode)) => Arc::clone(bytecode),
            (RuntimeStatus::Degraded { reason }, _) => {
                return Err(Error::RuntimeDegraded(reason.clone()));
            }
            (RuntimeStatus::Ready, None) => {
                return Err(Error::RuntimeDegraded("no bytecode loaded".to_string()));
            }
        };

        if self.lock_sessions().contains_key(&chat_id) {
            return Ok(false);
        }

        let context = SandboxContext {
            chat_id,
            transport: Arc::clone(&self.transport),
        };
        let sandbox = self.factory.instantiate(&bytecode, context)?;
        let session =
            Session::new(chat_id, Box::new(sandbox)).with_max_sync_steps(self.config.max_sync_steps);
        let thread = SessionThread::spawn(session)
            .map_err(|source| Error::SessionThread { chat_id, source })?;

        let mut sessions = self.lock_sessions();
        if sessions.contains_key(&chat_id) {
            // Lost a race with another dispatcher; ours is joined on drop.
            drop(sessions);
            thread.force_close();
            return Ok(false);
        }
        sessions.insert(chat_id, Arc::new(thread));
        drop(sessions);

        tracing::info!(chat_id, "Opened session");
        Ok(true)
    }

    /// Route one update to its chat's session, opening the session if needed.
    ///
    /// Callback queries are acknowledged to the transport even when no
    /// session could handle them.
    pub fn dispatch(&self, update: Update) {
        let chat_id = update.chat_id();

        if let Err(e) = self.init_new_session(chat_id) {
            tracing::warn!(chat_id, error = %e, "Dropping update: no session");
            if let Update::CallbackQuery(query) = &update {
                self.answer_callback(chat_id, &query.id);
            }
            return;
        }

        let Some(session) = self.session(chat_id) else {
            tracing::warn!(chat_id, "Dropping update: session closed while routing");
            return;
        };

        match update {
            Update::Message(message) => session.manage_message(message),
            Update::CallbackQuery(query) => {
                let id = query.id.clone();
                session.manage_callback(query);
                self.answer_callback(chat_id, &id);
            }
        }
    }

    fn answer_callback(&self, chat_id: u64, query_id: &str) {
        if let Err(e) = self.transport.answer_callback(query_id) {
            tracing::debug!(chat_id, query_id, error = %e, "Failed to answer callback query");
        }
    }

    /// Pull pending updates from the transport and dispatch them.
    ///
    /// Returns the number of updates received.
    ///
    /// # Errors
    ///
    /// Returns an error if polling the transport fails.
    pub fn poll_and_dispatch(&self) -> Result<usize, Error> {
        let updates = self.transport.poll()?;
        let count = updates.len();
        for update in updates {
            self.dispatch(update);
        }
        Ok(count)
    }

    /// Queue a coroutine tick on every live session.
    pub fn tick(&self) {
        for session in self.live_sessions() {
            session.update();
        }
    }

    /// Close sessions idle longer than the activity timeout.
    ///
    /// Returns the chat ids of the closed sessions.
    pub fn verify_sessions(&self) -> Vec<u64> {
        self.verify_sessions_at(Instant::now())
    }

    /// [`BotRuntime::verify_sessions`] against an explicit clock reading.
    pub fn verify_sessions_at(&self, now: Instant) -> Vec<u64> {
        let timeout = self.config.activity_timeout();

        let expired: Vec<(u64, Arc<SessionThread>)> = {
            let mut sessions = self.lock_sessions();
            let ids: Vec<u64> = sessions
                .iter()
                .filter(|(_, session)| session.clock().idle_at(now) > timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
                .collect()
        };

        let mut closed = Vec::with_capacity(expired.len());
        for (chat_id, session) in expired {
            tracing::info!(chat_id, ?timeout, "Closing idle session");
            session.force_close();
            drop(session);
            closed.push(chat_id);
        }
        closed.sort_unstable();
        closed
    }

    /// One poll cycle: poll and dispatch, tick, then close idle sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails. Ticking and the idle sweep still run.
    pub fn run_cycle(&self) -> Result<(), Error> {
        let polled = self.poll_and_dispatch();
        self.tick();
        self.verify_sessions();
        polled.map(|_| ())
    }

    /// Run poll cycles until `stop` is set, then close every session.
    pub fn run(&self, stop: &AtomicBool) {
        tracing::info!(status = ?self.status, "Bot runtime started");

        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.run_cycle() {
                tracing::warn!(error = %e, "Poll cycle failed");
            }
            std::thread::sleep(self.config.poll_interval());
        }

        self.shutdown();
        tracing::info!("Bot runtime stopped");
    }

    /// Close the session of `chat_id`. Returns `false` if there was none.
    pub fn force_close(&self, chat_id: u64) -> bool {
        let Some(session) = self.lock_sessions().remove(&chat_id) else {
            return false;
        };
        session.force_close();
        drop(session);
        tracing::info!(chat_id, "Closed session");
        true
    }

    /// Close every session. Tasks already queued finish first.
    pub fn shutdown(&self) {
        let sessions: Vec<(u64, Arc<SessionThread>)> = self.lock_sessions().drain().collect();
        if sessions.is_empty() {
            return;
        }

        let count = sessions.len();
        for (_, session) in &sessions {
            session.force_close();
        }
        drop(sessions);
        tracing::info!(count, "Closed all sessions");
    }

    /// Chat ids with a live session, sorted.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock_sessions().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Statistics of one session, read on its thread.
    #[must_use]
    pub fn session_stats(&self, chat_id: u64) -> Option<SessionStats> {
        self.session(chat_id)?.stats()
    }

    /// Wait until every live session has run the tasks queued so far.
    pub fn flush_sessions(&self) {
        for session in self.live_sessions() {
            session.flush();
        }
    }
}

impl Drop for BotRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_token(
    external_api_key: &str,
    sealed: Option<&[u8]>,
    credentials: &dyn CredentialStore,
) -> Result<String, ProjectError> {
    let external = external_api_key.trim();
    if !external.is_empty() {
        return Ok(external.to_string());
    }

    let sealed = sealed.ok_or(ProjectError::CredentialMissing)?;
    let plain = credentials
        .decrypt(sealed)
        .map_err(ProjectError::Decryption)?;
    let token = String::from_utf8(plain)
        .map_err(|e| ProjectError::CredentialCorrupt(format!("not UTF-8: {e}")))?;

    let token = token.trim();
    if token.is_empty() {
        return Err(ProjectError::CredentialCorrupt("empty token".to_string()));
    }
    Ok(token.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credentials::CredentialError;

    struct Reversing;

    impl CredentialStore for Reversing {
        fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CredentialError> {
            Ok(plain.iter().rev().copied().collect())
        }

        fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CredentialError> {
            self.encrypt(sealed)
        }
    }

    #[test]
    fn external_key_wins_over_sealed_key() {
        let token = resolve_token(" 42:abc ", Some(b"garbage"), &Reversing).unwrap();
        assert_eq!(token, "42:abc");
    }

    #[test]
    fn sealed_key_is_decrypted() {
        let sealed = Reversing.encrypt(b"42:abc").unwrap();
        assert_eq!(resolve_token("", Some(&sealed), &Reversing).unwrap(), "42:abc");
    }

    #[test]
    fn missing_key_is_reported() {
        assert!(matches!(
            resolve_token("  ", None, &Reversing),
            Err(ProjectError::CredentialMissing)
        ));
    }

    #[test]
    fn corrupt_key_is_reported() {
        assert!(matches!(
            resolve_token("", Some(&[0xff, 0xfe]), &Reversing),
            Err(ProjectError::CredentialCorrupt(_))
        ));
        assert!(matches!(
            resolve_token("", Some(b"   "), &Reversing),
            Err(ProjectError::CredentialCorrupt(_))
        ));
    }

    #[test]
    fn unavailable_store_fails_decryption() {
        assert!(matches!(
            resolve_token("", Some(b"sealed"), &crate::credentials::UnavailableStore),
            Err(ProjectError::Decryption(_))
        ));
    }
}
