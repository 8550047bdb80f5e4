//! Per-chat sessions.
//!
//! A [`Session`] couples one chat to one sandbox. It routes messages and
//! callback queries to command handlers and drives the coroutines those
//! handlers return. Script failures are logged and drop only the event that
//! caused them; the session keeps running.
//!
//! ## Routing
//!
//! - `/name rest` (or `/name@bot rest`) calls `name.Message` with
//!   `args = "rest"` and makes `name` the focused command.
//! - Any other text goes to the focused command's `Message` with the whole
//!   text as `args`. Without a focused command the message is dropped.
//! - A callback payload `name;data` calls `name.CallbackQuery(data)`.
//!
//! [`SessionThread`] runs a session on its own thread so that events for one
//! chat are strictly ordered while chats proceed independently.

pub mod coroutine;
pub mod thread;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::sandbox::{CallOutcome, HandlerArg, ScriptError, ScriptSandbox};
use crate::transport::{CallbackQuery, IncomingMessage};

pub use coroutine::{CoroutineHandle, CoroutinePolicy, CoroutineQueue, CoroutineStatus};
pub use thread::SessionThread;

/// Handler called for chat messages.
pub const MESSAGE_HANDLER: &str = "Message";

/// Handler called for inline button presses.
pub const CALLBACK_HANDLER: &str = "CallbackQuery";

/// Separator between command name and data in callback payloads.
pub const CALLBACK_SEPARATOR: char = ';';

/// Default resume bound for `SyncExecute` coroutines.
pub const DEFAULT_MAX_SYNC_STEPS: u32 = 10_000;

/// A recoverable failure while handling one event.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The session was force-closed.
    #[error("session is closed")]
    Closed,

    /// Plain text arrived while no command was focused.
    #[error("no command is focused")]
    NoFocusedCommand,

    /// The addressed command does not exist.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// A callback payload lacks the `command;data` shape.
    #[error("invalid callback data format, expected `command;data`, got `{0}`")]
    MalformedCallbackPayload(String),

    /// The command has no callable handler for the event.
    #[error("command `{command}` has no `{handler}` function")]
    HandlerMissing {
        /// Command name.
        command: String,
        /// Handler name.
        handler: String,
    },

    /// The handler raised an error.
    #[error("`{command}.{handler}` failed: {message}")]
    HandlerInvocationFailed {
        /// Command name.
        command: String,
        /// Handler name.
        handler: String,
        /// Interpreter message.
        message: String,
    },

    /// A coroutine yielded something other than a status code.
    #[error("coroutine {id} returned unsupported value ({found})")]
    UnsupportedCoroutineYield {
        /// Arena slot.
        id: u64,
        /// Description of the value.
        found: String,
    },

    /// A coroutine raised an error while resuming.
    #[error("coroutine {id} resume failed: {message}")]
    CoroutineFailed {
        /// Arena slot.
        id: u64,
        /// Interpreter message.
        message: String,
    },

    /// A `SyncExecute` coroutine did not finish within the step bound.
    #[error("coroutine {id} did not finish within {limit} synchronous steps")]
    SyncStepLimit {
        /// Arena slot.
        id: u64,
        /// Configured bound.
        limit: u32,
    },
}

impl From<ScriptError> for DispatchError {
    fn from(error: ScriptError) -> Self {
        match error {
            ScriptError::Closed => Self::Closed,
            ScriptError::UnknownCommand(command) => Self::UnknownCommand(command),
            ScriptError::HandlerMissing { command, handler } => {
                Self::HandlerMissing { command, handler }
            }
            ScriptError::Invocation {
                command,
                handler,
                message,
            } => Self::HandlerInvocationFailed {
                command,
                handler,
                message,
            },
            ScriptError::UnknownCoroutine(id) => Self::CoroutineFailed {
                id,
                message: "coroutine is not in the arena".to_string(),
            },
            ScriptError::Resume { id, message } => Self::CoroutineFailed { id, message },
        }
    }
}

/// Last-activity timestamp shared between a session and its supervisor.
#[derive(Debug, Clone)]
pub struct ActivityClock(Arc<Mutex<Instant>>);

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// Create a clock reading now.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time of the last recorded activity.
    #[must_use]
    pub fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time elapsed between the last activity and `now`.
    #[must_use]
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last())
    }
}

/// Statistics about a session's activity.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// When the session was created.
    pub created_at: Instant,

    /// When the last event was dispatched (None if never).
    pub last_activity: Option<Instant>,

    /// Messages dispatched to a handler.
    pub messages_dispatched: u64,

    /// Callback queries dispatched to a handler.
    pub callbacks_dispatched: u64,

    /// Events dropped because of a dispatch error.
    pub dispatch_failures: u64,

    /// Coroutine resumes performed.
    pub coroutine_resumes: u64,

    /// Total time spent inside handlers and coroutines.
    pub total_script_time: Duration,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            created_at: Instant::now(),
            last_activity: None,
            messages_dispatched: 0,
            callbacks_dispatched: 0,
            dispatch_failures: 0,
            coroutine_resumes: 0,
            total_script_time: Duration::ZERO,
        }
    }
}

impl SessionStats {
    /// Create stats with the current time as creation time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters, preserving the creation time.
    pub fn reset(&mut self) {
        let created_at = self.created_at;
        *self = Self::default();
        self.created_at = created_at;
    }
}

/// Outcome of one [`Session::update`] tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Coroutines resumed this tick.
    pub resumed: usize,
    /// Coroutines re-queued for the next tick.
    pub requeued: usize,
    /// Coroutines that finished.
    pub finished: usize,
    /// Coroutines dropped by policy, unsupported yield or failure.
    pub dropped: usize,
}

/// One chat's live state.
pub struct Session {
    chat_id: u64,
    sandbox: Box<dyn ScriptSandbox>,
    commands: BTreeSet<String>,
    coroutines: CoroutineQueue,
    focus: Option<String>,
    clock: ActivityClock,
    max_sync_steps: u32,
    closed: bool,
    stats: SessionStats,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chat_id", &self.chat_id)
            .field("commands", &self.commands)
            .field("pending_coroutines", &self.coroutines.len())
            .field("focus", &self.focus)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session around an instantiated sandbox.
    #[must_use]
    pub fn new(chat_id: u64, sandbox: Box<dyn ScriptSandbox>) -> Self {
        let commands = sandbox.commands().into_iter().collect();
        Self {
            chat_id,
            sandbox,
            commands,
            coroutines: CoroutineQueue::new(),
            focus: None,
            clock: ActivityClock::new(),
            max_sync_steps: DEFAULT_MAX_SYNC_STEPS,
            closed: false,
            stats: SessionStats::new(),
        }
    }

    /// Share an activity clock with the caller.
    #[must_use]
    pub fn with_clock(mut self, clock: ActivityClock) -> Self {
        self.clock = clock;
        self
    }

    /// Set the resume bound for `SyncExecute` coroutines.
    #[must_use]
    pub const fn with_max_sync_steps(mut self, steps: u32) -> Self {
        self.max_sync_steps = steps;
        self
    }

    /// Chat this session serves.
    #[must_use]
    pub const fn chat_id(&self) -> u64 {
        self.chat_id
    }

    /// Commands available in this session, sorted.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }

    /// Command that receives plain text, if any.
    #[must_use]
    pub fn focused_command(&self) -> Option<&str> {
        self.focus.as_deref()
    }

    /// Number of coroutines waiting for the next tick.
    #[must_use]
    pub fn pending_coroutines(&self) -> usize {
        self.coroutines.len()
    }

    /// Time of the last dispatched event.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.clock.last()
    }

    /// Activity statistics.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Whether [`Session::force_close`] has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Route a chat message to its command's `Message` handler.
    ///
    /// Failures are logged here; the returned error is informational.
    ///
    /// # Errors
    ///
    /// Returns the reason the message was dropped.
    pub fn dispatch_message(&mut self, message: IncomingMessage) -> Result<(), DispatchError> {
        let message_id = message.message_id;
        let result = self.try_dispatch_message(message);
        if let Err(e) = &result {
            self.stats.dispatch_failures += 1;
            log_dispatch_error(self.chat_id, e, "message", message_id.to_string());
        }
        result
    }

    /// Route a callback query to `command.CallbackQuery(data)`.
    ///
    /// Failures are logged here; the returned error is informational.
    ///
    /// # Errors
    ///
    /// Returns the reason the query was dropped.
    pub fn dispatch_callback(&mut self, query: CallbackQuery) -> Result<(), DispatchError> {
        let id = query.id.clone();
        let result = self.try_dispatch_callback(&query);
        if let Err(e) = &result {
            self.stats.dispatch_failures += 1;
            log_dispatch_error(self.chat_id, e, "callback", id);
        }
        result
    }

    fn try_dispatch_message(&mut self, message: IncomingMessage) -> Result<(), DispatchError> {
        if self.closed {
            return Err(DispatchError::Closed);
        }
        self.touch();

        let (command, args) = match parse_command(&message.text) {
            Some((command, args)) => {
                if !self.commands.contains(command) {
                    return Err(DispatchError::UnknownCommand(command.to_string()));
                }
                if self.focus.as_deref() != Some(command) {
                    tracing::debug!(chat_id = self.chat_id, command, "Focused command");
                    self.focus = Some(command.to_string());
                }
                (command.to_string(), args.to_string())
            }
            None => {
                let command = self.focus.clone().ok_or(DispatchError::NoFocusedCommand)?;
                (command, message.text.clone())
            }
        };

        self.invoke(
            &command,
            MESSAGE_HANDLER,
            HandlerArg::Message { message, args },
        )?;
        self.stats.messages_dispatched += 1;
        Ok(())
    }

    fn try_dispatch_callback(&mut self, query: &CallbackQuery) -> Result<(), DispatchError> {
        if self.closed {
            return Err(DispatchError::Closed);
        }
        self.touch();

        let (command, data) = split_callback_payload(&query.data)
            .ok_or_else(|| DispatchError::MalformedCallbackPayload(query.data.clone()))?;

        if !self.commands.contains(command) {
            return Err(DispatchError::UnknownCommand(command.to_string()));
        }

        self.invoke(command, CALLBACK_HANDLER, HandlerArg::Data(data.to_string()))?;
        self.stats.callbacks_dispatched += 1;
        Ok(())
    }

    fn invoke(&mut self, command: &str, handler: &str, arg: HandlerArg) -> Result<(), DispatchError> {
        if !self.sandbox.has_handler(command, handler) {
            return Err(DispatchError::HandlerMissing {
                command: command.to_string(),
                handler: handler.to_string(),
            });
        }

        let started = Instant::now();
        let outcome = self.sandbox.call(command, handler, arg);
        self.stats.total_script_time += started.elapsed();

        match outcome? {
            CallOutcome::Completed => Ok(()),
            CallOutcome::Coroutine(handle) => self.schedule(handle),
        }
    }

    fn schedule(&mut self, handle: CoroutineHandle) -> Result<(), DispatchError> {
        match handle.policy {
            CoroutinePolicy::EnqueueNext | CoroutinePolicy::RejectNext => {
                self.coroutines.push(handle);
                Ok(())
            }
            CoroutinePolicy::SyncExecute => self.run_to_completion(handle),
        }
    }

    fn run_to_completion(&mut self, handle: CoroutineHandle) -> Result<(), DispatchError> {
        for _ in 0..self.max_sync_steps {
            match self.resume(handle)? {
                CoroutineStatus::Step => continue,
                CoroutineStatus::Done => return Ok(()),
                CoroutineStatus::Unsupported(found) => {
                    return Err(DispatchError::UnsupportedCoroutineYield {
                        id: handle.id,
                        found,
                    });
                }
            }
        }

        self.sandbox.discard(handle);
        Err(DispatchError::SyncStepLimit {
            id: handle.id,
            limit: self.max_sync_steps,
        })
    }

    fn resume(&mut self, handle: CoroutineHandle) -> Result<CoroutineStatus, DispatchError> {
        let started = Instant::now();
        let status = self.sandbox.resume(handle);
        self.stats.total_script_time += started.elapsed();
        self.stats.coroutine_resumes += 1;
        Ok(status?)
    }

    /// Resume every coroutine queued at the start of the call, once each.
    ///
    /// A coroutine that reports `Step` goes to the back of the queue and
    /// waits for the next call, unless its policy is `RejectNext`.
    pub fn update(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.closed {
            return report;
        }

        for handle in self.coroutines.snapshot() {
            report.resumed += 1;
            match self.resume(handle) {
                Ok(CoroutineStatus::Step) if handle.policy == CoroutinePolicy::RejectNext => {
                    self.sandbox.discard(handle);
                    report.dropped += 1;
                }
                Ok(CoroutineStatus::Step) => {
                    self.coroutines.push(handle);
                    report.requeued += 1;
                }
                Ok(CoroutineStatus::Done) => report.finished += 1,
                Ok(CoroutineStatus::Unsupported(found)) => {
                    let e = DispatchError::UnsupportedCoroutineYield {
                        id: handle.id,
                        found,
                    };
                    tracing::error!(chat_id = self.chat_id, coroutine = handle.id, error = %e, "Coroutine dropped");
                    report.dropped += 1;
                }
                Err(e) => {
                    tracing::error!(chat_id = self.chat_id, coroutine = handle.id, error = %e, "Coroutine dropped");
                    report.dropped += 1;
                }
            }
        }

        if report.resumed > 0 {
            tracing::trace!(chat_id = self.chat_id, ?report, "Coroutine tick");
        }
        report
    }

    /// Release the sandbox and pending coroutines. Idempotent.
    ///
    /// Later dispatches and ticks do nothing.
    pub fn force_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let dropped = self.coroutines.clear().len();
        self.sandbox.release();
        self.focus = None;

        tracing::info!(
            chat_id = self.chat_id,
            dropped_coroutines = dropped,
            messages = self.stats.messages_dispatched,
            callbacks = self.stats.callbacks_dispatched,
            "Session closed"
        );
    }

    fn touch(&mut self) {
        self.clock.touch();
        self.stats.last_activity = Some(Instant::now());
    }
}

/// Split `/command@bot rest` into `("command", "rest")`.
fn parse_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('/')?;
    let (head, args) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(head, args)| (head, args.trim_start()));
    let command = head.split_once('@').map_or(head, |(command, _)| command);
    (!command.is_empty()).then_some((command, args))
}

/// Split a callback payload at its first separator.
///
/// Returns `None` unless both sides are present; the data side may itself
/// contain further separators.
#[must_use]
pub fn split_callback_payload(payload: &str) -> Option<(&str, &str)> {
    let (command, data) = payload.split_once(CALLBACK_SEPARATOR)?;
    (!command.is_empty()).then_some((command, data))
}

fn log_dispatch_error(chat_id: u64, error: &DispatchError, kind: &str, event: String) {
    match error {
        DispatchError::NoFocusedCommand | DispatchError::Closed => {
            tracing::debug!(chat_id, kind, event = %event, error = %error, "Event dropped");
        }
        DispatchError::UnknownCommand(_) => {
            tracing::warn!(chat_id, kind, event = %event, error = %error, "Event dropped");
        }
        _ => tracing::error!(chat_id, kind, event = %event, error = %error, "Event dropped"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    /// Scripted sandbox recording every call.
    #[derive(Default)]
    struct FakeSandbox {
        handlers: HashMap<(String, String), Option<CoroutinePolicy>>,
        calls: Arc<Mutex<Vec<String>>>,
        steps_left: HashMap<u64, u32>,
        next_id: u64,
        released: bool,
    }

    impl FakeSandbox {
        fn with_handler(mut self, command: &str, handler: &str, coroutine: Option<CoroutinePolicy>) -> Self {
            self.handlers
                .insert((command.to_string(), handler.to_string()), coroutine);
            self
        }
    }

    impl ScriptSandbox for FakeSandbox {
        fn commands(&self) -> Vec<String> {
            let names: BTreeSet<String> = self.handlers.keys().map(|(c, _)| c.clone()).collect();
            names.into_iter().collect()
        }

        fn has_handler(&self, command: &str, handler: &str) -> bool {
            self.handlers
                .contains_key(&(command.to_string(), handler.to_string()))
        }

        fn call(&mut self, command: &str, handler: &str, arg: HandlerArg) -> Result<CallOutcome, ScriptError> {
            let arg = match arg {
                HandlerArg::Data(data) => data,
                HandlerArg::Message { args, .. } => args,
            };
            self.calls
                .lock()
                .unwrap()
                .push(format!("{command}.{handler}({arg})"));

            match self.handlers.get(&(command.to_string(), handler.to_string())) {
                Some(Some(policy)) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.steps_left.insert(id, 2);
                    Ok(CallOutcome::Coroutine(CoroutineHandle { id, policy: *policy }))
                }
                _ => Ok(CallOutcome::Completed),
            }
        }

        fn resume(&mut self, handle: CoroutineHandle) -> Result<CoroutineStatus, ScriptError> {
            self.calls.lock().unwrap().push(format!("resume {}", handle.id));
            let left = self
                .steps_left
                .get_mut(&handle.id)
                .ok_or(ScriptError::UnknownCoroutine(handle.id))?;
            if *left == 0 {
                self.steps_left.remove(&handle.id);
                return Ok(CoroutineStatus::Done);
            }
            *left -= 1;
            Ok(CoroutineStatus::Step)
        }

        fn discard(&mut self, handle: CoroutineHandle) {
            self.steps_left.remove(&handle.id);
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    fn session(sandbox: FakeSandbox) -> (Session, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::clone(&sandbox.calls);
        (Session::new(7, Box::new(sandbox)), calls)
    }

    fn text(text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: 7,
            message_id: 1,
            text: text.to_string(),
            from: None,
        }
    }

    fn callback(data: &str) -> CallbackQuery {
        CallbackQuery {
            id: "q".to_string(),
            chat_id: 7,
            message_id: None,
            data: data.to_string(),
            from: None,
        }
    }

    #[test]
    fn parse_command_strips_bot_suffix() {
        assert_eq!(parse_command("/quiz@my_bot start now"), Some(("quiz", "start now")));
        assert_eq!(parse_command("/help"), Some(("help", "")));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/ oops"), None);
    }

    #[test]
    fn callback_payload_splits_at_first_separator() {
        assert_eq!(split_callback_payload("quiz;answer_2"), Some(("quiz", "answer_2")));
        assert_eq!(split_callback_payload("quiz;a;b"), Some(("quiz", "a;b")));
        assert_eq!(split_callback_payload("quiz;"), Some(("quiz", "")));
        assert_eq!(split_callback_payload("onlyonetoken"), None);
        assert_eq!(split_callback_payload(";data"), None);
    }

    #[test]
    fn slash_command_focuses_and_plain_text_follows() {
        let (mut session, calls) =
            session(FakeSandbox::default().with_handler("quiz", MESSAGE_HANDLER, None));

        assert!(matches!(
            session.dispatch_message(text("hello")),
            Err(DispatchError::NoFocusedCommand)
        ));
        session.dispatch_message(text("/quiz easy")).unwrap();
        session.dispatch_message(text("Paris")).unwrap();

        assert_eq!(session.focused_command(), Some("quiz"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["quiz.Message(easy)", "quiz.Message(Paris)"]
        );
        assert_eq!(session.stats().messages_dispatched, 2);
        assert_eq!(session.stats().dispatch_failures, 1);
    }

    #[test]
    fn unknown_command_keeps_previous_focus() {
        let (mut session, _) =
            session(FakeSandbox::default().with_handler("quiz", MESSAGE_HANDLER, None));

        session.dispatch_message(text("/quiz")).unwrap();
        assert!(matches!(
            session.dispatch_message(text("/nope")),
            Err(DispatchError::UnknownCommand(_))
        ));
        assert_eq!(session.focused_command(), Some("quiz"));
    }

    #[test]
    fn malformed_callback_invokes_nothing() {
        let (mut session, calls) =
            session(FakeSandbox::default().with_handler("quiz", CALLBACK_HANDLER, None));

        assert!(matches!(
            session.dispatch_callback(callback("onlyonetoken")),
            Err(DispatchError::MalformedCallbackPayload(_))
        ));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_callback_handler_is_reported() {
        let (mut session, calls) =
            session(FakeSandbox::default().with_handler("quiz", MESSAGE_HANDLER, None));

        assert!(matches!(
            session.dispatch_callback(callback("quiz;a")),
            Err(DispatchError::HandlerMissing { .. })
        ));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn reject_next_is_resumed_once() {
        let (mut session, calls) = session(FakeSandbox::default().with_handler(
            "quiz",
            CALLBACK_HANDLER,
            Some(CoroutinePolicy::RejectNext),
        ));

        session.dispatch_callback(callback("quiz;go")).unwrap();
        let report = session.update();
        assert_eq!(report.resumed, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(session.update(), TickReport::default());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn sync_execute_runs_inline() {
        let (mut session, calls) = session(FakeSandbox::default().with_handler(
            "quiz",
            CALLBACK_HANDLER,
            Some(CoroutinePolicy::SyncExecute),
        ));

        session.dispatch_callback(callback("quiz;go")).unwrap();
        assert_eq!(session.pending_coroutines(), 0);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["quiz.CallbackQuery(go)", "resume 0", "resume 0", "resume 0"]
        );
    }

    #[test]
    fn sync_execute_respects_step_bound() {
        let sandbox = FakeSandbox::default().with_handler(
            "quiz",
            CALLBACK_HANDLER,
            Some(CoroutinePolicy::SyncExecute),
        );
        let mut session = Session::new(7, Box::new(sandbox)).with_max_sync_steps(1);

        assert!(matches!(
            session.dispatch_callback(callback("quiz;go")),
            Err(DispatchError::SyncStepLimit { limit: 1, .. })
        ));
    }

    #[test]
    fn force_close_is_idempotent_and_final() {
        let (mut session, calls) = session(FakeSandbox::default().with_handler(
            "quiz",
            CALLBACK_HANDLER,
            Some(CoroutinePolicy::EnqueueNext),
        ));

        session.dispatch_callback(callback("quiz;go")).unwrap();
        session.force_close();
        session.force_close();

        assert!(session.is_closed());
        assert_eq!(session.pending_coroutines(), 0);
        assert!(matches!(
            session.dispatch_callback(callback("quiz;again")),
            Err(DispatchError::Closed)
        ));
        assert_eq!(session.update(), TickReport::default());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn dispatch_refreshes_shared_clock() {
        let clock = ActivityClock::new();
        let before = clock.last();
        let (session, _) =
            session(FakeSandbox::default().with_handler("quiz", CALLBACK_HANDLER, None));
        let mut session = session.with_clock(clock.clone());

        std::thread::sleep(Duration::from_millis(2));
        session.dispatch_callback(callback("quiz;x")).unwrap();
        assert!(clock.last() > before);
        assert_eq!(session.last_activity(), clock.last());
    }

    #[test]
    fn stats_reset_keeps_creation_time() {
        let mut stats = SessionStats::new();
        let created_at = stats.created_at;
        stats.messages_dispatched = 3;
        stats.reset();
        assert_eq!(stats.created_at, created_at);
        assert_eq!(stats.messages_dispatched, 0);
    }
}
