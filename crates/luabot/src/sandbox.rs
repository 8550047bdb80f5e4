//! Per-chat script sandboxes.
//!
//! A [`SandboxFactory`] turns a shared [`BytecodeMap`] into a fresh
//! [`LuaSandbox`]: one interpreter state with every command factory executed
//! inside it. Sessions only talk to the sandbox through the
//! [`ScriptSandbox`] trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use mlua::{
    ChunkMode, Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Thread,
    ThreadStatus, Value, VmState,
};

use crate::bytecode::{BytecodeMap, ENGINE_TAG};
use crate::library::{PendingCoroutine, RuntimeLibrary};
use crate::session::coroutine::{CoroutineHandle, CoroutineStatus, DONE, STEP};
use crate::transport::{IncomingMessage, Transport};

/// Instructions between two execution deadline checks.
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

/// Error building a sandbox. Always names the command at fault when there is one.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The bytecode was produced by another engine.
    #[error("bytecode produced by `{found}` cannot run on `{expected}`")]
    IncompatibleEngine {
        /// Engine tag stored with the bytecode.
        found: String,
        /// Engine tag of this build.
        expected: String,
    },

    /// The interpreter state could not be prepared.
    #[error("failed to prepare interpreter: {0}")]
    Interpreter(String),

    /// A command's bytecode could not be loaded.
    #[error("failed to load command `{command}`: {message}")]
    Load {
        /// Command name.
        command: String,
        /// Interpreter message.
        message: String,
    },

    /// A command's factory raised an error.
    #[error("factory of command `{command}` failed: {message}")]
    Factory {
        /// Command name.
        command: String,
        /// Interpreter message.
        message: String,
    },

    /// A command's factory returned something other than a table.
    #[error("factory of command `{command}` returned {found}, expected a table")]
    NotATable {
        /// Command name.
        command: String,
        /// Lua type of the returned value.
        found: &'static str,
    },
}

/// Error raised while running script code for one event.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The sandbox has been released.
    #[error("sandbox is released")]
    Closed,

    /// No command with this name exists.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// The command has no callable handler with this name.
    #[error("command `{command}` has no `{handler}` function")]
    HandlerMissing {
        /// Command name.
        command: String,
        /// Handler name.
        handler: String,
    },

    /// The handler raised an error.
    #[error("`{command}.{handler}` failed: {message}")]
    Invocation {
        /// Command name.
        command: String,
        /// Handler name.
        handler: String,
        /// Interpreter message.
        message: String,
    },

    /// The coroutine handle is not in the arena.
    #[error("unknown coroutine {0}")]
    UnknownCoroutine(u64),

    /// Resuming the coroutine raised an error.
    #[error("coroutine {id} failed: {message}")]
    Resume {
        /// Arena slot.
        id: u64,
        /// Interpreter message.
        message: String,
    },
}

/// Argument passed to a script handler.
#[derive(Debug, Clone)]
pub enum HandlerArg {
    /// A chat message, plus the text after the `/command` prefix.
    Message {
        /// The message.
        message: IncomingMessage,
        /// Arguments after the command, or the whole text for plain replies.
        args: String,
    },
    /// Callback data, everything after the first `;` of the payload.
    Data(String),
}

/// Result of a successful handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The handler ran to completion.
    Completed,
    /// The handler returned a coroutine to schedule.
    Coroutine(CoroutineHandle),
}

/// Capability interface sessions use to drive scripts.
pub trait ScriptSandbox: Send {
    /// Command names, sorted.
    fn commands(&self) -> Vec<String>;

    /// Whether `command` has a callable `handler`.
    fn has_handler(&self, command: &str, handler: &str) -> bool;

    /// Call `command.handler(arg)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command or handler does not exist, or if the
    /// handler raises.
    fn call(
        &mut self,
        command: &str,
        handler: &str,
        arg: HandlerArg,
    ) -> Result<CallOutcome, ScriptError>;

    /// Resume a coroutine once.
    ///
    /// Any status other than [`CoroutineStatus::Step`] frees the arena slot,
    /// as does an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is unknown or the coroutine raises.
    fn resume(&mut self, handle: CoroutineHandle) -> Result<CoroutineStatus, ScriptError>;

    /// Drop a coroutine without resuming it.
    fn discard(&mut self, handle: CoroutineHandle);

    /// Free the interpreter. Later calls fail with [`ScriptError::Closed`].
    fn release(&mut self);
}

/// Resource limits applied to every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Maximum time for one handler call or one coroutine resume.
    pub execution_timeout: Option<Duration>,
    /// Maximum memory the interpreter may allocate.
    pub max_memory_bytes: Option<usize>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Some(Duration::from_secs(10)),
            max_memory_bytes: Some(64 * 1024 * 1024), // 64 MB
        }
    }
}

/// Everything a sandbox needs to know about the chat it serves.
#[derive(Clone)]
pub struct SandboxContext {
    /// The chat.
    pub chat_id: u64,
    /// Transport scripts send their messages through.
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

/// Builds sandboxes from a bytecode map.
#[derive(Debug, Clone, Default)]
pub struct SandboxFactory {
    library: RuntimeLibrary,
    limits: SandboxLimits,
}

impl SandboxFactory {
    /// Create a factory with the default library and limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runtime library on top of the host API.
    #[must_use]
    pub fn with_library(mut self, library: RuntimeLibrary) -> Self {
        self.library = self.library.merge(library);
        self
    }

    /// Set resource limits.
    #[must_use]
    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Limits applied to new sandboxes.
    #[must_use]
    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Build a sandbox for one chat.
    ///
    /// Every command factory is executed in the new state. The first failure
    /// aborts construction and the partial state is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytecode comes from another engine, a chunk
    /// cannot be loaded, or a factory raises or returns a non-table.
    pub fn instantiate(
        &self,
        bytecode: &BytecodeMap,
        context: SandboxContext,
    ) -> Result<LuaSandbox, SandboxError> {
        if !bytecode.is_compatible() {
            return Err(SandboxError::IncompatibleEngine {
                found: bytecode.engine().to_string(),
                expected: ENGINE_TAG.to_string(),
            });
        }

        let chat_id = context.chat_id;
        let lua = new_state().map_err(|e| SandboxError::Interpreter(e.to_string()))?;

        if let Some(limit) = self.limits.max_memory_bytes {
            lua.set_memory_limit(limit)
                .map_err(|e| SandboxError::Interpreter(e.to_string()))?;
        }

        let deadline = Arc::new(Mutex::new(None));
        if self.limits.execution_timeout.is_some() {
            install_deadline_hook(&lua, Arc::clone(&deadline));
        }

        self.library
            .install(&lua, &context)
            .map_err(|e| SandboxError::Interpreter(e.to_string()))?;
        with_deadline(&deadline, self.limits.execution_timeout, || {
            self.library.run_preamble(&lua)
        })
        .map_err(|e| SandboxError::Interpreter(e.to_string()))?;

        let mut commands = HashMap::with_capacity(bytecode.len());
        for (name, chunk) in bytecode.iter() {
            let factory = lua
                .load(chunk)
                .set_name(format!("={name}"))
                .set_mode(ChunkMode::Binary)
                .into_function()
                .map_err(|e| SandboxError::Load {
                    command: name.to_string(),
                    message: e.to_string(),
                })?;

            let value = with_deadline(&deadline, self.limits.execution_timeout, || {
                factory.call::<Value>(())
            })
            .map_err(|e| SandboxError::Factory {
                command: name.to_string(),
                message: e.to_string(),
            })?;

            match value {
                Value::Table(table) => {
                    commands.insert(name.to_string(), table);
                }
                other => {
                    return Err(SandboxError::NotATable {
                        command: name.to_string(),
                        found: other.type_name(),
                    });
                }
            }
        }

        tracing::debug!(chat_id, commands = commands.len(), "Sandbox instantiated");

        Ok(LuaSandbox {
            chat_id,
            state: Some(SandboxState {
                commands,
                coroutines: HashMap::new(),
                lua,
            }),
            next_coroutine: 0,
            deadline,
            execution_timeout: self.limits.execution_timeout,
        })
    }
}

/// Fresh interpreter with the libraries scripts may use.
///
/// Binary chunk loading is only available on states created through the
/// unchecked constructor, so the escape hatches in the base library
/// (`load`, `loadfile`, `dofile`) are removed before any script runs.
#[allow(unsafe_code)]
fn new_state() -> mlua::Result<Lua> {
    let libs = StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH;
    // SAFETY: none of the selected libraries expose raw memory or the C API.
    // Binary chunks come from the compiler, the bytecode cache directory or a
    // `luabot compile` file. The engine tag only guards against version skew,
    // not tampering, so those files are trusted like the host binary itself.
    let lua = unsafe { Lua::unsafe_new_with(libs, LuaOptions::default()) };

    let globals = lua.globals();
    for name in ["load", "loadfile", "dofile"] {
        globals.set(name, Value::Nil)?;
    }

    Ok(lua)
}

fn deadline_triggers() -> HookTriggers {
    HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL)
}

fn install_deadline_hook(lua: &Lua, deadline: Arc<Mutex<Option<Instant>>>) {
    lua.set_hook(deadline_triggers(), move |_, _| check_deadline(&deadline));
}

/// Only one thread per state carries the hook at a time, so it is moved onto
/// each coroutine right before that coroutine is resumed.
fn install_thread_deadline_hook(thread: &Thread, deadline: Arc<Mutex<Option<Instant>>>) {
    thread.set_hook(deadline_triggers(), move |_, _| check_deadline(&deadline));
}

fn check_deadline(deadline: &Mutex<Option<Instant>>) -> mlua::Result<VmState> {
    let expired = deadline
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some_and(|at| Instant::now() >= at);
    if expired {
        return Err(mlua::Error::RuntimeError(
            "execution timeout exceeded".to_string(),
        ));
    }
    Ok(VmState::Continue)
}

fn with_deadline<R>(
    deadline: &Mutex<Option<Instant>>,
    timeout: Option<Duration>,
    run: impl FnOnce() -> mlua::Result<R>,
) -> mlua::Result<R> {
    *deadline.lock().unwrap_or_else(PoisonError::into_inner) =
        timeout.map(|timeout| Instant::now() + timeout);
    let result = run();
    *deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
    result
}

struct SandboxState {
    // Lua values are declared before the state that owns them.
    commands: HashMap<String, Table>,
    coroutines: HashMap<u64, Thread>,
    lua: Lua,
}

/// A sandbox backed by one Lua 5.4 state.
pub struct LuaSandbox {
    chat_id: u64,
    state: Option<SandboxState>,
    next_coroutine: u64,
    deadline: Arc<Mutex<Option<Instant>>>,
    execution_timeout: Option<Duration>,
}

impl std::fmt::Debug for LuaSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("LuaSandbox");
        debug.field("chat_id", &self.chat_id);
        match &self.state {
            Some(state) => debug
                .field("commands", &format!("[{} commands]", state.commands.len()))
                .field("coroutines", &state.coroutines.len())
                .field("used_memory", &state.lua.used_memory()),
            None => debug.field("released", &true),
        };
        debug.finish()
    }
}

impl LuaSandbox {
    /// Bytes currently allocated by the interpreter, zero once released.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.lua.used_memory())
    }

    /// Number of coroutines alive in the arena.
    #[must_use]
    pub fn live_coroutines(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.coroutines.len())
    }

    fn handler(&self, command: &str, handler: &str) -> Result<Function, ScriptError> {
        let state = self.state.as_ref().ok_or(ScriptError::Closed)?;
        let table = state
            .commands
            .get(command)
            .ok_or_else(|| ScriptError::UnknownCommand(command.to_string()))?;

        match table.get::<Value>(handler) {
            Ok(Value::Function(function)) => Ok(function),
            _ => Err(ScriptError::HandlerMissing {
                command: command.to_string(),
                handler: handler.to_string(),
            }),
        }
    }

    fn argument(lua: &Lua, arg: HandlerArg) -> mlua::Result<Value> {
        match arg {
            HandlerArg::Data(data) => Ok(Value::String(lua.create_string(&data)?)),
            HandlerArg::Message { message, args } => {
                let table = lua.create_table()?;
                table.set("chat_id", message.chat_id as i64)?;
                table.set("message_id", message.message_id)?;
                table.set("text", message.text)?;
                table.set("args", args)?;
                if let Some(user) = message.from {
                    let from = lua.create_table()?;
                    from.set("id", user.id as i64)?;
                    from.set("username", user.username)?;
                    from.set("first_name", user.first_name)?;
                    table.set("from", from)?;
                }
                Ok(Value::Table(table))
            }
        }
    }
}

impl ScriptSandbox for LuaSandbox {
    fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .as_ref()
            .map(|state| state.commands.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn has_handler(&self, command: &str, handler: &str) -> bool {
        self.handler(command, handler).is_ok()
    }

    fn call(
        &mut self,
        command: &str,
        handler: &str,
        arg: HandlerArg,
    ) -> Result<CallOutcome, ScriptError> {
        let function = self.handler(command, handler)?;
        let invocation = |e: mlua::Error| ScriptError::Invocation {
            command: command.to_string(),
            handler: handler.to_string(),
            message: e.to_string(),
        };

        let state = self.state.as_mut().ok_or(ScriptError::Closed)?;
        let arg = Self::argument(&state.lua, arg).map_err(invocation)?;
        if self.execution_timeout.is_some() {
            install_deadline_hook(&state.lua, Arc::clone(&self.deadline));
        }
        let value = with_deadline(&self.deadline, self.execution_timeout, || {
            function.call::<Value>(arg)
        })
        .map_err(invocation)?;

        let Value::UserData(userdata) = value else {
            return Ok(CallOutcome::Completed);
        };
        if !userdata.is::<PendingCoroutine>() {
            return Ok(CallOutcome::Completed);
        }

        let pending = userdata.take::<PendingCoroutine>().map_err(invocation)?;
        let handle = CoroutineHandle {
            id: self.next_coroutine,
            policy: pending.policy,
        };
        self.next_coroutine += 1;
        state.coroutines.insert(handle.id, pending.thread);

        tracing::trace!(
            chat_id = self.chat_id,
            command,
            coroutine = handle.id,
            policy = %handle.policy,
            "Handler returned a coroutine"
        );

        Ok(CallOutcome::Coroutine(handle))
    }

    fn resume(&mut self, handle: CoroutineHandle) -> Result<CoroutineStatus, ScriptError> {
        let state = self.state.as_mut().ok_or(ScriptError::Closed)?;
        let thread = state
            .coroutines
            .get(&handle.id)
            .cloned()
            .ok_or(ScriptError::UnknownCoroutine(handle.id))?;

        if thread.status() != ThreadStatus::Resumable {
            state.coroutines.remove(&handle.id);
            return Ok(CoroutineStatus::Done);
        }

        if self.execution_timeout.is_some() {
            install_thread_deadline_hook(&thread, Arc::clone(&self.deadline));
        }
        let result = with_deadline(&self.deadline, self.execution_timeout, || {
            thread.resume::<MultiValue>(())
        });

        let values = match result {
            Ok(values) => values,
            Err(e) => {
                state.coroutines.remove(&handle.id);
                return Err(ScriptError::Resume {
                    id: handle.id,
                    message: e.to_string(),
                });
            }
        };

        let finished = thread.status() != ThreadStatus::Resumable;
        let status = classify(values.into_iter().next().unwrap_or(Value::Nil), finished);

        if status == CoroutineStatus::Step && finished {
            tracing::warn!(
                chat_id = self.chat_id,
                coroutine = handle.id,
                "Coroutine returned Step from its body; treating it as Done"
            );
            state.coroutines.remove(&handle.id);
            return Ok(CoroutineStatus::Done);
        }
        if status != CoroutineStatus::Step {
            state.coroutines.remove(&handle.id);
        }

        Ok(status)
    }

    fn discard(&mut self, handle: CoroutineHandle) {
        if let Some(state) = self.state.as_mut() {
            state.coroutines.remove(&handle.id);
        }
    }

    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::debug!(
                chat_id = self.chat_id,
                coroutines = state.coroutines.len(),
                used_memory = state.lua.used_memory(),
                "Releasing sandbox"
            );
        }
    }
}

/// Map the first value a coroutine produced to a status.
///
/// A body that simply returns nothing has finished; a `nil` yield has not
/// and is reported as unsupported.
fn classify(value: Value, finished: bool) -> CoroutineStatus {
    let code = match &value {
        Value::Integer(code) => Some(*code),
        Value::Number(number) if number.fract() == 0.0 => Some(*number as i64),
        _ => None,
    };

    match (code, &value) {
        (Some(STEP), _) => CoroutineStatus::Step,
        (Some(DONE), _) => CoroutineStatus::Done,
        (None, Value::Nil) if finished => CoroutineStatus::Done,
        (Some(code), _) => CoroutineStatus::Unsupported(format!("integer {code}")),
        (None, other) => CoroutineStatus::Unsupported(other.type_name().to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::session::coroutine::CoroutinePolicy;
    use crate::source::MemorySource;
    use crate::transport::MemoryTransport;

    fn sandbox_for(scripts: &[(&str, &str)]) -> (LuaSandbox, Arc<MemoryTransport>) {
        let mut source = MemorySource::new("test");
        for (name, contents) in scripts {
            source = source.with_script(name, *contents);
        }
        let bytecode = compile(&source).expect("compile");
        let transport = Arc::new(MemoryTransport::new());
        let sandbox = SandboxFactory::new()
            .instantiate(
                &bytecode,
                SandboxContext {
                    chat_id: 42,
                    transport: transport.clone(),
                },
            )
            .expect("instantiate");
        (sandbox, transport)
    }

    fn data(value: &str) -> HandlerArg {
        HandlerArg::Data(value.to_string())
    }

    #[test]
    fn factory_tables_become_commands() {
        let (sandbox, _) = sandbox_for(&[
            ("greet", "return { Message = function(m) end }"),
            ("help", "return {}"),
        ]);

        assert_eq!(sandbox.commands(), vec!["greet", "help"]);
        assert!(sandbox.has_handler("greet", "Message"));
        assert!(!sandbox.has_handler("help", "Message"));
        assert!(!sandbox.has_handler("missing", "Message"));
    }

    #[test]
    fn factory_returning_non_table_names_the_command() {
        let bytecode = compile(&MemorySource::new("t").with_script("broken", "return 5")).unwrap();
        let err = SandboxFactory::new()
            .instantiate(
                &bytecode,
                SandboxContext {
                    chat_id: 1,
                    transport: Arc::new(MemoryTransport::new()),
                },
            )
            .expect_err("not a table");

        assert!(
            matches!(err, SandboxError::NotATable { ref command, found } if command == "broken" && found == "integer")
        );
    }

    #[test]
    fn factory_error_names_the_command() {
        let bytecode =
            compile(&MemorySource::new("t").with_script("boom", "error('nope')")).unwrap();
        let err = SandboxFactory::new()
            .instantiate(
                &bytecode,
                SandboxContext {
                    chat_id: 1,
                    transport: Arc::new(MemoryTransport::new()),
                },
            )
            .expect_err("factory error");

        assert!(matches!(err, SandboxError::Factory { ref command, .. } if command == "boom"));
    }

    #[test]
    fn foreign_engine_is_refused() {
        let bytecode = BytecodeMap::from_parts("Lua 5.1/luabot 0.1.0", Default::default());
        let err = SandboxFactory::new()
            .instantiate(
                &bytecode,
                SandboxContext {
                    chat_id: 1,
                    transport: Arc::new(MemoryTransport::new()),
                },
            )
            .expect_err("foreign engine");

        assert!(matches!(err, SandboxError::IncompatibleEngine { .. }));
    }

    #[test]
    fn loaders_are_not_reachable_from_scripts() {
        let (mut sandbox, transport) = sandbox_for(&[(
            "peek",
            r#"return { CallbackQuery = function(d)
                SendMessage(tostring(load) .. "," .. tostring(dofile) .. "," .. tostring(io) .. "," .. tostring(os))
            end }"#,
        )]);

        sandbox.call("peek", "CallbackQuery", data("x")).expect("call");
        assert_eq!(transport.sent()[0].text, "nil,nil,nil,nil");
    }

    #[test]
    fn handler_receives_data_and_can_reply() {
        let (mut sandbox, transport) = sandbox_for(&[(
            "quiz",
            r#"return { CallbackQuery = function(d) SendMessage("got " .. d .. " in " .. ChatId()) end }"#,
        )]);

        let outcome = sandbox.call("quiz", "CallbackQuery", data("answer_2")).unwrap();
        assert_eq!(outcome, CallOutcome::Completed);
        assert_eq!(transport.sent()[0].text, "got answer_2 in 42");
        assert_eq!(transport.sent()[0].chat_id, 42);
    }

    #[test]
    fn handler_errors_are_reported() {
        let (mut sandbox, _) = sandbox_for(&[(
            "bad",
            r#"return { CallbackQuery = function(d) error("broken handler") end }"#,
        )]);

        let err = sandbox.call("bad", "CallbackQuery", data("x")).unwrap_err();
        match err {
            ScriptError::Invocation { message, .. } => assert!(message.contains("broken handler")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn runaway_handler_hits_the_deadline() {
        let bytecode = compile(&MemorySource::new("t").with_script(
            "spin",
            "return { CallbackQuery = function(d) while true do end end }",
        ))
        .unwrap();
        let mut sandbox = SandboxFactory::new()
            .with_limits(SandboxLimits {
                execution_timeout: Some(Duration::from_millis(50)),
                max_memory_bytes: None,
            })
            .instantiate(
                &bytecode,
                SandboxContext {
                    chat_id: 1,
                    transport: Arc::new(MemoryTransport::new()),
                },
            )
            .unwrap();

        let err = sandbox.call("spin", "CallbackQuery", data("x")).unwrap_err();
        assert!(err.to_string().contains("execution timeout exceeded"));
    }

    fn limited_sandbox(
        scripts: &[(&str, &str)],
        library: RuntimeLibrary,
    ) -> Result<LuaSandbox, SandboxError> {
        let mut source = MemorySource::new("t");
        for (name, contents) in scripts {
            source = source.with_script(name, *contents);
        }
        let bytecode = compile(&source).unwrap();
        SandboxFactory::new()
            .with_library(library)
            .with_limits(SandboxLimits {
                execution_timeout: Some(Duration::from_millis(50)),
                max_memory_bytes: None,
            })
            .instantiate(
                &bytecode,
                SandboxContext {
                    chat_id: 1,
                    transport: Arc::new(MemoryTransport::new()),
                },
            )
    }

    #[test]
    fn runaway_coroutine_hits_the_deadline() {
        let mut sandbox = limited_sandbox(
            &[(
                "spin",
                r#"return { CallbackQuery = function(d)
                    if d == "forever" then while true do end end
                    return MakeCoroutine(function()
                        coroutine.yield(CoroutineStep.Step)
                        while true do end
                    end)
                end }"#,
            )],
            RuntimeLibrary::new(),
        )
        .unwrap();

        let CallOutcome::Coroutine(handle) = sandbox.call("spin", "CallbackQuery", data("")).unwrap()
        else {
            panic!("expected a coroutine");
        };
        assert_eq!(sandbox.resume(handle).unwrap(), CoroutineStatus::Step);

        let err = sandbox.resume(handle).unwrap_err();
        assert!(matches!(err, ScriptError::Resume { .. }), "{err}");
        assert!(err.to_string().contains("execution timeout exceeded"));
        assert_eq!(sandbox.live_coroutines(), 0);

        // Handlers keep their deadline after a coroutine ran.
        let err = sandbox.call("spin", "CallbackQuery", data("forever")).unwrap_err();
        assert!(err.to_string().contains("execution timeout exceeded"));
    }

    #[test]
    fn looping_preamble_fails_instantiation() {
        let err = limited_sandbox(
            &[("greet", "return {}")],
            RuntimeLibrary::new().with_preamble("while true do end"),
        )
        .expect_err("preamble never finishes");

        assert!(
            matches!(err, SandboxError::Interpreter(ref message) if message.contains("execution timeout exceeded"))
        );
    }

    #[test]
    fn coroutines_step_until_done() {
        let (mut sandbox, _) = sandbox_for(&[(
            "count",
            r#"return { CallbackQuery = function(d)
                return MakeCoroutine(function()
                    coroutine.yield(CoroutineStep.Step)
                    return CoroutineStep.Done
                end, CoroutinePolicy.EnqueueNext)
            end }"#,
        )]);

        let CallOutcome::Coroutine(handle) = sandbox.call("count", "CallbackQuery", data("")).unwrap()
        else {
            panic!("expected a coroutine");
        };
        assert_eq!(handle.policy, CoroutinePolicy::EnqueueNext);
        assert_eq!(sandbox.live_coroutines(), 1);

        assert_eq!(sandbox.resume(handle).unwrap(), CoroutineStatus::Step);
        assert_eq!(sandbox.resume(handle).unwrap(), CoroutineStatus::Done);
        assert_eq!(sandbox.live_coroutines(), 0);
        assert!(matches!(
            sandbox.resume(handle),
            Err(ScriptError::UnknownCoroutine(_))
        ));
    }

    #[test]
    fn unsupported_yield_frees_the_slot() {
        let (mut sandbox, _) = sandbox_for(&[(
            "odd",
            r#"return { CallbackQuery = function(d)
                return MakeCoroutine(function() coroutine.yield("hello") end)
            end }"#,
        )]);

        let CallOutcome::Coroutine(handle) = sandbox.call("odd", "CallbackQuery", data("")).unwrap()
        else {
            panic!("expected a coroutine");
        };
        assert_eq!(
            sandbox.resume(handle).unwrap(),
            CoroutineStatus::Unsupported("string".to_string())
        );
        assert_eq!(sandbox.live_coroutines(), 0);
    }

    #[test]
    fn unknown_policy_is_a_handler_error() {
        let (mut sandbox, _) = sandbox_for(&[(
            "odd",
            r#"return { CallbackQuery = function(d) return MakeCoroutine(function() end, 9) end }"#,
        )]);

        assert!(matches!(
            sandbox.call("odd", "CallbackQuery", data("")),
            Err(ScriptError::Invocation { .. })
        ));
    }

    #[test]
    fn released_sandbox_refuses_calls() {
        let (mut sandbox, _) = sandbox_for(&[("greet", "return { CallbackQuery = function() end }")]);
        sandbox.release();
        sandbox.release();

        assert!(sandbox.commands().is_empty());
        assert_eq!(sandbox.used_memory(), 0);
        assert!(matches!(
            sandbox.call("greet", "CallbackQuery", data("")),
            Err(ScriptError::Closed)
        ));
    }

    #[test]
    fn classify_maps_status_codes() {
        assert_eq!(classify(Value::Integer(STEP), false), CoroutineStatus::Step);
        assert_eq!(classify(Value::Number(2.0), true), CoroutineStatus::Done);
        assert_eq!(classify(Value::Nil, true), CoroutineStatus::Done);
        assert_eq!(
            classify(Value::Nil, false),
            CoroutineStatus::Unsupported("nil".to_string())
        );
        assert_eq!(
            classify(Value::Integer(7), false),
            CoroutineStatus::Unsupported("integer 7".to_string())
        );
    }
}
