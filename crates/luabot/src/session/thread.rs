//! Dedicated execution lane for one session.
//!
//! Every operation on the session is enqueued as a task and executed by the
//! session's own thread in enqueue order. Callers never block on script
//! work, except for [`SessionThread::flush`] and [`SessionThread::inspect`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Instant;

use super::{ActivityClock, Session, SessionStats, TickReport};
use crate::transport::{CallbackQuery, IncomingMessage};

type Task = Box<dyn FnOnce(&mut Session) + Send + 'static>;

/// A session running on its own thread.
///
/// Dropping the handle closes the queue and joins the thread. Tasks already
/// queued still run; once [`SessionThread::force_close`] has run, later tasks
/// find a closed session and do nothing.
pub struct SessionThread {
    chat_id: u64,
    sender: Option<mpsc::Sender<Task>>,
    worker: Option<JoinHandle<()>>,
    clock: ActivityClock,
}

impl std::fmt::Debug for SessionThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionThread")
            .field("chat_id", &self.chat_id)
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionThread {
    /// Move `session` onto a new thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(session: Session) -> std::io::Result<Self> {
        let chat_id = session.chat_id();
        let clock = ActivityClock::new();
        let session = session.with_clock(clock.clone());
        let (sender, receiver) = mpsc::channel::<Task>();

        let worker = std::thread::Builder::new()
            .name(format!("luabot-chat-{chat_id}"))
            .spawn(move || run_tasks(session, receiver))?;

        tracing::info!(chat_id, "Started session thread");

        Ok(Self {
            chat_id,
            sender: Some(sender),
            worker: Some(worker),
            clock,
        })
    }

    /// Chat served by this thread.
    #[must_use]
    pub const fn chat_id(&self) -> u64 {
        self.chat_id
    }

    /// Queue a task. Returns `false` if the worker is gone.
    pub fn enqueue(&self, task: impl FnOnce(&mut Session) + Send + 'static) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        if sender.send(Box::new(task)).is_err() {
            tracing::warn!(chat_id = self.chat_id, "Session thread is gone; task dropped");
            return false;
        }
        true
    }

    /// Queue a chat message.
    pub fn manage_message(&self, message: IncomingMessage) {
        self.clock.touch();
        self.enqueue(move |session| {
            let _ = session.dispatch_message(message);
        });
    }

    /// Queue a callback query.
    pub fn manage_callback(&self, query: CallbackQuery) {
        self.clock.touch();
        self.enqueue(move |session| {
            let _ = session.dispatch_callback(query);
        });
    }

    /// Queue a coroutine tick.
    pub fn update(&self) {
        self.enqueue(|session| {
            let _: TickReport = session.update();
        });
    }

    /// Queue closing the session.
    pub fn force_close(&self) {
        self.enqueue(Session::force_close);
    }

    /// Time of the last event, enqueued or dispatched.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.clock.last()
    }

    /// Shared activity clock.
    #[must_use]
    pub fn clock(&self) -> &ActivityClock {
        &self.clock
    }

    /// Run `f` on the session thread after every task queued so far and
    /// wait for its result. Returns `None` if the worker is gone.
    pub fn inspect<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&Session) -> R + Send + 'static,
    {
        let (reply, result) = mpsc::sync_channel(1);
        let queued = self.enqueue(move |session| {
            let _ = reply.send(f(session));
        });
        if !queued {
            return None;
        }
        result.recv().ok()
    }

    /// Wait until every task queued so far has run.
    pub fn flush(&self) {
        let _ = self.inspect(|_| ());
    }

    /// Session statistics, read on the session thread.
    #[must_use]
    pub fn stats(&self) -> Option<SessionStats> {
        self.inspect(|session| session.stats().clone())
    }
}

impl Drop for SessionThread {
    fn drop(&mut self) {
        drop(self.sender.take());

        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(chat_id = self.chat_id, "Session thread panicked");
        }

        tracing::debug!(chat_id = self.chat_id, "Session thread joined");
    }
}

fn run_tasks(mut session: Session, receiver: mpsc::Receiver<Task>) {
    let chat_id = session.chat_id();

    // Runs until every sender is dropped and the queue is empty.
    for task in receiver {
        let result = catch_unwind(AssertUnwindSafe(|| task(&mut session)));
        if let Err(payload) = result {
            tracing::error!(chat_id, panic = %panic_message(&*payload), "Session task panicked");
        }
    }

    session.force_close();
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::sandbox::{CallOutcome, HandlerArg, ScriptError, ScriptSandbox};
    use crate::session::{CoroutineHandle, CoroutineStatus};

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        released: Arc<Mutex<bool>>,
    }

    impl ScriptSandbox for Recorder {
        fn commands(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        fn has_handler(&self, _command: &str, _handler: &str) -> bool {
            true
        }

        fn call(&mut self, _command: &str, _handler: &str, arg: HandlerArg) -> Result<CallOutcome, ScriptError> {
            if let HandlerArg::Data(data) = arg {
                if data == "panic" {
                    panic!("handler blew up");
                }
                self.seen.lock().unwrap().push(data);
            }
            Ok(CallOutcome::Completed)
        }

        fn resume(&mut self, handle: CoroutineHandle) -> Result<CoroutineStatus, ScriptError> {
            Err(ScriptError::UnknownCoroutine(handle.id))
        }

        fn discard(&mut self, _handle: CoroutineHandle) {}

        fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    fn query(data: &str) -> CallbackQuery {
        CallbackQuery {
            id: data.to_string(),
            chat_id: 3,
            message_id: None,
            data: format!("echo;{data}"),
            from: None,
        }
    }

    #[test]
    fn tasks_run_in_enqueue_order_and_survive_panics() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let thread = SessionThread::spawn(Session::new(3, Box::new(recorder))).unwrap();

        thread.manage_callback(query("one"));
        thread.manage_callback(query("panic"));
        thread.manage_callback(query("two"));
        thread.flush();

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn drop_releases_the_sandbox() {
        let recorder = Recorder::default();
        let released = Arc::clone(&recorder.released);
        let thread = SessionThread::spawn(Session::new(3, Box::new(recorder))).unwrap();

        thread.manage_callback(query("one"));
        drop(thread);

        assert!(*released.lock().unwrap());
    }

    #[test]
    fn tasks_after_force_close_do_nothing() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let thread = SessionThread::spawn(Session::new(3, Box::new(recorder))).unwrap();

        thread.force_close();
        thread.manage_callback(query("late"));

        assert_eq!(thread.inspect(Session::is_closed), Some(true));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn enqueueing_refreshes_activity() {
        let thread = SessionThread::spawn(Session::new(3, Box::new(Recorder::default()))).unwrap();
        let before = thread.last_activity();

        std::thread::sleep(std::time::Duration::from_millis(2));
        thread.manage_callback(query("one"));

        assert!(thread.last_activity() > before);
        assert_eq!(thread.stats().map(|s| s.callbacks_dispatched), Some(1));
    }
}
