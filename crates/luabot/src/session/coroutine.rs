//! Coroutine handles and the per-session resumption queue.
//!
//! Scripts create coroutines with `MakeCoroutine(fn, policy)` and hand them
//! back from a handler. The suspended Lua thread stays inside the sandbox's
//! arena; the session only ever sees a [`CoroutineHandle`].

use std::collections::VecDeque;
use std::fmt;

/// Status code a coroutine yields to ask for another resume.
pub const STEP: i64 = 1;

/// Status code a coroutine yields or returns when it has finished.
pub const DONE: i64 = 2;

/// How a coroutine is scheduled after it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoroutinePolicy {
    /// Re-queue after every `Step`, one resume per tick.
    #[default]
    EnqueueNext,
    /// Resume once, then drop regardless of what it reports.
    RejectNext,
    /// Run to completion during the dispatch that created it.
    SyncExecute,
}

impl CoroutinePolicy {
    /// Every policy with the integer value scripts use for it.
    pub const ALL: [(&'static str, i64); 3] = [
        ("EnqueueNext", 1),
        ("RejectNext", 2),
        ("SyncExecute", 3),
    ];
}

impl TryFrom<i64> for CoroutinePolicy {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::EnqueueNext),
            2 => Ok(Self::RejectNext),
            3 => Ok(Self::SyncExecute),
            other => Err(other),
        }
    }
}

impl fmt::Display for CoroutinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EnqueueNext => "EnqueueNext",
            Self::RejectNext => "RejectNext",
            Self::SyncExecute => "SyncExecute",
        };
        f.write_str(name)
    }
}

/// Index of a suspended coroutine in a sandbox's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineHandle {
    /// Arena slot.
    pub id: u64,
    /// Scheduling policy chosen by the script.
    pub policy: CoroutinePolicy,
}

/// What a coroutine reported after one resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// It wants to be resumed again.
    Step,
    /// It has finished.
    Done,
    /// It yielded something that is neither status code.
    Unsupported(String),
}

/// FIFO of coroutines waiting for their next resume.
#[derive(Debug, Default)]
pub struct CoroutineQueue {
    pending: VecDeque<CoroutineHandle>,
}

impl CoroutineQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handle at the back.
    pub fn push(&mut self, handle: CoroutineHandle) {
        self.pending.push_back(handle);
    }

    /// Take every handle queued right now, leaving the queue empty.
    ///
    /// Handles pushed while the snapshot is processed wait for the next tick.
    pub fn snapshot(&mut self) -> Vec<CoroutineHandle> {
        self.pending.drain(..).collect()
    }

    /// Remove and return every handle.
    pub fn clear(&mut self) -> Vec<CoroutineHandle> {
        self.snapshot()
    }

    /// Number of queued handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued handles, front first.
    pub fn iter(&self) -> impl Iterator<Item = &CoroutineHandle> {
        self.pending.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> CoroutineHandle {
        CoroutineHandle {
            id,
            policy: CoroutinePolicy::EnqueueNext,
        }
    }

    #[test]
    fn policy_values_match_script_constants() {
        for (name, value) in CoroutinePolicy::ALL {
            let policy = CoroutinePolicy::try_from(value).ok();
            assert_eq!(policy.map(|p| p.to_string()).as_deref(), Some(name));
        }
        assert_eq!(CoroutinePolicy::try_from(0), Err(0));
        assert_eq!(CoroutinePolicy::try_from(4), Err(4));
    }

    #[test]
    fn snapshot_excludes_later_pushes() {
        let mut queue = CoroutineQueue::new();
        queue.push(handle(1));
        queue.push(handle(2));

        let snapshot = queue.snapshot();
        queue.push(handle(1));

        assert_eq!(snapshot, vec![handle(1), handle(2)]);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![handle(1)]);
    }
}
