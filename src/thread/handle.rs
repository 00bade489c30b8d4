use std::fmt;

use super::backend::{OsThread, SignalMask};
use super::stack::ThreadKind;
use crate::sync::{lock, wait, Arc, Condvar, Mutex};

/// Lifecycle of a native thread. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadState {
    /// Handle exists, no OS thread yet.
    Allocated,
    /// OS thread exists and is held before user code.
    Initialized,
    /// Released to run user code.
    Runnable,
    Exited,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Entry function returned.
    Returned,
    /// Entry function panicked; the panic message.
    Panicked(String),
    /// Handle dropped before the thread was started; user code never ran.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GateState {
    pub state: ThreadState,
    pub native_id: u64,
    pub stack_base: usize,
    pub stack_size: usize,
    pub exit: Option<ExitStatus>,
}

/// Creator/child rendezvous enforcing the state machine.
///
/// The child announces `Initialized` once it knows its id and stack, then
/// blocks until the creator moves it to `Runnable`. Under the
/// create-suspended protocol the creator announces `Initialized` itself and
/// the OS does the blocking.
pub(crate) struct StartGate {
    inner: Mutex<GateState>,
    changed: Condvar,
}

impl StartGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateState {
                state: ThreadState::Allocated,
                native_id: 0,
                stack_base: 0,
                stack_size: 0,
                exit: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Gate for a thread that is already running user code.
    pub fn runnable(native_id: u64, stack_base: usize, stack_size: usize) -> Self {
        let gate = Self::new();
        {
            let mut inner = lock(&gate.inner);
            inner.state = ThreadState::Runnable;
            inner.native_id = native_id;
            inner.stack_base = stack_base;
            inner.stack_size = stack_size;
        }
        gate
    }

    pub fn snapshot(&self) -> GateState {
        lock(&self.inner).clone()
    }

    pub fn state(&self) -> ThreadState {
        lock(&self.inner).state
    }

    /// `Allocated -> Initialized`. Stack bounds may be zero when they are
    /// only known once the thread runs.
    pub fn announce_initialized(&self, native_id: u64, stack_base: usize, stack_size: usize) {
        let mut inner = lock(&self.inner);
        if inner.state == ThreadState::Allocated {
            inner.state = ThreadState::Initialized;
            inner.native_id = native_id;
            inner.stack_base = stack_base;
            inner.stack_size = stack_size;
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Record stack bounds learnt after `Initialized`.
    pub fn record_stack(&self, stack_base: usize, stack_size: usize) {
        let mut inner = lock(&self.inner);
        inner.stack_base = stack_base;
        inner.stack_size = stack_size;
    }

    /// Block until the thread left `Allocated`.
    pub fn wait_initialized(&self) -> ThreadState {
        let mut inner = lock(&self.inner);
        while inner.state == ThreadState::Allocated {
            inner = wait(&self.changed, inner);
        }
        inner.state
    }

    /// `Initialized -> Runnable`. Returns the offending state otherwise.
    pub fn release(&self) -> Result<(), ThreadState> {
        let mut inner = lock(&self.inner);
        if inner.state != ThreadState::Initialized {
            return Err(inner.state);
        }
        inner.state = ThreadState::Runnable;
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    /// Child side: block while `Initialized`. Returns true if released to
    /// run user code, false if cancelled.
    pub fn wait_for_start(&self) -> bool {
        let mut inner = lock(&self.inner);
        while inner.state == ThreadState::Initialized {
            inner = wait(&self.changed, inner);
        }
        inner.state == ThreadState::Runnable
    }

    /// `Initialized -> Exited` without running user code.
    pub fn cancel(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != ThreadState::Initialized {
            return false;
        }
        inner.state = ThreadState::Exited;
        inner.exit = Some(ExitStatus::Cancelled);
        drop(inner);
        self.changed.notify_all();
        true
    }

    pub fn mark_exited(&self, status: ExitStatus) {
        let mut inner = lock(&self.inner);
        inner.state = ThreadState::Exited;
        inner.exit.get_or_insert(status);
        drop(inner);
        self.changed.notify_all();
    }

    pub fn wait_exited(&self) -> ExitStatus {
        let mut inner = lock(&self.inner);
        loop {
            if let Some(status) = inner.exit.clone() {
                return status;
            }
            inner = wait(&self.changed, inner);
        }
    }
}

/// State shared between a handle and its OS thread.
pub(crate) struct ThreadShared {
    pub name: String,
    pub kind: ThreadKind,
    pub gate: StartGate,
}

/// How the handle came to exist; decides what `free` must undo.
pub(crate) enum Origin {
    Created(OsThread),
    Attached(SignalMask),
}

/// Native thread bound to a runtime thread object.
pub struct ThreadHandle {
    pub(crate) shared: Arc<ThreadShared>,
    pub(crate) origin: Option<Origin>,
}

impl ThreadHandle {
    pub(crate) fn new(shared: Arc<ThreadShared>, origin: Origin) -> Self {
        Self {
            shared,
            origin: Some(origin),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn kind(&self) -> ThreadKind {
        self.shared.kind
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.shared.gate.state()
    }

    /// OS thread id; 0 until the thread reached `Initialized`.
    #[must_use]
    pub fn native_id(&self) -> u64 {
        self.shared.gate.snapshot().native_id
    }

    /// High end of the stack.
    #[must_use]
    pub fn stack_base(&self) -> usize {
        self.shared.gate.snapshot().stack_base
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.shared.gate.snapshot().stack_size
    }

    /// Low end of the stack, page aligned.
    #[must_use]
    pub fn stack_low(&self) -> usize {
        let gate = self.shared.gate.snapshot();
        gate.stack_base - gate.stack_size
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.gate.snapshot().exit
    }

    /// Block until the thread's entry function has finished.
    pub fn wait_for_exit(&self) -> ExitStatus {
        self.shared.gate.wait_exited()
    }

    /// Whether the handle was made by `attach` rather than `create`.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(self.origin, Some(Origin::Attached(_)))
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gate = self.shared.gate.snapshot();
        f.debug_struct("ThreadHandle")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("state", &gate.state)
            .field("native_id", &gate.native_id)
            .field("stack_base", &format_args!("{:#x}", gate.stack_base))
            .field("stack_size", &gate.stack_size)
            .finish()
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // A created thread that was never started would wait forever.
        if let Some(Origin::Created(os_thread)) = self.origin.take() {
            if self.shared.gate.cancel() {
                tracing::debug!(
                    target: "platvm::thread",
                    name = %self.shared.name,
                    "handle dropped before start; cancelling thread"
                );
                if let Err(e) = os_thread.resume() {
                    tracing::warn!(target: "platvm::thread", "failed to resume cancelled thread: {e}");
                }
            }
            os_thread.close();
        }
    }
}
