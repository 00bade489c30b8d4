use std::any::Any;
use std::cell::Cell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;

use super::backend::{self, Entry, OsThread, SignalMask};
use super::handle::{ExitStatus, Origin, StartGate, ThreadHandle, ThreadShared, ThreadState};
use super::stack::{StackPolicy, ThreadKind};
use crate::config::VmConfig;
use crate::memory::fatal::{fatal, FatalReport};
use crate::memory::region::VirtualMemory;
use crate::sync::{lock, Arc, Mutex};

/// Delay before the second creation attempt; doubles per retry.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Starts an OS thread with the given stack size.
type SpawnFn = fn(usize, Entry) -> io::Result<OsThread>;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("thread creation failed after {attempts} attempt(s): {source}")]
    CreationFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("the current thread is already attached")]
    AlreadyAttached,
    #[error("cannot query the current thread's stack: {0}")]
    StackQueryFailed(#[source] io::Error),
    #[error("cannot save the current thread's signal mask: {0}")]
    SignalMaskFailed(#[source] io::Error),
}

thread_local! {
    static ATTACHED: Cell<bool> = const { Cell::new(false) };
}

/// Creates, attaches, starts and frees native threads.
#[derive(Debug, Clone)]
pub struct ThreadManager {
    stacks: StackPolicy,
    create_attempts: u32,
    spawn: SpawnFn,
    backoff: fn(Duration),
}

impl ThreadManager {
    pub fn new(config: &VmConfig, page_size: usize) -> Self {
        Self {
            stacks: StackPolicy::new(&config.stack, page_size),
            create_attempts: config.thread_create_attempts.max(1),
            spawn: backend::spawn,
            backoff: std::thread::sleep,
        }
    }

    /// Manager sharing `vm`'s configuration and page size.
    pub fn for_memory(vm: &VirtualMemory) -> Self {
        Self::new(vm.config(), vm.page_size())
    }

    #[must_use]
    pub fn stack_policy(&self) -> &StackPolicy {
        &self.stacks
    }

    /// Create a thread that will run `entry` once [`ThreadManager::start_thread`]
    /// is called. Returns with the thread `Initialized`; `requested_stack` of
    /// zero picks the default for `kind`.
    pub fn create<F>(
        &self,
        name: impl Into<String>,
        kind: ThreadKind,
        requested_stack: usize,
        entry: F,
    ) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = self.stacks.effective_size(kind, requested_stack);
        let shared = Arc::new(ThreadShared {
            name: name.into(),
            kind,
            gate: StartGate::new(),
        });
        // A failed attempt drops its closure, so the user entry lives here
        // until an OS thread actually takes it.
        let slot: Arc<Mutex<Option<Entry>>> = Arc::new(Mutex::new(Some(Box::new(entry))));

        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 1;
        let os_thread = loop {
            let child = Arc::clone(&shared);
            let child_slot = Arc::clone(&slot);
            let spawned = (self.spawn)(
                stack_size,
                Box::new(move || {
                    let user = lock(&child_slot).take();
                    if let Some(user) = user {
                        thread_main(&child, user);
                    }
                }),
            );
            match spawned {
                Ok(os_thread) => break os_thread,
                Err(e) if attempt < self.create_attempts && backend::is_transient(&e) => {
                    tracing::info!(
                        target: "platvm::thread",
                        name = %shared.name,
                        attempt,
                        "thread creation failed ({e}); retrying in {delay:?}"
                    );
                    (self.backoff)(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "platvm::thread",
                        name = %shared.name,
                        %kind,
                        stack_size,
                        "failed to create thread: {e}"
                    );
                    return Err(ThreadError::CreationFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        };

        if !backend::HANDSHAKE {
            // Suspended by the OS; stack bounds follow once it runs.
            shared.gate.announce_initialized(os_thread.id().unwrap_or(0), 0, 0);
        }
        let handle = ThreadHandle::new(shared, Origin::Created(os_thread));
        handle.shared.gate.wait_initialized();
        tracing::debug!(
            target: "platvm::thread",
            name = %handle.name(),
            %kind,
            native_id = handle.native_id(),
            stack_size,
            "thread created"
        );
        Ok(handle)
    }

    /// Let a created thread run its entry function. Exactly once per handle.
    pub fn start_thread(&self, handle: &ThreadHandle) {
        if let Err(state) = handle.shared.gate.release() {
            fatal(FatalReport::contract(format!(
                "start_thread on thread '{}' in state {state}, expected {}",
                handle.name(),
                ThreadState::Initialized
            )));
        }
        if let Some(Origin::Created(os_thread)) = &handle.origin {
            if let Err(e) = os_thread.resume() {
                fatal(
                    FatalReport::initialization(format!("cannot resume thread '{}'", handle.name()))
                        .with_os_error(&e),
                );
            }
        }
        tracing::trace!(target: "platvm::thread", name = %handle.name(), "thread started");
    }

    /// Bind the calling OS thread, which the runtime did not create. The
    /// handle is `Runnable` and remembers the thread's signal mask.
    pub fn attach(&self, name: impl Into<String>, kind: ThreadKind) -> Result<ThreadHandle, ThreadError> {
        if ATTACHED.get() {
            return Err(ThreadError::AlreadyAttached);
        }
        let (stack_base, stack_size) = backend::current_stack_bounds().map_err(ThreadError::StackQueryFailed)?;
        let mask = SignalMask::current().map_err(ThreadError::SignalMaskFailed)?;
        let native_id = backend::current_thread_id();
        ATTACHED.set(true);

        let shared = Arc::new(ThreadShared {
            name: name.into(),
            kind,
            gate: StartGate::runnable(native_id, stack_base, stack_size),
        });
        tracing::debug!(
            target: "platvm::thread",
            name = %shared.name,
            native_id,
            "attached thread, stack {:#x}-{stack_base:#x}",
            stack_base - stack_size
        );
        Ok(ThreadHandle::new(shared, Origin::Attached(mask)))
    }

    /// [`ThreadManager::attach`] for the process's initial thread. Calling it
    /// from any other thread is fatal.
    pub fn attach_main(&self, name: impl Into<String>) -> Result<ThreadHandle, ThreadError> {
        if backend::is_primordial_thread() == Some(false) {
            fatal(FatalReport::contract(format!(
                "attach_main called on thread {}, which is not the process's initial thread",
                backend::current_thread_id()
            )));
        }
        self.attach(name, ThreadKind::Java)
    }

    /// Release the handle's OS resources and, for attached threads, restore
    /// the saved signal mask.
    ///
    /// Attached handles must be freed by the thread they describe. Created
    /// handles may be freed by their own thread, or by anyone once the
    /// thread has exited or if it was never started.
    pub fn free(&self, mut handle: ThreadHandle) {
        let on_own_thread = handle.native_id() == backend::current_thread_id();
        match handle.origin.take() {
            Some(Origin::Attached(mask)) => {
                if !on_own_thread {
                    fatal(FatalReport::contract(format!(
                        "free of attached thread '{}' ({}) from thread {}",
                        handle.name(),
                        handle.native_id(),
                        backend::current_thread_id()
                    )));
                }
                if let Err(e) = mask.restore() {
                    tracing::warn!(target: "platvm::thread", "cannot restore signal mask: {e}");
                }
                ATTACHED.set(false);
                tracing::debug!(target: "platvm::thread", name = %handle.name(), "detached thread");
            }
            Some(origin @ Origin::Created(_)) => {
                if handle.state() == ThreadState::Runnable && !on_own_thread {
                    fatal(FatalReport::contract(format!(
                        "free of running thread '{}' ({}) from thread {}",
                        handle.name(),
                        handle.native_id(),
                        backend::current_thread_id()
                    )));
                }
                // Dropping cancels a never-started thread and closes the OS handle.
                handle.origin = Some(origin);
            }
            None => {}
        }
    }
}

/// Body of every created thread.
fn thread_main(shared: &ThreadShared, user: Entry) {
    let native_id = backend::current_thread_id();
    let (stack_base, stack_size) = backend::current_stack_bounds().unwrap_or_else(|e| {
        tracing::warn!(target: "platvm::thread", name = %shared.name, "cannot query stack bounds: {e}");
        (0, 0)
    });
    if backend::HANDSHAKE {
        shared.gate.announce_initialized(native_id, stack_base, stack_size);
    } else {
        shared.gate.record_stack(stack_base, stack_size);
    }

    if !shared.gate.wait_for_start() {
        tracing::debug!(target: "platvm::thread", name = %shared.name, "thread cancelled before start");
        return;
    }

    let status = match catch_unwind(AssertUnwindSafe(user)) {
        Ok(()) => ExitStatus::Returned,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                target: "platvm::thread",
                name = %shared.name,
                kind = %shared.kind,
                native_id,
                "thread panicked: {message}"
            );
            ExitStatus::Panicked(message)
        }
    };
    shared.gate.mark_exited(status);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
