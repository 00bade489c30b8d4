//! Native thread primitives.
//!
//! Two start protocols sit behind the same surface. POSIX threads run as
//! soon as they are created, so the new thread itself announces
//! `Initialized` and blocks on the start gate (`HANDSHAKE`). Windows threads
//! are created suspended; the creator announces `Initialized` and
//! [`OsThread::resume`] lets the OS run them (`!HANDSHAKE`).

/// Thread entry as handed to the OS.
pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Stack bounds of the calling thread: (high address, size).
pub(crate) type StackBounds = (usize, usize);

/// Align the low end of a stack up to `page` and return the adjusted
/// (base, size).
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn page_aligned_bounds(base: usize, size: usize, page: usize) -> StackBounds {
    let low = base - size;
    let low = low.checked_next_multiple_of(page).unwrap_or(low);
    (base, base.saturating_sub(low))
}

#[cfg(unix)]
mod posix {
    use super::{page_aligned_bounds, Entry, StackBounds};
    use std::io;
    use std::mem::MaybeUninit;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    pub(crate) const HANDSHAKE: bool = true;

    /// A created pthread. Threads are detached, so nothing needs closing.
    #[derive(Debug)]
    pub(crate) struct OsThread {
        _detached: (),
    }

    impl OsThread {
        /// Known only to the thread itself once it runs.
        pub(crate) fn id(&self) -> Option<u64> {
            None
        }

        pub(crate) fn resume(&self) -> io::Result<()> {
            Ok(())
        }

        pub(crate) fn close(self) {}
    }

    extern "C" fn thread_start(arg: *mut libc::c_void) -> *mut libc::c_void {
        // Safety: `arg` is the Box leaked by `spawn`, handed over exactly once.
        let entry = unsafe { Box::from_raw(arg.cast::<Entry>()) };
        // Unwinding out of an extern "C" function aborts; the manager
        // already captures panics, this only guards the glue.
        if catch_unwind(AssertUnwindSafe(move || (*entry)())).is_err() {
            tracing::error!(target: "platvm::thread", "panic escaped thread entry");
        }
        std::ptr::null_mut()
    }

    /// Create a detached thread with a `stack_size` byte stack running `entry`.
    pub(crate) fn spawn(stack_size: usize, entry: Entry) -> io::Result<OsThread> {
        let arg = Box::into_raw(Box::new(entry)).cast::<libc::c_void>();
        // Safety: FFI calls on a locally owned attribute object.
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
            let rc = libc::pthread_attr_init(attr.as_mut_ptr());
            if rc != 0 {
                drop(Box::from_raw(arg.cast::<Entry>()));
                return Err(io::Error::from_raw_os_error(rc));
            }
            let mut attr = attr.assume_init();
            libc::pthread_attr_setdetachstate(&mut attr, libc::PTHREAD_CREATE_DETACHED);
            let rc = libc::pthread_attr_setstacksize(&mut attr, stack_size);
            if rc != 0 {
                libc::pthread_attr_destroy(&mut attr);
                drop(Box::from_raw(arg.cast::<Entry>()));
                return Err(io::Error::from_raw_os_error(rc));
            }

            let mut pthread = MaybeUninit::<libc::pthread_t>::uninit();
            let rc = libc::pthread_create(pthread.as_mut_ptr(), &attr, thread_start, arg);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                // The thread never started, so the entry is still ours.
                drop(Box::from_raw(arg.cast::<Entry>()));
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(OsThread { _detached: () })
        }
    }

    /// Resource shortage the OS may recover from shortly.
    pub(crate) fn is_transient(error: &io::Error) -> bool {
        error.raw_os_error() == Some(libc::EAGAIN)
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn current_thread_id() -> u64 {
        // Safety: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn current_thread_id() -> u64 {
        let mut id = 0u64;
        // Safety: FFI call writing to a local.
        unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut id) };
        id
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub(crate) fn current_thread_id() -> u64 {
        // Safety: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as u64 }
    }

    /// Whether the caller is the process's initial thread, if the OS can say.
    #[cfg(target_os = "linux")]
    pub(crate) fn is_primordial_thread() -> Option<bool> {
        // Safety: getpid has no preconditions.
        Some(current_thread_id() == unsafe { libc::getpid() } as u64)
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn is_primordial_thread() -> Option<bool> {
        // Safety: pthread_main_np has no preconditions.
        Some(unsafe { libc::pthread_main_np() } != 0)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub(crate) fn is_primordial_thread() -> Option<bool> {
        None
    }

    fn page_size() -> usize {
        // Safety: FFI call to sysconf.
        usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap_or(4096)
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn current_stack_bounds() -> io::Result<StackBounds> {
        // Safety: FFI calls on a locally owned attribute object.
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
            let rc = libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            let mut attr = attr.assume_init();
            let mut low: *mut libc::c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut low, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(page_aligned_bounds(low as usize + size, size, page_size()))
        }
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn current_stack_bounds() -> io::Result<StackBounds> {
        // Safety: FFI calls on the calling thread.
        let (base, size) = unsafe {
            let this = libc::pthread_self();
            (
                libc::pthread_get_stackaddr_np(this) as usize,
                libc::pthread_get_stacksize_np(this),
            )
        };
        Ok(page_aligned_bounds(base, size, page_size()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub(crate) fn current_stack_bounds() -> io::Result<StackBounds> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stack bounds are not available on this OS",
        ))
    }

    /// Blocked-signal set of a thread, saved on attach and restored on free.
    pub(crate) struct SignalMask(libc::sigset_t);

    impl SignalMask {
        pub(crate) fn current() -> io::Result<Self> {
            // Safety: FFI call writing to a local set; a null new set only queries.
            unsafe {
                let mut set = MaybeUninit::<libc::sigset_t>::zeroed();
                let rc = libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), set.as_mut_ptr());
                if rc != 0 {
                    return Err(io::Error::from_raw_os_error(rc));
                }
                Ok(Self(set.assume_init()))
            }
        }

        pub(crate) fn restore(&self) -> io::Result<()> {
            // Safety: FFI call reading a valid set.
            let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.0, std::ptr::null_mut()) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{Entry, StackBounds};
    use std::ffi::c_void;
    use std::io;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{
        CreateThread, GetCurrentThreadId, GetCurrentThreadStackLimits, ResumeThread, CREATE_SUSPENDED,
        STACK_SIZE_PARAM_IS_A_RESERVATION,
    };

    pub(crate) const HANDSHAKE: bool = false;

    /// A created Win32 thread, suspended until resumed.
    #[derive(Debug)]
    pub(crate) struct OsThread {
        handle: HANDLE,
        id: u32,
    }

    // Safety: a thread HANDLE may be used from any thread.
    unsafe impl Send for OsThread {}
    // Safety: as above; the handle is only read.
    unsafe impl Sync for OsThread {}

    impl OsThread {
        pub(crate) fn id(&self) -> Option<u64> {
            Some(u64::from(self.id))
        }

        pub(crate) fn resume(&self) -> io::Result<()> {
            // Safety: FFI call on a live thread handle.
            if unsafe { ResumeThread(self.handle) } == u32::MAX {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn close(self) {
            // Safety: the handle is owned and closed exactly once.
            unsafe { CloseHandle(self.handle) };
        }
    }

    unsafe extern "system" fn thread_start(arg: *mut c_void) -> u32 {
        // Safety: `arg` is the Box leaked by `spawn`, handed over exactly once.
        let entry = unsafe { Box::from_raw(arg.cast::<Entry>()) };
        if catch_unwind(AssertUnwindSafe(move || (*entry)())).is_err() {
            tracing::error!(target: "platvm::thread", "panic escaped thread entry");
        }
        0
    }

    pub(crate) fn spawn(stack_size: usize, entry: Entry) -> io::Result<OsThread> {
        let arg = Box::into_raw(Box::new(entry)).cast::<c_void>();
        let mut id = 0u32;
        // Safety: FFI call; the thread is created suspended.
        let handle = unsafe {
            CreateThread(
                std::ptr::null(),
                stack_size,
                Some(thread_start),
                arg,
                CREATE_SUSPENDED | STACK_SIZE_PARAM_IS_A_RESERVATION,
                &mut id,
            )
        };
        if handle.is_null() {
            let error = io::Error::last_os_error();
            // Safety: the thread was never created, so the entry is still ours.
            drop(unsafe { Box::from_raw(arg.cast::<Entry>()) });
            return Err(error);
        }
        Ok(OsThread { handle, id })
    }

    pub(crate) fn is_transient(_error: &io::Error) -> bool {
        false
    }

    pub(crate) fn current_thread_id() -> u64 {
        // Safety: no preconditions.
        u64::from(unsafe { GetCurrentThreadId() })
    }

    pub(crate) fn is_primordial_thread() -> Option<bool> {
        None
    }

    pub(crate) fn current_stack_bounds() -> io::Result<StackBounds> {
        let (mut low, mut high) = (0usize, 0usize);
        // Safety: FFI call writing to locals.
        unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
        Ok((high, high - low))
    }

    /// Windows has no per-thread signal mask.
    pub(crate) struct SignalMask;

    impl SignalMask {
        pub(crate) fn current() -> io::Result<Self> {
            Ok(Self)
        }

        pub(crate) fn restore(&self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(unix)]
pub(crate) use posix::*;
#[cfg(windows)]
pub(crate) use windows::*;
