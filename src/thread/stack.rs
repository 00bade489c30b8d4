//! Stack sizes for new threads.
//!
//! Each kind of thread has a default size (used when neither the caller nor
//! the configuration asks for one) and a minimum below which requests are
//! silently raised. Minimums for threads that run managed code leave room
//! for the guard and shadow zones on top of the native frames.

use std::fmt;

use crate::config::StackConfig;

const K: usize = 1024;
const M: usize = K * K;

/// Lower bound for any thread kind before zones are accounted for.
const BASE_MIN_STACK: usize = 64 * K;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// Runs managed code.
    Java,
    /// Runs the JIT; deep recursion in the optimizer.
    Compiler,
    /// Internal service threads (GC workers, watchers).
    VmInternal,
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ThreadKind::Java => "java",
            ThreadKind::Compiler => "compiler",
            ThreadKind::VmInternal => "vm",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPolicy {
    page_size: usize,
    config: StackConfig,
    java_min: usize,
    compiler_min: usize,
    vm_min: usize,
}

impl StackPolicy {
    pub fn new(config: &StackConfig, page_size: usize) -> Self {
        let zones = (config.guard_zone_pages + config.shadow_zone_pages).saturating_mul(page_size);
        // Native frames below the first managed frame.
        let native_frames = (4 * std::mem::size_of::<usize>() + 2) * 4 * K;
        let managed_min = BASE_MIN_STACK.max(zones.saturating_add(native_frames));
        Self {
            page_size,
            config: config.clone(),
            java_min: align_up_or_down(managed_min, page_size),
            compiler_min: align_up_or_down(managed_min, page_size),
            vm_min: align_up_or_down(BASE_MIN_STACK, page_size),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn minimum(&self, kind: ThreadKind) -> usize {
        match kind {
            ThreadKind::Java => self.java_min,
            ThreadKind::Compiler => self.compiler_min,
            ThreadKind::VmInternal => self.vm_min,
        }
    }

    /// Size used when nothing was requested for `kind`.
    #[must_use]
    pub fn default_size(&self, kind: ThreadKind) -> usize {
        let configured = match kind {
            ThreadKind::Java => self.config.java_thread_stack_size,
            // Compiler threads fall back to the VM thread size when no
            // compiler-specific size is configured.
            ThreadKind::Compiler if self.config.compiler_thread_stack_size > 0 => {
                self.config.compiler_thread_stack_size
            }
            ThreadKind::Compiler | ThreadKind::VmInternal => self.config.vm_thread_stack_size,
        };
        if configured > 0 {
            return configured;
        }
        match kind {
            ThreadKind::Compiler => 4 * M,
            ThreadKind::Java | ThreadKind::VmInternal => M,
        }
    }

    /// Stack size to create a `kind` thread with. Zero means the default;
    /// anything below the minimum is raised to it.
    #[must_use]
    pub fn effective_size(&self, kind: ThreadKind, requested: usize) -> usize {
        let size = if requested == 0 { self.default_size(kind) } else { requested };
        let size = align_up_or_down(size, self.page_size);
        let minimum = self.minimum(kind);
        if size < minimum {
            tracing::debug!(
                target: "platvm::thread",
                %kind,
                requested,
                minimum,
                "raising stack size to the minimum"
            );
            return minimum;
        }
        size
    }

    /// Bytes at the low end of a stack that must fault on access.
    #[must_use]
    pub fn guard_zone_size(&self) -> usize {
        self.config.guard_zone_pages.saturating_mul(self.page_size)
    }
}

/// Round up to `page`, or down if rounding up would overflow.
fn align_up_or_down(size: usize, page: usize) -> usize {
    size.checked_next_multiple_of(page).unwrap_or(size - size % page)
}
