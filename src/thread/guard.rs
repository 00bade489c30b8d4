//! Guard pages at the low end of thread stacks.
//!
//! Stacks the runtime commits itself are guarded by uncommitting the zone
//! and removing access, or on OSes that only protect committed memory by
//! removing access in place; stacks the OS manages (pthread, `CreateThread`) are
//! fully backed already and only get their protection changed. Either way an
//! access to the zone faults.

use super::handle::ThreadHandle;
use crate::memory::fatal::{fatal, FatalReport};
use crate::memory::region::VirtualMemory;
use crate::memory::vm::{Protection, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Stack memory lives in a runtime reservation.
    Uncommit,
    /// Stack memory is owned by the OS thread library.
    Protect,
}

pub struct StackGuardManager<'a> {
    vm: &'a VirtualMemory,
    mode: GuardMode,
}

impl<'a> StackGuardManager<'a> {
    pub fn new(vm: &'a VirtualMemory, mode: GuardMode) -> Self {
        Self { vm, mode }
    }

    /// Guard mode for stacks created by [`crate::ThreadManager`].
    pub fn for_os_stacks(vm: &'a VirtualMemory) -> Self {
        Self::new(vm, GuardMode::Protect)
    }

    #[must_use]
    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Guard zone of `handle`'s stack: (low address, size).
    #[must_use]
    pub fn guard_zone(&self, handle: &ThreadHandle) -> (usize, usize) {
        let size = self
            .vm
            .config()
            .stack
            .guard_zone_pages
            .saturating_mul(self.vm.page_size())
            .min(handle.stack_size());
        (handle.stack_low(), size)
    }

    /// Make `[low, low + size)` fault on access.
    ///
    /// # Safety
    /// The range must be the unused low end of a stack the caller controls;
    /// in [`GuardMode::Uncommit`] its contents are discarded.
    pub unsafe fn create_guard_pages(&self, low: usize, size: usize) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        self.check_aligned(low, size);
        match self.mode {
            // Only committed pages take a protection here; keep them.
            GuardMode::Uncommit if self.vm.ops().protect_requires_commit() => {
                self.vm.protect(low, size, Protection::None, true)?;
            }
            GuardMode::Uncommit => {
                self.vm.uncommit(low, size)?;
                self.vm.protect(low, size, Protection::None, false)?;
            }
            GuardMode::Protect => {
                // Safety: forwarded from the caller.
                unsafe { self.vm.ops().protect(low, size, Protection::None) }.map_err(VmError::ProtectFailed)?;
            }
        }
        tracing::debug!(target: "platvm::thread", mode = ?self.mode, "guard pages at {low:#x}+{size:#x}");
        Ok(())
    }

    /// Undo [`StackGuardManager::create_guard_pages`]: the range is
    /// read/write again.
    ///
    /// # Safety
    /// Same range rules as `create_guard_pages`.
    pub unsafe fn remove_guard_pages(&self, low: usize, size: usize) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        self.check_aligned(low, size);
        match self.mode {
            GuardMode::Uncommit if self.vm.ops().protect_requires_commit() => {
                self.vm.protect(low, size, Protection::ReadWrite, true)?;
            }
            GuardMode::Uncommit => {
                self.vm.commit(low, size, false)?;
                self.vm.protect(low, size, Protection::ReadWrite, true)?;
            }
            GuardMode::Protect => {
                // Safety: forwarded from the caller.
                unsafe { self.vm.ops().protect(low, size, Protection::ReadWrite) }
                    .map_err(VmError::ProtectFailed)?;
            }
        }
        tracing::debug!(target: "platvm::thread", mode = ?self.mode, "removed guard pages at {low:#x}+{size:#x}");
        Ok(())
    }

    /// Whether every page of `[low, low + size)` is inaccessible. False
    /// where the OS cannot report protections.
    #[must_use]
    pub fn is_guarded(&self, low: usize, size: usize) -> bool {
        let page = self.vm.page_size();
        (low..low.saturating_add(size))
            .step_by(page)
            .all(|addr| self.vm.query_protection(addr).is_some_and(|access| access.is_none()))
    }

    fn check_aligned(&self, low: usize, size: usize) {
        let page = self.vm.page_size();
        if low % page != 0 || size % page != 0 {
            fatal(FatalReport::contract(format!(
                "guard zone {low:#x}+{size:#x} is not aligned to the {page:#x} byte page size"
            )));
        }
    }
}
