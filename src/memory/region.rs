//! Reservation, commit, protection and release of address space.
//!
//! `VirtualMemory` ties together the raw OS layer, the page size probe, the
//! reservation strategies and the ledger. Environmental failures come back
//! as [`VmError`]; ranges that do not belong to a known mapping are fatal.

use std::fs::File;
use std::io;
use std::sync::Arc;

use super::fatal::{fatal, FatalReport};
use super::ledger::{Ledger, LedgerUpdate, LedgerViolation, OsMapping, Technique};
use super::page_size::{self, describe_page_size, MultipageCapabilities};
use super::stats::{VmCounters, VmStats};
use super::strategy::{ReservationStrategy, ReserveRequest, Strategies};
use super::vm::{Access, PlatformVmOps, Protection, VmError, VmOps};
use crate::config::VmConfig;
use crate::sync::OnceLock;

/// Placement attempts for aligned reservations on OSes without partial
/// release before giving up.
pub const MAX_ALIGNED_ATTEMPTS: usize = 20;

/// Large page size and the technique that can deliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LargePages {
    size: usize,
    technique: Technique,
}

pub struct VirtualMemory {
    ops: Arc<dyn VmOps>,
    config: VmConfig,
    caps: MultipageCapabilities,
    ledger: Ledger,
    strategies: Strategies,
    default_technique: Technique,
    large_pages: Option<LargePages>,
    program_break: Option<usize>,
    numa_interleaving: bool,
    counters: VmCounters,
}

static GLOBAL: OnceLock<VirtualMemory> = OnceLock::new();

impl VirtualMemory {
    /// Probe `ops` and select strategies according to `config`.
    pub fn new(ops: Arc<dyn VmOps>, config: VmConfig) -> Self {
        let caps = page_size::probe(ops.as_ref());

        let default_technique = if config.use_shared_memory && ops.supports_shared_memory() {
            Technique::SharedMemoryAttach
        } else {
            if config.use_shared_memory {
                tracing::warn!(target: "platvm::map", "shared memory requested but not supported by {}", ops.name());
            }
            ops.native_technique()
        };

        let large_pages = if config.use_large_pages {
            let selected = caps.select_large_page(config.large_page_size).map(|alt| LargePages {
                size: alt.size,
                technique: if alt.via_anonymous_map {
                    ops.native_technique()
                } else {
                    Technique::SharedMemoryAttach
                },
            });
            match selected {
                Some(large) => tracing::info!(
                    target: "platvm::pagesize",
                    size = %describe_page_size(large.size),
                    technique = %large.technique,
                    "large pages enabled"
                ),
                None => tracing::warn!(
                    target: "platvm::pagesize",
                    requested = config.large_page_size,
                    "large pages requested but none are usable; continuing with {} pages",
                    describe_page_size(caps.base_page_size())
                ),
            }
            selected
        } else {
            None
        };

        let numa_interleaving = config.numa_interleaving && ops.supports_numa_interleaving();
        if config.numa_interleaving && !numa_interleaving {
            tracing::warn!(
                target: "platvm::map",
                "NUMA interleaving requested but {} cannot place memory per node; committing without it",
                ops.name()
            );
        }

        Self {
            program_break: ops.program_break(),
            numa_interleaving,
            strategies: Strategies::new(&ops),
            ops,
            config,
            caps,
            ledger: Ledger::new(),
            default_technique,
            large_pages,
            counters: VmCounters::default(),
        }
    }

    /// Instance over the running OS.
    pub fn platform(config: VmConfig) -> Self {
        Self::new(Arc::new(PlatformVmOps::new()), config)
    }

    /// Process-wide instance, configured from the environment on first use.
    pub fn global() -> &'static VirtualMemory {
        GLOBAL.get_or_init(|| Self::platform(VmConfig::from_env()))
    }

    pub fn capabilities(&self) -> &MultipageCapabilities {
        &self.caps
    }

    /// Page size of ordinary reservations.
    pub fn page_size(&self) -> usize {
        self.caps.base_page_size()
    }

    /// Granularity of reservation placement.
    pub fn allocation_granularity(&self) -> usize {
        self.caps.allocation_granularity()
    }

    /// Active large page size, if large pages are enabled and usable.
    pub fn large_page_size(&self) -> Option<usize> {
        self.large_pages.map(|large| large.size)
    }

    pub fn default_technique(&self) -> Technique {
        self.default_technique
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ops(&self) -> &Arc<dyn VmOps> {
        &self.ops
    }

    pub fn stats(&self) -> VmStats {
        self.counters.snapshot()
    }

    /// Mapping containing `addr`, if any.
    pub fn find_mapping(&self, addr: usize) -> Option<OsMapping> {
        self.ledger.find_containing(addr)
    }

    /// Access rights of the page containing `addr` as reported by the OS.
    pub fn query_protection(&self, addr: usize) -> Option<Access> {
        self.ops.query_protection(addr)
    }

    // ----------------------------------------------------------------
    // Reservation
    // ----------------------------------------------------------------

    /// Reserve `size` bytes of address space, optionally at exactly
    /// `requested_addr`. Nothing is committed.
    pub fn reserve(&self, size: usize, requested_addr: Option<usize>, executable: bool) -> Result<usize, VmError> {
        let size = self.round_to_page(size)?;
        self.reserve_with(self.default_technique, requested_addr, size, self.page_size(), executable, false)
    }

    /// Reserve `size` bytes at an address that is a multiple of `alignment`.
    pub fn reserve_aligned(&self, size: usize, alignment: usize, executable: bool) -> Result<usize, VmError> {
        let size = self.round_to_page(size)?;
        let alignment = self.check_alignment(alignment)?;
        if alignment <= self.allocation_granularity() {
            return self.reserve_with(self.default_technique, None, size, self.page_size(), executable, false);
        }
        let strategy = self.strategies.get(self.default_technique);
        if strategy.supports_partial_release() {
            return self.reserve_and_trim(self.default_technique, size, alignment, executable);
        }
        let padded = size.checked_add(alignment).ok_or(VmError::SizeOverflow {
            size,
            padding: alignment,
        })?;

        // Without partial release the padded block has to go back whole and
        // the aligned address be claimed again, which can race with other
        // reservations.
        for attempt in 1..=MAX_ALIGNED_ATTEMPTS {
            let base = self.reserve_with(self.default_technique, None, padded, self.page_size(), executable, false)?;
            let aligned = base.next_multiple_of(alignment);
            self.release(base, padded)?;
            match self.reserve_with(self.default_technique, Some(aligned), size, self.page_size(), executable, false) {
                Ok(addr) => return Ok(addr),
                Err(e) if e.is_placement_failure() => {
                    tracing::debug!(target: "platvm::map", attempt, "aligned placement at {aligned:#x} lost: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Err(VmError::AlignmentRetriesExhausted {
            attempts: MAX_ALIGNED_ATTEMPTS,
        })
    }

    /// Reserve `size` bytes and back them with `file` at the same address.
    /// The file is grown to `size` bytes first.
    pub fn reserve_backed_by_file(
        &self,
        size: usize,
        file: &File,
        requested_addr: Option<usize>,
    ) -> Result<usize, VmError> {
        let size = self.round_to_page(size)?;
        let native = self.ops.native_technique();
        let addr = self.reserve_with(native, requested_addr, size, self.page_size(), false, false)?;
        self.back_with_file(addr, size, file)?;
        Ok(addr)
    }

    /// [`VirtualMemory::reserve_backed_by_file`] at an address that is a
    /// multiple of `alignment`.
    pub fn reserve_aligned_backed_by_file(
        &self,
        size: usize,
        alignment: usize,
        file: &File,
    ) -> Result<usize, VmError> {
        let size = self.round_to_page(size)?;
        let addr = self.reserve_aligned_native(size, alignment)?;
        self.back_with_file(addr, size, file)?;
        Ok(addr)
    }

    /// Reserve memory backed by large pages. The whole range is committed
    /// by the OS at once and can be released but not uncommitted.
    pub fn reserve_with_large_pages(
        &self,
        size: usize,
        alignment: usize,
        requested_addr: Option<usize>,
        executable: bool,
    ) -> Result<usize, VmError> {
        let large = self.large_pages.ok_or(VmError::LargePagesUnavailable)?;
        if size == 0 {
            return Err(VmError::InvalidRequest("zero-size reservation"));
        }
        let size = size.checked_next_multiple_of(large.size).ok_or(VmError::SizeOverflow {
            size,
            padding: large.size,
        })?;
        let alignment = self.check_alignment(alignment.max(large.size))?;

        if requested_addr.is_some() || alignment == large.size {
            let addr = self.reserve_with(large.technique, requested_addr, size, large.size, executable, true)?;
            if addr % alignment != 0 {
                self.release(addr, size)?;
                return Err(VmError::MisalignedAddress { addr, alignment });
            }
            return Ok(addr);
        }

        // Large mappings are committed, so over-reserving them to trim is
        // not an option: find an aligned hole with a plain reservation and
        // map the large pages there.
        for attempt in 1..=MAX_ALIGNED_ATTEMPTS {
            let hole = self.reserve_aligned_native(size, alignment)?;
            self.release(hole, size)?;
            match self.reserve_with(large.technique, Some(hole), size, large.size, executable, true) {
                Ok(addr) => return Ok(addr),
                Err(e) if e.is_placement_failure() => {
                    tracing::debug!(target: "platvm::map", attempt, "large page placement at {hole:#x} lost: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Err(VmError::AlignmentRetriesExhausted {
            attempts: MAX_ALIGNED_ATTEMPTS,
        })
    }

    // ----------------------------------------------------------------
    // Commit / protect / release
    // ----------------------------------------------------------------

    /// Back `[addr, addr + len)` with physical memory, read/write, or
    /// read/write/execute if `executable`. On failure nothing is rolled back.
    pub fn commit(&self, addr: usize, len: usize, executable: bool) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let mapping = self.validated(addr, len);
        let strategy = self.strategies.get(mapping.technique);

        if !mapping.committed_on_reserve {
            // Safety: the ledger confirmed the range belongs to this mapping.
            if let Err(e) = unsafe { strategy.commit(addr, len) } {
                return Err(self.commit_failed(addr, len, e));
            }
        }
        if executable {
            // Safety: as above.
            if let Err(e) = unsafe { self.ops.protect(addr, len, Protection::ReadWriteExecute) } {
                return Err(self.commit_failed(addr, len, e));
            }
        }
        if self.numa_interleaving {
            // Safety: as above.
            if let Err(e) = unsafe { self.ops.numa_interleave(addr, len) } {
                tracing::debug!(target: "platvm::map", "NUMA interleaving of {addr:#x}+{len:#x} failed: {e}");
            }
        }
        if self.config.commit_touches_pages {
            // Safety: the range was committed read/write just above.
            unsafe { self.ops.touch(addr, len, mapping.page_size) };
        }
        if !mapping.committed_on_reserve {
            self.counters.committed.add(len);
        }
        tracing::trace!(target: "platvm::map", "committed {addr:#x}+{len:#x}{}", if executable { " (exec)" } else { "" });
        Ok(())
    }

    /// [`VirtualMemory::commit`] for callers without a fallback: failure is
    /// reported as out of memory and does not return.
    pub fn commit_or_fatal(&self, addr: usize, len: usize, executable: bool, message: &str) {
        if let Err(e) = self.commit(addr, len, executable) {
            let report = match &e {
                VmError::CommitFailed(os) => FatalReport::out_of_memory(message).with_os_error(os),
                other => FatalReport::out_of_memory(format!("{message}: {other}")),
            };
            fatal(report.with_capabilities(&self.caps).with_ledger(&self.ledger));
        }
    }

    /// Return the physical backing of `[addr, addr + len)`; the range stays
    /// reserved and can be committed again.
    pub fn uncommit(&self, addr: usize, len: usize) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let mapping = self.validated(addr, len);
        if mapping.committed_on_reserve {
            return Err(VmError::UncommitFailed(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("mapping at {:#x} is committed for its lifetime", mapping.base),
            )));
        }
        // Safety: the ledger confirmed the range belongs to this mapping.
        unsafe { self.strategies.get(mapping.technique).uncommit(addr, len) }.map_err(|e| {
            tracing::debug!(target: "platvm::map", "uncommit of {addr:#x}+{len:#x} failed: {e}");
            VmError::UncommitFailed(e)
        })?;
        self.counters.committed.sub(len);
        tracing::trace!(target: "platvm::map", "uncommitted {addr:#x}+{len:#x}");
        Ok(())
    }

    /// Change the protection of `[addr, addr + len)`. Where the OS only
    /// protects committed memory and `is_committed` is false, the range is
    /// committed first.
    pub fn protect(&self, addr: usize, len: usize, prot: Protection, is_committed: bool) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let mapping = self.validated(addr, len);
        if !is_committed && !mapping.committed_on_reserve && self.ops.protect_requires_commit() {
            self.commit_or_fatal(
                addr,
                len,
                prot == Protection::ReadWriteExecute,
                "cannot commit protection page",
            );
        }
        // Safety: the ledger confirmed the range belongs to this mapping.
        unsafe { self.ops.protect(addr, len, prot) }.map_err(|e| {
            tracing::debug!(target: "platvm::map", "protect {addr:#x}+{len:#x} {prot:?} failed: {e}");
            VmError::ProtectFailed(e)
        })?;
        tracing::trace!(target: "platvm::map", "protected {addr:#x}+{len:#x} {prot:?}");
        Ok(())
    }

    /// Release `[addr, addr + len)`: a whole mapping, or a piece trimmed
    /// from either end of one. Releasing from the middle is fatal.
    ///
    /// Where the mapping's technique cannot give back part of a mapping the
    /// piece is uncommitted instead and the mapping keeps its extent.
    pub fn release(&self, addr: usize, len: usize) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let mapping = self.validated(addr, len);
        let strategy = self.strategies.get(mapping.technique);
        let whole = addr == mapping.base && len == mapping.size;
        let head = addr == mapping.base;
        let tail = addr + len == mapping.end();

        if !whole && !head && !tail {
            self.violation(LedgerViolation::MiddleRelease { addr, len, mapping });
        }

        if !whole && !strategy.supports_partial_release() {
            // Safety: the caller gives up this piece of the mapping.
            unsafe { strategy.uncommit(addr, len) }.map_err(|e| self.release_failed(addr, len, e))?;
            tracing::trace!(
                target: "platvm::map",
                "{} cannot release part of {mapping}; uncommitted {addr:#x}+{len:#x} instead",
                mapping.technique
            );
            return Ok(());
        }

        // The ledger stays locked until it has dropped the range, so a
        // concurrent reservation handed the same addresses cannot find it
        // still recorded.
        self.ledger
            .update_after(
                // Safety: the caller gives up this piece of the mapping.
                || unsafe { strategy.release(addr, len) },
                |result| match result {
                    Ok(()) => LedgerUpdate::Release { addr, len },
                    Err(_) => LedgerUpdate::Keep,
                },
            )
            .map_err(|e| self.release_failed(addr, len, e))?;
        self.counters.reserved.sub(len);
        if mapping.committed_on_reserve {
            self.counters.committed.sub(len);
        }
        if whole {
            tracing::trace!(target: "platvm::map", "released {mapping}");
        } else {
            tracing::trace!(target: "platvm::map", "trimmed {addr:#x}+{len:#x} from {mapping}");
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Internals
    // ----------------------------------------------------------------

    fn round_to_page(&self, size: usize) -> Result<usize, VmError> {
        if size == 0 {
            return Err(VmError::InvalidRequest("zero-size reservation"));
        }
        size.checked_next_multiple_of(self.page_size())
            .ok_or(VmError::SizeOverflow {
                size,
                padding: self.page_size(),
            })
    }

    fn check_alignment(&self, alignment: usize) -> Result<usize, VmError> {
        if !alignment.is_power_of_two() || alignment % self.page_size() != 0 {
            return Err(VmError::InvalidRequest(
                "alignment must be a power of two multiple of the page size",
            ));
        }
        Ok(alignment)
    }

    fn near_program_break(&self, addr: usize, size: usize) -> bool {
        let Some(brk) = self.program_break else {
            return false;
        };
        let limit = brk.saturating_add(self.config.max_expected_data_segment);
        addr < limit && addr.saturating_add(size) > brk
    }

    /// Aligned reservation made with the OS's own technique, for callers
    /// that replace the backing afterwards.
    fn reserve_aligned_native(&self, size: usize, alignment: usize) -> Result<usize, VmError> {
        let native = self.ops.native_technique();
        if native == self.default_technique {
            return self.reserve_aligned(size, alignment, false);
        }
        let alignment = self.check_alignment(alignment)?;
        self.reserve_and_trim(native, size, alignment, false)
    }

    /// Over-reserve by `alignment` and give back the unaligned head and
    /// tail. If a trim fails, whatever is left of the padded block is
    /// released before the error is returned.
    fn reserve_and_trim(
        &self,
        technique: Technique,
        size: usize,
        alignment: usize,
        executable: bool,
    ) -> Result<usize, VmError> {
        let padded = size.checked_add(alignment).ok_or(VmError::SizeOverflow {
            size,
            padding: alignment,
        })?;
        let base = self.reserve_with(technique, None, padded, self.page_size(), executable, false)?;
        let aligned = base.next_multiple_of(alignment);
        let head = aligned - base;
        let tail = padded - head - size;

        let trimmed = self
            .release(base, head)
            .and_then(|()| self.release(aligned + size, tail));
        if let Err(e) = trimmed {
            if let Some(rest) = self.ledger.find_containing(aligned) {
                if let Err(cleanup) = self.release(rest.base, rest.size) {
                    tracing::warn!(target: "platvm::map", "leaking padded reservation {rest}: {cleanup}");
                }
            }
            return Err(e);
        }
        Ok(aligned)
    }

    fn reserve_with(
        &self,
        technique: Technique,
        requested_addr: Option<usize>,
        size: usize,
        page_size: usize,
        executable: bool,
        large: bool,
    ) -> Result<usize, VmError> {
        if let Some(requested) = requested_addr {
            let granularity = self.allocation_granularity().max(page_size);
            if requested % granularity != 0 {
                return Err(VmError::MisalignedAddress {
                    addr: requested,
                    alignment: granularity,
                });
            }
            if self.near_program_break(requested, size) {
                tracing::debug!(
                    target: "platvm::map",
                    "refusing {requested:#x}+{size:#x}: too close to the program break"
                );
                return Err(VmError::NearProgramBreak { addr: requested, size });
            }
        }

        let strategy = self.strategies.get(technique);
        let request = ReserveRequest {
            requested_addr,
            size,
            page_size,
            executable,
            large,
        };
        // Safety: size is a non-zero multiple of page_size.
        let addr = match unsafe { strategy.reserve(&request) } {
            Ok(addr) => addr,
            Err(e) => {
                self.counters.failed_reservations.add(1);
                tracing::debug!(
                    target: "platvm::map",
                    "{technique} reservation of {size:#x} bytes at {requested_addr:x?} failed: {e}"
                );
                return Err(VmError::ReservationFailed(e));
            }
        };

        if let Some(requested) = requested_addr {
            if addr != requested {
                self.counters.failed_reservations.add(1);
                // Safety: the misplaced mapping was never handed out.
                if let Err(e) = unsafe { strategy.release(addr, size) } {
                    tracing::warn!(target: "platvm::map", "failed to unmap misplaced reservation at {addr:#x}: {e}");
                }
                tracing::debug!(target: "platvm::map", "reservation wanted at {requested:#x} landed at {addr:#x}");
                return Err(VmError::PlacementMismatch {
                    requested,
                    actual: addr,
                });
            }
        }

        let mapping = OsMapping {
            base: addr,
            size,
            page_size,
            technique,
            committed_on_reserve: large,
        };
        self.ledger.register(mapping);
        self.counters.reserved.add(size);
        self.counters.reservations.add(1);
        if large {
            self.counters.committed.add(size);
        }
        tracing::trace!(target: "platvm::map", "reserved {mapping}");
        Ok(addr)
    }

    fn back_with_file(&self, addr: usize, size: usize, file: &File) -> Result<(), VmError> {
        let fail = |e: io::Error| {
            tracing::debug!(target: "platvm::map", "backing {addr:#x}+{size:#x} with a file failed: {e}");
            VmError::FileMappingFailed(e)
        };
        if let Err(e) = super::vm::preallocate_file(file, size) {
            self.release(addr, size)?;
            return Err(fail(e));
        }
        // Safety: the reservation was just made and not handed out.
        match unsafe { self.ops.map_file_over(addr, size, file) } {
            Ok(mapped) if mapped == addr => {
                let old = self.ledger.replace(OsMapping {
                    base: addr,
                    size,
                    page_size: self.page_size(),
                    technique: Technique::FileMapping,
                    committed_on_reserve: true,
                });
                self.counters.committed.add(size);
                tracing::trace!(target: "platvm::map", "replaced {old} with a file view");
                Ok(())
            }
            Ok(mapped) => {
                // Safety: the stray view was never handed out.
                if let Err(e) = unsafe { self.ops.unmap_file(mapped, size) } {
                    tracing::warn!(target: "platvm::map", "failed to unmap misplaced file view at {mapped:#x}: {e}");
                }
                self.forget_lost_reservation(addr, size);
                Err(VmError::PlacementMismatch {
                    requested: addr,
                    actual: mapped,
                })
            }
            Err(e) => {
                self.forget_lost_reservation(addr, size);
                Err(fail(e))
            }
        }
    }

    /// Drop the ledger entry of a reservation the file mapping replaced or
    /// released. Where the OS replaces in place the reservation is still
    /// there and is unmapped here.
    fn forget_lost_reservation(&self, addr: usize, size: usize) {
        let unmapped = self.ledger.update_after(
            || {
                if !self.ops.supports_partial_release() {
                    return Ok(());
                }
                // Safety: the reservation was never handed out.
                unsafe { self.ops.unmap(addr, size) }
            },
            |_| LedgerUpdate::Release { addr, len: size },
        );
        if let Err(e) = unmapped {
            tracing::warn!(target: "platvm::map", "failed to unmap reservation at {addr:#x}: {e}");
        }
        self.counters.reserved.sub(size);
    }

    fn validated(&self, addr: usize, len: usize) -> OsMapping {
        self.ledger
            .check_subrange(addr, len)
            .unwrap_or_else(|violation| self.violation(violation))
    }

    fn violation(&self, violation: LedgerViolation) -> ! {
        fatal(
            FatalReport::contract(violation.to_string())
                .with_capabilities(&self.caps)
                .with_ledger(&self.ledger),
        )
    }

    fn commit_failed(&self, addr: usize, len: usize, e: io::Error) -> VmError {
        self.counters.failed_commits.add(1);
        tracing::info!(target: "platvm::map", "commit of {addr:#x}+{len:#x} failed: {e}");
        VmError::CommitFailed(e)
    }

    fn release_failed(&self, addr: usize, len: usize, e: io::Error) -> VmError {
        tracing::warn!(target: "platvm::map", "release of {addr:#x}+{len:#x} failed: {e}");
        VmError::ReleaseFailed(e)
    }
}
