use std::fs::File;
use std::io;

use thiserror::Error;

use super::ledger::Technique;

/// Huge page size constants.
pub const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;
pub const PAGE_SIZE_1GB: usize = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("requested address {requested:#x} unavailable (OS placed the mapping at {actual:#x})")]
    PlacementMismatch { requested: usize, actual: usize },
    #[error("requested address {addr:#x} is not aligned to {alignment:#x}")]
    MisalignedAddress { addr: usize, alignment: usize },
    #[error("requested range {addr:#x}+{size:#x} is too close to the program break")]
    NearProgramBreak { addr: usize, size: usize },
    #[error("no aligned placement found after {attempts} attempts")]
    AlignmentRetriesExhausted { attempts: usize },
    #[error("large pages are not available")]
    LargePagesUnavailable,
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM uncommit failed: {0}")]
    UncommitFailed(#[source] io::Error),
    #[error("VM protect failed: {0}")]
    ProtectFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("file mapping failed: {0}")]
    FileMappingFailed(#[source] io::Error),
    #[error("size {size:#x} overflows when padded by {padding:#x}")]
    SizeOverflow { size: usize, padding: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl VmError {
    /// True for failures where the caller may retry at a different address
    /// or fall back to OS-chosen placement.
    #[must_use]
    pub fn is_placement_failure(&self) -> bool {
        matches!(
            self,
            VmError::ReservationFailed(_)
                | VmError::PlacementMismatch { .. }
                | VmError::MisalignedAddress { .. }
                | VmError::NearProgramBreak { .. }
        )
    }
}

/// Page protection requested by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
    ReadWriteExecute,
}

/// Access rights observed on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    pub const NONE: Access = Access {
        read: false,
        write: false,
        execute: false,
    };
    pub const READ_WRITE: Access = Access {
        read: true,
        write: true,
        execute: false,
    };

    #[must_use]
    pub fn is_none(self) -> bool {
        !self.read && !self.write && !self.execute
    }
}

impl From<Protection> for Access {
    fn from(prot: Protection) -> Self {
        match prot {
            Protection::None => Access::NONE,
            Protection::Read => Access {
                read: true,
                write: false,
                execute: false,
            },
            Protection::ReadWrite => Access::READ_WRITE,
            Protection::ReadWriteExecute => Access {
                read: true,
                write: true,
                execute: true,
            },
        }
    }
}

/// Raw virtual memory primitives of one operating system.
///
/// Addresses are plain `usize` values. Nothing at this layer consults the
/// ledger; callers are responsible for only touching ranges they own.
/// Policy (validation, alignment loops, bookkeeping) lives above this
/// trait in [`super::region::VirtualMemory`] and the strategies in
/// [`super::strategy`].
pub trait VmOps: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// OS base page size.
    fn page_size(&self) -> io::Result<usize>;

    /// Granularity at which reservations are placed. Equal to the page size
    /// except on Windows (64K).
    fn allocation_granularity(&self, page_size: usize) -> usize {
        page_size
    }

    /// Page sizes the OS claims to support beyond the base page size.
    /// Claims are not verified here; see [`super::page_size::probe`].
    fn candidate_page_sizes(&self) -> Vec<usize>;

    /// Technique used for ordinary reservations on this OS.
    fn native_technique(&self) -> Technique;

    /// Whether System V style shared memory segments can be attached.
    fn supports_shared_memory(&self) -> bool {
        false
    }

    /// Whether a sub-range of a reservation can be returned to the OS
    /// while the rest stays mapped.
    fn supports_partial_release(&self) -> bool {
        true
    }

    /// Whether protection can only be changed on committed memory.
    fn protect_requires_commit(&self) -> bool {
        false
    }

    /// Program break recorded when the backend was created, if the OS has one.
    fn program_break(&self) -> Option<usize> {
        None
    }

    /// Whether [`VmOps::numa_interleave`] can place memory across nodes.
    fn supports_numa_interleaving(&self) -> bool {
        false
    }

    /// Page size actually backing `addr`, when the OS can report it.
    fn query_page_size_at(&self, addr: usize) -> Option<usize>;

    /// Current access rights of the page containing `addr`; `None` if the
    /// address is unmapped or the OS cannot report it.
    fn query_protection(&self, addr: usize) -> Option<Access>;

    /// Reserve address space without committing it. `requested` is a
    /// placement request that must never clobber existing mappings; the
    /// returned address may differ from it.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of the page size.
    unsafe fn map_reserve(&self, requested: Option<usize>, size: usize, executable: bool) -> io::Result<usize>;

    /// Map memory backed by `page_size` pages. The region is committed
    /// immediately and cannot be partially committed later.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of `page_size`.
    unsafe fn map_large(
        &self,
        requested: Option<usize>,
        size: usize,
        page_size: usize,
        executable: bool,
    ) -> io::Result<usize>;

    /// Create, attach and immediately mark for removal a shared memory
    /// segment of `size` bytes backed by `page_size` pages.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of `page_size`.
    unsafe fn shm_attach(&self, requested: Option<usize>, size: usize, page_size: usize) -> io::Result<usize> {
        let _ = (requested, size, page_size);
        Err(io::Error::new(io::ErrorKind::Unsupported, "shared memory is not supported"))
    }

    /// Detach a segment attached by [`VmOps::shm_attach`].
    ///
    /// # Safety
    /// `addr` must be the start of a live attachment.
    unsafe fn shm_detach(&self, addr: usize) -> io::Result<()> {
        let _ = addr;
        Err(io::Error::new(io::ErrorKind::Unsupported, "shared memory is not supported"))
    }

    /// Return the physical backing of part of a shared memory segment.
    ///
    /// # Safety
    /// The range must lie inside a live attachment.
    unsafe fn shm_decommit(&self, addr: usize, size: usize) -> io::Result<()> {
        let _ = (addr, size);
        Err(io::Error::new(io::ErrorKind::Unsupported, "shared memory is not supported"))
    }

    /// Release address space. On OSes without partial release `addr` must
    /// be the start of the reservation and the whole reservation goes.
    ///
    /// # Safety
    /// The range must not be referenced afterwards.
    unsafe fn unmap(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Back a reserved range with physical memory, read/write.
    ///
    /// # Safety
    /// The range must lie inside a live reservation.
    unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Return physical memory, keeping the range reserved and inaccessible.
    ///
    /// # Safety
    /// The range must lie inside a live reservation.
    unsafe fn decommit(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Change page protection.
    ///
    /// # Safety
    /// The range must lie inside a live mapping.
    unsafe fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()>;

    /// Replace the reservation at `addr` with a shared mapping of `file`.
    /// On POSIX the replacement is atomic; on Windows the reservation is
    /// released first and the view mapped afterwards, leaving a window in
    /// which the range is unbacked.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be a live reservation owned by the caller.
    unsafe fn map_file_over(&self, addr: usize, size: usize, file: &File) -> io::Result<usize>;

    /// Unmap a file view created by [`VmOps::map_file_over`].
    ///
    /// # Safety
    /// The range must not be referenced afterwards.
    unsafe fn unmap_file(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Touch one byte per `stride` bytes to force the OS to back the range.
    ///
    /// # Safety
    /// The range must be committed and writable.
    unsafe fn touch(&self, addr: usize, size: usize, stride: usize);

    /// Interleave the physical backing of the range across NUMA nodes.
    ///
    /// # Safety
    /// The range must lie inside a live mapping.
    unsafe fn numa_interleave(&self, addr: usize, size: usize) -> io::Result<()> {
        let _ = (addr, size);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} cannot interleave memory across NUMA nodes", self.name()),
        ))
    }
}

/// Make sure `file` holds at least `size` bytes of storage.
pub(crate) fn preallocate_file(file: &File, size: usize) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let len = libc::off_t::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file size exceeds off_t"))?;
        // Safety: FFI call on a descriptor borrowed from a live File.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let current = file.metadata()?.len();
        if current < size as u64 {
            file.set_len(size as u64)?;
        }
        Ok(())
    }
}

/// Touch pages without changing their contents. An atomic add of zero is a
/// write as far as the MMU is concerned and cannot race with other writers.
///
/// # Safety
/// The range must be committed and writable.
unsafe fn pretouch(addr: usize, size: usize, stride: usize) {
    // OS memory, not a loom-modelled location.
    use std::sync::atomic::{AtomicU8, Ordering};
    let stride = stride.max(1);
    let mut offset = 0;
    while offset < size {
        // Safety: upheld by caller; AtomicU8 has alignment 1.
        unsafe { (*((addr + offset) as *const AtomicU8)).fetch_add(0, Ordering::Relaxed) };
        offset += stride;
    }
}

pub struct PlatformVmOps {
    #[allow(dead_code)]
    program_break: Option<usize>,
}

impl PlatformVmOps {
    /// Create the backend for the running OS, recording the program break.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program_break: current_program_break(),
        }
    }
}

impl Default for PlatformVmOps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn current_program_break() -> Option<usize> {
    // Safety: sbrk(0) only queries the current break.
    let brk = unsafe { libc::sbrk(0) };
    if brk as isize == -1 {
        None
    } else {
        Some(brk as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn current_program_break() -> Option<usize> {
    None
}

#[cfg(unix)]
mod unix {
    use super::{pretouch, Access, File, PlatformVmOps, Protection, Technique, VmOps};
    use std::io;

    fn prot_flags(prot: Protection) -> libc::c_int {
        match prot {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    fn mmap_result(ptr: *mut libc::c_void) -> io::Result<usize> {
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as usize)
        }
    }

    fn hint_ptr(requested: Option<usize>) -> *mut libc::c_void {
        requested.map_or(std::ptr::null_mut(), |a| a as *mut libc::c_void)
    }

    // ----------------------------------------------------------------
    // Large page mapping: platform-specific helpers
    // ----------------------------------------------------------------

    /// Linux: MAP_HUGETLB with log2 of the page size encoded in the upper
    /// bits of flags. Requires pre-allocated hugetlb pages.
    #[cfg(target_os = "linux")]
    unsafe fn map_large_impl(
        requested: Option<usize>,
        size: usize,
        page_size: usize,
        executable: bool,
    ) -> io::Result<usize> {
        const MAP_HUGE_SHIFT: libc::c_int = 26;
        let huge_flag = libc::MAP_HUGETLB | ((page_size.trailing_zeros() as libc::c_int) << MAP_HUGE_SHIFT);
        let prot = if executable {
            prot_flags(Protection::ReadWriteExecute)
        } else {
            prot_flags(Protection::ReadWrite)
        };
        // Safety: FFI call to mmap; never MAP_FIXED, so nothing is clobbered.
        mmap_result(unsafe {
            libc::mmap(
                hint_ptr(requested),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | huge_flag,
                -1,
                0,
            )
        })
    }

    /// macOS Intel (x86_64): XNU superpages via mmap flag (2MB only).
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    unsafe fn map_large_impl(
        requested: Option<usize>,
        size: usize,
        page_size: usize,
        executable: bool,
    ) -> io::Result<usize> {
        const SUPERPAGE_2MB: libc::c_int = 1 << 16;
        if page_size != super::PAGE_SIZE_2MB {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("macOS x86_64 only supports 2MB superpages, requested {page_size}"),
            ));
        }
        let prot = if executable {
            prot_flags(Protection::ReadWriteExecute)
        } else {
            prot_flags(Protection::ReadWrite)
        };
        // Safety: FFI call to mmap.
        mmap_result(unsafe {
            libc::mmap(
                hint_ptr(requested),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANON | SUPERPAGE_2MB,
                -1,
                0,
            )
        })
    }

    #[cfg(not(any(target_os = "linux", all(target_os = "macos", target_arch = "x86_64"))))]
    unsafe fn map_large_impl(
        _requested: Option<usize>,
        _size: usize,
        page_size: usize,
        _executable: bool,
    ) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no dynamic large page mechanism for {page_size} byte pages on this OS"),
        ))
    }

    // ----------------------------------------------------------------
    // Page size probing: platform-specific helpers
    // ----------------------------------------------------------------

    /// Linux: probe /sys/kernel/mm/hugepages/ for kernel-supported huge page
    /// sizes. Directory names are "hugepages-NkB" where N is the size in KiB.
    #[cfg(target_os = "linux")]
    fn probe_candidate_page_sizes() -> Vec<usize> {
        let mut sizes = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/sys/kernel/mm/hugepages") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(kb) = name
                    .strip_prefix("hugepages-")
                    .and_then(|s| s.strip_suffix("kB"))
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    sizes.push(kb * 1024);
                }
            }
        }
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    fn probe_candidate_page_sizes() -> Vec<usize> {
        vec![super::PAGE_SIZE_2MB]
    }

    #[cfg(not(any(target_os = "linux", all(target_os = "macos", target_arch = "x86_64"))))]
    fn probe_candidate_page_sizes() -> Vec<usize> {
        Vec::new()
    }

    /// Parse the `start-end` column of a /proc/self/maps style header line.
    #[cfg(target_os = "linux")]
    fn parse_range(line: &str) -> Option<(usize, usize, &str)> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        Some((start, end, perms))
    }

    #[cfg(target_os = "linux")]
    fn kernel_page_size(addr: usize) -> Option<usize> {
        let smaps = std::fs::read_to_string("/proc/self/smaps").ok()?;
        let mut inside = false;
        for line in smaps.lines() {
            // Mapping header lines start with "start-end"; attribute lines
            // start with "Name:" and never parse as a range.
            if let Some((start, end, _)) = parse_range(line) {
                inside = start <= addr && addr < end;
                continue;
            }
            if inside {
                if let Some(rest) = line.strip_prefix("KernelPageSize:") {
                    let kb = rest.trim().strip_suffix("kB")?.trim().parse::<usize>().ok()?;
                    return Some(kb * 1024);
                }
            }
        }
        None
    }

    #[cfg(target_os = "linux")]
    fn mapped_access(addr: usize) -> Option<Access> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        maps.lines()
            .filter_map(parse_range)
            .find(|&(start, end, _)| start <= addr && addr < end)
            .map(|(_, _, perms)| {
                let perms = perms.as_bytes();
                Access {
                    read: perms.first() == Some(&b'r'),
                    write: perms.get(1) == Some(&b'w'),
                    execute: perms.get(2) == Some(&b'x'),
                }
            })
    }

    /// Online NUMA nodes as a bit mask, from /sys/devices/system/node/online
    /// (e.g. "0-1,4").
    #[cfg(target_os = "linux")]
    fn online_numa_nodes() -> u64 {
        let Ok(online) = std::fs::read_to_string("/sys/devices/system/node/online") else {
            return 1;
        };
        let mut mask = 0u64;
        for part in online.trim().split(',') {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo.parse::<u32>(), hi.parse::<u32>()),
                None => (part.parse::<u32>(), part.parse::<u32>()),
            };
            if let (Ok(lo), Ok(hi)) = (lo, hi) {
                for node in lo..=hi.min(63) {
                    mask |= 1 << node;
                }
            }
        }
        if mask == 0 {
            1
        } else {
            mask
        }
    }

    impl VmOps for PlatformVmOps {
        fn name(&self) -> &'static str {
            "posix"
        }

        fn page_size(&self) -> io::Result<usize> {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw)
                .ok()
                .filter(|&size| size > 0)
                .ok_or_else(io::Error::last_os_error)
        }

        fn candidate_page_sizes(&self) -> Vec<usize> {
            probe_candidate_page_sizes()
        }

        fn native_technique(&self) -> Technique {
            Technique::AnonymousMap
        }

        fn supports_shared_memory(&self) -> bool {
            cfg!(target_os = "linux")
        }

        fn supports_numa_interleaving(&self) -> bool {
            cfg!(target_os = "linux")
        }

        fn program_break(&self) -> Option<usize> {
            self.program_break
        }

        fn query_page_size_at(&self, addr: usize) -> Option<usize> {
            #[cfg(target_os = "linux")]
            {
                kernel_page_size(addr)
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = addr;
                None
            }
        }

        fn query_protection(&self, addr: usize) -> Option<Access> {
            #[cfg(target_os = "linux")]
            {
                mapped_access(addr)
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = addr;
                None
            }
        }

        unsafe fn map_reserve(&self, requested: Option<usize>, size: usize, executable: bool) -> io::Result<usize> {
            #[allow(unused_mut)]
            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
            // Never clobber: with MAP_FIXED_NOREPLACE the kernel fails with
            // EEXIST; older kernels treat it as a hint and the caller
            // detects the relocation.
            #[cfg(target_os = "linux")]
            if requested.is_some() {
                flags |= libc::MAP_FIXED_NOREPLACE;
            }
            // Execute permission is granted at commit time.
            let _ = executable;
            // Reserved pages are PROT_NONE so touching uncommitted memory
            // faults instead of silently succeeding.
            // Safety: FFI call to mmap.
            mmap_result(unsafe { libc::mmap(hint_ptr(requested), size, libc::PROT_NONE, flags, -1, 0) })
        }

        unsafe fn map_large(
            &self,
            requested: Option<usize>,
            size: usize,
            page_size: usize,
            executable: bool,
        ) -> io::Result<usize> {
            // Safety: forwarded preconditions.
            unsafe { map_large_impl(requested, size, page_size, executable) }
        }

        #[cfg(target_os = "linux")]
        unsafe fn shm_attach(&self, requested: Option<usize>, size: usize, page_size: usize) -> io::Result<usize> {
            const SHM_HUGE_SHIFT: libc::c_int = 26;
            let mut flags = libc::IPC_CREAT | 0o600;
            if self.page_size().is_ok_and(|base| page_size > base) {
                flags |= libc::SHM_HUGETLB | ((page_size.trailing_zeros() as libc::c_int) << SHM_HUGE_SHIFT);
            }
            // Safety: FFI call to shmget.
            let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, flags) };
            if shmid == -1 {
                return Err(io::Error::last_os_error());
            }

            // From here on nothing may return before IPC_RMID: System V
            // segments are global and would outlive the process.
            // Deliberately no SHM_RND: attach exactly at `requested` or fail.
            // Safety: FFI call to shmat.
            let addr = unsafe { libc::shmat(shmid, hint_ptr(requested).cast_const(), 0) };
            let attach_error = io::Error::last_os_error();

            // Safety: FFI call to shmctl.
            if unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
                tracing::warn!(
                    target: "platvm::map",
                    "shmctl({shmid}, IPC_RMID) failed: {}",
                    io::Error::last_os_error()
                );
            }

            if addr as isize == -1 {
                return Err(attach_error);
            }
            Ok(addr as usize)
        }

        #[cfg(target_os = "linux")]
        unsafe fn shm_detach(&self, addr: usize) -> io::Result<()> {
            // Safety: FFI call to shmdt.
            if unsafe { libc::shmdt(addr as *const libc::c_void) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        #[cfg(target_os = "linux")]
        unsafe fn shm_decommit(&self, addr: usize, size: usize) -> io::Result<()> {
            // MADV_REMOVE frees the shmem backing store of the range; later
            // touches fault in fresh zero pages.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_REMOVE) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot_flags(Protection::ReadWrite)) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn decommit(&self, addr: usize, size: usize) -> io::Result<()> {
            // Linux: MADV_DONTNEED drops the pages immediately and guarantees
            // zero-fill on recommit. macOS: MADV_FREE is the cheapest
            // available decommit. Either way PROT_NONE afterwards so stray
            // accesses fault.
            #[cfg(target_os = "linux")]
            let advice = libc::MADV_DONTNEED;
            #[cfg(not(target_os = "linux"))]
            let advice = libc::MADV_FREE;
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(addr as *mut libc::c_void, size, advice) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()> {
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot_flags(prot)) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn map_file_over(&self, addr: usize, size: usize, file: &File) -> io::Result<usize> {
            use std::os::unix::io::AsRawFd;
            // MAP_FIXED atomically replaces the anonymous reservation.
            // Safety: FFI call to mmap over a range owned by the caller.
            mmap_result(unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    file.as_raw_fd(),
                    0,
                )
            })
        }

        unsafe fn unmap_file(&self, addr: usize, size: usize) -> io::Result<()> {
            // Safety: forwarded preconditions.
            unsafe { self.unmap(addr, size) }
        }

        unsafe fn touch(&self, addr: usize, size: usize, stride: usize) {
            // Safety: forwarded preconditions.
            unsafe { pretouch(addr, size, stride) }
        }

        #[cfg(target_os = "linux")]
        unsafe fn numa_interleave(&self, addr: usize, size: usize) -> io::Result<()> {
            const MPOL_INTERLEAVE: libc::c_long = 3;
            let nodes = online_numa_nodes();
            if nodes.count_ones() <= 1 {
                return Ok(());
            }
            // Safety: raw mbind syscall; the node mask outlives the call.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    addr as *mut libc::c_void,
                    size,
                    MPOL_INTERLEAVE,
                    &nodes as *const u64,
                    65usize,
                    0u32,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{pretouch, Access, File, PlatformVmOps, Protection, Technique, VmOps};
    use std::ffi::c_void;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use crate::sync::OnceLock;
    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_NOT_ALL_ASSIGNED, HANDLE, LUID};
    use windows_sys::Win32::Security::{
        AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES,
        TOKEN_PRIVILEGES, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, GetLargePageMinimum, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree,
        VirtualProtect, VirtualQuery, FILE_MAP_WRITE, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
        MEM_COMMIT, MEM_DECOMMIT, MEM_LARGE_PAGES, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
        PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    static LOCK_MEMORY_PRIVILEGE: OnceLock<Result<(), String>> = OnceLock::new();

    /// Enable `SeLockMemoryPrivilege` on the process token, which
    /// `MEM_LARGE_PAGES` requires. Attempted once per process.
    fn lock_memory_privilege() -> &'static Result<(), String> {
        LOCK_MEMORY_PRIVILEGE.get_or_init(|| {
            let name: Vec<u16> = "SeLockMemoryPrivilege".encode_utf16().chain(Some(0)).collect();
            // Safety: FFI calls on a token handle owned by this block and
            // closed before it ends.
            unsafe {
                let mut token: HANDLE = std::ptr::null_mut();
                if OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY, &mut token) == 0 {
                    return Err(format!("OpenProcessToken: {}", io::Error::last_os_error()));
                }
                let mut luid: LUID = std::mem::zeroed();
                let result = if LookupPrivilegeValueW(std::ptr::null(), name.as_ptr(), &mut luid) == 0 {
                    Err(format!("LookupPrivilegeValueW: {}", io::Error::last_os_error()))
                } else {
                    let privileges = TOKEN_PRIVILEGES {
                        PrivilegeCount: 1,
                        Privileges: [LUID_AND_ATTRIBUTES {
                            Luid: luid,
                            Attributes: SE_PRIVILEGE_ENABLED,
                        }],
                    };
                    let adjusted = AdjustTokenPrivileges(
                        token,
                        0,
                        &privileges,
                        0,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                    );
                    // Succeeds without assigning when the account lacks the right.
                    if adjusted == 0 {
                        Err(format!("AdjustTokenPrivileges: {}", io::Error::last_os_error()))
                    } else if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
                        Err("the account does not hold the Lock pages in memory right".to_string())
                    } else {
                        Ok(())
                    }
                };
                CloseHandle(token);
                result
            }
        })
    }

    fn page_flags(prot: Protection) -> PAGE_PROTECTION_FLAGS {
        match prot {
            Protection::None => PAGE_NOACCESS,
            Protection::Read => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        }
    }

    fn system_info() -> SYSTEM_INFO {
        // Safety: FFI call filling a zeroed out-parameter.
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        }
    }

    fn alloc_result(ptr: *mut c_void) -> io::Result<usize> {
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as usize)
        }
    }

    fn requested_ptr(requested: Option<usize>) -> *const c_void {
        requested.map_or(std::ptr::null(), |a| a as *const c_void)
    }

    impl VmOps for PlatformVmOps {
        fn name(&self) -> &'static str {
            "windows"
        }

        fn page_size(&self) -> io::Result<usize> {
            Ok(system_info().dwPageSize as usize)
        }

        fn allocation_granularity(&self, _page_size: usize) -> usize {
            system_info().dwAllocationGranularity as usize
        }

        fn candidate_page_sizes(&self) -> Vec<usize> {
            // Windows only supports one large page size.
            // Safety: FFI call without arguments.
            let large = unsafe { GetLargePageMinimum() };
            if large == 0 {
                return Vec::new();
            }
            if let Err(e) = lock_memory_privilege() {
                tracing::info!(
                    target: "platvm::pagesize",
                    size = large,
                    "large pages unusable: cannot enable SeLockMemoryPrivilege: {e}"
                );
                return Vec::new();
            }
            vec![large]
        }

        fn native_technique(&self) -> Technique {
            Technique::VirtualAlloc
        }

        fn supports_partial_release(&self) -> bool {
            false
        }

        fn protect_requires_commit(&self) -> bool {
            true
        }

        fn query_page_size_at(&self, _addr: usize) -> Option<usize> {
            None
        }

        fn query_protection(&self, addr: usize) -> Option<Access> {
            // Safety: FFI call filling a zeroed out-parameter.
            let info = unsafe {
                let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
                let written = VirtualQuery(
                    addr as *const c_void,
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                );
                if written == 0 {
                    return None;
                }
                info
            };
            if info.State == MEM_RESERVE {
                return Some(Access::NONE);
            }
            if info.State != MEM_COMMIT {
                return None;
            }
            if info.Protect & PAGE_GUARD != 0 {
                return Some(Access::NONE);
            }
            let access = match info.Protect & 0xff {
                PAGE_READONLY => Access {
                    read: true,
                    write: false,
                    execute: false,
                },
                PAGE_READWRITE | PAGE_WRITECOPY => Access::READ_WRITE,
                PAGE_EXECUTE_READ => Access {
                    read: true,
                    write: false,
                    execute: true,
                },
                PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Access {
                    read: true,
                    write: true,
                    execute: true,
                },
                _ => Access::NONE,
            };
            Some(access)
        }

        unsafe fn map_reserve(&self, requested: Option<usize>, size: usize, _executable: bool) -> io::Result<usize> {
            // Safety: FFI call to VirtualAlloc; MEM_RESERVE never replaces
            // an existing allocation.
            alloc_result(unsafe { VirtualAlloc(requested_ptr(requested), size, MEM_RESERVE, PAGE_READWRITE) })
        }

        unsafe fn map_large(
            &self,
            requested: Option<usize>,
            size: usize,
            _page_size: usize,
            executable: bool,
        ) -> io::Result<usize> {
            if let Err(e) = lock_memory_privilege() {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, e.clone()));
            }
            let prot = if executable { PAGE_EXECUTE_READWRITE } else { PAGE_READWRITE };
            // MEM_LARGE_PAGES must be combined with MEM_RESERVE | MEM_COMMIT.
            // Safety: FFI call to VirtualAlloc.
            alloc_result(unsafe {
                VirtualAlloc(
                    requested_ptr(requested),
                    size,
                    MEM_RESERVE | MEM_COMMIT | MEM_LARGE_PAGES,
                    prot,
                )
            })
        }

        unsafe fn unmap(&self, addr: usize, _size: usize) -> io::Result<()> {
            // MEM_RELEASE must be given size 0 and the allocation base.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
            // Safety: FFI call to VirtualAlloc.
            alloc_result(unsafe { VirtualAlloc(addr as *const c_void, size, MEM_COMMIT, PAGE_READWRITE) }).map(drop)
        }

        unsafe fn decommit(&self, addr: usize, size: usize) -> io::Result<()> {
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(addr as *mut c_void, size, MEM_DECOMMIT) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()> {
            let mut old: PAGE_PROTECTION_FLAGS = 0;
            // Safety: FFI call to VirtualProtect.
            if unsafe { VirtualProtect(addr as *const c_void, size, page_flags(prot), &mut old) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn map_file_over(&self, addr: usize, size: usize, file: &File) -> io::Result<usize> {
            // Windows cannot replace a reservation in place: release it and
            // map the view at the vacated address.
            // Safety: forwarded preconditions.
            unsafe { self.unmap(addr, size)? };
            let size64 = size as u64;
            // Safety: FFI calls on a handle borrowed from a live File.
            unsafe {
                let mapping = CreateFileMappingW(
                    file.as_raw_handle() as HANDLE,
                    std::ptr::null(),
                    PAGE_READWRITE,
                    (size64 >> 32) as u32,
                    (size64 & 0xFFFF_FFFF) as u32,
                    std::ptr::null(),
                );
                if mapping.is_null() {
                    return Err(io::Error::last_os_error());
                }
                let view = MapViewOfFileEx(mapping, FILE_MAP_WRITE, 0, 0, size, addr as *const c_void);
                let error = io::Error::last_os_error();
                CloseHandle(mapping);
                if view.Value.is_null() {
                    return Err(error);
                }
                Ok(view.Value as usize)
            }
        }

        unsafe fn unmap_file(&self, addr: usize, _size: usize) -> io::Result<()> {
            let view = MEMORY_MAPPED_VIEW_ADDRESS {
                Value: addr as *mut c_void,
            };
            // Safety: FFI call to UnmapViewOfFile.
            if unsafe { UnmapViewOfFile(view) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn touch(&self, addr: usize, size: usize, stride: usize) {
            // Safety: forwarded preconditions.
            unsafe { pretouch(addr, size, stride) }
        }
    }

}
