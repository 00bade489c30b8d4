//! Reservation strategies: one object per OS mechanism, each knowing which
//! primitives reserve, commit, uncommit and release memory made with it.
//! [`super::region::VirtualMemory`] picks a strategy per mapping from the
//! mapping's [`Technique`] and never branches on the OS itself.

use std::io;
use std::sync::Arc;

use super::ledger::Technique;
use super::vm::VmOps;

/// Placement and backing of one reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveRequest {
    pub requested_addr: Option<usize>,
    pub size: usize,
    pub page_size: usize,
    pub executable: bool,
    /// Back with `page_size` pages committed up front.
    pub large: bool,
}

pub trait ReservationStrategy: Send + Sync {
    fn technique(&self) -> Technique;

    /// Whether part of a mapping can be returned to the OS.
    fn supports_partial_release(&self) -> bool;

    /// # Safety
    /// `request.size` must be a non-zero multiple of `request.page_size`.
    unsafe fn reserve(&self, request: &ReserveRequest) -> io::Result<usize>;

    /// # Safety
    /// The range must lie inside a mapping made by this strategy.
    unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()>;

    /// # Safety
    /// The range must lie inside a mapping made by this strategy.
    unsafe fn uncommit(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Release `[addr, addr + size)`. Only whole mappings unless
    /// [`ReservationStrategy::supports_partial_release`].
    ///
    /// # Safety
    /// The range must not be referenced afterwards.
    unsafe fn release(&self, addr: usize, size: usize) -> io::Result<()>;
}

fn unsupported(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what)
}

/// POSIX anonymous `mmap`: reserve `PROT_NONE`, commit by protection change.
pub struct AnonymousMap {
    ops: Arc<dyn VmOps>,
}

impl AnonymousMap {
    pub fn new(ops: Arc<dyn VmOps>) -> Self {
        Self { ops }
    }
}

impl ReservationStrategy for AnonymousMap {
    fn technique(&self) -> Technique {
        Technique::AnonymousMap
    }

    fn supports_partial_release(&self) -> bool {
        self.ops.supports_partial_release()
    }

    unsafe fn reserve(&self, request: &ReserveRequest) -> io::Result<usize> {
        // Safety: forwarded preconditions.
        unsafe {
            if request.large {
                self.ops.map_large(
                    request.requested_addr,
                    request.size,
                    request.page_size,
                    request.executable,
                )
            } else {
                self.ops
                    .map_reserve(request.requested_addr, request.size, request.executable)
            }
        }
    }

    unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.commit(addr, size) }
    }

    unsafe fn uncommit(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.decommit(addr, size) }
    }

    unsafe fn release(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.unmap(addr, size) }
    }
}

/// System V shared memory. Segments are committed on first touch, so commit
/// is a no-op; uncommit frees the backing store; only whole segments can be
/// detached.
pub struct SharedMemoryAttach {
    ops: Arc<dyn VmOps>,
}

impl SharedMemoryAttach {
    pub fn new(ops: Arc<dyn VmOps>) -> Self {
        Self { ops }
    }
}

impl ReservationStrategy for SharedMemoryAttach {
    fn technique(&self) -> Technique {
        Technique::SharedMemoryAttach
    }

    fn supports_partial_release(&self) -> bool {
        false
    }

    unsafe fn reserve(&self, request: &ReserveRequest) -> io::Result<usize> {
        // Safety: forwarded preconditions.
        unsafe {
            self.ops
                .shm_attach(request.requested_addr, request.size, request.page_size)
        }
    }

    unsafe fn commit(&self, _addr: usize, _size: usize) -> io::Result<()> {
        Ok(())
    }

    unsafe fn uncommit(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.shm_decommit(addr, size) }
    }

    unsafe fn release(&self, addr: usize, _size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.shm_detach(addr) }
    }
}

/// Windows `VirtualAlloc`: separate reserve and commit, whole-reservation
/// release only.
pub struct VirtualAlloc {
    ops: Arc<dyn VmOps>,
}

impl VirtualAlloc {
    pub fn new(ops: Arc<dyn VmOps>) -> Self {
        Self { ops }
    }
}

impl ReservationStrategy for VirtualAlloc {
    fn technique(&self) -> Technique {
        Technique::VirtualAlloc
    }

    fn supports_partial_release(&self) -> bool {
        false
    }

    unsafe fn reserve(&self, request: &ReserveRequest) -> io::Result<usize> {
        // Safety: forwarded preconditions.
        unsafe {
            if request.large {
                self.ops.map_large(
                    request.requested_addr,
                    request.size,
                    request.page_size,
                    request.executable,
                )
            } else {
                self.ops
                    .map_reserve(request.requested_addr, request.size, request.executable)
            }
        }
    }

    unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.commit(addr, size) }
    }

    unsafe fn uncommit(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.decommit(addr, size) }
    }

    unsafe fn release(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.unmap(addr, size) }
    }
}

/// Shared file views. They are created by replacing an existing reservation
/// (see [`super::region::VirtualMemory::reserve_backed_by_file`]), are
/// backed by the file from the start, and cannot be uncommitted.
pub struct FileMapping {
    ops: Arc<dyn VmOps>,
}

impl FileMapping {
    pub fn new(ops: Arc<dyn VmOps>) -> Self {
        Self { ops }
    }
}

impl ReservationStrategy for FileMapping {
    fn technique(&self) -> Technique {
        Technique::FileMapping
    }

    fn supports_partial_release(&self) -> bool {
        self.ops.supports_partial_release()
    }

    unsafe fn reserve(&self, _request: &ReserveRequest) -> io::Result<usize> {
        Err(unsupported("file mappings replace an existing reservation"))
    }

    unsafe fn commit(&self, _addr: usize, _size: usize) -> io::Result<()> {
        Ok(())
    }

    unsafe fn uncommit(&self, _addr: usize, _size: usize) -> io::Result<()> {
        Err(unsupported("file-backed memory cannot be uncommitted"))
    }

    unsafe fn release(&self, addr: usize, size: usize) -> io::Result<()> {
        // Safety: forwarded preconditions.
        unsafe { self.ops.unmap_file(addr, size) }
    }
}

/// One instance of every strategy over the same backend.
pub(crate) struct Strategies {
    anonymous: AnonymousMap,
    shared: SharedMemoryAttach,
    virtual_alloc: VirtualAlloc,
    file: FileMapping,
}

impl Strategies {
    pub fn new(ops: &Arc<dyn VmOps>) -> Self {
        Self {
            anonymous: AnonymousMap::new(Arc::clone(ops)),
            shared: SharedMemoryAttach::new(Arc::clone(ops)),
            virtual_alloc: VirtualAlloc::new(Arc::clone(ops)),
            file: FileMapping::new(Arc::clone(ops)),
        }
    }

    pub fn get(&self, technique: Technique) -> &dyn ReservationStrategy {
        match technique {
            Technique::AnonymousMap => &self.anonymous,
            Technique::SharedMemoryAttach => &self.shared,
            Technique::VirtualAlloc => &self.virtual_alloc,
            Technique::FileMapping => &self.file,
        }
    }
}
