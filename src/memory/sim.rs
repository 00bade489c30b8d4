//! Deterministic in-process stand-in for the OS.
//!
//! `SimulatedVmOps` never touches real memory. It keeps its own map of
//! regions with per-page commit, protection and touch state, counts every
//! call, and can be configured to behave like the awkward corners of real
//! systems: ignored placement requests, no partial release, page sizes that
//! silently fall back, failing commits. Loom tests and the property tests
//! run on it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;

use fixedbitset::FixedBitSet;

use super::ledger::Technique;
use super::vm::{Access, Protection, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{lock, Mutex};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub page_size: usize,
    pub allocation_granularity: usize,
    /// Sizes reported by `candidate_page_sizes`.
    pub claimed_page_sizes: Vec<usize>,
    /// Sizes `map_large` actually succeeds with.
    pub large_page_sizes: Vec<usize>,
    /// Sizes above the base page that `shm_attach` succeeds with.
    pub shm_page_sizes: Vec<usize>,
    pub shared_memory: bool,
    /// Large mappings succeed but are backed (and reported) as base pages.
    pub silent_fallback: bool,
    pub partial_release: bool,
    pub protect_requires_commit: bool,
    /// When false, placement requests are treated as hints and ignored,
    /// as an OS without a no-clobber fixed mapping flag would.
    pub honor_requests: bool,
    pub technique: Technique,
    pub program_break: Option<usize>,
    /// Where OS-chosen placements start.
    pub base_address: usize,
    pub fail_page_size_query: bool,
    pub fail_commits: bool,
    /// `unmap` refuses anything but a whole region.
    pub fail_partial_unmaps: bool,
    pub numa: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            allocation_granularity: 4096,
            claimed_page_sizes: Vec::new(),
            large_page_sizes: Vec::new(),
            shm_page_sizes: Vec::new(),
            shared_memory: true,
            silent_fallback: false,
            partial_release: true,
            protect_requires_commit: false,
            honor_requests: true,
            technique: Technique::AnonymousMap,
            program_break: None,
            base_address: 0x7f00_0000_0000,
            fail_page_size_query: false,
            fail_commits: false,
            fail_partial_unmaps: false,
            numa: true,
        }
    }
}

impl SimConfig {
    /// Windows-like behaviour: 64K placement granularity, whole-reservation
    /// release only, protection only on committed pages, no shared memory.
    #[must_use]
    pub fn windows_like() -> Self {
        Self {
            allocation_granularity: 64 * 1024,
            shared_memory: false,
            partial_release: false,
            protect_requires_commit: true,
            technique: Technique::VirtualAlloc,
            numa: false,
            ..Self::default()
        }
    }
}

/// Number of calls made per primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCalls {
    pub reserve: usize,
    pub map_large: usize,
    pub shm_attach: usize,
    pub shm_detach: usize,
    pub shm_decommit: usize,
    pub unmap: usize,
    pub commit: usize,
    pub decommit: usize,
    pub protect: usize,
    pub map_file: usize,
    pub touch: usize,
    pub numa_interleave: usize,
}

impl SimCalls {
    #[must_use]
    pub fn total(&self) -> usize {
        self.reserve
            + self.map_large
            + self.shm_attach
            + self.shm_detach
            + self.shm_decommit
            + self.unmap
            + self.commit
            + self.decommit
            + self.protect
            + self.map_file
            + self.touch
            + self.numa_interleave
    }
}

#[derive(Clone, Copy)]
enum Call {
    Reserve,
    MapLarge,
    ShmAttach,
    ShmDetach,
    ShmDecommit,
    Unmap,
    Commit,
    Decommit,
    Protect,
    MapFile,
    Touch,
    NumaInterleave,
}

const CALL_KINDS: usize = Call::NumaInterleave as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Anonymous,
    Large,
    Shared,
    File,
}

#[derive(Debug, Clone)]
struct SimRegion {
    size: usize,
    page_size: usize,
    kind: RegionKind,
    committed: FixedBitSet,
    touched: FixedBitSet,
    access: Vec<Access>,
}

impl SimRegion {
    fn new(size: usize, base_page: usize, page_size: usize, kind: RegionKind, committed: bool, access: Access) -> Self {
        let pages = size / base_page;
        let mut bits = FixedBitSet::with_capacity(pages);
        bits.set_range(.., committed);
        Self {
            size,
            page_size,
            kind,
            committed: bits,
            touched: FixedBitSet::with_capacity(pages),
            access: vec![access; pages],
        }
    }

    /// Pages `[first, first + count)` as a standalone region.
    fn slice(&self, base_page: usize, first: usize, count: usize) -> Self {
        let mut committed = FixedBitSet::with_capacity(count);
        let mut touched = FixedBitSet::with_capacity(count);
        for i in 0..count {
            committed.set(i, self.committed.contains(first + i));
            touched.set(i, self.touched.contains(first + i));
        }
        Self {
            size: count * base_page,
            page_size: self.page_size,
            kind: self.kind,
            committed,
            touched,
            access: self.access[first..first + count].to_vec(),
        }
    }
}

struct SimState {
    regions: BTreeMap<usize, SimRegion>,
    next: usize,
}

pub struct SimulatedVmOps {
    config: SimConfig,
    state: Mutex<SimState>,
    calls: [AtomicUsize; CALL_KINDS],
}

fn einval(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.to_string())
}

fn enomem(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::OutOfMemory, what.to_string())
}

impl SimulatedVmOps {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let next = config.base_address;
        Self {
            config,
            state: Mutex::new(SimState {
                regions: BTreeMap::new(),
                next,
            }),
            calls: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    fn record(&self, call: Call) {
        self.calls[call as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    #[must_use]
    pub fn calls(&self) -> SimCalls {
        let get = |call: Call| self.calls[call as usize].load(Ordering::Relaxed);
        SimCalls {
            reserve: get(Call::Reserve),
            map_large: get(Call::MapLarge),
            shm_attach: get(Call::ShmAttach),
            shm_detach: get(Call::ShmDetach),
            shm_decommit: get(Call::ShmDecommit),
            unmap: get(Call::Unmap),
            commit: get(Call::Commit),
            decommit: get(Call::Decommit),
            protect: get(Call::Protect),
            map_file: get(Call::MapFile),
            touch: get(Call::Touch),
            numa_interleave: get(Call::NumaInterleave),
        }
    }

    /// Number of distinct mapped regions.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        lock(&self.state).regions.len()
    }

    /// Total mapped bytes.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        lock(&self.state).regions.values().map(|r| r.size).sum()
    }

    /// Whether the page holding `addr` is physically backed.
    #[must_use]
    pub fn is_committed(&self, addr: usize) -> bool {
        let state = lock(&self.state);
        self.page_of(&state.regions, addr)
            .is_some_and(|(region, idx)| region.committed.contains(idx))
    }

    /// Whether the page holding `addr` was pre-touched.
    #[must_use]
    pub fn is_touched(&self, addr: usize) -> bool {
        let state = lock(&self.state);
        self.page_of(&state.regions, addr)
            .is_some_and(|(region, idx)| region.touched.contains(idx))
    }

    fn page_of<'a>(&self, regions: &'a BTreeMap<usize, SimRegion>, addr: usize) -> Option<(&'a SimRegion, usize)> {
        regions
            .range(..=addr)
            .next_back()
            .filter(|(base, region)| addr < **base + region.size)
            .map(|(base, region)| (region, (addr - base) / self.config.page_size))
    }

    /// Region wholly containing `[addr, addr + size)`, with the index of
    /// the first page.
    fn region_mut<'a>(
        &self,
        regions: &'a mut BTreeMap<usize, SimRegion>,
        addr: usize,
        size: usize,
    ) -> io::Result<(&'a mut SimRegion, std::ops::Range<usize>)> {
        let page = self.config.page_size;
        if addr % page != 0 || size % page != 0 || size == 0 {
            return Err(einval("unaligned range"));
        }
        let (base, region) = regions
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| enomem("range not mapped"))?;
        if addr + size > *base + region.size {
            return Err(enomem("range not mapped"));
        }
        let first = (addr - *base) / page;
        Ok((region, first..first + size / page))
    }

    fn is_free(regions: &BTreeMap<usize, SimRegion>, addr: usize, size: usize) -> bool {
        regions
            .range(..addr + size)
            .next_back()
            .map_or(true, |(base, region)| base + region.size <= addr)
    }

    fn place(&self, state: &mut SimState, requested: Option<usize>, size: usize, align: usize) -> io::Result<usize> {
        let align = align.max(self.config.allocation_granularity);
        if let Some(requested) = requested.filter(|_| self.config.honor_requests) {
            if requested % align != 0 {
                return Err(einval("misaligned placement request"));
            }
            if !Self::is_free(&state.regions, requested, size) {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "range in use"));
            }
            return Ok(requested);
        }
        let mut addr = state.next.next_multiple_of(align);
        while !Self::is_free(&state.regions, addr, size) {
            let (base, region) = state
                .regions
                .range(..addr + size)
                .next_back()
                .ok_or_else(|| enomem("address space exhausted"))?;
            addr = (base + region.size).next_multiple_of(align);
        }
        state.next = addr + size;
        Ok(addr)
    }

    fn remove_range(&self, regions: &mut BTreeMap<usize, SimRegion>, addr: usize, size: usize) {
        let page = self.config.page_size;
        let end = addr + size;
        let hit: Vec<usize> = regions
            .range(..end)
            .filter(|(base, region)| **base + region.size > addr)
            .map(|(base, _)| *base)
            .collect();
        for base in hit {
            let Some(region) = regions.remove(&base) else {
                continue;
            };
            let region_end = base + region.size;
            if base < addr {
                regions.insert(base, region.slice(page, 0, (addr - base) / page));
            }
            if region_end > end {
                regions.insert(end, region.slice(page, (end - base) / page, (region_end - end) / page));
            }
        }
    }
}

impl VmOps for SimulatedVmOps {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn page_size(&self) -> io::Result<usize> {
        if self.config.fail_page_size_query {
            return Err(io::Error::new(io::ErrorKind::Other, "page size query failed"));
        }
        Ok(self.config.page_size)
    }

    fn allocation_granularity(&self, _page_size: usize) -> usize {
        self.config.allocation_granularity
    }

    fn candidate_page_sizes(&self) -> Vec<usize> {
        self.config.claimed_page_sizes.clone()
    }

    fn native_technique(&self) -> Technique {
        self.config.technique
    }

    fn supports_shared_memory(&self) -> bool {
        self.config.shared_memory
    }

    fn supports_partial_release(&self) -> bool {
        self.config.partial_release
    }

    fn protect_requires_commit(&self) -> bool {
        self.config.protect_requires_commit
    }

    fn supports_numa_interleaving(&self) -> bool {
        self.config.numa
    }

    fn program_break(&self) -> Option<usize> {
        self.config.program_break
    }

    fn query_page_size_at(&self, addr: usize) -> Option<usize> {
        let state = lock(&self.state);
        self.page_of(&state.regions, addr).map(|(region, _)| region.page_size)
    }

    fn query_protection(&self, addr: usize) -> Option<Access> {
        let state = lock(&self.state);
        self.page_of(&state.regions, addr).map(|(region, idx)| region.access[idx])
    }

    unsafe fn map_reserve(&self, requested: Option<usize>, size: usize, _executable: bool) -> io::Result<usize> {
        self.record(Call::Reserve);
        let mut state = lock(&self.state);
        let addr = self.place(&mut state, requested, size, self.config.page_size)?;
        let page = self.config.page_size;
        state.regions.insert(
            addr,
            SimRegion::new(size, page, page, RegionKind::Anonymous, false, Access::NONE),
        );
        Ok(addr)
    }

    unsafe fn map_large(
        &self,
        requested: Option<usize>,
        size: usize,
        page_size: usize,
        executable: bool,
    ) -> io::Result<usize> {
        self.record(Call::MapLarge);
        if !self.config.large_page_sizes.contains(&page_size) {
            return Err(enomem("no large pages of that size"));
        }
        if size % page_size != 0 {
            return Err(einval("size not a multiple of the page size"));
        }
        let mut state = lock(&self.state);
        let addr = self.place(&mut state, requested, size, page_size)?;
        let backing = if self.config.silent_fallback {
            self.config.page_size
        } else {
            page_size
        };
        let access = Access::from(if executable {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        });
        state.regions.insert(
            addr,
            SimRegion::new(size, self.config.page_size, backing, RegionKind::Large, true, access),
        );
        Ok(addr)
    }

    unsafe fn shm_attach(&self, requested: Option<usize>, size: usize, page_size: usize) -> io::Result<usize> {
        self.record(Call::ShmAttach);
        if !self.config.shared_memory {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "shared memory is not supported"));
        }
        if page_size != self.config.page_size && !self.config.shm_page_sizes.contains(&page_size) {
            return Err(enomem("no shared memory pages of that size"));
        }
        let mut state = lock(&self.state);
        let addr = self.place(&mut state, requested, size, page_size)?;
        state.regions.insert(
            addr,
            SimRegion::new(
                size,
                self.config.page_size,
                page_size,
                RegionKind::Shared,
                true,
                Access::READ_WRITE,
            ),
        );
        Ok(addr)
    }

    unsafe fn shm_detach(&self, addr: usize) -> io::Result<()> {
        self.record(Call::ShmDetach);
        let mut state = lock(&self.state);
        match state.regions.get(&addr) {
            Some(region) if region.kind == RegionKind::Shared => {
                state.regions.remove(&addr);
                Ok(())
            }
            _ => Err(einval("not a shared memory attachment")),
        }
    }

    unsafe fn shm_decommit(&self, addr: usize, size: usize) -> io::Result<()> {
        self.record(Call::ShmDecommit);
        let mut state = lock(&self.state);
        let (region, pages) = self.region_mut(&mut state.regions, addr, size)?;
        if region.kind != RegionKind::Shared {
            return Err(einval("not a shared memory attachment"));
        }
        region.committed.set_range(pages, false);
        Ok(())
    }

    unsafe fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        self.record(Call::Unmap);
        let mut state = lock(&self.state);
        if !self.config.partial_release {
            return match state.regions.get(&addr) {
                Some(region) if region.kind != RegionKind::File => {
                    state.regions.remove(&addr);
                    Ok(())
                }
                _ => Err(einval("not the base of a reservation")),
            };
        }
        if addr % self.config.page_size != 0 || size % self.config.page_size != 0 {
            return Err(einval("unaligned range"));
        }
        if self.config.fail_partial_unmaps && state.regions.get(&addr).map(|r| r.size) != Some(size) {
            return Err(enomem("partial unmap refused"));
        }
        self.remove_range(&mut state.regions, addr, size);
        Ok(())
    }

    unsafe fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
        self.record(Call::Commit);
        if self.config.fail_commits {
            return Err(enomem("commit refused"));
        }
        let mut state = lock(&self.state);
        let (region, pages) = self.region_mut(&mut state.regions, addr, size)?;
        region.committed.set_range(pages.clone(), true);
        region.access[pages].fill(Access::READ_WRITE);
        Ok(())
    }

    unsafe fn decommit(&self, addr: usize, size: usize) -> io::Result<()> {
        self.record(Call::Decommit);
        let mut state = lock(&self.state);
        let (region, pages) = self.region_mut(&mut state.regions, addr, size)?;
        region.committed.set_range(pages.clone(), false);
        region.touched.set_range(pages.clone(), false);
        region.access[pages].fill(Access::NONE);
        Ok(())
    }

    unsafe fn protect(&self, addr: usize, size: usize, prot: Protection) -> io::Result<()> {
        self.record(Call::Protect);
        let mut state = lock(&self.state);
        let requires_commit = self.config.protect_requires_commit;
        let (region, pages) = self.region_mut(&mut state.regions, addr, size)?;
        if requires_commit && pages.clone().any(|i| !region.committed.contains(i)) {
            return Err(einval("protection change on uncommitted pages"));
        }
        region.access[pages].fill(Access::from(prot));
        Ok(())
    }

    unsafe fn map_file_over(&self, addr: usize, size: usize, _file: &File) -> io::Result<usize> {
        self.record(Call::MapFile);
        let mut state = lock(&self.state);
        let page = self.config.page_size;
        if !self.config.partial_release {
            // Windows flavour: the reservation is released, then the view mapped.
            match state.regions.get(&addr) {
                Some(region) if region.size == size => {
                    state.regions.remove(&addr);
                }
                _ => return Err(einval("not the base of a reservation")),
            }
        } else {
            self.remove_range(&mut state.regions, addr, size);
        }
        state.regions.insert(
            addr,
            SimRegion::new(size, page, page, RegionKind::File, true, Access::READ_WRITE),
        );
        Ok(addr)
    }

    unsafe fn unmap_file(&self, addr: usize, size: usize) -> io::Result<()> {
        self.record(Call::Unmap);
        let mut state = lock(&self.state);
        match state.regions.get(&addr) {
            Some(region) if region.kind == RegionKind::File => {
                self.remove_range(&mut state.regions, addr, size);
                Ok(())
            }
            _ => Err(einval("not a file view")),
        }
    }

    unsafe fn touch(&self, addr: usize, size: usize, stride: usize) {
        self.record(Call::Touch);
        let page = self.config.page_size;
        let stride = stride.max(page);
        let mut state = lock(&self.state);
        let mut offset = 0;
        while offset < size {
            let at = addr + offset;
            let writable = match self.region_mut(&mut state.regions, at - at % page, page) {
                Ok((region, pages)) if region.access[pages.start].write => {
                    region.committed.insert(pages.start);
                    region.touched.insert(pages.start);
                    true
                }
                _ => false,
            };
            if !writable {
                drop(state);
                panic!("simulated segmentation fault touching {at:#x}");
            }
            offset += stride;
        }
    }

    unsafe fn numa_interleave(&self, _addr: usize, _size: usize) -> io::Result<()> {
        self.record(Call::NumaInterleave);
        if !self.config.numa {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "no NUMA support"));
        }
        Ok(())
    }
}
