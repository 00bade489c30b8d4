//! Page size discovery.
//!
//! The OS is asked which page sizes it claims to support, then each claim is
//! verified by actually mapping a page of that size (through the anonymous
//! large-page path and, where available, shared memory) and checking the
//! page size the OS reports for it. Only verified sizes are offered for
//! dynamic use.

use std::fmt;

use super::fatal::{fatal, FatalReport};
use super::vm::VmOps;

/// A page size above the base page size and how it can be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltPageSize {
    pub size: usize,
    pub via_anonymous_map: bool,
    pub via_shared_memory: bool,
}

impl AltPageSize {
    #[must_use]
    pub fn usable(&self) -> bool {
        self.via_anonymous_map || self.via_shared_memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipageCapabilities {
    base_page_size: usize,
    allocation_granularity: usize,
    alt_page_sizes: Vec<AltPageSize>,
}

impl MultipageCapabilities {
    /// Capabilities with only a base page size. Used when probing is not
    /// wanted (tests, or large pages explicitly disabled).
    #[must_use]
    pub fn base_only(base_page_size: usize, allocation_granularity: usize) -> Self {
        Self {
            base_page_size,
            allocation_granularity,
            alt_page_sizes: Vec::new(),
        }
    }

    #[must_use]
    pub fn base_page_size(&self) -> usize {
        self.base_page_size
    }

    #[must_use]
    pub fn allocation_granularity(&self) -> usize {
        self.allocation_granularity
    }

    /// Every size the OS claimed, verified or not, smallest first.
    #[must_use]
    pub fn alt_page_sizes(&self) -> &[AltPageSize] {
        &self.alt_page_sizes
    }

    #[must_use]
    pub fn lookup(&self, size: usize) -> Option<&AltPageSize> {
        self.alt_page_sizes.iter().find(|alt| alt.size == size)
    }

    /// Base page size followed by every verified larger size.
    #[must_use]
    pub fn usable_page_sizes(&self) -> Vec<usize> {
        std::iter::once(self.base_page_size)
            .chain(self.alt_page_sizes.iter().filter(|a| a.usable()).map(|a| a.size))
            .collect()
    }

    /// Pick the large page size to use: `preferred` if it was verified,
    /// otherwise the smallest verified size.
    #[must_use]
    pub fn select_large_page(&self, preferred: usize) -> Option<AltPageSize> {
        if preferred != 0 {
            return self.lookup(preferred).filter(|a| a.usable()).copied();
        }
        self.alt_page_sizes.iter().find(|a| a.usable()).copied()
    }
}

impl fmt::Display for MultipageCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Page sizes: base {}, allocation granularity {}",
            describe_page_size(self.base_page_size),
            describe_page_size(self.allocation_granularity)
        )?;
        for alt in &self.alt_page_sizes {
            writeln!(
                f,
                "  {:>4}: mmap {}, shm {}",
                describe_page_size(alt.size),
                yes_no(alt.via_anonymous_map),
                yes_no(alt.via_shared_memory)
            )?;
        }
        Ok(())
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

/// Short human form of a page size: 4K, 64K, 2M, 1G.
#[must_use]
pub fn describe_page_size(size: usize) -> String {
    const K: usize = 1024;
    const M: usize = K * K;
    const G: usize = M * K;
    match size {
        s if s >= G && s % G == 0 => format!("{}G", s / G),
        s if s >= M && s % M == 0 => format!("{}M", s / M),
        s if s >= K && s % K == 0 => format!("{}K", s / K),
        s => format!("{s}B"),
    }
}

/// Query and verify the page sizes available through `ops`.
///
/// Failing to learn the base page size is fatal; every other failure just
/// marks the size in question unusable.
pub fn probe(ops: &dyn VmOps) -> MultipageCapabilities {
    let base_page_size = match ops.page_size() {
        Ok(size) if size.is_power_of_two() => size,
        Ok(size) => fatal(FatalReport::initialization(format!(
            "OS reported a base page size of {size} bytes"
        ))),
        Err(e) => fatal(FatalReport::initialization("cannot determine the base page size").with_os_error(&e)),
    };
    let allocation_granularity = ops.allocation_granularity(base_page_size).max(base_page_size);

    let mut candidates: Vec<usize> = ops
        .candidate_page_sizes()
        .into_iter()
        .filter(|&size| size > base_page_size && size.is_power_of_two())
        .collect();
    candidates.sort_unstable();
    candidates.dedup();

    let alt_page_sizes = candidates
        .into_iter()
        .map(|size| {
            let alt = AltPageSize {
                size,
                via_anonymous_map: verify_anonymous(ops, size),
                via_shared_memory: ops.supports_shared_memory() && verify_shared(ops, size),
            };
            tracing::debug!(
                target: "platvm::pagesize",
                size = %describe_page_size(size),
                mmap = alt.via_anonymous_map,
                shm = alt.via_shared_memory,
                "probed page size"
            );
            alt
        })
        .collect();

    let caps = MultipageCapabilities {
        base_page_size,
        allocation_granularity,
        alt_page_sizes,
    };
    tracing::info!(target: "platvm::pagesize", backend = ops.name(), "{}", caps.to_string().trim_end());
    caps
}

/// The OS may silently back a request with smaller pages; only a size it
/// reports back (or cannot report at all) counts as supported.
fn confirmed(ops: &dyn VmOps, addr: usize, size: usize) -> bool {
    match ops.query_page_size_at(addr) {
        Some(actual) if actual != size => {
            tracing::debug!(
                target: "platvm::pagesize",
                requested = %describe_page_size(size),
                actual = %describe_page_size(actual),
                "OS fell back to a different page size"
            );
            false
        }
        _ => true,
    }
}

fn verify_anonymous(ops: &dyn VmOps, size: usize) -> bool {
    // Safety: the probe mapping is private to this function and unmapped
    // before returning.
    match unsafe { ops.map_large(None, size, size, false) } {
        Ok(addr) => {
            let ok = confirmed(ops, addr, size);
            // Safety: see above.
            if let Err(e) = unsafe { ops.unmap(addr, size) } {
                tracing::warn!(target: "platvm::pagesize", "failed to unmap page size probe at {addr:#x}: {e}");
            }
            ok
        }
        Err(e) => {
            tracing::trace!(target: "platvm::pagesize", size, "anonymous large page probe failed: {e}");
            false
        }
    }
}

fn verify_shared(ops: &dyn VmOps, size: usize) -> bool {
    // Safety: the probe segment is private to this function and detached
    // before returning.
    match unsafe { ops.shm_attach(None, size, size) } {
        Ok(addr) => {
            let ok = confirmed(ops, addr, size);
            // Safety: see above.
            if let Err(e) = unsafe { ops.shm_detach(addr) } {
                tracing::warn!(target: "platvm::pagesize", "failed to detach page size probe at {addr:#x}: {e}");
            }
            ok
        }
        Err(e) => {
            tracing::trace!(target: "platvm::pagesize", size, "shared memory page size probe failed: {e}");
            false
        }
    }
}
