//! Process-wide record of every OS mapping created through
//! [`super::region::VirtualMemory`].
//!
//! Entries are keyed by base address in a `BTreeMap` behind a single mutex.
//! Every sub-range operation is checked against the ledger before the OS is
//! touched; a caller handing back a range it does not own is a contract
//! violation, reported through [`super::fatal`].

use std::collections::BTreeMap;
use std::fmt;

use super::fatal::{fatal, FatalReport};
use crate::sync::{lock, Mutex};

/// OS mechanism that created a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technique {
    /// POSIX anonymous mmap.
    AnonymousMap,
    /// System V shared memory segment, attached then marked for removal.
    SharedMemoryAttach,
    /// Windows VirtualAlloc.
    VirtualAlloc,
    /// Shared mapping of a caller-supplied file.
    FileMapping,
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technique::AnonymousMap => "mmap",
            Technique::SharedMemoryAttach => "shmat",
            Technique::VirtualAlloc => "VirtualAlloc",
            Technique::FileMapping => "file",
        };
        f.write_str(name)
    }
}

/// One live OS mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsMapping {
    pub base: usize,
    pub size: usize,
    pub page_size: usize,
    pub technique: Technique,
    /// Physically backed from the moment it was mapped (large pages, file
    /// views). Such mappings cannot be committed or uncommitted piecewise.
    pub committed_on_reserve: bool,
}

impl OsMapping {
    #[must_use]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[must_use]
    pub fn contains_addr(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end()
    }

    #[must_use]
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        addr >= self.base && len <= self.size && addr - self.base <= self.size - len
    }

    /// Inside the mapping and aligned to its page size at both ends.
    #[must_use]
    pub fn is_valid_subrange(&self, addr: usize, len: usize) -> bool {
        self.contains_range(addr, len) && addr % self.page_size == 0 && len % self.page_size == 0
    }

    fn overlaps(&self, other: &OsMapping) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl fmt::Display for OsMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#018x} - {:#018x}) {:>10} bytes, {} pages, {}",
            self.base,
            self.end(),
            self.size,
            super::page_size::describe_page_size(self.page_size),
            self.technique
        )?;
        if self.committed_on_reserve {
            f.write_str(", committed")?;
        }
        Ok(())
    }
}

/// Ways a request can disagree with the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerViolation {
    NotMapped { addr: usize, len: usize },
    OutOfBounds { addr: usize, len: usize, mapping: OsMapping },
    Misaligned { addr: usize, len: usize, mapping: OsMapping },
    Overlap { new: OsMapping, existing: OsMapping },
    MiddleRelease { addr: usize, len: usize, mapping: OsMapping },
}

impl fmt::Display for LedgerViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerViolation::NotMapped { addr, len } => {
                write!(f, "range {addr:#x}+{len:#x} is not in any known mapping")
            }
            LedgerViolation::OutOfBounds { addr, len, mapping } => {
                write!(f, "range {addr:#x}+{len:#x} extends outside mapping {mapping}")
            }
            LedgerViolation::Misaligned { addr, len, mapping } => write!(
                f,
                "range {addr:#x}+{len:#x} is not aligned to the {:#x} byte pages of mapping {mapping}",
                mapping.page_size
            ),
            LedgerViolation::Overlap { new, existing } => {
                write!(f, "new mapping {new} overlaps existing mapping {existing}")
            }
            LedgerViolation::MiddleRelease { addr, len, mapping } => write!(
                f,
                "cannot release {addr:#x}+{len:#x} from the middle of mapping {mapping}"
            ),
        }
    }
}

/// Change [`Ledger::update_after`] makes once the OS call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerUpdate {
    Keep,
    /// The OS gave back `[addr, addr + len)`: a whole mapping or either end.
    Release { addr: usize, len: usize },
    /// Same extent, new backing.
    Replace(OsMapping),
}

/// Bookkeeping of live mappings.
pub struct Ledger {
    entries: Mutex<BTreeMap<usize, OsMapping>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a new mapping. Overlap with an existing entry means the OS
    /// and the ledger disagree, which is fatal.
    pub fn register(&self, mapping: OsMapping) {
        let result = {
            let mut entries = lock(&self.entries);
            match overlapping(&entries, &mapping) {
                Some(existing) => Err(LedgerViolation::Overlap {
                    new: mapping,
                    existing,
                }),
                None => {
                    entries.insert(mapping.base, mapping);
                    Ok(())
                }
            }
        };
        if let Err(violation) = result {
            self.violation(violation);
        }
    }

    /// Swap the entry at `mapping.base` for `mapping` under one lock.
    /// Returns the entry it replaced.
    pub fn replace(&self, mapping: OsMapping) -> OsMapping {
        let result = {
            let mut entries = lock(&self.entries);
            let old = entries.get(&mapping.base).copied();
            apply(&mut entries, LedgerUpdate::Replace(mapping)).map(|()| old.unwrap_or(mapping))
        };
        result.unwrap_or_else(|violation| self.violation(violation))
    }

    /// Mapping containing `addr`, if any.
    #[must_use]
    pub fn find_containing(&self, addr: usize) -> Option<OsMapping> {
        containing(&lock(&self.entries), addr)
    }

    /// Locate the mapping holding `[addr, addr + len)` and check the range
    /// is page-aligned within it.
    pub fn check_subrange(&self, addr: usize, len: usize) -> Result<OsMapping, LedgerViolation> {
        let mapping = self
            .find_containing(addr)
            .ok_or(LedgerViolation::NotMapped { addr, len })?;
        if !mapping.contains_range(addr, len) {
            return Err(LedgerViolation::OutOfBounds { addr, len, mapping });
        }
        if !mapping.is_valid_subrange(addr, len) {
            return Err(LedgerViolation::Misaligned { addr, len, mapping });
        }
        Ok(mapping)
    }

    /// [`Ledger::check_subrange`], fatal on violation.
    pub fn assert_valid_subrange(&self, addr: usize, len: usize) -> OsMapping {
        self.check_subrange(addr, len)
            .unwrap_or_else(|violation| self.violation(violation))
    }

    /// Drop `[addr, addr + len)` from the mapping holding it: the whole
    /// mapping, or a piece at either end.
    pub fn release_range(&self, addr: usize, len: usize) {
        self.update_after(|| (), |_| LedgerUpdate::Release { addr, len });
    }

    /// Remove the mapping starting at `base`.
    pub fn remove(&self, base: usize) -> OsMapping {
        let removed = lock(&self.entries).remove(&base);
        removed.unwrap_or_else(|| self.violation(LedgerViolation::NotMapped { addr: base, len: 0 }))
    }

    /// Run `os_call` with the ledger locked and apply the update `decide`
    /// derives from its result before unlocking. Addresses the OS call
    /// frees cannot be registered by another reservation until the ledger
    /// no longer holds them.
    ///
    /// `os_call` must not call back into the ledger.
    pub fn update_after<T>(&self, os_call: impl FnOnce() -> T, decide: impl FnOnce(&T) -> LedgerUpdate) -> T {
        let (value, result) = {
            let mut entries = lock(&self.entries);
            let value = os_call();
            let result = apply(&mut entries, decide(&value));
            (value, result)
        };
        if let Err(violation) = result {
            self.violation(violation);
        }
        value
    }

    /// Copy of every live mapping, ordered by base address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OsMapping> {
        lock(&self.entries).values().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Total bytes of address space currently recorded.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        lock(&self.entries).values().map(|m| m.size).sum()
    }

    fn violation(&self, violation: LedgerViolation) -> ! {
        fatal(FatalReport::contract(violation.to_string()).with_ledger(self))
    }
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        writeln!(f, "OS mappings ({}):", snapshot.len())?;
        for mapping in &snapshot {
            writeln!(f, "  {mapping}")?;
        }
        Ok(())
    }
}

fn containing(entries: &BTreeMap<usize, OsMapping>, addr: usize) -> Option<OsMapping> {
    entries
        .range(..=addr)
        .next_back()
        .map(|(_, mapping)| *mapping)
        .filter(|mapping| mapping.contains_addr(addr))
}

fn apply(entries: &mut BTreeMap<usize, OsMapping>, update: LedgerUpdate) -> Result<(), LedgerViolation> {
    match update {
        LedgerUpdate::Keep => Ok(()),
        LedgerUpdate::Release { addr, len } => {
            let mapping = containing(entries, addr).ok_or(LedgerViolation::NotMapped { addr, len })?;
            if !mapping.contains_range(addr, len) {
                return Err(LedgerViolation::OutOfBounds { addr, len, mapping });
            }
            let head = addr == mapping.base;
            let tail = addr + len == mapping.end();
            if !head && !tail {
                return Err(LedgerViolation::MiddleRelease { addr, len, mapping });
            }
            entries.remove(&mapping.base);
            if len < mapping.size {
                let rest = if head {
                    OsMapping {
                        base: mapping.base + len,
                        size: mapping.size - len,
                        ..mapping
                    }
                } else {
                    OsMapping {
                        size: mapping.size - len,
                        ..mapping
                    }
                };
                entries.insert(rest.base, rest);
            }
            Ok(())
        }
        LedgerUpdate::Replace(mapping) => match entries.get(&mapping.base).copied() {
            Some(old) if old.size == mapping.size => {
                entries.insert(mapping.base, mapping);
                Ok(())
            }
            Some(old) => Err(LedgerViolation::OutOfBounds {
                addr: mapping.base,
                len: mapping.size,
                mapping: old,
            }),
            None => Err(LedgerViolation::NotMapped {
                addr: mapping.base,
                len: mapping.size,
            }),
        },
    }
}

fn overlapping(entries: &BTreeMap<usize, OsMapping>, mapping: &OsMapping) -> Option<OsMapping> {
    // Only the last entry starting before our end can overlap: entries are
    // disjoint, so any earlier one ends before that entry starts.
    entries
        .range(..mapping.end())
        .next_back()
        .map(|(_, existing)| *existing)
        .filter(|existing| existing.overlaps(mapping))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};

    const PAGE: usize = 4096;

    fn mapping(base: usize, pages: usize) -> OsMapping {
        OsMapping {
            base,
            size: pages * PAGE,
            page_size: PAGE,
            technique: Technique::AnonymousMap,
            committed_on_reserve: false,
        }
    }

    #[test]
    fn test_find_containing() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 4));
        ledger.register(mapping(0x40000, 1));

        assert_eq!(ledger.find_containing(0x10000).map(|m| m.base), Some(0x10000));
        assert_eq!(ledger.find_containing(0x13fff).map(|m| m.base), Some(0x10000));
        assert_eq!(ledger.find_containing(0x14000), None);
        assert_eq!(ledger.find_containing(0x40800).map(|m| m.base), Some(0x40000));
        assert_eq!(ledger.find_containing(0x0fff), None);
    }

    #[test]
    fn test_check_subrange() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 4));

        assert!(ledger.check_subrange(0x11000, 2 * PAGE).is_ok());
        assert!(ledger.check_subrange(0x10000, 4 * PAGE).is_ok());
        assert!(matches!(
            ledger.check_subrange(0x13000, 2 * PAGE),
            Err(LedgerViolation::OutOfBounds { .. })
        ));
        assert!(matches!(
            ledger.check_subrange(0x10800, PAGE),
            Err(LedgerViolation::Misaligned { .. })
        ));
        assert!(matches!(
            ledger.check_subrange(0x90000, PAGE),
            Err(LedgerViolation::NotMapped { .. })
        ));
    }

    #[test]
    fn test_shrink_head_and_tail() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 8));

        ledger.release_range(0x10000, 2 * PAGE);
        assert_eq!(ledger.snapshot(), vec![mapping(0x12000, 6)]);

        ledger.release_range(0x15000, 3 * PAGE);
        assert_eq!(ledger.snapshot(), vec![mapping(0x12000, 3)]);
        assert_eq!(ledger.reserved_bytes(), 3 * PAGE);
    }

    #[test]
    fn test_remove() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 1));
        assert_eq!(ledger.remove(0x10000), mapping(0x10000, 1));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_replace_keeps_range() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 2));
        let file = OsMapping {
            technique: Technique::FileMapping,
            committed_on_reserve: true,
            ..mapping(0x10000, 2)
        };
        let old = ledger.replace(file);
        assert_eq!(old.technique, Technique::AnonymousMap);
        assert_eq!(ledger.find_containing(0x10000), Some(file));
    }

    #[test]
    #[should_panic(expected = "from the middle of mapping")]
    fn test_release_range_from_the_middle_is_fatal() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 4));
        ledger.release_range(0x11000, PAGE);
    }

    #[test]
    fn test_update_after_holds_the_lock_across_the_os_call() {
        let ledger = Arc::new(Ledger::new());
        ledger.register(mapping(0x10000, 4));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let releaser = {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                ledger.update_after(
                    || {
                        entered_tx.send(()).unwrap();
                        go_rx.recv().unwrap();
                    },
                    |_| LedgerUpdate::Release {
                        addr: 0x10000,
                        len: 4 * PAGE,
                    },
                );
            })
        };
        entered_rx.recv().unwrap();
        let registrar = {
            let ledger = Arc::clone(&ledger);
            // Blocks until the release has dropped the old entry.
            std::thread::spawn(move || ledger.register(mapping(0x10000, 4)))
        };
        go_tx.send(()).unwrap();
        releaser.join().unwrap();
        registrar.join().unwrap();
        assert_eq!(ledger.snapshot(), vec![mapping(0x10000, 4)]);
    }

    #[test]
    fn test_failed_os_call_keeps_the_entry() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 4));
        let result: Result<(), ()> = ledger.update_after(
            || Err(()),
            |_| LedgerUpdate::Keep,
        );
        assert!(result.is_err());
        assert_eq!(ledger.snapshot(), vec![mapping(0x10000, 4)]);
    }

    #[test]
    #[should_panic(expected = "overlaps existing mapping")]
    fn test_overlap_is_fatal() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 4));
        ledger.register(mapping(0x12000, 4));
    }

    #[test]
    #[should_panic(expected = "not in any known mapping")]
    fn test_assert_unknown_range_is_fatal() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 1));
        ledger.assert_valid_subrange(0x20000, PAGE);
    }

    #[test]
    fn test_dump_lists_every_mapping() {
        let ledger = Ledger::new();
        ledger.register(mapping(0x10000, 1));
        ledger.register(mapping(0x20000, 2));
        let dump = ledger.to_string();
        assert!(dump.starts_with("OS mappings (2):"));
        assert!(dump.contains("0x0000000000010000"));
        assert!(dump.contains("0x0000000000020000"));
    }
}
