//! Property-based tests for the address-space layer.
//!
//! Everything runs against `SimulatedVmOps`, so each case builds a fresh,
//! deterministic address space.

use std::sync::Arc;

use platvm::{
    Access, GuardMode, Protection, SimConfig, SimulatedVmOps, StackGuardManager, VirtualMemory, VmConfig,
};
use proptest::prelude::*;

const PAGE: usize = 4096;
const SIM_BASE: usize = 0x7f00_0000_0000;

fn sim_vm(config: SimConfig) -> (Arc<SimulatedVmOps>, VirtualMemory) {
    let sim = Arc::new(SimulatedVmOps::new(config));
    let vm = VirtualMemory::new(sim.clone(), VmConfig::default());
    (sim, vm)
}

/// Strategy for sim backends: POSIX-like and Windows-like.
fn sim_config() -> impl Strategy<Value = SimConfig> {
    prop_oneof![Just(SimConfig::default()), Just(SimConfig::windows_like())]
}

#[derive(Debug, Clone)]
enum Op {
    Reserve { pages: usize },
    ReserveAt { slot: usize, pages: usize },
    Release { pick: usize },
    TrimHead { pick: usize },
    TrimTail { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..=32).prop_map(|pages| Op::Reserve { pages }),
        2 => (0usize..64, 1usize..=16).prop_map(|(slot, pages)| Op::ReserveAt { slot, pages }),
        1 => any::<usize>().prop_map(|pick| Op::Release { pick }),
        1 => any::<usize>().prop_map(|pick| Op::TrimHead { pick }),
        1 => any::<usize>().prop_map(|pick| Op::TrimTail { pick }),
    ]
}

fn assert_disjoint(vm: &VirtualMemory) -> Result<(), TestCaseError> {
    let mappings = vm.ledger().snapshot();
    for pair in mappings.windows(2) {
        prop_assert!(
            pair[0].end() <= pair[1].base,
            "{} overlaps {}",
            pair[0],
            pair[1]
        );
    }
    Ok(())
}

proptest! {
    /// Ledger entries stay pairwise disjoint and match what the OS has
    /// mapped, whatever mix of placed, free-floating, trimmed and released
    /// reservations produced them.
    #[test]
    fn ledger_mappings_never_overlap(config in sim_config(), ops in prop::collection::vec(op(), 1..40)) {
        let granularity = config.allocation_granularity;
        let (sim, vm) = sim_vm(config);
        for op in ops {
            let live = vm.ledger().snapshot();
            match op {
                Op::Reserve { pages } => {
                    let _ = vm.reserve(pages * PAGE, None, false);
                }
                Op::ReserveAt { slot, pages } => {
                    // Occupied or misplaced requests fail; they must not clobber.
                    let _ = vm.reserve(pages * PAGE, Some(SIM_BASE + slot * granularity), false);
                }
                Op::Release { pick } if !live.is_empty() => {
                    let m = live[pick % live.len()];
                    vm.release(m.base, m.size).unwrap();
                }
                Op::TrimHead { pick } if !live.is_empty() => {
                    let m = live[pick % live.len()];
                    if m.size > PAGE {
                        vm.release(m.base, PAGE).unwrap();
                    }
                }
                Op::TrimTail { pick } if !live.is_empty() => {
                    let m = live[pick % live.len()];
                    if m.size > PAGE {
                        vm.release(m.end() - PAGE, PAGE).unwrap();
                    }
                }
                _ => {}
            }
            assert_disjoint(&vm)?;
            prop_assert_eq!(vm.ledger().reserved_bytes(), sim.mapped_bytes());
        }
    }

    /// Committing a committed range again succeeds and changes nothing.
    #[test]
    fn commit_is_idempotent(config in sim_config(), pages in 2usize..=32, first in 0usize..32, len in 1usize..=32) {
        let (sim, vm) = sim_vm(config);
        let base = vm.reserve(pages * PAGE, None, false).unwrap();
        let size = vm.find_mapping(base).unwrap().size;
        let first = (first * PAGE) % size;
        let len = (len * PAGE).min(size - first);
        let addr = base + first;

        vm.commit(addr, len, false).unwrap();
        let once: Vec<Option<Access>> = (0..len).step_by(PAGE).map(|off| vm.query_protection(addr + off)).collect();
        vm.commit(addr, len, false).unwrap();
        let twice: Vec<Option<Access>> = (0..len).step_by(PAGE).map(|off| vm.query_protection(addr + off)).collect();

        prop_assert_eq!(&once, &twice);
        prop_assert!(once.iter().all(|access| *access == Some(Access::READ_WRITE)));
        prop_assert!(sim.is_committed(addr) && sim.is_committed(addr + len - PAGE));
    }

    /// Releasing a fresh reservation leaves no trace in the ledger or the OS.
    #[test]
    fn reserve_release_round_trip(config in sim_config(), size in 1usize..=(256 * PAGE), probe in 0usize..256) {
        let (sim, vm) = sim_vm(config);
        let base = vm.reserve(size, None, false).unwrap();
        let mapping = vm.find_mapping(base).unwrap();
        prop_assert!(mapping.size >= size);

        vm.release(mapping.base, mapping.size).unwrap();
        prop_assert!(vm.ledger().is_empty());
        prop_assert_eq!(vm.find_mapping(base), None);
        prop_assert_eq!(vm.find_mapping(base + (probe * PAGE) % mapping.size), None);
        prop_assert_eq!(vm.find_mapping(mapping.end() - 1), None);
        prop_assert_eq!(sim.live_regions(), 0);
    }

    /// Aligned reservations start on the alignment and cover the request.
    #[test]
    fn reserve_aligned_honours_alignment(config in sim_config(), pages in 1usize..=64, shift in 0u32..=10) {
        let (_sim, vm) = sim_vm(config);
        let alignment = PAGE << shift;
        let size = pages * PAGE;

        let p = vm.reserve_aligned(size, alignment, false).unwrap();
        prop_assert_eq!(p % alignment, 0);
        let mapping = vm.find_mapping(p).unwrap();
        prop_assert!(mapping.base <= p && p + size <= mapping.end());
        assert_disjoint(&vm)?;
    }

    /// Guard pages read as inaccessible until removed, and only they do.
    #[test]
    fn guard_pages_fault_until_removed(pages in 4usize..=32, guard in 1usize..=4, uncommit_mode in any::<bool>()) {
        let (_sim, vm) = sim_vm(SimConfig::default());
        let size = pages * PAGE;
        let low = vm.reserve(size, None, false).unwrap();
        vm.commit(low, size, false).unwrap();
        let mode = if uncommit_mode { GuardMode::Uncommit } else { GuardMode::Protect };
        let guards = StackGuardManager::new(&vm, mode);
        let zone = guard * PAGE;

        // Safety: the range belongs to this test's reservation.
        unsafe { guards.create_guard_pages(low, zone) }.unwrap();
        for off in (0..zone).step_by(PAGE) {
            prop_assert_eq!(vm.query_protection(low + off), Some(Access::NONE));
        }
        prop_assert_eq!(vm.query_protection(low + zone), Some(Access::READ_WRITE));

        // Safety: as above.
        unsafe { guards.remove_guard_pages(low, zone) }.unwrap();
        for off in (0..zone).step_by(PAGE) {
            prop_assert_eq!(vm.query_protection(low + off), Some(Access::READ_WRITE));
        }
    }

    /// Zero-length operations succeed without reaching the OS, even at
    /// addresses nothing is mapped at.
    #[test]
    fn zero_length_operations_make_no_os_calls(config in sim_config(), offset in 0usize..1024, mapped in any::<bool>()) {
        let (sim, vm) = sim_vm(config);
        let addr = if mapped {
            vm.reserve(16 * PAGE, None, false).unwrap() + (offset % 16) * PAGE
        } else {
            0x1000 + offset * PAGE
        };
        let before = sim.calls();

        vm.commit(addr, 0, false).unwrap();
        vm.commit(addr, 0, true).unwrap();
        vm.uncommit(addr, 0).unwrap();
        vm.protect(addr, 0, Protection::None, false).unwrap();
        vm.protect(addr, 0, Protection::ReadWrite, true).unwrap();
        vm.release(addr, 0).unwrap();

        prop_assert_eq!(sim.calls(), before);
    }
}
