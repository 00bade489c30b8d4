/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Explore the ledger, the stats counters and the thread start gate under
/// every interleaving loom can reach.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Each model builds fresh objects; `VirtualMemory::global()` is never
///     touched because its OnceLock does not reset between iterations.
///   - Real OS threads are out of reach, so thread lifecycle tests drive the
///     `StartGate` directly from loom threads, playing creator and child.
///   - `VirtualMemory` over `SimulatedVmOps` runs the probe inside the
///     model; those tests use `preemption_bound(2)`.
#[cfg(loom)]
mod tests {
    use crate::sync::atomic::Ordering;
    use crate::sync::Arc;

    // =====================================================================
    // Helpers
    // =====================================================================

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn mapping(base: usize, size: usize) -> crate::memory::ledger::OsMapping {
        crate::memory::ledger::OsMapping {
            base,
            size,
            page_size: 4096,
            technique: crate::memory::ledger::Technique::AnonymousMap,
            committed_on_reserve: false,
        }
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(counter.get(), 20);
        });
    }

    #[test]
    fn loom_counter_never_reads_negative() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();

            // Sub may land before the matching add.
            let t1 = loom::thread::spawn(move || c1.sub(4096));
            counter.add(4096);
            let seen = counter.get();
            t1.join().unwrap();

            assert!(seen == 0 || seen == 4096);
            assert_eq!(counter.get(), 0);
        });
    }

    // =====================================================================
    // 2. Ledger
    // =====================================================================

    #[test]
    fn loom_ledger_register_visible_to_lookup() {
        use crate::memory::ledger::Ledger;

        loom::model(|| {
            let ledger = Arc::new(Ledger::new());
            let l1 = ledger.clone();

            let t1 = loom::thread::spawn(move || {
                l1.register(mapping(0x10000, 0x4000));
            });

            // Either not yet registered or fully registered; never torn.
            if let Some(found) = ledger.find_containing(0x12000) {
                assert_eq!(found, mapping(0x10000, 0x4000));
            }

            t1.join().unwrap();
            assert_eq!(ledger.find_containing(0x13fff), Some(mapping(0x10000, 0x4000)));
        });
    }

    #[test]
    fn loom_ledger_concurrent_register_and_trim() {
        use crate::memory::ledger::Ledger;

        loom::model(|| {
            let ledger = Arc::new(Ledger::new());
            ledger.register(mapping(0x10000, 0x4000));
            let l1 = ledger.clone();
            let l2 = ledger.clone();

            let t1 = loom::thread::spawn(move || {
                l1.release_range(0x10000, 0x1000);
            });
            let t2 = loom::thread::spawn(move || {
                l2.register(mapping(0x20000, 0x2000));
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(ledger.len(), 2);
            assert_eq!(ledger.find_containing(0x10000), None);
            assert_eq!(ledger.find_containing(0x11000), Some(mapping(0x11000, 0x3000)));
            assert_eq!(ledger.reserved_bytes(), 0x5000);
        });
    }

    // =====================================================================
    // 3. StartGate
    // =====================================================================

    #[test]
    fn loom_gate_user_code_runs_only_after_release() {
        use crate::sync::atomic::AtomicBool;
        use crate::thread::handle::{ExitStatus, StartGate, ThreadState};

        loom::model(|| {
            let gate = Arc::new(StartGate::new());
            let released = Arc::new(AtomicBool::new(false));
            let child_gate = gate.clone();
            let child_released = released.clone();

            let child = loom::thread::spawn(move || {
                child_gate.announce_initialized(1, 0x20000, 0x10000);
                if child_gate.wait_for_start() {
                    // User code: the creator must have released us.
                    assert!(child_released.load(Ordering::SeqCst));
                    child_gate.mark_exited(ExitStatus::Returned);
                }
            });

            assert_eq!(gate.wait_initialized(), ThreadState::Initialized);
            released.store(true, Ordering::SeqCst);
            gate.release().unwrap();
            assert_eq!(gate.wait_exited(), ExitStatus::Returned);
            child.join().unwrap();
        });
    }

    #[test]
    fn loom_gate_cancel_before_start() {
        use crate::thread::handle::{ExitStatus, StartGate};

        loom::model(|| {
            let gate = Arc::new(StartGate::new());
            let child_gate = gate.clone();

            let child = loom::thread::spawn(move || {
                child_gate.announce_initialized(1, 0, 0);
                child_gate.wait_for_start()
            });

            gate.wait_initialized();
            assert!(gate.cancel());
            assert!(!child.join().unwrap());
            assert_eq!(gate.wait_exited(), ExitStatus::Cancelled);
            // A cancelled gate cannot be started.
            assert!(gate.release().is_err());
        });
    }

    // =====================================================================
    // 4. VirtualMemory over SimulatedVmOps
    // =====================================================================

    #[test]
    fn loom_concurrent_reservations_are_disjoint() {
        use crate::config::VmConfig;
        use crate::memory::region::VirtualMemory;
        use crate::memory::sim::{SimConfig, SimulatedVmOps};

        bounded(2).check(|| {
            let ops = std::sync::Arc::new(SimulatedVmOps::new(SimConfig::default()));
            let vm = Arc::new(VirtualMemory::new(ops, VmConfig::default()));
            let v1 = vm.clone();

            let t1 = loom::thread::spawn(move || v1.reserve(0x4000, None, false).unwrap());
            let b = vm.reserve(0x4000, None, false).unwrap();
            let a = t1.join().unwrap();

            assert!(a + 0x4000 <= b || b + 0x4000 <= a);
            assert_eq!(vm.ledger().len(), 2);
            assert_eq!(vm.stats().reserved_bytes, 0x8000);
        });
    }

    #[test]
    fn loom_release_races_with_lookup() {
        use crate::config::VmConfig;
        use crate::memory::region::VirtualMemory;
        use crate::memory::sim::{SimConfig, SimulatedVmOps};

        bounded(2).check(|| {
            let ops = std::sync::Arc::new(SimulatedVmOps::new(SimConfig::default()));
            let vm = Arc::new(VirtualMemory::new(ops, VmConfig::default()));
            let base = vm.reserve(0x4000, None, false).unwrap();
            let v1 = vm.clone();

            let t1 = loom::thread::spawn(move || v1.release(base, 0x4000).unwrap());
            if let Some(found) = vm.find_mapping(base + 0x1000) {
                assert_eq!((found.base, found.size), (base, 0x4000));
            }
            t1.join().unwrap();

            assert_eq!(vm.find_mapping(base), None);
            assert!(vm.ledger().is_empty());
        });
    }

    #[test]
    fn loom_release_races_with_reserve_at_the_same_address() {
        use crate::config::VmConfig;
        use crate::memory::region::VirtualMemory;
        use crate::memory::sim::{SimConfig, SimulatedVmOps};

        bounded(2).check(|| {
            let ops = std::sync::Arc::new(SimulatedVmOps::new(SimConfig::default()));
            let vm = Arc::new(VirtualMemory::new(ops.clone(), VmConfig::default()));
            let base = vm.reserve(0x4000, None, false).unwrap();
            let v1 = vm.clone();

            let t1 = loom::thread::spawn(move || v1.release(base, 0x4000).unwrap());
            // Lands before the release (range in use) or after it, once the
            // ledger has dropped the old entry.
            let again = vm.reserve(0x4000, Some(base), false);
            t1.join().unwrap();

            match again {
                Ok(addr) => {
                    assert_eq!(addr, base);
                    assert_eq!(vm.ledger().snapshot().len(), 1);
                    assert_eq!(vm.find_mapping(base).map(|m| m.size), Some(0x4000));
                }
                Err(e) => {
                    assert!(e.is_placement_failure(), "{e}");
                    assert!(vm.ledger().is_empty());
                }
            }
            assert_eq!(vm.ledger().reserved_bytes(), ops.mapped_bytes());
        });
    }
}
