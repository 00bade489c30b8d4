//! End-to-end scenarios over the real platform backend and the simulator.

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use platvm::{
    Access, ExitStatus, GuardMode, Protection, SimConfig, SimulatedVmOps, StackGuardManager, Technique, ThreadKind,
    ThreadManager, ThreadState, VirtualMemory, VmConfig, VmError,
};
use tracing_subscriber::EnvFilter;

const K: usize = 1024;
const M: usize = K * K;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("platvm=debug")))
        .with_test_writer()
        .try_init();
}

fn platform() -> VirtualMemory {
    init_tracing();
    VirtualMemory::platform(VmConfig::default())
}

// =====================================================================
// Reservations on the running OS
// =====================================================================

#[test]
fn reserve_commit_protect_release_one_mib() {
    let vm = platform();
    let page = vm.page_size();
    let p = vm.reserve(M, None, false).unwrap();
    assert_eq!(p % page, 0);

    let mappings = vm.ledger().snapshot();
    assert_eq!(mappings.len(), 1);
    assert_eq!((mappings[0].base, mappings[0].size), (p, M));

    vm.commit(p, 64 * K, false).unwrap();
    vm.protect(p, 64 * K, Protection::ReadWrite, true).unwrap();
    // Safety: the range was committed read/write above.
    unsafe {
        let ptr = p as *mut u8;
        ptr.write(0xA5);
        ptr.add(64 * K - 1).write(0x5A);
        assert_eq!(ptr.read(), 0xA5);
    }
    vm.uncommit(p, 64 * K).unwrap();
    vm.release(p, M).unwrap();
    assert!(vm.ledger().is_empty());
    assert_eq!(vm.stats().reserved_bytes, 0);
}

#[test]
fn reserve_one_mib_aligned_to_four() {
    let vm = platform();
    let p = vm.reserve_aligned(M, 4 * M, false).unwrap();
    assert_eq!(p % (4 * M), 0);
    let mapping = vm.find_mapping(p).unwrap();
    assert!(mapping.end() >= p + M);
    vm.release(mapping.base, mapping.size).unwrap();
    assert!(vm.ledger().is_empty());
}

#[test]
#[should_panic(expected = "is not in any known mapping")]
fn commit_after_release_is_fatal() {
    let vm = platform();
    let p = vm.reserve(M, None, false).unwrap();
    vm.release(p, M).unwrap();
    let _ = vm.commit(p + 2_000_000, 4096, false);
}

#[test]
#[should_panic(expected = "from the middle of mapping")]
fn release_from_the_middle_is_fatal() {
    let vm = platform();
    let page = vm.page_size();
    let p = vm.reserve(M, None, false).unwrap();
    let _ = vm.release(p + page, page);
}

#[test]
fn trimmed_reservation_keeps_the_rest() {
    let vm = platform();
    let page = vm.page_size();
    let p = vm.reserve(16 * page, None, false).unwrap();
    vm.release(p, page).unwrap();
    vm.release(p + 15 * page, page).unwrap();
    let mapping = vm.find_mapping(p + page).unwrap();
    if vm.default_technique() == Technique::AnonymousMap {
        assert_eq!((mapping.base, mapping.size), (p + page, 14 * page));
    }
    vm.release(mapping.base, mapping.size).unwrap();
}

#[test]
fn requested_address_is_honoured_or_refused() {
    let vm = platform();
    let granularity = vm.allocation_granularity();
    let hole = vm.reserve_aligned(4 * granularity, granularity, false).unwrap();
    vm.release(hole, 4 * granularity).unwrap();

    match vm.reserve(4 * granularity, Some(hole), false) {
        Ok(p) => {
            assert_eq!(p, hole);
            // The same range cannot be handed out twice.
            let again = vm.reserve(granularity, Some(hole), false).unwrap_err();
            assert!(again.is_placement_failure(), "{again}");
            vm.release(p, 4 * granularity).unwrap();
        }
        // Another test may have claimed the hole in between.
        Err(e) => assert!(e.is_placement_failure(), "{e}"),
    }
}

#[test]
fn file_backed_reservation_shares_contents() {
    let vm = platform();
    let path = std::env::temp_dir().join(format!("platvm-scenario-{}.bin", std::process::id()));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();

    let size = 4 * vm.allocation_granularity();
    let p = vm.reserve_aligned_backed_by_file(size, vm.allocation_granularity(), &file).unwrap();
    assert_eq!(vm.find_mapping(p).unwrap().technique, Technique::FileMapping);
    assert!(file.metadata().unwrap().len() >= size as u64);
    // Safety: the view is mapped read/write for its whole size.
    unsafe { (p as *mut u8).write(7) };
    // File views cannot be uncommitted.
    assert!(matches!(vm.uncommit(p, vm.page_size()), Err(VmError::UncommitFailed(_))));
    vm.release(p, size).unwrap();

    drop(file);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn concurrent_reserve_and_release_reuse_addresses_safely() {
    let vm = Arc::new(platform());
    let page = vm.page_size();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let p = vm.reserve(16 * page, None, false).unwrap();
                    vm.release(p, 16 * page).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(vm.ledger().is_empty());
    assert_eq!(vm.stats().reserved_bytes, 0);
}

#[test]
fn concurrent_aligned_reservations_stay_disjoint() {
    let vm = Arc::new(platform());
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let p = vm.reserve_aligned(M, 4 * M, false).unwrap();
                    assert_eq!(p % (4 * M), 0);
                    let mapping = vm.find_mapping(p).unwrap();
                    vm.release(mapping.base, mapping.size).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(vm.ledger().is_empty());
}

// =====================================================================
// Simulated platforms
// =====================================================================

#[test]
fn windows_like_partial_release_uncommits_instead() {
    init_tracing();
    let sim = Arc::new(SimulatedVmOps::new(SimConfig::windows_like()));
    let vm = VirtualMemory::new(sim.clone(), VmConfig::default());
    assert_eq!(vm.allocation_granularity(), 64 * K);

    let p = vm.reserve(M, None, false).unwrap();
    vm.commit(p, M, false).unwrap();
    vm.release(p, 64 * K).unwrap();

    assert!(!sim.is_committed(p));
    assert!(sim.is_committed(p + 64 * K));
    assert_eq!(vm.find_mapping(p).map(|m| (m.base, m.size)), Some((p, M)));
    vm.release(p, M).unwrap();
    assert_eq!(sim.live_regions(), 0);
}

#[test]
fn large_pages_are_committed_for_life() {
    init_tracing();
    let sim = Arc::new(SimulatedVmOps::new(SimConfig {
        claimed_page_sizes: vec![2 * M],
        large_page_sizes: vec![2 * M],
        ..SimConfig::default()
    }));
    let config = VmConfig {
        use_large_pages: true,
        ..VmConfig::default()
    };
    let vm = VirtualMemory::new(sim.clone(), config);
    assert_eq!(vm.large_page_size(), Some(2 * M));

    let p = vm.reserve_with_large_pages(3 * M, 8 * M, None, false).unwrap();
    assert_eq!(p % (8 * M), 0);
    let mapping = vm.find_mapping(p).unwrap();
    assert_eq!((mapping.size, mapping.page_size), (4 * M, 2 * M));
    assert!(sim.is_committed(p));

    let commits = sim.calls().commit;
    vm.commit(p, M, false).unwrap();
    assert_eq!(sim.calls().commit, commits);
    assert!(matches!(vm.uncommit(p, M), Err(VmError::UncommitFailed(_))));
    vm.release(p, 4 * M).unwrap();
}

#[test]
fn commit_touching_pages_backs_them() {
    init_tracing();
    let sim = Arc::new(SimulatedVmOps::new(SimConfig::default()));
    let config = VmConfig {
        commit_touches_pages: true,
        numa_interleaving: true,
        ..VmConfig::default()
    };
    let vm = VirtualMemory::new(sim.clone(), config);
    let p = vm.reserve(16 * 4096, None, false).unwrap();
    vm.commit(p, 8 * 4096, false).unwrap();

    assert!(sim.is_touched(p) && sim.is_touched(p + 7 * 4096));
    assert!(!sim.is_touched(p + 8 * 4096));
    assert_eq!(sim.calls().numa_interleave, 1);
}

#[test]
#[should_panic(expected = "out of memory: cannot commit card table")]
fn commit_or_fatal_reports_out_of_memory() {
    init_tracing();
    let sim = Arc::new(SimulatedVmOps::new(SimConfig {
        fail_commits: true,
        ..SimConfig::default()
    }));
    let vm = VirtualMemory::new(sim, VmConfig::default());
    let p = vm.reserve(4 * 4096, None, false).unwrap();
    vm.commit_or_fatal(p, 4096, false, "cannot commit card table");
}

// =====================================================================
// Threads
// =====================================================================

#[test]
fn undersized_stack_is_raised_to_the_minimum() {
    init_tracing();
    let vm = VirtualMemory::platform(VmConfig::default());
    let manager = ThreadManager::for_memory(&vm);
    let minimum = manager.stack_policy().minimum(ThreadKind::Java);
    assert_eq!(manager.stack_policy().effective_size(ThreadKind::Java, 16 * K), minimum);

    let handle = manager.create("small", ThreadKind::Java, 16 * K, || {}).unwrap();
    manager.start_thread(&handle);
    assert_eq!(handle.wait_for_exit(), ExitStatus::Returned);
    manager.free(handle);
}

#[test]
fn entry_runs_only_after_start_thread() {
    init_tracing();
    let manager = ThreadManager::new(&VmConfig::default(), 4096);
    let hook = Arc::new(AtomicBool::new(false));
    let starting = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));

    let (h, s, v) = (hook.clone(), starting.clone(), violations.clone());
    let handle = manager
        .create("handshake", ThreadKind::VmInternal, 0, move || {
            if !s.load(Ordering::SeqCst) {
                v.fetch_add(1, Ordering::SeqCst);
            }
            h.store(true, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(handle.state(), ThreadState::Initialized);
    std::thread::sleep(Duration::from_millis(50));
    assert!(!hook.load(Ordering::SeqCst));

    starting.store(true, Ordering::SeqCst);
    manager.start_thread(&handle);
    assert_eq!(handle.wait_for_exit(), ExitStatus::Returned);
    assert!(hook.load(Ordering::SeqCst));
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn free_of_attached_thread_from_another_thread_is_fatal() {
    init_tracing();
    let manager = Arc::new(ThreadManager::new(&VmConfig::default(), 4096));
    let handle = manager.attach("embedder", ThreadKind::Java).unwrap();
    assert_eq!(handle.state(), ThreadState::Runnable);

    let other = Arc::clone(&manager);
    let result = std::thread::spawn(move || other.free(handle)).join();
    let payload = result.unwrap_err();
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(message.contains("free of attached thread 'embedder'"), "{message}");
}

#[test]
fn guard_pages_on_a_created_thread_stack() {
    init_tracing();
    if !cfg!(target_os = "linux") {
        return;
    }
    let vm = VirtualMemory::platform(VmConfig::default());
    let manager = ThreadManager::for_memory(&vm);
    let (tx, rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let handle = manager
        .create("guarded", ThreadKind::Java, 0, move || {
            let _ = tx.send(());
            let _ = done_rx.recv();
        })
        .unwrap();
    manager.start_thread(&handle);
    rx.recv().unwrap();

    let guards = StackGuardManager::new(&vm, GuardMode::Protect);
    let (low, size) = guards.guard_zone(&handle);
    assert_eq!(size, 4 * vm.page_size());
    // Safety: the thread sits near the top of its stack; the low end is unused.
    unsafe { guards.create_guard_pages(low, size) }.unwrap();
    assert!(guards.is_guarded(low, size));
    assert_eq!(vm.query_protection(low + size), Some(Access::READ_WRITE));
    // Safety: as above.
    unsafe { guards.remove_guard_pages(low, size) }.unwrap();
    assert!(!guards.is_guarded(low, size));

    done_tx.send(()).unwrap();
    assert_eq!(handle.wait_for_exit(), ExitStatus::Returned);
}
