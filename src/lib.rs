#[cfg(not(target_pointer_width = "64"))]
compile_error!("platvm supports only 64-bit targets.");

pub(crate) mod sync;

pub mod config;
pub mod memory;
pub mod thread;

// configuration
pub use config::{StackConfig, VmConfig};

// address space
pub use memory::ledger::{OsMapping, Technique};
pub use memory::page_size::{AltPageSize, MultipageCapabilities};
pub use memory::region::VirtualMemory;
pub use memory::sim::{SimConfig, SimulatedVmOps};
pub use memory::stats::VmStats;
pub use memory::vm::{Access, PlatformVmOps, Protection, VmOps};

// threads
pub use thread::guard::{GuardMode, StackGuardManager};
pub use thread::handle::{ExitStatus, ThreadHandle, ThreadState};
pub use thread::manager::{ThreadError, ThreadManager};
pub use thread::stack::{StackPolicy, ThreadKind};

// errors
pub use memory::fatal::{FatalKind, FatalReport};
pub use memory::vm::VmError;
