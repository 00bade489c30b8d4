//! Tunables for the memory and thread layers.
//!
//! Values are read once, when a [`crate::VirtualMemory`] or
//! [`crate::ThreadManager`] is constructed, and never change afterwards.

use std::env;

/// Default cap on the C heap's growth used to keep reservations clear of
/// the program break.
pub const DEFAULT_MAX_DATA_SEGMENT: usize = 8 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Allow `reserve_with_large_pages`.
    pub use_large_pages: bool,
    /// Preferred large page size; 0 picks the smallest verified size.
    pub large_page_size: usize,
    /// Interleave committed memory across NUMA nodes.
    pub numa_interleaving: bool,
    /// Touch every page on commit so the OS backs it immediately.
    pub commit_touches_pages: bool,
    /// Reserve through System V shared memory where available.
    pub use_shared_memory: bool,
    /// Requested addresses in `[brk, brk + max_expected_data_segment)` are refused.
    pub max_expected_data_segment: usize,
    pub stack: StackConfig,
    /// OS thread creation attempts before giving up on `EAGAIN`.
    pub thread_create_attempts: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            use_large_pages: false,
            large_page_size: 0,
            numa_interleaving: false,
            commit_touches_pages: false,
            use_shared_memory: false,
            max_expected_data_segment: DEFAULT_MAX_DATA_SEGMENT,
            stack: StackConfig::default(),
            thread_create_attempts: 4,
        }
    }
}

/// Requested stack sizes per thread kind. Zero means the platform default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub java_thread_stack_size: usize,
    pub compiler_thread_stack_size: usize,
    pub vm_thread_stack_size: usize,
    /// Pages at the low end of a stack that must fault on access.
    pub guard_zone_pages: usize,
    /// Pages kept free above the guard zone for overflow handling.
    pub shadow_zone_pages: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            java_thread_stack_size: 0,
            compiler_thread_stack_size: 0,
            vm_thread_stack_size: 0,
            guard_zone_pages: 4,
            shadow_zone_pages: 20,
        }
    }
}

impl VmConfig {
    /// Defaults overridden by `PLATVM_*` environment variables. Malformed
    /// values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`VmConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let flag = |key: &str, slot: &mut bool| {
            if let Some(value) = lookup(key) {
                match parse_bool(&value) {
                    Some(b) => *slot = b,
                    None => tracing::warn!(target: "platvm::config", "ignoring {key}={value:?}: expected a boolean"),
                }
            }
        };
        let size = |key: &str, slot: &mut usize| {
            if let Some(value) = lookup(key) {
                match parse_size(&value) {
                    Some(n) => *slot = n,
                    None => tracing::warn!(target: "platvm::config", "ignoring {key}={value:?}: expected a size"),
                }
            }
        };

        flag("PLATVM_LARGE_PAGES", &mut config.use_large_pages);
        size("PLATVM_LARGE_PAGE_SIZE", &mut config.large_page_size);
        flag("PLATVM_NUMA_INTERLEAVING", &mut config.numa_interleaving);
        flag("PLATVM_COMMIT_TOUCH", &mut config.commit_touches_pages);
        flag("PLATVM_USE_SHM", &mut config.use_shared_memory);
        size("PLATVM_MAX_DATA_SEGMENT", &mut config.max_expected_data_segment);
        size("PLATVM_JAVA_STACK_SIZE", &mut config.stack.java_thread_stack_size);
        size("PLATVM_COMPILER_STACK_SIZE", &mut config.stack.compiler_thread_stack_size);
        size("PLATVM_VM_STACK_SIZE", &mut config.stack.vm_thread_stack_size);

        let mut attempts = config.thread_create_attempts as usize;
        size("PLATVM_THREAD_CREATE_ATTEMPTS", &mut attempts);
        config.thread_create_attempts = u32::try_from(attempts.max(1)).unwrap_or(u32::MAX);
        config
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `4096`, `64k`, `2M`, `1g` (binary multiples).
fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 10),
        (i, 'm' | 'M') => (&value[..i], 20),
        (i, 'g' | 'G') => (&value[..i], 30),
        _ => (value, 0),
    };
    let n: usize = digits.parse().ok()?;
    n.checked_mul(1usize << shift)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = VmConfig::from_lookup(|_| None);
        assert_eq!(config, VmConfig::default());
        assert_eq!(config.max_expected_data_segment, 8 << 30);
        assert_eq!(config.stack.guard_zone_pages, 4);
        assert_eq!(config.stack.shadow_zone_pages, 20);
        assert_eq!(config.thread_create_attempts, 4);
    }

    #[test]
    fn test_overrides() {
        let config = VmConfig::from_lookup(lookup(&[
            ("PLATVM_LARGE_PAGES", "true"),
            ("PLATVM_LARGE_PAGE_SIZE", "2M"),
            ("PLATVM_COMMIT_TOUCH", "1"),
            ("PLATVM_JAVA_STACK_SIZE", "512k"),
            ("PLATVM_MAX_DATA_SEGMENT", "1g"),
            ("PLATVM_THREAD_CREATE_ATTEMPTS", "0"),
        ]));
        assert!(config.use_large_pages);
        assert_eq!(config.large_page_size, 2 * 1024 * 1024);
        assert!(config.commit_touches_pages);
        assert_eq!(config.stack.java_thread_stack_size, 512 * 1024);
        assert_eq!(config.max_expected_data_segment, 1 << 30);
        assert_eq!(config.thread_create_attempts, 1);
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let config = VmConfig::from_lookup(lookup(&[
            ("PLATVM_USE_SHM", "maybe"),
            ("PLATVM_VM_STACK_SIZE", "lots"),
        ]));
        assert!(!config.use_shared_memory);
        assert_eq!(config.stack.vm_thread_stack_size, 0);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size(" 16m "), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size(""), None);
    }
}
