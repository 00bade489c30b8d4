//! Unrecoverable failures.
//!
//! Contract violations (a caller handing back memory it does not own) and
//! out-of-memory conditions during mandatory commits cannot be handled by
//! the caller. They are logged at `error` level with a dump of the memory
//! state and then abort the current thread of control by panicking.

use std::fmt;
use std::io;

use super::ledger::Ledger;
use super::page_size::MultipageCapabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    ContractViolation,
    OutOfMemory,
    Initialization,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FatalKind::ContractViolation => "contract violation",
            FatalKind::OutOfMemory => "out of memory",
            FatalKind::Initialization => "initialization failure",
        })
    }
}

#[derive(Debug, Clone)]
pub struct FatalReport {
    kind: FatalKind,
    message: String,
    os_error: Option<String>,
    page_sizes: Option<String>,
    mappings: Option<String>,
}

impl FatalReport {
    fn new(kind: FatalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            os_error: None,
            page_sizes: None,
            mappings: None,
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(FatalKind::ContractViolation, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(FatalKind::OutOfMemory, message)
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::new(FatalKind::Initialization, message)
    }

    #[must_use]
    pub fn with_os_error(mut self, error: &io::Error) -> Self {
        self.os_error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, caps: &MultipageCapabilities) -> Self {
        self.page_sizes = Some(caps.to_string());
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: &Ledger) -> Self {
        self.mappings = Some(ledger.to_string());
        self
    }

    #[must_use]
    pub fn kind(&self) -> FatalKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(error) = &self.os_error {
            write!(f, " (OS error: {error})")?;
        }
        if let Some(page_sizes) = &self.page_sizes {
            write!(f, "\n{page_sizes}")?;
        }
        if let Some(mappings) = &self.mappings {
            write!(f, "\n{mappings}")?;
        }
        Ok(())
    }
}

/// Log `report` and stop.
#[track_caller]
pub fn fatal(report: FatalReport) -> ! {
    tracing::error!(target: "platvm::fatal", kind = %report.kind, "{report}");
    panic!("{report}")
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_report_formats_sections() {
        let report = FatalReport::out_of_memory("cannot commit heap")
            .with_os_error(&io::Error::from_raw_os_error(12));
        let text = report.to_string();
        assert!(text.starts_with("out of memory: cannot commit heap (OS error:"));
        assert_eq!(report.kind(), FatalKind::OutOfMemory);
    }

    #[test]
    fn test_report_includes_ledger_dump() {
        let ledger = Ledger::new();
        let text = FatalReport::contract("bad range").with_ledger(&ledger).to_string();
        assert!(text.contains("OS mappings (0):"));
    }

    #[test]
    #[should_panic(expected = "contract violation: double free")]
    fn test_fatal_panics_with_report() {
        fatal(FatalReport::contract("double free"));
    }
}
