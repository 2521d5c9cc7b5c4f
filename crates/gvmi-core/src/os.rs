//! OS-view abstraction.
//!
//! An OS-view reconstructs operating-system structures (process lists,
//! kernel symbol tables, per-process directory table bases) from raw
//! physical memory access. The view never stores a back-pointer to the
//! instance; every method borrows the [`VmiCore`] it reads through, keeping
//! ownership strictly one-way.

use serde::{Deserialize, Serialize};

use crate::{AddressContext, Pa, Va, VmiCore, VmiDriver, VmiError};

/// A process ID within the guest OS.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The conventional pid of the kernel address space.
    pub const KERNEL: ProcessId = ProcessId(0);
}

impl From<u32> for ProcessId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ProcessId> for u32 {
    fn from(value: ProcessId) -> Self {
        value.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One process reconstructed from the guest's kernel process list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsProcess {
    /// Kernel virtual address of the process control block
    /// (`task_struct` / `EPROCESS`).
    pub object: Va,

    /// The process ID.
    pub id: ProcessId,

    /// The directory table base rooting the process address space.
    pub translation_root: Pa,

    /// Short process name (`comm` / `ImageFileName`).
    pub name: String,
}

/// The operating system family of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsType {
    /// A Linux guest.
    Linux,

    /// A Windows guest.
    Windows,
}

/// Operating system view trait.
///
/// Implementations hold parsed profile data and struct offsets; the
/// heavyweight discovery work (kernel base, `kpgd`, paging mode) happens in
/// [`init`] and populates the paging state of the borrowed core.
///
/// [`init`]: Self::init
pub trait VmiOs<Driver>
where
    Driver: VmiDriver,
{
    /// Completes the OS-specific part of instance initialization.
    ///
    /// On success the core's `kpgd`, `page_mode` and `init_task` are set and
    /// consistent: translating the kernel image base through `kpgd` under
    /// the discovered mode yields the known kernel physical base. On failure
    /// no partial state is left behind in the core.
    fn init(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError>;

    /// Returns a cached, OS-defined struct offset by its configuration name
    /// (e.g. `linux_tasks`, `win_pdbase`).
    fn get_offset(&self, name: &str) -> Result<u64, VmiError>;

    /// Walks the kernel process list to find the directory table base of a
    /// process.
    fn pid_to_pgd(&self, vmi: &VmiCore<Driver>, pid: ProcessId) -> Result<Pa, VmiError>;

    /// Walks the kernel process list to find the process owning a directory
    /// table base.
    fn pgd_to_pid(&self, vmi: &VmiCore<Driver>, pgd: Pa) -> Result<ProcessId, VmiError>;

    /// Resolves a kernel symbol to a kernel virtual address.
    fn ksym_to_va(&self, vmi: &VmiCore<Driver>, symbol: &str) -> Result<Va, VmiError>;

    /// Enumerates the kernel process list.
    fn processes(&self, vmi: &VmiCore<Driver>) -> Result<Vec<OsProcess>, VmiError>;

    /// Decodes a guest OS Unicode-string structure at the given address.
    fn read_unicode_string(
        &self,
        vmi: &VmiCore<Driver>,
        ctx: AddressContext,
    ) -> Result<String, VmiError>;
}
