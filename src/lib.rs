//! # Guest memory introspection
//!
//! A hypervisor-agnostic library for reading, writing and translating
//! memory in a live or snapshotted guest operating system, without
//! cooperation from the guest.
//!
//! Clients name memory by guest physical address, guest virtual address
//! within a process, or kernel symbol; the library translates these
//! through the guest's paging structures and delivers byte-level access.
//! When the backend supports it, asynchronous VM events (register writes,
//! memory-access violations, software interrupts, single-step) are
//! delivered through a synchronous listen loop.
//!
//! # Structure
//!
//! - [`VmiCore`] owns a driver, the page and translation caches, and the
//!   paging state discovered during initialization.
//! - An OS view ([`os::linux::LinuxOs`], [`os::windows::WindowsOs`])
//!   reconstructs process lists, symbol tables and per-process directory
//!   table bases from raw physical access.
//! - [`VmiSession`] couples the two and resolves the symbolic addressing
//!   forms (process id, kernel symbol) down to `(va, dtb)` pairs.
//! - Drivers ([`VmiKvmDriver`], [`VmiXenDriver`], [`VmiFileDriver`])
//!   implement the capability set their substrate can deliver; everything
//!   else reports [`VmiError::NotSupported`].
//!
//! # Example
//!
//! ```no_run
//! use gvmi::{VmiConfig, VmiCore, VmiSession};
//! use gvmi::driver::kvm::VmiKvmDriver;
//! use gvmi::os::linux::LinuxOs;
//!
//! # fn example() -> Result<(), gvmi::VmiError> {
//! let config = VmiConfig::from_config_str("name=debian12\nsysmap=/boot/System.map")?;
//!
//! let driver = VmiKvmDriver::from_config(&config)?;
//! let core = VmiCore::new(driver)?;
//! let os = LinuxOs::new(&config)?;
//!
//! let session = VmiSession::new(&core, &os);
//! session.complete_init()?;
//!
//! for process in session.processes()? {
//!     println!("{:>6} {}", process.id, process.name);
//! }
//! # Ok(())
//! # }
//! ```

pub use gvmi_core::{
    AccessContext, AddressContext, Architecture, Gfn, LinuxConfig, MemoryAccess, OsProcess,
    OsType, Pa, PageFaults, PageInfo, PageMode, PageTableEntryInfo, ProcessId, Registers,
    TranslationMechanism, Va, VaPage, VcpuId, VmiConfig, VmiCore, VmiDriver, VmiError, VmiEvent,
    VmiEventResponse, VmiEventResponseFlags, VmiFlags, VmiInfo, VmiMappedPage, VmiOs,
    VmiPauseGuard, VmiSession, WindowsConfig,
};
pub use gvmi_profile::{Profile, ProfileError};

/// Architecture definitions.
pub mod arch {
    #[cfg(feature = "arch-aarch32")]
    pub use gvmi_arch_aarch32 as aarch32;
    #[cfg(feature = "arch-amd64")]
    pub use gvmi_arch_amd64 as amd64;
}

/// OS views.
pub mod os {
    #[cfg(feature = "os-linux")]
    pub use gvmi_os_linux as linux;
    #[cfg(feature = "os-windows")]
    pub use gvmi_os_windows as windows;
}

/// Drivers.
pub mod driver {
    #[cfg(feature = "driver-file")]
    pub use gvmi_driver_file as file;
    #[cfg(feature = "driver-kvm")]
    pub use gvmi_driver_kvm as kvm;
    #[cfg(feature = "driver-xen")]
    pub use gvmi_driver_xen as xen;
}

#[cfg(feature = "arch-amd64")]
pub use gvmi_arch_amd64::Amd64;

#[cfg(feature = "arch-aarch32")]
pub use gvmi_arch_aarch32::Aarch32;

#[cfg(feature = "driver-file")]
pub use gvmi_driver_file::VmiFileDriver;

#[cfg(feature = "driver-kvm")]
pub use gvmi_driver_kvm::VmiKvmDriver;

#[cfg(feature = "driver-xen")]
pub use gvmi_driver_xen::VmiXenDriver;
