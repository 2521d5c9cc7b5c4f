//! VMI driver abstraction.
//!
//! A driver exposes a uniform capability set over a concrete backend (KVM,
//! Xen, a raw memory image). Reading guest physical pages and reporting the
//! VM topology are the only required capabilities; everything else defaults
//! to [`VmiError::NotSupported`] so that a backend implements exactly what
//! its substrate can deliver.
//!
//! The `read_page` contract is the hot path: the returned handle borrows a
//! page-sized buffer that stays valid until the handle is dropped, and
//! concurrent calls for the same frame may return independent buffers (the
//! page cache above the driver coalesces them).

use std::time::Duration;

use crate::{
    Architecture, Gfn, Pa, ProcessId, Va, VaPage, VcpuId, VmiError, VmiEvent, VmiEventResponse,
    VmiInfo, VmiMappedPage,
};

/// A trait for implementing a VMI driver.
///
/// The `'static` lifetime is required in order to use the driver with the
/// OS-view enumerators.
pub trait VmiDriver: 'static {
    /// The architecture supported by the driver.
    type Architecture: Architecture + ?Sized;

    /// Returns information about the virtual machine.
    fn info(&self) -> Result<VmiInfo, VmiError>;

    /// Reads a page of memory from the virtual machine.
    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError>;

    /// Writes data to guest physical memory.
    ///
    /// The write is all-or-nothing: if any byte is rejected, the whole call
    /// fails and no partial-success is reported.
    fn write(&self, pa: Pa, content: &[u8]) -> Result<(), VmiError> {
        let _ = (pa, content);
        Err(VmiError::NotSupported)
    }

    /// Returns the registers of a specific virtual CPU.
    fn registers(
        &self,
        vcpu: VcpuId,
    ) -> Result<<Self::Architecture as Architecture>::Registers, VmiError> {
        let _ = vcpu;
        Err(VmiError::NotSupported)
    }

    /// Sets the registers of a specific virtual CPU.
    ///
    /// The effect of writing registers while the VM is unpaused is
    /// undefined.
    fn set_registers(
        &self,
        vcpu: VcpuId,
        registers: <Self::Architecture as Architecture>::Registers,
    ) -> Result<(), VmiError> {
        let _ = (vcpu, registers);
        Err(VmiError::NotSupported)
    }

    /// Pauses the virtual machine. Best effort; a file backend is a no-op.
    fn pause(&self) -> Result<(), VmiError> {
        Err(VmiError::NotSupported)
    }

    /// Resumes the virtual machine.
    fn resume(&self) -> Result<(), VmiError> {
        Err(VmiError::NotSupported)
    }

    /// Converts the live VM into a stable, zero-copy snapshot view.
    ///
    /// Must be paired with [`snapshot_destroy`], even on error paths, so
    /// that backing shared-memory objects are unlinked.
    ///
    /// [`snapshot_destroy`]: Self::snapshot_destroy
    fn snapshot_create(&self) -> Result<(), VmiError> {
        Err(VmiError::NotSupported)
    }

    /// Tears the snapshot down and restores live access.
    fn snapshot_destroy(&self) -> Result<(), VmiError> {
        Err(VmiError::NotSupported)
    }

    /// Checks whether a snapshot view is currently active.
    fn snapshot_active(&self) -> bool {
        false
    }

    /// Direct guest physical memory access (dgpma).
    ///
    /// Returns a zero-copy handle into the snapshot mapping at `pa` and the
    /// usable length, which is `count` clamped to the end of guest RAM.
    fn direct_physical(&self, pa: Pa, count: usize) -> Result<(VmiMappedPage, usize), VmiError> {
        let _ = (pa, count);
        Err(VmiError::NotSupported)
    }

    /// Direct guest virtual memory access (dgvma) lookup.
    ///
    /// Consults the per-pid v2m tables built by
    /// [`insert_virtual_mappings`]. Returns `None` when no table covers the
    /// address; the caller is expected to build one and retry.
    ///
    /// [`insert_virtual_mappings`]: Self::insert_virtual_mappings
    fn direct_virtual(
        &self,
        pid: ProcessId,
        va: Va,
        count: usize,
    ) -> Result<Option<(VmiMappedPage, usize)>, VmiError> {
        let _ = (pid, va, count);
        Err(VmiError::NotSupported)
    }

    /// Builds the v2m table for a pid from its enumerated pagetable leaves.
    ///
    /// `pages` must be sorted by virtual address (the order produced by
    /// [`Architecture::va_pages`]).
    fn insert_virtual_mappings(&self, pid: ProcessId, pages: &[VaPage]) -> Result<(), VmiError> {
        let _ = (pid, pages);
        Err(VmiError::NotSupported)
    }

    /// Enables monitoring of specific events.
    fn monitor_enable(
        &self,
        option: <Self::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError> {
        let _ = option;
        Err(VmiError::NotSupported)
    }

    /// Disables monitoring of specific events.
    fn monitor_disable(
        &self,
        option: <Self::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError> {
        let _ = option;
        Err(VmiError::NotSupported)
    }

    /// Returns the number of pending events.
    fn events_pending(&self) -> usize {
        0
    }

    /// Waits for events and processes them with the provided handler.
    ///
    /// Blocks up to `timeout`, then drains pending events in queue order,
    /// invoking the handler synchronously for each before returning. This is
    /// the sole point at which callbacks may fire.
    fn listen(
        &self,
        timeout: Duration,
        handler: impl FnMut(
            &VmiEvent<Self::Architecture>,
        ) -> VmiEventResponse<Self::Architecture>,
    ) -> Result<(), VmiError> {
        let _ = (timeout, handler);
        Err(VmiError::NotSupported)
    }

    /// Clears all event monitors and other stateful monitoring data.
    fn reset_state(&self) -> Result<(), VmiError> {
        Ok(())
    }
}
