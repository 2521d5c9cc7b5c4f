//! x86/AMD64 architecture definitions.

mod cr;
mod efer;
mod event;
mod paging;
mod registers;
mod translation;

#[cfg(test)]
mod translation_tests;

use gvmi_core::{Architecture, Pa, PageInfo, PageMode, Va, VaPage, VmiCore, VmiDriver, VmiError};

pub use self::{
    cr::{ControlRegister, Cr0, Cr2, Cr3, Cr4},
    efer::MsrEfer,
    event::{
        EventInterrupt, EventMemoryAccess, EventMonitor, EventReason, EventSinglestep,
        EventWriteRegister, ExceptionVector, Interrupt, InterruptType, MonitoredRegister,
    },
    paging::{PageTableEntry, PageTableLevel},
    registers::{GpRegisters, Registers},
};

/// AMD64 architecture.
///
/// Covers the three x86 paging configurations a guest can run in: legacy
/// 32-bit, PAE, and IA-32e. The configuration is a runtime property of the
/// guest, discovered by the OS view, so the walk strategy is selected per
/// call.
#[derive(Debug)]
pub struct Amd64;

impl Architecture for Amd64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type Registers = Registers;
    type EventMonitor = EventMonitor;
    type EventReason = EventReason;

    fn modes() -> &'static [PageMode] {
        // Probe order of the page-mode discovery: narrowest first, so a
        // 32-bit root masked down is tried before the 64-bit interpretation.
        &[PageMode::Legacy, PageMode::Pae, PageMode::Ia32e]
    }

    fn translate<Driver>(
        vmi: &VmiCore<Driver>,
        va: Va,
        root: Pa,
        mode: PageMode,
    ) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let mut info = PageInfo::new();
        translation::walk(vmi, va, root, mode, &mut info)?;

        info.pa.ok_or_else(|| VmiError::page_fault((va, root)))
    }

    fn translation<Driver>(
        vmi: &VmiCore<Driver>,
        va: Va,
        root: Pa,
        mode: PageMode,
    ) -> Result<PageInfo, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let mut info = PageInfo::new();
        translation::walk(vmi, va, root, mode, &mut info)?;
        Ok(info)
    }

    fn va_pages<Driver>(
        vmi: &VmiCore<Driver>,
        root: Pa,
        mode: PageMode,
    ) -> Result<Vec<VaPage>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        translation::va_pages(vmi, root, mode)
    }
}

impl Amd64 {
    /// Canonicalizes a 48-bit virtual address.
    pub fn va_canonical(va: Va) -> Va {
        if va.0 & (1 << 47) != 0 {
            Va(va.0 | 0xffff_0000_0000_0000)
        } else {
            Va(va.0 & 0x0000_ffff_ffff_ffff)
        }
    }
}
