//! ARM AArch32 (short-descriptor) architecture definitions.

mod registers;
mod translation;


use gvmi_core::{Architecture, Pa, PageInfo, PageMode, Va, VaPage, VmiCore, VmiDriver, VmiError};

pub use self::registers::{GpRegisters, Registers};

/// ARM AArch32 architecture with short-descriptor translation tables.
#[derive(Debug)]
pub struct Aarch32;

/// No asynchronous event support is defined for this architecture.
#[derive(Debug, Clone, Copy)]
pub enum NoEvents {}

impl Architecture for Aarch32 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type Registers = Registers;
    type EventMonitor = NoEvents;
    type EventReason = NoEvents;

    fn modes() -> &'static [PageMode] {
        &[PageMode::Aarch32]
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
        if mode != PageMode::Aarch32 {
            return Err(VmiError::NotSupported);
        }

        let mut info = PageInfo::new();
        translation::walk(vmi, va, root, &mut info)?;

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
        if mode != PageMode::Aarch32 {
            return Err(VmiError::NotSupported);
        }

        let mut info = PageInfo::new();
        translation::walk(vmi, va, root, &mut info)?;
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
        if mode != PageMode::Aarch32 {
            return Err(VmiError::NotSupported);
        }

        translation::va_pages(vmi, root)
    }
}
