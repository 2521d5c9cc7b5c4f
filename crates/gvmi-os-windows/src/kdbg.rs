//! The in-memory kernel debugger data block (KDBG).
//!
//! When no profile is available, the `_KDDEBUGGER_DATA64` block is the next
//! best symbol source: it carries the kernel base and a fixed set of
//! pointers to well-known kernel globals, and it can be located by its
//! `KDBG` owner tag in physical memory.

use gvmi_core::{AccessContext, Pa, Va, VmiCore, VmiDriver, VmiError};

/// The owner tag preceding the debugger data (offset 16 of the block).
const OWNER_TAG: &[u8] = b"KDBG";

/// Offset of the owner tag within `_KDDEBUGGER_DATA64`.
const OWNER_TAG_OFFSET: u64 = 16;

// Field offsets within `_KDDEBUGGER_DATA64`. The layout is fixed by the
// debugger protocol and does not vary across Windows versions.
const KERN_BASE: u64 = 0x18;
const PS_LOADED_MODULE_LIST: u64 = 0x48;
const PS_ACTIVE_PROCESS_HEAD: u64 = 0x50;
const PSP_CID_TABLE: u64 = 0x58;
const MM_PFN_DATABASE: u64 = 0xc0;
const MM_LOADED_USER_IMAGE_LIST: u64 = 0x158;

/// A located kernel debugger data block.
#[derive(Debug, Clone, Copy)]
pub struct Kdbg {
    /// Physical address of the block.
    pub pa: Pa,
}

impl Kdbg {
    /// Scans physical memory for the `KDBG` owner tag.
    ///
    /// Translation holes and unreadable pages are skipped; the first block
    /// whose tag sits at the expected offset alignment wins.
    pub fn find<Driver>(vmi: &VmiCore<Driver>) -> Result<Option<Self>, VmiError>
    where
        Driver: VmiDriver,
    {
        let info = vmi.info()?;
        let finder = memchr::memmem::Finder::new(OWNER_TAG);

        let mut pa = 0u64;
        while pa + info.page_size <= info.max_pa.0 {
            let gfn = gvmi_core::Gfn(pa >> info.page_shift);

            if let Ok(page) = vmi.read_page(gfn) {
                for hit in finder.find_iter(&page) {
                    let hit = hit as u64;
                    if hit < OWNER_TAG_OFFSET {
                        continue;
                    }

                    let block = Self {
                        pa: Pa(pa + hit - OWNER_TAG_OFFSET),
                    };

                    if block.plausible(vmi) {
                        tracing::debug!(pa = %block.pa, "found KDBG block");
                        return Ok(Some(block));
                    }
                }
            }

            pa += info.page_size;
        }

        Ok(None)
    }

    /// Creates a block handle from a known physical address.
    pub fn at(pa: Pa) -> Self {
        Self { pa }
    }

    /// Sanity check: the kernel base pointer must look like a kernel-space
    /// virtual address.
    fn plausible<Driver>(&self, vmi: &VmiCore<Driver>) -> bool
    where
        Driver: VmiDriver,
    {
        match self.read_field(vmi, KERN_BASE) {
            Ok(va) => va.0 >= 0xffff_0000_0000_0000 || (va.0 >= 0x8000_0000 && va.0 < 1 << 32),
            Err(_) => false,
        }
    }

    fn read_field<Driver>(&self, vmi: &VmiCore<Driver>, offset: u64) -> Result<Va, VmiError>
    where
        Driver: VmiDriver,
    {
        Ok(Va(vmi.read_u64(AccessContext::direct(self.pa + offset))?))
    }

    /// Returns the kernel image base recorded in the block.
    pub fn kernel_base<Driver>(&self, vmi: &VmiCore<Driver>) -> Result<Va, VmiError>
    where
        Driver: VmiDriver,
    {
        self.read_field(vmi, KERN_BASE)
    }

    /// Resolves one of the symbols carried by the block.
    pub fn lookup<Driver>(&self, vmi: &VmiCore<Driver>, symbol: &str) -> Result<Va, VmiError>
    where
        Driver: VmiDriver,
    {
        let offset = match symbol {
            "KernBase" => KERN_BASE,
            "PsLoadedModuleList" => PS_LOADED_MODULE_LIST,
            "PsActiveProcessHead" => PS_ACTIVE_PROCESS_HEAD,
            "PspCidTable" => PSP_CID_TABLE,
            "MmPfnDatabase" => MM_PFN_DATABASE,
            "MmLoadedUserImageList" => MM_LOADED_USER_IMAGE_LIST,
            _ => return Err(VmiError::NotSupported),
        };

        let va = self.read_field(vmi, offset)?;
        if va.is_null() {
            return Err(VmiError::Other("KDBG field is empty"));
        }

        Ok(va)
    }
}
