//! Architecture abstraction.
//!
//! The paging configuration of a guest is a runtime property: the same
//! driver can face a legacy 32-bit guest, a PAE guest, or a long-mode
//! guest, and the OS-view layer discovers which one only after probing.
//! [`Architecture`] implementations therefore take the [`PageMode`] as an
//! argument instead of fixing one walk strategy per type.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{Gfn, Pa, PageInfo, Va, VaPage, VmiCore, VmiDriver, VmiError};

/// The paging configuration in force in the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageMode {
    /// x86 32-bit paging (2-level, 4K/4M pages).
    Legacy,

    /// x86 Physical Address Extension (3-level, 4K/2M pages).
    Pae,

    /// x86 IA-32e paging (4-level, 4K/2M/1G pages).
    Ia32e,

    /// ARM short-descriptor paging (2-level, 1K/4K/64K/1M/16M pages).
    Aarch32,
}

impl PageMode {
    /// Returns the pointer width of the mode in bytes.
    pub fn address_width(self) -> usize {
        match self {
            Self::Legacy => 4,
            Self::Pae => 4,
            Self::Ia32e => 8,
            Self::Aarch32 => 4,
        }
    }

    /// Checks whether the translation root is narrower than 64 bits in this
    /// mode. Roots obtained from 64-bit reads must be masked accordingly.
    pub fn root_is_32bit(self) -> bool {
        !matches!(self, Self::Ia32e)
    }
}

/// Defines an interface for CPU architecture-specific operations and
/// constants.
pub trait Architecture {
    /// The size of a memory page in bytes.
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between frame numbers and
    /// physical addresses.
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page base from a full address.
    const PAGE_MASK: u64;

    /// The complete set of CPU registers for the architecture.
    type Registers: Registers;

    /// Options for event monitoring.
    type EventMonitor: Debug;

    /// Architecture-specific event details.
    type EventReason: Debug;

    /// Converts a guest physical address to a guest frame number.
    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    /// Converts a guest frame number to a guest physical address.
    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    /// Aligns a virtual address down to its page base.
    fn va_align_down(va: Va) -> Va {
        va & Self::PAGE_MASK
    }

    /// The paging modes this architecture can operate in, in the order the
    /// page-mode discovery should probe them.
    fn modes() -> &'static [PageMode];

    /// Performs a full pagetable walk to translate a virtual address to a
    /// physical address.
    ///
    /// A non-present entry at any level fails with
    /// [`VmiError::Translation`].
    fn translate<Driver>(
        vmi: &VmiCore<Driver>,
        va: Va,
        root: Pa,
        mode: PageMode,
    ) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>;

    /// Performs a pagetable walk, recording every consulted entry.
    ///
    /// Unlike [`translate`], a non-present entry is not an error here: it
    /// simply terminates the record with `pa = None`. Driver failures while
    /// reading the tables still propagate.
    ///
    /// [`translate`]: Self::translate
    fn translation<Driver>(
        vmi: &VmiCore<Driver>,
        va: Va,
        root: Pa,
        mode: PageMode,
    ) -> Result<PageInfo, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>;

    /// Collects every mapped page under the given root.
    ///
    /// The sweep is depth-first and deterministic; the result is sorted by
    /// virtual address. Translation holes are skipped, not errors.
    fn va_pages<Driver>(
        vmi: &VmiCore<Driver>,
        root: Pa,
        mode: PageMode,
    ) -> Result<Vec<VaPage>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>;
}

/// Complete set of CPU registers for a specific architecture.
pub trait Registers
where
    Self: Debug + Default + Clone + Copy,
{
    /// General-purpose registers of the architecture.
    type GpRegisters: Debug + Default + Clone + Copy;

    /// Returns the current value of the instruction pointer.
    fn instruction_pointer(&self) -> u64;

    /// Returns the current value of the stack pointer.
    fn stack_pointer(&self) -> u64;

    /// Returns a copy of all general-purpose registers.
    fn gp_registers(&self) -> Self::GpRegisters;

    /// Sets all general-purpose registers.
    fn set_gp_registers(&mut self, gp: &Self::GpRegisters);

    /// Returns the physical address of the root of the current pagetable
    /// hierarchy.
    fn translation_root(&self) -> Pa;

    /// Returns the pagetable root that resolves a specific virtual
    /// address.
    ///
    /// On most architectures one register roots the whole address space
    /// and this is [`translation_root`]. Architectures with a split root
    /// (ARM's TTBR0/TTBR1 under the `TTBCR.N` boundary) select per VA.
    ///
    /// [`translation_root`]: Self::translation_root
    fn translation_root_for(&self, va: Va) -> Pa {
        let _ = va;
        self.translation_root()
    }

    /// Determines the paging mode from the register state, or `None` when
    /// paging is disabled.
    fn paging_mode(&self) -> Option<PageMode>;

    /// Returns the pointer width in bytes implied by the register state,
    /// or zero when paging is disabled.
    fn address_width(&self) -> usize {
        self.paging_mode().map_or(0, PageMode::address_width)
    }
}
