use smallvec::SmallVec;

use super::{Pa, Va};

/// Location and raw value of a single pagetable entry consulted during a
/// walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntryInfo {
    /// Physical address the entry was read from.
    pub address: Pa,

    /// Raw entry value (32-bit entries are zero-extended).
    pub value: u64,
}

/// The record produced by a pagetable walk.
///
/// Analysis clients get the full trail: every entry that was consulted, the
/// effective page size of the leaf, and the resulting physical address when
/// the walk completed.
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// The physical address, if every level of the walk was present.
    pub pa: Option<Pa>,

    /// Effective page size of the leaf entry (4K/2M/1G on x86;
    /// 1K/4K/64K/1M/16M on ARM). Zero until a leaf is reached.
    pub size: u64,

    /// The entries consulted, from the top level down.
    pub entries: SmallVec<[PageTableEntryInfo; 4]>,
}

impl PageInfo {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self {
            pa: None,
            size: 0,
            entries: SmallVec::new(),
        }
    }

    /// Records one consulted entry.
    pub fn push(&mut self, address: Pa, value: u64) {
        self.entries.push(PageTableEntryInfo { address, value });
    }

    /// Checks whether the walk reached a present leaf.
    pub fn present(&self) -> bool {
        self.pa.is_some()
    }
}

impl Default for PageInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// One leaf of a "collect all mapped pages" pagetable sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaPage {
    /// First virtual address covered by the page.
    pub va: Va,

    /// Backing physical address.
    pub pa: Pa,

    /// Page size in bytes.
    pub size: u64,
}

impl VaPage {
    /// Last virtual address covered by the page (inclusive).
    pub fn va_end(&self) -> Va {
        self.va + (self.size - 1)
    }

    /// Last physical address covered by the page (inclusive).
    pub fn pa_end(&self) -> Pa {
        self.pa + (self.size - 1)
    }
}
