/// Control registers that can be monitored for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlRegister {
    /// `CR0` control register.
    Cr0,

    /// `CR3` control register.
    Cr3,

    /// `CR4` control register.
    Cr4,

    /// `XCR0` extended control register.
    Xcr0,
}

/// `CR0` control register.
///
/// Manages the processor's operating mode: protected mode, paging, and
/// various CPU features.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr0(pub u64);

impl Cr0 {
    /// Checks if the CR0.PE flag is set (protected mode enabled).
    pub fn protection_enable(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the CR0.WP flag is set (supervisor write protection).
    pub fn write_protect(self) -> bool {
        (self.0 >> 16) & 1 != 0
    }

    /// Checks if the CR0.PG flag is set (paging enabled).
    pub fn paging(self) -> bool {
        (self.0 >> 31) & 1 != 0
    }
}

impl std::fmt::Debug for Cr0 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr0")
            .field("protection_enable", &self.protection_enable())
            .field("write_protect", &self.write_protect())
            .field("paging", &self.paging())
            .finish()
    }
}

/// `CR2` control register: the page-fault linear address.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr2(pub u64);

impl std::fmt::Debug for Cr2 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Cr2(0x{:016x})", self.0)
    }
}

/// `CR3` control register.
///
/// Contains the physical address of the pagetable root and the PCID.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Returns the Process Context Identifier (PCID).
    pub fn pcid(self) -> u16 {
        (self.0 & 0xfff) as _
    }

    /// Returns the pagetable root page frame number.
    pub fn page_frame_number(self) -> u64 {
        self.0 >> 12 & 0x000f_ffff_ffff_ffff
    }
}

impl std::fmt::Debug for Cr3 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr3")
            .field("pcid", &self.pcid())
            .field("page_frame_number", &self.page_frame_number())
            .finish()
    }
}

/// `CR4` control register.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr4(pub u64);

impl Cr4 {
    /// Checks if the CR4.PSE flag is set (4MB pages in legacy mode).
    pub fn page_size_extensions(self) -> bool {
        (self.0 >> 4) & 1 != 0
    }

    /// Checks if the CR4.PAE flag is set (Physical Address Extension).
    pub fn physical_address_extension(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    /// Checks if the CR4.LA57 flag is set (57-bit linear addresses).
    pub fn linear_address_57_bit(self) -> bool {
        (self.0 >> 12) & 1 != 0
    }
}

impl std::fmt::Debug for Cr4 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr4")
            .field("page_size_extensions", &self.page_size_extensions())
            .field(
                "physical_address_extension",
                &self.physical_address_extension(),
            )
            .field("linear_address_57_bit", &self.linear_address_57_bit())
            .finish()
    }
}

macro_rules! impl_from {
    ($name:ident) => {
        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

impl_from!(Cr0);
impl_from!(Cr2);
impl_from!(Cr3);
impl_from!(Cr4);
