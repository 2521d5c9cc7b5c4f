use serde::{Deserialize, Serialize};

use super::macros::impl_ops;
use crate::AddressContext;

impl_ops!(Gfn, u64, "Guest Frame Number");
impl_ops!(Pa, u64, "Guest Physical Address");
impl_ops!(Va, u64, "Guest Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Pa {
    /// Checks if the physical address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The mechanism used for translating an address during a memory access.
///
/// Symbolic addressing forms (process id, kernel symbol) are resolved by the
/// OS-view layer down to one of these two mechanisms before the access
/// reaches the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TranslationMechanism {
    /// Direct mapping; the address is a guest physical address.
    Direct,

    /// Paging-based translation through the guest's pagetables.
    Paging {
        /// The root of the paging hierarchy (CR3 on x86, TTBR on ARM).
        /// `None` selects the kernel directory table base of the instance.
        root: Option<Pa>,
    },
}

/// The context of a single memory access: an address and the mechanism used
/// to translate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    /// The address to access. Interpreted as a virtual or physical address
    /// depending on [`mechanism`].
    ///
    /// [`mechanism`]: Self::mechanism
    pub address: u64,

    /// The mechanism used for address translation.
    pub mechanism: TranslationMechanism,
}

impl AccessContext {
    /// Creates a new `AccessContext` with direct mapping.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self {
            address: u64::from(address.into()),
            mechanism: TranslationMechanism::Direct,
        }
    }

    /// Creates a new `AccessContext` with paging-based translation.
    pub fn paging(address: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging {
                root: Some(root.into()),
            },
        }
    }

    /// Creates a new `AccessContext` translated through the kernel directory
    /// table base.
    pub fn kernel(address: impl Into<Va>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging { root: None },
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::direct(value)
    }
}

impl From<(Va, Pa)> for AccessContext {
    fn from(value: (Va, Pa)) -> Self {
        Self::paging(value.0, value.1)
    }
}

impl From<AddressContext> for AccessContext {
    fn from(value: AddressContext) -> Self {
        Self::paging(value.va, value.root)
    }
}

impl ::std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address + rhs,
            ..self
        }
    }
}

impl ::std::ops::AddAssign<u64> for AccessContext {
    fn add_assign(&mut self, rhs: u64) {
        self.address += rhs;
    }
}

impl ::std::ops::Sub<u64> for AccessContext {
    type Output = AccessContext;

    fn sub(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address - rhs,
            ..self
        }
    }
}
