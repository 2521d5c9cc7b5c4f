use serde::{Deserialize, Serialize};

use super::{Pa, Va};

/// A virtual address paired with the translation root that makes it
/// meaningful.
///
/// Memory analysis constantly mixes addresses from different address spaces.
/// Carrying the root (CR3 on x86, TTBR on ARM) together with the virtual
/// address removes any ambiguity about which pagetables resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The virtual address.
    pub va: Va,

    /// The translation root (base of the pagetable hierarchy).
    pub root: Pa,
}

impl AddressContext {
    /// Creates a new `AddressContext`.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
        }
    }
}

impl From<(Va, Pa)> for AddressContext {
    fn from(value: (Va, Pa)) -> Self {
        Self {
            va: value.0,
            root: value.1,
        }
    }
}
