use crate::AddressContext;

/// An error that can occur when working with the VMI.
///
/// Variants are coarse on purpose: they are oriented toward recovery
/// decisions, not diagnostics. The diagnostic trail goes through `tracing`.
#[derive(thiserror::Error, Debug)]
pub enum VmiError {
    /// The instance lacks required state for the call (e.g. the kernel
    /// directory table base has not been discovered yet).
    #[error("Instance not initialized for this operation")]
    NotInitialized,

    /// The driver or current mode does not implement the capability.
    #[error("Operation not supported")]
    NotSupported,

    /// A pagetable entry was absent or malformed.
    #[error("Translation error ({:?}, len: {})", .0[0], .0.len())]
    Translation(PageFaults),

    /// A driver round trip failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A required symbol or struct field is absent from the profile.
    #[error(transparent)]
    Profile(#[from] gvmi_profile::ProfileError),

    /// A required configuration key is absent or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error occurred in the VMI driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An OS-specific error occurred.
    #[error(transparent)]
    Os(Box<dyn std::error::Error + Send + Sync>),

    /// The given address width is invalid.
    #[error("Invalid address width")]
    InvalidAddressWidth,

    /// The given timeout is invalid.
    #[error("The given timeout is invalid")]
    InvalidTimeout,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// The paging root for a translation was not present.
    #[error("Root not present")]
    RootNotPresent,

    /// Timeout.
    #[error("Operation timed out")]
    Timeout,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[AddressContext; 1]>;

impl VmiError {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<AddressContext>) -> Self {
        Self::Translation(smallvec::smallvec![pf.into()])
    }

    /// Creates a new page fault error with multiple page faults.
    pub fn page_faults(pfs: impl IntoIterator<Item = AddressContext>) -> Self {
        Self::Translation(pfs.into_iter().collect())
    }
}
