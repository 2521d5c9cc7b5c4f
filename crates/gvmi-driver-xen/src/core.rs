use gvmi_core::{MemoryAccess, VcpuId};

/// Conversion from external (libxen) types, avoiding orphan-rule friction.
pub trait FromExt<T> {
    /// Converts the external value.
    fn from_ext(value: T) -> Self;
}

/// The companion of [`FromExt`], implemented blanket-wise.
pub trait IntoExt<T> {
    /// Converts into the external value.
    fn into_ext(self) -> T;
}

impl<T, U> IntoExt<U> for T
where
    U: FromExt<T>,
{
    fn into_ext(self) -> U {
        U::from_ext(self)
    }
}

/// Fallible conversion from external (libxen) types.
pub trait TryFromExt<T>: Sized {
    /// The error produced when the value has no counterpart.
    type Error;

    /// Attempts the conversion.
    fn try_from_ext(value: T) -> Result<Self, Self::Error>;
}

impl FromExt<VcpuId> for xen::VcpuId {
    fn from_ext(value: VcpuId) -> Self {
        Self(value.into())
    }
}

impl FromExt<xen::VcpuId> for VcpuId {
    fn from_ext(value: xen::VcpuId) -> Self {
        Self(value.into())
    }
}

impl FromExt<MemoryAccess> for xen::MemoryAccess {
    fn from_ext(value: MemoryAccess) -> Self {
        Self::from_bits_truncate(value.bits())
    }
}

impl FromExt<xen::MemoryAccess> for MemoryAccess {
    fn from_ext(value: xen::MemoryAccess) -> Self {
        Self::from_bits_truncate(value.bits())
    }
}
