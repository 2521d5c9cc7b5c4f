mod access_context;
mod address_context;
mod info;
pub(crate) mod macros;
mod memory_access;
mod page_info;
mod vcpu_id;

pub use self::{
    access_context::{AccessContext, Gfn, Pa, TranslationMechanism, Va},
    address_context::AddressContext,
    info::VmiInfo,
    memory_access::MemoryAccess,
    page_info::{PageInfo, PageTableEntryInfo, VaPage},
    vcpu_id::VcpuId,
};
