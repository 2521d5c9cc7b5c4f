//! VMI driver for Xen domains.
//!
//! Built on the Xen control libraries: foreign-memory maps for page
//! access, the domain control interface for registers and lifecycle, and
//! the vm_event monitor ring for asynchronous events (control-register
//! writes, breakpoints and debug exceptions, page-granular memory access,
//! single-step).

mod arch;
mod core;
mod driver;
mod error;

use std::time::Duration;

use gvmi_core::{
    Architecture, Gfn, Pa, VcpuId, VmiConfig, VmiDriver, VmiError, VmiEvent, VmiEventResponse,
    VmiInfo, VmiMappedPage,
};
use xen::XenDomainId;

pub use self::{arch::ArchAdapter, driver::XenDriver, error::Error};
pub(crate) use self::core::{FromExt, IntoExt, TryFromExt};

/// VMI driver for Xen domains.
pub struct VmiXenDriver<Arch>
where
    Arch: Architecture + ArchAdapter,
{
    inner: XenDriver<Arch>,
}

impl<Arch> VmiXenDriver<Arch>
where
    Arch: Architecture + ArchAdapter,
{
    /// Connects to a Xen domain by id.
    pub fn new(domain_id: u32) -> Result<Self, VmiError> {
        Ok(Self {
            inner: XenDriver::new(XenDomainId(domain_id))?,
        })
    }

    /// Connects to the Xen domain named by the instance configuration.
    pub fn from_config(config: &VmiConfig) -> Result<Self, VmiError> {
        config.require_target()?;

        let domain_id = config
            .domain_id
            .ok_or_else(|| VmiError::Config("the Xen backend needs `domid`".into()))?;

        Self::new(domain_id as u32)
    }
}

impl<Arch> VmiDriver for VmiXenDriver<Arch>
where
    Arch: Architecture + ArchAdapter,
{
    type Architecture = Arch;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(self.inner.info()?)
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        Ok(self.inner.read_page(gfn)?)
    }

    fn write(&self, pa: Pa, content: &[u8]) -> Result<(), VmiError> {
        Ok(self.inner.write(pa, content)?)
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Arch::Registers, VmiError> {
        Ok(self.inner.registers(vcpu)?)
    }

    fn set_registers(&self, vcpu: VcpuId, registers: Arch::Registers) -> Result<(), VmiError> {
        Ok(self.inner.set_registers(vcpu, registers)?)
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(self.inner.pause()?)
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(self.inner.resume()?)
    }

    fn monitor_enable(&self, option: Arch::EventMonitor) -> Result<(), VmiError> {
        Ok(self.inner.monitor_enable(option)?)
    }

    fn monitor_disable(&self, option: Arch::EventMonitor) -> Result<(), VmiError> {
        Ok(self.inner.monitor_disable(option)?)
    }

    fn events_pending(&self) -> usize {
        self.inner.events_pending()
    }

    fn listen(
        &self,
        timeout: Duration,
        handler: impl FnMut(&VmiEvent<Arch>) -> VmiEventResponse<Arch>,
    ) -> Result<(), VmiError> {
        Ok(self.inner.listen(timeout, handler)?)
    }

    fn reset_state(&self) -> Result<(), VmiError> {
        Ok(self.inner.reset_state()?)
    }
}
