mod amd64;

use gvmi_core::{Architecture, VcpuId, VmiEvent, VmiEventResponse};
use xen::{Architecture as XenArchitecture, ctrl::VmEvent};

use crate::{Error, XenDriver};

/// Architecture-specific glue between the Xen control interface and the
/// generic driver.
pub trait ArchAdapter: Architecture + Sized + 'static {
    /// The libxen architecture counterpart.
    type XenArch: XenArchitecture;

    /// Reads the full register state of a vCPU.
    fn registers(driver: &XenDriver<Self>, vcpu: VcpuId) -> Result<Self::Registers, Error>;

    /// Writes the full register state of a vCPU.
    fn set_registers(
        driver: &XenDriver<Self>,
        vcpu: VcpuId,
        registers: Self::Registers,
    ) -> Result<(), Error>;

    /// Translates a monitor option into vm_event subscriptions.
    fn monitor_enable(driver: &XenDriver<Self>, option: Self::EventMonitor) -> Result<(), Error>;

    /// Withdraws a monitor option.
    fn monitor_disable(driver: &XenDriver<Self>, option: Self::EventMonitor) -> Result<(), Error>;

    /// Converts one ring event, hands it to the handler, and writes the
    /// response back into the ring slot.
    fn process_event(
        driver: &XenDriver<Self>,
        event: &mut VmEvent,
        handler: impl FnMut(&VmiEvent<Self>) -> VmiEventResponse<Self>,
    ) -> Result<(), Error>;

    /// Clears every monitor subscription.
    fn reset_state(driver: &XenDriver<Self>) -> Result<(), Error>;
}
