use std::{
    cell::RefCell,
    os::fd::AsRawFd as _,
    time::Duration,
};

use gvmi_core::{
    Architecture, Gfn, Pa, VcpuId, VmiEvent, VmiEventResponse, VmiInfo, VmiMappedPage,
};
use xen::{
    XenControl, XenDeviceModel, XenDomain, XenDomainId, XenDomainInfo, XenEventChannelPort,
    XenForeignMemory, XenForeignMemoryProtection, XenMonitor, ctrl::VmEventRing,
};

use crate::{ArchAdapter, Error};

/// The Xen driver state: a domain handle plus the monitor ring used for
/// event delivery.
pub struct XenDriver<Arch>
where
    Arch: Architecture + ArchAdapter,
{
    pub(crate) domain: XenDomain<Arch::XenArch>,
    pub(crate) devicemodel: XenDeviceModel,
    pub(crate) monitor: XenMonitor,
    pub(crate) evtchn: XenEventChannelPort,
    pub(crate) foreign_memory: XenForeignMemory,
    pub(crate) info: XenDomainInfo,

    pub(crate) ring: RefCell<VmEventRing>,
}

impl<Arch> XenDriver<Arch>
where
    Arch: Architecture + ArchAdapter,
{
    pub fn new(domain_id: XenDomainId) -> Result<Self, Error> {
        let xc = XenControl::new()?;
        let domain = xc.domain(domain_id)?;

        let devicemodel = domain.device_model()?;
        let (monitor, ring) = domain.monitor()?;
        let evtchn = monitor.channel()?;
        let foreign_memory = XenForeignMemory::new()?;
        let info = domain.info()?;

        Ok(Self {
            domain,
            devicemodel,
            monitor,
            evtchn,
            foreign_memory,
            info,
            ring: RefCell::new(ring),
        })
    }

    pub fn info(&self) -> Result<VmiInfo, Error> {
        let max_gpfn = self.domain.maximum_gpfn()?;

        Ok(VmiInfo {
            page_size: Arch::PAGE_SIZE,
            page_shift: Arch::PAGE_SHIFT,
            ram_size: self.info.max_pages * Arch::PAGE_SIZE,
            max_pa: Pa((max_gpfn + 1) << Arch::PAGE_SHIFT),
            vcpus: self.info.max_vcpu_id + 1,
            hvm: true,
        })
    }

    pub fn pause(&self) -> Result<(), Error> {
        Ok(self.domain.pause()?)
    }

    pub fn resume(&self) -> Result<(), Error> {
        Ok(self.domain.unpause()?)
    }

    pub fn registers(&self, vcpu: VcpuId) -> Result<Arch::Registers, Error> {
        Arch::registers(self, vcpu)
    }

    pub fn set_registers(&self, vcpu: VcpuId, registers: Arch::Registers) -> Result<(), Error> {
        Arch::set_registers(self, vcpu, registers)
    }

    pub fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, Error> {
        let page = self.foreign_memory.map(
            self.domain.id(),
            XenForeignMemoryProtection::READ,
            &[u64::from(gfn)],
            None,
        )?;

        Ok(VmiMappedPage::new(page))
    }

    /// Writes within one page of guest physical memory. All or nothing:
    /// either the whole mapped write succeeds or nothing changes.
    pub fn write(&self, pa: Pa, content: &[u8]) -> Result<(), Error> {
        let gfn = Arch::gfn_from_pa(pa);
        let offset = Arch::pa_offset(pa) as usize;

        if offset + content.len() > Arch::PAGE_SIZE as usize {
            return Err(Error::OutOfBounds);
        }

        let mut page = self.foreign_memory.map(
            self.domain.id(),
            XenForeignMemoryProtection::WRITE,
            &[u64::from(gfn)],
            None,
        )?;

        page[offset..offset + content.len()].copy_from_slice(content);
        Ok(())
    }

    pub fn monitor_enable(&self, option: Arch::EventMonitor) -> Result<(), Error> {
        Arch::monitor_enable(self, option)
    }

    pub fn monitor_disable(&self, option: Arch::EventMonitor) -> Result<(), Error> {
        Arch::monitor_disable(self, option)
    }

    pub fn events_pending(&self) -> usize {
        self.ring.borrow().unconsumed_requests()
    }

    /// Blocks until the event channel fires or the timeout elapses, then
    /// drains the ring in queue order, dispatching each event to the
    /// handler before returning.
    pub fn listen(
        &self,
        timeout: Duration,
        mut handler: impl FnMut(&VmiEvent<Arch>) -> VmiEventResponse<Arch>,
    ) -> Result<(), Error> {
        let mut fds = [libc::pollfd {
            fd: self.evtchn.as_raw_fd(),
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        }];

        let timeout = timeout
            .as_millis()
            .try_into()
            .map_err(|_| Error::InvalidTimeout)?;

        // SAFETY: the fd set is a local array with valid length.
        let poll_result = unsafe { libc::poll(fds.as_mut_ptr() as _, fds.len() as _, timeout) };

        match poll_result {
            0 => return Err(Error::Timeout),
            -1 => return Err(Error::Io(std::io::Error::last_os_error())),
            _ => (),
        }

        self.evtchn.wait()?;

        while self.ring.borrow().has_unconsumed_requests() {
            let mut event = self.ring.borrow_mut().get_request();
            Arch::process_event(self, &mut event, &mut handler)?;
            self.ring.borrow_mut().put_response(event);
        }

        self.evtchn.notify()?;

        Ok(())
    }

    pub fn reset_state(&self) -> Result<(), Error> {
        Arch::reset_state(self)
    }
}
