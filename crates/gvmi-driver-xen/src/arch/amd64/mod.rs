mod event;
mod registers;

use gvmi_arch_amd64::{
    Amd64, EventMonitor, EventReason, ExceptionVector, InterruptType, MonitoredRegister,
};
use gvmi_core::{MemoryAccess, VcpuId, VmiEvent, VmiEventResponse, VmiEventResponseFlags};
use xen::ctrl::{VmEvent, VmEventData, VmEventFlag, VmEventRegs};

use crate::{ArchAdapter, Error, IntoExt as _, TryFromExt as _, XenDriver};

impl ArchAdapter for Amd64 {
    type XenArch = xen::arch::x86::Amd64;

    fn registers(driver: &XenDriver<Self>, vcpu: VcpuId) -> Result<Self::Registers, Error> {
        Ok(driver.domain.get_context_cpu(vcpu.into_ext())?.into_ext())
    }

    fn set_registers(
        driver: &XenDriver<Self>,
        vcpu: VcpuId,
        registers: Self::Registers,
    ) -> Result<(), Error> {
        // The reduced register set is merged into the current full context.
        let current = driver.domain.get_context_cpu(vcpu.into_ext())?;

        Ok(driver
            .domain
            .set_context_cpu(vcpu.into_ext(), (&current, registers).into_ext())?)
    }

    fn monitor_enable(driver: &XenDriver<Self>, option: Self::EventMonitor) -> Result<(), Error> {
        const ENABLE: bool = true;
        const SYNC: bool = true;
        const ON_CHANGE_ONLY: bool = true;

        match option {
            EventMonitor::Register(MonitoredRegister::Control(register)) => {
                driver
                    .monitor
                    .write_ctrlreg(register.into_ext(), ENABLE, SYNC, 0, ON_CHANGE_ONLY)?;
            }

            // MSR monitoring is not exposed by the control bindings.
            EventMonitor::Register(_) => return Err(Error::NotSupported),

            EventMonitor::Interrupt(vector) => match vector {
                ExceptionVector::DebugException => driver.monitor.debug_exceptions(ENABLE, SYNC)?,
                ExceptionVector::Breakpoint => driver.monitor.software_breakpoint(ENABLE)?,
                _ => return Err(Error::NotSupported),
            },

            EventMonitor::MemoryAccess { gfn, access } => {
                driver.domain.set_mem_access(gfn.into(), access.into_ext())?;
            }

            EventMonitor::Singlestep => driver.monitor.singlestep(ENABLE)?,
        }

        Ok(())
    }

    fn monitor_disable(driver: &XenDriver<Self>, option: Self::EventMonitor) -> Result<(), Error> {
        const DISABLE: bool = false;
        const SYNC: bool = true;
        const ON_CHANGE_ONLY: bool = true;

        match option {
            EventMonitor::Register(MonitoredRegister::Control(register)) => {
                driver
                    .monitor
                    .write_ctrlreg(register.into_ext(), DISABLE, SYNC, 0, ON_CHANGE_ONLY)?;
            }

            EventMonitor::Register(_) => return Err(Error::NotSupported),

            EventMonitor::Interrupt(vector) => match vector {
                ExceptionVector::DebugException => {
                    driver.monitor.debug_exceptions(DISABLE, SYNC)?
                }
                ExceptionVector::Breakpoint => driver.monitor.software_breakpoint(DISABLE)?,
                _ => return Err(Error::NotSupported),
            },

            EventMonitor::MemoryAccess { gfn, .. } => {
                driver
                    .domain
                    .set_mem_access(gfn.into(), MemoryAccess::RWX.into_ext())?;
            }

            EventMonitor::Singlestep => {
                for vcpu in 0..=driver.info.max_vcpu_id {
                    let _ = driver.domain.debug_control(vcpu.into(), 0);
                }

                driver.monitor.singlestep(DISABLE)?;
            }
        }

        Ok(())
    }

    fn process_event(
        driver: &XenDriver<Self>,
        event: &mut VmEvent,
        mut handler: impl FnMut(&VmiEvent<Self>) -> VmiEventResponse<Self>,
    ) -> Result<(), Error> {
        let reason = match EventReason::try_from_ext(&event.reason) {
            Ok(reason) => reason,
            Err(_) => return Err(Error::NotSupported),
        };

        let event_registers = match &event.data {
            Some(VmEventData::Registers(VmEventRegs::X86(regs))) => Some(*regs),
            _ => None,
        };

        let registers = event_registers
            .as_ref()
            .map(|regs| regs.into_ext())
            .unwrap_or_default();

        let vmi_event = VmiEvent::new(event.vcpu_id.into_ext(), registers, reason);
        let response = handler(&vmi_event);

        event.flags &= VmEventFlag::VCPU_PAUSED;

        match (event_registers, response.registers) {
            // Only the general-purpose registers may be rewritten from a
            // handler; the rest of the context passes through untouched.
            (Some(mut regs), Some(gp)) => {
                regs.rax = gp.rax;
                regs.rbx = gp.rbx;
                regs.rcx = gp.rcx;
                regs.rdx = gp.rdx;
                regs.rbp = gp.rbp;
                regs.rsi = gp.rsi;
                regs.rdi = gp.rdi;
                regs.rsp = gp.rsp;
                regs.r8 = gp.r8;
                regs.r9 = gp.r9;
                regs.r10 = gp.r10;
                regs.r11 = gp.r11;
                regs.r12 = gp.r12;
                regs.r13 = gp.r13;
                regs.r14 = gp.r14;
                regs.r15 = gp.r15;
                regs.rip = gp.rip;
                regs.rflags = gp.rflags;

                event.flags |= VmEventFlag::SET_REGISTERS;
                event.data = Some(VmEventData::Registers(VmEventRegs::X86(regs)));
            }
            _ => {
                event.data = None;
            }
        }

        if response
            .flags
            .contains(VmiEventResponseFlags::REINJECT_INTERRUPT)
        {
            match vmi_event.reason() {
                EventReason::Interrupt(data) => {
                    driver.devicemodel.inject_event(
                        event.vcpu_id,
                        data.interrupt.vector.into_ext(),
                        data.interrupt.typ.into_ext(),
                        data.interrupt.error_code,
                        data.interrupt.instruction_length,
                        0,
                    )?;
                }
                _ => {
                    tracing::warn!("cannot reinject: the event is not an interrupt");
                }
            }
        }

        if response
            .flags
            .contains(VmiEventResponseFlags::TOGGLE_SINGLESTEP)
        {
            event.flags |= VmEventFlag::TOGGLE_SINGLESTEP;
        }

        Ok(())
    }

    fn reset_state(driver: &XenDriver<Self>) -> Result<(), Error> {
        use gvmi_arch_amd64::ControlRegister;

        let _ = driver.monitor_disable(EventMonitor::Singlestep);
        let _ = driver.monitor_disable(EventMonitor::Interrupt(ExceptionVector::Breakpoint));
        let _ =
            driver.monitor_disable(EventMonitor::Interrupt(ExceptionVector::DebugException));
        let _ = driver.monitor_disable(EventMonitor::Register(MonitoredRegister::Control(
            ControlRegister::Cr4,
        )));
        let _ = driver.monitor_disable(EventMonitor::Register(MonitoredRegister::Control(
            ControlRegister::Cr3,
        )));
        let _ = driver.monitor_disable(EventMonitor::Register(MonitoredRegister::Control(
            ControlRegister::Cr0,
        )));

        Ok(())
    }
}

impl crate::FromExt<ExceptionVector> for xen::XenX86ExceptionVector {
    fn from_ext(value: ExceptionVector) -> Self {
        use ExceptionVector::*;

        match value {
            DivideError => Self::DivideError,
            DebugException => Self::DebugException,
            Nmi => Self::Nmi,
            Breakpoint => Self::Breakpoint,
            Overflow => Self::Overflow,
            InvalidOpcode => Self::InvalidOpcode,
            DoubleFault => Self::DoubleFault,
            GeneralProtectionFault => Self::GeneralProtectionFault,
            PageFault => Self::PageFault,
        }
    }
}

impl crate::FromExt<InterruptType> for xen::XenX86EventType {
    fn from_ext(value: InterruptType) -> Self {
        use InterruptType::*;

        match value {
            ExternalInterrupt => Self::ExternalInterrupt,
            Nmi => Self::Nmi,
            HardwareException => Self::HardwareException,
            SoftwareInterrupt => Self::SoftwareInterrupt,
            SoftwareException => Self::SoftwareException,
        }
    }
}
