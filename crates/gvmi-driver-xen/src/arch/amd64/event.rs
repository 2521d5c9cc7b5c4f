use gvmi_arch_amd64::{
    Amd64, ControlRegister, EventInterrupt, EventMemoryAccess, EventReason, EventSinglestep,
    EventWriteRegister, ExceptionVector, Interrupt, InterruptType, MonitoredRegister,
};
use gvmi_core::{Architecture as _, Gfn, MemoryAccess};
use xen::ctrl::{
    VmEventCtrlReg, VmEventDebug, VmEventMemAccess, VmEventReason, VmEventSinglestep,
    VmEventWriteCtrlReg,
};

use crate::{FromExt, IntoExt as _, TryFromExt};

impl FromExt<ControlRegister> for VmEventCtrlReg {
    fn from_ext(value: ControlRegister) -> Self {
        match value {
            ControlRegister::Cr0 => Self::Cr0,
            ControlRegister::Cr3 => Self::Cr3,
            ControlRegister::Cr4 => Self::Cr4,
            ControlRegister::Xcr0 => Self::Xcr0,
        }
    }
}

impl FromExt<VmEventCtrlReg> for ControlRegister {
    fn from_ext(value: VmEventCtrlReg) -> Self {
        match value {
            VmEventCtrlReg::Cr0 => Self::Cr0,
            VmEventCtrlReg::Cr3 => Self::Cr3,
            VmEventCtrlReg::Cr4 => Self::Cr4,
            VmEventCtrlReg::Xcr0 => Self::Xcr0,
        }
    }
}

impl FromExt<&VmEventMemAccess> for EventMemoryAccess {
    fn from_ext(value: &VmEventMemAccess) -> Self {
        Self {
            pa: Amd64::pa_from_gfn(Gfn::new(value.gfn)) + value.offset,
            va: value.gla.into(),
            access: MemoryAccess::from_bits_truncate(value.flags as u8),
        }
    }
}

impl FromExt<&VmEventWriteCtrlReg> for EventWriteRegister {
    fn from_ext(value: &VmEventWriteCtrlReg) -> Self {
        Self {
            register: MonitoredRegister::Control(value.index.into_ext()),
            new_value: value.new_value,
            old_value: value.old_value,
        }
    }
}

impl FromExt<(&VmEventDebug, ExceptionVector, InterruptType)> for EventInterrupt {
    fn from_ext(
        (value, vector, typ): (&VmEventDebug, ExceptionVector, InterruptType),
    ) -> Self {
        Self {
            gfn: Gfn::new(value.gfn),
            interrupt: Interrupt {
                vector,
                typ,
                error_code: 0xffff_ffff,
                instruction_length: value.insn_length as u8,
            },
        }
    }
}

impl FromExt<&VmEventSinglestep> for EventSinglestep {
    fn from_ext(value: &VmEventSinglestep) -> Self {
        Self {
            gfn: Gfn::new(value.gfn),
        }
    }
}

impl TryFromExt<&VmEventReason> for EventReason {
    type Error = ();

    fn try_from_ext(value: &VmEventReason) -> Result<Self, Self::Error> {
        use VmEventReason::*;

        match value {
            MemoryAccess(value) => Ok(Self::MemoryAccess(value.into_ext())),
            WriteCtrlReg(value) => Ok(Self::WriteRegister(value.into_ext())),
            SoftwareBreakpoint(value) => Ok(Self::Interrupt(
                (
                    value,
                    ExceptionVector::Breakpoint,
                    InterruptType::SoftwareException,
                )
                    .into_ext(),
            )),
            DebugException(value) => Ok(Self::Interrupt(
                (
                    value,
                    ExceptionVector::DebugException,
                    InterruptType::HardwareException,
                )
                    .into_ext(),
            )),
            Singlestep(value) => Ok(Self::Singlestep(value.into_ext())),
            _ => Err(()),
        }
    }
}
