use gvmi_arch_amd64::Registers;
use xen::{arch::x86::Registers as XenRegisters, ctrl::VmEventRegsX86};

use crate::FromExt;

impl FromExt<&VmEventRegsX86> for Registers {
    fn from_ext(value: &VmEventRegsX86) -> Self {
        Self {
            rax: value.rax,
            rbx: value.rbx,
            rcx: value.rcx,
            rdx: value.rdx,
            rbp: value.rbp,
            rsi: value.rsi,
            rdi: value.rdi,
            rsp: value.rsp,
            r8: value.r8,
            r9: value.r9,
            r10: value.r10,
            r11: value.r11,
            r12: value.r12,
            r13: value.r13,
            r14: value.r14,
            r15: value.r15,
            rip: value.rip,
            rflags: value.rflags,

            cr0: value.cr0.into(),
            cr2: value.cr2.into(),
            cr3: value.cr3.into(),
            cr4: value.cr4.into(),

            fs_base: value.fs_base,
            gs_base: value.gs_base,

            msr_efer: value.msr_efer.into(),
            msr_lstar: value.msr_lstar,
        }
    }
}

impl FromExt<XenRegisters> for Registers {
    fn from_ext(value: XenRegisters) -> Self {
        Self {
            rax: value.rax,
            rbx: value.rbx,
            rcx: value.rcx,
            rdx: value.rdx,
            rbp: value.rbp,
            rsi: value.rsi,
            rdi: value.rdi,
            rsp: value.rsp,
            r8: value.r8,
            r9: value.r9,
            r10: value.r10,
            r11: value.r11,
            r12: value.r12,
            r13: value.r13,
            r14: value.r14,
            r15: value.r15,
            rip: value.rip,
            rflags: value.rflags,

            cr0: value.cr0.into(),
            cr2: value.cr2.into(),
            cr3: value.cr3.into(),
            cr4: value.cr4.into(),

            fs_base: value.fs_base,
            gs_base: value.gs_base,

            msr_efer: value.msr_efer.into(),
            msr_lstar: value.msr_lstar,
        }
    }
}

impl FromExt<(&XenRegisters, Registers)> for XenRegisters {
    /// Merges our reduced register set back into the full Xen context,
    /// leaving the fields we do not model untouched.
    fn from_ext((current, value): (&XenRegisters, Registers)) -> Self {
        Self {
            rax: value.rax,
            rbx: value.rbx,
            rcx: value.rcx,
            rdx: value.rdx,
            rbp: value.rbp,
            rsi: value.rsi,
            rdi: value.rdi,
            rsp: value.rsp,
            r8: value.r8,
            r9: value.r9,
            r10: value.r10,
            r11: value.r11,
            r12: value.r12,
            r13: value.r13,
            r14: value.r14,
            r15: value.r15,
            rip: value.rip,
            rflags: value.rflags,

            cr0: value.cr0.into(),
            cr2: value.cr2.into(),
            cr3: value.cr3.into(),
            cr4: value.cr4.into(),

            fs_base: value.fs_base,
            gs_base: value.gs_base,

            msr_efer: value.msr_efer.into(),
            msr_lstar: value.msr_lstar,

            ..*current
        }
    }
}
