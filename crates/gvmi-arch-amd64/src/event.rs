use gvmi_core::{Gfn, MemoryAccess, Pa, Va};

use crate::ControlRegister;

/// Exception vectors that can be intercepted or injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionVector {
    /// `#DE`, divide error.
    DivideError = 0,

    /// `#DB`, debug exception.
    DebugException = 1,

    /// NMI.
    Nmi = 2,

    /// `#BP`, breakpoint (`INT3`).
    Breakpoint = 3,

    /// `#OF`, overflow.
    Overflow = 4,

    /// `#UD`, invalid opcode.
    InvalidOpcode = 6,

    /// `#DF`, double fault.
    DoubleFault = 8,

    /// `#GP`, general protection fault.
    GeneralProtectionFault = 13,

    /// `#PF`, page fault.
    PageFault = 14,
}

/// The delivery type of an interrupt or exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// External hardware interrupt.
    ExternalInterrupt,

    /// Non-maskable interrupt.
    Nmi,

    /// Hardware exception.
    HardwareException,

    /// `INT n` software interrupt.
    SoftwareInterrupt,

    /// Software exception (`INT3`, `INTO`).
    SoftwareException,
}

/// An interrupt or exception, as intercepted or for reinjection.
#[derive(Debug, Clone, Copy)]
pub struct Interrupt {
    /// The exception vector.
    pub vector: ExceptionVector,

    /// The delivery type.
    pub typ: InterruptType,

    /// The error code, or `0xffff_ffff` when none applies.
    pub error_code: u32,

    /// Length of the faulting instruction in bytes.
    pub instruction_length: u8,
}

/// A register selector for write monitoring, including the MSR forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoredRegister {
    /// A control register.
    Control(ControlRegister),

    /// A single model-specific register.
    Msr(u32),

    /// Every model-specific register (the MSR-all wildcard).
    MsrAll,
}

/// Specifies which hardware events should be monitored.
#[derive(Debug, Clone, Copy)]
pub enum EventMonitor {
    /// Monitor writes to a register.
    Register(MonitoredRegister),

    /// Monitor a specific interrupt or exception vector.
    Interrupt(ExceptionVector),

    /// Monitor accesses to a page with the given access mask.
    MemoryAccess {
        /// The monitored guest frame.
        gfn: Gfn,

        /// Access kinds that should trap.
        access: MemoryAccess,
    },

    /// Monitor single-step execution.
    Singlestep,
}

/// Event generated when a monitored register is written to.
#[derive(Debug, Clone, Copy)]
pub struct EventWriteRegister {
    /// The register that was written.
    pub register: MonitoredRegister,

    /// New value of the register.
    pub new_value: u64,

    /// Old value of the register.
    pub old_value: u64,
}

/// Event generated when monitored memory is accessed.
#[derive(Debug, Clone, Copy)]
pub struct EventMemoryAccess {
    /// Physical address that was accessed.
    pub pa: Pa,

    /// Virtual address that was accessed, when known.
    pub va: Va,

    /// Type of access that occurred.
    pub access: MemoryAccess,
}

/// Event generated when an intercepted interrupt or exception occurs.
#[derive(Debug, Clone, Copy)]
pub struct EventInterrupt {
    /// GFN of the current instruction pointer.
    pub gfn: Gfn,

    /// Information about the interrupt.
    pub interrupt: Interrupt,
}

/// Event generated by single-step execution.
#[derive(Debug, Clone, Copy)]
pub struct EventSinglestep {
    /// GFN of the instruction that completed.
    pub gfn: Gfn,
}

/// Reason for an event.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// A monitored register was written.
    WriteRegister(EventWriteRegister),

    /// Monitored memory was accessed.
    MemoryAccess(EventMemoryAccess),

    /// An intercepted interrupt occurred.
    Interrupt(EventInterrupt),

    /// A single step completed.
    Singlestep(EventSinglestep),
}

impl EventReason {
    /// Returns the register write event, if this is one.
    pub fn as_write_register(&self) -> Option<&EventWriteRegister> {
        match self {
            Self::WriteRegister(event) => Some(event),
            _ => None,
        }
    }

    /// Returns the memory access event, if this is one.
    pub fn as_memory_access(&self) -> Option<&EventMemoryAccess> {
        match self {
            Self::MemoryAccess(event) => Some(event),
            _ => None,
        }
    }

    /// Returns the interrupt event, if this is one.
    pub fn as_interrupt(&self) -> Option<&EventInterrupt> {
        match self {
            Self::Interrupt(event) => Some(event),
            _ => None,
        }
    }

    /// Returns the singlestep event, if this is one.
    pub fn as_singlestep(&self) -> Option<&EventSinglestep> {
        match self {
            Self::Singlestep(event) => Some(event),
            _ => None,
        }
    }
}
