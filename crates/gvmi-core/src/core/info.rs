use serde::{Deserialize, Serialize};

use crate::Pa;

/// Topology of the introspected virtual machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VmiInfo {
    /// The size of a page in bytes.
    pub page_size: u64,

    /// The shift value to convert a frame number to a page address.
    pub page_shift: u64,

    /// The amount of guest RAM in bytes.
    pub ram_size: u64,

    /// The highest guest physical address.
    pub max_pa: Pa,

    /// The number of virtual CPUs.
    pub vcpus: u16,

    /// Whether the guest is hardware-virtualized (as opposed to paravirt).
    pub hvm: bool,
}
