//! ARM short-descriptor pagetable walk.
//!
//! Two levels. First-level descriptors map 1MiB sections and 16MiB
//! supersections directly, or point to a second-level table; second-level
//! descriptors map 64KiB large pages, 4KiB small pages, and the legacy
//! 1KiB tiny page form. Every consulted descriptor is recorded.
//!
//! The root passed in is the selected first-level table base: callers
//! working from live vCPU state pick TTBR0 or TTBR1 per address through
//! [`Registers::translation_root_for`], which honours the `TTBCR.N`
//! boundary split; a process directory table base is used as is. A
//! TTBR0 table shrunk by a nonzero split needs no special indexing here:
//! addresses routed to it have their top `N` bits clear, so the
//! first-level index never reaches past the shrunk table's end.
//!
//! [`Registers::translation_root_for`]: gvmi_core::Registers::translation_root_for

use gvmi_core::{AccessContext, Pa, PageInfo, Va, VaPage, VmiCore, VmiDriver, VmiError};

use crate::Aarch32;

const SIZE_1K: u64 = 1 << 10;
const SIZE_4K: u64 = 1 << 12;
const SIZE_64K: u64 = 1 << 16;
const SIZE_1M: u64 = 1 << 20;
const SIZE_16M: u64 = 1 << 24;

const FIRST_LEVEL_COUNT: u64 = 4096;
const SECOND_LEVEL_COUNT: u64 = 256;

/// Strips the TTBR attribute bits (IRGN, RGN, S and friends) from a root.
///
/// Only the low seven bits are cleared: a split-shrunk TTBR0 table may be
/// aligned to as little as `16KB >> 7`, so masking any further would
/// corrupt its base.
fn table_root(root: Pa) -> Pa {
    Pa(root.0 & !0x7f)
}

fn descriptor<Driver>(vmi: &VmiCore<Driver>, address: Pa) -> Result<u32, VmiError>
where
    Driver: VmiDriver<Architecture = Aarch32>,
{
    let mut buffer = [0u8; 4];
    vmi.read(AccessContext::direct(address), &mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

/// Walks the short-descriptor tables rooted at `root`, recording into
/// `info`.
pub(crate) fn walk<Driver>(
    vmi: &VmiCore<Driver>,
    va: Va,
    root: Pa,
    info: &mut PageInfo,
) -> Result<(), VmiError>
where
    Driver: VmiDriver<Architecture = Aarch32>,
{
    let va = va.0 & 0xffff_ffff;

    let first_base = table_root(root);
    let first_index = (va >> 20) & 0xfff;
    let first_address = first_base + first_index * 4;

    let fld = descriptor(vmi, first_address)?;
    info.push(first_address, fld as u64);

    match fld & 0b11 {
        // Section or supersection.
        0b10 => {
            if fld & (1 << 18) != 0 {
                info.pa = Some(Pa(((fld & 0xff00_0000) as u64) | (va & (SIZE_16M - 1))));
                info.size = SIZE_16M;
            } else {
                info.pa = Some(Pa(((fld & 0xfff0_0000) as u64) | (va & (SIZE_1M - 1))));
                info.size = SIZE_1M;
            }

            Ok(())
        }

        // Coarse second-level table.
        0b01 => {
            let second_base = Pa((fld & 0xffff_fc00) as u64);
            let second_index = (va >> 12) & 0xff;
            let second_address = second_base + second_index * 4;

            let sld = descriptor(vmi, second_address)?;
            info.push(second_address, sld as u64);

            match sld & 0b11 {
                // Large page.
                0b01 => {
                    info.pa = Some(Pa(((sld & 0xffff_0000) as u64) | (va & (SIZE_64K - 1))));
                    info.size = SIZE_64K;
                }

                // Small page.
                0b10 => {
                    info.pa = Some(Pa(((sld & 0xffff_f000) as u64) | (va & (SIZE_4K - 1))));
                    info.size = SIZE_4K;
                }

                // Tiny page (legacy subpage form).
                0b11 => {
                    info.pa = Some(Pa(((sld & 0xffff_fc00) as u64) | (va & (SIZE_1K - 1))));
                    info.size = SIZE_1K;
                }

                // Fault.
                _ => {}
            }

            Ok(())
        }

        // Fault.
        _ => Ok(()),
    }
}

/// Collects every mapped page under `root`, sorted by virtual address.
/// Faults and unreadable tables are skipped.
pub(crate) fn va_pages<Driver>(vmi: &VmiCore<Driver>, root: Pa) -> Result<Vec<VaPage>, VmiError>
where
    Driver: VmiDriver<Architecture = Aarch32>,
{
    let mut pages = Vec::new();
    let first_base = table_root(root);

    for first_index in 0..FIRST_LEVEL_COUNT {
        let fld = match descriptor(vmi, first_base + first_index * 4) {
            Ok(fld) => fld,
            Err(_) => continue,
        };

        let va_base = first_index << 20;

        match fld & 0b11 {
            0b10 => {
                if fld & (1 << 18) != 0 {
                    // Supersections repeat over sixteen consecutive slots;
                    // emit only the first.
                    if va_base & (SIZE_16M - 1) == 0 {
                        pages.push(VaPage {
                            va: Va(va_base),
                            pa: Pa((fld & 0xff00_0000) as u64),
                            size: SIZE_16M,
                        });
                    }
                } else {
                    pages.push(VaPage {
                        va: Va(va_base),
                        pa: Pa((fld & 0xfff0_0000) as u64),
                        size: SIZE_1M,
                    });
                }
            }

            0b01 => {
                let second_base = Pa((fld & 0xffff_fc00) as u64);

                for second_index in 0..SECOND_LEVEL_COUNT {
                    let sld = match descriptor(vmi, second_base + second_index * 4) {
                        Ok(sld) => sld,
                        Err(_) => continue,
                    };

                    let va = va_base | (second_index << 12);

                    match sld & 0b11 {
                        0b01 => {
                            // Large pages repeat over sixteen slots.
                            if va & (SIZE_64K - 1) == 0 {
                                pages.push(VaPage {
                                    va: Va(va),
                                    pa: Pa((sld & 0xffff_0000) as u64),
                                    size: SIZE_64K,
                                });
                            }
                        }

                        0b10 => {
                            pages.push(VaPage {
                                va: Va(va),
                                pa: Pa((sld & 0xffff_f000) as u64),
                                size: SIZE_4K,
                            });
                        }

                        0b11 => {
                            pages.push(VaPage {
                                va: Va(va),
                                pa: Pa((sld & 0xffff_fc00) as u64),
                                size: SIZE_1K,
                            });
                        }

                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    Ok(pages)
}
