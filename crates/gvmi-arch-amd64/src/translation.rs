//! Pagetable walks for the three x86 paging modes.
//!
//! Every walk records the location and raw value of each entry it consults
//! into a [`PageInfo`]. Read failures propagate; a non-present entry simply
//! terminates the record, and the caller decides whether that is fatal
//! (targeted translation) or expected (sweeps).

use gvmi_core::{AccessContext, Architecture as _, Pa, PageInfo, PageMode, Va, VaPage, VmiCore,
    VmiDriver, VmiError, VmiMappedPage};

use crate::{Amd64, PageTableEntry};

const SIZE_4K: u64 = 1 << 12;
const SIZE_2M: u64 = 1 << 21;
const SIZE_4M: u64 = 1 << 22;
const SIZE_1G: u64 = 1 << 30;

const ENTRY_COUNT_LEGACY: usize = 1024;
const ENTRY_COUNT: usize = 512;

/// Strips the non-address bits from a legacy pagetable root.
fn legacy_root(root: Pa) -> Pa {
    Pa(root.0 & 0xffff_f000)
}

/// Strips the non-address bits from a PAE pagetable root (the PDPT is
/// 32-byte aligned).
fn pae_root(root: Pa) -> Pa {
    Pa(root.0 & 0xffff_ffe0)
}

fn read_table<Driver>(vmi: &VmiCore<Driver>, base: Pa) -> Result<VmiMappedPage, VmiError>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    vmi.read_page(Amd64::gfn_from_pa(base))
}

fn table_entry64(page: &[u8], index: usize) -> PageTableEntry {
    let offset = index * 8;
    PageTableEntry(u64::from_le_bytes(
        page[offset..offset + 8].try_into().unwrap(),
    ))
}

fn table_entry32(page: &[u8], index: usize) -> PageTableEntry {
    let offset = index * 4;
    PageTableEntry(u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap()) as u64)
}

/// Walks the pagetables under `root` in the given mode, recording into
/// `info`. Returns `Ok` whether or not the translation completed; `Err`
/// only for driver failures while reading the tables.
pub(crate) fn walk<Driver>(
    vmi: &VmiCore<Driver>,
    va: Va,
    root: Pa,
    mode: PageMode,
    info: &mut PageInfo,
) -> Result<(), VmiError>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    match mode {
        PageMode::Legacy => walk_legacy(vmi, va, root, info),
        PageMode::Pae => walk_pae(vmi, va, root, info),
        PageMode::Ia32e => walk_ia32e(vmi, va, root, info),
        PageMode::Aarch32 => Err(VmiError::NotSupported),
    }
}

/// x86 32-bit paging: two levels, 32-bit entries, 4K and 4M pages.
fn walk_legacy<Driver>(
    vmi: &VmiCore<Driver>,
    va: Va,
    root: Pa,
    info: &mut PageInfo,
) -> Result<(), VmiError>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let va = va.0 & 0xffff_ffff;

    let pgd_base = legacy_root(root);
    let pgd_index = (va >> 22) & 0x3ff;
    let pgd_address = pgd_base + pgd_index * 4;

    let table = read_table(vmi, pgd_base)?;
    let pgde = table_entry32(&table, pgd_index as usize);
    info.push(pgd_address, pgde.0);

    if !pgde.present() {
        return Ok(());
    }

    if pgde.large() {
        info.pa = Some(Pa((pgde.0 & 0xffc0_0000) | (va & (SIZE_4M - 1))));
        info.size = SIZE_4M;
        return Ok(());
    }

    let pt_base = Pa(pgde.0 & 0xffff_f000);
    let pt_index = (va >> 12) & 0x3ff;
    let pt_address = pt_base + pt_index * 4;

    let table = read_table(vmi, pt_base)?;
    let pte = table_entry32(&table, pt_index as usize);
    info.push(pt_address, pte.0);

    if !pte.present() {
        return Ok(());
    }

    info.pa = Some(Pa((pte.0 & 0xffff_f000) | (va & (SIZE_4K - 1))));
    info.size = SIZE_4K;
    Ok(())
}

/// PAE paging: a 4-entry PDPT, then 9-bit PD and PT indices, 64-bit
/// entries, 2M large pages at the PD level.
fn walk_pae<Driver>(
    vmi: &VmiCore<Driver>,
    va: Va,
    root: Pa,
    info: &mut PageInfo,
) -> Result<(), VmiError>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let va = va.0 & 0xffff_ffff;

    // The PDPT is four 64-bit entries, 32-byte aligned; it is not
    // necessarily page aligned, so read it directly.
    let pdpt_base = pae_root(root);
    let pdpt_index = (va >> 30) & 0x3;
    let pdpt_address = pdpt_base + pdpt_index * 8;

    let mut buffer = [0u8; 8];
    vmi.read(AccessContext::direct(pdpt_address), &mut buffer)?;
    let pdpte = PageTableEntry(u64::from_le_bytes(buffer));
    info.push(pdpt_address, pdpte.0);

    if !pdpte.present() {
        return Ok(());
    }

    let pd_base = Amd64::pa_from_gfn(pdpte.pfn());
    let pd_index = (va >> 21) & 0x1ff;
    let pd_address = pd_base + pd_index * 8;

    let table = read_table(vmi, pd_base)?;
    let pde = table_entry64(&table, pd_index as usize);
    info.push(pd_address, pde.0);

    if !pde.present() {
        return Ok(());
    }

    if pde.large() {
        let base = Amd64::pa_from_gfn(pde.pfn()).0 & !(SIZE_2M - 1);
        info.pa = Some(Pa(base | (va & (SIZE_2M - 1))));
        info.size = SIZE_2M;
        return Ok(());
    }

    let pt_base = Amd64::pa_from_gfn(pde.pfn());
    let pt_index = (va >> 12) & 0x1ff;
    let pt_address = pt_base + pt_index * 8;

    let table = read_table(vmi, pt_base)?;
    let pte = table_entry64(&table, pt_index as usize);
    info.push(pt_address, pte.0);

    if !pte.present() {
        return Ok(());
    }

    info.pa = Some(Pa(Amd64::pa_from_gfn(pte.pfn()).0 | (va & (SIZE_4K - 1))));
    info.size = SIZE_4K;
    Ok(())
}

/// IA-32e paging: PML4 → PDPT → PD → PT, 9-bit indices, 1G and 2M large
/// pages.
fn walk_ia32e<Driver>(
    vmi: &VmiCore<Driver>,
    va: Va,
    root: Pa,
    info: &mut PageInfo,
) -> Result<(), VmiError>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let va = Amd64::va_canonical(va).0;

    let pml4_base = Pa(root.0 & 0x000f_ffff_ffff_f000);
    let pml4_index = (va >> 39) & 0x1ff;
    let pml4_address = pml4_base + pml4_index * 8;

    let table = read_table(vmi, pml4_base)?;
    let pml4e = table_entry64(&table, pml4_index as usize);
    info.push(pml4_address, pml4e.0);

    if !pml4e.present() {
        return Ok(());
    }

    let pdpt_base = Amd64::pa_from_gfn(pml4e.pfn());
    let pdpt_index = (va >> 30) & 0x1ff;
    let pdpt_address = pdpt_base + pdpt_index * 8;

    let table = read_table(vmi, pdpt_base)?;
    let pdpte = table_entry64(&table, pdpt_index as usize);
    info.push(pdpt_address, pdpte.0);

    if !pdpte.present() {
        return Ok(());
    }

    if pdpte.large() {
        let base = Amd64::pa_from_gfn(pdpte.pfn()).0 & !(SIZE_1G - 1);
        info.pa = Some(Pa(base | (va & (SIZE_1G - 1))));
        info.size = SIZE_1G;
        return Ok(());
    }

    let pd_base = Amd64::pa_from_gfn(pdpte.pfn());
    let pd_index = (va >> 21) & 0x1ff;
    let pd_address = pd_base + pd_index * 8;

    let table = read_table(vmi, pd_base)?;
    let pde = table_entry64(&table, pd_index as usize);
    info.push(pd_address, pde.0);

    if !pde.present() {
        return Ok(());
    }

    if pde.large() {
        let base = Amd64::pa_from_gfn(pde.pfn()).0 & !(SIZE_2M - 1);
        info.pa = Some(Pa(base | (va & (SIZE_2M - 1))));
        info.size = SIZE_2M;
        return Ok(());
    }

    let pt_base = Amd64::pa_from_gfn(pde.pfn());
    let pt_index = (va >> 12) & 0x1ff;
    let pt_address = pt_base + pt_index * 8;

    let table = read_table(vmi, pt_base)?;
    let pte = table_entry64(&table, pt_index as usize);
    info.push(pt_address, pte.0);

    if !pte.present() {
        return Ok(());
    }

    info.pa = Some(Pa(Amd64::pa_from_gfn(pte.pfn()).0 | (va & (SIZE_4K - 1))));
    info.size = SIZE_4K;
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// V-pages enumeration
///////////////////////////////////////////////////////////////////////////////

/// Collects every mapped page under `root`, depth-first, sorted by virtual
/// address. Holes and unreadable tables are skipped.
pub(crate) fn va_pages<Driver>(
    vmi: &VmiCore<Driver>,
    root: Pa,
    mode: PageMode,
) -> Result<Vec<VaPage>, VmiError>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let mut pages = Vec::new();

    match mode {
        PageMode::Legacy => va_pages_legacy(vmi, root, &mut pages),
        PageMode::Pae => va_pages_pae(vmi, root, &mut pages),
        PageMode::Ia32e => va_pages_ia32e(vmi, root, &mut pages),
        PageMode::Aarch32 => return Err(VmiError::NotSupported),
    }

    Ok(pages)
}

fn push_page(pages: &mut Vec<VaPage>, va: u64, pa: Pa, size: u64) {
    pages.push(VaPage {
        va: Va(va),
        pa,
        size,
    });
}

fn va_pages_legacy<Driver>(vmi: &VmiCore<Driver>, root: Pa, pages: &mut Vec<VaPage>)
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let pgd_base = legacy_root(root);
    let pgd = match read_table(vmi, pgd_base) {
        Ok(table) => table,
        Err(_) => return,
    };

    for pgd_index in 0..ENTRY_COUNT_LEGACY {
        let pgde = table_entry32(&pgd, pgd_index);
        if !pgde.present() {
            continue;
        }

        let va_base = (pgd_index as u64) << 22;

        if pgde.large() {
            push_page(pages, va_base, Pa(pgde.0 & 0xffc0_0000), SIZE_4M);
            continue;
        }

        let pt = match read_table(vmi, Pa(pgde.0 & 0xffff_f000)) {
            Ok(table) => table,
            Err(_) => continue,
        };

        for pt_index in 0..ENTRY_COUNT_LEGACY {
            let pte = table_entry32(&pt, pt_index);
            if !pte.present() {
                continue;
            }

            push_page(
                pages,
                va_base | ((pt_index as u64) << 12),
                Pa(pte.0 & 0xffff_f000),
                SIZE_4K,
            );
        }
    }
}

fn va_pages_pae<Driver>(vmi: &VmiCore<Driver>, root: Pa, pages: &mut Vec<VaPage>)
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let pdpt_base = pae_root(root);

    let mut pdpt = [0u8; 32];
    if vmi
        .read(AccessContext::direct(pdpt_base), &mut pdpt)
        .is_err()
    {
        return;
    }

    for pdpt_index in 0..4usize {
        let pdpte = table_entry64(&pdpt, pdpt_index);
        if !pdpte.present() {
            continue;
        }

        let pd = match read_table(vmi, Amd64::pa_from_gfn(pdpte.pfn())) {
            Ok(table) => table,
            Err(_) => continue,
        };

        for pd_index in 0..ENTRY_COUNT {
            let pde = table_entry64(&pd, pd_index);
            if !pde.present() {
                continue;
            }

            let va_base = ((pdpt_index as u64) << 30) | ((pd_index as u64) << 21);

            if pde.large() {
                let base = Amd64::pa_from_gfn(pde.pfn()).0 & !(SIZE_2M - 1);
                push_page(pages, va_base, Pa(base), SIZE_2M);
                continue;
            }

            let pt = match read_table(vmi, Amd64::pa_from_gfn(pde.pfn())) {
                Ok(table) => table,
                Err(_) => continue,
            };

            for pt_index in 0..ENTRY_COUNT {
                let pte = table_entry64(&pt, pt_index);
                if !pte.present() {
                    continue;
                }

                push_page(
                    pages,
                    va_base | ((pt_index as u64) << 12),
                    Amd64::pa_from_gfn(pte.pfn()),
                    SIZE_4K,
                );
            }
        }
    }
}

fn va_pages_ia32e<Driver>(vmi: &VmiCore<Driver>, root: Pa, pages: &mut Vec<VaPage>)
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    let pml4_base = Pa(root.0 & 0x000f_ffff_ffff_f000);
    let pml4 = match read_table(vmi, pml4_base) {
        Ok(table) => table,
        Err(_) => return,
    };

    for pml4_index in 0..ENTRY_COUNT {
        let pml4e = table_entry64(&pml4, pml4_index);
        if !pml4e.present() {
            continue;
        }

        let pdpt = match read_table(vmi, Amd64::pa_from_gfn(pml4e.pfn())) {
            Ok(table) => table,
            Err(_) => continue,
        };

        for pdpt_index in 0..ENTRY_COUNT {
            let pdpte = table_entry64(&pdpt, pdpt_index);
            if !pdpte.present() {
                continue;
            }

            let va_base = Amd64::va_canonical(Va(
                ((pml4_index as u64) << 39) | ((pdpt_index as u64) << 30),
            ))
            .0;

            if pdpte.large() {
                let base = Amd64::pa_from_gfn(pdpte.pfn()).0 & !(SIZE_1G - 1);
                push_page(pages, va_base, Pa(base), SIZE_1G);
                continue;
            }

            let pd = match read_table(vmi, Amd64::pa_from_gfn(pdpte.pfn())) {
                Ok(table) => table,
                Err(_) => continue,
            };

            for pd_index in 0..ENTRY_COUNT {
                let pde = table_entry64(&pd, pd_index);
                if !pde.present() {
                    continue;
                }

                let va_base = va_base | ((pd_index as u64) << 21);

                if pde.large() {
                    let base = Amd64::pa_from_gfn(pde.pfn()).0 & !(SIZE_2M - 1);
                    push_page(pages, va_base, Pa(base), SIZE_2M);
                    continue;
                }

                let pt = match read_table(vmi, Amd64::pa_from_gfn(pde.pfn())) {
                    Ok(table) => table,
                    Err(_) => continue,
                };

                for pt_index in 0..ENTRY_COUNT {
                    let pte = table_entry64(&pt, pt_index);
                    if !pte.present() {
                        continue;
                    }

                    push_page(
                        pages,
                        va_base | ((pt_index as u64) << 12),
                        Amd64::pa_from_gfn(pte.pfn()),
                        SIZE_4K,
                    );
                }
            }
        }
    }
}
