use std::{cell::RefCell, collections::HashMap};

use gvmi_core::{
    Architecture as _, Gfn, Pa, PageMode, Va, VmiCore, VmiDriver, VmiError, VmiInfo,
    VmiMappedPage,
};

use super::Amd64;

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
        }
    }

    fn insert_page(&self, gfn: Gfn) {
        self.pages.borrow_mut().insert(gfn, vec![0u8; 4096]);
    }

    fn write_entry64(&self, pa: Pa, value: u64) {
        let gfn = Amd64::gfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa) as usize;
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .unwrap_or_else(|| panic!("no page at {gfn:?}"));
        page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_entry32(&self, pa: Pa, value: u32) {
        let gfn = Amd64::gfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa) as usize;
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .unwrap_or_else(|| panic!("no page at {gfn:?}"));
        page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl VmiDriver for MockDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: 4096,
            page_shift: 12,
            ram_size: 0x100_0000,
            max_pa: Pa(0x100_0000),
            vcpus: 1,
            hvm: true,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        let pages = self.pages.borrow();
        let page = pages.get(&gfn).ok_or(VmiError::Other("page not found"))?;
        Ok(VmiMappedPage::new(page.clone()))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Fixtures
///////////////////////////////////////////////////////////////////////////////

const PML4_GFN: Gfn = Gfn(1);
const PDPT_GFN: Gfn = Gfn(2);
const PD_GFN: Gfn = Gfn(3);
const PT_GFN: Gfn = Gfn(4);
const DATA_GFN: Gfn = Gfn(5);

fn make_pte(gfn: Gfn) -> u64 {
    (gfn.0 << 12) | 0x3
}

fn make_large_pte(gfn: Gfn) -> u64 {
    (gfn.0 << 12) | (1 << 7) | 0x3
}

fn root_pa() -> Pa {
    Amd64::pa_from_gfn(PML4_GFN)
}

/// VA 0x1000: PML4[0] → PDPT[0] → PD[0] → PT[1] → DATA.
const TEST_VA: Va = Va(0x1000);

fn build_ia32e_hierarchy(driver: &MockDriver) {
    driver.insert_page(PML4_GFN);
    driver.insert_page(PDPT_GFN);
    driver.insert_page(PD_GFN);
    driver.insert_page(PT_GFN);
    driver.insert_page(DATA_GFN);

    driver.write_entry64(Amd64::pa_from_gfn(PML4_GFN), make_pte(PDPT_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PDPT_GFN), make_pte(PD_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PD_GFN), make_pte(PT_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PT_GFN) + 8u64, make_pte(DATA_GFN));
}

fn make_vmi(driver: MockDriver, mode: PageMode) -> Result<VmiCore<MockDriver>, VmiError> {
    let vmi = VmiCore::new(driver)?;
    vmi.set_page_mode(mode);
    Ok(vmi)
}

///////////////////////////////////////////////////////////////////////////////
// IA-32e
///////////////////////////////////////////////////////////////////////////////

#[test]
fn ia32e_4k_walk() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    build_ia32e_hierarchy(&driver);
    let vmi = make_vmi(driver, PageMode::Ia32e)?;

    let pa = vmi.translate((TEST_VA, root_pa()))?;
    assert_eq!(pa, Amd64::pa_from_gfn(DATA_GFN));

    // The walk records all four consulted entries with their locations.
    let info = vmi.page_info(TEST_VA, root_pa())?;
    assert_eq!(info.entries.len(), 4);
    assert_eq!(info.size, 0x1000);
    assert_eq!(info.entries[0].address, Amd64::pa_from_gfn(PML4_GFN));
    assert_eq!(info.entries[3].address, Amd64::pa_from_gfn(PT_GFN) + 8u64);
    assert_eq!(info.entries[3].value, make_pte(DATA_GFN));
    Ok(())
}

#[test]
fn ia32e_2m_large_page() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN);
    driver.insert_page(PDPT_GFN);
    driver.insert_page(PD_GFN);

    // PDE with PS=1 mapping a 2MiB page at 0x40_0000.
    let pde = make_large_pte(Gfn(0x400));
    driver.write_entry64(Amd64::pa_from_gfn(PML4_GFN), make_pte(PDPT_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PDPT_GFN), make_pte(PD_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PD_GFN), pde);

    let vmi = make_vmi(driver, PageMode::Ia32e)?;

    let va = Va(0x12_3456);
    let pa = vmi.translate((va, root_pa()))?;

    // pa == (PDE & ~((1<<21)-1)) | (va & ((1<<21)-1))
    assert_eq!(pa.0, (pde & !((1 << 21) - 1) & 0x000f_ffff_ffff_f000) | (va.0 & ((1 << 21) - 1)));

    let info = vmi.page_info(va, root_pa())?;
    assert_eq!(info.size, 2 * 1024 * 1024);
    assert_eq!(info.entries.len(), 3);
    Ok(())
}

#[test]
fn ia32e_1g_large_page() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN);
    driver.insert_page(PDPT_GFN);

    driver.write_entry64(Amd64::pa_from_gfn(PML4_GFN), make_pte(PDPT_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PDPT_GFN), make_large_pte(Gfn(0x40000)));

    let vmi = make_vmi(driver, PageMode::Ia32e)?;

    let va = Va(0x1234_5678);
    let pa = vmi.translate((va, root_pa()))?;
    assert_eq!(pa.0, 0x4000_0000 | (va.0 & ((1 << 30) - 1)));
    Ok(())
}

#[test]
fn ia32e_non_present_entry_fails_translation() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    build_ia32e_hierarchy(&driver);
    let vmi = make_vmi(driver, PageMode::Ia32e)?;

    // PT[0] was never populated.
    let result = vmi.translate((Va(0x0), root_pa()));
    assert!(matches!(result, Err(VmiError::Translation(_))));

    // The recording walk keeps the partial trail instead of failing.
    let info = vmi.page_info(Va(0x0), root_pa())?;
    assert!(!info.present());
    assert_eq!(info.entries.len(), 4);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Legacy
///////////////////////////////////////////////////////////////////////////////

#[test]
fn legacy_4k_walk() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN); // serves as the PGD
    driver.insert_page(PT_GFN);

    // VA 0x0040_1000: PGD[1] → PT[1].
    driver.write_entry32(
        Amd64::pa_from_gfn(PML4_GFN) + 4u64,
        ((PT_GFN.0 as u32) << 12) | 0x3,
    );
    driver.write_entry32(
        Amd64::pa_from_gfn(PT_GFN) + 4u64,
        ((DATA_GFN.0 as u32) << 12) | 0x3,
    );

    let vmi = make_vmi(driver, PageMode::Legacy)?;

    let pa = vmi.translate((Va(0x0040_1234), root_pa()))?;
    assert_eq!(pa, Amd64::pa_from_gfn(DATA_GFN) + 0x234u64);
    Ok(())
}

#[test]
fn legacy_4m_large_page() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN);

    // PGD[2] maps a 4MiB page at 0x80_0000.
    driver.write_entry32(
        Amd64::pa_from_gfn(PML4_GFN) + 8u64,
        0x0080_0000 | (1 << 7) | 0x3,
    );

    let vmi = make_vmi(driver, PageMode::Legacy)?;

    let va = Va(0x0090_0abc); // PGD index 2, offset 0x10_0abc
    let pa = vmi.translate((va, root_pa()))?;
    assert_eq!(pa.0, 0x0080_0000 | (va.0 & ((1 << 22) - 1)));

    let info = vmi.page_info(va, root_pa())?;
    assert_eq!(info.size, 4 * 1024 * 1024);
    assert_eq!(info.entries.len(), 1);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// PAE
///////////////////////////////////////////////////////////////////////////////

#[test]
fn pae_4k_walk() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN); // holds the PDPT at offset 0x20
    driver.insert_page(PD_GFN);
    driver.insert_page(PT_GFN);

    // The PDPT is 32-byte aligned, not page aligned.
    let root = Amd64::pa_from_gfn(PML4_GFN) + 0x20u64;
    driver.write_entry64(root, make_pte(PD_GFN)); // PDPT[0]
    driver.write_entry64(Amd64::pa_from_gfn(PD_GFN), make_pte(PT_GFN)); // PD[0]
    driver.write_entry64(Amd64::pa_from_gfn(PT_GFN) + 16u64, make_pte(DATA_GFN)); // PT[2]

    let vmi = make_vmi(driver, PageMode::Pae)?;

    let pa = vmi.translate((Va(0x2abc), root))?;
    assert_eq!(pa, Amd64::pa_from_gfn(DATA_GFN) + 0xabcu64);

    let info = vmi.page_info(Va(0x2abc), root)?;
    assert_eq!(info.entries.len(), 3);
    assert_eq!(info.entries[0].address, root);
    Ok(())
}

#[test]
fn pae_2m_large_page() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN);
    driver.insert_page(PD_GFN);

    let root = Amd64::pa_from_gfn(PML4_GFN);
    driver.write_entry64(root, make_pte(PD_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PD_GFN) + 8u64, make_large_pte(Gfn(0x800)));

    let vmi = make_vmi(driver, PageMode::Pae)?;

    let va = Va(0x0020_1000); // PD index 1
    let pa = vmi.translate((va, root))?;
    assert_eq!(pa.0, 0x0080_0000 | (va.0 & ((1 << 21) - 1)));
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// V-pages enumeration
///////////////////////////////////////////////////////////////////////////////

#[test]
fn va_pages_is_sorted_and_skips_holes() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    build_ia32e_hierarchy(&driver);

    // Add PT[3] → DATA and a 2M mapping at PD[1], leaving PT[2] a hole.
    driver.write_entry64(Amd64::pa_from_gfn(PT_GFN) + 24u64, make_pte(DATA_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PD_GFN) + 8u64, make_large_pte(Gfn(0x400)));

    let vmi = make_vmi(driver, PageMode::Ia32e)?;

    let pages = vmi.va_pages(root_pa())?;
    let vas: Vec<u64> = pages.iter().map(|p| p.va.0).collect();
    assert_eq!(vas, vec![0x1000, 0x3000, 0x20_0000]);

    assert_eq!(pages[0].size, 0x1000);
    assert_eq!(pages[2].size, 0x20_0000);
    assert_eq!(pages[2].pa, Pa(0x40_0000));
    Ok(())
}

#[test]
fn va_pages_sign_extends_kernel_half() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(PML4_GFN);
    driver.insert_page(PDPT_GFN);

    // PML4[256] is the first kernel-half slot.
    driver.write_entry64(Amd64::pa_from_gfn(PML4_GFN) + 256 * 8, make_pte(PDPT_GFN));
    driver.write_entry64(Amd64::pa_from_gfn(PDPT_GFN), make_large_pte(Gfn(0x40000)));

    let vmi = make_vmi(driver, PageMode::Ia32e)?;

    let pages = vmi.va_pages(root_pa())?;
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].va, Va(0xffff_8000_0000_0000));

    // The emitted virtual address round-trips through translation.
    let pa = vmi.translate((pages[0].va, root_pa()))?;
    assert_eq!(pa, pages[0].pa);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Mode probing
///////////////////////////////////////////////////////////////////////////////

#[test]
fn translate_with_mode_bypasses_discovered_mode() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    build_ia32e_hierarchy(&driver);
    let vmi = VmiCore::new(driver)?;

    // No page mode has been set; the explicit-mode probe still works.
    let pa = vmi.translate_with_mode(TEST_VA, root_pa(), PageMode::Ia32e)?;
    assert_eq!(pa, Amd64::pa_from_gfn(DATA_GFN));

    // The same tables make no sense under legacy paging.
    assert!(
        vmi.translate_with_mode(TEST_VA, root_pa(), PageMode::Legacy)
            .is_err()
            || vmi.translate_with_mode(TEST_VA, root_pa(), PageMode::Legacy)? != pa
    );
    Ok(())
}
