use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use crate::{
    AccessContext, AddressContext, Architecture, Gfn, Pa, PageInfo, PageMode, ProcessId,
    Registers, Va, VaPage, VmiCore, VmiDriver, VmiError, VmiInfo, VmiMappedPage, VmiOs,
    VmiSession, os::OsProcess,
};

///////////////////////////////////////////////////////////////////////////////
// Mock Architecture
///////////////////////////////////////////////////////////////////////////////

/// Identity-mapped paging: VA == PA, 4K pages. Virtual addresses at or
/// above `HOLE` have no translation.
struct MockArch;

const HOLE: u64 = 0x8000_0000;

#[derive(Debug, Default, Clone, Copy)]
struct MockRegisters;

impl Registers for MockRegisters {
    type GpRegisters = ();

    fn instruction_pointer(&self) -> u64 {
        0
    }

    fn stack_pointer(&self) -> u64 {
        0
    }

    fn gp_registers(&self) -> Self::GpRegisters {}

    fn set_gp_registers(&mut self, _gp: &Self::GpRegisters) {}

    fn translation_root(&self) -> Pa {
        Pa(0x1000)
    }

    fn paging_mode(&self) -> Option<PageMode> {
        Some(PageMode::Ia32e)
    }
}

impl Architecture for MockArch {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;

    type Registers = MockRegisters;
    type EventMonitor = ();
    type EventReason = ();

    fn modes() -> &'static [PageMode] {
        &[PageMode::Ia32e]
    }

    fn translate<Driver>(
        _vmi: &VmiCore<Driver>,
        va: Va,
        root: Pa,
        _mode: PageMode,
    ) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        if va.0 >= HOLE {
            return Err(VmiError::page_fault((va, root)));
        }

        Ok(Pa(va.0))
    }

    fn translation<Driver>(
        _vmi: &VmiCore<Driver>,
        va: Va,
        _root: Pa,
        _mode: PageMode,
    ) -> Result<PageInfo, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let mut info = PageInfo::new();
        info.push(Pa(0x1000), va.0 | 1);

        if va.0 < HOLE {
            info.pa = Some(Pa(va.0));
            info.size = Self::PAGE_SIZE;
        }

        Ok(info)
    }

    fn va_pages<Driver>(
        _vmi: &VmiCore<Driver>,
        _root: Pa,
        _mode: PageMode,
    ) -> Result<Vec<VaPage>, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        Ok(vec![
            VaPage {
                va: Va(0x1000),
                pa: Pa(0x1000),
                size: 0x1000,
            },
            VaPage {
                va: Va(0x2000),
                pa: Pa(0x2000),
                size: 0x1000,
            },
        ])
    }
}

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    reads: Cell<usize>,
    snapshot: Cell<bool>,
    v2m: RefCell<HashMap<ProcessId, Vec<VaPage>>>,
    v2m_builds: Cell<usize>,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
            reads: Cell::new(0),
            snapshot: Cell::new(false),
            v2m: RefCell::new(HashMap::new()),
            v2m_builds: Cell::new(0),
        }
    }

    fn insert_page(&self, gfn: Gfn, fill: u8) {
        self.pages.borrow_mut().insert(gfn, vec![fill; 4096]);
    }
}

impl VmiDriver for MockDriver {
    type Architecture = MockArch;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: 4096,
            page_shift: 12,
            ram_size: 0x10000,
            max_pa: Pa(0x10000),
            vcpus: 1,
            hvm: true,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        self.reads.set(self.reads.get() + 1);

        let pages = self.pages.borrow();
        let page = pages
            .get(&gfn)
            .ok_or_else(|| VmiError::Io(std::io::Error::other("page not found")))?;

        Ok(VmiMappedPage::new(page.clone()))
    }

    fn write(&self, pa: Pa, content: &[u8]) -> Result<(), VmiError> {
        let gfn = MockArch::gfn_from_pa(pa);
        let offset = MockArch::pa_offset(pa) as usize;

        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .ok_or_else(|| VmiError::Io(std::io::Error::other("page not found")))?;

        page[offset..offset + content.len()].copy_from_slice(content);
        Ok(())
    }

    fn snapshot_create(&self) -> Result<(), VmiError> {
        self.snapshot.set(true);
        Ok(())
    }

    fn snapshot_destroy(&self) -> Result<(), VmiError> {
        self.snapshot.set(false);
        self.v2m.borrow_mut().clear();
        Ok(())
    }

    fn snapshot_active(&self) -> bool {
        self.snapshot.get()
    }

    fn direct_physical(&self, pa: Pa, count: usize) -> Result<(VmiMappedPage, usize), VmiError> {
        let gfn = MockArch::gfn_from_pa(pa);
        let offset = MockArch::pa_offset(pa) as usize;

        let pages = self.pages.borrow();
        let page = pages
            .get(&gfn)
            .ok_or_else(|| VmiError::Io(std::io::Error::other("page not found")))?;

        let usable = count.min(page.len() - offset);
        Ok((VmiMappedPage::new(page[offset..].to_vec()), usable))
    }

    fn direct_virtual(
        &self,
        pid: ProcessId,
        va: Va,
        count: usize,
    ) -> Result<Option<(VmiMappedPage, usize)>, VmiError> {
        let v2m = self.v2m.borrow();
        let pages = match v2m.get(&pid) {
            Some(pages) => pages,
            None => return Ok(None),
        };

        for page in pages {
            if va >= page.va && va <= page.va_end() {
                let usable = count.min((page.va_end().0 - va.0 + 1) as usize);
                let pa = page.pa + (va.0 - page.va.0);
                let (handle, _) = self.direct_physical(pa, usable)?;
                return Ok(Some((handle, usable)));
            }
        }

        Ok(None)
    }

    fn insert_virtual_mappings(&self, pid: ProcessId, pages: &[VaPage]) -> Result<(), VmiError> {
        self.v2m_builds.set(self.v2m_builds.get() + 1);
        self.v2m.borrow_mut().insert(pid, pages.to_vec());
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Mock OS
///////////////////////////////////////////////////////////////////////////////

struct MockOs {
    pid_lookups: Cell<usize>,
}

impl MockOs {
    fn new() -> Self {
        Self {
            pid_lookups: Cell::new(0),
        }
    }
}

impl VmiOs<MockDriver> for MockOs {
    fn init(&self, vmi: &VmiCore<MockDriver>) -> Result<(), VmiError> {
        vmi.set_page_mode(PageMode::Ia32e);
        vmi.set_kpgd(Pa(0x1000));
        Ok(())
    }

    fn get_offset(&self, _name: &str) -> Result<u64, VmiError> {
        Err(VmiError::NotSupported)
    }

    fn pid_to_pgd(&self, _vmi: &VmiCore<MockDriver>, pid: ProcessId) -> Result<Pa, VmiError> {
        self.pid_lookups.set(self.pid_lookups.get() + 1);

        match pid.0 {
            4 => Ok(Pa(0x4000)),
            _ => Err(VmiError::Other("no such process")),
        }
    }

    fn pgd_to_pid(&self, _vmi: &VmiCore<MockDriver>, pgd: Pa) -> Result<ProcessId, VmiError> {
        match pgd.0 {
            0x4000 => Ok(ProcessId(4)),
            _ => Err(VmiError::Other("no such process")),
        }
    }

    fn ksym_to_va(&self, _vmi: &VmiCore<MockDriver>, symbol: &str) -> Result<Va, VmiError> {
        match symbol {
            "init_task" => Ok(Va(0x2000)),
            _ => Err(VmiError::Other("unknown symbol")),
        }
    }

    fn processes(&self, _vmi: &VmiCore<MockDriver>) -> Result<Vec<OsProcess>, VmiError> {
        Ok(Vec::new())
    }

    fn read_unicode_string(
        &self,
        _vmi: &VmiCore<MockDriver>,
        _ctx: AddressContext,
    ) -> Result<String, VmiError> {
        Err(VmiError::NotSupported)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Core behaviour
///////////////////////////////////////////////////////////////////////////////

fn make_vmi() -> Result<VmiCore<MockDriver>, VmiError> {
    let driver = MockDriver::new();
    driver.insert_page(Gfn(1), 0xaa);
    driver.insert_page(Gfn(2), 0xbb);
    driver.insert_page(Gfn(4), 0x44);

    let vmi = VmiCore::new(driver)?;
    vmi.set_page_mode(PageMode::Ia32e);
    vmi.set_kpgd(Pa(0x1000));
    Ok(vmi)
}

#[test]
fn zero_length_read_succeeds() -> Result<(), VmiError> {
    let vmi = VmiCore::new(MockDriver::new())?;

    let mut buffer = [0u8; 0];
    vmi.read(AccessContext::direct(Pa(0xdead_0000)), &mut buffer)?;
    assert_eq!(vmi.driver().reads.get(), 0);
    Ok(())
}

#[test]
fn read_spans_page_boundary() -> Result<(), VmiError> {
    let vmi = make_vmi()?;

    let mut buffer = [0u8; 16];
    vmi.read(AccessContext::direct(Pa(0x1ff8)), &mut buffer)?;

    assert_eq!(&buffer[..8], &[0xaa; 8]);
    assert_eq!(&buffer[8..], &[0xbb; 8]);
    assert_eq!(vmi.driver().reads.get(), 2);
    Ok(())
}

#[test]
fn page_cache_coalesces_reads() -> Result<(), VmiError> {
    let vmi = make_vmi()?;

    let mut buffer = [0u8; 4];
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    vmi.read(AccessContext::direct(Pa(0x1800)), &mut buffer)?;
    assert_eq!(vmi.driver().reads.get(), 1);

    vmi.flush_page_cache();
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    assert_eq!(vmi.driver().reads.get(), 2);
    Ok(())
}

#[test]
fn disabled_page_cache_reads_through() -> Result<(), VmiError> {
    let mut vmi = make_vmi()?;
    vmi.disable_page_cache();

    let mut buffer = [0u8; 4];
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    assert_eq!(vmi.driver().reads.get(), 2);
    Ok(())
}

#[test]
fn v2p_cache_is_a_pure_memo() -> Result<(), VmiError> {
    let cached = make_vmi()?;
    let mut uncached = make_vmi()?;
    uncached.disable_v2p_cache();

    for va in [0x1000u64, 0x1008, 0x2abc] {
        let a = cached.translate((Va(va), Pa(0x1000)))?;
        let b = uncached.translate((Va(va), Pa(0x1000)))?;
        assert_eq!(a, b);

        // Hit the cache a second time; the result must not change.
        let c = cached.translate((Va(va), Pa(0x1000)))?;
        assert_eq!(a, c);
    }

    // Translation failures are not cached either way.
    assert!(cached.translate((Va(HOLE), Pa(0x1000))).is_err());
    assert!(uncached.translate((Va(HOLE), Pa(0x1000))).is_err());
    Ok(())
}

#[test]
fn write_invalidates_cached_page() -> Result<(), VmiError> {
    let vmi = make_vmi()?;

    let mut buffer = [0u8; 4];
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    assert_eq!(buffer, [0xaa; 4]);

    vmi.write(AccessContext::direct(Pa(0x1000)), &[1, 2, 3, 4])?;

    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    assert_eq!(buffer, [1, 2, 3, 4]);
    Ok(())
}

#[test]
fn read_past_ram_is_an_io_failure() -> Result<(), VmiError> {
    let vmi = make_vmi()?;

    let max_pa = vmi.info()?.max_pa;
    let mut buffer = [0u8; 4];
    let result = vmi.read(AccessContext::direct(max_pa), &mut buffer);
    assert!(matches!(result, Err(VmiError::Io(_))));
    Ok(())
}

#[test]
fn kernel_translation_requires_kpgd() -> Result<(), VmiError> {
    let vmi = VmiCore::new(MockDriver::new())?;
    vmi.set_page_mode(PageMode::Ia32e);

    assert!(matches!(
        vmi.translate_kv2p(Va(0x1000)),
        Err(VmiError::NotInitialized)
    ));
    Ok(())
}

#[test]
fn snapshot_reads_bypass_the_page_cache() -> Result<(), VmiError> {
    let vmi = make_vmi()?;

    vmi.snapshot_create()?;
    assert!(vmi.snapshot_active());

    let mut buffer = [0u8; 4];
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    vmi.read(AccessContext::direct(Pa(0x1000)), &mut buffer)?;
    assert_eq!(buffer, [0xaa; 4]);

    // No driver page reads: both accesses went through direct_physical.
    assert_eq!(vmi.driver().reads.get(), 0);

    vmi.snapshot_destroy()?;
    assert!(!vmi.snapshot_active());
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Session behaviour
///////////////////////////////////////////////////////////////////////////////

#[test]
fn pid_to_dtb_caches_successes_only() -> Result<(), VmiError> {
    let vmi = make_vmi()?;
    let os = MockOs::new();
    let session = VmiSession::new(&vmi, &os);

    assert_eq!(session.pid_to_dtb(ProcessId(4))?, Pa(0x4000));
    assert_eq!(session.pid_to_dtb(ProcessId(4))?, Pa(0x4000));
    assert_eq!(os.pid_lookups.get(), 1);

    // Failures are retried, never negatively cached.
    assert!(session.pid_to_dtb(ProcessId(5)).is_err());
    assert!(session.pid_to_dtb(ProcessId(5)).is_err());
    assert_eq!(os.pid_lookups.get(), 3);
    Ok(())
}

#[test]
fn pid_dtb_round_trip() -> Result<(), VmiError> {
    let vmi = make_vmi()?;
    let os = MockOs::new();
    let session = VmiSession::new(&vmi, &os);

    let dtb = session.pid_to_dtb(ProcessId(4))?;
    assert_eq!(session.dtb_to_pid(dtb)?, ProcessId(4));
    Ok(())
}

#[test]
fn ksym_read_resolves_through_kpgd() -> Result<(), VmiError> {
    let vmi = make_vmi()?;
    let os = MockOs::new();
    let session = VmiSession::new(&vmi, &os);

    let mut buffer = [0u8; 4];
    session.read_ksym("init_task", &mut buffer)?;
    assert_eq!(buffer, [0xbb; 4]);
    Ok(())
}

#[test]
fn dgvma_builds_the_v2m_table_once() -> Result<(), VmiError> {
    let vmi = make_vmi()?;
    let os = MockOs::new();
    let session = VmiSession::new(&vmi, &os);

    vmi.snapshot_create()?;

    let (data, usable) = session.dgvma(Va(0x2ff0), ProcessId::KERNEL, 0x100)?;
    assert_eq!(usable, 0x10);
    assert_eq!(&data[..usable], &[0xbb; 0x10]);
    assert_eq!(vmi.driver().v2m_builds.get(), 1);

    // Second access within the table: no rebuild.
    let (_, usable) = session.dgvma(Va(0x1000), ProcessId::KERNEL, 8)?;
    assert_eq!(usable, 8);
    assert_eq!(vmi.driver().v2m_builds.get(), 1);

    vmi.snapshot_destroy()?;
    Ok(())
}
