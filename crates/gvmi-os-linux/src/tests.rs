use std::{cell::RefCell, collections::HashMap};

use gvmi_core::{
    Architecture, Gfn, Pa, PageInfo, PageMode, ProcessId, Va, VaPage, VcpuId, VmiCore, VmiDriver,
    VmiError, VmiInfo, VmiMappedPage, VmiOs as _,
};

use super::{LinuxOs, Offsets, SystemMap};

///////////////////////////////////////////////////////////////////////////////
// Identity-paging mock
///////////////////////////////////////////////////////////////////////////////

struct TestArch;

#[derive(Debug, Default, Clone, Copy)]
struct TestRegisters;

impl gvmi_core::Registers for TestRegisters {
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
        Pa(0x5000)
    }

    fn paging_mode(&self) -> Option<PageMode> {
        Some(PageMode::Ia32e)
    }
}

impl Architecture for TestArch {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type Registers = TestRegisters;
    type EventMonitor = ();
    type EventReason = ();

    fn modes() -> &'static [PageMode] {
        &[PageMode::Ia32e]
    }

    fn translate<Driver>(
        _vmi: &VmiCore<Driver>,
        va: Va,
        _root: Pa,
        _mode: PageMode,
    ) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
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
        info.pa = Some(Pa(va.0));
        info.size = Self::PAGE_SIZE;
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
        Ok(Vec::new())
    }
}

struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
        }
    }

    fn write_bytes(&self, pa: u64, bytes: &[u8]) {
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .entry(Gfn(pa >> 12))
            .or_insert_with(|| vec![0u8; 4096]);
        let offset = (pa & 0xfff) as usize;
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn write_u64(&self, pa: u64, value: u64) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    fn write_u32(&self, pa: u64, value: u32) {
        self.write_bytes(pa, &value.to_le_bytes());
    }
}

impl VmiDriver for MockDriver {
    type Architecture = TestArch;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: 4096,
            page_shift: 12,
            ram_size: 0x10_0000,
            max_pa: Pa(0x10_0000),
            vcpus: 1,
            hvm: true,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        let mut pages = self.pages.borrow_mut();
        let page = pages.entry(gfn).or_insert_with(|| vec![0u8; 4096]);
        Ok(VmiMappedPage::new(page.clone()))
    }

    fn registers(&self, _vcpu: VcpuId) -> Result<TestRegisters, VmiError> {
        Ok(TestRegisters)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Guest fixture
///////////////////////////////////////////////////////////////////////////////

const OFFSETS: Offsets = Offsets {
    tasks: 0x20,
    mm: 0x28,
    pid: 0x10,
    pgd: 0x08,
    name: 0x40,
};

const INIT_TASK: u64 = 0x1_0000;
const TASK1: u64 = 0x1_1000;
const TASK2: u64 = 0x1_2000;
const MM1: u64 = 0x1_3000;
const MM2: u64 = 0x1_4000;

/// Builds a three-task guest: the swapper (pid 0, kernel thread with only
/// an `active_mm`), pid 1 and pid 4, linked in a circular list.
fn build_guest(driver: &MockDriver) {
    // swapper: pid 0, mm = NULL, active_mm = MM1
    driver.write_u32(INIT_TASK + OFFSETS.pid, 0);
    driver.write_u64(INIT_TASK + OFFSETS.tasks, TASK1 + OFFSETS.tasks);
    driver.write_u64(INIT_TASK + OFFSETS.mm, 0);
    driver.write_u64(INIT_TASK + OFFSETS.mm + 8, MM1);
    driver.write_bytes(INIT_TASK + OFFSETS.name, b"swapper/0\0");

    // pid 1
    driver.write_u32(TASK1 + OFFSETS.pid, 1);
    driver.write_u64(TASK1 + OFFSETS.tasks, TASK2 + OFFSETS.tasks);
    driver.write_u64(TASK1 + OFFSETS.mm, MM1);
    driver.write_bytes(TASK1 + OFFSETS.name, b"systemd\0");

    // pid 4
    driver.write_u32(TASK2 + OFFSETS.pid, 4);
    driver.write_u64(TASK2 + OFFSETS.tasks, INIT_TASK + OFFSETS.tasks);
    driver.write_u64(TASK2 + OFFSETS.mm, MM2);
    driver.write_bytes(TASK2 + OFFSETS.name, b"kworker\0");

    // mm_structs; pgd pointers are kernel VAs (identity-mapped here).
    driver.write_u64(MM1 + OFFSETS.pgd, 0x5000);
    driver.write_u64(MM2 + OFFSETS.pgd, 0x6000);
}

fn sysmap() -> SystemMap {
    SystemMap::parse(&format!("{INIT_TASK:016x} D init_task\n"))
}

fn make_session() -> Result<(VmiCore<MockDriver>, LinuxOs<MockDriver>), VmiError> {
    let driver = MockDriver::new();
    build_guest(&driver);

    let vmi = VmiCore::new(driver)?;
    let os = LinuxOs::from_parts(OFFSETS, Some(sysmap()), None);
    os.init(&vmi)?;

    Ok((vmi, os))
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////

#[test]
fn init_discovers_paging_state() -> Result<(), VmiError> {
    let (vmi, _os) = make_session()?;

    assert_eq!(vmi.page_mode(), Some(PageMode::Ia32e));
    assert_eq!(vmi.kpgd(), Pa(0x5000));
    assert_eq!(vmi.init_task(), Va(INIT_TASK));
    Ok(())
}

#[test]
fn init_failure_leaves_no_partial_state() -> Result<(), VmiError> {
    let driver = MockDriver::new();
    build_guest(&driver);
    let vmi = VmiCore::new(driver)?;

    // No way to resolve `init_task`.
    let os: LinuxOs<MockDriver> = LinuxOs::from_parts(OFFSETS, None, None);
    assert!(os.init(&vmi).is_err());

    assert_eq!(vmi.page_mode(), None);
    assert_eq!(vmi.kpgd(), Pa(0));
    Ok(())
}

#[test]
fn pid_to_pgd_follows_mm() -> Result<(), VmiError> {
    let (vmi, os) = make_session()?;

    assert_eq!(os.pid_to_pgd(&vmi, ProcessId(1))?, Pa(0x5000));
    assert_eq!(os.pid_to_pgd(&vmi, ProcessId(4))?, Pa(0x6000));
    Ok(())
}

#[test]
fn kernel_thread_falls_back_to_active_mm() -> Result<(), VmiError> {
    let (vmi, os) = make_session()?;

    // The swapper has mm = NULL; active_mm lives one pointer width later.
    assert_eq!(os.pid_to_pgd(&vmi, ProcessId(0))?, Pa(0x5000));
    Ok(())
}

#[test]
fn pid_pgd_round_trip() -> Result<(), VmiError> {
    let (vmi, os) = make_session()?;

    let pgd = os.pid_to_pgd(&vmi, ProcessId(4))?;
    assert_eq!(os.pgd_to_pid(&vmi, pgd)?, ProcessId(4));
    Ok(())
}

#[test]
fn unknown_pid_is_an_error() -> Result<(), VmiError> {
    let (vmi, os) = make_session()?;

    assert!(os.pid_to_pgd(&vmi, ProcessId(12345)).is_err());
    Ok(())
}

#[test]
fn processes_terminates_at_list_head() -> Result<(), VmiError> {
    let (vmi, os) = make_session()?;

    let processes = os.processes(&vmi)?;
    assert_eq!(processes.len(), 3);

    let names: Vec<&str> = processes.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["swapper/0", "systemd", "kworker"]);

    assert_eq!(processes[1].id, ProcessId(1));
    assert_eq!(processes[1].object, Va(TASK1));
    assert_eq!(processes[1].translation_root, Pa(0x5000));
    Ok(())
}

#[test]
fn offsets_are_exposed_by_name() -> Result<(), VmiError> {
    let (_vmi, os) = make_session()?;

    assert_eq!(os.get_offset("linux_tasks")?, 0x20);
    assert_eq!(os.get_offset("linux_pgd")?, 0x08);
    assert!(os.get_offset("win_pdbase").is_err());
    Ok(())
}
