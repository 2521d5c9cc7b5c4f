use std::{cell::RefCell, collections::HashMap};

use gvmi_arch_amd64::Amd64;
use gvmi_core::{
    AddressContext, Architecture as _, Gfn, Pa, PageMode, ProcessId, Va, VmiConfig, VmiCore,
    VmiDriver, VmiError, VmiInfo, VmiMappedPage, VmiOs as _,
};
use gvmi_profile::Profile;

use super::{Kdbg, NtVersion, WindowsOs};

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

    fn write_bytes(&self, pa: u64, bytes: &[u8]) {
        let mut pages = self.pages.borrow_mut();
        let mut pa = pa;
        let mut bytes = bytes;

        while !bytes.is_empty() {
            let page = pages
                .entry(Gfn(pa >> 12))
                .or_insert_with(|| vec![0u8; 4096]);
            let offset = (pa & 0xfff) as usize;
            let chunk = bytes.len().min(4096 - offset);

            page[offset..offset + chunk].copy_from_slice(&bytes[..chunk]);
            pa += chunk as u64;
            bytes = &bytes[chunk..];
        }
    }

    fn write_u16(&self, pa: u64, value: u16) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    fn write_u32(&self, pa: u64, value: u32) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    fn write_u64(&self, pa: u64, value: u64) {
        self.write_bytes(pa, &value.to_le_bytes());
    }
}

impl VmiDriver for MockDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: 4096,
            page_shift: 12,
            ram_size: 0x40000,
            max_pa: Pa(0x40000),
            vcpus: 1,
            hvm: true,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        let pages = self.pages.borrow();
        let page = pages
            .get(&gfn)
            .ok_or_else(|| VmiError::Io(std::io::Error::other("page not found")))?;
        Ok(VmiMappedPage::new(page.clone()))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Guest fixture
///////////////////////////////////////////////////////////////////////////////

// Win7 x64 offsets.
const TASKS: u64 = 0x188;
const PDBASE: u64 = 0x28;
const PID: u64 = 0x180;
const PNAME: u64 = 0x2e0;

const KPGD: u64 = 0x1000;
const SYSTEM_EPROCESS: u64 = 0x10000;
const OTHER_EPROCESS: u64 = 0x11000;
const KERNEL_PA: u64 = 0x20000;

const KERNEL_HALF: u64 = 0xffff_8000_0000_0000;

/// Kernel virtual address of a low physical address under the fixture's
/// 1GiB identity window.
fn k(pa: u64) -> Va {
    Va(KERNEL_HALF + pa)
}

/// IA-32e tables: PML4[256] → PDPT[0] mapping PA 0 as a 1GiB page, so the
/// kernel half mirrors low physical memory.
fn build_page_tables(driver: &MockDriver) {
    driver.write_u64(KPGD + 256 * 8, 0x2003);
    driver.write_u64(0x2000, (1 << 7) | 0x3);
}

fn build_process_list(driver: &MockDriver) {
    // System, pid 4.
    driver.write_u32(SYSTEM_EPROCESS + PID, 4);
    driver.write_u64(SYSTEM_EPROCESS + PDBASE, KPGD);
    driver.write_u64(SYSTEM_EPROCESS + TASKS, k(OTHER_EPROCESS).0 + TASKS);
    driver.write_bytes(SYSTEM_EPROCESS + PNAME, b"System\0");

    // explorer.exe, pid 0x200.
    driver.write_u32(OTHER_EPROCESS + PID, 0x200);
    driver.write_u64(OTHER_EPROCESS + PDBASE, 0x9000);
    driver.write_u64(OTHER_EPROCESS + TASKS, k(SYSTEM_EPROCESS).0 + TASKS);
    driver.write_bytes(OTHER_EPROCESS + PNAME, b"explorer.exe\0");
}

/// A minimal but well-formed PE32+ image with one export,
/// `PsInitialSystemProcess` at RVA 0x1234, named `ntoskrnl.exe`.
fn build_kernel_image(driver: &MockDriver, base: u64) {
    // DOS header.
    driver.write_bytes(base, b"MZ");
    driver.write_u32(base + 0x3c, 0x80); // e_lfanew

    // NT headers.
    driver.write_bytes(base + 0x80, b"PE\0\0");
    driver.write_u16(base + 0x84, 0x8664); // machine
    driver.write_u16(base + 0x86, 0); // number of sections
    driver.write_u16(base + 0x94, 240); // size of optional header
    driver.write_u16(base + 0x98, 0x20b); // PE32+ magic
    driver.write_u32(base + 0x98 + 56, 0x1000); // size of image
    driver.write_u32(base + 0x98 + 108, 16); // number of rva and sizes

    // Data directory 0: export directory at RVA 0x200.
    driver.write_u32(base + 0x108, 0x200);
    driver.write_u32(base + 0x10c, 0x180);

    // Export directory.
    driver.write_u32(base + 0x200 + 12, 0x300); // name
    driver.write_u32(base + 0x200 + 16, 1); // ordinal base
    driver.write_u32(base + 0x200 + 20, 1); // number of functions
    driver.write_u32(base + 0x200 + 24, 1); // number of names
    driver.write_u32(base + 0x200 + 28, 0x240); // address of functions
    driver.write_u32(base + 0x200 + 32, 0x248); // address of names
    driver.write_u32(base + 0x200 + 36, 0x250); // address of name ordinals

    driver.write_u32(base + 0x240, 0x1234); // function[0]
    driver.write_u32(base + 0x248, 0x260); // name[0]
    driver.write_u16(base + 0x250, 0); // ordinal[0]
    driver.write_bytes(base + 0x260, b"PsInitialSystemProcess\0");
    driver.write_bytes(base + 0x300, b"ntoskrnl.exe\0");

    // NtBuildNumber (RVA 0x400) and KdVersionBlock (RVA 0x500).
    driver.write_u16(base + 0x400, 7601);
    driver.write_u64(base + 0x500 + 0x10, k(base).0); // KernBase
}

fn profile() -> Profile {
    Profile::from_str(
        r#"{
            "$CONSTANTS": {
                "NtBuildNumber": 1024,
                "KdVersionBlock": 1280,
                "PsActiveProcessHead": 1536
            },
            "$STRUCTS": {
                "_KPROCESS": [352, {"DirectoryTableBase": [40, ["Pointer", {}]]}],
                "_EPROCESS": [1232, {
                    "ActiveProcessLinks": [392, ["_LIST_ENTRY", {}]],
                    "UniqueProcessId": [384, ["Pointer", {}]],
                    "ImageFileName": [736, ["Array", {}]]
                }]
            }
        }"#,
    )
    .expect("fixture profile")
}

fn build_full_guest() -> MockDriver {
    let driver = MockDriver::new();
    build_page_tables(&driver);
    build_process_list(&driver);
    build_kernel_image(&driver, KERNEL_PA);
    driver
}

fn make_initialized() -> Result<(VmiCore<MockDriver>, WindowsOs<MockDriver>), VmiError> {
    let vmi = VmiCore::new(build_full_guest())?;
    let os = WindowsOs::with_profile(&VmiConfig::default(), Some(profile()))?;
    os.init(&vmi)?;
    Ok((vmi, os))
}

///////////////////////////////////////////////////////////////////////////////
// Version mapping
///////////////////////////////////////////////////////////////////////////////

#[test]
fn build_number_maps_versions() {
    assert_eq!(NtVersion::from_build_number(2195), Some(NtVersion::Win2000));
    assert_eq!(NtVersion::from_build_number(2600), Some(NtVersion::WinXp));
    assert_eq!(NtVersion::from_build_number(6001), Some(NtVersion::WinVista));
    assert_eq!(NtVersion::from_build_number(7601), Some(NtVersion::Win7));
    assert_eq!(NtVersion::from_build_number(9600), Some(NtVersion::Win8));
    assert_eq!(NtVersion::from_build_number(1381), None);
}

///////////////////////////////////////////////////////////////////////////////
// Initialization
///////////////////////////////////////////////////////////////////////////////

#[test]
fn init_discovers_kpgd_and_page_mode() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    // The driver reports no registers, so everything came from the
    // physical scans: the System EPROCESS signature and the PE header
    // search.
    assert_eq!(vmi.kpgd(), Pa(KPGD));
    assert_eq!(vmi.page_mode(), Some(PageMode::Ia32e));
    assert_eq!(os.kernel_base(), Pa(KERNEL_PA));
    assert_eq!(os.kernel_base_va(), k(KERNEL_PA));
    assert_eq!(os.version(), Some(NtVersion::Win7));
    assert_eq!(vmi.init_task(), k(OTHER_EPROCESS));

    // The discovered mode really is consistent: the kernel VA base
    // translates back to the kernel physical base.
    assert_eq!(vmi.translate_kv2p(os.kernel_base_va())?, os.kernel_base());
    Ok(())
}

#[test]
fn missing_profile_field_fails_before_any_guest_access() {
    // No UniqueProcessId in this profile.
    let profile = Profile::from_str(
        r#"{
            "$STRUCTS": {
                "_KPROCESS": [352, {"DirectoryTableBase": [40, ["Pointer", {}]]}],
                "_EPROCESS": [1232, {
                    "ActiveProcessLinks": [392, ["_LIST_ENTRY", {}]],
                    "ImageFileName": [736, ["Array", {}]]
                }]
            }
        }"#,
    )
    .expect("fixture profile");

    let result = WindowsOs::<MockDriver>::with_profile(&VmiConfig::default(), Some(profile));
    assert!(matches!(result, Err(VmiError::Profile(_))));
}

#[test]
fn failed_init_leaves_no_partial_state() -> Result<(), VmiError> {
    // Pagetables but no process list and no kernel image.
    let driver = MockDriver::new();
    build_page_tables(&driver);

    let vmi = VmiCore::new(driver)?;
    let os = WindowsOs::with_profile(&VmiConfig::default(), Some(profile()))?;

    assert!(os.init(&vmi).is_err());
    assert_eq!(vmi.kpgd(), Pa(0));
    assert_eq!(vmi.page_mode(), None);
    assert_eq!(vmi.init_task(), Va(0));
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Process list
///////////////////////////////////////////////////////////////////////////////

#[test]
fn pid_pgd_round_trip() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    assert_eq!(os.pid_to_pgd(&vmi, ProcessId(4))?, Pa(KPGD));
    assert_eq!(os.pid_to_pgd(&vmi, ProcessId(0x200))?, Pa(0x9000));
    assert_eq!(os.pgd_to_pid(&vmi, Pa(0x9000))?, ProcessId(0x200));
    Ok(())
}

#[test]
fn processes_enumerates_the_full_list() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    let mut processes = os.processes(&vmi)?;
    processes.sort_by_key(|p| p.id);
    assert_eq!(processes.len(), 2);

    assert_eq!(processes[0].id, ProcessId(4));
    assert_eq!(processes[0].name, "System");
    assert_eq!(processes[0].object, k(SYSTEM_EPROCESS));

    assert_eq!(processes[1].id, ProcessId(0x200));
    assert_eq!(processes[1].name, "explorer.exe");
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Symbol resolution
///////////////////////////////////////////////////////////////////////////////

#[test]
fn ksym_prefers_the_profile() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    // PsActiveProcessHead has RVA 1536 (0x600) in the profile.
    let va = os.ksym_to_va(&vmi, "PsActiveProcessHead")?;
    assert_eq!(va, k(KERNEL_PA) + 0x600u64);
    Ok(())
}

#[test]
fn ksym_falls_back_to_pe_exports() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    // Not in the profile, not in a KDBG block; exported at RVA 0x1234.
    let va = os.ksym_to_va(&vmi, "PsInitialSystemProcess")?;
    assert_eq!(va, k(KERNEL_PA) + 0x1234u64);
    Ok(())
}

#[test]
fn unknown_symbol_is_an_error() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    assert!(os.ksym_to_va(&vmi, "KeDefinitelyNotReal").is_err());
    Ok(())
}

#[test]
fn kdbg_block_is_found_and_resolves_symbols() -> Result<(), VmiError> {
    let driver = build_full_guest();

    // A KDBG block at 0x30000.
    driver.write_bytes(0x30000 + 16, b"KDBG");
    driver.write_u64(0x30000 + 0x18, k(KERNEL_PA).0); // KernBase
    driver.write_u64(0x30000 + 0x50, k(SYSTEM_EPROCESS).0 + TASKS); // PsActiveProcessHead

    let vmi = VmiCore::new(driver)?;

    let kdbg = Kdbg::find(&vmi)?.expect("KDBG block");
    assert_eq!(kdbg.pa, Pa(0x30000));
    assert_eq!(kdbg.kernel_base(&vmi)?, k(KERNEL_PA));
    assert_eq!(
        kdbg.lookup(&vmi, "PsActiveProcessHead")?,
        k(SYSTEM_EPROCESS) + TASKS
    );
    assert!(kdbg.lookup(&vmi, "NotCarriedByKdbg").is_err());
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Unicode strings
///////////////////////////////////////////////////////////////////////////////

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

#[test]
fn unicode_string_64bit_layout() -> Result<(), VmiError> {
    let (vmi, os) = make_initialized()?;

    let driver = vmi.driver();
    driver.write_u16(0x12000, 10); // Length
    driver.write_u16(0x12002, 12); // MaximumLength
    driver.write_u64(0x12008, k(0x12100).0); // Buffer
    driver.write_bytes(0x12100, &utf16("hello"));

    let value =
        os.read_unicode_string(&vmi, AddressContext::new(k(0x12000), Pa(KPGD)))?;
    assert_eq!(value, "hello");
    Ok(())
}

#[test]
fn unicode_string_32bit_layout() -> Result<(), VmiError> {
    // A legacy-paging guest: PGD[0] maps a 4MiB page at PA 0.
    let driver = MockDriver::new();
    driver.write_u32(0x3000, (1 << 7) | 0x3);

    driver.write_u16(0x12000, 8); // Length
    driver.write_u16(0x12002, 8); // MaximumLength
    driver.write_u32(0x12004, 0x12100); // Buffer
    driver.write_bytes(0x12100, &utf16("pe32"));

    let vmi = VmiCore::new(driver)?;
    vmi.set_page_mode(PageMode::Legacy);
    vmi.set_kpgd(Pa(0x3000));

    let config = VmiConfig::from_entries([
        ("win_tasks", "0x88"),
        ("win_pdbase", "0x18"),
        ("win_pid", "0x84"),
        ("win_pname", "0x174"),
    ])?;
    let os = WindowsOs::with_profile(&config, None)?;

    let value =
        os.read_unicode_string(&vmi, AddressContext::new(Va(0x12000), Pa(0x3000)))?;
    assert_eq!(value, "pe32");
    Ok(())
}
