//! Windows OS view.
//!
//! Reconstructs the process list from the `_EPROCESS` chain, discovers the
//! kernel image and directory table base without guest cooperation, and
//! resolves kernel symbols through three strategies tried in order: the
//! debug profile, the in-memory KDBG block, and the kernel's PE export
//! table.

mod kdbg;
mod offsets;
mod pe;

#[cfg(test)]
mod tests;

use std::cell::Cell;

use gvmi_arch_amd64::Amd64;
use gvmi_core::{
    AccessContext, AddressContext, Architecture as _, OsProcess, Pa, PageMode, ProcessId,
    Registers as _, Va, VcpuId, VmiConfig, VmiCore, VmiDriver, VmiError, VmiOs,
};
use gvmi_profile::Profile;

pub use self::{
    kdbg::Kdbg,
    offsets::Offsets,
    pe::{PeError, PeExport, PeHeaders},
};

/// Upper bound on process-list length.
const MAX_PROCESSES: usize = 65536;

/// `_EPROCESS.ImageFileName` is a fixed 15-byte array plus terminator.
const IMAGE_FILE_NAME_LEN: usize = 16;

/// The pid of the System process.
const SYSTEM_PID: u32 = 4;

/// `_DBGKD_GET_VERSION64.KernBase`, fixed by the debugger protocol.
const KDVB_KERNBASE_OFFSET: u64 = 0x10;

/// Windows version, derived from `NtBuildNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtVersion {
    /// Windows 2000.
    Win2000,

    /// Windows XP / Server 2003.
    WinXp,

    /// Windows Vista.
    WinVista,

    /// Windows 7.
    Win7,

    /// Windows 8 / 8.1.
    Win8,
}

impl NtVersion {
    /// Maps an `NtBuildNumber` value to a version.
    pub fn from_build_number(build: u16) -> Option<Self> {
        match build {
            2195 => Some(Self::Win2000),
            2600 | 3790 => Some(Self::WinXp),
            6000..=6002 => Some(Self::WinVista),
            7600 | 7601 => Some(Self::Win7),
            9200 | 9600 => Some(Self::Win8),
            _ => None,
        }
    }
}

/// VMI operations for the Windows operating system.
pub struct WindowsOs<Driver>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    offsets: Offsets,
    profile: Option<Profile>,

    ntoskrnl: Cell<Pa>,
    ntoskrnl_va: Cell<Va>,
    sysproc: Cell<Pa>,
    kdvb: Cell<Va>,
    kdbg: Cell<Option<Kdbg>>,
    version: Cell<Option<NtVersion>>,

    _marker: std::marker::PhantomData<Driver>,
}

impl<Driver> WindowsOs<Driver>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    /// Creates a new Windows OS view from the instance configuration.
    ///
    /// Fails before any guest access when the profile is missing a struct
    /// field the view cannot work without.
    pub fn new(config: &VmiConfig) -> Result<Self, VmiError> {
        let profile = match &config.profile {
            Some(path) => Some(Profile::from_file(path)?),
            None => None,
        };

        Self::with_profile(config, profile)
    }

    /// Creates a new Windows OS view with an already-loaded profile.
    pub fn with_profile(config: &VmiConfig, profile: Option<Profile>) -> Result<Self, VmiError> {
        let offsets = Offsets::new(&config.windows, profile.as_ref())?;

        Ok(Self {
            offsets,
            profile,
            ntoskrnl: Cell::new(config.windows.ntoskrnl.unwrap_or(Pa(0))),
            ntoskrnl_va: Cell::new(Va(0)),
            sysproc: Cell::new(config.windows.sysproc.unwrap_or(Pa(0))),
            kdvb: Cell::new(config.windows.kdvb.unwrap_or(Va(0))),
            kdbg: Cell::new(None),
            version: Cell::new(None),
            _marker: std::marker::PhantomData,
        })
    }

    /// Returns the resolved struct offsets.
    pub fn offsets(&self) -> &Offsets {
        &self.offsets
    }

    /// Returns the physical base of the kernel image, once discovered.
    pub fn kernel_base(&self) -> Pa {
        self.ntoskrnl.get()
    }

    /// Returns the virtual base of the kernel image, once discovered.
    pub fn kernel_base_va(&self) -> Va {
        self.ntoskrnl_va.get()
    }

    /// Returns the Windows version, once discovered.
    pub fn version(&self) -> Option<NtVersion> {
        self.version.get()
    }

    //
    // Kernel image discovery
    //

    /// Searches physical memory, page by page, for a PE image whose export
    /// directory names it `ntoskrnl.exe`.
    ///
    /// Header fields are interpreted against physically contiguous image
    /// pages, which holds for the boot-loaded kernel.
    pub fn find_kernel_base(vmi: &VmiCore<Driver>, start: Pa) -> Result<Pa, VmiError> {
        const KERNEL_NAME: &[u8] = b"ntoskrnl.exe\0";

        let info = vmi.info()?;
        let mut pa = start.0 & Amd64::PAGE_MASK;

        while pa + Amd64::PAGE_SIZE <= info.max_pa.0 {
            let page_pa = Pa(pa);
            pa += Amd64::PAGE_SIZE;

            let page = match vmi.read_page(Amd64::gfn_from_pa(page_pa)) {
                Ok(page) => page,
                Err(_) => continue,
            };

            if !page.starts_with(b"MZ") {
                continue;
            }

            let headers = match PeHeaders::parse(&page) {
                Ok(headers) => headers,
                Err(_) => continue,
            };

            let (export_rva, _) = match headers.export_directory {
                Some(entry) => entry,
                None => continue,
            };

            if page_pa.0 + export_rva as u64 >= info.max_pa.0 {
                continue;
            }

            let mut directory = [0u8; 40];
            if vmi
                .read(
                    AccessContext::direct(page_pa + export_rva as u64),
                    &mut directory,
                )
                .is_err()
            {
                continue;
            }

            let name_rva = match pe::export_directory_name_rva(&directory) {
                Ok(name_rva) => name_rva,
                Err(_) => continue,
            };

            let mut name = [0u8; KERNEL_NAME.len()];
            if vmi
                .read(AccessContext::direct(page_pa + name_rva as u64), &mut name)
                .is_err()
            {
                continue;
            }

            if name == KERNEL_NAME {
                tracing::debug!(%page_pa, "found ntoskrnl.exe");
                return Ok(page_pa);
            }
        }

        Err(VmiError::Other("kernel image not found"))
    }

    fn locate_kernel(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        // Live path: derive the kernel base from the KPCR, whose address
        // sits in GS (64-bit) or FS (32-bit) while the profile tells us its
        // RVA within the image.
        if self.ntoskrnl_va.get().is_null()
            && let Some(profile) = &self.profile
            && profile.has_constant("KiInitialPCR")
            && let Ok(registers) = vmi.registers(VcpuId(0))
        {
            let kpcr = match vmi.page_mode() {
                Some(PageMode::Ia32e) => registers.gs_base,
                _ => registers.fs_base,
            };

            let rva = profile.constant("KiInitialPCR")?;
            if kpcr != 0 && kpcr > rva {
                let ntoskrnl_va = Va(kpcr - rva);

                if let Ok(ntoskrnl) = vmi.translate_kv2p(ntoskrnl_va) {
                    self.ntoskrnl_va.set(ntoskrnl_va);
                    if self.ntoskrnl.get().is_null() {
                        self.ntoskrnl.set(ntoskrnl);
                    }
                }
            }
        }

        // Fallback: physical scan for the image, then recover the virtual
        // base through KdVersionBlock or the KDBG block.
        if self.ntoskrnl.get().is_null() {
            self.ntoskrnl
                .set(Self::find_kernel_base(vmi, vmi.kpgd())
                    .or_else(|_| Self::find_kernel_base(vmi, Pa(0)))?);
        }

        if self.ntoskrnl_va.get().is_null() {
            self.recover_kernel_va(vmi)?;
        }

        tracing::debug!(
            ntoskrnl = %self.ntoskrnl.get(),
            ntoskrnl_va = %self.ntoskrnl_va.get(),
            "kernel image located"
        );

        self.check_build_number(vmi)
    }

    fn recover_kernel_va(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let ntoskrnl = self.ntoskrnl.get();

        // KdVersionBlock: its RVA comes from configuration or the profile,
        // and its KernBase field holds the virtual base.
        let kdvb_rva = if !self.kdvb.get().is_null() {
            Some(self.kdvb.get().0)
        } else {
            self.profile
                .as_ref()
                .and_then(|profile| profile.constant("KdVersionBlock").ok())
        };

        if let Some(kdvb_rva) = kdvb_rva {
            let kernbase_offset = self
                .profile
                .as_ref()
                .and_then(|profile| {
                    profile
                        .struct_field("_DBGKD_GET_VERSION64", "KernBase")
                        .ok()
                })
                .unwrap_or(KDVB_KERNBASE_OFFSET);

            let mut ntoskrnl_va = vmi.read_u64(AccessContext::direct(
                ntoskrnl + kdvb_rva + kernbase_offset,
            ))?;

            if ntoskrnl_va == 0 {
                ntoskrnl_va = vmi.read_u32(AccessContext::direct(
                    ntoskrnl + kdvb_rva + kernbase_offset,
                ))? as u64;
            }

            if ntoskrnl_va != 0 {
                self.ntoskrnl_va.set(Va(ntoskrnl_va));
                return Ok(());
            }
        }

        // Last resort: the KDBG block records the kernel base too.
        if let Some(kdbg) = self.find_kdbg(vmi)? {
            self.ntoskrnl_va.set(kdbg.kernel_base(vmi)?);
            return Ok(());
        }

        Err(VmiError::Other("failed to find the kernel virtual base"))
    }

    fn check_build_number(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let profile = match &self.profile {
            Some(profile) => profile,
            None => return Ok(()),
        };

        let rva = profile.constant("NtBuildNumber")?;
        let build = vmi.read_u16(AccessContext::direct(self.ntoskrnl.get() + rva))?;

        match NtVersion::from_build_number(build) {
            Some(version) => {
                tracing::debug!(build, ?version, "NtBuildNumber check passed");
                self.version.set(Some(version));
                Ok(())
            }
            None => {
                tracing::warn!(build, "unknown NtBuildNumber; wrong profile?");
                Err(VmiError::Other("unknown NtBuildNumber"))
            }
        }
    }

    fn find_kdbg(&self, vmi: &VmiCore<Driver>) -> Result<Option<Kdbg>, VmiError> {
        if let Some(kdbg) = self.kdbg.get() {
            return Ok(Some(kdbg));
        }

        let kdbg = Kdbg::find(vmi)?;
        self.kdbg.set(kdbg);
        Ok(kdbg)
    }

    //
    // kpgd discovery
    //

    /// Strategy 0: walk `PsActiveProcessHead` for pid 4 and pull the real
    /// directory table base out of the System process.
    fn kpgd_from_process_head(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let head = self.ksym(vmi, "PsActiveProcessHead")?;
        let width = self.pointer_width(vmi)?;

        let mut entry = head;
        let mut sysproc_va = None;

        for _ in 0..MAX_PROCESSES {
            let eprocess = entry - self.offsets.tasks;

            if entry != head
                && vmi.read_u32(AccessContext::kernel(eprocess + self.offsets.pid))?
                    == SYSTEM_PID
            {
                sysproc_va = Some(eprocess);
                break;
            }

            entry = vmi.read_va(AccessContext::kernel(entry), width)?;
            if entry.is_null() || entry == head {
                break;
            }
        }

        let sysproc_va = sysproc_va.ok_or(VmiError::Other("System process not in list"))?;
        let sysproc_pa = vmi.translate_kv2p(sysproc_va)?;

        let kpgd = vmi.read_u64(AccessContext::direct(sysproc_pa + self.offsets.pdbase))?;
        if kpgd == 0 {
            return Err(VmiError::Other("System DirectoryTableBase is zero"));
        }

        vmi.set_kpgd(self.masked_root(vmi, Pa(kpgd)));
        vmi.set_init_task(sysproc_va);

        tracing::debug!(kpgd = %vmi.kpgd(), "kpgd found via PsActiveProcessHead");
        Ok(())
    }

    /// Strategy 1: `PsInitialSystemProcess` → EPROCESS →
    /// `DirectoryTableBase`.
    fn kpgd_from_system_process(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let pointer = self.ksym(vmi, "PsInitialSystemProcess")?;
        let width = self.pointer_width(vmi)?;

        let sysproc_va = vmi.read_va(AccessContext::kernel(pointer), width)?;
        let sysproc_pa = vmi.translate_kv2p(sysproc_va)?;

        let kpgd = vmi.read_u64(AccessContext::direct(sysproc_pa + self.offsets.pdbase))?;
        if kpgd == 0 {
            return Err(VmiError::Other("System DirectoryTableBase is zero"));
        }

        vmi.set_kpgd(self.masked_root(vmi, Pa(kpgd)));
        vmi.set_init_task(sysproc_va);

        tracing::debug!(kpgd = %vmi.kpgd(), "kpgd found via PsInitialSystemProcess");
        Ok(())
    }

    /// Strategy 2: exhaustive physical scan for the System EPROCESS
    /// signature. Works with nothing but physical reads, so it also serves
    /// as the bootstrap when the driver cannot report CR3.
    fn kpgd_from_physical_scan(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let sysproc = match self.sysproc.get() {
            pa if !pa.is_null() => pa,
            _ => {
                let found = self.find_system_eprocess(vmi)?;
                tracing::info!(
                    sysproc = %found,
                    "set win_sysproc in the configuration for faster startup"
                );
                self.sysproc.set(found);
                found
            }
        };

        let kpgd = vmi.read_u64(AccessContext::direct(sysproc + self.offsets.pdbase))?;
        if kpgd == 0 {
            return Err(VmiError::Other("System DirectoryTableBase is zero"));
        }

        // ActiveProcessLinks.Flink points at the next entry; the list head
        // address recorded here is virtual.
        let flink = vmi.read_u64(AccessContext::direct(sysproc + self.offsets.tasks))?;
        if flink == 0 {
            return Err(VmiError::Other("System ActiveProcessLinks is empty"));
        }
        let init_task = Va(flink) - self.offsets.tasks;

        vmi.set_kpgd(self.masked_root(vmi, Pa(kpgd)));
        vmi.set_init_task(init_task);

        tracing::debug!(kpgd = %vmi.kpgd(), "kpgd found via physical scan");
        Ok(())
    }

    /// Scans physical memory for an EPROCESS whose image name is `System`
    /// and whose pid is 4.
    fn find_system_eprocess(&self, vmi: &VmiCore<Driver>) -> Result<Pa, VmiError> {
        const NAME: &[u8] = b"System\0";

        let info = vmi.info()?;
        let finder = memchr::memmem::Finder::new(NAME);

        let mut pa = 0u64;
        while pa + Amd64::PAGE_SIZE <= info.max_pa.0 {
            let page_pa = Pa(pa);
            pa += Amd64::PAGE_SIZE;

            let page = match vmi.read_page(Amd64::gfn_from_pa(page_pa)) {
                Ok(page) => page,
                Err(_) => continue,
            };

            for hit in finder.find_iter(&page) {
                let hit = hit as u64;

                // The candidate EPROCESS base must fall in the same page.
                if hit < self.offsets.pname {
                    continue;
                }

                let candidate = page_pa + hit - self.offsets.pname;

                let pid = match vmi.read_u32(AccessContext::direct(candidate + self.offsets.pid))
                {
                    Ok(pid) => pid,
                    Err(_) => continue,
                };

                if pid != SYSTEM_PID {
                    continue;
                }

                let dtb =
                    match vmi.read_u64(AccessContext::direct(candidate + self.offsets.pdbase)) {
                        Ok(dtb) => dtb,
                        Err(_) => continue,
                    };

                // The System address space root is page aligned.
                if dtb == 0 || dtb & 0xfff != 0 {
                    continue;
                }

                return Ok(candidate);
            }
        }

        Err(VmiError::Other("System EPROCESS not found"))
    }

    fn masked_root(&self, vmi: &VmiCore<Driver>, root: Pa) -> Pa {
        match vmi.page_mode() {
            Some(mode) if mode.root_is_32bit() => root & 0xffff_ffff,
            _ => root,
        }
    }

    /// Probes the candidate paging modes: the first one under which the
    /// kernel virtual base translates to the discovered physical base wins.
    fn find_page_mode(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let ntoskrnl = self.ntoskrnl.get();
        let ntoskrnl_va = self.ntoskrnl_va.get();
        let kpgd = vmi.kpgd();

        if ntoskrnl.is_null() || ntoskrnl_va.is_null() || kpgd.is_null() {
            return Err(VmiError::NotInitialized);
        }

        for &mode in Amd64::modes() {
            let candidate = if mode.root_is_32bit() {
                kpgd & 0xffff_ffff
            } else {
                kpgd
            };

            tracing::debug!(?mode, "probing page mode");

            match vmi.translate_with_mode(ntoskrnl_va, candidate, mode) {
                Ok(pa) if pa == ntoskrnl => {
                    vmi.set_page_mode(mode);
                    vmi.set_kpgd(candidate);
                    return Ok(());
                }
                _ => {}
            }
        }

        Err(VmiError::Other("no paging mode matches the kernel base"))
    }

    //
    // Symbol resolution
    //

    fn pointer_width(&self, vmi: &VmiCore<Driver>) -> Result<usize, VmiError> {
        Ok(vmi
            .page_mode()
            .ok_or(VmiError::NotInitialized)?
            .address_width())
    }

    /// Resolves a kernel symbol: profile, then KDBG, then the kernel PE
    /// export table.
    fn ksym(&self, vmi: &VmiCore<Driver>, symbol: &str) -> Result<Va, VmiError> {
        let ntoskrnl_va = self.ntoskrnl_va.get();
        if ntoskrnl_va.is_null() {
            return Err(VmiError::NotInitialized);
        }

        if let Some(profile) = &self.profile {
            match profile.constant(symbol) {
                Ok(rva) => return Ok(ntoskrnl_va + rva),
                Err(err) => tracing::debug!(symbol, %err, "profile lookup failed"),
            }
        }

        if let Ok(Some(kdbg)) = self.find_kdbg(vmi)
            && let Ok(va) = kdbg.lookup(vmi, symbol)
        {
            tracing::debug!(symbol, %va, "symbol resolved from KDBG");
            return Ok(va);
        }

        if let Some(rva) = self.export_to_rva(vmi, ntoskrnl_va, symbol)? {
            tracing::debug!(symbol, rva, "symbol resolved from PE exports");
            return Ok(ntoskrnl_va + rva);
        }

        Err(VmiError::Other("kernel symbol not found"))
    }

    /// Looks a symbol up in the export table of an image mapped in the
    /// kernel address space.
    pub fn export_to_rva(
        &self,
        vmi: &VmiCore<Driver>,
        image_base: Va,
        symbol: &str,
    ) -> Result<Option<u64>, VmiError> {
        Ok(self
            .image_exports(vmi, image_base)?
            .into_iter()
            .find(|export| export.name == symbol)
            .map(|export| export.rva))
    }

    /// Maps an RVA within an image back to the export starting there.
    pub fn rva_to_export(
        &self,
        vmi: &VmiCore<Driver>,
        image_base: Va,
        rva: u64,
    ) -> Result<Option<String>, VmiError> {
        Ok(self
            .image_exports(vmi, image_base)?
            .into_iter()
            .find(|export| export.rva == rva)
            .map(|export| export.name))
    }

    /// Reads and parses the export table of an image through the kernel
    /// address space.
    pub fn image_exports(
        &self,
        vmi: &VmiCore<Driver>,
        image_base: Va,
    ) -> Result<Vec<PeExport>, VmiError> {
        let mut page = vec![0u8; Amd64::PAGE_SIZE as usize];
        vmi.read(AccessContext::kernel(image_base), &mut page)?;

        let headers =
            PeHeaders::parse(&page).map_err(|err| VmiError::Os(Box::new(err)))?;

        let (rva, size) = headers
            .export_directory
            .ok_or_else(|| VmiError::Os(Box::new(PeError::NoExportDirectory)))?;

        let mut blob = vec![0u8; size as usize];
        vmi.read(AccessContext::kernel(image_base + rva as u64), &mut blob)?;

        pe::parse_exports(&blob, rva).map_err(|err| VmiError::Os(Box::new(err)))
    }

    //
    // Process list
    //

    fn walk_processes(
        &self,
        vmi: &VmiCore<Driver>,
        mut f: impl FnMut(&VmiCore<Driver>, Va) -> Result<bool, VmiError>,
    ) -> Result<(), VmiError> {
        let head = vmi.init_task();
        if head.is_null() {
            return Err(VmiError::NotInitialized);
        }

        let width = self.pointer_width(vmi)?;
        let mut eprocess = head;

        for _ in 0..MAX_PROCESSES {
            if f(vmi, eprocess)? {
                return Ok(());
            }

            let flink = vmi.read_va(
                AccessContext::kernel(eprocess + self.offsets.tasks),
                width,
            )?;
            if flink.is_null() {
                return Err(VmiError::Other("process list link is null"));
            }
            eprocess = flink - self.offsets.tasks;

            if eprocess == head {
                return Ok(());
            }
        }

        tracing::warn!("process list did not terminate; giving up");
        Ok(())
    }

    fn process_pid(&self, vmi: &VmiCore<Driver>, eprocess: Va) -> Result<ProcessId, VmiError> {
        Ok(ProcessId(vmi.read_u32(AccessContext::kernel(
            eprocess + self.offsets.pid,
        ))?))
    }

    fn process_pdbase(&self, vmi: &VmiCore<Driver>, eprocess: Va) -> Result<Pa, VmiError> {
        let width = self.pointer_width(vmi)?;
        let pdbase = vmi.read_address(
            AccessContext::kernel(eprocess + self.offsets.pdbase),
            width,
        )?;

        Ok(Pa(pdbase))
    }

    fn process_name(&self, vmi: &VmiCore<Driver>, eprocess: Va) -> Result<String, VmiError> {
        vmi.read_string_limited(
            AccessContext::kernel(eprocess + self.offsets.pname),
            IMAGE_FILE_NAME_LEN,
        )
    }
}

impl<Driver> VmiOs<Driver> for WindowsOs<Driver>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    fn init(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let result = self.init_internal(vmi);

        if result.is_err() {
            vmi.clear_paging_state();
        }

        result
    }

    fn get_offset(&self, name: &str) -> Result<u64, VmiError> {
        match name {
            "win_tasks" => Ok(self.offsets.tasks),
            "win_pdbase" => Ok(self.offsets.pdbase),
            "win_pid" => Ok(self.offsets.pid),
            "win_pname" => Ok(self.offsets.pname),
            _ => Err(VmiError::Config(format!("unknown offset name `{name}`"))),
        }
    }

    fn pid_to_pgd(&self, vmi: &VmiCore<Driver>, pid: ProcessId) -> Result<Pa, VmiError> {
        let mut found = None;

        self.walk_processes(vmi, |vmi, eprocess| {
            if self.process_pid(vmi, eprocess)? == pid {
                found = Some(self.process_pdbase(vmi, eprocess)?);
                return Ok(true);
            }

            Ok(false)
        })?;

        found.ok_or(VmiError::Other("no process with the given pid"))
    }

    fn pgd_to_pid(&self, vmi: &VmiCore<Driver>, pgd: Pa) -> Result<ProcessId, VmiError> {
        let mut found = None;

        self.walk_processes(vmi, |vmi, eprocess| {
            match self.process_pdbase(vmi, eprocess) {
                Ok(pdbase) if pdbase == pgd => {
                    found = Some(self.process_pid(vmi, eprocess)?);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;

        found.ok_or(VmiError::Other("no process with the given pgd"))
    }

    fn ksym_to_va(&self, vmi: &VmiCore<Driver>, symbol: &str) -> Result<Va, VmiError> {
        self.ksym(vmi, symbol)
    }

    fn processes(&self, vmi: &VmiCore<Driver>) -> Result<Vec<OsProcess>, VmiError> {
        let mut processes = Vec::new();

        self.walk_processes(vmi, |vmi, eprocess| {
            processes.push(OsProcess {
                object: eprocess,
                id: self.process_pid(vmi, eprocess)?,
                translation_root: self.process_pdbase(vmi, eprocess).unwrap_or(Pa(0)),
                name: self.process_name(vmi, eprocess)?,
            });

            Ok(false)
        })?;

        Ok(processes)
    }

    /// Decodes a `_UNICODE_STRING`, whose layout depends on the guest's
    /// pointer width.
    fn read_unicode_string(
        &self,
        vmi: &VmiCore<Driver>,
        ctx: AddressContext,
    ) -> Result<String, VmiError> {
        let width = self.pointer_width(vmi)?;

        let (length, buffer) = match width {
            8 => {
                let mut raw = [0u8; 16];
                vmi.read((ctx.va, ctx.root), &mut raw)?;

                let length = u16::from_le_bytes(raw[0..2].try_into().unwrap());
                let buffer = u64::from_le_bytes(raw[8..16].try_into().unwrap());
                (length, Va(buffer))
            }
            _ => {
                let mut raw = [0u8; 8];
                vmi.read((ctx.va, ctx.root), &mut raw)?;

                let length = u16::from_le_bytes(raw[0..2].try_into().unwrap());
                let buffer = u32::from_le_bytes(raw[4..8].try_into().unwrap());
                (length, Va(buffer as u64))
            }
        };

        if buffer.is_null() {
            return Ok(String::new());
        }

        let mut raw = vec![0u8; length as usize];
        vmi.read((buffer, ctx.root), &mut raw)?;

        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();

        Ok(String::from_utf16_lossy(&units))
    }
}

impl<Driver> WindowsOs<Driver>
where
    Driver: VmiDriver<Architecture = Amd64>,
{
    fn init_internal(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        // Page mode straight from the vCPU state when the driver can
        // deliver it; file-backed targets fall back to probing later.
        let registers = vmi.registers(VcpuId(0)).ok();

        if let Some(registers) = &registers
            && let Some(mode) = registers.paging_mode()
        {
            vmi.set_page_mode(mode);
        }

        // Bootstrap directory table base. A driver-reported CR3 is only
        // provisional: it may belong to an arbitrary process, so the real
        // kernel root is re-derived from the System process below.
        let mut real_kpgd_found = false;

        match registers.as_ref().map(|r| r.translation_root()) {
            Some(root) if !root.is_null() => {
                vmi.set_kpgd(self.masked_root(vmi, root));
            }
            _ => {
                self.kpgd_from_physical_scan(vmi)?;
                real_kpgd_found = true;
            }
        }

        self.locate_kernel(vmi)?;

        if vmi.page_mode().is_none() {
            self.find_page_mode(vmi)?;
        }

        if !real_kpgd_found {
            if self.kpgd_from_process_head(vmi).is_ok() {
                tracing::debug!("kpgd strategy 0 succeeded");
            } else if self.kpgd_from_system_process(vmi).is_ok() {
                tracing::debug!("kpgd strategy 1 succeeded");
            } else {
                self.kpgd_from_physical_scan(vmi)?;
                tracing::debug!("kpgd strategy 2 succeeded");
            }
        }

        if vmi.kpgd().is_null() {
            return Err(VmiError::Other("failed to find kernel page directory"));
        }

        tracing::info!(
            kpgd = %vmi.kpgd(),
            page_mode = ?vmi.page_mode(),
            version = ?self.version.get(),
            "initialized Windows view"
        );

        Ok(())
    }
}
