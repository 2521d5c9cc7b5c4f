//! KVM driver internals.
//!
//! Live access has two strategies, tried in order and recorded so
//! subsequent calls behave consistently: the *patched* unix-socket memory
//! server started with `pmemaccess` (fast), and the *native* `xp` monitor
//! command (orders of magnitude slower; the fallback is logged loudly for
//! that reason). Snapshot mode replaces both with the shared-memory
//! mapping.

use std::{cell::RefCell, process::Command};

use gvmi_arch_amd64::{Amd64, Registers};
use gvmi_core::{Architecture as _, Gfn, Pa, ProcessId, Va, VaPage, VmiInfo, VmiMappedPage};

use crate::{
    Error,
    qmp::{self, Qmp},
    snapshot::Snapshot,
    socket::MemoryServer,
};

/// The active live-access strategy.
enum AccessMode {
    /// The patched memory server over a unix socket.
    Patched(MemoryServer),

    /// Plain monitor `xp` dumps.
    Native,
}

pub(crate) struct KvmDriver {
    domain: String,
    qmp: Qmp,
    info: VmiInfo,

    mode: RefCell<AccessMode>,
    snapshot: RefCell<Option<Snapshot>>,
}

fn virsh(args: &[&str]) -> Result<String, Error> {
    let output = Command::new("virsh").args(args).output()?;

    if !output.status.success() {
        return Err(Error::Qmp(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses the fields of `virsh dominfo` output that describe topology.
pub(crate) fn parse_dominfo(output: &str) -> Option<(u64, u16)> {
    let mut max_memory_kib = None;
    let mut vcpus = None;

    for line in output.lines() {
        let (key, value) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };

        match key.trim() {
            "Max memory" => {
                max_memory_kib = value.trim().split_whitespace().next()?.parse().ok();
            }
            "CPU(s)" => {
                vcpus = value.trim().parse().ok();
            }
            _ => {}
        }
    }

    Some((max_memory_kib?, vcpus?))
}

impl KvmDriver {
    /// Connects to a KVM domain by name.
    pub fn new(domain: &str) -> Result<Self, Error> {
        let dominfo = virsh(&["dominfo", domain])?;
        let (max_memory_kib, vcpus) =
            parse_dominfo(&dominfo).ok_or(Error::Parse("dominfo output"))?;

        let ram_size = max_memory_kib * 1024;
        let info = VmiInfo {
            page_size: Amd64::PAGE_SIZE,
            page_shift: Amd64::PAGE_SHIFT,
            ram_size,
            max_pa: Pa(ram_size),
            vcpus,
            hvm: true,
        };

        let driver = Self {
            domain: domain.to_string(),
            qmp: Qmp::new(domain),
            info,
            mode: RefCell::new(AccessMode::Native),
            snapshot: RefCell::new(None),
        };

        driver.setup_live_mode()?;
        Ok(driver)
    }

    /// Resolves a domain id to its name.
    pub fn name_from_id(id: u64) -> Result<String, Error> {
        Ok(virsh(&["domname", &id.to_string()])?.trim().to_string())
    }

    /// Resolves a domain name to its id.
    pub fn id_from_name(name: &str) -> Result<u64, Error> {
        virsh(&["domid", name])?
            .trim()
            .parse()
            .map_err(|_| Error::Parse("domain id"))
    }

    /// Probes whether a domain exists.
    pub fn check(name: &str) -> bool {
        virsh(&["dominfo", name]).is_ok()
    }

    pub fn info(&self) -> Result<VmiInfo, Error> {
        Ok(self.info)
    }

    /// Installs the fastest live-access strategy available.
    fn setup_live_mode(&self) -> Result<(), Error> {
        if matches!(&*self.mode.borrow(), AccessMode::Patched(_)) {
            tracing::debug!("resuming patched memory access");
            return Ok(());
        }

        let socket_path = std::env::temp_dir().join(format!(
            "gvmi-{}-{}",
            self.domain,
            std::process::id()
        ));
        let socket_path_str = socket_path.to_string_lossy();

        match self.qmp.pmemaccess(&socket_path_str) {
            Ok(reply) if qmp::reply_is_success(&reply) => {
                match MemoryServer::connect(&socket_path) {
                    Ok(server) => {
                        tracing::debug!("using patched memory access");
                        *self.mode.borrow_mut() = AccessMode::Patched(server);
                        return Ok(());
                    }
                    Err(err) => {
                        tracing::debug!(%err, "memory server connect failed");
                    }
                }
            }
            Ok(_) | Err(_) => {}
        }

        // The performance difference is orders of magnitude; make the
        // downgrade visible instead of silent.
        tracing::warn!("pmemaccess unavailable; falling back to slow native xp access");
        *self.mode.borrow_mut() = AccessMode::Native;
        Ok(())
    }

    pub fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, Error> {
        let pa = Amd64::pa_from_gfn(gfn);
        let page_size = Amd64::PAGE_SIZE as usize;

        if pa.0 + Amd64::PAGE_SIZE > self.info.ram_size {
            return Err(Error::OutOfBounds);
        }

        if let Some(snapshot) = &*self.snapshot.borrow() {
            return Ok(snapshot.dgpma(pa, page_size)?.0);
        }

        match &*self.mode.borrow() {
            AccessMode::Patched(server) => {
                Ok(VmiMappedPage::new(server.read(pa.0, page_size)?))
            }
            AccessMode::Native => {
                let dump = self.qmp.xp(page_size / 4, pa.0)?;
                let bytes = qmp::parse_xp(&dump, page_size / 4).ok_or(Error::Parse("xp dump"))?;
                Ok(VmiMappedPage::new(bytes))
            }
        }
    }

    pub fn write(&self, pa: Pa, content: &[u8]) -> Result<(), Error> {
        if self.snapshot.borrow().is_some() {
            // The snapshot is read-only.
            return Err(Error::NotSupported);
        }

        match &*self.mode.borrow() {
            AccessMode::Patched(server) => server.write(pa.0, content),
            AccessMode::Native => Err(Error::NotSupported),
        }
    }

    pub fn registers(&self) -> Result<Registers, Error> {
        let dump = match &*self.snapshot.borrow() {
            // Snapshot mode answers from the dump captured at freeze time.
            Some(snapshot) => snapshot.registers().to_string(),
            None => self.qmp.info_registers()?,
        };

        parse_registers(&dump).ok_or(Error::Parse("info registers dump"))
    }

    pub fn pause(&self) -> Result<(), Error> {
        virsh(&["suspend", &self.domain]).map(drop)
    }

    pub fn resume(&self) -> Result<(), Error> {
        virsh(&["resume", &self.domain]).map(drop)
    }

    //
    // Snapshot
    //

    pub fn snapshot_create(&self) -> Result<(), Error> {
        if self.snapshot.borrow().is_some() {
            self.snapshot_destroy()?;
        }

        let shm_name = format!("gvmi-{}-{}", self.domain, std::process::id());

        let size = match self.qmp.snapshot_create(&shm_name)? {
            Some(size) if size > 0 => size,
            Some(_) => return Err(Error::Qmp("snapshot-create returned zero size".into())),
            None => {
                tracing::warn!("hypervisor lacks snapshot-create support");
                return Err(Error::NotSupported);
            }
        };

        if size != self.info.ram_size {
            tracing::debug!(size, ram_size = self.info.ram_size, "snapshot size differs");
        }

        let registers = self.qmp.info_registers()?;
        let snapshot = Snapshot::attach(&shm_name, size, registers)?;

        *self.snapshot.borrow_mut() = Some(snapshot);
        Ok(())
    }

    pub fn snapshot_destroy(&self) -> Result<(), Error> {
        match self.snapshot.borrow_mut().take() {
            Some(snapshot) => snapshot.detach()?,
            None => return Ok(()),
        }

        // Live access resumes with whatever strategy is still available.
        self.setup_live_mode()
    }

    pub fn snapshot_active(&self) -> bool {
        self.snapshot.borrow().is_some()
    }

    pub fn direct_physical(&self, pa: Pa, count: usize) -> Result<(VmiMappedPage, usize), Error> {
        match &*self.snapshot.borrow() {
            Some(snapshot) => snapshot.dgpma(pa, count),
            None => Err(Error::SnapshotNotActive),
        }
    }

    pub fn direct_virtual(
        &self,
        pid: ProcessId,
        va: Va,
        count: usize,
    ) -> Result<Option<(VmiMappedPage, usize)>, Error> {
        match &*self.snapshot.borrow() {
            Some(snapshot) => Ok(snapshot.dgvma_lookup(pid, va, count)),
            None => Err(Error::SnapshotNotActive),
        }
    }

    pub fn insert_virtual_mappings(&self, pid: ProcessId, pages: &[VaPage]) -> Result<(), Error> {
        match &*self.snapshot.borrow() {
            Some(snapshot) => snapshot.build_v2m(pid, pages),
            None => Err(Error::SnapshotNotActive),
        }
    }
}

impl Drop for KvmDriver {
    fn drop(&mut self) {
        if self.snapshot_active()
            && let Err(err) = self.snapshot_destroy()
        {
            tracing::error!(%err, "failed to tear down snapshot");
        }
    }
}

/// Builds a register set from an `info registers` text dump.
///
/// The 64-bit register names are tried first, then the 32-bit names a
/// legacy guest prints.
fn parse_registers(dump: &str) -> Option<Registers> {
    let mut registers = Registers::default();

    let reg = |name: &str| qmp::parse_register(dump, name);

    if let Some(rax) = reg("RAX") {
        registers.rax = rax;
        registers.rbx = reg("RBX")?;
        registers.rcx = reg("RCX")?;
        registers.rdx = reg("RDX")?;
        registers.rbp = reg("RBP")?;
        registers.rsi = reg("RSI")?;
        registers.rdi = reg("RDI")?;
        registers.rsp = reg("RSP")?;
        registers.r8 = reg("R8").unwrap_or(0);
        registers.r9 = reg("R9").unwrap_or(0);
        registers.r10 = reg("R10").unwrap_or(0);
        registers.r11 = reg("R11").unwrap_or(0);
        registers.r12 = reg("R12").unwrap_or(0);
        registers.r13 = reg("R13").unwrap_or(0);
        registers.r14 = reg("R14").unwrap_or(0);
        registers.r15 = reg("R15").unwrap_or(0);
        registers.rip = reg("RIP")?;
        registers.rflags = reg("RFL").unwrap_or(0);
    } else {
        registers.rax = reg("EAX")?;
        registers.rbx = reg("EBX")?;
        registers.rcx = reg("ECX")?;
        registers.rdx = reg("EDX")?;
        registers.rbp = reg("EBP")?;
        registers.rsi = reg("ESI")?;
        registers.rdi = reg("EDI")?;
        registers.rsp = reg("ESP")?;
        registers.rip = reg("EIP")?;
        registers.rflags = reg("EFL").unwrap_or(0);
    }

    registers.cr0 = reg("CR0").unwrap_or(0).into();
    registers.cr2 = reg("CR2").unwrap_or(0).into();
    registers.cr3 = reg("CR3")?.into();
    registers.cr4 = reg("CR4").unwrap_or(0).into();
    registers.msr_efer = reg("EFER").unwrap_or(0).into();

    registers.fs_base = qmp::parse_segment_base(dump, "FS").unwrap_or(0);
    registers.gs_base = qmp::parse_segment_base(dump, "GS").unwrap_or(0);

    Some(registers)
}
