//! VMI driver for KVM domains.
//!
//! The hypervisor control channel is QMP (through
//! `virsh qemu-monitor-command`); memory access goes through the patched
//! QEMU unix-socket memory server when available, the plain `xp` monitor
//! command otherwise, and the shared-memory snapshot in snapshot mode.
//! Asynchronous events are not provided by this backend.

mod driver;
mod error;
mod qmp;
mod snapshot;
mod socket;

use gvmi_arch_amd64::{Amd64, Registers};
use gvmi_core::{
    Gfn, Pa, ProcessId, Va, VaPage, VcpuId, VmiConfig, VmiDriver, VmiError, VmiInfo,
    VmiMappedPage,
};

pub use self::{
    error::Error,
    snapshot::{M2pChunk, V2mChunkSpec, coalesce},
};
use self::driver::KvmDriver;

/// VMI driver for KVM domains.
pub struct VmiKvmDriver {
    inner: KvmDriver,
}

impl VmiKvmDriver {
    /// Connects to a KVM domain by name.
    pub fn new(name: &str) -> Result<Self, VmiError> {
        Ok(Self {
            inner: KvmDriver::new(name)?,
        })
    }

    /// Connects to a KVM domain named by the instance configuration
    /// (`name`, or `domid` resolved to its name).
    pub fn from_config(config: &VmiConfig) -> Result<Self, VmiError> {
        config.require_target()?;

        let name = match (&config.name, config.domain_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => KvmDriver::name_from_id(id)?,
            (None, None) => unreachable!("require_target checked"),
        };

        Self::new(&name)
    }

    /// Resolves a domain name to its id.
    pub fn id_from_name(name: &str) -> Result<u64, VmiError> {
        Ok(KvmDriver::id_from_name(name)?)
    }

    /// Resolves a domain id to its name.
    pub fn name_from_id(id: u64) -> Result<String, VmiError> {
        Ok(KvmDriver::name_from_id(id)?)
    }

    /// Probes whether a domain exists.
    pub fn check(name: &str) -> bool {
        KvmDriver::check(name)
    }
}

impl VmiDriver for VmiKvmDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(self.inner.info()?)
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        Ok(self.inner.read_page(gfn)?)
    }

    fn write(&self, pa: Pa, content: &[u8]) -> Result<(), VmiError> {
        Ok(self.inner.write(pa, content)?)
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, VmiError> {
        // The monitor register dump describes the boot CPU only.
        if vcpu != VcpuId(0) {
            return Err(VmiError::NotSupported);
        }

        Ok(self.inner.registers()?)
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(self.inner.pause()?)
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(self.inner.resume()?)
    }

    fn snapshot_create(&self) -> Result<(), VmiError> {
        Ok(self.inner.snapshot_create()?)
    }

    fn snapshot_destroy(&self) -> Result<(), VmiError> {
        Ok(self.inner.snapshot_destroy()?)
    }

    fn snapshot_active(&self) -> bool {
        self.inner.snapshot_active()
    }

    fn direct_physical(&self, pa: Pa, count: usize) -> Result<(VmiMappedPage, usize), VmiError> {
        Ok(self.inner.direct_physical(pa, count)?)
    }

    fn direct_virtual(
        &self,
        pid: ProcessId,
        va: Va,
        count: usize,
    ) -> Result<Option<(VmiMappedPage, usize)>, VmiError> {
        Ok(self.inner.direct_virtual(pid, va, count)?)
    }

    fn insert_virtual_mappings(&self, pid: ProcessId, pages: &[VaPage]) -> Result<(), VmiError> {
        Ok(self.inner.insert_virtual_mappings(pid, pages)?)
    }
}
