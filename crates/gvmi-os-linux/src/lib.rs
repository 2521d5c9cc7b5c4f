//! Linux OS view.
//!
//! Reconstructs the process list by walking the doubly linked task list
//! rooted at `init_task`, using struct offsets taken from configuration
//! overrides or a kernel debug profile. Kernel symbols resolve through a
//! `System.map` file or the profile's constants table.

mod offsets;
mod sysmap;

#[cfg(test)]
mod tests;

use gvmi_core::{
    AccessContext, AddressContext, OsProcess, Pa, ProcessId, Registers as _, Va, VcpuId, VmiConfig,
    VmiCore, VmiDriver, VmiError, VmiOs,
};
use gvmi_profile::Profile;

pub use self::{offsets::Offsets, sysmap::SystemMap};

/// Upper bound on task-list length, to keep a corrupted list from walking
/// forever.
const MAX_TASKS: usize = 65536;

/// `TASK_COMM_LEN`.
const COMM_LEN: usize = 16;

/// VMI operations for the Linux operating system.
pub struct LinuxOs<Driver>
where
    Driver: VmiDriver,
{
    offsets: Offsets,
    sysmap: Option<SystemMap>,
    profile: Option<Profile>,

    _marker: std::marker::PhantomData<Driver>,
}

impl<Driver> LinuxOs<Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new Linux OS view from the instance configuration.
    ///
    /// The `sysmap` key historically names either a `System.map` file or a
    /// JSON profile; the two are distinguished by content.
    pub fn new(config: &VmiConfig) -> Result<Self, VmiError> {
        let mut sysmap = None;
        let mut profile = None;

        if let Some(path) = &config.sysmap {
            let content = std::fs::read_to_string(path)?;

            if content.trim_start().starts_with('{') {
                profile = Some(Profile::from_str(&content)?);
            } else {
                sysmap = Some(SystemMap::parse(&content));
            }
        }

        if profile.is_none()
            && let Some(path) = &config.profile
            && Some(path) != config.sysmap.as_ref()
        {
            profile = Some(Profile::from_file(path)?);
        }

        let offsets = Offsets::new(&config.linux, profile.as_ref())?;

        Ok(Self {
            offsets,
            sysmap,
            profile,
            _marker: std::marker::PhantomData,
        })
    }

    /// Creates a Linux OS view from already-loaded parts.
    pub fn from_parts(
        offsets: Offsets,
        sysmap: Option<SystemMap>,
        profile: Option<Profile>,
    ) -> Self {
        Self {
            offsets,
            sysmap,
            profile,
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns the resolved struct offsets.
    pub fn offsets(&self) -> &Offsets {
        &self.offsets
    }

    /// Resolves a kernel symbol without touching the guest: system map
    /// first, then the profile constants.
    fn resolve_ksym(&self, symbol: &str) -> Result<Va, VmiError> {
        if let Some(sysmap) = &self.sysmap
            && let Some(va) = sysmap.lookup(symbol)
        {
            return Ok(va);
        }

        if let Some(profile) = &self.profile {
            return Ok(Va(profile.constant(symbol)?));
        }

        Err(VmiError::Config(format!(
            "no system map or profile to resolve `{symbol}`"
        )))
    }

    fn pointer_width(&self, vmi: &VmiCore<Driver>) -> Result<usize, VmiError> {
        Ok(vmi
            .page_mode()
            .ok_or(VmiError::NotInitialized)?
            .address_width())
    }

    /// Walks the task list rooted at `init_task`, invoking `f` with each
    /// `task_struct` address until it returns `true` or the head is
    /// revisited.
    fn walk_tasks(
        &self,
        vmi: &VmiCore<Driver>,
        mut f: impl FnMut(&VmiCore<Driver>, Va) -> Result<bool, VmiError>,
    ) -> Result<(), VmiError> {
        let head = vmi.init_task();
        if head.is_null() {
            return Err(VmiError::NotInitialized);
        }

        let width = self.pointer_width(vmi)?;
        let mut task = head;

        for _ in 0..MAX_TASKS {
            if f(vmi, task)? {
                return Ok(());
            }

            let next = vmi.read_va(
                AccessContext::kernel(task + self.offsets.tasks),
                width,
            )?;
            if next.is_null() {
                return Err(VmiError::Other("task list link is null"));
            }
            task = next - self.offsets.tasks;

            if task == head {
                return Ok(());
            }
        }

        tracing::warn!("task list did not terminate; giving up");
        Ok(())
    }

    fn task_pid(&self, vmi: &VmiCore<Driver>, task: Va) -> Result<ProcessId, VmiError> {
        Ok(ProcessId(vmi.read_u32(AccessContext::kernel(
            task + self.offsets.pid,
        ))?))
    }

    fn task_name(&self, vmi: &VmiCore<Driver>, task: Va) -> Result<String, VmiError> {
        vmi.read_string_limited(AccessContext::kernel(task + self.offsets.name), COMM_LEN)
    }

    /// Reads the directory table base of a task.
    ///
    /// `task_struct.mm` is NULL for kernel threads; `active_mm`, located
    /// one pointer width after `mm`, is the documented fallback.
    fn task_pgd(&self, vmi: &VmiCore<Driver>, task: Va) -> Result<Pa, VmiError> {
        let width = self.pointer_width(vmi)?;

        let mut mm = vmi.read_va(AccessContext::kernel(task + self.offsets.mm), width)?;
        if mm.is_null() {
            mm = vmi.read_va(
                AccessContext::kernel(task + self.offsets.mm + width as u64),
                width,
            )?;
        }

        if mm.is_null() {
            return Err(VmiError::Other("task has no mm or active_mm"));
        }

        let pgd_va = vmi.read_va(AccessContext::kernel(mm + self.offsets.pgd), width)?;

        // The pgd pointer is a kernel virtual address; root it physically.
        vmi.translate_kv2p(pgd_va)
    }

    fn find_task_by_pid(&self, vmi: &VmiCore<Driver>, pid: ProcessId) -> Result<Va, VmiError> {
        let mut found = None;

        self.walk_tasks(vmi, |vmi, task| {
            if self.task_pid(vmi, task)? == pid {
                found = Some(task);
                return Ok(true);
            }

            Ok(false)
        })?;

        found.ok_or(VmiError::Other("no task with the given pid"))
    }
}

impl<Driver> VmiOs<Driver> for LinuxOs<Driver>
where
    Driver: VmiDriver,
{
    fn init(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let result = self.init_paging(vmi);

        if result.is_err() {
            vmi.clear_paging_state();
        }

        result
    }

    fn get_offset(&self, name: &str) -> Result<u64, VmiError> {
        match name {
            "linux_tasks" => Ok(self.offsets.tasks),
            "linux_mm" => Ok(self.offsets.mm),
            "linux_pid" => Ok(self.offsets.pid),
            "linux_pgd" => Ok(self.offsets.pgd),
            "linux_name" => Ok(self.offsets.name),
            _ => Err(VmiError::Config(format!("unknown offset name `{name}`"))),
        }
    }

    fn pid_to_pgd(&self, vmi: &VmiCore<Driver>, pid: ProcessId) -> Result<Pa, VmiError> {
        let task = self.find_task_by_pid(vmi, pid)?;
        self.task_pgd(vmi, task)
    }

    fn pgd_to_pid(&self, vmi: &VmiCore<Driver>, pgd: Pa) -> Result<ProcessId, VmiError> {
        let mut found = None;

        self.walk_tasks(vmi, |vmi, task| {
            // Tasks with unreadable or absent mm are skipped, not fatal.
            match self.task_pgd(vmi, task) {
                Ok(task_pgd) if task_pgd == pgd => {
                    found = Some(self.task_pid(vmi, task)?);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;

        found.ok_or(VmiError::Other("no task with the given pgd"))
    }

    fn ksym_to_va(&self, _vmi: &VmiCore<Driver>, symbol: &str) -> Result<Va, VmiError> {
        self.resolve_ksym(symbol)
    }

    fn processes(&self, vmi: &VmiCore<Driver>) -> Result<Vec<OsProcess>, VmiError> {
        let mut processes = Vec::new();

        self.walk_tasks(vmi, |vmi, task| {
            let id = self.task_pid(vmi, task)?;
            let name = self.task_name(vmi, task)?;
            let translation_root = self.task_pgd(vmi, task).unwrap_or(Pa(0));

            processes.push(OsProcess {
                object: task,
                id,
                translation_root,
                name,
            });

            Ok(false)
        })?;

        Ok(processes)
    }

    fn read_unicode_string(
        &self,
        _vmi: &VmiCore<Driver>,
        _ctx: AddressContext,
    ) -> Result<String, VmiError> {
        // Linux has no counted Unicode-string structure.
        Err(VmiError::NotSupported)
    }
}

impl<Driver> LinuxOs<Driver>
where
    Driver: VmiDriver,
{
    fn init_paging(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let init_task = self.resolve_ksym("init_task")?;

        let registers = vmi.registers(VcpuId(0))?;
        let mode = registers
            .paging_mode()
            .ok_or(VmiError::Other("guest paging is disabled"))?;

        // The root that resolves the kernel image; on a split-root
        // architecture this picks the high-half table for `init_task`.
        let mut kpgd = registers.translation_root_for(init_task);
        if mode.root_is_32bit() {
            kpgd = kpgd & 0xffff_ffff;
        }

        if kpgd.is_null() {
            return Err(VmiError::Other("no kernel directory table base"));
        }

        // The candidate must actually resolve the kernel image.
        vmi.translate_with_mode(init_task, kpgd, mode)?;

        vmi.set_page_mode(mode);
        vmi.set_kpgd(kpgd);
        vmi.set_init_task(init_task);

        tracing::info!(%kpgd, ?mode, %init_task, "initialized Linux view");
        Ok(())
    }
}
