use gvmi_core::{LinuxConfig, VmiError};
use gvmi_profile::Profile;

/// Struct offsets needed to walk the Linux task list.
#[derive(Debug, Clone, Copy)]
pub struct Offsets {
    /// `task_struct.tasks`.
    pub tasks: u64,

    /// `task_struct.mm`.
    pub mm: u64,

    /// `task_struct.pid`.
    pub pid: u64,

    /// `mm_struct.pgd`.
    pub pgd: u64,

    /// `task_struct.comm`.
    pub name: u64,
}

impl Offsets {
    /// Resolves the offsets from configuration overrides, falling back to
    /// the profile for anything not overridden.
    pub fn new(config: &LinuxConfig, profile: Option<&Profile>) -> Result<Self, VmiError> {
        let field = |over: Option<u64>, struct_: &str, field: &str| -> Result<u64, VmiError> {
            if let Some(value) = over {
                return Ok(value);
            }

            match profile {
                Some(profile) => Ok(profile.struct_field(struct_, field)?),
                None => Err(VmiError::Config(format!(
                    "no profile and no override for {struct_}.{field}"
                ))),
            }
        };

        Ok(Self {
            tasks: field(config.tasks_offset, "task_struct", "tasks")?,
            mm: field(config.mm_offset, "task_struct", "mm")?,
            pid: field(config.pid_offset, "task_struct", "pid")?,
            pgd: field(config.pgd_offset, "mm_struct", "pgd")?,
            name: field(config.name_offset, "task_struct", "comm")?,
        })
    }
}
