use gvmi_core::{VmiError, WindowsConfig};
use gvmi_profile::Profile;

/// Struct offsets needed to walk the Windows process list.
///
/// `pdbase` lives in the `_KPROCESS` that opens every `_EPROCESS`; the
/// rest are `_EPROCESS` fields.
#[derive(Debug, Clone, Copy)]
pub struct Offsets {
    /// `_EPROCESS.ActiveProcessLinks`.
    pub tasks: u64,

    /// `_KPROCESS.DirectoryTableBase`.
    pub pdbase: u64,

    /// `_EPROCESS.UniqueProcessId`.
    pub pid: u64,

    /// `_EPROCESS.ImageFileName`.
    pub pname: u64,
}

impl Offsets {
    /// Resolves the offsets from configuration overrides, falling back to
    /// the profile.
    ///
    /// A missing `DirectoryTableBase` is the gate for the whole Windows
    /// view: without it no process address space can be rooted, so
    /// resolution fails before any guest access happens.
    pub fn new(config: &WindowsConfig, profile: Option<&Profile>) -> Result<Self, VmiError> {
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
            pdbase: field(config.pdbase_offset, "_KPROCESS", "DirectoryTableBase")?,
            tasks: field(config.tasks_offset, "_EPROCESS", "ActiveProcessLinks")?,
            pid: field(config.pid_offset, "_EPROCESS", "UniqueProcessId")?,
            pname: field(config.pname_offset, "_EPROCESS", "ImageFileName")?,
        })
    }
}
