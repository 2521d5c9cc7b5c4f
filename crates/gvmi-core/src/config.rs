//! Instance configuration.
//!
//! The recognised key set is fixed; unknown keys are rejected with a
//! warning rather than silently ignored, and malformed values fail the
//! parse. The stringly-typed key/value surface exists only at this
//! boundary; everything behind it works with the typed record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{OsType, Pa, Va, VmiError};

bitflags::bitflags! {
    /// Instance initialization flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct VmiFlags: u32 {
        /// Auto-detect the access mode.
        const AUTO = 1 << 0;

        /// The target is a Xen domain.
        const XEN = 1 << 1;

        /// The target is a KVM domain.
        const KVM = 1 << 2;

        /// The target is a file containing a physical memory image.
        const FILE = 1 << 3;

        /// Initialize enough to view physical addresses only.
        const INIT_PARTIAL = 1 << 16;

        /// Full initialization, including the OS view.
        const INIT_COMPLETE = 1 << 17;

        /// Initialize support for VM events.
        const INIT_EVENTS = 1 << 18;

        /// Set up the shared-memory snapshot during initialization.
        const INIT_SNAPSHOT = 1 << 19;

        /// No configuration provided.
        const CONFIG_NONE = 1 << 24;

        /// Configuration comes from a file.
        const CONFIG_FILE = 1 << 25;

        /// Configuration comes from a string.
        const CONFIG_STRING = 1 << 26;

        /// Configuration comes from a key/value table.
        const CONFIG_TABLE = 1 << 27;
    }
}

/// Windows-specific configuration: address seeds and struct offset
/// overrides.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsConfig {
    /// Physical address of the kernel image (`win_ntoskrnl`).
    pub ntoskrnl: Option<Pa>,

    /// Virtual address of the KdVersionBlock (`win_kdvb`).
    pub kdvb: Option<Va>,

    /// Physical address of the System process EPROCESS (`win_sysproc`).
    pub sysproc: Option<Pa>,

    /// `_EPROCESS.ActiveProcessLinks` offset (`win_tasks`).
    pub tasks_offset: Option<u64>,

    /// `_KPROCESS.DirectoryTableBase` offset (`win_pdbase`).
    pub pdbase_offset: Option<u64>,

    /// `_EPROCESS.UniqueProcessId` offset (`win_pid`).
    pub pid_offset: Option<u64>,

    /// `_EPROCESS.ImageFileName` offset (`win_pname`).
    pub pname_offset: Option<u64>,
}

/// Linux-specific struct offset overrides.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxConfig {
    /// `task_struct.tasks` offset (`linux_tasks`).
    pub tasks_offset: Option<u64>,

    /// `task_struct.mm` offset (`linux_mm`).
    pub mm_offset: Option<u64>,

    /// `task_struct.pid` offset (`linux_pid`).
    pub pid_offset: Option<u64>,

    /// `mm_struct.pgd` offset (`linux_pgd`).
    pub pgd_offset: Option<u64>,

    /// `task_struct.comm` offset (`linux_name`).
    pub name_offset: Option<u64>,
}

/// Typed instance configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmiConfig {
    /// Target VM name. One of `name` / `domain_id` is required for
    /// hypervisor backends.
    pub name: Option<String>,

    /// Target VM domain id.
    pub domain_id: Option<u64>,

    /// Forces OS detection to a specific family.
    pub os_type: Option<OsType>,

    /// Path to the structured kernel debug profile (JSON).
    pub profile: Option<PathBuf>,

    /// Path to a Linux `System.map` file.
    pub sysmap: Option<PathBuf>,

    /// Windows seeds and overrides.
    pub windows: WindowsConfig,

    /// Linux overrides.
    pub linux: LinuxConfig,
}

fn parse_number(key: &str, value: &str) -> Result<u64, VmiError> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };

    parsed.map_err(|_| VmiError::Config(format!("invalid value for `{key}`: `{value}`")))
}

impl VmiConfig {
    /// Creates a configuration from key/value entries.
    ///
    /// Unknown keys produce a warning; malformed values produce
    /// [`VmiError::Config`].
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, VmiError> {
        let mut config = Self::default();

        for (key, value) in entries {
            config.apply(key, value)?;
        }

        Ok(config)
    }

    /// Creates a configuration from a `key=value` string, one entry per
    /// line or separated by `;`.
    pub fn from_config_str(s: &str) -> Result<Self, VmiError> {
        let mut config = Self::default();

        for entry in s.split(['\n', ';']) {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }

            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| VmiError::Config(format!("missing `=` in `{entry}`")))?;

            config.apply(key.trim(), value.trim())?;
        }

        Ok(config)
    }

    /// Creates a configuration from a `key=value` file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, VmiError> {
        Self::from_config_str(&std::fs::read_to_string(path)?)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), VmiError> {
        match key {
            "name" => self.name = Some(value.to_string()),
            "domid" => self.domain_id = Some(parse_number(key, value)?),

            "ostype" | "os_type" => {
                self.os_type = Some(match value {
                    "Linux" | "linux" => OsType::Linux,
                    "Windows" | "windows" => OsType::Windows,
                    _ => {
                        return Err(VmiError::Config(format!("unknown ostype `{value}`")));
                    }
                })
            }

            // `sysmap` doubles as the historical alias for the profile path;
            // the OS view decides which interpretation applies.
            "rekall_profile" => self.profile = Some(PathBuf::from(value)),
            "sysmap" => {
                self.sysmap = Some(PathBuf::from(value));
                if self.profile.is_none() {
                    self.profile = Some(PathBuf::from(value));
                }
            }

            "win_ntoskrnl" => self.windows.ntoskrnl = Some(Pa(parse_number(key, value)?)),
            "win_kdvb" => self.windows.kdvb = Some(Va(parse_number(key, value)?)),
            "win_sysproc" => self.windows.sysproc = Some(Pa(parse_number(key, value)?)),
            "win_tasks" => self.windows.tasks_offset = Some(parse_number(key, value)?),
            "win_pdbase" => self.windows.pdbase_offset = Some(parse_number(key, value)?),
            "win_pid" => self.windows.pid_offset = Some(parse_number(key, value)?),
            "win_pname" => self.windows.pname_offset = Some(parse_number(key, value)?),

            "linux_tasks" => self.linux.tasks_offset = Some(parse_number(key, value)?),
            "linux_mm" => self.linux.mm_offset = Some(parse_number(key, value)?),
            "linux_pid" => self.linux.pid_offset = Some(parse_number(key, value)?),
            "linux_pgd" => self.linux.pgd_offset = Some(parse_number(key, value)?),
            "linux_name" => self.linux.name_offset = Some(parse_number(key, value)?),

            _ => {
                tracing::warn!(key, "ignoring unrecognized configuration key");
            }
        }

        Ok(())
    }

    /// Checks that a target identifier is present.
    pub fn require_target(&self) -> Result<(), VmiError> {
        if self.name.is_none() && self.domain_id.is_none() {
            return Err(VmiError::Config(
                "one of `name` or `domid` is required".into(),
            ));
        }

        Ok(())
    }
}
