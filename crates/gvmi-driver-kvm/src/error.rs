/// Error type for the KVM driver.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(std::io::Error),

    /// A QMP command failed or returned unusable output.
    Qmp(String),

    /// A textual hypervisor response could not be parsed.
    Parse(&'static str),

    /// The memory server rejected the request.
    MemoryServer,

    /// Operation not supported.
    NotSupported,

    /// No snapshot is active.
    SnapshotNotActive,

    /// Out of bounds.
    OutOfBounds,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Qmp(msg) => write!(f, "QMP command failed: {msg}"),
            Self::Parse(what) => write!(f, "failed to parse {what}"),
            Self::MemoryServer => write!(f, "memory server rejected the request"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::SnapshotNotActive => write!(f, "no snapshot is active"),
            Self::OutOfBounds => write!(f, "out of bounds"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for gvmi_core::VmiError {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => Self::Io(err),
            Error::NotSupported => Self::NotSupported,
            Error::OutOfBounds => Self::OutOfBounds,
            Error::SnapshotNotActive => Self::NotSupported,
            other => Self::Driver(Box::new(other)),
        }
    }
}
