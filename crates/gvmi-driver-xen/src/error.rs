/// Error type for the Xen driver.
#[derive(Debug)]
pub enum Error {
    /// An error occurred in the Xen control libraries.
    Xen(xen::XenError),

    /// An I/O error occurred.
    Io(std::io::Error),

    /// The given timeout is invalid.
    InvalidTimeout,

    /// Operation not supported.
    NotSupported,

    /// Out of bounds.
    OutOfBounds,

    /// Timeout.
    Timeout,
}

impl From<xen::XenError> for Error {
    fn from(error: xen::XenError) -> Self {
        Self::Xen(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Xen(err) => write!(f, "{err:?}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::InvalidTimeout => write!(f, "the given timeout is invalid"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::OutOfBounds => write!(f, "out of bounds"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for gvmi_core::VmiError {
    fn from(error: Error) -> Self {
        match error {
            Error::Xen(err) => Self::Driver(Box::new(Error::Xen(err))),
            Error::Io(err) => Self::Io(err),
            Error::InvalidTimeout => Self::InvalidTimeout,
            Error::NotSupported => Self::NotSupported,
            Error::OutOfBounds => Self::OutOfBounds,
            Error::Timeout => Self::Timeout,
        }
    }
}
