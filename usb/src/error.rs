use std::fmt::Formatter;

/// A raw platform error code, as reported by GetLastError after a failed call.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct OsError(pub u32);

impl OsError {
    pub fn code(&self) -> u32 {
        self.0
    }

    /// The driver reported failure, but didn't leave a code behind.
    pub fn is_unattributed(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for OsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OS error {} (0x{:08x})", self.0, self.0)
    }
}

impl std::fmt::Debug for OsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OsError({})", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("Unable to open device at {path}: {error}")]
    Open { path: String, error: OsError },

    #[error("Unable to initialise the WinUSB session: {0}")]
    SessionInit(OsError),

    #[error("Unable to create the device information set: {0}")]
    InfoSet(OsError),

    #[error("Unable to enumerate device interface {index}: {error}")]
    Enumeration { index: u32, error: OsError },
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("The enumeration handle is not valid")]
    InvalidHandle,

    #[error("Unable to determine the interface detail size: {0}")]
    SizeUnavailable(OsError),

    #[error("Interface detail record of {0} bytes is too small to hold a path")]
    Truncated(u32),

    #[error("No header layout was accepted (tried {tried:?}), last {error}")]
    NoMatchingLayout { tried: Vec<u32>, error: OsError },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer failed: {0}")]
    Os(OsError),

    #[error("The driver reported a failed transfer, but no error code was returned")]
    Unattributed,
}

impl From<OsError> for TransferError {
    fn from(error: OsError) -> Self {
        if error.is_unattributed() {
            return TransferError::Unattributed;
        }
        TransferError::Os(error)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("The device has not been initialised")]
    NotOpen,

    #[error("The device has already been initialised")]
    AlreadyOpen,

    #[error("The device has been closed, and cannot be reused")]
    Closed,

    #[error("The WinUSB handle is not initialised")]
    NullSessionHandle,

    #[error("No interface has been selected, call change_interface first")]
    InterfaceNotSelected,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{0}")]
    Precondition(#[from] PreconditionError),
}

pub type Result<T> = std::result::Result<T, Error>;
