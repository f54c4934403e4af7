/// The error type used throughout this crate.
///
/// Frame readers use `NotFound` to mean "this reader does not describe this
/// instruction pointer"; the cursor responds by trying the next reader in
/// the chain. Every other error aborts the traversal. `StackEndReached` is
/// not a failure: it marks the sentinel frame at the bottom of the stack.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Unknown failure")]
    Unknown,

    #[error("The requested resource was not found")]
    NotFound,

    #[error("The image has a bad magic value or truncated load commands")]
    InvalidImage,

    #[error("Data is in an unknown or invalid format")]
    InvalidData,

    #[error("The memory range is unmapped or protections forbid reading")]
    Access,

    #[error("Allocation failed or the output capacity was exhausted")]
    NoMemory,

    #[error("Address arithmetic escaped the mapped range")]
    OutOfRange,

    #[error("The end of the stack was reached")]
    StackEndReached,

    #[error("The frame is corrupt or walks the stack backwards")]
    BadFrame,

    #[error("Internal failure")]
    Internal,
}

impl From<gimli::Error> for Error {
    fn from(_: gimli::Error) -> Self {
        Error::InvalidData
    }
}
