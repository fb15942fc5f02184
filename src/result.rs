use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::io;

use super::*;

/// The top-level result type for fallible segment-manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the issues that may come up in both the
/// expected and unexpected operation of the segment manager.
#[derive(Debug)]
pub enum Error {
    /// The system has been configured in an unsupported way.
    Unsupported(String),
    /// A slot lookup referred to an unoccupied or out-of-range slot.
    InvalidSlot(Slot),
    /// An operation that is only legal while a log iterator is
    /// registered was called without one.
    NoActiveIterator,
    /// The replication layer failed to open, close, or sync a replica.
    Replication(String),
    /// Data read back out of a segment failed validation.
    Corruption(String),
    /// A read or write error has happened when interacting with
    /// underlying storage.
    Io(io::Error),
    /// An unexpected bug has happened. Please open an issue on github!
    ReportableBug(String),
}

use self::Error::*;

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Unsupported(l), Unsupported(r)) => l == r,
            (InvalidSlot(l), InvalidSlot(r)) => l == r,
            (NoActiveIterator, NoActiveIterator) => true,
            (Replication(l), Replication(r)) => l == r,
            (Corruption(l), Corruption(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Error {
        Io(io_error)
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unsupported(e) => write!(f, "Unsupported: {}", e),
            InvalidSlot(slot) => write!(f, "Invalid segment slot: {}", slot),
            NoActiveIterator => {
                write!(f, "operation requires an active log iterator")
            }
            Replication(e) => write!(f, "Replication error: {}", e),
            Corruption(e) => write!(f, "Read corrupted data: {}", e),
            Io(e) => write!(f, "IO error: {}", e),
            ReportableBug(e) => write!(
                f,
                "Unexpected bug has happened: {}. PLEASE REPORT THIS BUG!",
                e
            ),
        }
    }
}
