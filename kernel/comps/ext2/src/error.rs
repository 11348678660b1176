// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// No free block or inode is left on the device.
    NoSpaceLeftOnDevice,
    /// The name or the object does not exist.
    DoesNotExist,
    /// An on-disk record is malformed.
    CorruptEntry,
    /// An internal invariant of the driver is violated.
    AlgorithmicError,
    /// Not a directory.
    NotDir,
    /// Is a directory.
    IsDir,
    /// Not a symbolic link.
    NotSymlink,
    /// The name already exists.
    Exists,
    /// The directory still holds entries.
    DirNotEmpty,
    /// Invalid arguments.
    InvalidArgs,
    /// The name is longer than a directory record can hold.
    NameTooLong,
    /// The file cannot grow any further.
    FileTooBig,
    /// IO error.
    IoFailed,
    /// The superblock magic number mismatched.
    BadMagic,
    /// The revision level is unknown.
    BadRevision,
    /// Unsupported.
    Unsupported,
}

/// The error with an error type and an error message used in this crate.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// Returns the error message, if any.
    pub fn msg(&self) -> Option<&'static str> {
        self.msg
    }

    /// Reports a broken internal invariant.
    ///
    /// Debug builds abort right away; release builds hand back
    /// an `AlgorithmicError` for the caller to propagate.
    pub(crate) fn algorithmic(msg: &'static str) -> Self {
        log::error!("ext2: algorithmic error: {}", msg);
        debug_assert!(false, "ext2: algorithmic error: {}", msg);
        Error::with_msg(Errno::AlgorithmicError, msg)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
