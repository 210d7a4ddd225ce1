//! Errno values returned by Osmium syscalls.
//!
//! Errors are returned as negative values in EAX, matching Linux errno
//! conventions. The kernel dispatcher converts `Errno` to a negative i32
//! stored in EAX as u32.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, thiserror::Error)]
#[must_use]
#[repr(i32)]
pub enum Errno {
    #[error("Operation not permitted")]
    PermissionDenied = -1,
    #[error("No such file or directory")]
    NotFound = -2,
    #[error("No such process")]
    NoProcess = -3,
    #[error("Interrupted system call")]
    Interrupted = -4,
    #[error("Input/output error")]
    IoError = -5,
    #[error("Argument list too long")]
    ArgumentListTooLong = -7,
    #[error("Exec format error")]
    ExecFormatError = -8,
    #[error("Bad file descriptor")]
    BadHandle = -9,
    #[error("No child processes")]
    NoChildren = -10,
    #[error("Resource temporarily unavailable")]
    Again = -11,
    #[error("Cannot allocate memory")]
    OutOfMemory = -12,
    #[error("Permission denied")]
    AccessDenied = -13,
    #[error("Bad address")]
    Fault = -14,
    #[error("File exists")]
    AlreadyExists = -17,
    #[error("Not a directory")]
    NotADirectory = -20,
    #[error("Is a directory")]
    IsADirectory = -21,
    #[error("Invalid argument")]
    InvalidArgument = -22,
    #[error("Too many open files")]
    TooManyFiles = -24,
    #[error("File name too long")]
    NameTooLong = -36,
    #[error("Function not implemented")]
    NotImplemented = -38,
    #[error("Too many levels of symbolic links")]
    InterpreterLoop = -40,
}

impl Errno {
    /// Raw value as stored in EAX on syscall return.
    #[inline]
    pub fn to_raw(self) -> u32 {
        (self as i32) as u32
    }

    pub fn from_code(code: i32) -> Self {
        Self::try_from(code).unwrap_or(Errno::InvalidArgument)
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Errno::PermissionDenied => "EPERM",
            Errno::NotFound => "ENOENT",
            Errno::NoProcess => "ESRCH",
            Errno::Interrupted => "EINTR",
            Errno::IoError => "EIO",
            Errno::ArgumentListTooLong => "E2BIG",
            Errno::ExecFormatError => "ENOEXEC",
            Errno::BadHandle => "EBADF",
            Errno::NoChildren => "ECHILD",
            Errno::Again => "EAGAIN",
            Errno::OutOfMemory => "ENOMEM",
            Errno::AccessDenied => "EACCES",
            Errno::Fault => "EFAULT",
            Errno::AlreadyExists => "EEXIST",
            Errno::NotADirectory => "ENOTDIR",
            Errno::IsADirectory => "EISDIR",
            Errno::InvalidArgument => "EINVAL",
            Errno::TooManyFiles => "EMFILE",
            Errno::NameTooLong => "ENAMETOOLONG",
            Errno::NotImplemented => "ENOSYS",
            Errno::InterpreterLoop => "ELOOP",
        }
    }
}
