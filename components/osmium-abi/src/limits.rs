//! Classic POSIX limits as the kernel enforces them.

/// Maximum length of a path handed to a syscall, including the NUL.
pub const PATH_MAX: usize = 4096;

/// Maximum length of a single path component.
pub const NAME_MAX: usize = 255;

/// Budget for the kernel scratch copy of argv + envp during `execve`,
/// covering both the string bytes and the pointer arrays.
pub const ARG_MAX: usize = 64 * 1024;

/// Number of signals (1..=NSIG are valid signal numbers).
pub const NSIG: usize = 31;

/// Initial size of a process file-descriptor table.
pub const FD_TABLE_INITIAL: usize = 16;

/// Hard cap on file descriptors per process (`EMFILE` beyond this).
pub const FD_TABLE_MAX: usize = 256;
