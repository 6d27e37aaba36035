//! # exos: the exokernel interface of a library operating system
//!
//! An exokernel multiplexes hardware and leaves every abstraction to
//! user-level libraries. Processes, called *environments*, manage their own
//! address space by asking the kernel for a handful of narrow primitives:
//! create a blank environment, alias a range of pages into it, register a
//! fault handler, make it runnable, destroy it.
//!
//! This crate is the contract between a library operating system and the
//! kernel:
//!
//! - [`env`]: environment identifiers, the read-only environment control
//!   block, and the "current environment" handle.
//! - [`mm`]: the x86_64 page table as seen from user space, the recursive
//!   mapping through which the running environment reads it, and a
//!   heap-backed [`PageTable`](mm::page_table::PageTable) with the same view.
//! - [`syscall`]: the [`ExoKernel`](syscall::ExoKernel) primitives and their
//!   implementation with the `syscall` instruction.
//!
//! Failures of every primitive are reported as [`ExoError`].

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod env;
pub mod mm;
pub mod syscall;

pub use abyss::{addressing, debug, info, print, println, warning};

/// Enum representing errors that can occur during an exokernel primitive.
///
/// The kernel reports a failure by returning a negative number from the
/// system call; each variant corresponds to one such code.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExoError {
    /// Unspecified or unknown problem.
    Unspecified,
    /// Environment doesn't exist or otherwise cannot be used in the requested
    /// action.
    BadEnv,
    /// Invalid parameter.
    InvalidArgument,
    /// Request failed due to memory shortage.
    NoMemory,
    /// Attempt to create a new environment beyond the maximum allowed.
    NoFreeEnv,
    /// Memory fault.
    BadAddress,
    /// Invalid system call number.
    NoSuchSyscall,
    /// Operation is not supported.
    NotSupported,
}

impl ExoError {
    /// Converts the [`ExoError`] into the code returned by a system call.
    pub fn into_isize(self) -> isize {
        match self {
            ExoError::Unspecified => -1,
            ExoError::BadEnv => -2,
            ExoError::InvalidArgument => -3,
            ExoError::NoMemory => -4,
            ExoError::NoFreeEnv => -5,
            ExoError::BadAddress => -6,
            ExoError::NoSuchSyscall => -7,
            ExoError::NotSupported => -8,
        }
    }

    /// Whether the kernel ran out of a resource (memory or environment
    /// slots) rather than rejecting the request.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, ExoError::NoMemory | ExoError::NoFreeEnv)
    }
}

impl core::fmt::Display for ExoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            ExoError::Unspecified => "unspecified error",
            ExoError::BadEnv => "bad environment",
            ExoError::InvalidArgument => "invalid parameter",
            ExoError::NoMemory => "out of memory",
            ExoError::NoFreeEnv => "out of environments",
            ExoError::BadAddress => "segmentation fault",
            ExoError::NoSuchSyscall => "invalid system call number",
            ExoError::NotSupported => "operation not supported",
        };
        f.write_str(msg)
    }
}

/// The given `isize` does not indicate an [`ExoError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFromError {
    /// The code that could not be decoded.
    pub fn code(&self) -> isize {
        self.e
    }
}

impl TryFrom<isize> for ExoError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unspecified),
            -2 => Ok(Self::BadEnv),
            -3 => Ok(Self::InvalidArgument),
            -4 => Ok(Self::NoMemory),
            -5 => Ok(Self::NoFreeEnv),
            -6 => Ok(Self::BadAddress),
            -7 => Ok(Self::NoSuchSyscall),
            -8 => Ok(Self::NotSupported),
            e => Err(TryFromError { e }),
        }
    }
}
