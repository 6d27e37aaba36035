//! System call interface of the exokernel.
//!
//! The library operating system is built from a small set of primitives,
//! described by the [`ExoKernel`] trait. Library code is generic over the
//! trait; [`Syscalls`] implements it by trapping into the kernel with the
//! `syscall` instruction.
//!
//! ## Calling convention
//!
//! The system call number is passed in `rax` and the arguments in `rdi`,
//! `rsi`, `rdx`, `r10`, `r8` and `r9`, in that order. The kernel returns a
//! non-negative value on success and a negative [`ExoError`] code on
//! failure.
//!
//! | Number | Primitive                   | Arguments                                     |
//! |--------|-----------------------------|-----------------------------------------------|
//! | 0      | `cputs`                     | buffer, length                                |
//! | 1      | `getenvid`                  |                                               |
//! | 2      | `env_destroy`               | env                                           |
//! | 3      | `map_region`                | src env, src va, dst env, dst va, size, perm  |
//! | 4      | `env_set_status`            | env, status                                   |
//! | 5      | `env_set_pgfault_upcall`    | env, upcall (0 for none)                      |
//! | 6      | `exofork`                   |                                               |

use crate::{
    ExoError,
    env::{Env, EnvId, EnvStatus},
    mm::Permission,
};
use abyss::addressing::Va;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Represents system call numbers of the exokernel.
///
/// Each variant corresponds to a specific primitive that can be invoked
/// using the system call interface.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum SyscallNumber {
    /// Prints a string to the system console.
    Cputs = 0,
    /// Returns the identifier of the calling environment.
    Getenvid = 1,
    /// Destroys an environment.
    EnvDestroy = 2,
    /// Aliases a range of pages of one environment into another.
    MapRegion = 3,
    /// Changes the status of an environment.
    EnvSetStatus = 4,
    /// Registers the page fault upcall of an environment.
    EnvSetPgfaultUpcall = 5,
    /// Creates a blank, not runnable copy of the caller.
    Exofork = 6,
}

impl SyscallNumber {
    /// Decode a raw system call number.
    pub fn decode(no: usize) -> Result<Self, ExoError> {
        Self::try_from(no).map_err(|_| ExoError::NoSuchSyscall)
    }
}

/// The primitives an exokernel offers to environments.
///
/// `EnvId::SELF` names the calling environment wherever an environment is
/// expected.
pub trait ExoKernel {
    /// Print a string to the system console.
    fn cputs(&self, s: &str) -> Result<(), ExoError>;

    /// Identifier of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Create a new environment.
    ///
    /// The child starts as [`EnvStatus::NotRunnable`] with an empty address
    /// space and the caller's register state. In the caller this returns the
    /// child's identifier; in the child, once it runs, it returns
    /// [`EnvId::SELF`].
    fn exofork(&self) -> Result<EnvId, ExoError>;

    /// Map `size` bytes starting at `src_va` in `src` to `dst_va` in `dst`.
    ///
    /// Unmapped pages of the source range are skipped. `perm` restricts the
    /// permission of the new mappings; with [`Permission::COMBINE`] it is
    /// applied to each page individually, and with [`Permission::LAZY`]
    /// writable pages that are not shared become copy-on-write in both
    /// environments. The request either succeeds as a whole or leaves both
    /// address spaces unchanged.
    fn map_region(
        &self,
        src: EnvId,
        src_va: Va,
        dst: EnvId,
        dst_va: Va,
        size: usize,
        perm: Permission,
    ) -> Result<(), ExoError>;

    /// Register (or, with `None`, clear) the page fault upcall of `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Option<Va>) -> Result<(), ExoError>;

    /// Change the status of `env`.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), ExoError>;

    /// Destroy `env` and release everything it holds.
    fn env_destroy(&self, env: EnvId) -> Result<(), ExoError>;

    /// A copy of slot `envx` of the read-only environment table.
    ///
    /// Returns `None` if `envx` is out of range.
    fn env_at(&self, envx: usize) -> Option<Env>;
}

/// [`ExoKernel`] implemented with the `syscall` instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Syscalls;

#[cfg(target_arch = "x86_64")]
mod imp {
    use super::*;
    use crate::{env::NENV, mm::UENVS};
    use abyss::kprint::Console;

    fn decode(ret: isize) -> Result<usize, ExoError> {
        if ret < 0 {
            Err(ExoError::try_from(ret).unwrap_or(ExoError::Unspecified))
        } else {
            Ok(ret as usize)
        }
    }

    fn nr(no: SyscallNumber) -> usize {
        no.into()
    }

    impl Syscalls {
        /// Route `print!` and the logging macros to the kernel console.
        pub fn install_console() {
            abyss::kprint::set_console(&Syscalls);
        }
    }

    impl ExoKernel for Syscalls {
        fn cputs(&self, s: &str) -> Result<(), ExoError> {
            decode(abyss::syscall!(nr(SyscallNumber::Cputs), s.as_ptr(), s.len())).map(|_| ())
        }

        fn getenvid(&self) -> EnvId {
            EnvId(abyss::syscall!(nr(SyscallNumber::Getenvid)) as i32)
        }

        fn exofork(&self) -> Result<EnvId, ExoError> {
            decode(abyss::syscall!(nr(SyscallNumber::Exofork))).map(|id| EnvId(id as i32))
        }

        fn map_region(
            &self,
            src: EnvId,
            src_va: Va,
            dst: EnvId,
            dst_va: Va,
            size: usize,
            perm: Permission,
        ) -> Result<(), ExoError> {
            decode(abyss::syscall!(
                nr(SyscallNumber::MapRegion),
                src.0 as isize,
                src_va.into_usize(),
                dst.0 as isize,
                dst_va.into_usize(),
                size,
                perm.bits()
            ))
            .map(|_| ())
        }

        fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Option<Va>) -> Result<(), ExoError> {
            let upcall = upcall.map_or(0, Va::into_usize);
            decode(abyss::syscall!(
                nr(SyscallNumber::EnvSetPgfaultUpcall),
                env.0 as isize,
                upcall
            ))
            .map(|_| ())
        }

        fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), ExoError> {
            let status: u32 = status.into();
            decode(abyss::syscall!(
                nr(SyscallNumber::EnvSetStatus),
                env.0 as isize,
                status as usize
            ))
            .map(|_| ())
        }

        fn env_destroy(&self, env: EnvId) -> Result<(), ExoError> {
            decode(abyss::syscall!(nr(SyscallNumber::EnvDestroy), env.0 as isize)).map(|_| ())
        }

        fn env_at(&self, envx: usize) -> Option<Env> {
            if envx >= NENV {
                return None;
            }
            // The kernel maps the environment table read-only at UENVS in
            // every environment.
            Some(unsafe { core::ptr::read_volatile((UENVS as *const Env).add(envx)) })
        }
    }

    impl Console for Syscalls {
        fn write_str(&self, s: &str) {
            let _ = self.cputs(s);
        }
    }
}
