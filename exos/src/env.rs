//! Environments.
//!
//! An environment is the exokernel's unit of execution and protection: one
//! address space and one thread of control. The kernel keeps every
//! environment's control block ([`Env`]) in a fixed-size table of [`NENV`]
//! slots, mapped read-only into every environment.
//!
//! A running environment refers to its own slot through [`ThisEnv`]. The
//! handle is always derived from [`ExoKernel::getenvid`], never inherited: a
//! child created by `exofork` starts with a byte-for-byte copy of its
//! parent's memory, including the parent's handle, and must re-resolve it
//! before using it.

use crate::syscall::ExoKernel;
use abyss::addressing::Va;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of slots in the environment table.
pub const NENV: usize = 1024;

/// Identifier of an environment.
///
/// The low bits select a slot of the environment table ([`EnvId::envx`]);
/// the high bits distinguish successive occupants of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EnvId(pub i32);

impl EnvId {
    /// Names the calling environment in a primitive.
    ///
    /// This is also what `exofork` returns inside the newly created child.
    pub const SELF: EnvId = EnvId(0);

    /// Index of this environment's slot in the environment table.
    #[inline]
    pub const fn envx(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Whether this is the value `exofork` returns in the child.
    #[inline]
    pub const fn is_child_sentinel(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EnvStatus {
    /// The slot is unused.
    Free = 0,
    /// The environment is being torn down.
    Dying = 1,
    /// The environment may be scheduled.
    Runnable = 2,
    /// The environment exists but must not be scheduled yet.
    NotRunnable = 3,
    /// The environment is executing.
    Running = 4,
}

/// An environment control block, as laid out in the kernel's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Env {
    /// Identifier of this environment.
    pub env_id: EnvId,
    /// Identifier of the environment that created this one.
    pub env_parent_id: EnvId,
    /// Raw [`EnvStatus`].
    pub env_status: u32,
    /// Entry point of the user-level page fault handler, or 0.
    pub env_pgfault_upcall: usize,
}

impl Env {
    /// Decoded status of this environment.
    ///
    /// Returns `None` if the kernel stored a value this library does not
    /// know.
    pub fn status(&self) -> Option<EnvStatus> {
        EnvStatus::try_from(self.env_status).ok()
    }

    /// The registered page fault upcall, if any.
    pub fn pgfault_upcall(&self) -> Option<Va> {
        match self.env_pgfault_upcall {
            0 => None,
            addr => Va::new(addr),
        }
    }
}

/// Handle to the running environment's slot in the environment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThisEnv {
    envx: usize,
}

impl ThisEnv {
    /// Resolve the handle of the running environment from the kernel.
    pub fn resolve<K: ExoKernel + ?Sized>(kernel: &K) -> Self {
        Self {
            envx: kernel.getenvid().envx(),
        }
    }

    /// Slot index this handle refers to.
    pub fn envx(&self) -> usize {
        self.envx
    }

    /// A snapshot of the control block this handle refers to.
    pub fn get<K: ExoKernel + ?Sized>(&self, kernel: &K) -> Option<Env> {
        kernel.env_at(self.envx)
    }
}
