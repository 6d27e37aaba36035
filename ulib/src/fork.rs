//! # `fork` with copy-on-write, in user space.
//!
//! An exokernel has no `fork` system call. The library builds one out of
//! primitives:
//!
//! 1. [`exofork`] creates a blank child that is not runnable yet. The child
//!    has the parent's registers but no memory.
//! 2. A single [`map_region`] call aliases the parent's whole user address
//!    space (`0..MAX_USER_ADDRESS`) into the child. With
//!    [`Permission::LAZY`] the kernel write-protects every private writable
//!    page in both environments, so that the first write on either side
//!    faults and gets a private copy. Shared pages stay shared.
//!    [`Permission::COMBINE`] lets one call cover pages of different
//!    permissions, each keeping its own.
//! 3. The child inherits the parent's page fault upcall; without it the
//!    child could not resolve its first copy-on-write fault.
//! 4. The child is marked [`EnvStatus::Runnable`].
//!
//! If any step after the creation fails, the child is destroyed and the
//! error of the failing step is returned. A child that cannot be destroyed
//! is a leak the library cannot recover from; `fork` panics.
//!
//! When the child runs, it resumes from the `exofork` call, which returns
//! [`EnvId::SELF`] there. Its memory is a copy of the parent's, including
//! the parent's [`ThisEnv`], which the child re-resolves before returning.
//!
//! [`exofork`]: ExoKernel::exofork
//! [`map_region`]: ExoKernel::map_region

use exos::{
    ExoError,
    addressing::Va,
    debug,
    env::{EnvId, EnvStatus, ThisEnv},
    mm::{MAX_USER_ADDRESS, Permission},
    syscall::ExoKernel,
    warning,
};

/// Which side of a successful [`fork`] the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The caller is the parent; the child has this identifier.
    Parent(EnvId),
    /// The caller is the newly created child.
    Child,
}

impl Forked {
    /// The value a C-style `fork` would return: the child's identifier in the
    /// parent and 0 in the child.
    pub fn envid(&self) -> EnvId {
        match self {
            Forked::Parent(child) => *child,
            Forked::Child => EnvId::SELF,
        }
    }

    /// Whether the caller is the child.
    pub fn is_child(&self) -> bool {
        matches!(self, Forked::Child)
    }
}

/// Progress of a [`fork`] in the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ForkStage {
    /// Nothing was done yet.
    Start,
    /// The child exists but has no memory.
    ChildCreated,
    /// The parent's address space is aliased into the child.
    AddressSpaceMapped,
    /// The child has the parent's page fault upcall.
    UpcallRegistered,
    /// The child may be scheduled.
    Runnable,
}

/// Prepare the child once it exists. On failure, returns the last stage that
/// was reached together with the error.
fn populate<K: ExoKernel + ?Sized>(kernel: &K, child: EnvId) -> Result<(), (ForkStage, ExoError)> {
    kernel
        .map_region(
            EnvId::SELF,
            Va::ZERO,
            child,
            Va::ZERO,
            MAX_USER_ADDRESS,
            Permission::ALL | Permission::LAZY | Permission::COMBINE,
        )
        .map_err(|e| (ForkStage::ChildCreated, e))?;
    debug!("fork: {child} reached {:?}", ForkStage::AddressSpaceMapped);

    let upcall = kernel
        .env_at(kernel.getenvid().envx())
        .and_then(|env| env.pgfault_upcall());
    kernel
        .env_set_pgfault_upcall(child, upcall)
        .map_err(|e| (ForkStage::AddressSpaceMapped, e))?;
    debug!("fork: {child} reached {:?}", ForkStage::UpcallRegistered);

    kernel
        .env_set_status(child, EnvStatus::Runnable)
        .map_err(|e| (ForkStage::UpcallRegistered, e))?;
    debug!("fork: {child} reached {:?}", ForkStage::Runnable);
    Ok(())
}

/// Duplicates the running environment with copy-on-write.
///
/// `thisenv` is the caller's handle to its own environment; in the child it
/// is re-resolved from the kernel before `fork` returns.
///
/// # Returns
/// - `Ok(Forked::Parent(child))` in the parent.
/// - `Ok(Forked::Child)` in the child.
/// - `Err(e)` if the child could not be created or prepared. In the latter
///   case the child has been destroyed.
///
/// # Panics
/// If preparing the child fails and destroying it fails as well.
pub fn fork<K: ExoKernel + ?Sized>(kernel: &K, thisenv: &mut ThisEnv) -> Result<Forked, ExoError> {
    let child = kernel.exofork().inspect_err(|e| {
        warning!("fork: failed at {:?}: {e}", ForkStage::Start);
    })?;

    if child.is_child_sentinel() {
        *thisenv = ThisEnv::resolve(kernel);
        return Ok(Forked::Child);
    }
    debug!("fork: {child} reached {:?}", ForkStage::ChildCreated);

    match populate(kernel, child) {
        Ok(()) => Ok(Forked::Parent(child)),
        Err((stage, e)) => {
            warning!("fork: {child} failed after {stage:?}: {e}; destroying it");
            if let Err(destroy) = kernel.env_destroy(child) {
                panic!("Fork double fault: {e}, then destroying {child}: {destroy}");
            }
            Err(e)
        }
    }
}

/// Duplicates the running environment, sharing all memory instead of
/// copying it on write.
///
/// Not supported: always returns [`ExoError::NotSupported`] without asking
/// anything of the kernel.
pub fn sfork<K: ExoKernel + ?Sized>(
    _kernel: &K,
    _thisenv: &mut ThisEnv,
) -> Result<Forked, ExoError> {
    Err(ExoError::NotSupported)
}
