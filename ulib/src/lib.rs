//! # exos-ulib: the user-level core of the library operating system
//!
//! On an exokernel, the process abstraction lives in user space. This crate
//! provides the two pieces of it that deal with address spaces:
//!
//! - [`uvpt`]: inspecting the running environment's page table through the
//!   recursive mapping: what governs an address, with which permissions, and
//!   which regions are shared with other environments.
//! - [`fork`]: duplicating the running environment with copy-on-write
//!   semantics, built from the kernel's primitives.
//!
//! Both work against traits ([`PageTableView`] and [`ExoKernel`]) so that
//! they run unchanged on a real kernel and on a simulated one.
//!
//! [`PageTableView`]: exos::mm::PageTableView
//! [`ExoKernel`]: exos::syscall::ExoKernel

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod fork;
pub mod uvpt;

pub use fork::{Forked, fork, sfork};
