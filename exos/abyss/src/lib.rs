//! The abyss of the library operating system.
//!
//! This crate contains the pieces that sit directly on the exokernel's
//! interface and that every other crate builds upon: the addressing model of
//! the x86_64 four-level page table, the console print macros, and the raw
//! `syscall` instruction.
//!
//! Most users should go through the [`exos`] crate instead, which wraps the
//! raw instruction into typed system calls.
//!
//! [`exos`]: ../exos/index.html
#![cfg_attr(not(test), no_std)]

use core::sync::atomic::AtomicBool;

#[macro_use]
pub mod kprint;
pub mod addressing;
#[doc(hidden)]
#[macro_use]
pub mod syscall;

pub use addressing::{Pa, Va};

/// Silences `info!`, `warning!` and `debug!` when set.
///
/// Starts out set when the crate is built with the `quiet` feature.
pub static QUITE: AtomicBool = AtomicBool::new(cfg!(feature = "quiet"));
