//! Content-addressed module linker/loader (TOSOS/TOSELF).
//!
//! Given a set of compiled modules exporting and importing symbols, resolves
//! the import closure, binds a single linear address space across all of
//! them, applies relocations, and emits either a TOSELF image (the native
//! loader format) or a PE image (for environments that want an EFI-loadable
//! binary instead).
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod model;
pub mod resolve;
pub mod emit;

pub use error::LinkerError;
