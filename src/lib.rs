//! vmo_core - Virtual Memory Objects for a capability-based microkernel
//!
//! A VMO is the kernel object through which physical memory is represented,
//! shared, cloned, mapped and reclaimed. This crate provides:
//! - the abstract object contract ([`vm::VmObject`])
//! - the paged implementation with copy-on-write clones, slices and
//!   references ([`vm::VmObjectPaged`])
//! - a fixed physical range implementation ([`vm::VmObjectPhysical`])
//! - the global registry of live objects with lock-dropping cursors
//! - deferred deletion so arbitrarily deep clone chains tear down iteratively

#![cfg_attr(not(test), no_std)]

// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Range arithmetic reads better with explicit page rounding
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

pub mod error;
pub mod vm;

pub use error::{VmError, VmResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "vmo_core";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "vmo_core");
    }
}
