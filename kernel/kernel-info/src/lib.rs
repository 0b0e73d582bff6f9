//! # Kernel Boot Information and Memory Layout
//!
//! Shared, dependency-free definitions consumed by every other kernel crate:
//!
//! - the `#[repr(C)]` boot handoff record ([`boot::SystemInfo`]) that the
//!   boot stage passes to the kernel entry point exactly once, and
//! - the fixed memory-layout constants ([`memory`]) that the frame allocator
//!   and the paging code agree on.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
