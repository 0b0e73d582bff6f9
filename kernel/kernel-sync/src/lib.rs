//! # Kernel synchronization primitives
//!
//! The memory core is not re-entrant; every sequence that mutates shared
//! allocator or page-table state runs under a [`SpinLock`], and sequences
//! that may also race an interrupt handler additionally hold a
//! [`CriticalToken`] (see [`SpinLock::lock_critical`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod critical;
mod spin_lock;

pub use critical::{CriticalSpinLock, CriticalToken};
pub use spin_lock::{SpinLock, SpinLockGuard};
