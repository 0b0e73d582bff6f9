//! # Boot Console Diagnostics
//!
//! Early-boot output over QEMU's debug console (I/O port `0x402`, enabled on
//! the host with `-debugcon stdio`). Two surfaces:
//!
//! - [`debug_trace!`] for raw output before the logger exists (panic paths,
//!   very early bring-up), and
//! - [`DebugconLogger`], a [`log::Log`] sink so the rest of the kernel can use
//!   the standard `log` facade.
//!
//! With the `enabled` cargo feature off, everything compiles to no-ops and no
//! port access remains in the binary.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::DebugconLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod debug_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    const DEBUGCON_PORT: u16 = 0x402;

    #[inline]
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn putb(b: u8) {
        // SAFETY: port 0x402 is write-only from the guest's perspective and
        // has no side effects outside QEMU's debug console.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") DEBUGCON_PORT,
                in("al") b,
                options(nomem, preserves_flags)
            );
        }
    }

    /// Hosted stand-in so the crate (and its dependents) stay testable.
    #[inline]
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    fn putb(_b: u8) {}

    /// `fmt::Write` sink over the debug port; unbuffered, best effort.
    pub struct DebugconSink;

    impl Write for DebugconSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                putb(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    pub fn debug_write(args: fmt::Arguments) {
        // Errors are ignored; this is best-effort debug output.
        let _ = fmt::write(&mut DebugconSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod debug_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    pub fn debug_write(_: fmt::Arguments) {}
}

/// Print formatted text straight to the debug console.
///
/// Builds a lightweight `fmt::Arguments`, so no allocation happens even for
/// complex format strings.
#[macro_export]
macro_rules! debug_trace {
    ($($arg:tt)*) => {{
        $crate::debug_fmt::debug_write(core::format_args!($($arg)*));
    }};
}
