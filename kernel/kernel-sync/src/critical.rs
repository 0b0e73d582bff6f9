use crate::{SpinLock, SpinLockGuard};

/// RAII token proving interrupts are disabled on this core.
///
/// Creation snapshots `RFLAGS.IF`; if interrupts were enabled, a `cli` is
/// issued. Dropping the token restores the prior state (issues `sti` only if
/// interrupts were enabled before).
///
/// # Platform / Privilege
///
/// `cli`/`sti` and `pushfq` target `x86_64` and require CPL 0. Constructing a
/// token outside a privileged context faults.
pub struct CriticalToken {
    /// Whether interrupts were enabled (IF=1) when the token was taken.
    were_enabled: bool,
}

impl CriticalToken {
    /// Disable interrupts if they are currently enabled and remember the state.
    #[inline]
    #[must_use]
    pub fn acquire() -> Self {
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            interrupts_off();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for CriticalToken {
    fn drop(&mut self) {
        if self.were_enabled {
            interrupts_on();
        }
    }
}

/// A spinlock guard paired with a [`CriticalToken`].
///
/// Taking the token first and the lock second means an interrupt handler can
/// never preempt the critical section and spin on the same lock forever.
/// Drop order (lock first, then token) is the reverse.
pub struct CriticalSpinLock<'a, T> {
    _token: CriticalToken,
    guard: SpinLockGuard<'a, T>,
}

impl<T> SpinLock<T> {
    /// Acquire the lock with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_critical(&self) -> CriticalSpinLock<'_, T> {
        let token = CriticalToken::acquire();
        let guard = self.lock();
        CriticalSpinLock {
            _token: token,
            guard,
        }
    }
}

impl<T> core::ops::Deref for CriticalSpinLock<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for CriticalSpinLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Disable hardware interrupts (`cli`). No-op on hosted builds so the lock
/// primitives stay testable.
#[inline]
fn interrupts_off() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enable hardware interrupts (`sti`).
#[inline]
fn interrupts_on() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Current `RFLAGS` value (via `pushfq`/`pop`). Bit 9 is `IF`. Reads as zero
/// on hosted builds, so tokens taken there never re-enable interrupts.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}
