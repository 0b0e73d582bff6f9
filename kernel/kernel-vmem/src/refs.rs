//! Frame sharing bookkeeping.
//!
//! The paging code tracks how many address spaces reference a leaf frame and
//! in what manner through the [`FrameRefs`] trait. The concrete store lives
//! in `kernel-frames`; tests substitute a hash map.

use crate::PhysAddr;

/// The manner in which a frame is shared.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefKind {
    /// Shared read-only, copied on the next write.
    Cow,
    /// Deliberately shared; writes go to the common frame.
    Shared,
}

/// Observed reference state of a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefCount {
    /// Exactly one owner; not tracked.
    One,
    /// Copy-on-write shared between this many address spaces.
    Cow(usize),
    /// Intentionally shared between this many address spaces.
    Shared(usize),
}

/// Errors from reference manipulation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RefError {
    /// The per-frame counter saturated.
    #[error("frame reference count overflow")]
    RcOverflow,
    /// Tried to add a shared reference to a copy-on-write frame.
    #[error("frame is copy-on-write shared, cannot share it directly")]
    CowToShared,
    /// Tried to add a copy-on-write reference to a directly shared frame.
    #[error("frame is directly shared, cannot mark it copy-on-write")]
    SharedToCow,
}

/// Per-frame reference counting.
///
/// A frame with no recorded references is exclusively owned ([`RefCount::One`]).
/// The first [`add_ref`](Self::add_ref) moves it to a count of two in the
/// requested kind; the kind is then fixed until the count drains back to one.
pub trait FrameRefs {
    /// Record one more reference of `kind`. Returns the new share count.
    ///
    /// # Errors
    ///
    /// [`RefError::CowToShared`] or [`RefError::SharedToCow`] when `kind`
    /// contradicts the frame's current sharing kind, [`RefError::RcOverflow`]
    /// when the counter cannot grow.
    fn add_ref(&self, frame: PhysAddr, kind: RefKind) -> Result<usize, RefError>;

    /// Drop one reference.
    ///
    /// Returns `Some` with the remaining state while other references keep
    /// the frame alive, and `None` when the caller held the last reference
    /// and must free the frame. Draining from a count of two leaves the
    /// surviving owner untracked again ([`RefCount::One`]).
    fn remove_ref(&self, frame: PhysAddr) -> Option<RefCount>;

    /// The current reference state of `frame`.
    fn refcount(&self, frame: PhysAddr) -> RefCount;
}
