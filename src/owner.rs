//! Owner pinning.
//!
//! A range may name an owner: whatever backs its resolver (a driver module, a
//! plugin, a connection). Before the registry drops its lock to run a
//! resolver it pins the owner, and the pin is held until the resolver
//! returns. An owner that is being torn down refuses new pins, and the
//! lookup moves on to the next candidate.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pin/unpin hooks supplied by whoever registers a range.
pub trait Owner: Send + Sync {
    /// Take a pin. Returns `false` if the owner is going away.
    fn try_pin(&self) -> bool;

    /// Drop a pin taken by a successful [`Owner::try_pin`].
    fn unpin(&self);
}

/// Reference-counted owner with a live flag.
///
/// `retire` makes further pins fail; pins already handed out stay valid and
/// the owner counts as idle once the last one is dropped.
#[derive(Default)]
pub struct OwnerToken {
    pins: AtomicUsize,
    retired: AtomicBool,
}

impl OwnerToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse new pins from now on.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Pins currently outstanding.
    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Retired with no pin outstanding; backing resources may be released.
    pub fn is_idle(&self) -> bool {
        self.is_retired() && self.pins() == 0
    }
}

impl Owner for OwnerToken {
    fn try_pin(&self) -> bool {
        if self.is_retired() {
            return false;
        }
        self.pins.fetch_add(1, Ordering::AcqRel);
        // Retirement may have raced with the increment.
        if self.is_retired() {
            self.unpin();
            return false;
        }
        true
    }

    fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without a matching pin");
    }
}

impl fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerToken")
            .field("pins", &self.pins())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// A held pin. Unpins on drop.
///
/// Ranges without an owner produce an empty pin that always succeeds.
#[must_use = "dropping the pin releases the owner immediately"]
pub struct OwnerPin {
    owner: Option<Arc<dyn Owner>>,
}

impl OwnerPin {
    /// Pin `owner`, or return `None` if it refuses.
    pub fn acquire(owner: Option<&Arc<dyn Owner>>) -> Option<Self> {
        match owner {
            None => Some(Self { owner: None }),
            Some(owner) if owner.try_pin() => Some(Self {
                owner: Some(Arc::clone(owner)),
            }),
            Some(_) => None,
        }
    }
}

impl Drop for OwnerPin {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.unpin();
        }
    }
}

impl fmt::Debug for OwnerPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerPin")
            .field("owned", &self.owner.is_some())
            .finish()
    }
}
