//! # devmap
//!
//! A concurrent map from device number ranges to resolvers.
//!
//! Drivers register a range of device numbers together with a resolver
//! callback. Looking up a single device number finds the narrowest
//! registered range covering it and runs that range's resolver, outside the
//! registry lock, to produce a handle.
//!
//! ## Layout
//!
//! - Ranges are hashed into a fixed number of buckets by major number. A range
//!   covering several majors is linked into each bucket it touches.
//! - Each bucket list is ordered by ascending span, so the first covering
//!   range found is the most specific. Equal spans resolve to the earliest
//!   registration.
//! - A resolver may report [`Resolution::NotFound`]; the lookup then rescans
//!   for a strictly narrower range, which a resolver can register on the fly.
//! - Ranges may carry an [`Owner`] that is pinned while the resolver runs, and
//!   a gate predicate that can veto a match.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use devmap::{resolver, DevId, Registry, Resolution};
//!
//! let reg: Registry<&'static str> = Registry::new();
//! reg.register(
//!     DevId::new(8, 0),
//!     256,
//!     None,
//!     resolver(|_, _, _| Resolution::Found("sd")),
//!     None,
//!     Arc::new(()),
//! )
//! .unwrap();
//! reg.register(
//!     DevId::new(8, 0),
//!     16,
//!     None,
//!     resolver(|_, _, _| Resolution::Found("sda")),
//!     None,
//!     Arc::new(()),
//! )
//! .unwrap();
//!
//! let hit = reg.resolve(DevId::new(8, 3)).unwrap();
//! assert_eq!(hit.handle, "sda");
//! assert_eq!(hit.index, 3);
//! assert_eq!(reg.resolve(DevId::new(8, 40)).unwrap().handle, "sd");
//! assert!(reg.resolve(DevId::new(9, 0)).is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod dev;
pub mod error;
pub mod owner;
pub mod registry;
pub mod table;

pub use dev::{DevId, RangeKey};
pub use error::RegistryError;
pub use owner::{Owner, OwnerPin, OwnerToken};
pub use registry::{
    gate, resolver, Config, GateFn, Probe, Registry, Resolution, ResolveFn, Resolved, Stats,
};
pub use table::RangeTable;

#[cfg(test)]
mod proptests;
