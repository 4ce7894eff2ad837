//! The locked device-number map.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::dev::{DevId, RangeKey};
use crate::error::RegistryError;
use crate::owner::{Owner, OwnerPin};
use crate::table::RangeTable;

/// Resolver callback: device number, index slot (preset to the offset into
/// the range), context.
///
/// Runs without the registry lock held. It may block and may call back into
/// the registry.
pub type ResolveFn<H, C> = Arc<dyn Fn(DevId, &mut u32, &C) -> Resolution<H> + Send + Sync>;

/// Gate predicate evaluated under the registry lock. Must not block or call
/// back into the registry.
pub type GateFn<C> = Arc<dyn Fn(DevId, &C) -> bool + Send + Sync>;

/// Wrap a closure as a [`ResolveFn`].
pub fn resolver<H, C, F>(f: F) -> ResolveFn<H, C>
where
    F: Fn(DevId, &mut u32, &C) -> Resolution<H> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`GateFn`].
pub fn gate<C, F>(f: F) -> GateFn<C>
where
    F: Fn(DevId, &C) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Outcome of one resolver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<H> {
    Found(H),
    /// Nothing to hand out right now. The lookup rescans for a narrower range.
    NotFound,
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<H> {
    pub handle: H,
    /// Index slot as left by the resolver; starts as the offset of the device
    /// number into the matched range.
    pub index: u32,
}

/// One registered range. Shared by every bucket the range straddles and
/// never mutated after registration.
pub struct Probe<H, C> {
    key: RangeKey,
    owner: Option<Arc<dyn Owner>>,
    resolve: ResolveFn<H, C>,
    gate: Option<GateFn<C>>,
    context: Arc<C>,
}

impl<H, C> Probe<H, C> {
    pub fn key(&self) -> RangeKey {
        self.key
    }

    pub fn low(&self) -> DevId {
        self.key.low()
    }

    pub fn span(&self) -> u32 {
        self.key.span()
    }

    pub fn owner(&self) -> Option<&Arc<dyn Owner>> {
        self.owner.as_ref()
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }
}

impl<H, C> fmt::Debug for Probe<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("key", &self.key)
            .field("owned", &self.owner.is_some())
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

const DEFAULT_BUCKETS: NonZeroUsize = match NonZeroUsize::new(255) {
    Some(n) => n,
    None => unreachable!(),
};

/// Configuration for a [`Registry`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket count. Fixed for the registry's lifetime.
    pub buckets: NonZeroUsize,
    /// Give up a lookup after this many resolver "not found" restarts.
    /// `None` relies on the narrowing bound alone.
    pub restart_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            restart_limit: None,
        }
    }
}

/// Snapshot of registry shape and lookup counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Registered ranges
    pub ranges: usize,
    /// Bucket nodes; a range counts once per bucket it straddles
    pub records: usize,
    pub buckets: usize,
    pub longest_chain: usize,
    /// Calls to `resolve`
    pub lookups: u64,
    /// Rescans after a resolver reported "not found"
    pub restarts: u64,
    /// Lookups that ended without a match
    pub misses: u64,
}

/// Maps device number ranges to resolvers.
///
/// All list traversal and mutation happens under one lock. Lookups drop the
/// lock before calling a resolver and rescan from the bucket head afterwards.
pub struct Registry<H, C = ()> {
    table: Mutex<RangeTable<Arc<Probe<H, C>>>>,
    config: Config,
    lookups: AtomicU64,
    restarts: AtomicU64,
    misses: AtomicU64,
}

impl<H, C> Registry<H, C> {
    /// Create an empty registry with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            table: Mutex::new(RangeTable::new(config.buckets)),
            config,
            lookups: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a registry whose every bucket ends in a catch-all range
    /// covering `1..=u32::MAX`. Device number 0 stays unresolvable.
    pub fn with_fallback(
        config: Config,
        resolve: ResolveFn<H, C>,
        context: Arc<C>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::with_config(config);
        registry.register(DevId(1), u32::MAX, None, resolve, None, context)?;
        Ok(registry)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register `resolve` for `[low, low + span)`.
    ///
    /// Overlapping ranges are allowed; lookups prefer the narrowest. The range
    /// is installed into every bucket it straddles under a single lock hold,
    /// so lookups see all of it or none of it.
    pub fn register(
        &self,
        low: DevId,
        span: u32,
        owner: Option<Arc<dyn Owner>>,
        resolve: ResolveFn<H, C>,
        gate: Option<GateFn<C>>,
        context: Arc<C>,
    ) -> Result<(), RegistryError> {
        let key = RangeKey::new(low, span)?;
        let probe = Arc::new(Probe {
            key,
            owner,
            resolve,
            gate,
            context,
        });
        let buckets = self.table.lock().insert(key, probe)?;
        debug!(range = ?key, buckets, "registered range");
        Ok(())
    }

    /// Remove the range registered as exactly `[low, low + span)`.
    ///
    /// At most one node per bucket is unlinked, so duplicate registrations go
    /// away one call at a time, oldest first. Returns the removed record, or
    /// `None` when nothing matched. Lookups already running the record's
    /// resolver keep it alive until they finish.
    pub fn unregister(&self, low: DevId, span: u32) -> Option<Arc<Probe<H, C>>> {
        // A key that fails validation can never have been registered.
        let key = RangeKey::new(low, span).ok()?;
        let removed = self.table.lock().remove(key);
        if removed.is_some() {
            debug!(range = ?key, "unregistered range");
        } else {
            trace!(range = ?key, "unregister found no matching range");
        }
        removed
    }

    /// Whether a range with exactly this `(low, span)` is registered.
    pub fn is_registered(&self, low: DevId, span: u32) -> bool {
        let Ok(key) = RangeKey::new(low, span) else {
            return false;
        };
        let table = self.table.lock();
        let home = table.bucket_index(low);
        let found = table.bucket(home).any(|(k, _)| k == key);
        found
    }

    /// Registered ranges sorted by `(low, span)`. Duplicate registrations
    /// appear once each.
    pub fn ranges(&self) -> Vec<RangeKey> {
        let table = self.table.lock();
        let mut ranges = home_keys(&table);
        drop(table);
        ranges.sort_unstable();
        ranges
    }

    pub fn stats(&self) -> Stats {
        let table = self.table.lock();
        Stats {
            ranges: home_keys(&table).len(),
            records: table.len(),
            buckets: table.buckets(),
            longest_chain: table.longest_chain(),
            lookups: self.lookups.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Find the narrowest range covering `id` and run its resolver.
    ///
    /// Candidates whose owner refuses a pin, or whose gate rejects `id`, are
    /// skipped. When a resolver reports [`Resolution::NotFound`] the bucket is
    /// scanned again from the head, accepting only ranges strictly narrower
    /// than the one that failed, so every rescan either makes progress or
    /// ends the lookup.
    pub fn resolve(&self, id: DevId) -> Option<Resolved<H>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut bound: Option<u32> = None;
        let mut restarts = 0usize;

        loop {
            let Some((probe, pin)) = self.next_candidate(id, bound) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };

            let mut index = probe.key.offset_of(id);
            let outcome = (probe.resolve)(id, &mut index, &*probe.context);
            drop(pin);

            match outcome {
                Resolution::Found(handle) => return Some(Resolved { handle, index }),
                Resolution::NotFound => {
                    bound = Some(probe.key.span());
                    restarts += 1;
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    if self
                        .config
                        .restart_limit
                        .is_some_and(|limit| restarts > limit)
                    {
                        warn!(dev = %id, restarts, "lookup gave up after restart limit");
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                    debug!(dev = %id, range = ?probe.key, "resolver missed, rescanning");
                }
            }
        }
    }

    /// Scan the bucket for `id` under the lock and return the first viable
    /// candidate narrower than `bound`, pinned.
    fn next_candidate(
        &self,
        id: DevId,
        bound: Option<u32>,
    ) -> Option<(Arc<Probe<H, C>>, OwnerPin)> {
        let table = self.table.lock();
        for (key, probe) in table.covering(id) {
            if bound.is_some_and(|b| key.span() >= b) {
                continue;
            }
            let Some(pin) = OwnerPin::acquire(probe.owner.as_ref()) else {
                trace!(dev = %id, range = ?key, "owner refused pin, skipping");
                continue;
            };
            if let Some(gate) = &probe.gate {
                if !gate(id, &*probe.context) {
                    drop(pin);
                    trace!(dev = %id, range = ?key, "gate rejected, skipping");
                    continue;
                }
            }
            return Some((Arc::clone(probe), pin));
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn with_table<R>(
        &self,
        f: impl FnOnce(&RangeTable<Arc<Probe<H, C>>>) -> R,
    ) -> R {
        f(&self.table.lock())
    }
}

impl<H, C> Default for Registry<H, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, C> fmt::Debug for Registry<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One key per registration: the node in the bucket of its low end.
fn home_keys<T>(table: &RangeTable<T>) -> Vec<RangeKey> {
    (0..table.buckets())
        .flat_map(|b| {
            table
                .bucket(b)
                .filter(move |(key, _)| table.bucket_index(key.low()) == b)
                .map(|(key, _)| key)
        })
        .collect()
}
