//! Versioned call-site caches
//!
//! Every cache slot remembers the [`Stamp`] it was filled under. A lookup
//! with a different stamp reports the slot as stale instead of returning
//! the memo, so invalidation is just a counter bump in
//! [`GlobalState`](crate::object::GlobalState).

use crate::object::MethodEntry;
use crate::value::Value;
use parking_lot::Mutex;

/// Validity stamp: a global generation plus the identity of the scope
/// (receiver class, lexical scope, ...) the memo was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub generation: u64,
    pub scope: u64,
}

impl Stamp {
    pub fn new(generation: u64, scope: u64) -> Self {
        Self { generation, scope }
    }
}

/// Outcome of checking a cache slot
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Never filled
    Miss,
    /// Filled under another stamp
    Stale,
}

/// A single memo slot guarded by a stamp.
///
/// Each slot is written by one call site at a time; the lock only makes
/// the stamp and the memo change together.
#[derive(Debug)]
pub struct Cached<T> {
    slot: Mutex<Option<(Stamp, T)>>,
}

impl<T: Clone> Cached<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn lookup(&self, stamp: Stamp) -> Lookup<T> {
        match &*self.slot.lock() {
            Some((s, value)) if *s == stamp => Lookup::Hit(value.clone()),
            Some(_) => Lookup::Stale,
            None => Lookup::Miss,
        }
    }

    /// Return the memo if it is valid for `stamp`.
    pub fn get(&self, stamp: Stamp) -> Option<T> {
        match self.lookup(stamp) {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    pub fn fill(&self, stamp: Stamp, value: T) {
        *self.slot.lock() = Some((stamp, value));
    }

    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }
}

impl<T: Clone> Default for Cached<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved method, stamped with (method generation, receiver class).
pub type CallCache = Cached<MethodEntry>;

/// Constant value, stamped with (constant generation, lexical scope).
pub type ConstCache = Cached<Value>;

/// Instance-variable slot, stamped with (0, receiver class).
pub type IvarCache = Cached<usize>;

/// Cache performance statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of stale entries encountered
    pub stale: u64,
}

impl CacheStats {
    pub fn record<T>(&mut self, lookup: &Lookup<T>) {
        match lookup {
            Lookup::Hit(_) => self.hits += 1,
            Lookup::Miss => self.misses += 1,
            Lookup::Stale => {
                self.stale += 1;
                self.misses += 1;
            }
        }
    }

    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_lifecycle() {
        let cache: Cached<u32> = Cached::new();
        let stamp = Stamp::new(1, 7);
        assert_eq!(cache.lookup(stamp), Lookup::Miss);

        cache.fill(stamp, 42);
        assert_eq!(cache.lookup(stamp), Lookup::Hit(42));

        // A generation bump makes the memo stale.
        assert_eq!(cache.lookup(Stamp::new(2, 7)), Lookup::Stale);
        // So does a different scope.
        assert_eq!(cache.lookup(Stamp::new(1, 8)), Lookup::Stale);

        cache.invalidate();
        assert_eq!(cache.lookup(stamp), Lookup::Miss);
    }

    #[test]
    fn test_stats_hit_rate() {
        let mut stats = CacheStats::default();
        stats.record(&Lookup::Hit(()));
        stats.record(&Lookup::Hit(()));
        stats.record::<()>(&Lookup::Stale);
        stats.record::<()>(&Lookup::Miss);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.hit_rate(), 50.0);
    }
}
