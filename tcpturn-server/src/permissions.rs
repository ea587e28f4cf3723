//! Bounded least-recently-used set of permitted peer IPs.
//!
//! A session records every peer IP the client sent to, asked to connect to,
//! or heard from. The set is capped; when it overflows, the least recently
//! touched entry that is not pinned by an open connection is evicted.

use std::net::IpAddr;

use lru::LruCache;

/// Default number of permitted addresses a session keeps.
pub const DEFAULT_CAPACITY: usize = 100;

/// LRU set of peer IPs.
///
/// The cache itself is unbounded; the capacity is enforced in
/// [`PermissionSet::permit`] so that pinned entries can be skipped.
#[derive(Debug)]
pub struct PermissionSet {
    entries: LruCache<IpAddr, ()>,
    capacity: usize,
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionSet {
    /// Creates an empty set with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty set holding at most `capacity` unpinned entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
        }
    }

    /// Adds `ip` or marks it most recently used, returning the evicted entry
    /// if the set overflowed.
    ///
    /// Entries for which `pinned` returns `true` are skipped during eviction.
    /// If every older entry is pinned the set is allowed to exceed its
    /// capacity until one of them is released.
    pub fn permit(&mut self, ip: IpAddr, pinned: impl Fn(IpAddr) -> bool) -> Option<IpAddr> {
        self.entries.put(ip, ());
        if self.entries.len() <= self.capacity {
            return None;
        }
        // Oldest first; the entry just touched is the newest and never a victim.
        let victim = self
            .entries
            .iter()
            .rev()
            .map(|(p, ())| *p)
            .find(|p| *p != ip && !pinned(*p))?;
        self.entries.pop(&victim);
        Some(victim)
    }

    /// Returns `true` if `ip` is permitted. Does not refresh its position.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.entries.contains(&ip)
    }

    /// Number of permitted addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is permitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
