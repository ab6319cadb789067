//! Bounded statement caches.
//!
//! - `BoundedCache`: O(1) LRU map; capacity 0 turns it into a pass-through
//! - `ParsedSqlCache`: process-wide SQL text -> parsed tree
//! - `StatementCaches`: per-session description and prepared caches plus
//!   the heat counters that decide when a statement is worth preparing

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use super::config::PgConfig;
use super::error::PgResult;
use super::sql_text::SqlText;
use super::statement::{PreparedStatementDescription, StatementCacheKey, StatementDescription};

// ============================================================================
// Bounded LRU
// ============================================================================

/// LRU cache that holds at most `capacity` entries.
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: Option<LruCache<K, V>>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.cap().get())
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.as_ref().is_some_and(|c| c.contains(key))
    }

    /// Look up and mark as recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.as_mut()?.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.as_mut()?.get_mut(key)
    }

    /// Look up without touching LRU order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.as_ref()?.peek(key)
    }

    /// Insert or replace.
    ///
    /// Returns the entry that is no longer resident because of this call:
    /// the evicted least recently used entry, or the new entry itself when
    /// the cache is disabled. Replacing an existing key returns nothing.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let Some(cache) = self.inner.as_mut() else {
            return Some((key, value));
        };
        if cache.contains(&key) {
            cache.put(key, value);
            return None;
        }
        cache.push(key, value)
    }

    /// Insert unless the key is present. Same return as [`put`](Self::put).
    pub fn put_if_absent(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.contains(&key) {
            return None;
        }
        self.put(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.as_mut()?.pop(key)
    }

    /// Remove every entry, least recently used first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.len());
        if let Some(cache) = self.inner.as_mut() {
            while let Some(entry) = cache.pop_lru() {
                drained.push(entry);
            }
        }
        drained
    }
}

// ============================================================================
// Parsed SQL cache (process-wide)
// ============================================================================

static PARSED_CACHES: Lazy<Mutex<HashMap<usize, Arc<ParsedSqlCache>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// SQL text -> parsed tree, shared by every session with the same capacity.
///
/// Entries are never handed out directly; callers get their own copy to edit.
pub struct ParsedSqlCache {
    entries: Mutex<BoundedCache<String, SqlText>>,
}

impl ParsedSqlCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BoundedCache::new(capacity)),
        }
    }

    /// The process-wide cache of the given capacity.
    pub fn shared(capacity: usize) -> Arc<ParsedSqlCache> {
        let mut caches = PARSED_CACHES.lock();
        Arc::clone(
            caches
                .entry(capacity)
                .or_insert_with(|| Arc::new(ParsedSqlCache::new(capacity))),
        )
    }

    /// Parse `sql`, or copy the cached tree.
    pub fn parse(&self, sql: &str) -> PgResult<SqlText> {
        if let Some(text) = self.entries.lock().get(&sql.to_string()) {
            debug!(sql, "parsed sql cache hit");
            return Ok(text.clone());
        }
        let text = SqlText::parse(sql)?;
        self.entries.lock().put(sql.to_string(), text.clone());
        Ok(text)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Per-session statement caches
// ============================================================================

/// Description and prepared-statement caches of one session.
pub struct StatementCaches {
    descriptions: BoundedCache<StatementCacheKey, Arc<StatementDescription>>,
    prepared: BoundedCache<StatementCacheKey, Arc<PreparedStatementDescription>>,
    heat: BoundedCache<StatementCacheKey, u32>,
    threshold: u32,
}

impl StatementCaches {
    pub fn new(description_size: usize, prepared_size: usize, threshold: u32) -> Self {
        Self {
            descriptions: BoundedCache::new(description_size),
            prepared: BoundedCache::new(prepared_size),
            heat: BoundedCache::new(description_size.max(prepared_size)),
            threshold,
        }
    }

    pub fn from_config(config: &PgConfig) -> Self {
        Self::new(
            config.description_cache_size,
            config.prepared_statement_cache_size,
            config.prepared_statement_threshold,
        )
    }

    pub fn description(&mut self, key: &StatementCacheKey) -> Option<Arc<StatementDescription>> {
        self.descriptions.get(key).cloned()
    }

    pub fn put_description(&mut self, key: StatementCacheKey, description: Arc<StatementDescription>) {
        self.descriptions.put(key, description);
    }

    pub fn put_description_if_absent(
        &mut self,
        key: StatementCacheKey,
        description: Arc<StatementDescription>,
    ) {
        self.descriptions.put_if_absent(key, description);
    }

    pub fn prepared(&mut self, key: &StatementCacheKey) -> Option<Arc<PreparedStatementDescription>> {
        self.prepared.get(key).cloned()
    }

    /// Cache a prepared statement. The returned entry, if any, is no longer
    /// cached and its server-side statement must be closed by the caller.
    pub fn put_prepared(
        &mut self,
        key: StatementCacheKey,
        prepared: Arc<PreparedStatementDescription>,
    ) -> Option<Arc<PreparedStatementDescription>> {
        let evicted = self.prepared.put(key, prepared).map(|(_, p)| p);
        if let Some(p) = &evicted {
            debug!(name = %p.name, "prepared statement evicted");
        }
        evicted
    }

    pub fn remove_prepared(&mut self, key: &StatementCacheKey) -> Option<Arc<PreparedStatementDescription>> {
        self.prepared.remove(key)
    }

    /// Empty the prepared cache, returning what must be closed server-side.
    pub fn drain_prepared(&mut self) -> Vec<Arc<PreparedStatementDescription>> {
        self.prepared.drain().into_iter().map(|(_, p)| p).collect()
    }

    pub fn prepared_enabled(&self) -> bool {
        self.prepared.is_enabled()
    }

    pub fn prepared_len(&self) -> usize {
        self.prepared.len()
    }

    pub fn description_len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn heat(&self, key: &StatementCacheKey) -> u32 {
        self.heat.peek(key).copied().unwrap_or(0)
    }

    /// Record one use of `key` and report whether it should now be prepared.
    pub fn should_prepare(&mut self, key: &StatementCacheKey) -> bool {
        if !self.prepared.is_enabled() {
            return false;
        }
        if self.threshold == 0 {
            return true;
        }

        let uses = match self.heat.get_mut(key) {
            Some(uses) => {
                *uses += 1;
                *uses
            }
            None => {
                self.heat.put(key.clone(), 1);
                1
            }
        };
        debug!(sql = %key.sql, uses, threshold = self.threshold, "statement heat");
        if uses >= self.threshold {
            self.heat.remove(key);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::types::Oid;

    fn key(sql: &str) -> StatementCacheKey {
        StatementCacheKey::new(sql, vec![Oid::INT4])
    }

    fn prepared(name: &str) -> Arc<PreparedStatementDescription> {
        Arc::new(PreparedStatementDescription {
            name: name.to_string(),
            description: Arc::new(StatementDescription {
                param_types: Vec::new(),
                columns: Arc::new(Vec::new()),
            }),
        })
    }

    #[test]
    fn test_lru_eviction_bound() {
        let mut cache = BoundedCache::new(2);
        assert!(cache.put("q1", 1).is_none());
        assert!(cache.put("q2", 2).is_none());

        // Access q1 to make it recently used
        cache.get(&"q1");

        assert_eq!(cache.put("q3", 3), Some(("q2", 2)));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&"q1"));
        assert!(!cache.contains(&"q2"));

        let mut numbers = BoundedCache::new(3);
        for i in 0..10 {
            numbers.put(i, i);
            assert!(numbers.len() <= 3);
        }
    }

    #[test]
    fn test_replacement_is_not_eviction() {
        let mut cache = BoundedCache::new(1);
        cache.put("a", 1);
        assert!(cache.put("a", 2).is_none());
        assert_eq!(cache.peek(&"a"), Some(&2));
        assert!(cache.put_if_absent("a", 3).is_none());
        assert_eq!(cache.peek(&"a"), Some(&2));
    }

    #[test]
    fn test_zero_capacity_is_pass_through() {
        let mut cache = BoundedCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.put("a", 1), Some(("a", 1)));
        assert!(cache.get(&"a").is_none());
        assert!(cache.drain().is_empty());
    }

    #[test]
    fn test_prepared_eviction_returns_one_statement() {
        let mut caches = StatementCaches::new(10, 1, 0);
        assert!(caches.put_prepared(key("A"), prepared("1")).is_none());
        let evicted = caches.put_prepared(key("B"), prepared("2")).unwrap();
        assert_eq!(evicted.name, "1");
        assert_eq!(caches.prepared_len(), 1);
        assert!(caches.prepared(&key("A")).is_none());
        assert_eq!(caches.prepared(&key("B")).unwrap().name, "2");
    }

    #[test]
    fn test_heat_threshold() {
        let mut caches = StatementCaches::new(10, 10, 3);
        let k = key("SELECT $1");
        assert!(!caches.should_prepare(&k));
        assert!(!caches.should_prepare(&k));
        assert_eq!(caches.heat(&k), 2);
        assert!(caches.should_prepare(&k));
        assert_eq!(caches.heat(&k), 0);

        // a different parameter type is a different statement
        let other = StatementCacheKey::new("SELECT $1", vec![Oid::INT8]);
        assert!(!caches.should_prepare(&other));
    }

    #[test]
    fn test_threshold_zero_and_disabled_cache() {
        let mut always = StatementCaches::new(10, 10, 0);
        assert!(always.should_prepare(&key("x")));

        let mut never = StatementCaches::new(10, 0, 0);
        assert!(!never.should_prepare(&key("x")));
        assert!(!never.prepared_enabled());
    }

    #[test]
    fn test_parsed_cache_returns_copies() {
        let cache = ParsedSqlCache::new(4);
        let mut first = cache.parse("SELECT ?").unwrap();
        assert_eq!(cache.len(), 1);
        first.statements_mut()[0].clear();

        let second = cache.parse("SELECT ?").unwrap();
        assert_eq!(second.render(), "SELECT $1");
        assert!(cache.parse("SELECT 'oops").is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shared_parsed_cache_by_capacity() {
        let a = ParsedSqlCache::shared(17);
        let b = ParsedSqlCache::shared(17);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
