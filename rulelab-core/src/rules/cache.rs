//! Content-addressed cache of compiled programs.
//!
//! Keyed by the BLAKE3 hash of the exact expression text. Bounded: when full,
//! the least recently used entry is evicted. One cache is shared by every bot
//! in a session through an `Arc`; the map sits behind a `parking_lot::Mutex`.

use super::engine::Program;
use super::error::CompileError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// BLAKE3 digest of an expression's source text.
pub type ProgramHash = [u8; 32];

pub fn program_hash(source: &str) -> ProgramHash {
    *blake3::hash(source.as_bytes()).as_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct Entry {
    program: Arc<Program>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ProgramHash, Entry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug)]
pub struct ProgramCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ProgramCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// Cached program for `source`, compiling it on a miss.
    ///
    /// Compilation happens under the lock so concurrent callers asking for the
    /// same text see a single miss. Failed compilations are not cached.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<Program>, CompileError> {
        let key = program_hash(source);
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_used = tick;
            let program = Arc::clone(&entry.program);
            inner.hits += 1;
            return Ok(program);
        }

        inner.misses += 1;
        let program = Arc::new(Program::compile(source)?);
        if inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                trace!("program cache eviction");
            }
        }
        inner.entries.insert(
            key,
            Entry {
                program: Arc::clone(&program),
                last_used: tick,
            },
        );
        Ok(program)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.inner.lock().entries.contains_key(&program_hash(source))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            len: inner.entries.len(),
            capacity: self.capacity,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_compiles_once() {
        let cache = ProgramCache::new(8);
        let a = cache.get_or_compile("close > 1").unwrap();
        let b = cache.get_or_compile("close > 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let s = cache.stats();
        assert_eq!((s.hits, s.misses, s.len), (1, 1, 1));
    }

    #[test]
    fn whitespace_is_part_of_the_key() {
        let cache = ProgramCache::new(8);
        cache.get_or_compile("close > 1").unwrap();
        cache.get_or_compile("close  > 1").unwrap();
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ProgramCache::new(2);
        cache.get_or_compile("a > 1").unwrap();
        cache.get_or_compile("b > 1").unwrap();
        cache.get_or_compile("a > 1").unwrap();
        cache.get_or_compile("c > 1").unwrap();
        assert!(cache.contains("a > 1"));
        assert!(!cache.contains("b > 1"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn compile_errors_not_cached() {
        let cache = ProgramCache::new(2);
        assert!(cache.get_or_compile("close >").is_err());
        assert!(!cache.contains("close >"));
        assert_eq!(cache.stats().len, 0);
    }

    #[test]
    fn shared_across_threads() {
        let cache = ProgramCache::shared(16);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        cache.get_or_compile("rsi < 30").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = cache.stats();
        assert_eq!(s.misses, 1);
        assert_eq!(s.hits, 39);
    }
}
