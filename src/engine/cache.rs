//! Bounded, thread-safe LRU cache of engine instances.
//!
//! ```text
//! get_or_create(key, build)
//!   │
//!   ├─ hit?            return it (and mark most-recently used)
//!   ├─ take key slot   per-key lock; other keys are not blocked
//!   ├─ hit again?      someone else built it while we waited
//!   ├─ build()         outside the map lock; errors are returned, not stored
//!   └─ insert          evict the least-recently-used entry when full
//! ```
//!
//! The per-key slot is held from the second lookup through construction, so
//! concurrent callers for one key build the engine exactly once. The map
//! lock itself is only held for short bookkeeping sections.

use super::CacheKey;
use crate::error::{JobkitError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

struct CacheEntry<E: ?Sized> {
    engine: Arc<E>,
    last_used: Instant,
}

struct CacheState<E: ?Sized> {
    entries: HashMap<CacheKey, CacheEntry<E>>,
    /// Keys from least to most recently used.
    recency: VecDeque<CacheKey>,
    /// Construction slots for keys currently being looked up or built.
    building: HashMap<CacheKey, Arc<Mutex<()>>>,
}

impl<E: ?Sized> CacheState<E> {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            if let Some(k) = self.recency.remove(pos) {
                self.recency.push_back(k);
            }
        }
    }
}

/// LRU cache mapping configuration keys to shared engine handles.
pub struct EngineCache<E: ?Sized> {
    name: &'static str,
    capacity: usize,
    state: Mutex<CacheState<E>>,
}

impl<E: ?Sized + Send + Sync> EngineCache<E> {
    /// Create a cache holding at most `capacity` engines.
    ///
    /// # Errors
    /// [`JobkitError::CacheCapacity`] if `capacity` is zero.
    pub fn new(name: &'static str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(JobkitError::CacheCapacity { capacity });
        }
        Ok(Self {
            name,
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                building: HashMap::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Return the engine for `key`, building it with `build` if absent.
    ///
    /// Blocks the calling thread while another caller builds the same key;
    /// call from `spawn_blocking` when on an async runtime.
    pub fn get_or_create<F>(&self, key: &CacheKey, build: F) -> Result<Arc<E>>
    where
        F: FnOnce() -> Result<Arc<E>>,
    {
        if let Some(engine) = self.lookup(key) {
            return Ok(engine);
        }

        let slot = {
            let mut state = self.state.lock();
            Arc::clone(
                state
                    .building
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let result = {
            let _guard = slot.lock();
            match self.lookup(key) {
                Some(engine) => Ok(engine),
                None => {
                    let started = Instant::now();
                    debug!(cache = self.name, %key, "building engine");
                    build().map(|engine| {
                        info!(
                            cache = self.name,
                            %key,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "engine ready"
                        );
                        self.insert(key, Arc::clone(&engine));
                        engine
                    })
                }
            }
        };

        // Drop the slot once nobody else holds it. Clones are only taken
        // under the state lock, so the count cannot grow concurrently.
        let mut state = self.state.lock();
        if Arc::strong_count(&slot) == 2 {
            state.building.remove(key);
        }
        drop(state);

        result
    }

    /// Evict every engine.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let evicted = state.entries.len();
        state.entries.clear();
        state.recency.clear();
        info!(cache = self.name, evicted, "engine cache cleared");
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<E>> {
        let mut state = self.state.lock();
        let engine = {
            let entry = state.entries.get_mut(key)?;
            entry.last_used = Instant::now();
            Arc::clone(&entry.engine)
        };
        state.touch(key);
        Some(engine)
    }

    fn insert(&self, key: &CacheKey, engine: Arc<E>) {
        let mut state = self.state.lock();
        if state.entries.contains_key(key) {
            state.touch(key);
            return;
        }
        while state.entries.len() >= self.capacity {
            let Some(oldest) = state.recency.pop_front() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&oldest) {
                debug!(
                    cache = self.name,
                    key = %oldest,
                    idle_ms = entry.last_used.elapsed().as_millis() as u64,
                    "evicting least-recently-used engine"
                );
            }
        }
        state.entries.insert(
            key.clone(),
            CacheEntry {
                engine,
                last_used: Instant::now(),
            },
        );
        state.recency.push_back(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache_key;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn key(n: u32) -> CacheKey {
        cache_key(&json!({ "n": n })).unwrap()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = EngineCache::<String>::new("test", 0).err().unwrap();
        assert!(matches!(err, JobkitError::CacheCapacity { capacity: 0 }));
    }

    #[test]
    fn concurrent_callers_build_once() {
        let cache = Arc::new(EngineCache::<String>::new("test", 4).unwrap());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));
        let k = key(1);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                let k = k.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_create(&k, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(Arc::new("engine".to_string()))
                        })
                        .unwrap()
                })
            })
            .collect();

        let engines: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(engines.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_keys_build_independently() {
        let cache = EngineCache::<String>::new("test", 4).unwrap();
        let a = cache.get_or_create(&key(1), || Ok(Arc::new("a".into()))).unwrap();
        let b = cache.get_or_create(&key(2), || Ok(Arc::new("b".into()))).unwrap();
        assert_eq!(*a, "a");
        assert_eq!(*b, "b");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = EngineCache::<String>::new("test", 2).unwrap();
        cache.get_or_create(&key(1), || Ok(Arc::new("1".into()))).unwrap();
        cache.get_or_create(&key(2), || Ok(Arc::new("2".into()))).unwrap();
        // Touch 1 so that 2 becomes the eviction candidate.
        cache.get_or_create(&key(1), || panic!("should be cached")).unwrap();
        cache.get_or_create(&key(3), || Ok(Arc::new("3".into()))).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
    }

    #[test]
    fn failed_build_is_not_cached() {
        let cache = EngineCache::<String>::new("test", 2).unwrap();
        let attempts = AtomicUsize::new(0);
        let err = cache.get_or_create(&key(7), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(JobkitError::EngineUnavailable {
                detail: "missing model".into(),
            })
        });
        assert!(err.is_err());
        assert!(!cache.contains(&key(7)));

        let ok = cache.get_or_create(&key(7), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new("recovered".into()))
        });
        assert_eq!(*ok.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_evicts_everything() {
        let cache = EngineCache::<String>::new("test", 3).unwrap();
        for n in 0..3 {
            cache.get_or_create(&key(n), || Ok(Arc::new(n.to_string()))).unwrap();
        }
        cache.clear();
        assert!(cache.is_empty());
        let builds = AtomicUsize::new(0);
        cache
            .get_or_create(&key(0), || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("again".into()))
            })
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_slots_are_released() {
        let cache = EngineCache::<String>::new("test", 2).unwrap();
        cache.get_or_create(&key(1), || Ok(Arc::new("1".into()))).unwrap();
        assert!(cache.state.lock().building.is_empty());
    }
}
