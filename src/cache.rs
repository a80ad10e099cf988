//! Result cache
//!
//! Bounded LRU cache of decoded images keyed by `(url, bounding box)`, with
//! single-flight coalescing of concurrent loads and a short-lived negative
//! cache so a URL that just failed is not hammered. Successful inserts and
//! LRU evictions are forwarded to a [`TextureSink`] so decoded results and
//! their renderer-resident textures live and die together.

use crate::decode::DecodedImage;
use crate::error::{Error, Result};
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of decoded entries kept.
pub const CACHE_CAPACITY: usize = 10;
/// How long a failed key suppresses re-fetch attempts.
pub const FAILURE_COOLDOWN_MS: u64 = 30_000;

/// Identity of a cache/texture entry: source URL plus the bounding box it was
/// decoded for. The same URL at two display sizes is two entries.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FetchKey {
  pub url: String,
  pub max_width: u32,
  pub max_height: u32,
}

impl FetchKey {
  pub fn new(url: impl Into<String>, max_width: u32, max_height: u32) -> Self {
    Self {
      url: url.into(),
      max_width,
      max_height,
    }
  }
}

impl fmt::Display for FetchKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}x{}", self.url, self.max_width, self.max_height)
  }
}

/// Wall-clock abstraction so cooldown and animation timing are testable.
pub trait TimeSource: Send + Sync {
  fn now_ms(&self) -> u64;
}

/// System wall clock (milliseconds since the Unix epoch).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
  fn now_ms(&self) -> u64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or(0)
  }
}

/// Receiver for cache lifecycle events.
///
/// The texture layer implements this; `realize` is invoked on the background
/// load thread right after a successful insert, `release` right after an LRU
/// eviction, so an entry never outlives its textures (or vice versa) beyond
/// the instant between the two calls.
pub trait TextureSink: Send + Sync {
  fn realize(&self, key: &FetchKey, image: &Arc<DecodedImage>);
  fn release(&self, key: &FetchKey);
}

type LoadResult = Result<Arc<DecodedImage>>;

#[derive(Debug)]
struct LoadFlight {
  slot: Mutex<Option<LoadResult>>,
  cv: Condvar,
}

impl LoadFlight {
  fn new() -> Self {
    Self {
      slot: Mutex::new(None),
      cv: Condvar::new(),
    }
  }

  fn settled(result: LoadResult) -> Arc<Self> {
    Arc::new(Self {
      slot: Mutex::new(Some(result)),
      cv: Condvar::new(),
    })
  }

  /// First settle wins; later attempts (e.g. a worker finishing after a
  /// clear already cancelled the flight) are ignored.
  fn settle(&self, result: LoadResult) {
    if let Ok(mut slot) = self.slot.lock() {
      if slot.is_none() {
        *slot = Some(result);
        self.cv.notify_all();
      }
    }
  }

  fn wait(&self) -> LoadResult {
    let mut guard = self.slot.lock().unwrap();
    while guard.is_none() {
      guard = self.cv.wait(guard).unwrap();
    }
    guard.as_ref().unwrap().clone()
  }

  fn peek(&self) -> Option<LoadResult> {
    self.slot.lock().ok().and_then(|slot| slot.clone())
  }
}

/// Handle to a pending or settled load. Cheap to clone; all clones observe
/// the same eventual result.
#[derive(Clone, Debug)]
pub struct LoadHandle {
  flight: Arc<LoadFlight>,
}

impl LoadHandle {
  /// Block until the load settles.
  pub fn wait(&self) -> LoadResult {
    self.flight.wait()
  }

  /// Non-blocking probe; `None` while the load is still in flight.
  pub fn try_result(&self) -> Option<LoadResult> {
    self.flight.peek()
  }

  pub fn is_settled(&self) -> bool {
    self.flight.peek().is_some()
  }
}

struct FailureRecord {
  at_ms: u64,
  error: Error,
}

/// Bounded decoded-image cache with single-flight loads and failure cooldown.
pub struct ResultCache {
  entries: Mutex<LruCache<FetchKey, Arc<DecodedImage>>>,
  in_flight: Mutex<HashMap<FetchKey, Arc<LoadFlight>>>,
  failures: Mutex<HashMap<FetchKey, FailureRecord>>,
  sink: Mutex<Option<Arc<dyn TextureSink>>>,
  clock: Arc<dyn TimeSource>,
  cooldown_ms: u64,
  generation: AtomicU64,
}

impl ResultCache {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
    Self::with_capacity_and_clock(CACHE_CAPACITY, clock)
  }

  pub fn with_capacity_and_clock(capacity: usize, clock: Arc<dyn TimeSource>) -> Self {
    let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: Mutex::new(LruCache::new(capacity)),
      in_flight: Mutex::new(HashMap::new()),
      failures: Mutex::new(HashMap::new()),
      sink: Mutex::new(None),
      clock,
      cooldown_ms: FAILURE_COOLDOWN_MS,
      generation: AtomicU64::new(0),
    }
  }

  pub fn set_cooldown_ms(&mut self, cooldown_ms: u64) {
    self.cooldown_ms = cooldown_ms;
  }

  /// Attach the texture layer. Must be set before loads begin realizing
  /// textures; the cache itself works without one (tests, headless use).
  pub fn set_sink(&self, sink: Arc<dyn TextureSink>) {
    if let Ok(mut slot) = self.sink.lock() {
      *slot = Some(sink);
    }
  }

  /// Fetch-or-return a decoded image for `key`.
  ///
  /// `fetch_fn` runs on a background thread and is invoked at most once per
  /// key across all concurrent callers. Callers holding a handle for a key
  /// under failure cooldown get an immediately-failed handle without a new
  /// fetch.
  pub fn get_or_fetch<F>(self: &Arc<Self>, key: FetchKey, fetch_fn: F) -> LoadHandle
  where
    F: FnOnce() -> Result<DecodedImage> + Send + 'static,
  {
    if let Some(error) = self.live_failure(&key) {
      return LoadHandle {
        flight: LoadFlight::settled(Err(error)),
      };
    }

    if let Ok(mut entries) = self.entries.lock() {
      if let Some(image) = entries.get(&key) {
        return LoadHandle {
          flight: LoadFlight::settled(Ok(Arc::clone(image))),
        };
      }
    }

    let (flight, is_owner) = self.join_flight(&key);
    if !is_owner {
      return LoadHandle { flight };
    }

    let cache = Arc::clone(self);
    let generation = self.generation.load(Ordering::SeqCst);
    let worker_flight = Arc::clone(&flight);
    let worker_key = key;
    thread::spawn(move || {
      let result = fetch_fn();
      cache.finish_flight(worker_key, worker_flight, result, generation);
    });

    LoadHandle { flight }
  }

  /// The user-visible reason a key last failed, while its cooldown is live.
  pub fn failure_reason(&self, key: &FetchKey) -> Option<String> {
    self.live_failure(key).map(|e| e.reason())
  }

  /// True if `key` is currently cached (without promoting it).
  pub fn contains(&self, key: &FetchKey) -> bool {
    self
      .entries
      .lock()
      .map(|entries| entries.contains(key))
      .unwrap_or(false)
  }

  /// Cached value for `key`, promoting it to most recently used.
  pub fn get(&self, key: &FetchKey) -> Option<Arc<DecodedImage>> {
    self
      .entries
      .lock()
      .ok()
      .and_then(|mut entries| entries.get(key).map(Arc::clone))
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drops everything: cancels in-flight loads (their results are discarded
  /// when they settle), empties the LRU without per-entry sink callbacks, and
  /// forgets failure records. Callers are expected to clear the texture layer
  /// in bulk separately.
  pub fn clear(&self) {
    self.generation.fetch_add(1, Ordering::SeqCst);

    let flights: Vec<Arc<LoadFlight>> = self
      .in_flight
      .lock()
      .map(|mut map| map.drain().map(|(_, f)| f).collect())
      .unwrap_or_default();
    for flight in flights {
      flight.settle(Err(Error::Cancelled));
    }

    if let Ok(mut entries) = self.entries.lock() {
      entries.clear();
    }
    if let Ok(mut failures) = self.failures.lock() {
      failures.clear();
    }
  }

  fn live_failure(&self, key: &FetchKey) -> Option<Error> {
    let now = self.clock.now_ms();
    let mut failures = self.failures.lock().ok()?;
    match failures.get(key) {
      Some(record) if now.saturating_sub(record.at_ms) < self.cooldown_ms => {
        Some(record.error.clone())
      }
      Some(_) => {
        // Cooldown expired; the next attempt is allowed.
        failures.remove(key);
        None
      }
      None => None,
    }
  }

  fn join_flight(&self, key: &FetchKey) -> (Arc<LoadFlight>, bool) {
    let mut map = self.in_flight.lock().unwrap();
    if let Some(existing) = map.get(key) {
      return (Arc::clone(existing), false);
    }
    let flight = Arc::new(LoadFlight::new());
    map.insert(key.clone(), Arc::clone(&flight));
    (flight, true)
  }

  fn finish_flight(
    &self,
    key: FetchKey,
    flight: Arc<LoadFlight>,
    result: Result<DecodedImage>,
    generation: u64,
  ) {
    let shared = match result {
      Ok(image) => {
        let image = Arc::new(image);
        // The generation is re-read under the entries lock: a clear landing
        // after the worker returned must still keep its result out of the
        // fresh LRU.
        let evicted = {
          let mut entries = self.entries.lock().unwrap();
          if self.generation.load(Ordering::SeqCst) != generation {
            drop(entries);
            flight.settle(Err(Error::Cancelled));
            self.remove_own_flight(&key, &flight);
            return;
          }
          match entries.push(key.clone(), Arc::clone(&image)) {
            Some((old_key, _)) if old_key != key => Some(old_key),
            _ => None,
          }
        };
        if let Ok(mut failures) = self.failures.lock() {
          failures.remove(&key);
        }

        let sink = self.sink.lock().ok().and_then(|s| s.clone());
        if let Some(sink) = sink {
          if let Some(evicted_key) = &evicted {
            sink.release(evicted_key);
          }
          sink.realize(&key, &image);
        }
        Ok(image)
      }
      Err(error) => {
        let stale = {
          let mut failures = self.failures.lock().unwrap();
          if self.generation.load(Ordering::SeqCst) != generation {
            true
          } else {
            tracing::warn!(key = %key, error = %error, "image load failed");
            failures.insert(
              key.clone(),
              FailureRecord {
                at_ms: self.clock.now_ms(),
                error: error.clone(),
              },
            );
            false
          }
        };
        if stale {
          flight.settle(Err(Error::Cancelled));
          self.remove_own_flight(&key, &flight);
          return;
        }
        Err(error)
      }
    };

    flight.settle(shared);
    self.remove_own_flight(&key, &flight);
  }

  /// Drops `flight` from the in-flight map only if it still owns the slot.
  /// After a clear, the slot may hold a newer flight registered by a fresh
  /// request; a stale worker must leave that one alone.
  fn remove_own_flight(&self, key: &FetchKey, flight: &Arc<LoadFlight>) {
    if let Ok(mut map) = self.in_flight.lock() {
      if map.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
        map.remove(key);
      }
    }
  }
}

impl Default for ResultCache {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use image::RgbaImage;
  use std::sync::atomic::AtomicU64;

  pub(crate) struct MockClock {
    now: AtomicU64,
  }

  impl MockClock {
    pub(crate) fn new(start: u64) -> Self {
      Self {
        now: AtomicU64::new(start),
      }
    }

    pub(crate) fn advance(&self, ms: u64) {
      self.now.fetch_add(ms, Ordering::SeqCst);
    }
  }

  impl TimeSource for MockClock {
    fn now_ms(&self) -> u64 {
      self.now.load(Ordering::SeqCst)
    }
  }

  fn tiny_image() -> DecodedImage {
    DecodedImage::Static {
      pixels: RgbaImage::new(1, 1),
    }
  }

  #[test]
  fn fetch_key_display_encodes_bounding_box() {
    let key = FetchKey::new("https://a.example/x.png", 320, 180);
    assert_eq!(key.to_string(), "https://a.example/x.png@320x180");
  }

  #[test]
  fn caches_successful_loads() {
    let cache = Arc::new(ResultCache::new());
    let key = FetchKey::new("https://a.example/x.png", 64, 64);

    let handle = cache.get_or_fetch(key.clone(), || Ok(tiny_image()));
    handle.wait().expect("load");
    assert!(cache.contains(&key));

    // Second call settles immediately from cache.
    let handle = cache.get_or_fetch(key.clone(), || panic!("must not re-fetch"));
    assert!(handle.is_settled());
  }

  #[test]
  fn failures_are_not_inserted() {
    let cache = Arc::new(ResultCache::new());
    let key = FetchKey::new("https://a.example/broken.png", 64, 64);

    let handle = cache.get_or_fetch(key.clone(), || Err(Error::Other("boom".to_string())));
    assert!(handle.wait().is_err());
    assert!(!cache.contains(&key));
    assert_eq!(cache.failure_reason(&key).as_deref(), Some("boom"));
  }

  #[test]
  fn cooldown_suppresses_and_then_permits_retry() {
    let clock = Arc::new(MockClock::new(1_000));
    let cache = Arc::new(ResultCache::with_clock(Arc::clone(&clock) as Arc<dyn TimeSource>));
    let key = FetchKey::new("https://a.example/flaky.png", 64, 64);

    cache
      .get_or_fetch(key.clone(), || Err(Error::Other("down".to_string())))
      .wait()
      .unwrap_err();

    // Inside the cooldown window the fetch_fn must not run.
    clock.advance(FAILURE_COOLDOWN_MS - 1);
    let handle = cache.get_or_fetch(key.clone(), || panic!("suppressed"));
    assert!(handle.wait().is_err());

    // One more millisecond and a fresh attempt is allowed.
    clock.advance(1);
    let handle = cache.get_or_fetch(key.clone(), || Ok(tiny_image()));
    handle.wait().expect("retry after cooldown");
    assert!(cache.failure_reason(&key).is_none());
  }

  #[test]
  fn clear_cancels_and_empties() {
    let cache = Arc::new(ResultCache::new());
    let key = FetchKey::new("https://a.example/x.png", 64, 64);
    cache
      .get_or_fetch(key.clone(), || Ok(tiny_image()))
      .wait()
      .unwrap();
    cache
      .get_or_fetch(FetchKey::new("https://a.example/y.png", 64, 64), || {
        Err(Error::Other("bad".to_string()))
      })
      .wait()
      .unwrap_err();

    cache.clear();
    assert!(cache.is_empty());
    assert!(cache
      .failure_reason(&FetchKey::new("https://a.example/y.png", 64, 64))
      .is_none());
  }
}
