use hoverpix::cache::{FetchKey, ResultCache, TextureSink, TimeSource, FAILURE_COOLDOWN_MS};
use hoverpix::decode::DecodedImage;
use hoverpix::error::Error;
use image::RgbaImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

struct MockClock {
  now: AtomicU64,
}

impl MockClock {
  fn new(start: u64) -> Self {
    Self {
      now: AtomicU64::new(start),
    }
  }

  fn advance(&self, ms: u64) {
    self.now.fetch_add(ms, Ordering::SeqCst);
  }
}

impl TimeSource for MockClock {
  fn now_ms(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }
}

#[derive(Default)]
struct RecordingSink {
  realized: Mutex<Vec<FetchKey>>,
  released: Mutex<Vec<FetchKey>>,
}

impl TextureSink for RecordingSink {
  fn realize(&self, key: &FetchKey, _image: &Arc<DecodedImage>) {
    self.realized.lock().unwrap().push(key.clone());
  }

  fn release(&self, key: &FetchKey) {
    self.released.lock().unwrap().push(key.clone());
  }
}

fn image() -> DecodedImage {
  DecodedImage::Static {
    pixels: RgbaImage::new(2, 2),
  }
}

fn key(url: &str) -> FetchKey {
  FetchKey::new(url, 64, 64)
}

#[test]
fn concurrent_requests_share_one_fetch() {
  let cache = Arc::new(ResultCache::new());
  let fetches = Arc::new(AtomicU64::new(0));
  let barrier = Arc::new(Barrier::new(8));

  let mut joins = Vec::new();
  for _ in 0..8 {
    let cache = Arc::clone(&cache);
    let fetches = Arc::clone(&fetches);
    let barrier = Arc::clone(&barrier);
    joins.push(thread::spawn(move || {
      barrier.wait();
      let handle = cache.get_or_fetch(key("https://a.example/shared.png"), move || {
        fetches.fetch_add(1, Ordering::SeqCst);
        // Hold the flight open long enough for every caller to join it.
        thread::sleep(std::time::Duration::from_millis(50));
        Ok(image())
      });
      handle.wait()
    }));
  }

  for join in joins {
    assert!(join.join().unwrap().is_ok());
  }
  assert_eq!(fetches.load(Ordering::SeqCst), 1, "fetch_fn must run once");
}

#[test]
fn lru_evicts_least_recently_used_and_notifies_sink() {
  let clock = Arc::new(MockClock::new(0));
  let cache = Arc::new(ResultCache::with_capacity_and_clock(
    3,
    Arc::clone(&clock) as Arc<dyn TimeSource>,
  ));
  let sink = Arc::new(RecordingSink::default());
  cache.set_sink(Arc::clone(&sink) as Arc<dyn TextureSink>);

  for url in [
    "https://a.example/1.png",
    "https://a.example/2.png",
    "https://a.example/3.png",
  ] {
    cache.get_or_fetch(key(url), || Ok(image())).wait().unwrap();
  }

  // Touch 1 so 2 becomes least recently used.
  assert!(cache.get(&key("https://a.example/1.png")).is_some());

  cache
    .get_or_fetch(key("https://a.example/4.png"), || Ok(image()))
    .wait()
    .unwrap();

  assert!(cache.get(&key("https://a.example/1.png")).is_some());
  assert!(cache.get(&key("https://a.example/2.png")).is_none());
  assert!(cache.get(&key("https://a.example/3.png")).is_some());
  assert!(cache.get(&key("https://a.example/4.png")).is_some());

  let released = sink.released.lock().unwrap();
  assert_eq!(released.as_slice(), &[key("https://a.example/2.png")]);
  let realized = sink.realized.lock().unwrap();
  assert_eq!(realized.len(), 4);
}

#[test]
fn failure_cooldown_blocks_then_allows_retry() {
  let clock = Arc::new(MockClock::new(10_000));
  let cache = Arc::new(ResultCache::with_clock(
    Arc::clone(&clock) as Arc<dyn TimeSource>
  ));
  let k = key("https://a.example/flaky.png");
  let fetches = Arc::new(AtomicU64::new(0));

  let counted = Arc::clone(&fetches);
  cache
    .get_or_fetch(k.clone(), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      Err(Error::Other("server fell over".to_string()))
    })
    .wait()
    .unwrap_err();
  assert_eq!(
    cache.failure_reason(&k).as_deref(),
    Some("server fell over")
  );

  // Just inside the window: suppressed, same reason surfaced.
  clock.advance(FAILURE_COOLDOWN_MS - 1);
  let counted = Arc::clone(&fetches);
  let result = cache
    .get_or_fetch(k.clone(), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      Ok(image())
    })
    .wait();
  assert!(result.is_err());
  assert_eq!(fetches.load(Ordering::SeqCst), 1);

  // Just past the window: retried and succeeds.
  clock.advance(1);
  let counted = Arc::clone(&fetches);
  cache
    .get_or_fetch(k.clone(), move || {
      counted.fetch_add(1, Ordering::SeqCst);
      Ok(image())
    })
    .wait()
    .unwrap();
  assert_eq!(fetches.load(Ordering::SeqCst), 2);
  assert!(cache.failure_reason(&k).is_none());
}

#[test]
fn failures_never_evict_existing_entries() {
  let clock = Arc::new(MockClock::new(0));
  let cache = Arc::new(ResultCache::with_capacity_and_clock(
    2,
    Arc::clone(&clock) as Arc<dyn TimeSource>,
  ));

  cache
    .get_or_fetch(key("https://a.example/ok.png"), || Ok(image()))
    .wait()
    .unwrap();
  cache
    .get_or_fetch(key("https://a.example/bad.png"), || {
      Err(Error::Other("nope".to_string()))
    })
    .wait()
    .unwrap_err();

  assert_eq!(cache.len(), 1);
  assert!(cache.get(&key("https://a.example/ok.png")).is_some());
}

#[test]
fn clear_cancels_pending_flights() {
  let cache = Arc::new(ResultCache::new());
  let started = Arc::new(Barrier::new(2));
  let cleared = Arc::new(Barrier::new(2));

  let worker_started = Arc::clone(&started);
  let worker_cleared = Arc::clone(&cleared);
  let handle = cache.get_or_fetch(key("https://a.example/slow.png"), move || {
    worker_started.wait();
    // Resumes only after the main thread has cleared the cache, so this
    // result arrives under a stale generation and must be discarded.
    worker_cleared.wait();
    Ok(image())
  });

  started.wait();
  cache.clear();
  cleared.wait();

  assert!(matches!(handle.wait(), Err(Error::Cancelled)));
  assert!(cache.is_empty());
}

#[test]
fn stale_results_after_clear_leave_new_flights_alone() {
  let cache = Arc::new(ResultCache::new());
  let k = key("https://a.example/contested.png");

  let started = Arc::new(Barrier::new(2));
  let resume = Arc::new(Barrier::new(2));
  let old_started = Arc::clone(&started);
  let old_resume = Arc::clone(&resume);
  let old_handle = cache.get_or_fetch(k.clone(), move || {
    old_started.wait();
    old_resume.wait();
    Ok(image())
  });

  started.wait();
  cache.clear();

  // A fresh request for the same key registers a new flight after the clear.
  let second_runs = Arc::new(AtomicU64::new(0));
  let finish_second = Arc::new(Barrier::new(2));
  let counted = Arc::clone(&second_runs);
  let gate = Arc::clone(&finish_second);
  let new_handle = cache.get_or_fetch(k.clone(), move || {
    counted.fetch_add(1, Ordering::SeqCst);
    gate.wait();
    Ok(image())
  });

  // Let the pre-clear worker finish under its stale generation.
  resume.wait();
  assert!(matches!(old_handle.wait(), Err(Error::Cancelled)));
  thread::sleep(std::time::Duration::from_millis(100));

  // The stale result must not have been inserted into the cleared cache.
  assert!(!cache.contains(&k));

  // A third caller must join the surviving flight, not start its own fetch.
  let third_runs = Arc::new(AtomicU64::new(0));
  let counted = Arc::clone(&third_runs);
  let third_handle = cache.get_or_fetch(k.clone(), move || {
    counted.fetch_add(1, Ordering::SeqCst);
    Ok(image())
  });

  finish_second.wait();
  new_handle.wait().expect("post-clear flight completes");
  third_handle.wait().expect("joined flight completes");
  assert_eq!(second_runs.load(Ordering::SeqCst), 1);
  assert_eq!(third_runs.load(Ordering::SeqCst), 0, "third caller must piggyback");
}
