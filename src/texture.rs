//! Texture lifecycle
//!
//! Bridges decoded images to renderer-owned texture handles. The renderer's
//! texture objects may only be created and destroyed on its owning thread, so
//! all backend calls are marshalled through a [`RenderScheduler`]; pixel work
//! (PNG inflation of animation frames) stays on background threads.
//!
//! Animated entries are registered in batches so a long GIF shows its first
//! frames while the rest are still inflating. A global handle cap bounds GPU
//! residency; going over it evicts whole entries, oldest static entries
//! first.

use crate::animate::current_frame_index;
use crate::cache::{FetchKey, SystemClock, TextureSink, TimeSource};
use crate::decode::{decode_png_frame, DecodedImage};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Maximum realized texture handles across all entries.
pub const TEXTURE_CAP: usize = 50;
/// Frames registered per scheduled batch.
pub const GIF_BATCH_SIZE: usize = 8;
/// Animations longer than this are truncated before registration so one GIF
/// cannot monopolize the handle budget.
pub const MAX_GIF_FRAMES: usize = TEXTURE_CAP / 2;

/// Opaque renderer texture handle.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct TextureId(pub u64);

/// Creates and destroys renderer textures. Both calls happen only inside
/// tasks run by the [`RenderScheduler`].
pub trait TextureBackend: Send + Sync {
  fn create(&self, width: u32, height: u32, rgba: &[u8]) -> TextureId;
  fn release(&self, id: TextureId);
}

/// Marshals a task onto the renderer's owning thread.
///
/// Implementations must run tasks in submission order (FIFO). Animated
/// registration relies on this: batches are submitted in increasing frame
/// order, and a later batch registering before an earlier one would let the
/// animator skip ahead of frames that were decoded first.
pub trait RenderScheduler: Send + Sync {
  fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs tasks inline on the calling thread. For hosts that call into the
/// pipeline from the owner thread already, and for tests.
#[derive(Default)]
pub struct ImmediateScheduler;

impl RenderScheduler for ImmediateScheduler {
  fn execute(&self, task: Box<dyn FnOnce() + Send>) {
    task();
  }
}

/// Queues tasks for a host-driven pump. The host calls
/// [`QueuedScheduler::run_pending`] once per frame from the owner thread.
#[derive(Default)]
pub struct QueuedScheduler {
  queue: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl QueuedScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Runs every queued task, in submission order.
  pub fn run_pending(&self) {
    loop {
      let batch: Vec<_> = match self.queue.lock() {
        Ok(mut queue) => queue.drain(..).collect(),
        Err(_) => return,
      };
      if batch.is_empty() {
        return;
      }
      for task in batch {
        task();
      }
    }
  }

  pub fn pending_len(&self) -> usize {
    self.queue.lock().map(|q| q.len()).unwrap_or(0)
  }
}

impl RenderScheduler for QueuedScheduler {
  fn execute(&self, task: Box<dyn FnOnce() + Send>) {
    if let Ok(mut queue) = self.queue.lock() {
      queue.push(task);
    }
  }
}

/// What the render layer draws for a key right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderableFrame {
  pub texture: TextureId,
  pub width: u32,
  pub height: u32,
}

enum EntryKind {
  Static {
    texture: Option<TextureId>,
  },
  Animated {
    delays_ms: Vec<u32>,
    /// Parallel to `delays_ms`; `None` until the frame's batch registers.
    frames: Vec<Option<TextureId>>,
    start_ms: u64,
  },
}

struct Entry {
  seq: u64,
  width: u32,
  height: u32,
  kind: EntryKind,
}

impl Entry {
  fn realized_handles(&self) -> usize {
    match &self.kind {
      EntryKind::Static { texture } => usize::from(texture.is_some()),
      EntryKind::Animated { frames, .. } => frames.iter().filter(|f| f.is_some()).count(),
    }
  }

  fn drain_handles(&mut self) -> Vec<TextureId> {
    match &mut self.kind {
      EntryKind::Static { texture } => texture.take().into_iter().collect(),
      EntryKind::Animated { frames, .. } => frames.iter_mut().filter_map(Option::take).collect(),
    }
  }

  fn is_static(&self) -> bool {
    matches!(self.kind, EntryKind::Static { .. })
  }
}

struct StoreInner {
  backend: Arc<dyn TextureBackend>,
  scheduler: Arc<dyn RenderScheduler>,
  clock: Arc<dyn TimeSource>,
  entries: Mutex<HashMap<FetchKey, Entry>>,
  next_seq: AtomicU64,
  generation: AtomicU64,
  cap: usize,
}

impl StoreInner {
  /// Owner-context only. Evicts whole entries until the realized-handle total
  /// fits the cap, oldest static entries first, then oldest animated.
  /// `protect` (the entry being registered) is never the victim.
  fn enforce_cap(&self, protect: &FetchKey) {
    loop {
      let handles = {
        let mut entries = match self.entries.lock() {
          Ok(entries) => entries,
          Err(_) => return,
        };
        let total: usize = entries.values().map(Entry::realized_handles).sum();
        if total <= self.cap {
          return;
        }
        let victim = entries
          .iter()
          .filter(|(key, _)| *key != protect)
          .min_by_key(|(_, entry)| (!entry.is_static(), entry.seq))
          .map(|(key, _)| key.clone());
        match victim {
          Some(key) => {
            tracing::debug!(key = %key, "evicting textures over cap");
            match entries.remove(&key) {
              Some(mut entry) => entry.drain_handles(),
              None => return,
            }
          }
          None => return,
        }
      };
      for handle in handles {
        self.backend.release(handle);
      }
    }
  }

  /// Owner-context only. Registers one decoded batch of animation frames,
  /// skipping work if the entry was evicted or the store cleared meanwhile.
  fn register_animated_batch(
    &self,
    key: &FetchKey,
    first_index: usize,
    batch: Vec<RgbaImage>,
    generation: u64,
  ) {
    if self.generation.load(Ordering::SeqCst) != generation {
      return;
    }
    let mut created = Vec::with_capacity(batch.len());
    for pixels in &batch {
      created.push(
        self
          .backend
          .create(pixels.width(), pixels.height(), pixels.as_raw()),
      );
    }
    let orphaned = {
      let mut entries = match self.entries.lock() {
        Ok(entries) => entries,
        Err(_) => return,
      };
      match entries.get_mut(key) {
        Some(Entry {
          kind: EntryKind::Animated { frames, .. },
          ..
        }) => {
          for (offset, id) in created.iter().enumerate() {
            if let Some(slot) = frames.get_mut(first_index + offset) {
              *slot = Some(*id);
            }
          }
          Vec::new()
        }
        // Entry evicted while the batch was decoding; the handles we just
        // created have no home.
        _ => created,
      }
    };
    for handle in orphaned {
      self.backend.release(handle);
    }
    self.enforce_cap(key);
  }

  fn entry_alive(&self, key: &FetchKey, generation: u64) -> bool {
    if self.generation.load(Ordering::SeqCst) != generation {
      return false;
    }
    self
      .entries
      .lock()
      .map(|entries| entries.contains_key(key))
      .unwrap_or(false)
  }
}

/// Texture residency manager. Implements [`TextureSink`] so the result cache
/// can drive realization and release directly.
pub struct TextureStore {
  inner: Arc<StoreInner>,
}

impl TextureStore {
  pub fn new(backend: Arc<dyn TextureBackend>, scheduler: Arc<dyn RenderScheduler>) -> Self {
    Self::with_clock(backend, scheduler, Arc::new(SystemClock))
  }

  pub fn with_clock(
    backend: Arc<dyn TextureBackend>,
    scheduler: Arc<dyn RenderScheduler>,
    clock: Arc<dyn TimeSource>,
  ) -> Self {
    Self::with_cap(backend, scheduler, clock, TEXTURE_CAP)
  }

  pub fn with_cap(
    backend: Arc<dyn TextureBackend>,
    scheduler: Arc<dyn RenderScheduler>,
    clock: Arc<dyn TimeSource>,
    cap: usize,
  ) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        backend,
        scheduler,
        clock,
        entries: Mutex::new(HashMap::new()),
        next_seq: AtomicU64::new(0),
        generation: AtomicU64::new(0),
        cap,
      }),
    }
  }

  /// Realize textures for a decoded image. Called from a background load
  /// thread; registration is scheduled onto the owner context.
  pub fn realize(&self, key: &FetchKey, image: &DecodedImage) {
    match image {
      DecodedImage::Static { pixels } => self.realize_static(key, pixels.clone()),
      DecodedImage::Animated {
        frames,
        delays_ms,
        width,
        height,
      } => self.realize_animated(key, frames, delays_ms, *width, *height),
    }
  }

  /// The frame to draw for `key` at `now_ms`, if any is realized yet.
  pub fn get(&self, key: &FetchKey, now_ms: u64) -> Option<RenderableFrame> {
    let entries = self.inner.entries.lock().ok()?;
    let entry = entries.get(key)?;
    match &entry.kind {
      EntryKind::Static { texture } => texture.map(|texture| RenderableFrame {
        texture,
        width: entry.width,
        height: entry.height,
      }),
      EntryKind::Animated {
        delays_ms,
        frames,
        start_ms,
      } => {
        let loaded: Vec<bool> = frames.iter().map(Option::is_some).collect();
        let index = current_frame_index(*start_ms, delays_ms, &loaded, now_ms)?;
        frames.get(index).copied().flatten().map(|texture| RenderableFrame {
          texture,
          width: entry.width,
          height: entry.height,
        })
      }
    }
  }

  /// True if `key` has an entry (realized or still registering).
  pub fn contains(&self, key: &FetchKey) -> bool {
    self
      .inner
      .entries
      .lock()
      .map(|entries| entries.contains_key(key))
      .unwrap_or(false)
  }

  /// Total realized handles, across all entries.
  pub fn realized_handles(&self) -> usize {
    self
      .inner
      .entries
      .lock()
      .map(|entries| entries.values().map(Entry::realized_handles).sum())
      .unwrap_or(0)
  }

  /// Drop `key`'s entry and release its handles on the owner context.
  pub fn release(&self, key: &FetchKey) {
    let removed = self
      .inner
      .entries
      .lock()
      .ok()
      .and_then(|mut entries| entries.remove(key));
    if let Some(mut entry) = removed {
      let handles = entry.drain_handles();
      if handles.is_empty() {
        return;
      }
      let inner = Arc::clone(&self.inner);
      self.inner.scheduler.execute(Box::new(move || {
        for handle in handles {
          inner.backend.release(handle);
        }
      }));
    }
  }

  /// Drop everything. In-flight registration work from before the clear is
  /// discarded when it reaches the owner context.
  pub fn clear_all(&self) {
    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    let handles: Vec<TextureId> = self
      .inner
      .entries
      .lock()
      .map(|mut entries| {
        entries
          .drain()
          .flat_map(|(_, mut entry)| entry.drain_handles())
          .collect()
      })
      .unwrap_or_default();
    if handles.is_empty() {
      return;
    }
    let inner = Arc::clone(&self.inner);
    self.inner.scheduler.execute(Box::new(move || {
      for handle in handles {
        inner.backend.release(handle);
      }
    }));
  }

  fn realize_static(&self, key: &FetchKey, pixels: RgbaImage) {
    let inner = Arc::clone(&self.inner);
    let key = key.clone();
    let generation = self.inner.generation.load(Ordering::SeqCst);
    self.inner.scheduler.execute(Box::new(move || {
      if inner.generation.load(Ordering::SeqCst) != generation {
        return;
      }
      {
        let entries = match inner.entries.lock() {
          Ok(entries) => entries,
          Err(_) => return,
        };
        // A concurrent load already registered this key.
        if entries.contains_key(&key) {
          return;
        }
      }
      let texture = inner
        .backend
        .create(pixels.width(), pixels.height(), pixels.as_raw());
      if let Ok(mut entries) = inner.entries.lock() {
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        entries.insert(
          key.clone(),
          Entry {
            seq,
            width: pixels.width(),
            height: pixels.height(),
            kind: EntryKind::Static {
              texture: Some(texture),
            },
          },
        );
      }
      inner.enforce_cap(&key);
    }));
  }

  fn realize_animated(
    &self,
    key: &FetchKey,
    encoded_frames: &[Vec<u8>],
    delays_ms: &[u32],
    width: u32,
    height: u32,
  ) {
    let count = encoded_frames.len().min(MAX_GIF_FRAMES);
    if count < encoded_frames.len() {
      tracing::debug!(
        key = %key,
        frames = encoded_frames.len(),
        kept = count,
        "truncating long animation"
      );
    }
    let encoded: Vec<Vec<u8>> = encoded_frames[..count].to_vec();
    let delays: Vec<u32> = delays_ms[..count].to_vec();
    let generation = self.inner.generation.load(Ordering::SeqCst);

    {
      let mut entries = match self.inner.entries.lock() {
        Ok(entries) => entries,
        Err(_) => return,
      };
      if entries.contains_key(key) {
        return;
      }
      let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
      entries.insert(
        key.clone(),
        Entry {
          seq,
          width,
          height,
          kind: EntryKind::Animated {
            delays_ms: delays,
            frames: vec![None; count],
            start_ms: self.inner.clock.now_ms(),
          },
        },
      );
    }

    // First batch inflates here so frame 0 is drawable as soon as the owner
    // context runs the registration task.
    let first_len = count.min(GIF_BATCH_SIZE);
    let first_batch = inflate_batch(&encoded[..first_len]);
    if !first_batch.is_empty() {
      let inner = Arc::clone(&self.inner);
      let batch_key = key.clone();
      self.inner.scheduler.execute(Box::new(move || {
        inner.register_animated_batch(&batch_key, 0, first_batch, generation);
      }));
    }

    if first_len == count {
      return;
    }

    let inner = Arc::clone(&self.inner);
    let key = key.clone();
    thread::spawn(move || {
      let mut index = first_len;
      while index < count {
        if !inner.entry_alive(&key, generation) {
          return;
        }
        let end = (index + GIF_BATCH_SIZE).min(count);
        let batch = inflate_batch(&encoded[index..end]);
        if batch.is_empty() {
          return;
        }
        let batch_inner = Arc::clone(&inner);
        let batch_key = key.clone();
        inner.scheduler.execute(Box::new(move || {
          batch_inner.register_animated_batch(&batch_key, index, batch, generation);
        }));
        index = end;
      }
    });
  }
}

impl TextureSink for TextureStore {
  fn realize(&self, key: &FetchKey, image: &Arc<DecodedImage>) {
    TextureStore::realize(self, key, image);
  }

  fn release(&self, key: &FetchKey) {
    TextureStore::release(self, key);
  }
}

fn inflate_batch(encoded: &[Vec<u8>]) -> Vec<RgbaImage> {
  let mut out = Vec::with_capacity(encoded.len());
  for bytes in encoded {
    match decode_png_frame(bytes) {
      Ok(pixels) => out.push(pixels),
      Err(err) => {
        tracing::warn!(error = %err, "stored animation frame failed to inflate");
        return out;
      }
    }
  }
  out
}
