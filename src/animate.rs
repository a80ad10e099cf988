//! Frame-time animation
//!
//! Pure frame selection for looping animations whose frames may still be
//! loading. Callers pass the wall-clock start of the animation, the per-frame
//! delays, and a loaded-mask; no state is kept here.

/// Returns the frame index that should be visible at `now_ms`.
///
/// The owning index is found by wrapping elapsed time over the total duration
/// and scanning cumulative delays. If that frame is not loaded yet, the
/// nearest loaded neighbor is used instead, searching backward first so a
/// partially loaded animation holds its last decoded frame rather than
/// jumping ahead. Returns `None` only when no frame is loaded at all.
pub fn current_frame_index(
  start_ms: u64,
  delays_ms: &[u32],
  loaded: &[bool],
  now_ms: u64,
) -> Option<usize> {
  if delays_ms.is_empty() || loaded.len() != delays_ms.len() {
    return None;
  }

  let total: u64 = delays_ms.iter().map(|&d| d as u64).sum();
  if total == 0 {
    // Degenerate all-zero delays: pin to frame 0.
    return nearest_loaded(loaded, 0);
  }

  let elapsed = now_ms.saturating_sub(start_ms);
  let looped = elapsed % total;

  let mut accumulator: u64 = 0;
  for (i, &delay) in delays_ms.iter().enumerate() {
    accumulator += delay as u64;
    if looped < accumulator {
      return nearest_loaded(loaded, i);
    }
  }

  nearest_loaded(loaded, delays_ms.len() - 1)
}

fn nearest_loaded(loaded: &[bool], target: usize) -> Option<usize> {
  if loaded[target] {
    return Some(target);
  }
  for i in (0..target).rev() {
    if loaded[i] {
      return Some(i);
    }
  }
  for (i, &is_loaded) in loaded.iter().enumerate().skip(target + 1) {
    if is_loaded {
      return Some(i);
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  const DELAYS: [u32; 3] = [100, 100, 100];

  #[test]
  fn selects_frame_by_elapsed_time() {
    let loaded = [true, true, true];
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 0), Some(0));
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 99), Some(0));
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 100), Some(1));
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 250), Some(2));
  }

  #[test]
  fn wraps_at_exactly_one_period() {
    let loaded = [true, true, true];
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 300), Some(0));
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 650), Some(0));
  }

  #[test]
  fn honors_nonzero_start_time() {
    let loaded = [true, true, true];
    assert_eq!(current_frame_index(1000, &DELAYS, &loaded, 1150), Some(1));
    // now before start clamps to elapsed zero
    assert_eq!(current_frame_index(1000, &DELAYS, &loaded, 500), Some(0));
  }

  #[test]
  fn falls_back_to_nearest_loaded_frame() {
    let loaded = [true, true, false];
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 250), Some(1));

    let loaded = [false, false, true];
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 10), Some(2));
  }

  #[test]
  fn nothing_loaded_yields_none() {
    let loaded = [false, false, false];
    assert_eq!(current_frame_index(0, &DELAYS, &loaded, 123), None);
  }

  #[test]
  fn zero_total_duration_pins_frame_zero() {
    let delays = [0u32, 0, 0];
    let loaded = [true, true, true];
    assert_eq!(current_frame_index(0, &delays, &loaded, 99999), Some(0));

    let loaded = [false, true, true];
    assert_eq!(current_frame_index(0, &delays, &loaded, 99999), Some(1));
  }

  #[test]
  fn mismatched_masks_are_rejected() {
    assert_eq!(current_frame_index(0, &DELAYS, &[true, true], 0), None);
    assert_eq!(current_frame_index(0, &[], &[], 0), None);
  }
}
