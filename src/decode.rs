//! Image decoding
//!
//! Static images decode through the `image` crate and are downscaled (never
//! upscaled) to fit a bounding box. GIFs go through the `gif` crate directly
//! so disposal-method compositing is explicit: each visible frame is the
//! running canvas with the frame's patch applied after honoring the previous
//! frame's disposal rule.
//!
//! Animated frames are stored PNG-encoded rather than as raw pixels so a
//! cached 200-frame entry stays small; the texture layer re-inflates them in
//! batches.

use crate::error::DecodeError;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use std::io::Cursor;

/// Hard cap on decoded animation frames.
pub const MAX_FRAMES: usize = 200;
/// Substitute for encoder-emitted near-zero delays that would flicker.
pub const DEFAULT_DELAY_MS: u32 = 100;
/// Delays below this threshold are treated as broken and replaced.
pub const MIN_DELAY_MS: u32 = 20;

/// A decoded image ready for texture realization.
///
/// `Animated` frames are full composited canvases (not patches), PNG-encoded,
/// with a parallel per-frame delay list. An animation that decodes to a
/// single frame is normalized to `Static`.
#[derive(Debug, Clone)]
pub enum DecodedImage {
  Static {
    pixels: RgbaImage,
  },
  Animated {
    /// PNG-encoded composited frames, in presentation order.
    frames: Vec<Vec<u8>>,
    /// Per-frame delay, parallel to `frames`.
    delays_ms: Vec<u32>,
    width: u32,
    height: u32,
  },
}

impl DecodedImage {
  pub fn width(&self) -> u32 {
    match self {
      Self::Static { pixels } => pixels.width(),
      Self::Animated { width, .. } => *width,
    }
  }

  pub fn height(&self) -> u32 {
    match self {
      Self::Static { pixels } => pixels.height(),
      Self::Animated { height, .. } => *height,
    }
  }

  pub fn frame_count(&self) -> usize {
    match self {
      Self::Static { .. } => 1,
      Self::Animated { frames, .. } => frames.len(),
    }
  }

  pub fn is_animated(&self) -> bool {
    matches!(self, Self::Animated { .. })
  }
}

/// Decode an image, downscaling to fit `max_width` x `max_height`.
///
/// A bounding dimension of `0` disables scaling. The format is sniffed from
/// the byte stream; extension and Content-Type are ignored since both lie in
/// practice.
pub fn decode_image(
  bytes: &[u8],
  max_width: u32,
  max_height: u32,
) -> Result<DecodedImage, DecodeError> {
  let format = image::guess_format(bytes).map_err(|_| DecodeError::UnsupportedFormat)?;
  if format == image::ImageFormat::Gif {
    return decode_gif(bytes, max_width, max_height);
  }
  decode_static(bytes, max_width, max_height)
}

fn decode_static(
  bytes: &[u8],
  max_width: u32,
  max_height: u32,
) -> Result<DecodedImage, DecodeError> {
  let img = image::load_from_memory(bytes).map_err(|err| match err {
    image::ImageError::Unsupported(_) => DecodeError::UnsupportedFormat,
    other => DecodeError::Malformed(other.to_string()),
  })?;

  let img = match scaled_dimensions(img.width(), img.height(), max_width, max_height) {
    Some((w, h)) => img.resize_exact(w, h, FilterType::Triangle),
    None => img,
  };

  Ok(DecodedImage::Static {
    pixels: img.to_rgba8(),
  })
}

/// Computes the downscaled size fitting the bounding box, preserving aspect
/// ratio. Returns `None` when no scaling is needed (including the degenerate
/// zero-box case); images are never upscaled.
fn scaled_dimensions(
  width: u32,
  height: u32,
  max_width: u32,
  max_height: u32,
) -> Option<(u32, u32)> {
  if max_width == 0 || max_height == 0 || width == 0 || height == 0 {
    return None;
  }
  let scale_x = max_width as f32 / width as f32;
  let scale_y = max_height as f32 / height as f32;
  let scale = scale_x.min(scale_y);
  if scale >= 1.0 {
    return None;
  }
  let w = ((width as f32 * scale) as u32).max(1);
  let h = ((height as f32 * scale) as u32).max(1);
  Some((w, h))
}

fn decode_gif(bytes: &[u8], max_width: u32, max_height: u32) -> Result<DecodedImage, DecodeError> {
  let mut options = gif::DecodeOptions::new();
  options.set_color_output(gif::ColorOutput::RGBA);
  let mut decoder = options
    .read_info(Cursor::new(bytes))
    .map_err(|e| DecodeError::Malformed(e.to_string()))?;

  let screen_width = decoder.width() as u32;
  let screen_height = decoder.height() as u32;

  let mut canvas: Option<RgbaImage> = None;
  let mut out_size: (u32, u32) = (0, 0);
  let mut frames: Vec<Vec<u8>> = Vec::new();
  let mut delays: Vec<u32> = Vec::new();
  let mut first_shot: Option<RgbaImage> = None;

  let mut prev_dispose = gif::DisposalMethod::Keep;
  let mut prev_rect: (u32, u32, u32, u32) = (0, 0, 0, 0);
  let mut prev_snapshot: Option<RgbaImage> = None;

  while frames.len() < MAX_FRAMES {
    let frame = match decoder.read_next_frame() {
      Ok(Some(frame)) => frame,
      Ok(None) => break,
      Err(err) => {
        if frames.is_empty() {
          return Err(DecodeError::Malformed(err.to_string()));
        }
        // A truncated tail still leaves a usable animation prefix.
        tracing::debug!(error = %err, "gif stream ended mid-frame");
        break;
      }
    };

    let canvas = canvas.get_or_insert_with(|| {
      // The logical screen is authoritative unless frame 0 overhangs it.
      let w = screen_width.max(frame.left as u32 + frame.width as u32).max(1);
      let h = screen_height.max(frame.top as u32 + frame.height as u32).max(1);
      RgbaImage::new(w, h)
    });

    // Apply the previous frame's disposal before drawing this one.
    if !frames.is_empty() {
      match prev_dispose {
        gif::DisposalMethod::Background => {
          clear_rect(canvas, prev_rect);
        }
        gif::DisposalMethod::Previous => {
          if let Some(snapshot) = &prev_snapshot {
            canvas.clone_from(snapshot);
          }
        }
        gif::DisposalMethod::Keep | gif::DisposalMethod::Any => {}
      }
    }

    // Snapshot is taken before drawing, so Previous restores the pre-draw state.
    if frame.dispose == gif::DisposalMethod::Previous {
      prev_snapshot = Some(canvas.clone());
    }

    composite_patch(canvas, frame);

    let delay_ms = frame.delay as u32 * 10;
    delays.push(if delay_ms < MIN_DELAY_MS {
      DEFAULT_DELAY_MS
    } else {
      delay_ms
    });

    let shot = match scaled_dimensions(canvas.width(), canvas.height(), max_width, max_height) {
      Some((w, h)) => imageops::resize(canvas, w, h, FilterType::Triangle),
      None => canvas.clone(),
    };
    out_size = (shot.width(), shot.height());
    if frames.is_empty() {
      first_shot = Some(shot.clone());
    } else {
      first_shot = None;
    }
    frames.push(encode_png(&shot)?);

    prev_dispose = frame.dispose;
    prev_rect = (
      frame.left as u32,
      frame.top as u32,
      frame.width as u32,
      frame.height as u32,
    );
  }

  if frames.is_empty() {
    return Err(DecodeError::NoFrames);
  }
  if frames.len() == 1 {
    // first_shot is always present when exactly one frame decoded
    let pixels = first_shot.ok_or(DecodeError::NoFrames)?;
    return Ok(DecodedImage::Static { pixels });
  }

  Ok(DecodedImage::Animated {
    frames,
    delays_ms: delays,
    width: out_size.0,
    height: out_size.1,
  })
}

/// Copies the frame's patch onto the canvas at its declared offset.
///
/// GIF alpha is 1-bit: transparent patch pixels leave the canvas untouched,
/// everything else overwrites.
fn composite_patch(canvas: &mut RgbaImage, frame: &gif::Frame<'_>) {
  let left = frame.left as u32;
  let top = frame.top as u32;
  let patch_width = frame.width as u32;
  let patch_height = frame.height as u32;

  for y in 0..patch_height {
    let cy = top + y;
    if cy >= canvas.height() {
      break;
    }
    for x in 0..patch_width {
      let cx = left + x;
      if cx >= canvas.width() {
        break;
      }
      let idx = ((y * patch_width + x) * 4) as usize;
      let px = &frame.buffer[idx..idx + 4];
      if px[3] != 0 {
        canvas.put_pixel(cx, cy, image::Rgba([px[0], px[1], px[2], px[3]]));
      }
    }
  }
}

fn clear_rect(canvas: &mut RgbaImage, rect: (u32, u32, u32, u32)) {
  let (left, top, width, height) = rect;
  for y in top..(top + height).min(canvas.height()) {
    for x in left..(left + width).min(canvas.width()) {
      canvas.put_pixel(x, y, image::Rgba([0, 0, 0, 0]));
    }
  }
}

/// PNG-encode a composited frame for compact storage in the result cache.
pub fn encode_png(pixels: &RgbaImage) -> Result<Vec<u8>, DecodeError> {
  let mut out = Vec::new();
  PngEncoder::new(&mut out)
    .write_image(
      pixels.as_raw(),
      pixels.width(),
      pixels.height(),
      ExtendedColorType::Rgba8,
    )
    .map_err(|e| DecodeError::Malformed(format!("png encode: {e}")))?;
  Ok(out)
}

/// Inflate a PNG-encoded frame back to pixels for texture upload.
pub fn decode_png_frame(bytes: &[u8]) -> Result<RgbaImage, DecodeError> {
  let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
    .map_err(|e| DecodeError::Malformed(format!("png frame: {e}")))?;
  Ok(img.to_rgba8())
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
      .write_to(&mut cursor, image::ImageFormat::Png)
      .expect("encode png");
    cursor.into_inner()
  }

  fn single_frame_gif(width: u16, height: u16) -> Vec<u8> {
    let mut out = Vec::new();
    {
      let mut encoder = gif::Encoder::new(&mut out, width, height, &[]).unwrap();
      let pixels = vec![200u8, 50, 50, 255].repeat(width as usize * height as usize);
      let frame = gif::Frame::from_rgba(width, height, &mut pixels.clone());
      encoder.write_frame(&frame).unwrap();
    }
    out
  }

  #[test]
  fn scaled_dimensions_preserves_aspect() {
    assert_eq!(scaled_dimensions(400, 200, 100, 100), Some((100, 50)));
    assert_eq!(scaled_dimensions(200, 400, 100, 100), Some((50, 100)));
  }

  #[test]
  fn scaled_dimensions_never_upscales() {
    assert_eq!(scaled_dimensions(50, 50, 100, 100), None);
    assert_eq!(scaled_dimensions(100, 100, 100, 100), None);
  }

  #[test]
  fn zero_box_disables_scaling() {
    assert_eq!(scaled_dimensions(4000, 4000, 0, 0), None);
  }

  #[test]
  fn static_decode_keeps_small_image() {
    let decoded = decode_image(&png_bytes(8, 4, [1, 2, 3, 255]), 100, 100).unwrap();
    assert!(!decoded.is_animated());
    assert_eq!((decoded.width(), decoded.height()), (8, 4));
  }

  #[test]
  fn static_decode_downscales_to_box() {
    let decoded = decode_image(&png_bytes(200, 100, [9, 9, 9, 255]), 50, 50).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (50, 25));
  }

  #[test]
  fn garbage_bytes_are_unsupported() {
    let err = decode_image(b"not an image at all", 0, 0).unwrap_err();
    assert_eq!(err, DecodeError::UnsupportedFormat);
  }

  #[test]
  fn one_frame_gif_normalizes_to_static() {
    let decoded = decode_image(&single_frame_gif(6, 6), 0, 0).unwrap();
    assert!(!decoded.is_animated());
    assert_eq!((decoded.width(), decoded.height()), (6, 6));
  }

  #[test]
  fn short_delays_are_replaced() {
    let mut out = Vec::new();
    {
      let mut encoder = gif::Encoder::new(&mut out, 2, 2, &[]).unwrap();
      for delay_cs in [0u16, 1, 5, 10] {
        let mut pixels = vec![0u8, 0, 0, 255].repeat(4);
        let mut frame = gif::Frame::from_rgba(2, 2, &mut pixels);
        frame.delay = delay_cs;
        encoder.write_frame(&frame).unwrap();
      }
    }
    let decoded = decode_image(&out, 0, 0).unwrap();
    match decoded {
      DecodedImage::Animated { delays_ms, .. } => {
        // 0cs, 1cs -> below 20ms threshold -> 100ms; 5cs=50ms, 10cs=100ms kept
        assert_eq!(delays_ms, vec![100, 100, 50, 100]);
      }
      other => panic!("expected animated, got {other:?}"),
    }
  }

  #[test]
  fn png_frame_round_trip() {
    let img = RgbaImage::from_pixel(3, 3, Rgba([10, 20, 30, 255]));
    let encoded = encode_png(&img).unwrap();
    let back = decode_png_frame(&encoded).unwrap();
    assert_eq!(back, img);
  }
}
