//! Asynchronous image fetch, decode, cache, and texture pipeline for chat
//! hover previews.
//!
//! The host hands in a [`TextureBackend`] and a [`RenderScheduler`] modelling
//! its render thread; everything else (SSRF-guarded fetching, embed
//! resolution, GIF compositing, LRU caching with failure cooldown, batched
//! texture registration) lives here. [`ImagePreview`] is the front door.

pub mod animate;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod resolve;
pub mod texture;

pub use cache::{FetchKey, LoadHandle, ResultCache, SystemClock, TextureSink, TimeSource};
pub use config::{ConfigProvider, PreviewConfig, WhitelistEntry};
pub use decode::DecodedImage;
pub use error::{DecodeError, Error, FetchError, Result};
pub use fetch::HttpFetcher;
pub use pipeline::ImagePreview;
pub use resolve::{EmbedResolver, UrlResolver};
pub use texture::{
  ImmediateScheduler, QueuedScheduler, RenderScheduler, RenderableFrame, TextureBackend,
  TextureId, TextureStore,
};
