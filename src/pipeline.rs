//! Front door
//!
//! `ImagePreview` wires the whole pipeline together: config gate, embed
//! resolution, bounded fetch, decode, result cache, and texture residency.
//! Hosts call [`ImagePreview::request`] when a previewable link is hovered
//! and [`ImagePreview::frame`] every render tick.

use crate::cache::{FetchKey, LoadHandle, ResultCache, SystemClock, TextureSink, TimeSource};
use crate::config::ConfigProvider;
use crate::error::{Error, FetchError, Result};
use crate::fetch::HttpFetcher;
use crate::resolve::EmbedResolver;
use crate::texture::{RenderScheduler, RenderableFrame, TextureBackend, TextureStore};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::thread;
use url::Url;

/// True if the URL's tail names an image file directly (query and fragment
/// tails allowed after the extension).
pub fn is_direct_image_url(url: &str) -> bool {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  let pattern = PATTERN.get_or_init(|| {
    Regex::new("(?i)\\.(png|jpe?g|gif|webp)([?#][^\\s]*)?$")
      .unwrap_or_else(|err| panic!("invalid direct image regex: {err}"))
  });
  pattern.is_match(url)
}

pub struct ImagePreview {
  config: Arc<ConfigProvider>,
  fetcher: Arc<HttpFetcher>,
  resolver: Arc<EmbedResolver>,
  cache: Arc<ResultCache>,
  textures: Arc<TextureStore>,
}

impl ImagePreview {
  pub fn new(
    config: Arc<ConfigProvider>,
    backend: Arc<dyn TextureBackend>,
    scheduler: Arc<dyn RenderScheduler>,
  ) -> Self {
    Self::with_clock(config, backend, scheduler, Arc::new(SystemClock))
  }

  pub fn with_clock(
    config: Arc<ConfigProvider>,
    backend: Arc<dyn TextureBackend>,
    scheduler: Arc<dyn RenderScheduler>,
    clock: Arc<dyn TimeSource>,
  ) -> Self {
    Self::with_fetcher(config, Arc::new(HttpFetcher::new()), backend, scheduler, clock)
  }

  pub fn with_fetcher(
    config: Arc<ConfigProvider>,
    fetcher: Arc<HttpFetcher>,
    backend: Arc<dyn TextureBackend>,
    scheduler: Arc<dyn RenderScheduler>,
    clock: Arc<dyn TimeSource>,
  ) -> Self {
    let resolver = Arc::new(EmbedResolver::with_clock(
      Arc::clone(&fetcher),
      Arc::clone(&clock),
    ));
    let cache = Arc::new(ResultCache::with_clock(Arc::clone(&clock)));
    let textures = Arc::new(TextureStore::with_clock(backend, scheduler, clock));
    cache.set_sink(Arc::clone(&textures) as Arc<dyn TextureSink>);
    Self {
      config,
      fetcher,
      resolver,
      cache,
      textures,
    }
  }

  /// Start (or join) a load for `url`, decoded to fit `max_width` x
  /// `max_height`. On success textures are realized automatically.
  ///
  /// The config gate runs against the live config on every call; a whitelist
  /// change applies to the next request immediately.
  pub fn request(&self, url: &str, max_width: u32, max_height: u32) -> Result<LoadHandle> {
    let config = self.config.snapshot();
    if !config.enabled {
      return Err(Error::Disabled);
    }
    let host = host_of(url)?;
    let entry = config
      .entry_for(&host)
      .ok_or(Error::DomainNotWhitelisted { host })?;

    let direct = is_direct_image_url(url);
    if !direct && !entry.resolve_embed {
      return Err(Error::ResolutionFailed {
        url: url.to_string(),
      });
    }

    let key = FetchKey::new(url, max_width, max_height);

    // Cache hit whose textures were evicted: bring them back. Realization
    // inflates pixels, so it runs on a background thread like any other
    // load; request() itself never does decode work.
    if let Some(image) = self.cache.get(&key) {
      if !self.textures.contains(&key) {
        let textures = Arc::clone(&self.textures);
        let realize_key = key.clone();
        thread::spawn(move || textures.realize(&realize_key, &image));
      }
    }

    let fetcher = Arc::clone(&self.fetcher);
    let resolver = Arc::clone(&self.resolver);
    let provider = Arc::clone(&self.config);
    let fetch_url = url.to_string();
    Ok(self.cache.get_or_fetch(key, move || {
      let target = if direct {
        fetch_url.clone()
      } else {
        resolver
          .resolve(&fetch_url)
          .ok_or_else(|| Error::ResolutionFailed {
            url: fetch_url.clone(),
          })?
      };
      // Re-gate against the config as it is now, and against the resolved
      // URL's host rather than the page's.
      let config = provider.snapshot();
      if !config.enabled {
        return Err(Error::Disabled);
      }
      let host = host_of(&target)?;
      if !config.is_whitelisted(&host) {
        return Err(Error::DomainNotWhitelisted { host });
      }
      let bytes = fetcher.fetch_image(&target, config.max_bytes() as u64)?;
      let image = crate::decode::decode_image(&bytes, max_width, max_height)?;
      Ok(image)
    }))
  }

  /// Render-time read: the frame to draw for `url` right now, if its
  /// textures are resident.
  pub fn frame(
    &self,
    url: &str,
    max_width: u32,
    max_height: u32,
    now_ms: u64,
  ) -> Option<RenderableFrame> {
    self
      .textures
      .get(&FetchKey::new(url, max_width, max_height), now_ms)
  }

  /// The user-visible reason the last load of `url` failed, while its
  /// cooldown is live.
  pub fn failure_reason(&self, url: &str, max_width: u32, max_height: u32) -> Option<String> {
    self
      .cache
      .failure_reason(&FetchKey::new(url, max_width, max_height))
  }

  /// Drop all cached results, resolver entries, and textures.
  pub fn clear(&self) {
    self.cache.clear();
    self.resolver.clear();
    self.textures.clear_all();
  }

  pub fn cache(&self) -> &Arc<ResultCache> {
    &self.cache
  }

  pub fn textures(&self) -> &Arc<TextureStore> {
    &self.textures
  }
}

fn host_of(url: &str) -> Result<String> {
  let parsed =
    Url::parse(url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
  match parsed.host_str() {
    Some(host) => Ok(host.to_ascii_lowercase()),
    None => Err(FetchError::InvalidUrl("missing host".to_string()).into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn direct_image_urls() {
    assert!(is_direct_image_url("https://i.imgur.com/abc.png"));
    assert!(is_direct_image_url("https://cdn.example/a.JPEG"));
    assert!(is_direct_image_url("https://cdn.example/a.gif?frame=1"));
    assert!(is_direct_image_url("https://cdn.example/a.webp#section"));
    assert!(!is_direct_image_url("https://imgur.com/abc"));
    assert!(!is_direct_image_url("https://cdn.example/a.png/page"));
    assert!(!is_direct_image_url("https://cdn.example/a.svg"));
  }
}
