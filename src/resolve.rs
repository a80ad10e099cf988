//! Embed URL resolution
//!
//! Turns page URLs (an imgur post, a giphy page, a tweet-style share link)
//! into direct image URLs. Known hosts get cheap pattern rewrites; everything
//! else falls back to scraping `og:image` out of a bounded HTML prefix. The
//! chain is ordered and first-match-wins: a resolver that claims a URL but
//! fails to resolve it does NOT fall through to the generic scraper.

use crate::cache::{SystemClock, TimeSource};
use crate::fetch::HttpFetcher;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use url::Url;

/// How much of a page is read when scraping for `og:image`.
pub const SCRAPE_PREFIX_BYTES: usize = 32 * 1024;
/// Failed resolutions are not retried for this long.
pub const RESOLVE_FAILURE_COOLDOWN_MS: u64 = 60_000;

fn regex(pattern: &'static str, desc: &'static str) -> Regex {
  Regex::new(pattern).unwrap_or_else(|err| panic!("invalid {desc} regex: {err}"))
}

/// One strategy for mapping a page URL to a direct image URL.
///
/// `resolve` may perform network I/O; never call it on the owner context.
pub trait UrlResolver: Send + Sync {
  /// Whether this resolver claims `url`. Claiming is final: if a claiming
  /// resolver returns `None` from [`UrlResolver::resolve`], the URL is
  /// unresolvable.
  fn is_resolvable(&self, url: &Url) -> bool;

  fn resolve(&self, url: &Url, fetcher: &HttpFetcher) -> Option<String>;
}

fn host_is(url: &Url, domain: &str) -> bool {
  match url.host_str() {
    Some(host) => {
      let host = host.to_ascii_lowercase();
      host == domain || host == format!("www.{domain}")
    }
    None => false,
  }
}

/// `imgur.com/{id}` → `i.imgur.com/{id}.jpg`. Albums and galleries have no
/// single image to point at and are skipped.
pub struct ImgurResolver;

impl UrlResolver for ImgurResolver {
  fn is_resolvable(&self, url: &Url) -> bool {
    host_is(url, "imgur.com")
  }

  fn resolve(&self, url: &Url, _fetcher: &HttpFetcher) -> Option<String> {
    static ID: OnceLock<Regex> = OnceLock::new();
    let id = ID.get_or_init(|| regex("^/([A-Za-z0-9]{5,})$", "imgur id"));
    let path = url.path();
    if path.starts_with("/a/") || path.starts_with("/gallery/") {
      return None;
    }
    let caps = id.captures(path)?;
    Some(format!("https://i.imgur.com/{}.jpg", &caps[1]))
  }
}

/// `giphy.com/gifs/{slug}-{id}` → `media.giphy.com/media/{id}/giphy.gif`.
/// The id is the last hyphen-separated token of the slug.
pub struct GiphyResolver;

impl UrlResolver for GiphyResolver {
  fn is_resolvable(&self, url: &Url) -> bool {
    host_is(url, "giphy.com")
  }

  fn resolve(&self, url: &Url, _fetcher: &HttpFetcher) -> Option<String> {
    static ID: OnceLock<Regex> = OnceLock::new();
    let id = ID.get_or_init(|| regex("^/gifs/(?:[^/]*-)?([A-Za-z0-9]+)$", "giphy id"));
    let caps = id.captures(url.path())?;
    Some(format!("https://media.giphy.com/media/{}/giphy.gif", &caps[1]))
  }
}

/// Tenor view pages carry the gif URL in `og:image`.
pub struct TenorResolver;

impl UrlResolver for TenorResolver {
  fn is_resolvable(&self, url: &Url) -> bool {
    host_is(url, "tenor.com") && url.path().starts_with("/view/")
  }

  fn resolve(&self, url: &Url, fetcher: &HttpFetcher) -> Option<String> {
    scrape_og_image(url, fetcher)
  }
}

/// Last-chance resolver: scrape `og:image` from any http(s) page.
pub struct OpenGraphResolver;

impl UrlResolver for OpenGraphResolver {
  fn is_resolvable(&self, url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
  }

  fn resolve(&self, url: &Url, fetcher: &HttpFetcher) -> Option<String> {
    scrape_og_image(url, fetcher)
  }
}

/// Extracts `og:image` meta content from `html`. Both attribute orders are
/// accepted; matching is case-insensitive.
pub fn extract_og_image(html: &str) -> Option<String> {
  static PROP_FIRST: OnceLock<Regex> = OnceLock::new();
  static CONTENT_FIRST: OnceLock<Regex> = OnceLock::new();

  let prop_first = PROP_FIRST.get_or_init(|| {
    regex(
      "(?is)<meta[^>]*\\sproperty\\s*=\\s*[\"']og:image[\"'][^>]*\\scontent\\s*=\\s*[\"']([^\"']+)[\"']",
      "og:image property-first",
    )
  });
  let content_first = CONTENT_FIRST.get_or_init(|| {
    regex(
      "(?is)<meta[^>]*\\scontent\\s*=\\s*[\"']([^\"']+)[\"'][^>]*\\sproperty\\s*=\\s*[\"']og:image[\"']",
      "og:image content-first",
    )
  });

  prop_first
    .captures(html)
    .or_else(|| content_first.captures(html))
    .map(|caps| caps[1].to_string())
}

fn scrape_og_image(url: &Url, fetcher: &HttpFetcher) -> Option<String> {
  match fetcher.fetch_page_prefix(url.as_str(), SCRAPE_PREFIX_BYTES) {
    Ok(html) => {
      let found = extract_og_image(&html);
      if found.is_none() {
        tracing::debug!(url = %url, "page has no og:image");
      }
      found
    }
    Err(err) => {
      tracing::debug!(url = %url, error = %err, "page scrape failed");
      None
    }
  }
}

/// The resolver chain plus its result caches. Successful resolutions are
/// remembered until [`EmbedResolver::clear`]; failures for a cooldown only.
pub struct EmbedResolver {
  fetcher: Arc<HttpFetcher>,
  chain: Vec<Box<dyn UrlResolver>>,
  resolved: Mutex<HashMap<String, String>>,
  failed_at: Mutex<HashMap<String, u64>>,
  clock: Arc<dyn TimeSource>,
  cooldown_ms: u64,
}

impl EmbedResolver {
  pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
    Self::with_clock(fetcher, Arc::new(SystemClock))
  }

  pub fn with_clock(fetcher: Arc<HttpFetcher>, clock: Arc<dyn TimeSource>) -> Self {
    Self {
      fetcher,
      chain: vec![
        Box::new(ImgurResolver),
        Box::new(GiphyResolver),
        Box::new(TenorResolver),
        Box::new(OpenGraphResolver),
      ],
      resolved: Mutex::new(HashMap::new()),
      failed_at: Mutex::new(HashMap::new()),
      clock,
      cooldown_ms: RESOLVE_FAILURE_COOLDOWN_MS,
    }
  }

  /// Replace the default chain. Order matters; first claim wins.
  pub fn with_chain(mut self, chain: Vec<Box<dyn UrlResolver>>) -> Self {
    self.chain = chain;
    self
  }

  /// Resolve `url` to a direct image URL, consulting caches first.
  /// `None` means unresolvable (malformed URL, no claiming resolver
  /// succeeded, or the URL failed recently and is cooling down).
  pub fn resolve(&self, url: &str) -> Option<String> {
    if let Ok(resolved) = self.resolved.lock() {
      if let Some(hit) = resolved.get(url) {
        return Some(hit.clone());
      }
    }
    if self.failure_is_live(url) {
      return None;
    }

    let result = self.resolve_uncached(url);
    match &result {
      Some(image_url) => {
        if let Ok(mut resolved) = self.resolved.lock() {
          resolved.insert(url.to_string(), image_url.clone());
        }
      }
      None => {
        if let Ok(mut failed) = self.failed_at.lock() {
          failed.insert(url.to_string(), self.clock.now_ms());
        }
      }
    }
    result
  }

  /// Drop both caches.
  pub fn clear(&self) {
    if let Ok(mut resolved) = self.resolved.lock() {
      resolved.clear();
    }
    if let Ok(mut failed) = self.failed_at.lock() {
      failed.clear();
    }
  }

  fn resolve_uncached(&self, url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let resolver = self.chain.iter().find(|r| r.is_resolvable(&parsed))?;
    resolver.resolve(&parsed, &self.fetcher)
  }

  fn failure_is_live(&self, url: &str) -> bool {
    let now = self.clock.now_ms();
    let mut failed = match self.failed_at.lock() {
      Ok(failed) => failed,
      Err(_) => return false,
    };
    match failed.get(url) {
      Some(at) if now.saturating_sub(*at) < self.cooldown_ms => true,
      Some(_) => {
        failed.remove(url);
        false
      }
      None => false,
    }
  }
}
