//! Runtime configuration
//!
//! Config arrives from the host as in-memory structs. The provider hands out
//! immutable snapshots with a monotonic version so long-lived components can
//! tell when the host swapped the config under them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_MAX_FILE_SIZE_MB: u32 = 30;

/// One permitted image host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhitelistEntry {
  /// Host name; matches the host itself and any subdomain of it.
  pub domain: String,
  /// Whether non-direct-image URLs on this host may be resolved to an
  /// embedded image (og:image scraping, pattern rewrites).
  #[serde(default)]
  pub resolve_embed: bool,
  #[serde(default = "default_true")]
  pub enabled: bool,
}

fn default_true() -> bool {
  true
}

impl WhitelistEntry {
  pub fn new(domain: impl Into<String>) -> Self {
    Self {
      domain: domain.into(),
      resolve_embed: false,
      enabled: true,
    }
  }

  pub fn with_embeds(domain: impl Into<String>) -> Self {
    Self {
      domain: domain.into(),
      resolve_embed: true,
      enabled: true,
    }
  }

  /// True if `host` equals this entry's domain or is a subdomain of it.
  /// Comparison is ASCII case-insensitive.
  pub fn matches(&self, host: &str) -> bool {
    let domain = self.domain.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
  }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewConfig {
  pub enabled: bool,
  pub max_file_size_mb: u32,
  pub whitelist: Vec<WhitelistEntry>,
}

impl Default for PreviewConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
      whitelist: Vec::new(),
    }
  }
}

impl PreviewConfig {
  /// The enabled whitelist entry covering `host`, if any.
  pub fn entry_for(&self, host: &str) -> Option<&WhitelistEntry> {
    self
      .whitelist
      .iter()
      .find(|e| e.enabled && e.matches(host))
  }

  pub fn is_whitelisted(&self, host: &str) -> bool {
    self.entry_for(host).is_some()
  }

  pub fn max_bytes(&self) -> usize {
    self.max_file_size_mb as usize * 1024 * 1024
  }
}

/// Shared, versioned config handle.
///
/// `snapshot` is cheap (an `Arc` clone); consumers that cache anything
/// derived from the config compare versions instead of configs.
pub struct ConfigProvider {
  current: Mutex<Arc<PreviewConfig>>,
  version: AtomicU64,
}

impl ConfigProvider {
  pub fn new(config: PreviewConfig) -> Self {
    Self {
      current: Mutex::new(Arc::new(config)),
      version: AtomicU64::new(0),
    }
  }

  pub fn snapshot(&self) -> Arc<PreviewConfig> {
    self
      .current
      .lock()
      .map(|c| Arc::clone(&c))
      .unwrap_or_default()
  }

  pub fn version(&self) -> u64 {
    self.version.load(Ordering::SeqCst)
  }

  /// Replace the config and bump the version.
  pub fn update(&self, config: PreviewConfig) {
    if let Ok(mut current) = self.current.lock() {
      *current = Arc::new(config);
    }
    self.version.fetch_add(1, Ordering::SeqCst);
  }
}

impl Default for ConfigProvider {
  fn default() -> Self {
    Self::new(PreviewConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn whitelist_matches_host_and_subdomains() {
    let entry = WhitelistEntry::new("imgur.com");
    assert!(entry.matches("imgur.com"));
    assert!(entry.matches("i.imgur.com"));
    assert!(entry.matches("I.IMGUR.COM"));
    assert!(!entry.matches("notimgur.com"));
    assert!(!entry.matches("imgur.com.evil.example"));
  }

  #[test]
  fn disabled_entries_are_skipped() {
    let mut config = PreviewConfig::default();
    config.whitelist.push(WhitelistEntry {
      domain: "imgur.com".to_string(),
      resolve_embed: false,
      enabled: false,
    });
    assert!(!config.is_whitelisted("imgur.com"));
  }

  #[test]
  fn update_bumps_version() {
    let provider = ConfigProvider::default();
    let v0 = provider.version();
    let mut config = (*provider.snapshot()).clone();
    config.enabled = false;
    provider.update(config);
    assert_eq!(provider.version(), v0 + 1);
    assert!(!provider.snapshot().enabled);
  }
}
