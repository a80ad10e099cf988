//! Bounded HTTP fetching
//!
//! The fetcher speaks plain HTTP(S) GET with fixed timeouts and three guards
//! the rest of the pipeline relies on:
//!
//! - a pre-connect address check rejecting loopback/link-local/private hosts
//! - a redirect policy (image fetches never follow; page scrapes follow but
//!   re-run the address check against every hop)
//! - a byte cap enforced both against the advertised Content-Length and
//!   mid-stream while reading an unsized body

use crate::error::FetchError;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::time::Duration;
use url::Url;

/// Default response size cap for image fetches.
pub const DEFAULT_MAX_BYTES: u64 = 30 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SCRAPE_REDIRECTS: usize = 5;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; hoverpix/0.1)";

/// HTTP fetcher with SSRF guarding, redirect policy, and size caps.
///
/// # Example
///
/// ```rust,no_run
/// use hoverpix::fetch::{HttpFetcher, DEFAULT_MAX_BYTES};
///
/// let fetcher = HttpFetcher::new();
/// let bytes = fetcher.fetch_image("https://example.com/cat.png", DEFAULT_MAX_BYTES)?;
/// # Ok::<(), hoverpix::error::FetchError>(())
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
  connect_timeout: Duration,
  read_timeout: Duration,
  user_agent: String,
  allow_private_hosts: bool,
}

impl Default for HttpFetcher {
  fn default() -> Self {
    Self {
      connect_timeout: CONNECT_TIMEOUT,
      read_timeout: READ_TIMEOUT,
      user_agent: DEFAULT_USER_AGENT.to_string(),
      allow_private_hosts: false,
    }
  }
}

impl HttpFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the connect timeout.
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Set the read timeout.
  pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
    self.read_timeout = timeout;
    self
  }

  /// Set the User-Agent header.
  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  /// Permit loopback and private destinations. For integration tests against
  /// local servers; never enable this against untrusted input.
  pub fn with_private_hosts_allowed(mut self) -> Self {
    self.allow_private_hosts = true;
    self
  }

  /// Fetch an image body, rejecting redirects and enforcing `max_bytes`.
  ///
  /// The whitelist validated the original host, so a redirect would fetch
  /// from an unvalidated one; 3xx responses fail with
  /// [`FetchError::UnexpectedRedirect`] instead of being followed.
  pub fn fetch_image(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    let parsed = parse_url(url)?;
    self.guard(&parsed)?;

    let agent = self.agent();
    let response = agent
      .get(parsed.as_str())
      .header("Accept", "image/*")
      .header("User-Agent", &self.user_agent)
      .call()
      .map_err(map_call_error)?;

    let status = response.status().as_u16();
    if (300..400).contains(&status) {
      return Err(FetchError::UnexpectedRedirect { status });
    }
    if status != 200 {
      return Err(FetchError::HttpStatus(status));
    }

    let limit_mb = max_bytes / (1024 * 1024);
    if let Some(advertised) = content_length(&response) {
      if advertised > max_bytes {
        return Err(FetchError::TooLarge { limit_mb });
      }
    }

    let mut reader = response.into_body().into_reader();
    read_bounded(&mut reader, max_bytes, limit_mb)
  }

  /// Fetch a bounded prefix of an HTML page for metadata scraping.
  ///
  /// Unlike [`fetch_image`](Self::fetch_image) this follows redirects, but the
  /// address guard is re-run against every hop before connecting to it.
  /// Bodies longer than `max_bytes` are truncated, not rejected.
  pub fn fetch_page_prefix(&self, url: &str, max_bytes: usize) -> Result<String, FetchError> {
    let mut current = parse_url(url)?;

    for _ in 0..=MAX_SCRAPE_REDIRECTS {
      self.guard(&current)?;

      let agent = self.agent();
      let response = agent
        .get(current.as_str())
        .header("Accept", "text/html")
        .header("User-Agent", &self.user_agent)
        .call()
        .map_err(map_call_error)?;

      let status = response.status().as_u16();
      if (300..400).contains(&status) {
        let location = response
          .headers()
          .get("location")
          .and_then(|h| h.to_str().ok())
          .ok_or(FetchError::HttpStatus(status))?;
        current = current
          .join(location)
          .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        continue;
      }
      if status != 200 {
        return Err(FetchError::HttpStatus(status));
      }

      let mut reader = response.into_body().into_reader();
      let bytes = read_prefix(&mut reader, max_bytes)?;
      return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }

    Err(FetchError::Transport("too many redirects".to_string()))
  }

  fn guard(&self, url: &Url) -> Result<(), FetchError> {
    if self.allow_private_hosts {
      return Ok(());
    }
    guard_host(url)
  }

  fn agent(&self) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
      .timeout_connect(Some(self.connect_timeout))
      .timeout_recv_body(Some(self.read_timeout))
      .timeout_recv_response(Some(self.read_timeout))
      .max_redirects(0)
      .max_redirects_will_error(false)
      .http_status_as_error(false)
      .build();
    config.into()
  }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
  let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
  match parsed.scheme() {
    "http" | "https" => Ok(parsed),
    other => Err(FetchError::InvalidUrl(format!("unsupported scheme '{other}'"))),
  }
}

/// Resolves the URL's host and rejects it if any resolved address is private.
///
/// Runs before connecting so the pipeline cannot be pointed at internal
/// services via a chat link.
pub fn guard_host(url: &Url) -> Result<(), FetchError> {
  let host = url
    .host_str()
    .ok_or_else(|| FetchError::InvalidUrl("missing host".to_string()))?;
  let port = url.port_or_known_default().unwrap_or(443);

  let addrs = (host, port)
    .to_socket_addrs()
    .map_err(|e| FetchError::Transport(format!("DNS lookup failed: {e}")))?;

  let mut any = false;
  for addr in addrs {
    any = true;
    if is_blocked_ip(addr.ip()) {
      return Err(FetchError::BlockedAddress);
    }
  }
  if !any {
    return Err(FetchError::Transport("DNS lookup returned no addresses".to_string()));
  }
  Ok(())
}

/// True for loopback, link-local, and private (site-local) addresses.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => is_blocked_ipv4(v4),
    IpAddr::V6(v6) => {
      if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_blocked_ipv4(mapped);
      }
      if v6.is_loopback() || v6.is_unspecified() {
        return true;
      }
      let seg = v6.segments();
      // fc00::/7 unique-local, fe80::/10 link-local
      (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80
    }
  }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
  ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn content_length(response: &ureq::http::Response<ureq::Body>) -> Option<u64> {
  response
    .headers()
    .get("content-length")
    .and_then(|h| h.to_str().ok())
    .and_then(|v| v.parse().ok())
}

/// Reads a body of at most `max_bytes`, failing the instant the count is
/// exceeded rather than after buffering the whole stream.
fn read_bounded(
  reader: &mut impl Read,
  max_bytes: u64,
  limit_mb: u64,
) -> Result<Vec<u8>, FetchError> {
  let mut out = Vec::new();
  let mut buf = [0u8; 16 * 1024];
  let mut total: u64 = 0;

  loop {
    // Never request more than one byte past the cap; the first excess byte
    // is enough to prove the body is oversized.
    let want = buf.len().min((max_bytes - total + 1) as usize);
    let n = reader.read(&mut buf[..want]).map_err(map_read_error)?;
    if n == 0 {
      return Ok(out);
    }
    total += n as u64;
    if total > max_bytes {
      return Err(FetchError::TooLarge { limit_mb });
    }
    out.extend_from_slice(&buf[..n]);
  }
}

fn read_prefix(reader: &mut impl Read, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
  let mut out = vec![0u8; max_bytes];
  let mut total = 0;
  while total < max_bytes {
    let n = reader.read(&mut out[total..]).map_err(map_read_error)?;
    if n == 0 {
      break;
    }
    total += n;
  }
  out.truncate(total);
  Ok(out)
}

fn map_call_error(err: ureq::Error) -> FetchError {
  match err {
    ureq::Error::Timeout(_) => FetchError::Timeout,
    ureq::Error::Io(ref io_err) if is_timeout_io(io_err) => FetchError::Timeout,
    other => FetchError::Transport(other.to_string()),
  }
}

fn map_read_error(err: io::Error) -> FetchError {
  if is_timeout_io(&err) {
    return FetchError::Timeout;
  }
  FetchError::Transport(err.to_string())
}

fn is_timeout_io(err: &io::Error) -> bool {
  if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
    return true;
  }
  if let Some(inner) = err.get_ref() {
    if let Some(ureq_err) = inner.downcast_ref::<ureq::Error>() {
      return matches!(ureq_err, ureq::Error::Timeout(_));
    }
  }
  false
}
