//! Source Configuration
//!
//! This module provides the request-shaping configuration for the HTTP
//! source element with a builder pattern and range validation. Defaults
//! mirror the transport library's own defaults where one exists; the
//! acceptable ranges are enforced by [`SourceConfig::validate`].

// Layer 1: Standard library imports
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

// Layer 2: Third-party crate imports
use tracing::{info, warn};

// Layer 3: Internal module imports
use crate::error::{SourceError, SourceResult};

/// Environment variable consulted once, at first use, for the default
/// preferred HTTP version. Recognised values: `1.0`, `1.1`, `2.0`.
pub const HTTP_VERSION_ENV: &str = "RIVULET_HTTP_VER";

/// Default total retries; -1 means unlimited.
pub const DEFAULT_RETRIES: i32 = -1;
/// Default maximum redirections; -1 means unlimited.
pub const DEFAULT_MAX_REDIRECTS: i32 = -1;
/// Default total transfer timeout in seconds; 0 disables the limit.
pub const DEFAULT_TIMEOUT_SECS: u32 = 0;
/// Default cap on the lifetime of a single connection, in seconds.
pub const DEFAULT_CONNECTION_TIME: u32 = 30;
/// Default concurrent connection cap per server.
pub const DEFAULT_CONNECTIONS_SERVER: u32 = 5;
/// Default concurrent connection cap per proxy.
pub const DEFAULT_CONNECTIONS_PROXY: u32 = 30;
/// Default global concurrent connection cap.
pub const DEFAULT_CONNECTIONS_GLOBAL: u32 = 255;

const MAX_REDIRECTS_CEIL: i32 = 255;
const MAX_TIMEOUT_SECS: u32 = 3600;
const MAX_RETRIES_CEIL: i32 = 9999;

/// HTTP protocol version preference for outgoing requests.
///
/// Selecting [`HttpVersion::V2_0`] requires transport support (the `http2`
/// cargo feature); without it the transport silently degrades to 1.1 and
/// logs a warning once per process. The configured preference is still
/// reported by the getter either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0
    V1_0,
    /// HTTP/1.1
    V1_1,
    /// HTTP/2
    V2_0,
}

impl HttpVersion {
    /// Parse the property/environment spelling of a version.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1.0" => Some(Self::V1_0),
            "1.1" => Some(Self::V1_1),
            "2.0" => Some(Self::V2_0),
            _ => None,
        }
    }

    /// Whether the transport was built with HTTP/2 support.
    pub fn http2_supported() -> bool {
        cfg!(feature = "http2")
    }

    /// The built-in default: HTTP/2 when the transport supports it,
    /// overridden at startup (first use) by [`HTTP_VERSION_ENV`].
    pub fn default_preference() -> Self {
        static PREFERRED: OnceLock<HttpVersion> = OnceLock::new();
        *PREFERRED.get_or_init(|| {
            let built_in = if Self::http2_supported() {
                Self::V2_0
            } else {
                Self::V1_1
            };
            match std::env::var(HTTP_VERSION_ENV) {
                Ok(raw) => {
                    info!(value = %raw, "Seen env var {}", HTTP_VERSION_ENV);
                    match Self::parse(&raw) {
                        Some(Self::V2_0) if !Self::http2_supported() => {
                            warn!("HTTP/2 unsupported by the transport, using default");
                            built_in
                        }
                        Some(version) => version,
                        None => {
                            warn!(value = %raw, "Unsupported HTTP version, using default");
                            built_in
                        }
                    }
                }
                Err(_) => built_in,
            }
        })
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
            Self::V2_0 => "2.0",
        };
        f.write_str(text)
    }
}

/// The user agent sent when none is configured.
pub fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Request-shaping configuration for one source element.
///
/// All options are settable while the element is not in an active state;
/// the pull loop snapshots them when it builds a transport handle, so a
/// retry picks up updated credentials but an in-flight attempt does not.
///
/// # Examples
///
/// ```rust
/// use rivulet_httpsrc::config::SourceConfig;
///
/// let config = SourceConfig::new()
///     .user_agent("player/1.0")
///     .compress(true)
///     .timeout_secs(30)
///     .retries(3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// HTTP basic auth user id (`user-id`)
    pub username: Option<String>,
    /// HTTP basic auth password (`user-pw`)
    pub password: Option<String>,
    /// HTTP proxy URL (`proxy`); defaults to the `http_proxy` environment variable
    pub proxy: Option<String>,
    /// Comma-separated no-proxy host list; defaults to the `no_proxy` environment variable
    pub no_proxy: Option<String>,
    /// Proxy basic auth user id (`proxy-id`)
    pub proxy_username: Option<String>,
    /// Proxy basic auth password (`proxy-pw`)
    pub proxy_password: Option<String>,
    /// Cookie lines sent verbatim with each request (`cookies`)
    pub cookies: Vec<String>,
    /// User agent (`user-agent`); [`default_user_agent`] when unset
    pub user_agent: Option<String>,
    /// Verbatim extra request headers (`extra-headers`)
    pub extra_headers: BTreeMap<String, String>,
    /// Allow compressed content encodings (`compress`)
    pub compress: bool,
    /// Follow 3xx redirects (`automatic-redirect`)
    pub follow_redirects: bool,
    /// Redirect limit, -1 = unlimited (`max-redirect`)
    pub max_redirects: i32,
    /// TCP keep-alive (`keep-alive`)
    pub keep_alive: bool,
    /// Total transfer timeout in seconds, 0 = transport default (`timeout`)
    pub timeout_secs: u32,
    /// Verify TLS peers (`ssl-strict`)
    pub strict_tls: bool,
    /// Custom CA bundle path (`ssl-ca-file`)
    pub ca_file: Option<PathBuf>,
    /// Transient-failure retry budget, -1 = unlimited (`retries`)
    pub retries: i32,
    /// Cap on the lifetime of one connection, seconds (`max-connection-time`)
    pub max_connection_time: u32,
    /// Concurrent connection cap per server (`max-connections-per-server`)
    pub max_connections_per_server: u32,
    /// Concurrent connection cap per proxy (`max-connections-per-proxy`)
    pub max_connections_per_proxy: u32,
    /// Global concurrent connection cap (`max-connections`)
    pub max_connections: u32,
    /// Preferred HTTP version (`http-version`)
    pub preferred_http_version: HttpVersion,
    /// Body-buffer high watermark in bytes; 0 = unbounded.
    ///
    /// When non-zero, a transfer whose undelivered body bytes reach the
    /// watermark parks until the consumer drains the buffer.
    pub buffer_high_watermark: usize,
}

impl SourceConfig {
    /// Create a configuration with the element defaults.
    ///
    /// `http_proxy` and `no_proxy` are read from the environment as the
    /// initial proxy settings, matching common client behaviour.
    pub fn new() -> Self {
        Self {
            username: None,
            password: None,
            proxy: std::env::var("http_proxy").ok().filter(|v| !v.is_empty()),
            no_proxy: std::env::var("no_proxy").ok().filter(|v| !v.is_empty()),
            proxy_username: None,
            proxy_password: None,
            cookies: Vec::new(),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            compress: false,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            keep_alive: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            strict_tls: true,
            ca_file: None,
            retries: DEFAULT_RETRIES,
            max_connection_time: DEFAULT_CONNECTION_TIME,
            max_connections_per_server: DEFAULT_CONNECTIONS_SERVER,
            max_connections_per_proxy: DEFAULT_CONNECTIONS_PROXY,
            max_connections: DEFAULT_CONNECTIONS_GLOBAL,
            preferred_http_version: HttpVersion::default_preference(),
            buffer_high_watermark: 0,
        }
    }

    /// Set HTTP basic auth credentials
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the proxy URL
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set proxy basic auth credentials
    pub fn proxy_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxy_username = Some(user.into());
        self.proxy_password = Some(password.into());
        self
    }

    /// Replace the cookie lines
    pub fn cookies(mut self, cookies: Vec<String>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Add one verbatim request header
    pub fn extra_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }

    /// Allow compressed content encodings
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Follow 3xx redirects
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Set the redirect limit (-1 = unlimited)
    pub fn max_redirects(mut self, max: i32) -> Self {
        self.max_redirects = max;
        self
    }

    /// Enable or disable TCP keep-alive
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the total transfer timeout in seconds (0 disables)
    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Enable or disable TLS peer verification
    pub fn strict_tls(mut self, strict: bool) -> Self {
        self.strict_tls = strict;
        self
    }

    /// Set a custom CA bundle path
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Set the retry budget (-1 = unlimited)
    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the preferred HTTP version
    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.preferred_http_version = version;
        self
    }

    /// Set the body-buffer high watermark (0 = unbounded)
    pub fn buffer_high_watermark(mut self, bytes: usize) -> Self {
        self.buffer_high_watermark = bytes;
        self
    }

    /// Check every option against its acceptable range.
    pub fn validate(&self) -> SourceResult<()> {
        if self.max_redirects < -1 || self.max_redirects > MAX_REDIRECTS_CEIL {
            return Err(SourceError::config(format!(
                "max-redirect {} outside -1..={MAX_REDIRECTS_CEIL}",
                self.max_redirects
            )));
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(SourceError::config(format!(
                "timeout {}s outside 0..={MAX_TIMEOUT_SECS}",
                self.timeout_secs
            )));
        }
        if self.retries < -1 || self.retries > MAX_RETRIES_CEIL {
            return Err(SourceError::config(format!(
                "retries {} outside -1..={MAX_RETRIES_CEIL}",
                self.retries
            )));
        }
        if !(2..=60).contains(&self.max_connection_time) {
            return Err(SourceError::config(format!(
                "max-connection-time {}s outside 2..=60",
                self.max_connection_time
            )));
        }
        if !(1..=60).contains(&self.max_connections_per_server) {
            return Err(SourceError::config(format!(
                "max-connections-per-server {} outside 1..=60",
                self.max_connections_per_server
            )));
        }
        if !(1..=60).contains(&self.max_connections_per_proxy) {
            return Err(SourceError::config(format!(
                "max-connections-per-proxy {} outside 1..=60",
                self.max_connections_per_proxy
            )));
        }
        if !(1..=255).contains(&self.max_connections) {
            return Err(SourceError::config(format!(
                "max-connections {} outside 1..=255",
                self.max_connections
            )));
        }
        Ok(())
    }

    /// The user agent to send, falling back to the element default.
    pub fn effective_user_agent(&self) -> String {
        self.user_agent.clone().unwrap_or_else(default_user_agent)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::new()
    }
}
