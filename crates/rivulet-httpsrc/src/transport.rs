//! Transport Handle
//!
//! Translates a request-slot snapshot into the transport library's option
//! set and drives the resulting transfer, feeding the header and body
//! accumulators of the owning slot. One handle is built per attempt; a
//! retry builds a fresh one from the then-current configuration.
//!
//! Validation failures leave no partial state: a handle that fails to build
//! is never handed to the scheduler.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Layer 2: Third-party crate imports
use reqwest::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, COOKIE, RANGE};
use reqwest::redirect;
use reqwest::{Client, Request, Url, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// Layer 3: Internal module imports
use crate::config::{HttpVersion, SourceConfig};
use crate::error::{SourceError, SourceResult};
use crate::slot::{FailureKind, RequestSlot, TransferFailure};

/// Everything a transfer attempt needs, captured under the slot lock at
/// pull time. Later configuration changes affect the next attempt only.
#[derive(Debug, Clone)]
pub(crate) struct AttemptSnapshot {
    pub uri: String,
    pub config: SourceConfig,
    pub request_position: u64,
    pub stop_position: i64,
}

/// How a driven transfer ended, from the scheduler's point of view.
#[derive(Debug)]
pub(crate) enum TransferEnd {
    /// The transfer ran to its natural end (success or recorded failure)
    Completed(Result<(), TransferFailure>),
    /// The cancellation token fired first
    Cancelled,
}

/// A fully-optioned, not-yet-started transfer bound to one slot.
pub(crate) struct TransportHandle {
    client: Client,
    request: Request,
    slot: Arc<RequestSlot>,
}

impl TransportHandle {
    /// Build the client and request for one attempt.
    ///
    /// Mirrors the slot configuration option for option: credentials,
    /// proxy, cookies, user agent, accept-encoding, redirect policy,
    /// keep-alive, total timeout, TLS trust and the byte range. The range
    /// end converts from our exclusive convention to the inclusive HTTP
    /// one here and nowhere else.
    pub(crate) fn build(snapshot: &AttemptSnapshot, slot: Arc<RequestSlot>) -> SourceResult<Self> {
        let config = &snapshot.config;
        let url = Url::parse(&snapshot.uri)
            .map_err(|e| SourceError::config(format!("invalid URI {:?}: {e}", snapshot.uri)))?;

        let mut builder = Client::builder()
            .user_agent(config.effective_user_agent())
            .redirect(Self::redirect_policy(config))
            .tcp_keepalive(config.keep_alive.then(|| Duration::from_secs(60)))
            .pool_idle_timeout(Duration::from_secs(u64::from(config.max_connection_time)))
            .pool_max_idle_per_host(config.max_connections_per_server as usize)
            .danger_accept_invalid_certs(!config.strict_tls);

        if !config.compress {
            builder = builder.no_gzip().no_deflate();
        }

        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(u64::from(config.timeout_secs)));
        }

        if let Some(proxy_url) = &config.proxy {
            let mut proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|e| SourceError::config(format!("invalid proxy {proxy_url:?}: {e}")))?;
            if let (Some(user), Some(password)) = (&config.proxy_username, &config.proxy_password)
            {
                proxy = proxy.basic_auth(user, password);
            }
            if let Some(no_proxy) = config.no_proxy.as_deref().and_then(reqwest::NoProxy::from_string)
            {
                proxy = proxy.no_proxy(Some(no_proxy));
            }
            builder = builder.proxy(proxy);
        } else {
            // Proxy defaults were captured from the environment at
            // configuration time; keep the client itself deterministic.
            builder = builder.no_proxy();
        }

        if let Some(ca_path) = &config.ca_file {
            let pem = std::fs::read(ca_path).map_err(|e| {
                SourceError::config(format!("cannot read ssl-ca-file {}: {e}", ca_path.display()))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                SourceError::config(format!("invalid ssl-ca-file {}: {e}", ca_path.display()))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let request_version = match config.preferred_http_version {
            HttpVersion::V1_0 => {
                debug!("Setting version as HTTP/1.0");
                builder = builder.http1_only();
                Some(Version::HTTP_10)
            }
            HttpVersion::V1_1 => {
                debug!("Setting version as HTTP/1.1");
                builder = builder.http1_only();
                None
            }
            HttpVersion::V2_0 => {
                // ALPN negotiates 2.0 when both sides support it; plain
                // http stays on 1.1.
                if !HttpVersion::http2_supported() {
                    warn_http2_unsupported();
                }
                None
            }
        };

        let client = builder
            .build()
            .map_err(|e| SourceError::internal(format!("transport client build failed: {e}")))?;

        let mut request_builder = client.get(url);

        if let Some(user) = &config.username {
            request_builder = request_builder.basic_auth(user, config.password.as_deref());
        }

        for (key, value) in &config.extra_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SourceError::config(format!("invalid extra header {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SourceError::config(format!("invalid value for header {key:?}: {e}")))?;
            request_builder = request_builder.header(name, value);
        }

        if !config.cookies.is_empty() {
            let line = config.cookies.join("; ");
            let value = HeaderValue::from_str(&line)
                .map_err(|e| SourceError::config(format!("invalid cookie line: {e}")))?;
            request_builder = request_builder.header(COOKIE, value);
        }

        if !config.compress {
            request_builder = request_builder.header(ACCEPT_ENCODING, "identity");
        }

        if let Some(range) = format_range(snapshot.request_position, snapshot.stop_position) {
            trace!(range = %range, "Requesting range");
            let value = HeaderValue::from_str(&range)
                .map_err(|e| SourceError::internal(format!("range header: {e}")))?;
            request_builder = request_builder.header(RANGE, value);
        }

        if let Some(version) = request_version {
            request_builder = request_builder.version(version);
        }

        let request = request_builder
            .build()
            .map_err(|e| SourceError::internal(format!("transport request build failed: {e}")))?;

        Ok(Self {
            client,
            request,
            slot,
        })
    }

    fn redirect_policy(config: &SourceConfig) -> redirect::Policy {
        if !config.follow_redirects {
            return redirect::Policy::none();
        }
        if config.max_redirects < 0 {
            // Unlimited by configuration; keep a generous loop guard.
            return redirect::Policy::custom(|attempt| {
                if attempt.previous().len() > 1024 {
                    attempt.error("redirect loop")
                } else {
                    attempt.follow()
                }
            });
        }
        let max = config.max_redirects as usize;
        // Stopping (rather than erroring) hands the final 3xx response
        // back so its status code reaches the error payload.
        redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max {
                attempt.stop()
            } else {
                attempt.follow()
            }
        })
    }

    /// Drive the transfer to completion, feeding the slot's accumulators.
    ///
    /// Runs inside the scheduler worker's set of transfer futures; the
    /// worker owns the cancellation token and observes the returned
    /// [`TransferEnd`].
    pub(crate) async fn run(self, cancel: CancellationToken) -> TransferEnd {
        let Self {
            client,
            request,
            slot,
        } = self;
        let started = Instant::now();

        let drive = async {
            let mut response = client
                .execute(request)
                .await
                .map_err(|e| classify_error(&e, started.elapsed()))?;

            slot.record_effective_uri(response.url().as_str());
            let status = response.status();
            slot.apply_status_line(status.as_u16(), status.canonical_reason().unwrap_or(""));
            for (name, value) in response.headers() {
                match value.to_str() {
                    Ok(text) => slot.apply_header(name.as_str(), text),
                    Err(_) => trace!(header = name.as_str(), "Skipping non-text header value"),
                }
            }

            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => return Err(classify_error(&e, started.elapsed())),
                };
                trace!(len = chunk.len(), "Received body chunk");
                // A discarded chunk means the slot is unlocking; keep
                // draining so the transport does not record a write error.
                let _ = slot.push_body(&chunk).await;
            }
            Ok(())
        };

        tokio::select! {
            _ = cancel.cancelled() => TransferEnd::Cancelled,
            result = drive => TransferEnd::Completed(result),
        }
    }
}

/// Render the Range header for the configured positions, if any.
///
/// `stop` is our exclusive end; HTTP's is inclusive, hence the `- 1`.
fn format_range(start: u64, stop: i64) -> Option<String> {
    if start == 0 && stop <= 0 {
        return None;
    }
    if stop < 1 {
        Some(format!("bytes={start}-"))
    } else {
        Some(format!("bytes={start}-{}", stop - 1))
    }
}

fn classify_error(error: &reqwest::Error, elapsed: Duration) -> TransferFailure {
    let kind = if error.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Transport
    };
    // Keep the full cause chain; reqwest's Display alone is often vague.
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    TransferFailure {
        kind,
        message,
        elapsed,
    }
}

fn warn_http2_unsupported() {
    static WARNED: AtomicBool = AtomicBool::new(false);
    if !WARNED.swap(true, Ordering::Relaxed) {
        warn!("HTTP/2 requested but the transport lacks support, degrading to HTTP/1.1");
    }
}
