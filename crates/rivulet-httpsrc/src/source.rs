//! HTTP Source Element
//!
//! The consumer-facing pull interface. A source element owns one request
//! slot, shares the scheduler through a [`SchedulerRegistry`], and exposes
//! the pull loop the surrounding pipeline drives: configure, start, call
//! [`HttpSource::create_next_chunk`] until end-of-stream, stop.
//!
//! The slot's own mutex orders state against the scheduler worker; the uri
//! lock here is a leaf and is never held together with anything else.

// Layer 1: Standard library imports
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Layer 2: Third-party crate imports
use bytes::Bytes;
use tracing::{debug, info, warn};
use url::Url;

// Layer 3: Internal module imports
use crate::config::SourceConfig;
use crate::error::{SourceError, SourceResult};
use crate::events::{EventsHandle, NullEvents, StreamEvents};
use crate::headers::TransferInfo;
use crate::scheduler::{SchedulerRef, SchedulerRegistry};
use crate::slot::{Outcome, PublishSet, RequestSlot, SlotState};
use crate::transport::{AttemptSnapshot, TransportHandle};

/// URL schemes this element handles.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https"];

/// A contiguous, non-empty body payload with its byte offset within the
/// resource.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Body bytes in transport order
    pub bytes: Bytes,
    /// Offset of the first byte within the resource
    pub offset: u64,
}

/// Result of one pull.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// Body bytes became available
    Chunk(Chunk),
    /// The entire requested body has been delivered
    Eos,
    /// A concurrent unlock cancelled this pull
    Flushing,
}

#[derive(Debug, Default)]
struct UriState {
    uri: Option<String>,
    redirect_uri: Option<String>,
}

/// Pull-based HTTP source element.
///
/// # Examples
///
/// ```rust,no_run
/// use rivulet_httpsrc::{Fetched, HttpSource, SchedulerRegistry, SourceConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = SchedulerRegistry::new();
/// let source = HttpSource::new(registry, SourceConfig::new())?;
/// source.set_uri("http://example.test/stream.bin")?;
/// source.start()?;
/// loop {
///     match source.create_next_chunk().await? {
///         Fetched::Chunk(chunk) => println!("{} bytes at {}", chunk.bytes.len(), chunk.offset),
///         Fetched::Eos => break,
///         Fetched::Flushing => break,
///     }
/// }
/// source.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct HttpSource {
    registry: SchedulerRegistry,
    scheduler: Mutex<Option<SchedulerRef>>,
    slot: Arc<RequestSlot>,
    config: Mutex<SourceConfig>,
    uri_state: Mutex<UriState>,
    last_info: Mutex<Option<TransferInfo>>,
    events: EventsHandle,
}

impl HttpSource {
    /// Create an element sharing the given scheduler registry.
    pub fn new(registry: SchedulerRegistry, config: SourceConfig) -> SourceResult<Self> {
        config.validate()?;
        let slot = Arc::new(RequestSlot::new(config.retries));
        Ok(Self {
            registry,
            scheduler: Mutex::new(None),
            slot,
            config: Mutex::new(config),
            uri_state: Mutex::new(UriState::default()),
            last_info: Mutex::new(None),
            events: Arc::new(NullEvents),
        })
    }

    /// Install a downstream event sink (sticky events, bus messages).
    pub fn with_events(mut self, events: Arc<dyn StreamEvents>) -> Self {
        self.events = events;
        self
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, Option<SchedulerRef>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_config(&self) -> MutexGuard<'_, SourceConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_uri(&self) -> MutexGuard<'_, UriState> {
        self.uri_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_info(&self) -> MutexGuard<'_, Option<TransferInfo>> {
        self.last_info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    //
    // URI handler
    //

    /// Replace the request URI. Resets the retry budget.
    ///
    /// Rejects empty URIs and schemes other than `http`/`https`.
    pub fn set_uri(&self, uri: &str) -> SourceResult<()> {
        if uri.is_empty() {
            return Err(SourceError::config("URI must not be empty"));
        }
        let parsed =
            Url::parse(uri).map_err(|e| SourceError::config(format!("invalid URI {uri:?}: {e}")))?;
        if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
            return Err(SourceError::config(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }
        let total_retries = self.lock_config().retries;
        {
            let mut state = self.lock_uri();
            if let Some(old) = &state.uri {
                debug!(old = %old, new = %uri, "URI already present, updating");
            }
            state.uri = Some(uri.to_owned());
            state.redirect_uri = None;
        }
        self.slot.reset_retries(total_retries);
        Ok(())
    }

    /// The current request URI.
    pub fn uri(&self) -> Option<String> {
        self.lock_uri().uri.clone()
    }

    /// The effective URI of the last response when it differed from the
    /// request URI.
    pub fn redirect_uri(&self) -> Option<String> {
        self.lock_uri().redirect_uri.clone()
    }

    //
    // Configuration surface
    //

    /// Replace the request-shaping configuration.
    ///
    /// Refused while a transfer is in flight; the new settings would be
    /// half-applied otherwise.
    pub fn set_config(&self, config: SourceConfig) -> SourceResult<()> {
        config.validate()?;
        if self.slot.transfer_begun() {
            return Err(SourceError::config(
                "configuration is not settable while a transfer is active",
            ));
        }
        *self.lock_config() = config;
        Ok(())
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> SourceConfig {
        self.lock_config().clone()
    }

    //
    // Lifecycle
    //

    /// Acquire the shared scheduler. Requires a URI.
    pub fn start(&self) -> SourceResult<()> {
        if self.lock_uri().uri.is_none() {
            return Err(SourceError::config("No URL set"));
        }
        let mut scheduler = self.lock_scheduler();
        if scheduler.is_some() {
            return Err(SourceError::internal("element already started"));
        }
        *scheduler = Some(self.registry.acquire());
        Ok(())
    }

    /// Tear the element down: cancel any running transfer, wait until the
    /// worker no longer references the slot, then release the scheduler.
    pub async fn stop(&self) {
        let scheduler = self.lock_scheduler().take();
        if let Some(scheduler) = scheduler {
            debug!("Removing from the scheduler queue");
            scheduler.request_removal(&self.slot);
            scheduler.await_removed(&self.slot).await;
            scheduler.release().await;
        }
        self.slot.mark_pipeline_null();
    }

    //
    // Pull interface
    //

    /// Pull the next piece of the resource.
    ///
    /// Starts a transfer on first use (and again after end-of-stream or a
    /// seek), then blocks until body bytes, completion, cancellation or
    /// failure. Transient failures retry here while the budget lasts and
    /// no bytes were surfaced yet.
    pub async fn create_next_chunk(&self) -> SourceResult<Fetched> {
        loop {
            if !self.slot.transfer_begun() && !self.begin_transfer()? {
                return Ok(Fetched::Flushing);
            }

            // Wait for data to become available, then hand it downstream
            self.slot.await_readable().await;

            if self.slot.consume_flush() {
                return Ok(Fetched::Flushing);
            }

            let (uri, timeout_secs, follow_redirects) = {
                let config = self.lock_config();
                (
                    self.uri().unwrap_or_default(),
                    config.timeout_secs,
                    config.follow_redirects,
                )
            };

            match self.slot.outcome(&uri, timeout_secs, follow_redirects) {
                Outcome::Proceed(publish) => {
                    if let Some(publish) = publish {
                        self.publish(publish);
                    }
                }
                Outcome::Retry(error) => {
                    if self.slot.data_received() {
                        // Previously delivered buffers cannot be recalled,
                        // so a mid-transfer failure is final.
                        warn!(uri = %uri, "Failed mid-transfer, can't continue");
                        self.slot.mark_total_error();
                        return Err(error);
                    }
                    let remaining = self.slot.decrement_retries();
                    if remaining == 0 {
                        warn!(uri = %uri, "Out of retries");
                        self.slot.mark_total_error();
                        return Err(error);
                    }
                    info!(uri = %uri, remaining, "Attempting retry");
                    self.slot.reset_for_retry();
                    continue;
                }
                Outcome::Fatal(error) => {
                    self.slot.mark_total_error();
                    return Err(error);
                }
            }

            if let Some((bytes, offset)) = self.slot.take_body() {
                debug!(len = bytes.len(), offset, "Pushing transfer bytes downstream");
                return Ok(Fetched::Chunk(Chunk { bytes, offset }));
            }

            if self.slot.finish_if_done() {
                info!("Full body received, signalling EOS");
                return Ok(Fetched::Eos);
            }

            match self.slot.state() {
                SlotState::Removed => {
                    warn!("Transfer got removed from the scheduler queue");
                    return Ok(Fetched::Eos);
                }
                SlotState::BadRequest => {
                    return Err(SourceError::internal("scheduler refused the enqueue"));
                }
                SlotState::TotalError => {
                    return Err(SourceError::internal("unrecoverable transfer failure"));
                }
                SlotState::PipelineNull => {
                    return Err(SourceError::internal("element is shut down"));
                }
                state => {
                    // A spurious wakeup with nothing to deliver; go again.
                    debug!(?state, "Nothing to deliver after wakeup");
                    continue;
                }
            }
        }
    }

    /// Begin a transfer attempt: build the transport handle from a
    /// configuration snapshot and queue it with the scheduler.
    ///
    /// Returns `Ok(false)` when a concurrent unlock is in progress.
    fn begin_transfer(&self) -> SourceResult<bool> {
        let uri = self
            .uri()
            .ok_or_else(|| SourceError::config("No URL set"))?;
        let config = self.lock_config().clone();
        let (request_position, stop_position) = self.slot.positions();

        // A zero-length range cannot be expressed on the wire; complete
        // immediately with an empty body.
        if stop_position >= 0 && stop_position as u64 == request_position {
            if !self
                .slot
                .begin_attempt(&uri, config.extra_headers.clone(), config.buffer_high_watermark)
            {
                return Ok(false);
            }
            debug!(position = request_position, "Zero-length range, completing empty");
            self.slot.complete_transfer(Ok(()));
            return Ok(true);
        }

        let snapshot = AttemptSnapshot {
            uri: uri.clone(),
            config: config.clone(),
            request_position,
            stop_position,
        };
        let handle = TransportHandle::build(&snapshot, Arc::clone(&self.slot))?;

        if !self
            .slot
            .begin_attempt(&uri, config.extra_headers, config.buffer_high_watermark)
        {
            return Ok(false);
        }

        let scheduler = self.lock_scheduler();
        let scheduler = scheduler
            .as_ref()
            .ok_or_else(|| SourceError::internal("element is not started"))?;
        scheduler.enqueue(Arc::clone(&self.slot), handle)?;
        debug!(uri = %uri, "Submitted request to the scheduler");
        Ok(true)
    }

    fn publish(&self, publish: PublishSet) {
        if let Some(redirect) = &publish.info.redirect_uri {
            self.lock_uri().redirect_uri = Some(redirect.clone());
        }
        if let Some(content_type) = &publish.content_type {
            info!(content_type = %content_type, "Negotiating caps");
            self.events.content_type_changed(content_type);
        }
        if let Some(total) = publish.duration {
            self.events.duration_changed(total);
        }
        if !publish.info.response_headers.is_empty() {
            self.events.element_message(&publish.info);
            self.events.headers(&publish.info);
            info!("Pushed headers downstream");
        }
        *self.lock_last_info() = Some(publish.info);
    }

    //
    // Seek / flush surface
    //

    /// Reposition the next transfer to `[start, stop)`; `stop = -1` reads
    /// to the end.
    ///
    /// A position change while a transfer is running detaches that
    /// transfer; the next pull rebuilds the handle with the new range.
    pub async fn seek(&self, start: u64, stop: i64) -> SourceResult<()> {
        let previous = self.slot.positions();
        self.slot.seek(start, stop)?;
        if previous == self.slot.positions() {
            return Ok(());
        }
        if self.slot.transfer_begun() {
            if let Some(scheduler) = self.lock_scheduler().as_ref() {
                scheduler.request_removal(&self.slot);
            }
            self.slot.await_not_connected().await;
            self.slot.reset_for_retry();
        }
        Ok(())
    }

    /// Cancel the current pull. The pulling thread returns
    /// [`Fetched::Flushing`] on its next check; buffered bytes are
    /// discarded.
    pub fn unlock(&self) {
        let want_removal = self.slot.unlock();
        if want_removal {
            if let Some(scheduler) = self.lock_scheduler().as_ref() {
                scheduler.request_removal(&self.slot);
            }
        }
    }

    /// Finish a flush: restore the state parked by [`HttpSource::unlock`].
    ///
    /// A transfer cancelled by the unlock is not resumed; the next pull
    /// reports end-of-stream because partial-body delivery is not
    /// permitted.
    pub fn unlock_stop(&self) {
        self.slot.unlock_stop();
    }

    //
    // Query surface
    //

    /// Content length learned from the response headers, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.lock_last_info()
            .as_ref()
            .and_then(|info| info.response_headers.content_length())
    }

    /// Total resource size, 0 when unknown.
    pub fn content_size(&self) -> u64 {
        self.slot.content_size()
    }

    /// Whether byte-range seeking is believed to work. Unknown counts as
    /// seekable.
    pub fn is_seekable(&self) -> bool {
        self.slot.is_seekable()
    }

    /// Retries left in the current budget (observable for tests).
    pub fn retries_remaining(&self) -> i32 {
        self.slot.retries_remaining()
    }

    /// The most recently published transfer info, if any.
    pub fn transfer_info(&self) -> Option<TransferInfo> {
        self.lock_last_info().clone()
    }
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("uri", &self.uri())
            .field("state", &self.slot.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> HttpSource {
        HttpSource::new(SchedulerRegistry::new(), SourceConfig::new()).unwrap()
    }

    #[test]
    fn test_uri_handler_validates_scheme() {
        let source = source();
        assert!(source.set_uri("http://example.test/a").is_ok());
        assert!(source.set_uri("https://example.test/a").is_ok());
        assert!(matches!(
            source.set_uri("ftp://example.test/a"),
            Err(SourceError::Config { .. })
        ));
        assert!(matches!(
            source.set_uri(""),
            Err(SourceError::Config { .. })
        ));
        assert_eq!(source.uri().as_deref(), Some("https://example.test/a"));
    }

    #[test]
    fn test_set_uri_resets_retry_budget() {
        let source =
            HttpSource::new(SchedulerRegistry::new(), SourceConfig::new().retries(5)).unwrap();
        source.slot.decrement_retries();
        source.set_uri("http://example.test/a").unwrap();
        assert_eq!(source.retries_remaining(), 5);
    }

    #[test]
    fn test_start_requires_uri() {
        let source = source();
        assert!(matches!(source.start(), Err(SourceError::Config { .. })));
    }

    #[tokio::test]
    async fn test_start_and_stop_manage_scheduler_refcount() {
        let registry = SchedulerRegistry::new();
        let source = HttpSource::new(registry.clone(), SourceConfig::new()).unwrap();
        source.set_uri("http://example.test/a").unwrap();

        source.start().unwrap();
        assert!(registry.is_running());
        assert!(matches!(source.start(), Err(SourceError::Internal { .. })));

        source.stop().await;
        assert!(!registry.is_running());
    }

    #[tokio::test]
    async fn test_pull_after_stop_is_an_error() {
        let source = source();
        source.set_uri("http://example.test/a").unwrap();
        source.start().unwrap();
        source.stop().await;
        assert!(matches!(
            source.create_next_chunk().await,
            Err(SourceError::Internal { .. })
        ));
    }

    #[test]
    fn test_default_queries() {
        let source = source();
        assert_eq!(source.content_length(), None);
        assert_eq!(source.content_size(), 0);
        assert!(source.is_seekable());
        assert_eq!(source.redirect_uri(), None);
        assert!(source.transfer_info().is_none());
    }

    #[test]
    fn test_set_config_validates() {
        let source = source();
        assert!(source.set_config(SourceConfig::new().retries(3)).is_ok());
        assert_eq!(source.config().retries, 3);
        assert!(source
            .set_config(SourceConfig::new().max_redirects(9999))
            .is_err());
    }
}
