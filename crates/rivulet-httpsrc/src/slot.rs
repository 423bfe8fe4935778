//! Request Slot
//!
//! Per-request state shared between the consumer's pull loop and the
//! scheduler worker: the life-cycle state machine, the response accumulator
//! (status line, header table, body buffer) and the rendezvous primitives.
//!
//! The slot's mutex is held only for short, await-free critical sections;
//! the two [`Notify`] handles carry the wakeups the original design expressed
//! with a condition variable. `cond` wakes the consumer (new body bytes,
//! completion, removal, unlock), `space` wakes a transfer parked on the
//! body-buffer high watermark.

// Layer 1: Standard library imports
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// Layer 2: Third-party crate imports
use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

// Layer 3: Internal module imports
use crate::error::SourceError;
use crate::headers::{parse_content_range_total, TransferInfo};

/// Life-cycle state of a request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No transfer in progress
    None,
    /// Transfer running, body bytes may arrive
    Ok,
    /// Transfer finished; remaining buffered bytes then end-of-stream
    Done,
    /// A concurrent unlock cancelled the pull; previous state parked in
    /// `pending_state`
    Unlock,
    /// The scheduler detached the transfer before it finished
    Removed,
    /// The scheduler refused the enqueue
    BadRequest,
    /// Unrecoverable failure
    TotalError,
    /// The element was shut down
    PipelineNull,
}

/// The scheduler's view of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not linked into the scheduler queue
    NotConnected,
    /// Linked into the scheduler queue
    Connected,
    /// Cancellation requested; the worker will detach it on its next sweep
    WantRemoval,
}

/// Whether the resource supports byte-range requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seekability {
    /// Nothing observed yet; treated as seekable by the query surface
    Unknown,
    /// Content-Length seen and ranges not refused
    Seekable,
    /// `Accept-Ranges: none` seen, or no Content-Length available
    NotSeekable,
}

/// Classified transport-level failure recorded at completion.
#[derive(Debug, Clone)]
pub struct TransferFailure {
    /// What went wrong, for the retryability decision
    pub kind: FailureKind,
    /// Human-readable diagnostic from the transport
    pub message: String,
    /// Wall-clock duration of the attempt
    pub elapsed: Duration,
}

/// Failure classification used by the completion post-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The configured total timeout elapsed
    Timeout,
    /// Socket, TLS, DNS or protocol failure
    Transport,
}

/// Result of storing a body chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPush {
    /// Appended to the body buffer, consumer signalled
    Stored,
    /// Swallowed; the slot is unlocking or already detached
    Discarded,
}

/// What the pull loop should do after a wakeup, decided by the completion
/// post-processor.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing fatal observed; deliver buffered bytes or end-of-stream.
    /// Carries response metadata to publish when headers arrived since the
    /// last pull.
    Proceed(Option<PublishSet>),
    /// Transport-level failure that may be retried under the zero-bytes rule
    Retry(SourceError),
    /// Unrecoverable; surface to the consumer
    Fatal(SourceError),
}

/// Response metadata to publish downstream before the next chunk.
#[derive(Debug, Clone)]
pub struct PublishSet {
    /// Snapshot of the transfer-info structure (sticky event + bus message)
    pub info: TransferInfo,
    /// Total resource size, when a Content-Length taught us one
    pub duration: Option<u64>,
    /// `content-type` value observed in this batch of headers
    pub content_type: Option<String>,
}

#[derive(Debug)]
pub(crate) struct SlotInner {
    pub(crate) state: SlotState,
    pub(crate) pending_state: SlotState,
    pub(crate) connection_status: ConnectionStatus,
    transfer_begun: bool,
    data_received: bool,
    headers_updated: bool,

    body: BytesMut,
    high_watermark: usize,

    status_code: u16,
    reason_phrase: String,
    info: Option<TransferInfo>,
    content_type: Option<String>,
    effective_uri: Option<String>,
    failure: Option<TransferFailure>,

    request_position: u64,
    stop_position: i64,
    read_position: u64,
    content_size: u64,
    seekable: Seekability,
    retries_remaining: i32,
}

/// Per-request state shared by the consumer and the scheduler worker.
///
/// Construct one per source element; hand clones of the [`std::sync::Arc`]
/// wrapper to the scheduler when enqueuing. Identity is pointer identity.
#[derive(Debug)]
pub struct RequestSlot {
    inner: Mutex<SlotInner>,
    /// Wakes the consumer side (bytes arrived, completion, unlock, removal)
    cond: Notify,
    /// Wakes a transfer parked on the high watermark
    space: Notify,
}

impl RequestSlot {
    /// Create an idle slot with the given retry budget.
    pub fn new(total_retries: i32) -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::None,
                pending_state: SlotState::None,
                connection_status: ConnectionStatus::NotConnected,
                transfer_begun: false,
                data_received: false,
                headers_updated: false,
                body: BytesMut::new(),
                high_watermark: 0,
                status_code: 0,
                reason_phrase: String::new(),
                info: None,
                content_type: None,
                effective_uri: None,
                failure: None,
                request_position: 0,
                stop_position: -1,
                read_position: 0,
                content_size: 0,
                seekable: Seekability::Unknown,
                retries_remaining: total_retries,
            }),
            cond: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        // A poisoned slot mutex means a panic in a short critical section;
        // the state itself stays coherent, so keep going.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    //
    // Consumer side
    //

    /// Whether an attempt has been submitted and not yet torn down.
    pub fn transfer_begun(&self) -> bool {
        self.lock().transfer_begun
    }

    /// Whether any body bytes were surfaced to the consumer this attempt.
    pub fn data_received(&self) -> bool {
        self.lock().data_received
    }

    /// Start a new attempt: mark the slot running and install a fresh
    /// transfer-info holder carrying the URI and request headers.
    ///
    /// Returns `false` when a concurrent unlock is in progress, in which
    /// case nothing is changed.
    pub fn begin_attempt(
        &self,
        uri: &str,
        request_headers: BTreeMap<String, String>,
        high_watermark: usize,
    ) -> bool {
        let mut inner = self.lock();
        if inner.state == SlotState::Unlock {
            return false;
        }
        inner.state = SlotState::Ok;
        inner.transfer_begun = true;
        inner.data_received = false;
        inner.headers_updated = false;
        inner.high_watermark = high_watermark;
        inner.read_position = inner.request_position;
        inner.info = Some(TransferInfo::new(uri, request_headers));
        inner.content_type = None;
        inner.effective_uri = None;
        inner.failure = None;
        debug!(uri, "Starting new request");
        true
    }

    /// Block until the slot is readable: body bytes present, or the state
    /// left `Ok`, or the scheduler detached the transfer.
    pub async fn await_readable(&self) {
        loop {
            let notified = self.cond.notified();
            {
                let inner = self.lock();
                let keep_waiting = inner.body.is_empty()
                    && inner.state == SlotState::Ok
                    && inner.connection_status == ConnectionStatus::Connected;
                if !keep_waiting {
                    return;
                }
            }
            notified.await;
        }
    }

    /// If a concurrent unlock happened, discard any buffered bytes and
    /// report it. The pull loop returns `Flushing` on `true`.
    pub fn consume_flush(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SlotState::Unlock {
            return false;
        }
        if !inner.body.is_empty() {
            inner.body.clear();
            self.space.notify_one();
        }
        true
    }

    /// Completion post-processor: examine the recorded result and decide
    /// how the pull loop proceeds. On the success path this also assembles
    /// the metadata to publish when headers arrived since the last pull.
    ///
    /// HTTP statuses >= 400 zero the retry budget; a 3xx seen here while
    /// redirects were requested means the redirect limit stopped the chain.
    pub fn outcome(&self, uri: &str, timeout_secs: u32, follow_redirects: bool) -> Outcome {
        let mut inner = self.lock();

        if let Some(failure) = inner.failure.clone() {
            warn!(uri, error = %failure.message, "Transport failed the transfer");
            inner.headers_updated = false;
            let error = match failure.kind {
                FailureKind::Timeout => {
                    SourceError::timeout(failure.elapsed.as_secs_f64(), timeout_secs)
                }
                FailureKind::Transport => SourceError::transport(failure.message),
            };
            return Outcome::Retry(error);
        }

        let status = inner.status_code;
        if status >= 400 || (status >= 300 && status < 400 && follow_redirects) {
            warn!(uri, status, "Transfer returned error status");
            inner.retries_remaining = 0;
            let reason = inner.reason_phrase.clone();
            let redirect = inner.effective_redirect(uri);
            return Outcome::Fatal(SourceError::http(status, reason, redirect));
        }

        if !inner.headers_updated {
            return Outcome::Proceed(None);
        }
        inner.headers_updated = false;

        // Redirection bookkeeping before the snapshot is taken
        if let Some(redirect) = inner.effective_redirect(uri) {
            info!(uri, redirect = %redirect, "Recording redirect URI");
            if let Some(info) = inner.info.as_mut() {
                info.redirect_uri = Some(redirect);
            }
        }

        let mut duration = None;
        let content_length = inner
            .info
            .as_ref()
            .and_then(|info| info.response_headers.content_length());
        match content_length {
            Some(length) => {
                // For a range response this is the span requested, not the
                // resource size.
                if inner.content_size == 0 {
                    inner.content_size = inner.request_position + length;
                }
                if inner.seekable == Seekability::Unknown {
                    inner.seekable = Seekability::Seekable;
                }
                duration = Some(inner.request_position + length);
            }
            None => {
                debug!(uri, "No Content-Length in the response");
                inner.seekable = Seekability::NotSeekable;
            }
        }

        let publish = inner.info.clone().map(|info| PublishSet {
            info,
            duration,
            content_type: inner.content_type.take(),
        });
        Outcome::Proceed(publish)
    }

    /// Take every buffered body byte, returning it with its stream offset.
    ///
    /// Only readable states deliver; `None` otherwise or when empty.
    pub fn take_body(&self) -> Option<(Bytes, u64)> {
        let mut inner = self.lock();
        if !matches!(inner.state, SlotState::Ok | SlotState::Done) || inner.body.is_empty() {
            return None;
        }
        let chunk = inner.body.split().freeze();
        let offset = inner.read_position;
        inner.read_position += chunk.len() as u64;
        inner.data_received = true;
        self.space.notify_one();
        Some((chunk, offset))
    }

    /// When the transfer completed and the buffer is drained, reset the
    /// attempt state and report end-of-stream.
    pub fn finish_if_done(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SlotState::Done || !inner.body.is_empty() {
            return false;
        }
        inner.reset_attempt();
        true
    }

    /// Reset the attempt state ahead of a retry. The retry budget and seek
    /// positions are preserved; response state and buffered bytes are not.
    pub fn reset_for_retry(&self) {
        let mut inner = self.lock();
        inner.reset_attempt();
        inner.body.clear();
        self.space.notify_one();
    }

    /// Decrement the retry budget, returning the new value. Never retried
    /// past zero; negative budgets mean unlimited and simply go more
    /// negative.
    pub fn decrement_retries(&self) -> i32 {
        let mut inner = self.lock();
        inner.retries_remaining -= 1;
        inner.retries_remaining
    }

    /// The remaining retry budget (observable for tests).
    pub fn retries_remaining(&self) -> i32 {
        self.lock().retries_remaining
    }

    /// Replace the retry budget (the URI was replaced).
    pub fn reset_retries(&self, total: i32) {
        self.lock().retries_remaining = total;
    }

    /// Current slot state, for error mapping in the pull loop.
    pub fn state(&self) -> SlotState {
        self.lock().state
    }

    /// Force the unrecoverable-error state.
    pub fn mark_total_error(&self) {
        self.lock().state = SlotState::TotalError;
    }

    /// Mark the element shut down; any later pull maps this to an error.
    pub fn mark_pipeline_null(&self) {
        let mut inner = self.lock();
        inner.state = SlotState::PipelineNull;
        inner.body.clear();
        self.cond.notify_one();
        self.space.notify_one();
    }

    //
    // Seek / unlock surface
    //

    /// Update the byte range for the next attempt.
    ///
    /// Refused while unlocking, when the resource is known unseekable, or
    /// when the range is malformed. A no-op seek to the current positions
    /// succeeds without touching anything.
    pub fn seek(&self, start: u64, stop: i64) -> Result<(), SourceError> {
        let mut inner = self.lock();
        debug!(start, stop, "do_seek");
        if inner.state == SlotState::Unlock {
            warn!("Attempt to seek while unlocked");
            return Err(SourceError::Flushing);
        }
        if inner.request_position == start && inner.stop_position == stop {
            debug!("Seek to current read/end position");
            return Ok(());
        }
        if inner.seekable == Seekability::NotSeekable {
            warn!("Not seekable");
            return Err(SourceError::config("resource is not seekable"));
        }
        if stop >= 0 && (stop as u64) < start {
            return Err(SourceError::config(format!(
                "malformed range {start}..{stop}"
            )));
        }
        if inner.content_size > 0 && start >= inner.content_size {
            warn!("Potentially seeking beyond end of file, might EOS immediately");
        }
        inner.request_position = start;
        inner.stop_position = stop;
        Ok(())
    }

    /// Requested start/stop byte positions `(inclusive, exclusive; -1 open)`.
    pub fn positions(&self) -> (u64, i64) {
        let inner = self.lock();
        (inner.request_position, inner.stop_position)
    }

    /// Last observed total resource size, 0 when unknown.
    pub fn content_size(&self) -> u64 {
        self.lock().content_size
    }

    /// Whether the resource is believed to accept range requests.
    /// Unknown counts as seekable.
    pub fn is_seekable(&self) -> bool {
        self.lock().seekable != Seekability::NotSeekable
    }

    /// Cancel the current pull: park the state, mark the connection for
    /// removal when one is running, wake everyone. Returns `true` when the
    /// scheduler needs a removal signal.
    pub fn unlock(&self) -> bool {
        let mut inner = self.lock();
        let mut want_removal = false;
        if inner.state != SlotState::Unlock {
            if inner.state == SlotState::Ok {
                if inner.connection_status == ConnectionStatus::Connected {
                    inner.connection_status = ConnectionStatus::WantRemoval;
                }
                want_removal = true;
            }
            inner.pending_state = inner.state;
            inner.state = SlotState::Unlock;
        }
        self.cond.notify_one();
        self.space.notify_one();
        want_removal
    }

    /// Finish the unlock: restore the parked state and wake the pull loop.
    pub fn unlock_stop(&self) {
        let mut inner = self.lock();
        inner.state = inner.pending_state;
        inner.pending_state = SlotState::None;
        self.cond.notify_one();
    }

    /// Block until the scheduler no longer references this slot.
    pub async fn await_not_connected(&self) {
        loop {
            let notified = self.cond.notified();
            {
                let inner = self.lock();
                if inner.connection_status == ConnectionStatus::NotConnected {
                    return;
                }
            }
            notified.await;
        }
    }

    //
    // Scheduler side
    //

    /// The scheduler's view of this slot.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock().connection_status
    }

    /// The scheduler accepted the enqueue.
    pub(crate) fn set_connected(&self) {
        self.lock().connection_status = ConnectionStatus::Connected;
    }

    /// Ask the scheduler to detach a running transfer.
    pub(crate) fn request_removal(&self) {
        let mut inner = self.lock();
        if inner.connection_status == ConnectionStatus::Connected {
            inner.connection_status = ConnectionStatus::WantRemoval;
        }
    }

    /// The worker detached the transfer before completion.
    pub(crate) fn mark_removed(&self) {
        let mut inner = self.lock();
        if inner.state == SlotState::Unlock {
            inner.pending_state = SlotState::Removed;
        } else {
            inner.state = SlotState::Removed;
        }
        inner.connection_status = ConnectionStatus::NotConnected;
        self.cond.notify_one();
        self.space.notify_one();
    }

    /// The scheduler refused the enqueue (slot already present).
    pub(crate) fn mark_bad_request(&self) {
        let mut inner = self.lock();
        if inner.state == SlotState::Unlock {
            inner.pending_state = SlotState::BadRequest;
        } else {
            inner.state = SlotState::BadRequest;
        }
        inner.connection_status = ConnectionStatus::NotConnected;
        self.cond.notify_one();
    }

    /// The transfer future finished; record the result and wake the puller.
    pub(crate) fn complete_transfer(&self, result: Result<(), TransferFailure>) {
        let mut inner = self.lock();
        if let Err(failure) = result {
            inner.failure = Some(failure);
        }
        if inner.state == SlotState::Unlock {
            inner.pending_state = SlotState::Done;
        } else if inner.state == SlotState::Ok {
            inner.state = SlotState::Done;
        }
        inner.connection_status = ConnectionStatus::NotConnected;
        self.cond.notify_one();
        self.space.notify_one();
    }

    //
    // Transport callbacks
    //

    /// Record a status line. Headers from a previous status line of the
    /// same attempt (1xx, trailers) are discarded first.
    pub(crate) fn apply_status_line(&self, code: u16, reason: &str) {
        let mut inner = self.lock();
        if inner.state == SlotState::Unlock || inner.info.is_none() {
            return;
        }
        if inner.status_code > 0 {
            if let Some(info) = inner.info.as_mut() {
                info.response_headers.clear();
            }
        }
        inner.status_code = code;
        inner.reason_phrase = reason.to_owned();
        if let Some(info) = inner.info.as_mut() {
            info.status_code = code;
        }
        info!(status = code, reason, "Received status line");
        inner.headers_updated = true;
    }

    /// Accumulate one response header and apply its side effects
    /// (seekability, total size, content type).
    pub(crate) fn apply_header(&self, key: &str, value: &str) {
        let mut inner = self.lock();
        if inner.state == SlotState::Unlock || inner.info.is_none() {
            trace!(key, "Ignoring header outside an active attempt");
            return;
        }
        let key_lower = key.to_ascii_lowercase();
        if let Some(info) = inner.info.as_mut() {
            info.response_headers.insert(&key_lower, value);
        }
        match key_lower.as_str() {
            "content-type" => {
                inner.content_type = Some(value.trim().to_owned());
            }
            "accept-ranges" if value.trim().eq_ignore_ascii_case("none") => {
                inner.seekable = Seekability::NotSeekable;
            }
            "content-range" => {
                if let Some(total) = parse_content_range_total(value) {
                    inner.content_size = total;
                }
            }
            _ => {}
        }
        inner.headers_updated = true;
    }

    /// Record the effective URL the transport ended up reading from.
    pub(crate) fn record_effective_uri(&self, uri: &str) {
        self.lock().effective_uri = Some(uri.to_owned());
    }

    /// Append body bytes, honouring the high watermark. A parked push
    /// resumes when the consumer drains the buffer or the slot leaves the
    /// running state.
    pub(crate) async fn push_body(&self, chunk: &[u8]) -> BodyPush {
        loop {
            let space = self.space.notified();
            {
                let mut inner = self.lock();
                match inner.state {
                    SlotState::Unlock => return BodyPush::Discarded,
                    SlotState::Ok => {
                        let high = inner.high_watermark;
                        if high == 0 || inner.body.len() < high {
                            inner.body.extend_from_slice(chunk);
                            self.cond.notify_one();
                            return BodyPush::Stored;
                        }
                        trace!(buffered = inner.body.len(), "Body buffer at high watermark");
                    }
                    _ => return BodyPush::Discarded,
                }
            }
            space.await;
        }
    }

}

impl SlotInner {
    fn reset_attempt(&mut self) {
        self.state = SlotState::None;
        self.transfer_begun = false;
        self.headers_updated = false;
        self.status_code = 0;
        self.reason_phrase.clear();
        self.info = None;
        self.content_type = None;
        self.failure = None;
    }

    /// Effective URI when it differs from the request URI.
    fn effective_redirect(&self, uri: &str) -> Option<String> {
        self.effective_uri
            .as_deref()
            .filter(|effective| !effective.eq_ignore_ascii_case(uri))
            .map(str::to_owned)
    }
}
