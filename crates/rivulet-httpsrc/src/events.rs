//! Downstream Event Seam
//!
//! The surrounding pipeline framework is an external collaborator; this
//! module defines the narrow surface the source element pushes through.
//! Implementations are expected to be cheap and non-blocking: every hook is
//! invoked from the consumer's pull loop, never from the scheduler worker.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 3: Internal module imports
use crate::headers::TransferInfo;

/// Hooks invoked by the source element as a transfer progresses.
///
/// `headers` corresponds to the sticky event that rides alongside the data
/// stream until replaced; `element_message` is the same structure posted to
/// the message bus. Both fire at most once per attempt, just before the
/// first body chunk of that attempt is returned.
pub trait StreamEvents: Send + Sync {
    /// Sticky event: response metadata for the transfer now producing data.
    fn headers(&self, info: &TransferInfo) {
        let _ = info;
    }

    /// Bus message carrying the same structure as [`StreamEvents::headers`].
    fn element_message(&self, info: &TransferInfo) {
        let _ = info;
    }

    /// A Content-Length was learned; `total` is the full resource size.
    fn duration_changed(&self, total: u64) {
        let _ = total;
    }

    /// The response carried a `content-type` header; downstream caps may
    /// need renegotiating.
    fn content_type_changed(&self, content_type: &str) {
        let _ = content_type;
    }
}

/// Event sink that discards everything; the default when none is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl StreamEvents for NullEvents {}

/// Shared handle to an installed event sink
pub type EventsHandle = Arc<dyn StreamEvents>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        headers_seen: Mutex<Vec<u16>>,
        durations: Mutex<Vec<u64>>,
    }

    impl StreamEvents for Recording {
        fn headers(&self, info: &TransferInfo) {
            self.headers_seen.lock().unwrap().push(info.status_code);
        }

        fn duration_changed(&self, total: u64) {
            self.durations.lock().unwrap().push(total);
        }
    }

    #[test]
    fn test_default_hooks_are_no_ops() {
        let info = TransferInfo::new("http://example.test/", BTreeMap::new());
        let sink = NullEvents;
        sink.headers(&info);
        sink.element_message(&info);
        sink.duration_changed(10);
        sink.content_type_changed("video/mp4");
    }

    #[test]
    fn test_overridden_hooks_receive_values() {
        let sink = Recording::default();
        let mut info = TransferInfo::new("http://example.test/", BTreeMap::new());
        info.status_code = 206;
        sink.headers(&info);
        sink.duration_changed(1234);
        assert_eq!(*sink.headers_seen.lock().unwrap(), vec![206]);
        assert_eq!(*sink.durations.lock().unwrap(), vec![1234]);
    }
}
