//! Rivulet HTTP Source
//!
//! A pluggable HTTP/1.x-HTTP/2 client source element for pull-based
//! streaming pipelines: many concurrent downloads multiplexed over one
//! shared worker task, with cancellation, retry, byte-range seeking and
//! optional backpressure.
//!
//! # Architecture
//!
//! The implementation is organized in layers around one worker:
//!
//! - **Scheduler** (`scheduler`): the reference-counted, process-wide worker
//!   that drives every active transfer cooperatively. Consumers post
//!   commands to its input channel; it is the only code that starts, polls
//!   or detaches transfers.
//! - **Slot** (`slot`): per-request state shared between the consumer's
//!   pull loop and the worker: the life-cycle state machine, the response
//!   accumulator and the rendezvous primitives.
//! - **Transport** (`transport`): translates a slot snapshot into the HTTP
//!   client's option set, one handle per transfer attempt.
//! - **Source** (`source`): the consumer-facing element: configure, start,
//!   pull chunks, seek, unlock, stop.
//!
//! ```text
//! HttpSource --commands--> scheduler worker --drives--> transfers
//!     ^                         |
//!     '----- slot (state, body buffer, wakeups) <------'
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rivulet_httpsrc::{Fetched, HttpSource, SchedulerRegistry, SourceConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // One registry per process; every element shares its worker.
//! let registry = SchedulerRegistry::new();
//!
//! let source = HttpSource::new(registry, SourceConfig::new().compress(true))?;
//! source.set_uri("https://example.test/video.bin")?;
//! source.start()?;
//!
//! loop {
//!     match source.create_next_chunk().await? {
//!         Fetched::Chunk(chunk) => {
//!             println!("{} bytes at offset {}", chunk.bytes.len(), chunk.offset);
//!         }
//!         Fetched::Eos => break,
//!         Fetched::Flushing => break,
//!     }
//! }
//!
//! source.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Seeking
//!
//! When the server honours range requests, [`HttpSource::seek`] repositions
//! the next pull: the element detaches any running transfer and rebuilds it
//! with a `Range` header. External positions use an exclusive end; the
//! inclusive HTTP convention is an internal detail of the transport layer.
//!
//! # Cancellation
//!
//! [`HttpSource::unlock`] cancels the current pull deterministically: the
//! pulling task returns [`Fetched::Flushing`], buffered bytes are dropped,
//! and the worker detaches the transfer. [`HttpSource::unlock_stop`]
//! restores the element; the transfer is not resumed, because partial-body
//! delivery is never permitted.

// Configuration and error surface
pub mod config;
pub mod error;

// Response model and downstream seam
pub mod events;
pub mod headers;

// Core machinery
pub mod scheduler;
pub mod slot;
pub mod source;

mod transport;

// Re-export commonly used types for convenience
pub use config::{default_user_agent, HttpVersion, SourceConfig};
pub use error::{SourceError, SourceResult};
pub use events::{EventsHandle, NullEvents, StreamEvents};
pub use headers::{HeaderTable, TransferInfo};
pub use scheduler::SchedulerRegistry;
pub use slot::{ConnectionStatus, RequestSlot, Seekability, SlotState};
pub use source::{Chunk, Fetched, HttpSource, SUPPORTED_SCHEMES};

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the crate version as a string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_public_api() {
        let registry = SchedulerRegistry::new();
        let source = HttpSource::new(registry, SourceConfig::new()).unwrap();
        assert!(source.uri().is_none());
        assert!(SUPPORTED_SCHEMES.contains(&"http"));
        assert!(SUPPORTED_SCHEMES.contains(&"https"));
    }

    #[test]
    fn test_version_info() {
        assert!(!version().is_empty());
        assert_eq!(version(), VERSION);
        assert!(default_user_agent().ends_with(VERSION));
    }
}
