//! Shared fixtures for the transfer scenario tests.
#![allow(dead_code)]

use std::sync::Mutex;

use rivulet_httpsrc::{StreamEvents, TransferInfo};

/// Event sink that records everything the element publishes downstream.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    pub sticky: Mutex<Vec<TransferInfo>>,
    pub messages: Mutex<Vec<TransferInfo>>,
    pub durations: Mutex<Vec<u64>>,
    pub content_types: Mutex<Vec<String>>,
}

impl StreamEvents for RecordingEvents {
    fn headers(&self, info: &TransferInfo) {
        self.sticky.lock().unwrap().push(info.clone());
    }

    fn element_message(&self, info: &TransferInfo) {
        self.messages.lock().unwrap().push(info.clone());
    }

    fn duration_changed(&self, total: u64) {
        self.durations.lock().unwrap().push(total);
    }

    fn content_type_changed(&self, content_type: &str) {
        self.content_types.lock().unwrap().push(content_type.to_owned());
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
