//! A `SinkWriter` that captures every batch it's handed instead of writing
//! it anywhere, shared by the scenario tests that need to observe what
//! `ChannelManager` delivered.

use crate::channel::SinkWriter;
use shared::metrics::Metric;
use std::sync::{Arc, Mutex};

pub(crate) struct MockSink {
    pub(crate) captured: Arc<Mutex<Vec<Metric>>>,
}

impl MockSink {
    pub(crate) fn new() -> (Arc<Self>, Arc<Mutex<Vec<Metric>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                captured: captured.clone(),
            }),
            captured,
        )
    }
}

#[async_trait::async_trait]
impl SinkWriter for MockSink {
    async fn write(&self, metrics: &[Metric]) -> shared::Result<()> {
        self.captured.lock().unwrap().extend_from_slice(metrics);
        Ok(())
    }
}
