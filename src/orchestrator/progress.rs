use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use super::state::{PipelineState, PipelineStatus};

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub query_id: String,
    pub node: String,
    pub status: PipelineStatus,
    pub progress: f64,
    pub fact_count: usize,
}

impl ProgressUpdate {
    pub fn from_state(state: &PipelineState) -> Self {
        Self {
            query_id: state.query_id.clone(),
            node: state.current_node.clone().unwrap_or_default(),
            status: state.status,
            progress: state.status.progress(),
            fact_count: state.verified_fact_count(),
        }
    }
}

/// Receives progress as the pipeline moves between nodes.
///
/// Called inline by the driver, so implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, update: &ProgressUpdate);
}

/// Fans updates out over a broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    sender: broadcast::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver for updates published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }
}

impl ProgressSink for ChannelProgressSink {
    fn publish(&self, update: &ProgressUpdate) {
        // No subscribers is fine
        let _ = self.sender.send(update.clone());
    }
}

/// Writes updates to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn publish(&self, update: &ProgressUpdate) {
        info!(
            query_id = %update.query_id,
            node = %update.node,
            status = %update.status,
            progress = update.progress,
            facts = update.fact_count,
            "Pipeline progress"
        );
    }
}
