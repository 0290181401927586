use crate::domain::models::{AggregationStage, DashboardSnapshot, SuggestionSet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

const DEFAULT_HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DashboardEvent {
    Stage {
        stage: AggregationStage,
        message: String,
    },
    Failed {
        stage: AggregationStage,
        reason: String,
    },
    Snapshot {
        snapshot: Box<DashboardSnapshot>,
    },
    TaskOptimized {
        task_id: String,
        suggestions: SuggestionSet,
        processed: usize,
        total: usize,
    },
    Log {
        level: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Receiver of aggregation progress. Emitting never fails and never blocks.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: DashboardEvent);

    /// Polled before each suggestion request starts.
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: DashboardEvent) {}
}

/// Process-wide fan-out of dashboard events; dropping a receiver unsubscribes it.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<DashboardEvent>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: DashboardEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.publish(DashboardEvent::Log {
            level: level.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

impl ProgressSink for ProgressHub {
    fn emit(&self, event: DashboardEvent) {
        self.publish(event);
    }
}

/// Per-request sink: events go to the requesting stream and are mirrored to the hub.
///
/// Once the request's receiver is dropped the sink reports cancellation.
#[derive(Debug)]
pub struct RequestSink {
    sender: mpsc::UnboundedSender<DashboardEvent>,
    hub: Option<ProgressHub>,
}

impl RequestSink {
    pub fn new(hub: Option<ProgressHub>) -> (Self, mpsc::UnboundedReceiver<DashboardEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, hub }, receiver)
    }
}

impl ProgressSink for RequestSink {
    fn emit(&self, event: DashboardEvent) {
        if let Some(hub) = &self.hub {
            hub.publish(event.clone());
        }
        let _ = self.sender.send(event);
    }

    fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }
}
