//! In-process topic pub/sub between the coordinator, the webhook endpoint
//! and the continuous deployment loop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use kiln_common::SettleReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    RepositoryPushed,
    BuildSettled,
    BuildSucceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    RepositoryPushed {
        repo_url: String,
        branch: String,
    },
    BuildSettled {
        application_id: String,
        build_id: String,
        reason: SettleReason,
    },
    /// `environment_id` is empty when the application has no deploy target.
    BuildSucceeded {
        environment_id: String,
        build_id: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::RepositoryPushed { .. } => Topic::RepositoryPushed,
            Self::BuildSettled { .. } => Topic::BuildSettled,
            Self::BuildSucceeded { .. } => Topic::BuildSucceeded,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire and forget. Events published with no subscribers are discarded.
    pub fn publish(&self, event: Event) {
        tracing::debug!(topic = ?event.topic(), "Publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.to_vec(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    topics: Vec<Topic>,
}

impl Subscription {
    /// Next event on a subscribed topic, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topics.contains(&event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event subscriber lagged, skipping missed events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
