use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::broadcast;
use tracing::trace;

use crate::core::{domain::FlowStatusEvent, ports::StatusPublisher};

const TOPIC_CAPACITY: usize = 64;

/// One broadcast topic per flow id. Delivery is best effort: a lagging or absent
/// observer simply misses events.
#[derive(Debug, Default)]
pub struct StatusBroadcaster {
    topics: Mutex<HashMap<String, broadcast::Sender<FlowStatusEvent>>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<FlowStatusEvent>>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribes to one flow. Topics whose observers have all left are pruned first.
    pub fn subscribe(&self, flow_id: &str) -> broadcast::Receiver<FlowStatusEvent> {
        let mut topics = self.topics();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        topics
            .entry(flow_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }
}

impl StatusPublisher for StatusBroadcaster {
    fn publish(&self, event: FlowStatusEvent) {
        let mut topics = self.topics();
        let Some(sender) = topics.get(&event.flow_id) else {
            return;
        };
        let flow_id = event.flow_id.clone();
        match sender.send(event) {
            Ok(observers) => trace!(%flow_id, observers, "status published"),
            // Every observer left: drop the topic.
            Err(_) => {
                topics.remove(&flow_id);
            }
        }
    }
}
