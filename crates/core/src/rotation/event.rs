use crate::circuit::ExitReport;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use torrotate_common::config::rotation;
use torrotate_common::Timestamp;

/// Record of one completed rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationEvent {
    pub timestamp: Timestamp,
    pub iteration: u64,
    pub exits: Vec<ExitReport>,
    pub exit_ip: Option<String>,
}

impl RotationEvent {
    pub fn resolved_count(&self) -> usize {
        self.exits.iter().filter(|r| r.relay().is_some()).count()
    }
}

/// Most recent rotations, shared between the scheduler and readers.
///
/// Holds at most `capacity` events; appending to a full log evicts the oldest.
#[derive(Debug, Clone)]
pub struct RotationLog {
    events: Arc<RwLock<VecDeque<RotationEvent>>>,
    capacity: usize,
}

impl Default for RotationLog {
    fn default() -> Self {
        Self::with_capacity(rotation::ROTATION_LOG_CAPACITY)
    }
}

impl RotationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn append(&self, event: RotationEvent) {
        let mut events = self.events.write().await;
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events oldest first
    pub async fn snapshot(&self) -> Vec<RotationEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}
