//! Asynchronous STREAM events and their delivery loop.

use super::ControlError;
use crate::circuit::CircuitId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stream status keyword
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    Other(String),
}

impl From<&str> for StreamStatus {
    fn from(value: &str) -> Self {
        match value {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "REMAP" => Self::Remap,
            "SENTCONNECT" => Self::SentConnect,
            "SENTRESOLVE" => Self::SentResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            other => Self::Other(other.to_string()),
        }
    }
}

/// `650 STREAM <id> <status> <circuit> <target> [...]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: String,
    pub status: StreamStatus,

    /// `None` while the stream is not attached to a circuit
    pub circuit_id: Option<CircuitId>,

    pub target: String,
    pub raw: String,
}

impl StreamEvent {
    /// Parse the text of a 650 line, starting at the `STREAM` keyword
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let mut tokens = text.split_whitespace();
        if tokens.next() != Some("STREAM") {
            return Err(ControlError::Protocol(format!("not a stream event: {:?}", text)));
        }

        let mut field = |name: &str| {
            tokens
                .next()
                .ok_or_else(|| ControlError::Protocol(format!("stream event lacks {}: {:?}", name, text)))
        };

        let stream_id = field("stream id")?.to_string();
        let status = StreamStatus::from(field("status")?);
        let circuit_id = CircuitId::from_event_field(field("circuit id")?);
        let target = field("target")?.to_string();

        Ok(Self {
            stream_id,
            status,
            circuit_id,
            target,
            raw: text.to_string(),
        })
    }

    /// Succeeded and attached to a circuit we can inspect
    pub fn is_attached_success(&self) -> bool {
        self.status == StreamStatus::Succeeded && self.circuit_id.is_some()
    }
}

/// Receives stream events on the delivery task
#[async_trait]
pub trait StreamEventHandler: Send + Sync {
    async fn handle(&self, event: StreamEvent) -> anyhow::Result<()>;
}

/// Deliver events to `handler` until the queue closes.
///
/// Each event runs on its own task so a failing or panicking handler
/// only loses that event.
pub fn spawn_event_listener(
    mut events: mpsc::Receiver<StreamEvent>,
    handler: Arc<dyn StreamEventHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let stream_id = event.stream_id.clone();
            let handler = handler.clone();
            match tokio::spawn(async move { handler.handle(event).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(stream = %stream_id, error = %e, "Stream event handler failed"),
                Err(e) => warn!(stream = %stream_id, error = %e, "Stream event handler panicked"),
            }
        }
        debug!("Stream event queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_succeeded_event() {
        let event =
            StreamEvent::parse("STREAM 12 SUCCEEDED 5 example.com:443 SOURCE_ADDR=127.0.0.1:5000")
                .unwrap();
        assert_eq!(event.stream_id, "12");
        assert_eq!(event.status, StreamStatus::Succeeded);
        assert_eq!(event.circuit_id, Some(CircuitId(5)));
        assert_eq!(event.target, "example.com:443");
        assert!(event.is_attached_success());
    }

    #[test]
    fn test_parse_unattached_event() {
        let event = StreamEvent::parse("STREAM 13 NEW 0 example.org:80").unwrap();
        assert_eq!(event.status, StreamStatus::New);
        assert_eq!(event.circuit_id, None);
        assert!(!event.is_attached_success());
    }

    #[test]
    fn test_parse_rejects_other_events() {
        assert!(StreamEvent::parse("CIRC 5 BUILT").is_err());
        assert!(StreamEvent::parse("STREAM 13 NEW").is_err());
    }

    struct Flaky {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl StreamEventHandler for Flaky {
        async fn handle(&self, event: StreamEvent) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match event.stream_id.as_str() {
                "1" => anyhow::bail!("lookup failed"),
                "2" => panic!("handler bug"),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_listener_survives_handler_failures() {
        let (tx, rx) = mpsc::channel(8);
        let handler = Arc::new(Flaky {
            seen: AtomicUsize::new(0),
        });
        let listener = spawn_event_listener(rx, handler.clone());

        for id in ["1", "2", "3"] {
            let text = format!("STREAM {} SUCCEEDED 7 example.com:443", id);
            tx.send(StreamEvent::parse(&text).unwrap()).await.unwrap();
        }
        drop(tx);

        listener.await.unwrap();
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
    }
}
