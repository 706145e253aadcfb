//! In-memory control port used by unit tests.

use crate::circuit::CircuitRef;
use crate::control::{ControlError, StreamEvent, TorControl};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) struct FakeTor {
    info: HashMap<String, String>,
    conf: HashMap<String, String>,
    newnym_window: Duration,
    blocked_until: Option<Instant>,
    last_newnym: Mutex<Option<Instant>>,
    signals: Mutex<Vec<Instant>>,
    violations: Mutex<usize>,
    events: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    event_tx: mpsc::Sender<StreamEvent>,
    closed: AtomicBool,
}

impl FakeTor {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(16);
        Self {
            info: HashMap::new(),
            conf: HashMap::new(),
            newnym_window: Duration::ZERO,
            blocked_until: None,
            last_newnym: Mutex::new(None),
            signals: Mutex::new(Vec::new()),
            violations: Mutex::new(0),
            events: Mutex::new(Some(event_rx)),
            event_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_info(mut self, key: &str, value: &str) -> Self {
        self.info.insert(key.to_string(), value.to_string());
        self
    }

    pub fn without_info(mut self, key: &str) -> Self {
        self.info.remove(key);
        self
    }

    pub fn with_conf(mut self, key: &str, value: &str) -> Self {
        self.conf.insert(key.to_string(), value.to_string());
        self
    }

    /// Enforce a minimum spacing between NEWNYM signals
    pub fn with_newnym_window(mut self, window: Duration) -> Self {
        self.newnym_window = window;
        self
    }

    /// Report NEWNYM as unavailable for `wait` from now
    pub fn blocked_for(mut self, wait: Duration) -> Self {
        self.blocked_until = Some(Instant::now() + wait);
        self
    }

    /// Drop the connection; every later command fails with `ConnectionClosed`
    pub fn hang_up(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), ControlError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ControlError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    pub fn event_sender(&self) -> mpsc::Sender<StreamEvent> {
        self.event_tx.clone()
    }

    pub fn signal_times(&self) -> Vec<Instant> {
        self.signals.lock().unwrap().clone()
    }

    pub fn violations(&self) -> usize {
        *self.violations.lock().unwrap()
    }
}

#[async_trait]
impl TorControl for FakeTor {
    async fn get_info(&self, key: &str) -> Result<String, ControlError> {
        self.ensure_open()?;
        self.info.get(key).cloned().ok_or_else(|| ControlError::Rejected {
            status: 552,
            message: format!("Unrecognized key \"{}\"", key),
        })
    }

    async fn get_conf(&self, key: &str) -> Result<Option<String>, ControlError> {
        self.ensure_open()?;
        Ok(self.conf.get(key).cloned())
    }

    async fn signal_newnym(&self) -> Result<CircuitRef, ControlError> {
        self.ensure_open()?;
        let wait = self.newnym_wait().await;
        if !wait.is_zero() {
            *self.violations.lock().unwrap() += 1;
            return Err(ControlError::RateLimited(wait));
        }
        let now = Instant::now();
        *self.last_newnym.lock().unwrap() = Some(now);
        self.signals.lock().unwrap().push(now);
        Ok(CircuitRef::All)
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn newnym_wait(&self) -> Duration {
        let now = Instant::now();
        let blocked = self
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        let windowed = self
            .last_newnym
            .lock()
            .unwrap()
            .map(|last| (last + self.newnym_window).saturating_duration_since(now))
            .unwrap_or_default();
        blocked.max(windowed)
    }

    async fn subscribe_stream_events(&self) -> Result<mpsc::Receiver<StreamEvent>, ControlError> {
        self.events
            .lock()
            .unwrap()
            .take()
            .ok_or(ControlError::AlreadySubscribed)
    }
}
