//! Authenticated control-port session.

use super::events::StreamEvent;
use super::protocol::{self, Reply};
use super::{ControlError, TorControl};
use crate::circuit::CircuitRef;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use torrotate_common::config::control;
use tracing::{debug, info, trace, warn};

/// Connection state of a control session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Closed,
}

/// Write half plus the queue of replies to our commands
struct CommandChannel {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Reply>,
    /// Replies still due for commands that timed out
    owed: usize,
}

/// A control-port session; share it behind an `Arc`
pub struct ControlSession {
    addr: String,
    channel: Mutex<CommandChannel>,
    stream_events: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    state: Arc<RwLock<SessionState>>,
    subscriptions: RwLock<Vec<String>>,
    last_newnym: RwLock<Option<Instant>>,
    query_timeout: Duration,
    reader: JoinHandle<()>,
}

impl ControlSession {
    /// Connect to a control port. The session starts out `Connected`.
    pub async fn connect(addr: &str, query_timeout: Duration) -> Result<Self, ControlError> {
        let stream = timeout(query_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ControlError::Connect {
                addr: addr.to_string(),
                reason: format!("no answer within {:?}", query_timeout),
            })?
            .map_err(|e| ControlError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(control::EVENT_QUEUE_CAPACITY);
        let state = Arc::new(RwLock::new(SessionState::Connected));

        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            reply_tx,
            event_tx,
            state.clone(),
        ));

        debug!(addr = %addr, "Connected to control port");

        Ok(Self {
            addr: addr.to_string(),
            channel: Mutex::new(CommandChannel {
                writer: write_half,
                replies: reply_rx,
                owed: 0,
            }),
            stream_events: Mutex::new(Some(event_rx)),
            state,
            subscriptions: RwLock::new(Vec::new()),
            last_newnym: RwLock::new(None),
            query_timeout,
            reader,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.clone()
    }

    /// Send one command and wait for its reply. Only one command is in flight at a time.
    async fn command(&self, line: &str) -> Result<Reply, ControlError> {
        if self.state().await == SessionState::Closed {
            return Err(ControlError::ConnectionClosed);
        }

        let mut channel = self.channel.lock().await;

        trace!(verb = line.split_whitespace().next().unwrap_or(""), "Sending control command");
        channel
            .writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        channel.writer.flush().await?;

        // Tor answers in order, so replies owed to timed-out commands come first.
        while channel.owed > 0 {
            let late = self.next_reply(&mut channel).await?;
            channel.owed -= 1;
            debug!(status = late.status(), "Discarding late control reply");
        }

        self.next_reply(&mut channel).await?.into_result()
    }

    /// Receive one reply. On timeout the reply is counted as owed.
    async fn next_reply(&self, channel: &mut CommandChannel) -> Result<Reply, ControlError> {
        match timeout(self.query_timeout, channel.replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ControlError::ConnectionClosed),
            Err(_) => {
                channel.owed += 1;
                Err(ControlError::Timeout(self.query_timeout))
            }
        }
    }

    async fn authenticated_command(&self, line: &str) -> Result<Reply, ControlError> {
        match self.state().await {
            SessionState::Authenticated => self.command(line).await,
            SessionState::Closed => Err(ControlError::ConnectionClosed),
            SessionState::Connected => Err(ControlError::NotAuthenticated),
        }
    }

    /// `PROTOCOLINFO 1`
    pub async fn protocol_info(&self) -> Result<ProtocolInfo, ControlError> {
        let reply = self.command("PROTOCOLINFO 1").await?;
        Ok(ProtocolInfo::parse(&reply))
    }

    /// Authenticate with NULL or cookie auth, whichever Tor offers.
    ///
    /// Every failure maps to `AuthenticationFailed`; there are no other
    /// credentials to fall back on.
    pub async fn authenticate(&self) -> Result<(), ControlError> {
        let info = self
            .protocol_info()
            .await
            .map_err(|e| ControlError::AuthenticationFailed(format!("PROTOCOLINFO: {}", e)))?;

        debug!(
            methods = ?info.auth_methods,
            cookie_file = ?info.cookie_file,
            tor_version = ?info.tor_version,
            "Tor auth methods"
        );

        let command = if info.supports("NULL") {
            "AUTHENTICATE".to_string()
        } else if info.supports("COOKIE") {
            let path = info.cookie_file.as_deref().ok_or_else(|| {
                ControlError::AuthenticationFailed("cookie auth offered without a cookie file".into())
            })?;
            let cookie = tokio::fs::read(path).await.map_err(|e| {
                ControlError::AuthenticationFailed(format!("reading cookie {}: {}", path, e))
            })?;
            format!("AUTHENTICATE {}", hex::encode(cookie))
        } else {
            return Err(ControlError::AuthenticationFailed(format!(
                "no usable auth method among {:?}",
                info.auth_methods
            )));
        };

        self.command(&command)
            .await
            .map_err(|e| ControlError::AuthenticationFailed(e.to_string()))?;

        {
            let mut state = self.state.write().await;
            if *state == SessionState::Closed {
                return Err(ControlError::ConnectionClosed);
            }
            *state = SessionState::Authenticated;
        }
        info!(addr = %self.addr, "Authenticated with Tor control port");
        Ok(())
    }

    /// Send `QUIT` and mark the session closed. Tor itself keeps running.
    pub async fn close(&self) {
        if self.state().await == SessionState::Closed {
            return;
        }
        if let Err(e) = self.command("QUIT").await {
            debug!(error = %e, "QUIT not acknowledged");
        }
        *self.state.write().await = SessionState::Closed;
        self.reader.abort();
        info!(addr = %self.addr, "Control session closed");
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl TorControl for ControlSession {
    async fn get_info(&self, key: &str) -> Result<String, ControlError> {
        let reply = self.authenticated_command(&format!("GETINFO {}", key)).await?;
        reply
            .value_for(key)
            .ok_or_else(|| ControlError::Protocol(format!("GETINFO reply lacks {}", key)))
    }

    async fn get_conf(&self, key: &str) -> Result<Option<String>, ControlError> {
        let reply = self.authenticated_command(&format!("GETCONF {}", key)).await?;
        Ok(reply.value_for(key).filter(|value| !value.is_empty()))
    }

    async fn signal_newnym(&self) -> Result<CircuitRef, ControlError> {
        let wait = self.newnym_wait().await;
        if !wait.is_zero() {
            return Err(ControlError::RateLimited(wait));
        }

        self.authenticated_command("SIGNAL NEWNYM").await?;
        *self.last_newnym.write().await = Some(Instant::now());
        Ok(CircuitRef::All)
    }

    async fn is_closed(&self) -> bool {
        self.state().await == SessionState::Closed
    }

    async fn newnym_wait(&self) -> Duration {
        let window = Duration::from_secs(control::NEWNYM_RATE_LIMIT_SECS);
        match *self.last_newnym.read().await {
            Some(last) => window.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    async fn subscribe_stream_events(&self) -> Result<mpsc::Receiver<StreamEvent>, ControlError> {
        let mut slot = self.stream_events.lock().await;
        if slot.is_none() {
            return Err(ControlError::AlreadySubscribed);
        }

        self.authenticated_command("SETEVENTS STREAM").await?;
        self.subscriptions.write().await.push("STREAM".to_string());

        slot.take().ok_or(ControlError::AlreadySubscribed)
    }
}

/// Route replies to the command path and events to the event queue.
async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    replies: mpsc::Sender<Reply>,
    events: mpsc::Sender<StreamEvent>,
    state: Arc<RwLock<SessionState>>,
) {
    loop {
        match protocol::read_reply(&mut reader).await {
            Ok(Some(reply)) if reply.is_async_event() => dispatch_event(&reply, &events),
            Ok(Some(reply)) => {
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("Tor closed the control connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Control connection read failed");
                break;
            }
        }
    }
    *state.write().await = SessionState::Closed;
}

fn dispatch_event(reply: &Reply, events: &mpsc::Sender<StreamEvent>) {
    if !reply.first_text().starts_with("STREAM ") {
        trace!(event = %reply.first_text(), "Ignoring unsubscribed event");
        return;
    }
    match StreamEvent::parse(reply.first_text()) {
        Ok(event) => {
            if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
                warn!(stream = %event.stream_id, "Event queue full, dropping stream event");
            }
        }
        Err(e) => debug!(error = %e, "Unparseable stream event"),
    }
}

/// Information from a PROTOCOLINFO response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<String>,
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    pub fn parse(reply: &Reply) -> Self {
        let mut info = Self::default();

        for line in &reply.lines {
            if let Some(auth) = line.text.strip_prefix("AUTH ") {
                if let Some(methods) = auth.split_whitespace().find_map(|t| t.strip_prefix("METHODS=")) {
                    info.auth_methods = methods.split(',').map(String::from).collect();
                }
                if let Some(start) = auth.find("COOKIEFILE=\"") {
                    let rest = &auth[start + 12..];
                    if let Some(end) = rest.find('"') {
                        info.cookie_file = Some(rest[..end].to_string());
                    }
                }
            } else if let Some(version) = line.text.strip_prefix("VERSION Tor=\"") {
                info.tor_version = version.split('"').next().map(String::from);
            }
        }

        info
    }

    pub fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}
