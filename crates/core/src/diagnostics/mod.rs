/// Bandwidth and connection diagnostics
///
/// Sampled once per rotation tick. Every field is optional: a failed
/// query leaves its field empty and is logged, never propagated.

mod connections;

pub use connections::{
    system_resolver, Connection, ConnectionResolver, ProcNetResolver, ResolveError, TcpState,
    UnsupportedResolver,
};

use crate::control::TorControl;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use torrotate_common::ByteCount;
use tracing::{debug, info, warn};

/// Point-in-time view of Tor's traffic and sockets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub pid: u32,
    pub bytes_read: Option<ByteCount>,
    pub bytes_written: Option<ByteCount>,
    pub uptime: Option<Duration>,
    pub effective_rate: Option<ByteCount>,
    pub connections: Option<Vec<Connection>>,
}

impl DiagnosticsSnapshot {
    pub fn log(&self) {
        info!(
            pid = self.pid,
            read = %display_or_dash(&self.bytes_read),
            written = %display_or_dash(&self.bytes_written),
            uptime_secs = self.uptime.map(|u| u.as_secs()),
            rate = %display_or_dash(&self.effective_rate),
            connections = self.connections.as_ref().map(Vec::len),
            "Tor diagnostics"
        );
        for connection in self.connections.iter().flatten() {
            debug!(pid = self.pid, connection = %connection, "Tor connection");
        }
    }
}

fn display_or_dash<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

pub struct DiagnosticsReporter<C: ?Sized> {
    control: Arc<C>,
    pid: u32,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    unsupported_reported: AtomicBool,
}

impl<C: TorControl + ?Sized> DiagnosticsReporter<C> {
    pub fn new(control: Arc<C>, pid: u32, resolver: Option<Arc<dyn ConnectionResolver>>) -> Self {
        Self {
            control,
            pid,
            resolver,
            unsupported_reported: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn sample(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            pid: self.pid,
            bytes_read: logged("traffic/read", self.control.traffic_read().await),
            bytes_written: logged("traffic/written", self.control.traffic_written().await),
            uptime: logged("uptime", self.control.uptime().await),
            effective_rate: logged("effective rate", self.control.effective_rate().await).flatten(),
            connections: self.connections(),
        }
    }

    fn connections(&self) -> Option<Vec<Connection>> {
        let resolver = self.resolver.as_ref()?;
        match resolver.connections(self.pid) {
            Ok(connections) => Some(connections),
            Err(ResolveError::Unsupported) => {
                if !self.unsupported_reported.swap(true, Ordering::Relaxed) {
                    warn!("Connection diagnostics are unsupported on this platform");
                }
                None
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Could not list Tor connections");
                None
            }
        }
    }
}

fn logged<T, E: std::fmt::Display>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(query = what, error = %e, "Diagnostics query failed");
            None
        }
    }
}
