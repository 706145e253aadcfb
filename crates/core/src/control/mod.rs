/// Tor control channel
///
/// An authenticated control-port session plus the typed queries the
/// rotation loop needs. Commands are serialized over one connection;
/// asynchronous events are split off by a reader task and delivered on
/// their own queue so event handling never blocks the command path.

mod error;
pub mod events;
pub mod protocol;
mod session;

pub use error::ControlError;
pub use events::{spawn_event_listener, StreamEvent, StreamEventHandler, StreamStatus};
pub use protocol::{Reply, ReplyLine};
pub use session::{ControlSession, ProtocolInfo, SessionState};

use crate::circuit::{Circuit, CircuitId, CircuitRef, RouterStatus};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use torrotate_common::{ByteCount, Fingerprint};

/// Operations the rest of the daemon needs from a control session.
///
/// Implementors supply the four raw primitives; the typed queries are
/// built on top of `get_info`/`get_conf`.
#[async_trait]
pub trait TorControl: Send + Sync {
    /// `GETINFO <key>`
    async fn get_info(&self, key: &str) -> Result<String, ControlError>;

    /// `GETCONF <key>`; `None` when the option is unset
    async fn get_conf(&self, key: &str) -> Result<Option<String>, ControlError>;

    /// `SIGNAL NEWNYM`
    async fn signal_newnym(&self) -> Result<CircuitRef, ControlError>;

    /// Time until Tor will honour another NEWNYM; zero when available now
    async fn newnym_wait(&self) -> Duration;

    /// `SETEVENTS STREAM`, handing back the queue events arrive on
    async fn subscribe_stream_events(&self) -> Result<mpsc::Receiver<StreamEvent>, ControlError>;

    /// `true` once the connection to Tor is gone for good
    async fn is_closed(&self) -> bool {
        false
    }

    async fn is_newnym_available(&self) -> bool {
        self.newnym_wait().await.is_zero()
    }

    async fn traffic_read(&self) -> Result<ByteCount, ControlError> {
        parse_count(&self.get_info("traffic/read").await?)
    }

    async fn traffic_written(&self) -> Result<ByteCount, ControlError> {
        parse_count(&self.get_info("traffic/written").await?)
    }

    async fn pid(&self) -> Result<u32, ControlError> {
        let raw = self.get_info("process/pid").await?;
        raw.trim()
            .parse()
            .map_err(|_| ControlError::Protocol(format!("bad pid {:?}", raw)))
    }

    async fn uptime(&self) -> Result<Duration, ControlError> {
        let raw = self.get_info("uptime").await?;
        raw.trim()
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ControlError::Protocol(format!("bad uptime {:?}", raw)))
    }

    /// Country code for an address via Tor's GeoIP database
    async fn country_for(&self, address: &str) -> Result<String, ControlError> {
        let code = self.get_info(&format!("ip-to-country/{}", address)).await?;
        let code = code.trim();
        if code.is_empty() {
            return Err(ControlError::Protocol(format!(
                "empty country for {}",
                address
            )));
        }
        Ok(code.to_string())
    }

    /// Every circuit Tor lists; malformed lines are skipped
    async fn circuits(&self) -> Result<Vec<Circuit>, ControlError> {
        let listing = self.get_info("circuit-status").await?;
        let circuits = listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match Circuit::parse_status_line(line) {
                Ok(circuit) => Some(circuit),
                Err(e) => {
                    tracing::warn!(line = %line, error = %e, "Skipping unparseable circuit");
                    None
                }
            })
            .collect();
        Ok(circuits)
    }

    async fn circuit(&self, id: CircuitId) -> Result<Option<Circuit>, ControlError> {
        Ok(self.circuits().await?.into_iter().find(|c| c.id == id))
    }

    async fn network_status(&self, fingerprint: &Fingerprint) -> Result<RouterStatus, ControlError> {
        let document = self.get_info(&format!("ns/id/{}", fingerprint)).await?;
        RouterStatus::parse(&document)
    }

    /// Lowest configured rate limit, or `None` when nothing limits Tor
    async fn effective_rate(&self) -> Result<Option<ByteCount>, ControlError> {
        let mut lowest: Option<u64> = None;
        for option in ["BandwidthRate", "RelayBandwidthRate", "MaxAdvertisedBandwidth"] {
            let Some(raw) = self.get_conf(option).await? else {
                continue;
            };
            let value = parse_count(&raw)?.as_bytes();
            if value > 0 {
                lowest = Some(lowest.map_or(value, |current| current.min(value)));
            }
        }
        Ok(lowest.map(ByteCount))
    }
}

fn parse_count(raw: &str) -> Result<ByteCount, ControlError> {
    raw.parse()
        .map_err(|_| ControlError::Protocol(format!("bad byte count {:?}", raw)))
}
