use super::types::{Circuit, CircuitId, CircuitRef, RelayInfo};
use crate::control::{ControlError, StreamEvent, StreamEventHandler, TorControl};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use torrotate_common::Fingerprint;
use tracing::{debug, warn};

/// Country reported when the GeoIP lookup fails
pub const UNKNOWN_COUNTRY: &str = "unknown";

/// Why a circuit could not be resolved to its exit relay
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("circuit {0} not found")]
    CircuitNotFound(CircuitId),

    #[error("circuit {0} has no hops")]
    ZeroHops(CircuitId),

    #[error("no network status for exit {fingerprint}: {source}")]
    Descriptor {
        fingerprint: Fingerprint,
        #[source]
        source: ControlError,
    },

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Outcome for one circuit of an inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExitReport {
    Resolved(RelayInfo),
    Failed {
        circuit_id: Option<CircuitId>,
        error: String,
    },
}

impl ExitReport {
    pub fn relay(&self) -> Option<&RelayInfo> {
        match self {
            Self::Resolved(info) => Some(info),
            Self::Failed { .. } => None,
        }
    }
}

/// Resolves circuits to the metadata of their exit relay
pub struct CircuitInspector<C: ?Sized> {
    control: Arc<C>,
}

impl<C: TorControl + ?Sized> CircuitInspector<C> {
    pub fn new(control: Arc<C>) -> Self {
        Self { control }
    }

    /// Resolve a circuit id to its exit relay
    pub async fn resolve(&self, id: CircuitId) -> Result<RelayInfo, InspectError> {
        let circuit = self
            .control
            .circuit(id)
            .await?
            .ok_or(InspectError::CircuitNotFound(id))?;
        self.resolve_circuit(&circuit).await
    }

    /// Resolve an already-listed circuit; the exit is always the last hop
    pub async fn resolve_circuit(&self, circuit: &Circuit) -> Result<RelayInfo, InspectError> {
        let exit = circuit.exit_hop().ok_or(InspectError::ZeroHops(circuit.id))?;

        let status = self
            .control
            .network_status(&exit.fingerprint)
            .await
            .map_err(|source| InspectError::Descriptor {
                fingerprint: exit.fingerprint,
                source,
            })?;

        let country = self.country_or_unknown(&status.address).await;

        Ok(RelayInfo {
            address: status.address,
            or_port: status.or_port,
            fingerprint: exit.fingerprint,
            nickname: status.nickname,
            country,
        })
    }

    /// Resolve one circuit or every listed circuit, one report each
    pub async fn resolve_ref(&self, circuit_ref: CircuitRef) -> Vec<ExitReport> {
        match circuit_ref {
            CircuitRef::Id(id) => vec![report(Some(id), self.resolve(id).await)],
            CircuitRef::All => {
                let circuits = match self.control.circuits().await {
                    Ok(circuits) => circuits,
                    Err(e) => {
                        warn!(error = %e, "Could not list circuits");
                        return vec![ExitReport::Failed {
                            circuit_id: None,
                            error: e.to_string(),
                        }];
                    }
                };
                debug!(count = circuits.len(), "Inspecting circuits");

                let mut reports = Vec::with_capacity(circuits.len());
                for circuit in &circuits {
                    if circuit.hop_count() == 0 {
                        debug!(circuit = %circuit.id, status = ?circuit.status, "Skipping circuit without hops");
                        continue;
                    }
                    reports.push(report(Some(circuit.id), self.resolve_circuit(circuit).await));
                }
                reports
            }
        }
    }

    async fn country_or_unknown(&self, address: &str) -> String {
        match self.control.country_for(address).await {
            Ok(code) => code,
            Err(e) => {
                debug!(address = %address, error = %e, "Country lookup failed");
                UNKNOWN_COUNTRY.to_string()
            }
        }
    }
}

fn report(circuit_id: Option<CircuitId>, result: Result<RelayInfo, InspectError>) -> ExitReport {
    match result {
        Ok(info) => ExitReport::Resolved(info),
        Err(e) => {
            warn!(circuit = ?circuit_id, error = %e, "Circuit resolution failed");
            ExitReport::Failed {
                circuit_id,
                error: e.to_string(),
            }
        }
    }
}

/// Logs a JSON record for every stream event, resolving the exit of
/// successfully attached streams.
pub struct StreamEventLogger<C: ?Sized> {
    inspector: CircuitInspector<C>,
    control: Arc<C>,
}

impl<C: TorControl + ?Sized> StreamEventLogger<C> {
    pub fn new(control: Arc<C>) -> Self {
        Self {
            inspector: CircuitInspector::new(control.clone()),
            control,
        }
    }

    /// Build the diagnostic record for one event
    pub async fn record_for(&self, event: &StreamEvent) -> anyhow::Result<serde_json::Value> {
        let pid = self.control.pid().await.ok();

        let Some(circuit_id) = event.circuit_id.filter(|_| event.is_attached_success()) else {
            return Ok(serde_json::json!({
                "target": event.target,
                "pid": pid,
                "raw_event": event.raw,
            }));
        };

        let relay = self.inspector.resolve(circuit_id).await?;
        Ok(serde_json::json!({
            "target": event.target,
            "pid": pid,
            "circuit_id": circuit_id,
            "connect": relay.endpoint(),
            "fingerprint": relay.fingerprint,
            "nickname": relay.nickname,
            "locale": relay.country,
            "raw_event": event.raw,
        }))
    }
}

#[async_trait]
impl<C: TorControl + ?Sized + 'static> StreamEventHandler for StreamEventLogger<C> {
    async fn handle(&self, event: StreamEvent) -> anyhow::Result<()> {
        let record = self.record_for(&event).await?;
        debug!(stream = %event.stream_id, record = %record, "Stream event");
        Ok(())
    }
}
