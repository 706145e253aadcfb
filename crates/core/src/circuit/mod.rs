mod inspector;
mod types;

pub use inspector::{CircuitInspector, ExitReport, InspectError, StreamEventLogger, UNKNOWN_COUNTRY};
pub use types::{
    Circuit, CircuitHop, CircuitId, CircuitRef, CircuitStatus, RelayInfo, RouterStatus,
};
