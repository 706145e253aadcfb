pub mod circuit;
pub mod control;
pub mod diagnostics;
pub mod rotation;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export control types
pub use control::{
    spawn_event_listener, ControlError, ControlSession, SessionState, StreamEvent,
    StreamEventHandler, TorControl,
};

// Re-export circuit types
pub use circuit::{
    Circuit, CircuitId, CircuitInspector, CircuitRef, ExitReport, InspectError, RelayInfo,
    StreamEventLogger,
};

// Re-export scheduler types
pub use rotation::{
    ExitIpProbe, HttpExitProbe, RotationEvent, RotationLog, RotationScheduler, RotationSettings,
    TickOutcome,
};

pub use diagnostics::{system_resolver, ConnectionResolver, DiagnosticsReporter, DiagnosticsSnapshot};
pub use supervisor::{LaunchConfig, LaunchError, ProcessHandle, ProcessSupervisor};
