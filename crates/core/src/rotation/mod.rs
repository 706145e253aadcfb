/// Periodic identity rotation
///
/// The scheduler ticks at a fixed interval, waits out Tor's NEWNYM rate
/// limit, signals a new identity, resolves the resulting exits and
/// optionally verifies the externally visible address.

mod event;
mod probe;
mod scheduler;

pub use event::{RotationEvent, RotationLog};
pub use probe::{extract_ip, ExitIpProbe, HttpExitProbe, ProbeError};
pub use scheduler::{RotationScheduler, RotationSettings, SchedulerState, TickOutcome};
