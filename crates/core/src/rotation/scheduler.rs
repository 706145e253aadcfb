use super::event::{RotationEvent, RotationLog};
use super::probe::{extract_ip, ExitIpProbe};
use crate::circuit::{CircuitInspector, ExitReport};
use crate::control::{spawn_event_listener, ControlError, StreamEventHandler, TorControl};
use crate::diagnostics::DiagnosticsReporter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use torrotate_common::config::{control, rotation};
use torrotate_common::{RotatorConfig, Timestamp};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    WaitingForWindow,
    Signaling,
    Verifying,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Rotated(RotationEvent),
    Skipped { iteration: u64, reason: String },
    /// The control connection is gone; no later tick can succeed
    ConnectionLost { iteration: u64 },
}

/// Timing and verification knobs for the rotation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSettings {
    pub interval: Duration,
    pub safety_margin: Duration,
    pub verify_exit_ip: bool,
}

impl RotationSettings {
    pub fn from_config(config: &RotatorConfig) -> Self {
        Self {
            interval: config.ip_lifetime(),
            safety_margin: Duration::from_secs(control::NEWNYM_SAFETY_MARGIN_SECS),
            verify_exit_ip: config.output_circuit_ip,
        }
    }
}

pub struct RotationScheduler<C: ?Sized> {
    control: Arc<C>,
    inspector: CircuitInspector<C>,
    settings: RotationSettings,
    diagnostics: Option<DiagnosticsReporter<C>>,
    probe: Option<Arc<dyn ExitIpProbe>>,
    event_handler: Option<Arc<dyn StreamEventHandler>>,
    log: RotationLog,
    iteration: u64,
    state: SchedulerState,
}

impl<C: TorControl + ?Sized> RotationScheduler<C> {
    pub fn new(control: Arc<C>, settings: RotationSettings) -> Self {
        Self {
            inspector: CircuitInspector::new(control.clone()),
            control,
            settings,
            diagnostics: None,
            probe: None,
            event_handler: None,
            log: RotationLog::new(),
            iteration: 0,
            state: SchedulerState::Idle,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsReporter<C>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Probe used when exit-IP verification is enabled
    pub fn with_probe(mut self, probe: Arc<dyn ExitIpProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Handler for STREAM events, registered when the loop starts
    pub fn with_event_handler(mut self, handler: Arc<dyn StreamEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn log(&self) -> RotationLog {
        self.log.clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    /// Tick every interval until `shutdown` flips to `true` or its sender drops.
    ///
    /// The first tick fires one full interval after start. A tick in
    /// progress when shutdown arrives is abandoned. Losing the control
    /// connection ends the loop with `ControlError::ConnectionClosed`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControlError> {
        let listener = self.start_event_listener().await;

        let ceiling = Duration::from_secs(rotation::MAX_IP_LIFETIME_SECS);
        if self.settings.interval > ceiling {
            warn!(
                interval_secs = self.settings.interval.as_secs(),
                ceiling_secs = ceiling.as_secs(),
                "Rotation interval capped"
            );
        }
        let interval = self.settings.interval.min(ceiling);
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = interval.as_secs(),
            verify = self.settings.verify_exit_ip,
            "Rotation loop started"
        );

        let mut result = Ok(());
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        outcome = self.tick() => {
                            log_outcome(&outcome);
                            if matches!(outcome, TickOutcome::ConnectionLost { .. }) {
                                result = Err(ControlError::ConnectionClosed);
                                break;
                            }
                        }
                        _ = shutdown.changed() => {
                            info!(iteration = self.iteration, "Abandoning rotation for shutdown");
                            self.state = SchedulerState::Idle;
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(listener) = listener {
            listener.abort();
        }
        info!(iterations = self.iteration, "Rotation loop stopped");
        result
    }

    async fn start_event_listener(&self) -> Option<JoinHandle<()>> {
        let handler = self.event_handler.clone()?;
        match self.control.subscribe_stream_events().await {
            Ok(events) => Some(spawn_event_listener(events, handler)),
            Err(e) => {
                warn!(error = %e, "Could not subscribe to stream events");
                None
            }
        }
    }

    /// One rotation: diagnostics, rate-limit wait, NEWNYM, resolution and verification
    pub async fn tick(&mut self) -> TickOutcome {
        self.iteration += 1;
        let iteration = self.iteration;

        if self.control.is_closed().await {
            return TickOutcome::ConnectionLost { iteration };
        }

        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.sample().await.log();
        }

        self.state = SchedulerState::WaitingForWindow;
        if !self.await_newnym_window().await {
            self.state = SchedulerState::Idle;
            return TickOutcome::Skipped {
                iteration,
                reason: "NEWNYM still rate limited".to_string(),
            };
        }

        self.state = SchedulerState::Signaling;
        let circuit_ref = match self.control.signal_newnym().await {
            Ok(circuit_ref) => circuit_ref,
            Err(e) => {
                self.state = SchedulerState::Idle;
                if matches!(e, ControlError::ConnectionClosed) || self.control.is_closed().await {
                    debug!(iteration, error = %e, "NEWNYM failed on a closed connection");
                    return TickOutcome::ConnectionLost { iteration };
                }
                return TickOutcome::Skipped {
                    iteration,
                    reason: format!("NEWNYM failed: {}", e),
                };
            }
        };
        info!(iteration, "Requested new identity");

        let exits = self.inspector.resolve_ref(circuit_ref).await;
        for report in &exits {
            log_exit(iteration, report);
        }

        let exit_ip = match self.probe.clone() {
            Some(probe) if self.settings.verify_exit_ip => {
                self.state = SchedulerState::Verifying;
                verify(iteration, probe.as_ref()).await
            }
            _ => None,
        };

        let event = RotationEvent {
            timestamp: Timestamp::now(),
            iteration,
            exits,
            exit_ip,
        };
        self.log.append(event.clone()).await;
        self.state = SchedulerState::Idle;
        TickOutcome::Rotated(event)
    }

    /// Wait out the NEWNYM rate limit once; `false` if it is still closed afterwards
    async fn await_newnym_window(&self) -> bool {
        if self.control.is_newnym_available().await {
            return true;
        }

        let wait = self.control.newnym_wait().await;
        let pause = wait + self.settings.safety_margin;
        info!(
            wait_ms = wait.as_millis() as u64,
            pause_ms = pause.as_millis() as u64,
            "NEWNYM rate limited, waiting"
        );
        sleep(pause).await;

        self.control.is_newnym_available().await
    }
}

async fn verify(iteration: u64, probe: &dyn ExitIpProbe) -> Option<String> {
    match probe.fetch().await {
        Ok(body) => {
            info!(iteration, body = %body.trim(), "Exit IP verification");
            extract_ip(&body)
        }
        Err(e) => {
            warn!(iteration, error = %e, "Exit IP verification failed");
            None
        }
    }
}

fn log_exit(iteration: u64, report: &ExitReport) {
    match report {
        ExitReport::Resolved(relay) => info!(
            iteration,
            connect = %relay.endpoint(),
            fingerprint = %relay.fingerprint,
            nickname = %relay.nickname,
            locale = %relay.country,
            "Exit relay"
        ),
        ExitReport::Failed { circuit_id, error } => {
            debug!(iteration, circuit = ?circuit_id, error = %error, "Exit unresolved")
        }
    }
}

fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Rotated(event) => debug!(
            iteration = event.iteration,
            exits = event.exits.len(),
            resolved = event.resolved_count(),
            "Rotation complete"
        ),
        TickOutcome::Skipped { iteration, reason } => {
            warn!(iteration, reason = %reason, "Rotation skipped")
        }
        TickOutcome::ConnectionLost { iteration } => {
            error!(iteration, "Control connection lost, stopping rotation")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitRef;
    use crate::control::{ControlError, StreamEvent};
    use crate::rotation::ProbeError;
    use crate::test_support::FakeTor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const EXIT: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";

    fn tor() -> FakeTor {
        FakeTor::new()
            .with_info("circuit-status", &format!("5 BUILT ${}~exit PURPOSE=GENERAL", EXIT))
            .with_info(
                &format!("ns/id/{}", EXIT),
                "r exit x y 2024-01-01 00:00:00 10.0.0.3 443 0",
            )
            .with_info("ip-to-country/10.0.0.3", "ru")
    }

    fn settings(interval_secs: u64, verify_exit_ip: bool) -> RotationSettings {
        RotationSettings {
            interval: Duration::from_secs(interval_secs),
            safety_margin: Duration::from_secs(1),
            verify_exit_ip,
        }
    }

    struct CountingProbe {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingProbe {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ExitIpProbe for CountingProbe {
        async fn fetch(&self) -> Result<String, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProbeError::Status(503))
            } else {
                Ok(r#"{"ip":"185.16.101.43"}"#.to_string())
            }
        }
    }

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl StreamEventHandler for CountingHandler {
        async fn handle(&self, _event: StreamEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_rotations_in_twenty_seconds() {
        let mut scheduler = RotationScheduler::new(Arc::new(tor()), settings(5, false));
        let log = scheduler.log();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        sleep(Duration::from_millis(20_500)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let events = log.snapshot().await;
        assert_eq!(events.len(), 4);
        assert_eq!(
            events.iter().map(|e| e.iteration).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(events[0].exits[0].relay().unwrap().country, "ru");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rotation_before_first_interval() {
        let mut scheduler = RotationScheduler::new(Arc::new(tor()), settings(5, false));
        let log = scheduler.log();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        sleep(Duration::from_millis(4_900)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert!(log.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_rate_limit_with_margin() {
        let control = Arc::new(tor().blocked_for(Duration::from_secs(3)));
        let mut scheduler = RotationScheduler::new(control.clone(), settings(5, false));

        let started = Instant::now();
        let outcome = scheduler.tick().await;

        assert!(matches!(outcome, TickOutcome::Rotated(_)));
        let signals = control.signal_times();
        assert_eq!(signals.len(), 1);
        assert!(signals[0] - started >= Duration::from_secs(4));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_tick_when_still_limited() {
        let mut scheduler = RotationScheduler::new(Arc::new(StubbornTor(tor())), settings(5, false));

        let started = Instant::now();
        let outcome = scheduler.tick().await;

        assert!(matches!(outcome, TickOutcome::Skipped { iteration: 1, .. }));
        assert_eq!(Instant::now() - started, Duration::from_secs(3));
        assert!(scheduler.log().is_empty().await);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    /// Reports a short wait but never opens the window
    struct StubbornTor(FakeTor);

    #[async_trait]
    impl TorControl for StubbornTor {
        async fn get_info(&self, key: &str) -> Result<String, ControlError> {
            self.0.get_info(key).await
        }

        async fn get_conf(&self, key: &str) -> Result<Option<String>, ControlError> {
            self.0.get_conf(key).await
        }

        async fn signal_newnym(&self) -> Result<CircuitRef, ControlError> {
            panic!("NEWNYM sent while rate limited");
        }

        async fn newnym_wait(&self) -> Duration {
            Duration::from_secs(2)
        }

        async fn subscribe_stream_events(&self) -> Result<mpsc::Receiver<StreamEvent>, ControlError> {
            self.0.subscribe_stream_events().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signals_inside_rate_window() {
        let control = Arc::new(tor().with_newnym_window(Duration::from_secs(10)));
        let mut scheduler = RotationScheduler::new(control.clone(), settings(5, false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        sleep(Duration::from_secs(60)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(control.violations(), 0);
        let signals = control.signal_times();
        assert!(signals.len() >= 4);
        for pair in signals.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_disabled_makes_no_requests() {
        let probe = CountingProbe::new(false);
        let mut scheduler = RotationScheduler::new(Arc::new(tor()), settings(5, false))
            .with_probe(probe.clone());

        let TickOutcome::Rotated(event) = scheduler.tick().await else {
            panic!("expected rotation");
        };
        assert_eq!(event.exit_ip, None);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_records_exit_ip() {
        let probe = CountingProbe::new(false);
        let mut scheduler = RotationScheduler::new(Arc::new(tor()), settings(5, true))
            .with_probe(probe.clone());

        let TickOutcome::Rotated(event) = scheduler.tick().await else {
            panic!("expected rotation");
        };
        assert_eq!(event.exit_ip.as_deref(), Some("185.16.101.43"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_still_records_rotation() {
        let probe = CountingProbe::new(true);
        let mut scheduler = RotationScheduler::new(Arc::new(tor()), settings(5, true))
            .with_probe(probe.clone());
        let log = scheduler.log();

        let TickOutcome::Rotated(event) = scheduler.tick().await else {
            panic!("expected rotation");
        };
        assert_eq!(event.exit_ip, None);
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_events_reach_handler() {
        let control = Arc::new(tor());
        let events = control.event_sender();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let mut scheduler = RotationScheduler::new(control, settings(3600, false))
            .with_event_handler(handler.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        sleep(Duration::from_millis(10)).await;
        for line in ["STREAM 1 NEW 0 a.example:443", "STREAM 1 SUCCEEDED 5 a.example:443"] {
            events.send(StreamEvent::parse(line).unwrap()).await.unwrap();
        }
        sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_ends_loop() {
        let control = Arc::new(tor());
        let mut scheduler = RotationScheduler::new(control.clone(), settings(5, false));
        let log = scheduler.log();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        sleep(Duration::from_secs(7)).await;
        control.hang_up();

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("loop kept ticking after the connection closed")
            .unwrap();
        assert!(matches!(result, Err(ControlError::ConnectionClosed)));
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newnym_on_closed_connection_is_terminal() {
        let mut scheduler = RotationScheduler::new(Arc::new(ClosingTor(tor())), settings(5, false));

        let outcome = scheduler.tick().await;
        assert_eq!(outcome, TickOutcome::ConnectionLost { iteration: 1 });
        assert!(scheduler.log().is_empty().await);
    }

    /// Drops the connection while NEWNYM is in flight
    struct ClosingTor(FakeTor);

    #[async_trait]
    impl TorControl for ClosingTor {
        async fn get_info(&self, key: &str) -> Result<String, ControlError> {
            self.0.get_info(key).await
        }

        async fn get_conf(&self, key: &str) -> Result<Option<String>, ControlError> {
            self.0.get_conf(key).await
        }

        async fn signal_newnym(&self) -> Result<CircuitRef, ControlError> {
            self.0.hang_up();
            Err(ControlError::Io(std::io::ErrorKind::BrokenPipe.into()))
        }

        async fn newnym_wait(&self) -> Duration {
            Duration::ZERO
        }

        async fn subscribe_stream_events(&self) -> Result<mpsc::Receiver<StreamEvent>, ControlError> {
            self.0.subscribe_stream_events().await
        }

        async fn is_closed(&self) -> bool {
            self.0.is_closed().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_interval_is_capped() {
        let mut scheduler = RotationScheduler::new(Arc::new(tor()), settings(u64::MAX, false));
        let log = scheduler.log();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        sleep(Duration::from_secs(60)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert!(log.is_empty().await);
    }
}
