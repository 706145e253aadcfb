/// Tor process supervision
///
/// Launches Tor with a declarative configuration and, when the first
/// launch fails, sweeps stray processes with the same binary name and
/// retries exactly once. A second failure is fatal.

mod launcher;
mod process_table;

pub use launcher::{wait_for_bootstrap, TorLauncher, TorProcessLauncher};
pub use process_table::{ProcessTable, SystemProcessTable};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use torrotate_common::config::host_port;
use torrotate_common::{RotateError, RotatorConfig};
use tracing::{error, info, warn};

/// Launch failures
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tor did not finish bootstrapping within {0:?}")]
    LaunchTimeout(Duration),

    #[error("Tor exited before bootstrapping: {0}")]
    ExitedEarly(String),

    #[error("launch failed twice (first: {first}; retry: {second})")]
    RetryExhausted {
        first: Box<LaunchError>,
        second: Box<LaunchError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<LaunchError> for RotateError {
    fn from(err: LaunchError) -> Self {
        RotateError::launch(err.to_string())
    }
}

/// Options handed to Tor on its command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub binary: PathBuf,
    pub bind_address: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub exit_node_locales: String,
    pub log_sinks: Vec<String>,
    pub bootstrap_timeout: Duration,
}

impl LaunchConfig {
    pub fn from_config(config: &RotatorConfig) -> Self {
        Self {
            binary: config.tor_binary.clone(),
            bind_address: config.bind_address.clone(),
            socks_port: config.socks_port,
            control_port: config.control_port,
            exit_node_locales: config.exit_node_locales.clone(),
            log_sinks: config.log_sinks.clone(),
            bootstrap_timeout: config.bootstrap_timeout(),
        }
    }

    /// Command-line torrc options, e.g. `--SocksPort 127.0.0.1:9050`
    pub fn torrc_args(&self) -> Vec<String> {
        let mut args = vec![
            "--SocksPort".to_string(),
            host_port(&self.bind_address, self.socks_port),
            "--ControlPort".to_string(),
            host_port(&self.bind_address, self.control_port),
            "--ExitNodes".to_string(),
            self.exit_node_locales.clone(),
        ];
        for sink in &self.log_sinks {
            args.push("--Log".to_string());
            args.push(sink.clone());
        }
        args
    }

    /// Executable name used to find stray processes
    pub fn process_name(&self) -> String {
        self.binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.to_string_lossy().into_owned())
    }
}

/// A running Tor process. Dropping the handle leaves the process running.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    config: LaunchConfig,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn new(pid: u32, config: LaunchConfig) -> Self {
        Self {
            pid,
            config,
            child: None,
        }
    }

    pub(crate) fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Whether a process we spawned has exited; always `false` for adopted pids
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    /// Give up ownership so Tor outlives the daemon
    pub fn disown(self) -> u32 {
        info!(pid = self.pid, "Leaving Tor running");
        self.pid
    }
}

/// Launches Tor and performs the single kill-and-retry recovery
pub struct ProcessSupervisor {
    config: LaunchConfig,
    launcher: Arc<dyn TorLauncher>,
    processes: Arc<dyn ProcessTable>,
}

impl ProcessSupervisor {
    pub fn new(
        config: LaunchConfig,
        launcher: Arc<dyn TorLauncher>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            config,
            launcher,
            processes,
        }
    }

    /// Supervisor backed by the real process launcher and `/proc`
    pub fn system(config: LaunchConfig) -> Self {
        Self::new(
            config,
            Arc::new(TorProcessLauncher),
            Arc::new(SystemProcessTable::new()),
        )
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// One launch attempt
    pub async fn launch(&self) -> Result<ProcessHandle, LaunchError> {
        self.launcher.launch(&self.config).await
    }

    /// Kill every process with Tor's binary name, then launch once more.
    ///
    /// This also kills unrelated Tor instances on the host, so it only runs
    /// after a launch has already failed.
    pub async fn restart(&self) -> Result<ProcessHandle, LaunchError> {
        let killed = self.kill_strays();
        info!(killed, name = %self.config.process_name(), "Swept stray Tor processes");
        self.launch().await
    }

    /// Launch, falling back to exactly one restart. Failure here is fatal.
    pub async fn start(&self) -> Result<ProcessHandle, LaunchError> {
        let first = match self.launch().await {
            Ok(handle) => {
                info!(pid = handle.pid(), "Tor launched");
                return Ok(handle);
            }
            Err(e) => e,
        };

        error!(
            error = %first,
            "Failed to launch Tor, killing running {} processes and retrying",
            self.config.process_name()
        );

        match self.restart().await {
            Ok(handle) => {
                info!(pid = handle.pid(), "Launched Tor after killing running processes");
                Ok(handle)
            }
            Err(second) => {
                error!(error = %second, "Failed to launch Tor again");
                Err(LaunchError::RetryExhausted {
                    first: Box::new(first),
                    second: Box::new(second),
                })
            }
        }
    }

    fn kill_strays(&self) -> usize {
        let name = self.config.process_name();
        let pids = match self.processes.list_processes(&name) {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, name = %name, "Could not list processes");
                return 0;
            }
        };

        let mut killed = 0;
        for pid in pids {
            match self.processes.kill(pid) {
                Ok(()) => {
                    info!(pid, name = %name, "Killed process");
                    killed += 1;
                }
                Err(e) => warn!(pid, name = %name, error = %e, "Failed to kill process"),
            }
        }
        killed
    }
}
