use super::{LaunchConfig, LaunchError, ProcessHandle};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use torrotate_common::config::launch;
use tracing::{debug, info, warn};

/// Starts a Tor process and waits for it to bootstrap
#[async_trait]
pub trait TorLauncher: Send + Sync {
    async fn launch(&self, config: &LaunchConfig) -> Result<ProcessHandle, LaunchError>;
}

/// Spawns the Tor binary as a child process
#[derive(Debug, Clone, Copy, Default)]
pub struct TorProcessLauncher;

#[async_trait]
impl TorLauncher for TorProcessLauncher {
    async fn launch(&self, config: &LaunchConfig) -> Result<ProcessHandle, LaunchError> {
        info!(
            binary = %config.binary.display(),
            socks_port = config.socks_port,
            control_port = config.control_port,
            exit_nodes = %config.exit_node_locales,
            "Launching Tor"
        );

        let mut child = Command::new(&config.binary)
            .args(config.torrc_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                binary: config.binary.clone(),
                source,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| LaunchError::ExitedEarly("process exited immediately".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::ExitedEarly("stdout not captured".to_string()))?;
        // Drained from the start so a chatty Tor never blocks on a full pipe.
        let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        let mut lines = BufReader::new(stdout).lines();
        match timeout(config.bootstrap_timeout, wait_for_bootstrap(&mut lines)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let status = child.wait().await.map(|s| s.to_string()).unwrap_or_default();
                let detail = match stderr_tail {
                    Some(task) => match timeout(STDERR_GRACE, task).await {
                        Ok(Ok(tail)) => tail.into_iter().collect::<Vec<_>>().join(" | "),
                        _ => String::new(),
                    },
                    None => String::new(),
                };
                warn!(pid, status = %status, stderr = %detail, "Tor exited during bootstrap");
                return Err(e);
            }
            Err(_) => {
                match reap(&mut child).await {
                    Some(status) => debug!(pid, status = %status, "Stalled Tor reaped"),
                    None => warn!(pid, "Stalled Tor did not exit after kill"),
                }
                return Err(LaunchError::LaunchTimeout(config.bootstrap_timeout));
            }
        }

        info!(pid, "Tor bootstrapped");

        tokio::spawn(drain(lines));

        Ok(ProcessHandle::new(pid, config.clone()).with_child(child))
    }
}

/// Read Tor's log output until it reports full bootstrap
pub async fn wait_for_bootstrap<R>(lines: &mut Lines<R>) -> Result<(), LaunchError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        debug!(target: "tor", "{}", line);
        if line.contains(launch::BOOTSTRAP_COMPLETE_MARKER) {
            return Ok(());
        }
    }
    Err(LaunchError::ExitedEarly(
        "output closed before bootstrap completed".to_string(),
    ))
}

/// How long to wait for a killed or crashed Tor to finish
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Lines of stderr kept for the early-exit report
const STDERR_TAIL_LINES: usize = 20;

/// Kill the child and wait briefly so it does not linger as a zombie
async fn reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Could not kill Tor");
    }
    timeout(STDERR_GRACE, child.wait()).await.ok()?.ok()
}

/// Log Tor's stderr as it arrives; returns the last lines once it closes
async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R) -> VecDeque<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "tor", "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

/// Forward Tor's stdout to our log for as long as it runs
async fn drain<R>(mut lines: Lines<R>)
where
    R: AsyncBufRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tor", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torrotate_common::RotatorConfig;

    #[tokio::test]
    async fn test_bootstrap_marker_found() {
        let output = "Jan 01 00:00:00.000 [notice] Bootstrapped 50% (loading_descriptors)\n\
                      Jan 01 00:00:01.000 [notice] Bootstrapped 100% (done): Done\n\
                      Jan 01 00:00:02.000 [notice] more\n";
        let mut lines = BufReader::new(output.as_bytes()).lines();
        wait_for_bootstrap(&mut lines).await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("Jan 01 00:00:02.000 [notice] more")
        );
    }

    #[tokio::test]
    async fn test_output_closed_before_bootstrap() {
        let output = "[notice] Bootstrapped 10% (conn)\n[err] Could not bind to 127.0.0.1:9050\n";
        let mut lines = BufReader::new(output.as_bytes()).lines();
        let err = wait_for_bootstrap(&mut lines).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let config = LaunchConfig::from_config(
            &RotatorConfig::new().with_tor_binary("/nonexistent/path/to/tor"),
        );
        let err = TorProcessLauncher.launch(&config).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_scripted_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let write_script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        let booting = write_script(
            "tor-ok",
            "echo '[notice] Bootstrapped 100% (done): Done'\nsleep 2",
        );
        let crashing = write_script("tor-crash", "echo 'bind failed' >&2\nexit 1");
        let stalling = write_script("tor-stall", "sleep 5");

        let mut config = LaunchConfig::from_config(&RotatorConfig::new().with_tor_binary(&booting));
        config.bootstrap_timeout = Duration::from_secs(5);
        let mut handle = TorProcessLauncher.launch(&config).await.unwrap();
        assert!(handle.pid() > 0);
        assert!(!handle.has_exited());

        config.binary = crashing;
        let err = TorProcessLauncher.launch(&config).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly(_)));

        config.binary = stalling;
        config.bootstrap_timeout = Duration::from_millis(300);
        let err = TorProcessLauncher.launch(&config).await.unwrap_err();
        assert!(matches!(err, LaunchError::LaunchTimeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_collects_killed_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let status = reap(&mut child).await.expect("child not reaped");
        assert!(!status.success());
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_drained_during_bootstrap() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tor-chatty");
        std::fs::write(
            &path,
            "#!/bin/sh
\
             yes '[warn] noisy' | head -n 20000 >&2
\
             echo '[notice] Bootstrapped 100% (done): Done'
\
             sleep 2
",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = LaunchConfig::from_config(&RotatorConfig::new().with_tor_binary(&path));
        config.bootstrap_timeout = Duration::from_secs(5);
        let handle = TorProcessLauncher.launch(&config).await.unwrap();
        assert!(handle.pid() > 0);
    }
}
