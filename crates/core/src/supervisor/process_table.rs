use std::io;
use std::path::{Path, PathBuf};

/// Kernel limit on `comm` length, excluding the trailing NUL
const COMM_MAX_LEN: usize = 15;

/// Lookup and termination of host processes by executable name
pub trait ProcessTable: Send + Sync {
    /// Pids whose executable name matches `name`, never including our own
    fn list_processes(&self, name: &str) -> io::Result<Vec<u32>>;

    /// Forcefully terminate a process
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// Process table read from procfs
#[derive(Debug, Clone)]
pub struct SystemProcessTable {
    proc_root: PathBuf,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list_processes(&self, name: &str) -> io::Result<Vec<u32>> {
        let wanted = comm_name(name);
        let own_pid = std::process::id();
        let mut pids = Vec::new();

        for entry in std::fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            // Processes can exit between listing and reading
            let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            if comm.trim_end_matches('\n') == wanted {
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        Ok(pids)
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "killing processes is only supported on unix",
        ))
    }
}

/// Name as the kernel reports it in `/proc/<pid>/comm`
fn comm_name(name: &str) -> &str {
    match name.char_indices().nth(COMM_MAX_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}
