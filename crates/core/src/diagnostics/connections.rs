//! Per-process TCP connection table.
//!
//! A socket owned by a process shows up as a `socket:[<inode>]` link under
//! `/proc/<pid>/fd`. The inode is then matched against the rows of
//! `/proc/<pid>/net/tcp` and `tcp6`, which carry the endpoints and state.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("connection lookup is not supported on this platform")]
    Unsupported,

    #[error("malformed connection table entry: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// TCP state as numbered by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl TcpState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Established,
            0x02 => Self::SynSent,
            0x03 => Self::SynRecv,
            0x04 => Self::FinWait1,
            0x05 => Self::FinWait2,
            0x06 => Self::TimeWait,
            0x07 => Self::Close,
            0x08 => Self::CloseWait,
            0x09 => Self::LastAck,
            0x0A => Self::Listen,
            0x0B => Self::Closing,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Established => "ESTABLISHED",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
    pub inode: u64,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.local, self.remote, self.state)
    }
}

/// Lists the network connections held by a process
pub trait ConnectionResolver: Send + Sync {
    fn connections(&self, pid: u32) -> Result<Vec<Connection>, ResolveError>;
}

/// Resolver backed by procfs
#[derive(Debug, Clone)]
pub struct ProcNetResolver {
    proc_root: PathBuf,
}

impl ProcNetResolver {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn socket_inodes(&self, pid: u32) -> io::Result<HashSet<u64>> {
        let fd_dir = self.proc_root.join(pid.to_string()).join("fd");
        let mut inodes = HashSet::new();
        for entry in std::fs::read_dir(fd_dir)? {
            let entry = entry?;
            // Descriptors can close while we walk the directory
            let Ok(target) = std::fs::read_link(entry.path()) else {
                continue;
            };
            if let Some(inode) = socket_inode(&target.to_string_lossy()) {
                inodes.insert(inode);
            }
        }
        Ok(inodes)
    }
}

impl Default for ProcNetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionResolver for ProcNetResolver {
    fn connections(&self, pid: u32) -> Result<Vec<Connection>, ResolveError> {
        let inodes = self.socket_inodes(pid)?;
        let net_dir = self.proc_root.join(pid.to_string()).join("net");

        let mut connections = Vec::new();
        for (file, is_ipv6) in [("tcp", false), ("tcp6", true)] {
            let content = match std::fs::read_to_string(net_dir.join(file)) {
                Ok(content) => content,
                // tcp6 is absent when IPv6 is disabled
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            connections.extend(
                parse_proc_net_tcp(&content, is_ipv6)?
                    .into_iter()
                    .filter(|c| inodes.contains(&c.inode)),
            );
        }
        Ok(connections)
    }
}

/// Stand-in for platforms without procfs
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedResolver;

impl ConnectionResolver for UnsupportedResolver {
    fn connections(&self, _pid: u32) -> Result<Vec<Connection>, ResolveError> {
        Err(ResolveError::Unsupported)
    }
}

/// Resolver for the current platform
pub fn system_resolver() -> Arc<dyn ConnectionResolver> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcNetResolver::new())
    } else {
        Arc::new(UnsupportedResolver)
    }
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Rows of `/proc/net/tcp` or `tcp6`:
///
/// ```text
///   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 0100007F:2383 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
/// ```
pub(crate) fn parse_proc_net_tcp(
    content: &str,
    is_ipv6: bool,
) -> Result<Vec<Connection>, ResolveError> {
    let mut connections = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let state = u8::from_str_radix(fields[3], 16)
            .map_err(|_| ResolveError::Parse(format!("state {}", fields[3])))?;
        let inode = fields[9]
            .parse()
            .map_err(|_| ResolveError::Parse(format!("inode {}", fields[9])))?;

        connections.push(Connection {
            local: parse_endpoint(fields[1], is_ipv6)?,
            remote: parse_endpoint(fields[2], is_ipv6)?,
            state: TcpState::from_code(state),
            inode,
        });
    }

    Ok(connections)
}

/// `ADDR:PORT` with the address in kernel memory order and the port big-endian
fn parse_endpoint(field: &str, is_ipv6: bool) -> Result<SocketAddr, ResolveError> {
    let bad = || ResolveError::Parse(format!("address {}", field));
    let (addr_hex, port_hex) = field.split_once(':').ok_or_else(bad)?;
    let port = u16::from_str_radix(port_hex, 16).map_err(|_| bad())?;

    let ip = if is_ipv6 {
        if addr_hex.len() != 32 {
            return Err(bad());
        }
        let mut octets = [0u8; 16];
        for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
            let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).map_err(|_| bad())?;
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let word = u32::from_str_radix(addr_hex, 16).map_err(|_| bad())?;
        IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
    };

    Ok(SocketAddr::new(ip, port))
}
