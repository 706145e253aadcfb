use crate::control::ControlError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use torrotate_common::Fingerprint;

/// Circuit identifier as assigned by Tor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitId(pub u64);

impl CircuitId {
    /// Parse the id field of an event; Tor uses `0` or nothing for "no circuit"
    pub fn from_event_field(field: &str) -> Option<Self> {
        field.parse::<u64>().ok().filter(|id| *id != 0).map(CircuitId)
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CircuitId {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(CircuitId)
            .map_err(|_| ControlError::Protocol(format!("bad circuit id {:?}", s)))
    }
}

/// Which circuits an inspection should cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitRef {
    /// A single circuit, e.g. from a stream event
    Id(CircuitId),

    /// Every circuit Tor currently lists; NEWNYM replies carry no circuit id
    All,
}

/// Circuit status keyword from `circuit-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitStatus {
    Launched,
    Built,
    GuardWait,
    Extended,
    Failed,
    Closed,
    Other(String),
}

impl From<&str> for CircuitStatus {
    fn from(value: &str) -> Self {
        match value {
            "LAUNCHED" => Self::Launched,
            "BUILT" => Self::Built,
            "GUARD_WAIT" => Self::GuardWait,
            "EXTENDED" => Self::Extended,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One relay on a circuit path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitHop {
    pub fingerprint: Fingerprint,
    pub nickname: Option<String>,
}

impl FromStr for CircuitHop {
    type Err = ControlError;

    /// Accepts `$FP~nick`, `$FP=nick` and bare `$FP`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (fp, nickname) = match s.find(['~', '=']) {
            Some(pos) => (&s[..pos], Some(s[pos + 1..].to_string())),
            None => (s, None),
        };
        let fingerprint = Fingerprint::from_hex(fp)
            .map_err(|e| ControlError::Protocol(format!("bad hop {:?}: {}", s, e)))?;
        Ok(Self {
            fingerprint,
            nickname,
        })
    }
}

/// A circuit as listed by Tor; never mutated after parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: CircuitId,
    pub status: CircuitStatus,

    /// Hops ordered from guard to exit
    pub path: Vec<CircuitHop>,

    pub purpose: Option<String>,
    pub created: Option<String>,
}

impl Circuit {
    /// The last hop, whose address the destination sees
    pub fn exit_hop(&self) -> Option<&CircuitHop> {
        self.path.last()
    }

    pub fn hop_count(&self) -> usize {
        self.path.len()
    }

    /// Parse one line of `GETINFO circuit-status`
    pub fn parse_status_line(line: &str) -> Result<Self, ControlError> {
        let mut tokens = line.split_whitespace();
        let id: CircuitId = tokens
            .next()
            .ok_or_else(|| ControlError::Protocol("empty circuit line".to_string()))?
            .parse()?;
        let status = tokens
            .next()
            .map(CircuitStatus::from)
            .ok_or_else(|| ControlError::Protocol(format!("circuit {} has no status", id)))?;

        let mut path = Vec::new();
        let mut purpose = None;
        let mut created = None;

        for (index, token) in tokens.enumerate() {
            if index == 0 && token.starts_with('$') {
                path = token
                    .split(',')
                    .map(CircuitHop::from_str)
                    .collect::<Result<Vec<_>, _>>()?;
                continue;
            }
            match token.split_once('=') {
                Some(("PURPOSE", value)) => purpose = Some(value.to_string()),
                Some(("TIME_CREATED", value)) => created = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            id,
            status,
            path,
            purpose,
            created,
        })
    }
}

/// Fields of a relay's network status entry (`ns/id/<fp>`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStatus {
    pub nickname: String,
    pub address: String,
    pub or_port: u16,
    pub dir_port: u16,
    pub flags: Vec<String>,
}

impl RouterStatus {
    /// Parse a router status document; only the `r` and `s` lines are used.
    ///
    /// The `r` line has a digest field in full consensus documents but not
    /// in microdescriptor ones, so address and ports are read from the end.
    pub fn parse(document: &str) -> Result<Self, ControlError> {
        let r_line = document
            .lines()
            .find(|line| line.starts_with("r "))
            .ok_or_else(|| ControlError::Protocol("router status has no 'r' line".to_string()))?;

        let fields: Vec<&str> = r_line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(ControlError::Protocol(format!(
                "router status line too short: {:?}",
                r_line
            )));
        }
        let n = fields.len();
        let parse_port = |raw: &str| {
            raw.parse::<u16>()
                .map_err(|_| ControlError::Protocol(format!("bad port {:?}", raw)))
        };

        let flags = document
            .lines()
            .find_map(|line| line.strip_prefix("s "))
            .map(|rest| rest.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        Ok(Self {
            nickname: fields[1].to_string(),
            address: fields[n - 3].to_string(),
            or_port: parse_port(fields[n - 2])?,
            dir_port: parse_port(fields[n - 1])?,
            flags,
        })
    }
}

/// Resolved metadata for one relay; recomputed per inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub address: String,
    pub or_port: u16,
    pub fingerprint: Fingerprint,
    pub nickname: String,

    /// Country code, or `"unknown"` when the lookup failed
    pub country: String,
}

impl RelayInfo {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.or_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP_A: &str = "5CECC5C30ACC4B3DE462792323967087CC53D947";
    const FP_B: &str = "9695DFC35FFEB861329B9F1AB04C46397020CE31";

    #[test]
    fn test_parse_built_circuit() {
        let line = format!(
            "16 BUILT ${}~Quetzalcoatl,${}=moria1 BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2024-01-01T10:00:00.000000",
            FP_A, FP_B
        );
        let circuit = Circuit::parse_status_line(&line).unwrap();
        assert_eq!(circuit.id, CircuitId(16));
        assert_eq!(circuit.status, CircuitStatus::Built);
        assert_eq!(circuit.hop_count(), 2);
        assert_eq!(circuit.path[0].nickname.as_deref(), Some("Quetzalcoatl"));
        assert_eq!(circuit.exit_hop().unwrap().fingerprint.to_hex(), FP_B);
        assert_eq!(circuit.purpose.as_deref(), Some("GENERAL"));
        assert!(circuit.created.is_some());
    }

    #[test]
    fn test_parse_launched_circuit_without_path() {
        let circuit =
            Circuit::parse_status_line("7 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL")
                .unwrap();
        assert_eq!(circuit.status, CircuitStatus::Launched);
        assert!(circuit.path.is_empty());
        assert!(circuit.exit_hop().is_none());
    }

    #[test]
    fn test_parse_bad_circuit_line() {
        assert!(Circuit::parse_status_line("").is_err());
        assert!(Circuit::parse_status_line("x BUILT").is_err());
        assert!(Circuit::parse_status_line("3 BUILT $ZZZ~bad").is_err());
    }

    #[test]
    fn test_event_circuit_id() {
        assert_eq!(CircuitId::from_event_field("42"), Some(CircuitId(42)));
        assert_eq!(CircuitId::from_event_field("0"), None);
        assert_eq!(CircuitId::from_event_field(""), None);
    }

    #[test]
    fn test_parse_router_status_full_consensus() {
        let doc = "r moria1 lpXfw1/+uGEym58asExGOXAgzjE IpcU7dolas8+Q+oAzwgvZIWx7PA 2024-01-01 10:00:00 128.31.0.34 9101 9131\n\
                   s Authority Fast Running Stable V2Dir Valid\n\
                   w Bandwidth=20";
        let status = RouterStatus::parse(doc).unwrap();
        assert_eq!(status.nickname, "moria1");
        assert_eq!(status.address, "128.31.0.34");
        assert_eq!(status.or_port, 9101);
        assert_eq!(status.dir_port, 9131);
        assert!(status.flags.contains(&"Running".to_string()));
    }

    #[test]
    fn test_parse_router_status_microdesc() {
        let doc = "r relay1 lpXfw1/+uGEym58asExGOXAgzjE 2024-01-01 10:00:00 10.1.2.3 443 0";
        let status = RouterStatus::parse(doc).unwrap();
        assert_eq!(status.address, "10.1.2.3");
        assert_eq!(status.or_port, 443);
        assert!(status.flags.is_empty());
    }

    #[test]
    fn test_parse_router_status_missing_r_line() {
        assert!(RouterStatus::parse("s Fast Running").is_err());
    }
}
