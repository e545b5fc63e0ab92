//! Candidate sources: CIDR expansion and extraction from a previous results file.

use std::{collections::BTreeSet, fmt, net::IpAddr, path::Path, sync::LazyLock};

use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Serialize;

/// One endpoint being evaluated as a tunnel remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Candidate(String);

impl Candidate {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<IpAddr> for Candidate {
    fn from(value: IpAddr) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for Candidate {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug)]
pub enum CandidateError {
    InvalidCidr { input: String, reason: String },
    TooManyHosts { input: String, limit: u128 },
    Read { path: String, source: std::io::Error },
    Pattern(regex::Error),
}

impl fmt::Display for CandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCidr { input, reason } => {
                write!(f, "invalid CIDR range {input}: {reason}")
            }
            Self::TooManyHosts { input, limit } => {
                write!(f, "CIDR range {input} has more than {limit} hosts")
            }
            Self::Read { path, source } => write!(f, "read {path}: {source}"),
            Self::Pattern(err) => write!(f, "results line pattern: {err}"),
        }
    }
}

impl std::error::Error for CandidateError {}

// A /16 worth of hosts; larger ranges would exhaust the local port range anyway.
const MAX_CIDR_HOSTS: u128 = 1 << 16;

/// Expands a network into its usable host addresses, in ascending order.
///
/// IPv4 networks wider than /31 drop the network and broadcast addresses; /31
/// and /32 keep every address. IPv6 networks drop only the subnet-router anycast
/// address for prefixes below /127.
pub fn from_cidr(input: &str) -> Result<Vec<Candidate>, CandidateError> {
    let trimmed = input.trim();
    let network: IpNetwork = trimmed.parse().map_err(|e: ipnetwork::IpNetworkError| {
        CandidateError::InvalidCidr {
            input: trimmed.to_string(),
            reason: e.to_string(),
        }
    })?;

    // Host bits must be zero, e.g. `10.0.0.1/24` is rejected.
    if network.ip() != network.network() {
        return Err(CandidateError::InvalidCidr {
            input: trimmed.to_string(),
            reason: "host bits set".to_string(),
        });
    }

    match network {
        IpNetwork::V4(net) => {
            let prefix = net.prefix();
            let total = 1u128 << (32 - u32::from(prefix));
            let usable = if prefix < 31 { total - 2 } else { total };
            if usable > MAX_CIDR_HOSTS {
                return Err(CandidateError::TooManyHosts {
                    input: trimmed.to_string(),
                    limit: MAX_CIDR_HOSTS,
                });
            }
            let skip_edges = prefix < 31;
            let broadcast = net.broadcast();
            Ok(net
                .iter()
                .filter(|ip| !skip_edges || (*ip != net.network() && *ip != broadcast))
                .map(|ip| Candidate::from(IpAddr::V4(ip)))
                .collect())
        }
        IpNetwork::V6(net) => {
            let prefix = net.prefix();
            let host_bits = 128 - u32::from(prefix);
            if host_bits > 16 {
                return Err(CandidateError::TooManyHosts {
                    input: trimmed.to_string(),
                    limit: MAX_CIDR_HOSTS,
                });
            }
            let skip_anycast = prefix < 127;
            Ok(net
                .iter()
                .filter(|ip| !skip_anycast || *ip != net.network())
                .map(|ip| Candidate::from(IpAddr::V6(ip)))
                .collect())
        }
    }
}

static RESULTS_LINE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"IP:\s*(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})"));

/// Pulls `IP: a.b.c.d` addresses out of results text, keeping first-seen order.
pub fn parse_results(text: &str) -> Result<Vec<Candidate>, CandidateError> {
    let re = RESULTS_LINE
        .as_ref()
        .map_err(|err| CandidateError::Pattern(err.clone()))?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for caps in text.lines().filter_map(|line| re.captures(line)) {
        let Some(m) = caps.get(1) else {
            continue;
        };
        let Ok(ip) = m.as_str().parse::<IpAddr>() else {
            continue;
        };
        if seen.insert(ip) {
            out.push(Candidate::from(ip));
        }
    }
    Ok(out)
}

pub fn from_results_file(path: &Path) -> Result<Vec<Candidate>, CandidateError> {
    let text = std::fs::read_to_string(path).map_err(|source| CandidateError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_results(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strs(c: &[Candidate]) -> Vec<&str> {
        c.iter().map(Candidate::as_str).collect()
    }

    #[test]
    fn cidr_skips_network_and_broadcast() {
        let hosts = from_cidr("10.0.0.0/29").unwrap();
        assert_eq!(
            strs(&hosts),
            vec![
                "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"
            ]
        );
    }

    #[test]
    fn cidr_point_to_point_and_single_host_keep_all() {
        assert_eq!(
            strs(&from_cidr("10.0.0.0/31").unwrap()),
            vec!["10.0.0.0", "10.0.0.1"]
        );
        assert_eq!(strs(&from_cidr("10.0.0.7/32").unwrap()), vec!["10.0.0.7"]);
    }

    #[test]
    fn cidr_reference_range_has_4094_hosts() {
        let hosts = from_cidr("173.245.48.0/20").unwrap();
        assert_eq!(hosts.len(), 4094);
        assert_eq!(hosts.first().unwrap().as_str(), "173.245.48.1");
        assert_eq!(hosts.last().unwrap().as_str(), "173.245.63.254");
    }

    #[test]
    fn cidr_rejects_garbage_and_host_bits() {
        assert!(matches!(
            from_cidr("not-a-cidr"),
            Err(CandidateError::InvalidCidr { .. })
        ));
        assert!(matches!(
            from_cidr("10.0.0.1/24"),
            Err(CandidateError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn cidr_rejects_huge_ranges() {
        assert!(matches!(
            from_cidr("10.0.0.0/8"),
            Err(CandidateError::TooManyHosts { .. })
        ));
    }

    #[test]
    fn parse_results_extracts_in_order_without_duplicates() {
        let text = "IP: 104.16.1.2, Ping: 120 ms\n\
                    garbage line\n\
                    IP: 104.16.1.9, Ping: 80 ms\n\
                    IP: 104.16.1.2, Ping: 95 ms\n\
                    IP: 999.1.1.1, Ping: 1 ms\n";
        let parsed = parse_results(text).unwrap();
        assert_eq!(strs(&parsed), vec!["104.16.1.2", "104.16.1.9"]);
    }

    #[test]
    fn results_file_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("working_ips.txt");
        std::fs::write(&path, "IP: 10.0.0.3, Ping: 20 ms\nIP: 10.0.0.1, Ping: 50 ms\n").unwrap();
        let parsed = from_results_file(&path).unwrap();
        assert_eq!(strs(&parsed), vec!["10.0.0.3", "10.0.0.1"]);
    }

    #[test]
    fn results_file_read_error_names_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.txt");
        let err = from_results_file(&missing).unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }
}
