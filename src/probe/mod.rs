//! TURN/STUN reachability probing.
//!
//! The prober drives one ICE gathering session per server through a
//! `NegotiationEngine`, collects the candidates it reports and infers
//! reachability and authentication from the candidate types:
//! 1. `session` drives one engine session to a terminal state
//! 2. `classify` turns the gathered candidate set into a verdict
//! 3. `orchestrator` runs the servers one after another
//!
//! `gatherer` (with `stun` and `turn`) is the bundled UDP engine.

pub mod classify;
pub mod engine;
pub mod gatherer;
pub mod orchestrator;
pub mod session;
pub mod stun;
pub mod turn;

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Serialize, Serializer};

use crate::error::ProbeError;

// ---------------------------------------------------------------------------
// Server URIs
// ---------------------------------------------------------------------------

pub const DEFAULT_PORT: u16 = 3478;
pub const DEFAULT_TLS_PORT: u16 = 5349;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Stun,
    Turn,
    Turns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A `stun:`, `turn:` or `turns:` server URI as given on input.
///
/// The original text is kept verbatim; verdicts are reported against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    raw: String,
    scheme: Scheme,
    host: String,
    port: u16,
    transport: Transport,
}

impl ServerUri {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// `host:port`, bracketing IPv6 literals, suitable for `lookup_host`.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// TURN over UDP: a `turn:` URI that does not ask for `?transport=tcp`.
    ///
    /// This is the only kind of server for which a missing relay candidate
    /// says anything about authentication.
    pub fn is_turn_udp(&self) -> bool {
        self.scheme == Scheme::Turn && !self.raw.contains("?transport=tcp")
    }
}

impl FromStr for ServerUri {
    type Err = ProbeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let raw = input.trim();
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| ProbeError::invalid_uri(raw, "missing scheme"))?;

        let scheme = match scheme {
            "stun" => Scheme::Stun,
            "turn" => Scheme::Turn,
            "turns" => Scheme::Turns,
            other => {
                return Err(ProbeError::invalid_uri(
                    raw,
                    format!("unsupported scheme {:?}", other),
                ))
            }
        };

        let (host_port, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut transport = match scheme {
            Scheme::Turns => Transport::Tcp,
            _ => Transport::Udp,
        };
        for param in query.split('&').filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some(("transport", "udp")) if scheme != Scheme::Turns => {
                    transport = Transport::Udp
                }
                Some(("transport", "tcp")) => transport = Transport::Tcp,
                Some(("transport", other)) => {
                    return Err(ProbeError::invalid_uri(
                        raw,
                        format!("unsupported transport {:?}", other),
                    ))
                }
                _ => {}
            }
        }

        let (host, port) = split_host_port(host_port).map_err(|e| {
            ProbeError::invalid_uri(raw, format!("{:#}", e))
        })?;
        let port = port.unwrap_or(match scheme {
            Scheme::Turns => DEFAULT_TLS_PORT,
            _ => DEFAULT_PORT,
        });

        // Verdicts echo the input exactly, surrounding whitespace included.
        Ok(ServerUri {
            raw: input.to_string(),
            scheme,
            host,
            port,
            transport,
        })
    }
}

fn split_host_port(host_port: &str) -> Result<(String, Option<u16>)> {
    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .context("unterminated IPv6 literal")?;
        match after {
            "" => (host, None),
            p => (host, Some(p.strip_prefix(':').context("garbage after IPv6 literal")?)),
        }
    } else {
        match host_port.rsplit_once(':') {
            Some((h, _)) if h.contains(':') => bail!("IPv6 literal must be bracketed"),
            Some((h, p)) => (h, Some(p)),
            None => (host_port, None),
        }
    };

    if host.is_empty() {
        bail!("missing host");
    }

    let port = match port {
        Some(p) => {
            let port: u16 = p.parse().with_context(|| format!("bad port {:?}", p))?;
            if port == 0 {
                bail!("port must be non-zero");
            }
            Some(port)
        }
        None => None,
    };

    Ok((host.to_string(), port))
}

impl fmt::Display for ServerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for ServerUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Parse a list of server URIs, failing on the first invalid one.
pub fn parse_servers<S: AsRef<str>>(uris: &[S]) -> Result<Vec<ServerUri>, ProbeError> {
    uris.iter().map(|u| u.as_ref().parse()).collect()
}

// ---------------------------------------------------------------------------
// ICE candidates
// ---------------------------------------------------------------------------

/// ICE candidate type (RFC 8445 section 5.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gathered ICE candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// For srflx/relay: the related address.
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl Candidate {
    /// Format this candidate as an SDP `candidate:` attribute value.
    pub fn to_sdp_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );
        if let (Some(ref ra), Some(rp)) = (&self.raddr, self.rport) {
            line.push_str(&format!(" raddr {} rport {}", ra, rp));
        }
        line
    }
}

/// Parse an `a=candidate:` or `candidate:` line.
pub fn parse_candidate(line: &str) -> Result<Candidate> {
    let line = line.trim();
    let content = line
        .strip_prefix("a=candidate:")
        .or_else(|| line.strip_prefix("candidate:"))
        .with_context(|| format!("not a candidate line: {}", line))?;

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u8 = parts[1].parse().context("bad component")?;
    let protocol = parts[2].to_lowercase();
    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    let port: u16 = parts[5].parse().context("bad port")?;

    if parts[6] != "typ" {
        bail!("expected 'typ' keyword at position 6, got: {}", parts[6]);
    }

    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let mut raddr = None;
    let mut rport = None;
    let mut i = 8;
    while i < parts.len() {
        match parts[i] {
            "raddr" if i + 1 < parts.len() => {
                raddr = Some(parts[i + 1].to_string());
                i += 2;
            }
            "rport" if i + 1 < parts.len() => {
                rport = Some(parts[i + 1].parse().context("bad rport")?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(Candidate {
        foundation,
        component,
        protocol,
        priority,
        address,
        port,
        candidate_type,
        raddr,
        rport,
    })
}

/// Compute ICE candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    (ctype.type_preference() << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Split a candidate priority into type preference, local preference and
/// (256 - component ID), e.g. `126 | 32252 | 255`.
pub fn format_priority(priority: u32) -> String {
    format!(
        "{} | {} | {}",
        priority >> 24,
        (priority >> 8) & 0xFFFF,
        priority & 0xFF
    )
}
