//! Verdict heuristic over gathered candidate types.
//!
//! This is inference from candidate categories only. It cannot tell a TURN
//! server that is down from one whose port is firewalled, hence the `?` on
//! two of the verdicts.

use std::fmt;

use serde::Serialize;

use super::{Candidate, CandidateType, ServerUri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerdictKind {
    ConnectionComplete,
    AuthenticationFailed,
    NotReachable,
    ConnectionFailed,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictKind::ConnectionComplete => "Connection Complete",
            VerdictKind::AuthenticationFailed => "Authentication failed?",
            VerdictKind::NotReachable => "Not reachable?",
            VerdictKind::ConnectionFailed => "Connection failed.",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == VerdictKind::ConnectionComplete
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub server: ServerUri,
    pub kind: VerdictKind,
}

impl Verdict {
    /// `"{server}: {verdict}"`.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.server, self.kind)
    }
}

/// Classify one server from the candidates its session gathered.
pub fn classify(server: &ServerUri, candidates: &[Candidate]) -> Verdict {
    let has = |t: CandidateType| candidates.iter().any(|c| c.candidate_type == t);

    // Only TURN/UDP hands out srflx candidates alongside the relay, so only
    // there does "srflx but no relay" point at the credentials.
    let kind = if server.is_turn_udp() {
        if has(CandidateType::Relay) {
            VerdictKind::ConnectionComplete
        } else if has(CandidateType::ServerReflexive) {
            VerdictKind::AuthenticationFailed
        } else {
            VerdictKind::NotReachable
        }
    } else if has(CandidateType::ServerReflexive) {
        VerdictKind::ConnectionComplete
    } else {
        VerdictKind::ConnectionFailed
    };

    Verdict {
        server: server.clone(),
        kind,
    }
}
