//! Bundled UDP negotiation engine.
//!
//! Gathers candidates against the single ICE server of a session:
//! 1. host candidate for the default outbound interface
//! 2. server-reflexive candidate from a STUN Binding to the server
//! 3. relay candidate from a TURN Allocate (UDP `turn:` servers only)
//!
//! Failures are reported as candidate errors, the way a browser engine
//! reports them, and gathering always ends with `Complete`.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use super::engine::{
    CandidateGatheringError, EngineEvent, EngineSession, GatheringState, NegotiationEngine,
    SessionConfig,
};
use super::stun::{self, TransactionError};
use super::turn::TurnClient;
use super::{compute_priority, Candidate, CandidateType, Scheme, ServerUri, Transport};
use crate::error::{ProbeError, ProbeResult};

/// Local preference advertised on every candidate we produce.
const LOCAL_PREFERENCE: u16 = 65535;

type EventTx = mpsc::UnboundedSender<EngineEvent>;

/// What a session gathers against, validated from its `SessionConfig`.
#[derive(Debug, Clone)]
struct GatherTarget {
    server: ServerUri,
    username: Option<String>,
    credential: Option<String>,
}

impl GatherTarget {
    fn from_config(config: &SessionConfig) -> ProbeResult<Self> {
        let [ice_server] = config.ice_servers.as_slice() else {
            return Err(ProbeError::offer_failed(
                "<config>",
                format!("expected one ICE server, got {}", config.ice_servers.len()),
            ));
        };
        let [url] = ice_server.urls.as_slice() else {
            return Err(ProbeError::offer_failed(
                "<config>",
                format!("expected one URL, got {}", ice_server.urls.len()),
            ));
        };

        let server: ServerUri = url
            .parse()
            .map_err(|e: ProbeError| ProbeError::offer_failed(url, e))?;

        if server.scheme() != Scheme::Stun
            && (ice_server.username.is_none() || ice_server.credential.is_none())
        {
            return Err(ProbeError::offer_failed(
                url,
                "TURN server configured without username and credential",
            ));
        }

        Ok(GatherTarget {
            server,
            username: ice_server.username.clone(),
            credential: ice_server.credential.clone(),
        })
    }
}

/// Negotiation engine that gathers over plain UDP sockets.
#[derive(Debug, Default, Clone)]
pub struct UdpGatherer;

impl UdpGatherer {
    pub fn new() -> Self {
        Self
    }
}

impl NegotiationEngine for UdpGatherer {
    fn create_offer<'a>(
        &'a self,
        config: &'a SessionConfig,
    ) -> BoxFuture<'a, ProbeResult<EngineSession>> {
        Box::pin(async move {
            let target = GatherTarget::from_config(config)?;
            tracing::debug!(
                "Gathering against {} (policy {:?}, pool size {})",
                target.server,
                config.transport_policy,
                config.candidate_pool_size
            );

            let (tx, rx) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let _ = tx.send(EngineEvent::GatheringStateChange(GatheringState::New));
            tokio::spawn(run(target, tx, shutdown_rx));

            Ok(EngineSession::new(rx, shutdown_tx))
        })
    }
}

async fn run(target: GatherTarget, events: EventTx, mut shutdown: oneshot::Receiver<()>) {
    let mut relay: Option<TurnClient> = None;

    let finished = tokio::select! {
        _ = gather(&target, &events, &mut relay) => true,
        _ = &mut shutdown => false,
    };

    if finished {
        let _ = events.send(EngineEvent::Candidate(Some(String::new())));
        let _ = events.send(EngineEvent::Candidate(None));
        let _ = events.send(EngineEvent::GatheringStateChange(GatheringState::Complete));
        // Hold the allocation until the session is closed.
        let _ = shutdown.await;
    }

    if let Some(mut client) = relay {
        if let Some(allocation) = client.allocation() {
            tracing::debug!("{}: releasing relay {}", target.server, allocation.relay_addr);
        }
        client.deallocate().await;
    }
}

async fn gather(target: &GatherTarget, events: &EventTx, relay: &mut Option<TurnClient>) {
    let url = target.server.as_str();
    let _ = events.send(EngineEvent::GatheringStateChange(GatheringState::Gathering));

    let server_addr = resolve(&target.server).await;
    let bind_addr = match server_addr {
        Ok(addr) if addr.is_ipv6() => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            emit_error(events, url, TransactionError::unreachable(format!("bind failed: {}", e)));
            return;
        }
    };
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            emit_error(events, url, TransactionError::unreachable(format!("local_addr: {}", e)));
            return;
        }
    };

    for candidate in host_candidates(local_addr) {
        emit_candidate(events, &candidate);
    }

    let server_addr = match server_addr {
        Ok(addr) => addr,
        Err(e) => {
            emit_error(events, url, e);
            return;
        }
    };

    if target.server.transport() == Transport::Tcp {
        emit_error(
            events,
            url,
            TransactionError::unreachable("TCP/TLS transport is not supported"),
        );
        return;
    }

    match stun::binding(&socket, server_addr).await {
        Ok(mapped) => {
            tracing::debug!("{}: mapped address {}", url, mapped);
            emit_candidate(events, &srflx_candidate(mapped, local_addr));
        }
        Err(e) => emit_error(events, url, e),
    }

    if target.server.scheme() != Scheme::Turn {
        return;
    }

    let (Some(username), Some(credential)) = (&target.username, &target.credential) else {
        return;
    };

    let mut client = match TurnClient::new(server_addr, username, credential).await {
        Ok(c) => c,
        Err(e) => {
            emit_error(events, url, TransactionError::unreachable(format!("bind failed: {}", e)));
            return;
        }
    };

    match client.allocate().await {
        Ok(allocation) => {
            let base = allocation
                .mapped_addr
                .or_else(|| client.local_addr().ok())
                .unwrap_or(local_addr);
            emit_candidate(events, &relay_candidate(allocation.relay_addr, base));
            *relay = Some(client);
        }
        Err(e) => {
            tracing::debug!("{}: TURN allocate failed: {}", url, e);
            emit_error(events, url, e);
        }
    }
}

async fn resolve(server: &ServerUri) -> Result<SocketAddr, TransactionError> {
    let host_port = server.host_port();
    let addrs = tokio::net::lookup_host(&host_port).await;
    match addrs {
        Ok(mut addrs) => addrs.next().ok_or_else(|| {
            TransactionError::unreachable(format!("no address for {}", host_port))
        }),
        Err(e) => Err(TransactionError::unreachable(format!(
            "address lookup for {} failed: {}",
            host_port, e
        ))),
    }
}

fn emit_candidate(events: &EventTx, candidate: &Candidate) {
    let _ = events.send(EngineEvent::Candidate(Some(candidate.to_sdp_line())));
}

fn emit_error(events: &EventTx, url: &str, err: TransactionError) {
    let _ = events.send(EngineEvent::CandidateError(CandidateGatheringError {
        url: url.to_string(),
        error_code: err.code,
        error_text: err.reason,
    }));
}

// ---------------------------------------------------------------------------
// Candidate construction
// ---------------------------------------------------------------------------

/// Host candidates for the socket's bound address.
///
/// When bound to the unspecified address, the default outbound interface is
/// found with the "connect a UDP socket to a public address" trick.
fn host_candidates(local_addr: SocketAddr) -> Vec<Candidate> {
    let port = local_addr.port();

    let ip = if local_addr.ip().is_unspecified() {
        let (bind, probe) = if local_addr.is_ipv6() {
            ("[::]:0", "[2001:4860:4860::8888]:80")
        } else {
            ("0.0.0.0:0", "8.8.8.8:80")
        };
        let outbound = std::net::UdpSocket::bind(bind)
            .and_then(|s| s.connect(probe).map(|_| s))
            .and_then(|s| s.local_addr());
        match outbound {
            Ok(addr) => addr.ip(),
            Err(e) => {
                tracing::debug!("No default route for host candidate: {}", e);
                return Vec::new();
            }
        }
    } else {
        local_addr.ip()
    };

    vec![Candidate {
        foundation: "1".into(),
        component: 1,
        protocol: "udp".into(),
        priority: compute_priority(CandidateType::Host, LOCAL_PREFERENCE, 1),
        address: ip.to_string(),
        port,
        candidate_type: CandidateType::Host,
        raddr: None,
        rport: None,
    }]
}

fn srflx_candidate(mapped: SocketAddr, base: SocketAddr) -> Candidate {
    Candidate {
        foundation: "2".into(),
        component: 1,
        protocol: "udp".into(),
        priority: compute_priority(CandidateType::ServerReflexive, LOCAL_PREFERENCE, 1),
        address: mapped.ip().to_string(),
        port: mapped.port(),
        candidate_type: CandidateType::ServerReflexive,
        raddr: Some(base.ip().to_string()),
        rport: Some(base.port()),
    }
}

fn relay_candidate(relay: SocketAddr, base: SocketAddr) -> Candidate {
    Candidate {
        foundation: "3".into(),
        component: 1,
        protocol: "udp".into(),
        priority: compute_priority(CandidateType::Relay, LOCAL_PREFERENCE, 1),
        address: relay.ip().to_string(),
        port: relay.port(),
        candidate_type: CandidateType::Relay,
        raddr: Some(base.ip().to_string()),
        rport: Some(base.port()),
    }
}
