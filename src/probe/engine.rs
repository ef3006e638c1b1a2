//! Interface to the ICE negotiation engine.
//!
//! The prober never gathers candidates itself. It hands a `SessionConfig` to
//! a `NegotiationEngine`, which opens a session (the offer creation exists
//! only to kick off gathering) and reports what it finds as `EngineEvent`s.

use std::fmt;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::ServerUri;
use crate::credentials::Credential;
use crate::error::ProbeResult;

/// Candidates pre-gathered by the engine before the offer is applied.
pub const CANDIDATE_POOL_SIZE: u8 = 10;

/// Which candidate types the engine may gather. Probing always gathers all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    All,
}

/// One ICE server entry with its long-term credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    pub transport_policy: TransportPolicy,
    pub candidate_pool_size: u8,
}

impl SessionConfig {
    /// Configuration scoped to exactly one server.
    pub fn for_server(server: &ServerUri, credential: &Credential) -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![server.as_str().to_string()],
                username: Some(credential.username.clone()),
                credential: Some(credential.password.clone()),
            }],
            transport_policy: TransportPolicy::All,
            candidate_pool_size: CANDIDATE_POOL_SIZE,
        }
    }
}

/// ICE gathering state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// An error the engine hit while gathering from one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateGatheringError {
    pub url: String,
    pub error_code: u16,
    pub error_text: String,
}

impl fmt::Display for CandidateGatheringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The server {} returned an error with code={}:\n{}",
            self.url, self.error_code, self.error_text
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A discovered candidate line. `Some("")` ends a gathering round and
    /// `None` signals end-of-candidates; neither carries a candidate.
    Candidate(Option<String>),
    GatheringStateChange(GatheringState),
    CandidateError(CandidateGatheringError),
}

/// A live engine session.
///
/// Closing (or dropping) the session tells the engine to stop gathering and
/// release whatever it holds for this session.
pub struct EngineSession {
    events: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl EngineSession {
    pub fn new(events: mpsc::UnboundedReceiver<EngineEvent>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            events,
            shutdown: Some(shutdown),
        }
    }

    /// Next event, or `None` once the engine has gone away.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.events.close();
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// The capability that performs network-level candidate gathering.
pub trait NegotiationEngine: Send + Sync {
    /// Open a session for `config` and start gathering.
    ///
    /// Fails with `ProbeError::OfferCreationFailed` when no session could be
    /// created.
    fn create_offer<'a>(&'a self, config: &'a SessionConfig)
        -> BoxFuture<'a, ProbeResult<EngineSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_for_server() {
        let server: ServerUri = "turn:1.2.3.4:443".parse().unwrap();
        let cred = Credential::new("1700086400:bongo", "pw");
        let config = SessionConfig::for_server(&server, &cred);

        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["turn:1.2.3.4:443".to_string()]);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("1700086400:bongo"));
        assert_eq!(config.ice_servers[0].credential.as_deref(), Some("pw"));
        assert_eq!(config.transport_policy, TransportPolicy::All);
        assert!(config.candidate_pool_size > 0);
    }

    #[test]
    fn test_gathering_error_display() {
        let err = CandidateGatheringError {
            url: "turn:1.2.3.4:443".into(),
            error_code: 401,
            error_text: "Unauthorized".into(),
        };
        assert_eq!(
            err.to_string(),
            "The server turn:1.2.3.4:443 returned an error with code=401:\nUnauthorized"
        );
    }

    #[tokio::test]
    async fn test_close_signals_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut session = EngineSession::new(rx, shutdown_tx);

        tx.send(EngineEvent::Candidate(None)).unwrap();
        assert_eq!(session.next_event().await, Some(EngineEvent::Candidate(None)));

        session.close();
        assert!(shutdown_rx.await.is_ok());
        assert!(tx.send(EngineEvent::Candidate(None)).is_err());
    }
}
