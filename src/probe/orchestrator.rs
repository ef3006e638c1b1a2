//! Runs a batch of servers through the session driver and classifier.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::classify::{classify, Verdict};
use super::engine::{CandidateGatheringError, NegotiationEngine};
use super::session::{self, deadline_after, SessionOutcome};
use super::ServerUri;
use crate::credentials::CredentialProvider;
use crate::error::ProbeResult;

pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Verdict plus the session details it was derived from.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub verdict: Verdict,
    pub message: String,
    pub elapsed_secs: f64,
    #[serde(flatten)]
    pub outcome: SessionOutcome,
}

/// One entry per input server, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub servers: Vec<ServerReport>,
}

impl ProbeReport {
    /// `"{server}: {verdict}"` lines, in input order.
    pub fn messages(&self) -> Vec<String> {
        self.servers.iter().map(|r| r.message.clone()).collect()
    }

    /// Every gathering error reported during the batch, tagged with its server.
    pub fn errors(&self) -> impl Iterator<Item = (&ServerUri, &CandidateGatheringError)> {
        self.servers
            .iter()
            .flat_map(|r| r.outcome.errors.iter().map(move |e| (&r.verdict.server, e)))
    }

    pub fn all_succeeded(&self) -> bool {
        self.servers.iter().all(|r| r.verdict.kind.is_success())
    }
}

pub struct Orchestrator<'a> {
    provider: &'a dyn CredentialProvider,
    engine: &'a dyn NegotiationEngine,
    server_timeout: Duration,
    batch_timeout: Option<Duration>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(provider: &'a dyn CredentialProvider, engine: &'a dyn NegotiationEngine) -> Self {
        Self {
            provider,
            engine,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            batch_timeout: None,
        }
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    /// Bound the whole batch. Servers not reached in time are classified on
    /// an empty candidate set.
    pub fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Probe `servers` one at a time, in order.
    ///
    /// Credentials are obtained once up front; failing to obtain them aborts
    /// the batch before any session is opened. After that every server gets a
    /// verdict.
    pub async fn run(&self, servers: &[ServerUri]) -> ProbeResult<ProbeReport> {
        let credential = self.provider.obtain().await?;
        if let Some(expires) = credential.expires_at() {
            tracing::debug!("Credentials for {} expire {}", credential.username, expires);
        }

        let batch_deadline = self.batch_timeout.map(|t| deadline_after(Instant::now(), t));
        let mut report = ProbeReport::default();

        for server in servers {
            let remaining =
                batch_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

            let outcome = if remaining.is_some_and(|r| r.is_zero()) {
                tracing::warn!("{}: batch timeout elapsed, not probed", server);
                SessionOutcome::skipped()
            } else {
                let timeout = remaining.map_or(self.server_timeout, |r| r.min(self.server_timeout));
                tracing::debug!("Probing {} (timeout {:?})", server, timeout);
                session::probe(self.engine, server, &credential, timeout).await
            };

            let verdict = classify(server, &outcome.candidates);
            tracing::info!("{} [{:?}, {} candidates]", verdict, outcome.state, outcome.candidates.len());

            report.servers.push(ServerReport {
                message: verdict.message(),
                elapsed_secs: outcome.elapsed.as_secs_f64(),
                verdict,
                outcome,
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::credentials::{Credential, StaticCredentials};
    use crate::error::ProbeError;
    use crate::probe::classify::VerdictKind;
    use crate::probe::gatherer::UdpGatherer;
    use crate::probe::parse_servers;
    use crate::probe::session::fake::{candidate, complete, Script, ScriptedEngine};
    use crate::probe::session::SessionState;
    use crate::probe::turn::fake;

    struct Unavailable;

    impl CredentialProvider for Unavailable {
        fn obtain(&self) -> BoxFuture<'_, ProbeResult<Credential>> {
            Box::pin(async { Err(ProbeError::CredentialUnavailable("503".into())) })
        }
    }

    fn provider() -> StaticCredentials {
        StaticCredentials::new(Credential::new("1700086400:bongo", "pw"))
    }

    #[tokio::test]
    async fn test_verdicts_in_input_order() {
        let engine = ScriptedEngine::new()
            .script("turn:a.example:443", Script::Events(vec![candidate("relay"), complete()]))
            .script("turn:b.example:443", Script::Events(vec![candidate("srflx"), complete()]))
            .script("stun:c.example:3478", Script::Events(vec![complete()]));
        let servers =
            parse_servers(&["turn:a.example:443", "turn:b.example:443", "stun:c.example:3478"])
                .unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine).run(&servers).await.unwrap();

        assert_eq!(
            report.messages(),
            vec![
                "turn:a.example:443: Connection Complete",
                "turn:b.example:443: Authentication failed?",
                "stun:c.example:3478: Connection failed.",
            ]
        );
        assert_eq!(engine.opened(), vec!["turn:a.example:443", "turn:b.example:443", "stun:c.example:3478"]);
        assert_eq!(engine.closed_count(), 3);
        assert!(!report.all_succeeded());
    }

    #[tokio::test]
    async fn test_offer_failure_does_not_block_later_servers() {
        let engine = ScriptedEngine::new()
            .script("turn:a.example:443", Script::OfferFails)
            .script("stun:b.example:3478", Script::Events(vec![candidate("srflx"), complete()]));
        let servers = parse_servers(&["turn:a.example:443", "stun:b.example:3478"]).unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine).run(&servers).await.unwrap();

        assert_eq!(report.servers[0].outcome.state, SessionState::Failed);
        assert_eq!(report.servers[0].verdict.kind, VerdictKind::NotReachable);
        assert_eq!(report.servers[1].message, "stun:b.example:3478: Connection Complete");
    }

    #[tokio::test]
    async fn test_credential_failure_aborts_before_probing() {
        let engine = ScriptedEngine::new();
        let servers = parse_servers(&["turn:a.example:443"]).unwrap();

        let err = Orchestrator::new(&Unavailable, &engine).run(&servers).await.unwrap_err();

        assert!(matches!(err, ProbeError::CredentialUnavailable(_)));
        assert!(engine.opened().is_empty());
    }

    #[tokio::test]
    async fn test_hung_server_times_out_and_batch_continues() {
        let engine = ScriptedEngine::new()
            .script("turn:a.example:443", Script::Events(vec![candidate("srflx")]))
            .script("turn:b.example:443", Script::Events(vec![candidate("relay"), complete()]));
        let servers = parse_servers(&["turn:a.example:443", "turn:b.example:443"]).unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine)
            .with_server_timeout(Duration::from_millis(50))
            .run(&servers)
            .await
            .unwrap();

        assert_eq!(report.servers[0].outcome.state, SessionState::TimedOut);
        assert_eq!(report.servers[0].verdict.kind, VerdictKind::AuthenticationFailed);
        assert_eq!(report.servers[1].verdict.kind, VerdictKind::ConnectionComplete);
    }

    #[tokio::test]
    async fn test_batch_timeout_still_yields_every_verdict() {
        let engine = ScriptedEngine::new()
            .script("turn:a.example:443", Script::Events(vec![candidate("srflx")]));
        let servers = parse_servers(&["turn:a.example:443", "stun:b.example:3478"]).unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine)
            .with_batch_timeout(Some(Duration::from_millis(80)))
            .run(&servers)
            .await
            .unwrap();

        assert_eq!(
            report.messages(),
            vec![
                "turn:a.example:443: Authentication failed?",
                "stun:b.example:3478: Connection failed.",
            ]
        );
        assert_eq!(report.servers[1].outcome.state, SessionState::TimedOut);
        assert_eq!(engine.opened(), vec!["turn:a.example:443"]);
    }

    #[tokio::test]
    async fn test_huge_timeouts_do_not_panic() {
        let engine = ScriptedEngine::new()
            .script("turn:a.example:443", Script::Events(vec![candidate("relay"), complete()]));
        let servers = parse_servers(&["turn:a.example:443"]).unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine)
            .with_server_timeout(Duration::from_secs(u64::MAX))
            .with_batch_timeout(Some(Duration::from_secs(u64::MAX)))
            .run(&servers)
            .await
            .unwrap();

        assert_eq!(report.messages(), vec!["turn:a.example:443: Connection Complete"]);
    }

    #[tokio::test]
    async fn test_zero_server_timeout_without_batch_still_opens_sessions() {
        let engine = ScriptedEngine::new()
            .script("stun:a.example:3478", Script::Events(vec![candidate("srflx"), complete()]));
        let servers = parse_servers(&["stun:a.example:3478"]).unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine)
            .with_server_timeout(Duration::ZERO)
            .run(&servers)
            .await
            .unwrap();

        assert_eq!(engine.opened(), vec!["stun:a.example:3478"]);
        assert_ne!(
            report.servers[0].outcome.failure.as_deref(),
            SessionOutcome::skipped().failure.as_deref()
        );
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let engine = ScriptedEngine::new()
            .script("turn:a.example:443", Script::Events(vec![candidate("relay"), complete()]));
        let servers = parse_servers(&["turn:a.example:443"]).unwrap();
        let provider = provider();

        let report = Orchestrator::new(&provider, &engine).run(&servers).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        let entry = &json["servers"][0];
        assert_eq!(entry["message"], "turn:a.example:443: Connection Complete");
        assert_eq!(entry["verdict"]["server"], "turn:a.example:443");
        assert_eq!(entry["state"], "complete");
        assert_eq!(entry["candidates"][0]["candidate_type"], "relay");
    }

    #[tokio::test]
    async fn test_end_to_end_against_loopback_turn_server() {
        let rejecting = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rejecting_addr = rejecting.local_addr().unwrap();
        let rejecting_task = tokio::spawn(fake::serve(rejecting, fake::Policy::RejectAll));

        let accepting = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let accepting_addr = accepting.local_addr().unwrap();
        let accepting_task = tokio::spawn(fake::serve(
            accepting,
            fake::Policy::Accept {
                password: "pw".into(),
            },
        ));

        let urls = vec![
            format!("stun:{}", rejecting_addr),
            format!("turn:{}", rejecting_addr),
            format!("turn:{}", accepting_addr),
        ];
        let servers = parse_servers(&urls).unwrap();
        let provider = provider();
        let engine = UdpGatherer::new();

        let report = Orchestrator::new(&provider, &engine)
            .with_server_timeout(Duration::from_secs(10))
            .run(&servers)
            .await
            .unwrap();

        let kinds: Vec<VerdictKind> = report.servers.iter().map(|r| r.verdict.kind).collect();
        assert_eq!(
            kinds,
            vec![
                VerdictKind::ConnectionComplete,
                VerdictKind::AuthenticationFailed,
                VerdictKind::ConnectionComplete,
            ]
        );
        let errors: Vec<u16> = report.errors().map(|(_, e)| e.error_code).collect();
        assert_eq!(errors, vec![401]);

        rejecting_task.abort();
        accepting_task.abort();
    }
}
