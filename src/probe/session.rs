//! Drives one negotiation session to a terminal state.
//!
//! Each session owns its server, candidate set, error log and state, so
//! events can never be attributed to the wrong server. The driver waits on a
//! single suspension point (next engine event or the deadline) until the
//! state leaves `Gathering`.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::engine::{
    CandidateGatheringError, EngineEvent, GatheringState, NegotiationEngine, SessionConfig,
};
use super::{format_priority, parse_candidate, Candidate, ServerUri};
use crate::credentials::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Gathering,
    /// The engine reported gathering state `complete`.
    Complete,
    /// The deadline passed first; whatever was gathered is kept.
    TimedOut,
    /// No offer could be created, or the engine went away mid-gathering.
    Failed,
}

/// Finished snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub candidates: Vec<Candidate>,
    pub errors: Vec<CandidateGatheringError>,
    #[serde(skip)]
    pub elapsed: Duration,
    pub failure: Option<String>,
}

/// Stand-in horizon for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `start + timeout`, clamped instead of overflowing.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

impl SessionOutcome {
    /// Outcome for a server that was never probed because time ran out.
    pub fn skipped() -> Self {
        Self {
            state: SessionState::TimedOut,
            candidates: Vec::new(),
            errors: Vec::new(),
            elapsed: Duration::ZERO,
            failure: Some("batch timeout elapsed before probing".into()),
        }
    }
}

struct Session<'a> {
    server: &'a ServerUri,
    state: SessionState,
    candidates: Vec<Candidate>,
    errors: Vec<CandidateGatheringError>,
    failure: Option<String>,
    started: Instant,
}

impl<'a> Session<'a> {
    fn new(server: &'a ServerUri) -> Self {
        Self {
            server,
            state: SessionState::Gathering,
            candidates: Vec::new(),
            errors: Vec::new(),
            failure: None,
            started: Instant::now(),
        }
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            // End of a gathering round, not a candidate and not the end.
            EngineEvent::Candidate(Some(line)) if line.is_empty() => {}
            EngineEvent::Candidate(Some(line)) => match parse_candidate(&line) {
                Ok(candidate) => {
                    tracing::debug!(
                        "{}: [{:.3}s] {} {}:{} priority {}",
                        self.server,
                        self.started.elapsed().as_secs_f64(),
                        candidate.candidate_type,
                        candidate.address,
                        candidate.port,
                        format_priority(candidate.priority)
                    );
                    self.candidates.push(candidate);
                }
                Err(e) => {
                    tracing::debug!("{}: ignoring candidate {:?}: {:#}", self.server, line, e);
                }
            },
            EngineEvent::Candidate(None) => {}
            EngineEvent::GatheringStateChange(GatheringState::Complete) => {
                self.state = SessionState::Complete;
            }
            EngineEvent::GatheringStateChange(state) => {
                tracing::trace!("{}: gathering state {:?}", self.server, state);
            }
            EngineEvent::CandidateError(err) => {
                tracing::debug!(
                    "{}: candidate error {} from {}: {}",
                    self.server,
                    err.error_code,
                    err.url,
                    err.error_text
                );
                self.errors.push(err);
            }
        }
    }

    fn fail(&mut self, reason: String) {
        self.state = SessionState::Failed;
        self.failure = Some(reason);
    }

    fn finish(self) -> SessionOutcome {
        SessionOutcome {
            state: self.state,
            candidates: self.candidates,
            errors: self.errors,
            elapsed: self.started.elapsed(),
            failure: self.failure,
        }
    }
}

/// Gather candidates for `server` until the engine completes or `timeout` elapses.
///
/// Never fails: a session that could not be opened finishes as `Failed`
/// with an empty candidate set.
pub async fn probe(
    engine: &dyn NegotiationEngine,
    server: &ServerUri,
    credential: &Credential,
    timeout: Duration,
) -> SessionOutcome {
    let mut session = Session::new(server);
    let deadline = deadline_after(session.started, timeout);
    let config = SessionConfig::for_server(server, credential);

    let mut engine_session =
        match tokio::time::timeout_at(deadline, engine.create_offer(&config)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                tracing::warn!("{}", e);
                session.fail(e.to_string());
                return session.finish();
            }
            Err(_) => {
                tracing::warn!("{}: offer creation timed out", server);
                session.state = SessionState::TimedOut;
                return session.finish();
            }
        };

    while session.state == SessionState::Gathering {
        match tokio::time::timeout_at(deadline, engine_session.next_event()).await {
            Ok(Some(event)) => session.handle(event),
            Ok(None) => {
                session.fail("engine closed the session before gathering completed".into());
            }
            Err(_) => {
                tracing::debug!("{}: gathering timed out after {:?}", server, timeout);
                session.state = SessionState::TimedOut;
            }
        }
    }

    engine_session.close();
    session.finish()
}

// ---------------------------------------------------------------------------
// Scripted engine for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use tokio::sync::{mpsc, oneshot};

    use crate::error::{ProbeError, ProbeResult};
    use crate::probe::engine::{
        EngineEvent, EngineSession, GatheringState, NegotiationEngine, SessionConfig,
    };

    #[derive(Debug, Clone)]
    pub enum Script {
        /// Emit the events, then keep the channel open.
        Events(Vec<EngineEvent>),
        /// Emit the events, then drop the sender.
        EventsThenClose(Vec<EngineEvent>),
        OfferFails,
    }

    /// Replays a fixed event script per server URL.
    #[derive(Default)]
    pub struct ScriptedEngine {
        scripts: HashMap<String, Script>,
        opened: Mutex<Vec<String>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
        shutdowns: Mutex<Vec<oneshot::Receiver<()>>>,
    }

    impl ScriptedEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(mut self, url: &str, script: Script) -> Self {
            self.scripts.insert(url.to_string(), script);
            self
        }

        /// URLs of every session opened so far, in order.
        pub fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }

        /// Number of sessions whose close signal has arrived.
        pub fn closed_count(&self) -> usize {
            let mut shutdowns = self.shutdowns.lock().unwrap();
            let mut closed = 0;
            for rx in shutdowns.iter_mut() {
                if !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    closed += 1;
                }
            }
            closed
        }
    }

    pub fn candidate(typ: &str) -> EngineEvent {
        EngineEvent::Candidate(Some(format!(
            "candidate:1 1 udp 2122260223 198.51.100.1 50000 typ {}",
            typ
        )))
    }

    pub fn complete() -> EngineEvent {
        EngineEvent::GatheringStateChange(GatheringState::Complete)
    }

    impl NegotiationEngine for ScriptedEngine {
        fn create_offer<'a>(
            &'a self,
            config: &'a SessionConfig,
        ) -> BoxFuture<'a, ProbeResult<EngineSession>> {
            Box::pin(async move {
                let url = config.ice_servers[0].urls[0].clone();
                self.opened.lock().unwrap().push(url.clone());

                let script = self
                    .scripts
                    .get(&url)
                    .cloned()
                    .unwrap_or(Script::Events(vec![complete()]));

                let (tx, rx) = mpsc::unbounded_channel();
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                match script {
                    Script::OfferFails => {
                        return Err(ProbeError::offer_failed(&url, "scripted failure"));
                    }
                    Script::Events(events) => {
                        for event in events {
                            tx.send(event).unwrap();
                        }
                        self.senders.lock().unwrap().push(tx);
                    }
                    Script::EventsThenClose(events) => {
                        for event in events {
                            tx.send(event).unwrap();
                        }
                    }
                }
                self.shutdowns.lock().unwrap().push(shutdown_rx);
                Ok(EngineSession::new(rx, shutdown_tx))
            })
        }
    }
}
