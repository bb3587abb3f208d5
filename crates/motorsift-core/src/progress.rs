//! Per-session progress events for live UIs.
//!
//! Subscribers get an unbounded channel per session. Events for a given
//! source are always `started` first and then exactly one terminal status;
//! `finished` is last. Publishing never blocks: a disconnected subscriber is
//! simply pruned.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Completed sessions remembered for late subscribers.
const FINISHED_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
}

impl SourceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SourceStatus::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Source {
        session_id: Uuid,
        source: String,
        status: SourceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Finished {
        session_id: Uuid,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

impl ProgressEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            ProgressEvent::Source { session_id, .. } | ProgressEvent::Finished { session_id, .. } => {
                *session_id
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ProgressEvent::Finished { .. })
    }
}

/// Current per-source status of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub sources: BTreeMap<String, SourceStatus>,
    pub finished: bool,
}

#[derive(Default)]
struct Session {
    subscribers: Vec<UnboundedSender<ProgressEvent>>,
    sources: BTreeMap<String, SourceStatus>,
    /// Insertion order of sources, for replay.
    order: Vec<String>,
    started: bool,
}

impl Session {
    fn publish(&mut self, event: &ProgressEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Never started and nobody is listening any more.
    fn is_abandoned(&self) -> bool {
        !self.started && self.subscribers.iter().all(|tx| tx.is_closed())
    }
}

#[derive(Default)]
struct ReporterState {
    sessions: HashMap<Uuid, Session>,
    finished: VecDeque<ProgressEvent>,
}

#[derive(Default)]
pub struct ProgressReporter {
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned progress reporter mutex");
            poisoned.into_inner()
        })
    }

    /// Subscribe to a session's events. May be called before the session starts.
    ///
    /// A subscriber joining mid-session first receives the current status of
    /// every source; one joining after completion receives only `finished`.
    pub fn subscribe(&self, session_id: Uuid) -> UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock_state();
        prune_abandoned(&mut state);

        if let Some(done) = state.finished.iter().find(|e| e.session_id() == session_id) {
            let _ = tx.send(done.clone());
            return rx;
        }

        let session = state.sessions.entry(session_id).or_default();
        for source in &session.order {
            if let Some(status) = session.sources.get(source) {
                if status.is_terminal() {
                    let _ = tx.send(source_event(session_id, source, SourceStatus::Started, None));
                }
                let _ = tx.send(source_event(session_id, source, *status, None));
            }
        }
        session.subscribers.push(tx);
        rx
    }

    /// Mark a session as running. Returns `false` if a search already runs under it.
    ///
    /// Subscribers that joined before the search are kept.
    pub fn claim(&self, session_id: Uuid) -> bool {
        let mut state = self.lock_state();
        let session = state.sessions.entry(session_id).or_default();
        if session.started {
            return false;
        }
        session.started = true;
        true
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.lock_state()
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.started)
    }

    /// Drop sessions that were subscribed to but never started and whose
    /// subscribers have all disconnected. Returns how many were removed.
    pub fn prune_abandoned(&self) -> usize {
        prune_abandoned(&mut self.lock_state())
    }

    /// Announce the candidate sources of a search. Emits `started` for each.
    pub fn start_search(&self, session_id: Uuid, sources: &[String]) {
        tracing::debug!(session = %session_id, sources = sources.len(), "Search started");
        let mut state = self.lock_state();
        let session = state.sessions.entry(session_id).or_default();
        session.started = true;

        for source in sources {
            if session.sources.contains_key(source) {
                continue;
            }
            session.sources.insert(source.clone(), SourceStatus::Started);
            session.order.push(source.clone());
            session.publish(&source_event(session_id, source, SourceStatus::Started, None));
        }
    }

    /// Record a terminal status for a source.
    ///
    /// Ignored when the source was never started or already resolved, so a
    /// subscriber never sees events out of order.
    pub fn update_source(
        &self,
        session_id: Uuid,
        source: &str,
        status: SourceStatus,
        detail: Option<String>,
    ) {
        let mut state = self.lock_state();
        let Some(session) = state.sessions.get_mut(&session_id) else {
            tracing::debug!(session = %session_id, source, "Progress update for unknown session");
            return;
        };

        match session.sources.get(source) {
            Some(SourceStatus::Started) if status.is_terminal() => {}
            _ => {
                tracing::debug!(session = %session_id, source, ?status, "Ignoring out-of-order progress update");
                return;
            }
        }

        session.sources.insert(source.to_string(), status);
        let event = source_event(session_id, source, status, detail);
        log_event(&event);
        session.publish(&event);
    }

    /// Emit `finished` and drop the session. Subscribers' channels close.
    pub fn complete(&self, session_id: Uuid) {
        let mut state = self.lock_state();
        let Some(mut session) = state.sessions.remove(&session_id) else {
            return;
        };

        let count = |wanted: SourceStatus| session.sources.values().filter(|s| **s == wanted).count();
        let event = ProgressEvent::Finished {
            session_id,
            succeeded: count(SourceStatus::Succeeded),
            failed: count(SourceStatus::Failed),
            skipped: count(SourceStatus::Skipped),
        };
        log_event(&event);
        session.publish(&event);

        state.finished.push_back(event);
        while state.finished.len() > FINISHED_HISTORY {
            state.finished.pop_front();
        }
    }

    pub fn snapshot(&self, session_id: Uuid) -> Option<ProgressSnapshot> {
        let state = self.lock_state();
        if let Some(session) = state.sessions.get(&session_id)
            && session.started
        {
            return Some(ProgressSnapshot {
                session_id,
                sources: session.sources.clone(),
                finished: false,
            });
        }
        state
            .finished
            .iter()
            .any(|e| e.session_id() == session_id)
            .then(|| ProgressSnapshot {
                session_id,
                sources: BTreeMap::new(),
                finished: true,
            })
    }

    /// Number of sessions currently tracked (started or subscribed).
    pub fn active_sessions(&self) -> usize {
        self.lock_state().sessions.len()
    }
}

fn prune_abandoned(state: &mut ReporterState) -> usize {
    let before = state.sessions.len();
    state.sessions.retain(|_, session| !session.is_abandoned());
    let pruned = before - state.sessions.len();
    if pruned > 0 {
        tracing::debug!(pruned, "Dropped abandoned progress sessions");
    }
    pruned
}

fn source_event(
    session_id: Uuid,
    source: &str,
    status: SourceStatus,
    detail: Option<String>,
) -> ProgressEvent {
    ProgressEvent::Source {
        session_id,
        source: source.to_string(),
        status,
        detail,
    }
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Source {
            session_id,
            source,
            status: SourceStatus::Failed,
            detail,
        } => {
            tracing::warn!(session = %session_id, %source, ?detail, "Source failed");
        }
        ProgressEvent::Source {
            session_id,
            source,
            status,
            detail,
        } => {
            tracing::debug!(session = %session_id, %source, ?status, ?detail, "Source progress");
        }
        ProgressEvent::Finished {
            session_id,
            succeeded,
            failed,
            skipped,
        } => {
            tracing::info!(session = %session_id, succeeded, failed, skipped, "Search finished");
        }
    }
}
