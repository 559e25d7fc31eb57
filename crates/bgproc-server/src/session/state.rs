//! A single process session and its lifecycle state machine.
//!
//! ```text
//! starting ──Started──▶ running ──Exited(0)/Killed──▶ stopped
//!    │                     └──────Exited(≠0)/signal──▶ crashed
//!    ├──Killed──▶ stopped
//!    └──SpawnFailed──▶ crashed
//! ```
//!
//! `stopped` and `crashed` are terminal: every event applied to them is
//! rejected with [`ProcError::InvalidTransition`] and leaves the state as is.

use super::driver::SessionEvent;
use super::log_store::LogStore;
use bgproc_core::messages::{ExitInfo, SessionSummary};
use bgproc_core::{LogKind, ProcError, ProcResult, SessionRecord, SessionStatus};
use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, Mutex, MutexGuard};

/// Signal name recorded when a session is stopped by request.
pub const KILL_SIGNAL: &str = "SIGKILL";

/// Events that drive the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The driver confirmed the process is up.
    Started { pid: u32 },
    /// The process ended on its own.
    Exited {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// An explicit kill request.
    Killed,
    /// The driver could not start the process.
    SpawnFailed,
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Started { .. } => "started",
            Transition::Exited { .. } => "exited",
            Transition::Killed => "killed",
            Transition::SpawnFailed => "spawn-failed",
        }
    }
}

/// Mutable part of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub exit_info: Option<ExitInfo>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Starting,
            pid: None,
            exit_info: None,
        }
    }

    /// Apply a transition, returning the new status.
    pub fn apply(&mut self, event: &Transition, now: DateTime<Utc>) -> ProcResult<SessionStatus> {
        let next = match (self.status, event) {
            (SessionStatus::Starting, Transition::Started { pid }) => {
                self.pid = Some(*pid);
                SessionStatus::Running
            }
            (SessionStatus::Starting, Transition::SpawnFailed) => {
                self.exit_info = Some(ExitInfo {
                    code: None,
                    signal: None,
                    ended_at: now,
                });
                SessionStatus::Crashed
            }
            (SessionStatus::Starting | SessionStatus::Running, Transition::Killed) => {
                self.exit_info = Some(ExitInfo {
                    code: None,
                    signal: Some(KILL_SIGNAL.to_string()),
                    ended_at: now,
                });
                SessionStatus::Stopped
            }
            (SessionStatus::Running, Transition::Exited { code, signal }) => {
                let clean = *code == Some(0) && signal.is_none();
                self.exit_info = Some(ExitInfo {
                    code: *code,
                    signal: signal.clone(),
                    ended_at: now,
                });
                if clean {
                    SessionStatus::Stopped
                } else {
                    SessionStatus::Crashed
                }
            }
            (from, event) => {
                return Err(ProcError::InvalidTransition {
                    from,
                    event: event.name(),
                })
            }
        };
        self.status = next;
        Ok(next)
    }
}

/// One tracked background process: identity, lifecycle state and log.
#[derive(Debug)]
pub struct Session {
    id: String,
    command: String,
    start_time: DateTime<Utc>,
    /// Creation sequence number; orders listings and keeps ids unique.
    seq: u64,
    state: RwLock<SessionState>,
    /// Serializes operations that talk to the driver and then transition.
    ops: Mutex<()>,
    log: LogStore,
    /// Where notes go while the event pump runs.
    events: std::sync::Mutex<Option<UnboundedSender<SessionEvent>>>,
}

/// A log note queued behind the session's pending driver events.
#[must_use = "await `appended` to make sure the entry is in the log"]
pub struct PendingNote(Option<oneshot::Receiver<()>>);

impl PendingNote {
    /// Wait until the entry has been appended.
    pub async fn appended(self) {
        if let Some(rx) = self.0 {
            let _ = rx.await;
        }
    }
}

impl Session {
    pub fn new(id: String, command: String, seq: u64) -> Self {
        Self {
            id,
            command,
            start_time: Utc::now(),
            seq,
            state: RwLock::new(SessionState::new()),
            ops: Mutex::new(()),
            log: LogStore::new(),
            events: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    /// Route later [`note`](Self::note)s through the session's event channel.
    pub fn attach_events(&self, notes: UnboundedSender<SessionEvent>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(notes);
    }

    /// Stop routing notes through the event channel. `drain` runs before the
    /// lock is released, so notes still queued land ahead of any later one.
    pub fn detach_events(&self, drain: impl FnOnce()) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        *events = None;
        drain();
    }

    /// Add a log entry after every driver event already queued for this
    /// session. With no event channel attached the entry is appended at once.
    ///
    /// Queue notes while holding the ops lock and await them after releasing
    /// it: the event pump takes that lock to apply an exit.
    pub fn note(&self, kind: LogKind, content: impl Into<String>) -> PendingNote {
        let content = content.into();
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(tx) = events.as_ref() else {
            self.log.append(kind, content);
            return PendingNote(None);
        };
        let (appended, rx) = oneshot::channel();
        match tx.send(SessionEvent::Note {
            kind,
            content,
            appended,
        }) {
            Ok(()) => PendingNote(Some(rx)),
            Err(returned) => {
                if let SessionEvent::Note { kind, content, .. } = returned.0 {
                    self.log.append(kind, content);
                }
                PendingNote(None)
            }
        }
    }

    /// Acquire the per-session operation lock.
    ///
    /// Held by kill, send-keys, paste and exit handling so that a driver
    /// round-trip and the transition that follows it are never interleaved
    /// with another mutation of the same session. Reads do not take it.
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).pid
    }

    pub fn transition(&self, event: Transition) -> ProcResult<SessionStatus> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.apply(&event, Utc::now())
    }

    /// When the session reached a terminal state, if it has.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.status.is_terminal() {
            state.exit_info.as_ref().map(|info| info.ended_at)
        } else {
            None
        }
    }

    pub fn record(&self) -> SessionRecord {
        let state = self.state();
        SessionRecord {
            session_id: self.id.clone(),
            command: self.command.clone(),
            status: state.status,
            pid: state.pid,
            start_time: self.start_time,
            exit_info: state.exit_info,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary::from(&self.record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::driver::{event_channel, DriverEvent, OutputStream};

    fn session() -> Session {
        Session::new("proc-1-test".into(), "echo hi".into(), 1)
    }

    #[test]
    fn starts_in_starting_without_pid() {
        let s = session();
        assert_eq!(s.status(), SessionStatus::Starting);
        assert_eq!(s.pid(), None);
        assert!(s.record().exit_info.is_none());
    }

    #[test]
    fn clean_exit_stops() {
        let s = session();
        s.transition(Transition::Started { pid: 42 }).unwrap();
        assert_eq!(s.pid(), Some(42));
        let status = s
            .transition(Transition::Exited {
                code: Some(0),
                signal: None,
            })
            .unwrap();
        assert_eq!(status, SessionStatus::Stopped);
        assert_eq!(s.record().exit_info.unwrap().code, Some(0));
    }

    #[test]
    fn non_zero_exit_crashes() {
        let s = session();
        s.transition(Transition::Started { pid: 7 }).unwrap();
        let status = s
            .transition(Transition::Exited {
                code: Some(2),
                signal: None,
            })
            .unwrap();
        assert_eq!(status, SessionStatus::Crashed);
    }

    #[test]
    fn external_signal_crashes() {
        let s = session();
        s.transition(Transition::Started { pid: 7 }).unwrap();
        let status = s
            .transition(Transition::Exited {
                code: None,
                signal: Some("SIGSEGV".into()),
            })
            .unwrap();
        assert_eq!(status, SessionStatus::Crashed);
    }

    #[test]
    fn kill_stops_from_starting_and_running() {
        let s = session();
        assert_eq!(s.transition(Transition::Killed).unwrap(), SessionStatus::Stopped);

        let s = session();
        s.transition(Transition::Started { pid: 1 }).unwrap();
        assert_eq!(s.transition(Transition::Killed).unwrap(), SessionStatus::Stopped);
        let info = s.record().exit_info.unwrap();
        assert_eq!(info.signal.as_deref(), Some(KILL_SIGNAL));
    }

    #[test]
    fn terminal_states_reject_everything() {
        let s = session();
        s.transition(Transition::Started { pid: 1 }).unwrap();
        s.transition(Transition::Killed).unwrap();
        let before = s.state();

        for event in [
            Transition::Started { pid: 2 },
            Transition::Exited {
                code: Some(1),
                signal: None,
            },
            Transition::Killed,
            Transition::SpawnFailed,
        ] {
            let err = s.transition(event).unwrap_err();
            assert!(matches!(
                err,
                ProcError::InvalidTransition {
                    from: SessionStatus::Stopped,
                    ..
                }
            ));
        }
        assert_eq!(s.state(), before);
    }

    #[test]
    fn started_only_from_starting() {
        let s = session();
        s.transition(Transition::Started { pid: 1 }).unwrap();
        assert!(s.transition(Transition::Started { pid: 2 }).is_err());
        assert_eq!(s.pid(), Some(1));
    }

    #[test]
    fn spawn_failure_crashes() {
        let s = session();
        assert_eq!(
            s.transition(Transition::SpawnFailed).unwrap(),
            SessionStatus::Crashed
        );
        assert!(s.ended_at().is_some());
    }

    #[test]
    fn note_without_event_channel_appends_at_once() {
        let s = session();
        let _ = s.note(LogKind::System, "process started (pid 1)");
        assert_eq!(s.log().len(), 1);

        let (events, mut rx) = event_channel();
        s.attach_events(events.note_sender());
        let _ = s.note(LogKind::System, "queued");
        s.detach_events(|| {
            while let Ok(event) = rx.try_recv() {
                if let SessionEvent::Note { kind, content, .. } = event {
                    s.log().append(kind, content);
                }
            }
        });
        let _ = s.note(LogKind::System, "direct");

        let contents: Vec<_> = s.log().read(0, 10).entries.into_iter().map(|e| e.content).collect();
        assert_eq!(contents, ["process started (pid 1)", "queued", "direct"]);
    }

    #[tokio::test]
    async fn note_is_queued_behind_pending_output() {
        let s = session();
        let (events, mut rx) = event_channel();
        s.attach_events(events.note_sender());

        events.send(DriverEvent::Output {
            stream: OutputStream::Stdout,
            text: "prompt".into(),
        });
        let pending = s.note(LogKind::InputEcho, "ls");
        assert!(s.log().is_empty());

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Driver(DriverEvent::Output { .. }))
        ));
        match rx.recv().await {
            Some(SessionEvent::Note {
                kind,
                content,
                appended,
            }) => {
                assert_eq!(kind, LogKind::InputEcho);
                assert_eq!(content, "ls");
                appended.send(()).unwrap();
            }
            other => panic!("expected a note, got {other:?}"),
        }
        pending.appended().await;
    }
}
