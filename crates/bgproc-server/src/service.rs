//! Session service: the operations exposed to callers.
//!
//! Composes the registry, per-session logs and the process driver. Every
//! driver round-trip is bounded by the configured timeout, and every
//! mutation of a session happens under that session's operation lock.
//! Once a session is running, its log is written only by its event pump.

use crate::session::driver::DriverFuture;
use crate::session::{
    event_channel, DriverEvent, ProcessDriver, Session, SessionEvent, SessionRegistry,
    Transition, DEFAULT_PAGE_LIMIT,
};
use bgproc_core::messages::SessionList;
use bgproc_core::{
    encode_keys, render_paste, LogKind, LogPage, ProcError, ProcResult, SessionRecord,
    SessionStatus,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tunables for [`SessionService`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Upper bound on any single driver call.
    pub driver_timeout: Duration,
    /// Page size when `fetch_log` is called without a limit.
    pub default_limit: usize,
    /// Larger limits are clamped to this.
    pub max_limit: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            driver_timeout: Duration::from_secs(5),
            default_limit: DEFAULT_PAGE_LIMIT,
            max_limit: 1000,
        }
    }
}

/// What a kill request did.
#[derive(Debug)]
pub enum KillOutcome {
    /// The session was running and is now stopped.
    Terminated,
    /// The session had already ended; nothing was done.
    AlreadyEnded(SessionStatus),
    /// The session is marked stopped, but the driver reported a failure.
    TerminateFailed(ProcError),
}

pub struct SessionService {
    registry: Arc<SessionRegistry>,
    driver: Arc<dyn ProcessDriver>,
    settings: ServiceSettings,
}

impl SessionService {
    pub fn new(driver: Arc<dyn ProcessDriver>, settings: ServiceSettings) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            driver,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    async fn bounded<T>(&self, call: DriverFuture<'_, T>) -> ProcResult<T> {
        tokio::time::timeout(self.settings.driver_timeout, call)
            .await
            .map_err(|_| ProcError::Timeout)?
    }

    /// Create a session for `command` and start its process.
    ///
    /// If the driver fails, the session stays registered as `crashed` so its
    /// log can still be inspected.
    pub async fn spawn(&self, command: &str) -> ProcResult<SessionRecord> {
        let session = self.registry.create(command).await;
        let _ops = session.lock_ops().await;

        let (sender, events) = event_channel();
        let notes = sender.note_sender();

        match self.bounded(self.driver.spawn(command, sender)).await {
            Ok(pid) => {
                session.transition(Transition::Started { pid })?;
                session.attach_events(notes);
                // The pump is not running yet, so this lands ahead of any output.
                session
                    .log()
                    .append(LogKind::System, format!("process started (pid {pid})"));
                info!(session_id = %session.id(), pid, command, "session started");
                spawn_event_pump(session.clone(), events);
                Ok(session.record())
            }
            Err(e) => {
                drop((notes, events));
                let cause = driver_cause(&e);
                session.transition(Transition::SpawnFailed)?;
                session
                    .log()
                    .append(LogKind::System, format!("failed to start: {cause}"));
                warn!(session_id = %session.id(), error = %e, "session failed to start");
                Err(ProcError::Driver(format!(
                    "failed to start session '{}': {cause}",
                    session.id()
                )))
            }
        }
    }

    pub async fn list(&self) -> SessionList {
        let sessions: Vec<_> = self
            .registry
            .list()
            .await
            .iter()
            .map(|s| s.summary())
            .collect();
        SessionList {
            count: sessions.len(),
            sessions,
        }
    }

    pub async fn status(&self, session_id: &str) -> ProcResult<SessionRecord> {
        Ok(self.registry.require(session_id).await?.record())
    }

    /// Page through a session's log.
    ///
    /// Unknown sessions read as an empty log: the session may already have
    /// been reaped. Negative arguments clamp to zero.
    pub async fn fetch_log(
        &self,
        session_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> LogPage {
        let offset = offset.map_or(0, clamp_non_negative);
        let limit = limit
            .map_or(self.settings.default_limit, clamp_non_negative)
            .min(self.settings.max_limit);

        let (total, entries) = match self.registry.get(session_id).await {
            Some(session) => {
                let slice = session.log().read(offset, limit);
                (slice.total, slice.entries)
            }
            None => {
                debug!(session_id, "log requested for unknown session");
                (0, Vec::new())
            }
        };

        LogPage {
            session_id: session_id.to_string(),
            total,
            offset,
            limit,
            entries,
        }
    }

    /// Ensure the session is no longer running. Idempotent.
    pub async fn kill(&self, session_id: &str) -> ProcResult<KillOutcome> {
        let session = self.registry.require(session_id).await?;
        let ops = session.lock_ops().await;

        let status = session.status();
        if status.is_terminal() {
            debug!(session_id, %status, "kill: session already ended");
            return Ok(KillOutcome::AlreadyEnded(status));
        }

        let terminated = match session.pid() {
            Some(pid) => self.bounded(self.driver.terminate(pid)).await,
            None => Ok(()),
        };

        session.transition(Transition::Killed)?;
        let logged = session.note(LogKind::System, "session terminated by request");
        drop(ops);
        logged.appended().await;

        match terminated {
            Ok(()) => {
                info!(session_id, "session killed");
                Ok(KillOutcome::Terminated)
            }
            Err(e) => {
                warn!(session_id, error = %e, "terminate failed, session marked stopped");
                Ok(KillOutcome::TerminateFailed(e))
            }
        }
    }

    /// Deliver key tokens to a running session.
    pub async fn send_keys(&self, session_id: &str, keys: &[String]) -> ProcResult<()> {
        let session = self.registry.require(session_id).await?;
        let ops = session.lock_ops().await;
        let pid = running_pid(&session)?;

        self.bounded(self.driver.send_input(pid, &encode_keys(keys)))
            .await?;
        let logged = session.note(LogKind::InputEcho, keys.join(" "));
        drop(ops);
        logged.appended().await;
        debug!(session_id, count = keys.len(), "keys sent");
        Ok(())
    }

    /// Paste text into a running session, optionally as a bracketed paste.
    pub async fn paste(&self, session_id: &str, text: &str, bracketed: bool) -> ProcResult<()> {
        let session = self.registry.require(session_id).await?;
        let ops = session.lock_ops().await;
        let pid = running_pid(&session)?;

        let rendered = render_paste(text, bracketed);
        self.bounded(self.driver.send_input(pid, rendered.as_bytes()))
            .await?;
        let logged = session.note(LogKind::InputEcho, rendered);
        drop(ops);
        logged.appended().await;
        debug!(session_id, bracketed, len = text.len(), "text pasted");
        Ok(())
    }

    /// Remove sessions that have been terminated for longer than `retention`.
    pub async fn reap(&self, retention: Duration) -> Vec<String> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        self.registry.reap(Utc::now() - retention).await
    }

    /// Kill every session that is still alive. Used on server shutdown.
    pub async fn shutdown(&self) {
        for session in self.registry.list().await {
            if session.status().is_terminal() {
                continue;
            }
            if let Err(e) = self.kill(session.id()).await {
                warn!(session_id = %session.id(), error = %e, "failed to stop session on shutdown");
            }
        }
    }
}

fn running_pid(session: &Session) -> ProcResult<u32> {
    let state = session.state();
    match (state.status, state.pid) {
        (SessionStatus::Running, Some(pid)) => Ok(pid),
        (status, _) => Err(ProcError::NotRunning {
            session_id: session.id().to_string(),
            status,
        }),
    }
}

fn clamp_non_negative(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// The underlying cause of a driver error, without the variant's prefix.
fn driver_cause(e: &ProcError) -> String {
    match e {
        ProcError::Driver(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Write the session's event channel into its log in arrival order. The
/// exit event drives the final transition; output reported after it is
/// dropped. Once the driver is gone the session goes back to appending its
/// notes directly.
fn spawn_event_pump(session: Arc<Session>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    tokio::spawn(async move {
        let mut exited = false;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Driver(DriverEvent::Output { stream, text }) => {
                    if exited {
                        debug!(session_id = %session.id(), "output after exit dropped");
                        continue;
                    }
                    session.log().append(stream.into(), text);
                }
                SessionEvent::Driver(DriverEvent::Exited(status)) => {
                    if exited {
                        continue;
                    }
                    exited = true;
                    let description = status.describe();
                    record_exit(&session, status.code, status.signal, description).await;
                }
                SessionEvent::Note {
                    kind,
                    content,
                    appended,
                } => {
                    session.log().append(kind, content);
                    let _ = appended.send(());
                }
                SessionEvent::DriverGone => break,
            }
        }

        if !exited {
            record_exit(
                &session,
                None,
                None,
                "process event stream closed without exit status".to_string(),
            )
            .await;
        }

        session.detach_events(|| {
            while let Ok(event) = events.try_recv() {
                if let SessionEvent::Note {
                    kind,
                    content,
                    appended,
                } = event
                {
                    session.log().append(kind, content);
                    let _ = appended.send(());
                }
            }
        });
        debug!(session_id = %session.id(), "event pump finished");
    });
}

async fn record_exit(
    session: &Session,
    code: Option<i32>,
    signal: Option<String>,
    description: String,
) {
    let _ops = session.lock_ops().await;
    match session.transition(Transition::Exited { code, signal }) {
        Ok(status) => {
            session.log().append(LogKind::System, description);
            info!(session_id = %session.id(), %status, code = ?code, "session exited");
        }
        Err(e) => {
            debug!(session_id = %session.id(), error = %e, "exit event ignored");
        }
    }
}
