//! Abstract process driver.
//!
//! The driver owns OS processes; sessions only refer to them by pid. Output
//! and the final exit status go into the session's event channel through an
//! [`EventSender`]. Nothing may follow the exit event.
//!
//! The same channel also carries the session's own log notes (input echo,
//! lifecycle notices), so every entry reaches the log in the order it was
//! queued.

use bgproc_core::{LogKind, ProcResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = ProcResult<T>> + Send + 'a>>;

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl From<OutputStream> for LogKind {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => LogKind::Stdout,
            OutputStream::Stderr => LogKind::Stderr,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    /// Line recorded in the session log.
    pub fn describe(&self) -> String {
        match (&self.signal, self.code) {
            (Some(signal), _) => format!("process terminated by signal {signal}"),
            (None, Some(code)) => format!("process exited with code {code}"),
            (None, None) => "process exited".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Output { stream: OutputStream, text: String },
    Exited(ExitStatus),
}

/// One item on a session's event channel.
#[derive(Debug)]
pub enum SessionEvent {
    Driver(DriverEvent),
    /// A log entry written by the session itself; `appended` fires once it
    /// is in the log.
    Note {
        kind: LogKind,
        content: String,
        appended: oneshot::Sender<()>,
    },
    /// Every driver-side sender is gone; only notes can follow.
    DriverGone,
}

/// The driver's handle on a session's event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
    _guard: Arc<DriverGuard>,
}

/// Shared by all clones of one [`EventSender`]; reports `DriverGone` when
/// the last of them is dropped.
#[derive(Debug)]
struct DriverGuard {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(SessionEvent::DriverGone);
    }
}

impl EventSender {
    /// Queue an event. Returns `false` once the session stopped listening.
    pub fn send(&self, event: DriverEvent) -> bool {
        self.tx.send(SessionEvent::Driver(event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A raw sender for the session's own notes. It does not keep the
    /// driver side alive.
    pub fn note_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.tx.clone()
    }
}

/// A new event channel: the sender goes to the driver, the receiver to the
/// session's event pump.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let guard = Arc::new(DriverGuard { tx: tx.clone() });
    (EventSender { tx, _guard: guard }, rx)
}

/// Capability to spawn and control OS processes.
pub trait ProcessDriver: Send + Sync {
    /// Start `command`, reporting its output and exit through `events`.
    /// Returns the pid.
    fn spawn<'a>(&'a self, command: &'a str, events: EventSender) -> DriverFuture<'a, u32>;

    /// Write raw bytes to the process input.
    fn send_input<'a>(&'a self, pid: u32, data: &'a [u8]) -> DriverFuture<'a, ()>;

    /// Terminate the process. Terminating a process that already exited succeeds.
    fn terminate(&self, pid: u32) -> DriverFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_descriptions() {
        assert_eq!(ExitStatus::code(0).describe(), "process exited with code 0");
        assert_eq!(
            ExitStatus::signal("SIGTERM").describe(),
            "process terminated by signal SIGTERM"
        );
    }

    #[test]
    fn stream_maps_to_log_kind() {
        assert_eq!(LogKind::from(OutputStream::Stderr), LogKind::Stderr);
    }

    #[test]
    fn sender_reports_closed_channel() {
        let (events, rx) = event_channel();
        assert!(events.send(DriverEvent::Exited(ExitStatus::code(0))));
        drop(rx);
        assert!(events.is_closed());
        assert!(!events.send(DriverEvent::Exited(ExitStatus::code(0))));
    }

    #[tokio::test]
    async fn last_driver_sender_reports_driver_gone() {
        let (events, mut rx) = event_channel();
        let notes = events.note_sender();
        let clone = events.clone();
        drop(events);
        clone.send(DriverEvent::Exited(ExitStatus::code(0)));
        drop(clone);

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Driver(DriverEvent::Exited(_)))
        ));
        assert!(matches!(rx.recv().await, Some(SessionEvent::DriverGone)));
        // The note sender is still open after the driver left.
        assert!(!notes.is_closed());
    }
}
