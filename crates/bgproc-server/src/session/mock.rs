//! Scripted in-memory driver for tests.

use super::driver::{DriverEvent, DriverFuture, EventSender, ExitStatus, OutputStream, ProcessDriver};
use bgproc_core::ProcError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct MockProcess {
    events: Option<EventSender>,
    input: Vec<u8>,
    terminated: bool,
}

/// Driver whose processes only do what the test tells them to.
pub struct MockDriver {
    next_pid: AtomicU32,
    processes: Mutex<HashMap<u32, MockProcess>>,
    pub fail_spawn: AtomicBool,
    pub fail_terminate: AtomicBool,
    /// When set, `send_input` never completes.
    pub hang_input: AtomicBool,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(HashMap::new()),
            fail_spawn: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            hang_input: AtomicBool::new(false),
        }
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, pid: u32) -> Option<EventSender> {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .and_then(|p| p.events.clone())
    }

    /// Make the process print a line.
    pub async fn emit(&self, pid: u32, stream: OutputStream, text: &str) {
        if let Some(tx) = self.sender(pid) {
            tx.send(DriverEvent::Output {
                stream,
                text: text.to_string(),
            });
        }
    }

    /// Make the process exit; its event stream closes afterwards.
    pub async fn exit(&self, pid: u32, status: ExitStatus) {
        let tx = self
            .processes
            .lock()
            .unwrap()
            .get_mut(&pid)
            .and_then(|p| p.events.take());
        if let Some(tx) = tx {
            tx.send(DriverEvent::Exited(status));
        }
    }

    /// Everything written to the process input so far.
    pub fn input(&self, pid: u32) -> Vec<u8> {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .map(|p| p.input.clone())
            .unwrap_or_default()
    }

    pub fn was_terminated(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|p| p.terminated)
    }
}

impl ProcessDriver for MockDriver {
    fn spawn<'a>(&'a self, _command: &'a str, events: EventSender) -> DriverFuture<'a, u32> {
        Box::pin(async move {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(ProcError::Driver("spawn refused".into()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.processes.lock().unwrap().insert(
                pid,
                MockProcess {
                    events: Some(events),
                    ..Default::default()
                },
            );
            Ok(pid)
        })
    }

    fn send_input<'a>(&'a self, pid: u32, data: &'a [u8]) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            if self.hang_input.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let mut processes = self.processes.lock().unwrap();
            let process = processes
                .get_mut(&pid)
                .ok_or_else(|| ProcError::Driver(format!("no process {pid}")))?;
            process.input.extend_from_slice(data);
            Ok(())
        })
    }

    fn terminate(&self, pid: u32) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_terminate.load(Ordering::SeqCst) {
                return Err(ProcError::Driver("terminate refused".into()));
            }
            let tx = {
                let mut processes = self.processes.lock().unwrap();
                let Some(process) = processes.get_mut(&pid) else {
                    return Ok(());
                };
                process.terminated = true;
                process.events.take()
            };
            if let Some(tx) = tx {
                tx.send(DriverEvent::Exited(ExitStatus::signal("SIGKILL")));
            }
            Ok(())
        })
    }
}
