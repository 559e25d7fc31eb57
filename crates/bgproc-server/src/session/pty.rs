//! PTY-backed process driver using portable-pty.
//!
//! Each command runs as `<shell> -c <command>` on its own pseudo-terminal.
//! A blocking reader forwards raw PTY output to a line assembler task,
//! which reports complete lines and flushes a partial one (a prompt) once
//! the output goes quiet. A waiter reports the exit status once the child
//! is gone and the assembler has drained or been stopped.

use super::driver::{DriverEvent, DriverFuture, EventSender, ExitStatus, OutputStream, ProcessDriver};
use bgproc_core::{ProcError, ProcResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long to wait for trailing output after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// An unterminated line is reported once no output arrived for this long.
const PARTIAL_LINE_FLUSH: Duration = Duration::from_millis(100);

/// Raw chunks in flight between the reader thread and the assembler.
const CHUNK_QUEUE: usize = 64;

/// Settings for spawned PTYs.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub env: HashMap<String, String>,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            cols: 120,
            rows: 40,
            env: HashMap::new(),
        }
    }
}

/// A live PTY process tracked by the driver.
struct PtyProcess {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Kept so the PTY stays open while the process runs.
    _master: Box<dyn MasterPty + Send>,
}

type ProcessTable = Arc<Mutex<HashMap<u32, PtyProcess>>>;

pub struct PtyDriver {
    options: PtyOptions,
    processes: ProcessTable,
}

impl PtyDriver {
    pub fn new(options: PtyOptions) -> Self {
        Self {
            options,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of processes the driver still owns.
    pub fn live_count(&self) -> usize {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Open a PTY, start the command on it and wire up its reader and waiter.
/// Blocking: runs on the blocking pool.
fn spawn_pty(
    options: &PtyOptions,
    processes: &ProcessTable,
    command: &str,
    events: EventSender,
    runtime: &Handle,
) -> ProcResult<u32> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows: options.rows,
        cols: options.cols,
        pixel_width: 0,
        pixel_height: 0,
    };

    let pair = pty_system
        .openpty(size)
        .map_err(|e| ProcError::Driver(format!("failed to open PTY: {e}")))?;

    let mut cmd = CommandBuilder::new(&options.shell);
    cmd.arg("-c");
    cmd.arg(command);
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ProcError::Driver(format!("failed to spawn command: {e}")))?;
    // The reader only sees EOF once every slave handle is closed.
    drop(pair.slave);

    let Some(pid) = child.process_id() else {
        let _ = child.kill();
        return Err(ProcError::Driver("spawned process has no pid".into()));
    };

    // The caller stopped waiting (timed out) while we were forking.
    if events.is_closed() {
        let _ = child.kill();
        return Err(ProcError::Driver(format!("spawn of pid {pid} abandoned")));
    }

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ProcError::Driver(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ProcError::Driver(format!("failed to take PTY writer: {e}")))?;

    processes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(
            pid,
            PtyProcess {
                writer: Arc::new(Mutex::new(writer)),
                killer: child.clone_killer(),
                _master: pair.master,
            },
        );

    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
    runtime.spawn_blocking(move || read_chunks(reader, chunk_tx));
    let mut assembler = runtime.spawn(assemble_lines(chunk_rx, events.clone()));

    let processes = processes.clone();
    let waiter_runtime = runtime.clone();
    runtime.spawn(async move {
        let status = waiter_runtime.spawn_blocking(move || child.wait()).await;
        let exit = match status {
            Ok(Ok(status)) => ExitStatus::code(i32::try_from(status.exit_code()).unwrap_or(-1)),
            Ok(Err(e)) => {
                warn!(pid, error = %e, "failed to wait for PTY child");
                ExitStatus {
                    code: None,
                    signal: None,
                }
            }
            Err(e) => {
                warn!(pid, error = %e, "PTY wait task failed");
                ExitStatus {
                    code: None,
                    signal: None,
                }
            }
        };

        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut assembler)
            .await
            .is_err()
        {
            // Something else still holds the PTY open (a background
            // grandchild). Stop reporting its output: exit comes last.
            debug!(pid, "PTY still open after child exit, dropping further output");
            assembler.abort();
            let _ = (&mut assembler).await;
        }

        processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        info!(pid, code = ?exit.code, "PTY child exited");
        events.send(DriverEvent::Exited(exit));
    });

    info!(pid, cols = size.cols, rows = size.rows, "PTY spawned");
    Ok(pid)
}

impl ProcessDriver for PtyDriver {
    fn spawn<'a>(&'a self, command: &'a str, events: EventSender) -> DriverFuture<'a, u32> {
        Box::pin(async move {
            if command.trim().is_empty() {
                return Err(ProcError::Driver("empty command".into()));
            }
            let options = self.options.clone();
            let processes = self.processes.clone();
            let command = command.to_string();
            let runtime = Handle::current();
            tokio::task::spawn_blocking(move || {
                spawn_pty(&options, &processes, &command, events, &runtime)
            })
            .await
            .map_err(|e| ProcError::Driver(format!("join error: {e}")))?
        })
    }

    fn send_input<'a>(&'a self, pid: u32, data: &'a [u8]) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let writer = self
                .processes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&pid)
                .map(|p| p.writer.clone())
                .ok_or_else(|| ProcError::Driver(format!("process {pid} is not running")))?;

            let data = data.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                writer.write_all(&data)?;
                writer.flush()
            })
            .await
            .map_err(|e| ProcError::Driver(format!("join error: {e}")))??;

            debug!(pid, "input delivered to PTY");
            Ok(())
        })
    }

    fn terminate(&self, pid: u32) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let mut processes = self
                .processes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match processes.get_mut(&pid) {
                Some(process) => process
                    .killer
                    .kill()
                    .map_err(|e| ProcError::Driver(format!("kill failed: {e}"))),
                None => {
                    debug!(pid, "terminate: process already gone");
                    Ok(())
                }
            }
        })
    }
}

/// Blocking read loop; runs until EOF (or EIO once the child side closes)
/// or until the assembler goes away.
fn read_chunks(mut reader: Box<dyn Read + Send>, chunks: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if chunks.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Turn raw chunks into output lines. A partial line is reported on its own
/// after [`PARTIAL_LINE_FLUSH`] of silence; the rest of that line, if it
/// ever comes, starts a new entry.
async fn assemble_lines(mut chunks: mpsc::Receiver<Vec<u8>>, events: EventSender) {
    let mut splitter = LineSplitter::default();
    loop {
        let chunk = if splitter.has_pending() {
            match tokio::time::timeout(PARTIAL_LINE_FLUSH, chunks.recv()).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    if let Some(text) = splitter.finish() {
                        if !emit(&events, text) {
                            return;
                        }
                    }
                    continue;
                }
            }
        } else {
            chunks.recv().await
        };

        let Some(chunk) = chunk else {
            break;
        };
        for text in splitter.push(&chunk) {
            if !emit(&events, text) {
                return;
            }
        }
    }

    if let Some(text) = splitter.finish() {
        emit(&events, text);
    }
}

fn emit(events: &EventSender, text: String) -> bool {
    events.send(DriverEvent::Output {
        stream: OutputStream::Stdout,
        text,
    })
}

/// Splits a byte stream into lines, holding back the unterminated tail.
///
/// Works on bytes so multi-byte characters split across reads decode intact.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Flush the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
