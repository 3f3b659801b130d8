use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, instrument, trace, warn};

use super::{deadline_after, Transport, TransportError, TransportFactory};
use crate::cancel::CancelToken;
use crate::protocol::{classify_line, AnalysisResult, Query, ResponseLine};

/// How to launch the engine subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Program to run.
    pub command: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Let the engine write to our stderr instead of discarding it.
    pub allow_stderr: bool,
}

impl ProcessConfig {
    /// Launch `command` with `args`, engine stderr discarded.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        ProcessConfig {
            command: command.into(),
            args,
            allow_stderr: false,
        }
    }

    /// Split a whole command line on whitespace (`"katago analysis -config a.cfg"`).
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let command = parts.next()?;
        Some(Self::new(command, parts.collect()))
    }

    /// Forward the engine stderr (debug purposes).
    pub fn with_allow_stderr(mut self, value: bool) -> Self {
        self.allow_stderr = value;
        self
    }
}

impl TransportFactory for ProcessConfig {
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(ProcessTransport::spawn(self)?))
    }
}

/// Transport over the stdin/stdout pipes of one long-lived engine process.
///
/// A reader thread forwards every stdout line into a channel, so waiting for an answer can
/// time out without blocking on the pipe. The transport never restarts the engine: once the
/// process is gone every call fails with [`TransportError::Unreachable`].
///
/// The child process is killed on drop.
#[derive(Debug)]
pub struct ProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    command: String,
}

impl ProcessTransport {
    /// Poll interval used while waiting, so cancellation is noticed.
    const POLL_SLICE: Duration = Duration::from_millis(50);
    const KILL_TIMEOUT: Duration = Duration::from_secs(1);

    /// Start the engine.
    ///
    /// # Errors
    ///
    /// [`TransportError::Unreachable`] if the process cannot be spawned.
    #[instrument(skip_all, fields(command = %config.command))]
    pub fn spawn(config: &ProcessConfig) -> Result<ProcessTransport, TransportError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if !config.allow_stderr {
            cmd.stderr(Stdio::null());
        }
        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Unreachable(format!("could not launch '{}': {e}", config.command))
        })?;

        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Unreachable("engine stdout not captured".to_string()));
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let reader = thread::Builder::new()
            .name("engine-stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| TransportError::Unreachable(format!("could not start reader: {e}")))?;

        debug!(pid = child.id(), "engine process started");
        Ok(ProcessTransport {
            child,
            stdin,
            lines: rx,
            reader: Some(reader),
            command: config.command.clone(),
        })
    }

    /// OS id of the engine process.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn write_request(&mut self, query: &Query) -> Result<(), TransportError> {
        let line = query
            .to_request_line()
            .map_err(|e| TransportError::MalformedResponse(format!("could not encode query: {e}")))?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| TransportError::Unreachable("engine stdin closed".to_string()))?;
        writeln!(stdin, "{line}")
            .and_then(|_| stdin.flush())
            .map_err(|e| {
                TransportError::Unreachable(format!("could not write to '{}': {e}", self.command))
            })
    }

    fn wait_for_answer(
        &mut self,
        id: &str,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<AnalysisResult, TransportError> {
        let start = Instant::now();
        let mut deadline = deadline_after(timeout);
        let mut shortened = false;
        let mut malformed = None;

        loop {
            if let Some(cancel) = cancel {
                if !shortened && cancel.is_cancelled() {
                    deadline = deadline.min(deadline_after(cancel.grace()));
                    shortened = true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(match malformed {
                    Some(msg) => TransportError::MalformedResponse(msg),
                    None => TransportError::Timeout(now - start),
                });
            }

            let slice = (deadline - now).min(Self::POLL_SLICE);
            let line = match self.lines.recv_timeout(slice) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let status = self.child.try_wait().ok().flatten();
                    return Err(TransportError::Unreachable(match status {
                        Some(status) => format!("engine exited ({status})"),
                        None => "engine closed its output".to_string(),
                    }));
                }
            };

            match classify_line(&line, id) {
                ResponseLine::Answer(result) => return Ok(result),
                ResponseLine::Rejected(msg) => return Err(TransportError::EngineRejected(msg)),
                ResponseLine::Warning(msg) => warn!(id, "engine warning: {msg}"),
                ResponseLine::Malformed(msg) => {
                    warn!(id, "undecodable response: {msg}");
                    malformed = Some(msg);
                }
                ResponseLine::Foreign(other) => trace!(id, other = %other, "discarding foreign response"),
                ResponseLine::Noise => trace!("engine: {line}"),
            }
        }
    }

    fn try_kill(&mut self) {
        // closing stdin lets a well-behaved engine exit on its own
        drop(self.stdin.take());
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            warn!("could not kill engine process {}: {e}", self.child.id());
            return;
        }
        let deadline = Instant::now() + Self::KILL_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        warn!("engine process {} still running after kill", self.child.id());
    }
}

impl Transport for ProcessTransport {
    #[instrument(skip_all, fields(id = %query.id))]
    fn send(&mut self, query: &Query, timeout: Duration) -> Result<AnalysisResult, TransportError> {
        self.write_request(query)?;
        self.wait_for_answer(&query.id, timeout, None)
    }

    #[instrument(skip_all, fields(id = %query.id))]
    fn send_cancellable(
        &mut self,
        query: &Query,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, TransportError> {
        self.write_request(query)?;
        self.wait_for_answer(&query.id, cancel.clamp(timeout), Some(cancel))
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.try_kill();
        if let Some(reader) = self.reader.take() {
            // the reader ends once the pipe closes; never block drop on a stuck child
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
    }
}
