//! Interpreter subprocess adapter
//!
//! Wraps one child process with piped stdin/stdout/stderr. Input goes in a
//! line at a time through [`ProcessAdapter::send`]; output comes back as a
//! lazy stream of text chunks from [`ProcessAdapter::take_output`]. A
//! terminated adapter cannot be restarted, so callers create a new one.

use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::SessionError;
use crate::config::InterpreterConfig;

/// Bytes requested from a pipe per read
const READ_CHUNK_SIZE: usize = 4096;

/// Output chunks from stdout and stderr, merged in arrival order
pub type OutputChunks = Pin<Box<dyn Stream<Item = Result<String, SessionError>> + Send>>;

/// One running interpreter process, owned by exactly one chat session
#[derive(Debug)]
pub struct ProcessAdapter {
    program: String,
    pid: Option<u32>,
    grace: Duration,
    write_timeout: Duration,
    child: StdMutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    output: StdMutex<Option<(ChildStdout, ChildStderr)>>,
}

impl ProcessAdapter {
    /// Spawn the interpreter described by `config`.
    ///
    /// On unix the child leads its own process group so that termination
    /// reaches anything it forks. `grace` separates SIGTERM from SIGKILL and
    /// `write_timeout` bounds every [`send`](Self::send).
    pub fn start(
        config: &InterpreterConfig,
        grace: Duration,
        write_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let spawn_error = |source: io::Error| SessionError::Spawn {
            program: config.program.clone(),
            source,
        };

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(spawn_error)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            return Err(spawn_error(io::Error::other("interpreter pipes were not captured")));
        };

        let pid = child.id();
        info!("Spawned interpreter {} (pid {:?})", config.program, pid);

        Ok(Self {
            program: config.program.clone(),
            pid,
            grace,
            write_timeout,
            child: StdMutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            output: StdMutex::new(Some((stdout, stderr))),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the child is still running, as observed by a non-blocking wait
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!("Interpreter pid {:?} exited with {}", self.pid, status);
                    false
                }
                Err(e) => {
                    warn!("Failed to poll interpreter pid {:?}: {}", self.pid, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Write `text` to the interpreter as one line.
    ///
    /// An interpreter that stops reading lets its stdin pipe fill up. When
    /// the write cannot finish within the write timeout, stdin is released
    /// and the adapter is unusable from then on.
    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interpreter has exited",
            )));
        }

        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(SessionError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interpreter stdin already released",
            )));
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        };
        let written = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(written) => written,
            Err(_) => {
                warn!(
                    "Interpreter pid {:?} did not accept input within {:?}",
                    self.pid, self.write_timeout
                );
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "interpreter is not reading its input",
                ))
            }
        };

        if let Err(e) = written {
            stdin.take();
            return Err(SessionError::Write(e));
        }

        debug!("Wrote {} bytes to interpreter pid {:?}", line.len(), self.pid);
        Ok(())
    }

    /// Take the output stream. Returns `None` after the first call or once
    /// the adapter has been terminated.
    ///
    /// The stream ends when both pipes reach end-of-file, which happens when
    /// the process exits or is terminated.
    pub fn take_output(&self) -> Option<OutputChunks> {
        let (stdout, stderr) = self
            .output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        Some(stream::select(chunk_stream(stdout), chunk_stream(stderr)).boxed())
    }

    /// Stop the interpreter: SIGTERM to its process group, a bounded wait,
    /// then SIGKILL. Pipe handles are released on every path.
    ///
    /// Returns `Ok(None)` when the adapter was already terminated.
    pub async fn terminate(&self) -> Result<Option<ExitStatus>, SessionError> {
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut child) = child else {
            return Ok(None);
        };

        let outcome = self.stop_child(&mut child).await;

        self.stdin.lock().await.take();
        self.output.lock().unwrap_or_else(|e| e.into_inner()).take();

        match &outcome {
            Ok(Some(status)) => info!("Interpreter pid {:?} terminated: {}", self.pid, status),
            Ok(None) => {}
            Err(e) => warn!("{}", e),
        }
        outcome
    }

    async fn stop_child(&self, child: &mut Child) -> Result<Option<ExitStatus>, SessionError> {
        let terminate_error = |source: io::Error| SessionError::Terminate {
            pid: self.pid,
            source,
        };

        if let Ok(Some(status)) = child.try_wait() {
            // Leader is gone; anything it forked may still hold the pipes
            let _ = self.signal_group(GroupSignal::Kill);
            return Ok(Some(status));
        }

        if let Err(e) = self.signal_group(GroupSignal::Terminate) {
            debug!("SIGTERM to pid {:?} failed ({}), killing directly", self.pid, e);
            let _ = child.start_kill();
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status.map(Some).map_err(terminate_error),
            Err(_) => {
                warn!(
                    "Interpreter pid {:?} ignored SIGTERM for {:?}, killing",
                    self.pid, self.grace
                );
                if let Err(e) = self.signal_group(GroupSignal::Kill) {
                    debug!("SIGKILL to group of pid {:?} failed: {}", self.pid, e);
                }
                child.kill().await.map_err(terminate_error)?;
                child.wait().await.map(Some).map_err(terminate_error)
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) -> io::Result<()> {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pid = self
            .pid
            .ok_or_else(|| io::Error::other("interpreter pid unknown"))?;
        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        killpg(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: GroupSignal) -> io::Result<()> {
        Err(io::Error::other("process groups are not supported here"))
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Read `reader` until end-of-file, yielding decoded text as it arrives.
///
/// A multi-byte character split across two reads is held back until its
/// remaining bytes show up.
fn chunk_stream<R>(reader: R) -> impl Stream<Item = Result<String, SessionError>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some((reader, Vec::new())), |state| async move {
        let (mut reader, mut pending) = state?;
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    if pending.is_empty() {
                        return None;
                    }
                    let tail = String::from_utf8_lossy(&pending).into_owned();
                    return Some((Ok(tail), None));
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = decode_utf8(&mut pending);
                    if !text.is_empty() {
                        return Some((Ok(text), Some((reader, pending))));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Some((Err(SessionError::Read(e)), None)),
            }
        }
    })
}

/// Decode the longest valid prefix of `pending`, keeping an incomplete
/// trailing character for the next read.
fn decode_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
