//! Engine subprocess lifecycle and the line-oriented text channel.
//!
//! `EngineProcess` owns the child and both ends of its text stream. It
//! makes no buffering assumptions beyond line-oriented text: one
//! `write_line` per submitted statement, one `read_line` per produced
//! line. Interrupts are delivered as SIGINT so the engine aborts the
//! current computation but keeps running; termination asks for a clean
//! exit first and force-kills only if the engine does not comply.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::SessionConfig;
use crate::error::{RBridgeError, Result};
use crate::glue;

/// Grace period between the clean-exit directive and a forced kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A running engine child plus its text streams.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pid: Option<i32>,
    terminated: bool,
}

impl EngineProcess {
    /// Spawn the engine with its stdin/stdout connected to the session's
    /// text-stream pair. Stderr is left attached to the host's so engine
    /// crashes stay visible; warning redirection is handled engine-side.
    ///
    /// # Errors
    ///
    /// [`RBridgeError::Launch`] with the OS error if the child cannot be
    /// spawned.
    pub fn launch(config: &SessionConfig) -> Result<Self> {
        let mut child = Command::new(&config.executable)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(RBridgeError::Launch)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            RBridgeError::Launch(std::io::Error::other("child stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RBridgeError::Launch(std::io::Error::other("child stdout not captured"))
        })?;
        let pid = child.id().map(|id| id as i32);

        tracing::info!(
            executable = %config.executable.display(),
            pid = pid.unwrap_or(-1),
            "engine launched"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            pid,
            terminated: false,
        })
    }

    /// Write one line of engine source text and flush it.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RBridgeError::EngineClosed("text stream closed".to_string()))?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next line from the engine, without the trailing newline.
    /// `Ok(None)` means the stream reached EOF.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Deliver a cancellation signal to the engine.
    ///
    /// A no-op if the child has already exited; the pipeline's read loop
    /// observes the EOF on its own.
    pub fn interrupt(&self) -> Result<()> {
        match self.pid {
            Some(pid) if !self.terminated => {
                tracing::debug!(pid, "delivering SIGINT to engine");
                kill(Pid::from_raw(pid), Signal::SIGINT)
                    .map_err(|e| RBridgeError::Io(std::io::Error::other(e)))
            }
            _ => {
                tracing::debug!("interrupt after engine exit; ignoring");
                Ok(())
            }
        }
    }

    /// True while the child is still running.
    pub fn is_alive(&mut self) -> bool {
        !self.terminated && matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the engine to exit cleanly, then close the text stream and
    /// reap the child, force-killing after a short grace period.
    ///
    /// Idempotent: the second and later calls are no-ops returning
    /// success.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        if let Some(mut stdin) = self.stdin.take() {
            // Best effort: the engine may already be gone.
            let directive = format!("{}\n", glue::EXIT_DIRECTIVE);
            let _ = stdin.write_all(directive.as_bytes()).await;
            let _ = stdin.flush().await;
            // Dropping stdin closes the pipe, which is EOF for engines
            // that ignore the directive.
        }

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "engine exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to reap engine");
            }
            Err(_) => {
                tracing::warn!("engine ignored exit directive; killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        Ok(())
    }
}

impl crate::eval::TextChannel for EngineProcess {
    fn write_line(
        &mut self,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        EngineProcess::write_line(self, text)
    }

    fn read_line(&mut self) -> impl std::future::Future<Output = Result<Option<String>>> + Send {
        EngineProcess::read_line(self)
    }
}

/// Cheap handle for delivering interrupts while the process's streams are
/// borrowed by the read loop.
#[derive(Debug, Clone, Copy)]
pub struct InterruptHandle {
    pid: Option<i32>,
}

impl InterruptHandle {
    pub fn send(&self) -> Result<()> {
        match self.pid {
            Some(pid) => {
                tracing::debug!(pid, "delivering SIGINT to engine");
                kill(Pid::from_raw(pid), Signal::SIGINT)
                    .map_err(|e| RBridgeError::Io(std::io::Error::other(e)))
            }
            None => Ok(()),
        }
    }
}

impl EngineProcess {
    /// Handle usable to interrupt the engine without borrowing the
    /// process manager itself.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            pid: if self.terminated { None } else { self.pid },
        }
    }
}
