//! The eval pipeline: code submission and sentinel-synchronized draining
//! of the text stream.
//!
//! Every submission appends a generated statement that prints a sentinel
//! line carrying the current run counter, then reads lines until that
//! exact sentinel appears. Everything else on the stream is classified:
//! stale sentinels from abandoned calls are discarded (the run counter is
//! authoritative), the engine-exit marker and EOF surface as
//! `EngineClosed`, stderr-marker lines are routed to the warning side of
//! the sink, and ordinary lines are echo output.
//!
//! Cancellation is scoped: the caller hands `submit` a cancel future
//! (typically ctrl-c) that lives only inside the read loop. Dropping out
//! of the loop uninstalls it on every exit path, so no handler outlives
//! the call. A cancellation arriving after the matching sentinel has been
//! consumed is a no-op for that call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RBridgeError, Result};
use crate::glue;

/// Line-oriented text stream to the engine.
///
/// Abstracted as a trait so the pipeline can be exercised against a
/// scripted stand-in engine in tests.
pub trait TextChannel {
    fn write_line(&mut self, text: &str) -> impl Future<Output = Result<()>> + Send;
    fn read_line(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// How one submission ended. Interruption is a result, not an error, so
/// callers can keep their session and decide whether to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    Completed,
    Interrupted,
}

/// One cleaned line of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    /// A line the engine diverted from its message stream.
    Stderr(String),
}

/// Caller-supplied destination for echoed output.
pub type OutputSink = Box<dyn FnMut(OutputLine) + Send>;

/// Cancellation future handed to [`EvalPipeline::submit`].
pub type CancelSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A cancel signal that never fires, for uncancellable submissions.
pub fn never_cancel() -> CancelSignal {
    Box::pin(std::future::pending())
}

/// Submission state machine over a [`TextChannel`].
pub struct EvalPipeline {
    run_counter: AtomicU64,
    sink: Option<OutputSink>,
}

impl std::fmt::Debug for EvalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalPipeline")
            .field("run_counter", &self.run_counter)
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

impl EvalPipeline {
    pub fn new() -> Self {
        Self {
            run_counter: AtomicU64::new(0),
            sink: None,
        }
    }

    /// Install the destination for echoed output. Without one, echo goes
    /// to the log under the `engine` target.
    pub fn set_sink(&mut self, sink: OutputSink) {
        self.sink = Some(sink);
    }

    /// Submit engine source text followed by the sentinel statement, then
    /// drain the stream until the matching sentinel.
    ///
    /// `echo` controls forwarding of ordinary output lines for this call
    /// only. `cancel` is polled inside the read loop; when it fires,
    /// `interrupt` is invoked and the call returns
    /// [`EvalOutcome::Interrupted`] without waiting for the sentinel (the
    /// next call discards the stale one by counter).
    pub async fn submit<S, F>(
        &mut self,
        stream: &mut S,
        code: &str,
        echo: bool,
        mut cancel: CancelSignal,
        interrupt: F,
    ) -> Result<EvalOutcome>
    where
        S: TextChannel,
        F: Fn() -> Result<()>,
    {
        let run = self.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let sentinel = glue::sentinel_line(run);
        let stale_prefix = glue::sentinel_prefix();
        let exit_marker = glue::exit_line();

        stream.write_line(code).await?;
        stream.write_line(&glue::sentinel_statement(run)).await?;
        tracing::debug!(run, "submitted; draining to sentinel");

        loop {
            let line = tokio::select! {
                biased;
                _ = &mut cancel => {
                    tracing::debug!(run, "cancellation requested; interrupting engine");
                    interrupt()?;
                    return Ok(EvalOutcome::Interrupted);
                }
                line = stream.read_line() => line?,
            };

            let Some(raw) = line else {
                return Err(RBridgeError::EngineClosed(
                    "text stream reached EOF mid-eval".to_string(),
                ));
            };

            let line = strip_leading_escapes(&raw);

            if line == sentinel {
                tracing::debug!(run, "sentinel observed");
                return Ok(EvalOutcome::Completed);
            }
            if line.starts_with(&stale_prefix) {
                tracing::debug!(run, stale = %line, "discarding stale sentinel");
                continue;
            }
            if line == exit_marker {
                return Err(RBridgeError::EngineClosed(
                    "engine announced exit".to_string(),
                ));
            }
            if let Some(message) = line
                .strip_prefix(glue::STDERR_FLAG)
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            {
                self.deliver(OutputLine::Stderr(message.to_string()));
                continue;
            }
            if echo {
                self.deliver(OutputLine::Stdout(line.to_string()));
            }
        }
    }

    fn deliver(&mut self, line: OutputLine) {
        match (&mut self.sink, line) {
            (Some(sink), line) => sink(line),
            (None, OutputLine::Stdout(text)) => tracing::info!(target: "engine", "{text}"),
            (None, OutputLine::Stderr(text)) => tracing::warn!(target: "engine", "{text}"),
        }
    }
}

impl Default for EvalPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip leading terminal control sequences from a line.
///
/// Interactive engines prefix some lines with cursor/SGR escapes; the
/// payload after the control bytes is the real output.
fn strip_leading_escapes(line: &str) -> &str {
    let mut rest = line;
    while let Some(after_esc) = rest.strip_prefix('\u{1b}') {
        if let Some(csi) = after_esc.strip_prefix('[') {
            // CSI: parameter bytes then one terminating alphabetic byte.
            let end = csi
                .find(|c: char| c.is_ascii_alphabetic())
                .map(|i| i + 1)
                .unwrap_or(csi.len());
            rest = &csi[end..];
        } else {
            // Bare escape plus one following character.
            let mut chars = after_esc.chars();
            chars.next();
            rest = chars.as_str();
        }
    }
    rest
}
