//! The bridge facade: one engine session, one caller.
//!
//! `RSession` owns the engine subprocess, the text stream, the data
//! channel, and the eval pipeline, and is the only component that touches
//! them — everything else goes through it so the channel framing
//! invariants hold. Methods take `&mut self`; the borrow checker enforces
//! the one-logical-caller rule instead of an internal mutex.
//!
//! The protocol is strictly request/response: every operation runs to
//! completion (or error) before the next one starts. Only `eval` is
//! cancellable; interrupting a data transfer would leave the channel in
//! an indeterminate framing state, so `assign`/`pull`/probes never
//! install the interrupt handler.

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::channel::BinaryChannel;
use crate::config::SessionConfig;
use crate::error::{RBridgeError, Result};
use crate::eval::{never_cancel, CancelSignal, EvalOutcome, EvalPipeline, OutputSink};
use crate::glue;
use crate::probe::{self, ProbeOutcome};
use crate::process::EngineProcess;
use crate::wire::{codec, RValue};

/// One engine subprocess plus its two channels.
///
/// Construction is explicit — [`launch`](RSession::launch) is a plain
/// function of the configuration, and lifetime is caller-managed. There
/// is no implicit default session.
///
/// # Example
///
/// ```ignore
/// use rbridge::{RSession, SessionConfig};
///
/// let mut r = RSession::launch(SessionConfig::default()).await?;
/// r.eval("x <- rnorm(100)").await?;
/// let mean = r.pull("mean(x)").await?.as_f64();
/// r.shutdown().await?;
/// ```
#[derive(Debug)]
pub struct RSession {
    config: SessionConfig,
    process: EngineProcess,
    channel: BinaryChannel,
    pipeline: EvalPipeline,
    open: bool,
}

impl RSession {
    /// Spawn the engine and send the protocol bootstrap.
    ///
    /// The data channel is not opened here; the first operation that
    /// needs it performs the rendezvous lazily.
    pub async fn launch(config: SessionConfig) -> Result<Self> {
        let mut process = EngineProcess::launch(&config)?;
        let mut pipeline = EvalPipeline::new();
        let channel = BinaryChannel::new(&config);

        // The bootstrap is ordinary engine source; drain it like any
        // other submission so a broken engine surfaces here, not later.
        let bootstrap = glue::bootstrap(config.endian, config.echo_stderr);
        let drained = timeout(
            config.request_timeout,
            pipeline.submit(&mut process, &bootstrap, false, never_cancel(), || Ok(())),
        )
        .await;
        match drained {
            Ok(Ok(EvalOutcome::Completed)) => {}
            Ok(Ok(EvalOutcome::Interrupted)) => {
                unreachable!("bootstrap submission is not cancellable")
            }
            Ok(Err(e)) => {
                let _ = process.terminate().await;
                return Err(e);
            }
            Err(_) => {
                let _ = process.terminate().await;
                return Err(RBridgeError::Timeout(config.request_timeout));
            }
        }
        tracing::info!("session bootstrapped");

        Ok(Self {
            config,
            process,
            channel,
            pipeline,
            open: true,
        })
    }

    /// Install the destination for echoed engine output. Without one,
    /// echo goes to the log under the `engine` target.
    pub fn set_output_sink(&mut self, sink: OutputSink) {
        self.pipeline.set_sink(sink);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True while the session is open and the engine process is running.
    pub fn is_alive(&mut self) -> bool {
        self.open && self.process.is_alive()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(RBridgeError::EngineClosed(
                "session has been shut down".to_string(),
            ))
        }
    }

    /// Rendezvous with the engine on the data channel if not yet done.
    async fn ensure_channel(&mut self) -> Result<()> {
        if self.channel.is_connected() {
            return Ok(());
        }
        let Self {
            channel,
            process,
            pipeline,
            ..
        } = self;
        channel
            .connect(|port| async move {
                let snippet = glue::dial_statement("127.0.0.1", port);
                pipeline
                    .submit(process, &snippet, false, never_cancel(), || Ok(()))
                    .await?;
                Ok(())
            })
            .await
    }

    /// Evaluate engine code, echoing output per the session policy.
    ///
    /// The code is probed for completeness first; incomplete or
    /// unrecoverable fragments fail with [`RBridgeError::Parse`] and
    /// nothing is submitted. Ctrl-c during the run interrupts the engine
    /// and yields [`EvalOutcome::Interrupted`].
    pub async fn eval(&mut self, code: &str) -> Result<EvalOutcome> {
        let echo = self.config.echo;
        self.eval_with_echo(code, echo).await
    }

    /// Evaluate without echoing, regardless of the session policy.
    pub async fn eval_silent(&mut self, code: &str) -> Result<EvalOutcome> {
        self.eval_with_echo(code, false).await
    }

    async fn eval_with_echo(&mut self, code: &str, echo: bool) -> Result<EvalOutcome> {
        self.ensure_open()?;
        self.ensure_channel().await?;

        let verdict = self.probe_complete(code).await?;
        if !verdict.is_complete() {
            return Err(verdict.into_parse_error());
        }

        let cancel: CancelSignal = if self.config.trap_interrupt {
            Box::pin(async {
                let _ = tokio::signal::ctrl_c().await;
            })
        } else {
            never_cancel()
        };
        let handle = self.process.interrupt_handle();

        let Self {
            process,
            pipeline,
            config,
            ..
        } = self;
        let submit = pipeline.submit(process, code, echo, cancel, move || handle.send());
        match config.eval_timeout {
            Some(deadline) => timeout(deadline, submit)
                .await
                .map_err(|_| RBridgeError::Timeout(deadline))?,
            None => submit.await,
        }
    }

    /// Ask the engine whether `code` is syntactically complete.
    pub async fn is_complete(&mut self, code: &str) -> Result<ProbeOutcome> {
        self.ensure_open()?;
        self.ensure_channel().await?;
        self.probe_complete(code).await
    }

    async fn probe_complete(&mut self, code: &str) -> Result<ProbeOutcome> {
        let Self {
            process,
            pipeline,
            channel,
            config,
            ..
        } = self;
        probe::is_complete(
            process,
            pipeline,
            channel,
            config.endian,
            config.max_vector_len,
            code,
        )
        .await
    }

    /// Ask the engine whether `name` is a valid assignment target.
    ///
    /// # Errors
    ///
    /// [`RBridgeError::Parse`] if `<name> <- 1` does not parse; engine
    /// evaluation failures report as `Ok(false)`.
    pub async fn is_assignable(&mut self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_channel().await?;
        let Self {
            process,
            pipeline,
            channel,
            config,
            ..
        } = self;
        probe::is_assignable(
            process,
            pipeline,
            channel,
            config.endian,
            config.max_vector_len,
            name,
        )
        .await
    }

    /// Bind `value` to `name` in the engine's global environment.
    ///
    /// The value is shipped over the data channel with the encoding
    /// policy applied (integral doubles travel as integers, NA-sentinel
    /// integers promote to doubles, matrices flatten row-major).
    pub async fn assign(&mut self, name: &str, value: impl Into<RValue>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_channel().await?;

        if !self.is_assignable(name).await? {
            return Err(RBridgeError::Parse {
                line: 0,
                column: 0,
                message: format!("`{name}` is not assignable"),
            });
        }

        let value = value.into();
        let Self {
            process,
            pipeline,
            channel,
            config,
            ..
        } = self;
        let deadline = channel.request_timeout();
        let mut call = channel.session()?;

        let statement = glue::assign_statement(name);
        let transfer = timeout(deadline, async {
            let encoded = codec::encode_value(&value, config.endian);
            let sock = call.socket();
            // The engine blocks in its read helper while the host pushes
            // the value; racing the two sides keeps transfers larger than
            // the socket buffer from deadlocking.
            let write = async {
                sock.write_all(&encoded).await?;
                sock.flush().await?;
                Ok::<_, RBridgeError>(())
            };
            let submit = pipeline.submit(process, &statement, false, never_cancel(), || Ok(()));
            tokio::try_join!(write, submit)?;
            Ok::<_, RBridgeError>(())
        })
        .await;

        match transfer {
            Ok(Ok(())) => {
                call.finish();
                tracing::debug!(name, "assigned");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RBridgeError::Timeout(deadline)),
        }
    }

    /// Evaluate `expr` engine-side and pull its value, unwrapping
    /// single-element non-character vectors to scalars.
    ///
    /// A name the engine cannot resolve yields [`RValue::Missing`]; a
    /// value with no wire encoding fails with
    /// [`RBridgeError::UnsupportedType`] naming the engine-side type.
    pub async fn pull(&mut self, expr: &str) -> Result<RValue> {
        self.pull_inner(expr, true).await
    }

    /// Like [`pull`](RSession::pull) but never unwraps singletons.
    pub async fn pull_vector(&mut self, expr: &str) -> Result<RValue> {
        self.pull_inner(expr, false).await
    }

    async fn pull_inner(&mut self, expr: &str, unwrap: bool) -> Result<RValue> {
        self.ensure_open()?;
        self.ensure_channel().await?;

        let verdict = self.probe_complete(expr).await?;
        if !verdict.is_complete() {
            return Err(verdict.into_parse_error());
        }

        let Self {
            process,
            pipeline,
            channel,
            config,
            ..
        } = self;
        let deadline = channel.request_timeout();
        let mut call = channel.session()?;

        let statement = glue::pull_statement(expr);
        let transfer = timeout(deadline, async {
            let sock = call.socket();
            let submit = pipeline.submit(process, &statement, false, never_cancel(), || Ok(()));
            // Decode concurrently: the engine's write helper blocks once
            // the value outgrows the socket buffer, and the sentinel only
            // appears after that write returns.
            let decode = codec::decode_value(sock, config.endian, config.max_vector_len);
            let (_, decoded) = tokio::try_join!(submit, decode)?;
            Ok::<_, RBridgeError>(decoded)
        })
        .await;

        let decoded = match transfer {
            Ok(Ok(decoded)) => {
                call.finish();
                decoded
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RBridgeError::Timeout(deadline)),
        };

        match decoded {
            codec::Decoded::Value(value) => {
                Ok(if unwrap { value.unwrap_singleton() } else { value })
            }
            codec::Decoded::NotFound => Ok(RValue::Missing),
            codec::Decoded::Unknown(diagnostic) => {
                Err(RBridgeError::UnsupportedType(diagnostic))
            }
        }
    }

    /// Explicit attribute-style accessors; thin aliases over
    /// [`pull`](RSession::pull) and [`assign`](RSession::assign).
    pub async fn get(&mut self, name: &str) -> Result<RValue> {
        self.pull(name).await
    }

    pub async fn set(&mut self, name: &str, value: impl Into<RValue>) -> Result<()> {
        self.assign(name, value).await
    }

    /// Deliver a cancellation signal to the engine.
    pub fn interrupt(&self) -> Result<()> {
        self.ensure_open()?;
        self.process.interrupt()
    }

    /// Close the session: ask the engine to exit, tear down both
    /// channels, reap the child. Idempotent — the second call is a no-op
    /// returning success. Every later operation fails with
    /// [`RBridgeError::EngineClosed`].
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.channel.close();
        self.process.terminate().await?;
        tracing::info!("session shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `cat` stands in for the engine: it echoes input verbatim, which is
    /// enough to exercise the lifecycle guards (it never produces a
    /// sentinel, so full submissions are integration-test material).
    fn cat_config() -> SessionConfig {
        SessionConfig::new("/bin/cat")
            .with_args(Vec::<String>::new())
            .with_request_timeout(std::time::Duration::from_secs(5))
    }

    /// Launch against `cat` without draining a bootstrap sentinel.
    fn cat_session() -> RSession {
        let config = cat_config();
        let process = EngineProcess::launch(&config).expect("spawn cat");
        let channel = BinaryChannel::new(&config);
        RSession {
            config,
            process,
            channel,
            pipeline: EvalPipeline::new(),
            open: true,
        }
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces_os_error() {
        let config = SessionConfig::new("/nonexistent/engine-binary");
        let err = RSession::launch(config).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Launch(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_is_surfaced() {
        // cat never prints the sentinel line, so launch must give up at
        // the request timeout rather than hang.
        let config = cat_config().with_request_timeout(std::time::Duration::from_millis(200));
        let err = RSession::launch(config).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut session = cat_session();
        session.shutdown().await.expect("first shutdown");
        session.shutdown().await.expect("second shutdown");
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail_closed() {
        let mut session = cat_session();
        session.shutdown().await.expect("shutdown");

        let err = session.eval("x <- 1").await.unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");

        let err = session.assign("x", 1.0).await.unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");

        let err = session.pull("x").await.unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");

        let err = session.is_complete("x").await.unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");

        let err = session.interrupt().unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");

        assert!(!session.is_alive());
    }
}
