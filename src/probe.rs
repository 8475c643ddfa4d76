//! The grammar-completeness oracle.
//!
//! Rather than reimplementing the engine's grammar, the oracle asks the
//! engine itself: the candidate code travels to the engine as a character
//! value on the data channel, an injected helper call parses it, and the
//! verdict comes back over the same channel as an integer triple
//! `[status, line, column]` followed by the parser message. Status 1 is
//! complete, 0 is a failure exactly at end-of-input (needs more input),
//! -1 is unrecoverable. The distinction between 0 and -1 is what lets a
//! REPL accumulate continuation lines instead of rejecting them.
//!
//! Results are derived fresh per call and never cached: any engine
//! mutation can change what parses.

use tokio::io::AsyncWriteExt;

use crate::channel::BinaryChannel;
use crate::config::Endian;
use crate::error::{RBridgeError, Result};
use crate::eval::{never_cancel, EvalPipeline, TextChannel};
use crate::glue;
use crate::wire::{codec, RValue};

/// Verdict on a fragment of engine code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Parses as-is.
    Complete,
    /// The parser failed exactly at the end of input; more lines may
    /// complete the fragment.
    Incomplete,
    /// The fragment can never parse, no matter what is appended.
    Unrecoverable {
        line: u32,
        column: u32,
        message: String,
    },
}

impl ProbeOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, ProbeOutcome::Complete)
    }

    /// Convert a non-complete verdict into the error surfaced by `eval`
    /// and `assign`.
    pub(crate) fn into_parse_error(self) -> RBridgeError {
        match self {
            ProbeOutcome::Complete => unreachable!("complete code is not a parse error"),
            ProbeOutcome::Incomplete => RBridgeError::Parse {
                line: 0,
                column: 0,
                message: "incomplete expression (unexpected end of input)".to_string(),
            },
            ProbeOutcome::Unrecoverable {
                line,
                column,
                message,
            } => RBridgeError::Parse {
                line,
                column,
                message,
            },
        }
    }
}

/// Interpret the engine's probe answer.
fn interpret(status: codec::Decoded, message: codec::Decoded) -> Result<ProbeOutcome> {
    let (code, line, column) = match &status {
        codec::Decoded::Value(RValue::Integer(v)) if v.len() == 3 => (
            v[0].unwrap_or(-1),
            v[1].unwrap_or(0).max(0) as u32,
            v[2].unwrap_or(0).max(0) as u32,
        ),
        other => {
            return Err(RBridgeError::Protocol(format!(
                "probe status decoded to {other:?}, expected an integer triple"
            )))
        }
    };
    let text = match message {
        codec::Decoded::Value(RValue::Character(v)) => v
            .into_iter()
            .next()
            .flatten()
            .unwrap_or_default(),
        other => {
            return Err(RBridgeError::Protocol(format!(
                "probe message decoded to {other:?}, expected a character value"
            )))
        }
    };

    match code {
        1 => Ok(ProbeOutcome::Complete),
        0 => Ok(ProbeOutcome::Incomplete),
        -1 => Ok(ProbeOutcome::Unrecoverable {
            line,
            column,
            message: text,
        }),
        other => Err(RBridgeError::Protocol(format!(
            "probe returned unknown status {other}"
        ))),
    }
}

/// One oracle round-trip: ship `payload` to the engine slot, run the glue
/// `statement`, read `answers` values back.
async fn exchange<S>(
    stream: &mut S,
    pipeline: &mut EvalPipeline,
    channel: &mut BinaryChannel,
    endian: Endian,
    max_len: usize,
    statement: String,
    payload: String,
    answers: usize,
) -> Result<Vec<codec::Decoded>>
where
    S: TextChannel + Send,
{
    let deadline = channel.request_timeout();
    let mut call = channel.session()?;

    let result = tokio::time::timeout(deadline, async {
        let encoded = codec::encode_value(&RValue::Character(vec![Some(payload)]), endian);
        let sock = call.socket();

        // The glue call and the payload write race on purpose: the engine
        // reads the channel only once the helper call arrives on the text
        // stream, and a payload larger than the socket buffer would
        // deadlock a strictly sequential write.
        let write = async {
            sock.write_all(&encoded).await?;
            sock.flush().await?;
            Ok::<_, RBridgeError>(())
        };
        let submit = pipeline.submit(stream, &statement, false, never_cancel(), || Ok(()));
        let (_, outcome) = tokio::try_join!(write, submit)?;
        debug_assert_eq!(outcome, crate::eval::EvalOutcome::Completed);

        let sock = call.socket();
        let mut decoded = Vec::with_capacity(answers);
        for _ in 0..answers {
            decoded.push(codec::decode_value(sock, endian, max_len).await?);
        }
        Ok::<_, RBridgeError>(decoded)
    })
    .await;

    match result {
        Ok(Ok(decoded)) => {
            call.finish();
            Ok(decoded)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RBridgeError::Timeout(deadline)),
    }
}

/// Ask the engine whether `code` is syntactically complete.
pub(crate) async fn is_complete<S>(
    stream: &mut S,
    pipeline: &mut EvalPipeline,
    channel: &mut BinaryChannel,
    endian: Endian,
    max_len: usize,
    code: &str,
) -> Result<ProbeOutcome>
where
    S: TextChannel + Send,
{
    let mut answers = exchange(
        stream,
        pipeline,
        channel,
        endian,
        max_len,
        glue::probe_statement(),
        code.to_string(),
        2,
    )
    .await?;
    let message = answers.pop().expect("exchange returned two answers");
    let status = answers.pop().expect("exchange returned two answers");
    let outcome = interpret(status, message)?;
    tracing::debug!(?outcome, "probe verdict");
    Ok(outcome)
}

/// Ask the engine whether `name` is a valid assignment target.
///
/// Parse failures of `<name> <- 1` surface as [`RBridgeError::Parse`];
/// engine-side evaluation failures (inside the guarded throwaway
/// environment) are reported as `false`, never propagated as a crash.
pub(crate) async fn is_assignable<S>(
    stream: &mut S,
    pipeline: &mut EvalPipeline,
    channel: &mut BinaryChannel,
    endian: Endian,
    max_len: usize,
    name: &str,
) -> Result<bool>
where
    S: TextChannel + Send,
{
    let assignment = format!("{name} <- 1");

    let verdict = is_complete(stream, pipeline, channel, endian, max_len, &assignment).await?;
    if !verdict.is_complete() {
        return Err(verdict.into_parse_error());
    }

    let mut answers = exchange(
        stream,
        pipeline,
        channel,
        endian,
        max_len,
        glue::assignable_statement(),
        assignment,
        1,
    )
    .await?;
    match answers.pop() {
        Some(codec::Decoded::Value(RValue::Logical(v))) => {
            Ok(v.first().copied().flatten().unwrap_or(false))
        }
        other => Err(RBridgeError::Protocol(format!(
            "assignability verdict decoded to {other:?}, expected a logical value"
        ))),
    }
}
