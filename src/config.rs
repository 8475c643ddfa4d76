//! Session configuration.
//!
//! A [`SessionConfig`] is handed to [`RSession::launch`](crate::RSession::launch)
//! and fixed for the lifetime of the session: the data-channel policy and
//! byte order in particular are baked into the engine-side bootstrap and
//! never renegotiated.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default request timeout for data-channel transfers and probe round-trips.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default base port for the data-channel listener.
const DEFAULT_BASE_PORT: u16 = 38442;

/// Default width of the random port offset window.
const DEFAULT_PORT_WIDTH: u16 = 1000;

/// Default ceiling on a single decoded vector length (elements).
/// Anything above this is treated as a framing error, not allocated.
const DEFAULT_MAX_VECTOR_LEN: usize = 1 << 26;

/// Lifetime policy for the binary data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPolicy {
    /// Keep the socket open and reuse it across calls. Minimizes handshake
    /// overhead; the default.
    #[default]
    Persistent,
    /// Close the socket after every call. Slower, but safer when foreign
    /// code may touch the engine's connection state between calls.
    Transient,
}

/// Byte order used on the binary channel, fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    /// Network byte order; the default.
    #[default]
    Big,
    Little,
}

/// Configuration for launching an engine session.
///
/// Locating the engine executable is the caller's concern; the default
/// assumes an `R` on `PATH` with the flags that suppress the banner,
/// prompts, and workspace saving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the engine executable.
    pub executable: PathBuf,
    /// Arguments passed to the engine. Platform launch flags go here.
    pub args: Vec<String>,
    /// Forward echoed engine output to the sink. When false, ordinary
    /// output lines are silently discarded.
    pub echo: bool,
    /// Redirect the engine's message stream onto stdout so warnings are
    /// visible through the text channel.
    pub echo_stderr: bool,
    /// Whether the session is driven interactively (affects nothing in the
    /// core pipeline; recorded for callers that adjust echo per mode).
    pub interactive: bool,
    /// Install a ctrl-c handler for the duration of each `eval` read loop
    /// and translate it into an engine interrupt. Disable when the host
    /// application owns signal handling itself.
    pub trap_interrupt: bool,
    /// Base port for the data-channel listener.
    pub base_port: u16,
    /// Width of the random offset window added to `base_port`. A width of
    /// 1 pins the port and bind conflicts are retried in place.
    pub port_width: u16,
    /// Data-channel lifetime policy.
    pub channel_policy: ChannelPolicy,
    /// Byte order on the data channel.
    pub endian: Endian,
    /// Bound on data-channel transfers and probe round-trips.
    pub request_timeout: Duration,
    /// Optional bound on `eval`. Unset by default: long computations are
    /// legitimate and interruption is the intended escape hatch.
    pub eval_timeout: Option<Duration>,
    /// Ceiling on any single decoded vector length, in elements.
    pub max_vector_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("R"),
            args: vec!["--slave".to_string(), "--no-save".to_string()],
            echo: true,
            echo_stderr: false,
            interactive: true,
            trap_interrupt: true,
            base_port: DEFAULT_BASE_PORT,
            port_width: DEFAULT_PORT_WIDTH,
            channel_policy: ChannelPolicy::default(),
            endian: Endian::default(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            eval_timeout: None,
            max_vector_len: DEFAULT_MAX_VECTOR_LEN,
        }
    }
}

impl SessionConfig {
    /// Start from defaults with an explicit executable path.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_echo_stderr(mut self, echo_stderr: bool) -> Self {
        self.echo_stderr = echo_stderr;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_trap_interrupt(mut self, trap: bool) -> Self {
        self.trap_interrupt = trap;
        self
    }

    pub fn with_ports(mut self, base_port: u16, port_width: u16) -> Self {
        self.base_port = base_port;
        self.port_width = port_width.max(1);
        self
    }

    pub fn with_channel_policy(mut self, policy: ChannelPolicy) -> Self {
        self.channel_policy = policy;
        self
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout = Some(timeout);
        self
    }

    pub fn with_max_vector_len(mut self, max: usize) -> Self {
        self.max_vector_len = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.executable, PathBuf::from("R"));
        assert_eq!(config.args, vec!["--slave", "--no-save"]);
        assert_eq!(config.channel_policy, ChannelPolicy::Persistent);
        assert_eq!(config.endian, Endian::Big);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.eval_timeout.is_none());
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::new("/opt/R/bin/R")
            .with_args(["--vanilla"])
            .with_echo(false)
            .with_ports(40000, 1)
            .with_channel_policy(ChannelPolicy::Transient)
            .with_endian(Endian::Little);

        assert_eq!(config.executable, PathBuf::from("/opt/R/bin/R"));
        assert_eq!(config.args, vec!["--vanilla"]);
        assert!(!config.echo);
        assert_eq!(config.base_port, 40000);
        assert_eq!(config.port_width, 1);
        assert_eq!(config.channel_policy, ChannelPolicy::Transient);
        assert_eq!(config.endian, Endian::Little);
    }

    #[test]
    fn test_port_width_floor() {
        // Width 0 would make the offset range empty; it is clamped to 1.
        let config = SessionConfig::default().with_ports(40000, 0);
        assert_eq!(config.port_width, 1);
    }
}
