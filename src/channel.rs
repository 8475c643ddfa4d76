//! The private data channel between host and engine.
//!
//! The host side listens; the engine dials back in response to a snippet
//! injected on the text channel. Binding picks `base_port` plus a bounded
//! random offset and retries on conflicts. The accept runs on a background
//! task so it can race the engine's dial; the rendezvous is complete only
//! once both sides have met and the engine has written its protocol
//! version word.
//!
//! Two lifetime policies: `Persistent` keeps the socket across calls
//! (default), `Transient` closes it after every call. Calls are scoped by
//! [`ChannelSession`], a guard that closes and drops the socket unless
//! the call reports success — after a failure mid-transfer the framing
//! state is indeterminate and the only safe move is a fresh rendezvous on
//! next use.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::{ChannelPolicy, Endian, SessionConfig};
use crate::error::{RBridgeError, Result};
use crate::glue;

/// Bound on consecutive bind attempts before giving up.
const MAX_BIND_ATTEMPTS: u32 = 100;

/// Host side of the data channel.
#[derive(Debug)]
pub struct BinaryChannel {
    policy: ChannelPolicy,
    endian: Endian,
    base_port: u16,
    port_width: u16,
    request_timeout: Duration,
    socket: Option<TcpStream>,
}

impl BinaryChannel {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            policy: config.channel_policy,
            endian: config.endian,
            base_port: config.base_port,
            port_width: config.port_width.max(1),
            request_timeout: config.request_timeout,
            socket: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Drop the socket. The next call must rendezvous again.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            tracing::debug!("data channel closed");
        }
    }

    /// Bind a listener inside the configured port window.
    ///
    /// With a window of 1 the port is pinned and conflicts are retried in
    /// place; otherwise each attempt resamples the offset.
    async fn bind(&self) -> Result<TcpListener> {
        let mut last_err: Option<std::io::Error> = None;
        for _ in 0..MAX_BIND_ATTEMPTS {
            let offset = if self.port_width <= 1 {
                0
            } else {
                rand::rng().random_range(0..self.port_width)
            };
            let port = self.base_port.saturating_add(offset);
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(RBridgeError::ChannelBind {
                        base_port: self.base_port,
                        source: e,
                    })
                }
            }
        }
        Err(RBridgeError::ChannelBind {
            base_port: self.base_port,
            source: last_err.unwrap_or_else(|| std::io::Error::other("no bind attempt was made")),
        })
    }

    /// Perform the rendezvous: bind, start the background accept, let the
    /// caller submit the dial-back snippet through `dial`, then join the
    /// accept and verify the engine's protocol version word.
    ///
    /// `dial` receives the bound port and must not return until the
    /// engine has executed the snippet (in practice: until the submitting
    /// pipeline has drained its completion sentinel).
    pub async fn connect<F, Fut>(&mut self, dial: F) -> Result<()>
    where
        F: FnOnce(u16) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let listener = self.bind().await?;
        let port = listener.local_addr().map_err(RBridgeError::Io)?.port();
        tracing::debug!(port, "data channel listening");

        let accept = tokio::spawn(async move { listener.accept().await });

        if let Err(e) = dial(port).await {
            accept.abort();
            return Err(e);
        }

        let (mut stream, peer) = timeout(self.request_timeout, accept)
            .await
            .map_err(|_| RBridgeError::Timeout(self.request_timeout))?
            .map_err(|e| RBridgeError::Io(std::io::Error::other(e)))??;
        stream.set_nodelay(true).map_err(RBridgeError::Io)?;

        let mut version_word = [0u8; 4];
        timeout(self.request_timeout, stream.read_exact(&mut version_word))
            .await
            .map_err(|_| RBridgeError::Timeout(self.request_timeout))??;
        let version = match self.endian {
            Endian::Big => i32::from_be_bytes(version_word),
            Endian::Little => i32::from_le_bytes(version_word),
        };
        if version != glue::PROTOCOL_VERSION {
            return Err(RBridgeError::Protocol(format!(
                "engine speaks protocol version {version}, host expects {}",
                glue::PROTOCOL_VERSION
            )));
        }

        tracing::debug!(%peer, "data channel established");
        self.socket = Some(stream);
        Ok(())
    }

    /// Begin one call against the connected socket.
    ///
    /// # Errors
    ///
    /// [`RBridgeError::Protocol`] if the rendezvous has not happened yet.
    pub fn session(&mut self) -> Result<ChannelSession<'_>> {
        if self.socket.is_none() {
            return Err(RBridgeError::Protocol(
                "data channel used before rendezvous".to_string(),
            ));
        }
        Ok(ChannelSession {
            channel: self,
            completed: false,
        })
    }

    /// The bound for one data-channel call.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Guard scoping one call on the data channel.
///
/// Dropping the guard without [`finish`](ChannelSession::finish) counts
/// as failure: the socket is closed and dereferenced so the channel never
/// stays in an indeterminate framing state. `finish` applies the
/// session's lifetime policy instead.
pub struct ChannelSession<'c> {
    channel: &'c mut BinaryChannel,
    completed: bool,
}

impl ChannelSession<'_> {
    pub fn socket(&mut self) -> &mut TcpStream {
        self.channel
            .socket
            .as_mut()
            .expect("guard exists only while a socket is present")
    }

    /// Mark the call successful and apply the lifetime policy.
    pub fn finish(mut self) {
        self.completed = true;
        if self.channel.policy == ChannelPolicy::Transient {
            self.channel.close();
        }
    }
}

impl Drop for ChannelSession<'_> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!("data-channel call failed; dropping socket");
            self.channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn test_config(base_port: u16, policy: ChannelPolicy) -> SessionConfig {
        SessionConfig::default()
            .with_ports(base_port, 50)
            .with_channel_policy(policy)
            .with_request_timeout(Duration::from_secs(5))
    }

    /// Stand-in for the engine: dial the port, write the version word,
    /// then echo whatever arrives.
    async fn fake_engine_dial(port: u16, version: i32) -> Result<()> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(RBridgeError::Io)?;
        stream
            .write_all(&version.to_be_bytes())
            .await
            .map_err(RBridgeError::Io)?;
        tokio::spawn(async move {
            let mut sink = [0u8; 64];
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
                let _ = stream.write_all(&sink[..n]).await;
            }
        });
        Ok(())
    }

    async fn connected_channel(base_port: u16, policy: ChannelPolicy) -> BinaryChannel {
        let mut channel = BinaryChannel::new(&test_config(base_port, policy));
        channel
            .connect(|port| fake_engine_dial(port, glue::PROTOCOL_VERSION))
            .await
            .expect("rendezvous failed");
        channel
    }

    #[tokio::test]
    async fn test_rendezvous_and_echo() {
        let mut channel = connected_channel(47310, ChannelPolicy::Persistent).await;
        assert!(channel.is_connected());

        let mut call = channel.session().expect("session");
        let sock = call.socket();
        sock.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).await.expect("read");
        call.finish();

        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_persistent_policy_reuses_socket() {
        let mut channel = connected_channel(47370, ChannelPolicy::Persistent).await;
        for _ in 0..3 {
            let mut call = channel.session().expect("session");
            let sock = call.socket();
            sock.write_all(b"x").await.expect("write");
            let mut buf = [0u8; 1];
            sock.read_exact(&mut buf).await.expect("read");
            call.finish();
            assert!(channel.is_connected(), "persistent socket should survive");
        }
    }

    #[tokio::test]
    async fn test_transient_policy_closes_after_call() {
        let mut channel = connected_channel(47430, ChannelPolicy::Transient).await;
        let call = channel.session().expect("session");
        call.finish();
        assert!(!channel.is_connected(), "transient socket should close");
    }

    #[tokio::test]
    async fn test_unfinished_call_poisons_socket() {
        let mut channel = connected_channel(47490, ChannelPolicy::Persistent).await;
        {
            let _call = channel.session().expect("session");
            // Dropped without finish, as an errored transfer would be.
        }
        assert!(
            !channel.is_connected(),
            "errored call must drop the socket even when persistent"
        );
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let mut channel = BinaryChannel::new(&test_config(47550, ChannelPolicy::Persistent));
        let err = channel
            .connect(|port| fake_engine_dial(port, 99))
            .await
            .unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_failed_dial_aborts_accept() {
        let mut channel = BinaryChannel::new(&test_config(47610, ChannelPolicy::Persistent));
        let err = channel
            .connect(|_port| async { Err(RBridgeError::EngineClosed("engine died".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_pinned_port_conflict_reports_bind_error() {
        // Occupy the pinned port so every tight retry collides.
        let holder = TcpListener::bind(("127.0.0.1", 47670)).await.expect("bind");
        let config = SessionConfig::default()
            .with_ports(47670, 1)
            .with_request_timeout(Duration::from_secs(1));
        let mut channel = BinaryChannel::new(&config);
        let err = channel
            .connect(|port| fake_engine_dial(port, glue::PROTOCOL_VERSION))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RBridgeError::ChannelBind { base_port: 47670, .. }),
            "got {err:?}"
        );
        drop(holder);
    }

    #[tokio::test]
    async fn test_call_before_rendezvous_rejected() {
        let mut channel = BinaryChannel::new(&test_config(47730, ChannelPolicy::Persistent));
        let err = channel.session().map(|_| ()).unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
    }
}
