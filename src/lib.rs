//! rbridge — drive a long-lived R interpreter from Rust.
//!
//! The bridge spawns the engine as a subprocess and talks to it over two
//! channels: the line-oriented text stream for code submission and
//! echoed output, and a private TCP socket for structured, typed data.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   stdin/stdout (text)   ┌─────────────────┐
//! │  Rust host   │ ◄──────────────────────►│  R interpreter  │
//! │  (RSession)  │   TCP socket (binary)   │   (subprocess)  │
//! └──────────────┘ ◄──────────────────────►└─────────────────┘
//! ```
//!
//! Code goes out on the text channel followed by a generated sentinel
//! statement; the pipeline drains echoed output until the sentinel line
//! with the matching run counter appears. Typed values (vectors,
//! matrices, with full missing-value semantics) travel on the socket as
//! self-describing `[tag][length][payload]` units.
//!
//! # Usage
//!
//! ```ignore
//! use rbridge::{RSession, SessionConfig};
//!
//! let mut r = RSession::launch(SessionConfig::default()).await?;
//! r.assign("x", vec![1.0, 2.0, 3.0]).await?;
//! r.eval("y <- cumsum(x)").await?;
//! let y = r.pull_vector("y").await?;
//! r.shutdown().await?;
//! ```
//!
//! One session serves one logical caller: methods take `&mut self` and
//! the wire protocol is strictly request/response. Launching the engine
//! executable is the caller's concern — pass its path and platform flags
//! through [`SessionConfig`].

pub mod channel;
pub mod config;
pub mod error;
pub mod eval;
pub mod glue;
pub mod probe;
pub mod process;
pub mod session;
pub mod wire;

pub use config::{ChannelPolicy, Endian, SessionConfig};
pub use error::{RBridgeError, Result};
pub use eval::{EvalOutcome, OutputLine, OutputSink};
pub use probe::ProbeOutcome;
pub use session::RSession;
pub use wire::{RMatrix, RValue};
