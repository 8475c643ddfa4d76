//! Typed values and their wire codec.
//!
//! The data channel carries a sequence of back-to-back self-describing
//! values — `[tag][length][payload]` with no outer framing — so a decoder
//! never needs schema knowledge beyond this module. See [`codec`] for the
//! exact layouts and [`value`] for the host-side representation and the
//! sender-side encoding policy.

pub mod codec;
pub mod value;

pub use codec::{decode_value, encode_value, Decoded};
pub use value::{RMatrix, RValue, NA_INTEGER};
