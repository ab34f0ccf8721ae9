//! Wire protocol and socket plumbing for the worker connection.
//!
//! # Architecture
//!
//! - **protocol**: reserved signal codes, flag bytes, outgoing frame shapes
//! - **codec**: framing codecs over AsyncRead/AsyncWrite
//! - **transport**: loopback listener and the established framed connection

pub mod codec;
pub mod protocol;
pub mod transport;
