//! Wire layer for editor-daemon communication.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types and the [`WireCodec`](protocol::WireCodec)
//!   that turns requests into lines and lines into replies
//! - **codec**: Newline framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
