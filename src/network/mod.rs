//! Network Module Implementation
//!
//! Buffered streams and the framing layers built on them.
//!
//! # Architecture
//!
//! - `Buffer`: fixed-capacity byte region with read and write cursors
//! - `Connection`: socket, output buffer and output queue of a stream
//! - `Stream`: the loop-facing dispatcher, generic over a `Protocol`
//! - `ChatDispatcher`: terminator framing (none, byte count, delimiter)
//! - `NetstringDispatcher`: `<len>:<payload>,` framing with truncation
//!
//! # Flow
//!
//! A readable event receives into the input buffer and hands the unread
//! bytes to the protocol's `collect`. A writable event refills the output
//! buffer from the queue of chunks and producers, then sends it.

pub use buffer::Buffer;
pub use chat::{collect, Channel, ChatDispatcher, ChatHandler, Terminator};
pub use connection::{Connection, Context};
pub use frame::{decode, encode, encode_into, Netstring, NetstringDecoder};
pub use netstring::{NetstringDispatcher, NetstringHandler};
pub use producer::{BytesProducer, Collector, OutputItem, OutputQueue, Producer, StringsProducer};
pub use stream::{Protocol, Stream};

mod buffer;
mod chat;
mod connection;
mod frame;
mod netstring;
mod producer;
mod stream;
