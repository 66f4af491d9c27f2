//! Client side of the session stream
//!
//! `StreamConsumer` owns the connection lifecycle; `HttpTransport` talks to a
//! running server.

mod consumer;
mod state;
mod transport;

pub use consumer::{
    Cancellation, ChannelHandler, ConsumerSettings, ConsumerUpdate, StreamConsumer,
    StreamHandler, TurnOutcome,
};
pub use state::{backoff, ConnectionState};
pub use transport::{ByteStream, HttpTransport, StreamTransport};
