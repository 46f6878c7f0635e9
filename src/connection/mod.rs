//! A connection to a single peer: the handshake establishes it and seeds the ARQ engine, which
//!  then carries the application's data. An actor owns all of the connection's state.

pub mod connection;
pub mod events;
pub mod handshake;
pub mod timer;

pub use connection::Connection;
pub use events::{ConnectionEvent, ConnectionFailure};
pub use handshake::HandshakeState;
