use std::fmt::{Display, Formatter};
use std::time::Duration;
use bytes::Bytes;
use crate::seq::SeqNum;

/// Events a connection emits to the application, in the order in which they occur
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed. `snd_nxt` and `rcv_nxt` are the sequence numbers the ARQ engine
    ///  was seeded with.
    Established { snd_nxt: SeqNum, rcv_nxt: SeqNum },
    /// The handshake failed, or an established connection was reset. This is emitted at most
    ///  once per connection attempt, and the connection is closed afterwards.
    Failed(ConnectionFailure),
    /// application payload, delivered in order and without duplicates
    Delivered(Bytes),
    /// an inbound message that is neither a handshake segment nor an ARQ frame, passed on
    ///  unchanged
    PassThrough(Bytes),
    /// the peer initiated closing the connection. There will be no more deliveries.
    Closing,
    /// The connection is closed, either after a completed close sequence or because the close
    ///  sequence timed out.
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// the handshake was not completed within the handshake timeout
    Timeout { elapsed: Duration },
    /// the peer sent RST
    Reset,
    /// the peer started a new handshake on an established connection, i.e. it lost its state
    PeerMismatch,
}

impl Display for ConnectionFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionFailure::Timeout { elapsed } => write!(f, "handshake timed out after {:?}", elapsed),
            ConnectionFailure::Reset => write!(f, "connection reset by peer"),
            ConnectionFailure::PeerMismatch => write!(f, "peer started a new connection"),
        }
    }
}
