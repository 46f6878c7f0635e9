//! A reliable transport sublayer for overlay networks. It turns an unreliable, message-oriented
//!  channel (datagrams, relays, tunnels) that may drop, duplicate and reorder messages into an
//!  ordered, duplicate-free stream of application messages.
//!
//! ## Protocol
//!
//! Each [connection::Connection] is a pipeline of independent filters over a bidirectional
//!  stream of messages:
//!
//! ```ascii
//!  application            open() / close() / write()        ConnectionEvent
//!       |                          |                               ^
//!  handshake        SYN / SYN+ACK / ACK, FIN, RST      Established / Failed / Closed
//!       |                          |                               ^
//!  ARQ engine          Data frames, retransmission         Delivered, Acks
//!       |                          |                               ^
//!  wire codec          magic number + fields          decode or pass through
//!       |                          v                               |
//!  transport                   send()                          on_bytes()
//! ```
//!
//! * The *handshake* negotiates initial sequence numbers with a three-way exchange, and
//!   terminates the connection with a FIN exchange or a reset. Handshake segments are not
//!   retransmitted: a single user timeout bounds opening and closing.
//! * The *ARQ engine* numbers data frames starting with the negotiated sequence numbers,
//!   acknowledges received frames and retransmits unacknowledged frames on timeout. There are
//!   two interchangeable engines, Stop-and-Wait (one frame in flight, alternating bit) and
//!   Go-Back-N (sliding window, cumulative acks, window-level retransmission).
//! * Every message starts with a 4 byte magic number. Messages with a magic number none of the
//!   codecs knows are passed through to the application unmodified, so the sublayer can share a
//!   channel with other traffic.
//!
//! All of a connection's state is owned by an actor task. Application calls, inbound messages and
//!  timer expiry reach it through a single channel, so they are processed one at a time without
//!  locking.
//!
//! ## Usage
//!
//! [transport::udp::UdpTransport] carries a single connection over a connected UDP socket, and
//!  [transport::end_point::EndPoint] multiplexes connections to any number of peers over a
//!  single UDP socket. Other channels can be plugged in by implementing [transport::Transport]
//!  and passing inbound messages to [connection::Connection::on_bytes].

pub mod config;
pub mod seq;
pub mod codec;
pub mod arq;
pub mod connection;
pub mod transport;
pub mod test_util;
