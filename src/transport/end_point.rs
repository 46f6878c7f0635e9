use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::codec::segment::HandshakeSegment;
use crate::codec::{is_frame, DecodeResult, FrameCodec};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::transport::Transport;

struct PeerConnection {
    id: u64,
    connection: Connection,
}

type ConnectionMap = Arc<RwLock<FxHashMap<SocketAddr, PeerConnection>>>;

/// EndPoint multiplexes connections to any number of peers over a single UDP socket. Inbound
///  datagrams are dispatched by source address. A SYN from an unknown peer creates a passive
///  (listening) connection for it. Other datagrams from unknown peers do not: protocol frames
///  are dropped, and anything else is reported as pass-through.
///
/// Events of all connections are merged into a single channel, tagged with the peer address.
///  A connection is forgotten once it is closed or failed, and the peer's next SYN starts over
///  with a new connection.
pub struct EndPoint {
    socket: Arc<UdpSocket>,
    config: Arc<TransportConfig>,
    connections: ConnectionMap,
    next_connection_id: AtomicU64,
    event_sender: mpsc::Sender<(SocketAddr, ConnectionEvent)>,
    cancel_sender: broadcast::Sender<()>,
}

impl EndPoint {
    pub async fn new(self_addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<(EndPoint, mpsc::Receiver<(SocketAddr, ConnectionEvent)>)> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("bound end point socket to {:?}", socket.local_addr()?);

        let (event_sender, event_receiver) = mpsc::channel(config.event_buffer_size);
        let (cancel_sender, _) = broadcast::channel(1);

        Ok((EndPoint {
            socket,
            config,
            connections: Default::default(),
            next_connection_id: AtomicU64::new(0),
            event_sender,
            cancel_sender,
        }, event_receiver))
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Opens a connection to `peer`, reusing an existing connection if there is one
    pub async fn connect(&self, peer: SocketAddr) -> anyhow::Result<Connection> {
        let (connection, is_new) = self.get_or_create_connection(peer).await?;
        if is_new {
            connection.open().await?;
        }
        Ok(connection)
    }

    pub async fn connection(&self, peer: SocketAddr) -> Option<Connection> {
        self.connections.read().await
            .get(&peer)
            .map(|c| c.connection.clone())
    }

    async fn get_or_create_connection(&self, peer: SocketAddr) -> anyhow::Result<(Connection, bool)> {
        if let Some(c) = self.connections.read().await.get(&peer) {
            return Ok((c.connection.clone(), false));
        }

        let mut connections = self.connections.write().await;
        if let Some(c) = connections.get(&peer) {
            return Ok((c.connection.clone(), false));
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        debug!("creating connection #{} for {:?}", id, peer);
        let transport = Arc::new(PeerTransport { socket: self.socket.clone(), peer });
        let (connection, events) = Connection::spawn(&peer.to_string(), self.config.clone(), transport)?;
        connections.insert(peer, PeerConnection { id, connection: connection.clone() });
        drop(connections);

        self.spawn_event_forwarder(peer, id, events);
        Ok((connection, true))
    }

    /// The forwarder identifies its connection by id only: holding a handle would keep the
    ///  connection's actor alive.
    fn spawn_event_forwarder(&self, peer: SocketAddr, id: u64, mut events: mpsc::Receiver<ConnectionEvent>) {
        let connections = self.connections.clone();
        let event_sender = self.event_sender.clone();

        let span = span!(Level::INFO, "end_point_events", %peer, id);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if matches!(event, ConnectionEvent::Closed | ConnectionEvent::Failed(_)) {
                    let mut connections = connections.write().await;
                    if connections.get(&peer).is_some_and(|c| c.id == id) {
                        debug!("connection terminated - removing it");
                        connections.remove(&peer);
                    }
                }
                if event_sender.send((peer, event)).await.is_err() {
                    trace!("event receiver was dropped");
                    break;
                }
            }
        }.instrument(span));
    }

    /// Returns the connection a datagram from a peer without a connection is for, creating a
    ///  passive connection if the datagram is a SYN.
    async fn on_unknown_peer(&self, from: SocketAddr, buf: &Bytes) -> Option<Connection> {
        match HandshakeSegment::deser(buf) {
            DecodeResult::Decoded(seg) if seg.is_syn() && !seg.is_ack() => {
                match self.get_or_create_connection(from).await {
                    Ok((connection, false)) => Some(connection),
                    Ok((connection, true)) => match connection.listen().await {
                        Ok(()) => Some(connection),
                        Err(e) => {
                            warn!("error listening for {:?}: {}", from, e);
                            None
                        }
                    },
                    Err(e) => {
                        warn!("error creating connection for {:?}: {} - dropping datagram", from, e);
                        None
                    }
                }
            }
            _ if is_frame(buf) => {
                debug!("frame from {:?} without a connection - dropping", from);
                None
            }
            _ => {
                match self.event_sender.try_send((from, ConnectionEvent::PassThrough(buf.clone()))) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("event buffer is full - discarding pass-through message from {:?}", from),
                    Err(TrySendError::Closed(_)) => trace!("event receiver was dropped"),
                }
                None
            }
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        loop {
            let (num_read, from) = tokio::select! {
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
                _ = cancel_receiver.recv() => break,
            };

            trace!("received {} bytes from {:?}", num_read, from);
            let datagram = Bytes::copy_from_slice(&buf[..num_read]);

            let connection = match self.connection(from).await {
                Some(connection) => connection,
                None => match self.on_unknown_peer(from, &datagram).await {
                    Some(connection) => connection,
                    None => continue,
                },
            };

            if connection.on_bytes(datagram).await.is_err() {
                debug!("connection for {:?} terminated - dropping datagram", from);
            }
        }
        info!("receive loop terminated");
    }

    pub fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

/// sends to one peer through the end point's shared socket
struct PeerTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl Transport for PeerTransport {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        self.socket.send_to(&buf, self.peer).await?;
        Ok(())
    }
}
