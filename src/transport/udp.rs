use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::transport::Transport;

/// A UDP socket that is connected to a single peer, carrying one [Connection].
pub struct UdpTransport {
    socket: UdpSocket,
    cancel_sender: broadcast::Sender<()>,
    max_datagram_size: usize,
}

impl UdpTransport {
    pub async fn new(self_addr: SocketAddr, peer_addr: SocketAddr, config: &TransportConfig) -> anyhow::Result<UdpTransport> {
        let (cancel_sender, _) = broadcast::channel(1);

        let socket = UdpSocket::bind(self_addr).await?;
        socket.connect(peer_addr).await?;
        info!("bound UDP socket to {:?}, connected to {:?}", socket.local_addr()?, peer_addr);

        Ok(UdpTransport {
            socket,
            cancel_sender,
            max_datagram_size: config.max_datagram_size,
        })
    }

    /// Binds a socket, spawns a [Connection] on top of it and starts the receive loop. The
    ///  connection is neither opened nor listening yet.
    pub async fn spawn_connection(self_addr: SocketAddr, peer_addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<(Connection, mpsc::Receiver<ConnectionEvent>, Arc<UdpTransport>)> {
        let transport = Arc::new(UdpTransport::new(self_addr, peer_addr, &config).await?);
        let (connection, events) = Connection::spawn(&peer_addr.to_string(), config, transport.clone())?;

        let recv_transport = transport.clone();
        let recv_connection = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = recv_transport.recv_loop(recv_connection).await {
                error!("UDP receive loop terminated: {}", e);
            }
        });

        Ok((connection, events, transport))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Passes every datagram to `connection` until cancelled or until the connection terminates
    pub async fn recv_loop(&self, connection: Connection) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.max_datagram_size];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = self.socket.recv(&mut buf) => {
                    match r {
                        Ok(len) => {
                            if connection.on_bytes(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                                debug!("connection terminated - stopping receive loop");
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                            // an ICMP 'port unreachable' for an earlier datagram: the peer is
                            //  not up (yet), which is just another lost message
                            trace!("peer refused datagram");
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    pub fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        self.socket.send(&buf).await?;
        Ok(())
    }
}
