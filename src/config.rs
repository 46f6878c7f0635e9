use std::time::Duration;
use anyhow::bail;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// This is the 'user timeout' for OPEN and CLOSE: a handshake that is not completed within
    ///  this time fails, and a close sequence that is not completed within this time terminates
    ///  the connection without waiting any longer for the peer.
    ///
    /// NB: Handshake segments are never retransmitted, so this timeout is the *only* bound on
    ///      a handshake whose segments get lost. Retrying is up to the application.
    pub handshake_timeout: Duration,

    /// The initial send sequence number. If this is `None`, a random number is used for each
    ///  handshake, which is the recommended setting outside of tests.
    pub initial_seq: Option<u32>,

    pub arq: ArqConfig,

    /// capacity of the channel through which application calls, inbound datagrams and timer
    ///  events reach a connection's actor
    pub command_buffer_size: usize,
    /// capacity of the channel through which a connection emits events to the application
    pub event_buffer_size: usize,

    /// Inbound datagrams are read into buffers of this size. Longer datagrams are truncated by
    ///  the OS, which typically means they are dropped as unparseable.
    pub max_datagram_size: usize,
}

impl TransportConfig {
    pub fn stop_and_wait() -> TransportConfig {
        Self::with_arq(ArqConfig::StopAndWait(StopAndWaitConfig {
            retry_timeout: Duration::from_millis(100),
            max_pending_writes: 1,
        }))
    }

    pub fn go_back_n() -> TransportConfig {
        Self::with_arq(ArqConfig::GoBackN(GoBackNConfig {
            window_size: 16,
            retry_timeout: Duration::from_millis(100),
        }))
    }

    pub fn with_arq(arq: ArqConfig) -> TransportConfig {
        TransportConfig {
            handshake_timeout: Duration::from_secs(5),
            initial_seq: None,
            arq,
            command_buffer_size: 1024,
            event_buffer_size: 1024,
            max_datagram_size: 65536,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must not be zero");
        }
        if self.command_buffer_size == 0 || self.event_buffer_size == 0 {
            bail!("channel buffer sizes must be at least 1");
        }
        if self.max_datagram_size < 16 {
            bail!("max datagram size is too small");
        }

        match &self.arq {
            ArqConfig::StopAndWait(cfg) => {
                if cfg.retry_timeout.is_zero() {
                    bail!("stop-and-wait retry timeout must not be zero");
                }
                if cfg.max_pending_writes == 0 {
                    bail!("stop-and-wait must allow at least one pending write");
                }
            }
            ArqConfig::GoBackN(cfg) => {
                if cfg.retry_timeout.is_zero() {
                    bail!("go-back-n retry timeout must not be zero");
                }
                if cfg.window_size == 0 {
                    bail!("go-back-n window size must be at least 1");
                }
                // the sequence space (2^32) must be more than twice the window size for wrap-around
                //  sequence numbers to be unambiguous
                if cfg.window_size >= GoBackNConfig::MAX_WINDOW_SIZE {
                    bail!("go-back-n window size must be less than {}", GoBackNConfig::MAX_WINDOW_SIZE);
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum ArqConfig {
    StopAndWait(StopAndWaitConfig),
    GoBackN(GoBackNConfig),
}

#[derive(Clone, Debug)]
pub struct StopAndWaitConfig {
    /// time to wait for an ACK before the data frame is sent again. This should not be smaller
    ///  than the round trip time of the connection.
    pub retry_timeout: Duration,
    /// number of writes that can be buffered while a data frame is waiting for its ACK. Writes
    ///  beyond that are rejected with backpressure.
    pub max_pending_writes: usize,
}

#[derive(Clone, Debug)]
pub struct GoBackNConfig {
    /// This is the maximum number of *frames* (not bytes) that are sent but not yet acknowledged.
    ///
    /// A good window size takes the link capacity (LC, bytes/s), the RTT and the frame size into
    ///  account, e.g. `LC * RTT / (frame size * 2)`.
    pub window_size: u32,
    /// time to wait for an ACK of the oldest outstanding frame before the entire window is sent
    ///  again. This should be at least twice the time it takes to transfer a window.
    pub retry_timeout: Duration,
}

impl GoBackNConfig {
    pub const MAX_WINDOW_SIZE: u32 = 0x8000_0000;
}
