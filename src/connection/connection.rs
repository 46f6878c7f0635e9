use std::sync::Arc;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, span, trace, warn, Instrument, Level};
use crate::arq::{new_arq_engine, ArqEngine, ArqOutput, ArqStats, WriteOutcome};
use crate::codec::segment::HandshakeSegment;
use crate::codec::{DecodeResult, FrameCodec};
use crate::config::TransportConfig;
use crate::connection::events::ConnectionEvent;
use crate::connection::handshake::{Handshake, HandshakeOutput, HandshakeState};
use crate::connection::timer::{ConnectionTimer, TimerKind};
use crate::seq::SeqNum;
use crate::transport::Transport;

pub(crate) enum ConnectionCommand {
    Open(oneshot::Sender<anyhow::Result<()>>),
    Listen(oneshot::Sender<anyhow::Result<()>>),
    Close(oneshot::Sender<anyhow::Result<()>>),
    Write(Bytes, oneshot::Sender<anyhow::Result<WriteOutcome>>),
    Inbound(Bytes),
    TimerFired(TimerKind, u64),
    State(oneshot::Sender<HandshakeState>),
    Stats(oneshot::Sender<ArqStats>),
}

/// A handle to one reliable connection with one peer. All of the connection's state is owned
///  by an actor task, and the handle's methods send commands to that actor. Inbound messages,
///  timer expiry and application calls are processed strictly one after the other.
///
/// Handles are cheap to clone. The actor terminates when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    command_sender: mpsc::Sender<ConnectionCommand>,
    writable: Arc<Notify>,
}

impl Connection {
    /// Spawns the connection's actor. Messages the connection sends go to `transport`, and
    ///  inbound messages must be passed to [Connection::on_bytes]. The returned receiver
    ///  yields the connection's [ConnectionEvent]s.
    ///
    /// The application must keep draining the event receiver. While it is full, the actor
    ///  waits for room for protocol events, and [ConnectionEvent::PassThrough] messages are
    ///  discarded.
    ///
    /// `peer` is for logging only.
    pub fn spawn(peer: &str, config: Arc<TransportConfig>, transport: Arc<dyn Transport>) -> anyhow::Result<(Connection, mpsc::Receiver<ConnectionEvent>)> {
        config.validate()?;

        let (command_sender, command_receiver) = mpsc::channel(config.command_buffer_size);
        let (event_sender, event_receiver) = mpsc::channel(config.event_buffer_size);
        let writable = Arc::new(Notify::new());

        let actor = ConnectionActor::new(config, transport, &command_sender, event_sender, writable.clone());
        let span = span!(Level::INFO, "connection", %peer);
        tokio::spawn(actor.run(command_receiver).instrument(span));

        Ok((Connection { command_sender, writable }, event_receiver))
    }

    async fn call<T>(&self, make_command: impl FnOnce(oneshot::Sender<T>) -> ConnectionCommand) -> anyhow::Result<T> {
        let (reply_sender, reply_receiver) = oneshot::channel();
        self.command_sender.send(make_command(reply_sender)).await
            .map_err(|_| anyhow!("connection terminated"))?;
        reply_receiver.await
            .map_err(|_| anyhow!("connection terminated"))
    }

    /// active open: sends SYN. The outcome of the handshake is reported as an event.
    pub async fn open(&self) -> anyhow::Result<()> {
        self.call(ConnectionCommand::Open).await?
    }

    /// passive open: waits for the peer's SYN
    pub async fn listen(&self) -> anyhow::Result<()> {
        self.call(ConnectionCommand::Listen).await?
    }

    /// Starts closing the connection. Data that was written before is delivered before the
    ///  peer is asked to close. Completion is reported as [ConnectionEvent::Closed].
    pub async fn close(&self) -> anyhow::Result<()> {
        self.call(ConnectionCommand::Close).await?
    }

    /// Writes a payload if there is room for it, handing it back as
    ///  [WriteOutcome::Backpressure] otherwise. This is also the outcome while the handshake is
    ///  in progress.
    ///
    /// Writing to a connection that is not open (or closing) is an error.
    pub async fn try_write(&self, payload: Bytes) -> anyhow::Result<WriteOutcome> {
        self.call(|reply| ConnectionCommand::Write(payload, reply)).await?
    }

    /// Writes a payload, waiting for room if necessary
    pub async fn write(&self, payload: Bytes) -> anyhow::Result<()> {
        let mut payload = payload;
        loop {
            // registered before the attempt so a notification in between is not lost
            let writable = self.writable.notified();
            match self.try_write(payload).await? {
                WriteOutcome::Accepted => return Ok(()),
                WriteOutcome::Backpressure(p) => {
                    trace!("backpressure - waiting for connection to become writable");
                    payload = p;
                    writable.await;
                }
            }
        }
    }

    /// Passes a message received from the transport to the connection
    pub async fn on_bytes(&self, buf: Bytes) -> anyhow::Result<()> {
        self.command_sender.send(ConnectionCommand::Inbound(buf)).await
            .map_err(|_| anyhow!("connection terminated"))
    }

    pub async fn state(&self) -> anyhow::Result<HandshakeState> {
        self.call(ConnectionCommand::State).await
    }

    pub async fn stats(&self) -> anyhow::Result<ArqStats> {
        self.call(ConnectionCommand::Stats).await
    }
}

struct ConnectionActor {
    config: Arc<TransportConfig>,
    transport: Arc<dyn Transport>,
    handshake: Handshake,
    engine: Box<dyn ArqEngine>,
    handshake_timer: ConnectionTimer<ConnectionCommand>,
    retransmit_timer: ConnectionTimer<ConnectionCommand>,
    event_sender: mpsc::Sender<ConnectionEvent>,
    writable: Arc<Notify>,
    /// the application asked to close while there was unacknowledged data
    close_pending: bool,
}

impl ConnectionActor {
    fn new(
        config: Arc<TransportConfig>,
        transport: Arc<dyn Transport>,
        command_sender: &mpsc::Sender<ConnectionCommand>,
        event_sender: mpsc::Sender<ConnectionEvent>,
        writable: Arc<Notify>,
    ) -> ConnectionActor {
        let handshake = Handshake::new(config.handshake_timeout, Self::initial_seq(&config));
        let engine = new_arq_engine(&config.arq);
        ConnectionActor {
            handshake,
            engine,
            handshake_timer: ConnectionTimer::new(TimerKind::Handshake, command_sender, ConnectionCommand::TimerFired),
            retransmit_timer: ConnectionTimer::new(TimerKind::Retransmit, command_sender, ConnectionCommand::TimerFired),
            config,
            transport,
            event_sender,
            writable,
            close_pending: false,
        }
    }

    fn initial_seq(config: &TransportConfig) -> SeqNum {
        SeqNum::from_raw(config.initial_seq.unwrap_or_else(rand::random))
    }

    async fn run(mut self, mut command_receiver: mpsc::Receiver<ConnectionCommand>) {
        debug!("starting connection");
        while let Some(command) = command_receiver.recv().await {
            self.on_command(command).await;
        }
        debug!("all handles were dropped - terminating connection");
    }

    async fn on_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Open(reply) => {
                self.handshake.reset_iss(Self::initial_seq(&self.config));
                let mut out = HandshakeOutput::default();
                let result = self.handshake.open(Instant::now(), &mut out);
                self.apply_handshake_output(out).await;
                let _ = reply.send(result);
            }
            ConnectionCommand::Listen(reply) => {
                self.handshake.reset_iss(Self::initial_seq(&self.config));
                let _ = reply.send(self.handshake.listen());
            }
            ConnectionCommand::Close(reply) => {
                let result = self.on_close().await;
                let _ = reply.send(result);
            }
            ConnectionCommand::Write(payload, reply) => {
                let result = self.on_write(payload).await;
                let _ = reply.send(result);
            }
            ConnectionCommand::Inbound(buf) => self.on_inbound(buf).await,
            ConnectionCommand::TimerFired(kind, generation) => self.on_timer(kind, generation).await,
            ConnectionCommand::State(reply) => {
                let _ = reply.send(self.handshake.state());
            }
            ConnectionCommand::Stats(reply) => {
                let _ = reply.send(self.engine.stats());
            }
        }
    }

    async fn on_close(&mut self) -> anyhow::Result<()> {
        if self.close_pending {
            return Ok(());
        }

        if self.engine.has_unacknowledged() {
            match self.handshake.state() {
                HandshakeState::Established => {
                    debug!("close requested - deferring FIN until all data is acknowledged");
                    self.close_pending = true;
                    self.handshake_timer.start(self.config.handshake_timeout);
                    return Ok(());
                }
                HandshakeState::CloseWait => {
                    trace!("close requested in CLOSE_WAIT - FIN follows when all data is acknowledged");
                    return Ok(());
                }
                _ => {}
            }
        }

        let mut out = HandshakeOutput::default();
        let result = self.handshake.close(Instant::now(), &mut out);
        self.apply_handshake_output(out).await;
        result
    }

    async fn on_write(&mut self, payload: Bytes) -> anyhow::Result<WriteOutcome> {
        if self.handshake.is_established() && !self.close_pending {
            let mut out = ArqOutput::default();
            let outcome = self.engine.write(payload, &mut out);
            self.apply_arq_output(out).await;
            return Ok(outcome);
        }
        if self.handshake.is_opening() {
            return Ok(WriteOutcome::Backpressure(payload));
        }
        if self.close_pending || self.handshake.is_closing() {
            return Err(anyhow!("connection is closing"));
        }
        Err(anyhow!("connection is not open ({})", self.handshake.state()))
    }

    async fn on_inbound(&mut self, buf: Bytes) {
        trace!("received {} bytes", buf.len());

        match HandshakeSegment::deser(&buf) {
            DecodeResult::Decoded(seg) => {
                let mut out = HandshakeOutput::default();
                self.handshake.on_segment(seg, Instant::now(), &mut out);
                self.apply_handshake_output(out).await;
                return;
            }
            DecodeResult::NeedMoreBytes => {
                debug!("message is too short for a handshake segment - passing it through");
                self.emit(ConnectionEvent::PassThrough(buf)).await;
                return;
            }
            DecodeResult::PassThrough(_) => {}
        }

        if self.handshake.state() == HandshakeState::SynReceived && self.engine.recognizes(&buf) {
            let mut out = HandshakeOutput::default();
            self.handshake.implicit_establish(&mut out);
            self.apply_handshake_output(out).await;
        }

        if !self.handshake.is_synchronized() {
            if self.engine.recognizes(&buf) {
                debug!("ARQ frame in {} - dropping", self.handshake.state());
            }
            else {
                self.emit(ConnectionEvent::PassThrough(buf)).await;
            }
            return;
        }

        let mut out = ArqOutput::default();
        match self.engine.on_message(&buf, &mut out) {
            DecodeResult::Decoded(()) => self.apply_arq_output(out).await,
            DecodeResult::NeedMoreBytes => {
                debug!("message is too short for an ARQ frame - passing it through");
                self.emit(ConnectionEvent::PassThrough(buf)).await;
            }
            DecodeResult::PassThrough(buf) => self.emit(ConnectionEvent::PassThrough(buf)).await,
        }
    }

    async fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        let timer = match kind {
            TimerKind::Handshake => &mut self.handshake_timer,
            TimerKind::Retransmit => &mut self.retransmit_timer,
        };
        if !timer.is_current(generation) {
            trace!("stale {:?} timer #{} - ignoring", kind, generation);
            return;
        }
        timer.expired();

        match kind {
            TimerKind::Handshake => {
                let mut out = HandshakeOutput::default();
                if self.close_pending && self.handshake.is_established() {
                    warn!("unacknowledged data was not acknowledged before the close timeout - aborting");
                    self.handshake.abort(&mut out);
                }
                else {
                    self.handshake.on_timeout(Instant::now(), &mut out);
                }
                self.apply_handshake_output(out).await;
            }
            TimerKind::Retransmit => {
                if self.handshake.is_synchronized() {
                    let mut out = ArqOutput::default();
                    self.engine.on_retransmit_timeout(&mut out);
                    self.apply_arq_output(out).await;
                }
            }
        }
    }

    async fn send(&self, buf: Bytes) {
        if let Err(e) = self.transport.send(buf).await {
            // this is just another lost message
            debug!("error sending message: {}", e);
        }
    }

    async fn emit(&self, event: ConnectionEvent) {
        if let ConnectionEvent::PassThrough(buf) = event {
            match self.event_sender.try_send(ConnectionEvent::PassThrough(buf)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("event buffer is full - discarding pass-through message"),
                Err(TrySendError::Closed(_)) => trace!("event receiver was dropped - discarding event"),
            }
            return;
        }

        if self.event_sender.send(event).await.is_err() {
            trace!("event receiver was dropped - discarding event");
        }
    }

    async fn apply_handshake_output(&mut self, out: HandshakeOutput) {
        let mut next = Some(out);
        while let Some(out) = next.take() {
            for seg in out.segments {
                trace!("sending {:?}", seg);
                self.send(seg.encode()).await;
            }

            if let Some(command) = out.timer {
                self.handshake_timer.apply(command);
            }

            for event in out.events {
                match &event {
                    ConnectionEvent::Established { snd_nxt, rcv_nxt } => {
                        self.engine = new_arq_engine(&self.config.arq);
                        self.engine.seed(*snd_nxt, *rcv_nxt);
                        self.writable.notify_waiters();
                    }
                    ConnectionEvent::Failed(_) | ConnectionEvent::Closed => {
                        self.retransmit_timer.cancel();
                        self.close_pending = false;
                        self.writable.notify_waiters();
                    }
                    // blocked writers fail from now on
                    ConnectionEvent::Closing => self.writable.notify_waiters(),
                    _ => {}
                }
                self.emit(event).await;
            }

            next = self.deferred_fin();
        }
    }

    /// Our FIN waits until the engine has no unacknowledged data, both when the application
    ///  closed first and when the peer did (CLOSE_WAIT).
    fn deferred_fin(&mut self) -> Option<HandshakeOutput> {
        if self.engine.has_unacknowledged() {
            return None;
        }
        match self.handshake.state() {
            HandshakeState::Established if self.close_pending => {}
            HandshakeState::CloseWait => {}
            _ => return None,
        }

        debug!("all data is acknowledged - sending FIN");
        self.close_pending = false;
        let mut out = HandshakeOutput::default();
        if let Err(e) = self.handshake.close(Instant::now(), &mut out) {
            warn!("deferred close failed: {}", e);
        }
        Some(out)
    }

    async fn apply_arq_output(&mut self, out: ArqOutput) {
        for buf in out.transmit {
            self.send(buf).await;
        }
        for payload in out.deliver {
            self.emit(ConnectionEvent::Delivered(payload)).await;
        }
        if let Some(command) = out.timer {
            self.retransmit_timer.apply(command);
        }
        if out.writable {
            self.writable.notify_waiters();
        }

        if let Some(out) = self.deferred_fin() {
            self.apply_handshake_output(out).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::eq;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;
    use crate::codec::go_back_n_frame::GoBackNFrame;
    use crate::config::{ArqConfig, GoBackNConfig, StopAndWaitConfig};
    use crate::connection::events::ConnectionFailure;
    use crate::test_util::fault_injector::FaultPattern;
    use crate::test_util::lossy_link::LossyLink;
    use crate::test_util::tracking_transport::TrackingTransport;
    use crate::transport::MockTransport;

    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    fn config(arq: ArqConfig, initial_seq: u32) -> Arc<TransportConfig> {
        let mut config = TransportConfig::with_arq(arq);
        config.initial_seq = Some(initial_seq);
        config.handshake_timeout = HANDSHAKE_TIMEOUT;
        Arc::new(config)
    }

    fn stop_and_wait() -> ArqConfig {
        ArqConfig::StopAndWait(StopAndWaitConfig {
            retry_timeout: Duration::from_millis(100),
            max_pending_writes: 1,
        })
    }

    fn go_back_n(window_size: u32) -> ArqConfig {
        ArqConfig::GoBackN(GoBackNConfig {
            window_size,
            retry_timeout: Duration::from_millis(100),
        })
    }

    async fn next_event(events: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        time::timeout(Duration::from_secs(60), events.recv()).await
            .expect("no event within timeout")
            .expect("event channel closed")
    }

    async fn assert_no_event(events: &mut mpsc::Receiver<ConnectionEvent>, wait: Duration) {
        if let Ok(Some(evt)) = time::timeout(wait, events.recv()).await {
            panic!("unexpected event {:?}", evt);
        }
    }

    struct Pair {
        a: Connection,
        a_events: mpsc::Receiver<ConnectionEvent>,
        b: Connection,
        b_events: mpsc::Receiver<ConnectionEvent>,
    }

    async fn connected_pair(arq: fn() -> ArqConfig, a_to_b: FaultPattern, b_to_a: FaultPattern) -> Pair {
        let (link_a, inbound_b) = LossyLink::new(a_to_b);
        let (link_b, inbound_a) = LossyLink::new(b_to_a);

        let (a, mut a_events) = Connection::spawn("b", config(arq(), 1000), link_a).unwrap();
        let (b, mut b_events) = Connection::spawn("a", config(arq(), 5000), link_b).unwrap();
        LossyLink::forward_to(inbound_b, b.clone());
        LossyLink::forward_to(inbound_a, a.clone());

        b.listen().await.unwrap();
        a.open().await.unwrap();

        assert_eq!(next_event(&mut a_events).await, ConnectionEvent::Established { snd_nxt: SeqNum::from_raw(1001), rcv_nxt: SeqNum::from_raw(5001) });
        assert_eq!(next_event(&mut b_events).await, ConnectionEvent::Established { snd_nxt: SeqNum::from_raw(5001), rcv_nxt: SeqNum::from_raw(1001) });

        Pair { a, a_events, b, b_events }
    }

    fn stop_and_wait_arq() -> ArqConfig {
        stop_and_wait()
    }

    fn go_back_n_arq() -> ArqConfig {
        // a window of 2 is coprime to the drop period used below
        go_back_n(2)
    }

    #[rstest]
    #[case::stop_and_wait_lossless(stop_and_wait_arq, FaultPattern::default(), FaultPattern::default())]
    #[case::stop_and_wait_drop_every_third(stop_and_wait_arq, FaultPattern::drop_every(3), FaultPattern::drop_every(3))]
    #[case::go_back_n_lossless(go_back_n_arq, FaultPattern::default(), FaultPattern::default())]
    #[case::go_back_n_drop_every_third(go_back_n_arq, FaultPattern::drop_every(3), FaultPattern::drop_every(3))]
    #[case::go_back_n_duplicates(go_back_n_arq, FaultPattern::duplicate_every(2), FaultPattern::duplicate_every(2))]
    fn test_transfer(#[case] arq: fn() -> ArqConfig, #[case] a_to_b: FaultPattern, #[case] b_to_a: FaultPattern) {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let mut pair = connected_pair(arq, a_to_b, b_to_a).await;

            for i in 0..5u8 {
                pair.a.write(Bytes::from(vec![i])).await.unwrap();
            }

            for i in 0..5u8 {
                assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Delivered(Bytes::from(vec![i])));
            }
            assert_no_event(&mut pair.b_events, Duration::from_secs(2)).await;

            let stats = pair.a.stats().await.unwrap();
            assert_eq!(stats.frames_sent, 5);
            assert!(stats.retransmissions <= 50);
            assert_eq!(pair.b.stats().await.unwrap().delivered, 5);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_in_both_directions() {
        let mut pair = connected_pair(go_back_n_arq, FaultPattern::default(), FaultPattern::default()).await;

        pair.a.write(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Delivered(Bytes::from_static(b"ping")));
        pair.b.write(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(next_event(&mut pair.a_events).await, ConnectionEvent::Delivered(Bytes::from_static(b"pong")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close() {
        let mut pair = connected_pair(go_back_n_arq, FaultPattern::default(), FaultPattern::drop_every(2)).await;

        for i in 0..3u8 {
            pair.a.write(Bytes::from(vec![i])).await.unwrap();
        }
        pair.a.close().await.unwrap();
        assert!(pair.a.try_write(Bytes::from_static(b"late")).await.is_err());

        for i in 0..3u8 {
            assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Delivered(Bytes::from(vec![i])));
        }
        assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Closing);
        assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Closed);
        assert_eq!(next_event(&mut pair.a_events).await, ConnectionEvent::Closed);
        assert_eq!(pair.a.state().await.unwrap(), HandshakeState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_close_delivers_pending_data() {
        // b's data is lost the first time, so it is still unacknowledged when a's FIN arrives
        let mut pair = connected_pair(go_back_n_arq, FaultPattern::default(), FaultPattern::drop_every(2)).await;

        assert_eq!(pair.b.try_write(Bytes::from_static(b"from-b")).await.unwrap(), WriteOutcome::Accepted);
        pair.a.close().await.unwrap();

        assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Closing);
        assert_eq!(pair.b.state().await.unwrap(), HandshakeState::CloseWait);
        assert!(pair.b.try_write(Bytes::from_static(b"late")).await.is_err());

        assert_eq!(next_event(&mut pair.a_events).await, ConnectionEvent::Delivered(Bytes::from_static(b"from-b")));
        assert_eq!(next_event(&mut pair.a_events).await, ConnectionEvent::Closed);
        assert_eq!(next_event(&mut pair.b_events).await, ConnectionEvent::Closed);
        assert_eq!(pair.b.stats().await.unwrap().frames_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_fails_exactly_once() {
        let (link, _inbound) = LossyLink::new(FaultPattern::drop_every(1));
        let (a, mut events) = Connection::spawn("peer", config(stop_and_wait(), 1), link).unwrap();

        let start = Instant::now();
        a.open().await.unwrap();
        assert_eq!(a.try_write(Bytes::from_static(b"x")).await.unwrap(), WriteOutcome::Backpressure(Bytes::from_static(b"x")));

        match next_event(&mut events).await {
            ConnectionEvent::Failed(ConnectionFailure::Timeout { elapsed }) => {
                assert!(elapsed >= HANDSHAKE_TIMEOUT);
                assert!(start.elapsed() >= HANDSHAKE_TIMEOUT);
            }
            evt => panic!("unexpected event {:?}", evt),
        }
        assert_no_event(&mut events, 4 * HANDSHAKE_TIMEOUT).await;
        assert_eq!(a.state().await.unwrap(), HandshakeState::Closed);
        assert!(a.try_write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_write_fails_when_handshake_fails() {
        let (link, _inbound) = LossyLink::new(FaultPattern::drop_every(1));
        let (a, _events) = Connection::spawn("peer", config(stop_and_wait(), 1), link).unwrap();

        a.open().await.unwrap();
        assert!(a.write(Bytes::from_static(b"x")).await.is_err());
    }

    fn mock_transport(expected: Vec<HandshakeSegment>) -> Arc<dyn Transport> {
        let mut transport = MockTransport::new();
        for seg in expected {
            transport.expect_send()
                .with(eq(seg.encode()))
                .times(1)
                .returning(|_| Ok(()));
        }
        Arc::new(transport)
    }

    async fn established_with_mock(extra_sent: Vec<HandshakeSegment>) -> (Connection, mpsc::Receiver<ConnectionEvent>) {
        let mut expected = vec![
            HandshakeSegment::syn(SeqNum::from_raw(100)),
            HandshakeSegment::ack(SeqNum::from_raw(101), SeqNum::from_raw(201)),
        ];
        expected.extend(extra_sent);

        let (a, mut events) = Connection::spawn("mock", config(go_back_n(4), 100), mock_transport(expected)).unwrap();
        a.open().await.unwrap();
        a.on_bytes(HandshakeSegment::syn_ack(SeqNum::from_raw(200), SeqNum::from_raw(101)).encode()).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Established { snd_nxt: SeqNum::from_raw(101), rcv_nxt: SeqNum::from_raw(201) });
        (a, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let (a, mut events) = established_with_mock(vec![]).await;

        a.on_bytes(HandshakeSegment::rst(SeqNum::from_raw(201)).encode()).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Failed(ConnectionFailure::Reset));
        assert_eq!(a.state().await.unwrap(), HandshakeState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_mismatch() {
        let (a, mut events) = established_with_mock(vec![
            HandshakeSegment::new(SeqNum::ZERO, SeqNum::from_raw(778), crate::codec::segment::ctl::RST | crate::codec::segment::ctl::ACK),
        ]).await;

        a.on_bytes(HandshakeSegment::syn(SeqNum::from_raw(777)).encode()).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Failed(ConnectionFailure::PeerMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_through_and_truncated_frames() {
        let (a, mut events) = established_with_mock(vec![]).await;

        a.on_bytes(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(b"hi")));

        // known magic numbers, but too short for a frame: application data that happens to
        //  start with a magic number
        a.on_bytes(Bytes::from_static(&[0xdb, 0x1e, 0x5e, 0x60, 0, 0])).await.unwrap();
        a.on_bytes(Bytes::from_static(&[0xdb, 0x1e, 0x6b, 0x01, 0])).await.unwrap();
        a.on_bytes(Bytes::from_static(b"application data")).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(&[0xdb, 0x1e, 0x5e, 0x60, 0, 0])));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(&[0xdb, 0x1e, 0x6b, 0x01, 0])));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(b"application data")));
        assert_eq!(a.state().await.unwrap(), HandshakeState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_message_with_magic_passes_through_before_open() {
        let (a, mut events) = Connection::spawn("mock", config(go_back_n(4), 1), Arc::new(MockTransport::new())).unwrap();
        a.listen().await.unwrap();

        a.on_bytes(Bytes::from_static(&[0xdb, 0x1e, 0x5e, 0x60, 0, 0])).await.unwrap();
        a.on_bytes(Bytes::from_static(&[0xdb, 0x1e, 0x6b, 0x02])).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(&[0xdb, 0x1e, 0x5e, 0x60, 0, 0])));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(&[0xdb, 0x1e, 0x6b, 0x02])));
        assert_eq!(a.state().await.unwrap(), HandshakeState::Listen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undrained_events_do_not_stall_the_connection() {
        let mut config = TransportConfig::with_arq(stop_and_wait());
        config.event_buffer_size = 1;
        let (a, mut events) = Connection::spawn("mock", Arc::new(config), Arc::new(MockTransport::new())).unwrap();

        for msg in ["one", "two", "three"] {
            a.on_bytes(Bytes::from(msg)).await.unwrap();
        }
        assert_eq!(a.state().await.unwrap(), HandshakeState::Closed);

        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(b"one")));
        assert!(events.try_recv().is_err());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_actor_can_run_on_a_multi_threaded_runtime() {
        let (command_sender, command_receiver) = mpsc::channel(1);
        let (event_sender, _events) = mpsc::channel(1);
        let actor = ConnectionActor::new(config(go_back_n(4), 1), Arc::new(MockTransport::new()), &command_sender, event_sender, Arc::new(Notify::new()));

        let run = actor.run(command_receiver);
        assert_send(&run);

        drop(command_sender);
        tokio::spawn(run).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_through_before_open() {
        let (a, mut events) = Connection::spawn("mock", config(stop_and_wait(), 1), Arc::new(MockTransport::new())).unwrap();
        a.on_bytes(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::PassThrough(Bytes::from_static(b"hello")));
        assert!(a.try_write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_implicit_establishment_by_data_frame() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .with(eq(HandshakeSegment::syn_ack(SeqNum::from_raw(300), SeqNum::from_raw(11)).encode()))
            .times(1)
            .returning(|_| Ok(()));
        transport.expect_send()
            .with(eq(GoBackNFrame::Ack { seq: SeqNum::from_raw(11) }.encode()))
            .times(1)
            .returning(|_| Ok(()));

        let (b, mut events) = Connection::spawn("mock", config(go_back_n(4), 300), Arc::new(transport)).unwrap();
        b.listen().await.unwrap();
        b.on_bytes(HandshakeSegment::syn(SeqNum::from_raw(10)).encode()).await.unwrap();
        // the final ACK of the handshake is lost
        b.on_bytes(GoBackNFrame::Data { seq: SeqNum::from_raw(11), payload: Bytes::from_static(b"data") }.encode()).await.unwrap();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Established { snd_nxt: SeqNum::from_raw(301), rcv_nxt: SeqNum::from_raw(11) });
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Delivered(Bytes::from_static(b"data")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let mut config = TransportConfig::go_back_n();
        config.arq = go_back_n(0);
        assert!(Connection::spawn("x", Arc::new(config), Arc::new(MockTransport::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_if_data_is_never_acknowledged() {
        let transport = Arc::new(TrackingTransport::new());
        let (a, mut events) = Connection::spawn("tracking", config(go_back_n(4), 100), transport.clone()).unwrap();

        a.open().await.unwrap();
        a.on_bytes(HandshakeSegment::syn_ack(SeqNum::from_raw(200), SeqNum::from_raw(101)).encode()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Established { .. }));

        a.write(Bytes::from_static(b"data")).await.unwrap();
        a.close().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);

        transport.assert_frame_sent(HandshakeSegment::syn(SeqNum::from_raw(100))).await;
        transport.assert_frame_sent(HandshakeSegment::ack(SeqNum::from_raw(101), SeqNum::from_raw(201))).await;
        transport.assert_frame_sent(GoBackNFrame::Data { seq: SeqNum::from_raw(101), payload: Bytes::from_static(b"data") }).await;

        let remaining = transport.take_all().await;
        assert!(remaining.len() > 1);
        assert_eq!(remaining.last(), Some(&HandshakeSegment::rst(SeqNum::from_raw(101)).encode()));
        for retransmission in &remaining[..remaining.len() - 1] {
            assert_eq!(GoBackNFrame::deser(retransmission), DecodeResult::Decoded(GoBackNFrame::Data { seq: SeqNum::from_raw(101), payload: Bytes::from_static(b"data") }));
        }

        // no retransmissions after the connection is closed
        time::sleep(Duration::from_secs(1)).await;
        transport.assert_no_remaining_frames().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_after_failure() {
        let (link, _inbound) = LossyLink::new(FaultPattern::drop_every(1));
        let (a, mut events) = Connection::spawn("peer", config(stop_and_wait(), 1), link).unwrap();

        a.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Failed(_)));
        a.open().await.unwrap();
        assert_eq!(a.state().await.unwrap(), HandshakeState::SynSent);
        assert!(a.open().await.is_err());
    }
}
