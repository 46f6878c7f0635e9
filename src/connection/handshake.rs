use std::fmt::{Display, Formatter};
use std::time::Duration;
use anyhow::bail;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::arq::TimerCommand;
use crate::codec::segment::{ctl, HandshakeSegment};
use crate::connection::events::{ConnectionEvent, ConnectionFailure};
use crate::seq::SeqNum;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    /// the peer sent FIN, and our own FIN waits until all of our data is acknowledged
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
}

impl Display for HandshakeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandshakeState::Closed => "CLOSED",
            HandshakeState::Listen => "LISTEN",
            HandshakeState::SynSent => "SYN_SENT",
            HandshakeState::SynReceived => "SYN_RECEIVED",
            HandshakeState::Established => "ESTABLISHED",
            HandshakeState::CloseWait => "CLOSE_WAIT",
            HandshakeState::FinWait1 => "FIN_WAIT_1",
            HandshakeState::FinWait2 => "FIN_WAIT_2",
            HandshakeState::Closing => "CLOSING",
            HandshakeState::LastAck => "LAST_ACK",
        };
        write!(f, "{}", s)
    }
}

#[derive(Default, Debug)]
pub struct HandshakeOutput {
    pub segments: Vec<HandshakeSegment>,
    pub events: Vec<ConnectionEvent>,
    /// command for the user timeout, i.e. the timer bounding OPEN and CLOSE
    pub timer: Option<TimerCommand>,
}

/// The connection handshake: it negotiates initial sequence numbers with a three-way SYN /
///  SYN+ACK / ACK exchange, and terminates the connection with a FIN exchange or a reset.
///
/// Handshake segments are never retransmitted. A single user timeout (`timeout`) bounds both
///  opening and closing: if it expires before the handshake completes, the connection fails
///  with [ConnectionFailure::Timeout], and if it expires during the close sequence, the
///  connection is closed without waiting any further.
///
/// SYN and FIN each consume one sequence number. Data is not numbered here: the negotiated
///  `snd_nxt` / `rcv_nxt` seed the ARQ engine, which numbers its frames independently.
pub struct Handshake {
    timeout: Duration,
    state: HandshakeState,
    iss: SeqNum,
    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,
    /// when the current OPEN or CLOSE started, for diagnostics
    started_at: Instant,
}

impl Handshake {
    pub fn new(timeout: Duration, iss: SeqNum) -> Handshake {
        Handshake {
            timeout,
            state: HandshakeState::Closed,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: SeqNum::ZERO,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn snd_nxt(&self) -> SeqNum {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> SeqNum {
        self.rcv_nxt
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// `true` in all states in which the ARQ engine is seeded and data frames are processed
    pub fn is_synchronized(&self) -> bool {
        matches!(self.state,
            HandshakeState::Established | HandshakeState::CloseWait | HandshakeState::FinWait1 | HandshakeState::FinWait2 | HandshakeState::Closing | HandshakeState::LastAck)
    }

    /// `true` while a handshake is in progress, i.e. after OPEN and before it succeeds or fails
    pub fn is_opening(&self) -> bool {
        matches!(self.state, HandshakeState::SynSent | HandshakeState::SynReceived)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, HandshakeState::CloseWait | HandshakeState::FinWait1 | HandshakeState::FinWait2 | HandshakeState::Closing | HandshakeState::LastAck)
    }

    /// Starts a new connection attempt with a new initial sequence number. This is how a closed
    ///  connection is reopened.
    pub fn reset_iss(&mut self, iss: SeqNum) {
        if self.state == HandshakeState::Closed {
            self.iss = iss;
            self.snd_una = iss;
            self.snd_nxt = iss;
        }
    }

    fn switch_to(&mut self, new_state: HandshakeState) {
        debug!("{} -> {}", self.state, new_state);
        self.state = new_state;
    }

    fn start_user_timeout(&mut self, now: Instant, out: &mut HandshakeOutput) {
        self.started_at = now;
        out.timer = Some(TimerCommand::Arm(self.timeout));
    }

    fn establish(&mut self, out: &mut HandshakeOutput) {
        self.switch_to(HandshakeState::Established);
        out.timer = Some(TimerCommand::Cancel);
        info!("connection established: snd_nxt={}, rcv_nxt={}", self.snd_nxt, self.rcv_nxt);
        out.events.push(ConnectionEvent::Established { snd_nxt: self.snd_nxt, rcv_nxt: self.rcv_nxt });
    }

    fn fail(&mut self, failure: ConnectionFailure, out: &mut HandshakeOutput) {
        warn!("connection failed: {}", failure);
        self.switch_to(HandshakeState::Closed);
        out.timer = Some(TimerCommand::Cancel);
        out.events.push(ConnectionEvent::Failed(failure));
    }

    fn close_completed(&mut self, out: &mut HandshakeOutput) {
        self.switch_to(HandshakeState::Closed);
        out.timer = Some(TimerCommand::Cancel);
        out.events.push(ConnectionEvent::Closed);
    }

    /// active OPEN
    pub fn open(&mut self, now: Instant, out: &mut HandshakeOutput) -> anyhow::Result<()> {
        match self.state {
            HandshakeState::Closed | HandshakeState::Listen => {
                self.snd_una = self.iss;
                self.snd_nxt = self.iss.next();
                out.segments.push(HandshakeSegment::syn(self.iss));
                self.start_user_timeout(now, out);
                self.switch_to(HandshakeState::SynSent);
                Ok(())
            }
            state => bail!("connection is already open ({})", state),
        }
    }

    /// passive OPEN: wait for the peer's SYN
    pub fn listen(&mut self) -> anyhow::Result<()> {
        match self.state {
            HandshakeState::Closed => {
                self.switch_to(HandshakeState::Listen);
                Ok(())
            }
            HandshakeState::Listen => Ok(()),
            state => bail!("connection is already open ({})", state),
        }
    }

    /// Starts the close sequence, or closes immediately if no handshake was completed yet. In
    ///  CLOSE_WAIT, this sends our FIN in reply to the peer's. Calling this on a connection that
    ///  is already closing has no effect.
    pub fn close(&mut self, now: Instant, out: &mut HandshakeOutput) -> anyhow::Result<()> {
        match self.state {
            HandshakeState::Closed => bail!("connection is not open"),
            HandshakeState::Listen | HandshakeState::SynSent => {
                self.close_completed(out);
            }
            HandshakeState::SynReceived | HandshakeState::Established => {
                out.segments.push(HandshakeSegment::fin_ack(self.snd_nxt, self.rcv_nxt));
                self.snd_nxt = self.snd_nxt.next();
                self.start_user_timeout(now, out);
                self.switch_to(HandshakeState::FinWait1);
            }
            HandshakeState::CloseWait => {
                out.segments.push(HandshakeSegment::fin_ack(self.snd_nxt, self.rcv_nxt));
                self.snd_nxt = self.snd_nxt.next();
                self.start_user_timeout(now, out);
                self.switch_to(HandshakeState::LastAck);
            }
            _ => {
                trace!("close requested in {} - already closing", self.state);
            }
        }
        Ok(())
    }

    /// The user timeout expired. This is idempotent: a timeout after the connection was
    ///  established or closed has no effect.
    ///
    /// In CLOSE_WAIT, our data was not acknowledged in time, and the connection is reset.
    pub fn on_timeout(&mut self, now: Instant, out: &mut HandshakeOutput) {
        if self.state == HandshakeState::CloseWait {
            warn!("data was not acknowledged before the close timeout - aborting");
            self.abort(out);
        }
        else if self.is_opening() {
            let elapsed = now.saturating_duration_since(self.started_at);
            self.fail(ConnectionFailure::Timeout { elapsed }, out);
        }
        else if self.is_closing() {
            info!("close sequence timed out in {} - closing", self.state);
            self.close_completed(out);
        }
        else {
            trace!("user timeout in {} - ignoring", self.state);
        }
    }

    /// A data frame arrived while waiting for the final ACK of the handshake. The peer only
    ///  sends data after it considers the connection established, so this proves the ACK was
    ///  lost, and the handshake is completed.
    ///
    /// Returns `true` if the connection became established.
    pub fn implicit_establish(&mut self, out: &mut HandshakeOutput) -> bool {
        if self.state != HandshakeState::SynReceived {
            return false;
        }
        debug!("received data in {} - peer is established, ACK was lost", self.state);
        self.snd_una = self.snd_nxt;
        self.establish(out);
        true
    }

    /// Terminates the connection without a close sequence, notifying the peer with RST.
    pub fn abort(&mut self, out: &mut HandshakeOutput) {
        if self.state == HandshakeState::Closed {
            return;
        }
        if self.state != HandshakeState::Listen {
            out.segments.push(HandshakeSegment::rst(self.snd_nxt));
        }
        info!("aborting connection in {}", self.state);
        self.close_completed(out);
    }

    pub fn on_segment(&mut self, seg: HandshakeSegment, now: Instant, out: &mut HandshakeOutput) {
        trace!("received {:?} in {}", seg, self.state);
        match self.state {
            HandshakeState::Closed => self.on_segment_closed(seg, out),
            HandshakeState::Listen => self.on_segment_listen(seg, now, out),
            HandshakeState::SynSent => self.on_segment_syn_sent(seg, out),
            _ => self.on_segment_synchronized(seg, out),
        }
    }

    fn on_segment_closed(&mut self, seg: HandshakeSegment, out: &mut HandshakeOutput) {
        if seg.is_rst() {
            return;
        }
        let response = if seg.is_ack() {
            HandshakeSegment::rst(seg.ack)
        }
        else {
            HandshakeSegment::new(SeqNum::ZERO, seg.seq.next(), ctl::RST | ctl::ACK)
        };
        debug!("{:?} for a closed connection - replying {:?}", seg, response);
        out.segments.push(response);
    }

    fn on_segment_listen(&mut self, seg: HandshakeSegment, now: Instant, out: &mut HandshakeOutput) {
        if seg.is_rst() {
            return;
        }
        if seg.is_ack() {
            debug!("{:?} while listening acknowledges nothing - replying RST", seg);
            out.segments.push(HandshakeSegment::rst(seg.ack));
            return;
        }
        if seg.is_syn() {
            self.rcv_nxt = seg.seq.next();
            self.snd_una = self.iss;
            self.snd_nxt = self.iss.next();
            out.segments.push(HandshakeSegment::syn_ack(self.iss, self.rcv_nxt));
            self.start_user_timeout(now, out);
            self.switch_to(HandshakeState::SynReceived);
        }
    }

    fn on_segment_syn_sent(&mut self, seg: HandshakeSegment, out: &mut HandshakeOutput) {
        if seg.is_ack() && !seg.ack.is_in_range(self.iss.next(), self.snd_nxt.next()) {
            // the peer acknowledges something we never sent, i.e. it is synchronized to some
            //  other connection
            if !seg.is_rst() {
                debug!("{:?} acknowledges something that was never sent - replying RST", seg);
                out.segments.push(HandshakeSegment::rst(seg.ack));
            }
            return;
        }

        if seg.is_rst() {
            if seg.is_ack() {
                self.fail(ConnectionFailure::Reset, out);
            }
            else {
                debug!("{:?} without acceptable ACK - ignoring", seg);
            }
            return;
        }

        if !seg.is_syn() {
            trace!("{:?} without SYN - ignoring", seg);
            return;
        }

        self.rcv_nxt = seg.seq.next();
        if seg.is_ack() {
            self.snd_una = seg.ack;
        }

        if self.iss.is_before(self.snd_una) {
            out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
            self.establish(out);
        }
        else {
            debug!("simultaneous open");
            out.segments.push(HandshakeSegment::syn_ack(self.iss, self.rcv_nxt));
            self.switch_to(HandshakeState::SynReceived);
        }
    }

    fn on_segment_synchronized(&mut self, seg: HandshakeSegment, out: &mut HandshakeOutput) {
        if seg.is_rst() {
            self.fail(ConnectionFailure::Reset, out);
            return;
        }

        if seg.is_syn() {
            if seg.seq.next() != self.rcv_nxt {
                warn!("received {:?} in {} - peer started a new connection", seg, self.state);
                out.segments.push(HandshakeSegment::new(SeqNum::ZERO, seg.seq.next(), ctl::RST | ctl::ACK));
                self.fail(ConnectionFailure::PeerMismatch, out);
                return;
            }
            if self.state != HandshakeState::SynReceived || !seg.is_ack() {
                // duplicate of a SYN that was processed already
                if seg.is_ack() {
                    out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
                }
                return;
            }
        }

        if seg.is_ack() {
            let acks_everything_sent = seg.ack == self.snd_nxt;
            match self.state {
                HandshakeState::SynReceived => {
                    if !acks_everything_sent {
                        debug!("{:?} is not an acceptable ACK - replying RST", seg);
                        out.segments.push(HandshakeSegment::rst(seg.ack));
                        return;
                    }
                    self.snd_una = seg.ack;
                    if seg.is_syn() {
                        // simultaneous open: the peer's SYN+ACK needs an ACK of its own
                        out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
                    }
                    self.establish(out);
                }
                HandshakeState::FinWait1 if acks_everything_sent => {
                    self.snd_una = seg.ack;
                    self.switch_to(HandshakeState::FinWait2);
                }
                HandshakeState::Closing | HandshakeState::LastAck if acks_everything_sent => {
                    self.snd_una = seg.ack;
                    self.close_completed(out);
                    return;
                }
                _ => {}
            }
        }

        if seg.is_fin() {
            self.on_fin(seg, out);
        }
    }

    fn on_fin(&mut self, seg: HandshakeSegment, out: &mut HandshakeOutput) {
        if seg.seq != self.rcv_nxt {
            if seg.seq.next() == self.rcv_nxt {
                trace!("duplicate FIN - acknowledging again");
                out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
            }
            else {
                debug!("{:?} with unexpected sequence number - ignoring", seg);
            }
            return;
        }

        self.rcv_nxt = self.rcv_nxt.next();

        match self.state {
            HandshakeState::SynReceived | HandshakeState::Established => {
                out.events.push(ConnectionEvent::Closing);
                out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
                // the user timeout bounds the wait for our outstanding data
                out.timer = Some(TimerCommand::Arm(self.timeout));
                self.switch_to(HandshakeState::CloseWait);
            }
            HandshakeState::FinWait1 => {
                out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
                self.switch_to(HandshakeState::Closing);
            }
            HandshakeState::FinWait2 => {
                out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
                self.close_completed(out);
            }
            _ => {
                out.segments.push(HandshakeSegment::ack(self.snd_nxt, self.rcv_nxt));
            }
        }
    }
}
