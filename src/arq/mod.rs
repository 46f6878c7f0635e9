//! Automatic-Repeat-reQuest engines: they turn an unreliable, unordered, duplicating message
//!  channel into an ordered, duplicate-free one by acknowledging frames and retransmitting
//!  unacknowledged frames on timeout.
//!
//! The engines do no I/O and own no timers. Each call gets an [ArqOutput] to which it adds the
//!  frames to transmit, the payloads to deliver to the application, and how the (single)
//!  retransmission timer should change. This keeps all engine state owned by one connection
//!  actor, which serializes application writes, inbound frames and timer expiry.

pub mod stop_and_wait;
pub mod go_back_n;

use std::time::Duration;
use bytes::Bytes;
use crate::codec::{DecodeResult, FrameCodec};
use crate::config::ArqConfig;
use crate::seq::SeqNum;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerCommand {
    /// (re)start the retransmission timer, replacing a running one
    Arm(Duration),
    Cancel,
}

#[derive(Default, Debug)]
pub struct ArqOutput {
    /// encoded frames, to be sent in this order
    pub transmit: Vec<Bytes>,
    /// application payloads, in order
    pub deliver: Vec<Bytes>,
    /// the last timer command issued during the call, if any
    pub timer: Option<TimerCommand>,
    /// set if capacity for new writes became available
    pub writable: bool,
}

impl ArqOutput {
    pub fn send(&mut self, frame: &impl FrameCodec) {
        self.transmit.push(frame.encode());
    }

    pub fn arm_timer(&mut self, timeout: Duration) {
        self.timer = Some(TimerCommand::Arm(timeout));
    }

    pub fn cancel_timer(&mut self) {
        self.timer = Some(TimerCommand::Cancel);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// There is no room for the write right now. The payload is handed back, and the caller
    ///  should retry after some frames were acknowledged.
    Backpressure(Bytes),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArqStats {
    /// data frames sent for the first time
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub delivered: u64,
    /// duplicate or out-of-order data frames that were not delivered
    pub discarded: u64,
    /// acks that acknowledged nothing new
    pub stale_acks: u64,
}

pub trait ArqEngine: Send + Sync + 'static {
    /// Initializes sequence numbering from the values negotiated by the handshake: `snd_nxt` is
    ///  the number of the first frame this side sends, `rcv_nxt` the number of the first frame
    ///  it expects from the peer.
    fn seed(&mut self, snd_nxt: SeqNum, rcv_nxt: SeqNum);

    fn write(&mut self, payload: Bytes, out: &mut ArqOutput) -> WriteOutcome;

    /// Handles an inbound message. Messages that are not frames of this engine's protocol are
    ///  handed back as [DecodeResult::PassThrough].
    fn on_message(&mut self, buf: &Bytes, out: &mut ArqOutput) -> DecodeResult<()>;

    /// `true` if `buf` is a complete frame of this engine's protocol, without processing it
    fn recognizes(&self, buf: &Bytes) -> bool;

    fn on_retransmit_timeout(&mut self, out: &mut ArqOutput);

    /// `true` if there is data that was written but is not acknowledged yet
    fn has_unacknowledged(&self) -> bool;

    fn stats(&self) -> ArqStats;
}

pub fn new_arq_engine(config: &ArqConfig) -> Box<dyn ArqEngine> {
    match config {
        ArqConfig::StopAndWait(cfg) => Box::new(stop_and_wait::StopAndWaitEngine::new(cfg.clone())),
        ArqConfig::GoBackN(cfg) => Box::new(go_back_n::GoBackNEngine::new(cfg.clone())),
    }
}
