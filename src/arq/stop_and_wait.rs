use std::collections::VecDeque;
use bytes::Bytes;
use tracing::trace;
use crate::arq::{ArqEngine, ArqOutput, ArqStats, WriteOutcome};
use crate::codec::stop_and_wait_frame::StopAndWaitFrame;
use crate::codec::{DecodeResult, FrameCodec};
use crate::config::StopAndWaitConfig;
use crate::seq::SeqNum;

/// Stop-and-Wait ARQ: at most one data frame is in flight, identified by a single alternating
///  bit.
///
/// The sender is IDLE if `in_flight` is `None`, and AWAITING_ACK otherwise. An ACK echoes the
///  bit of the data frame it acknowledges. The receiver re-acknowledges duplicates with their
///  (old) bit so a sender whose ACK was lost can make progress.
///
/// There is no failure state: the frame is retransmitted until it is acknowledged, bounded only
///  by timeouts on higher layers.
pub struct StopAndWaitEngine {
    config: StopAndWaitConfig,

    /// the bit of the data frame in flight, or of the next data frame if there is none
    local_bit: bool,
    in_flight: Option<Bytes>,
    pending_writes: VecDeque<Bytes>,

    expected_bit: bool,

    stats: ArqStats,
}

impl StopAndWaitEngine {
    pub fn new(config: StopAndWaitConfig) -> StopAndWaitEngine {
        StopAndWaitEngine {
            config,
            local_bit: false,
            in_flight: None,
            pending_writes: VecDeque::new(),
            expected_bit: false,
            stats: ArqStats::default(),
        }
    }

    pub fn local_bit(&self) -> bool {
        self.local_bit
    }

    pub fn expected_bit(&self) -> bool {
        self.expected_bit
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn on_frame(&mut self, frame: StopAndWaitFrame, out: &mut ArqOutput) {
        match frame {
            StopAndWaitFrame::Data { bit, payload } => self.on_data(bit, payload, out),
            StopAndWaitFrame::Ack { bit } => self.on_ack(bit, out),
        }
    }

    fn on_data(&mut self, bit: bool, payload: Bytes, out: &mut ArqOutput) {
        if bit == self.expected_bit {
            trace!("received expected DATA with bit {} - delivering {} bytes", bit, payload.len());
            out.deliver.push(payload);
            self.stats.delivered += 1;
            self.expected_bit = !self.expected_bit;
        }
        else {
            trace!("received duplicate DATA with bit {} - dropping", bit);
            self.stats.discarded += 1;
        }

        // for a duplicate, this re-acknowledges the previous frame
        out.send(&StopAndWaitFrame::Ack { bit });
    }

    fn on_ack(&mut self, bit: bool, out: &mut ArqOutput) {
        if self.in_flight.is_none() || bit != self.local_bit {
            trace!("received stale ACK with bit {} - ignoring", bit);
            self.stats.stale_acks += 1;
            return;
        }

        trace!("received ACK with bit {}", bit);
        self.in_flight = None;
        self.local_bit = !self.local_bit;
        out.cancel_timer();
        out.writable = true;

        if let Some(next) = self.pending_writes.pop_front() {
            self.send_data(next, out);
        }
    }

    fn send_data(&mut self, payload: Bytes, out: &mut ArqOutput) {
        trace!("sending DATA with bit {}", self.local_bit);
        out.send(&StopAndWaitFrame::Data { bit: self.local_bit, payload: payload.clone() });
        out.arm_timer(self.config.retry_timeout);
        self.in_flight = Some(payload);
        self.stats.frames_sent += 1;
    }
}

impl ArqEngine for StopAndWaitEngine {
    fn seed(&mut self, snd_nxt: SeqNum, rcv_nxt: SeqNum) {
        self.local_bit = snd_nxt.to_raw() & 1 == 1;
        self.expected_bit = rcv_nxt.to_raw() & 1 == 1;
    }

    fn write(&mut self, payload: Bytes, out: &mut ArqOutput) -> WriteOutcome {
        if self.in_flight.is_none() {
            self.send_data(payload, out);
            WriteOutcome::Accepted
        }
        else if self.pending_writes.len() < self.config.max_pending_writes {
            self.pending_writes.push_back(payload);
            WriteOutcome::Accepted
        }
        else {
            WriteOutcome::Backpressure(payload)
        }
    }

    fn on_message(&mut self, buf: &Bytes, out: &mut ArqOutput) -> DecodeResult<()> {
        StopAndWaitFrame::deser(buf)
            .map(|frame| self.on_frame(frame, out))
    }

    fn recognizes(&self, buf: &Bytes) -> bool {
        matches!(StopAndWaitFrame::deser(buf), DecodeResult::Decoded(_))
    }

    fn on_retransmit_timeout(&mut self, out: &mut ArqOutput) {
        if let Some(payload) = &self.in_flight {
            trace!("ACK timeout - resending DATA with bit {}", self.local_bit);
            out.send(&StopAndWaitFrame::Data { bit: self.local_bit, payload: payload.clone() });
            out.arm_timer(self.config.retry_timeout);
            self.stats.retransmissions += 1;
        }
    }

    fn has_unacknowledged(&self) -> bool {
        self.in_flight.is_some() || !self.pending_writes.is_empty()
    }

    fn stats(&self) -> ArqStats {
        self.stats
    }
}
