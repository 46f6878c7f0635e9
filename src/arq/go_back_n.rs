use std::collections::VecDeque;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::arq::{ArqEngine, ArqOutput, ArqStats, WriteOutcome};
use crate::codec::go_back_n_frame::GoBackNFrame;
use crate::codec::{DecodeResult, FrameCodec};
use crate::config::GoBackNConfig;
use crate::seq::SeqNum;

/// Go-Back-N ARQ with cumulative acknowledgements.
///
/// The sender keeps up to `window_size` frames in flight. Frames `base .. next_seq` are sent
///  but not acknowledged, and `outstanding[i]` holds the payload of frame `base + i`. There is
///  a single retransmission timer for the oldest outstanding frame: when it fires, the entire
///  window is sent again in order.
///
/// The receiver accepts only the frame it expects next, discarding everything else. Every data
///  frame is answered with an ACK for the last frame delivered in order.
pub struct GoBackNEngine {
    config: GoBackNConfig,

    base: SeqNum,
    next_seq: SeqNum,
    outstanding: VecDeque<Bytes>,

    expected_seq: SeqNum,

    stats: ArqStats,
}

impl GoBackNEngine {
    pub fn new(config: GoBackNConfig) -> GoBackNEngine {
        GoBackNEngine {
            config,
            base: SeqNum::ZERO,
            next_seq: SeqNum::ZERO,
            outstanding: VecDeque::new(),
            expected_seq: SeqNum::ZERO,
            stats: ArqStats::default(),
        }
    }

    pub fn base(&self) -> SeqNum {
        self.base
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    pub fn expected_seq(&self) -> SeqNum {
        self.expected_seq
    }

    /// number of frames that are sent but not acknowledged
    pub fn in_flight(&self) -> u32 {
        self.next_seq.distance_from(self.base)
    }

    pub fn on_frame(&mut self, frame: GoBackNFrame, out: &mut ArqOutput) {
        match frame {
            GoBackNFrame::Data { seq, payload } => self.on_data(seq, payload, out),
            GoBackNFrame::Ack { seq } => self.on_ack(seq, out),
        }
    }

    fn on_data(&mut self, seq: SeqNum, payload: Bytes, out: &mut ArqOutput) {
        if seq == self.expected_seq {
            trace!("received DATA #{} - delivering {} bytes", seq, payload.len());
            out.deliver.push(payload);
            self.stats.delivered += 1;
            self.expected_seq = self.expected_seq.next();
        }
        else {
            trace!("received DATA #{}, expected #{} - discarding", seq, self.expected_seq);
            self.stats.discarded += 1;
        }

        out.send(&GoBackNFrame::Ack { seq: self.expected_seq.prev() });
    }

    fn on_ack(&mut self, seq: SeqNum, out: &mut ArqOutput) {
        if !seq.is_in_range(self.base, self.next_seq) {
            trace!("received ACK #{} outside of [{}, {}) - ignoring", seq, self.base, self.next_seq);
            self.stats.stale_acks += 1;
            return;
        }

        let num_acked = seq.distance_from(self.base) as usize + 1;
        trace!("received ACK #{}, acknowledging {} frame(s)", seq, num_acked);
        self.outstanding.drain(..num_acked);
        self.base = seq.next();

        if self.outstanding.is_empty() {
            out.cancel_timer();
        }
        else {
            out.arm_timer(self.config.retry_timeout);
        }
        out.writable = true;
    }
}

impl ArqEngine for GoBackNEngine {
    fn seed(&mut self, snd_nxt: SeqNum, rcv_nxt: SeqNum) {
        debug_assert!(self.outstanding.is_empty());
        self.base = snd_nxt;
        self.next_seq = snd_nxt;
        self.expected_seq = rcv_nxt;
    }

    fn write(&mut self, payload: Bytes, out: &mut ArqOutput) -> WriteOutcome {
        if self.in_flight() >= self.config.window_size {
            trace!("window is full - rejecting write");
            return WriteOutcome::Backpressure(payload);
        }

        trace!("sending DATA #{}", self.next_seq);
        out.send(&GoBackNFrame::Data { seq: self.next_seq, payload: payload.clone() });
        if self.outstanding.is_empty() {
            out.arm_timer(self.config.retry_timeout);
        }
        self.outstanding.push_back(payload);
        self.next_seq = self.next_seq.next();
        self.stats.frames_sent += 1;
        WriteOutcome::Accepted
    }

    fn on_message(&mut self, buf: &Bytes, out: &mut ArqOutput) -> DecodeResult<()> {
        GoBackNFrame::deser(buf)
            .map(|frame| self.on_frame(frame, out))
    }

    fn recognizes(&self, buf: &Bytes) -> bool {
        matches!(GoBackNFrame::deser(buf), DecodeResult::Decoded(_))
    }

    fn on_retransmit_timeout(&mut self, out: &mut ArqOutput) {
        if self.outstanding.is_empty() {
            return;
        }

        debug!("ACK timeout - resending {} frame(s) starting at #{}", self.outstanding.len(), self.base);
        let mut seq = self.base;
        for payload in &self.outstanding {
            out.send(&GoBackNFrame::Data { seq, payload: payload.clone() });
            seq = seq.next();
        }
        self.stats.retransmissions += self.outstanding.len() as u64;
        out.arm_timer(self.config.retry_timeout);
    }

    fn has_unacknowledged(&self) -> bool {
        !self.outstanding.is_empty()
    }

    fn stats(&self) -> ArqStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arq::TimerCommand;
    use crate::test_util::arq_pair::ArqPair;
    use crate::test_util::fault_injector::FaultPattern;
    use rstest::rstest;
    use std::time::Duration;

    const RETRY: Duration = Duration::from_millis(20);

    fn engine(window_size: u32) -> GoBackNEngine {
        GoBackNEngine::new(GoBackNConfig {
            window_size,
            retry_timeout: RETRY,
        })
    }

    fn data(seq: u32, payload: &'static [u8]) -> Bytes {
        GoBackNFrame::Data { seq: SeqNum::from_raw(seq), payload: Bytes::from_static(payload) }.encode()
    }

    fn ack(seq: u32) -> Bytes {
        GoBackNFrame::Ack { seq: SeqNum::from_raw(seq) }.encode()
    }

    #[test]
    fn test_window_bound() {
        let mut engine = engine(3);
        let mut out = ArqOutput::default();

        for _ in 0..3 {
            assert_eq!(engine.write(Bytes::from_static(b"x"), &mut out), WriteOutcome::Accepted);
        }
        assert_eq!(engine.write(Bytes::from_static(b"y"), &mut out), WriteOutcome::Backpressure(Bytes::from_static(b"y")));
        assert_eq!(engine.in_flight(), 3);
        assert_eq!(out.transmit, vec![data(0, b"x"), data(1, b"x"), data(2, b"x")]);

        let mut out = ArqOutput::default();
        let _ = engine.on_message(&ack(0), &mut out);
        assert!(out.writable);
        assert_eq!(out.timer, Some(TimerCommand::Arm(RETRY)));
        assert_eq!(engine.in_flight(), 2);
        assert_eq!(engine.write(Bytes::from_static(b"y"), &mut out), WriteOutcome::Accepted);
        assert_eq!(out.transmit, vec![data(3, b"y")]);
    }

    #[test]
    fn test_timer_is_armed_only_for_first_outstanding_frame() {
        let mut engine = engine(8);

        let mut out = ArqOutput::default();
        let _ = engine.write(Bytes::from_static(b"a"), &mut out);
        assert_eq!(out.timer, Some(TimerCommand::Arm(RETRY)));

        let mut out = ArqOutput::default();
        let _ = engine.write(Bytes::from_static(b"b"), &mut out);
        assert_eq!(out.timer, None);
    }

    #[test]
    fn test_cumulative_ack() {
        let mut engine = engine(8);
        let mut out = ArqOutput::default();
        for _ in 0..5 {
            let _ = engine.write(Bytes::from_static(b"x"), &mut out);
        }

        let mut out = ArqOutput::default();
        let _ = engine.on_message(&ack(3), &mut out);
        assert_eq!(engine.base(), SeqNum::from_raw(4));
        assert_eq!(engine.in_flight(), 1);
        assert_eq!(out.timer, Some(TimerCommand::Arm(RETRY)));

        let mut out = ArqOutput::default();
        let _ = engine.on_message(&ack(4), &mut out);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(out.timer, Some(TimerCommand::Cancel));
        assert!(!engine.has_unacknowledged());
    }

    #[rstest]
    #[case::before_window(u32::MAX)]
    #[case::duplicate(0)]
    #[case::not_sent_yet(2)]
    #[case::far_away(1000)]
    fn test_stale_ack_is_ignored(#[case] ack_seq: u32) {
        let mut engine = engine(8);
        let mut out = ArqOutput::default();
        let _ = engine.write(Bytes::from_static(b"a"), &mut out);
        let _ = engine.write(Bytes::from_static(b"b"), &mut out);
        let _ = engine.on_message(&ack(0), &mut out);

        let mut out = ArqOutput::default();
        let _ = engine.on_message(&ack(ack_seq), &mut out);
        assert_eq!(engine.base(), SeqNum::from_raw(1));
        assert_eq!(engine.in_flight(), 1);
        assert!(out.timer.is_none());
        assert!(!out.writable);
        assert_eq!(engine.stats().stale_acks, 1);
    }

    #[test]
    fn test_timeout_resends_entire_window_in_order() {
        let mut engine = engine(8);
        let mut out = ArqOutput::default();
        let _ = engine.write(Bytes::from_static(b"a"), &mut out);
        let _ = engine.write(Bytes::from_static(b"b"), &mut out);
        let _ = engine.write(Bytes::from_static(b"c"), &mut out);
        let _ = engine.on_message(&ack(0), &mut out);

        let mut out = ArqOutput::default();
        engine.on_retransmit_timeout(&mut out);
        assert_eq!(out.transmit, vec![data(1, b"b"), data(2, b"c")]);
        assert_eq!(out.timer, Some(TimerCommand::Arm(RETRY)));
        assert_eq!(engine.stats().retransmissions, 2);
    }

    #[test]
    fn test_receiver_discards_out_of_order_and_reacks_last_in_order() {
        let mut engine = engine(8);
        engine.seed(SeqNum::ZERO, SeqNum::from_raw(10));

        let mut out = ArqOutput::default();
        let _ = engine.on_message(&data(11, b"early"), &mut out);
        assert!(out.deliver.is_empty());
        assert_eq!(out.transmit, vec![ack(9)]);

        let mut out = ArqOutput::default();
        let _ = engine.on_message(&data(10, b"a"), &mut out);
        let _ = engine.on_message(&data(11, b"b"), &mut out);
        let _ = engine.on_message(&data(10, b"a"), &mut out);
        assert_eq!(out.deliver, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(out.transmit, vec![ack(10), ack(11), ack(11)]);
        assert_eq!(engine.expected_seq(), SeqNum::from_raw(12));
        assert_eq!(engine.stats().discarded, 2);
    }

    #[test]
    fn test_sequence_numbers_wrap_around() {
        let mut sender = engine(4);
        sender.seed(SeqNum::from_raw(u32::MAX - 1), SeqNum::ZERO);

        let mut out = ArqOutput::default();
        for _ in 0..4 {
            assert_eq!(sender.write(Bytes::from_static(b"w"), &mut out), WriteOutcome::Accepted);
        }
        assert_eq!(out.transmit, vec![data(u32::MAX - 1, b"w"), data(u32::MAX, b"w"), data(0, b"w"), data(1, b"w")]);

        let mut out = ArqOutput::default();
        let _ = sender.on_message(&ack(0), &mut out);
        assert_eq!(sender.base(), SeqNum::from_raw(1));
        assert_eq!(sender.in_flight(), 1);

        let mut receiver = engine(4);
        receiver.seed(SeqNum::ZERO, SeqNum::from_raw(u32::MAX));
        let mut out = ArqOutput::default();
        let _ = receiver.on_message(&data(u32::MAX, b"1"), &mut out);
        let _ = receiver.on_message(&data(0, b"2"), &mut out);
        assert_eq!(out.deliver.len(), 2);
        assert_eq!(out.transmit, vec![ack(u32::MAX), ack(0)]);
    }

    #[test]
    fn test_pass_through() {
        let mut engine = engine(4);
        let mut out = ArqOutput::default();
        let foreign = Bytes::from_static(b"hello, world");
        assert_eq!(engine.on_message(&foreign, &mut out), DecodeResult::PassThrough(foreign.clone()));
        assert!(out.transmit.is_empty());
    }

    #[rstest]
    #[case::data(data(7, b"x"), true)]
    #[case::ack(ack(7), true)]
    #[case::truncated_magic(Bytes::from_static(&[0xdb, 0x1e, 0x6b, 0x01, 0]), false)]
    #[case::foreign(Bytes::from_static(b"hello, world"), false)]
    fn test_recognizes_only_complete_frames(#[case] buf: Bytes, #[case] expected: bool) {
        assert_eq!(engine(4).recognizes(&buf), expected);
    }

    #[rstest]
    #[case::lossless(1, FaultPattern::default(), FaultPattern::default())]
    #[case::drop_every_third(1, FaultPattern::drop_every(3), FaultPattern::drop_every(3))]
    #[case::drop_every_third_window_2(2, FaultPattern::drop_every(3), FaultPattern::drop_every(3))]
    #[case::drop_every_fifth_window_4(4, FaultPattern::drop_every(5), FaultPattern::drop_every(5))]
    #[case::drop_every_second(1, FaultPattern::drop_every(2), FaultPattern::drop_every(2))]
    #[case::duplicates(4, FaultPattern::duplicate_every(2), FaultPattern::duplicate_every(2))]
    #[case::reordering(4, FaultPattern::reorder_every(3), FaultPattern::reorder_every(2))]
    #[case::everything(5, FaultPattern { drop_every: Some(5), duplicate_every: Some(3), reorder_every: Some(4) }, FaultPattern::drop_every(4))]
    fn test_ordered_delivery_over_faulty_channel(#[case] window_size: u32, #[case] a_to_b: FaultPattern, #[case] b_to_a: FaultPattern) {
        let payloads = (0..5u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>();

        let mut pair = ArqPair::new(Box::new(engine(window_size)), Box::new(engine(window_size)), a_to_b, b_to_a);
        pair.write_all_a(payloads.clone(), 1000);
        pair.run_until_quiet(1000);

        assert_eq!(pair.delivered_at_b, payloads);
        assert!(pair.a.stats().retransmissions <= 10 * payloads.len() as u64 * window_size as u64);
        assert!(!pair.a.has_unacknowledged());
    }
}
