use std::collections::VecDeque;
use bytes::Bytes;
use tracing::trace;
use crate::arq::{ArqEngine, ArqOutput, TimerCommand, WriteOutcome};
use crate::test_util::fault_injector::{FaultInjector, FaultPattern};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Side {
    A,
    B,
}

/// Connects two [ArqEngine]s through simulated links with deterministic faults, without any
///  I/O or real time.
///
/// Time only advances when nothing is in transit: then held back frames are released, and if
///  there are none, armed retransmission timers fire. This corresponds to a link whose round
///  trip time is shorter than the retransmission timeout.
pub struct ArqPair {
    pub a: Box<dyn ArqEngine>,
    pub b: Box<dyn ArqEngine>,
    a_to_b: FaultInjector,
    b_to_a: FaultInjector,
    in_transit: VecDeque<(Side, Bytes)>,
    timer_armed_a: bool,
    timer_armed_b: bool,
    pub delivered_at_a: Vec<Bytes>,
    pub delivered_at_b: Vec<Bytes>,
    pub num_timeouts: usize,
}

impl ArqPair {
    pub fn new(a: Box<dyn ArqEngine>, b: Box<dyn ArqEngine>, a_to_b: FaultPattern, b_to_a: FaultPattern) -> ArqPair {
        ArqPair {
            a,
            b,
            a_to_b: FaultInjector::new(a_to_b),
            b_to_a: FaultInjector::new(b_to_a),
            in_transit: VecDeque::new(),
            timer_armed_a: false,
            timer_armed_b: false,
            delivered_at_a: Vec::new(),
            delivered_at_b: Vec::new(),
            num_timeouts: 0,
        }
    }

    /// Writes all payloads on side A, making progress on the links whenever A signals
    ///  backpressure.
    ///
    /// Panics if there is no progress within `max_steps`.
    pub fn write_all_a(&mut self, payloads: Vec<Bytes>, max_steps: usize) {
        let mut num_steps = 0;
        for payload in payloads {
            let mut payload = payload;
            loop {
                let mut out = ArqOutput::default();
                let outcome = self.a.write(payload, &mut out);
                self.apply(Side::A, out);
                match outcome {
                    WriteOutcome::Accepted => break,
                    WriteOutcome::Backpressure(p) => {
                        payload = p;
                        num_steps += 1;
                        if num_steps > max_steps || !self.step() {
                            panic!("no progress after {} steps", num_steps);
                        }
                    }
                }
            }
        }
    }

    /// Runs until there are no frames in transit and no timers armed.
    ///
    /// Panics if that does not happen within `max_steps`.
    pub fn run_until_quiet(&mut self, max_steps: usize) {
        let mut num_steps = 0;
        while self.step() {
            num_steps += 1;
            if num_steps > max_steps {
                panic!("not quiet after {} steps", num_steps);
            }
        }
    }

    /// returns `false` if there was nothing to do
    pub fn step(&mut self) -> bool {
        if let Some((to, buf)) = self.in_transit.pop_front() {
            let mut out = ArqOutput::default();
            let _ = self.engine(to).on_message(&buf, &mut out);
            self.apply(to, out);
            return true;
        }

        if let Some(buf) = self.a_to_b.flush() {
            self.in_transit.push_back((Side::B, buf));
            return true;
        }
        if let Some(buf) = self.b_to_a.flush() {
            self.in_transit.push_back((Side::A, buf));
            return true;
        }

        if !self.timer_armed_a && !self.timer_armed_b {
            return false;
        }

        self.num_timeouts += 1;
        for side in [Side::A, Side::B] {
            let armed = match side {
                Side::A => std::mem::replace(&mut self.timer_armed_a, false),
                Side::B => std::mem::replace(&mut self.timer_armed_b, false),
            };
            if armed {
                trace!("retransmission timeout on {:?}", side);
                let mut out = ArqOutput::default();
                self.engine(side).on_retransmit_timeout(&mut out);
                self.apply(side, out);
            }
        }
        true
    }

    fn engine(&mut self, side: Side) -> &mut Box<dyn ArqEngine> {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    fn apply(&mut self, from: Side, out: ArqOutput) {
        let (to, injector) = match from {
            Side::A => (Side::B, &mut self.a_to_b),
            Side::B => (Side::A, &mut self.b_to_a),
        };
        for frame in out.transmit {
            for buf in injector.process(frame) {
                self.in_transit.push_back((to, buf));
            }
        }

        match from {
            Side::A => self.delivered_at_a.extend(out.deliver),
            Side::B => self.delivered_at_b.extend(out.deliver),
        }

        if let Some(timer) = out.timer {
            let armed = timer != TimerCommand::Cancel;
            match from {
                Side::A => self.timer_armed_a = armed,
                Side::B => self.timer_armed_b = armed,
            }
        }
    }
}
