use bytes::Bytes;
use tracing::trace;

/// Describes deterministic faults for one direction of a simulated link. Frames are counted
///  from 1, and e.g. `drop_every: Some(3)` drops frames 3, 6, 9, ...
///
/// If a frame matches several faults, dropping takes precedence over reordering, which takes
///  precedence over duplication.
///
/// NB: Periodic loss can starve Go-Back-N: if the number of outstanding frames is a multiple of
///      `drop_every`, every retransmission of the window loses the same frame. Tests should use
///      a drop period that is coprime to the window sizes that can occur.
#[derive(Clone, Debug, Default)]
pub struct FaultPattern {
    pub drop_every: Option<usize>,
    pub duplicate_every: Option<usize>,
    /// a matching frame is held back and delivered after the next frame that is passed on
    pub reorder_every: Option<usize>,
}

impl FaultPattern {
    pub fn drop_every(n: usize) -> FaultPattern {
        FaultPattern { drop_every: Some(n), ..Default::default() }
    }

    pub fn duplicate_every(n: usize) -> FaultPattern {
        FaultPattern { duplicate_every: Some(n), ..Default::default() }
    }

    pub fn reorder_every(n: usize) -> FaultPattern {
        FaultPattern { reorder_every: Some(n), ..Default::default() }
    }

    fn matches(every: Option<usize>, counter: usize) -> bool {
        match every {
            Some(n) if n > 0 => counter % n == 0,
            _ => false,
        }
    }
}

/// Applies a [FaultPattern] to a stream of frames
pub struct FaultInjector {
    pattern: FaultPattern,
    counter: usize,
    held_back: Option<Bytes>,
}

impl FaultInjector {
    pub fn new(pattern: FaultPattern) -> FaultInjector {
        FaultInjector {
            pattern,
            counter: 0,
            held_back: None,
        }
    }

    /// Returns the frames to deliver as a consequence of sending `frame`, in delivery order.
    pub fn process(&mut self, frame: Bytes) -> Vec<Bytes> {
        self.counter += 1;
        let counter = self.counter;

        if FaultPattern::matches(self.pattern.drop_every, counter) {
            trace!("dropping frame #{}", counter);
            return Vec::new();
        }

        if FaultPattern::matches(self.pattern.reorder_every, counter) && self.held_back.is_none() {
            trace!("holding back frame #{}", counter);
            self.held_back = Some(frame);
            return Vec::new();
        }

        let mut result = vec![frame.clone()];
        if FaultPattern::matches(self.pattern.duplicate_every, counter) {
            trace!("duplicating frame #{}", counter);
            result.push(frame);
        }
        if let Some(held_back) = self.held_back.take() {
            result.push(held_back);
        }
        result
    }

    /// Releases a held back frame, if any. This simulates a delayed frame eventually arriving
    ///  when no further traffic overtakes it.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.held_back.take()
    }

    pub fn is_holding_back(&self) -> bool {
        self.held_back.is_some()
    }
}
