use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;
use crate::arq::TimerCommand;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
    /// the user timeout bounding OPEN and CLOSE
    Handshake,
    Retransmit,
}

/// A restartable one-shot timer. When it expires, the timer task posts `make_command(kind,
///  generation)` into its owner's command channel instead of touching any state, so expiry is
///  serialized with all other events.
///
/// Aborting a timer task can race with its message already being queued. Every (re)start and
///  cancel therefore increments the generation, and the owner ignores expiry messages whose
///  generation is not [ConnectionTimer::is_current].
pub struct ConnectionTimer<C: Send + 'static> {
    kind: TimerKind,
    generation: u64,
    handle: Option<JoinHandle<()>>,
    command_sender: mpsc::WeakSender<C>,
    make_command: fn(TimerKind, u64) -> C,
}

impl<C: Send + 'static> ConnectionTimer<C> {
    /// The timer holds only a weak reference to the command channel, so it does not keep its
    ///  owner alive.
    pub fn new(kind: TimerKind, command_sender: &mpsc::Sender<C>, make_command: fn(TimerKind, u64) -> C) -> ConnectionTimer<C> {
        ConnectionTimer {
            kind,
            generation: 0,
            handle: None,
            command_sender: command_sender.downgrade(),
            make_command,
        }
    }

    pub fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Arm(timeout) => self.start(timeout),
            TimerCommand::Cancel => self.cancel(),
        }
    }

    pub fn start(&mut self, timeout: Duration) {
        self.cancel();

        let generation = self.generation;
        let command = (self.make_command)(self.kind, generation);
        let command_sender = self.command_sender.clone();
        let kind = self.kind;

        self.handle = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            trace!("{:?} timer #{} expired", kind, generation);
            // the channel is gone if the connection terminated, and then there is nothing to do
            if let Some(command_sender) = command_sender.upgrade() {
                let _ = command_sender.send(command).await;
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    /// to be called when the expiry message is processed, so the timer is not considered
    ///  running any more
    pub fn expired(&mut self) {
        self.handle = None;
    }
}

impl<C: Send + 'static> Drop for ConnectionTimer<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
