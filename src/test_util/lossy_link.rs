use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;
use crate::connection::Connection;
use crate::test_util::fault_injector::{FaultInjector, FaultPattern};
use crate::transport::Transport;

/// One direction of a simulated link between two connections in the same process. Messages
///  pass through a [FaultInjector] and arrive at an unbounded channel.
pub struct LossyLink {
    injector: Arc<Mutex<FaultInjector>>,
    sender: mpsc::UnboundedSender<Bytes>,
    /// a held back message is delivered after this delay if no other message overtakes it
    hold_back_delay: Duration,
}

impl LossyLink {
    pub fn new(pattern: FaultPattern) -> (Arc<LossyLink>, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let link = LossyLink {
            injector: Arc::new(Mutex::new(FaultInjector::new(pattern))),
            sender,
            hold_back_delay: Duration::from_millis(20),
        };
        (Arc::new(link), receiver)
    }

    /// Spawns a task passing everything that arrives at `receiver` to `connection`
    pub fn forward_to(mut receiver: mpsc::UnboundedReceiver<Bytes>, connection: Connection) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(buf) = receiver.recv().await {
                if connection.on_bytes(buf).await.is_err() {
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl Transport for LossyLink {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        let mut injector = self.injector.lock().await;
        for frame in injector.process(buf) {
            // the receiving side may be gone, which is just another lost message
            let _ = self.sender.send(frame);
        }

        if injector.is_holding_back() {
            let injector = self.injector.clone();
            let sender = self.sender.clone();
            let delay = self.hold_back_delay;
            tokio::spawn(async move {
                time::sleep(delay).await;
                if let Some(frame) = injector.lock().await.flush() {
                    trace!("releasing held back message");
                    let _ = sender.send(frame);
                }
            });
        }
        Ok(())
    }
}
