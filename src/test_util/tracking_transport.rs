use std::fmt::Debug;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use crate::codec::{DecodeResult, FrameCodec};
use crate::transport::Transport;

/// A [Transport] that records everything that is sent, for assertions in tests
#[derive(Debug, Default)]
pub struct TrackingTransport {
    tracker: RwLock<Vec<Bytes>>,
}

impl TrackingTransport {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn assert_frame_sent<F: FrameCodec + PartialEq + Debug>(&self, frame: F) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("nothing was sent");
        }

        let actual = lock.remove(0);
        match F::deser(&actual) {
            DecodeResult::Decoded(actual_frame) => assert_eq!(actual_frame, frame),
            _ => panic!("expected frame {:?}, was {:?}", frame, actual),
        }
    }

    pub async fn assert_no_remaining_frames(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected frames: {:?}", lock);
    }

    /// removes and returns everything that was sent and not asserted yet
    pub async fn take_all(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.tracker.write().await)
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        self.tracker.write().await.push(buf);
        Ok(())
    }
}
