//! The downward interface: the unreliable, message-oriented channel below the reliable
//!  transport sublayer. It may drop, duplicate and reorder messages, but it must not split or
//!  merge them.

pub mod udp;
pub mod end_point;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a single message. An error is not fatal for the connection: the message is
    ///  treated as lost, and the ARQ engine retransmits it.
    async fn send(&self, buf: Bytes) -> anyhow::Result<()>;
}
