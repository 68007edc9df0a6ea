use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::messaging::node_addr::NodeAddr;
use crate::messaging::transport::MulticastTransport;
use crate::multicast::group_messages::{GroupFrame, GroupMessage};


/// A [MulticastTransport] that does not send anything but records the frames passed to it.
#[derive(Debug)]
pub struct TrackingMockTransport {
    myself: NodeAddr,
    tracker: Arc<RwLock<Vec<(NodeAddr, GroupFrame)>>>,
}
impl TrackingMockTransport {
    pub fn new(myself: NodeAddr) -> Self {
        TrackingMockTransport {
            myself,
            tracker: Default::default(),
        }
    }

    /// removes and returns all frames recorded so far
    pub async fn take_sent(&self) -> Vec<(NodeAddr, GroupFrame)> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    pub async fn assert_message_sent(&self, to: NodeAddr, message: GroupMessage) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent");
        }

        let (actual_to, actual_frame) = lock.remove(0);
        assert_eq!(actual_to, to);
        assert_eq!(actual_frame.message, message);
    }

    pub async fn assert_no_remaining_messages(&self) {
        assert!(
            self.tracker.read().await
                .is_empty()
        );
    }
}

#[async_trait]
impl MulticastTransport for TrackingMockTransport {
    fn self_addr(&self) -> NodeAddr {
        self.myself
    }

    async fn send_raw(&self, to: NodeAddr, buf: &[u8]) -> anyhow::Result<()> {
        let frame = GroupFrame::deser(buf)?;
        self.tracker.write().await.push((to, frame));
        Ok(())
    }
}
