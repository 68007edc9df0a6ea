use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::node_addr::NodeAddr;


/// The point-to-point channel this layer runs on. Implementations are expected to be reliable
///  and FIFO per peer (TCP-like): the multicast protocol relies on bundles from one sender
///  arriving in the order they were sent, and without gaps while the sender is alive.
///
/// Everything above that - bundling, acknowledgement, retransmission after a sender's failure -
///  is the multicast layer's job.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MulticastTransport: Debug + Send + Sync + 'static {
    fn self_addr(&self) -> NodeAddr;

    async fn send_raw(&self, to: NodeAddr, buf: &[u8]) -> anyhow::Result<()>;
}
