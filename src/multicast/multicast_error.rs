use thiserror::Error;

use crate::messaging::node_addr::NodeAddr;
use crate::multicast::{MessageId, Order};


/// Result of feeding data into one of the queues or protocols that is *not* a bug: data may
///  legitimately be stale or belong to a view that was not adopted yet during reconfiguration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Accepted,
    /// data refers to something that was already processed, completed or discarded
    StaleIgnored,
    /// data belongs to a membership generation that is not adopted yet, it is replayed later
    FutureQueued,
}

/// A protocol invariant was violated. This indicates a bug in a peer or the transport rather
///  than a recoverable condition, and it is treated as fatal by the driver.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProtocolFault {
    #[error("{peer:?} acknowledged message #{acknowledged} after previously acknowledging #{previous}")]
    NonIncreasingAcknowledgement {
        peer: NodeAddr,
        previous: MessageId,
        acknowledged: MessageId,
    },
    #[error("{peer:?} acknowledged message #{acknowledged} but only #{last_sent} was sent")]
    AcknowledgementBeyondLastSent {
        peer: NodeAddr,
        acknowledged: MessageId,
        last_sent: MessageId,
    },
    #[error("message #{message_id} from {sender:?} was received twice")]
    DuplicateMessage {
        sender: NodeAddr,
        message_id: MessageId,
    },
    #[error("message #{message_id} from {sender:?} was assigned an order twice")]
    DuplicateMessageOrder {
        sender: NodeAddr,
        message_id: MessageId,
    },
    #[error("global order {order} was assigned to two messages")]
    DuplicateOrder {
        order: Order,
    },
    #[error("message #{message_id} from {sender:?} is outside the receive window starting at #{window_start}")]
    MessageIdOutOfWindow {
        sender: NodeAddr,
        message_id: MessageId,
        window_start: MessageId,
    },
    #[error("global order {order} is outside the delivery window starting at {window_start}")]
    OrderOutOfWindow {
        order: Order,
        window_start: Order,
    },
    #[error("offered message #{offered} out of sequence, expected #{expected}")]
    MessageIdOutOfSequence {
        expected: MessageId,
        offered: MessageId,
    },
    #[error("attempt to issue orders on a node that is not the active coordinator")]
    NotCoordinator,
}
