use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::node_addr::NodeAddr;
use crate::multicast::capacity::QueueCapacityController;
use crate::multicast::flow_control::FlowGate;
use crate::multicast::multicast_error::{Outcome, ProtocolFault};
use crate::multicast::multicast_message::MulticastMessage;
use crate::multicast::{MessageId, Order};


/// Messages whose completion was established: every live peer acknowledged them.
#[derive(Debug)]
pub struct Completion {
    pub completed_message_id: MessageId,
    /// messages that are now safe to deliver locally (always empty in non-durable mode, where
    ///  messages are delivered locally when they are bundled)
    pub delivered: Vec<MulticastMessage>,
}

/// The local sender's outgoing messages for one group.
///
/// The queue holds messages with ids from `start_message_id` up to the last offered message.
///  Invariant (durable mode):
///
/// ```ascii
/// start_message_id <= last_completed_message_id + 1 <= last_send_message_id + 1 <= next_send_message_id
/// ```
pub struct SendQueue {
    durable: bool,

    queue: VecDeque<MulticastMessage>,
    /// id of the first message in `queue`
    start_message_id: MessageId,
    /// id that is handed out next
    next_send_message_id: MessageId,
    /// the last message that was placed into a bundle
    last_send_message_id: MessageId,
    /// the last message that is known to be acknowledged by all live peers
    last_completed_message_id: MessageId,

    acknowledged_message_ids: BTreeMap<NodeAddr, MessageId>,

    capacity: QueueCapacityController,
    unbundled_capacity: usize,
    /// time at which the oldest unbundled message was offered
    bundle_start_time: Option<Instant>,
}

impl SendQueue {
    pub fn new(durable: bool, min_lock_capacity: usize, max_unlock_capacity: usize, gate: Arc<FlowGate>) -> SendQueue {
        SendQueue {
            durable,
            queue: Default::default(),
            start_message_id: 1,
            next_send_message_id: 1,
            last_send_message_id: 0,
            last_completed_message_id: 0,
            acknowledged_message_ids: Default::default(),
            capacity: QueueCapacityController::new(min_lock_capacity, max_unlock_capacity).with_gate(gate),
            unbundled_capacity: 0,
            bundle_start_time: None,
        }
    }

    pub fn start_message_id(&self) -> MessageId {
        self.start_message_id
    }

    pub fn last_send_message_id(&self) -> MessageId {
        self.last_send_message_id
    }

    pub fn last_completed_message_id(&self) -> MessageId {
        self.last_completed_message_id
    }

    pub fn acknowledged_message_id(&self, peer: &NodeAddr) -> Option<MessageId> {
        self.acknowledged_message_ids.get(peer).copied()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.capacity()
    }

    pub fn unbundled_capacity(&self) -> usize {
        self.unbundled_capacity
    }

    pub fn has_unbundled(&self) -> bool {
        self.last_offered_message_id() > self.last_send_message_id
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn last_offered_message_id(&self) -> MessageId {
        self.start_message_id + self.queue.len() as u64 - 1
    }

    pub fn acquire_message_id(&mut self) -> MessageId {
        let result = self.next_send_message_id;
        self.next_send_message_id += 1;
        result
    }

    /// Appends a message with an id previously returned by [SendQueue::acquire_message_id].
    ///  Messages must be offered in the order of their ids.
    pub fn offer(&mut self, message: MulticastMessage, now: Instant) -> Result<(), ProtocolFault> {
        let expected = self.last_offered_message_id() + 1;
        if message.message_id != expected || message.message_id >= self.next_send_message_id {
            return Err(ProtocolFault::MessageIdOutOfSequence {
                expected,
                offered: message.message_id,
            });
        }

        if !self.has_unbundled() {
            self.bundle_start_time = Some(now);
        }

        trace!("offering message #{} ({} bytes)", message.message_id, message.size());
        self.capacity.add(message.size());
        self.unbundled_capacity += message.size();
        self.queue.push_back(message);
        Ok(())
    }

    pub fn is_bundle_due(&self, now: Instant, max_bundling_period: Duration) -> bool {
        match self.bundle_start_time {
            Some(start) => self.has_unbundled() && now.saturating_duration_since(start) >= max_bundling_period,
            None => false,
        }
    }

    fn unbundled(&mut self) -> impl Iterator<Item=&mut MulticastMessage> {
        let first_unbundled = (self.last_send_message_id + 1 - self.start_message_id) as usize;
        self.queue.iter_mut()
            .skip(first_unbundled)
    }

    /// number of unbundled messages that take part in global ordering and have no order yet
    pub fn num_unbundled_unordered(&mut self, ordering_enabled: bool) -> usize {
        self.unbundled()
            .filter(|m| m.is_ordered(ordering_enabled) && m.order == 0)
            .count()
    }

    /// attaches consecutive orders, starting with `start_order`, to unbundled messages that take
    ///  part in global ordering
    pub fn assign_orders(&mut self, start_order: Order, ordering_enabled: bool) {
        let mut next_order = start_order;
        for message in self.unbundled() {
            if message.is_ordered(ordering_enabled) && message.order == 0 {
                message.order = next_order;
                next_order += 1;
            }
        }
    }

    /// Takes all messages that were offered since the previous bundle. In durable mode, they stay
    ///  in the queue until they are completed; otherwise they are removed, and it is the caller's
    ///  responsibility to deliver them locally.
    pub fn create_bundle(&mut self) -> Vec<MulticastMessage> {
        if !self.has_unbundled() {
            return Vec::new();
        }

        let first_unbundled = (self.last_send_message_id + 1 - self.start_message_id) as usize;
        let result = if self.durable {
            self.queue.range(first_unbundled..)
                .cloned()
                .collect::<Vec<_>>()
        }
        else {
            // fire-and-forget: nothing is retained for retransmission
            debug_assert_eq!(first_unbundled, 0);
            let drained = self.queue.drain(..).collect::<Vec<_>>();
            self.capacity.remove(self.unbundled_capacity);
            self.start_message_id += drained.len() as u64;
            drained
        };

        if let Some(last) = result.last() {
            self.last_send_message_id = last.message_id;
        }
        self.unbundled_capacity = 0;
        self.bundle_start_time = None;

        trace!("bundling {} messages up to #{}", result.len(), self.last_send_message_id);
        result
    }

    pub fn acknowledge(&mut self, peer: NodeAddr, last_received_message_id: MessageId) -> Result<Outcome, ProtocolFault> {
        let Some(previous) = self.acknowledged_message_ids.get_mut(&peer) else {
            debug!("acknowledgement from {:?} which is not a live peer - ignoring", peer);
            return Ok(Outcome::StaleIgnored);
        };

        if last_received_message_id > self.last_send_message_id {
            return Err(ProtocolFault::AcknowledgementBeyondLastSent {
                peer,
                acknowledged: last_received_message_id,
                last_sent: self.last_send_message_id,
            });
        }
        if last_received_message_id <= *previous {
            return Err(ProtocolFault::NonIncreasingAcknowledgement {
                peer,
                previous: *previous,
                acknowledged: last_received_message_id,
            });
        }

        *previous = last_received_message_id;
        Ok(Outcome::Accepted)
    }

    /// Advances the completion watermark to the lowest id acknowledged by all live peers.
    ///  Returns `None` if the watermark did not move.
    pub fn complete(&mut self) -> Option<Completion> {
        let candidate = self.acknowledged_message_ids.values()
            .min()
            .copied()
            .unwrap_or(self.last_send_message_id)
            .min(self.last_send_message_id);

        if candidate <= self.last_completed_message_id {
            return None;
        }
        self.last_completed_message_id = candidate;

        let mut delivered = Vec::new();
        if self.durable {
            while let Some(first) = self.queue.front() {
                if first.message_id > candidate {
                    break;
                }
                if let Some(message) = self.queue.pop_front() {
                    self.capacity.remove(message.size());
                    delivered.push(message);
                }
            }
            self.start_message_id = candidate + 1;
        }

        debug!("completed messages up to #{}", candidate);
        Some(Completion {
            completed_message_id: candidate,
            delivered,
        })
    }

    /// Registers the peers of a new group view. Peers that joined only receive messages bundled
    ///  from now on, so they start out as having acknowledged everything sent so far.
    pub fn set_peers(&mut self, peers: &[NodeAddr]) {
        self.acknowledged_message_ids.retain(|peer, _| peers.contains(peer));
        for &peer in peers {
            self.acknowledged_message_ids.entry(peer)
                .or_insert(self.last_send_message_id);
        }
    }

    /// A failed peer can no longer block completion. The caller is expected to call
    ///  [SendQueue::complete] afterwards.
    pub fn on_member_failed(&mut self, member: NodeAddr) {
        if self.acknowledged_message_ids.remove(&member).is_some() {
            debug!("removed failed member {:?} from acknowledgement tracking", member);
        }
    }
}
