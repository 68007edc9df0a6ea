use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::messaging::node_addr::NodeAddr;
use crate::multicast::capacity::{CapacityTransition, QueueCapacityController};
use crate::multicast::multicast_error::{Outcome, ProtocolFault};
use crate::multicast::multicast_message::MulticastMessage;
use crate::multicast::{MessageId, Order};


/// Either part of a slot may arrive first: the payload with the sender's bundle, or the order
///  with the coordinator's broadcast.
#[derive(Default)]
struct Slot {
    message: Option<MulticastMessage>,
    order: Option<Order>,
    delivered: bool,
}

/// Messages received from one sender, keyed by the sender's message id.
///
/// Slot `i` holds message id `start_message_id + i`. Messages are released for delivery in id
///  order; with global ordering enabled, an ordered message is only released once its order is
///  known, and it holds back everything after it.
pub struct ReceiveQueue {
    sender: NodeAddr,
    durable: bool,
    ordering_enabled: bool,
    max_window: u64,

    slots: VecDeque<Slot>,
    start_message_id: MessageId,
    /// highest id up to which all payloads are present
    last_received_message_id: MessageId,
    last_acknowledged_message_id: MessageId,
    last_completed_message_id: MessageId,
    last_delivered_message_id: MessageId,

    capacity: QueueCapacityController,
    last_activity: Instant,
}

impl ReceiveQueue {
    pub fn new(
        sender: NodeAddr,
        start_message_id: MessageId,
        durable: bool,
        ordering_enabled: bool,
        max_window: u64,
        min_lock_capacity: usize,
        max_unlock_capacity: usize,
        now: Instant,
    ) -> ReceiveQueue {
        debug_assert!(start_message_id > 0);
        ReceiveQueue {
            sender,
            durable,
            ordering_enabled,
            max_window,
            slots: Default::default(),
            start_message_id,
            last_received_message_id: start_message_id - 1,
            last_acknowledged_message_id: start_message_id - 1,
            last_completed_message_id: start_message_id - 1,
            last_delivered_message_id: start_message_id - 1,
            capacity: QueueCapacityController::new(min_lock_capacity, max_unlock_capacity),
            last_activity: now,
        }
    }

    pub fn sender(&self) -> NodeAddr {
        self.sender
    }

    pub fn start_message_id(&self) -> MessageId {
        self.start_message_id
    }

    pub fn last_received_message_id(&self) -> MessageId {
        self.last_received_message_id
    }

    pub fn last_acknowledged_message_id(&self) -> MessageId {
        self.last_acknowledged_message_id
    }

    pub fn last_completed_message_id(&self) -> MessageId {
        self.last_completed_message_id
    }

    pub fn unacknowledged_count(&self) -> u64 {
        self.last_received_message_id - self.last_acknowledged_message_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity.capacity()
    }

    pub fn poll_capacity_transition(&mut self) -> Option<CapacityTransition> {
        self.capacity.poll_transition()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// the slot for an id at or above the buffer's start, extending the buffer up to it
    fn slot_mut(&mut self, message_id: MessageId) -> Result<&mut Slot, ProtocolFault> {
        let offset = message_id - self.start_message_id;
        if offset >= self.max_window {
            return Err(ProtocolFault::MessageIdOutOfWindow {
                sender: self.sender,
                message_id,
                window_start: self.start_message_id,
            });
        }

        let index = offset as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Default::default);
        }
        Ok(&mut self.slots[index])
    }

    fn slot(&self, message_id: MessageId) -> Option<&Slot> {
        if message_id < self.start_message_id {
            return None;
        }
        self.slots.get((message_id - self.start_message_id) as usize)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.slot(message_id)
            .map(|s| s.message.is_some())
            .unwrap_or(false)
    }

    /// Stores a message received from the sender. Ids below the buffer's start were already
    ///  delivered and discarded, and are ignored.
    pub fn receive(&mut self, message: MulticastMessage, now: Instant) -> Result<Outcome, ProtocolFault> {
        let message_id = message.message_id;
        if message_id < self.start_message_id {
            trace!("message #{} from {:?} is below the receive window - ignoring", message_id, self.sender);
            return Ok(Outcome::StaleIgnored);
        }
        self.last_activity = now;

        let sender = self.sender;
        let size = message.size();
        let slot = self.slot_mut(message_id)?;
        if slot.message.is_some() {
            return Err(ProtocolFault::DuplicateMessage { sender, message_id });
        }

        let mut message = message;
        match (slot.order, message.order) {
            (Some(known), 0) => message.order = known,
            (Some(known), inline) if known != inline => {
                return Err(ProtocolFault::DuplicateMessageOrder { sender, message_id });
            }
            (None, inline) if inline != 0 => slot.order = Some(inline),
            _ => {}
        }
        slot.message = Some(message);

        self.capacity.add(size);
        self.advance_last_received();
        Ok(Outcome::Accepted)
    }

    /// Stores a retransmitted message. Unlike [ReceiveQueue::receive], a message that is already
    ///  present is not a fault: retransmission ranges are computed from acknowledged state that
    ///  may lag behind.
    ///
    /// The copy carries the order its re-sender knew of. If a different order is already
    ///  known here, the known one wins.
    pub fn receive_retransmitted(&mut self, mut message: MulticastMessage, now: Instant) -> Result<Outcome, ProtocolFault> {
        if message.message_id < self.start_message_id || self.contains(message.message_id) {
            return Ok(Outcome::StaleIgnored);
        }
        if let Some(known) = self.slot(message.message_id).and_then(|s| s.order) {
            if message.order != 0 && message.order != known {
                warn!("retransmitted message #{} from {:?} carries order {}, keeping known order {}", message.message_id, self.sender, message.order, known);
            }
            message.order = known;
        }
        self.receive(message, now)
    }

    fn advance_last_received(&mut self) {
        while let Some(slot) = self.slot(self.last_received_message_id + 1) {
            if slot.message.is_none() {
                break;
            }
            self.last_received_message_id += 1;
        }
    }

    /// Attaches a global order to a message, which may not have arrived yet.
    pub fn set_order(&mut self, message_id: MessageId, order: Order) -> Result<Outcome, ProtocolFault> {
        if message_id < self.start_message_id {
            return Ok(Outcome::StaleIgnored);
        }

        let sender = self.sender;
        let slot = self.slot_mut(message_id)?;
        match slot.order {
            Some(known) if known == order => Ok(Outcome::StaleIgnored),
            Some(known) if slot.delivered => {
                warn!("message #{} from {:?} was delivered with order {}, ignoring conflicting order {}", message_id, sender, known, order);
                Ok(Outcome::StaleIgnored)
            }
            Some(_) => Err(ProtocolFault::DuplicateMessageOrder { sender, message_id }),
            None => {
                slot.order = Some(order);
                if let Some(message) = &mut slot.message {
                    message.order = order;
                }
                Ok(Outcome::Accepted)
            }
        }
    }

    /// Releases messages that became deliverable, in id order. Messages that take part in global
    ///  ordering carry their order and must go through the group's ordered queue.
    pub fn take_deliverable(&mut self) -> Vec<MulticastMessage> {
        let mut result = Vec::new();

        while self.last_delivered_message_id < self.last_received_message_id {
            let candidate = self.last_delivered_message_id + 1;
            let ordering_enabled = self.ordering_enabled;
            let index = (candidate - self.start_message_id) as usize;
            let slot = &mut self.slots[index];

            let Some(message) = &slot.message else {
                break;
            };
            if message.is_ordered(ordering_enabled) && slot.order.is_none() {
                trace!("message #{} from {:?} waits for its order", candidate, self.sender);
                break;
            }

            slot.delivered = true;
            self.last_delivered_message_id = candidate;
            if self.durable {
                result.push(message.clone());
            }
            else if let Some(message) = slot.message.take() {
                self.capacity.remove(message.size());
                result.push(message);
            }
        }

        if !self.durable {
            // fire-and-forget: delivered slots are not retained for retransmission
            self.last_completed_message_id = self.last_delivered_message_id;
            self.discard_completed_prefix();
        }
        result
    }

    /// Marks the current contiguous receive position as acknowledged, returning it if it
    ///  advanced since the previous acknowledgement.
    pub fn acknowledge(&mut self) -> Option<MessageId> {
        if self.last_received_message_id > self.last_acknowledged_message_id {
            self.last_acknowledged_message_id = self.last_received_message_id;
            Some(self.last_acknowledged_message_id)
        }
        else {
            None
        }
    }

    /// Applies the sender's completion watermark: every peer has all messages up to
    ///  `completed_message_id`, so they need not be retained for retransmission.
    pub fn complete(&mut self, completed_message_id: MessageId) {
        if completed_message_id <= self.last_completed_message_id {
            return;
        }
        self.last_completed_message_id = completed_message_id;
        self.discard_completed_prefix();
    }

    fn discard_completed_prefix(&mut self) {
        while self.start_message_id <= self.last_completed_message_id {
            match self.slots.front() {
                Some(slot) if slot.delivered || (slot.message.is_none() && slot.order.is_none()) => {}
                Some(_) => break,
                None => {
                    self.start_message_id = self.last_completed_message_id + 1;
                    break;
                }
            }
            if let Some(slot) = self.slots.pop_front() {
                if let Some(message) = slot.message {
                    self.capacity.remove(message.size());
                }
            }
            self.start_message_id += 1;
        }

        self.last_received_message_id = self.last_received_message_id.max(self.start_message_id - 1);
        self.last_delivered_message_id = self.last_delivered_message_id.max(self.start_message_id - 1);
    }

    /// Discards the whole buffer after the sender left the group, including anything that was
    ///  never delivered. Returns the number of messages that were dropped undelivered.
    pub fn complete_all(&mut self) -> usize {
        let undelivered = self.slots.iter()
            .filter(|s| s.message.is_some() && !s.delivered)
            .count();
        if undelivered > 0 {
            warn!("discarding {} undelivered messages from {:?}", undelivered, self.sender);
        }

        let end = self.start_message_id + self.slots.len() as u64;
        self.slots.clear();
        self.capacity.clear();
        self.start_message_id = end;
        self.last_received_message_id = end - 1;
        self.last_acknowledged_message_id = end - 1;
        self.last_completed_message_id = end - 1;
        self.last_delivered_message_id = end - 1;

        debug!("completed all messages from {:?} up to #{}", self.sender, end - 1);
        undelivered
    }

    /// An idle queue holds nothing, owes no acknowledgement and had no traffic for the given
    ///  period.
    pub fn is_idle(&self, now: Instant, max_idle_period: Duration) -> bool {
        self.slots.is_empty()
            && self.last_acknowledged_message_id == self.last_received_message_id
            && now.saturating_duration_since(self.last_activity) >= max_idle_period
    }

    /// Runs of consecutive messages that take part in global ordering but have no order yet, as
    ///  `(start_message_id, count)`.
    pub fn unordered_runs(&self) -> Vec<(MessageId, u32)> {
        let mut result: Vec<(MessageId, u32)> = Vec::new();
        let mut current: Option<(MessageId, u32)> = None;

        for (index, slot) in self.slots.iter().enumerate() {
            let message_id = self.start_message_id + index as u64;
            let needs_order = slot.order.is_none()
                && slot.message.as_ref()
                    .map(|m| m.is_ordered(self.ordering_enabled))
                    .unwrap_or(false);

            if !needs_order {
                result.extend(current.take());
            }
            else if let Some((_, count)) = current.as_mut() {
                *count += 1;
            }
            else {
                current = Some((message_id, 1));
            }
        }
        result.extend(current);
        result
    }

    /// Retained messages in the given id range, for retransmission. Messages that were
    ///  discarded or never received are skipped.
    pub fn messages_in(&self, range: RangeInclusive<MessageId>) -> Vec<MulticastMessage> {
        let first = (*range.start()).max(self.start_message_id);
        let Some(buffer_end) = (self.start_message_id + self.slots.len() as u64).checked_sub(1) else {
            return Vec::new();
        };
        let last = (*range.end()).min(buffer_end);

        (first..=last)
            .filter_map(|id| self.slot(id))
            .filter_map(|slot| slot.message.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicast::multicast_message::MessageFlags;
    use crate::test_util::message::test_message;
    use crate::test_util::node::test_node_addr_from_number;
    use rstest::rstest;

    fn new_queue(durable: bool, ordering_enabled: bool) -> ReceiveQueue {
        ReceiveQueue::new(test_node_addr_from_number(1), 1, durable, ordering_enabled, 1000, 1_000_000, 500_000, Instant::now())
    }

    fn msg(id: MessageId) -> MulticastMessage {
        test_message(1, id, 0, b"abc")
    }

    fn ids(messages: &[MulticastMessage]) -> Vec<MessageId> {
        messages.iter().map(|m| m.message_id).collect()
    }

    #[rstest]
    #[case::in_sequence(vec![1, 2, 3], 3, vec![1, 2, 3])]
    #[case::gap(vec![1, 3, 4], 1, vec![1])]
    #[case::gap_filled(vec![1, 3, 4, 2], 4, vec![1, 2, 3, 4])]
    #[case::reversed(vec![3, 2, 1], 3, vec![1, 2, 3])]
    #[case::first_missing(vec![2, 3], 0, vec![])]
    fn test_receive_fifo(#[case] arrivals: Vec<MessageId>, #[case] expected_last_received: MessageId, #[case] expected_delivered: Vec<MessageId>) {
        let mut queue = new_queue(true, false);
        let mut delivered = Vec::new();
        for id in arrivals {
            assert_eq!(queue.receive(msg(id), Instant::now()), Ok(Outcome::Accepted));
            delivered.extend(queue.take_deliverable());
        }
        assert_eq!(queue.last_received_message_id(), expected_last_received);
        assert_eq!(ids(&delivered), expected_delivered);
    }

    #[test]
    fn test_duplicate_message_is_rejected() {
        let mut queue = new_queue(true, false);
        queue.receive(msg(1), Instant::now()).unwrap();
        assert_eq!(queue.take_deliverable().len(), 1);

        assert!(matches!(queue.receive(msg(1), Instant::now()), Err(ProtocolFault::DuplicateMessage { message_id: 1, .. })));
        assert!(queue.take_deliverable().is_empty());

        assert_eq!(queue.receive_retransmitted(msg(1), Instant::now()), Ok(Outcome::StaleIgnored));
        assert!(queue.take_deliverable().is_empty());
    }

    #[test]
    fn test_stale_message_is_ignored() {
        let mut queue = new_queue(true, false);
        queue.receive(msg(1), Instant::now()).unwrap();
        queue.receive(msg(2), Instant::now()).unwrap();
        queue.take_deliverable();
        queue.complete(2);
        assert_eq!(queue.start_message_id(), 3);

        assert_eq!(queue.receive(msg(1), Instant::now()), Ok(Outcome::StaleIgnored));
        assert_eq!(queue.set_order(2, 5), Ok(Outcome::StaleIgnored));
    }

    #[test]
    fn test_ordered_waits_for_order() {
        let mut queue = new_queue(true, true);
        queue.receive(msg(1), Instant::now()).unwrap();
        let mut unordered = msg(2);
        unordered.flags = MessageFlags::UNORDERED;
        queue.receive(unordered, Instant::now()).unwrap();

        // an ordered message without order holds back everything behind it
        assert!(queue.take_deliverable().is_empty());
        assert_eq!(queue.unordered_runs(), vec![(1, 1)]);

        assert_eq!(queue.set_order(1, 7), Ok(Outcome::Accepted));
        let delivered = queue.take_deliverable();
        assert_eq!(ids(&delivered), vec![1, 2]);
        assert_eq!(delivered[0].order, 7);
        assert_eq!(delivered[1].order, 0);
    }

    #[test]
    fn test_order_before_message() {
        let mut queue = new_queue(true, true);
        assert_eq!(queue.set_order(2, 11), Ok(Outcome::Accepted));
        assert_eq!(queue.set_order(1, 10), Ok(Outcome::Accepted));
        assert_eq!(queue.last_received_message_id(), 0);
        assert!(queue.take_deliverable().is_empty());

        queue.receive(msg(2), Instant::now()).unwrap();
        queue.receive(msg(1), Instant::now()).unwrap();
        let delivered = queue.take_deliverable();
        assert_eq!(delivered.iter().map(|m| m.order).collect::<Vec<_>>(), vec![10, 11]);
    }

    #[rstest]
    #[case::same_order(5, Ok(Outcome::StaleIgnored))]
    #[case::different_order(6, Err(ProtocolFault::DuplicateMessageOrder { sender: test_node_addr_from_number(1), message_id: 1 }))]
    fn test_duplicate_order(#[case] second_order: Order, #[case] expected: Result<Outcome, ProtocolFault>) {
        let mut queue = new_queue(true, true);
        queue.set_order(1, 5).unwrap();
        assert_eq!(queue.set_order(1, second_order), expected);
    }

    #[test]
    fn test_inline_order_conflict() {
        let mut queue = new_queue(true, true);
        queue.set_order(1, 5).unwrap();
        assert!(matches!(queue.receive(test_message(1, 1, 6, b""), Instant::now()), Err(ProtocolFault::DuplicateMessageOrder { .. })));
        assert_eq!(queue.receive(test_message(1, 1, 5, b""), Instant::now()), Ok(Outcome::Accepted));
    }

    #[test]
    fn test_unordered_runs() {
        let mut queue = new_queue(true, true);
        for id in [1, 2, 3, 5, 6] {
            queue.receive(msg(id), Instant::now()).unwrap();
        }
        queue.set_order(2, 1).unwrap();
        assert_eq!(queue.unordered_runs(), vec![(1, 1), (3, 1), (5, 2)]);
    }

    #[test]
    fn test_acknowledge() {
        let mut queue = new_queue(true, false);
        assert_eq!(queue.acknowledge(), None);

        queue.receive(msg(1), Instant::now()).unwrap();
        queue.receive(msg(2), Instant::now()).unwrap();
        queue.receive(msg(4), Instant::now()).unwrap();
        assert_eq!(queue.unacknowledged_count(), 2);
        assert_eq!(queue.acknowledge(), Some(2));
        assert_eq!(queue.acknowledge(), None);

        queue.receive(msg(3), Instant::now()).unwrap();
        assert_eq!(queue.acknowledge(), Some(4));
    }

    #[test]
    fn test_durable_retains_until_complete() {
        let mut queue = new_queue(true, false);
        for id in 1..=4 {
            queue.receive(msg(id), Instant::now()).unwrap();
        }
        assert_eq!(queue.take_deliverable().len(), 4);
        assert_eq!(queue.len(), 4);
        assert_eq!(ids(&queue.messages_in(2..=5)), vec![2, 3, 4]);

        queue.complete(3);
        assert_eq!(queue.start_message_id(), 4);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.capacity(), msg(4).size());
        assert_eq!(ids(&queue.messages_in(1..=5)), vec![4]);

        // completion never goes backwards
        queue.complete(2);
        assert_eq!(queue.last_completed_message_id(), 3);
    }

    #[test]
    fn test_complete_keeps_undelivered() {
        let mut queue = new_queue(true, true);
        queue.receive(msg(1), Instant::now()).unwrap();
        queue.receive(msg(2), Instant::now()).unwrap();
        queue.complete(2);
        assert_eq!(queue.len(), 2);

        queue.set_order(1, 1).unwrap();
        queue.set_order(2, 2).unwrap();
        assert_eq!(queue.take_deliverable().len(), 2);
        queue.complete(2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_non_durable_pops_on_delivery() {
        let mut queue = new_queue(false, false);
        queue.receive(msg(1), Instant::now()).unwrap();
        queue.receive(msg(2), Instant::now()).unwrap();
        assert_eq!(ids(&queue.take_deliverable()), vec![1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 0);
        assert_eq!(queue.start_message_id(), 3);

        assert_eq!(queue.receive(msg(2), Instant::now()), Ok(Outcome::StaleIgnored));
        assert_eq!(queue.acknowledge(), Some(2));
    }

    #[test]
    fn test_complete_all() {
        let mut queue = new_queue(true, true);
        queue.receive(msg(1), Instant::now()).unwrap();
        queue.receive(msg(3), Instant::now()).unwrap();

        assert_eq!(queue.complete_all(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 0);
        assert_eq!(queue.start_message_id(), 4);
        assert_eq!(queue.receive(msg(3), Instant::now()), Ok(Outcome::StaleIgnored));
    }

    #[test]
    fn test_is_idle() {
        let start = Instant::now();
        let mut queue = ReceiveQueue::new(test_node_addr_from_number(1), 1, false, false, 1000, 1000, 500, start);
        let period = Duration::from_secs(10);
        assert!(queue.is_idle(start + period, period));

        queue.receive(msg(1), start + Duration::from_secs(5)).unwrap();
        queue.take_deliverable();
        assert!(!queue.is_idle(start + Duration::from_secs(30), period));

        queue.acknowledge();
        assert!(!queue.is_idle(start + Duration::from_secs(14), period));
        assert!(queue.is_idle(start + Duration::from_secs(15), period));
    }

    #[test]
    fn test_capacity_transitions() {
        let mut queue = ReceiveQueue::new(test_node_addr_from_number(1), 1, true, false, 1000, 50, 20, Instant::now());
        // 19 bytes per message
        for id in 1..=3 {
            queue.receive(msg(id), Instant::now()).unwrap();
        }
        assert_eq!(queue.poll_capacity_transition(), Some(CapacityTransition::Locked));
        assert_eq!(queue.poll_capacity_transition(), None);

        queue.take_deliverable();
        queue.complete(2);
        assert_eq!(queue.poll_capacity_transition(), Some(CapacityTransition::Unlocked));
    }

    #[test]
    fn test_start_above_one() {
        let mut queue = ReceiveQueue::new(test_node_addr_from_number(1), 17, true, false, 1000, 1000, 500, Instant::now());
        assert_eq!(queue.receive(msg(16), Instant::now()), Ok(Outcome::StaleIgnored));
        queue.receive(msg(17), Instant::now()).unwrap();
        assert_eq!(ids(&queue.take_deliverable()), vec![17]);
        assert_eq!(queue.acknowledge(), Some(17));
    }

    #[rstest]
    #[case::far_ahead(1001)]
    #[case::max_id(u64::MAX)]
    fn test_message_id_outside_window(#[case] message_id: MessageId) {
        let mut queue = new_queue(true, true);
        let expected = Err(ProtocolFault::MessageIdOutOfWindow { sender: test_node_addr_from_number(1), message_id, window_start: 1 });
        assert_eq!(queue.receive(msg(message_id), Instant::now()), expected);
        assert_eq!(queue.set_order(message_id, 1), expected);
        assert!(queue.is_empty());

        assert_eq!(queue.receive(msg(1000), Instant::now()), Ok(Outcome::Accepted));
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn test_messages_in_huge_range() {
        let mut queue = new_queue(true, false);
        queue.receive(msg(1), Instant::now()).unwrap();
        queue.receive(msg(2), Instant::now()).unwrap();
        assert_eq!(ids(&queue.messages_in(2..=u64::MAX)), vec![2]);
    }
}
