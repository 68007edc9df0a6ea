use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::multicast::capacity::QueueCapacityController;
use crate::multicast::flow_control::FlowGate;
use crate::multicast::multicast_error::{Outcome, ProtocolFault};
use crate::multicast::multicast_message::MulticastMessage;
use crate::multicast::Order;


/// The group-wide reordering buffer: releases ordered messages from all senders strictly in the
///  sequence of their global orders.
///
/// A member that joins an existing group does not know where the sequence currently stands. Its
///  queue starts out *unaligned*, buffering whatever arrives, until the coordinator tells it the
///  first order to deliver.
pub struct OrderedQueue {
    /// slot `i` holds the message with order `start_order + i`
    slots: VecDeque<Option<MulticastMessage>>,
    start_order: Option<Order>,
    max_window: u64,
    unaligned: BTreeMap<Order, MulticastMessage>,
    /// positions ahead that no message will arrive for, passed over when delivery reaches them
    gaps: BTreeSet<Order>,
    /// positions that were passed over without a message: one arriving late for such a position
    ///  is delivered right away
    skipped: BTreeSet<Order>,
    ready: Vec<MulticastMessage>,
    capacity: QueueCapacityController,
}

impl OrderedQueue {
    pub fn new(start_order: Option<Order>, max_window: u64, min_lock_capacity: usize, max_unlock_capacity: usize, gate: Arc<FlowGate>) -> OrderedQueue {
        OrderedQueue {
            slots: Default::default(),
            start_order,
            max_window,
            unaligned: Default::default(),
            gaps: Default::default(),
            skipped: Default::default(),
            ready: Vec::new(),
            capacity: QueueCapacityController::new(min_lock_capacity, max_unlock_capacity).with_gate(gate),
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.start_order.is_some()
    }

    /// the next order to be delivered
    pub fn start_order(&self) -> Option<Order> {
        self.start_order
    }

    pub fn capacity(&self) -> usize {
        self.capacity.capacity()
    }

    /// number of buffered messages, not counting those ready for delivery
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count() + self.unaligned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixes the start of the delivery sequence. Messages buffered so far with lower orders
    ///  belong to a part of the sequence this member does not take part in.
    pub fn align(&mut self, start_order: Order) {
        if self.start_order.is_some() {
            return;
        }
        debug!("aligning global delivery sequence at order {}", start_order);
        self.start_order = Some(start_order);

        for (order, message) in std::mem::take(&mut self.unaligned) {
            self.capacity.remove(message.size());
            if order < start_order {
                warn!("discarding message #{} from {:?} with order {} preceding the aligned sequence", message.message_id, message.source, order);
                continue;
            }
            if let Err(e) = self.offer(message) {
                warn!("discarding buffered message while aligning: {}", e);
            }
        }
    }

    pub fn offer(&mut self, message: MulticastMessage) -> Result<Outcome, ProtocolFault> {
        let order = message.order;
        debug_assert!(order > 0, "only messages with an order go through the ordered queue");

        let Some(start_order) = self.start_order else {
            if self.unaligned.contains_key(&order) {
                return Err(ProtocolFault::DuplicateOrder { order });
            }
            self.capacity.add(message.size());
            self.unaligned.insert(order, message);
            return Ok(Outcome::Accepted);
        };

        if order < start_order {
            if self.skipped.remove(&order) {
                debug!("late message for skipped order {} - delivering immediately", order);
                self.ready.push(message);
                return Ok(Outcome::Accepted);
            }
            return Ok(Outcome::StaleIgnored);
        }

        let offset = order - start_order;
        if offset >= self.max_window {
            return Err(ProtocolFault::OrderOutOfWindow { order, window_start: start_order });
        }
        let index = offset as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Default::default);
        }
        if self.slots[index].is_some() {
            return Err(ProtocolFault::DuplicateOrder { order });
        }
        if self.gaps.remove(&order) {
            debug!("message for order {} arrived after all", order);
        }

        trace!("buffering message #{} from {:?} with order {}", message.message_id, message.source, order);
        self.capacity.add(message.size());
        self.slots[index] = Some(message);
        self.drain();
        Ok(Outcome::Accepted)
    }

    fn drain(&mut self) {
        while let Some(start_order) = self.start_order {
            if matches!(self.slots.front(), Some(Some(_))) {
                if let Some(Some(message)) = self.slots.pop_front() {
                    self.capacity.remove(message.size());
                    self.ready.push(message);
                }
            }
            else if self.gaps.remove(&start_order) {
                self.slots.pop_front();
                self.skipped.insert(start_order);
            }
            else {
                break;
            }
            self.start_order = Some(start_order + 1);
        }
    }

    /// messages released for delivery since the previous call, in global order
    pub fn take_deliverable(&mut self) -> Vec<MulticastMessage> {
        std::mem::take(&mut self.ready)
    }

    /// Releases every buffered message regardless of gaps. Returns the number of positions that
    ///  were skipped.
    pub fn flush_messages(&mut self) -> usize {
        let Some(start_order) = self.start_order else {
            let Some(&first_buffered) = self.unaligned.keys().next() else {
                return 0;
            };
            self.align(first_buffered);
            return self.flush_messages();
        };

        let end_order = start_order + self.slots.len() as u64;
        let mut num_skipped = 0;
        for (index, slot) in std::mem::take(&mut self.slots).into_iter().enumerate() {
            match slot {
                Some(message) => {
                    self.capacity.remove(message.size());
                    self.ready.push(message);
                }
                None => {
                    self.skipped.insert(start_order + index as u64);
                    num_skipped += 1;
                }
            }
        }

        self.gaps = self.gaps.split_off(&end_order);
        if num_skipped > 0 {
            warn!("flushing ordered queue skipped {} positions before order {}", num_skipped, end_order);
        }
        self.start_order = Some(end_order);
        self.drain();
        num_skipped
    }

    /// Marks the positions before `end_order` that hold no message and are not `expected` as
    ///  gaps, and delivers up to the first position that still waits for its message. Returns the
    ///  number of positions marked.
    ///
    /// An unaligned queue is aligned at its first buffered message, or at `end_order`.
    pub fn skip_unassigned(&mut self, end_order: Order, expected: impl Fn(Order) -> bool) -> Result<usize, ProtocolFault> {
        let Some(start_order) = self.start_order else {
            let first_buffered = self.unaligned.keys().next().copied();
            let Some(start) = first_buffered.into_iter().chain((end_order > 0).then_some(end_order)).min() else {
                return Ok(0);
            };
            self.align(start);
            return self.skip_unassigned(end_order, expected);
        };

        if end_order <= start_order {
            return Ok(0);
        }
        if end_order - start_order > self.max_window {
            return Err(ProtocolFault::OrderOutOfWindow { order: end_order, window_start: start_order });
        }

        let mut num_marked = 0;
        for order in start_order..end_order {
            let index = (order - start_order) as usize;
            let occupied = matches!(self.slots.get(index), Some(Some(_)));
            if !occupied && !expected(order) && self.gaps.insert(order) {
                num_marked += 1;
            }
        }
        if num_marked > 0 {
            warn!("{} positions before order {} were never assigned to a message that is still around - skipping them", num_marked, end_order);
        }
        self.drain();
        Ok(num_marked)
    }
}
