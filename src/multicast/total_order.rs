use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::messaging::node_addr::NodeAddr;
use crate::multicast::group_messages::OrderInfo;
use crate::multicast::multicast_error::ProtocolFault;
use crate::multicast::{MessageId, Order};


/// The global sequencer. Every member tracks the highest order it has seen, but only the
///  coordinator hands out orders.
///
/// When the coordinator role moves to this node, it does not issue orders until the end of the
///  flush that moved it: by then, the previous coordinator's assignments have been disseminated
///  and the survivors have reported the highest order they know of. Ordered messages that arrive
///  in the meantime simply wait in their receive queues without an order, and they are picked up
///  once the barrier is lifted.
///
/// Every member also keeps the assignments it learned of, so that assignments a failed
///  coordinator disseminated to only some members can be reconciled during the next flush.
pub struct TotalOrder {
    myself: NodeAddr,
    coordinator: Option<NodeAddr>,
    barrier: bool,
    /// the next order to hand out, or one more than the highest order observed
    next_order: Order,
    /// assignments not broadcast yet
    pending_infos: Vec<OrderInfo>,
    /// assignments known to this node by start order, until every member delivered them
    known_infos: BTreeMap<Order, OrderInfo>,
}

impl TotalOrder {
    pub fn new(myself: NodeAddr) -> TotalOrder {
        TotalOrder {
            myself,
            coordinator: None,
            barrier: false,
            next_order: 1,
            pending_infos: Vec::new(),
            known_infos: Default::default(),
        }
    }

    pub fn coordinator(&self) -> Option<NodeAddr> {
        self.coordinator
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator == Some(self.myself)
    }

    /// the coordinator role is settled and orders may be handed out
    pub fn is_active_coordinator(&self) -> bool {
        self.is_coordinator() && !self.barrier
    }

    pub fn next_order(&self) -> Order {
        self.next_order
    }

    pub fn has_pending_infos(&self) -> bool {
        !self.pending_infos.is_empty()
    }

    /// Hands out `count` contiguous orders, returning the first one.
    pub fn acquire_order(&mut self, count: u32) -> Result<Order, ProtocolFault> {
        if !self.is_active_coordinator() {
            return Err(ProtocolFault::NotCoordinator);
        }

        let result = self.next_order;
        self.next_order = result.saturating_add(count as u64);
        Ok(result)
    }

    /// Assigns orders to a run of a sender's messages. The assignment is remembered for the next
    ///  broadcast.
    pub fn assign_orders(&mut self, sender: NodeAddr, start_message_id: MessageId, count: u32) -> Result<OrderInfo, ProtocolFault> {
        let start_order = self.acquire_order(count)?;
        let info = OrderInfo {
            sender,
            start_message_id,
            start_order,
            count,
        };
        debug!("assigned orders {}..{} to messages #{}.. from {:?}", start_order, info.end_order(), start_message_id, sender);
        self.pending_infos.push(info);
        self.known_infos.insert(start_order, info);
        Ok(info)
    }

    /// Remembers an assignment made by the coordinator.
    pub fn record(&mut self, info: OrderInfo) {
        if info.count == 0 {
            return;
        }
        self.observe_order(info.end_order() - 1);
        self.known_infos.insert(info.start_order, info);
    }

    pub fn known_order_infos(&self) -> Vec<OrderInfo> {
        self.known_infos.values().copied().collect()
    }

    /// Forgets assignments whose orders were delivered by every member.
    pub fn trim_known(&mut self, delivered_order: Order) {
        self.known_infos.retain(|_, info| info.end_order() > delivered_order);
    }

    pub fn take_order_infos(&mut self) -> Vec<OrderInfo> {
        std::mem::take(&mut self.pending_infos)
    }

    /// Registers an order that was assigned elsewhere.
    pub fn observe_order(&mut self, order: Order) {
        if order >= self.next_order {
            self.next_order = order.saturating_add(1);
        }
    }

    pub fn observe_next_order(&mut self, next_order: Order) {
        self.next_order = self.next_order.max(next_order);
    }

    /// Called at the start of a flush with the coordinator of the incoming view. Returns `true`
    ///  if the coordinator changes.
    pub fn start_flush(&mut self, new_coordinator: Option<NodeAddr>) -> bool {
        if new_coordinator == self.coordinator {
            return false;
        }

        info!("coordinator changes from {:?} to {:?}", self.coordinator, new_coordinator);
        let was_coordinator = self.is_coordinator();
        self.coordinator = new_coordinator;
        if self.is_coordinator() {
            // the barrier is lifted in end_flush
            self.barrier = true;
        }
        else if was_coordinator {
            self.barrier = false;
        }
        true
    }

    /// Lifts the coordinator barrier, continuing after the highest order any survivor reported.
    pub fn end_flush(&mut self, reported_next_order: Order) {
        self.observe_next_order(reported_next_order);
        if self.barrier {
            info!("coordinator barrier lifted, next order is {}", self.next_order);
            self.barrier = false;
        }
    }
}
