use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::membership::{FailureDetector, GroupView, MembershipGeneration};
use crate::messaging::node_addr::NodeAddr;
use crate::multicast::capacity::CapacityTransition;
use crate::multicast::delivery::DeliveryListeners;
use crate::multicast::flow_control::{FlowControl, FlowGate};
use crate::multicast::group_messages::{AcknowledgeData, BundleData, CompleteData, ExchangeData, GroupFrame, GroupMessage, MissingMessagesInfo, OrderInfo, RetransmitData, TotalOrderData};
use crate::multicast::multicast_config::MulticastConfig;
use crate::multicast::multicast_error::{Outcome, ProtocolFault};
use crate::multicast::multicast_message::{deser_bundle_payload, ser_bundle_payload, MessageFlags, MulticastMessage};
use crate::multicast::ordered_queue::OrderedQueue;
use crate::multicast::receive_queue::ReceiveQueue;
use crate::multicast::retransmit::{MessageRetransmit, Resend};
use crate::multicast::send_queue::SendQueue;
use crate::multicast::total_order::TotalOrder;
use crate::multicast::{MessageId, Order, Outbox};


/// Membership related state of a group channel: the adopted view, the view a running flush
///  moves to, and messages that arrived for a view that is not adopted yet.
#[derive(Default)]
pub struct GroupChannelState {
    view: Option<GroupView>,
    pending_view: Option<GroupView>,
    coordinator_changed: bool,
    bundling_suspended: bool,
    future_messages: BTreeMap<MembershipGeneration, Vec<(NodeAddr, GroupMessage)>>,
}

impl GroupChannelState {
    pub fn view(&self) -> Option<&GroupView> {
        self.view.as_ref()
    }

    pub fn generation(&self) -> Option<MembershipGeneration> {
        self.view.as_ref().map(|v| v.generation)
    }

    pub fn is_flushing(&self) -> bool {
        self.pending_view.is_some()
    }

    pub fn num_future_messages(&self) -> usize {
        self.future_messages.values().map(|v| v.len()).sum()
    }

    fn peers(&self, myself: NodeAddr) -> Vec<NodeAddr> {
        self.view.iter()
            .flat_map(|v| v.peers(myself))
            .collect()
    }
}

/// The multicast protocol of one node for one group. It owns all queues and sub-protocols and
///  is driven by a single processing loop: application sends, inbound frames, timer ticks,
///  failure notifications and the flush callbacks of the membership service.
///
/// Operations never block and never send anything themselves. Outgoing frames are collected and
///  retrieved with [MulticastProtocol::take_frames]; each frame is tagged with the generation
///  that was current when it was produced.
pub struct MulticastProtocol {
    myself: NodeAddr,
    config: MulticastConfig,
    failure_detector: Arc<dyn FailureDetector>,
    listeners: Arc<DeliveryListeners>,
    gate: Arc<FlowGate>,

    channel: GroupChannelState,

    send_queue: SendQueue,
    /// includes a queue for this node's own messages, which are delivered through it
    receive_queues: BTreeMap<NodeAddr, ReceiveQueue>,
    /// last received message id of senders whose idle queue was discarded
    forgotten_senders: FxHashMap<NodeAddr, MessageId>,
    /// order assignments for senders this node has no queue for yet
    pending_orders: FxHashMap<NodeAddr, Vec<OrderInfo>>,
    ordered_queue: OrderedQueue,
    total_order: TotalOrder,
    retransmit: MessageRetransmit,
    flow_control: FlowControl,

    outbox: Outbox,
    frames: Vec<(NodeAddr, GroupFrame)>,

    announced_completed_message_id: MessageId,
    last_acknowledge_sweep: Instant,
    last_order_broadcast: Instant,
}

impl MulticastProtocol {
    /// Fails if the configuration is inconsistent.
    pub fn new(
        myself: NodeAddr,
        config: MulticastConfig,
        failure_detector: Arc<dyn FailureDetector>,
        listeners: Arc<DeliveryListeners>,
        now: Instant,
    ) -> anyhow::Result<MulticastProtocol> {
        config.validate()?;

        let gate = Arc::new(FlowGate::new());
        let mut flow_control = FlowControl::new();
        flow_control.register_gate(config.group, gate.clone());

        let mut receive_queues = BTreeMap::new();
        receive_queues.insert(myself, Self::new_receive_queue(&config, myself, 1, now));

        Ok(MulticastProtocol {
            myself,
            failure_detector,
            listeners,
            channel: Default::default(),
            send_queue: SendQueue::new(config.durable, config.min_lock_queue_capacity, config.max_unlock_queue_capacity, gate.clone()),
            receive_queues,
            forgotten_senders: Default::default(),
            pending_orders: Default::default(),
            ordered_queue: OrderedQueue::new(None, config.max_receive_window, config.min_lock_queue_capacity, config.max_unlock_queue_capacity, gate.clone()),
            total_order: TotalOrder::new(myself),
            retransmit: MessageRetransmit::new(myself),
            flow_control,
            outbox: Vec::new(),
            frames: Vec::new(),
            announced_completed_message_id: 0,
            last_acknowledge_sweep: now,
            last_order_broadcast: now,
            gate,
            config,
        })
    }

    fn new_receive_queue(config: &MulticastConfig, sender: NodeAddr, start_message_id: MessageId, now: Instant) -> ReceiveQueue {
        ReceiveQueue::new(
            sender,
            start_message_id,
            config.durable,
            config.ordered,
            config.max_receive_window,
            config.min_lock_queue_capacity,
            config.max_unlock_queue_capacity,
            now,
        )
    }

    pub fn myself(&self) -> NodeAddr {
        self.myself
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    /// the gate local producers wait on while this group's flow is locked
    pub fn gate(&self) -> Arc<FlowGate> {
        self.gate.clone()
    }

    pub fn channel(&self) -> &GroupChannelState {
        &self.channel
    }

    pub fn send_queue(&self) -> &SendQueue {
        &self.send_queue
    }

    pub fn receive_queue(&self, sender: &NodeAddr) -> Option<&ReceiveQueue> {
        self.receive_queues.get(sender)
    }

    pub fn total_order(&self) -> &TotalOrder {
        &self.total_order
    }

    pub fn ordered_queue(&self) -> &OrderedQueue {
        &self.ordered_queue
    }

    pub fn take_frames(&mut self) -> Vec<(NodeAddr, GroupFrame)> {
        std::mem::take(&mut self.frames)
    }

    fn seal_outbox(&mut self) {
        let generation = self.channel.generation().unwrap_or(0);
        for (to, message) in self.outbox.drain(..) {
            self.frames.push((to, GroupFrame {
                group: self.config.group,
                generation,
                message,
            }));
        }
    }

    /// Offers an application message. It is sent with the next bundle, which is created right
    ///  away if the message is urgent or large, or if enough data accumulated.
    pub fn send(&mut self, payload: Bytes, flags: MessageFlags, now: Instant) -> Result<MessageId, ProtocolFault> {
        let mut message = MulticastMessage::new(self.myself, self.config.group, flags, payload);
        message.message_id = self.send_queue.acquire_message_id();

        let message_id = message.message_id;
        let urgent = message.is_no_delay() || message.size() >= self.config.max_bundling_message_size;
        self.send_queue.offer(message, now)?;

        if urgent || self.send_queue.unbundled_capacity() >= self.config.max_bundle_size {
            self.create_bundle(now)?;
        }
        self.seal_outbox();
        Ok(message_id)
    }

    fn create_bundle(&mut self, now: Instant) -> Result<(), ProtocolFault> {
        if self.channel.view.is_none() || self.channel.bundling_suspended || !self.send_queue.has_unbundled() {
            return Ok(());
        }

        if self.config.ordered && self.total_order.is_active_coordinator() {
            let count = self.send_queue.num_unbundled_unordered(true);
            if count > 0 {
                let start_order = self.total_order.acquire_order(count as u32)?;
                self.send_queue.assign_orders(start_order, true);
            }
        }

        let messages = self.send_queue.create_bundle();
        for message in messages.iter().filter(|m| m.order != 0) {
            self.total_order.record(OrderInfo {
                sender: self.myself,
                start_message_id: message.message_id,
                start_order: message.order,
                count: 1,
            });
        }
        let payload = ser_bundle_payload(messages.iter());
        let completed_message_id = self.send_queue.last_completed_message_id();
        trace!("sending bundle of {} messages ({} bytes)", messages.len(), payload.len());

        for peer in self.channel.peers(self.myself) {
            let acknowledge = self.receive_queues.get_mut(&peer)
                .and_then(|q| q.acknowledge())
                .map(|id| AcknowledgeData {
                    last_received_message_id: id,
                    standalone: false,
                });
            self.outbox.push((peer, GroupMessage::Bundle(BundleData {
                completed_message_id,
                acknowledge,
                payload: payload.clone(),
            })));
        }
        self.announced_completed_message_id = completed_message_id;

        if !self.config.durable {
            self.deliver_own(messages, now)?;
        }
        self.try_complete(now)
    }

    fn try_complete(&mut self, now: Instant) -> Result<(), ProtocolFault> {
        if let Some(completion) = self.send_queue.complete() {
            self.deliver_own(completion.delivered, now)?;
        }
        Ok(())
    }

    fn deliver_own(&mut self, messages: Vec<MulticastMessage>, now: Instant) -> Result<(), ProtocolFault> {
        if messages.is_empty() {
            return Ok(());
        }
        if let Some(queue) = self.receive_queues.get_mut(&self.myself) {
            for message in messages {
                queue.receive(message, now)?;
            }
        }
        // own messages bundled before this node became coordinator
        self.assign_missing_orders(self.myself)?;
        self.deliver_from(self.myself)
    }

    /// Passes everything a sender's queue released on to the application, routing ordered
    ///  messages through the ordered queue.
    fn deliver_from(&mut self, sender: NodeAddr) -> Result<(), ProtocolFault> {
        let Some(queue) = self.receive_queues.get_mut(&sender) else {
            return Ok(());
        };
        let messages = queue.take_deliverable();
        if sender == self.myself && self.config.durable {
            queue.complete(self.send_queue.last_completed_message_id());
        }

        for message in messages {
            if message.is_ordered(self.config.ordered) {
                let (message_id, order) = (message.message_id, message.order);
                if self.ordered_queue.offer(message)? == Outcome::StaleIgnored {
                    warn!("message #{} from {:?} has order {} which was already passed - dropping it", message_id, sender, order);
                }
            }
            else {
                // keeps the sender's own sequence where the global order allows it
                self.deliver_ordered();
                self.listeners.deliver(&message);
            }
        }
        self.deliver_ordered();
        self.update_flow_control(sender);
        Ok(())
    }

    fn deliver_ordered(&mut self) {
        for message in self.ordered_queue.take_deliverable() {
            self.listeners.deliver(&message);
        }
    }

    fn update_flow_control(&mut self, sender: NodeAddr) {
        let Some(queue) = self.receive_queues.get_mut(&sender) else {
            return;
        };
        let transition = queue.poll_capacity_transition();
        if sender == self.myself {
            // own messages are accounted for in the send queue
            return;
        }
        match transition {
            Some(CapacityTransition::Locked) => self.flow_control.lock_flow(sender, self.config.group, &mut self.outbox),
            Some(CapacityTransition::Unlocked) => self.flow_control.unlock_flow(sender, self.config.group, &mut self.outbox),
            None => {}
        }
    }

    fn ensure_receive_queue(&mut self, sender: NodeAddr, first_message_id: MessageId, now: Instant) -> Result<(), ProtocolFault> {
        if self.receive_queues.contains_key(&sender) {
            return Ok(());
        }

        let start_message_id = self.forgotten_senders.remove(&sender)
            .map(|id| id.saturating_add(1))
            .unwrap_or(first_message_id)
            .max(1);
        if start_message_id > MessageId::MAX - self.config.max_receive_window {
            return Err(ProtocolFault::MessageIdOutOfWindow { sender, message_id: start_message_id, window_start: 1 });
        }
        debug!("creating receive queue for {:?} starting at message #{}", sender, start_message_id);

        let mut queue = Self::new_receive_queue(&self.config, sender, start_message_id, now);
        for info in self.pending_orders.remove(&sender).unwrap_or_default() {
            Self::apply_order_info(&mut queue, &info, self.config.max_receive_window)?;
        }
        self.receive_queues.insert(sender, queue);
        Ok(())
    }

    fn apply_order_info(queue: &mut ReceiveQueue, info: &OrderInfo, max_window: u64) -> Result<(), ProtocolFault> {
        let count = info.count as u64;
        if count > max_window || info.start_order.checked_add(count).is_none() {
            return Err(ProtocolFault::OrderOutOfWindow { order: info.start_order, window_start: info.start_order });
        }
        if info.start_message_id.checked_add(count).is_none() {
            return Err(ProtocolFault::MessageIdOutOfWindow {
                sender: info.sender,
                message_id: info.start_message_id,
                window_start: queue.start_message_id(),
            });
        }

        for offset in 0..count {
            queue.set_order(info.start_message_id + offset, info.start_order + offset)?;
        }
        Ok(())
    }

    /// Attaches an assignment to the sender's queue, or keeps it until the queue exists.
    fn apply_or_keep(&mut self, info: &OrderInfo) -> Result<bool, ProtocolFault> {
        match self.receive_queues.get_mut(&info.sender) {
            Some(queue) => {
                Self::apply_order_info(queue, info, self.config.max_receive_window)?;
                Ok(true)
            }
            None => {
                self.pending_orders.entry(info.sender)
                    .or_default()
                    .push(*info);
                Ok(false)
            }
        }
    }

    /// On the active coordinator, hands out orders to all of a sender's received messages that
    ///  still lack one.
    fn assign_missing_orders(&mut self, sender: NodeAddr) -> Result<(), ProtocolFault> {
        if !self.config.ordered || !self.total_order.is_active_coordinator() {
            return Ok(());
        }
        let Some(queue) = self.receive_queues.get_mut(&sender) else {
            return Ok(());
        };
        for (start_message_id, count) in queue.unordered_runs() {
            let info = self.total_order.assign_orders(sender, start_message_id, count)?;
            Self::apply_order_info(queue, &info, self.config.max_receive_window)?;
        }
        Ok(())
    }

    pub fn on_frame(&mut self, from: NodeAddr, frame: GroupFrame, now: Instant) -> Result<Outcome, ProtocolFault> {
        if frame.group != self.config.group {
            warn!("received frame for group {:?} on channel for {:?} - ignoring", frame.group, self.config.group);
            return Ok(Outcome::StaleIgnored);
        }

        let result = self.on_message(from, frame.generation, frame.message, now);
        self.seal_outbox();
        result
    }

    fn on_message(&mut self, from: NodeAddr, generation: MembershipGeneration, message: GroupMessage, now: Instant) -> Result<Outcome, ProtocolFault> {
        let generation_checked = matches!(message,
            GroupMessage::Bundle(_) | GroupMessage::Acknowledge(_) | GroupMessage::Complete(_) | GroupMessage::TotalOrder(_)
        );
        if generation_checked {
            match self.channel.generation() {
                Some(current) if generation == current => {}
                Some(current) if generation < current => {
                    debug!("message from {:?} for stale generation {} (current is {}) - ignoring", from, generation, current);
                    return Ok(Outcome::StaleIgnored);
                }
                _ => {
                    trace!("message from {:?} for future generation {} - queueing it", from, generation);
                    self.channel.future_messages.entry(generation)
                        .or_default()
                        .push((from, message));
                    return Ok(Outcome::FutureQueued);
                }
            }
        }

        match message {
            GroupMessage::Bundle(data) => self.on_bundle(from, data, now),
            GroupMessage::Acknowledge(data) => self.on_acknowledge(from, data.last_received_message_id, now),
            GroupMessage::Complete(data) => Ok(self.on_complete(from, data)),
            GroupMessage::TotalOrder(data) => self.on_total_order(data),
            GroupMessage::Retransmit(data) => self.on_retransmit(data, now),
            GroupMessage::Exchange(data) => {
                let resends = self.retransmit.on_exchange(from, data);
                self.resend(resends);
                Ok(Outcome::Accepted)
            }
            GroupMessage::FlowControl(data) => {
                self.flow_control.on_flow_control_message(from, data);
                Ok(Outcome::Accepted)
            }
        }
    }

    fn on_bundle(&mut self, from: NodeAddr, data: BundleData, now: Instant) -> Result<Outcome, ProtocolFault> {
        let messages = match deser_bundle_payload(&data.payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("malformed bundle from {:?} - dropping it: {}", from, e);
                return Ok(Outcome::StaleIgnored);
            }
        };

        if let Some(ack) = data.acknowledge {
            self.on_acknowledge(from, ack.last_received_message_id, now)?;
        }

        if let Some(first) = messages.first() {
            self.ensure_receive_queue(from, first.message_id, now)?;
        }
        if let Some(queue) = self.receive_queues.get_mut(&from) {
            for message in messages {
                if message.source != from {
                    warn!("bundle from {:?} contains message #{} from {:?} - skipping it", from, message.message_id, message.source);
                    continue;
                }
                if message.order != 0 {
                    self.total_order.observe_order(message.order);
                }
                queue.receive(message, now)?;
            }
            queue.complete(data.completed_message_id);
        }

        self.assign_missing_orders(from)?;
        self.deliver_from(from)?;
        self.check_acknowledge_threshold(from);
        Ok(Outcome::Accepted)
    }

    fn on_acknowledge(&mut self, from: NodeAddr, last_received_message_id: MessageId, now: Instant) -> Result<Outcome, ProtocolFault> {
        let outcome = self.send_queue.acknowledge(from, last_received_message_id)?;
        if outcome == Outcome::Accepted {
            self.try_complete(now)?;
        }
        Ok(outcome)
    }

    fn on_complete(&mut self, from: NodeAddr, data: CompleteData) -> Outcome {
        let Some(queue) = self.receive_queues.get_mut(&from) else {
            return Outcome::StaleIgnored;
        };
        queue.complete(data.completed_message_id);
        self.update_flow_control(from);
        Outcome::Accepted
    }

    fn on_total_order(&mut self, data: TotalOrderData) -> Result<Outcome, ProtocolFault> {
        if !self.config.ordered {
            return Ok(Outcome::StaleIgnored);
        }
        self.total_order.observe_next_order(data.next_order);

        let mut senders = BTreeSet::new();
        for info in &data.orders {
            if self.apply_or_keep(info)? {
                senders.insert(info.sender);
            }
            self.total_order.record(*info);
        }

        if !self.ordered_queue.is_aligned() {
            let start_order = data.orders.iter()
                .map(|i| i.start_order)
                .min()
                .unwrap_or(data.next_order)
                .min(data.next_order);
            self.ordered_queue.align(start_order);
        }

        for sender in senders {
            self.deliver_from(sender)?;
        }
        self.deliver_ordered();
        Ok(Outcome::Accepted)
    }

    fn on_retransmit(&mut self, data: RetransmitData, now: Instant) -> Result<Outcome, ProtocolFault> {
        let failed_node = data.failed_node;
        if !self.retransmit.on_retransmit(failed_node, data.flush_id) {
            return Ok(Outcome::StaleIgnored);
        }
        debug!("received {} retransmitted messages from {:?}", data.messages.len(), failed_node);

        if let Some(first) = data.messages.first() {
            self.ensure_receive_queue(failed_node, first.message_id, now)?;
        }
        if let Some(queue) = self.receive_queues.get_mut(&failed_node) {
            for message in data.messages {
                if message.source != failed_node {
                    warn!("retransmission for {:?} contains message #{} from {:?} - skipping it", failed_node, message.message_id, message.source);
                    continue;
                }
                if message.order != 0 {
                    self.total_order.observe_order(message.order);
                }
                queue.receive_retransmitted(message, now)?;
            }
        }

        self.assign_missing_orders(failed_node)?;
        self.deliver_from(failed_node)?;
        Ok(Outcome::Accepted)
    }

    fn resend(&mut self, resends: Vec<Resend>) {
        for resend in resends {
            let messages = self.receive_queues.get(&resend.failed_sender)
                .map(|q| q.messages_in(resend.first_message_id..=resend.last_message_id))
                .unwrap_or_default();

            let expected = resend.last_message_id - resend.first_message_id + 1;
            if (messages.len() as u64) < expected {
                warn!("only {} of {} messages from {:?} are still retained for re-sending to {:?}", messages.len(), expected, resend.failed_sender, resend.to);
            }
            debug!("re-sending messages #{}..#{} from {:?} to {:?}", resend.first_message_id, resend.last_message_id, resend.failed_sender, resend.to);

            self.outbox.push((resend.to, GroupMessage::Retransmit(RetransmitData {
                failed_node: resend.failed_sender,
                flush_id: resend.flush_id,
                messages,
            })));
        }
    }

    fn check_acknowledge_threshold(&mut self, sender: NodeAddr) {
        if sender == self.myself {
            return;
        }
        let Some(queue) = self.receive_queues.get_mut(&sender) else {
            return;
        };
        if queue.unacknowledged_count() < self.config.max_unacknowledged_message_count {
            return;
        }
        if let Some(last_received_message_id) = queue.acknowledge() {
            trace!("acknowledging #{} to {:?} after reaching the unacknowledged message threshold", last_received_message_id, sender);
            self.outbox.push((sender, GroupMessage::Acknowledge(AcknowledgeData {
                last_received_message_id,
                standalone: true,
            })));
        }
    }

    fn send_pending_acknowledgements(&mut self) {
        let Some(view) = &self.channel.view else {
            return;
        };
        for (&sender, queue) in self.receive_queues.iter_mut() {
            if sender == self.myself || !view.contains(&sender) {
                continue;
            }
            if let Some(last_received_message_id) = queue.acknowledge() {
                self.outbox.push((sender, GroupMessage::Acknowledge(AcknowledgeData {
                    last_received_message_id,
                    standalone: true,
                })));
            }
        }
    }

    fn send_pending_completion(&mut self) {
        let completed_message_id = self.send_queue.last_completed_message_id();
        if completed_message_id <= self.announced_completed_message_id {
            return;
        }
        trace!("announcing completion of #{} in a dedicated message", completed_message_id);
        for peer in self.channel.peers(self.myself) {
            self.outbox.push((peer, GroupMessage::Complete(CompleteData { completed_message_id })));
        }
        self.announced_completed_message_id = completed_message_id;
    }

    fn send_order_infos(&mut self, recipients: &[NodeAddr]) {
        let orders = self.total_order.take_order_infos();
        if orders.is_empty() {
            return;
        }
        let data = TotalOrderData {
            next_order: self.total_order.next_order(),
            orders,
        };
        for &recipient in recipients {
            self.outbox.push((recipient, GroupMessage::TotalOrder(data.clone())));
        }
    }

    /// Periodic work: bundling timeout, acknowledgements and completion without piggybacking
    ///  traffic, the coordinator's order broadcast, and discarding idle receive queues.
    pub fn on_timer(&mut self, now: Instant) -> Result<(), ProtocolFault> {
        if self.send_queue.is_bundle_due(now, self.config.max_bundling_period) {
            self.create_bundle(now)?;
        }

        if now.saturating_duration_since(self.last_acknowledge_sweep) >= self.config.max_unacknowledged_period {
            self.last_acknowledge_sweep = now;
            self.send_pending_acknowledgements();
            self.send_pending_completion();
        }

        if self.config.ordered
            && self.total_order.is_active_coordinator()
            && now.saturating_duration_since(self.last_order_broadcast) >= self.config.order_info_period
        {
            self.last_order_broadcast = now;
            let peers = self.channel.peers(self.myself);
            self.send_order_infos(&peers);
        }

        self.remove_idle_queues(now);
        self.seal_outbox();
        Ok(())
    }

    fn remove_idle_queues(&mut self, now: Instant) {
        let idle = self.receive_queues.iter()
            .filter(|(sender, queue)| **sender != self.myself && queue.is_idle(now, self.config.max_idle_receive_queue_period))
            .map(|(sender, _)| *sender)
            .collect::<Vec<_>>();

        for sender in idle {
            if let Some(queue) = self.receive_queues.remove(&sender) {
                debug!("discarding idle receive queue for {:?}", sender);
                self.forgotten_senders.insert(sender, queue.last_received_message_id());
            }
        }
    }

    /// A member was reported as failed. It no longer holds up completion, and its flow control
    ///  locks are released. Its messages are kept until the next flush had a chance to recover
    ///  what it sent to only some of the members.
    pub fn on_member_failed(&mut self, member: NodeAddr, now: Instant) -> Result<(), ProtocolFault> {
        info!("member {:?} failed", member);
        self.send_queue.on_member_failed(member);
        self.flow_control.on_member_failed(member);
        self.retransmit.on_member_failed(member);
        self.try_complete(now)?;
        self.seal_outbox();
        Ok(())
    }

    fn last_received_from(&self, sender: &NodeAddr) -> MessageId {
        self.receive_queues.get(sender)
            .map(|q| q.last_received_message_id())
            .or_else(|| self.forgotten_senders.get(sender).copied())
            .unwrap_or(0)
    }

    /// Start of a reconfiguration towards `new_view`: sends what is pending under the current
    ///  generation, suspends bundling, and (if this is not the group's first view) starts the
    ///  stabilization of messages from failed members.
    pub fn start_flush(&mut self, new_view: GroupView, now: Instant) -> Result<(), ProtocolFault> {
        info!("starting flush to generation {} with members {:?}", new_view.generation, new_view.members);
        let old_view = self.channel.view.clone();

        if old_view.is_some() {
            self.create_bundle(now)?;
        }
        self.channel.bundling_suspended = true;

        if self.config.ordered {
            if self.total_order.is_coordinator() {
                let peers = self.channel.peers(self.myself);
                self.send_order_infos(&peers);
            }
            self.channel.coordinator_changed = self.total_order.start_flush(new_view.coordinator());
        }

        if let Some(old_view) = &old_view {
            let missing = old_view.members.iter()
                .filter(|&m| *m != self.myself && !self.failure_detector.is_healthy_member(m))
                .map(|&m| MissingMessagesInfo {
                    failed_sender: m,
                    last_received_message_id: self.last_received_from(&m),
                })
                .collect::<Vec<_>>();

            let own_data = ExchangeData {
                flush_id: new_view.generation,
                next_order: self.total_order.next_order(),
                delivered_order: self.ordered_queue.start_order().unwrap_or(0),
                orders: if self.config.ordered { self.total_order.known_order_infos() } else { Vec::new() },
                missing,
            };
            let resends = self.retransmit.start_flush(old_view, &new_view, own_data, &mut self.outbox);
            self.resend(resends);
        }

        self.channel.pending_view = Some(new_view);
        self.seal_outbox();
        Ok(())
    }

    pub fn before_process_flush(&mut self) {
        self.send_pending_acknowledgements();
        self.send_pending_completion();
        self.seal_outbox();
    }

    /// returns `true` once this node has finished its part of the flush
    pub fn process_flush(&self) -> bool {
        self.retransmit.is_stabilized()
    }

    /// Adopts the new view: discards what departed members left behind, settles global ordering
    ///  for the new coordinator, replays messages that arrived early for the new generation and
    ///  resumes bundling.
    pub fn end_flush(&mut self, now: Instant) -> Result<(), ProtocolFault> {
        let Some(new_view) = self.channel.pending_view.take() else {
            warn!("end of flush without a pending view - ignoring");
            return Ok(());
        };
        self.seal_outbox();
        info!("ending flush, adopting generation {}", new_view.generation);

        let old_view = self.channel.view.take();
        self.retransmit.end_flush(new_view.generation);

        if self.config.ordered && old_view.is_some() {
            self.adopt_reported_orders()?;
        }

        let mut departed = old_view.iter()
            .flat_map(|v| v.members.iter().copied())
            .chain(self.failure_detector.failed_members())
            .chain(self.failure_detector.left_members())
            .collect::<BTreeSet<_>>();
        departed.retain(|m| *m != self.myself && !new_view.contains(m));

        for member in &departed {
            // releases what became deliverable through adopted orders
            self.deliver_from(*member)?;
            if let Some(mut queue) = self.receive_queues.remove(member) {
                queue.complete_all();
            }
            self.forgotten_senders.remove(member);
            self.pending_orders.remove(member);
            self.flow_control.on_member_failed(*member);
        }
        let peers = new_view.peers(self.myself).collect::<Vec<_>>();
        self.send_queue.set_peers(&peers);

        self.channel.view = Some(new_view.clone());
        let (existing, joined): (Vec<NodeAddr>, Vec<NodeAddr>) = peers.iter()
            .copied()
            .partition(|p| old_view.as_ref().map(|v| v.contains(p)).unwrap_or(false));

        if self.config.ordered {
            let reported_next_order = self.retransmit.reported_next_order();
            if self.channel.coordinator_changed && old_view.is_some() {
                let next_order = reported_next_order.max(self.total_order.next_order());
                self.skip_unassigned_orders(next_order, &new_view);

                if self.total_order.is_coordinator() {
                    // the survivors agree on these already, unless their stabilization was cut short
                    let orders = self.total_order.known_order_infos()
                        .into_iter()
                        .filter(|info| new_view.contains(&info.sender))
                        .collect::<Vec<_>>();
                    debug!("re-broadcasting {} known order assignments as the new coordinator", orders.len());
                    for &member in &existing {
                        self.outbox.push((member, GroupMessage::TotalOrder(TotalOrderData {
                            next_order,
                            orders: orders.clone(),
                        })));
                    }
                }
            }
            self.total_order.end_flush(reported_next_order);
            if let Some(delivered_order) = self.retransmit.delivered_by_all() {
                self.total_order.trim_known(delivered_order);
            }
        }
        self.channel.coordinator_changed = false;

        if self.config.ordered && self.total_order.is_coordinator() {
            let senders = self.receive_queues.keys().copied().collect::<Vec<_>>();
            for &sender in &senders {
                self.assign_missing_orders(sender)?;
            }
            self.send_order_infos(&existing);

            let next_order = self.total_order.next_order();
            self.ordered_queue.align(next_order);
            for member in joined {
                debug!("telling {:?} to start global delivery at order {}", member, next_order);
                self.outbox.push((member, GroupMessage::TotalOrder(TotalOrderData {
                    next_order,
                    orders: Vec::new(),
                })));
            }

            for sender in senders {
                self.deliver_from(sender)?;
            }
        }
        self.try_complete(now)?;
        self.deliver_ordered();

        let later = self.channel.future_messages.split_off(&(new_view.generation + 1));
        let due = std::mem::replace(&mut self.channel.future_messages, later);
        for (generation, messages) in due {
            if generation < new_view.generation {
                debug!("discarding {} messages for skipped generation {}", messages.len(), generation);
                continue;
            }
            for (from, message) in messages {
                self.on_message(from, generation, message, now)?;
            }
        }

        self.channel.bundling_suspended = false;
        self.create_bundle(now)?;
        self.seal_outbox();
        Ok(())
    }

    /// Applies the order assignments all survivors reported during stabilization, so that
    ///  assignments a failed coordinator got to only some members hold everywhere.
    fn adopt_reported_orders(&mut self) -> Result<(), ProtocolFault> {
        let mut senders = BTreeSet::new();
        for info in self.retransmit.reported_orders() {
            match self.apply_or_keep(&info) {
                Ok(true) => {
                    senders.insert(info.sender);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("cannot adopt reported order assignment {:?}: {}", info, e);
                    continue;
                }
            }
            self.total_order.record(info);
        }
        debug!("adopted reported order assignments for {:?}", senders);

        for sender in senders {
            self.deliver_from(sender)?;
        }
        Ok(())
    }

    /// After a coordinator change, positions before `end_order` that no remaining member will
    ///  ever send a message for are passed over. A position is still waited for if a message is
    ///  buffered for it, or if it is assigned to a sender that stays in the group.
    fn skip_unassigned_orders(&mut self, end_order: Order, new_view: &GroupView) {
        let assigned_to_members = self.total_order.known_order_infos()
            .into_iter()
            .filter(|info| new_view.contains(&info.sender))
            .map(|info| info.start_order..info.end_order())
            .collect::<Vec<_>>();

        let expected = |order: Order| assigned_to_members.iter().any(|range| range.contains(&order));
        if let Err(e) = self.ordered_queue.skip_unassigned(end_order, expected) {
            warn!("cannot settle the global delivery sequence up to order {}: {}", end_order, e);
        }
        self.deliver_ordered();
    }
}
