use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace, warn};

use crate::membership::{GroupView, MembershipGeneration};
use crate::messaging::node_addr::NodeAddr;
use crate::multicast::group_messages::{ExchangeData, GroupMessage, OrderInfo};
use crate::multicast::{MessageId, Order, Outbox};


/// An instruction for this node to re-send a failed sender's messages to a member that is
///  missing them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resend {
    pub flush_id: MembershipGeneration,
    pub failed_sender: NodeAddr,
    pub to: NodeAddr,
    pub first_message_id: MessageId,
    pub last_message_id: MessageId,
}

struct Stabilization {
    flush_id: MembershipGeneration,
    new_view: GroupView,
    /// surviving members of the old view, all of which report what they received
    reporters: BTreeSet<NodeAddr>,
    reports: BTreeMap<NodeAddr, ExchangeData>,
    /// failed senders for which this node waits for a retransmission
    pending: BTreeSet<NodeAddr>,
    resends_computed: bool,
}

/// Recovers messages a failed sender got to some but not all survivors.
///
/// ```ascii
///             start_flush (old view exists)
///   Normal  ------------------------------->  Stabilization
///     ^                                            |
///     |   all retransmissions arrived, or a member |
///     +--------------- failed, or end_flush -------+
/// ```
///
/// At the start of a flush, every survivor multicasts the last message id it received from each
///  member of the old view that is no longer healthy. Once all survivors reported, each of them
///  independently determines the best-positioned re-sender per failed sender (highest id,
///  lowest rank on ties). The re-sender retransmits the missing range to everybody behind it.
///
/// The reports' ordering state is merged along the way and kept until the next flush starts.
pub struct MessageRetransmit {
    myself: NodeAddr,
    stabilization: Option<Stabilization>,
    /// exchange data received for a flush this node did not start yet
    early_exchanges: BTreeMap<MembershipGeneration, Vec<(NodeAddr, ExchangeData)>>,
    reported_next_order: Order,
    reported_orders: BTreeMap<Order, OrderInfo>,
    /// lowest `delivered_order` of all survivors, once all of them reported
    delivered_by_all: Option<Order>,
}

impl MessageRetransmit {
    pub fn new(myself: NodeAddr) -> MessageRetransmit {
        MessageRetransmit {
            myself,
            stabilization: None,
            early_exchanges: Default::default(),
            reported_next_order: 0,
            reported_orders: Default::default(),
            delivered_by_all: None,
        }
    }

    pub fn flush_id(&self) -> Option<MembershipGeneration> {
        self.stabilization.as_ref().map(|s| s.flush_id)
    }

    /// Done when there is no stabilization, or when all reports were collected and all expected
    ///  retransmissions arrived.
    pub fn is_stabilized(&self) -> bool {
        match &self.stabilization {
            None => true,
            Some(s) => s.resends_computed && s.pending.is_empty(),
        }
    }

    /// Enters the stabilization phase: publishes this node's exchange data to the other
    ///  survivors and processes reports that arrived early. The data's flush id is the new
    ///  view's generation.
    pub fn start_flush(
        &mut self,
        old_view: &GroupView,
        new_view: &GroupView,
        own_data: ExchangeData,
        outbox: &mut Outbox,
    ) -> Vec<Resend> {
        let flush_id = new_view.generation;
        debug_assert_eq!(own_data.flush_id, flush_id);
        let reporters = new_view.members.iter()
            .filter(|m| old_view.contains(m))
            .copied()
            .collect::<BTreeSet<_>>();

        info!("starting stabilization for flush {} with {} failed senders", flush_id, own_data.missing.len());

        for &peer in &reporters {
            if peer != self.myself {
                outbox.push((peer, GroupMessage::Exchange(own_data.clone())));
            }
        }

        self.reported_next_order = 0;
        self.reported_orders.clear();
        self.delivered_by_all = None;
        self.stabilization = Some(Stabilization {
            flush_id,
            new_view: new_view.clone(),
            reporters,
            reports: Default::default(),
            pending: Default::default(),
            resends_computed: false,
        });

        self.early_exchanges.retain(|&id, _| id >= flush_id);
        let early = self.early_exchanges.remove(&flush_id).unwrap_or_default();

        let mut result = self.on_exchange(self.myself, own_data);
        for (from, data) in early {
            result.extend(self.on_exchange(from, data));
        }
        result
    }

    /// Registers a survivor's exchange data, returning the re-sends this node is responsible for
    ///  once all survivors have reported.
    pub fn on_exchange(&mut self, from: NodeAddr, data: ExchangeData) -> Vec<Resend> {
        let current_flush_id = self.flush_id();
        let Some(stabilization) = self.stabilization.as_mut()
            .filter(|s| s.flush_id == data.flush_id)
        else {
            if current_flush_id.map(|id| data.flush_id > id).unwrap_or(true) {
                trace!("exchange data from {:?} for future flush {} - keeping it", from, data.flush_id);
                self.early_exchanges.entry(data.flush_id)
                    .or_default()
                    .push((from, data));
            }
            else {
                debug!("exchange data from {:?} for stale flush {} - ignoring", from, data.flush_id);
            }
            return Vec::new();
        };

        if !stabilization.reporters.contains(&from) {
            debug!("exchange data from {:?} which did not survive the reconfiguration - ignoring", from);
            return Vec::new();
        }
        self.reported_next_order = self.reported_next_order.max(data.next_order);
        for info in &data.orders {
            let known = self.reported_orders.entry(info.start_order).or_insert(*info);
            if known != info {
                warn!("{:?} reported {:?} for orders that are known as {:?} - keeping the latter", from, info, known);
            }
        }
        stabilization.reports.insert(from, data);

        if stabilization.resends_computed || stabilization.reports.len() < stabilization.reporters.len() {
            return Vec::new();
        }
        stabilization.resends_computed = true;
        self.delivered_by_all = stabilization.reports.values()
            .map(|r| r.delivered_order)
            .min();

        let result = Self::compute_resends(self.myself, stabilization);
        if self.is_stabilized() {
            self.end_stabilization();
        }
        result
    }

    fn compute_resends(myself: NodeAddr, stabilization: &mut Stabilization) -> Vec<Resend> {
        let mut received: BTreeMap<NodeAddr, Vec<(NodeAddr, MessageId)>> = BTreeMap::new();
        for (&reporter, data) in &stabilization.reports {
            for info in &data.missing {
                received.entry(info.failed_sender)
                    .or_default()
                    .push((reporter, info.last_received_message_id));
            }
        }

        let view = &stabilization.new_view;
        let rank = |node: &NodeAddr| view.rank(node).unwrap_or(usize::MAX);

        let mut result = Vec::new();
        for (failed_sender, per_reporter) in received {
            let Some(&(resender, max_received)) = per_reporter.iter()
                .max_by(|(a_node, a_id), (b_node, b_id)| a_id.cmp(b_id).then_with(|| rank(b_node).cmp(&rank(a_node))))
            else {
                continue;
            };

            debug!("re-sender for {:?} is {:?} with messages up to #{}", failed_sender, resender, max_received);

            for &(reporter, last_received) in &per_reporter {
                if last_received >= max_received {
                    continue;
                }
                if resender == myself {
                    result.push(Resend {
                        flush_id: stabilization.flush_id,
                        failed_sender,
                        to: reporter,
                        first_message_id: last_received + 1,
                        last_message_id: max_received,
                    });
                }
                if reporter == myself {
                    stabilization.pending.insert(failed_sender);
                }
            }
        }
        result
    }

    /// The highest `next_order` any survivor reported in the current stabilization.
    pub fn reported_next_order(&self) -> Order {
        self.reported_next_order
    }

    /// The union of the order assignments survivors reported, by start order.
    pub fn reported_orders(&self) -> Vec<OrderInfo> {
        self.reported_orders.values().copied().collect()
    }

    /// The position up to which every survivor delivered the global sequence, known only if all
    ///  survivors reported. 0 stands for a survivor that does not take part in it yet.
    pub fn delivered_by_all(&self) -> Option<Order> {
        self.delivered_by_all
    }

    /// Checks whether a retransmission belongs to the current stabilization, and marks it as
    ///  arrived if so. Retransmissions for other flushes are stale.
    pub fn on_retransmit(&mut self, failed_node: NodeAddr, flush_id: MembershipGeneration) -> bool {
        let Some(stabilization) = self.stabilization.as_mut() else {
            debug!("retransmission for {:?} outside of stabilization - ignoring", failed_node);
            return false;
        };
        if stabilization.flush_id != flush_id {
            debug!("retransmission for {:?} belongs to flush {} rather than {} - ignoring", failed_node, flush_id, stabilization.flush_id);
            return false;
        }

        stabilization.pending.remove(&failed_node);
        if self.is_stabilized() {
            self.end_stabilization();
        }
        true
    }

    /// A member failure during stabilization ends it without waiting for the remaining
    ///  retransmissions. The next reconfiguration runs a new stabilization.
    pub fn on_member_failed(&mut self, member: NodeAddr) {
        if let Some(stabilization) = &self.stabilization {
            if stabilization.reporters.contains(&member) {
                warn!("{:?} failed during stabilization of flush {} - ending stabilization", member, stabilization.flush_id);
                self.end_stabilization();
            }
        }
    }

    fn end_stabilization(&mut self) {
        if let Some(stabilization) = self.stabilization.take() {
            if !stabilization.pending.is_empty() {
                warn!("stabilization of flush {} ended with missing retransmissions for {:?}", stabilization.flush_id, stabilization.pending);
            }
            else {
                info!("stabilization of flush {} finished", stabilization.flush_id);
            }
        }
    }

    pub fn end_flush(&mut self, flush_id: MembershipGeneration) {
        self.end_stabilization();
        self.early_exchanges.retain(|&id, _| id > flush_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicast::group_messages::MissingMessagesInfo;
    use crate::test_util::node::test_node_addr_from_number;
    use rstest::rstest;

    fn node(n: u16) -> NodeAddr {
        test_node_addr_from_number(n)
    }

    fn views() -> (GroupView, GroupView) {
        (
            GroupView::new(1, vec![node(1), node(2), node(3)]),
            GroupView::new(2, vec![node(2), node(3)]),
        )
    }

    fn missing(failed: u16, last_received: MessageId) -> Vec<MissingMessagesInfo> {
        vec![MissingMessagesInfo { failed_sender: node(failed), last_received_message_id: last_received }]
    }

    fn exchange(last_received: MessageId) -> ExchangeData {
        ExchangeData { flush_id: 2, next_order: 1, delivered_order: 1, orders: Vec::new(), missing: missing(1, last_received) }
    }

    fn order_info(sender: u16, start_order: Order) -> OrderInfo {
        OrderInfo { sender: node(sender), start_message_id: 1, start_order, count: 1 }
    }

    #[test]
    fn test_best_positioned_member_resends() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(2));
        let mut outbox = Vec::new();

        let resends = retransmit.start_flush(&old_view, &new_view, exchange(5), &mut outbox);
        assert!(resends.is_empty());
        assert_eq!(outbox, vec![(node(3), GroupMessage::Exchange(exchange(5)))]);
        assert!(!retransmit.is_stabilized());

        let resends = retransmit.on_exchange(node(3), exchange(3));
        assert_eq!(resends, vec![Resend { flush_id: 2, failed_sender: node(1), to: node(3), first_message_id: 4, last_message_id: 5 }]);
        assert!(retransmit.is_stabilized());
        assert_eq!(retransmit.flush_id(), None);
    }

    #[test]
    fn test_trailing_member_waits_for_retransmission() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(3));
        let mut outbox = Vec::new();

        // the other survivor's report arrives before this node starts its flush
        assert!(retransmit.on_exchange(node(2), exchange(5)).is_empty());

        let resends = retransmit.start_flush(&old_view, &new_view, exchange(3), &mut outbox);
        assert!(resends.is_empty());
        assert!(!retransmit.is_stabilized());

        assert!(!retransmit.on_retransmit(node(1), 7));
        assert!(!retransmit.is_stabilized());
        assert!(retransmit.on_retransmit(node(1), 2));
        assert!(retransmit.is_stabilized());
    }

    #[rstest]
    #[case::tie_lowest_rank_wins(5, 5, 2)]
    #[case::higher_id_wins(4, 5, 3)]
    fn test_resender_selection(#[case] received_by_2: MessageId, #[case] received_by_3: MessageId, #[case] expected_resender: u16) {
        let old_view = GroupView::new(1, vec![node(1), node(2), node(3), node(4)]);
        let new_view = GroupView::new(2, vec![node(2), node(3), node(4)]);
        let mut retransmit = MessageRetransmit::new(node(4));
        let mut outbox = Vec::new();

        retransmit.start_flush(&old_view, &new_view, exchange(1), &mut outbox);
        retransmit.on_exchange(node(2), exchange(received_by_2));
        retransmit.on_exchange(node(3), exchange(received_by_3));
        assert!(!retransmit.is_stabilized());

        let mut resender = MessageRetransmit::new(node(expected_resender));
        resender.start_flush(&old_view, &new_view, exchange(received_by_2.max(received_by_3)), &mut outbox);
        resender.on_exchange(node(2), exchange(received_by_2));
        resender.on_exchange(node(3), exchange(received_by_3));
        let resends = resender.on_exchange(node(4), exchange(1));
        assert!(resends.iter().any(|r| r.to == node(4) && r.first_message_id == 2 && r.last_message_id == 5));
    }

    #[test]
    fn test_nothing_missing() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(2));
        let mut outbox = Vec::new();

        retransmit.start_flush(&old_view, &new_view, exchange(5), &mut outbox);
        assert!(retransmit.on_exchange(node(3), exchange(5)).is_empty());
        assert!(retransmit.is_stabilized());
    }

    #[test]
    fn test_member_failure_ends_stabilization() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(3));
        let mut outbox = Vec::new();

        retransmit.start_flush(&old_view, &new_view, exchange(3), &mut outbox);
        retransmit.on_member_failed(node(2));
        assert!(retransmit.is_stabilized());
        assert!(!retransmit.on_retransmit(node(1), 2));
        assert_eq!(retransmit.delivered_by_all(), None);
    }

    #[test]
    fn test_stale_and_foreign_exchanges() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(2));
        let mut outbox = Vec::new();

        retransmit.start_flush(&old_view, &new_view, exchange(5), &mut outbox);
        assert!(retransmit.on_exchange(node(3), ExchangeData { flush_id: 1, ..exchange(1) }).is_empty());
        assert!(retransmit.on_exchange(node(9), exchange(1)).is_empty());
        assert!(!retransmit.is_stabilized());
    }

    #[test]
    fn test_reported_next_order() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(2));
        let mut outbox = Vec::new();

        retransmit.start_flush(&old_view, &new_view, ExchangeData { next_order: 4, ..exchange(5) }, &mut outbox);
        assert_eq!(retransmit.reported_next_order(), 4);
        let resends = retransmit.on_exchange(node(3), ExchangeData { next_order: 11, ..exchange(2) });
        assert_eq!(resends.len(), 1);
        assert!(retransmit.is_stabilized());
        assert_eq!(retransmit.reported_next_order(), 11);

        retransmit.end_flush(2);
        assert_eq!(retransmit.reported_next_order(), 11);
    }

    #[test]
    fn test_reported_orders_are_merged() {
        let (old_view, new_view) = views();
        let mut retransmit = MessageRetransmit::new(node(2));
        let mut outbox = Vec::new();

        // node 3 got an assignment from the failed coordinator that node 2 missed
        let own = ExchangeData { delivered_order: 3, orders: vec![order_info(2, 1), order_info(3, 2)], ..exchange(5) };
        retransmit.start_flush(&old_view, &new_view, own, &mut outbox);
        assert_eq!(retransmit.delivered_by_all(), None);

        let other = ExchangeData { delivered_order: 2, orders: vec![order_info(3, 2), order_info(2, 3)], ..exchange(5) };
        retransmit.on_exchange(node(3), other);
        assert_eq!(retransmit.reported_orders(), vec![order_info(2, 1), order_info(3, 2), order_info(2, 3)]);
        assert_eq!(retransmit.delivered_by_all(), Some(2));

        // conflicting reports keep the first one
        let mut retransmit = MessageRetransmit::new(node(2));
        retransmit.start_flush(&old_view, &new_view, ExchangeData { orders: vec![order_info(2, 1)], ..exchange(5) }, &mut outbox);
        retransmit.on_exchange(node(3), ExchangeData { orders: vec![order_info(3, 1)], ..exchange(5) });
        assert_eq!(retransmit.reported_orders(), vec![order_info(2, 1)]);

        // the next flush starts from scratch
        let next_view = GroupView::new(3, vec![node(2)]);
        retransmit.start_flush(&new_view, &next_view, ExchangeData { flush_id: 3, ..exchange(5) }, &mut outbox);
        assert!(retransmit.reported_orders().is_empty());
        assert_eq!(retransmit.delivered_by_all(), Some(1));
    }
}
