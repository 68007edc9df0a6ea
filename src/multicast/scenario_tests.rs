//! Several protocol instances talking to each other through [TestGroup].

use std::time::Duration;

use bytes::Bytes;
use rstest::rstest;

use crate::messaging::node_addr::NodeAddr;
use crate::multicast::group_messages::{GroupFrame, GroupMessage};
use crate::multicast::multicast_config::MulticastConfig;
use crate::multicast::multicast_message::MessageFlags;
use crate::multicast::{MessageId, Order};
use crate::test_util::group::TestGroup;
use crate::test_util::message::TEST_GROUP;
use crate::test_util::node::test_node_addr_from_number;


fn node(n: u16) -> NodeAddr {
    test_node_addr_from_number(n)
}

fn config(durable: bool, ordered: bool) -> MulticastConfig {
    let mut config = MulticastConfig::new(TEST_GROUP);
    config.durable = durable;
    config.ordered = ordered;
    config
}

fn from_sender(delivered: &[(u64, MessageId)], sender: u64) -> Vec<MessageId> {
    delivered.iter()
        .filter(|(s, _)| *s == sender)
        .map(|(_, id)| *id)
        .collect()
}

fn ids(sender: u64, range: std::ops::RangeInclusive<MessageId>) -> Vec<(u64, MessageId)> {
    range.map(|id| (sender, id)).collect()
}

#[test]
fn test_messages_of_failed_sender_are_recovered() {
    let mut group = TestGroup::new(config(true, false), &[1, 2, 3]);

    for payload in [b"1", b"2", b"3"] {
        group.send(1, payload, MessageFlags::NO_DELAY);
    }
    group.pump();

    // node 1 fails while sending its last bundles: node 2 gets them, node 3 does not
    group.set_drop_filter(|from, to, frame: &GroupFrame| {
        from == node(1) && to == node(3) && matches!(frame.message, GroupMessage::Bundle(_))
    });
    group.send(1, b"4", MessageFlags::NO_DELAY);
    group.send(1, b"5", MessageFlags::NO_DELAY);
    group.pump();
    assert_eq!(group.delivered(2), ids(1, 1..=5));
    assert_eq!(group.delivered(3), ids(1, 1..=3));

    group.clear_drop_filter();
    group.fail(1);
    group.reconfigure(&[2, 3]);

    assert_eq!(group.delivered(2), ids(1, 1..=5));
    assert_eq!(group.delivered(3), ids(1, 1..=5));
    assert_eq!(group.delivered_payloads(3).last(), Some(&Bytes::from_static(b"5")));
    for n in [2, 3] {
        assert!(group.protocol(n).receive_queue(&node(1)).is_none());
        assert_eq!(group.protocol(n).channel().generation(), Some(2));
    }

    // the survivors carry on
    group.send(3, b"after", MessageFlags::NO_DELAY);
    group.pump();
    assert_eq!(from_sender(&group.delivered(2), 3), vec![1]);
}

#[test]
fn test_fifo_per_sender() {
    let mut config = config(true, false);
    config.max_bundle_size = 60;
    let mut group = TestGroup::new(config, &[1, 2, 3]);

    for i in 0..10u8 {
        group.send(1, &[i], MessageFlags::empty());
        group.send(2, &[i, i], MessageFlags::empty());
    }
    group.pump();
    group.run_for(Duration::from_millis(300));

    for n in [1, 2, 3] {
        let delivered = group.delivered(n);
        assert_eq!(from_sender(&delivered, 1), (1..=10).collect::<Vec<_>>(), "node {}", n);
        assert_eq!(from_sender(&delivered, 2), (1..=10).collect::<Vec<_>>(), "node {}", n);
        assert!(from_sender(&delivered, 3).is_empty());
    }
    assert!(group.protocol(1).send_queue().is_empty());
    assert!(group.protocol(2).send_queue().is_empty());
}

#[test]
fn test_global_order_across_senders() {
    let mut group = TestGroup::new(config(true, true), &[1, 2, 3]);

    for i in 0..5u8 {
        group.send(2, &[2, i], MessageFlags::NO_DELAY);
        group.send(3, &[3, i], MessageFlags::NO_DELAY);
        group.send(1, &[1, i], MessageFlags::NO_DELAY);
    }
    group.pump();
    group.run_for(Duration::from_millis(300));

    let reference = group.delivered(1);
    assert_eq!(reference.len(), 15);
    assert_eq!(group.delivered(2), reference);
    assert_eq!(group.delivered(3), reference);

    assert_eq!(group.listener(1).orders(), (1..=15).collect::<Vec<Order>>());
    for sender in 1..=3 {
        assert_eq!(from_sender(&reference, sender), (1..=5).collect::<Vec<_>>());
    }
}

#[rstest]
#[case::durable(true)]
#[case::non_durable(false)]
fn test_own_delivery(#[case] durable: bool) {
    let mut group = TestGroup::new(config(durable, false), &[1, 2]);

    group.send(1, b"a", MessageFlags::NO_DELAY);
    if durable {
        // retained and delivered once every peer has it
        assert!(group.delivered(1).is_empty());
        assert_eq!(group.protocol(1).send_queue().len(), 1);
    }
    else {
        assert_eq!(group.delivered(1), vec![(1, 1)]);
        assert!(group.protocol(1).send_queue().is_empty());
    }

    group.pump();
    assert_eq!(group.delivered(2), vec![(1, 1)]);

    group.run_for(Duration::from_millis(200));
    assert_eq!(group.delivered(1), vec![(1, 1)]);
    assert!(group.protocol(1).send_queue().is_empty());
    assert!(group.protocol(2).receive_queue(&node(1)).unwrap().is_empty());
}

#[test]
fn test_joining_member_starts_at_current_order() {
    let mut group = TestGroup::new(config(true, true), &[1, 2]);

    group.send(2, b"before-2", MessageFlags::NO_DELAY);
    group.send(1, b"before-1", MessageFlags::NO_DELAY);
    group.pump();
    group.run_for(Duration::from_millis(300));
    assert_eq!(group.delivered(1).len(), 2);
    let next_order = group.protocol(1).total_order().next_order();

    group.add_node(3);
    group.reconfigure(&[1, 2, 3]);
    assert_eq!(group.protocol(3).ordered_queue().start_order(), Some(next_order));

    group.send(3, b"after-3", MessageFlags::NO_DELAY);
    group.send(2, b"after-2", MessageFlags::NO_DELAY);
    group.send(1, b"after-1", MessageFlags::NO_DELAY);
    group.pump();
    group.run_for(Duration::from_millis(300));

    let reference = group.delivered(1);
    assert_eq!(reference.len(), 5);
    assert_eq!(group.delivered(2), reference);
    assert_eq!(group.delivered(3), reference[2..]);
    assert_eq!(group.listener(3).orders().first(), Some(&next_order));
}

#[test]
fn test_coordinator_handover() {
    let mut group = TestGroup::new(config(true, true), &[1, 2, 3]);

    for n in [1, 2, 3] {
        group.send(n, &[n as u8], MessageFlags::NO_DELAY);
    }
    group.pump();
    group.run_for(Duration::from_millis(300));
    assert_eq!(group.delivered(3).len(), 3);
    let previous_orders = group.listener(3).orders();

    group.fail(1);
    group.reconfigure(&[2, 3]);
    assert!(group.protocol(2).total_order().is_active_coordinator());
    assert!(!group.protocol(3).total_order().is_coordinator());

    for n in [3, 2, 3] {
        group.send(n, &[n as u8], MessageFlags::NO_DELAY);
    }
    group.pump();
    group.run_for(Duration::from_millis(300));

    let reference = group.delivered(2);
    assert_eq!(reference.len(), 6);
    assert_eq!(group.delivered(3), reference);

    // new orders continue after those of the previous coordinator
    let orders = group.listener(2).orders();
    assert_eq!(orders[..3], previous_orders[..]);
    assert!(orders.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_receiver_throttles_sender() {
    let mut config = config(true, false);
    config.min_lock_queue_capacity = 40;
    config.max_unlock_queue_capacity = 20;
    let mut group = TestGroup::new(config, &[1, 2]);
    let gate = group.protocol(1).gate();

    // 17 bytes each
    for _ in 0..3 {
        group.send(1, b"x", MessageFlags::NO_DELAY);
    }
    group.pump();
    assert!(gate.is_locked());
    assert_eq!(group.delivered(2).len(), 3);

    group.run_for(Duration::from_millis(200));
    assert!(!gate.is_locked());
    assert_eq!(group.delivered(1).len(), 3);
}

/// The coordinator fails after its order assignments reached only one of the two survivors.
#[rstest]
#[case::lost_to_sender(vec![2], 2)]
#[case::lost_to_other_member(vec![2], 3)]
#[case::lost_to_next_coordinator(vec![3], 2)]
#[case::several_senders(vec![2, 3], 2)]
fn test_handover_with_partially_disseminated_orders(#[case] senders: Vec<u16>, #[case] cut_off: u16) {
    let mut group = TestGroup::new(config(true, true), &[1, 2, 3]);
    let other = if cut_off == 2 { 3 } else { 2 };

    group.set_drop_filter(move |from, to, frame: &GroupFrame| {
        from == node(1) && to == node(cut_off) && matches!(frame.message, GroupMessage::TotalOrder(_))
    });
    for &n in &senders {
        group.send(n, &[n as u8], MessageFlags::NO_DELAY);
    }
    group.pump();
    group.run_for(Duration::from_millis(300));
    assert!(group.delivered(cut_off).is_empty());
    assert_eq!(group.delivered(other).len(), senders.len());
    let assigned = group.listener(other).orders();

    group.clear_drop_filter();
    group.fail(1);
    group.reconfigure(&[2, 3]);

    // the survivors agree on the failed coordinator's assignments
    assert_eq!(group.delivered(cut_off), group.delivered(other));
    for n in [2, 3] {
        assert_eq!(group.listener(n).orders(), assigned, "node {}", n);
        assert!(group.protocol(n).ordered_queue().is_empty(), "node {}", n);
    }
    assert!(group.protocol(2).total_order().is_active_coordinator());

    // ... and keep going under the new coordinator
    for n in [3, 2, 3] {
        group.send(n, &[n as u8], MessageFlags::NO_DELAY);
    }
    group.pump();
    group.run_for(Duration::from_millis(300));

    let reference = group.delivered(2);
    assert_eq!(reference.len(), senders.len() + 3);
    assert_eq!(group.delivered(3), reference);
    let orders = group.listener(2).orders();
    assert_eq!(group.listener(3).orders(), orders);
    assert_eq!(orders[..senders.len()], assigned[..]);
    assert!(orders.windows(2).all(|w| w[0] < w[1]));
    for n in [2, 3] {
        assert!(group.protocol(n).send_queue().is_empty(), "node {}", n);
    }
}
