use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::trace;

use crate::membership::{FailureDetector, GroupView, MembershipGeneration};
use crate::messaging::node_addr::NodeAddr;
use crate::multicast::delivery::DeliveryListeners;
use crate::multicast::group_messages::GroupFrame;
use crate::multicast::multicast_config::MulticastConfig;
use crate::multicast::multicast_message::MessageFlags;
use crate::multicast::protocol::MulticastProtocol;
use crate::multicast::MessageId;
use crate::test_util::message::CollectingListener;
use crate::test_util::node::test_node_addr_from_number;


/// A [FailureDetector] that reports exactly the members it was told about.
#[derive(Debug, Default)]
pub struct TestFailureDetector {
    failed: RwLock<BTreeSet<NodeAddr>>,
}
impl TestFailureDetector {
    pub fn fail(&self, addr: NodeAddr) {
        match self.failed.write() {
            Ok(mut failed) => failed.insert(addr),
            Err(poisoned) => poisoned.into_inner().insert(addr),
        };
    }

    fn failed(&self) -> BTreeSet<NodeAddr> {
        match self.failed.read() {
            Ok(failed) => failed.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl FailureDetector for TestFailureDetector {
    fn is_healthy_member(&self, addr: &NodeAddr) -> bool {
        !self.failed().contains(addr)
    }

    fn failed_members(&self) -> Vec<NodeAddr> {
        self.failed().into_iter().collect()
    }

    fn left_members(&self) -> Vec<NodeAddr> {
        Vec::new()
    }
}

/// decides whether a frame from the first to the second node is lost
pub type DropFilter = Box<dyn FnMut(NodeAddr, NodeAddr, &GroupFrame) -> bool + Send>;

pub struct TestMember {
    pub protocol: MulticastProtocol,
    pub listener: Arc<CollectingListener>,
}

/// An in-process group of protocol instances, connected by a simulated reliable FIFO network.
///
/// Nothing happens by itself: frames are only delivered by [TestGroup::pump], and time only
///  passes through [TestGroup::tick]. Frames go through serialization on their way. Failed nodes
///  neither send nor receive anything.
pub struct TestGroup {
    config: MulticastConfig,
    now: Instant,
    members: BTreeMap<NodeAddr, TestMember>,
    failure_detector: Arc<TestFailureDetector>,
    in_flight: VecDeque<(NodeAddr, NodeAddr, Bytes)>,
    drop_filter: Option<DropFilter>,
    generation: MembershipGeneration,
}

impl TestGroup {
    /// Creates a node per number and runs the flush that installs the group's first view.
    pub fn new(config: MulticastConfig, members: &[u16]) -> TestGroup {
        let mut result = TestGroup {
            config,
            now: Instant::now(),
            members: Default::default(),
            failure_detector: Default::default(),
            in_flight: Default::default(),
            drop_filter: None,
            generation: 0,
        };
        for &number in members {
            result.add_node(number);
        }
        result.reconfigure(members);
        result
    }

    /// Adds a node that is not part of any view yet.
    pub fn add_node(&mut self, number: u16) {
        let addr = test_node_addr_from_number(number);
        let listener = Arc::new(CollectingListener::default());
        let listeners = Arc::new(DeliveryListeners::new());
        listeners.add(listener.clone());

        let protocol = MulticastProtocol::new(addr, self.config.clone(), self.failure_detector.clone(), listeners, self.now)
            .unwrap_or_else(|e| panic!("invalid test configuration: {}", e));
        self.members.insert(addr, TestMember { protocol, listener });
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn generation(&self) -> MembershipGeneration {
        self.generation
    }

    fn member(&self, number: u16) -> &TestMember {
        self.members.get(&test_node_addr_from_number(number))
            .unwrap_or_else(|| panic!("node {} is not part of the test group", number))
    }

    fn member_mut(&mut self, addr: NodeAddr) -> &mut TestMember {
        self.members.get_mut(&addr)
            .unwrap_or_else(|| panic!("node {:?} is not part of the test group", addr))
    }

    pub fn protocol(&self, number: u16) -> &MulticastProtocol {
        &self.member(number).protocol
    }

    /// `(sender, message id)` of the messages delivered on a node, in delivery order
    pub fn delivered(&self, number: u16) -> Vec<(u64, MessageId)> {
        self.member(number).listener.message_ids()
    }

    pub fn delivered_payloads(&self, number: u16) -> Vec<Bytes> {
        self.member(number).listener.payloads()
    }

    pub fn listener(&self, number: u16) -> Arc<CollectingListener> {
        self.member(number).listener.clone()
    }

    pub fn set_drop_filter(&mut self, filter: impl FnMut(NodeAddr, NodeAddr, &GroupFrame) -> bool + Send + 'static) {
        self.drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&mut self) {
        self.drop_filter = None;
    }

    pub fn is_failed(&self, addr: NodeAddr) -> bool {
        !self.failure_detector.is_healthy_member(&addr)
    }

    fn live_members(&self) -> Vec<NodeAddr> {
        self.members.keys()
            .copied()
            .filter(|&addr| !self.is_failed(addr))
            .collect()
    }

    /// Offers a message on a node. The resulting frames are in flight but not delivered yet.
    pub fn send(&mut self, number: u16, payload: &[u8], flags: MessageFlags) -> MessageId {
        let addr = test_node_addr_from_number(number);
        let now = self.now;
        let message_id = self.member_mut(addr).protocol.send(Bytes::copy_from_slice(payload), flags, now)
            .unwrap_or_else(|e| panic!("sending on node {} failed: {}", number, e));
        self.collect(addr);
        message_id
    }

    fn collect(&mut self, from: NodeAddr) {
        let Some(member) = self.members.get_mut(&from) else {
            return;
        };
        for (to, frame) in member.protocol.take_frames() {
            let mut buf = BytesMut::new();
            frame.ser(&mut buf);
            self.in_flight.push_back((from, to, buf.freeze()));
        }
    }

    /// Delivers frames in flight, including those sent in reaction to them, until the network is
    ///  quiet.
    pub fn pump(&mut self) {
        while let Some((from, to, buf)) = self.in_flight.pop_front() {
            if self.is_failed(from) || self.is_failed(to) {
                trace!("discarding frame from {:?} to {:?} involving a failed node", from, to);
                continue;
            }

            let frame = GroupFrame::deser(&buf)
                .unwrap_or_else(|e| panic!("malformed frame from {:?}: {}", from, e));
            if let Some(filter) = &mut self.drop_filter {
                if filter(from, to, &frame) {
                    trace!("dropping frame from {:?} to {:?}: {:?}", from, to, frame);
                    continue;
                }
            }

            let now = self.now;
            let Some(member) = self.members.get_mut(&to) else {
                continue;
            };
            if let Err(e) = member.protocol.on_frame(from, frame, now) {
                panic!("protocol fault on {:?} processing a frame from {:?}: {}", to, from, e);
            }
            self.collect(to);
        }
    }

    /// Advances time and runs the timer of every live node.
    pub fn tick(&mut self, duration: Duration) {
        self.now += duration;
        let now = self.now;
        for addr in self.live_members() {
            if let Err(e) = self.member_mut(addr).protocol.on_timer(now) {
                panic!("protocol fault on {:?} in timer: {}", addr, e);
            }
            self.collect(addr);
        }
        self.pump();
    }

    /// Advances time in steps of the configured timer resolution.
    pub fn run_for(&mut self, duration: Duration) {
        let step = self.config.tick_interval;
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            self.tick(step);
            elapsed += step;
        }
    }

    /// Marks a node as failed and notifies all live nodes.
    pub fn fail(&mut self, number: u16) {
        let failed = test_node_addr_from_number(number);
        self.failure_detector.fail(failed);

        let now = self.now;
        for addr in self.live_members() {
            if let Err(e) = self.member_mut(addr).protocol.on_member_failed(failed, now) {
                panic!("protocol fault on {:?} handling the failure of {:?}: {}", addr, failed, e);
            }
            self.collect(addr);
        }
        self.pump();
    }

    /// Runs a complete flush to a new view with the given members, all of which must be live.
    pub fn reconfigure(&mut self, members: &[u16]) {
        self.generation += 1;
        let view = GroupView::new(self.generation, members.iter()
            .map(|&n| test_node_addr_from_number(n))
            .collect());
        let participants = view.members.clone();
        let now = self.now;

        for &addr in &participants {
            if let Err(e) = self.member_mut(addr).protocol.start_flush(view.clone(), now) {
                panic!("protocol fault on {:?} starting flush {}: {}", addr, view.generation, e);
            }
            self.collect(addr);
        }
        self.pump();

        for &addr in &participants {
            self.member_mut(addr).protocol.before_process_flush();
            self.collect(addr);
        }
        self.pump();

        for &addr in &participants {
            assert!(self.member_mut(addr).protocol.process_flush(), "{:?} did not finish flush {}", addr, view.generation);
        }

        for &addr in &participants {
            if let Err(e) = self.member_mut(addr).protocol.end_flush(now) {
                panic!("protocol fault on {:?} ending flush {}: {}", addr, view.generation, e);
            }
            self.collect(addr);
        }
        self.pump();
    }
}
