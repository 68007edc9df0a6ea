use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::messaging::group_id::GroupId;
use crate::messaging::node_addr::NodeAddr;
use crate::multicast::group_messages::{FlowControlData, GroupMessage};
use crate::multicast::Outbox;


/// The producer side of flow control: a lock count that is written by the protocol and read by
///  producers, potentially from a different task or thread.
///
/// A producer checks [FlowGate::is_locked] (or awaits [FlowGate::wait_unlocked]) before offering
///  a message. Reading a stale value is harmless - the next write corrects it, and the queue
///  accepts the message either way.
#[derive(Debug, Default)]
pub struct FlowGate {
    lock_count: AtomicUsize,
    unlocked: Notify,
}

impl FlowGate {
    pub fn new() -> FlowGate {
        Default::default()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count.load(Ordering::Acquire) > 0
    }

    pub fn lock(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        let prev = self.lock_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.unlocked.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("unlocking a flow gate that is not locked"),
        }
    }

    pub async fn wait_unlocked(&self) {
        loop {
            // register interest before checking to avoid missing a notification in between
            let notified = self.unlocked.notified();
            if !self.is_locked() {
                return;
            }
            notified.await;
        }
    }
}


/// Propagates queue lock state between peers so that producers throttle before a receiver's
///  queue grows without bound.
///
/// There are two sides to this:
/// * *local locks* are imposed by this node on a remote peer's flow, e.g. because this node's
///    receive queue for that peer is over capacity. They are counted per (peer, flow) because
///    there can be several reasons at the same time (the ordered queue holds back all peers).
///    The first lock sends a 'blocked' notification, the last unlock sends 'unblocked'.
/// * *remote locks* are notifications received from peers; each flow's local [FlowGate] stays
///    locked while at least one peer blocks it.
pub struct FlowControl {
    local_locks: BTreeMap<(NodeAddr, GroupId), usize>,
    remote_locks: BTreeMap<GroupId, BTreeSet<NodeAddr>>,
    gates: FxHashMap<GroupId, Arc<FlowGate>>,
}

impl FlowControl {
    pub fn new() -> FlowControl {
        FlowControl {
            local_locks: Default::default(),
            remote_locks: Default::default(),
            gates: Default::default(),
        }
    }

    pub fn register_gate(&mut self, flow: GroupId, gate: Arc<FlowGate>) {
        self.gates.insert(flow, gate);
    }

    pub fn lock_flow(&mut self, peer: NodeAddr, flow: GroupId, outbox: &mut Outbox) {
        let count = self.local_locks.entry((peer, flow)).or_default();
        *count += 1;
        if *count == 1 {
            debug!("blocking flow {:?} of {:?}", flow, peer);
            outbox.push((peer, GroupMessage::FlowControl(FlowControlData { flow, blocked: true })));
        }
    }

    pub fn unlock_flow(&mut self, peer: NodeAddr, flow: GroupId, outbox: &mut Outbox) {
        match self.local_locks.get_mut(&(peer, flow)) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            Some(_) => {
                debug!("unblocking flow {:?} of {:?}", flow, peer);
                self.local_locks.remove(&(peer, flow));
                outbox.push((peer, GroupMessage::FlowControl(FlowControlData { flow, blocked: false })));
            }
            None => {
                warn!("unlocking flow {:?} of {:?} which is not locked", flow, peer);
            }
        }
    }

    pub fn on_flow_control_message(&mut self, from: NodeAddr, data: FlowControlData) {
        let blockers = self.remote_locks.entry(data.flow).or_default();
        let changed = if data.blocked {
            blockers.insert(from)
        }
        else {
            blockers.remove(&from)
        };
        let now_empty = blockers.is_empty();
        if now_empty {
            self.remote_locks.remove(&data.flow);
        }

        if !changed {
            debug!("redundant flow control notification {:?} from {:?}", data, from);
            return;
        }

        let Some(gate) = self.gates.get(&data.flow) else {
            debug!("flow control notification for unknown flow {:?} - ignoring", data.flow);
            return;
        };
        if data.blocked {
            if blockers_count(&self.remote_locks, data.flow) == 1 {
                gate.lock();
            }
        }
        else if now_empty {
            gate.unlock();
        }
    }

    /// A failed peer can neither be unblocked by us nor unblock us, so all of its locks are
    ///  released locally without sending anything.
    pub fn on_member_failed(&mut self, member: NodeAddr) {
        self.local_locks.retain(|(peer, _), _| *peer != member);

        let mut released = Vec::new();
        for (flow, blockers) in self.remote_locks.iter_mut() {
            if blockers.remove(&member) && blockers.is_empty() {
                released.push(*flow);
            }
        }
        for flow in released {
            debug!("releasing flow {:?} which was blocked by failed member {:?}", flow, member);
            self.remote_locks.remove(&flow);
            if let Some(gate) = self.gates.get(&flow) {
                gate.unlock();
            }
        }
    }
}

fn blockers_count(remote_locks: &BTreeMap<GroupId, BTreeSet<NodeAddr>>, flow: GroupId) -> usize {
    remote_locks.get(&flow)
        .map(|b| b.len())
        .unwrap_or(0)
}
