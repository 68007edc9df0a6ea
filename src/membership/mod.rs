//! Interfaces consumed from the membership / failure detector service. This layer does not
//!  decide who is alive or drive reconfiguration; it reacts to what it is told here and through
//!  the flush callbacks on [crate::multicast::protocol::MulticastProtocol].

use std::fmt::Debug;
#[cfg(test)] use mockall::automock;

use crate::messaging::node_addr::NodeAddr;


/// Identifier of a group view. Increases with every reconfiguration; every bundle carries the
///  generation it was built under.
pub type MembershipGeneration = u64;

/// A snapshot of group membership as agreed by the membership service.
///
/// The member list is ordered by rank: the first member is the coordinator, and ties during
///  stabilization are broken in favor of the lower rank.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupView {
    pub generation: MembershipGeneration,
    pub members: Vec<NodeAddr>,
}

impl GroupView {
    pub fn new(generation: MembershipGeneration, members: Vec<NodeAddr>) -> GroupView {
        GroupView {
            generation,
            members,
        }
    }

    pub fn coordinator(&self) -> Option<NodeAddr> {
        self.members.first().copied()
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.members.contains(addr)
    }

    pub fn rank(&self, addr: &NodeAddr) -> Option<usize> {
        self.members.iter()
            .position(|m| m == addr)
    }

    /// all members except `myself`
    pub fn peers(&self, myself: NodeAddr) -> impl Iterator<Item=NodeAddr> + '_ {
        self.members.iter()
            .copied()
            .filter(move |&m| m != myself)
    }
}

#[cfg_attr(test, automock)]
pub trait FailureDetector: Debug + Send + Sync {
    fn is_healthy_member(&self, addr: &NodeAddr) -> bool;
    fn failed_members(&self) -> Vec<NodeAddr>;
    fn left_members(&self) -> Vec<NodeAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::node::test_node_addr_from_number;

    #[test]
    fn test_group_view() {
        let view = GroupView::new(3, vec![
            test_node_addr_from_number(2),
            test_node_addr_from_number(1),
            test_node_addr_from_number(3),
        ]);

        assert_eq!(view.coordinator(), Some(test_node_addr_from_number(2)));
        assert_eq!(view.rank(&test_node_addr_from_number(1)), Some(1));
        assert_eq!(view.rank(&test_node_addr_from_number(4)), None);
        assert!(view.contains(&test_node_addr_from_number(3)));
        assert_eq!(view.peers(test_node_addr_from_number(1)).collect::<Vec<_>>(), vec![
            test_node_addr_from_number(2),
            test_node_addr_from_number(3),
        ]);
        assert_eq!(GroupView::new(1, vec![]).coordinator(), None);
    }
}
