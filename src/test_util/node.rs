use std::net::{Ipv4Addr, SocketAddrV4};
use crate::messaging::node_addr::NodeAddr;


/// convenience method for unit test code: create a [NodeAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_node_addr_from_number(number: u16) -> NodeAddr {
    NodeAddr {
        unique: number.into(),
        socket_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into(),
    }
}
