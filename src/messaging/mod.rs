pub mod group_id;
pub mod node_addr;
pub mod transport;
