//! Reliable, optionally totally ordered, failure-atomic multicast to the members of a group.
//!
//! ## Overview
//!
//! Each member runs one [protocol::MulticastProtocol] per group. Outgoing application messages
//!  are assigned per-sender message ids, buffered in a [send_queue::SendQueue] and sent to all
//!  peers in *bundles*. Each peer keeps a [receive_queue::ReceiveQueue] per sender that releases
//!  messages in per-sender id order, and (with global ordering enabled) routes them through the
//!  group's [ordered_queue::OrderedQueue] which releases them in the order assigned by the
//!  coordinator ([total_order::TotalOrder]).
//!
//! Receivers acknowledge what they received; once every live peer acknowledged a message, the
//!  sender *completes* it, delivers it locally and stops retaining it. The completion watermark
//!  is piggybacked on bundles so receivers can discard retained messages as well.
//!
//! ## Failures
//!
//! Messages are retained ('durable' mode) so that when a sender fails in the middle of sending
//!  a bundle, the survivors can fill each other's gaps during the next reconfiguration
//!  ('flush'). This is [retransmit::MessageRetransmit]: members exchange how far they got with
//!  each failed sender, and the best-positioned member re-sends what the others are missing.
//!
//! ## Flow control
//!
//! All queues account for the bytes they hold ([capacity::QueueCapacityController]). When a
//!  receiver's queue grows beyond its lock threshold, [flow_control::FlowControl] notifies the
//!  producing peer, which blocks its local producers until the queue drained.
//!
//! ## Processing model
//!
//! All of this is synchronous, run-to-completion code owned by a single processing loop
//!  ([driver::run_multicast]). Operations write outgoing messages into an [Outbox] that the
//!  loop serializes and sends afterwards.

pub mod capacity;
pub mod delivery;
pub mod driver;
pub mod flow_control;
pub mod group_messages;
pub mod multicast_config;
pub mod multicast_error;
pub mod multicast_message;
pub mod ordered_queue;
pub mod protocol;
pub mod receive_queue;
pub mod retransmit;
pub mod send_queue;
pub mod total_order;

#[cfg(test)]
mod scenario_tests;

use crate::messaging::node_addr::NodeAddr;
use crate::multicast::group_messages::GroupMessage;


/// Per-sender message sequence number. The first message a node sends has id 1, 0 means
///  'nothing'.
pub type MessageId = u64;

/// Global sequence number assigned by the coordinator. 0 means 'no order (yet)'.
pub type Order = u64;

/// Messages produced by an operation, to be sent by the processing loop.
pub type Outbox = Vec<(NodeAddr, GroupMessage)>;
