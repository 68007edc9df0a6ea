use std::sync::Mutex;

use bytes::Bytes;

use crate::messaging::group_id::GroupId;
use crate::multicast::delivery::DeliveryListener;
use crate::multicast::multicast_message::{MessageFlags, MulticastMessage};
use crate::multicast::{MessageId, Order};
use crate::test_util::node::test_node_addr_from_number;


pub const TEST_GROUP: GroupId = GroupId::new(b"testgrp\0");

pub fn test_message(sender: u16, message_id: MessageId, order: Order, payload: &[u8]) -> MulticastMessage {
    MulticastMessage {
        source: test_node_addr_from_number(sender),
        group: TEST_GROUP,
        flags: MessageFlags::empty(),
        message_id,
        order,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// A [DeliveryListener] that records every delivered message.
#[derive(Debug, Default)]
pub struct CollectingListener {
    delivered: Mutex<Vec<MulticastMessage>>,
}

impl CollectingListener {
    pub fn messages(&self) -> Vec<MulticastMessage> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// `(sender's unique part, message id)` of delivered messages, in delivery order
    pub fn message_ids(&self) -> Vec<(u64, MessageId)> {
        self.messages().iter()
            .map(|m| (m.source.unique, m.message_id))
            .collect()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.messages().into_iter()
            .map(|m| m.payload)
            .collect()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.messages().iter()
            .map(|m| m.order)
            .collect()
    }
}

impl DeliveryListener for CollectingListener {
    fn on_delivered(&self, message: &MulticastMessage) -> anyhow::Result<()> {
        match self.delivered.lock() {
            Ok(mut delivered) => delivered.push(message.clone()),
            Err(poisoned) => poisoned.into_inner().push(message.clone()),
        }
        Ok(())
    }
}
