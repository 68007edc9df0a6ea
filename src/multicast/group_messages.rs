use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::membership::MembershipGeneration;
use crate::messaging::group_id::GroupId;
use crate::messaging::node_addr::NodeAddr;
use crate::multicast::multicast_message::MulticastMessage;
use crate::multicast::{MessageId, Order};
use crate::util::buf::{put_bool, put_bytes, try_get_bool, try_get_bytes};


/// Every message of this layer goes over the wire in a frame that identifies the group and the
///  membership generation of the sending node.
///
/// ```ascii
/// 0:  group id (u64)
/// 8:  generation (u64)
/// 16: message kind (u8)
/// 17: message specific data
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupFrame {
    pub group: GroupId,
    pub generation: MembershipGeneration,
    pub message: GroupMessage,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupMessage {
    Bundle(BundleData),
    Acknowledge(AcknowledgeData),
    Complete(CompleteData),
    TotalOrder(TotalOrderData),
    Retransmit(RetransmitData),
    Exchange(ExchangeData),
    FlowControl(FlowControlData),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum GroupMessageKind {
    Bundle = 1,
    Acknowledge = 2,
    Complete = 3,
    TotalOrder = 4,
    Retransmit = 5,
    Exchange = 6,
    FlowControl = 7,
}

/// One transport write's worth of application messages, plus the sender's completion watermark
///  and (optionally) an acknowledgement for the recipient's own messages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleData {
    pub completed_message_id: MessageId,
    pub acknowledge: Option<AcknowledgeData>,
    /// see [crate::multicast::multicast_message::ser_bundle_payload]
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AcknowledgeData {
    pub last_received_message_id: MessageId,
    /// `false` if the acknowledgement is piggybacked on a bundle
    pub standalone: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompleteData {
    pub completed_message_id: MessageId,
}

/// A contiguous block of global orders assigned by the coordinator to a contiguous run of one
///  sender's messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OrderInfo {
    pub sender: NodeAddr,
    pub start_message_id: MessageId,
    pub start_order: Order,
    pub count: u32,
}

impl OrderInfo {
    /// one past the last order of the block
    pub fn end_order(&self) -> Order {
        self.start_order.saturating_add(self.count as u64)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.sender.ser(buf);
        buf.put_u64(self.start_message_id);
        buf.put_u64(self.start_order);
        buf.put_u32(self.count);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<OrderInfo> {
        Ok(OrderInfo {
            sender: NodeAddr::try_deser(buf)?,
            start_message_id: buf.try_get_u64()?,
            start_order: buf.try_get_u64()?,
            count: buf.try_get_u32()?,
        })
    }
}

/// Orders assigned by the coordinator since its previous broadcast. `next_order` is the next
///  order the coordinator will hand out; a member that joined the group starts its global
///  delivery sequence there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TotalOrderData {
    pub next_order: Order,
    pub orders: Vec<OrderInfo>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetransmitData {
    pub failed_node: NodeAddr,
    pub flush_id: MembershipGeneration,
    pub messages: Vec<MulticastMessage>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct MissingMessagesInfo {
    pub failed_sender: NodeAddr,
    pub last_received_message_id: MessageId,
}

/// A surviving member's view of failed senders at the start of a flush.
///
/// With global ordering, it also carries the member's ordering state: the highest order it has
///  seen, the next order it will deliver, and the order assignments it knows of since its log was
///  last trimmed. All survivors adopt the union of these assignments, so an assignment that reached
///  only some of them before the coordinator failed is neither lost nor handed out twice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExchangeData {
    pub flush_id: MembershipGeneration,
    pub next_order: Order,
    /// 0 if the member does not take part in global delivery yet
    pub delivered_order: Order,
    pub orders: Vec<OrderInfo>,
    pub missing: Vec<MissingMessagesInfo>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowControlData {
    pub flow: GroupId,
    pub blocked: bool,
}

impl GroupMessage {
    fn kind(&self) -> GroupMessageKind {
        match self {
            GroupMessage::Bundle(_) => GroupMessageKind::Bundle,
            GroupMessage::Acknowledge(_) => GroupMessageKind::Acknowledge,
            GroupMessage::Complete(_) => GroupMessageKind::Complete,
            GroupMessage::TotalOrder(_) => GroupMessageKind::TotalOrder,
            GroupMessage::Retransmit(_) => GroupMessageKind::Retransmit,
            GroupMessage::Exchange(_) => GroupMessageKind::Exchange,
            GroupMessage::FlowControl(_) => GroupMessageKind::FlowControl,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            GroupMessage::Bundle(data) => {
                buf.put_u64(data.completed_message_id);
                match &data.acknowledge {
                    None => put_bool(buf, false),
                    Some(ack) => {
                        put_bool(buf, true);
                        Self::ser_acknowledge(ack, buf);
                    }
                }
                put_bytes(buf, &data.payload);
            }
            GroupMessage::Acknowledge(data) => Self::ser_acknowledge(data, buf),
            GroupMessage::Complete(data) => buf.put_u64(data.completed_message_id),
            GroupMessage::TotalOrder(data) => {
                buf.put_u64(data.next_order);
                buf.put_usize_varint(data.orders.len());
                for info in &data.orders {
                    info.ser(buf);
                }
            }
            GroupMessage::Retransmit(data) => {
                data.failed_node.ser(buf);
                buf.put_u64(data.flush_id);
                buf.put_usize_varint(data.messages.len());
                for message in &data.messages {
                    message.ser(buf);
                }
            }
            GroupMessage::Exchange(data) => {
                buf.put_u64(data.flush_id);
                buf.put_u64(data.next_order);
                buf.put_u64(data.delivered_order);
                buf.put_usize_varint(data.orders.len());
                for info in &data.orders {
                    info.ser(buf);
                }
                buf.put_usize_varint(data.missing.len());
                for info in &data.missing {
                    info.failed_sender.ser(buf);
                    buf.put_u64(info.last_received_message_id);
                }
            }
            GroupMessage::FlowControl(data) => {
                buf.put_u64(data.flow.0);
                put_bool(buf, data.blocked);
            }
        }
    }

    fn ser_acknowledge(data: &AcknowledgeData, buf: &mut impl BufMut) {
        buf.put_u64(data.last_received_message_id);
        put_bool(buf, data.standalone);
    }

    fn try_deser_acknowledge(buf: &mut impl Buf) -> anyhow::Result<AcknowledgeData> {
        Ok(AcknowledgeData {
            last_received_message_id: buf.try_get_u64()?,
            standalone: try_get_bool(buf)?,
        })
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<GroupMessage> {
        let raw_kind = buf.try_get_u8()?;
        let kind = GroupMessageKind::try_from_primitive(raw_kind)
            .map_err(|_| anyhow!("invalid message discriminator {}", raw_kind))?;

        let message = match kind {
            GroupMessageKind::Bundle => {
                let completed_message_id = buf.try_get_u64()?;
                let acknowledge = if try_get_bool(buf)? {
                    Some(Self::try_deser_acknowledge(buf)?)
                }
                else {
                    None
                };
                let payload = try_get_bytes(buf)?;
                GroupMessage::Bundle(BundleData {
                    completed_message_id,
                    acknowledge,
                    payload,
                })
            }
            GroupMessageKind::Acknowledge => GroupMessage::Acknowledge(Self::try_deser_acknowledge(buf)?),
            GroupMessageKind::Complete => GroupMessage::Complete(CompleteData {
                completed_message_id: buf.try_get_u64()?,
            }),
            GroupMessageKind::TotalOrder => {
                let next_order = buf.try_get_u64()?;
                let num_orders = buf.try_get_usize_varint()?;
                let mut orders = Vec::with_capacity(num_orders.min(1024));
                for _ in 0..num_orders {
                    orders.push(OrderInfo::try_deser(buf)?);
                }
                GroupMessage::TotalOrder(TotalOrderData { next_order, orders })
            }
            GroupMessageKind::Retransmit => {
                let failed_node = NodeAddr::try_deser(buf)?;
                let flush_id = buf.try_get_u64()?;
                let num_messages = buf.try_get_usize_varint()?;
                let mut messages = Vec::with_capacity(num_messages.min(1024));
                for _ in 0..num_messages {
                    messages.push(MulticastMessage::try_deser(buf)?);
                }
                GroupMessage::Retransmit(RetransmitData {
                    failed_node,
                    flush_id,
                    messages,
                })
            }
            GroupMessageKind::Exchange => {
                let flush_id = buf.try_get_u64()?;
                let next_order = buf.try_get_u64()?;
                let delivered_order = buf.try_get_u64()?;
                let num_orders = buf.try_get_usize_varint()?;
                let mut orders = Vec::with_capacity(num_orders.min(1024));
                for _ in 0..num_orders {
                    orders.push(OrderInfo::try_deser(buf)?);
                }
                let num_missing = buf.try_get_usize_varint()?;
                let mut missing = Vec::with_capacity(num_missing.min(1024));
                for _ in 0..num_missing {
                    missing.push(MissingMessagesInfo {
                        failed_sender: NodeAddr::try_deser(buf)?,
                        last_received_message_id: buf.try_get_u64()?,
                    });
                }
                GroupMessage::Exchange(ExchangeData {
                    flush_id,
                    next_order,
                    delivered_order,
                    orders,
                    missing,
                })
            }
            GroupMessageKind::FlowControl => GroupMessage::FlowControl(FlowControlData {
                flow: GroupId(buf.try_get_u64()?),
                blocked: try_get_bool(buf)?,
            }),
        };
        Ok(message)
    }
}

impl GroupFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.group.0);
        buf.put_u64(self.generation);
        self.message.ser(buf);
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<GroupFrame> {
        let mut buf = buf;
        let group = GroupId(buf.try_get_u64()?);
        let generation = buf.try_get_u64()?;
        let message = GroupMessage::try_deser(&mut buf)?;

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after {:?} message", buf.remaining(), message.kind()));
        }

        Ok(GroupFrame {
            group,
            generation,
            message,
        })
    }
}
