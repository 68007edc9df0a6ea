use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::messaging::group_id::GroupId;
use crate::messaging::node_addr::NodeAddr;
use crate::multicast::{MessageId, Order};
use crate::util::buf::{put_bytes, try_get_bytes};


bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MessageFlags: u8 {
        /// send a bundle immediately rather than waiting for more messages to accumulate
        const NO_DELAY = 0b0000_0001;
        /// deliver without participating in the global order, even if ordering is enabled
        const UNORDERED = 0b0000_0010;
    }
}

/// An application message as it travels through the multicast layer: the application's payload
///  plus the envelope this layer needs.
///
/// `message_id` and `order` are the failure-atomic part: the per-sender id assigned when the
///  message is offered, and the global order (0 while unknown, or forever if the message does
///  not take part in global ordering).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MulticastMessage {
    pub source: NodeAddr,
    pub group: GroupId,
    pub flags: MessageFlags,
    pub message_id: MessageId,
    pub order: Order,
    pub payload: Bytes,
}

impl MulticastMessage {
    /// size of the failure-atomic part on the wire
    pub const FAILURE_ATOMIC_PART_LEN: usize = 16;

    pub fn new(source: NodeAddr, group: GroupId, flags: MessageFlags, payload: Bytes) -> MulticastMessage {
        MulticastMessage {
            source,
            group,
            flags,
            message_id: 0,
            order: 0,
            payload,
        }
    }

    /// the number of bytes a message is accounted for in queue capacity
    pub fn size(&self) -> usize {
        self.payload.len() + Self::FAILURE_ATOMIC_PART_LEN
    }

    pub fn is_no_delay(&self) -> bool {
        self.flags.contains(MessageFlags::NO_DELAY)
    }

    /// Whether this message takes part in global ordering, given the group's configuration.
    pub fn is_ordered(&self, ordering_enabled: bool) -> bool {
        ordering_enabled && !self.flags.contains(MessageFlags::UNORDERED)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.message_id);
        buf.put_u64(self.order);
        self.source.ser(buf);
        buf.put_u64(self.group.0);
        buf.put_u8(self.flags.bits());
        put_bytes(buf, &self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MulticastMessage> {
        let message_id = buf.try_get_u64()?;
        let order = buf.try_get_u64()?;
        let source = NodeAddr::try_deser(buf)?;
        let group = GroupId(buf.try_get_u64()?);
        let raw_flags = buf.try_get_u8()?;
        let Some(flags) = MessageFlags::from_bits(raw_flags) else {
            bail!("invalid message flags {:#04x}", raw_flags);
        };
        let payload = try_get_bytes(buf)?;

        Ok(MulticastMessage {
            source,
            group,
            flags,
            message_id,
            order,
            payload,
        })
    }
}

/// Serializes a sequence of messages into a bundle payload: the number of messages, followed by
///  each message prefixed with its serialized length.
pub fn ser_bundle_payload<'a>(messages: impl ExactSizeIterator<Item=&'a MulticastMessage>) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_usize_varint(messages.len());

    let mut msg_buf = BytesMut::new();
    for message in messages {
        msg_buf.clear();
        message.ser(&mut msg_buf);
        buf.put_usize_varint(msg_buf.len());
        buf.put_slice(&msg_buf);
    }
    buf.freeze()
}

pub fn deser_bundle_payload(payload: &[u8]) -> anyhow::Result<Vec<MulticastMessage>> {
    let mut buf = payload;
    let num_messages = buf.try_get_usize_varint()?;

    let mut result = Vec::with_capacity(num_messages.min(1024));
    for _ in 0..num_messages {
        let len = buf.try_get_usize_varint()?;
        if buf.remaining() < len {
            bail!("bundle truncated: message of {} bytes, {} remaining", len, buf.remaining());
        }
        let mut msg_buf = &buf[..len];
        let message = MulticastMessage::try_deser(&mut msg_buf)?;
        if msg_buf.has_remaining() {
            bail!("message #{} has {} trailing bytes", message.message_id, msg_buf.remaining());
        }
        result.push(message);
        buf.advance(len);
    }

    if buf.has_remaining() {
        bail!("bundle has {} trailing bytes", buf.remaining());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::test_message;
    use rstest::rstest;

    #[rstest]
    #[case::empty(1, 0)]
    #[case::single(1, 1)]
    #[case::several(17, 5)]
    #[case::many(1000, 300)]
    fn test_bundle_payload(#[case] first_id: MessageId, #[case] num_messages: u64) {
        let messages = (first_id..first_id + num_messages)
            .map(|id| {
                let mut msg = test_message(3, id, if id % 2 == 0 { id * 10 } else { 0 }, format!("payload {}", id).as_bytes());
                if id % 3 == 0 {
                    msg.flags = MessageFlags::NO_DELAY | MessageFlags::UNORDERED;
                }
                msg
            })
            .collect::<Vec<_>>();

        let payload = ser_bundle_payload(messages.iter());
        let deser = deser_bundle_payload(&payload).unwrap();

        assert_eq!(deser, messages);
    }

    #[test]
    fn test_failure_atomic_part_layout() {
        let msg = test_message(1, 0x0102, 0x0304, b"");
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(&buf[..MulticastMessage::FAILURE_ATOMIC_PART_LEN], &[0,0,0,0,0,0,1,2, 0,0,0,0,0,0,3,4]);
    }

    #[rstest]
    #[case::truncated_count(vec![])]
    #[case::missing_message(vec![1])]
    #[case::length_exceeds_buffer(vec![1, 40, 0, 0])]
    #[case::trailing_bytes(vec![0, 7])]
    fn test_invalid_bundle_payload(#[case] raw: Vec<u8>) {
        assert!(deser_bundle_payload(&raw).is_err());
    }

    #[test]
    fn test_invalid_flags() {
        let mut msg_buf = BytesMut::new();
        test_message(1, 1, 0, b"x").ser(&mut msg_buf);
        let flags_offs = 16 + 15 + 8;
        msg_buf[flags_offs] = 0x80;

        let mut buf = &msg_buf[..];
        assert!(MulticastMessage::try_deser(&mut buf).is_err());
    }

    #[rstest]
    #[case::ordered(MessageFlags::empty(), true, true)]
    #[case::opted_out(MessageFlags::UNORDERED, true, false)]
    #[case::disabled(MessageFlags::empty(), false, false)]
    #[case::no_delay(MessageFlags::NO_DELAY, true, true)]
    fn test_is_ordered(#[case] flags: MessageFlags, #[case] ordering_enabled: bool, #[case] expected: bool) {
        let mut msg = test_message(1, 1, 0, b"");
        msg.flags = flags;
        assert_eq!(msg.is_ordered(ordering_enabled), expected);
    }
}
