use std::fmt::{Debug, Formatter};


/// A [GroupId] identifies a multicast group on the wire. It doubles as the flow id for flow
///  control, since each group has exactly one message flow per sender.
///
/// An id is technically a u64, but it is intended to be used as a sequence of up to eight ASCII
///  characters to give it a human-readable name, both for uniqueness and for debugging at the
///  wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GroupId(pub u64);

impl GroupId {
    pub const fn new(value: &[u8; 8]) -> GroupId {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:016X}({:?})", self.0, string_repr)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::abc(GroupId::new(b"abc\0\0\0\0\0"), "0x6162630000000000(\"abc\")")]
    #[case::full(GroupId::new(b"orders01"), "0x6F72646572733031(\"orders01\")")]
    #[case::empty(GroupId::new(b"\0\0\0\0\0\0\0\0"), "0x0000000000000000(\"\")")]
    fn test_id_debug(#[case] id: GroupId, #[case] expected: &str) {
        let formatted = format!("{:?}", id);
        assert_eq!(&formatted, expected);
    }
}
