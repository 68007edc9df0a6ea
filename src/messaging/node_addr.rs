use anyhow::anyhow;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};


/// Identity of a group member: its network address plus a 'unique' part that distinguishes
///  incarnations of a node on the same address.
///
/// A node that fails and comes back on the same address must not be mistaken for its previous
///  incarnation - its per-sender message ids start over at 1, and receivers still holding queues
///  for the old incarnation would otherwise drop its messages as stale. The membership service
///  initializes the unique part (typically from the process start time).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeAddr {
    pub unique: u64,
    pub socket_addr: SocketAddr,
}
impl Hash for NodeAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique.hash(state);
        match self.socket_addr {
            SocketAddr::V4(s) => s.ip().to_bits().hash(state),
            SocketAddr::V6(s) => s.ip().to_bits().hash(state),
        };
        self.socket_addr.port().hash(state);
    }
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}]", self.socket_addr, self.unique)
    }
}

impl NodeAddr {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.unique);

        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let unique = buf.try_get_u64()?;

        let socket_addr = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid socket address discriminator: {}", n));
            }
        };
        Ok(NodeAddr {
            unique,
            socket_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::messaging::node_addr::NodeAddr;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[rstest]
    #[case(NodeAddr { unique: 5, socket_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9876).into() })]
    #[case(NodeAddr { unique: 758964, socket_addr: "4.5.6.7:89".parse().unwrap() })]
    #[case(NodeAddr { unique: u64::MAX, socket_addr: "[2001:db8::1]:8080".parse().unwrap() })]
    fn test_ser_deser(#[case] addr: NodeAddr) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        let deser = NodeAddr::try_deser(&mut buf);
        assert_eq!(deser.unwrap(), addr);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_unique(vec![0,0,0,1])]
    #[case::bad_discriminator(vec![0,0,0,0,0,0,0,1, 5, 1,2,3,4, 0,9])]
    #[case::truncated_v4(vec![0,0,0,0,0,0,0,1, 4, 1,2,3])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut buf = raw.as_slice();
        assert!(NodeAddr::try_deser(&mut buf).is_err());
    }
}
