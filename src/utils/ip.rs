use std::net::{SocketAddrV4, SocketAddrV6};

/// Peer endpoints in tracker responses arrive as packed records: 4 address
/// octets followed by 2 big-endian port bytes. A trailing partial record is
/// ignored.
pub fn compact_v4_peers(data: &[u8]) -> impl Iterator<Item = SocketAddrV4> + '_ {
    data.chunks_exact(6).map(|record| {
        let port = u16::from_be_bytes([record[4], record[5]]);
        SocketAddrV4::new([record[0], record[1], record[2], record[3]].into(), port)
    })
}

/// IPv6 variant of [`compact_v4_peers`]: 16 address octets + 2 port bytes
/// per record.
pub fn compact_v6_peers(data: &[u8]) -> impl Iterator<Item = SocketAddrV6> + '_ {
    data.chunks_exact(18).map(|record| {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&record[..16]);
        let port = u16::from_be_bytes([record[16], record[17]]);
        SocketAddrV6::new(octets.into(), port, 0, 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ipv4_records_decode_address_and_port() {
        let data = [10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 1, 42, 0, 80];
        let peers: Vec<SocketAddrV4> = compact_v4_peers(&data).collect();
        assert_eq!(
            vec![
                "10.0.0.1:6881".parse::<SocketAddrV4>().unwrap(),
                "192.168.1.42:80".parse::<SocketAddrV4>().unwrap(),
            ],
            peers
        );
    }

    #[test]
    fn test_ipv6_record_decodes_address_and_port() {
        let mut data = [0u8; 18];
        data[..4].copy_from_slice(&[0x20, 0x01, 0x0d, 0xb8]);
        data[15] = 1;
        data[16..].copy_from_slice(&0x1ae2u16.to_be_bytes());

        let peers: Vec<SocketAddrV6> = compact_v6_peers(&data).collect();
        assert_eq!(vec!["[2001:db8::1]:6882".parse::<SocketAddrV6>().unwrap()], peers);
    }

    #[test]
    fn test_partial_trailing_record_is_ignored() {
        let data = [127, 0, 0, 1, 0x1f, 0x90, 9, 9];
        assert_eq!(
            vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080)],
            compact_v4_peers(&data).collect::<Vec<_>>()
        );
        assert_eq!(0, compact_v4_peers(&[1, 2, 3]).count());
        assert_eq!(0, compact_v6_peers(&[0u8; 17]).count());
    }
}
