use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::ipv6::Ipv6Packet;

/// UDP port of the Teredo service.
pub const TEREDO_PORT: u16 = 3544;

/// The well-known Teredo prefix (2001::/32) as its leading 32 bits.
pub const TEREDO_PREFIX: u32 = 0x2001_0000;

/// Prefix value meaning "no address assigned yet".
///
/// Must never pass [`is_valid_prefix`], so an unqualified endpoint can
/// never accidentally match real traffic.
pub const PREFIX_UNSET: u32 = 0xffff_ffff;

/// Cone bit, MSB of the flags field.
pub const FLAG_CONE: u16 = 0x8000;

/// Link-local source address of qualification traffic sent while probing
/// for a cone NAT. The interface identifier spells `TEREDO` with the high
/// byte set to 0x80.
pub const SOLICIT_SOURCE_CONE: Ipv6Addr =
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0x8000, 0x5445, 0x5245, 0x444f);

/// Link-local source address of qualification traffic sent while probing
/// for a restricted NAT. High byte of the interface identifier is 0x00.
pub const SOLICIT_SOURCE_RESTRICTED: Ipv6Addr =
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0x5445, 0x5245, 0x444f);

/// All-routers link-local multicast group, the destination of Router
/// Solicitations.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

pub fn is_valid_prefix(prefix: u32) -> bool {
    prefix != PREFIX_UNSET
}

/// Checks that an IPv4 address is usable as a global unicast destination.
///
/// Teredo servers and mapped client endpoints must live on the public
/// Internet; anything else embedded in an address is bogus.
pub fn is_ipv4_global_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.octets()[0] >= 240)
}

pub trait Teredo {
    fn is_teredo(&self) -> bool;
}

impl Teredo for [u8; 16] {
    fn is_teredo(&self) -> bool {
        self[0..4] == TEREDO_PREFIX.to_be_bytes()
    }
}

impl Teredo for Ipv6Addr {
    fn is_teredo(&self) -> bool {
        self.octets().is_teredo()
    }
}

impl<'a> Teredo for Ipv6Packet<'a> {
    fn is_teredo(&self) -> bool {
        self.get_version() == 6
            && (self.get_source().is_teredo() || self.get_destination().is_teredo())
    }
}

/// RFC 4380
/// Represents a Teredo endpoint.
///
/// The Teredo addresses are composed of 5 components:
///
/// +-------------+-------------+-------+------+-------------+
/// | Prefix      | Server IPv4 | Flags | Port | Client IPv4 |
/// +-------------+-------------+-------+------+-------------+
///
/// - Prefix: the 32-bit Teredo service prefix.
/// - Server IPv4: the IPv4 address of the Teredo server.
/// - Flags: 16 bits documenting the type of address and NAT.
/// - Port: the "mapped UDP port" of the Teredo service at the client.
/// - Client IPv4: the "mapped IPv4 address" of the client.
///
/// On the wire both the mapped port and the mapped IPv4 address are
/// obfuscated by flipping every bit (XOR with 0xFFFF and 0xFFFFFFFF).
/// This struct stores them un-obfuscated; the conversions below apply and
/// remove the obfuscation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TeredoEndpoint {
    pub prefix: u32,
    pub server_ipv4: Ipv4Addr,
    pub flags: u16,
    pub client_port: u16,
    pub client_ipv4: Ipv4Addr,
}

impl TeredoEndpoint {
    pub fn is_cone(&self) -> bool {
        self.flags & FLAG_CONE != 0
    }

    /// Whether `(ipv4, port)` is the UDP endpoint embedded in this address.
    pub fn matches_client(&self, ipv4: Ipv4Addr, port: u16) -> bool {
        self.client_ipv4 == ipv4 && self.client_port == port
    }

    pub fn to_ipv6(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0..4].copy_from_slice(&self.prefix.to_be_bytes());
        octets[4..8].copy_from_slice(&self.server_ipv4.octets());
        octets[8..10].copy_from_slice(&self.flags.to_be_bytes());
        octets[10..12].copy_from_slice(&(self.client_port ^ 0xFFFF).to_be_bytes());
        octets[12..16].copy_from_slice(&(u32::from(self.client_ipv4) ^ 0xFFFF_FFFF).to_be_bytes());
        Ipv6Addr::from(octets)
    }
}

impl From<[u8; 16]> for TeredoEndpoint {
    fn from(value: [u8; 16]) -> Self {
        TeredoEndpoint {
            prefix: u32::from_be_bytes(value[0..4].try_into().unwrap()),
            server_ipv4: u32::from_be_bytes(value[4..8].try_into().unwrap()).into(),
            flags: u16::from_be_bytes(value[8..10].try_into().unwrap()),
            client_port: u16::from_be_bytes(value[10..12].try_into().unwrap()) ^ 0xFFFF,
            client_ipv4: (u32::from_be_bytes(value[12..16].try_into().unwrap()) ^ 0xFFFF_FFFF)
                .into(),
        }
    }
}

impl From<Ipv6Addr> for TeredoEndpoint {
    fn from(value: Ipv6Addr) -> Self {
        value.octets().into()
    }
}

impl From<TeredoEndpoint> for Ipv6Addr {
    fn from(value: TeredoEndpoint) -> Self {
        value.to_ipv6()
    }
}

#[cfg(test)]
mod test {
    use super::{is_ipv4_global_unicast, is_valid_prefix, Teredo, TeredoEndpoint, PREFIX_UNSET};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    #[test]
    fn is_teredo_address() {
        let ipv6 = Ipv6Addr::from_str("2001:0:338c:24f4:43b:30e3:d2f3:c93d").unwrap();
        let ipv6_not_teredo = Ipv6Addr::from_str("2019:0:338c:24f4:43b:30e3:d2f3:c93d").unwrap();

        assert!(ipv6.is_teredo());
        assert!(!ipv6_not_teredo.is_teredo());
    }

    #[test]
    fn from_ipv6_endpoint() {
        let ipv6 = Ipv6Addr::from_str("2001:0:338c:24f4:43b:30e3:d2f3:c93d").unwrap();
        let ep = TeredoEndpoint::from(ipv6);

        assert_eq!(ep.prefix, 0x20010000);
        assert_eq!(ep.server_ipv4, Ipv4Addr::from_str("51.140.36.244").unwrap());
        assert_eq!(ep.client_ipv4, Ipv4Addr::from_str("45.12.54.194").unwrap());
        assert_eq!(ep.client_port, 53020);
        assert!(!ep.is_cone());
    }

    #[test]
    fn ipv6_round_trip() {
        let ep = TeredoEndpoint {
            prefix: 0x20010000,
            server_ipv4: Ipv4Addr::new(192, 0, 2, 1),
            flags: super::FLAG_CONE,
            client_port: 40000,
            client_ipv4: Ipv4Addr::new(203, 0, 113, 5),
        };

        let ipv6 = ep.to_ipv6();
        assert_eq!(
            ipv6,
            Ipv6Addr::from_str("2001:0:c000:201:8000:63bf:34ff:8efa").unwrap()
        );
        assert_eq!(TeredoEndpoint::from(ipv6), ep);
        assert!(TeredoEndpoint::from(ipv6).is_cone());
    }

    #[test]
    fn matches_embedded_client() {
        let ep =
            TeredoEndpoint::from(Ipv6Addr::from_str("2001:0:c000:201:8000:63bf:34ff:8efa").unwrap());

        assert!(ep.matches_client(Ipv4Addr::new(203, 0, 113, 5), 40000));
        assert!(!ep.matches_client(Ipv4Addr::new(203, 0, 113, 5), 40001));
        assert!(!ep.matches_client(Ipv4Addr::new(203, 0, 113, 6), 40000));
    }

    #[test]
    fn unset_prefix_never_validates() {
        assert!(!is_valid_prefix(PREFIX_UNSET));
        assert!(is_valid_prefix(0x20010000));
    }

    #[test]
    fn global_unicast_ipv4() {
        assert!(is_ipv4_global_unicast(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(is_ipv4_global_unicast(Ipv4Addr::new(198, 51, 100, 9)));

        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(240, 0, 0, 1)));
        assert!(!is_ipv4_global_unicast(Ipv4Addr::new(255, 255, 255, 255)));
    }
}
