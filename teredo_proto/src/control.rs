use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::icmpv6::{
    checksum, Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet,
};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::Packet;

use teredo::{
    is_valid_prefix, TeredoEndpoint, ALL_ROUTERS, FLAG_CONE, SOLICIT_SOURCE_CONE,
    SOLICIT_SOURCE_RESTRICTED,
};

use crate::packet::{TeredoPacket, IPV6_HEADER_LEN};

const ICMPV6_HEADER_LEN: usize = 4;
/// Router Solicitation: ICMPv6 header plus the reserved word.
const SOLICIT_LEN: usize = ICMPV6_HEADER_LEN + 4;
/// Echo probe: ICMPv6 header plus the 8-byte nonce spread over
/// identifier, sequence number and the first payload word.
const PROBE_LEN: usize = ICMPV6_HEADER_LEN + 8;

const OPT_PREFIX_INFORMATION: u8 = 3;

fn solicit_source(cone: bool) -> Ipv6Addr {
    if cone {
        SOLICIT_SOURCE_CONE
    } else {
        SOLICIT_SOURCE_RESTRICTED
    }
}

fn build_ipv6(
    buf: &mut [u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: IpNextHeaderProtocol,
    payload_len: u16,
    hop_limit: u8,
) {
    let mut ip6 = MutableIpv6Packet::new(buf).unwrap();
    ip6.set_version(6);
    ip6.set_payload_length(payload_len);
    ip6.set_next_header(next_header);
    ip6.set_hop_limit(hop_limit);
    ip6.set_source(src);
    ip6.set_destination(dst);
}

fn finalize_checksum(buf: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) {
    let sum = {
        let icmp = Icmpv6Packet::new(&buf[IPV6_HEADER_LEN..]).unwrap();
        checksum(&icmp, &src, &dst)
    };
    let mut icmp = MutableIcmpv6Packet::new(&mut buf[IPV6_HEADER_LEN..]).unwrap();
    icmp.set_checksum(sum);
}

/// Builds the Router Solicitation sent to the server during
/// qualification. The link-local source address advertises which NAT
/// type is being probed; the matching authentication header is prepended
/// by the caller when the datagram is emitted.
pub fn router_solicitation(cone: bool) -> Vec<u8> {
    let src = solicit_source(cone);
    let mut buf = vec![0u8; IPV6_HEADER_LEN + SOLICIT_LEN];
    build_ipv6(
        &mut buf,
        src,
        ALL_ROUTERS,
        IpNextHeaderProtocols::Icmpv6,
        SOLICIT_LEN as u16,
        255,
    );
    {
        let mut icmp = MutableIcmpv6Packet::new(&mut buf[IPV6_HEADER_LEN..]).unwrap();
        icmp.set_icmpv6_type(Icmpv6Types::RouterSolicit);
        icmp.set_icmpv6_code(Icmpv6Code::new(0));
    }
    finalize_checksum(&mut buf, src, ALL_ROUTERS);
    buf
}

/// Validates a Router Advertisement answering a solicitation and derives
/// the candidate address from its prefix information option and the
/// datagram's origin indication.
///
/// Advertisements addressed to the wrong probe sentinel (cone flag
/// mismatch), lacking a usable /64 prefix information option, or arriving
/// without an origin indication are rejected.
pub fn parse_router_advert(
    packet: &TeredoPacket,
    server_ipv4: Ipv4Addr,
    cone: bool,
) -> Option<TeredoEndpoint> {
    let ip6 = Ipv6Packet::new(&packet.ipv6)?;
    if ip6.get_version() != 6
        || ip6.get_next_header() != IpNextHeaderProtocols::Icmpv6
        || ip6.get_destination() != solicit_source(cone)
    {
        return None;
    }

    let icmp = Icmpv6Packet::new(ip6.payload())?;
    if icmp.get_icmpv6_type() != Icmpv6Types::RouterAdvert
        || icmp.get_icmpv6_code() != Icmpv6Code::new(0)
    {
        return None;
    }

    // Hop limit, M/O flags, router lifetime and the reachable/retrans
    // timers precede the options.
    let mut options = icmp.payload().get(12..)?;

    let mut prefix = None;
    while options.len() >= 2 {
        let length = options[1] as usize * 8;
        if length == 0 || options.len() < length {
            return None;
        }
        if options[0] == OPT_PREFIX_INFORMATION {
            if length != 32 || options[2] != 64 {
                return None;
            }
            prefix = Some(u32::from_be_bytes(options[16..20].try_into().unwrap()));
        }
        options = &options[length..];
    }

    let prefix = prefix?;
    if !is_valid_prefix(prefix) {
        return None;
    }
    let origin = packet.origin?;

    Some(TeredoEndpoint {
        prefix,
        server_ipv4,
        flags: if cone { FLAG_CONE } else { 0 },
        client_port: origin.port,
        client_ipv4: origin.ipv4,
    })
}

/// Builds a bubble: an IPv6 header with no payload and no next header,
/// sent solely to create or refresh a NAT binding.
pub fn bubble(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    let mut buf = vec![0u8; IPV6_HEADER_LEN];
    build_ipv6(
        &mut buf,
        src,
        dst,
        IpNextHeaderProtocols::Ipv6NoNxt,
        0,
        255,
    );
    buf
}

pub fn is_bubble(ip6: &Ipv6Packet) -> bool {
    ip6.get_payload_length() == 0 && ip6.get_next_header() == IpNextHeaderProtocols::Ipv6NoNxt
}

/// Builds the ICMPv6 Echo Request used as a direct-connectivity probe.
/// The 8-byte nonce fills the identifier, the sequence number and the
/// first four payload bytes.
pub fn echo_request(src: Ipv6Addr, dst: Ipv6Addr, nonce: &[u8; 8]) -> Vec<u8> {
    let mut buf = vec![0u8; IPV6_HEADER_LEN + PROBE_LEN];
    build_ipv6(
        &mut buf,
        src,
        dst,
        IpNextHeaderProtocols::Icmpv6,
        PROBE_LEN as u16,
        64,
    );
    {
        let mut icmp = MutableIcmpv6Packet::new(&mut buf[IPV6_HEADER_LEN..]).unwrap();
        icmp.set_icmpv6_type(Icmpv6Types::EchoRequest);
        icmp.set_icmpv6_code(Icmpv6Code::new(0));
        icmp.set_payload(nonce);
    }
    finalize_checksum(&mut buf, src, dst);
    buf
}

/// Whether `ip6` is an Echo Reply answering the probe that carried
/// `nonce`.
pub fn check_echo_reply(ip6: &Ipv6Packet, nonce: &[u8; 8]) -> bool {
    if ip6.get_next_header() != IpNextHeaderProtocols::Icmpv6 {
        return false;
    }
    match Icmpv6Packet::new(ip6.payload()) {
        Some(icmp) => {
            icmp.get_icmpv6_type() == Icmpv6Types::EchoReply
                && icmp.get_icmpv6_code() == Icmpv6Code::new(0)
                && icmp.payload().len() >= 8
                && icmp.payload()[..8] == nonce[..]
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::OriginIndication;
    use std::str::FromStr;

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    fn build_router_advert(cone: bool, prefix: u32, prefix_len: u8) -> Vec<u8> {
        let option_len = 32;
        let payload_len = ICMPV6_HEADER_LEN + 12 + option_len;
        let mut buf = vec![0u8; IPV6_HEADER_LEN + payload_len];
        let src = Ipv6Addr::from_str("fe80::1").unwrap();
        build_ipv6(
            &mut buf,
            src,
            solicit_source(cone),
            IpNextHeaderProtocols::Icmpv6,
            payload_len as u16,
            255,
        );
        {
            let mut icmp = MutableIcmpv6Packet::new(&mut buf[IPV6_HEADER_LEN..]).unwrap();
            icmp.set_icmpv6_type(Icmpv6Types::RouterAdvert);
            icmp.set_icmpv6_code(Icmpv6Code::new(0));
        }
        let options = &mut buf[IPV6_HEADER_LEN + ICMPV6_HEADER_LEN + 12..];
        options[0] = OPT_PREFIX_INFORMATION;
        options[1] = 4; // length in units of 8 bytes
        options[2] = prefix_len;
        options[16..20].copy_from_slice(&prefix.to_be_bytes());
        finalize_checksum(&mut buf, src, solicit_source(cone));
        buf
    }

    fn wrap_advert(ipv6: Vec<u8>, origin: Option<OriginIndication>) -> TeredoPacket {
        TeredoPacket {
            source_ipv4: SERVER,
            source_port: teredo::TEREDO_PORT,
            auth_nonce: Some([0u8; 8]),
            conf_byte: Some(0),
            origin,
            ipv6,
        }
    }

    #[test]
    fn solicitation_layout() {
        let rs = router_solicitation(true);
        assert_eq!(rs.len(), 48);

        let ip6 = Ipv6Packet::new(&rs).expect("Failed to parse solicitation");
        assert_eq!(ip6.get_version(), 6);
        assert_eq!(ip6.get_hop_limit(), 255);
        assert_eq!(ip6.get_next_header(), IpNextHeaderProtocols::Icmpv6);
        assert_eq!(ip6.get_source(), SOLICIT_SOURCE_CONE);
        assert_eq!(ip6.get_destination(), ALL_ROUTERS);
        assert_eq!(ip6.get_payload_length(), 8);

        let icmp = Icmpv6Packet::new(ip6.payload()).unwrap();
        assert_eq!(icmp.get_icmpv6_type(), Icmpv6Types::RouterSolicit);

        let restricted = router_solicitation(false);
        let ip6 = Ipv6Packet::new(&restricted).unwrap();
        assert_eq!(ip6.get_source(), SOLICIT_SOURCE_RESTRICTED);
    }

    #[test]
    fn advert_yields_candidate_address() {
        let origin = OriginIndication {
            ipv4: Ipv4Addr::new(203, 0, 113, 5),
            port: 40000,
        };
        let packet = wrap_advert(build_router_advert(true, 0x20010000, 64), Some(origin));

        let candidate =
            parse_router_advert(&packet, SERVER, true).expect("Advertisement rejected");
        assert_eq!(candidate.prefix, 0x20010000);
        assert_eq!(candidate.server_ipv4, SERVER);
        assert!(candidate.is_cone());
        assert_eq!(candidate.client_ipv4, origin.ipv4);
        assert_eq!(candidate.client_port, origin.port);
    }

    #[test]
    fn advert_cone_mismatch_rejected() {
        let origin = OriginIndication {
            ipv4: Ipv4Addr::new(203, 0, 113, 5),
            port: 40000,
        };
        // Advertisement answers a cone probe, engine expects restricted.
        let packet = wrap_advert(build_router_advert(true, 0x20010000, 64), Some(origin));
        assert!(parse_router_advert(&packet, SERVER, false).is_none());
    }

    #[test]
    fn advert_without_origin_rejected() {
        let packet = wrap_advert(build_router_advert(true, 0x20010000, 64), None);
        assert!(parse_router_advert(&packet, SERVER, true).is_none());
    }

    #[test]
    fn advert_with_bad_prefix_rejected() {
        let origin = OriginIndication {
            ipv4: Ipv4Addr::new(203, 0, 113, 5),
            port: 40000,
        };
        let unset = wrap_advert(
            build_router_advert(true, teredo::PREFIX_UNSET, 64),
            Some(origin),
        );
        assert!(parse_router_advert(&unset, SERVER, true).is_none());

        let wrong_len = wrap_advert(build_router_advert(true, 0x20010000, 48), Some(origin));
        assert!(parse_router_advert(&wrong_len, SERVER, true).is_none());
    }

    #[test]
    fn bubble_shape() {
        let src = Ipv6Addr::from_str("2001:0:c000:201:8000:63bf:34ff:8efa").unwrap();
        let dst = Ipv6Addr::from_str("2001:0:c633:6409:0:3039:3dfe:8ef6").unwrap();
        let b = bubble(src, dst);
        assert_eq!(b.len(), 40);

        let ip6 = Ipv6Packet::new(&b).unwrap();
        assert_eq!(ip6.get_source(), src);
        assert_eq!(ip6.get_destination(), dst);
        assert!(is_bubble(&ip6));

        let probe = echo_request(src, dst, &[0u8; 8]);
        assert!(!is_bubble(&Ipv6Packet::new(&probe).unwrap()));
    }

    #[test]
    fn echo_probe_round_trip() {
        let src = Ipv6Addr::from_str("2001:0:c000:201:8000:63bf:34ff:8efa").unwrap();
        let dst = Ipv6Addr::from_str("2001:db8::1").unwrap();
        let nonce = [1u8, 2, 3, 4, 5, 6, 7, 8];

        let request = echo_request(src, dst, &nonce);
        assert_eq!(request.len(), 52);

        // Turn the request into the reply the peer would send back.
        let mut reply = request.clone();
        {
            let mut ip6 = MutableIpv6Packet::new(&mut reply).unwrap();
            ip6.set_source(dst);
            ip6.set_destination(src);
        }
        {
            let mut icmp = MutableIcmpv6Packet::new(&mut reply[IPV6_HEADER_LEN..]).unwrap();
            icmp.set_icmpv6_type(Icmpv6Types::EchoReply);
        }
        finalize_checksum(&mut reply, dst, src);

        let ip6 = Ipv6Packet::new(&reply).unwrap();
        assert!(check_echo_reply(&ip6, &nonce));
        assert!(!check_echo_reply(&ip6, &[9u8; 8]));

        // The original request is not a reply.
        assert!(!check_echo_reply(&Ipv6Packet::new(&request).unwrap(), &nonce));
    }
}
