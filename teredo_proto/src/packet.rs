use std::io::{Cursor, Read, Seek, SeekFrom};
use std::net::Ipv4Addr;

use byteorder::{NetworkEndian, ReadBytesExt};

use crate::error::ProtoError;

type Result<T> = std::result::Result<T, ProtoError>;

/// Header tag second byte of the authentication header.
pub const AUTH_HEADER_TYPE: u8 = 0x01;
/// Header tag second byte of the origin indication.
pub const ORIGIN_INDICATION_TYPE: u8 = 0x00;

/// Largest UDP payload a Teredo datagram may occupy.
pub const MAX_UDP_PAYLOAD: usize = 65507;
pub const IPV6_HEADER_LEN: usize = 40;

/// External IPv4 endpoint reported by a server through an origin
/// indication header, un-obfuscated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginIndication {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

/// A received Teredo datagram, split into its optional headers and the
/// framed IPv6 payload.
///
/// Wire layout: `[auth header?] [origin indication?] IPv6 datagram`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeredoPacket {
    pub source_ipv4: Ipv4Addr,
    pub source_port: u16,
    pub auth_nonce: Option<[u8; 8]>,
    pub conf_byte: Option<u8>,
    pub origin: Option<OriginIndication>,
    pub ipv6: Vec<u8>,
}

fn header_tag(buf: &[u8], pos: usize) -> Option<u8> {
    if buf.len() >= pos + 2 && buf[pos] == 0x00 {
        Some(buf[pos + 1])
    } else {
        None
    }
}

impl TeredoPacket {
    /// Parses one UDP payload received from `source_ipv4:source_port`.
    ///
    /// Fails with [`ProtoError::Malformed`] if the datagram is shorter
    /// than an IPv6 header or either Teredo header is truncated. The
    /// IPv6 payload itself is not validated here.
    pub fn parse(buf: &[u8], source_ipv4: Ipv4Addr, source_port: u16) -> Result<Self> {
        if buf.len() < IPV6_HEADER_LEN {
            return Err(ProtoError::Malformed);
        }

        let mut reader = Cursor::new(buf);
        let mut auth_nonce = None;
        let mut conf_byte = None;

        if header_tag(buf, 0) == Some(AUTH_HEADER_TYPE) {
            reader.set_position(2);
            let id_len = reader.read_u8()?;
            let au_len = reader.read_u8()?;

            // Client identifier and authentication value belong to the
            // secured qualification procedure, which we do not implement.
            reader.seek(SeekFrom::Current(i64::from(id_len) + i64::from(au_len)))?;

            let mut nonce = [0u8; 8];
            reader.read_exact(&mut nonce)?;
            auth_nonce = Some(nonce);
            conf_byte = Some(reader.read_u8()?);
        }

        let mut origin = None;
        if header_tag(buf, reader.position() as usize) == Some(ORIGIN_INDICATION_TYPE) {
            reader.seek(SeekFrom::Current(2))?;
            let port = reader.read_u16::<NetworkEndian>()? ^ 0xFFFF;
            let ipv4 = reader.read_u32::<NetworkEndian>()? ^ 0xFFFF_FFFF;
            origin = Some(OriginIndication {
                ipv4: ipv4.into(),
                port,
            });
        }

        Ok(TeredoPacket {
            source_ipv4,
            source_port,
            auth_nonce,
            conf_byte,
            origin,
            ipv6: buf[reader.position() as usize..].to_vec(),
        })
    }
}

/// Authentication header for the unsecured qualification exchange: empty
/// client identifier and authentication value, the 8-byte nonce and a
/// zero confirmation byte.
pub fn auth_header(nonce: &[u8; 8]) -> [u8; 13] {
    let mut hdr = [0u8; 13];
    hdr[1] = AUTH_HEADER_TYPE;
    hdr[4..12].copy_from_slice(nonce);
    hdr
}

/// Origin indication header carrying `ipv4:port`, obfuscated on the wire.
pub fn origin_indication(ipv4: Ipv4Addr, port: u16) -> [u8; 8] {
    let mut hdr = [0u8; 8];
    hdr[1] = ORIGIN_INDICATION_TYPE;
    hdr[2..4].copy_from_slice(&(port ^ 0xFFFF).to_be_bytes());
    hdr[4..8].copy_from_slice(&(u32::from(ipv4) ^ 0xFFFF_FFFF).to_be_bytes());
    hdr
}
