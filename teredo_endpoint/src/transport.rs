use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use teredo_proto::TeredoPacket;

use crate::error::TunnelError;

/// Number of attempts before a send error is treated as final.
///
/// The socket surfaces asynchronous ICMP errors against whatever datagram
/// is sent next, so a failure usually concerns an earlier transmission to
/// some other destination and says nothing about this one.
const SEND_ATTEMPTS: u32 = 10;

/// Datagram channel the tunnel engine drives. `send` assembles one UDP
/// datagram from the given slices; `recv` never blocks.
pub trait PacketChannel {
    fn send(&mut self, ipv4: Ipv4Addr, port: u16, parts: &[&[u8]]) -> Result<(), TunnelError>;

    fn recv(&mut self) -> Result<TeredoPacket, TunnelError>;
}

/// UDP/IPv4 socket adapter.
pub struct UdpChannel {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpChannel {
    /// Binds a non-blocking socket on `local:port`.
    pub fn bind(local: Ipv4Addr, port: u16) -> Result<Self, TunnelError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(local, port))?;
        socket.set_nonblocking(true)?;
        disable_pmtu_discovery(&socket);
        Ok(UdpChannel {
            socket,
            buf: vec![0u8; 65536],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PacketChannel for UdpChannel {
    fn send(&mut self, ipv4: Ipv4Addr, port: u16, parts: &[&[u8]]) -> Result<(), TunnelError> {
        let mut datagram = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            datagram.extend_from_slice(part);
        }

        let dest = SocketAddrV4::new(ipv4, port);
        let mut attempts = SEND_ATTEMPTS;
        loop {
            match self.socket.send_to(&datagram, dest) {
                Ok(_) => return Ok(()),
                Err(err) => {
                    attempts -= 1;
                    if attempts == 0 || !is_transient(&err) {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    fn recv(&mut self) -> Result<TeredoPacket, TunnelError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, SocketAddr::V4(from))) => {
                Ok(TeredoPacket::parse(&self.buf[..len], *from.ip(), from.port())?)
            }
            // IPv4 socket, cannot happen
            Ok((_, SocketAddr::V6(_))) => Err(TunnelError::Malformed),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(TunnelError::NoData),
            Err(err) => Err(err.into()),
        }
    }
}

/// The errno values ICMP errors surface as: address, host, protocol or
/// port unreachable, source route failure, host down, host isolated.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETUNREACH)
            | Some(libc::EHOSTUNREACH)
            | Some(libc::ENOPROTOOPT)
            | Some(libc::ECONNREFUSED)
            | Some(libc::EOPNOTSUPP)
            | Some(libc::EHOSTDOWN)
    ) || is_host_isolated(err)
}

#[cfg(target_os = "linux")]
fn is_host_isolated(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENONET)
}

#[cfg(not(target_os = "linux"))]
fn is_host_isolated(_err: &io::Error) -> bool {
    false
}

/// Tunnel datagrams must not carry the Don't Fragment bit.
#[cfg(target_os = "linux")]
fn disable_pmtu_discovery(socket: &UdpSocket) {
    use std::os::unix::io::AsRawFd;

    let value: libc::c_int = libc::IP_PMTUDISC_DONT;
    unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_pmtu_discovery(_socket: &UdpSocket) {}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (UdpChannel, UdpChannel, u16) {
        let a = UdpChannel::bind(Ipv4Addr::LOCALHOST, 0).expect("Failed to bind");
        let b = UdpChannel::bind(Ipv4Addr::LOCALHOST, 0).expect("Failed to bind");
        let port = match b.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr.port(),
            SocketAddr::V6(_) => unreachable!(),
        };
        (a, b, port)
    }

    #[test]
    fn send_concatenates_parts() {
        let (mut a, mut b, port) = pair();

        let mut header = [0u8; 13];
        header[1] = 0x01;
        let payload = [0x60u8; 40];
        a.send(Ipv4Addr::LOCALHOST, port, &[&header, &payload])
            .expect("Failed to send");

        // Give loopback a moment.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let packet = b.recv().expect("Failed to receive");
        assert!(packet.auth_nonce.is_some());
        assert_eq!(packet.ipv6.len(), 40);
        assert_eq!(packet.source_ipv4, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn empty_socket_reports_no_data() {
        let (_, mut b, _) = pair();
        assert!(matches!(b.recv(), Err(TunnelError::NoData)));
    }

    #[test]
    fn runt_datagram_is_malformed() {
        let (mut a, mut b, port) = pair();
        a.send(Ipv4Addr::LOCALHOST, port, &[&[0u8; 8]])
            .expect("Failed to send");
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(matches!(b.recv(), Err(TunnelError::Malformed)));
    }
}
