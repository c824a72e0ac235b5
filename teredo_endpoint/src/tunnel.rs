use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use pnet::packet::ipv6::Ipv6Packet;
use rand::RngCore;

use teredo::{
    is_ipv4_global_unicast, is_valid_prefix, TeredoEndpoint, FLAG_CONE, PREFIX_UNSET, TEREDO_PORT,
};
use teredo_proto::control;
use teredo_proto::packet::{auth_header, IPV6_HEADER_LEN, MAX_UDP_PAYLOAD};
use teredo_proto::TeredoPacket;

use crate::error::TunnelError;
use crate::peers::{PeerState, PeerTable};
use crate::transport::PacketChannel;
use crate::qualify::{
    Phase, Qualification, Solicit, PROBE_DELAY, RESTART_DELAY, SERVER_LOSS_DELAY,
    SERVER_PING_DELAY,
};

/// Bubble pacing: no more than one every 2 seconds and three per
/// 30-second window toward the same peer.
const BUBBLE_GAP: Duration = Duration::from_secs(2);
const BUBBLE_WINDOW: Duration = Duration::from_secs(30);
const MAX_BUBBLES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Client { server_ipv4: Ipv4Addr },
    Relay,
}

/// What the tunnel tells its driver. Events are queued after the state
/// they describe is committed, so a driver inspecting the tunnel from its
/// event loop observes the new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A Teredo address was committed; the tunnel is usable.
    Up(Ipv6Addr),
    /// Server connectivity was lost; requalification is under way.
    Down,
    /// A decapsulated IPv6 datagram for the host stack.
    Deliver(Vec<u8>),
}

/// A Teredo tunnel endpoint: carries IPv6 datagrams in UDP/IPv4 either as
/// a qualified client behind a NAT or as a relay on the IPv6 side.
///
/// The engine is single threaded and never blocks. The driver multiplexes
/// the three entry points ([`send`](Self::send), [`receive`](Self::receive),
/// [`tick`](Self::tick)), passing the current instant into each, and
/// drains [`poll_event`](Self::poll_event) afterwards.
pub struct TeredoTunnel<C, R> {
    mode: Mode,
    addr: TeredoEndpoint,
    qual: Qualification,
    peers: PeerTable,
    channel: C,
    rng: R,
    events: VecDeque<TunnelEvent>,
}

impl<C, R> TeredoTunnel<C, R>
where
    C: PacketChannel,
    R: RngCore,
{
    /// Client endpoint qualifying through `server_ipv4`. Fails when no
    /// entropy is available for the qualification nonce.
    pub fn new_client(
        server_ipv4: Ipv4Addr,
        channel: C,
        mut rng: R,
        now: Instant,
    ) -> Result<Self, TunnelError> {
        let mut nonce = [0u8; 8];
        rng.try_fill_bytes(&mut nonce)
            .map_err(|err| TunnelError::Io(io::Error::new(io::ErrorKind::Other, err)))?;

        Ok(TeredoTunnel {
            mode: Mode::Client { server_ipv4 },
            addr: TeredoEndpoint {
                prefix: PREFIX_UNSET,
                server_ipv4,
                flags: FLAG_CONE,
                client_port: 0,
                client_ipv4: Ipv4Addr::UNSPECIFIED,
            },
            qual: Qualification::new(nonce, now),
            peers: PeerTable::new(),
            channel,
            rng,
            events: VecDeque::new(),
        })
    }

    /// Relay endpoint serving `prefix`. Relays skip qualification and are
    /// always running.
    pub fn new_relay(prefix: u32, cone: bool, channel: C, rng: R, now: Instant) -> Self {
        TeredoTunnel {
            mode: Mode::Relay,
            addr: TeredoEndpoint {
                prefix,
                server_ipv4: Ipv4Addr::UNSPECIFIED,
                flags: if cone { FLAG_CONE } else { 0 },
                client_port: 0,
                client_ipv4: Ipv4Addr::UNSPECIFIED,
            },
            qual: Qualification::always_running(now),
            peers: PeerTable::new(),
            channel,
            rng,
            events: VecDeque::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.mode, Mode::Relay) || self.qual.phase == Phase::Qualified
    }

    fn is_relay(&self) -> bool {
        matches!(self.mode, Mode::Relay)
    }

    /// The committed Teredo address, once qualified.
    pub fn address(&self) -> Option<Ipv6Addr> {
        match self.mode {
            Mode::Client { .. }
                if self.qual.phase == Phase::Qualified && is_valid_prefix(self.addr.prefix) =>
            {
                Some(self.addr.to_ipv6())
            }
            _ => None,
        }
    }

    pub fn poll_event(&mut self) -> Option<TunnelEvent> {
        self.events.pop_front()
    }

    /// Hands one outbound IPv6 datagram to the tunnel.
    ///
    /// Datagrams that cannot be routed over Teredo (undersized,
    /// oversized, not IPv6, inconsistent length, or touching neither end
    /// of our prefix) are dropped without error, matching what the far
    /// side would do anyway.
    pub fn send(&mut self, packet: &[u8], now: Instant) -> Result<(), TunnelError> {
        if !self.is_running() {
            return Err(TunnelError::NotRunning);
        }
        if packet.len() < IPV6_HEADER_LEN || packet.len() > MAX_UDP_PAYLOAD {
            return Ok(());
        }
        let (src, dst) = match Ipv6Packet::new(packet) {
            Some(ip6)
                if ip6.get_version() == 6
                    && IPV6_HEADER_LEN + ip6.get_payload_length() as usize == packet.len() =>
            {
                (ip6.get_source(), ip6.get_destination())
            }
            _ => return Ok(()),
        };

        let dst_ep = TeredoEndpoint::from(dst);
        // Transit that neither starts nor ends on our prefix, including
        // link-local and multicast, has no business in the tunnel.
        if dst_ep.prefix != self.addr.prefix
            && TeredoEndpoint::from(src).prefix != self.addr.prefix
        {
            return Ok(());
        }

        // Known valid peer: transmit directly to its verified endpoint.
        let mapped = match self.peers.find(&dst, now) {
            Some(peer) => match peer.state {
                PeerState::Trusted {
                    mapped_ipv4,
                    mapped_port,
                } => {
                    peer.last_xmit = now;
                    Some((mapped_ipv4, mapped_port))
                }
                _ => None,
            },
            None => None,
        };
        if let Some((mapped_ipv4, mapped_port)) = mapped {
            return self.channel.send(mapped_ipv4, mapped_port, &[packet]);
        }

        if dst_ep.prefix != self.addr.prefix {
            return self.probe_native_peer(packet, dst, now);
        }

        // A Teredo peer advertising a bogus server is unreachable.
        if !is_ipv4_global_unicast(dst_ep.server_ipv4) {
            return Ok(());
        }

        if self.peers.find(&dst, now).is_none() {
            if dst_ep.is_cone() {
                // Cone peers accept direct traffic right away.
                let peer = self.peers.insert(
                    dst,
                    PeerState::Trusted {
                        mapped_ipv4: dst_ep.client_ipv4,
                        mapped_port: dst_ep.client_port,
                    },
                    now,
                )?;
                peer.last_xmit = now;
                return self
                    .channel
                    .send(dst_ep.client_ipv4, dst_ep.client_port, &[packet]);
            }
            self.peers.insert(
                dst,
                PeerState::Bubbling {
                    mapped_ipv4: dst_ep.client_ipv4,
                    mapped_port: dst_ep.client_port,
                    bubbles_sent: 0,
                    window_start: now,
                },
                now,
            )?;
        }

        self.bubble_peer(packet, dst, &dst_ep, now)
    }

    /// Pulls one datagram off the socket and runs it through the
    /// reception rules. Returns [`TunnelError::NoData`] once drained.
    pub fn receive(&mut self, now: Instant) -> Result<(), TunnelError> {
        let packet = self.channel.recv()?;
        self.dispatch(packet, now)
    }

    /// Advances the qualification schedule: emits due solicitations and
    /// detects server loss.
    pub fn tick(&mut self, now: Instant) -> Result<(), TunnelError> {
        let server_ipv4 = match self.mode {
            Mode::Client { server_ipv4 } => server_ipv4,
            Mode::Relay => return Ok(()),
        };

        let action = self.qual.advance(self.addr.is_cone(), now);
        let mut result = Ok(());
        if let Some(solicit) = action.solicit {
            result = self.send_solicitation(server_ipv4, solicit);
        }
        if action.lost {
            warn!("Lost contact with the Teredo server");
            self.events.push_back(TunnelEvent::Down);
        }
        result
    }

    fn send_solicitation(
        &mut self,
        server_ipv4: Ipv4Addr,
        solicit: Solicit,
    ) -> Result<(), TunnelError> {
        let solicitation = control::router_solicitation(solicit.cone);
        let auth = auth_header(&self.qual.nonce);
        let server = if solicit.secondary {
            secondary_server(server_ipv4)
        } else {
            server_ipv4
        };
        self.channel.send(server, TEREDO_PORT, &[&auth, &solicitation])
    }

    fn dispatch(&mut self, packet: TeredoPacket, now: Instant) -> Result<(), TunnelError> {
        if packet.ipv6.len() < IPV6_HEADER_LEN || packet.ipv6.len() > MAX_UDP_PAYLOAD {
            return Ok(());
        }
        let (src, is_bubble, reply_dst) = match Ipv6Packet::new(&packet.ipv6) {
            Some(ip6)
                if ip6.get_version() == 6
                    && IPV6_HEADER_LEN + ip6.get_payload_length() as usize
                        == packet.ipv6.len() =>
            {
                (
                    ip6.get_source(),
                    control::is_bubble(&ip6),
                    ip6.get_destination(),
                )
            }
            _ => {
                debug!("Dropping malformatted IPv6 packet");
                return Ok(());
            }
        };

        if !self.is_running() {
            return self.handle_qualification(&packet, now);
        }

        if let Mode::Client { server_ipv4 } = self.mode {
            if packet.source_ipv4 == server_ipv4 && packet.source_port == TEREDO_PORT {
                return self.handle_server_packet(&packet, src, reply_dst, now);
            }
        }

        // Known peer: either a verified mapping or an answered probe.
        let mut deliver = false;
        let mut flush = None;
        if let Some(peer) = self.peers.find(&src, now) {
            match peer.state {
                PeerState::Trusted {
                    mapped_ipv4,
                    mapped_port,
                } if mapped_ipv4 == packet.source_ipv4 && mapped_port == packet.source_port => {
                    peer.replied = true;
                    peer.last_rx = now;
                    deliver = true;
                }
                PeerState::Probing { nonce } if echo_reply_matches(&packet.ipv6, &nonce) => {
                    peer.trust(packet.source_ipv4, packet.source_port, now);
                    flush = peer.take_queued();
                    deliver = true;
                }
                _ => {}
            }
        }
        if deliver {
            if let Some(queued) = flush {
                self.channel
                    .send(packet.source_ipv4, packet.source_port, &[&queued])?;
            }
            self.events.push_back(TunnelEvent::Deliver(packet.ipv6));
            return Ok(());
        }

        // Unlisted peer or a mapping mismatch from here on.
        let source_ep = TeredoEndpoint::from(src);
        if source_ep.prefix == self.addr.prefix
            && source_ep.matches_client(packet.source_ipv4, packet.source_port)
        {
            // A Teredo client talking from the endpoint its address
            // embeds.
            if self.peers.find(&src, now).is_none() {
                if self.is_relay() {
                    // Unlisted senders could be routing through the
                    // wrong relay.
                    debug!("Ignoring unknown Teredo client {}", src);
                    return Ok(());
                }
                self.peers.insert(
                    src,
                    PeerState::Trusted {
                        mapped_ipv4: packet.source_ipv4,
                        mapped_port: packet.source_port,
                    },
                    now,
                )?;
            }

            let flush = match self.peers.find(&src, now) {
                Some(peer) => {
                    let queued = peer.take_queued();
                    peer.trust(packet.source_ipv4, packet.source_port, now);
                    queued
                }
                None => None,
            };
            if let Some(queued) = flush {
                self.channel
                    .send(packet.source_ipv4, packet.source_port, &[&queued])?;
            }

            if is_bubble {
                debug!("Consumed a bubble from {}", src);
                return Ok(());
            }
            self.events.push_back(TunnelEvent::Deliver(packet.ipv6));
            return Ok(());
        }

        // Relays only accept traffic from Teredo clients.
        let server_ipv4 = match self.mode {
            Mode::Client { server_ipv4 } => server_ipv4,
            Mode::Relay => return Ok(()),
        };

        // Unknown non-Teredo origin, or a Teredo client speaking from
        // somewhere else than its address claims: challenge it before
        // trusting anything.
        let nonce = self.probe_nonce(src, now)?;
        if let Some(nonce) = nonce {
            let probe = control::echo_request(self.addr.to_ipv6(), src, &nonce);
            self.channel.send(server_ipv4, TEREDO_PORT, &[&probe])?;
        }
        Ok(())
    }

    /// Nonce to probe `addr` with: the pending one, or a fresh one for a
    /// new record. An established peer is left alone and yields `None`.
    fn probe_nonce(
        &mut self,
        addr: Ipv6Addr,
        now: Instant,
    ) -> Result<Option<[u8; 8]>, TunnelError> {
        let existing = self.peers.find(&addr, now).map(|peer| match peer.state {
            PeerState::Probing { nonce } => Some(nonce),
            _ => None,
        });
        match existing {
            Some(nonce) => Ok(nonce),
            None => {
                let mut nonce = [0u8; 8];
                self.rng.fill_bytes(&mut nonce);
                self.peers
                    .insert(addr, PeerState::Probing { nonce }, now)?;
                Ok(Some(nonce))
            }
        }
    }

    /// Direct-connectivity test toward a native IPv6 peer: queue the
    /// datagram and ping the peer through the server.
    fn probe_native_peer(
        &mut self,
        packet: &[u8],
        dst: Ipv6Addr,
        now: Instant,
    ) -> Result<(), TunnelError> {
        let server_ipv4 = match self.mode {
            Mode::Client { server_ipv4 } => server_ipv4,
            // Relays never originate toward native IPv6.
            Mode::Relay => return Ok(()),
        };

        let nonce = self.probe_nonce(dst, now)?;
        if let Some(nonce) = nonce {
            if let Some(peer) = self.peers.find(&dst, now) {
                peer.enqueue(packet);
            }
            let probe = control::echo_request(self.addr.to_ipv6(), dst, &nonce);
            self.channel.send(server_ipv4, TEREDO_PORT, &[&probe])?;
        }
        Ok(())
    }

    /// Hole punching toward a restricted Teredo peer: park the datagram
    /// and pace bubbles at it.
    fn bubble_peer(
        &mut self,
        packet: &[u8],
        dst: Ipv6Addr,
        dst_ep: &TeredoEndpoint,
        now: Instant,
    ) -> Result<(), TunnelError> {
        let emit = {
            let peer = match self.peers.find(&dst, now) {
                Some(peer) => peer,
                None => return Ok(()),
            };
            peer.enqueue(packet);

            if let PeerState::Probing { .. } = peer.state {
                // Outbound traffic toward a Teredo address supersedes a
                // pending connectivity probe.
                peer.state = PeerState::Bubbling {
                    mapped_ipv4: dst_ep.client_ipv4,
                    mapped_port: dst_ep.client_port,
                    bubbles_sent: 0,
                    window_start: now,
                };
            }

            let last_xmit = peer.last_xmit;
            match &mut peer.state {
                PeerState::Bubbling {
                    bubbles_sent,
                    window_start,
                    ..
                } => {
                    if now.duration_since(*window_start) >= BUBBLE_WINDOW {
                        *bubbles_sent = 0;
                        *window_start = now;
                    }
                    if *bubbles_sent < MAX_BUBBLES
                        && (*bubbles_sent == 0 || now.duration_since(last_xmit) >= BUBBLE_GAP)
                    {
                        *bubbles_sent += 1;
                        peer.last_xmit = now;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };

        if emit {
            let bubble = control::bubble(self.addr.to_ipv6(), dst);
            if !self.addr.is_cone() {
                // Behind a restricted NAT the return path must be opened
                // through the peer's server as well.
                self.channel
                    .send(dst_ep.server_ipv4, TEREDO_PORT, &[&bubble])?;
            }
            self.channel
                .send(dst_ep.client_ipv4, dst_ep.client_port, &[&bubble])?;
        }
        Ok(())
    }

    /// Router Advertisements driving the qualification state machine.
    fn handle_qualification(
        &mut self,
        packet: &TeredoPacket,
        now: Instant,
    ) -> Result<(), TunnelError> {
        let server_ipv4 = match self.mode {
            Mode::Client { server_ipv4 } => server_ipv4,
            Mode::Relay => return Ok(()),
        };

        // Advertisements without our nonce are trivial to spoof.
        match packet.auth_nonce {
            Some(nonce) if nonce == self.qual.nonce => {}
            _ => return Ok(()),
        }
        if packet.conf_byte != Some(0) {
            error!("Authentication refused by server");
            return Ok(());
        }

        let cone = self.qual.phase == Phase::ProbeCone;
        let candidate = match control::parse_router_advert(packet, server_ipv4, cone) {
            Some(candidate) => candidate,
            None => return Ok(()),
        };

        self.qual.server_deadline = now + SERVER_LOSS_DELAY;

        match self.qual.phase {
            Phase::ProbeRestricted => {
                // First half done; compare mappings against the
                // secondary server address to rule out a symmetric NAT.
                self.qual.phase = Phase::ProbeSymmetric;
                self.qual.next = now + PROBE_DELAY;
                self.addr = candidate;
                self.send_solicitation(
                    server_ipv4,
                    Solicit {
                        cone: false,
                        secondary: true,
                    },
                )?;
            }
            Phase::ProbeSymmetric
                if candidate.client_port != self.addr.client_port
                    || candidate.client_ipv4 != self.addr.client_ipv4 =>
            {
                error!("Unsupported symmetric NAT detected");
                self.addr.prefix = PREFIX_UNSET;
                self.qual.phase = Phase::ProbeCone;
                self.qual.count = 0;
                self.qual.next = now + RESTART_DELAY;
                return Err(TunnelError::SymmetricNat);
            }
            _ => {
                info!(
                    "Qualified (NAT type: {})",
                    if cone { "cone" } else { "restricted" }
                );
                self.qual.phase = Phase::Qualified;
                self.qual.count = 0;
                self.qual.next = now + SERVER_PING_DELAY;
                // Commit before notifying so a re-entrant driver sees
                // the new address.
                self.addr = candidate;
                self.events.push_back(TunnelEvent::Up(self.addr.to_ipv6()));
            }
        }
        Ok(())
    }

    /// Traffic from the configured server while qualified: keep-alives,
    /// address changes and return-path openings.
    fn handle_server_packet(
        &mut self,
        packet: &TeredoPacket,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        now: Instant,
    ) -> Result<(), TunnelError> {
        let server_ipv4 = match self.mode {
            Mode::Client { server_ipv4 } => server_ipv4,
            Mode::Relay => return Ok(()),
        };

        self.qual.server_deadline = now + SERVER_LOSS_DELAY;

        if let Some(candidate) =
            control::parse_router_advert(packet, server_ipv4, self.addr.is_cone())
        {
            if candidate.prefix != self.addr.prefix {
                // The committed address just stopped existing. Leave the
                // running state first; the new address is only published
                // through requalification.
                warn!("Server advertised a different prefix, requalifying");
                let cone = self.addr.is_cone();
                self.addr.prefix = PREFIX_UNSET;
                self.qual.phase = if cone {
                    Phase::ProbeCone
                } else {
                    Phase::ProbeRestricted
                };
                self.qual.count = 0;
                self.qual.next = now;
                self.events.push_back(TunnelEvent::Down);
                return Ok(());
            }
            if candidate != self.addr {
                // Same prefix, new external mapping.
                info!("Teredo address changed");
                self.addr = candidate;
                self.events.push_back(TunnelEvent::Up(self.addr.to_ipv6()));
                return Ok(());
            }
        }

        if let Some(origin) = packet.origin {
            // Somebody is trying to reach us; open the return path.
            let bubble = control::bubble(dst, src);
            return self.channel.send(origin.ipv4, origin.port, &[&bubble]);
        }

        // Data packets never legitimately come from the server itself.
        Ok(())
    }
}

fn echo_reply_matches(ipv6: &[u8], nonce: &[u8; 8]) -> bool {
    match Ipv6Packet::new(ipv6) {
        Some(ip6) => control::check_echo_reply(&ip6, nonce),
        None => false,
    }
}

/// By convention the secondary server address is the next one up from the
/// primary.
fn secondary_server(primary: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(primary).wrapping_add(1))
}
