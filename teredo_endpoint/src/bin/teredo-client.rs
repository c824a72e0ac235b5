use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use structopt::StructOpt;

use pnet::packet::ipv6::Ipv6Packet;
use teredo::Teredo;
use teredo_endpoint::{TeredoTunnel, TunnelError, TunnelEvent, UdpChannel};

type Error = Box<dyn std::error::Error>;
type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "teredo-client",
    about = "Qualifies against a Teredo server and tunnels IPv6 over UDP/IPv4."
)]
struct Opt {
    /// Teredo server IPv4 address
    server: Ipv4Addr,

    /// Local UDP port (0 picks an ephemeral one)
    #[structopt(short, long, default_value = "0")]
    port: u16,

    /// Hexdump decapsulated packets
    #[structopt(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let channel = UdpChannel::bind(Ipv4Addr::UNSPECIFIED, opt.port)?;
    println!("Listening on {}", channel.local_addr()?);

    let mut tunnel = TeredoTunnel::new_client(opt.server, channel, OsRng, Instant::now())?;

    loop {
        let now = Instant::now();
        tunnel.tick(now)?;

        match tunnel.receive(now) {
            Ok(()) => {}
            Err(TunnelError::NoData) => std::thread::sleep(Duration::from_millis(50)),
            // Garbage and failed qualifications are retried on the next
            // round.
            Err(TunnelError::Malformed) | Err(TunnelError::SymmetricNat) => {}
            Err(err) => return Err(err.into()),
        }

        while let Some(event) = tunnel.poll_event() {
            match event {
                TunnelEvent::Up(addr) => println!("Teredo address: {}", addr),
                TunnelEvent::Down => println!("Lost server connectivity, requalifying"),
                TunnelEvent::Deliver(ipv6) => {
                    if let Some(ip6) = Ipv6Packet::new(&ipv6) {
                        println!(
                            "{} -> {} ({} bytes{})",
                            ip6.get_source(),
                            ip6.get_destination(),
                            ipv6.len(),
                            if ip6.is_teredo() { ", teredo" } else { "" }
                        );
                    }
                    if opt.debug {
                        hexdump::hexdump(&ipv6);
                    }
                }
            }
        }
    }
}
