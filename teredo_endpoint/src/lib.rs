mod error;
pub mod peers;
pub mod qualify;
pub mod transport;
pub mod tunnel;

pub use error::TunnelError;
pub use transport::{PacketChannel, UdpChannel};
pub use tunnel::{TeredoTunnel, TunnelEvent};
