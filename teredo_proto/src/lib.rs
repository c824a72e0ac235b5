pub mod control;
mod error;
pub mod packet;

pub use error::ProtoError;
pub use packet::{OriginIndication, TeredoPacket};
