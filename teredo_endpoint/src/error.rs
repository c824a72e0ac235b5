use thiserror::Error;

use teredo_proto::ProtoError;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Malformed Teredo packet")]
    Malformed,
    #[error("Endpoint is not qualified")]
    NotRunning,
    #[error("Peer table exhausted")]
    Exhausted,
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No datagram pending")]
    NoData,
    #[error("Unsupported symmetric NAT detected")]
    SymmetricNat,
}

impl From<ProtoError> for TunnelError {
    fn from(_: ProtoError) -> Self {
        TunnelError::Malformed
    }
}
