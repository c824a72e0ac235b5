use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Malformed Teredo packet")]
    Malformed,
}

impl From<std::io::Error> for ProtoError {
    fn from(_: std::io::Error) -> Self {
        // Reads only fail on truncated input here
        ProtoError::Malformed
    }
}
