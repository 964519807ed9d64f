pub mod ascii;

pub use ascii::{AsciiCommand, AsciiResponse};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Connection I/O failed: {0}")]
    Io(String),
    #[error("Protocol parse error: {0}")]
    ParseError(String),
    #[error("Server error: {0}")]
    ServerError(String),
}
