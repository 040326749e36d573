use std::fmt;

/// Reasons a main-info response frame is rejected by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    LengthError { expected: usize, received: usize },
    ChecksumError { calculated: u16, received: u16 },
    HeaderError { received: [u8; 2] },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::LengthError { expected, received } => write!(
                f,
                "Invalid frame length - expected={expected} received={received}"
            ),
            Error::ChecksumError {
                calculated,
                received,
            } => write!(
                f,
                "Invalid checksum - calculated={calculated:04X} received={received:04X}"
            ),
            Error::HeaderError { received } => {
                write!(f, "Unexpected frame header {received:02X?}")
            }
        }
    }
}
