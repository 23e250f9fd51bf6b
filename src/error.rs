//! Error taxonomy shared by every layer of the bench.

use std::fmt;

use thiserror::Error;

use crate::frame::FrameError;
use crate::session::LinkState;

/// Coarse classification used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    Io,
    Protocol,
    Link,
    Interrupted,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Config => "ConfigError",
            ErrorClass::Io => "IoError",
            ErrorClass::Protocol => "ProtocolError",
            ErrorClass::Link => "LinkError",
            ErrorClass::Interrupted => "Interrupted",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Run parameters rejected before any I/O happened.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The transport itself failed (open, write, read).
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Fewer bytes than the opcode's fixed response length arrived in time.
    #[error("timeout on opcode 0x{opcode:02X}: expected {expected} bytes, got [{}]", hex(.received))]
    Timeout {
        opcode: u8,
        expected: usize,
        received: Vec<u8>,
    },
    /// The device answered, but not with the expected marker.
    #[error("unexpected reply to opcode 0x{opcode:02X}: expected 0x{expected:02X}, got 0x{received:02X}")]
    Protocol { opcode: u8, expected: u8, received: u8 },
    #[error("link failure: {0}")]
    Link(String),
    #[error("command issued while link is {0:?}")]
    NotReady(LinkState),
    #[error("write failed at address 0x{address:04X}: {source}")]
    WriteRejected {
        address: u16,
        #[source]
        source: Box<Error>,
    },
    #[error("interrupted by user")]
    Interrupted,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_) => ErrorClass::Config,
            Error::Io(_) | Error::Timeout { .. } => ErrorClass::Io,
            Error::Protocol { .. } => ErrorClass::Protocol,
            Error::Link(_) | Error::NotReady(_) => ErrorClass::Link,
            Error::WriteRejected { source, .. } => source.class(),
            Error::Interrupted => ErrorClass::Interrupted,
        }
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ShortResponse {
                opcode,
                expected,
                received,
            } => Error::Timeout {
                opcode,
                expected,
                received,
            },
            FrameError::BadAck {
                opcode,
                expected,
                received,
            } => Error::Protocol {
                opcode,
                expected,
                received,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Renders bytes as space-separated hex, `-` when empty.
pub fn hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::from("-");
    }
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
