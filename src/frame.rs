//! Command framing for the FPGA UART protocol.
//!
//! Every opcode has exactly one request layout and one fixed response length,
//! so a response never carries its own length. Multi-byte fields are
//! big-endian.

use std::fmt;

/// Unsolicited byte sent by the device while its heartbeat is enabled.
pub const HEARTBEAT_BYTE: u8 = 0xAA;
/// Reply to [`Command::Ping`].
pub const PING_REPLY: u8 = 0xEE;
/// Reply to [`Command::GdpPing`] and [`Command::StartGdp`].
pub const GDP_ACK: u8 = 0x01;
/// Reply to [`Command::WriteWord`].
pub const WRITE_ACK: u8 = 0xAC;
/// Trailing acknowledgement inside a log record.
pub const LOG_ACK: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    ToggleHeartbeat = 0x01,
    WriteWord = 0x02,
    ReadWord = 0x03,
    Ping = 0x04,
    ReadLog = 0x11,
    GdpPing = 0x80,
    StartGdp = 0x81,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        match byte {
            0x01 => Some(Opcode::ToggleHeartbeat),
            0x02 => Some(Opcode::WriteWord),
            0x03 => Some(Opcode::ReadWord),
            0x04 => Some(Opcode::Ping),
            0x11 => Some(Opcode::ReadLog),
            0x80 => Some(Opcode::GdpPing),
            0x81 => Some(Opcode::StartGdp),
            _ => None,
        }
    }

    /// Number of operand bytes following the opcode on the wire.
    pub fn request_operands(self) -> usize {
        match self {
            Opcode::ToggleHeartbeat | Opcode::Ping | Opcode::GdpPing | Opcode::StartGdp => 0,
            Opcode::ReadWord | Opcode::ReadLog => 2,
            Opcode::WriteWord => 4,
        }
    }

    /// Fixed number of bytes the device answers with.
    pub fn response_len(self) -> usize {
        match self {
            Opcode::ToggleHeartbeat => 0,
            Opcode::Ping | Opcode::GdpPing | Opcode::StartGdp | Opcode::WriteWord => 1,
            Opcode::ReadWord => 2,
            Opcode::ReadLog => 4,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", *self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Command is missing bytes of its fixed-size response.
    ShortResponse {
        opcode: u8,
        expected: usize,
        received: Vec<u8>,
    },
    /// The acknowledgement byte is not the expected marker.
    BadAck { opcode: u8, expected: u8, received: u8 },
}

/// One request frame. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleHeartbeat,
    Ping,
    GdpPing,
    StartGdp,
    WriteWord { address: u16, value: u16 },
    ReadWord { address: u16 },
    ReadLog { index: u16 },
}

/// Raw contents of one log slot, acknowledgement already checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub access_addr: u8,
    pub spec: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Commands that produce no reply.
    Nothing,
    /// A single-byte acknowledgement matched its marker.
    Ack,
    Word(u16),
    Log(LogRecord),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::ToggleHeartbeat => Opcode::ToggleHeartbeat,
            Command::Ping => Opcode::Ping,
            Command::GdpPing => Opcode::GdpPing,
            Command::StartGdp => Opcode::StartGdp,
            Command::WriteWord { .. } => Opcode::WriteWord,
            Command::ReadWord { .. } => Opcode::ReadWord,
            Command::ReadLog { .. } => Opcode::ReadLog,
        }
    }

    pub fn response_len(&self) -> usize {
        self.opcode().response_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.opcode().request_operands());
        frame.push(self.opcode() as u8);
        match *self {
            Command::WriteWord { address, value } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&value.to_be_bytes());
            }
            Command::ReadWord { address } => frame.extend_from_slice(&address.to_be_bytes()),
            Command::ReadLog { index } => frame.extend_from_slice(&index.to_be_bytes()),
            _ => {}
        }
        frame
    }

    /// Decodes the device's answer to this command.
    ///
    /// Extra trailing bytes are ignored; the session never reads more than
    /// [`Command::response_len`] anyway.
    pub fn decode_response(&self, bytes: &[u8]) -> Result<Response, FrameError> {
        let opcode = self.opcode();
        let expected = opcode.response_len();
        if bytes.len() < expected {
            return Err(FrameError::ShortResponse {
                opcode: opcode as u8,
                expected,
                received: bytes.to_vec(),
            });
        }

        let check_ack = |received: u8, marker: u8| {
            if received == marker {
                Ok(())
            } else {
                Err(FrameError::BadAck {
                    opcode: opcode as u8,
                    expected: marker,
                    received,
                })
            }
        };

        match self {
            Command::ToggleHeartbeat => Ok(Response::Nothing),
            Command::Ping => check_ack(bytes[0], PING_REPLY).map(|_| Response::Ack),
            Command::GdpPing | Command::StartGdp => {
                check_ack(bytes[0], GDP_ACK).map(|_| Response::Ack)
            }
            Command::WriteWord { .. } => check_ack(bytes[0], WRITE_ACK).map(|_| Response::Ack),
            Command::ReadWord { .. } => Ok(Response::Word(u16::from_be_bytes([bytes[0], bytes[1]]))),
            Command::ReadLog { .. } => {
                check_ack(bytes[3], LOG_ACK)?;
                Ok(Response::Log(LogRecord {
                    access_addr: bytes[0],
                    spec: u16::from_be_bytes([bytes[1], bytes[2]]),
                }))
            }
        }
    }
}
