//! Decoder for the FPGA diagnostic log.
//!
//! Each slot carries a 16-bit `spec` field. Most values describe a memory
//! access, but with `space = 1` only modifier 3 is a legal access, so the FPGA
//! reuses the other combinations for its own event codes. The split is made
//! once, in [`decode`], and everything downstream works on the tagged result.

use std::fmt;

/// Spec value logged when the GDP comes out of initialization.
pub const EVENT_GDP_INIT: u16 = 0xF4;
/// Spec value logged when the GDP raises its fatal signal.
pub const EVENT_FATAL_SIGNAL: u16 = 0xF0;

/// Accessors for the bitfield layout of a spec value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecField(pub u16);

impl SpecField {
    pub fn space(self) -> u8 {
        ((self.0 >> 7) & 1) as u8
    }

    pub fn operation(self) -> u8 {
        ((self.0 >> 6) & 1) as u8
    }

    pub fn rmw(self) -> bool {
        (self.0 >> 5) & 1 == 1
    }

    pub fn length_code(self) -> u8 {
        ((self.0 >> 2) & 7) as u8
    }

    pub fn modifier(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// True when the value is an FPGA event code rather than an access.
    pub fn is_reserved(self) -> bool {
        self.space() == 1 && self.modifier() != 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Memory,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLength {
    Bytes(u8),
    /// Length codes 6 and 7 have no meaning.
    Invalid(u8),
}

impl AccessLength {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => AccessLength::Bytes(1),
            1 => AccessLength::Bytes(2),
            2 => AccessLength::Bytes(4),
            3 => AccessLength::Bytes(6),
            4 => AccessLength::Bytes(8),
            5 => AccessLength::Bytes(10),
            other => AccessLength::Invalid(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Instruction,
    Stack,
    ContextControl,
    Other,
    InterconnectRegister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub space: Space,
    pub operation: Operation,
    pub rmw: bool,
    pub length: AccessLength,
    pub segment: Segment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpgaEvent {
    GdpInitialization,
    FatalSignal,
    Unknown,
}

impl FpgaEvent {
    fn from_spec(spec: u16) -> Self {
        match spec {
            EVENT_GDP_INIT => FpgaEvent::GdpInitialization,
            EVENT_FATAL_SIGNAL => FpgaEvent::FatalSignal,
            _ => FpgaEvent::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    MemoryAccess(MemoryAccess),
    Event(FpgaEvent),
}

/// One decoded log slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u16,
    pub spec: u16,
    pub access_addr: u16,
    pub kind: EntryKind,
}

impl LogEntry {
    /// A fatal signal ends the meaningful part of the log.
    pub fn is_fatal(&self) -> bool {
        self.kind == EntryKind::Event(FpgaEvent::FatalSignal)
    }
}

/// Classifies a log slot. Total over every spec value.
pub fn decode(index: u16, spec: u16, access_addr: u16) -> LogEntry {
    let field = SpecField(spec);
    let kind = if field.is_reserved() {
        EntryKind::Event(FpgaEvent::from_spec(spec))
    } else {
        let space = if field.space() == 1 { Space::Other } else { Space::Memory };
        let segment = match (space, field.modifier()) {
            (Space::Other, _) => Segment::InterconnectRegister,
            (Space::Memory, 0) => Segment::Instruction,
            (Space::Memory, 1) => Segment::Stack,
            (Space::Memory, 2) => Segment::ContextControl,
            (Space::Memory, _) => Segment::Other,
        };
        EntryKind::MemoryAccess(MemoryAccess {
            space,
            operation: if field.operation() == 1 {
                Operation::Write
            } else {
                Operation::Read
            },
            rmw: field.rmw(),
            length: AccessLength::from_code(field.length_code()),
            segment,
        })
    };

    LogEntry {
        index,
        spec,
        access_addr,
        kind,
    }
}

impl fmt::Display for AccessLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLength::Bytes(n) => write!(f, "{}", n),
            AccessLength::Invalid(_) => f.write_str("invalid"),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Segment::Instruction => "instruction segment",
            Segment::Stack => "stack segment",
            Segment::ContextControl => "context control segment",
            Segment::Other => "other",
            Segment::InterconnectRegister => "interconnect register",
        };
        f.write_str(name)
    }
}

impl fmt::Display for FpgaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FpgaEvent::GdpInitialization => "GDP initialization",
            FpgaEvent::FatalSignal => "Fatal signal is raised by GDP",
            FpgaEvent::Unknown => "Unknown FPGA log entry",
        };
        f.write_str(name)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EntryKind::Event(event) => write!(f, "0x{:04X}: {}", self.index, event),
            EntryKind::MemoryAccess(access) => {
                let op = match access.operation {
                    Operation::Read => "read",
                    Operation::Write => "write",
                };
                let space = match access.space {
                    Space::Memory => "Memory",
                    Space::Other => "Other",
                };
                write!(
                    f,
                    "0x{:04X}: spec=0x{:02X} ({} {} bytes in \"{}\" space with {} access{}) addr=0x{:04X}",
                    self.index,
                    self.spec,
                    op,
                    access.length,
                    space,
                    access.segment,
                    if access.rmw { ", RMW" } else { "" },
                    self.access_addr
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_event_terminates() {
        let entry = decode(0x10, 0xF0, 0);
        assert_eq!(entry.kind, EntryKind::Event(FpgaEvent::FatalSignal));
        assert!(entry.is_fatal());
        assert_eq!(entry.to_string(), "0x0010: Fatal signal is raised by GDP");
    }

    #[test]
    fn init_event_does_not_terminate() {
        let entry = decode(0, 0xF4, 0);
        assert_eq!(entry.kind, EntryKind::Event(FpgaEvent::GdpInitialization));
        assert!(!entry.is_fatal());
        assert_eq!(entry.to_string(), "0x0000: GDP initialization");
    }

    #[test]
    fn other_reserved_values_are_unknown() {
        for spec in [0x80, 0x81, 0x82, 0xF1, 0xF2, 0xF8, 0x01F0] {
            let entry = decode(1, spec, 0);
            assert_eq!(entry.kind, EntryKind::Event(FpgaEvent::Unknown), "spec 0x{:X}", spec);
            assert!(!entry.is_fatal());
        }
    }

    #[test]
    fn interconnect_access_uses_modifier_three() {
        // space=1, write, length code 1, modifier 3
        let entry = decode(2, 0b1100_0111, 0x0034);
        match entry.kind {
            EntryKind::MemoryAccess(access) => {
                assert_eq!(access.space, Space::Other);
                assert_eq!(access.operation, Operation::Write);
                assert_eq!(access.length, AccessLength::Bytes(2));
                assert_eq!(access.segment, Segment::InterconnectRegister);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            entry.to_string(),
            "0x0002: spec=0xC7 (write 2 bytes in \"Other\" space with interconnect register access) addr=0x0034"
        );
    }

    #[test]
    fn memory_segments_by_modifier() {
        let segment = |spec| match decode(0, spec, 0).kind {
            EntryKind::MemoryAccess(access) => access.segment,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(segment(0b0000_0000), Segment::Instruction);
        assert_eq!(segment(0b0000_0001), Segment::Stack);
        assert_eq!(segment(0b0000_0010), Segment::ContextControl);
        assert_eq!(segment(0b0000_0011), Segment::Other);
    }

    #[test]
    fn rmw_read_of_ten_bytes() {
        // read, RMW, length code 5, stack segment
        let entry = decode(0x3FF, 0b0011_0101, 0x00AB);
        assert_eq!(
            entry.to_string(),
            "0x03FF: spec=0x35 (read 10 bytes in \"Memory\" space with stack segment access, RMW) addr=0x00AB"
        );
    }

    #[test]
    fn invalid_length_codes_are_labelled() {
        for code in [6u16, 7] {
            let entry = decode(0, code << 2, 0);
            match entry.kind {
                EntryKind::MemoryAccess(access) => {
                    assert_eq!(access.length, AccessLength::Invalid(code as u8))
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(entry.to_string().contains("invalid bytes"));
        }
    }

    #[test]
    fn spec_field_accessors() {
        let field = SpecField(0b1110_1011);
        assert_eq!(field.space(), 1);
        assert_eq!(field.operation(), 1);
        assert!(field.rmw());
        assert_eq!(field.length_code(), 2);
        assert_eq!(field.modifier(), 3);
        assert!(!field.is_reserved());
    }
}
