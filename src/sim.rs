//! # Simulated FPGA Device
//!
//! Software stand-in for the FPGA bench board. It keeps the SRAM, heartbeat
//! and diagnostic log state of the real hardware and answers the UART
//! protocol with byte-identical responses, so it can sit behind a real serial
//! port or be used directly as an in-process [`Transport`].

use std::collections::{HashSet, VecDeque};
use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use crate::coverage::ADDRESS_SPACE;
use crate::frame::{Opcode, GDP_ACK, HEARTBEAT_BYTE, LOG_ACK, PING_REPLY, WRITE_ACK};
use crate::transport::Transport;

// Errors raised while interpreting bytes sent by the host.
#[derive(Debug, PartialEq)]
pub enum CommandError {
    /// No bytes were given.
    Empty,
    /// The first byte is not a known opcode.
    UnknownOpcode(u8),
    /// The frame is shorter than its opcode requires.
    Incomplete { opcode: u8, needed: usize, got: usize },
}

// Hardware misbehaviour that can be switched on for tests.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// The toggle command is ignored and the heartbeat keeps running.
    pub stubborn_heartbeat: bool,
    /// Replaces the reply to both ping variants.
    pub ping_reply: Option<u8>,
    /// Replaces the write acknowledgement for one address.
    pub write_ack: Option<(u16, u8)>,
    /// Reads from these addresses return the stored value inverted.
    pub corrupt_reads: HashSet<u16>,
    /// Reads from these addresses return only the high byte.
    pub short_reads: HashSet<u16>,
    /// Log reads of this slot carry a bad acknowledgement.
    pub bad_log_ack: Option<u16>,
    /// The device swallows every command without replying.
    pub silent: bool,
}

// One diagnostic log slot as stored by the FPGA.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LogSlot {
    pub access_addr: u8,
    pub spec: u16,
}

// The main struct that holds the entire state of the simulated board.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    // 64K words of external SRAM.
    sram: Vec<u16>,
    // Diagnostic log written by the GDP logic.
    log: Vec<LogSlot>,
    pub faults: Faults,
    heartbeat_enabled: bool,
    gdp_started: bool,
    // --- Internal state for the byte stream ---
    rx_pending: Vec<u8>,
    tx_queue: VecDeque<u8>,
    host_bytes: Vec<u8>,
    timeout: Duration,
    closed: bool,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Creates a board with cleared SRAM, an empty log and the heartbeat off.
    pub fn new() -> Self {
        Self {
            sram: vec![0; ADDRESS_SPACE],
            log: Vec::new(),
            faults: Faults::default(),
            heartbeat_enabled: false,
            gdp_started: false,
            rx_pending: Vec::new(),
            tx_queue: VecDeque::new(),
            host_bytes: Vec::new(),
            timeout: Duration::from_secs(3),
            closed: false,
        }
    }

    /// Powers up with the heartbeat running, like the real board after reset.
    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat_enabled = true;
        self
    }

    pub fn with_log(mut self, slots: &[LogSlot]) -> Self {
        self.log = slots.to_vec();
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled
    }

    pub fn gdp_started(&self) -> bool {
        self.gdp_started
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current SRAM content, bypassing the protocol.
    pub fn peek(&self, address: u16) -> u16 {
        self.sram[address as usize]
    }

    /// Every byte the host has written so far.
    pub fn host_bytes(&self) -> &[u8] {
        &self.host_bytes
    }

    /// Byte the board emits on an idle line, if any.
    pub fn idle_byte(&self) -> Option<u8> {
        self.heartbeat_enabled.then_some(HEARTBEAT_BYTE)
    }

    /// Processes one complete frame and returns the reply bytes.
    ///
    /// `Ok(None)` means the command produces no reply.
    pub fn process_command(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, CommandError> {
        let opcode_byte = *frame.first().ok_or(CommandError::Empty)?;
        let opcode = Opcode::from_byte(opcode_byte).ok_or(CommandError::UnknownOpcode(opcode_byte))?;

        let needed = 1 + opcode.request_operands();
        if frame.len() < needed {
            return Err(CommandError::Incomplete {
                opcode: opcode_byte,
                needed,
                got: frame.len(),
            });
        }

        let operand = |i: usize| u16::from_be_bytes([frame[1 + 2 * i], frame[2 + 2 * i]]);
        let reply = self.execute(opcode, &frame[..needed], &operand);
        if self.faults.silent {
            return Ok(None);
        }
        Ok(reply)
    }

    /// Executes a validated command and returns the response bytes.
    fn execute(
        &mut self,
        opcode: Opcode,
        frame: &[u8],
        operand: &dyn Fn(usize) -> u16,
    ) -> Option<Vec<u8>> {
        debug!(?opcode, frame = ?frame, "device executing");
        match opcode {
            Opcode::ToggleHeartbeat => {
                if !self.faults.stubborn_heartbeat {
                    self.heartbeat_enabled = !self.heartbeat_enabled;
                }
                None
            }
            Opcode::Ping => Some(vec![self.faults.ping_reply.unwrap_or(PING_REPLY)]),
            Opcode::GdpPing => Some(vec![self.faults.ping_reply.unwrap_or(GDP_ACK)]),
            Opcode::StartGdp => {
                self.gdp_started = true;
                Some(vec![GDP_ACK])
            }
            Opcode::WriteWord => {
                let address = operand(0);
                let value = operand(1);
                self.sram[address as usize] = value;
                let ack = match self.faults.write_ack {
                    Some((faulty, ack)) if faulty == address => ack,
                    _ => WRITE_ACK,
                };
                Some(vec![ack])
            }
            Opcode::ReadWord => {
                let address = operand(0);
                let mut value = self.sram[address as usize];
                if self.faults.corrupt_reads.contains(&address) {
                    value = !value;
                }
                let bytes = value.to_be_bytes();
                if self.faults.short_reads.contains(&address) {
                    Some(vec![bytes[0]])
                } else {
                    Some(bytes.to_vec())
                }
            }
            Opcode::ReadLog => {
                let index = operand(0);
                let slot = self.log.get(index as usize).copied().unwrap_or_default();
                let ack = if self.faults.bad_log_ack == Some(index) {
                    !LOG_ACK
                } else {
                    LOG_ACK
                };
                let spec = slot.spec.to_be_bytes();
                Some(vec![slot.access_addr, spec[0], spec[1], ack])
            }
        }
    }

    /// Accepts raw bytes from the line, possibly split mid-frame, and returns
    /// the replies to every frame completed by them.
    ///
    /// Unknown opcodes are dropped one byte at a time so the parser can
    /// resynchronise.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.host_bytes.extend_from_slice(bytes);
        self.rx_pending.extend_from_slice(bytes);

        let mut replies = Vec::new();
        loop {
            let pending = self.rx_pending.clone();
            match self.process_command(&pending) {
                Ok(reply) => {
                    let consumed = Opcode::from_byte(self.rx_pending[0])
                        .map_or(1, |op| 1 + op.request_operands());
                    self.rx_pending.drain(..consumed);
                    if let Some(reply) = reply {
                        replies.extend(reply);
                    }
                }
                Err(CommandError::UnknownOpcode(byte)) => {
                    warn!("ignoring unknown opcode 0x{:02X}", byte);
                    self.rx_pending.remove(0);
                }
                Err(CommandError::Empty) | Err(CommandError::Incomplete { .. }) => break,
            }
        }
        replies
    }
}

// In-process loopback: what the host writes is answered immediately.
impl Transport for SimulatedDevice {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        let replies = self.feed(bytes);
        self.tx_queue.extend(replies);
        Ok(bytes.len())
    }

    fn read(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        if self.tx_queue.is_empty() {
            return Ok(self.idle_byte().into_iter().take(max_bytes).collect());
        }
        let n = max_bytes.min(self.tx_queue.len());
        Ok(self.tx_queue.drain(..n).collect())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.tx_queue.clear();
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Tests for frame parsing ---

    #[test]
    fn device_creation() {
        let sim = SimulatedDevice::new();
        assert!(!sim.heartbeat_enabled());
        assert!(!sim.gdp_started());
        assert_eq!(sim.peek(0xFFFF), 0);
    }

    #[test]
    fn reject_unknown_opcode() {
        let mut sim = SimulatedDevice::new();
        assert_eq!(sim.process_command(&[0x55]).unwrap_err(), CommandError::UnknownOpcode(0x55));
        assert_eq!(sim.process_command(&[]).unwrap_err(), CommandError::Empty);
    }

    #[test]
    fn reject_incomplete_frame() {
        let mut sim = SimulatedDevice::new();
        assert_eq!(
            sim.process_command(&[0x02, 0x12, 0x34]).unwrap_err(),
            CommandError::Incomplete {
                opcode: 0x02,
                needed: 5,
                got: 3
            }
        );
    }

    // --- Tests for specific command logic ---

    #[test]
    fn ping_variants() {
        let mut sim = SimulatedDevice::new();
        assert_eq!(sim.process_command(&[0x04]).unwrap(), Some(vec![0xEE]));
        assert_eq!(sim.process_command(&[0x80]).unwrap(), Some(vec![0x01]));
    }

    #[test]
    fn write_then_read_word() {
        let mut sim = SimulatedDevice::new();
        assert_eq!(
            sim.process_command(&[0x02, 0x12, 0x34, 0xBE, 0xEF]).unwrap(),
            Some(vec![0xAC])
        );
        assert_eq!(sim.peek(0x1234), 0xBEEF);
        assert_eq!(
            sim.process_command(&[0x03, 0x12, 0x34]).unwrap(),
            Some(vec![0xBE, 0xEF])
        );
    }

    #[test]
    fn toggle_heartbeat_is_edge_triggered() {
        let mut sim = SimulatedDevice::new().with_heartbeat();
        assert_eq!(sim.process_command(&[0x01]).unwrap(), None);
        assert!(!sim.heartbeat_enabled());
        sim.process_command(&[0x01]).unwrap();
        assert!(sim.heartbeat_enabled());
    }

    #[test]
    fn start_gdp_and_read_log() {
        let mut sim = SimulatedDevice::new().with_log(&[LogSlot {
            access_addr: 0x42,
            spec: 0x00F4,
        }]);
        assert_eq!(sim.process_command(&[0x81]).unwrap(), Some(vec![0x01]));
        assert!(sim.gdp_started());
        assert_eq!(
            sim.process_command(&[0x11, 0x00, 0x00]).unwrap(),
            Some(vec![0x42, 0x00, 0xF4, 0x01])
        );
        // Slots past the recorded log read as zero.
        assert_eq!(
            sim.process_command(&[0x11, 0x03, 0xFF]).unwrap(),
            Some(vec![0x00, 0x00, 0x00, 0x01])
        );
    }

    // --- Tests for fault injection ---

    #[test]
    fn faults_alter_replies() {
        let mut faults = Faults {
            ping_reply: Some(0x00),
            write_ack: Some((0x0010, 0x00)),
            ..Default::default()
        };
        faults.corrupt_reads.insert(0x0020);
        faults.short_reads.insert(0x0030);
        let mut sim = SimulatedDevice::new().with_faults(faults);

        assert_eq!(sim.process_command(&[0x04]).unwrap(), Some(vec![0x00]));
        assert_eq!(
            sim.process_command(&[0x02, 0x00, 0x10, 0x00, 0x10]).unwrap(),
            Some(vec![0x00])
        );
        sim.process_command(&[0x02, 0x00, 0x20, 0x00, 0x20]).unwrap();
        assert_eq!(
            sim.process_command(&[0x03, 0x00, 0x20]).unwrap(),
            Some(vec![0xFF, 0xDF])
        );
        assert_eq!(
            sim.process_command(&[0x03, 0x00, 0x30]).unwrap(),
            Some(vec![0x00])
        );
    }

    #[test]
    fn silent_device_never_answers() {
        let mut sim = SimulatedDevice::new().with_faults(Faults {
            silent: true,
            ..Default::default()
        });
        assert_eq!(sim.process_command(&[0x04]).unwrap(), None);
    }

    // --- Tests for the byte stream ---

    #[test]
    fn feed_handles_split_frames() {
        let mut sim = SimulatedDevice::new();
        assert!(sim.feed(&[0x02, 0x00]).is_empty());
        assert_eq!(sim.feed(&[0x05, 0x00, 0x05, 0x03, 0x00]), vec![0xAC]);
        assert_eq!(sim.feed(&[0x05]), vec![0x00, 0x05]);
        assert_eq!(sim.host_bytes().len(), 8);
    }

    #[test]
    fn feed_skips_garbage() {
        let mut sim = SimulatedDevice::new();
        assert_eq!(sim.feed(&[0x77, 0x04, 0x99, 0x80]), vec![0xEE, 0x01]);
    }

    #[test]
    fn transport_emits_heartbeat_when_idle() {
        let mut sim = SimulatedDevice::new().with_heartbeat();
        assert_eq!(sim.read(1).unwrap(), vec![0xAA]);
        sim.write(&[0x01]).unwrap();
        assert!(sim.read(1).unwrap().is_empty());
    }

    #[test]
    fn transport_refuses_io_after_close() {
        let mut sim = SimulatedDevice::new();
        sim.close();
        assert!(sim.is_closed());
        assert!(sim.write(&[0x04]).is_err());
    }
}
