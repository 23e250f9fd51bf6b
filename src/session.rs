//! Link session: heartbeat suppression, handshake and command dispatch.
//!
//! The session owns the transport for its whole lifetime and closes it on
//! drop, so every exit path releases the port.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{hex, Error, Result};
use crate::frame::{Command, LogRecord, Response, HEARTBEAT_BYTE};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    HeartbeatCheck,
    Ready,
    Failed,
}

pub struct LinkSession<T: Transport> {
    transport: T,
    state: LinkState,
    heartbeat_window: Duration,
    heartbeat_max_toggles: u32,
    ping_retries: u32,
    // A reply timed out, so its tail may still be in flight.
    stale_input: bool,
}

impl<T: Transport> LinkSession<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        Self {
            transport,
            state: LinkState::Disconnected,
            heartbeat_window: config.heartbeat_window,
            heartbeat_max_toggles: config.heartbeat_max_toggles,
            ping_retries: config.ping_retries,
            stale_input: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Silences the device heartbeat.
    ///
    /// The toggle command is edge-triggered, so after each toggle the line is
    /// checked again instead of assuming the heartbeat went away. Returns the
    /// number of toggles sent.
    pub fn suppress_heartbeat(&mut self) -> Result<u32> {
        self.state = LinkState::HeartbeatCheck;
        let outcome = self.toggle_until_silent();
        if outcome.is_err() {
            self.state = LinkState::Failed;
        }
        outcome
    }

    fn toggle_until_silent(&mut self) -> Result<u32> {
        let mut toggles = 0;
        loop {
            if !self.listen_for_heartbeat()? {
                info!(toggles, "no heartbeat detected, assuming it is disabled");
                return Ok(toggles);
            }
            if toggles >= self.heartbeat_max_toggles {
                return Err(Error::Link(format!(
                    "heartbeat still present after {} toggles",
                    toggles
                )));
            }
            info!("heartbeat (0x{:02X}) detected, sending toggle", HEARTBEAT_BYTE);
            self.round_trip(Command::ToggleHeartbeat)?;
            self.transport.clear_input_buffer()?;
            toggles += 1;
        }
    }

    fn listen_for_heartbeat(&mut self) -> Result<bool> {
        let saved = self.transport.timeout();
        self.transport.set_timeout(self.heartbeat_window)?;
        let outcome = self.wait_for_heartbeat_byte();
        self.transport.set_timeout(saved)?;
        outcome
    }

    fn wait_for_heartbeat_byte(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.heartbeat_window;
        while Instant::now() < deadline {
            let bytes = self.transport.read(1)?;
            match bytes.first() {
                None => return Ok(false),
                Some(&HEARTBEAT_BYTE) => return Ok(true),
                Some(other) => debug!("discarding stray byte 0x{:02X}", other),
            }
        }
        Ok(false)
    }

    /// Pings the device until it answers, up to the configured retry count.
    ///
    /// `ping` is either [`Command::Ping`] or [`Command::GdpPing`].
    pub fn handshake(&mut self, ping: Command) -> Result<()> {
        let mut last_failure = None;
        for attempt in 1..=self.ping_retries {
            self.transport.clear_input_buffer()?;
            match self.round_trip(ping) {
                Ok(_) => {
                    info!(attempt, opcode = %ping.opcode(), "ping successful");
                    self.state = LinkState::Ready;
                    self.stale_input = false;
                    return Ok(());
                }
                Err(Error::Io(e)) => {
                    self.state = LinkState::Failed;
                    return Err(Error::Io(e));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "ping attempt failed");
                    last_failure = Some(e);
                }
            }
        }
        self.state = LinkState::Failed;
        Err(Error::Link(format!(
            "ping {} failed after {} attempts ({})",
            ping.opcode(),
            self.ping_retries,
            last_failure.map_or_else(|| String::from("no attempt made"), |e| e.to_string())
        )))
    }

    /// Sends one command and waits for its complete response.
    ///
    /// Data commands are never retried here; retry policy belongs to the
    /// caller.
    pub fn execute(&mut self, command: Command) -> Result<Response> {
        if self.state != LinkState::Ready {
            return Err(Error::NotReady(self.state));
        }
        let result = self
            .discard_stale_input()
            .and_then(|()| self.round_trip(command));
        match &result {
            Err(Error::Io(_)) => self.state = LinkState::Failed,
            Err(Error::Timeout { .. }) => self.stale_input = true,
            _ => {}
        }
        result
    }

    /// Drops bytes left over from a timed-out reply so they cannot be read
    /// as the start of the next one.
    fn discard_stale_input(&mut self) -> Result<()> {
        if self.stale_input {
            debug!("clearing input after short reply");
            self.transport.clear_input_buffer()?;
            self.stale_input = false;
        }
        Ok(())
    }

    fn round_trip(&mut self, command: Command) -> Result<Response> {
        let frame = command.encode();
        debug!(tx = %hex(&frame), "sending frame");
        self.transport.write(&frame)?;

        let expected = command.response_len();
        let reply = if expected == 0 {
            Vec::new()
        } else {
            self.transport.read(expected)?
        };
        debug!(rx = %hex(&reply), "received reply");
        Ok(command.decode_response(&reply)?)
    }

    pub fn write_word(&mut self, address: u16, value: u16) -> Result<()> {
        self.execute(Command::WriteWord { address, value })
            .and_then(|response| expect_ack(Command::WriteWord { address, value }, response))
    }

    pub fn read_word(&mut self, address: u16) -> Result<u16> {
        match self.execute(Command::ReadWord { address })? {
            Response::Word(value) => Ok(value),
            other => Err(unexpected(Command::ReadWord { address }, other)),
        }
    }

    pub fn read_log(&mut self, index: u16) -> Result<LogRecord> {
        match self.execute(Command::ReadLog { index })? {
            Response::Log(record) => Ok(record),
            other => Err(unexpected(Command::ReadLog { index }, other)),
        }
    }

    /// Kicks off the GDP. The device acts asynchronously after acking.
    pub fn start_gdp(&mut self) -> Result<()> {
        let response = self.execute(Command::StartGdp)?;
        expect_ack(Command::StartGdp, response)
    }

    pub fn close(&mut self) {
        if self.state != LinkState::Disconnected {
            info!("closing link");
        }
        self.transport.close();
        self.state = LinkState::Disconnected;
    }
}

impl<T: Transport> Drop for LinkSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn expect_ack(command: Command, response: Response) -> Result<()> {
    match response {
        Response::Ack => Ok(()),
        other => Err(unexpected(command, other)),
    }
}

fn unexpected(command: Command, response: Response) -> Error {
    Error::Link(format!(
        "opcode {} produced response of the wrong shape: {:?}",
        command.opcode(),
        response
    ))
}
