//! GDP trace run: start the processor, let it execute, then read back and
//! decode its diagnostic log.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::frame::Command;
use crate::log_decoder::{decode, LogEntry};
use crate::session::LinkSession;
use crate::stop::StopSignal;
use crate::transport::Transport;

/// Outcome of a log scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScan {
    pub entries: Vec<LogEntry>,
    /// Slot holding the fatal-signal event, if one ended the scan.
    pub fatal_at: Option<u16>,
}

pub struct GdpRun {
    settle: Duration,
    log_slots: usize,
    stop: StopSignal,
}

impl GdpRun {
    pub fn new(config: &Config, stop: StopSignal) -> Self {
        Self {
            settle: config.gdp_settle,
            log_slots: config.log_slots,
            stop,
        }
    }

    /// Silences the heartbeat, pings with the GDP variant, starts the GDP,
    /// waits and scans the log.
    pub fn run<T: Transport>(
        &self,
        session: &mut LinkSession<T>,
        on_entry: &mut dyn FnMut(&LogEntry),
    ) -> Result<LogScan> {
        session.suppress_heartbeat()?;
        session.handshake(Command::GdpPing)?;
        session.start_gdp()?;
        info!(settle = ?self.settle, "GDP started, waiting for it to execute");
        self.settle()?;
        self.scan(session, on_entry)
    }

    fn settle(&self) -> Result<()> {
        let deadline = Instant::now() + self.settle;
        loop {
            self.stop.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// Reads log slots in order until the last slot or a fatal event.
    ///
    /// A short read or bad acknowledgement aborts the whole scan.
    pub fn scan<T: Transport>(
        &self,
        session: &mut LinkSession<T>,
        on_entry: &mut dyn FnMut(&LogEntry),
    ) -> Result<LogScan> {
        let mut scan = LogScan {
            entries: Vec::new(),
            fatal_at: None,
        };
        for index in 0..self.log_slots {
            self.stop.check()?;
            let index = index as u16;
            let record = session.read_log(index)?;
            let entry = decode(index, record.spec, u16::from(record.access_addr));
            on_entry(&entry);
            scan.entries.push(entry);
            if entry.is_fatal() {
                warn!(slot = index, "fatal signal logged, stopping scan");
                scan.fatal_at = Some(index);
                break;
            }
        }
        info!(entries = scan.entries.len(), "log scan complete");
        Ok(scan)
    }
}
