//! Run configuration passed explicitly into the session and engines.

use std::time::Duration;

use crate::coverage::ADDRESS_SPACE;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: String,
    pub baud_rate: u32,
    /// Per-read timeout of the transport.
    pub read_timeout: Duration,
    /// How long to listen for a heartbeat byte before assuming it is off.
    pub heartbeat_window: Duration,
    /// Toggles sent before giving up on silencing the heartbeat.
    pub heartbeat_max_toggles: u32,
    pub ping_retries: u32,
    /// Number of distinct addresses exercised by the memory test.
    pub test_size: usize,
    /// Verification stops once this many mismatches were seen.
    pub mismatch_cap: usize,
    /// Number of log slots scanned after a GDP run.
    pub log_slots: usize,
    /// Time the GDP is given to execute before the log is read.
    pub gdp_settle: Duration,
    /// Fixed seed for the coverage shuffle; random when `None`.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyUSB0"),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(3),
            heartbeat_window: Duration::from_secs(2),
            heartbeat_max_toggles: 8,
            ping_retries: 3,
            test_size: ADDRESS_SPACE,
            mismatch_cap: 10,
            log_slots: 1 << 10,
            gdp_settle: Duration::from_secs(3),
            seed: None,
        }
    }
}

impl Config {
    /// Rejects parameters that would make a run meaningless. Called before
    /// the transport is opened.
    pub fn validate(&self) -> Result<()> {
        if self.test_size == 0 || self.test_size > ADDRESS_SPACE {
            return Err(Error::Config(format!(
                "test size must be between 1 and {}, got {}",
                ADDRESS_SPACE, self.test_size
            )));
        }
        if self.log_slots == 0 || self.log_slots > ADDRESS_SPACE {
            return Err(Error::Config(format!(
                "log slot count must be between 1 and {}, got {}",
                ADDRESS_SPACE, self.log_slots
            )));
        }
        if self.baud_rate == 0 {
            return Err(Error::Config(String::from("baud rate must be non-zero")));
        }
        if self.ping_retries == 0 {
            return Err(Error::Config(String::from("ping retries must be at least 1")));
        }
        if self.heartbeat_max_toggles == 0 {
            return Err(Error::Config(String::from(
                "heartbeat toggle ceiling must be at least 1",
            )));
        }
        if self.mismatch_cap == 0 {
            return Err(Error::Config(String::from("mismatch cap must be at least 1")));
        }
        Ok(())
    }
}
