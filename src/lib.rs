//! # GDP Bench Library
//!
//! Host-side tooling for the FPGA GDP board. It talks to the board over a
//! UART using a small fixed command/response protocol, runs exhaustive or
//! sampled write/verify tests of the board's 64K-word SRAM, and decodes the
//! FPGA's diagnostic log.

pub mod config;
pub mod coverage;
pub mod error;
pub mod frame;
pub mod gdp;
pub mod log_decoder;
pub mod memtest;
pub mod session;
pub mod sim;
pub mod stop;
pub mod transport;

pub use config::Config;
pub use coverage::CoveragePlan;
pub use error::{Error, ErrorClass, Result};
pub use gdp::{GdpRun, LogScan};
pub use log_decoder::{decode, LogEntry};
pub use memtest::{MemoryTest, MemtestObserver, Mismatch, Phase, TestResult};
pub use session::{LinkSession, LinkState};
pub use sim::SimulatedDevice;
pub use stop::StopSignal;
pub use transport::{SerialTransport, Transport};
