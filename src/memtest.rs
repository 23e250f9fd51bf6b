//! Write-then-verify memory test over a coverage plan.
//!
//! Every address is written with its own value, so the expected contents of
//! any cell are known without keeping a shadow copy.

use std::fmt;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::coverage::CoveragePlan;
use crate::error::{hex, Error, Result};
use crate::session::LinkSession;
use crate::stop::StopSignal;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Write,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Write => f.write_str("Write"),
            Phase::Verify => f.write_str("Verify"),
        }
    }
}

/// What came back from a cell that did not verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Value(u16),
    /// Timeout or partial data; holds whatever bytes did arrive.
    Partial(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub address: u16,
    pub expected: u16,
    pub observed: Observation,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.observed {
            Observation::Value(value) => write!(
                f,
                "MISMATCH at 0x{:04X}: Expected 0x{:04X}, Got 0x{:04X}",
                self.address, self.expected, value
            ),
            Observation::Partial(bytes) => write!(
                f,
                "Error reading 0x{:04X}: Timeout or partial data ({})",
                self.address,
                hex(bytes)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    /// Size of the coverage plan.
    pub attempted: usize,
    /// Addresses read back before the run ended.
    pub verified: usize,
    pub mismatches: Vec<Mismatch>,
    /// Verification stopped at the mismatch cap.
    pub aborted_early: bool,
}

impl TestResult {
    pub fn error_count(&self) -> usize {
        self.mismatches.len()
    }

    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && !self.aborted_early && self.verified == self.attempted
    }
}

/// Receives progress from a running test. All methods default to no-ops.
pub trait MemtestObserver {
    fn phase_started(&mut self, _phase: Phase, _total: usize) {}
    fn progress(&mut self, _phase: Phase, _done: usize, _total: usize) {}
    fn mismatch(&mut self, _mismatch: &Mismatch) {}
}

impl MemtestObserver for () {}

pub struct MemoryTest<'a> {
    plan: &'a CoveragePlan,
    mismatch_cap: usize,
    stop: StopSignal,
}

impl<'a> MemoryTest<'a> {
    pub fn new(plan: &'a CoveragePlan, config: &Config, stop: StopSignal) -> Self {
        Self {
            plan,
            mismatch_cap: config.mismatch_cap,
            stop,
        }
    }

    /// Runs the write pass, then the verify pass, over the same plan.
    ///
    /// A rejected write ends the run with an error. Verification failures
    /// are collected in the result until the mismatch cap is hit.
    pub fn run<T: Transport>(
        &self,
        session: &mut LinkSession<T>,
        observer: &mut dyn MemtestObserver,
    ) -> Result<TestResult> {
        self.write_pass(session, observer)?;
        let result = self.verify_pass(session, observer)?;
        if result.passed() {
            info!(locations = result.attempted, "memory test passed");
        } else {
            warn!(errors = result.error_count(), aborted = result.aborted_early, "memory test failed");
        }
        Ok(result)
    }

    fn write_pass<T: Transport>(
        &self,
        session: &mut LinkSession<T>,
        observer: &mut dyn MemtestObserver,
    ) -> Result<()> {
        let total = self.plan.len();
        let step = self.plan.progress_step();
        info!(total, "write phase started (value = address)");
        observer.phase_started(Phase::Write, total);

        for (i, &address) in self.plan.addresses().iter().enumerate() {
            self.stop.check()?;
            if let Err(source) = session.write_word(address, address) {
                error!(address, error = %source, "write failed");
                return Err(Error::WriteRejected {
                    address,
                    source: Box::new(source),
                });
            }
            let done = i + 1;
            if done % step == 0 || done == total {
                observer.progress(Phase::Write, done, total);
            }
        }
        info!("write phase complete");
        Ok(())
    }

    fn verify_pass<T: Transport>(
        &self,
        session: &mut LinkSession<T>,
        observer: &mut dyn MemtestObserver,
    ) -> Result<TestResult> {
        let total = self.plan.len();
        let step = self.plan.progress_step();
        let mut result = TestResult {
            attempted: total,
            verified: 0,
            mismatches: Vec::new(),
            aborted_early: false,
        };
        info!(total, "verify phase started");
        observer.phase_started(Phase::Verify, total);

        for (i, &address) in self.plan.addresses().iter().enumerate() {
            self.stop.check()?;
            let expected = address;
            let observed = match session.read_word(address) {
                Ok(value) if value == expected => None,
                Ok(value) => Some(Observation::Value(value)),
                Err(Error::Timeout { received, .. }) => Some(Observation::Partial(received)),
                Err(e) => return Err(e),
            };
            result.verified = i + 1;

            if let Some(observed) = observed {
                let mismatch = Mismatch {
                    address,
                    expected,
                    observed,
                };
                warn!("{}", mismatch);
                observer.mismatch(&mismatch);
                result.mismatches.push(mismatch);
                if result.mismatches.len() >= self.mismatch_cap {
                    warn!(cap = self.mismatch_cap, "too many errors, aborting verification");
                    result.aborted_early = true;
                    break;
                }
            }

            let done = i + 1;
            if done % step == 0 || done == total {
                observer.progress(Phase::Verify, done, total);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::frame::Command;
    use crate::sim::{Faults, SimulatedDevice};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Default)]
    struct Recorder {
        phases: Vec<(Phase, usize)>,
        progress: Vec<(Phase, usize)>,
        mismatches: usize,
    }

    impl MemtestObserver for Recorder {
        fn phase_started(&mut self, phase: Phase, total: usize) {
            self.phases.push((phase, total));
        }
        fn progress(&mut self, phase: Phase, done: usize, _total: usize) {
            self.progress.push((phase, done));
        }
        fn mismatch(&mut self, _mismatch: &Mismatch) {
            self.mismatches += 1;
        }
    }

    fn ready(device: SimulatedDevice) -> LinkSession<SimulatedDevice> {
        let mut session = LinkSession::new(device, &Config::default());
        session.handshake(Command::Ping).unwrap();
        session
    }

    fn plan(addresses: &[u16]) -> CoveragePlan {
        CoveragePlan::from_addresses(addresses.to_vec()).unwrap()
    }

    #[test]
    fn clean_device_passes() {
        let plan = CoveragePlan::new(300, &mut StdRng::seed_from_u64(11)).unwrap();
        let mut session = ready(SimulatedDevice::new());
        let mut recorder = Recorder::default();
        let result = MemoryTest::new(&plan, &Config::default(), StopSignal::new())
            .run(&mut session, &mut recorder)
            .unwrap();

        assert!(result.passed());
        assert_eq!(result.verified, 300);
        for &address in plan.addresses() {
            assert_eq!(session.transport().peek(address), address);
        }
        assert_eq!(recorder.phases, vec![(Phase::Write, 300), (Phase::Verify, 300)]);
        // step = 3, so 100 updates per phase
        assert_eq!(recorder.progress.len(), 200);
        assert_eq!(recorder.progress.last(), Some(&(Phase::Verify, 300)));
    }

    #[test]
    fn write_frame_and_rejected_ack_abort_run() {
        let device = SimulatedDevice::new().with_faults(Faults {
            write_ack: Some((0x1234, 0x00)),
            ..Default::default()
        });
        let mut session = ready(device);
        let plan = plan(&[0x1234, 0x0001]);
        let err = MemoryTest::new(&plan, &Config::default(), StopSignal::new())
            .run(&mut session, &mut ())
            .unwrap_err();

        assert!(matches!(err, Error::WriteRejected { address: 0x1234, .. }));
        assert_eq!(err.class(), ErrorClass::Protocol);
        // ping, then exactly one write frame; nothing after the failure
        assert_eq!(session.transport().host_bytes(), &[0x04, 0x02, 0x12, 0x34, 0x12, 0x34]);
    }

    #[test]
    fn write_timeout_is_fatal() {
        let device = SimulatedDevice::new();
        let mut session = ready(device);
        session.transport_mut().faults.silent = true;
        let plan = plan(&[7]);
        let err = MemoryTest::new(&plan, &Config::default(), StopSignal::new())
            .run(&mut session, &mut ())
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Io);
    }

    #[test]
    fn mismatch_cap_aborts_verification() {
        let addresses: Vec<u16> = (0..20).collect();
        let mut faults = Faults::default();
        faults.corrupt_reads.extend(0..11u16);
        let mut session = ready(SimulatedDevice::new().with_faults(faults));
        let mut recorder = Recorder::default();
        let result = MemoryTest::new(&plan(&addresses), &Config::default(), StopSignal::new())
            .run(&mut session, &mut recorder)
            .unwrap();

        assert_eq!(result.error_count(), 10);
        assert!(result.aborted_early);
        assert!(!result.passed());
        assert_eq!(result.verified, 10);
        assert_eq!(recorder.mismatches, 10);
        assert_eq!(
            result.mismatches[0],
            Mismatch {
                address: 0,
                expected: 0,
                observed: Observation::Value(0xFFFF)
            }
        );
    }

    #[test]
    fn short_read_counts_as_mismatch() {
        let mut faults = Faults::default();
        faults.short_reads.insert(0x0102);
        let mut session = ready(SimulatedDevice::new().with_faults(faults));
        let result = MemoryTest::new(&plan(&[0x0102, 0x0103]), &Config::default(), StopSignal::new())
            .run(&mut session, &mut ())
            .unwrap();

        assert_eq!(result.error_count(), 1);
        assert!(!result.aborted_early);
        assert_eq!(result.verified, 2);
        assert_eq!(result.mismatches[0].observed, Observation::Partial(vec![0x01]));
        assert_eq!(
            result.mismatches[0].to_string(),
            "Error reading 0x0102: Timeout or partial data (01)"
        );
    }

    /// Holds back the second byte of one read reply until after the host
    /// has given up on it.
    struct LateTrailingByte {
        device: SimulatedDevice,
        address: u16,
        delaying: bool,
        late: Option<u8>,
    }

    impl Transport for LateTrailingByte {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            let [hi, lo] = self.address.to_be_bytes();
            if bytes == [0x03, hi, lo] {
                self.delaying = true;
            }
            self.device.write(bytes)
        }
        fn read(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
            let mut out: Vec<u8> = self.late.take().into_iter().collect();
            out.extend(self.device.read(max_bytes - out.len())?);
            if self.delaying && out.len() > 1 {
                self.late = out.pop();
                self.delaying = false;
            }
            Ok(out)
        }
        fn clear_input_buffer(&mut self) -> std::io::Result<()> {
            self.late = None;
            self.device.clear_input_buffer()
        }
        fn timeout(&self) -> std::time::Duration {
            self.device.timeout()
        }
        fn set_timeout(&mut self, timeout: std::time::Duration) -> std::io::Result<()> {
            self.device.set_timeout(timeout)
        }
        fn close(&mut self) {
            self.device.close()
        }
    }

    #[test]
    fn late_reply_byte_costs_one_mismatch() {
        let transport = LateTrailingByte {
            device: SimulatedDevice::new(),
            address: 0x0100,
            delaying: false,
            late: None,
        };
        let mut session = LinkSession::new(transport, &Config::default());
        session.handshake(Command::Ping).unwrap();
        let addresses: Vec<u16> = (0x0100..0x0114).collect();
        let result = MemoryTest::new(&plan(&addresses), &Config::default(), StopSignal::new())
            .run(&mut session, &mut ())
            .unwrap();

        assert_eq!(result.error_count(), 1);
        assert!(!result.aborted_early);
        assert_eq!(result.verified, 20);
        assert_eq!(
            result.mismatches[0].to_string(),
            "Error reading 0x0100: Timeout or partial data (01)"
        );
    }

    #[test]
    fn custom_cap_is_respected() {
        let config = Config {
            mismatch_cap: 2,
            ..Config::default()
        };
        let mut faults = Faults::default();
        faults.corrupt_reads.extend([1u16, 2, 3]);
        let mut session = ready(SimulatedDevice::new().with_faults(faults));
        let result = MemoryTest::new(&plan(&[1, 2, 3]), &config, StopSignal::new())
            .run(&mut session, &mut ())
            .unwrap();
        assert_eq!(result.error_count(), 2);
        assert!(result.aborted_early);
    }

    #[test]
    fn stop_signal_interrupts() {
        let stop = StopSignal::new();
        stop.raise();
        let mut session = ready(SimulatedDevice::new());
        let err = MemoryTest::new(&plan(&[1]), &Config::default(), stop)
            .run(&mut session, &mut ())
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn mismatch_display() {
        let m = Mismatch {
            address: 0x00FF,
            expected: 0x00FF,
            observed: Observation::Value(0x0000),
        };
        assert_eq!(m.to_string(), "MISMATCH at 0x00FF: Expected 0x00FF, Got 0x0000");
    }
}
