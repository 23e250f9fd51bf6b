use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use crossterm::cursor::MoveToColumn;
use crossterm::execute;
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{Clear, ClearType};
use gdp_bench::frame::Command as Frame;
use gdp_bench::sim::LogSlot;
use gdp_bench::{
    Config, CoveragePlan, Error, ErrorClass, GdpRun, LinkSession, MemoryTest, MemtestObserver,
    Mismatch, Phase, SerialTransport, SimulatedDevice, StopSignal, Transport,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Bench tooling for the FPGA GDP board", long_about = None)]
struct Cli {
    #[clap(short = 'p', long = "port", env = "GDP_BENCH_PORT", default_value = "/dev/ttyUSB0",
           help = "Serial port the board is attached to")]
    port: String,

    #[clap(short = 'b', long = "baud", default_value = "115200")]
    baud_rate: u32,

    #[clap(short = 't', long = "timeout", default_value = "3.0",
           help = "Per-read timeout in seconds")]
    timeout: f64,

    #[clap(short = 'v', long = "verbose", help = "Log every frame on the wire")]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Write every sampled address with its own value, then read it back.
    Memtest {
        #[clap(short = 'n', long = "size", default_value = "65536",
               help = "Number of addresses to test (max 65536)")]
        size: usize,

        #[clap(long = "seed", help = "Seed for the address shuffle")]
        seed: Option<u64>,

        #[clap(long = "max-errors", default_value = "10")]
        max_errors: usize,

        #[command(flatten)]
        target: Target,
    },
    /// Start the GDP and decode its diagnostic log.
    GdpLog {
        #[clap(long = "slots", default_value = "1024")]
        slots: usize,

        #[clap(long = "settle", default_value = "3.0",
               help = "Seconds to let the GDP run before reading the log")]
        settle: f64,

        #[command(flatten)]
        target: Target,
    },
    /// Act as the board on a serial port, answering with the simulated device.
    Serve {
        #[clap(long = "heartbeat", help = "Power up with the heartbeat enabled")]
        heartbeat: bool,
    },
    /// List serial ports present on this machine.
    Ports,
}

#[derive(Args, Debug)]
struct Target {
    #[clap(long = "simulate", help = "Run against the in-process simulated board")]
    simulate: bool,
}

/// How a completed run ended.
enum Outcome {
    Passed,
    Failed,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_stop.raise()) {
        warn!(error = %e, "could not install Ctrl+C handler");
    }

    let result = run(cli, stop);
    let code = exit_code(&result);
    if let Err(e) = &result {
        if code == 130 {
            println!("\nUser interrupted test.");
        } else {
            eprintln!("[FATAL] {:#}", e);
        }
    }
    ExitCode::from(code)
}

/// Maps a finished run onto the process exit status.
fn exit_code(result: &anyhow::Result<Outcome>) -> u8 {
    match result {
        Ok(Outcome::Passed) => 0,
        Ok(Outcome::Failed) => 1,
        Err(e) => match e.downcast_ref::<Error>().map(Error::class) {
            Some(ErrorClass::Interrupted) => 130,
            _ => 2,
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gdp_bench=debug,info" } else { "gdp_bench=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli, stop: StopSignal) -> anyhow::Result<Outcome> {
    let mut config = Config {
        port: cli.port,
        baud_rate: cli.baud_rate,
        read_timeout: seconds(cli.timeout, "timeout")?,
        ..Config::default()
    };

    match cli.command {
        Mode::Memtest {
            size,
            seed,
            max_errors,
            target,
        } => {
            config.test_size = size;
            config.seed = seed;
            config.mismatch_cap = max_errors;
            config.validate()?;
            let transport = open_transport(&config, target.simulate, Vec::new())?;
            run_memtest(&config, transport, stop)
        }
        Mode::GdpLog {
            slots,
            settle,
            target,
        } => {
            config.log_slots = slots;
            config.gdp_settle = seconds(settle, "settle")?;
            config.validate()?;
            let transport = open_transport(&config, target.simulate, demo_log())?;
            run_gdp_log(&config, transport, stop)
        }
        Mode::Serve { heartbeat } => {
            config.validate()?;
            run_serve(&config, heartbeat, stop)
        }
        Mode::Ports => list_ports(),
    }
}

fn seconds(value: f64, what: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        Error::Config(format!(
            "{} must be a non-negative number of seconds, got {}",
            what, value
        ))
        .into()
    })
}

fn open_transport(
    config: &Config,
    simulate: bool,
    log: Vec<LogSlot>,
) -> anyhow::Result<Box<dyn Transport>> {
    if simulate {
        println!("Using simulated board.");
        return Ok(Box::new(SimulatedDevice::new().with_heartbeat().with_log(&log)));
    }
    let transport = SerialTransport::open(&config.port, config.baud_rate, config.read_timeout)
        .map_err(Error::from)
        .with_context(|| format!("failed to open serial port '{}'", config.port))?;
    println!("Connected to {} at {} baud.", config.port, config.baud_rate);
    Ok(Box::new(transport))
}

fn run_memtest(
    config: &Config,
    transport: Box<dyn Transport>,
    stop: StopSignal,
) -> anyhow::Result<Outcome> {
    let mut session = LinkSession::new(transport, config);

    println!("\n--- Checking for Heartbeat (0xAA) ---");
    session.suppress_heartbeat()?;

    println!("\n--- Ping Test (Cmd 0x04) ---");
    session.handshake(Frame::Ping)?;
    println!("SUCCESS: Ping replied with 0xEE. FPGA is responsive.");

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let plan = CoveragePlan::new(config.test_size, &mut rng)?;

    let mut reporter = ConsoleReporter;
    let result = MemoryTest::new(&plan, config, stop).run(&mut session, &mut reporter)?;

    println!("\n{}", "=".repeat(40));
    let outcome = if result.passed() {
        println!(
            "{}",
            format!("TEST PASSED: {} locations verified successfully.", result.attempted).green()
        );
        Outcome::Passed
    } else {
        if result.aborted_early {
            println!("Too many errors. Verification aborted early.");
        }
        println!(
            "{}",
            format!("TEST FAILED: Found {} errors.", result.error_count()).red()
        );
        Outcome::Failed
    };
    println!("{}", "=".repeat(40));
    Ok(outcome)
}

fn run_gdp_log(
    config: &Config,
    transport: Box<dyn Transport>,
    stop: StopSignal,
) -> anyhow::Result<Outcome> {
    let mut session = LinkSession::new(transport, config);
    let gdp = GdpRun::new(config, stop);
    let scan = gdp.run(&mut session, &mut |entry| println!("{}", entry))?;
    if let Some(slot) = scan.fatal_at {
        println!("Fatal signal logged at 0x{:04X}; remaining log ignored.", slot);
    }
    Ok(Outcome::Passed)
}

/// Prints progress on a single line that is redrawn in place.
struct ConsoleReporter;

impl MemtestObserver for ConsoleReporter {
    fn phase_started(&mut self, phase: Phase, total: usize) {
        match phase {
            Phase::Write => println!("\n--- Write Test ({} addresses, value = address) ---", total),
            Phase::Verify => println!("\n--- Verification (Read Phase) ---"),
        }
    }

    fn progress(&mut self, phase: Phase, done: usize, total: usize) {
        let percent = done as f64 / total as f64 * 100.0;
        let line = format!("  [{}] {}/{} words ({:.1}%) complete...", phase, done, total, percent);
        let mut stdout = io::stdout();
        // Progress output is best effort.
        let _ = execute!(stdout, MoveToColumn(0), Clear(ClearType::CurrentLine), Print(line));
        if done == total {
            println!();
        }
    }

    fn mismatch(&mut self, mismatch: &Mismatch) {
        let mut stdout = io::stdout();
        let _ = execute!(stdout, MoveToColumn(0), Clear(ClearType::CurrentLine));
        println!("{}", mismatch.to_string().red());
    }
}

// Handles the serial port listening mode.
fn run_serve(config: &Config, heartbeat: bool, stop: StopSignal) -> anyhow::Result<Outcome> {
    let mut device = SimulatedDevice::new().with_log(&demo_log());
    if heartbeat {
        device = device.with_heartbeat();
    }

    let mut port = serialport::new(&config.port, config.baud_rate)
        .timeout(Duration::from_millis(100))
        .open()
        .with_context(|| format!("failed to open serial port '{}'", config.port))?;

    println!(
        "\nServing simulated board on {} at {} baud. Press Ctrl+C to exit.",
        config.port, config.baud_rate
    );

    let heartbeat_period = Duration::from_secs(1);
    let mut last_beat = Instant::now();
    let mut serial_buf: Vec<u8> = vec![0; 128];
    while !stop.is_raised() {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) if bytes_read > 0 => {
                let replies = device.feed(&serial_buf[..bytes_read]);
                if !replies.is_empty() {
                    port.write_all(&replies).context("failed to write to serial port")?;
                }
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                if let Some(byte) = device.idle_byte() {
                    if last_beat.elapsed() >= heartbeat_period {
                        port.write_all(&[byte]).context("failed to write heartbeat")?;
                        last_beat = Instant::now();
                    }
                }
            }
            Err(e) => return Err(e).context("serial port error"),
        }
    }
    info!("serve mode stopped");
    Err(Error::Interrupted.into())
}

fn list_ports() -> anyhow::Result<Outcome> {
    let ports = serialport::available_ports().context("could not enumerate serial ports")?;
    if ports.is_empty() {
        bail!("no serial ports found");
    }
    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }
    Ok(Outcome::Passed)
}

/// Log contents served by the simulated board: init, a few accesses, fatal.
fn demo_log() -> Vec<LogSlot> {
    vec![
        LogSlot { access_addr: 0x00, spec: 0x00F4 },
        LogSlot { access_addr: 0x10, spec: 0x0004 },
        LogSlot { access_addr: 0x24, spec: 0x0049 },
        LogSlot { access_addr: 0x30, spec: 0x0071 },
        LogSlot { access_addr: 0x08, spec: 0x00C7 },
        LogSlot { access_addr: 0x00, spec: 0x00F0 },
    ]
}
