use clap::{App, Arg};
use colored::*;
use i2c_sniffer::config::{OutputFormat, PinPair, SnifferConfig, DEFAULT_LOG_FILE};
use i2c_sniffer::gpio::simulated::{BusScript, SimulatedBackend};
use i2c_sniffer::gpio::{GpioBackend, Hardware};
use i2c_sniffer::logging::{self, Verbosity};
use i2c_sniffer::BusSniffer;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::info;

const DEFAULT_LOG_LEVEL: &str = "3";
const SIMULATION_PERIOD: Duration = Duration::from_millis(1000);
// 100 kHz
const SIMULATION_HALF_PERIOD_US: u32 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("i2c-sniffer")
        .version("0.1.0")
        .about("🔌 Passive I2C bus sniffer for Raspberry Pi GPIO")
        .arg(
            Arg::with_name("logfile")
                .short("l")
                .long("logfile")
                .value_name("FILE")
                .help("Log file, appended to")
                .takes_value(true)
                .default_value(DEFAULT_LOG_FILE),
        )
        .arg(
            Arg::with_name("loglevel")
                .short("L")
                .long("loglevel")
                .value_name("LEVEL")
                .help("0=error 1=warning 2=start/stop 3=data 4-5=analysis 6-7=gpio 8-9=info/trace")
                .takes_value(true)
                .default_value(DEFAULT_LOG_LEVEL)
                .validator(|v| v.parse::<Verbosity>().map(|_| ())),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Frame output format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Replay generated traffic instead of reading GPIO hardware"),
        )
        .arg(
            Arg::with_name("pins")
                .value_name("SDA,SCL[,NAME]")
                .help("BCM pin pair to sniff, optionally named")
                .multiple(true)
                .required(true),
        )
        .get_matches();

    let mut pairs = Vec::new();
    for value in matches.values_of("pins").into_iter().flatten() {
        match value.parse::<PinPair>() {
            Ok(pair) => pairs.push(pair),
            Err(e) => {
                eprintln!("{} invalid arguments passed: {}", "❌".red(), e.to_string().bright_red());
                std::process::exit(2);
            }
        }
    }

    let verbosity: Verbosity = matches.value_of("loglevel").unwrap_or(DEFAULT_LOG_LEVEL).parse()?;
    let format: OutputFormat = matches.value_of("format").unwrap_or("text").parse()?;
    let log_file = matches.value_of("logfile").unwrap_or(DEFAULT_LOG_FILE);
    logging::init(Path::new(log_file), verbosity)?;

    let configs: Vec<SnifferConfig> = pairs
        .iter()
        .map(|pair| {
            SnifferConfig::from_pins(pair)
                .with_verbosity(verbosity)
                .with_format(format)
        })
        .collect();

    if matches.is_present("simulate") {
        let hardware = Hardware::new(SimulatedBackend::new());
        let traffic = spawn_simulated_traffic(Arc::clone(&hardware), &pairs);
        let result = run(&hardware, configs).await;
        traffic.abort();
        return result;
    }

    run_hardware(configs).await
}

#[cfg(feature = "pigpio")]
async fn run_hardware(configs: Vec<SnifferConfig>) -> Result<(), Box<dyn std::error::Error>> {
    let hardware = i2c_sniffer::gpio::pigpio::Pigpio::shared();
    run(&hardware, configs).await
}

#[cfg(not(feature = "pigpio"))]
async fn run_hardware(_configs: Vec<SnifferConfig>) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "{} {}",
        "❌".red(),
        "built without GPIO hardware support, rebuild with --features pigpio or pass --simulate".bright_red()
    );
    std::process::exit(1);
}

async fn run<B: GpioBackend + 'static>(
    hardware: &Arc<Hardware<B>>,
    configs: Vec<SnifferConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sniffers = Vec::with_capacity(configs.len());
    for config in configs {
        let mut sniffer = BusSniffer::new(hardware, config);
        if !sniffer.is_valid() {
            eprintln!(
                "{} invalid arguments passed: SDA {} SCL {} for {}",
                "❌".red(),
                sniffer.config().sda,
                sniffer.config().scl,
                sniffer.name().bright_white()
            );
            std::process::exit(2);
        }
        if !sniffer.is_good() {
            eprintln!("{} could not initialize {}", "❌".red(), sniffer.name().bright_white());
            std::process::exit(1);
        }
        sniffer.prepare()?;
        sniffers.push(sniffer);
    }

    for sniffer in &mut sniffers {
        sniffer.start()?;
    }
    println!(
        "{} Sniffing {} bus(es), stop with Ctrl+C",
        "✅".green(),
        sniffers.len()
    );

    let received = wait_for_signal().await?;
    info!("{} received, shutting down", received);

    for sniffer in &mut sniffers {
        sniffer.stop();
    }
    Ok(())
}

/// SIGPIPE is already ignored by the Rust runtime.
async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    })
}

/// Periodically replays a register write followed by a combined
/// write/read on every simulated bus.
fn spawn_simulated_traffic(
    hardware: Arc<Hardware<SimulatedBackend>>,
    pairs: &[PinPair],
) -> JoinHandle<()> {
    let buses: Vec<(u8, u8)> = pairs
        .iter()
        .filter_map(|pair| Some((u8::try_from(pair.sda).ok()?, u8::try_from(pair.scl).ok()?)))
        .collect();

    tokio::spawn(async move {
        let mut interval = time::interval(SIMULATION_PERIOD);
        let epoch = Instant::now();
        let mut counter: u8 = 0;
        loop {
            interval.tick().await;
            counter = counter.wrapping_add(1);

            // microsecond ticks wrap like the hardware counter
            let tick = epoch.elapsed().as_micros() as u32;
            let mut events = Vec::new();
            for (sda, scl) in &buses {
                let script = BusScript::new(*sda, *scl, SIMULATION_HALF_PERIOD_US)
                    .starting_at(tick)
                    .write(0x50, &[0x10, counter])
                    .idle(100)
                    .start()
                    .byte(0x50 << 1, true)
                    .byte(0x10, true)
                    .repeated_start()
                    .byte(0x50 << 1 | 1, true)
                    .byte(counter, false)
                    .stop();
                events.extend(script.into_events());
            }

            let replay = Arc::clone(&hardware);
            if tokio::task::spawn_blocking(move || replay.backend().replay(&events))
                .await
                .is_err()
            {
                break;
            }
        }
    })
}
