//! Numeric verbosity scale and the per-sniffer log sink.
//!
//! Verbosity 0..=9 is the user-facing knob; each value maps onto a tracing
//! level so one subscriber serves every sniffer. A message is emitted when
//! its verbosity is at or below the configured threshold.

use arrayvec::ArrayString;
use core::fmt;
use core::str::FromStr;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;

const SNIFFER_NAME_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Verbosity(u8);

impl Verbosity {
    pub const ERROR: Verbosity = Verbosity(0);
    pub const WARNING: Verbosity = Verbosity(1);
    pub const START_STOP: Verbosity = Verbosity(2);
    pub const DATA: Verbosity = Verbosity(3);
    pub const ANALYSIS: Verbosity = Verbosity(4);
    pub const GPIO: Verbosity = Verbosity(6);
    pub const INFO: Verbosity = Verbosity(8);
    pub const TRACE: Verbosity = Verbosity(9);

    pub const MAX: u8 = 9;

    /// Values above 9 are clamped.
    pub fn new(value: u8) -> Self {
        Verbosity(value.min(Self::MAX))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn level(self) -> Level {
        match self.0 {
            0 => Level::ERROR,
            1 => Level::WARN,
            2..=3 => Level::INFO,
            4..=5 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        LevelFilter::from_level(self.level())
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::DATA
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u8>() {
            Ok(value) if value <= Self::MAX => Ok(Verbosity(value)),
            Ok(value) => Err(format!("log level {} out of range 0-{}", value, Self::MAX)),
            Err(_) => Err(format!("log level '{}' is not a number", s)),
        }
    }
}

/// Log sink of one sniffer: its name and verbosity threshold.
#[derive(Debug, Clone)]
pub struct SnifferLog {
    name: ArrayString<SNIFFER_NAME_CAPACITY>,
    threshold: Verbosity,
}

impl SnifferLog {
    /// Names longer than the buffer are cut at a character boundary.
    pub fn new(name: &str, threshold: Verbosity) -> Self {
        let mut buffer = ArrayString::new();
        for c in name.chars() {
            if buffer.try_push(c).is_err() {
                break;
            }
        }
        Self {
            name: buffer,
            threshold,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> Verbosity {
        self.threshold
    }

    pub fn enabled(&self, level: Verbosity) -> bool {
        level <= self.threshold
    }

    pub fn log(&self, level: Verbosity, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let sniffer = self.name.as_str();
        match level.value() {
            0 => error!(sniffer = sniffer, "{}", args),
            1 => warn!(sniffer = sniffer, "{}", args),
            2..=3 => info!(sniffer = sniffer, "{}", args),
            4..=5 => debug!(sniffer = sniffer, "{}", args),
            _ => trace!(sniffer = sniffer, "{}", args),
        }
    }
}

/// Install the global subscriber: every event goes to stdout and is
/// appended to `log_file`.
pub fn init(log_file: &Path, verbosity: Verbosity) -> Result<(), LoggingError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|source| LoggingError::OpenFile {
            path: log_file.to_path_buf(),
            source,
        })?;

    tracing_subscriber::fmt()
        .with_max_level(verbosity.level_filter())
        .with_ansi(false)
        .with_target(false)
        .with_writer(io::stdout.and(Arc::new(file)))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)
}
