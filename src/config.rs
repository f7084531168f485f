use core::fmt;
use core::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::logging::Verbosity;

pub const DEFAULT_LOG_FILE: &str = "sniffer.log";
/// Consumer sleep when the transaction queue is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(50);
/// How long `start()` waits for the consumer thread to come up.
pub const START_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("expected SDA,SCL[,NAME], got '{0}'")]
    PinSyntax(String),
    #[error("'{0}' is not a GPIO number")]
    PinNumber(String),
    #[error("SDA and SCL must be different pins (both GPIO{0})")]
    SamePin(u32),
    #[error("unknown output format '{0}' (expected text or json)")]
    Format(String),
}

/// One `SDA,SCL[,NAME]` command-line argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinPair {
    pub sda: u32,
    pub scl: u32,
    pub name: Option<String>,
}

impl PinPair {
    pub fn new(sda: u32, scl: u32) -> Self {
        Self { sda, scl, name: None }
    }

    /// Given name, or `I2C-<sda>,<scl>`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("I2C-{},{}", self.sda, self.scl),
        }
    }
}

fn parse_pin(text: &str) -> Result<u32, ConfigError> {
    let text = text.trim();
    text.parse::<u32>()
        .map_err(|_| ConfigError::PinNumber(text.to_string()))
}

impl FromStr for PinPair {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ',');
        let (sda, scl) = match (parts.next(), parts.next()) {
            (Some(sda), Some(scl)) => (parse_pin(sda)?, parse_pin(scl)?),
            _ => return Err(ConfigError::PinSyntax(s.to_string())),
        };
        if sda == scl {
            return Err(ConfigError::SamePin(sda));
        }
        let name = parts
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        Ok(Self { sda, scl, name })
    }
}

impl fmt::Display for PinPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.sda, self.scl)?;
        if let Some(name) = &self.name {
            write!(f, ",{}", name)?;
        }
        Ok(())
    }
}

/// How decoded frames are written at data verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ConfigError::Format(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnifferConfig {
    pub name: String,
    pub sda: u32,
    pub scl: u32,
    pub verbosity: Verbosity,
    pub format: OutputFormat,
    pub poll_interval: Duration,
}

impl SnifferConfig {
    pub fn new(name: impl Into<String>, sda: u32, scl: u32) -> Self {
        Self {
            name: name.into(),
            sda,
            scl,
            verbosity: Verbosity::default(),
            format: OutputFormat::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_pins(pins: &PinPair) -> Self {
        Self::new(pins.display_name(), pins.sda, pins.scl)
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
