//! GPIO access for the sniffer.
//!
//! The hardware library itself stays behind [`GpioBackend`]. Everything the
//! decoder needs from it is pull/mode configuration, level reads and one edge
//! callback per pin. [`Hardware`] wraps a backend with the process-wide
//! initialise/terminate reference count, and [`GpioLine`] is the per-pin
//! handle that takes part in that count.
//!
//! Pin numbering is always the BCM (chip) numbering, never the connector.

pub mod simulated;

#[cfg(feature = "pigpio")]
pub mod pigpio;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::queue::lock;

/// Hardware microsecond tick, wraps every 2^32 µs (about 71.58 minutes).
pub type Tick = u32;

/// Edge handler installed on a line. Runs in the hardware notification
/// context: it must not block and must not allocate without bound.
pub type EdgeCallback = Box<dyn FnMut(EdgeEvent) + Send + 'static>;

pub const GPIO_PIN_COUNT: usize = 54;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("GPIO{0} is reserved or not available")]
    BadPin(u32),
    #[error("GPIO hardware initialisation failed ({0})")]
    InitFailed(i32),
    #[error("GPIO hardware is not initialised")]
    NotInitialised,
    #[error("pull mode {pull:?} rejected on GPIO{pin} ({code})")]
    BadPull { pin: u8, pull: Pull, code: i32 },
    #[error("pin mode {mode:?} rejected on GPIO{pin} ({code})")]
    BadMode { pin: u8, mode: PinMode, code: i32 },
    #[error("edge callback registration failed on GPIO{pin} ({code})")]
    Registration { pin: u8, code: i32 },
    #[error("hardware error {code} on GPIO{pin}")]
    Hardware { pin: u8, code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Level {
    Low,
    #[default]
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn as_bit(self) -> u8 {
        u8::from(self.is_high())
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pull {
    Off,
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    Input,
    Output,
}

/// One observed transition on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEvent {
    pub pin: u8,
    pub level: Level,
    pub tick: Tick,
}

impl EdgeEvent {
    pub fn new(pin: u8, level: Level, tick: Tick) -> Self {
        Self { pin, level, tick }
    }
}

/// Board usage of a BCM pin, as a bit set of alternate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinUsage(u8);

impl PinUsage {
    pub const UNAVAILABLE: Self = Self(0);
    pub const SAFE: Self = Self(1);
    pub const UART: Self = Self(2);
    pub const I2C: Self = Self(4);
    pub const SPI: Self = Self(8);
    /// ID EEPROM bus of HAT boards.
    pub const I2C0: Self = Self(16);
    /// Only routed on the 40-pin (B+ and later) header.
    pub const PLUS: Self = Self(32);
    pub const PWM: Self = Self(64);

    const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn of(pin: u32) -> Self {
        usize::try_from(pin)
            .ok()
            .and_then(|index| PIN_USAGE.get(index).copied())
            .unwrap_or(Self::UNAVAILABLE)
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_available(self) -> bool {
        self != Self::UNAVAILABLE
    }
}

const SAFE_PLUS: PinUsage = PinUsage::SAFE.with(PinUsage::PLUS);
const SAFE_PWM_PLUS: PinUsage = SAFE_PLUS.with(PinUsage::PWM);
const SAFE_SPI_PLUS: PinUsage = SAFE_PLUS.with(PinUsage::SPI);
const SPI_PLUS: PinUsage = PinUsage::SPI.with(PinUsage::PLUS);
const NA: PinUsage = PinUsage::UNAVAILABLE;

#[rustfmt::skip]
static PIN_USAGE: [PinUsage; GPIO_PIN_COUNT] = [
    PinUsage::I2C0, PinUsage::I2C0,     // GPIO0-1 HAT ID EEPROM
    PinUsage::I2C, PinUsage::I2C,       // GPIO2-3 I2C bus 1
    PinUsage::SAFE,                     // GPIO4 GPCLK0
    SAFE_PLUS, SAFE_PLUS,               // GPIO5-6 GPCLK1/2
    PinUsage::SPI, PinUsage::SPI, PinUsage::SPI, PinUsage::SPI, PinUsage::SPI, // GPIO7-11 SPI0
    SAFE_PWM_PLUS, SAFE_PWM_PLUS,       // GPIO12-13
    PinUsage::UART, PinUsage::UART,     // GPIO14-15 TxD0/RxD0
    SAFE_PLUS,                          // GPIO16
    PinUsage::SAFE, PinUsage::SAFE,     // GPIO17-18
    SAFE_SPI_PLUS, SAFE_SPI_PLUS,       // GPIO19-20 SPI1 MISO/MOSI
    SPI_PLUS,                           // GPIO21 SPI1 SCLK
    PinUsage::SAFE, PinUsage::SAFE, PinUsage::SAFE, PinUsage::SAFE, // GPIO22-25
    SAFE_PLUS,                          // GPIO26
    PinUsage::SAFE,                     // GPIO27
    NA, NA, NA, NA,                     // GPIO28-31 board config straps
    NA, NA, NA, NA, NA, NA, NA, NA,     // GPIO32-39
    NA, NA, NA, NA, NA, NA,             // GPIO40-45 PWM audio
    NA, NA, NA, NA, NA, NA, NA, NA,     // GPIO46-53 HDMI hotplug, SD card
];

// validated pins are stored as u8
const_assert!(GPIO_PIN_COUNT <= 1 << u8::BITS);

/// Contract consumed from the hardware access library.
pub trait GpioBackend: Send + Sync {
    /// Bring the library up. Returns the library version.
    fn initialise(&self) -> Result<u32, GpioError>;

    fn terminate(&self);

    fn set_pull(&self, pin: u8, pull: Pull) -> Result<(), GpioError>;

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), GpioError>;

    fn read_level(&self, pin: u8) -> Result<Level, GpioError>;

    /// Install (`Some`) or remove (`None`) the edge callback of `pin`.
    /// Ticks handed to the callback wrap at 2^32.
    fn set_edge_callback(&self, pin: u8, callback: Option<EdgeCallback>) -> Result<(), GpioError>;
}

#[derive(Debug, Default)]
struct Users {
    count: usize,
    version: Option<u32>,
}

/// Backend plus its shared initialisation state.
///
/// The first [`GpioLine`] created initialises the backend and the last one
/// dropped terminates it; no single line owns the hardware.
#[derive(Debug)]
pub struct Hardware<B: GpioBackend> {
    backend: B,
    users: Mutex<Users>,
}

impl<B: GpioBackend> Hardware<B> {
    pub fn new(backend: B) -> Arc<Self> {
        Arc::new(Self {
            backend,
            users: Mutex::new(Users::default()),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of live lines sharing the hardware.
    pub fn users(&self) -> usize {
        lock(&self.users).count
    }

    pub fn is_initialised(&self) -> bool {
        lock(&self.users).version.is_some()
    }

    pub fn version(&self) -> Option<u32> {
        lock(&self.users).version
    }

    fn acquire(&self) {
        let mut users = lock(&self.users);
        if users.count == 0 {
            users.version = match self.backend.initialise() {
                Ok(version) => {
                    debug!(version, "GPIO hardware initialised");
                    Some(version)
                }
                Err(error) => {
                    warn!(%error, "GPIO hardware initialisation failed");
                    None
                }
            };
        }
        users.count += 1;
    }

    fn release(&self) {
        let mut users = lock(&self.users);
        debug_assert!(users.count > 0, "GPIO hardware released more often than acquired");
        users.count = users.count.saturating_sub(1);
        if users.count == 0 && users.version.take().is_some() {
            self.backend.terminate();
            debug!("GPIO hardware terminated");
        }
    }
}

/// Handle on one GPIO pin.
///
/// Construction never fails: an unavailable pin yields an invalid line and
/// every operation on it reports [`GpioError::BadPin`], so callers can probe
/// pins before deciding how to proceed.
pub struct GpioLine<B: GpioBackend> {
    hardware: Arc<Hardware<B>>,
    requested: u32,
    pin: Option<u8>,
    pull: Option<Pull>,
    mode: Option<PinMode>,
    callback_installed: bool,
}

impl<B: GpioBackend> GpioLine<B> {
    pub fn new(hardware: &Arc<Hardware<B>>, pin: u32) -> Self {
        hardware.acquire();
        let validated = if PinUsage::of(pin).is_available() {
            u8::try_from(pin).ok()
        } else {
            None
        };

        Self {
            hardware: Arc::clone(hardware),
            requested: pin,
            pin: validated,
            pull: None,
            mode: None,
            callback_installed: false,
        }
    }

    /// The validated pin, `None` when the requested pin is unavailable.
    pub fn pin(&self) -> Option<u8> {
        self.pin
    }

    pub fn requested_pin(&self) -> u32 {
        self.requested
    }

    pub fn usage(&self) -> PinUsage {
        PinUsage::of(self.requested)
    }

    pub fn is_valid(&self) -> bool {
        self.pin.is_some()
    }

    /// Valid and backed by initialised hardware.
    pub fn is_good(&self) -> bool {
        self.is_valid() && self.hardware.is_initialised()
    }

    pub fn pull(&self) -> Option<Pull> {
        self.pull
    }

    pub fn mode(&self) -> Option<PinMode> {
        self.mode
    }

    pub fn has_callback(&self) -> bool {
        self.callback_installed
    }

    fn checked_pin(&self) -> Result<u8, GpioError> {
        let pin = self.pin.ok_or(GpioError::BadPin(self.requested))?;
        if self.hardware.is_initialised() {
            Ok(pin)
        } else {
            Err(GpioError::NotInitialised)
        }
    }

    /// Set the pull resistor first, then the direction.
    pub fn configure(&mut self, pull: Pull, mode: PinMode) -> Result<(), GpioError> {
        let pin = self.checked_pin()?;
        self.hardware.backend.set_pull(pin, pull)?;
        self.pull = Some(pull);
        self.hardware.backend.set_mode(pin, mode)?;
        self.mode = Some(mode);
        Ok(())
    }

    pub fn read_level(&self) -> Result<Level, GpioError> {
        let pin = self.checked_pin()?;
        self.hardware.backend.read_level(pin)
    }

    /// Replaces any callback already installed on this line.
    pub fn register_edge_callback<F>(&mut self, callback: F) -> Result<(), GpioError>
    where
        F: FnMut(EdgeEvent) + Send + 'static,
    {
        let pin = self.checked_pin()?;
        self.hardware
            .backend
            .set_edge_callback(pin, Some(Box::new(callback)))?;
        self.callback_installed = true;
        Ok(())
    }

    /// No-op when nothing is installed.
    pub fn unregister_edge_callback(&mut self) -> Result<(), GpioError> {
        if !self.callback_installed {
            return Ok(());
        }
        let pin = self.checked_pin()?;
        self.hardware.backend.set_edge_callback(pin, None)?;
        self.callback_installed = false;
        Ok(())
    }
}

impl<B: GpioBackend> Drop for GpioLine<B> {
    fn drop(&mut self) {
        if let Err(error) = self.unregister_edge_callback() {
            warn!(pin = self.requested, %error, "edge callback not removed");
        }
        self.hardware.release();
    }
}
