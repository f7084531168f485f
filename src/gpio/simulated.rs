//! In-process GPIO backend.
//!
//! Records configuration per pin and delivers edges synchronously to the
//! installed callbacks, the same way the hardware notification thread does.
//! [`BusScript`] renders I2C bus conditions into the edge sequence a real bus
//! would produce, so the whole pipeline can run without hardware.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{EdgeCallback, EdgeEvent, GpioBackend, GpioError, Level, PinMode, Pull, Tick, GPIO_PIN_COUNT};
use crate::queue::lock;

const SIMULATED_VERSION: u32 = 79;

#[derive(Debug)]
struct SimState {
    initialise_calls: u32,
    terminate_calls: u32,
    fail_initialise: bool,
    refused: HashSet<u8>,
    levels: [Level; GPIO_PIN_COUNT],
    pulls: [Option<Pull>; GPIO_PIN_COUNT],
    modes: [Option<PinMode>; GPIO_PIN_COUNT],
}

pub struct SimulatedBackend {
    state: Mutex<SimState>,
    callbacks: Mutex<HashMap<u8, EdgeCallback>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                initialise_calls: 0,
                terminate_calls: 0,
                fail_initialise: false,
                refused: HashSet::new(),
                // pulled-up idle bus
                levels: [Level::High; GPIO_PIN_COUNT],
                pulls: [None; GPIO_PIN_COUNT],
                modes: [None; GPIO_PIN_COUNT],
            }),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Backend whose initialisation always fails.
    pub fn failing() -> Self {
        let backend = Self::new();
        lock(&backend.state).fail_initialise = true;
        backend
    }

    /// Make callback registration on `pin` fail.
    pub fn refuse_callbacks_on(&self, pin: u8) {
        lock(&self.state).refused.insert(pin);
    }

    pub fn initialise_calls(&self) -> u32 {
        lock(&self.state).initialise_calls
    }

    pub fn terminate_calls(&self) -> u32 {
        lock(&self.state).terminate_calls
    }

    pub fn pull(&self, pin: u8) -> Option<Pull> {
        lock(&self.state).pulls.get(usize::from(pin)).copied().flatten()
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        lock(&self.state).modes.get(usize::from(pin)).copied().flatten()
    }

    pub fn has_callback(&self, pin: u8) -> bool {
        lock(&self.callbacks).contains_key(&pin)
    }

    /// Change a level without notifying anyone.
    pub fn set_level(&self, pin: u8, level: Level) {
        if let Some(slot) = lock(&self.state).levels.get_mut(usize::from(pin)) {
            *slot = level;
        }
    }

    /// Apply one edge and run the callback of its pin, if any.
    pub fn drive(&self, event: EdgeEvent) {
        self.set_level(event.pin, event.level);
        if let Some(callback) = lock(&self.callbacks).get_mut(&event.pin) {
            callback(event);
        }
    }

    pub fn replay(&self, events: &[EdgeEvent]) {
        for event in events {
            self.drive(*event);
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBackend for SimulatedBackend {
    fn initialise(&self) -> Result<u32, GpioError> {
        let mut state = lock(&self.state);
        state.initialise_calls += 1;
        if state.fail_initialise {
            Err(GpioError::InitFailed(-1))
        } else {
            Ok(SIMULATED_VERSION)
        }
    }

    fn terminate(&self) {
        lock(&self.state).terminate_calls += 1;
    }

    fn set_pull(&self, pin: u8, pull: Pull) -> Result<(), GpioError> {
        let mut state = lock(&self.state);
        let slot = state
            .pulls
            .get_mut(usize::from(pin))
            .ok_or(GpioError::BadPin(u32::from(pin)))?;
        *slot = Some(pull);
        Ok(())
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), GpioError> {
        let mut state = lock(&self.state);
        let slot = state
            .modes
            .get_mut(usize::from(pin))
            .ok_or(GpioError::BadPin(u32::from(pin)))?;
        *slot = Some(mode);
        Ok(())
    }

    fn read_level(&self, pin: u8) -> Result<Level, GpioError> {
        lock(&self.state)
            .levels
            .get(usize::from(pin))
            .copied()
            .ok_or(GpioError::BadPin(u32::from(pin)))
    }

    fn set_edge_callback(&self, pin: u8, callback: Option<EdgeCallback>) -> Result<(), GpioError> {
        if lock(&self.state).refused.contains(&pin) {
            return Err(GpioError::Registration { pin, code: -1 });
        }
        let mut callbacks = lock(&self.callbacks);
        match callback {
            Some(callback) => {
                callbacks.insert(pin, callback);
            }
            None => {
                callbacks.remove(&pin);
            }
        }
        Ok(())
    }
}

/// Builds the SDA/SCL edge sequence of I2C bus activity.
///
/// Starts from an idle bus (both lines high). Data changes only while SCL is
/// low; conditions change SDA while SCL is high.
#[derive(Debug, Clone)]
pub struct BusScript {
    sda: u8,
    scl: u8,
    half_period: Tick,
    tick: Tick,
    sda_level: Level,
    scl_level: Level,
    events: Vec<EdgeEvent>,
}

impl BusScript {
    /// `half_period` is the SCL high (and low) time in microseconds.
    pub fn new(sda: u8, scl: u8, half_period: Tick) -> Self {
        Self {
            sda,
            scl,
            half_period: half_period.max(2),
            tick: 1_000,
            sda_level: Level::High,
            scl_level: Level::High,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn starting_at(mut self, tick: Tick) -> Self {
        self.tick = tick;
        self
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    fn quarter(&self) -> Tick {
        self.half_period / 2
    }

    fn advance(&mut self, us: Tick) {
        self.tick = self.tick.wrapping_add(us);
    }

    fn set_sda(&mut self, level: Level) {
        if self.sda_level != level {
            self.sda_level = level;
            self.events.push(EdgeEvent::new(self.sda, level, self.tick));
        }
    }

    fn set_scl(&mut self, level: Level) {
        if self.scl_level != level {
            self.scl_level = level;
            self.events.push(EdgeEvent::new(self.scl, level, self.tick));
        }
    }

    /// Bus left idle for `us` microseconds.
    #[must_use]
    pub fn idle(mut self, us: Tick) -> Self {
        self.advance(us);
        self
    }

    /// START from an idle bus, or REPEATED-START in the middle of a transfer.
    #[must_use]
    pub fn start(mut self) -> Self {
        let quarter = self.quarter();
        if !self.scl_level.is_high() {
            self.set_sda(Level::High);
            self.advance(quarter);
            self.set_scl(Level::High);
            self.advance(quarter);
        }
        self.set_sda(Level::Low);
        self.advance(quarter);
        self.set_scl(Level::Low);
        self.advance(quarter);
        self
    }

    #[must_use]
    pub fn repeated_start(self) -> Self {
        self.start()
    }

    #[must_use]
    pub fn stop(mut self) -> Self {
        let quarter = self.quarter();
        self.set_sda(Level::Low);
        self.advance(quarter);
        self.set_scl(Level::High);
        self.advance(quarter);
        self.set_sda(Level::High);
        self.advance(self.half_period);
        self
    }

    /// One clock cycle carrying `bit`.
    #[must_use]
    pub fn bit(mut self, bit: bool) -> Self {
        let quarter = self.quarter();
        self.set_sda(Level::from(bit));
        self.advance(quarter);
        self.set_scl(Level::High);
        self.advance(self.half_period);
        self.set_scl(Level::Low);
        self.advance(self.half_period - quarter);
        self
    }

    /// Eight bits MSB first, then the acknowledge cycle (`ack` drives SDA low).
    #[must_use]
    pub fn byte(mut self, value: u8, ack: bool) -> Self {
        for shift in (0..8).rev() {
            self = self.bit(value >> shift & 1 == 1);
        }
        self.bit(!ack)
    }

    /// START, 7-bit address with write direction, acknowledged bytes, STOP.
    #[must_use]
    pub fn write(self, address: u8, bytes: &[u8]) -> Self {
        let mut script = self.start().byte(address << 1, true);
        for byte in bytes {
            script = script.byte(*byte, true);
        }
        script.stop()
    }

    /// START, 7-bit address with read direction, bytes acknowledged by the
    /// master except the last one, STOP.
    #[must_use]
    pub fn read(self, address: u8, bytes: &[u8]) -> Self {
        let mut script = self.start().byte(address << 1 | 1, true);
        for (index, byte) in bytes.iter().enumerate() {
            script = script.byte(*byte, index + 1 < bytes.len());
        }
        script.stop()
    }

    pub fn events(&self) -> &[EdgeEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EdgeEvent> {
        self.events
    }
}
