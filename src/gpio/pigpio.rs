//! Backend over the pigpio C library.
//!
//! pigpio samples the GPIO bank on its own thread and reports every level
//! change with a microsecond tick. Callbacks registered through
//! `gpioSetAlertFuncEx` receive an opaque user pointer; here that pointer is
//! a boxed [`CallbackSlot`] owned by the backend, so the raw pointer never
//! leaves this module.
//!
//! pigpio normally installs handlers for SIGINT, SIGTERM and friends that
//! call `exit()`. They are switched off before initialisation so the
//! application's own signal handling gets to stop the sniffers.

use std::collections::HashMap;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;
use std::sync::{Arc, Mutex, OnceLock};

use super::{EdgeCallback, EdgeEvent, GpioBackend, GpioError, Hardware, Level, PinMode, Pull};
use crate::queue::lock;

const PI_INPUT: c_uint = 0;
const PI_OUTPUT: c_uint = 1;

const PI_PUD_OFF: c_uint = 0;
const PI_PUD_DOWN: c_uint = 1;
const PI_PUD_UP: c_uint = 2;

const PI_DISABLE_FIFO_IF: c_uint = 1;
const PI_DISABLE_SOCK_IF: c_uint = 2;

const PI_CFG_NOSIGHANDLER: u32 = 1 << 10;

/// Level reported by a watchdog timeout rather than an edge.
const PI_TIMEOUT: c_int = 2;

type AlertFuncEx = unsafe extern "C" fn(gpio: c_int, level: c_int, tick: u32, user: *mut c_void);

#[link(name = "pigpio")]
extern "C" {
    fn gpioCfgInterfaces(ifFlags: c_uint) -> c_int;
    fn gpioCfgGetInternals() -> u32;
    fn gpioCfgSetInternals(cfgVal: u32) -> c_int;
    fn gpioInitialise() -> c_int;
    fn gpioTerminate();
    fn gpioSetMode(gpio: c_uint, mode: c_uint) -> c_int;
    fn gpioSetPullUpDown(gpio: c_uint, pud: c_uint) -> c_int;
    fn gpioRead(gpio: c_uint) -> c_int;
    fn gpioSetAlertFuncEx(gpio: c_uint, f: Option<AlertFuncEx>, userdata: *mut c_void) -> c_int;
}

/// One per pin, allocated on first registration and reused afterwards.
/// The callback inside is swapped or cleared; the slot itself stays put
/// because pigpio may still deliver an alert after unregistration.
struct CallbackSlot {
    pin: u8,
    callback: Mutex<Option<EdgeCallback>>,
}

unsafe extern "C" fn on_alert(_gpio: c_int, level: c_int, tick: u32, user: *mut c_void) {
    if user.is_null() || level == PI_TIMEOUT {
        return;
    }
    // SAFETY: `user` is the address of a CallbackSlot boxed by `Pigpio`,
    // which keeps it alive until the library is terminated.
    let slot = &*user.cast::<CallbackSlot>();
    let event = EdgeEvent::new(slot.pin, Level::from(level != 0), tick);
    if let Some(callback) = lock(&slot.callback).as_mut() {
        callback(event);
    }
}

/// pigpio configuration word with the signal handlers disabled.
fn without_signal_handlers(internals: u32) -> u32 {
    internals | PI_CFG_NOSIGHANDLER
}

type Slots = HashMap<u8, Box<CallbackSlot>>;

fn slot_for(slots: &mut Slots, pin: u8) -> &CallbackSlot {
    let slot = slots.entry(pin).or_insert_with(|| {
        Box::new(CallbackSlot {
            pin,
            callback: Mutex::new(None),
        })
    });
    &**slot
}

/// libpigpio, used in-process with its FIFO and socket interfaces off.
#[derive(Default)]
pub struct Pigpio {
    slots: Mutex<Slots>,
}

impl Pigpio {
    /// The process-wide hardware handle; pigpio can be initialised once
    /// per process only.
    pub fn shared() -> Arc<Hardware<Pigpio>> {
        static SHARED: OnceLock<Arc<Hardware<Pigpio>>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Hardware::new(Pigpio::default())))
    }
}

fn check(code: c_int) -> Result<(), c_int> {
    if code < 0 {
        Err(code)
    } else {
        Ok(())
    }
}

impl GpioBackend for Pigpio {
    fn initialise(&self) -> Result<u32, GpioError> {
        unsafe {
            check(gpioCfgInterfaces(PI_DISABLE_FIFO_IF | PI_DISABLE_SOCK_IF))
                .map_err(GpioError::InitFailed)?;
            check(gpioCfgSetInternals(without_signal_handlers(gpioCfgGetInternals())))
                .map_err(GpioError::InitFailed)?;
            let version = gpioInitialise();
            check(version).map_err(GpioError::InitFailed)?;
            Ok(version as u32)
        }
    }

    fn terminate(&self) {
        unsafe { gpioTerminate() };
        // no alert can run past gpioTerminate
        lock(&self.slots).clear();
    }

    fn set_pull(&self, pin: u8, pull: Pull) -> Result<(), GpioError> {
        let pud = match pull {
            Pull::Off => PI_PUD_OFF,
            Pull::Down => PI_PUD_DOWN,
            Pull::Up => PI_PUD_UP,
        };
        check(unsafe { gpioSetPullUpDown(c_uint::from(pin), pud) })
            .map_err(|code| GpioError::BadPull { pin, pull, code })
    }

    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), GpioError> {
        let raw = match mode {
            PinMode::Input => PI_INPUT,
            PinMode::Output => PI_OUTPUT,
        };
        check(unsafe { gpioSetMode(c_uint::from(pin), raw) })
            .map_err(|code| GpioError::BadMode { pin, mode, code })
    }

    fn read_level(&self, pin: u8) -> Result<Level, GpioError> {
        let level = unsafe { gpioRead(c_uint::from(pin)) };
        check(level).map_err(|code| GpioError::Hardware { pin, code })?;
        Ok(Level::from(level != 0))
    }

    fn set_edge_callback(&self, pin: u8, callback: Option<EdgeCallback>) -> Result<(), GpioError> {
        let mut slots = lock(&self.slots);
        let code = match callback {
            Some(callback) => {
                let slot = slot_for(&mut slots, pin);
                let previous = lock(&slot.callback).replace(callback);
                let user = ptr::from_ref::<CallbackSlot>(slot).cast_mut().cast::<c_void>();
                let code = unsafe { gpioSetAlertFuncEx(c_uint::from(pin), Some(on_alert), user) };
                if code < 0 {
                    *lock(&slot.callback) = previous;
                }
                code
            }
            None => {
                let code = unsafe { gpioSetAlertFuncEx(c_uint::from(pin), None, ptr::null_mut()) };
                if code >= 0 {
                    if let Some(slot) = slots.get(&pin) {
                        lock(&slot.callback).take();
                    }
                }
                code
            }
        };
        check(code).map_err(|code| GpioError::Registration { pin, code })
    }
}
