//! One sniffed bus: two GPIO lines, the decoder behind their callbacks and
//! the consumer thread that reports decoded transactions.
//!
//! The edge callbacks only feed the decoder. Everything that can block
//! (logging, serialisation, subscribers) happens on the consumer thread,
//! which picks completed transactions up from the [`TransactionQueue`].

use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::config::{OutputFormat, SnifferConfig, START_CONFIRM_TIMEOUT};
use crate::decoder::{DecoderStats, EdgeDecoder, SharedStats};
use crate::frame::{Frame, Transaction};
use crate::gpio::{GpioBackend, GpioError, GpioLine, Hardware, Level, PinMode, Pull};
use crate::logging::{SnifferLog, Verbosity};
use crate::queue::{lock, TransactionQueue};

// pin id of a line that failed validation; never seen on a callback
const NO_PIN: u8 = u8::MAX;

#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("{name}: unusable pins SDA GPIO{sda}, SCL GPIO{scl}")]
    InvalidPins { name: String, sda: u32, scl: u32 },
    #[error("{0}: GPIO hardware not available")]
    NotReady(String),
    #[error("{name}: cannot prepare {line}: {source}")]
    Prepare {
        name: String,
        line: &'static str,
        #[source]
        source: GpioError,
    },
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error("cannot spawn consumer thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("consumer thread did not start within {0:?}")]
    ConsumerStart(Duration),
}

/// Receiver of decoded transactions, called on the consumer thread after
/// the transaction was logged.
pub trait TransactionSink: Send {
    fn deliver(&mut self, sniffer: &str, transaction: &Transaction);
}

impl TransactionSink for mpsc::Sender<Transaction> {
    fn deliver(&mut self, _sniffer: &str, transaction: &Transaction) {
        // a dropped receiver just unsubscribes
        let _ = self.send(transaction.clone());
    }
}

type Sinks = Arc<Mutex<Vec<Box<dyn TransactionSink>>>>;

#[derive(Serialize)]
struct FrameRecord<'a> {
    sniffer: &'a str,
    transaction: u32,
    frame: &'a Frame,
}

struct Consumer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Consumer {
    fn halt(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            warn!("consumer thread panicked");
        }
    }
}

struct ConsumerLoop {
    queue: TransactionQueue,
    sinks: Sinks,
    log: SnifferLog,
    format: OutputFormat,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl ConsumerLoop {
    fn run(self) {
        let mut local = VecDeque::new();
        loop {
            // read before draining so a final drain follows the stop request
            let stopping = self.stop.load(Ordering::Acquire);
            self.queue.drain_into(&mut local);
            if local.is_empty() {
                if stopping {
                    break;
                }
                thread::sleep(self.poll_interval);
                continue;
            }
            while let Some(transaction) = local.pop_front() {
                self.report(&transaction);
            }
        }
    }

    fn report(&self, transaction: &Transaction) {
        let number = transaction.number();
        for anomaly in transaction.anomalies() {
            self.log
                .log(Verbosity::ERROR, format_args!("transaction {}: {}", number, anomaly));
        }

        if self.log.enabled(Verbosity::DATA) {
            for frame in transaction.frames() {
                self.report_frame(number, frame);
            }
        }

        if self.log.enabled(Verbosity::ANALYSIS) {
            let frames = transaction.frames().len();
            match (transaction.target_address(), transaction.direction()) {
                (Some(target), Some(direction)) => self.log.log(
                    Verbosity::ANALYSIS,
                    format_args!(
                        "transaction {}: {} {} with {} frames, SCL {} Hz",
                        number,
                        direction,
                        target,
                        frames,
                        transaction.clock_hz()
                    ),
                ),
                _ => self.log.log(
                    Verbosity::ANALYSIS,
                    format_args!(
                        "transaction {}: {} frames without address, SCL {} Hz",
                        number,
                        frames,
                        transaction.clock_hz()
                    ),
                ),
            }
        }

        for sink in lock(&self.sinks).iter_mut() {
            sink.deliver(self.log.name(), transaction);
        }
    }

    fn report_frame(&self, number: u32, frame: &Frame) {
        match self.format {
            OutputFormat::Text => self.log.log(
                Verbosity::DATA,
                format_args!("#{}.{} {}", number, frame.sequence(), frame),
            ),
            OutputFormat::Json => {
                let record = FrameRecord {
                    sniffer: self.log.name(),
                    transaction: number,
                    frame,
                };
                match serde_json::to_string(&record) {
                    Ok(line) => self.log.log(Verbosity::DATA, format_args!("{}", line)),
                    Err(error) => self.log.log(
                        Verbosity::ERROR,
                        format_args!("frame {}.{} not serialised: {}", number, frame.sequence(), error),
                    ),
                }
            }
        }
    }
}

/// Passive decoder of one I2C bus.
pub struct BusSniffer<B: GpioBackend + 'static> {
    config: SnifferConfig,
    log: SnifferLog,
    data: GpioLine<B>,
    clock: GpioLine<B>,
    decoder: Arc<Mutex<EdgeDecoder>>,
    stats: Arc<SharedStats>,
    queue: TransactionQueue,
    sinks: Sinks,
    consumer: Option<Consumer>,
    registration_failed: bool,
}

impl<B: GpioBackend + 'static> BusSniffer<B> {
    /// Claims both pins. Never fails; check [`is_valid`](Self::is_valid)
    /// and [`is_good`](Self::is_good) before starting.
    pub fn new(hardware: &Arc<Hardware<B>>, config: SnifferConfig) -> Self {
        let data = GpioLine::new(hardware, config.sda);
        let clock = GpioLine::new(hardware, config.scl);
        let queue = TransactionQueue::new();
        let decoder = EdgeDecoder::new(
            data.pin().unwrap_or(NO_PIN),
            clock.pin().unwrap_or(NO_PIN),
            queue.clone(),
        );
        let stats = decoder.shared_stats();
        let log = SnifferLog::new(&config.name, config.verbosity);

        Self {
            config,
            log,
            data,
            clock,
            decoder: Arc::new(Mutex::new(decoder)),
            stats,
            queue,
            sinks: Arc::new(Mutex::new(Vec::new())),
            consumer: None,
            registration_failed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SnifferConfig {
        &self.config
    }

    /// Both pins usable and distinct.
    pub fn is_valid(&self) -> bool {
        self.data.is_valid() && self.clock.is_valid() && self.config.sda != self.config.scl
    }

    /// Valid, hardware initialised and not wrecked by a failed start.
    pub fn is_good(&self) -> bool {
        self.is_valid() && self.data.is_good() && self.clock.is_good() && !self.registration_failed
    }

    pub fn is_running(&self) -> bool {
        self.consumer.is_some()
    }

    /// Completed transactions not yet picked up by the consumer thread.
    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }

    /// Decoder counters. Never waits for the edge callbacks.
    pub fn stats(&self) -> DecoderStats {
        self.stats.snapshot()
    }

    /// Both lines as floating inputs: no pull, no drive.
    pub fn prepare(&mut self) -> Result<(), SnifferError> {
        if !self.is_valid() {
            return Err(self.invalid_pins());
        }
        let name = &self.config.name;
        for (line, gpio) in [("SDA", &mut self.data), ("SCL", &mut self.clock)] {
            gpio.configure(Pull::Off, PinMode::Input)
                .map_err(|source| SnifferError::Prepare {
                    name: name.clone(),
                    line,
                    source,
                })?;
            self.log.log(
                Verbosity::GPIO,
                format_args!("{} GPIO{} input, pull off", line, gpio.requested_pin()),
            );
        }
        Ok(())
    }

    pub fn subscribe<S: TransactionSink + 'static>(&self, sink: S) {
        lock(&self.sinks).push(Box::new(sink));
    }

    /// Channel receiving a copy of every decoded transaction.
    pub fn subscribe_channel(&self) -> mpsc::Receiver<Transaction> {
        let (sender, receiver) = mpsc::channel();
        self.subscribe(sender);
        receiver
    }

    /// Start decoding. Does nothing when already running.
    ///
    /// The decoder is reset and the consumer confirmed running before the
    /// edge callbacks go in, so no edge sees half-initialised state.
    pub fn start(&mut self) -> Result<(), SnifferError> {
        if self.is_running() {
            return Ok(());
        }
        if !self.is_valid() {
            return Err(self.invalid_pins());
        }
        if !self.is_good() {
            return Err(SnifferError::NotReady(self.config.name.clone()));
        }

        let sda_level = self.data.read_level().unwrap_or(Level::High);
        let scl_level = self.clock.read_level().unwrap_or(Level::High);
        lock(&self.decoder).reset(sda_level, scl_level);

        let consumer = self.spawn_consumer()?;
        if let Err(error) = self.attach() {
            self.detach();
            consumer.halt();
            self.registration_failed = true;
            self.log
                .log(Verbosity::ERROR, format_args!("cannot start: {}", error));
            return Err(error.into());
        }
        self.consumer = Some(consumer);

        self.log.log(
            Verbosity::START_STOP,
            format_args!(
                "started on SDA GPIO{} ({:?}) SCL GPIO{} ({:?})",
                self.config.sda, sda_level, self.config.scl, scl_level
            ),
        );
        Ok(())
    }

    /// Stop decoding. Safe to call repeatedly. A transaction still open is
    /// published marked as interrupted before the consumer drains out.
    pub fn stop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        self.detach();
        lock(&self.decoder).flush();
        consumer.halt();
        let stats = self.stats();

        self.log.log(
            Verbosity::START_STOP,
            format_args!(
                "stopped: {} transactions, {} frames, {} anomalies, {} edges",
                stats.transactions, stats.frames, stats.anomalies, stats.edges
            ),
        );
    }

    fn invalid_pins(&self) -> SnifferError {
        SnifferError::InvalidPins {
            name: self.config.name.clone(),
            sda: self.config.sda,
            scl: self.config.scl,
        }
    }

    fn spawn_consumer(&self) -> Result<Consumer, SnifferError> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = ConsumerLoop {
            queue: self.queue.clone(),
            sinks: Arc::clone(&self.sinks),
            log: self.log.clone(),
            format: self.config.format,
            poll_interval: self.config.poll_interval,
            stop: Arc::clone(&stop),
        };
        let (ready, confirmed) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("{}-consumer", self.config.name))
            .spawn(move || {
                let _ = ready.send(());
                worker.run();
            })
            .map_err(SnifferError::Spawn)?;

        let consumer = Consumer { stop, handle };
        match confirmed.recv_timeout(START_CONFIRM_TIMEOUT) {
            Ok(()) => Ok(consumer),
            Err(_) => {
                consumer.halt();
                Err(SnifferError::ConsumerStart(START_CONFIRM_TIMEOUT))
            }
        }
    }

    fn attach(&mut self) -> Result<(), GpioError> {
        for line in [&mut self.data, &mut self.clock] {
            let decoder = Arc::clone(&self.decoder);
            line.register_edge_callback(move |event| lock(&decoder).handle(event))?;
        }
        Ok(())
    }

    fn detach(&mut self) {
        for line in [&mut self.data, &mut self.clock] {
            if let Err(error) = line.unregister_edge_callback() {
                self.log.log(
                    Verbosity::WARNING,
                    format_args!("GPIO{}: {}", line.requested_pin(), error),
                );
            }
        }
    }
}

impl<B: GpioBackend + 'static> Drop for BusSniffer<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
