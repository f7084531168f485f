//! Edge-driven I2C state machine.
//!
//! I2C has no length field. Byte boundaries come from the 9-bit cadence
//! (8 data bits and an acknowledge bit sampled on SCL falling edges), and
//! bus conditions are recognised only by SDA moving while SCL is high, never
//! by counting bit positions.
//!
//! [`EdgeDecoder::on_edge`] runs in the hardware notification context. It
//! is amortised O(1), never blocks except for the queue push at STOP and
//! never logs: decode anomalies travel with the transaction and are reported
//! by the consumer.

use core::mem;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::{Anomaly, Frame, FrameError, FrameKind, Transaction};
use crate::gpio::{EdgeEvent, Level, Tick};
use crate::queue::TransactionQueue;

/// Fixed-point fraction bits of the averaged clock period.
const PERIOD_FRACTION_BITS: u32 = 8;
const MICROS_PER_SECOND: u64 = 1_000_000;
/// Frames reserved up front for the transaction in progress. Longer
/// transactions grow the buffer once; the grown capacity is kept.
const PENDING_CAPACITY: usize = 64;

/// Level and last transition ticks of one line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineState {
    pub level: Level,
    pub last_high: Option<Tick>,
    pub last_low: Option<Tick>,
}

impl LineState {
    fn idle(level: Level) -> Self {
        Self {
            level,
            last_high: None,
            last_low: None,
        }
    }

    fn record(&mut self, level: Level, tick: Tick) {
        self.level = level;
        match level {
            Level::High => self.last_high = Some(tick),
            Level::Low => self.last_low = Some(tick),
        }
    }

    /// Tick of the transition into the current level.
    pub fn last_transition(&self) -> Option<Tick> {
        match self.level {
            Level::High => self.last_high,
            Level::Low => self.last_low,
        }
    }
}

/// IIR average of the SCL period: `avg = (avg * 15 + sample) / 16`.
///
/// Kept in 24.8 fixed point so sub-microsecond periods of fast-mode buses
/// do not truncate to zero. The first sample seeds the average.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockEstimate {
    period_fixed: u64,
    samples: u32,
}

impl ClockEstimate {
    pub fn sample(&mut self, period: Tick) {
        let sample = u64::from(period) << PERIOD_FRACTION_BITS;
        self.period_fixed = if self.samples == 0 {
            sample
        } else {
            (self.period_fixed * 15 + sample) / 16
        };
        self.samples = self.samples.saturating_add(1);
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn period_us(&self) -> f64 {
        self.period_fixed as f64 / f64::from(1u32 << PERIOD_FRACTION_BITS)
    }

    /// `1_000_000 / period`, 0 until a period was measured.
    pub fn frequency_hz(&self) -> u32 {
        if self.period_fixed == 0 {
            return 0;
        }
        ((MICROS_PER_SECOND << PERIOD_FRACTION_BITS) / self.period_fixed) as u32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub edges: u64,
    pub frames: u64,
    pub transactions: u64,
    pub anomalies: u64,
    pub clock_hz: u32,
}

/// Decoder counters, updated from the edge callback and readable from any
/// thread without touching the decoder itself. Fields are independent, so a
/// snapshot taken mid-edge may be off by one between counters.
#[derive(Debug, Default)]
pub struct SharedStats {
    edges: AtomicU64,
    frames: AtomicU64,
    transactions: AtomicU64,
    anomalies: AtomicU64,
    clock_hz: AtomicU32,
}

impl SharedStats {
    pub fn snapshot(&self) -> DecoderStats {
        DecoderStats {
            edges: self.edges.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            clock_hz: self.clock_hz.load(Ordering::Relaxed),
        }
    }

    fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Data,
    Clock,
}

/// State machine of one SDA/SCL pair.
///
/// Owns the open frame and the frames of the transaction in progress; it
/// shares only the output queue and its counters.
#[derive(Debug)]
pub struct EdgeDecoder {
    sda_pin: u8,
    scl_pin: u8,
    sda: LineState,
    scl: LineState,
    // delivery order of same-tick edges
    data_after_clock: bool,
    clock: ClockEstimate,
    byte_count: u32,
    open: Option<Frame>,
    pending: Vec<Frame>,
    anomalies: Vec<Anomaly>,
    next_transaction: u32,
    stats: Arc<SharedStats>,
    queue: TransactionQueue,
}

impl EdgeDecoder {
    pub fn new(sda_pin: u8, scl_pin: u8, queue: TransactionQueue) -> Self {
        Self {
            sda_pin,
            scl_pin,
            sda: LineState::idle(Level::High),
            scl: LineState::idle(Level::High),
            data_after_clock: false,
            clock: ClockEstimate::default(),
            byte_count: 0,
            open: None,
            pending: Vec::with_capacity(PENDING_CAPACITY),
            anomalies: Vec::new(),
            next_transaction: 0,
            stats: Arc::default(),
            queue,
        }
    }

    /// Forget all bus state and start over from the given line levels.
    /// Statistics and transaction numbering carry on.
    pub fn reset(&mut self, sda_level: Level, scl_level: Level) {
        self.sda = LineState::idle(sda_level);
        self.scl = LineState::idle(scl_level);
        self.data_after_clock = false;
        self.clock = ClockEstimate::default();
        self.byte_count = 0;
        self.open = None;
        self.pending.clear();
        self.anomalies.clear();
    }

    pub fn sda(&self) -> &LineState {
        &self.sda
    }

    pub fn scl(&self) -> &LineState {
        &self.scl
    }

    pub fn clock(&self) -> &ClockEstimate {
        &self.clock
    }

    /// Frames completed since the last START/STOP boundary. Reset by STOP only.
    pub fn byte_count(&self) -> u32 {
        self.byte_count
    }

    pub fn open_frame(&self) -> Option<&Frame> {
        self.open.as_ref()
    }

    pub fn pending(&self) -> &[Frame] {
        &self.pending
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats.snapshot()
    }

    /// Handle on the counters that stays readable while the decoder is busy.
    pub fn shared_stats(&self) -> Arc<SharedStats> {
        Arc::clone(&self.stats)
    }

    pub fn handle(&mut self, event: EdgeEvent) {
        self.on_edge(event.pin, event.level, event.tick);
    }

    /// Process one transition. Edges of pins other than SDA/SCL are ignored.
    pub fn on_edge(&mut self, pin: u8, level: Level, tick: Tick) {
        let line = if pin == self.scl_pin {
            Line::Clock
        } else if pin == self.sda_pin {
            Line::Data
        } else {
            return;
        };
        SharedStats::count(&self.stats.edges);

        let mut frame = self
            .open
            .take()
            .unwrap_or_else(|| Frame::new(self.next_sequence(), tick));

        match (line, level) {
            (Line::Clock, Level::High) => {
                if let Some(previous) = self.scl.last_high {
                    self.clock.sample(tick.wrapping_sub(previous));
                    self.stats
                        .clock_hz
                        .store(self.clock.frequency_hz(), Ordering::Relaxed);
                }
                if let Some(kind) = self.classify_next() {
                    frame.set_kind(kind);
                }
                self.scl.record(Level::High, tick);
                self.data_after_clock = false;
            }
            (Line::Clock, Level::Low) => {
                // SDA moving while SCL was high is a condition, already handled
                if !self.data_moved_since_clock_edge(tick) {
                    if let Err(FrameError::BitOverflow { sequence }) = frame.set_bit(self.sda.level) {
                        self.note(Anomaly::BitOverflow { sequence });
                    }
                }
                self.scl.record(Level::Low, tick);
                self.data_after_clock = false;
            }
            (Line::Data, level) => {
                if self.scl.level.is_high() {
                    let kind = match level {
                        Level::High => FrameKind::Stop,
                        Level::Low if self.byte_count == 0 => FrameKind::Start,
                        Level::Low => FrameKind::RepeatedStart,
                    };
                    frame = self.begin_condition(frame, kind, tick);
                }
                self.sda.record(level, tick);
                self.data_after_clock = true;
            }
        }

        if frame.is_complete() {
            self.complete(frame);
        } else {
            self.open = Some(frame);
        }
    }

    /// Publish whatever is in progress as an interrupted transaction.
    pub fn flush(&mut self) {
        if let Some(frame) = self.open.take() {
            if frame.bit_count() > 0 {
                self.keep_partial(frame);
            }
        }
        if !self.pending.is_empty() {
            self.note(Anomaly::Interrupted);
            self.publish();
        }
        self.byte_count = 0;
    }

    fn next_sequence(&self) -> u32 {
        self.pending.len() as u32
    }

    /// Kind of the byte about to be clocked in, from what precedes it.
    fn classify_next(&self) -> Option<FrameKind> {
        match self.pending.last() {
            Some(previous) if matches!(previous.kind(), FrameKind::Start | FrameKind::RepeatedStart) => {
                Some(FrameKind::Address)
            }
            Some(previous) if self.byte_count == 2 && previous.is_ten_bit_header() => {
                Some(FrameKind::Address2)
            }
            _ if self.byte_count > 1 => Some(FrameKind::Data),
            _ => None,
        }
    }

    /// Did SDA change after the most recent SCL edge?
    ///
    /// Timing-fragile: relies on the notification order and tick stamps of
    /// near-simultaneous edges.
    fn data_moved_since_clock_edge(&self, tick: Tick) -> bool {
        match (self.sda.last_transition(), self.scl.last_transition()) {
            (Some(data), Some(clock)) => {
                let data_age = tick.wrapping_sub(data);
                let clock_age = tick.wrapping_sub(clock);
                data_age < clock_age || (data_age == clock_age && self.data_after_clock)
            }
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Turn the open frame into a bus condition. A byte cut short by the
    /// condition is kept as its own frame.
    fn begin_condition(&mut self, frame: Frame, kind: FrameKind, tick: Tick) -> Frame {
        if frame.bit_count() > 0 {
            self.keep_partial(frame);
            Frame::with_kind(kind, self.next_sequence(), tick)
        } else {
            Frame::with_kind(kind, frame.sequence(), tick)
        }
    }

    fn keep_partial(&mut self, frame: Frame) {
        self.note(Anomaly::IncompleteFrame {
            sequence: frame.sequence(),
            bits: frame.bit_count(),
        });
        self.push_pending(frame);
    }

    fn complete(&mut self, frame: Frame) {
        let stop = frame.kind() == FrameKind::Stop;
        self.push_pending(frame);
        if stop {
            self.byte_count = 0;
            self.publish();
        } else {
            self.byte_count = self.byte_count.saturating_add(1);
        }
    }

    fn push_pending(&mut self, frame: Frame) {
        self.pending.push(frame);
        SharedStats::count(&self.stats.frames);
    }

    fn note(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
        SharedStats::count(&self.stats.anomalies);
    }

    fn publish(&mut self) {
        if self.pending.is_empty() && self.anomalies.is_empty() {
            return;
        }
        // copied out at its exact length; the pending buffer keeps its capacity
        let transaction = Transaction {
            number: self.next_transaction,
            frames: self.pending.drain(..).collect(),
            anomalies: mem::take(&mut self.anomalies),
            clock_hz: self.clock.frequency_hz(),
        };
        self.next_transaction = self.next_transaction.wrapping_add(1);
        SharedStats::count(&self.stats.transactions);
        self.queue.push(transaction);
    }
}
