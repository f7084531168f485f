//! Decoded bus elements.
//!
//! A [`Frame`] is one protocol element: a bus condition (START, STOP,
//! REPEATED-START) or a byte with its acknowledge bit. Which kind of byte a
//! frame holds is decided by the decoder from its position in the
//! transaction; the frame itself only accumulates bits.

use core::fmt;
use serde::Serialize;
use thiserror::Error;

use crate::gpio::{Level, Tick};

/// 8 data bits plus the acknowledge bit.
pub const FRAME_BITS: u8 = 9;

/// First-byte pattern announcing a 10-bit address.
const TEN_BIT_HEADER: u8 = 0b11110;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame {sequence} already holds {FRAME_BITS} bits")]
    BitOverflow { sequence: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameKind {
    Empty,
    Start,
    Stop,
    RepeatedStart,
    Address,
    Address2,
    Data,
}

impl FrameKind {
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Start | FrameKind::Stop | FrameKind::RepeatedStart)
    }

    pub fn carries_byte(self) -> bool {
        matches!(self, FrameKind::Address | FrameKind::Address2 | FrameKind::Data)
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Empty => "EMPTY",
            FrameKind::Start => "START",
            FrameKind::Stop => "STOP",
            FrameKind::RepeatedStart => "REPEATED-START",
            FrameKind::Address => "ADDRESS",
            FrameKind::Address2 => "ADDRESS2",
            FrameKind::Data => "DATA",
        }
    }
}

/// R/W bit of an address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Write,
    Read,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Write => "WRITE",
            Direction::Read => "READ",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Frame {
    kind: FrameKind,
    sequence: u32,
    bits: u8,
    value: u8,
    acknowledged: bool,
    tick: Tick,
}

impl Frame {
    pub fn new(sequence: u32, tick: Tick) -> Self {
        Self::with_kind(FrameKind::Empty, sequence, tick)
    }

    pub fn with_kind(kind: FrameKind, sequence: u32, tick: Tick) -> Self {
        Self {
            kind,
            sequence,
            bits: 0,
            value: 0,
            acknowledged: false,
            tick,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FrameKind) {
        self.kind = kind;
    }

    /// Position within the transaction.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn bit_count(&self) -> u8 {
        self.bits
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Tick of the edge that opened the frame.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// `Some(true)` for ACK, `Some(false)` for NACK, `None` before the ninth bit.
    pub fn ack(&self) -> Option<bool> {
        (self.bits == FRAME_BITS).then_some(self.acknowledged)
    }

    /// Shift in the next bit. Bits 1-8 build the value MSB first, bit 9 is
    /// the acknowledge bit (low = ACK).
    pub fn set_bit(&mut self, bit: Level) -> Result<(), FrameError> {
        match self.bits {
            0..=7 => self.value = self.value << 1 | bit.as_bit(),
            8 => self.acknowledged = !bit.is_high(),
            _ => return Err(FrameError::BitOverflow { sequence: self.sequence }),
        }
        self.bits += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.kind.is_control() || (self.kind.carries_byte() && self.bits == FRAME_BITS)
    }

    /// 7-bit address of an Address frame.
    pub fn address(&self) -> Option<u8> {
        (self.kind == FrameKind::Address).then_some(self.value >> 1)
    }

    pub fn direction(&self) -> Option<Direction> {
        (self.kind == FrameKind::Address).then_some(if self.value & 1 == 0 {
            Direction::Write
        } else {
            Direction::Read
        })
    }

    /// Address byte of the form `11110xxx`: the next byte is Address2.
    pub fn is_ten_bit_header(&self) -> bool {
        self.kind == FrameKind::Address && self.bits >= 8 && self.value >> 3 == TEN_BIT_HEADER
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_control() {
            return f.write_str(self.kind.name());
        }

        if self.bits < 8 {
            return write!(
                f,
                "{} 0x{:02X} ({}/{} bits)",
                self.kind.name(),
                self.value,
                self.bits,
                FRAME_BITS
            );
        }

        match (self.address(), self.direction()) {
            (Some(address), Some(direction)) => {
                write!(f, "{} 0x{:02X} {}", self.kind.name(), address, direction)?;
            }
            _ => write!(f, "{} 0x{:02X}", self.kind.name(), self.value)?,
        }

        match self.ack() {
            Some(true) => f.write_str(" ACK"),
            Some(false) => f.write_str(" NACK"),
            None => write!(f, " ({}/{} bits)", self.bits, FRAME_BITS),
        }
    }
}

/// Decode problems carried alongside the transaction they occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Anomaly {
    /// More than nine bits clocked into one frame.
    BitOverflow { sequence: u32 },
    /// A bus condition interrupted a byte; the partial frame was kept.
    IncompleteFrame { sequence: u32, bits: u8 },
    /// Decoding stopped before the STOP condition.
    Interrupted,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::BitOverflow { sequence } => {
                write!(f, "bit overflow in frame {} (more than {} bits)", sequence, FRAME_BITS)
            }
            Anomaly::IncompleteFrame { sequence, bits } => {
                write!(f, "frame {} incomplete ({} of {} bits)", sequence, bits, FRAME_BITS)
            }
            Anomaly::Interrupted => f.write_str("transaction interrupted before STOP"),
        }
    }
}

/// Target of a transaction, resolved from its address frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetAddress {
    SevenBit(u8),
    TenBit(u16),
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddress::SevenBit(address) => write!(f, "0x{:02X}", address),
            TargetAddress::TenBit(address) => write!(f, "0x{:03X} (10-bit)", address),
        }
    }
}

/// Frames between two STOP conditions, in bus order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transaction {
    pub(crate) number: u32,
    pub(crate) frames: Vec<Frame>,
    pub(crate) anomalies: Vec<Anomaly>,
    pub(crate) clock_hz: u32,
}

impl Transaction {
    /// Running number assigned by the decoder.
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn kinds(&self) -> impl Iterator<Item = FrameKind> + '_ {
        self.frames.iter().map(Frame::kind)
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// SCL frequency estimate when the transaction was published.
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Ends with a STOP frame.
    pub fn is_complete(&self) -> bool {
        self.frames.last().map(Frame::kind) == Some(FrameKind::Stop)
    }

    pub fn target_address(&self) -> Option<TargetAddress> {
        let index = self.frames.iter().position(|frame| frame.kind() == FrameKind::Address)?;
        let header = &self.frames[index];
        if header.is_ten_bit_header() {
            if let Some(low) = self
                .frames
                .get(index + 1)
                .filter(|frame| frame.kind() == FrameKind::Address2 && frame.bit_count() >= 8)
            {
                let high = u16::from(header.value() >> 1 & 0b11);
                return Some(TargetAddress::TenBit(high << 8 | u16::from(low.value())));
            }
        }
        header.address().map(TargetAddress::SevenBit)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.frames.iter().find_map(Frame::direction)
    }
}
