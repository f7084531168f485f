//! # I2C Bus Sniffer
//!
//! Passive decoding of I2C traffic from two GPIO inputs on a Raspberry Pi.
//! The sniffer never drives the bus: it watches every SDA and SCL edge and
//! rebuilds bus conditions, addresses, data bytes and acknowledges from the
//! edge sequence alone.
//!
//! ## Features
//!
//! - **Edge-driven decoding**: START, STOP, REPEATED-START, 7- and 10-bit
//!   addresses, data bytes with ACK/NACK
//! - **Non-blocking callback path**: edges are decoded in place, completed
//!   transactions are handed to a consumer thread through one mutex
//! - **Clock estimate**: running average of the SCL period
//! - **Several buses at once**: one [`BusSniffer`] per SDA/SCL pair
//! - **Whole transactions**: every frame and every anomaly between two
//!   STOP conditions is delivered together, however long the transfer
//!
//! ## Quick Start
//!
//! ```rust
//! use i2c_sniffer::gpio::simulated::{BusScript, SimulatedBackend};
//! use i2c_sniffer::gpio::Hardware;
//! use i2c_sniffer::{BusSniffer, FrameKind, SnifferConfig};
//!
//! let hardware = Hardware::new(SimulatedBackend::new());
//! let mut sniffer = BusSniffer::new(&hardware, SnifferConfig::new("bus", 2, 3));
//! let transactions = sniffer.subscribe_channel();
//!
//! sniffer.prepare().unwrap();
//! sniffer.start().unwrap();
//! hardware
//!     .backend()
//!     .replay(BusScript::new(2, 3, 5).write(0x50, &[0xAB]).events());
//! sniffer.stop();
//!
//! let transaction = transactions.recv().unwrap();
//! assert_eq!(transaction.frames()[1].kind(), FrameKind::Address);
//! ```
//!
//! ## Architecture
//!
//! - [`gpio`] - Backend seam, pin table, reference-counted hardware, lines
//! - [`frame`] - Frames, anomalies and transactions
//! - [`decoder`] - The edge state machine
//! - [`queue`] - Hand-off between callback and consumer
//! - [`sniffer`] - Lifecycle of one sniffed bus
//! - [`config`] - Pin pairs and sniffer settings
//! - [`logging`] - Verbosity scale and log output

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod decoder;
pub mod frame;
pub mod gpio;
pub mod logging;
pub mod queue;
pub mod sniffer;

pub use config::{OutputFormat, PinPair, SnifferConfig};
pub use decoder::{DecoderStats, EdgeDecoder};
pub use frame::{Anomaly, Direction, Frame, FrameKind, TargetAddress, Transaction};
pub use logging::Verbosity;
pub use queue::TransactionQueue;
pub use sniffer::{BusSniffer, SnifferError, TransactionSink};
