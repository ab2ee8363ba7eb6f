//! A BLE 4.2 Central-role host stack for raw 2.4 GHz packet radios.
//!
//! Hoplink drives transceivers that expose nothing but the BLE physical
//! layer - GFSK modulation, access-address matching, CRC-24 and data
//! whitening - and builds the Master side of a Link-Layer connection on top:
//! scanning, initiation, channel hopping, the sequence-number ARQ, L2CAP
//! framing on the ATT fixed channel, and an ATT/GATT client good enough to
//! push text to a Nordic-UART-style or Xiaomi-style peripheral.
//!
//! # Using the stack
//!
//! Hoplink is runtime and hardware-agnostic. The hardware interface consists
//! of two traits that have to be implemented once per platform:
//! * A microsecond-precision [`time::Timer`].
//! * A [`radio::Radio`] mapping the abstract PHY capability (frequency, sync
//!   word, CRC seed, whitening seed, TX/RX, IRQ status) onto the transceiver.
//!
//! The [`link::LinkLayer`] owns the radio and is the scheduling authority;
//! everything above it ([`l2cap`], [`att`], [`gatt`], [`app`]) borrows the
//! link downward for the duration of a call and never retains it.
//!
//! Only the Central (Master) role is implemented. Peripheral-role state
//! transitions are rejected at the API boundary.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod utils;
pub mod app;
pub mod att;
pub mod bytes;
pub mod config;
pub mod crc;
mod error;
pub mod gatt;
pub mod l2cap;
pub mod link;
pub mod phy;
pub mod radio;
pub mod time;
pub mod uuid;

pub use self::error::Error;

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth specification implemented by this stack.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V4_2;
