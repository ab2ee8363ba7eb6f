//! The transceiver-facing driver contract.
//!
//! The Link-Layer consumes an abstract radio capability: a 2.4 GHz
//! transceiver that can be programmed for BLE framing (GFSK at 1 Mbps,
//! access-address sync word, CRC-24, data whitening) and moves one PDU at a
//! time through an on-chip packet buffer. SX1280-class parts map onto this
//! trait directly; the mapping for other transceivers is the platform
//! integrator's job.
//!
//! All methods are blocking. Implementations must bound every internal wait
//! on the chip's busy signal by [`BUSY_TIMEOUT`] and fail with
//! [`RadioError::Hal`] when it expires, so no call can stall the event loop
//! indefinitely.
//!
//! Radio errors are their own domain. They are lifted into Link-Layer
//! errors at the LL engine boundary and nowhere else.

use crate::time::Duration;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

/// Upper bound on any single wait for the transceiver's busy signal.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors reported by radio drivers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The underlying bus or chip failed (SPI error, busy signal stuck).
    Hal,

    /// The radio is occupied with a conflicting operation.
    Busy,

    /// A bounded wait elapsed without the expected chip response.
    Timeout,
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RadioError::Hal => "radio HAL failure",
            RadioError::Busy => "radio busy",
            RadioError::Timeout => "radio timeout",
        })
    }
}

bitflags! {
    /// Packed radio IRQ status word.
    ///
    /// Drivers translate their chip's native IRQ register into this set.
    pub struct Irq: u16 {
        /// Packet transmission finished.
        const TX_DONE = 1 << 0;
        /// Packet reception finished with a valid CRC.
        const RX_DONE = 1 << 1;
        /// Sync word (access address) was detected.
        const SYNC_VALID = 1 << 2;
        /// A packet was received but its CRC check failed.
        const CRC_ERROR = 1 << 3;
        /// The RX window elapsed without a sync match.
        const RX_TIMEOUT = 1 << 4;
    }
}

/// PDU direction role used when programming BLE packet parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BleRole {
    /// Receiving advertising channel traffic.
    Scanner,
    /// Master side of a data channel connection.
    Master,
}

/// Abstract capability the Link-Layer consumes to drive the PHY.
///
/// The configuration methods mirror the command set of packet radios in the
/// SX1280 family:
///
/// * [`configure_ble`](Radio::configure_ble) selects the BLE packet type
///   and programs modulation (1 Mbps GFSK, BT = 0.5, modulation index 0.5)
///   and packet parameters (3-byte CRC, whitening enabled, role per
///   [`BleRole`]).
/// * [`set_sync_word`](Radio::set_sync_word) programs the 4-byte sync word.
///   BLE transmits the access address little-endian, so callers pass the
///   byte-reversed AA.
/// * [`set_crc_init`](Radio::set_crc_init) and
///   [`set_whitening_seed`](Radio::set_whitening_seed) seed the hardware
///   CRC-24 and whitening LFSRs.
/// * [`write_buffer`](Radio::write_buffer) and
///   [`read_buffer`](Radio::read_buffer) access the packet buffer by byte
///   offset; [`rx_buffer_status`](Radio::rx_buffer_status) reports the
///   length and offset of the last received packet.
/// * [`set_standby`](Radio::set_standby), [`set_tx`](Radio::set_tx) and
///   [`set_rx`](Radio::set_rx) switch operating modes. RX optionally
///   self-terminates after a timeout, reported as [`Irq::RX_TIMEOUT`].
/// * [`irq_status`](Radio::irq_status) and [`clear_irq`](Radio::clear_irq)
///   expose the packed IRQ word.
pub trait Radio {
    /// Puts the transceiver into BLE mode for the given role.
    ///
    /// Programs packet type, modulation parameters (1 Mbps GFSK, BT = 0.5,
    /// modulation index 0.5) and packet parameters (standard packet format,
    /// 3-byte CRC, whitening enabled).
    fn configure_ble(&mut self, role: BleRole) -> Result<(), RadioError>;

    /// Tunes the synthesizer to `freq_hz`.
    fn set_frequency(&mut self, freq_hz: u32) -> Result<(), RadioError>;

    /// Programs the 4-byte sync word the receiver matches on.
    fn set_sync_word(&mut self, sync: [u8; 4]) -> Result<(), RadioError>;

    /// Seeds the hardware CRC-24 with the 24-bit initialization value.
    fn set_crc_init(&mut self, init: u32) -> Result<(), RadioError>;

    /// Seeds the data-whitening LFSR with the 7-bit channel seed.
    fn set_whitening_seed(&mut self, seed: u8) -> Result<(), RadioError>;

    /// Copies `data` into the packet buffer starting at `offset`.
    fn write_buffer(&mut self, offset: u8, data: &[u8]) -> Result<(), RadioError>;

    /// Copies packet buffer contents starting at `offset` into `buf`.
    fn read_buffer(&mut self, offset: u8, buf: &mut [u8]) -> Result<(), RadioError>;

    /// Returns `(length, buffer_offset)` of the most recently received
    /// packet.
    fn rx_buffer_status(&mut self) -> Result<(u8, u8), RadioError>;

    /// Enters standby, aborting any TX or RX in progress.
    fn set_standby(&mut self) -> Result<(), RadioError>;

    /// Starts transmitting the packet present in the buffer.
    ///
    /// Completion is reported via [`Irq::TX_DONE`].
    fn set_tx(&mut self) -> Result<(), RadioError>;

    /// Starts listening.
    ///
    /// With a timeout, reception self-terminates and raises
    /// [`Irq::RX_TIMEOUT`] if no packet arrives in time; `None` listens
    /// until told otherwise.
    fn set_rx(&mut self, timeout: Option<Duration>) -> Result<(), RadioError>;

    /// Reads the packed IRQ status word.
    fn irq_status(&mut self) -> Result<Irq, RadioError>;

    /// Clears the IRQ bits set in `mask`.
    fn clear_irq(&mut self, mask: Irq) -> Result<(), RadioError>;

    /// Returns the RSSI of the last received packet, in dBm.
    fn last_rssi(&mut self) -> Result<i8, RadioError>;
}

/// One-slot mailbox between the radio ISR and the foreground event loop.
///
/// The interrupt top-half does nothing but snapshot the IRQ status word into
/// this latch; every protocol decision happens in the foreground. Both sides
/// use single atomic loads and stores, keeping interrupts-masked windows
/// well under the 10 µs budget.
pub struct IrqLatch {
    fired: AtomicBool,
    status: AtomicU16,
}

impl IrqLatch {
    /// Creates an empty latch.
    pub const fn new() -> Self {
        IrqLatch {
            fired: AtomicBool::new(false),
            status: AtomicU16::new(0),
        }
    }

    /// Records an IRQ from the interrupt handler.
    ///
    /// Statuses accumulate (OR) until the foreground drains the latch.
    pub fn set_from_isr(&self, status: Irq) {
        self.status.fetch_or(status.bits(), Ordering::Release);
        self.fired.store(true, Ordering::Release);
    }

    /// Takes the latched status, if any. Foreground only.
    pub fn take(&self) -> Option<Irq> {
        if self.fired.swap(false, Ordering::Acquire) {
            let bits = self.status.swap(0, Ordering::Acquire);
            Some(Irq::from_bits_truncate(bits))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_accumulates_until_taken() {
        let latch = IrqLatch::new();
        assert_eq!(latch.take(), None);

        latch.set_from_isr(Irq::TX_DONE);
        latch.set_from_isr(Irq::RX_DONE);
        assert_eq!(latch.take(), Some(Irq::TX_DONE | Irq::RX_DONE));
        assert_eq!(latch.take(), None);
    }
}
