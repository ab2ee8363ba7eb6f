//! Physical layer interactions.
//!
//! BLE occupies 40 RF channels spaced 2 MHz apart starting at 2402 MHz.
//! The Link-Layer reorders them into "channel indices": 0..=36 are data
//! channels, 37..=39 the advertising channels, which sit at 2402, 2426 and
//! 2480 MHz so that they interleave with the data channels. Only channel
//! indices appear in this crate's APIs; the conversion to RF frequency
//! happens here, right before the radio is programmed.

use core::fmt;

/// Returns the center frequency in Hz corresponding to an RF channel.
fn rf_channel_freq_hz(rf_channel: u8) -> u32 {
    2_402_000_000 + u32::from(rf_channel) * 2_000_000
}

/// Returns the data whitening IV for a channel index (not an RF channel).
///
/// The whitening LFSR (polynomial `x^7 + x^4 + 1`) is seeded with the 7-bit
/// value `0b100_0000 | channel_index`.
fn whitening_iv(channel_idx: u8) -> u8 {
    debug_assert!(channel_idx <= 39);
    0b0100_0000 | channel_idx
}

/// One of the three advertising channels (channel indices 37, 38 or 39).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdvertisingChannel(u8);

impl AdvertisingChannel {
    /// Returns the first (lowest-numbered) advertising channel, index 37.
    pub fn first() -> Self {
        AdvertisingChannel(37)
    }

    /// Returns the next advertising channel, wrapping from 39 back to 37.
    pub fn cycle(&self) -> Self {
        if self.0 == 39 {
            AdvertisingChannel(37)
        } else {
            AdvertisingChannel(self.0 + 1)
        }
    }

    /// Returns the channel index (37, 38 or 39).
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Returns the RF channel carrying this advertising channel.
    ///
    /// RF channels 0, 12 and 39 are reserved for advertising.
    pub fn rf_channel(&self) -> u8 {
        match self.0 {
            37 => 0,
            38 => 12,
            39 => 39,
            _ => unreachable!(),
        }
    }

    /// Returns the center frequency of this channel in Hz.
    pub fn freq_hz(&self) -> u32 {
        rf_channel_freq_hz(self.rf_channel())
    }

    /// Returns the data-whitening LFSR seed for this channel.
    pub fn whitening_iv(&self) -> u8 {
        whitening_iv(self.0)
    }
}

/// One of 37 data channels on which data channel PDUs are exchanged between
/// connected devices (channel indices 0..=36).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DataChannel(u8);

impl DataChannel {
    /// Creates a `DataChannel` from a raw channel index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not in range 0..=36.
    pub fn new(index: u8) -> Self {
        assert!(index <= 36);
        DataChannel(index)
    }

    /// Returns the data channel index, in range 0..=36.
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Returns the RF channel corresponding to this data channel index.
    ///
    /// RF channels 1..=11 and 13..=38 carry data.
    pub fn rf_channel(&self) -> u8 {
        match self.0 {
            ch @ 0..=10 => ch + 1,
            ch @ 11..=36 => ch + 2,
            _ => unreachable!(),
        }
    }

    /// Returns the center frequency of this channel in Hz.
    pub fn freq_hz(&self) -> u32 {
        rf_channel_freq_hz(self.rf_channel())
    }

    /// Returns the data-whitening LFSR seed for this channel.
    pub fn whitening_iv(&self) -> u8 {
        whitening_iv(self.0)
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertising_frequencies() {
        assert_eq!(AdvertisingChannel::first().freq_hz(), 2_402_000_000);
        assert_eq!(AdvertisingChannel::first().cycle().freq_hz(), 2_426_000_000);
        assert_eq!(
            AdvertisingChannel::first().cycle().cycle().freq_hz(),
            2_480_000_000
        );
        assert_eq!(
            AdvertisingChannel::first().cycle().cycle().cycle(),
            AdvertisingChannel::first()
        );
    }

    #[test]
    fn data_channels_interleave() {
        // Data channels skip the RF slots taken by advertising.
        assert_eq!(DataChannel::new(0).freq_hz(), 2_404_000_000);
        assert_eq!(DataChannel::new(10).freq_hz(), 2_424_000_000);
        assert_eq!(DataChannel::new(11).freq_hz(), 2_428_000_000);
        assert_eq!(DataChannel::new(36).freq_hz(), 2_478_000_000);
    }

    #[test]
    fn whitening_seed_is_channel_with_bit6() {
        assert_eq!(DataChannel::new(0).whitening_iv(), 0x40);
        assert_eq!(DataChannel::new(36).whitening_iv(), 0x40 | 36);
        assert_eq!(AdvertisingChannel::first().whitening_iv(), 0x40 | 37);
    }
}
