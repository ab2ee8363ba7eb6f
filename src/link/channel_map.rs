use crate::phy::DataChannel;
use core::fmt;

/// A map marking data channels as used or unused.
///
/// A channel map must mark at least 2 channels as used to be valid for a
/// connection; maps violating that are still representable so that received
/// `CONNECT_REQ` PDUs can be inspected before rejection.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    raw: [u8; 5],
    num_used_channels: u8,
}

impl ChannelMap {
    /// Creates a channel map from the raw `ChM` format used in `CONNECT_REQ`
    /// PDUs.
    ///
    /// The first byte (LSB) contains the flags for data channels 0 to 7,
    /// with the least significant bit belonging to channel 0, and so on.
    /// The 3 most significant bits of the last byte are RFU and ignored.
    pub fn from_raw(mut raw: [u8; 5]) -> Self {
        raw[4] &= 0b11111;
        Self {
            raw,
            num_used_channels: raw.iter().map(|b| b.count_ones() as u8).sum(),
        }
    }

    /// Returns the raw bytes encoding this channel map.
    pub fn to_raw(&self) -> [u8; 5] {
        self.raw
    }

    /// Creates a channel map that marks all 37 data channels as used.
    pub fn with_all_channels() -> Self {
        Self {
            raw: [0xff, 0xff, 0xff, 0xff, 0b11111],
            num_used_channels: 37,
        }
    }

    /// Returns the number of data channels marked as used by this map.
    pub fn num_used_channels(&self) -> u8 {
        self.num_used_channels
    }

    /// Returns whether the given data channel is marked as used.
    pub fn is_used(&self, channel: DataChannel) -> bool {
        let byte = self.raw[usize::from(channel.index()) / 8];
        byte & (1 << (channel.index() % 8)) != 0
    }

    /// Returns an iterator over all data channels marked as used.
    pub fn iter_used<'a>(&'a self) -> impl Iterator<Item = DataChannel> + 'a {
        (0u8..37)
            .map(DataChannel::new)
            .filter(move |ch| self.is_used(*ch))
    }

    /// Returns the `n`th channel marked as used.
    ///
    /// # Panics
    ///
    /// Panics when `n >= self.num_used_channels()`.
    pub fn by_index(&self, n: u8) -> DataChannel {
        self.iter_used()
            .nth(n.into())
            .expect("by_index: index out of bounds")
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelMap({:02x} {:02x} {:02x} {:02x} {:02x})",
            self.raw[0], self.raw[1], self.raw[2], self.raw[3], self.raw[4]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_channel() {
        // Only channel 0 used. Not valid for a connection (fewer than 2
        // channels), but exercises the remap lookup.
        let map = ChannelMap::from_raw([0x01, 0, 0, 0, 0]);
        assert_eq!(map.num_used_channels(), 1);
        assert!(map.is_used(DataChannel::new(0)));
        assert!(!map.is_used(DataChannel::new(1)));
        assert!(!map.is_used(DataChannel::new(7)));
        assert!(!map.is_used(DataChannel::new(8)));
        assert!(!map.is_used(DataChannel::new(36)));
        assert_eq!(map.by_index(0), DataChannel::new(0));
        assert!(map.iter_used().eq(vec![DataChannel::new(0)]));
    }

    #[test]
    fn rfu_bits_cleared() {
        let map = ChannelMap::from_raw([0xff; 5]);
        assert_eq!(map.num_used_channels(), 37);
        assert_eq!(map, ChannelMap::with_all_channels());
        assert_eq!(map.to_raw()[4], 0b11111);
    }

    #[test]
    fn all_channels() {
        let map = ChannelMap::with_all_channels();
        for ch in 0..=36 {
            assert!(map.is_used(DataChannel::new(ch)));
        }
        assert_eq!(map.by_index(36), DataChannel::new(36));
    }
}
