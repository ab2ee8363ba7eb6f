use core::fmt;

/// A 1-bit data packet sequence number.
///
/// The Link-Layer ARQ keeps two of these per connection (`transmitSeqNum`
/// and `nextExpectedSeqNum`); both wrap modulo 2, which this type models
/// with [`SeqNum::toggle`].
#[derive(PartialEq, Eq, Copy, Clone, Default)]
pub struct SeqNum(bool);

impl SeqNum {
    /// The initial sequence number of a fresh connection, 0.
    pub const ZERO: Self = SeqNum(false);

    /// Creates a sequence number from a raw header bit.
    pub fn from_bit(bit: bool) -> Self {
        SeqNum(bit)
    }

    /// Returns the value as a raw header bit.
    pub fn bit(self) -> bool {
        self.0
    }

    /// Advances the sequence number by one (wrapping).
    pub fn toggle(&mut self) {
        self.0 = !self.0;
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0 { "1" } else { "0" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_modulo_two() {
        let mut sn = SeqNum::ZERO;
        sn.toggle();
        assert_eq!(sn, SeqNum::from_bit(true));
        sn.toggle();
        assert_eq!(sn, SeqNum::ZERO);
    }
}
