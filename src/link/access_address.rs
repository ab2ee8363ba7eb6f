//! Access-address generation and validation.
//!
//! Every connection is identified by a 32-bit Access Address chosen by the
//! initiator, which doubles as the radio sync word. The specification
//! constrains which values are acceptable so the address keeps enough bit
//! transitions for the receiver's correlator; the initiator simply draws
//! random candidates until one passes.

use crate::utils::Hex;
use core::fmt;
use rand_core::RngCore;

/// A validated 32-bit connection Access Address.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AccessAddress(u32);

/// The fixed Access Address used by all advertising channel traffic.
pub const ADVERTISING_ADDRESS: u32 = 0x8E89_BED6;

impl AccessAddress {
    /// Checks a candidate value against the validity rules.
    ///
    /// An Access Address is valid iff all of the following hold:
    /// * it is not the advertising Access Address,
    /// * it has no run of 7 or more identical consecutive bits,
    /// * it has at least 3 bit transitions over the full 32 bits,
    /// * it has at least 2 transitions in the 6 most significant bits.
    pub fn is_valid(raw: u32) -> bool {
        if raw == ADVERTISING_ADDRESS {
            return false;
        }

        let mut longest_run = 1;
        let mut run = 1;
        let mut transitions = 0;
        let mut high_transitions = 0;
        for i in 1..32 {
            if (raw >> i) & 1 == (raw >> (i - 1)) & 1 {
                run += 1;
                if run > longest_run {
                    longest_run = run;
                }
            } else {
                run = 1;
                transitions += 1;
                if i > 26 {
                    high_transitions += 1;
                }
            }
        }

        longest_run < 7 && transitions >= 3 && high_transitions >= 2
    }

    /// Wraps a raw value, returning `None` if it fails validation.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if Self::is_valid(raw) {
            Some(AccessAddress(raw))
        } else {
            None
        }
    }

    /// Draws random 32-bit words from `rng` until one passes validation.
    ///
    /// Valid addresses make up the overwhelming majority of the 32-bit
    /// space, so for any usable entropy source this terminates after a
    /// handful of draws.
    pub fn generate(rng: &mut impl RngCore) -> Self {
        loop {
            let candidate = rng.next_u32();
            if Self::is_valid(candidate) {
                return AccessAddress(candidate);
            }
        }
    }

    /// Returns the raw 32-bit value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Returns the radio sync word for this address.
    ///
    /// The Access Address goes on air least-significant byte first.
    pub fn sync_word(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for AccessAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessAddress({:?})", Hex(self.0))
    }
}

/// Draws a random 24-bit CRC initialization value for a new connection.
pub fn generate_crc_init(rng: &mut impl RngCore) -> u32 {
    rng.next_u32() & 0x00FF_FFFF
}

/// A 16-bit Galois LFSR usable as the stack's default entropy source.
///
/// This is not cryptographic randomness and doesn't need to be: Access
/// Addresses and CRC seeds only have to be well-distributed. Platforms with
/// a hardware RNG should prefer it over this.
pub struct Lfsr {
    state: u16,
}

impl Lfsr {
    /// Creates an LFSR from a seed. A zero seed is mapped to a fixed
    /// nonzero state, since the all-zero state is a fixpoint.
    pub fn new(seed: u16) -> Self {
        Lfsr {
            state: if seed == 0 { 0xACE1 } else { seed },
        }
    }

    fn step(&mut self) -> u8 {
        // x^16 + x^14 + x^13 + x^11 + 1
        for _ in 0..8 {
            let lsb = self.state & 1;
            self.state >>= 1;
            if lsb != 0 {
                self.state ^= 0xB400;
            }
        }
        (self.state & 0xFF) as u8
    }
}

impl RngCore for Lfsr {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            *byte = self.step();
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_advertising_address() {
        assert!(!AccessAddress::is_valid(ADVERTISING_ADDRESS));
    }

    #[test]
    fn rejects_long_runs() {
        assert!(!AccessAddress::is_valid(0x0000_0000));
        assert!(!AccessAddress::is_valid(0xFFFF_FFFF));
        // 7 consecutive ones in the middle.
        assert!(!AccessAddress::is_valid(0x550F_E055));
    }

    #[test]
    fn rejects_too_few_transitions() {
        // 0b1111..0000: a single transition (and long runs besides).
        assert!(!AccessAddress::is_valid(0xFFFF_0000));
    }

    #[test]
    fn rejects_static_high_bits() {
        // Plenty of transitions overall, but only one within the top 6
        // bits (000001).
        assert!(!AccessAddress::is_valid(0x0655_5555));
    }

    #[test]
    fn accepts_well_formed_addresses() {
        assert!(AccessAddress::is_valid(0xAF9A_1234));
        assert!(AccessAddress::is_valid(0x5555_5555));
    }

    #[test]
    fn generator_skips_invalid_candidates() {
        struct Script(Vec<u32>);
        impl RngCore for Script {
            fn next_u32(&mut self) -> u32 {
                self.0.remove(0)
            }
            fn next_u64(&mut self) -> u64 {
                u64::from(self.next_u32())
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                for chunk in dest.chunks_mut(4) {
                    let w = self.next_u32().to_le_bytes();
                    chunk.copy_from_slice(&w[..chunk.len()]);
                }
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
                self.fill_bytes(dest);
                Ok(())
            }
        }

        let mut rng = Script(vec![ADVERTISING_ADDRESS, 0xFFFF_FFFF, 0xAF9A_1234]);
        assert_eq!(AccessAddress::generate(&mut rng).raw(), 0xAF9A_1234);
    }

    #[test]
    fn generated_addresses_are_valid() {
        let mut rng = Lfsr::new(0x1234);
        for _ in 0..100 {
            let aa = AccessAddress::generate(&mut rng);
            assert!(AccessAddress::is_valid(aa.raw()));
        }
    }

    #[test]
    fn sync_word_is_little_endian() {
        let aa = AccessAddress::from_raw(0xAF9A_1234).unwrap();
        assert_eq!(aa.sync_word(), [0x34, 0x12, 0x9A, 0xAF]);
    }

    #[test]
    fn crc_init_is_24_bit() {
        let mut rng = Lfsr::new(7);
        for _ in 0..32 {
            assert_eq!(generate_crc_init(&mut rng) >> 24, 0);
        }
    }
}
