//! Stack configuration trait.

use crate::radio::Radio;
use crate::time::Timer;
use rand_core::RngCore;

/// Trait tying together the platform-dependent types the stack is built on.
///
/// Every application defines one type implementing this trait and supplies
/// it to [`LinkLayer`](crate::link::LinkLayer).
pub trait Config {
    /// The transceiver driver.
    type Radio: Radio;

    /// A timesource with microsecond resolution.
    type Timer: Timer;

    /// Entropy source for access addresses, CRC seeds and the local device
    /// address.
    ///
    /// [`Lfsr`](crate::link::access_address::Lfsr) works when the platform
    /// has nothing better.
    type Rng: RngCore;
}
