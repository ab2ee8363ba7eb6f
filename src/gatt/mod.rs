//! A GATT client facade for text-push peripherals.
//!
//! Full GATT service discovery walks the whole attribute tree; the wearable
//! peripherals this stack targets don't need that. Their attribute layouts
//! are fixed per firmware family, so the facade only has to figure out
//! *which* family it is talking to - by device name, or failing that by
//! primary-service UUID - and then use the family's well-known handles.

use crate::att::{AttError, Client, Handle};
use crate::config::Config;
use crate::link::LinkLayer;
use crate::time::{Duration, Timer};
use crate::uuid::Uuid16;
use core::fmt;
use core::str;
use log::{debug, info};

/// The GAP *Device Name* characteristic value handle on the peripherals
/// this stack targets.
pub const DEVICE_NAME_HANDLE: Handle = Handle::from_raw(0x0003);

/// Primary service UUID advertised by Xiaomi wearables.
pub const XIAOMI_SERVICE: Uuid16 = Uuid16(0xFEE0);

/// The Nordic UART Service's 16-bit alias.
pub const NORDIC_UART_SERVICE: Uuid16 = Uuid16(0xFFE0);

/// Pause between consecutive chunks of a fragmented text write.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(20);

/// The known peripheral families.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeripheralKind {
    /// Xiaomi Mi Band 4/5 family.
    Xiaomi,
    /// Nordic UART Service peripherals.
    NordicUart,
    /// Anything else; a fixed fallback handle layout is assumed.
    Custom,
}

/// The attribute handles the facade operates on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandleSet {
    /// The primary service declaration.
    pub service: Handle,
    /// Characteristic the peripheral receives text on.
    pub tx_char: Handle,
    /// Characteristic the peripheral notifies on.
    pub rx_char: Handle,
    /// CCCD of `rx_char`.
    pub cccd: Handle,
}

impl PeripheralKind {
    /// Returns the fixed handle layout of this peripheral family.
    pub fn handles(&self) -> HandleSet {
        match self {
            PeripheralKind::Xiaomi => HandleSet {
                service: Handle::from_raw(0x0010),
                tx_char: Handle::from_raw(0x0016),
                rx_char: Handle::from_raw(0x0013),
                cccd: Handle::from_raw(0x0014),
            },
            PeripheralKind::NordicUart => HandleSet {
                service: Handle::from_raw(0x000C),
                tx_char: Handle::from_raw(0x000E),
                rx_char: Handle::from_raw(0x0011),
                cccd: Handle::from_raw(0x0012),
            },
            PeripheralKind::Custom => HandleSet {
                service: Handle::from_raw(0x0020),
                tx_char: Handle::from_raw(0x0022),
                rx_char: Handle::from_raw(0x0024),
                cccd: Handle::from_raw(0x0025),
            },
        }
    }
}

/// Errors surfaced by the GATT facade.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GattError {
    /// No profile has been selected yet.
    NoProfile,
    /// An ATT operation failed.
    Att(AttError),
}

impl From<AttError> for GattError {
    fn from(e: AttError) -> Self {
        GattError::Att(e)
    }
}

impl fmt::Display for GattError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattError::NoProfile => f.write_str("peripheral profile not selected"),
            GattError::Att(e) => write!(f, "att: {}", e),
        }
    }
}

/// GATT client facade: profile selection and text transfer.
pub struct GattClient {
    profile: Option<(PeripheralKind, HandleSet)>,
}

impl GattClient {
    /// Creates a facade with no profile selected.
    pub fn new() -> Self {
        GattClient { profile: None }
    }

    /// Returns the selected peripheral family, if any.
    pub fn kind(&self) -> Option<PeripheralKind> {
        self.profile.map(|(kind, _)| kind)
    }

    /// Returns the handle set in use, if a profile is selected.
    pub fn handles(&self) -> Option<HandleSet> {
        self.profile.map(|(_, handles)| handles)
    }

    /// Forgets the selected profile. Call after a disconnect.
    pub fn reset(&mut self) {
        self.profile = None;
    }

    /// Determines the peripheral family of the connected device.
    ///
    /// First tries to read the Device Name characteristic and match known
    /// substrings. If that read fails, falls back to enumerating primary
    /// services over the full handle range and matching known service
    /// UUIDs. Devices that match nothing get the `Custom` layout.
    pub fn select_profile<C: Config>(
        &mut self,
        att: &mut Client,
        ll: &mut LinkLayer<C>,
    ) -> Result<PeripheralKind, GattError> {
        let kind = match att.read(ll, DEVICE_NAME_HANDLE) {
            Ok(name) => {
                let name = str::from_utf8(name).unwrap_or("");
                debug!("device name: {:?}", name);
                if name.contains("Mi Band") {
                    PeripheralKind::Xiaomi
                } else if name.contains("Nordic") {
                    PeripheralKind::NordicUart
                } else {
                    PeripheralKind::Custom
                }
            }
            Err(e) => {
                debug!("device name read failed ({}), probing services", e);
                self.probe_services(att, ll)?
            }
        };

        info!("peripheral profile: {:?}", kind);
        self.profile = Some((kind, kind.handles()));
        Ok(kind)
    }

    /// Finds a known primary service via *Read By Type* on `0x2800`.
    fn probe_services<C: Config>(
        &mut self,
        att: &mut Client,
        ll: &mut LinkLayer<C>,
    ) -> Result<PeripheralKind, GattError> {
        let (pair_len, list) = att.read_by_type(
            ll,
            Handle::from_raw(0x0001),
            Handle::from_raw(0xFFFF),
            Uuid16::PRIMARY_SERVICE,
        )?;

        // Each pair is a 2-byte handle followed by the service UUID; only
        // 16-bit UUIDs (4-byte pairs) can match the known services.
        if pair_len == 4 {
            for pair in list.chunks_exact(4) {
                let uuid = Uuid16(u16::from_le_bytes([pair[2], pair[3]]));
                if uuid == XIAOMI_SERVICE {
                    return Ok(PeripheralKind::Xiaomi);
                }
                if uuid == NORDIC_UART_SERVICE {
                    return Ok(PeripheralKind::NordicUart);
                }
            }
        }
        Ok(PeripheralKind::Custom)
    }

    /// Writes UTF-8 text to the peripheral's TX characteristic.
    ///
    /// Text longer than `MTU − 3` is split into maximal chunks, each
    /// written with an acknowledged Write Request and spaced 20 ms apart to
    /// keep slow peripherals from congesting.
    pub fn write_text<C: Config>(
        &mut self,
        att: &mut Client,
        ll: &mut LinkLayer<C>,
        text: &str,
    ) -> Result<(), GattError> {
        let (_, handles) = self.profile.ok_or(GattError::NoProfile)?;
        let chunk_size = usize::from(att.mtu()) - 3;

        let bytes = text.as_bytes();
        let mut chunks = bytes.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            att.write(ll, handles.tx_char, chunk)?;
            if chunks.peek().is_some() {
                ll.timer().delay(INTER_CHUNK_DELAY);
            }
        }
        Ok(())
    }

    /// Enables notifications from the peripheral's RX characteristic.
    pub fn enable_notifications<C: Config>(
        &mut self,
        att: &mut Client,
        ll: &mut LinkLayer<C>,
    ) -> Result<(), GattError> {
        let (_, handles) = self.profile.ok_or(GattError::NoProfile)?;
        att.enable_notifications(ll, handles.cccd)?;
        Ok(())
    }
}

impl Default for GattClient {
    fn default() -> Self {
        Self::new()
    }
}
