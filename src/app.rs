//! The application-level state machine.
//!
//! Ties scanner, connection, ATT client and GATT facade together into the
//! "push text to a wearable" workflow: scan for the target, connect,
//! negotiate the MTU, pick the peripheral profile, write the text, and
//! handle retries, unsolicited disconnects and error cool-down.
//!
//! Everything runs cooperatively: the host's main loop calls
//! [`App::process`] as often as it likes; each call performs at most one
//! Link-Layer activity plus any state work that became due.

use crate::att::{self, AttError, Client, Handle};
use crate::config::Config;
use crate::gatt::{GattClient, GattError, HandleSet};
use crate::link::{
    ConnectionParams, DeviceAddress, LinkError, LinkEvent, LinkLayer, ScanParams,
    REASON_REMOTE_USER_TERMINATED,
};
use crate::time::{Duration, Instant, Timer};
use core::fmt;
use log::{debug, info, warn};

/// Hook invoked after profile selection, before the first payload write.
///
/// Proprietary peripherals (Xiaomi wearables) require an authentication
/// exchange here; the protocol is not part of this crate, so the host
/// supplies it. Absent hook = no authentication step.
pub type AuthHook<C> =
    fn(&mut Client, &mut LinkLayer<C>, &HandleSet) -> Result<(), AttError>;

/// How long to wait in `Connecting` before retrying.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a terminate handshake before forcing Idle.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cool-down before leaving the `Error` state.
const ERROR_COOLDOWN: Duration = Duration::from_secs(3);

/// Application configuration.
#[derive(Debug, Copy, Clone)]
pub struct AppConfig {
    /// Device address of the peripheral to connect to.
    pub target: DeviceAddress,
    /// Scan behavior for discovery and connection establishment.
    pub scan: ScanParams,
    /// Connection parameters offered in `CONNECT_REQ`.
    pub conn: ConnectionParams,
    /// Our receive MTU offered in the MTU exchange.
    pub rx_mtu: u16,
    /// Connection attempts before giving up.
    pub max_retry_count: u8,
    /// Back-off between attempts.
    pub retry_delay: Duration,
    /// Reconnect automatically after an unsolicited disconnect.
    pub auto_reconnect: bool,
    /// Drop the link once a text was delivered.
    pub disconnect_after_send: bool,
    /// Subscribe to the peripheral's notifications after connecting.
    pub enable_notifications: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target: DeviceAddress::new([0; 6], crate::link::AddressKind::Public),
            scan: ScanParams::default(),
            conn: ConnectionParams::default(),
            rx_mtu: att::ATT_MTU_MAX,
            max_retry_count: 3,
            retry_delay: Duration::from_secs(1),
            auto_reconnect: true,
            disconnect_after_send: true,
            enable_notifications: false,
        }
    }
}

/// Application states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppState {
    Init,
    Idle,
    Scanning,
    Connecting,
    Connected,
    Sending,
    Disconnecting,
    Error,
}

/// Application-level error classification, as handed to the error callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppError {
    Link(LinkError),
    Att(AttError),
    Gatt(GattError),
    /// A state (connecting, disconnecting) took too long.
    Timeout,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Link(e) => write!(f, "link: {}", e),
            AppError::Att(e) => write!(f, "att: {}", e),
            AppError::Gatt(e) => write!(f, "gatt: {}", e),
            AppError::Timeout => f.write_str("timed out"),
        }
    }
}

/// Typed callback table. Unset entries are no-ops.
///
/// All callbacks are plain function pointers, invoked from within
/// [`App::process`] on the foreground.
#[derive(Default, Copy, Clone)]
pub struct Callbacks {
    /// A connection was established and set up.
    pub on_connected: Option<fn()>,
    /// The connection ended (reason code as on the wire).
    pub on_disconnected: Option<fn(u8)>,
    /// A queued text was fully delivered.
    pub on_text_sent: Option<fn()>,
    /// An advertisement passed the scan filter while scanning.
    pub on_adv_report: Option<fn(DeviceAddress, i8)>,
    /// Something went wrong; the app enters its cool-down.
    pub on_error: Option<fn(AppError)>,
    /// A notification or indication arrived.
    pub on_notification: Option<fn(Handle, &[u8])>,
}

/// Capacity of the queued-text buffer.
const TEXT_BUF: usize = 256;

/// The application harness.
pub struct App<C: Config> {
    ll: LinkLayer<C>,
    att: Client,
    gatt: GattClient,
    config: AppConfig,
    callbacks: Callbacks,
    auth: Option<AuthHook<C>>,

    state: AppState,
    state_entered: Instant,
    retry_count: u8,
    /// Deferred reconnect after an unsolicited disconnect.
    reconnect_at: Option<Instant>,

    text_buf: [u8; TEXT_BUF],
    text_len: usize,
    text_pending: bool,
    texts_sent: u32,
}

impl<C: Config> App<C> {
    /// Creates the application around a Link-Layer.
    pub fn new(ll: LinkLayer<C>, config: AppConfig, callbacks: Callbacks) -> Self {
        let now = ll.now();
        let mut att = Client::new();
        if let Some(handler) = callbacks.on_notification {
            att.set_notification_handler(handler);
        }
        Self {
            ll,
            att,
            gatt: GattClient::new(),
            config,
            callbacks,
            auth: None,
            state: AppState::Init,
            state_entered: now,
            retry_count: 0,
            reconnect_at: None,
            text_buf: [0; TEXT_BUF],
            text_len: 0,
            text_pending: false,
            texts_sent: 0,
        }
    }

    /// Installs the authentication hook (see [`AuthHook`]).
    pub fn set_auth_hook(&mut self, hook: AuthHook<C>) {
        self.auth = Some(hook);
    }

    /// Returns the current application state.
    pub fn state(&self) -> AppState {
        self.state
    }

    /// Number of texts fully delivered since start.
    pub fn texts_sent(&self) -> u32 {
        self.texts_sent
    }

    /// Borrows the Link-Layer (e.g. for stats or the device address).
    pub fn link(&mut self) -> &mut LinkLayer<C> {
        &mut self.ll
    }

    /// Changes the target peripheral. Takes effect on the next connect.
    pub fn set_target(&mut self, target: DeviceAddress) {
        self.config.target = target;
    }

    /// Starts scanning for nearby devices, reporting them via
    /// `on_adv_report`.
    pub fn start_scan(&mut self) -> Result<(), AppError> {
        if self.state != AppState::Idle {
            return Err(AppError::Link(LinkError::Busy));
        }
        self.ll
            .start_scan(&self.config.scan, None)
            .map_err(AppError::Link)?;
        self.enter(AppState::Scanning);
        Ok(())
    }

    /// Stops a running scan.
    pub fn stop_scan(&mut self) -> Result<(), AppError> {
        if self.state != AppState::Scanning {
            return Err(AppError::Link(LinkError::NotConnected));
        }
        self.ll.stop_scan().map_err(AppError::Link)?;
        self.enter(AppState::Idle);
        Ok(())
    }

    /// Connects to the configured target.
    pub fn connect(&mut self) -> Result<(), AppError> {
        if !matches!(self.state, AppState::Idle | AppState::Scanning) {
            return Err(AppError::Link(LinkError::Busy));
        }
        self.retry_count = 0;
        self.start_connect()
    }

    /// Queues `text` for delivery; connects first if necessary.
    ///
    /// The actual transfer happens over subsequent [`process`](Self::process)
    /// calls.
    pub fn send_text(&mut self, text: &str) -> Result<(), AppError> {
        let bytes = text.as_bytes();
        if bytes.is_empty() || bytes.len() > TEXT_BUF {
            return Err(AppError::Att(AttError::Param));
        }
        self.text_buf[..bytes.len()].copy_from_slice(bytes);
        self.text_len = bytes.len();
        self.text_pending = true;

        if self.state == AppState::Idle {
            self.retry_count = 0;
            self.start_connect()?;
        }
        Ok(())
    }

    /// Requests an orderly disconnect.
    pub fn disconnect(&mut self) -> Result<(), AppError> {
        match self.state {
            AppState::Connected | AppState::Sending => {
                self.ll
                    .disconnect(REASON_REMOTE_USER_TERMINATED)
                    .map_err(AppError::Link)?;
                self.enter(AppState::Disconnecting);
                Ok(())
            }
            AppState::Connecting => {
                self.ll
                    .disconnect(REASON_REMOTE_USER_TERMINATED)
                    .map_err(AppError::Link)?;
                self.enter(AppState::Idle);
                Ok(())
            }
            _ => Err(AppError::Link(LinkError::NotConnected)),
        }
    }

    /// Runs one iteration of the application.
    ///
    /// Call from the host's main loop. Returns the state after the
    /// iteration.
    pub fn process(&mut self) -> AppState {
        // Keep the link moving and collect its event, if any.
        match self.att.poll(&mut self.ll) {
            Ok(Some(event)) => self.handle_link_event(event),
            Ok(None) => {}
            Err(e) => self.fail(AppError::Att(e)),
        }

        let time_in_state = self.ll.now() - self.state_entered;
        match self.state {
            AppState::Init => self.enter(AppState::Idle),

            AppState::Idle => {
                if let Some(at) = self.reconnect_at {
                    if self.ll.now() >= at {
                        self.reconnect_at = None;
                        info!("auto-reconnect");
                        self.retry_count = 0;
                        if let Err(e) = self.start_connect() {
                            self.fail(e);
                        }
                    }
                }
            }

            AppState::Scanning => {
                // Scan timeout is reported by the Link-Layer as an event.
            }

            AppState::Connecting => {
                if time_in_state > CONNECT_TIMEOUT {
                    warn!("connect attempt timed out");
                    let _ = self.ll.disconnect(REASON_REMOTE_USER_TERMINATED);
                    self.retry_or_fail();
                }
            }

            AppState::Connected => {
                if self.text_pending {
                    self.enter(AppState::Sending);
                }
            }

            AppState::Sending => self.run_send(),

            AppState::Disconnecting => {
                if time_in_state > DISCONNECT_TIMEOUT {
                    debug!("terminate handshake timed out, forcing idle");
                    self.finish_disconnect(REASON_REMOTE_USER_TERMINATED);
                }
            }

            AppState::Error => {
                if time_in_state > ERROR_COOLDOWN {
                    info!("leaving error state");
                    self.retry_count = 0;
                    self.enter(AppState::Idle);
                }
            }
        }

        self.state
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::AdvReport {
                advertiser, rssi, ..
            } => {
                if let Some(cb) = self.callbacks.on_adv_report {
                    cb(advertiser, rssi);
                }
            }

            LinkEvent::ScanTimeout => match self.state {
                AppState::Connecting => {
                    debug!("target not seen while initiating");
                    self.retry_or_fail();
                }
                _ => self.enter(AppState::Idle),
            },

            LinkEvent::Connected => {
                info!("link established, setting up");
                if let Err(e) = self.post_connect() {
                    warn!("connection setup failed: {}", e);
                    let _ = self.ll.disconnect(REASON_REMOTE_USER_TERMINATED);
                    self.fail(e);
                    return;
                }
                self.enter(AppState::Connected);
                if let Some(cb) = self.callbacks.on_connected {
                    cb();
                }
            }

            LinkEvent::Disconnected { reason } => {
                self.finish_disconnect(reason);
            }
        }
    }

    /// MTU exchange, profile selection, authentication and subscriptions,
    /// right after the link comes up.
    fn post_connect(&mut self) -> Result<(), AppError> {
        self.att
            .exchange_mtu(&mut self.ll, self.config.rx_mtu)
            .map_err(AppError::Att)?;

        self.gatt
            .select_profile(&mut self.att, &mut self.ll)
            .map_err(AppError::Gatt)?;

        if let (Some(auth), Some(handles)) = (self.auth, self.gatt.handles()) {
            auth(&mut self.att, &mut self.ll, &handles).map_err(AppError::Att)?;
        }

        if self.config.enable_notifications {
            self.gatt
                .enable_notifications(&mut self.att, &mut self.ll)
                .map_err(AppError::Gatt)?;
        }
        Ok(())
    }

    /// Delivers the queued text.
    fn run_send(&mut self) {
        if !self.text_pending {
            self.enter(AppState::Connected);
            return;
        }

        let text = match core::str::from_utf8(&self.text_buf[..self.text_len]) {
            Ok(text) => text,
            Err(_) => {
                self.text_pending = false;
                self.fail(AppError::Att(AttError::Param));
                return;
            }
        };

        // `write_text` blocks through the chunked transfer; cooperative
        // callers accept that a send occupies this process() call.
        match self.gatt.write_text(&mut self.att, &mut self.ll, text) {
            Ok(()) => {
                self.text_pending = false;
                self.texts_sent += 1;
                info!("text delivered ({} bytes)", self.text_len);
                if let Some(cb) = self.callbacks.on_text_sent {
                    cb();
                }
                if self.config.disconnect_after_send {
                    let _ = self.disconnect();
                } else {
                    self.enter(AppState::Connected);
                }
            }
            Err(e) => {
                warn!("text delivery failed: {}", e);
                self.fail(AppError::Gatt(e));
            }
        }
    }

    fn start_connect(&mut self) -> Result<(), AppError> {
        self.ll
            .connect(self.config.target, &self.config.scan, &self.config.conn)
            .map_err(AppError::Link)?;
        self.enter(AppState::Connecting);
        Ok(())
    }

    fn retry_or_fail(&mut self) {
        self.retry_count += 1;
        if self.retry_count < self.config.max_retry_count {
            info!(
                "retrying connect ({}/{})",
                self.retry_count, self.config.max_retry_count
            );
            self.ll.timer().delay(self.config.retry_delay);
            if self.start_connect().is_ok() {
                return;
            }
        }
        self.fail(AppError::Timeout);
    }

    /// Common tail of every disconnect path.
    fn finish_disconnect(&mut self, reason: u8) {
        info!("disconnected, reason {:#04x}", reason);
        self.att.reset();
        self.gatt.reset();
        let was_requested = self.state == AppState::Disconnecting;
        self.enter(AppState::Idle);

        if let Some(cb) = self.callbacks.on_disconnected {
            cb(reason);
        }

        if self.config.auto_reconnect && !was_requested && reason != REASON_REMOTE_USER_TERMINATED
        {
            self.reconnect_at = Some(self.ll.now() + self.config.retry_delay);
        }
    }

    fn fail(&mut self, error: AppError) {
        warn!("app error: {}", error);
        self.enter(AppState::Error);
        if let Some(cb) = self.callbacks.on_error {
            cb(error);
        }
    }

    fn enter(&mut self, state: AppState) {
        if self.state != state {
            debug!("app state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.state_entered = self.ll.now();
        }
    }
}
