//! The ATT client state machine.

use crate::att::pdus::{AttMsg, Opcode};
use crate::att::{AttError, Handle};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::config::Config;
use crate::l2cap::{self, Assembler, Channel};
use crate::link::{LinkEvent, LinkLayer};
use crate::time::Duration;
use crate::utils::HexSlice;
use crate::uuid::Uuid16;
use crate::Error;
use log::{debug, trace};

/// The ATT_MTU every connection starts out with.
pub const ATT_MTU_DEFAULT: u16 = 23;

/// The largest ATT_MTU this client will agree to.
pub const ATT_MTU_MAX: u16 = 247;

/// How long to wait for the server's response to a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest ATT PDU at the maximum MTU.
const PDU_BUF: usize = ATT_MTU_MAX as usize;

/// Reassembly storage: one maximal ATT PDU plus the L2CAP header.
const ASM_BUF: usize = l2cap::HEADER_SIZE + PDU_BUF;

/// Callback invoked for every received notification or indication, with the
/// source attribute handle and the value.
pub type NotificationHandler = fn(Handle, &[u8]);

struct Pending {
    request: Opcode,
    expected: Opcode,
}

/// An ATT client bound to L2CAP channel `0x0004`.
///
/// The client borrows the [`LinkLayer`] per call and pumps it while waiting
/// for responses; it never retains a reference to it.
pub struct Client {
    mtu: u16,
    pending: Option<Pending>,
    /// Outcome of the pending request, set by the pump.
    rsp_result: Option<Result<(), AttError>>,
    rsp_buf: [u8; PDU_BUF],
    rsp_len: usize,
    /// Staging area for a completed incoming ATT PDU.
    frame_buf: [u8; PDU_BUF],
    asm: Assembler<[u8; ASM_BUF]>,
    /// An indication was received and its confirmation couldn't be queued
    /// yet.
    cfm_pending: bool,
    notification_handler: Option<NotificationHandler>,
}

impl Client {
    /// Creates a client in the initial state (MTU 23, no request pending).
    pub fn new() -> Self {
        Client {
            mtu: ATT_MTU_DEFAULT,
            pending: None,
            rsp_result: None,
            rsp_buf: [0; PDU_BUF],
            rsp_len: 0,
            frame_buf: [0; PDU_BUF],
            asm: Assembler::new([0; ASM_BUF]),
            cfm_pending: false,
            notification_handler: None,
        }
    }

    /// Returns the MTU agreed for the current connection.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Registers the handler invoked for notifications and indications.
    pub fn set_notification_handler(&mut self, handler: NotificationHandler) {
        self.notification_handler = Some(handler);
    }

    /// Resets all per-connection state. Call after a disconnect.
    pub fn reset(&mut self) {
        self.mtu = ATT_MTU_DEFAULT;
        self.pending = None;
        self.rsp_result = None;
        self.rsp_len = 0;
        self.cfm_pending = false;
        self.asm.reset();
    }

    /// Performs the MTU exchange, requesting `client_rx_mtu` as our receive
    /// MTU, and returns the agreed value.
    ///
    /// Both sides' values are clamped into `[23, 247]`; the connection uses
    /// the minimum.
    pub fn exchange_mtu<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
        client_rx_mtu: u16,
    ) -> Result<u16, AttError> {
        let client = client_rx_mtu.clamp(ATT_MTU_DEFAULT, ATT_MTU_MAX);
        self.request(ll, &AttMsg::ExchangeMtuReq { mtu: client })?;
        let server = match self.response()? {
            AttMsg::ExchangeMtuRsp { mtu } => mtu,
            _ => return Err(AttError::Codec(Error::InvalidValue)),
        };
        let agreed = client.min(server).clamp(ATT_MTU_DEFAULT, ATT_MTU_MAX);
        self.mtu = agreed;
        debug!("MTU agreed: {}", agreed);
        Ok(agreed)
    }

    /// Reads the value of the attribute at `handle`.
    pub fn read<'a, C: Config>(
        &'a mut self,
        ll: &mut LinkLayer<C>,
        handle: Handle,
    ) -> Result<&'a [u8], AttError> {
        self.request(ll, &AttMsg::ReadReq { handle })?;
        match self.response()? {
            AttMsg::ReadRsp { value } => Ok(value.0),
            _ => Err(AttError::Codec(Error::InvalidValue)),
        }
    }

    /// Issues a *Read By Type* request over `[start, end]`.
    ///
    /// Returns the size of each handle/value pair and the packed pair list.
    pub fn read_by_type<'a, C: Config>(
        &'a mut self,
        ll: &mut LinkLayer<C>,
        start: Handle,
        end: Handle,
        attribute_type: Uuid16,
    ) -> Result<(u8, &'a [u8]), AttError> {
        self.request(
            ll,
            &AttMsg::ReadByTypeReq {
                start,
                end,
                attribute_type,
            },
        )?;
        match self.response()? {
            AttMsg::ReadByTypeRsp { length, data_list } => Ok((length, data_list.0)),
            _ => Err(AttError::Codec(Error::InvalidValue)),
        }
    }

    /// Writes `value` to `handle` with an acknowledged *Write Request*.
    pub fn write<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), AttError> {
        if value.len() > usize::from(self.mtu) - 3 {
            return Err(AttError::Param);
        }
        self.request(
            ll,
            &AttMsg::WriteReq {
                handle,
                value: HexSlice(value),
            },
        )?;
        match self.response()? {
            AttMsg::WriteRsp => Ok(()),
            _ => Err(AttError::Codec(Error::InvalidValue)),
        }
    }

    /// Writes `value` to `handle` with an unacknowledged *Write Command*.
    pub fn write_command<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), AttError> {
        if value.len() > usize::from(self.mtu) - 3 {
            return Err(AttError::Param);
        }
        self.send(
            ll,
            &AttMsg::WriteCommand {
                handle,
                value: HexSlice(value),
            },
        )
    }

    /// Enables notifications by writing `0x0001` to the given CCCD handle.
    pub fn enable_notifications<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
        cccd: Handle,
    ) -> Result<(), AttError> {
        self.write(ll, cccd, &[0x01, 0x00])
    }

    /// Runs the receive path once without an outstanding request.
    ///
    /// Delivers any notifications/indications to the registered handler and
    /// returns the Link-Layer event, if one occurred. Applications call
    /// this from their idle loop.
    pub fn poll<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
    ) -> Result<Option<LinkEvent>, AttError> {
        if self.cfm_pending {
            self.try_send_cfm(ll);
        }
        let event = self.pump_once(ll)?;
        if let Some(LinkEvent::Disconnected { .. }) = event {
            self.reset();
        }
        Ok(event)
    }

    /// Issues `msg` as a request and blocks until the matching response,
    /// an `ErrorRsp`, the request timeout, or a disconnect.
    fn request<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
        msg: &AttMsg<'_>,
    ) -> Result<(), AttError> {
        if self.pending.is_some() {
            return Err(AttError::Busy);
        }
        let expected = msg
            .opcode()
            .response_opcode()
            .expect("request() called with a non-request opcode");

        self.rsp_result = None;
        self.send(ll, msg)?;
        self.pending = Some(Pending {
            request: msg.opcode(),
            expected,
        });

        let deadline = ll.now() + REQUEST_TIMEOUT;
        loop {
            if let Some(result) = self.rsp_result.take() {
                return result;
            }
            if ll.now() >= deadline {
                // The pending slot is cleared so a late response is ignored
                // instead of completing a request nobody waits for.
                self.pending = None;
                debug!("ATT request timed out");
                return Err(AttError::Timeout);
            }
            if let Some(LinkEvent::Disconnected { .. }) = self.pump_once(ll)? {
                self.reset();
                return Err(AttError::Disconnected);
            }
        }
    }

    /// Parses the stored response of the last completed request.
    fn response(&self) -> Result<AttMsg<'_>, AttError> {
        Ok(AttMsg::from_bytes(&mut ByteReader::new(
            &self.rsp_buf[..self.rsp_len],
        ))?)
    }

    /// Encodes `msg` and queues it on the Link-Layer, pumping until the TX
    /// buffer accepts it.
    fn send<C: Config>(&mut self, ll: &mut LinkLayer<C>, msg: &AttMsg<'_>) -> Result<(), AttError> {
        let mut pdu = [0; PDU_BUF];
        let mut writer = ByteWriter::new(&mut pdu);
        msg.to_bytes(&mut writer)?;
        let pdu_len = PDU_BUF - writer.space_left();
        if pdu_len > usize::from(self.mtu) {
            return Err(AttError::Param);
        }
        trace!("ATT-> {:?}", msg);

        let mut frame = [0; ASM_BUF];
        let frame_len = l2cap::encode_frame(Channel::ATT, &pdu[..pdu_len], &mut frame)?;

        let deadline = ll.now() + REQUEST_TIMEOUT;
        loop {
            match ll.send_frame(&frame[..frame_len]) {
                Ok(()) => return Ok(()),
                Err(crate::link::LinkError::Busy) => {
                    // Previous message still draining; keep the link moving.
                    if ll.now() >= deadline {
                        return Err(AttError::Timeout);
                    }
                    if let Some(LinkEvent::Disconnected { .. }) = self.pump_once(ll)? {
                        self.reset();
                        return Err(AttError::Disconnected);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Attempts to queue the confirmation for a received indication.
    fn try_send_cfm<C: Config>(&mut self, ll: &mut LinkLayer<C>) {
        let mut frame = [0; l2cap::HEADER_SIZE + 1];
        let len = l2cap::encode_frame(
            Channel::ATT,
            &[Opcode::HandleValueConfirmation.raw()],
            &mut frame,
        )
        .expect("confirmation frame");
        match ll.send_frame(&frame[..len]) {
            Ok(()) => {
                trace!("ATT-> confirmation");
                self.cfm_pending = false;
            }
            Err(_) => {
                // TX busy; retried on the next poll.
            }
        }
    }

    /// Polls the Link-Layer once and routes any completed ATT PDU.
    fn pump_once<C: Config>(
        &mut self,
        ll: &mut LinkLayer<C>,
    ) -> Result<Option<LinkEvent>, AttError> {
        let mut frame_len = None;
        let asm = &mut self.asm;
        let fbuf = &mut self.frame_buf;
        let event = ll.poll(|llid, payload| match asm.push(llid, payload) {
            Ok(Some(frame)) => {
                let n = frame.payload.len().min(fbuf.len());
                fbuf[..n].copy_from_slice(&frame.payload[..n]);
                frame_len = Some(n);
            }
            Ok(None) => {}
            Err(e) => debug!("l2cap reassembly error: {}", e),
        })?;

        if let Some(n) = frame_len {
            self.handle_att_pdu(ll, n);
        }
        Ok(event)
    }

    /// Dispatches one received ATT PDU sitting in `frame_buf`.
    fn handle_att_pdu<C: Config>(&mut self, ll: &mut LinkLayer<C>, n: usize) {
        let msg = match AttMsg::from_bytes(&mut ByteReader::new(&self.frame_buf[..n])) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("undecodable ATT PDU: {}", e);
                return;
            }
        };
        trace!("ATT<- {:?}", msg);

        match msg {
            AttMsg::HandleValueNotification { handle, value } => {
                if let Some(handler) = self.notification_handler {
                    handler(handle, value.0);
                }
            }
            AttMsg::HandleValueIndication { handle, value } => {
                if let Some(handler) = self.notification_handler {
                    handler(handle, value.0);
                }
                self.cfm_pending = true;
                self.try_send_cfm(ll);
            }
            AttMsg::ErrorRsp {
                request_opcode,
                error_code,
                ..
            } => {
                let matches = self
                    .pending
                    .as_ref()
                    .map_or(false, |p| p.request == request_opcode);
                if matches {
                    self.pending = None;
                    self.rsp_result = Some(Err(AttError::Protocol(error_code)));
                } else {
                    debug!("stray ErrorRsp for {:?}", request_opcode);
                }
            }
            other => {
                let opcode = other.opcode();
                let matches = self
                    .pending
                    .as_ref()
                    .map_or(false, |p| p.expected == opcode);
                if matches {
                    self.rsp_buf[..n].copy_from_slice(&self.frame_buf[..n]);
                    self.rsp_len = n;
                    self.pending = None;
                    self.rsp_result = Some(Ok(()));
                } else {
                    debug!("unexpected ATT PDU {:?}", opcode);
                }
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_starts_at_default() {
        let client = Client::new();
        assert_eq!(client.mtu(), 23);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut client = Client::new();
        client.mtu = 185;
        client.cfm_pending = true;
        client.rsp_len = 10;
        client.reset();
        assert_eq!(client.mtu(), ATT_MTU_DEFAULT);
        assert!(!client.cfm_pending);
        assert_eq!(client.rsp_len, 0);
    }
}
