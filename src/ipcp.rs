// ipcp.rs - IPCP option registry and negotiation engine
//
// A generic Configure-Request/Ack/Nak/Reject engine in RFC 1661 vocabulary.
// Option handlers plug in through the IpcpOption trait; the engine walks the
// peer's TLVs, aggregates per-option verdicts into one reply (Reject beats
// Nak beats Ack), enforces the identifier discipline, and bounds the
// exchange with the max-configure and max-failure counters. Send paths never
// suspend: outbound frames are queued and drained by the owning session.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::config::IpcpConfig;
use crate::error::{Error, Result};
use crate::iface::{IfaceBackend, PppUnit};
use crate::ipdb::IpPool;

/// IPCP control codes
pub const CONF_REQ: u8 = 1;
pub const CONF_ACK: u8 = 2;
pub const CONF_NAK: u8 = 3;
pub const CONF_REJ: u8 = 4;
pub const TERM_REQ: u8 = 5;
pub const TERM_ACK: u8 = 6;

/// IP-Address option id
pub const CI_ADDR: u8 = 3;

/// code(1) id(1) length(2)
const FRAME_HEADER: usize = 4;

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    ReqSent,
    AckRcvd,
    AckSent,
    Opened,
    Closing,
}

/// Per-option answer to a peer Configure-Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Nak,
    Reject,
}

/// Everything a handler needs from its enclosing session
pub struct LinkResources {
    pub session: Uuid,
    pub pool: Arc<dyn IpPool>,
    pub iface: Arc<dyn IfaceBackend>,
    pub unit: PppUnit,
    pub fatal_ioctl: bool,
}

/// A negotiable IPCP option.
///
/// `recv_conf_req` must not touch the kernel; side effects belong in
/// `opened`, which the engine calls exactly once on the transition into
/// Opened. `close` runs during teardown and performs any give-back.
pub trait IpcpOption: Send {
    fn id(&self) -> u8;

    /// Serialize our desired TLV. Err means the option cannot be
    /// negotiated at all (e.g. address exhaustion) and declines the layer.
    fn send_conf_req(&mut self, buf: &mut BytesMut) -> Result<()>;

    /// Serialize the TLV we want the peer to use instead
    fn send_conf_nak(&mut self, buf: &mut BytesMut) -> Result<()>;

    /// Evaluate the peer's proposal; `data` is the whole TLV
    fn recv_conf_req(&mut self, data: &[u8]) -> Verdict;

    /// Side effects of the agreed configuration
    fn opened(&mut self) -> Result<()>;

    /// Teardown; runs once, in reverse registration order
    fn close(&mut self);

    /// Diagnostic rendering of a TLV (ours when `data` is None)
    fn print(&self, data: Option<&[u8]>) -> String;
}

type OptionFactory = Box<dyn Fn(&LinkResources) -> Box<dyn IpcpOption> + Send + Sync>;

/// Process-wide handler registry, populated at startup. Registration order
/// is wire order.
#[derive(Default)]
pub struct OptionRegistry {
    factories: Vec<OptionFactory>,
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn(&LinkResources) -> Box<dyn IpcpOption> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    fn instantiate(&self, resources: &LinkResources) -> Vec<Box<dyn IpcpOption>> {
        self.factories.iter().map(|f| f(resources)).collect()
    }
}

/// The per-session IPCP state machine
pub struct Ipcp {
    state: State,
    options: Vec<Box<dyn IpcpOption>>,
    next_id: u8,
    /// Identifier of the last Configure-Request we transmitted. Acks, Naks
    /// and Rejects must echo it; anything else is stale and dropped. It
    /// stays matchable after an ack so a late Nak/Reject of the same
    /// request can still restart negotiation.
    req_id: Option<u8>,
    conf_count: u32,
    fail_count: u32,
    max_configure: u32,
    max_failure: u32,
    out: VecDeque<Bytes>,
    closed: bool,
}

impl Ipcp {
    pub fn new(config: &IpcpConfig, registry: &OptionRegistry, resources: &LinkResources) -> Self {
        Self {
            state: State::Initial,
            options: registry.instantiate(resources),
            next_id: 0,
            req_id: None,
            conf_count: 0,
            fail_count: 0,
            max_configure: config.max_configure,
            max_failure: config.max_failure,
            out: VecDeque::new(),
            closed: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Lower layer came up: emit our first Configure-Request
    pub fn open(&mut self) -> Result<()> {
        if self.state == State::Initial {
            self.send_conf_req()?;
            self.state = State::ReqSent;
        }
        Ok(())
    }

    /// Lower layer went down, or the session is being torn down
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = State::Closing;
        for opt in self.options.iter_mut().rev() {
            opt.close();
        }
    }

    /// Restart timer fired: retransmit while still converging
    pub fn timeout(&mut self) -> Result<()> {
        match self.state {
            State::ReqSent | State::AckRcvd | State::AckSent => self.send_conf_req(),
            _ => Ok(()),
        }
    }

    /// Queued outbound frames, oldest first
    pub fn take_output(&mut self) -> Vec<Bytes> {
        self.out.drain(..).collect()
    }

    /// Process one received IPCP frame.
    ///
    /// Malformed frames and unknown codes are logged and dropped; an error
    /// here means the layer itself failed (exhaustion, non-convergence) and
    /// the engine has already moved to Closing.
    pub fn input(&mut self, frame: &[u8]) -> Result<()> {
        if self.state == State::Closing {
            return Ok(());
        }
        if frame.len() < FRAME_HEADER {
            tracing::warn!(len = frame.len(), "runt ipcp frame dropped");
            return Ok(());
        }
        let code = frame[0];
        let id = frame[1];
        let len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        if len < FRAME_HEADER || len > frame.len() {
            tracing::warn!(len, avail = frame.len(), "bad ipcp length field, frame dropped");
            return Ok(());
        }
        let payload = &frame[FRAME_HEADER..len];

        match code {
            CONF_REQ => self.recv_conf_req(id, payload),
            CONF_ACK => self.recv_conf_ack(id),
            CONF_NAK | CONF_REJ => self.recv_conf_nak_rej(code, id, payload),
            TERM_REQ => {
                tracing::info!(id, "terminate request from peer");
                self.send_frame(TERM_ACK, id, &[]);
                self.close();
                Ok(())
            }
            TERM_ACK => Ok(()),
            _ => {
                tracing::debug!(code, "unknown ipcp code dropped");
                Ok(())
            }
        }
    }

    fn recv_conf_req(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        tracing::debug!(id, options = %self.render_tlvs(payload), "recv conf-req");
        match self.state {
            State::Initial => {
                // Peer started first; put our own proposal on the wire too.
                self.send_conf_req()?;
                let acked = self.reply_conf_req(id, payload)?;
                self.state = if acked { State::AckSent } else { State::ReqSent };
            }
            State::ReqSent => {
                if self.reply_conf_req(id, payload)? {
                    self.state = State::AckSent;
                }
            }
            State::AckRcvd => {
                if self.reply_conf_req(id, payload)? {
                    self.enter_opened()?;
                }
            }
            State::AckSent => {
                if !self.reply_conf_req(id, payload)? {
                    self.state = State::ReqSent;
                }
            }
            State::Opened => {
                // Renegotiation: both sides start over.
                self.send_conf_req()?;
                let acked = self.reply_conf_req(id, payload)?;
                self.state = if acked { State::AckSent } else { State::ReqSent };
            }
            State::Closing => {}
        }
        Ok(())
    }

    fn recv_conf_ack(&mut self, id: u8) -> Result<()> {
        if self.req_id != Some(id) {
            tracing::debug!(id, outstanding = ?self.req_id, "stale conf-ack dropped");
            return Ok(());
        }
        self.conf_count = 0;
        match self.state {
            State::ReqSent => self.state = State::AckRcvd,
            State::AckSent => self.enter_opened()?,
            _ => {}
        }
        Ok(())
    }

    fn recv_conf_nak_rej(&mut self, code: u8, id: u8, payload: &[u8]) -> Result<()> {
        if self.req_id != Some(id) {
            tracing::debug!(id, outstanding = ?self.req_id, "stale conf-nak/rej dropped");
            return Ok(());
        }
        let kind = if code == CONF_NAK { "nak" } else { "reject" };
        tracing::debug!(id, kind, options = %self.render_tlvs(payload), "peer declined our conf-req");
        match self.state {
            State::ReqSent | State::AckSent => self.send_conf_req(),
            State::AckRcvd => {
                self.state = State::ReqSent;
                self.send_conf_req()
            }
            State::Opened => {
                self.state = State::ReqSent;
                self.send_conf_req()
            }
            _ => Ok(()),
        }
    }

    /// Walk the peer's TLVs, let each handler judge its option, and send the
    /// aggregate reply. Returns whether the reply was a Configure-Ack.
    fn reply_conf_req(&mut self, id: u8, payload: &[u8]) -> Result<bool> {
        let (tlvs, trailer) = split_tlvs(payload);

        let mut rejected: Vec<&[u8]> = Vec::new();
        let mut naked: Vec<usize> = Vec::new();

        for tlv in &tlvs {
            match self.options.iter().position(|o| o.id() == tlv[0]) {
                Some(idx) => match self.options[idx].recv_conf_req(tlv) {
                    Verdict::Ack => {}
                    Verdict::Nak => naked.push(idx),
                    Verdict::Reject => rejected.push(tlv),
                },
                None => rejected.push(tlv),
            }
        }
        if let Some(rest) = trailer {
            tracing::warn!(len = rest.len(), "malformed option trailer rejected");
            rejected.push(rest);
        }

        if !rejected.is_empty() {
            let mut reply = BytesMut::new();
            for tlv in rejected {
                reply.put_slice(tlv);
            }
            self.send_frame(CONF_REJ, id, &reply);
            return Ok(false);
        }

        if !naked.is_empty() {
            if self.fail_count >= self.max_failure {
                // The peer is not moving toward us; reject to force
                // convergence instead of naking forever.
                tracing::warn!(count = self.fail_count, "max failure reached, rejecting");
                let mut reply = BytesMut::new();
                for idx in naked {
                    let id_byte = self.options[idx].id();
                    for tlv in &tlvs {
                        if tlv[0] == id_byte {
                            reply.put_slice(tlv);
                        }
                    }
                }
                self.send_frame(CONF_REJ, id, &reply);
                return Ok(false);
            }
            self.fail_count += 1;
            let mut reply = BytesMut::new();
            for idx in naked {
                if let Err(e) = self.options[idx].send_conf_nak(&mut reply) {
                    tracing::warn!(error = %e, "cannot assemble conf-nak, declining layer");
                    self.close();
                    return Err(e);
                }
            }
            self.send_frame(CONF_NAK, id, &reply);
            return Ok(false);
        }

        self.fail_count = 0;
        self.send_frame(CONF_ACK, id, payload);
        Ok(true)
    }

    fn send_conf_req(&mut self) -> Result<()> {
        if self.conf_count >= self.max_configure {
            tracing::warn!(count = self.conf_count, "max configure reached, declining layer");
            self.close();
            return Err(Error::Protocol("configure requests exhausted".into()));
        }
        self.conf_count += 1;

        let mut payload = BytesMut::new();
        for opt in &mut self.options {
            if let Err(e) = opt.send_conf_req(&mut payload) {
                tracing::warn!(error = %e, "cannot assemble conf-req, declining layer");
                self.close();
                return Err(e);
            }
        }

        let id = self.next_identifier();
        self.req_id = Some(id);
        tracing::debug!(id, "send conf-req");
        self.send_frame(CONF_REQ, id, &payload);
        Ok(())
    }

    fn enter_opened(&mut self) -> Result<()> {
        self.state = State::Opened;
        self.conf_count = 0;
        tracing::info!("ipcp opened");
        for opt in &mut self.options {
            if let Err(e) = opt.opened() {
                tracing::error!(error = %e, "layer-up side effects failed");
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    fn next_identifier(&mut self) -> u8 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn send_frame(&mut self, code: u8, id: u8, payload: &[u8]) {
        let len = FRAME_HEADER + payload.len();
        let mut frame = BytesMut::with_capacity(len);
        frame.put_u8(code);
        frame.put_u8(id);
        frame.put_u16(len as u16);
        frame.put_slice(payload);
        self.out.push_back(frame.freeze());
    }

    fn render_tlvs(&self, payload: &[u8]) -> String {
        let (tlvs, trailer) = split_tlvs(payload);
        let mut parts: Vec<String> = Vec::new();
        for tlv in tlvs {
            match self.options.iter().find(|o| o.id() == tlv[0]) {
                Some(opt) => parts.push(opt.print(Some(tlv))),
                None => parts.push(format!("<opt{} len {}>", tlv[0], tlv[1])),
            }
        }
        if trailer.is_some() {
            parts.push("<malformed>".into());
        }
        parts.join(" ")
    }
}

impl Drop for Ipcp {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split an option payload into whole TLVs plus an optional malformed tail
fn split_tlvs(payload: &[u8]) -> (Vec<&[u8]>, Option<&[u8]>) {
    let mut tlvs = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        if offset + 2 > payload.len() {
            return (tlvs, Some(&payload[offset..]));
        }
        let len = payload[offset + 1] as usize;
        if len < 2 || offset + len > payload.len() {
            return (tlvs, Some(&payload[offset..]));
        }
        tlvs.push(&payload[offset..offset + len]);
        offset += len;
    }
    (tlvs, None)
}
