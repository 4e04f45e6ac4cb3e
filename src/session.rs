// session.rs - per-session orchestration
//
// A session authenticates the peer over RADIUS, then brings IPCP up and
// drains the engine's outbound frames to the tunnel transport. All calls on
// one session happen on its owning task, so there is no internal locking;
// RADIUS requests are strictly sequential within a session.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::RadReq;
use crate::config::Config;
use crate::dict::Dictionary;
use crate::error::{Error, Result};
use crate::iface::{IfaceBackend, PppUnit};
use crate::ipaddr;
use crate::ipcp::{Ipcp, LinkResources, OptionRegistry, State};
use crate::ipdb::{IpPool, RangePool, SessionIpSource};
use crate::packet::{PacketCode, RadValue};

/// Service-Type Framed-User
const SERVICE_TYPE_FRAMED: i32 = 2;

/// Framed-Protocol PPP
const FRAMED_PROTOCOL_PPP: i32 = 1;

/// Acct-Status-Type values
const ACCT_STATUS_START: i32 = 1;
const ACCT_STATUS_STOP: i32 = 2;

/// Identity of one session toward the RADIUS layer
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    /// NAS-Port; follows the PPP unit index
    pub nas_port: u32,
}

/// Attributes an Access-Accept may pin for the session
#[derive(Debug, Clone, Default)]
pub struct AcceptAttrs {
    pub framed_ip: Option<Ipv4Addr>,
    pub session_timeout: Option<u32>,
    pub filter_id: Option<String>,
}

/// Authentication outcome
#[derive(Debug, Clone)]
pub enum AuthResult {
    Accept(AcceptAttrs),
    Reject { reason: String },
}

/// Seam between sessions and the RADIUS transaction layer
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        session: &SessionInfo,
        username: &str,
        password: &str,
    ) -> Result<AuthResult>;

    async fn account_start(&self, session: &SessionInfo, username: &str) -> Result<()>;

    async fn account_stop(&self, session: &SessionInfo, username: &str) -> Result<()>;
}

/// RADIUS-backed authenticator
pub struct RadiusAuth {
    config: Arc<Config>,
    dict: Arc<Dictionary>,
}

impl RadiusAuth {
    pub fn new(config: Arc<Config>, dict: Arc<Dictionary>) -> Self {
        Self { config, dict }
    }

    fn base_request(&self, code: PacketCode, username: &str) -> Result<RadReq> {
        RadReq::new(self.dict.clone(), &self.config.radius, code, username)
    }

    fn add_nas_identity(&self, req: &mut RadReq) -> Result<()> {
        if let Some(id) = &self.config.radius.nas_identifier {
            req.add_str("NAS-Identifier", id)?;
        }
        if let Some(addr) = self.config.radius.nas_ip_address {
            req.add_ipaddr("NAS-IP-Address", addr)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for RadiusAuth {
    async fn authenticate(
        &self,
        session: &SessionInfo,
        username: &str,
        password: &str,
    ) -> Result<AuthResult> {
        let mut req = self.base_request(PacketCode::AccessRequest, username)?;
        let hidden = pap_hide(
            &self.config.radius.secret,
            req.request_authenticator(),
            password.as_bytes(),
        );
        req.add_octets("User-Password", &hidden)?;
        req.add_int("Service-Type", SERVICE_TYPE_FRAMED)?;
        req.add_int("Framed-Protocol", FRAMED_PROTOCOL_PPP)?;
        req.add_int("NAS-Port", session.nas_port as i32)?;
        self.add_nas_identity(&mut req)?;

        let reply = req.exchange().await?;
        match reply.code() {
            PacketCode::AccessAccept => {
                let attrs = AcceptAttrs {
                    framed_ip: reply.attr("Framed-IP-Address").and_then(RadValue::as_ipaddr),
                    session_timeout: reply
                        .attr("Session-Timeout")
                        .and_then(RadValue::as_integer)
                        .map(|n| n as u32),
                    filter_id: reply
                        .attr("Filter-Id")
                        .and_then(RadValue::as_str)
                        .map(str::to_owned),
                };
                Ok(AuthResult::Accept(attrs))
            }
            PacketCode::AccessReject => {
                let reason = reply
                    .attr("Reply-Message")
                    .and_then(RadValue::as_str)
                    .unwrap_or("access denied")
                    .to_string();
                Ok(AuthResult::Reject { reason })
            }
            PacketCode::AccessChallenge => Ok(AuthResult::Reject {
                reason: "challenge authentication not supported".into(),
            }),
            other => Err(Error::Protocol(format!(
                "unexpected reply to Access-Request: {other:?}"
            ))),
        }
    }

    async fn account_start(&self, session: &SessionInfo, username: &str) -> Result<()> {
        let mut req = self.base_request(PacketCode::AccountingRequest, username)?;
        req.add_int("Acct-Status-Type", ACCT_STATUS_START)?;
        req.add_str("Acct-Session-Id", &session.id.to_string())?;
        req.add_int("NAS-Port", session.nas_port as i32)?;
        self.add_nas_identity(&mut req)?;
        let reply = req.exchange().await?;
        if reply.code() != PacketCode::AccountingResponse {
            return Err(Error::Protocol(format!(
                "unexpected reply to Accounting-Request: {:?}",
                reply.code()
            )));
        }
        Ok(())
    }

    async fn account_stop(&self, session: &SessionInfo, username: &str) -> Result<()> {
        let mut req = self.base_request(PacketCode::AccountingRequest, username)?;
        req.add_int("Acct-Status-Type", ACCT_STATUS_STOP)?;
        req.add_str("Acct-Session-Id", &session.id.to_string())?;
        req.add_int("NAS-Port", session.nas_port as i32)?;
        self.add_nas_identity(&mut req)?;
        let reply = req.exchange().await?;
        if reply.code() != PacketCode::AccountingResponse {
            return Err(Error::Protocol(format!(
                "unexpected reply to Accounting-Request: {:?}",
                reply.code()
            )));
        }
        Ok(())
    }
}

/// Hide a PAP password for the User-Password attribute (RFC 2865 §5.2):
/// the padded password is XORed blockwise with a chained MD5 keystream
/// seeded by the shared secret and the Request Authenticator.
pub fn pap_hide(secret: &str, ra: &[u8; 16], password: &[u8]) -> Vec<u8> {
    let blocks = password.len().div_ceil(16).max(1);
    let mut padded = password.to_vec();
    padded.resize(blocks * 16, 0);

    let mut out = Vec::with_capacity(padded.len());
    let mut seed: Vec<u8> = ra.to_vec();
    for block in padded.chunks(16) {
        let mut ctx = md5::Context::new();
        ctx.consume(secret.as_bytes());
        ctx.consume(&seed);
        let key = ctx.compute().0;
        let cipher: Vec<u8> = block.iter().zip(key.iter()).map(|(p, k)| p ^ k).collect();
        seed = cipher.clone();
        out.extend_from_slice(&cipher);
    }
    out
}

/// Shared state of the concentrator: configuration, dictionary, pool,
/// kernel surface, option registry, and the authenticator every session
/// talks through.
pub struct Concentrator {
    config: Arc<Config>,
    dict: Arc<Dictionary>,
    pool: Arc<dyn IpPool>,
    iface: Arc<dyn IfaceBackend>,
    registry: Arc<OptionRegistry>,
    auth: Arc<dyn Authenticator>,
}

impl Concentrator {
    pub fn new(config: Config, dict: Dictionary, iface: Arc<dyn IfaceBackend>) -> Self {
        let config = Arc::new(config);
        let dict = Arc::new(dict);
        let pool = Arc::new(RangePool::new(
            config.pool.gateway,
            config.pool.first,
            config.pool.last,
        ));
        let mut registry = OptionRegistry::new();
        ipaddr::register(&mut registry);
        let auth = Arc::new(RadiusAuth::new(config.clone(), dict.clone()));
        Self {
            config,
            dict,
            pool,
            iface,
            registry: Arc::new(registry),
            auth,
        }
    }

    /// Swap the authenticator (tests plug a stub in here)
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    /// Open a session on a PPP unit. `tx` carries outbound IPCP frames to
    /// the tunnel transport.
    pub fn open_session(&self, unit: PppUnit, tx: mpsc::UnboundedSender<Bytes>) -> Session {
        let info = SessionInfo {
            id: Uuid::new_v4(),
            nas_port: unit.index,
        };
        tracing::info!(session = %info.id, device = %unit.name(), "session opened");
        Session {
            info,
            username: None,
            config: self.config.clone(),
            auth: self.auth.clone(),
            pool: self.pool.clone(),
            iface: self.iface.clone(),
            registry: self.registry.clone(),
            unit,
            accept: None,
            ipcp: None,
            accounted: false,
            tx,
        }
    }
}

/// One PPP session bound to a kernel unit
pub struct Session {
    info: SessionInfo,
    username: Option<String>,
    config: Arc<Config>,
    auth: Arc<dyn Authenticator>,
    pool: Arc<dyn IpPool>,
    iface: Arc<dyn IfaceBackend>,
    registry: Arc<OptionRegistry>,
    unit: PppUnit,
    accept: Option<AcceptAttrs>,
    ipcp: Option<Ipcp>,
    accounted: bool,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn ipcp_state(&self) -> Option<State> {
        self.ipcp.as_ref().map(Ipcp::state)
    }

    /// Session-Timeout from the Access-Accept, if the server pinned one
    pub fn session_timeout(&self) -> Option<Duration> {
        self.accept
            .as_ref()
            .and_then(|a| a.session_timeout)
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }

    pub fn filter_id(&self) -> Option<&str> {
        self.accept.as_ref().and_then(|a| a.filter_id.as_deref())
    }

    /// Authenticate the peer. Must complete before the network layer
    /// comes up.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        match self.auth.authenticate(&self.info, username, password).await? {
            AuthResult::Accept(attrs) => {
                tracing::info!(session = %self.info.id, username, "authenticated");
                self.username = Some(username.to_string());
                self.accept = Some(attrs);
                Ok(())
            }
            AuthResult::Reject { reason } => {
                tracing::warn!(session = %self.info.id, username, reason, "authentication failed");
                Err(Error::AccessRejected(reason))
            }
        }
    }

    /// LCP reached Opened underneath us: bring IPCP up
    pub async fn lcp_up(&mut self) -> Result<()> {
        let accept = self
            .accept
            .as_ref()
            .ok_or_else(|| Error::Protocol("network phase before authentication".into()))?;

        let source = Arc::new(SessionIpSource::new(
            self.pool.clone(),
            self.config.pool.gateway,
            accept.framed_ip,
        ));
        let resources = LinkResources {
            session: self.info.id,
            pool: source,
            iface: self.iface.clone(),
            unit: self.unit,
            fatal_ioctl: self.config.iface.fatal_errors,
        };
        let mut ipcp = Ipcp::new(&self.config.ipcp, &self.registry, &resources);
        let opened = ipcp.open();
        self.flush(&mut ipcp);
        self.ipcp = Some(ipcp);
        opened?;

        if let Some(username) = self.username.clone() {
            // Accounting is best effort; a missing accounting server must
            // not take the session down.
            match self.auth.account_start(&self.info, &username).await {
                Ok(()) => self.accounted = true,
                Err(e) => {
                    tracing::warn!(session = %self.info.id, error = %e, "accounting start failed")
                }
            }
        }
        Ok(())
    }

    /// One received IPCP frame from the tunnel
    pub fn ipcp_input(&mut self, frame: &[u8]) -> Result<()> {
        let Some(mut ipcp) = self.ipcp.take() else {
            tracing::debug!(session = %self.info.id, "ipcp frame before network phase dropped");
            return Ok(());
        };
        let result = ipcp.input(frame);
        self.flush(&mut ipcp);
        self.ipcp = Some(ipcp);
        result
    }

    /// Restart timer tick from the session loop
    pub fn restart_tick(&mut self) -> Result<()> {
        let Some(mut ipcp) = self.ipcp.take() else {
            return Ok(());
        };
        let result = ipcp.timeout();
        self.flush(&mut ipcp);
        self.ipcp = Some(ipcp);
        result
    }

    /// Tear the session down: close IPCP (handlers give their lease back),
    /// flush the terminate traffic, and emit the accounting stop.
    pub async fn terminate(&mut self) {
        if let Some(mut ipcp) = self.ipcp.take() {
            ipcp.close();
            self.flush(&mut ipcp);
        }
        if self.accounted {
            if let Some(username) = self.username.clone() {
                if let Err(e) = self.auth.account_stop(&self.info, &username).await {
                    tracing::warn!(session = %self.info.id, error = %e, "accounting stop failed");
                }
            }
            self.accounted = false;
        }
        tracing::info!(session = %self.info.id, "session closed");
    }

    fn flush(&self, ipcp: &mut Ipcp) {
        for frame in ipcp.take_output() {
            if self.tx.send(frame).is_err() {
                tracing::debug!(session = %self.info.id, "tunnel transport gone, frame dropped");
            }
        }
    }
}
