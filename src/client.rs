// client.rs - RADIUS request/reply transaction client
//
// A request owns its packet, its Request Authenticator, and its socket. The
// serialized buffer is built once and retransmitted byte-identical (same id,
// same authenticator) until a valid reply arrives or the attempts are
// exhausted. Each in-flight request is an independent cooperative task;
// dropping it closes the socket, so a late reply has nowhere to land.

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, RngCore};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::config::RadiusConfig;
use crate::dict::{AttrType, DictAttr, Dictionary};
use crate::error::{Error, Result};
use crate::packet::{
    response_authenticator, AttrDesc, Packet, PacketAttr, PacketCode, RadValue, MAX_PACKET_SIZE,
};

/// An outbound RADIUS transaction
pub struct RadReq {
    packet: Packet,
    ra: [u8; 16],
    server: String,
    secret: String,
    timeout: Duration,
    max_try: u32,
    verbose: bool,
    dict: Arc<Dictionary>,
}

impl RadReq {
    /// Initialize a request with a code and the User-Name attribute.
    ///
    /// Accounting codes target the accounting server, everything else the
    /// authentication server.
    pub fn new(
        dict: Arc<Dictionary>,
        config: &RadiusConfig,
        code: PacketCode,
        username: &str,
    ) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let mut ra = [0u8; 16];
        rng.fill_bytes(&mut ra);

        let server = match code {
            PacketCode::AccountingRequest => config.acct_server.clone(),
            _ => config.auth_server.clone(),
        };

        let mut req = Self {
            packet: Packet::new(code, rng.gen()),
            ra,
            server,
            secret: config.secret.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_try: config.max_try,
            verbose: config.verbose,
            dict,
        };
        req.add_str("User-Name", username)?;
        Ok(req)
    }

    /// Override the retransmission schedule (mainly for tests)
    pub fn timing(mut self, timeout: Duration, max_try: u32) -> Self {
        self.timeout = timeout;
        self.max_try = max_try;
        self
    }

    /// The Request Authenticator this transaction was created with.
    ///
    /// Needed by callers hiding a PAP password before adding it.
    pub fn request_authenticator(&self) -> &[u8; 16] {
        &self.ra
    }

    pub fn id(&self) -> u8 {
        self.packet.id()
    }

    /// Add an integer attribute by dictionary name
    pub fn add_int(&mut self, name: &str, value: i32) -> Result<()> {
        let desc = self.descriptor(name, Some(AttrType::Integer))?;
        self.packet.add(PacketAttr {
            desc: AttrDesc::Known(desc),
            value: RadValue::Integer(value),
        });
        Ok(())
    }

    /// Add a printable string attribute by dictionary name
    pub fn add_str(&mut self, name: &str, value: &str) -> Result<()> {
        let desc = self.descriptor(name, Some(AttrType::String))?;
        self.packet.add(PacketAttr {
            desc: AttrDesc::Known(desc),
            value: RadValue::String(value.to_string()),
        });
        Ok(())
    }

    /// Add an ipaddr attribute by dictionary name
    pub fn add_ipaddr(&mut self, name: &str, value: std::net::Ipv4Addr) -> Result<()> {
        let desc = self.descriptor(name, Some(AttrType::IpAddr))?;
        self.packet.add(PacketAttr {
            desc: AttrDesc::Known(desc),
            value: RadValue::IpAddr(value),
        });
        Ok(())
    }

    /// Add an opaque binary value by dictionary name.
    ///
    /// Used for hashed passwords and CHAP responses; no type check is
    /// applied because the blob bypasses the attribute's semantic encoding.
    pub fn add_octets(&mut self, name: &str, value: &[u8]) -> Result<()> {
        let desc = self.descriptor(name, None)?;
        self.packet.add(PacketAttr {
            desc: AttrDesc::Known(desc),
            value: RadValue::Octets(value.to_vec()),
        });
        Ok(())
    }

    fn descriptor(&self, name: &str, expect: Option<AttrType>) -> Result<Arc<DictAttr>> {
        let desc = self
            .dict
            .find_attr(name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))?;
        if let Some(typ) = expect {
            if desc.typ != typ {
                return Err(Error::AttributeType {
                    attr: name.to_string(),
                    expected: typ.keyword(),
                });
            }
        }
        Ok(desc)
    }

    /// Send the request and wait for a valid reply.
    ///
    /// Retransmits the identical buffer every `timeout` until `max_try`
    /// datagrams have been sent; invalid and stale datagrams are dropped
    /// without consuming an attempt. Consumes the request: its socket closes
    /// on return and replies arriving after that are lost.
    pub async fn exchange(mut self) -> Result<Packet> {
        let buf = self.packet.build(&self.ra, &self.secret)?;
        // The wire authenticator, not `ra`: for non-Access-Request codes the
        // reply is hashed over the MD5 the request actually carried.
        let request_auth = *self.packet.authenticator();

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let sock_ref = socket2::Socket::from(socket.into_std()?);
        sock_ref.set_recv_buffer_size(256 * 1024)?;
        let socket = UdpSocket::from_std(sock_ref.into())?;
        // connect() pins the peer; datagrams from any other source never
        // reach recv().
        socket.connect(&self.server).await?;

        let mut rbuf = vec![0u8; MAX_PACKET_SIZE];
        for attempt in 1..=self.max_try {
            socket.send(&buf).await?;
            if self.verbose {
                tracing::info!(server = %self.server, attempt, packet = %self.packet.print(), "radius send");
            } else {
                tracing::debug!(server = %self.server, attempt, id = self.packet.id(), "radius send");
            }

            let deadline = Instant::now() + self.timeout;
            loop {
                let n = match timeout_at(deadline, socket.recv(&mut rbuf)).await {
                    Err(_) => break, // timer fired, retransmit
                    Ok(recvd) => recvd?,
                };
                if let Some(reply) = self.validate(&rbuf[..n], &request_auth) {
                    if self.verbose {
                        tracing::info!(server = %self.server, packet = %reply.print(), "radius recv");
                    }
                    return Ok(reply);
                }
            }
        }

        tracing::warn!(server = %self.server, attempts = self.max_try, "radius request timed out");
        Err(Error::Timeout {
            server: self.server,
            attempts: self.max_try,
        })
    }

    /// Accept a datagram iff its id matches, its Response Authenticator
    /// checks out, and it decodes. Anything else is dropped silently (debug
    /// logged) so a forged or stale datagram cannot consume the attempt.
    fn validate(&self, data: &[u8], request_auth: &[u8; 16]) -> Option<Packet> {
        if data.len() < 20 {
            tracing::debug!(len = data.len(), "runt datagram dropped");
            return None;
        }
        if data[1] != self.packet.id() {
            tracing::debug!(got = data[1], want = self.packet.id(), "stale reply dropped");
            return None;
        }
        let reply = match Packet::decode(data, &self.dict) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "malformed reply dropped");
                return None;
            }
        };
        let expected = response_authenticator(data, request_auth, &self.secret);
        if expected != *reply.authenticator() {
            tracing::debug!(id = reply.id(), "reply with bad authenticator dropped");
            return None;
        }
        Some(reply)
    }
}
