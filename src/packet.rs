// packet.rs - RADIUS packet model and wire codec
//
// A packet owns an ordered list of attribute instances bound to dictionary
// descriptors; insertion order is wire order. Serialization fills in the
// Authenticator field: Access-Request carries the random Request
// Authenticator supplied by the transaction layer, every other request code
// carries MD5(code|id|length|zero16|attrs|secret).

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::dict::{AttrType, DictAttr, Dictionary};
use crate::error::{Error, Result};

/// Maximum RADIUS wire length (RFC 2865)
pub const MAX_PACKET_SIZE: usize = 4096;

/// Fixed header: code, id, length, authenticator
pub const HEADER_SIZE: usize = 20;

/// Longest value fitting a one-byte TLV length
const MAX_ATTR_VALUE: usize = 253;

/// RADIUS packet codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCode {
    /// Access-Request (1)
    AccessRequest = 1,

    /// Access-Accept (2)
    AccessAccept = 2,

    /// Access-Reject (3)
    AccessReject = 3,

    /// Accounting-Request (4)
    AccountingRequest = 4,

    /// Accounting-Response (5)
    AccountingResponse = 5,

    /// Access-Challenge (11)
    AccessChallenge = 11,
}

impl PacketCode {
    /// Convert a u8 to a PacketCode
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::AccessRequest),
            2 => Some(Self::AccessAccept),
            3 => Some(Self::AccessReject),
            4 => Some(Self::AccountingRequest),
            5 => Some(Self::AccountingResponse),
            11 => Some(Self::AccessChallenge),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::AccessRequest => "Access-Request",
            Self::AccessAccept => "Access-Accept",
            Self::AccessReject => "Access-Reject",
            Self::AccountingRequest => "Accounting-Request",
            Self::AccountingResponse => "Accounting-Response",
            Self::AccessChallenge => "Access-Challenge",
        }
    }
}

/// A decoded attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum RadValue {
    Integer(i32),
    String(String),
    /// Opaque payload: hashed passwords, CHAP responses, unknown attributes
    Octets(Vec<u8>),
    /// Seconds since the epoch
    Date(u32),
    IpAddr(Ipv4Addr),
}

impl RadValue {
    fn wire_len(&self) -> usize {
        match self {
            Self::Integer(_) | Self::Date(_) | Self::IpAddr(_) => 4,
            Self::String(s) => s.len(),
            Self::Octets(b) => b.len(),
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ipaddr(&self) -> Option<Ipv4Addr> {
        match self {
            Self::IpAddr(a) => Some(*a),
            _ => None,
        }
    }
}

/// Descriptor an attribute instance is bound to. Replies may carry attributes
/// the dictionary does not know; those stay opaque but keep their wire id.
#[derive(Debug, Clone)]
pub enum AttrDesc {
    Known(Arc<DictAttr>),
    Unknown(u8),
}

impl AttrDesc {
    pub fn id(&self) -> u8 {
        match self {
            Self::Known(a) => a.id,
            Self::Unknown(id) => *id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Known(a) => Some(&a.name),
            Self::Unknown(_) => None,
        }
    }
}

/// An attribute instance inside a packet
#[derive(Debug, Clone)]
pub struct PacketAttr {
    pub desc: AttrDesc,
    pub value: RadValue,
}

/// RADIUS packet
#[derive(Debug, Clone)]
pub struct Packet {
    code: PacketCode,
    id: u8,
    authenticator: [u8; 16],
    attrs: Vec<PacketAttr>,
}

impl Packet {
    pub fn new(code: PacketCode, id: u8) -> Self {
        Self {
            code,
            id,
            authenticator: [0u8; 16],
            attrs: Vec::new(),
        }
    }

    pub fn code(&self) -> PacketCode {
        self.code
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn authenticator(&self) -> &[u8; 16] {
        &self.authenticator
    }

    /// Append an attribute; wire layout follows insertion order.
    pub fn add(&mut self, attr: PacketAttr) {
        self.attrs.push(attr);
    }

    pub fn attrs(&self) -> &[PacketAttr] {
        &self.attrs
    }

    /// First attribute value with the given dictionary name
    pub fn attr(&self, name: &str) -> Option<&RadValue> {
        self.attrs
            .iter()
            .find(|a| a.desc.name() == Some(name))
            .map(|a| &a.value)
    }

    /// Total serialized length
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.attrs.iter().map(|a| 2 + a.value.wire_len()).sum::<usize>()
    }

    /// Serialize the packet.
    ///
    /// `ra` is the random Request Authenticator; it lands in the header
    /// verbatim for Access-Request. For other codes the header carries the
    /// MD5 hash over the packet with a zeroed authenticator field plus the
    /// shared secret. The final authenticator is retained for validating the
    /// eventual reply.
    pub fn build(&mut self, ra: &[u8; 16], secret: &str) -> Result<Bytes> {
        let len = self.wire_len();
        if len > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.code as u8);
        buf.put_u8(self.id);
        buf.put_u16(len as u16);
        if self.code == PacketCode::AccessRequest {
            buf.put_slice(ra);
        } else {
            buf.put_slice(&[0u8; 16]);
        }

        for attr in &self.attrs {
            let value_len = attr.value.wire_len();
            if value_len > MAX_ATTR_VALUE {
                return Err(Error::Protocol(format!(
                    "attribute {} value too long ({value_len} bytes)",
                    attr.desc.id()
                )));
            }
            buf.put_u8(attr.desc.id());
            buf.put_u8((2 + value_len) as u8);
            match &attr.value {
                RadValue::Integer(n) => buf.put_i32(*n),
                RadValue::Date(d) => buf.put_u32(*d),
                RadValue::IpAddr(a) => buf.put_slice(&a.octets()),
                RadValue::String(s) => buf.put_slice(s.as_bytes()),
                RadValue::Octets(b) => buf.put_slice(b),
            }
        }

        if self.code == PacketCode::AccessRequest {
            self.authenticator = *ra;
        } else {
            let mut ctx = md5::Context::new();
            ctx.consume(&buf);
            ctx.consume(secret.as_bytes());
            self.authenticator = ctx.compute().0;
            buf[4..20].copy_from_slice(&self.authenticator);
        }

        Ok(buf.freeze())
    }

    /// Parse a received datagram against the dictionary.
    ///
    /// Unknown attribute ids are preserved as opaque octets. A truncated
    /// header, a length field outside the datagram, or a corrupt TLV fails
    /// the whole packet.
    pub fn decode(data: &[u8], dict: &Dictionary) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "datagram of {} bytes",
                data.len()
            )));
        }
        let code = PacketCode::from_u8(data[0])
            .ok_or_else(|| Error::MalformedPacket(format!("unknown code {}", data[0])))?;
        let id = data[1];
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < HEADER_SIZE || len > data.len() {
            return Err(Error::MalformedPacket(format!("length field {len}")));
        }
        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..20]);

        let mut packet = Self {
            code,
            id,
            authenticator,
            attrs: Vec::new(),
        };

        let payload = &data[HEADER_SIZE..len];
        let mut offset = 0;
        while offset < payload.len() {
            if offset + 2 > payload.len() {
                return Err(Error::MalformedPacket("truncated attribute header".into()));
            }
            let attr_id = payload[offset];
            let attr_len = payload[offset + 1] as usize;
            if attr_len < 2 {
                return Err(Error::MalformedPacket(format!(
                    "attribute {attr_id} length {attr_len}"
                )));
            }
            if offset + attr_len > payload.len() {
                return Err(Error::MalformedPacket(format!(
                    "attribute {attr_id} extends past packet"
                )));
            }
            let value = &payload[offset + 2..offset + attr_len];

            let attr = match dict.find_attr_by_id(attr_id) {
                Some(desc) => PacketAttr {
                    value: decode_value(&desc, value)?,
                    desc: AttrDesc::Known(desc),
                },
                None => PacketAttr {
                    desc: AttrDesc::Unknown(attr_id),
                    value: RadValue::Octets(value.to_vec()),
                },
            };
            packet.attrs.push(attr);
            offset += attr_len;
        }

        Ok(packet)
    }

    /// Diagnostic rendering, e.g. `Access-Request id=7 <User-Name "alice"> <NAS-Port 23>`
    pub fn print(&self) -> String {
        let mut out = format!("{} id={}", self.code.name(), self.id);
        for attr in &self.attrs {
            match attr.desc.name() {
                Some(name) => {
                    let _ = write!(out, " <{} {}>", name, render_value(&attr.desc, &attr.value));
                }
                None => {
                    let _ = write!(
                        out,
                        " <attr{} {}>",
                        attr.desc.id(),
                        render_value(&attr.desc, &attr.value)
                    );
                }
            }
        }
        out
    }
}

/// Compute the Response Authenticator a valid reply must carry:
/// MD5(code|id|length|RequestAuthenticator|attrs|secret).
pub fn response_authenticator(raw: &[u8], request_auth: &[u8; 16], secret: &str) -> [u8; 16] {
    let len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let mut ctx = md5::Context::new();
    ctx.consume(&raw[0..4]);
    ctx.consume(request_auth);
    ctx.consume(&raw[HEADER_SIZE..len]);
    ctx.consume(secret.as_bytes());
    ctx.compute().0
}

fn decode_value(desc: &DictAttr, value: &[u8]) -> Result<RadValue> {
    let fixed = |value: &[u8]| -> Result<[u8; 4]> {
        value.try_into().map_err(|_| {
            Error::MalformedPacket(format!(
                "attribute {} expects 4 bytes, got {}",
                desc.name,
                value.len()
            ))
        })
    };
    Ok(match desc.typ {
        AttrType::Integer => RadValue::Integer(i32::from_be_bytes(fixed(value)?)),
        AttrType::Date => RadValue::Date(u32::from_be_bytes(fixed(value)?)),
        AttrType::IpAddr => RadValue::IpAddr(Ipv4Addr::from(fixed(value)?)),
        // Printable when it really is text; hashed passwords and the like
        // stay opaque.
        AttrType::String => match std::str::from_utf8(value) {
            Ok(s) => RadValue::String(s.to_string()),
            Err(_) => RadValue::Octets(value.to_vec()),
        },
    })
}

fn render_value(desc: &AttrDesc, value: &RadValue) -> String {
    match value {
        RadValue::Integer(n) => {
            // Prefer the dictionary name when the VALUE is known
            if let AttrDesc::Known(attr) = desc {
                if let Some(v) = attr.find_value_by_integer(*n) {
                    return v.name.clone();
                }
            }
            n.to_string()
        }
        RadValue::String(s) => format!("{s:?}"),
        RadValue::Octets(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
        RadValue::Date(d) => chrono::DateTime::from_timestamp(i64::from(*d), 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| d.to_string()),
        RadValue::IpAddr(a) => a.to_string(),
    }
}
