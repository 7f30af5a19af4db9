//! Textual control messages exchanged on the reserved control channel
//!
//! A message is `'U' '\b' <tag>` followed by `\f`-separated fields. Channel
//! numbers are always written from the receiver's point of view: field 1 is
//! the number the receiver writes on, field 2 the number it reads from.
//!
//! Requests carry at least eight fields, responses three (five for a
//! successful UDP association). An input number of `-1` in a response
//! reports failure.

use super::packet::MAX_CHANNEL_NUMBER;
use crate::error::{Result, TunnelError};
use crate::mux::ChannelType;
use crate::transport::{ProxyKind, ProxySpec};
use std::fmt::Write as _;
use std::str::FromStr;

/// Leading byte of every control message
pub const MESSAGE_PREFIX: char = 'U';

/// Mark byte following the prefix
pub const MESSAGE_MARK: char = '\x08';

/// Field separator
pub const FIELD_SEPARATOR: char = '\x0c';

/// Placeholder for an empty field
pub const EMPTY_FIELD: &str = "*";

/// Minimum field count of a request
pub const REQUEST_MIN_FIELDS: usize = 8;

/// Minimum field count of a response
pub const RESPONSE_MIN_FIELDS: usize = 3;

/// Tunnel type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// Plain TCP connect or accept
    Tcp,
    /// SOCKS5 server on the responder side
    Socks,
    /// UDP association
    Udp,
}

impl TunnelKind {
    /// Wire tag character
    pub fn tag(self) -> char {
        match self {
            TunnelKind::Tcp => 'T',
            TunnelKind::Socks => 'S',
            TunnelKind::Udp => 'U',
        }
    }

    /// Parse a wire tag character
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'T' => Some(TunnelKind::Tcp),
            'S' => Some(TunnelKind::Socks),
            'U' => Some(TunnelKind::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelKind::Tcp => "tcp",
            TunnelKind::Socks => "socks",
            TunnelKind::Udp => "udp",
        };
        f.write_str(name)
    }
}

/// What the responder should do with the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// Dial (or listen on) `host:port`; used by TCP and UDP tunnels
    Endpoint { host: String, port: u16 },
    /// Serve SOCKS5 with optional credentials
    Socks {
        username: Option<String>,
        password: Option<String>,
    },
}

/// Tunnel request sent by the originator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub tunnel: TunnelKind,
    pub channel_type: ChannelType,
    /// Number the receiver writes on
    pub output_number: u32,
    /// Number the receiver reads from
    pub input_number: u32,
    /// Connect/accept timeout in milliseconds, 0 = none
    pub connect_timeout_ms: u64,
    /// Idle read timeout in milliseconds, 0 = none
    pub data_timeout_ms: u64,
    /// Local bind address for outbound dials
    pub bind: String,
    pub target: RequestTarget,
    pub proxy: ProxySpec,
}

/// Outcome reported by the responder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResponse {
    pub tunnel: TunnelKind,
    pub channel_type: ChannelType,
    /// Number the receiver writes on; keys the pending session
    pub output_number: u32,
    /// Number the receiver reads from, `None` on failure
    pub input_number: Option<u32>,
    /// Responder-side address, sent by UDP associations
    pub remote: Option<(String, u16)>,
}

impl TunnelResponse {
    /// Whether the remote side established the session
    pub fn is_success(&self) -> bool {
        self.input_number.is_some()
    }
}

/// Any control channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Request(TunnelRequest),
    Response(TunnelResponse),
}

fn field_or_empty(value: &str) -> &str {
    if value.is_empty() {
        EMPTY_FIELD
    } else {
        value
    }
}

fn empty_if_placeholder(value: &str) -> String {
    if value == EMPTY_FIELD {
        String::new()
    } else {
        value.to_string()
    }
}

fn credential(value: &Option<String>) -> &str {
    value.as_deref().map(field_or_empty).unwrap_or(EMPTY_FIELD)
}

fn parse_num<T: FromStr>(fields: &[&str], index: usize, name: &str) -> Result<T> {
    fields
        .get(index)
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| TunnelError::Negotiation(format!("invalid {} field", name)))
}

/// Channel number field, rejected outside the 24-bit channel space
fn parse_channel(fields: &[&str], index: usize, name: &str) -> Result<u32> {
    let number: i64 = parse_num(fields, index, name)?;
    u32::try_from(number)
        .ok()
        .filter(|n| *n <= MAX_CHANNEL_NUMBER)
        .ok_or_else(|| TunnelError::Negotiation(format!("{} {} out of range", name, number)))
}

fn optional(fields: &[&str], index: usize) -> Option<String> {
    match fields.get(index) {
        Some(v) if !v.is_empty() && *v != EMPTY_FIELD => Some(v.to_string()),
        _ => None,
    }
}

impl ControlMessage {
    /// Encode as the text record written on the control channel
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(MESSAGE_PREFIX);
        out.push(MESSAGE_MARK);
        let sep = FIELD_SEPARATOR;

        match self {
            ControlMessage::Request(req) => {
                let _ = write!(
                    out,
                    "{}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}",
                    req.tunnel.tag(),
                    req.channel_type.bits(),
                    req.output_number,
                    req.input_number,
                    req.connect_timeout_ms,
                    req.data_timeout_ms,
                    field_or_empty(&req.bind),
                );
                match &req.target {
                    RequestTarget::Endpoint { host, port } => {
                        let _ = write!(out, "{}{sep}{}", field_or_empty(host), port);
                    }
                    RequestTarget::Socks { username, password } => {
                        let _ = write!(out, "{}{sep}{}", credential(username), credential(password));
                    }
                }
                let proxy = &req.proxy;
                let _ = write!(
                    out,
                    "{sep}{}{sep}{}{sep}{}",
                    proxy.kind.letter(),
                    field_or_empty(&proxy.host),
                    proxy.port
                );
                match (&proxy.username, &proxy.password) {
                    (Some(user), password) => {
                        let _ = write!(
                            out,
                            "{sep}{}{sep}{}",
                            field_or_empty(user),
                            credential(password)
                        );
                    }
                    (None, _) => {
                        let _ = write!(out, "{sep}{EMPTY_FIELD}{sep}{EMPTY_FIELD}{sep}{EMPTY_FIELD}");
                    }
                }
            }
            ControlMessage::Response(resp) => {
                let input = resp.input_number.map(i64::from).unwrap_or(-1);
                let _ = write!(
                    out,
                    "{}{}{sep}{}{sep}{}",
                    resp.tunnel.tag(),
                    resp.channel_type.bits(),
                    resp.output_number,
                    input
                );
                if let Some((host, port)) = &resp.remote {
                    let _ = write!(out, "{sep}{}{sep}{}", field_or_empty(host), port);
                }
            }
        }
        out
    }

    /// Parse one text record
    ///
    /// Fails with [`TunnelError::Negotiation`] on anything malformed; the
    /// control task drops such messages and keeps going.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| TunnelError::Negotiation("control message is not UTF-8".to_string()))?;

        let mut chars = text.chars();
        if chars.next() != Some(MESSAGE_PREFIX) || chars.next() != Some(MESSAGE_MARK) {
            return Err(TunnelError::Negotiation("missing message prefix".to_string()));
        }
        let tag = chars
            .next()
            .ok_or_else(|| TunnelError::Negotiation("missing tunnel tag".to_string()))?;
        let tunnel = TunnelKind::from_tag(tag)
            .ok_or_else(|| TunnelError::Negotiation(format!("unknown tunnel tag {:?}", tag)))?;

        let fields: Vec<&str> = chars.as_str().split(FIELD_SEPARATOR).collect();
        if fields.len() >= REQUEST_MIN_FIELDS {
            Self::parse_request(tunnel, &fields).map(ControlMessage::Request)
        } else if fields.len() >= RESPONSE_MIN_FIELDS {
            Self::parse_response(tunnel, &fields).map(ControlMessage::Response)
        } else {
            Err(TunnelError::Negotiation(format!(
                "too few fields: {}",
                fields.len()
            )))
        }
    }

    fn parse_request(tunnel: TunnelKind, fields: &[&str]) -> Result<TunnelRequest> {
        let channel_type = ChannelType::from_bits(parse_num(fields, 0, "channel type")?);
        let output_number = parse_channel(fields, 1, "output number")?;
        let input_number = parse_channel(fields, 2, "input number")?;
        let connect_timeout_ms = parse_num::<i64>(fields, 3, "connect timeout")?.max(0) as u64;
        let data_timeout_ms = parse_num::<i64>(fields, 4, "data timeout")?.max(0) as u64;
        let bind = empty_if_placeholder(fields[5]);

        let target = match tunnel {
            TunnelKind::Socks => RequestTarget::Socks {
                username: optional(fields, 6),
                password: optional(fields, 7),
            },
            TunnelKind::Tcp | TunnelKind::Udp => RequestTarget::Endpoint {
                host: empty_if_placeholder(fields[6]),
                port: parse_num(fields, 7, "port")?,
            },
        };

        let proxy = match fields.get(8) {
            Some(letter) => {
                let kind = ProxyKind::from_letter(letter).ok_or_else(|| {
                    TunnelError::Negotiation(format!("unknown proxy type {:?}", letter))
                })?;
                let host = fields.get(9).map(|h| empty_if_placeholder(h)).unwrap_or_default();
                let port = fields
                    .get(10)
                    .and_then(|p| p.trim().parse().ok())
                    .unwrap_or(0);
                let (username, password) = match (optional(fields, 11), fields.get(12)) {
                    // "*", "*", "*" encodes absent credentials
                    (None, _) => (None, None),
                    (Some(user), password) => {
                        (Some(user), password.filter(|p| **p != EMPTY_FIELD).map(|p| p.to_string()))
                    }
                };
                ProxySpec {
                    kind,
                    host,
                    port,
                    username,
                    password,
                }
            }
            None => ProxySpec::default(),
        };

        Ok(TunnelRequest {
            tunnel,
            channel_type,
            output_number,
            input_number,
            connect_timeout_ms,
            data_timeout_ms,
            bind,
            target,
            proxy,
        })
    }

    fn parse_response(tunnel: TunnelKind, fields: &[&str]) -> Result<TunnelResponse> {
        let channel_type = ChannelType::from_bits(parse_num(fields, 0, "channel type")?);
        let output_number = parse_channel(fields, 1, "output number")?;
        let input: i64 = parse_num(fields, 2, "input number")?;
        let input_number = if input < 0 {
            None
        } else {
            Some(parse_channel(fields, 2, "input number")?)
        };

        let remote = if input_number.is_some() && fields.len() >= 5 {
            Some((empty_if_placeholder(fields[3]), parse_num(fields, 4, "remote port")?))
        } else {
            None
        };

        Ok(TunnelResponse {
            tunnel,
            channel_type,
            output_number,
            input_number,
            remote,
        })
    }
}
