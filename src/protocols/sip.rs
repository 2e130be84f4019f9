//! SIP message model and UDP wire codec
//!
//! Owned-string representation of SIP requests and responses with typed
//! accessors for the headers the switchboard cares about: Via, From, To,
//! Call-ID, CSeq, Contact, Expires, Max-Forwards, Content-Type and Path.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::{Error, Result};

pub const SIP_VERSION: &str = "SIP/2.0";
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// SIP methods handled by the switchboard
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
}

impl SipMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive name lookup.
///
/// Order and multiplicity are preserved; Via and Contact may legitimately
/// repeat.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace every occurrence of `name` with a single entry, keeping the
    /// first occurrence's position.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(pos) => {
                self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
                self.entries.insert(pos, (name.to_string(), value));
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }
}

/// A parsed SIP URI: `sip:user@host:port;params`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let rest = input
            .strip_prefix("sip:")
            .or_else(|| input.strip_prefix("sips:"))
            .ok_or_else(|| Error::parse(format!("Not a SIP URI: {}", input)))?;

        let (core, params_str) = match rest.split_once(';') {
            Some((c, p)) => (c, Some(p)),
            None => (rest, None),
        };

        let (user, host_port) = match core.rsplit_once('@') {
            Some((u, hp)) => (Some(u.to_string()), hp),
            None => (None, core),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| Error::parse(format!("Invalid URI port: {}", p)))?;
                (h.to_string(), Some(port))
            }
            _ => (host_port.to_string(), None),
        };

        if host.is_empty() {
            return Err(Error::parse(format!("SIP URI without host: {}", input)));
        }

        let params = params_str.map(parse_params).unwrap_or_default();

        Ok(Self {
            user,
            host,
            port,
            params,
        })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// host:port with the SIP default applied when the port is absent.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(5060))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// A From/To/Contact header value: optional display name, URI, header params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();

        if let Some(open) = input.find('<') {
            let close = input[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| Error::parse(format!("Unterminated name-addr: {}", input)))?;

            let display = input[..open].trim().trim_matches('"');
            let display_name = if display.is_empty() {
                None
            } else {
                Some(display.to_string())
            };

            let uri = SipUri::parse(&input[open + 1..close])?;
            let params = input[close + 1..]
                .trim()
                .strip_prefix(';')
                .map(parse_params)
                .unwrap_or_default();

            Ok(Self {
                display_name,
                uri,
                params,
            })
        } else {
            // addr-spec form: params after ';' belong to the header, not the URI
            let (uri_str, params_str) = match input.split_once(';') {
                Some((u, p)) => (u, Some(p)),
                None => (input, None),
            };
            Ok(Self {
                display_name: None,
                uri: SipUri::parse(uri_str)?,
                params: params_str.map(parse_params).unwrap_or_default(),
            })
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case("tag"));
        self.params.push(("tag".to_string(), Some(tag.to_string())));
    }

    pub fn without_params(&self) -> Self {
        Self {
            display_name: self.display_name.clone(),
            uri: self.uri.clone(),
            params: Vec::new(),
        }
    }

    pub fn q_value(&self) -> Option<f32> {
        self.param("q").and_then(|v| v.parse().ok())
    }

    pub fn expires(&self) -> Option<u32> {
        self.param("expires").and_then(|v| v.parse().ok())
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.param("+sip.instance")
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.trim().split_whitespace();
        let seq = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| Error::parse(format!("Invalid CSeq: {}", input)))?;
        let method = parts
            .next()
            .and_then(SipMethod::from_str)
            .ok_or_else(|| Error::parse(format!("Invalid CSeq method: {}", input)))?;
        Ok(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Top Via header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    pub fn new(host: IpAddr, port: u16, branch: &str) -> Self {
        Self {
            transport: "UDP".to_string(),
            host: host.to_string(),
            port: Some(port),
            params: vec![("branch".to_string(), Some(branch.to_string()))],
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let rest = input
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| Error::parse(format!("Invalid Via: {}", input)))?;
        let (transport, rest) = rest
            .split_once(' ')
            .ok_or_else(|| Error::parse(format!("Invalid Via: {}", input)))?;

        let (sent_by, params_str) = match rest.split_once(';') {
            Some((s, p)) => (s.trim(), Some(p)),
            None => (rest.trim(), None),
        };

        let (host, port) = match sent_by.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => (
                h.to_string(),
                Some(
                    p.parse::<u16>()
                        .map_err(|_| Error::parse(format!("Invalid Via port: {}", p)))?,
                ),
            ),
            _ => (sent_by.to_string(), None),
        };

        Ok(Self {
            transport: transport.to_string(),
            host,
            port,
            params: params_str.map(parse_params).unwrap_or_default(),
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.params
            .push((name.to_string(), value.map(|v| v.to_string())));
    }

    /// Where a response to this Via should be sent, honouring RFC 3581
    /// `received`/`rport` when present.
    pub fn response_addr(&self) -> Result<SocketAddr> {
        let host = self.param("received").unwrap_or(&self.host);
        let port = self
            .param("rport")
            .and_then(|p| p.parse::<u16>().ok())
            .or(self.port)
            .unwrap_or(5060);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::parse(format!("Via host is not an address: {}", host)))?;
        Ok(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// A SIP request
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

/// A SIP response
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers
            .get("Call-ID")
            .ok_or_else(|| Error::parse("Missing Call-ID header"))
    }

    pub fn cseq(&self) -> Result<CSeq> {
        CSeq::parse(
            self.headers
                .get("CSeq")
                .ok_or_else(|| Error::parse("Missing CSeq header"))?,
        )
    }

    pub fn from(&self) -> Result<NameAddr> {
        NameAddr::parse(
            self.headers
                .get("From")
                .ok_or_else(|| Error::parse("Missing From header"))?,
        )
    }

    pub fn to(&self) -> Result<NameAddr> {
        NameAddr::parse(
            self.headers
                .get("To")
                .ok_or_else(|| Error::parse("Missing To header"))?,
        )
    }

    pub fn top_via(&self) -> Result<Via> {
        Via::parse(
            self.headers
                .get("Via")
                .ok_or_else(|| Error::parse("Missing Via header"))?,
        )
    }

    pub fn contact(&self) -> Result<NameAddr> {
        NameAddr::parse(
            self.headers
                .get("Contact")
                .ok_or_else(|| Error::parse("Missing Contact header"))?,
        )
    }

    pub fn expires(&self) -> Option<u32> {
        self.headers.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
    }
}

impl SipResponse {
    /// Build a response for a request: Via(s), From, To, Call-ID and CSeq are
    /// mirrored per RFC 3261 §8.2.6.
    pub fn for_request(request: &SipRequest, code: u16) -> Self {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via);
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(v) = request.headers.get(name) {
                headers.push(name, v);
            }
        }
        Self {
            code,
            reason: reason_phrase(code).to_string(),
            headers,
            body: String::new(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.code >= 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers
            .get("Call-ID")
            .ok_or_else(|| Error::parse("Missing Call-ID header"))
    }

    pub fn cseq(&self) -> Result<CSeq> {
        CSeq::parse(
            self.headers
                .get("CSeq")
                .ok_or_else(|| Error::parse("Missing CSeq header"))?,
        )
    }

    pub fn from(&self) -> Result<NameAddr> {
        NameAddr::parse(
            self.headers
                .get("From")
                .ok_or_else(|| Error::parse("Missing From header"))?,
        )
    }

    pub fn to(&self) -> Result<NameAddr> {
        NameAddr::parse(
            self.headers
                .get("To")
                .ok_or_else(|| Error::parse("Missing To header"))?,
        )
    }

    pub fn top_via(&self) -> Result<Via> {
        Via::parse(
            self.headers
                .get("Via")
                .ok_or_else(|| Error::parse("Missing Via header"))?,
        )
    }

    pub fn contact(&self) -> Result<NameAddr> {
        NameAddr::parse(
            self.headers
                .get("Contact")
                .ok_or_else(|| Error::parse("Missing Contact header"))?,
        )
    }

    /// Add a tag to the To header if it does not already carry one.
    pub fn ensure_to_tag(&mut self, tag: &str) -> Result<()> {
        let mut to = self.to()?;
        if to.tag().is_none() {
            to.set_tag(tag);
            self.headers.set("To", to.to_string());
        }
        Ok(())
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
    }
}

impl SipMessage {
    /// Parse one datagram. Lines are CRLF separated; bare LF is tolerated.
    pub fn parse(input: &str) -> Result<Self> {
        let (head, body) = match input.find("\r\n\r\n") {
            Some(idx) => (&input[..idx], &input[idx + 4..]),
            None => match input.find("\n\n") {
                Some(idx) => (&input[..idx], &input[idx + 2..]),
                None => (input, ""),
            },
        };

        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::parse("Empty SIP message"))?;

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::parse(format!("Malformed header line: {}", line)))?;
            headers.push(name.trim(), value.trim());
        }

        let body = match headers.get("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
            Some(len) if len <= body.len() => body[..len].to_string(),
            _ => body.to_string(),
        };

        if let Some(rest) = start_line.strip_prefix(SIP_VERSION) {
            let rest = rest.trim_start();
            let (code_str, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let code = code_str
                .parse::<u16>()
                .map_err(|_| Error::parse(format!("Invalid status code: {}", code_str)))?;
            Ok(SipMessage::Response(SipResponse {
                code,
                reason: reason.to_string(),
                headers,
                body,
            }))
        } else {
            let mut parts = start_line.split_whitespace();
            let method_str = parts
                .next()
                .ok_or_else(|| Error::parse("Missing request method"))?;
            let uri = parts
                .next()
                .ok_or_else(|| Error::parse("Missing request URI"))?;
            let version = parts
                .next()
                .ok_or_else(|| Error::parse("Missing SIP version"))?;
            if version != SIP_VERSION {
                return Err(Error::parse(format!("Unsupported SIP version: {}", version)));
            }
            let method = SipMethod::from_str(method_str)
                .ok_or_else(|| Error::sip(format!("Unsupported method: {}", method_str)))?;
            Ok(SipMessage::Request(SipRequest {
                method,
                uri: uri.to_string(),
                headers,
                body,
            }))
        }
    }
}

fn write_message(
    f: &mut fmt::Formatter<'_>,
    start_line: &str,
    headers: &Headers,
    body: &str,
) -> fmt::Result {
    write!(f, "{}\r\n", start_line)?;
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        write!(f, "{}: {}\r\n", name, value)?;
    }
    write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = format!("{} {} {}", self.method, self.uri, SIP_VERSION);
        write_message(f, &start, &self.headers, &self.body)
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = format!("{} {} {}", SIP_VERSION, self.code, self.reason);
        write_message(f, &start, &self.headers, &self.body)
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(r) => fmt::Display::fmt(r, f),
            SipMessage::Response(r) => fmt::Display::fmt(r, f),
        }
    }
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        423 => "Interval Too Brief",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn generate_tag() -> String {
    format!("{:x}", rand::random::<u64>())
}

pub fn generate_branch() -> String {
    format!("{}{:x}", BRANCH_MAGIC_COOKIE, rand::random::<u64>())
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), host)
}

/// Stamp `received` and `rport` on the top Via of an incoming request per
/// RFC 3581. `received` is added whenever the observed source differs from
/// the Via sent-by host; `rport` is filled only when the client asked for it.
pub fn stamp_top_via(headers: &mut Headers, source: SocketAddr) -> Result<()> {
    let raw = headers
        .get("Via")
        .ok_or_else(|| Error::parse("Missing Via header"))?
        .to_string();
    let mut via = Via::parse(&raw)?;

    if via.host != source.ip().to_string() {
        via.set_param("received", Some(&source.ip().to_string()));
    }
    if via.has_param("rport") {
        via.set_param("rport", Some(&source.port().to_string()));
    }

    // Replace only the top Via, preserving any others below it.
    let all: Vec<String> = headers.get_all("Via").iter().map(|v| v.to_string()).collect();
    headers.remove("Via");
    headers.push("Via", via.to_string());
    for v in all.into_iter().skip(1) {
        headers.push("Via", v);
    }
    Ok(())
}

fn parse_params(input: &str) -> Vec<(String, Option<String>)> {
    input
        .split(';')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.trim_matches('"').to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:alice@switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.5:5060;branch=z9hG4bK776asdhds;rport\r\n\
Max-Forwards: 70\r\n\
From: \"Bob\" <sip:bob@example.com>;tag=1928301774\r\n\
To: <sip:alice@switchboard.local>\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:bob@192.0.2.5:5060>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 5\r\n\
\r\n\
v=0\r\n";

    #[test]
    fn test_parse_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let req = match msg {
            SipMessage::Request(r) => r,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, SipMethod::Invite);
        assert_eq!(req.uri, "sip:alice@switchboard.local");
        assert_eq!(req.call_id().unwrap(), "a84b4c76e66710");
        let cseq = req.cseq().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, SipMethod::Invite);
        assert_eq!(req.body, "v=0\r\n");
    }

    #[test]
    fn test_name_addr() {
        let from = NameAddr::parse("\"Bob\" <sip:bob@example.com>;tag=1928301774").unwrap();
        assert_eq!(from.display_name.as_deref(), Some("Bob"));
        assert_eq!(from.uri.user(), Some("bob"));
        assert_eq!(from.tag(), Some("1928301774"));

        let bare = NameAddr::parse("sip:carol@10.0.0.1:5070;tag=abc").unwrap();
        assert_eq!(bare.uri.port, Some(5070));
        // params after a bare URI belong to the header
        assert_eq!(bare.tag(), Some("abc"));
        assert!(bare.uri.params.is_empty());
    }

    #[test]
    fn test_contact_q_and_instance() {
        let c = NameAddr::parse(
            "<sip:alice@192.0.2.5:5060>;q=0.8;expires=120;+sip.instance=\"<urn:uuid:x>\"",
        )
        .unwrap();
        assert_eq!(c.q_value(), Some(0.8));
        assert_eq!(c.expires(), Some(120));
        assert_eq!(c.instance_id(), Some("<urn:uuid:x>"));
    }

    #[test]
    fn test_via_response_addr() {
        let via =
            Via::parse("SIP/2.0/UDP 192.0.2.5:5060;branch=z9hG4bKx;received=203.0.113.9;rport=61234")
                .unwrap();
        assert_eq!(via.branch(), Some("z9hG4bKx"));
        assert_eq!(
            via.response_addr().unwrap(),
            "203.0.113.9:61234".parse().unwrap()
        );
    }

    #[test]
    fn test_stamp_rport() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let mut req = match msg {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        let src: SocketAddr = "203.0.113.9:61234".parse().unwrap();
        stamp_top_via(&mut req.headers, src).unwrap();
        let via = req.top_via().unwrap();
        assert_eq!(via.param("received"), Some("203.0.113.9"));
        assert_eq!(via.param("rport"), Some("61234"));
    }

    #[test]
    fn test_response_for_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let req = match msg {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        let mut resp = SipResponse::for_request(&req, 200);
        resp.ensure_to_tag("localtag").unwrap();
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.call_id().unwrap(), "a84b4c76e66710");
        assert_eq!(resp.to().unwrap().tag(), Some("localtag"));
        // From is untouched
        assert_eq!(resp.from().unwrap().tag(), Some("1928301774"));
    }

    #[test]
    fn test_serialize_round_trip() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let text = msg.to_string();
        let reparsed = SipMessage::parse(&text).unwrap();
        match reparsed {
            SipMessage::Request(r) => {
                assert_eq!(r.method, SipMethod::Invite);
                assert_eq!(r.headers.count("Via"), 1);
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_parse_response() {
        let raw = "SIP/2.0 180 Ringing\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa\r\n\
From: <sip:a@x>;tag=1\r\nTo: <sip:b@y>;tag=2\r\nCall-ID: c1\r\nCSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(raw).unwrap();
        match msg {
            SipMessage::Response(r) => {
                assert_eq!(r.code, 180);
                assert!(!r.is_success());
                assert!(!r.is_final());
                assert_eq!(r.to().unwrap().tag(), Some("2"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_uri_display() {
        let uri = SipUri::parse("sip:alice@10.0.0.1:5070;transport=udp").unwrap();
        assert_eq!(uri.to_string(), "sip:alice@10.0.0.1:5070;transport=udp");
        assert_eq!(uri.addr(), "10.0.0.1:5070");
        let no_port = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(no_port.addr(), "example.com:5060");
    }

    #[test]
    fn test_branch_cookie() {
        let b = generate_branch();
        assert!(b.starts_with(BRANCH_MAGIC_COOKIE));
        assert_ne!(generate_branch(), b);
    }
}
