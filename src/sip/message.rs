// SIP message data model
//
// Headers are parsed once into typed variants; routing code never goes back
// to string scanning. Repeated Via/Route/Record-Route/Contact values keep
// their arrival order, which carries the routing semantics.

use std::fmt;

use super::parser::ParseError;
use super::uri::{parse_params, SipUri, DEFAULT_SIP_PORT};

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Message,
    Update,
    Prack,
    Refer,
    Notify,
    Subscribe,
    Other(String),
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            "REFER" => Method::Refer,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Via hop: `SIP/2.0/UDP host:port;branch=...;rport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    pub fn new(transport: &str, host: &str, port: u16) -> Via {
        Via {
            transport: transport.to_string(),
            host: host.to_string(),
            port: Some(port),
            params: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Via, ParseError> {
        let input = input.trim();
        let (proto, rest) = input
            .split_once(char::is_whitespace)
            .ok_or_else(|| ParseError::new(format!("Via has no sent-by: {}", input)))?;
        let mut proto_parts = proto.split('/');
        let name = proto_parts.next().unwrap_or("");
        let version = proto_parts.next().unwrap_or("");
        let transport = proto_parts
            .next()
            .ok_or_else(|| ParseError::new(format!("Via has no transport: {}", input)))?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" {
            return Err(ParseError::new(format!("invalid Via protocol: {}", proto)));
        }

        let rest = rest.trim();
        let (sent_by, params_part) = match rest.split_once(';') {
            Some((s, p)) => (s.trim(), Some(p)),
            None => (rest, None),
        };
        let (host, port) = match sent_by.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| ParseError::new(format!("invalid Via port: {}", p)))?;
                (h, Some(port))
            }
            None => (sent_by, None),
        };
        if host.is_empty() {
            return Err(ParseError::new(format!("Via has empty host: {}", input)));
        }

        Ok(Via {
            transport: transport.to_string(),
            host: host.to_string(),
            port,
            params: params_part.map(parse_params).unwrap_or_default(),
        })
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    pub fn received(&self) -> Option<&str> {
        self.param("received")
    }

    /// The rport parameter value, if it was filled in.
    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|v| v.parse().ok())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(|v| v.to_string());
        if let Some(entry) = self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
    }

    /// Where a response to this hop must be sent: `received`/`rport`
    /// override the sent-by host/port (RFC 3261 18.2.2).
    pub fn effective_endpoint(&self) -> (String, u16) {
        let host = self
            .received()
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.host)
            .to_string();
        let port = self.rport().or(self.port).unwrap_or(DEFAULT_SIP_PORT);
        (host, port)
    }

    /// Sent-by matches the given identity (used for "is this Via ours").
    pub fn sent_by_matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port.unwrap_or(DEFAULT_SIP_PORT) == port
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) if !v.is_empty() => write!(f, ";{}={}", name, v)?,
                _ => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// A name-addr header value: `"Display" <sip:uri>;param=value`.
/// Used for From, To, Contact, Route, and Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn from_uri(uri: SipUri) -> NameAddr {
        NameAddr {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<NameAddr, ParseError> {
        let input = input.trim();
        if let Some(lt) = input.find('<') {
            let gt = input[lt..]
                .find('>')
                .map(|i| lt + i)
                .ok_or_else(|| ParseError::new(format!("unterminated name-addr: {}", input)))?;
            let display = input[..lt].trim().trim_matches('"').trim();
            let uri = SipUri::parse(&input[lt + 1..gt])?;
            let params = parse_params(input[gt + 1..].trim_start_matches(';'));
            Ok(NameAddr {
                display_name: if display.is_empty() {
                    None
                } else {
                    Some(display.to_string())
                },
                uri,
                params,
            })
        } else {
            // Bare form. In From/To/Contact the parameters after the URI
            // belong to the header, not the URI (RFC 3261 20.10).
            let (uri_part, params_part) = match input.split_once(';') {
                Some((u, p)) => (u, Some(p)),
                None => (input, None),
            };
            let uri = SipUri::parse(uri_part)?;
            Ok(NameAddr {
                display_name: None,
                uri,
                params: params_part.map(parse_params).unwrap_or_default(),
            })
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(|v| v.to_string());
        if let Some(entry) = self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
    }

    /// The dialog tag, when present (From/To headers).
    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// CSeq header: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn parse(input: &str) -> Result<CSeq, ParseError> {
        let mut parts = input.split_whitespace();
        let seq = parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| ParseError::new(format!("invalid CSeq: {}", input)))?;
        let method = parts
            .next()
            .map(Method::from_token)
            .ok_or_else(|| ParseError::new(format!("CSeq has no method: {}", input)))?;
        Ok(CSeq { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// One parsed header field.
///
/// The structured variants cover every header the routing engine reads or
/// rewrites; everything else passes through untouched as `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Via(Via),
    Route(NameAddr),
    RecordRoute(NameAddr),
    Contact(NameAddr),
    From(NameAddr),
    To(NameAddr),
    CallId(String),
    CSeq(CSeq),
    MaxForwards(u32),
    ContentLength(usize),
    Expires(u32),
    Other(String, String),
}

impl Header {
    /// Canonical field name for serialization.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => "Via",
            Header::Route(_) => "Route",
            Header::RecordRoute(_) => "Record-Route",
            Header::Contact(_) => "Contact",
            Header::From(_) => "From",
            Header::To(_) => "To",
            Header::CallId(_) => "Call-ID",
            Header::CSeq(_) => "CSeq",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::ContentLength(_) => "Content-Length",
            Header::Expires(_) => "Expires",
            Header::Other(name, _) => name.as_str(),
        }
    }

    /// Serialized field value.
    pub fn value_string(&self) -> String {
        match self {
            Header::Via(v) => v.to_string(),
            Header::Route(n)
            | Header::RecordRoute(n)
            | Header::Contact(n)
            | Header::From(n)
            | Header::To(n) => n.to_string(),
            Header::CallId(v) => v.clone(),
            Header::CSeq(c) => c.to_string(),
            Header::MaxForwards(v) => v.to_string(),
            Header::ContentLength(v) => v.to_string(),
            Header::Expires(v) => v.to_string(),
            Header::Other(_, v) => v.clone(),
        }
    }

    /// Build typed headers from one raw field line.
    ///
    /// Compact names expand to canonical ones; comma-separated values of
    /// the multi-valued headers become one `Header` each, in order.
    pub fn parse_field(raw_name: &str, raw_value: &str) -> Result<Vec<Header>, ParseError> {
        let name = expand_compact(raw_name.trim());
        let value = raw_value.trim();

        let one = |h: Header| Ok(vec![h]);
        match name.as_str() {
            "Via" => split_commas(value)
                .into_iter()
                .map(|v| Via::parse(v).map(Header::Via))
                .collect(),
            "Route" => split_commas(value)
                .into_iter()
                .map(|v| NameAddr::parse(v).map(Header::Route))
                .collect(),
            "Record-Route" => split_commas(value)
                .into_iter()
                .map(|v| NameAddr::parse(v).map(Header::RecordRoute))
                .collect(),
            "Contact" => split_commas(value)
                .into_iter()
                .map(|v| NameAddr::parse(v).map(Header::Contact))
                .collect(),
            "From" => one(Header::From(NameAddr::parse(value)?)),
            "To" => one(Header::To(NameAddr::parse(value)?)),
            "Call-ID" => one(Header::CallId(value.to_string())),
            "CSeq" => one(Header::CSeq(CSeq::parse(value)?)),
            "Max-Forwards" => one(Header::MaxForwards(parse_numeric(name.as_str(), value)?)),
            "Expires" => one(Header::Expires(parse_numeric(name.as_str(), value)?)),
            "Content-Length" => one(Header::ContentLength(
                value
                    .parse::<usize>()
                    .map_err(|_| ParseError::new(format!("invalid Content-Length: {}", value)))?,
            )),
            other => one(Header::Other(other.to_string(), value.to_string())),
        }
    }
}

fn parse_numeric(name: &str, value: &str) -> Result<u32, ParseError> {
    value
        .parse::<u32>()
        .map_err(|_| ParseError::new(format!("invalid {}: {}", name, value)))
}

/// Expand a compact header name to its canonical form (RFC 3261 7.3.3).
fn expand_compact(name: &str) -> String {
    if name.len() == 1 {
        match name.to_ascii_lowercase().as_str() {
            "v" => return "Via".to_string(),
            "f" => return "From".to_string(),
            "t" => return "To".to_string(),
            "m" => return "Contact".to_string(),
            "i" => return "Call-ID".to_string(),
            "l" => return "Content-Length".to_string(),
            "s" => return "Subject".to_string(),
            "c" => return "Content-Type".to_string(),
            "k" => return "Supported".to_string(),
            _ => {}
        }
    }
    canonicalize(name)
}

/// Normalize arbitrary-case names onto the canonical spellings the rest of
/// the crate matches against.
fn canonicalize(name: &str) -> String {
    const CANONICAL: &[&str] = &[
        "Via",
        "Route",
        "Record-Route",
        "Contact",
        "From",
        "To",
        "Call-ID",
        "CSeq",
        "Max-Forwards",
        "Content-Length",
        "Expires",
    ];
    for canonical in CANONICAL {
        if name.eq_ignore_ascii_case(canonical) {
            return canonical.to_string();
        }
    }
    name.to_string()
}

/// Split a multi-valued header on top-level commas, ignoring commas inside
/// angle brackets and quoted strings.
fn split_commas(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Ordered collection of typed headers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn push(&mut self, header: Header) {
        self.entries.push(header);
    }

    pub fn entries(&self) -> &[Header] {
        &self.entries
    }

    // --- Via stack ---

    pub fn vias(&self) -> impl Iterator<Item = &Via> {
        self.entries.iter().filter_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    pub fn via_count(&self) -> usize {
        self.vias().count()
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.vias().next()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.entries.iter_mut().find_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    /// Push a Via on top of the stack.
    pub fn push_top_via(&mut self, via: Via) {
        let pos = self
            .entries
            .iter()
            .position(|h| matches!(h, Header::Via(_)))
            .unwrap_or(0);
        self.entries.insert(pos, Header::Via(via));
    }

    /// Pop the topmost Via and return it.
    pub fn pop_top_via(&mut self) -> Option<Via> {
        let pos = self
            .entries
            .iter()
            .position(|h| matches!(h, Header::Via(_)))?;
        match self.entries.remove(pos) {
            Header::Via(v) => Some(v),
            _ => unreachable!(),
        }
    }

    // --- Route set ---

    pub fn routes(&self) -> impl Iterator<Item = &NameAddr> {
        self.entries.iter().filter_map(|h| match h {
            Header::Route(n) => Some(n),
            _ => None,
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes().count()
    }

    pub fn top_route(&self) -> Option<&NameAddr> {
        self.routes().next()
    }

    pub fn pop_top_route(&mut self) -> Option<NameAddr> {
        let pos = self
            .entries
            .iter()
            .position(|h| matches!(h, Header::Route(_)))?;
        match self.entries.remove(pos) {
            Header::Route(n) => Some(n),
            _ => unreachable!(),
        }
    }

    pub fn remove_routes(&mut self) {
        self.entries.retain(|h| !matches!(h, Header::Route(_)));
    }

    /// Prepend a Record-Route entry (ours must end up first).
    pub fn push_top_record_route(&mut self, entry: NameAddr) {
        let pos = self
            .entries
            .iter()
            .position(|h| matches!(h, Header::RecordRoute(_)))
            .unwrap_or(0);
        self.entries.insert(pos, Header::RecordRoute(entry));
    }

    pub fn record_routes(&self) -> impl Iterator<Item = &NameAddr> {
        self.entries.iter().filter_map(|h| match h {
            Header::RecordRoute(n) => Some(n),
            _ => None,
        })
    }

    // --- Contacts ---

    pub fn contacts(&self) -> impl Iterator<Item = &NameAddr> {
        self.entries.iter().filter_map(|h| match h {
            Header::Contact(n) => Some(n),
            _ => None,
        })
    }

    pub fn contacts_mut(&mut self) -> impl Iterator<Item = &mut NameAddr> {
        self.entries.iter_mut().filter_map(|h| match h {
            Header::Contact(n) => Some(n),
            _ => None,
        })
    }

    pub fn remove_contacts(&mut self) {
        self.entries.retain(|h| !matches!(h, Header::Contact(_)));
    }

    // --- Singleton accessors ---

    pub fn from_header(&self) -> Option<&NameAddr> {
        self.entries.iter().find_map(|h| match h {
            Header::From(n) => Some(n),
            _ => None,
        })
    }

    pub fn to_header(&self) -> Option<&NameAddr> {
        self.entries.iter().find_map(|h| match h {
            Header::To(n) => Some(n),
            _ => None,
        })
    }

    pub fn to_header_mut(&mut self) -> Option<&mut NameAddr> {
        self.entries.iter_mut().find_map(|h| match h {
            Header::To(n) => Some(n),
            _ => None,
        })
    }

    pub fn call_id(&self) -> Option<&str> {
        self.entries.iter().find_map(|h| match h {
            Header::CallId(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.entries.iter().find_map(|h| match h {
            Header::CSeq(c) => Some(c),
            _ => None,
        })
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.entries.iter().find_map(|h| match h {
            Header::MaxForwards(v) => Some(*v),
            _ => None,
        })
    }

    pub fn set_max_forwards(&mut self, value: u32) {
        for h in self.entries.iter_mut() {
            if let Header::MaxForwards(v) = h {
                *v = value;
                return;
            }
        }
        self.entries.push(Header::MaxForwards(value));
    }

    pub fn expires(&self) -> Option<u32> {
        self.entries.iter().find_map(|h| match h {
            Header::Expires(v) => Some(*v),
            _ => None,
        })
    }

    pub fn content_length(&self) -> Option<usize> {
        self.entries.iter().find_map(|h| match h {
            Header::ContentLength(v) => Some(*v),
            _ => None,
        })
    }

    // --- Escape hatch for headers the engine only copies ---

    pub fn other(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|h| match h {
            Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn set_other(&mut self, name: &str, value: &str) {
        for h in self.entries.iter_mut() {
            if let Header::Other(n, v) = h {
                if n.eq_ignore_ascii_case(name) {
                    *v = value.to_string();
                    return;
                }
            }
        }
        self.entries
            .push(Header::Other(name.to_string(), value.to_string()));
    }
}

/// SIP request message
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipRequest {
    /// Initial requests open a dialog: no To tag and not ACK/CANCEL.
    pub fn is_initial(&self) -> bool {
        !matches!(self.method, Method::Ack | Method::Cancel)
            && self
                .headers
                .to_header()
                .map(|to| to.tag().is_none())
                .unwrap_or(true)
    }
}

/// SIP response message
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipResponse {
    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

/// Top-level SIP message enum
#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}
