// Structured SIP URI

use std::fmt;
use std::net::SocketAddr;

use super::parser::ParseError;

pub const DEFAULT_SIP_PORT: u16 = 5060;

/// A parsed SIP URI: `scheme:user@host:port;param=value;flag`.
///
/// Parameter order is preserved so that a rewritten URI serializes with the
/// same parameters it arrived with (`lr`, `transport`, `ob`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl SipUri {
    /// Parse a bare URI string (no angle brackets, no display name).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        let (scheme, rest) = input
            .split_once(':')
            .ok_or_else(|| ParseError::new(format!("URI has no scheme: {}", input)))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ParseError::new(format!("invalid URI scheme: {}", input)));
        }

        let (addr_part, params_part) = match rest.split_once(';') {
            Some((a, p)) => (a, Some(p)),
            None => (rest, None),
        };

        let (user, host_port) = match addr_part.rsplit_once('@') {
            Some((u, hp)) => (Some(u.to_string()), hp),
            None => (None, addr_part),
        };

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err(ParseError::new(format!("URI has empty host: {}", input)));
        }

        let params = match params_part {
            Some(p) => parse_params(p),
            None => Vec::new(),
        };

        Ok(SipUri {
            scheme: scheme.to_string(),
            user,
            host: host.to_string(),
            port,
            params,
        })
    }

    /// Host and port with the SIP default applied.
    pub fn host_port(&self) -> (String, u16) {
        (self.host.clone(), self.port.unwrap_or(DEFAULT_SIP_PORT))
    }

    /// Resolve to a socket address if the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let (host, port) = self.host_port();
        format!("{}:{}", host, port).parse().ok()
    }

    /// Address-of-record key: `scheme:user@host` with the host lowercased.
    /// User comparison stays case-sensitive, host comparison does not.
    pub fn aor(&self) -> String {
        match &self.user {
            Some(user) => format!("{}:{}@{}", self.scheme, user, self.host.to_ascii_lowercase()),
            None => format!("{}:{}", self.scheme, self.host.to_ascii_lowercase()),
        }
    }

    /// Replace the host and port, keeping user, scheme, and every parameter.
    pub fn set_host_port(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = Some(port);
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
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

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Copy without any URI parameters, for targets that must be bare.
    pub fn without_params(&self) -> SipUri {
        SipUri {
            scheme: self.scheme.clone(),
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            params: Vec::new(),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Split `host[:port]`, rejecting non-numeric ports.
fn split_host_port(input: &str) -> Result<(&str, Option<u16>), ParseError> {
    match input.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ParseError::new(format!("invalid URI port: {}", port_str)))?;
            Ok((host, Some(port)))
        }
        None => Ok((input, None)),
    }
}

/// Parse `name=value;flag;name=value` into an ordered list.
/// Flags without a value keep `None` so they reserialize bare.
pub(crate) fn parse_params(input: &str) -> Vec<(String, Option<String>)> {
    input
        .split(';')
        .filter(|p| !p.trim().is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (p.trim().to_string(), None),
        })
        .collect()
}
