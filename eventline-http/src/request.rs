//! Request model and URL splitting.

use crate::body::BoxBody;
use crate::error::HttpError;

/// An outbound HTTP request.
///
/// The method and URL are sent verbatim; headers keep insertion order on
/// the wire. A `content-length` header, when present, is forwarded to the
/// transport as the body size hint; bodies without one are uploaded with
/// chunked transfer encoding.
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<BoxBody>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Request {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Request::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Request::new("POST", url)
    }

    /// Append a header, preserving insertion order.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a request body.
    pub fn body(mut self, body: BoxBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Get the first header value matching `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The caller-declared body size, parsed as a non-negative 64-bit
    /// integer.
    pub(crate) fn content_length(&self) -> Result<Option<u64>, HttpError> {
        match self.header_value("content-length") {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| HttpError::Protocol(format!("bad content-length: {value:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The pieces of a URL the transport needs: scheme, authority, and the
/// request target. Nothing more is interpreted.
pub(crate) struct ParsedUrl {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) target: String,
}

impl ParsedUrl {
    /// The `host[:port]` form for the Host header, omitting default ports.
    pub(crate) fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The `host:port` origin key used by the alt-svc cache.
    pub(crate) fn origin(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) fn parse_url(url: &str) -> Result<ParsedUrl, HttpError> {
    let invalid = || HttpError::InvalidUrl(url.to_string());

    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let scheme = match scheme {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return Err(invalid()),
    };

    let (authority, target) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(invalid());
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        // IPv6 literal: [addr] or [addr]:port
        let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None if after.is_empty() => scheme.default_port(),
            None => return Err(invalid()),
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                (host.to_string(), port.parse().map_err(|_| invalid())?)
            }
            _ => (authority.to_string(), scheme.default_port()),
        }
    };

    Ok(ParsedUrl {
        scheme,
        host,
        port,
        target,
    })
}
