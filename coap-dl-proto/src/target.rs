use std::fmt;

use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

/// Where a download fetches its resource from
///
/// Immutable once a transfer starts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Target {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: Vec<String>,
    query: Vec<String>,
}

impl Target {
    /// Parse a `coap://` or `coaps://` URL
    ///
    /// The scheme is recorded but not validated here; transport selection rejects schemes it
    /// cannot serve.
    pub fn parse(input: &str) -> Result<Self, InvalidUrl> {
        let url = Url::parse(input).map_err(|e| InvalidUrl::Syntax(e.to_string()))?;
        if url.fragment().is_some() {
            return Err(InvalidUrl::Fragment);
        }
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(InvalidUrl::MissingHost),
        };
        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']').to_owned();

        let path = match url.path() {
            "" | "/" => Vec::new(),
            path => path
                .strip_prefix('/')
                .unwrap_or(path)
                .split('/')
                .map(decode)
                .collect::<Result<_, _>>()?,
        };
        let query = match url.query() {
            None | Some("") => Vec::new(),
            Some(query) => query.split('&').map(decode).collect::<Result<_, _>>()?,
        };

        Ok(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host,
            port: url.port(),
            path,
            query,
        })
    }

    /// Lowercase URL scheme
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address literal
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if the URL carried one
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Decoded path segments, one Uri-Path option each
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Decoded query arguments, one Uri-Query option each
    pub fn query(&self) -> &[String] {
        &self.query
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for segment in &self.path {
            write!(f, "/{segment}")?;
        }
        for (i, arg) in self.query.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            f.write_str(arg)?;
        }
        Ok(())
    }
}

fn decode(segment: &str) -> Result<String, InvalidUrl> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| InvalidUrl::Encoding)
}

/// Reasons a download URL was rejected
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum InvalidUrl {
    /// Not a URL at all
    #[error("{0}")]
    Syntax(String),
    /// No host to connect to
    #[error("URL has no host")]
    MissingHost,
    /// Fragments have no meaning in CoAP
    #[error("URL has a fragment")]
    Fragment,
    /// A percent-encoded component is not valid UTF-8
    #[error("invalid percent-encoding")]
    Encoding,
}
