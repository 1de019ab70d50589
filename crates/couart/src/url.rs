//! `coap+uart` URLs.
//!
//! `coap+uart://<host>/<path>[?<query>]`, where `<host>` is a platform
//! device identifier (`COM3`, `ttyS2`) or the literal `any` for the first
//! available port. Hosts cannot contain a slash, so on POSIX systems the
//! serial provider prepends `/dev/` to bare device names.

use std::fmt;

use crate::error::Error;

pub const UART_SCHEME: &str = "coap+uart";

/// A parsed request URL.
///
/// The path is kept in its escaped form and the query raw; both flow into
/// Uri-Path/Uri-Query options verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUrl {
    scheme: String,
    host: String,
    path: String,
    query: String,
}

impl CoapUrl {
    pub fn parse(input: &str) -> Result<CoapUrl, Error> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidRequest(format!("missing scheme in URL: {input}")))?;
        if scheme.is_empty() {
            return Err(Error::InvalidRequest(format!("empty scheme in URL: {input}")));
        }

        let (authority, path_and_query) = match rest.find(['/', '?']) {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(Error::InvalidRequest(format!("missing host in URL: {input}")));
        }

        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_and_query, ""),
        };

        Ok(CoapUrl {
            scheme: scheme.to_string(),
            host: authority.to_string(),
            path: path.to_string(),
            query: query.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The escaped path, leading slash included (empty when absent).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string without the `?`.
    pub fn raw_query(&self) -> &str {
        &self.query
    }
}

impl fmt::Display for CoapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url() {
        let url = CoapUrl::parse("coap+uart://COM3/sensors/temperature?unit=c&raw").unwrap();
        assert_eq!(url.scheme(), UART_SCHEME);
        assert_eq!(url.host(), "COM3");
        assert_eq!(url.path(), "/sensors/temperature");
        assert_eq!(url.raw_query(), "unit=c&raw");
        assert_eq!(
            url.to_string(),
            "coap+uart://COM3/sensors/temperature?unit=c&raw"
        );
    }

    #[test]
    fn host_only() {
        let url = CoapUrl::parse("coap+uart://any").unwrap();
        assert_eq!(url.host(), "any");
        assert_eq!(url.path(), "");
        assert_eq!(url.raw_query(), "");
        assert_eq!(url.to_string(), "coap+uart://any");
    }

    #[test]
    fn query_without_path() {
        let url = CoapUrl::parse("coap+uart://ttyS2?x=1").unwrap();
        assert_eq!(url.host(), "ttyS2");
        assert_eq!(url.path(), "");
        assert_eq!(url.raw_query(), "x=1");
    }

    #[test]
    fn rejects_malformed() {
        assert!(CoapUrl::parse("no-scheme-here").is_err());
        assert!(CoapUrl::parse("://host/path").is_err());
        assert!(CoapUrl::parse("coap+uart:///path").is_err());
    }
}
