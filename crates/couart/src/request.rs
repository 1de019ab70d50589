//! Engine-level requests.

use std::fmt;
use std::io::Read;

use couart_msg::{Code, Options, Token};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::url::CoapUrl;

/// The request methods the engine speaks.
///
/// PING is not a CoAP code of its own: it is sent as an empty confirmable
/// message and answered by the peer with a RST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Ping,
}

impl Method {
    /// The wire code for this method. The enum is closed, so the GET arm
    /// can never be reached through an unvalidated method string.
    pub fn code(self) -> Code {
        match self {
            Method::Get => Code::GET,
            Method::Post => Code::POST,
            Method::Put => Code::PUT,
            Method::Delete => Code::DELETE,
            Method::Ping => Code::EMPTY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Ping => "PING",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Method, Error> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PING" => Ok(Method::Ping),
            other => Err(Error::InvalidRequest(format!("invalid method: {other}"))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request payload: nothing, bytes, or a reader the transport drains.
///
/// Whatever the variant, building the wire message consumes it; a reader
/// that was never drained is released when the request drops.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send + Sync>),
}

impl Body {
    pub const fn empty() -> Body {
        Body::Empty
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Body {
        Body::Bytes(data.into())
    }

    pub fn reader(r: impl Read + Send + Sync + 'static) -> Body {
        Body::Reader(Box::new(r))
    }

    /// Consumes the body, leaving `Empty` behind.
    pub(crate) fn drain(&mut self) -> Result<Vec<u8>, Error> {
        match std::mem::take(self) {
            Body::Empty => Ok(Vec::new()),
            Body::Bytes(data) => Ok(data),
            Body::Reader(mut r) => {
                let mut data = Vec::new();
                r.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(data) => write!(f, "Body::Bytes({} bytes)", data.len()),
            Body::Reader(_) => f.write_str("Body::Reader(..)"),
        }
    }
}

/// One CoAP request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: CoapUrl,
    /// Empty tokens get a fresh random one assigned by the transport.
    /// Cancel-observe requests set this to the observed token instead.
    pub token: Token,
    pub options: Options,
    /// Send as CON instead of NON. Pings are always confirmable.
    pub confirmable: bool,
    pub body: Body,
    /// Optional user cancel signal, merged with the client's deadline.
    pub cancel: Option<CancelToken>,
}

impl Request {
    pub fn new(method: Method, url: &str, body: Body) -> Result<Request, Error> {
        let url = CoapUrl::parse(url)?;
        Ok(Request {
            method,
            url,
            token: Token::empty(),
            options: Options::new(),
            confirmable: method == Method::Ping,
            body,
            cancel: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_is_confirmable_by_default() {
        let req = Request::new(Method::Ping, "coap+uart://any", Body::empty()).unwrap();
        assert!(req.confirmable);
        let req = Request::new(Method::Get, "coap+uart://COM3/x", Body::empty()).unwrap();
        assert!(!req.confirmable);
    }

    #[test]
    fn body_drain() {
        let mut body = Body::bytes("payload");
        assert_eq!(body.drain().unwrap(), b"payload");
        // Draining consumes; a second drain sees the released body.
        assert_eq!(body.drain().unwrap(), b"");

        let mut body = Body::reader(std::io::Cursor::new(vec![1, 2, 3]));
        assert_eq!(body.drain().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn method_strings() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("PING".parse::<Method>().unwrap(), Method::Ping);
        assert!("HEAD".parse::<Method>().is_err());
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }
}
