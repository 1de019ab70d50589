//! A client-side CoAP engine that speaks `coap+uart://`: CoAP request/
//! response exchanges and Observe subscriptions against devices on a
//! serial line.
//!
//! # Overview
//!
//! The [`Client`] is the front door: it gates parallelism, applies the
//! per-request deadline and offers the convenience methods
//! ([`Client::get`], [`Client::post`], [`Client::observe`], ...). Below
//! it, a [`RoundTripper`] maps one [`Request`] to one [`Response`]; the
//! [`UartTransport`] implementation builds the wire message, acquires a
//! connection to the device and drives the exchange.
//!
//! Each open device is one connection with a background reader that
//! decodes COBS-framed messages and routes them by token (or, for
//! token-less ACK/RST, by message id) to the *interaction* they belong
//! to, the state machine of one logical exchange. Piggybacked responses,
//! separate responses and Observe notification streams all resolve
//! inside the interaction; several interactions multiplex freely over
//! one serial line.
//!
//! ```no_run
//! # async fn run() -> Result<(), couart::Error> {
//! let client = couart::Client::new();
//! let mut res = client.get("coap+uart://ttyUSB0/sensors/temperature").await?;
//! println!("{}: {:?}", res.status, res.body.read_to_vec());
//!
//! let mut obs = client.observe("coap+uart://ttyUSB0/sensors/door").await?;
//! while let Some(next) = obs.next().await {
//!     println!("notified: {}", next.status);
//! }
//! # Ok(()) }
//! ```

pub mod cancel;
pub mod client;
pub mod connection;
pub mod error;
mod framing;
mod interaction;
pub mod request;
pub mod response;
pub mod serial;
pub mod token;
pub mod transport;
pub mod url;

pub use cancel::CancelToken;
pub use client::{Client, NSTART};
pub use connection::Connection;
pub use error::Error;
pub use request::{Body, Method, Request};
pub use response::{Response, ResponseBody};
pub use serial::{Connecter, SerialConnecter};
pub use token::{RandomTokenSource, TokenSource};
pub use transport::{RoundTripper, Timing, UartTransport};
pub use url::{CoapUrl, UART_SCHEME};

pub use couart_msg as msg;
