//! The client: parallelism governor, deadlines, and the convenience
//! request surface.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use couart_msg::OptionNumber;
use log::debug;

use crate::cancel::{spawn_deadline_watcher, CancelToken};
use crate::error::Error;
use crate::request::{Body, Method, Request};
use crate::response::Response;
use crate::transport::{RoundTripper, UartTransport};

/// Default parallel request limit. The CoAP NSTART default is 1, but
/// interactions are demultiplexed by token, so more are supported.
pub const NSTART: u32 = 5;

/// A CoAP client.
///
/// Clients cache connections through their transport, so reuse one
/// instead of creating them per request. A `Client` is safe for
/// concurrent use.
pub struct Client {
    transport: Box<dyn RoundTripper>,
    /// Per-request deadline covering the round trip and the response
    /// body. `None` means no deadline.
    pub timeout: Option<Duration>,
    /// Parallel request limit; 0 disables the limit.
    pub max_parallel: u32,
    running: Mutex<u32>,
}

impl Client {
    pub fn new() -> Client {
        Client::with_transport(Box::new(UartTransport::new()))
    }

    pub fn with_transport(transport: Box<dyn RoundTripper>) -> Client {
        Client {
            transport,
            timeout: None,
            max_parallel: NSTART,
            running: Mutex::new(0),
        }
    }

    /// Executes one request, subject to the parallel limit and the
    /// client deadline.
    pub async fn send(&self, req: Request) -> Result<Response, Error> {
        let _slot = self.acquire_slot()?;
        self.dispatch(req).await
    }

    fn acquire_slot(&self) -> Result<Slot<'_>, Error> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.max_parallel != 0 && *running >= self.max_parallel {
            return Err(Error::ParallelLimitExceeded(self.max_parallel));
        }
        *running += 1;
        debug!("{} of {} request slots in use", *running, self.max_parallel);
        Ok(Slot(self))
    }

    async fn dispatch(&self, req: Request) -> Result<Response, Error> {
        let user = req.cancel.clone();
        let (cancel, stop) = match self.timeout {
            Some(timeout) => {
                let cancel = CancelToken::new();
                let stop = spawn_deadline_watcher(timeout, user, cancel.clone());
                (cancel, Some(stop))
            }
            // Without a deadline the user's signal (if any) cancels
            // directly.
            None => (user.unwrap_or_default(), None),
        };

        match self.transport.round_trip(req, cancel.clone()).await {
            Ok(mut res) => {
                if let Some(stop) = stop {
                    // The timer keeps running until the body is consumed
                    // or closed.
                    res.body.attach_timer(stop, cancel);
                }
                Ok(res)
            }
            Err(err) => {
                if let Some(stop) = stop {
                    stop.stop();
                }
                Err(err)
            }
        }
    }

    /// Issues a GET to the given URL.
    pub async fn get(&self, url: &str) -> Result<Response, Error> {
        self.send(Request::new(Method::Get, url, Body::empty())?).await
    }

    /// Issues a POST carrying `body` tagged with a Content-Format.
    pub async fn post(
        &self,
        url: &str,
        content_format: u16,
        body: Body,
    ) -> Result<Response, Error> {
        let mut req = Request::new(Method::Post, url, body)?;
        req.options
            .set_uint(OptionNumber::CONTENT_FORMAT, u64::from(content_format));
        self.send(req).await
    }

    /// Issues a PUT carrying `body` tagged with a Content-Format.
    pub async fn put(&self, url: &str, content_format: u16, body: Body) -> Result<Response, Error> {
        let mut req = Request::new(Method::Put, url, body)?;
        req.options
            .set_uint(OptionNumber::CONTENT_FORMAT, u64::from(content_format));
        self.send(req).await
    }

    /// Issues a DELETE to the given URL.
    pub async fn delete(&self, url: &str) -> Result<Response, Error> {
        self.send(Request::new(Method::Delete, url, Body::empty())?)
            .await
    }

    /// Pings a device: an empty confirmable message the peer answers
    /// with RST. `host` should be scheme and host only; any path is
    /// ignored by well-behaved peers but bloats the message.
    pub async fn ping(&self, host: &str) -> Result<Response, Error> {
        self.send(Request::new(Method::Ping, host, Body::empty())?)
            .await
    }

    /// Issues a GET with `Observe=0`, registering for notifications.
    ///
    /// On success the response's `next` stream yields the follow-up
    /// notifications; [`Client::cancel_observe`] or closing the response
    /// stops the observation.
    pub async fn observe(&self, url: &str) -> Result<Response, Error> {
        let mut req = Request::new(Method::Get, url, Body::empty())?;
        // Register over CON: the registration response rides the ACK and
        // lands on the regular queue, not the notification queue.
        req.confirmable = true;
        req.options.set_uint(OptionNumber::OBSERVE, 0);
        self.send(req).await
    }

    /// Tells the device to stop notifying about the resource behind
    /// `response`: a GET with `Observe=1` reusing the observed token.
    pub async fn cancel_observe(&self, response: &Response) -> Result<Response, Error> {
        let mut req = Request::new(
            Method::Get,
            &response.request.url.to_string(),
            Body::empty(),
        )?;
        req.options.set_uint(OptionNumber::OBSERVE, 1);
        req.token = response.request.token.clone();
        self.send(req).await
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

/// RAII slot in the parallel request gate.
struct Slot<'a>(&'a Client);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut running = self
            .0
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *running = running.saturating_sub(1);
    }
}
