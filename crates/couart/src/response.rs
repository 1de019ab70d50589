//! Engine-level responses, including the notification stream handle for
//! observations.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use couart_msg::{Message, Options};
use log::debug;
use tokio::sync::mpsc;

use crate::cancel::{CancelToken, StopTimer};
use crate::error::Error;
use crate::interaction::Interaction;
use crate::request::Request;

/// One CoAP response.
///
/// For observations, [`Response::next`] yields the follow-up responses;
/// the stream ends when the observation does (consumer gone, error-class
/// notification, cancel, or deadline).
pub struct Response {
    /// Raw code byte, e.g. 69 for 2.05.
    pub status_code: u8,
    /// Human readable status, e.g. `"2.05 Content"`.
    pub status: String,
    pub options: Options,
    pub body: ResponseBody,
    pub request: Arc<Request>,
    next: Option<mpsc::Receiver<Response>>,
    observation: Option<Observation>,
}

impl Response {
    pub(crate) fn from_message(request: Arc<Request>, msg: &Message) -> Response {
        let name = msg.code.name();
        let status = if name.is_empty() {
            msg.code.to_string()
        } else {
            format!("{} {}", msg.code, name)
        };
        Response {
            status_code: msg.code.number(),
            status,
            options: msg.options().clone(),
            body: ResponseBody::bytes(msg.payload.clone()),
            request,
            next: None,
            observation: None,
        }
    }

    pub(crate) fn set_next(&mut self, next: mpsc::Receiver<Response>) {
        self.next = Some(next);
    }

    pub(crate) fn set_observation(&mut self, observation: Observation) {
        self.observation = Some(observation);
    }

    /// True while this response heads an active observation.
    pub fn is_observing(&self) -> bool {
        self.next.is_some()
    }

    /// The next notification response.
    ///
    /// `None` means the stream is closed: the observation ended or the
    /// notify loop gave up on an absent consumer.
    pub async fn next(&mut self) -> Option<Response> {
        self.next.as_mut()?.recv().await
    }

    /// Tears the observation down (stops the notify loop, waiting for it
    /// to exit) and releases the body. Without an observation this only
    /// stops the deadline timer.
    ///
    /// This does not tell the server to stop sending; use
    /// `Client::cancel_observe` for a graceful deregistration first.
    pub async fn close(&mut self) {
        if let Some(observation) = self.observation.take() {
            debug!("closing observe response, stopping notify loop");
            observation.interaction.stop_notifications().await;
        }
        self.next = None;
        self.body.close();
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("observing", &self.is_observing())
            .finish_non_exhaustive()
    }
}

/// Handle from an observe response back to its interaction.
pub(crate) struct Observation {
    pub(crate) interaction: Arc<Interaction>,
}

/// A response payload.
///
/// Reading to the end (or closing, or dropping) stops the request's
/// deadline timer, so a `Client` timeout does not keep ticking once the
/// body has been consumed. A read failure after the request was cancelled
/// surfaces as a timeout-tagged error.
pub struct ResponseBody {
    inner: Box<dyn Read + Send>,
    stop: Option<StopTimer>,
    cancel: Option<CancelToken>,
}

impl ResponseBody {
    pub(crate) fn bytes(data: Vec<u8>) -> ResponseBody {
        ResponseBody {
            inner: Box::new(io::Cursor::new(data)),
            stop: None,
            cancel: None,
        }
    }

    pub(crate) fn attach_timer(&mut self, stop: StopTimer, cancel: CancelToken) {
        self.stop = Some(stop);
        self.cancel = Some(cancel);
    }

    fn stop_timer(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.stop();
        }
    }

    /// Stops the deadline timer and releases the underlying reader.
    pub fn close(&mut self) {
        self.stop_timer();
        self.inner = Box::new(io::empty());
    }

    /// Reads the remaining payload to the end.
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) => {
                self.stop_timer();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                self.stop_timer();
                if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        Error::Timeout {
                            while_reading_body: true,
                        },
                    ));
                }
                Err(err)
            }
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
