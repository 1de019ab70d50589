//! The UART round-trip layer: request → message, connection acquisition,
//! interaction lookup, response assembly, notification pumping.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use couart_msg::{Message, OptionNumber, Type};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::interaction::Interaction;
use crate::request::Request;
use crate::response::{Observation, Response};
use crate::serial::{Connecter, SerialConnecter};
use crate::token::{RandomTokenSource, TokenSource};
use crate::url::UART_SCHEME;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The ability to execute a single CoAP transaction, obtaining the
/// response for a given request.
///
/// A `RoundTripper` returns `Ok` whenever it obtained a response,
/// regardless of the response's CoAP status code. It consumes the
/// request's body but interprets nothing else. Implementations must be
/// safe for concurrent use. Future transports (UDP, DTLS) plug in here.
pub trait RoundTripper: Send + Sync {
    fn round_trip(&self, req: Request, cancel: CancelToken) -> BoxFuture<'_, Result<Response, Error>>;
}

/// Protocol timing knobs, adjustable per transport.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Window for the first answer to a CON or NON request.
    pub ack_timeout: Duration,
    /// How long to wait for the real response after an empty ACK
    /// announced it will come separately.
    pub postponed_response_timeout: Duration,
    /// How long a notification may wait for its consumer before the
    /// observation is torn down.
    pub notification_handoff_timeout: Duration,
    /// Delay before an observe interaction is force-closed after its
    /// notify loop exits, leaving room for a deregister ACK in flight.
    pub observe_close_grace: Duration,
}

impl Default for Timing {
    fn default() -> Timing {
        Timing {
            ack_timeout: Duration::from_secs(2),
            postponed_response_timeout: Duration::from_secs(30),
            notification_handoff_timeout: Duration::from_secs(5),
            observe_close_grace: Duration::from_secs(3),
        }
    }
}

/// CoAP over a serial port.
///
/// The request URL names the device: `coap+uart://COM3/...` on Windows,
/// `coap+uart://ttyS2/...` on POSIX (the `/dev/` prefix is implied, a
/// host cannot contain a slash), or `coap+uart://any/...` for the first
/// available port.
pub struct UartTransport {
    connecter: Box<dyn Connecter>,
    tokens: Box<dyn TokenSource>,
    timing: Timing,
    last_message_id: Mutex<u16>,
}

impl UartTransport {
    pub fn new() -> UartTransport {
        UartTransport::with_connecter(Box::new(SerialConnecter::new()))
    }

    /// A transport on a custom serial provider (tests plug an in-memory
    /// one in here).
    pub fn with_connecter(connecter: Box<dyn Connecter>) -> UartTransport {
        UartTransport {
            connecter,
            tokens: Box::new(RandomTokenSource),
            timing: Timing::default(),
            last_message_id: Mutex::new(0),
        }
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    fn next_message_id(&self) -> u16 {
        let mut last = self
            .last_message_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = last.wrapping_add(1);
        *last
    }

    /// Builds the wire message for a request, draining its body.
    fn build_request_message(&self, req: &mut Request) -> Result<Message, Error> {
        let ty = if req.confirmable {
            Type::Confirmable
        } else {
            Type::NonConfirmable
        };
        let mut msg = Message::new(ty, req.method.code(), self.next_message_id());
        msg.token = req.token.clone();
        msg.set_options(req.options.clone());
        msg.set_path(req.url.path());

        // The URL's query wins over anything pre-set on the request.
        msg.options_mut().clear(OptionNumber::URI_QUERY);
        for q in req.url.raw_query().split('&').filter(|q| !q.is_empty()) {
            msg.options_mut()
                .add(OptionNumber::URI_QUERY, q.as_bytes().to_vec());
        }

        msg.payload = req.body.drain()?;
        Ok(msg)
    }

    async fn round_trip_inner(
        &self,
        mut req: Request,
        cancel: CancelToken,
    ) -> Result<Response, Error> {
        if req.url.scheme() != UART_SCHEME {
            return Err(Error::InvalidRequest(format!(
                "invalid URL scheme, expected {UART_SCHEME} but got: {}",
                req.url.scheme()
            )));
        }

        // The caller may pin a token, e.g. to cancel an observe; everyone
        // else gets a random one.
        if req.token.is_empty() {
            req.token = self.tokens.next_token();
        }

        let req_msg = self.build_request_message(&mut req)?;
        let conn = self.connecter.connect(req.url.host())?;
        debug!(
            "{}: {} live interactions: {:?}",
            conn.name(),
            conn.interaction_count(),
            conn.tokens()
        );

        // Cancelling an observe must reuse the observed interaction.
        let ia = match conn.find_interaction(&req.token) {
            Some(ia) => ia,
            None => conn.start_interaction(req_msg.clone(), self.timing.clone()),
        };

        let req = Arc::new(req);
        let res_msg = match ia.round_trip(&cancel, req_msg).await {
            Ok(res_msg) => res_msg,
            Err(err) => {
                ia.close();
                return Err(Error::Interaction {
                    token: ia.token().clone(),
                    source: Box::new(err),
                });
            }
        };

        let mut res = Response::from_message(req.clone(), &res_msg);

        if ia.is_observing() {
            match ia.take_notifications() {
                Some(notifications) => {
                    let (next_tx, next_rx) = mpsc::channel(1);
                    res.set_next(next_rx);
                    res.set_observation(Observation {
                        interaction: ia.clone(),
                    });
                    tokio::spawn(pump_notifications(
                        ia,
                        req,
                        notifications,
                        next_tx,
                        self.timing.clone(),
                    ));
                }
                None => {
                    warn!(
                        "token {}: observing but the notification stream is taken",
                        ia.token()
                    );
                    ia.close();
                }
            }
        } else {
            ia.close();
        }

        Ok(res)
    }
}

impl Default for UartTransport {
    fn default() -> UartTransport {
        UartTransport::new()
    }
}

impl RoundTripper for UartTransport {
    fn round_trip(&self, req: Request, cancel: CancelToken) -> BoxFuture<'_, Result<Response, Error>> {
        Box::pin(self.round_trip_inner(req, cancel))
    }
}

/// Translates notification messages into responses on the observe
/// response's `next` stream. Owns the interaction's final close.
async fn pump_notifications(
    ia: Arc<Interaction>,
    req: Arc<Request>,
    mut notifications: mpsc::Receiver<Message>,
    next_tx: mpsc::Sender<Response>,
    timing: Timing,
) {
    loop {
        let Some(msg) = notifications.recv().await else {
            // The notify loop exited; no more notifies expected.
            info!("token {}: notification stream ended", ia.token());
            break;
        };
        let res = Response::from_message(req.clone(), &msg);
        let handed = timeout(timing.notification_handoff_timeout, next_tx.send(res)).await;
        if !matches!(handed, Ok(Ok(()))) {
            warn!(
                "token {}: {}, stopping the notification pump",
                ia.token(),
                Error::ObserverGone
            );
            break;
        }
    }

    // Dropping next_tx closes the response's `next` stream.
    drop(next_tx);

    // Closing right away could still cut off the ACK of a deregister
    // exchange; give it a moment.
    sleep(timing.observe_close_grace).await;
    if !ia.is_closed() {
        ia.close();
    }
}
