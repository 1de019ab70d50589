//! One logical CoAP exchange, keyed by its token.
//!
//! An interaction is created with a request and normally ends with a
//! response. For observe, several requests (register, deregister) and many
//! responses (notifications) belong to the same interaction.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use couart_msg::{Message, OptionNumber, Token, Type};
use log::{debug, info, warn};
use maitake_sync::WaitQueue;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::cancel::CancelToken;
use crate::connection;
use crate::error::Error;
use crate::transport::Timing;

/// Per-queue backlog an interaction tolerates before it is considered
/// beyond recovery.
const QUEUE_CAPACITY: usize = 10;

/// State machine of one exchange. Owned by its connection; holds a
/// non-owning handle back for writes and self-removal.
pub(crate) struct Interaction {
    /// The initial request message.
    req: Message,
    /// Matches ACK/RST that arrive without a token.
    last_message_id: AtomicU16,
    conn: Weak<connection::Shared>,
    timing: Timing,

    receive_tx: Mutex<Option<mpsc::Sender<Message>>>,
    receive_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    observe_tx: Mutex<Option<mpsc::Sender<Message>>>,
    observe_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,

    is_observe: AtomicBool,
    /// Hands decoded notification messages to the transport's pump.
    notifications: Mutex<Option<mpsc::Receiver<Message>>>,
    stop: Mutex<Option<StopNotify>>,
    closed: AtomicBool,
    /// At most one round trip runs on an interaction at a time.
    round_trip_lock: tokio::sync::Mutex<()>,
}

/// Stops the notify loop and lets the stopper wait until it has fully
/// exited, so the reader cannot hand bytes to a stale consumer.
struct StopNotify {
    stop: Arc<WaitQueue>,
    done: Arc<WaitQueue>,
}

/// How a confirmable exchange concluded.
enum Flow {
    /// A complete answer that skips the observe and token checks (the
    /// RST answering a ping).
    Final(Message),
    /// A regular response message.
    Response(Message),
}

impl Interaction {
    pub(crate) fn new(req: Message, conn: Weak<connection::Shared>, timing: Timing) -> Interaction {
        let (receive_tx, receive_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (observe_tx, observe_rx) = mpsc::channel(QUEUE_CAPACITY);
        Interaction {
            last_message_id: AtomicU16::new(req.message_id),
            req,
            conn,
            timing,
            receive_tx: Mutex::new(Some(receive_tx)),
            receive_rx: tokio::sync::Mutex::new(receive_rx),
            observe_tx: Mutex::new(Some(observe_tx)),
            observe_rx: tokio::sync::Mutex::new(Some(observe_rx)),
            is_observe: AtomicBool::new(false),
            notifications: Mutex::new(None),
            stop: Mutex::new(None),
            closed: AtomicBool::new(false),
            round_trip_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn token(&self) -> &Token {
        &self.req.token
    }

    pub(crate) fn last_message_id(&self) -> u16 {
        self.last_message_id.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_observing(&self) -> bool {
        self.is_observe.load(Ordering::SeqCst)
    }

    /// The notification message stream, available once after the observe
    /// upgrade.
    pub(crate) fn take_notifications(&self) -> Option<mpsc::Receiver<Message>> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Queues one inbound message. Answers `false` when the target queue
    /// is full; messages to closed queues are dropped silently.
    pub(crate) fn enqueue(&self, msg: Message, observe: bool) -> bool {
        let slot = if observe {
            &self.observe_tx
        } else {
            &self.receive_tx
        };
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return true;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
        }
    }

    async fn send(&self, msg: &Message) -> Result<(), Error> {
        match self.conn.upgrade() {
            Some(conn) => conn.send(msg).await,
            None => Err(Error::TransportClosed),
        }
    }

    /// Blocks on the regular receive queue until a message arrives, the
    /// window elapses, or the request is cancelled.
    async fn read_message(
        &self,
        cancel: &CancelToken,
        window: std::time::Duration,
    ) -> Result<Message, Error> {
        let mut rx = self.receive_rx.lock().await;
        select! {
            msg = rx.recv() => msg.ok_or(Error::TransportClosed),
            _ = cancel.cancelled() => Err(Error::Timeout { while_reading_body: false }),
            _ = sleep(window) => Err(Error::Timeout { while_reading_body: false }),
        }
    }

    /// Drives one request/response exchange on this interaction.
    ///
    /// CON requests are sent once; there is no retransmission on a lost
    /// ACK, the ACK window simply expires.
    pub(crate) async fn round_trip(
        self: &Arc<Self>,
        cancel: &CancelToken,
        req_msg: Message,
    ) -> Result<Message, Error> {
        let _guard = self
            .round_trip_lock
            .try_lock()
            .map_err(|_| Error::InteractionBusy(self.token().clone()))?;

        // A round trip on an observing interaction can only be the
        // deregistration. The notify loop must quiesce first, else it
        // eats the responses meant for this exchange.
        if req_msg
            .options()
            .get(OptionNumber::OBSERVE)
            .as_uint()
            .unwrap_or(0)
            > 0
        {
            self.is_observe.store(false, Ordering::SeqCst);
            self.stop_notifications().await;
        }

        self.last_message_id.store(req_msg.message_id, Ordering::SeqCst);
        self.send(&req_msg).await?;

        let res = match req_msg.ty {
            Type::Confirmable => match self.confirmable_exchange(cancel, &req_msg).await? {
                // Ping: the RST is the answer, nothing further to
                // validate.
                Flow::Final(res) => return Ok(res),
                Flow::Response(res) => res,
            },
            Type::NonConfirmable => self.non_confirmable_exchange(cancel, &req_msg).await?,
            other => {
                return Err(Error::InvalidRequest(format!(
                    "request message must be CON or NON, not {other}"
                )))
            }
        };

        // Observe upgrade: request asked with Observe=0 and the response
        // carries any Observe value.
        let req_observe = req_msg.options().get(OptionNumber::OBSERVE);
        if req_observe.is_set()
            && req_observe.as_uint() == Some(0)
            && res.options().get(OptionNumber::OBSERVE).is_set()
        {
            self.start_notify_loop(cancel.clone());
        }

        if res.token != req_msg.token {
            return Err(Error::TokenMismatch {
                sent: req_msg.token.clone(),
                got: res.token.clone(),
            });
        }
        Ok(res)
    }

    async fn confirmable_exchange(
        &self,
        cancel: &CancelToken,
        req_msg: &Message,
    ) -> Result<Flow, Error> {
        let res = self.read_message(cancel, self.timing.ack_timeout).await?;
        validate_message_id(req_msg, &res)?;

        // An empty request code is a ping, answered with RST.
        if req_msg.code.is_empty() && res.ty == Type::Reset {
            return Ok(Flow::Final(res));
        }
        if res.ty != Type::Acknowledgement {
            return Err(Error::UnexpectedType {
                expected: "ACK",
                got: res.ty,
            });
        }

        if !res.code.is_empty() {
            // Piggybacked response. No ACK from us: if the peer's ACK got
            // lost it retransmits the request, not we the ACK.
            return Ok(Flow::Response(res));
        }

        // Empty ACK: the actual response comes separately.
        //
        //  Client              Server
        //    |   CON [0x7a10]   |
        //    | GET /temperature |
        //    +----------------->|
        //    |   ACK [0x7a10]   |
        //    |<-----------------+  <- we are here
        //    ... time passes ...
        //    |   CON [0x23bb]   |
        //    |   2.05 Content   |
        //    |<-----------------+
        //    |   ACK [0x23bb]   |
        //    +----------------->|
        let res = self
            .read_message(cancel, self.timing.postponed_response_timeout)
            .await?;
        match res.ty {
            Type::Confirmable => {
                self.send(&Message::ack(res.message_id)).await?;
                Ok(Flow::Response(res))
            }
            Type::NonConfirmable => Ok(Flow::Response(res)),
            other => Err(Error::UnexpectedType {
                expected: "CON or NON",
                got: other,
            }),
        }
    }

    async fn non_confirmable_exchange(
        &self,
        cancel: &CancelToken,
        req_msg: &Message,
    ) -> Result<Message, Error> {
        let res = self.read_message(cancel, self.timing.ack_timeout).await?;
        validate_message_id(req_msg, &res)?;
        if res.ty != Type::NonConfirmable {
            return Err(Error::UnexpectedType {
                expected: "NON",
                got: res.ty,
            });
        }
        Ok(res)
    }

    /// Spawns the notify loop for a fresh observation.
    fn start_notify_loop(self: &Arc<Self>, parent: CancelToken) {
        self.is_observe.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(1);
        *self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(rx);

        let stop = Arc::new(WaitQueue::new());
        let done = Arc::new(WaitQueue::new());
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(StopNotify {
            stop: stop.clone(),
            done: done.clone(),
        });

        tokio::spawn(self.clone().notify_loop(parent, tx, stop, done));
    }

    /// Consumes notification messages for the observation's lifetime.
    ///
    /// Each notification is handed to the consumer within a bounded
    /// window; a CON notification is acknowledged only after a successful
    /// handoff. An error-class notification ends the observation, as does
    /// a vanished consumer or a fired parent cancel (both answered with
    /// RST so the server drops this observer).
    async fn notify_loop(
        self: Arc<Self>,
        parent: CancelToken,
        tx: mpsc::Sender<Message>,
        stop: Arc<WaitQueue>,
        done: Arc<WaitQueue>,
    ) {
        let Some(mut rx) = self.observe_rx.lock().await.take() else {
            warn!("token {}: notify loop already consumed", self.token());
            done.close();
            return;
        };

        let mut last_mid: Option<u16> = None;
        loop {
            let msg = select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break, // interaction closed under us
                },
                _ = stop.wait() => {
                    info!("token {}: stopped listening for notifications", self.token());
                    break;
                }
                _ = parent.cancelled() => {
                    info!("token {}: observer cancelled, sending RST", self.token());
                    if let Some(mid) = last_mid {
                        let _ = self.send(&Message::rst(mid)).await;
                    }
                    break;
                }
            };

            if msg.options().get(OptionNumber::OBSERVE).is_not_set() {
                warn!(
                    "token {}: non-observe message in notify loop, mid {:#06x}",
                    self.token(),
                    msg.message_id
                );
            }

            last_mid = Some(msg.message_id);
            let mid = msg.message_id;
            let ty = msg.ty;
            let is_error = msg.code.is_error();

            let delivered = select! {
                sent = timeout(self.timing.notification_handoff_timeout, tx.send(msg)) => {
                    matches!(sent, Ok(Ok(())))
                }
                _ = parent.cancelled() => {
                    info!("token {}: observer cancelled during handoff, sending RST", self.token());
                    let _ = self.send(&Message::rst(mid)).await;
                    break;
                }
            };
            if !delivered {
                // Nobody took the notification in time. Even
                // non-confirmable messages may be answered with RST.
                warn!(
                    "token {}: {}, sending RST",
                    self.token(),
                    Error::ObserverGone
                );
                let _ = self.send(&Message::rst(mid)).await;
                break;
            }

            if ty == Type::Confirmable {
                if let Err(err) = self.send(&Message::ack(mid)).await {
                    warn!("token {}: failed to ACK notification: {err}", self.token());
                    break;
                }
            }

            if is_error {
                // The server notifies errors (4.04 when the resource
                // disappears) and then must remove the observer; the RST
                // cannot harm.
                info!(
                    "token {}: error-class notification ends the observation",
                    self.token()
                );
                let _ = self.send(&Message::rst(mid)).await;
                break;
            }
        }

        self.is_observe.store(false, Ordering::SeqCst);
        done.close();
        // Dropping tx here closes the notification stream.
    }

    /// Fires the notify loop's stop signal and waits until the loop has
    /// fully exited.
    pub(crate) async fn stop_notifications(&self) {
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(StopNotify { stop, done }) = stop {
            stop.close();
            let _ = done.wait().await;
            debug!("token {}: notify loop quiesced", self.token());
        }
    }

    /// Closes the interaction: idempotent, final.
    ///
    /// Drops both receive queues, stops a running notify loop (without
    /// waiting), removes the interaction from its connection, and closes
    /// the connection when nothing is left on it.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("interaction {} already closed", self.token());
            return;
        }
        debug!("closing interaction, token {}", self.token());

        if let Some(StopNotify { stop, .. }) = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            stop.close();
        }

        *self
            .receive_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .observe_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(conn) = self.conn.upgrade() {
            conn.remove_interaction(self.token());
            if conn.interaction_count() == 0 {
                debug!("{}: no interactions left, closing connection", conn.name());
                conn.close();
            }
        }
    }
}

fn validate_message_id(req: &Message, res: &Message) -> Result<(), Error> {
    if req.message_id != res.message_id {
        return Err(Error::MessageIdMismatch {
            sent: req.message_id,
            got: res.message_id,
        });
    }
    Ok(())
}
