//! One open serial device: a background reader turning bytes into
//! messages and routing them to interactions, ordered outbound writes,
//! and the registry of live interactions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use couart_msg::{Message, OptionNumber, Token, Type};
use log::{debug, error, warn};
use maitake_sync::WaitQueue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;

use crate::error::Error;
use crate::framing::{encode_frame, FrameAccumulator};
use crate::interaction::Interaction;
use crate::transport::Timing;

/// Largest COBS-decoded frame the reader accepts.
const MAX_FRAME: usize = 2048;

/// The read half a provider hands to [`Connection::spawn`].
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;
/// The write half a provider hands to [`Connection::spawn`].
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A cloneable handle to one open device.
///
/// The connection stays open while interactions are live on it; the last
/// interaction to close takes the connection down with it.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    name: String,
    interactions: Mutex<Vec<Arc<Interaction>>>,
    writer: tokio::sync::Mutex<Writer>,
    closer: WaitQueue,
    closed: AtomicBool,
}

impl Connection {
    /// Wraps an opened byte stream and spawns its reader task.
    pub fn spawn(name: String, reader: Reader, writer: Writer) -> Connection {
        let shared = Arc::new(Shared {
            name,
            interactions: Mutex::new(Vec::new()),
            writer: tokio::sync::Mutex::new(writer),
            closer: WaitQueue::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(shared.clone(), reader));
        Connection { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the device, failing whatever is still in flight on it.
    pub fn close(&self) {
        self.shared.close_all();
    }

    pub fn interaction_count(&self) -> usize {
        self.shared.interaction_count()
    }

    /// Live interaction for `token`, if any. Cancel-observe reuses the
    /// observed interaction through this lookup.
    pub(crate) fn find_interaction(&self, token: &Token) -> Option<Arc<Interaction>> {
        self.shared.find_interaction(token, None)
    }

    pub(crate) fn start_interaction(&self, req: Message, timing: Timing) -> Arc<Interaction> {
        let ia = Arc::new(Interaction::new(req, Arc::downgrade(&self.shared), timing));
        debug!("starting interaction, token {}", ia.token());
        self.shared
            .interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ia.clone());
        ia
    }

    pub(crate) fn tokens(&self) -> Vec<Token> {
        self.shared
            .interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|ia| ia.token().clone())
            .collect()
    }
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Encodes, frames and writes one message. Writes are serialized by
    /// the writer lock.
    pub(crate) async fn send(&self, msg: &Message) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let frame = encode_frame(&msg.to_bytes()?);
        debug!(
            "{}: send {} {} mid {:#06x} token {}",
            self.name, msg.ty, msg.code, msg.message_id, msg.token
        );
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|_| Error::TransportClosed)?;
        writer.flush().await.map_err(|_| Error::TransportClosed)?;
        Ok(())
    }

    /// Dispatch target for one inbound message: token match first, then
    /// the empty-token fallback on the last message id (ACK/RST for a CON
    /// carry no token).
    fn find_interaction(&self, token: &Token, message_id: Option<u16>) -> Option<Arc<Interaction>> {
        let interactions = self
            .interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for ia in interactions.iter() {
            if ia.is_closed() {
                continue;
            }
            if ia.token() == token {
                return Some(ia.clone());
            }
            if token.is_empty() && message_id.is_some_and(|mid| ia.last_message_id() == mid) {
                return Some(ia.clone());
            }
        }
        None
    }

    pub(crate) fn remove_interaction(&self, token: &Token) {
        self.interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|ia| ia.token() != token);
    }

    pub(crate) fn interaction_count(&self) -> usize {
        self.interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{}: closing connection", self.name);
        self.closer.close();
    }

    /// Stream death: close the connection and every interaction still on
    /// it, which closes their queues and fails pending reads.
    fn close_all(&self) {
        self.close();
        let interactions: Vec<_> = self
            .interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for ia in interactions {
            ia.close();
        }
    }
}

/// A notification is an observe response when it could carry one: CON or
/// NON with the Observe option present.
fn is_observe_response(msg: &Message) -> bool {
    matches!(msg.ty, Type::Confirmable | Type::NonConfirmable)
        && msg.options().get(OptionNumber::OBSERVE).is_set()
}

async fn read_loop(shared: Arc<Shared>, mut reader: Reader) {
    let mut acc = FrameAccumulator::new(MAX_FRAME);
    let mut buf = vec![0u8; 4096].into_boxed_slice();

    loop {
        let n = select! {
            r = reader.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = shared.closer.wait() => return,
        };
        acc.feed(&buf[..n], |frame| match Message::from_bytes(frame) {
            Ok(msg) => dispatch(&shared, msg),
            Err(err) => warn!("{}: dropping undecodable frame: {err}", shared.name()),
        });
    }

    warn!("{}: stream closed, shutting down", shared.name());
    shared.close_all();
}

fn dispatch(shared: &Shared, msg: Message) {
    debug!(
        "{}: recv {} {} mid {:#06x} token {}",
        shared.name(),
        msg.ty,
        msg.code,
        msg.message_id,
        msg.token
    );
    let Some(ia) = shared.find_interaction(&msg.token, Some(msg.message_id)) else {
        warn!(
            "{}: orphan message dropped, token {} mid {:#06x}",
            shared.name(),
            msg.token,
            msg.message_id
        );
        return;
    };

    let observe = is_observe_response(&msg);
    if !ia.enqueue(msg, observe) {
        // Backpressure violated; the conversation is beyond recovery.
        error!(
            "{}: interaction {} did not keep up with incoming messages, closing it",
            shared.name(),
            ia.token()
        );
        ia.close();
    }
}
