//! In-memory serial link: a connecter for the engine side and a scripted
//! peer driving the far end of the wire.

use std::sync::{Arc, Mutex};

use couart::msg::Message;
use couart::{Connecter, Connection, Error};
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// One wire: the engine connects through the [`MockConnecter`], the test
/// plays the device through the [`Peer`].
pub fn link() -> (MockConnecter, Peer) {
    let (near, far) = duplex(4096);
    let (near_r, near_w) = split(near);
    let (far_r, far_w) = split(far);
    (
        MockConnecter {
            inner: Arc::new(Mutex::new(MockInner {
                halves: Some((near_r, near_w)),
                conn: None,
            })),
        },
        Peer {
            reader: far_r,
            writer: far_w,
            buf: Vec::new(),
        },
    )
}

#[derive(Clone)]
pub struct MockConnecter {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    halves: Option<(ReadHalf<DuplexStream>, WriteHalf<DuplexStream>)>,
    conn: Option<Connection>,
}

impl MockConnecter {
    /// The connection the engine opened, once it has.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock().unwrap().conn.clone()
    }
}

impl Connecter for MockConnecter {
    fn connect(&self, host: &str) -> Result<Connection, Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conn) = &inner.conn {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let (reader, writer) = inner
            .halves
            .take()
            .ok_or_else(|| Error::Serial("mock port exhausted".to_string()))?;
        let conn = Connection::spawn(host.to_string(), Box::new(reader), Box::new(writer));
        inner.conn = Some(conn.clone());
        Ok(conn)
    }
}

/// The device side of the wire, speaking raw COBS-framed messages.
pub struct Peer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    buf: Vec<u8>,
}

impl Peer {
    pub async fn recv(&mut self) -> Message {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == 0) {
                let frame: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
                if frame.is_empty() {
                    continue;
                }
                let decoded = cobs::decode_vec(&frame).expect("peer: COBS decode");
                return Message::from_bytes(&decoded).expect("peer: message decode");
            }
            let mut chunk = [0u8; 256];
            let n = self.reader.read(&mut chunk).await.expect("peer: read");
            assert!(n > 0, "peer: wire closed while expecting a message");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn send(&mut self, msg: &Message) {
        let mut frame = cobs::encode_vec(&msg.to_bytes().expect("peer: encode"));
        frame.push(0);
        self.writer.write_all(&frame).await.expect("peer: write");
    }
}
