//! COBS framing of CoAP messages on the serial line.
//!
//! Outbound messages are COBS-encoded and terminated with the `0x00`
//! delimiter. Inbound bytes accumulate until a delimiter arrives, then the
//! frame is decoded in place. A frame that outgrows the buffer is dropped
//! and accumulation resumes at the next delimiter.

use cobs::{decode_in_place, encode_vec, max_encoding_length};
use log::warn;

/// Encodes one message's bytes as a delimited COBS frame.
pub(crate) fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_encoding_length(data.len()) + 1);
    out.extend_from_slice(&encode_vec(data));
    out.push(0);
    out
}

/// Reassembles delimited COBS frames from a byte stream read in arbitrary
/// chunks.
pub(crate) struct FrameAccumulator {
    buf: Box<[u8]>,
    idx: usize,
    in_overflow: bool,
}

impl FrameAccumulator {
    pub(crate) fn new(capacity: usize) -> FrameAccumulator {
        FrameAccumulator {
            buf: vec![0u8; capacity].into_boxed_slice(),
            idx: 0,
            in_overflow: false,
        }
    }

    /// Feeds one chunk, invoking `on_frame` for every complete decoded
    /// frame it finishes.
    pub(crate) fn feed(&mut self, chunk: &[u8], mut on_frame: impl FnMut(&[u8])) {
        for &byte in chunk {
            if byte != 0 {
                if self.in_overflow {
                    continue;
                }
                if self.idx == self.buf.len() {
                    warn!("frame exceeds {} byte buffer, dropping", self.buf.len());
                    self.in_overflow = true;
                    continue;
                }
                self.buf[self.idx] = byte;
                self.idx += 1;
                continue;
            }

            // Delimiter: either the end of a frame or the end of an
            // overflow stretch.
            let len = self.idx;
            self.idx = 0;
            if self.in_overflow {
                self.in_overflow = false;
                continue;
            }
            if len == 0 {
                // Idle delimiter between frames.
                continue;
            }
            match decode_in_place(&mut self.buf[..len]) {
                Ok(decoded) => on_frame(&self.buf[..decoded]),
                Err(_) => warn!("COBS decode error, dropping {len} byte frame"),
            }
        }
    }
}
