//! CoAP message model and binary codec.
//!
//! This crate carries the wire-level vocabulary of CoAP (RFC 7252): message
//! [`Type`]s, [`Code`]s, [`Token`]s, the ordered [`Options`] multimap, and
//! the [`Message`] container with its binary encoding. It knows nothing
//! about transports, interactions or timing; that lives in `couart`.

pub mod code;
pub mod codec;
pub mod opt;
pub mod token;
pub mod ty;

pub use code::Code;
pub use codec::MessageError;
pub use opt::{OptionNumber, OptionView, Options};
pub use token::Token;
pub use ty::Type;

/// A single CoAP message.
///
/// The same container is used for requests, responses, notifications and
/// the empty ACK/RST signalling messages. Field semantics follow RFC 7252
/// section 3.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub ty: Type,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    options: Options,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(ty: Type, code: Code, message_id: u16) -> Self {
        Self {
            ty,
            code,
            message_id,
            token: Token::default(),
            options: Options::new(),
            payload: Vec::new(),
        }
    }

    /// An empty ACK for the given message id (used to confirm separate
    /// responses and CON notifications).
    pub fn ack(message_id: u16) -> Self {
        Self::new(Type::Acknowledgement, Code::EMPTY, message_id)
    }

    /// An empty RST for the given message id (rejects a message; during
    /// observe this deregisters the client on the server side).
    pub fn rst(message_id: u16) -> Self {
        Self::new(Type::Reset, Code::EMPTY, message_id)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn set_options(&mut self, options: Options) {
        self.options = options;
    }

    /// Replaces all Uri-Path options with the segments of `path`.
    ///
    /// `path` is split on `/`; empty segments are skipped, so `"/a//b"`
    /// yields the two options `a` and `b`.
    pub fn set_path(&mut self, path: &str) {
        self.options.clear(OptionNumber::URI_PATH);
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            self.options
                .add(OptionNumber::URI_PATH, seg.as_bytes().to_vec());
        }
    }

    /// The request path assembled from the Uri-Path options.
    pub fn path(&self) -> String {
        let mut out = String::new();
        for value in self.options.get(OptionNumber::URI_PATH).values() {
            out.push('/');
            out.push_str(&String::from_utf8_lossy(value));
        }
        out
    }
}
