//! Message options (RFC 7252 section 5.10): an ordered multimap keyed by
//! option number, with values either opaque bytes or minimal-length
//! big-endian uints.

use std::collections::BTreeMap;

/// A CoAP option number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    pub const IF_MATCH: OptionNumber = OptionNumber(1);
    pub const URI_HOST: OptionNumber = OptionNumber(3);
    pub const ETAG: OptionNumber = OptionNumber(4);
    pub const IF_NONE_MATCH: OptionNumber = OptionNumber(5);
    pub const OBSERVE: OptionNumber = OptionNumber(6);
    pub const URI_PORT: OptionNumber = OptionNumber(7);
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);
    pub const URI_PATH: OptionNumber = OptionNumber(11);
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);
    pub const MAX_AGE: OptionNumber = OptionNumber(14);
    pub const URI_QUERY: OptionNumber = OptionNumber(15);
    pub const ACCEPT: OptionNumber = OptionNumber(17);
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);
    pub const SIZE1: OptionNumber = OptionNumber(60);
}

/// Encodes a uint option value: minimal-length big-endian, zero is the
/// empty value.
pub fn uint_to_bytes(value: u64) -> Vec<u8> {
    let mut out = value.to_be_bytes().to_vec();
    while out.first() == Some(&0) {
        out.remove(0);
    }
    out
}

pub fn uint_from_bytes(bytes: &[u8]) -> Option<u64> {
    if bytes.len() > 8 {
        return None;
    }
    let mut value = 0u64;
    for b in bytes {
        value = value << 8 | u64::from(*b);
    }
    Some(value)
}

/// The ordered option set of one message.
///
/// Iteration yields options in ascending number order, values of one number
/// in insertion order, which is exactly the order the codec emits them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options(BTreeMap<OptionNumber, Vec<Vec<u8>>>);

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// A view of all values for `number`; never fails, the view of an
    /// absent option answers `is_set() == false`.
    pub fn get(&self, number: OptionNumber) -> OptionView<'_> {
        OptionView(self.0.get(&number).map(|v| v.as_slice()))
    }

    /// Appends one value instance for `number`.
    pub fn add(&mut self, number: OptionNumber, value: Vec<u8>) {
        self.0.entry(number).or_default().push(value);
    }

    pub fn add_uint(&mut self, number: OptionNumber, value: u64) {
        self.add(number, uint_to_bytes(value));
    }

    /// Replaces all values of `number` with a single one.
    pub fn set(&mut self, number: OptionNumber, value: Vec<u8>) {
        self.0.insert(number, vec![value]);
    }

    pub fn set_uint(&mut self, number: OptionNumber, value: u64) {
        self.set(number, uint_to_bytes(value));
    }

    /// Removes every instance of `number`.
    pub fn clear(&mut self, number: OptionNumber) {
        self.0.remove(&number);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All (number, value) pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (OptionNumber, &[u8])> {
        self.0
            .iter()
            .flat_map(|(num, values)| values.iter().map(|v| (*num, v.as_slice())))
    }
}

/// Read access to the values of one option number.
#[derive(Debug, Clone, Copy)]
pub struct OptionView<'a>(Option<&'a [Vec<u8>]>);

impl<'a> OptionView<'a> {
    pub fn is_set(&self) -> bool {
        self.0.is_some_and(|v| !v.is_empty())
    }

    pub fn is_not_set(&self) -> bool {
        !self.is_set()
    }

    pub fn first(&self) -> Option<&'a [u8]> {
        self.0.and_then(|v| v.first()).map(|v| v.as_slice())
    }

    /// The first value decoded as a uint. Absent options answer `None`;
    /// an empty value is 0.
    pub fn as_uint(&self) -> Option<u64> {
        self.first().and_then(uint_from_bytes)
    }

    pub fn values(&self) -> impl Iterator<Item = &'a [u8]> {
        self.0
            .unwrap_or_default()
            .iter()
            .map(|v| v.as_slice())
    }

    pub fn count(&self) -> usize {
        self.0.map_or(0, |v| v.len())
    }
}
