//! Codec traits shared by the wire formats.
//!
//! A [`Decoder`] turns buffered bytes into items without consuming anything
//! until a whole item is present; an [`Encoder`] appends one item to an
//! output buffer.

use bytes::BytesMut;

/// Decodes items from a byte buffer.
pub trait Decoder {
    /// The decoded item type.
    type Item;
    /// The error produced on malformed input.
    type Error;

    /// Attempts to decode one item from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete item; in
    /// that case `src` is left untouched so the caller can append more bytes.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error>;
}

/// Encodes items into a byte buffer.
pub trait Encoder<Item> {
    /// The error produced when an item cannot be encoded.
    type Error;

    /// Appends the encoding of `item` to `dst`.
    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}
