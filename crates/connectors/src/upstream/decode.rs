//! Payload decoders.
//!
//! A decoder turns the body of one data message into the record type the
//! operator emits. Decoders run on the event loop, so they must be cheap
//! and must not block.

use super::error::DecodeError;
use std::sync::Arc;

/// Decoding strategy for message payloads.
pub type DecodeFn<T> = Arc<dyn Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync>;

/// Wrap a closure as a [`DecodeFn`].
pub fn from_fn<T, F>(f: F) -> DecodeFn<T>
where
    F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Payloads as UTF-8 text.
pub fn utf8() -> DecodeFn<String> {
    from_fn(|bytes| {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| DecodeError::new(format!("invalid UTF-8: {}", e)))
    })
}

/// Payloads as raw bytes.
pub fn raw() -> DecodeFn<Vec<u8>> {
    from_fn(|bytes| Ok(bytes.to_vec()))
}
