//! Framed codec for worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization, with
//! revivable envelopes checked on the way out and revived on the way in.
//! Works over any AsyncRead/AsyncWrite (child stdio, in-memory pipes).

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::revive::RevivalRegistry;

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    revivers: Arc<RevivalRegistry>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    /// Codec with the default revivable types.
    pub fn new() -> Self {
        Self::with_revivers(Arc::new(RevivalRegistry::default()))
    }

    pub fn with_revivers(revivers: Arc<RevivalRegistry>) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            revivers,
            _phantom: PhantomData,
        }
    }
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&bytes).map_err(invalid_data)?;
                let value = self.revivers.revive(value).map_err(invalid_data)?;
                let item = serde_json::from_value(value).map_err(invalid_data)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let value = serde_json::to_value(&item).map_err(invalid_data)?;
        self.revivers.check(&value).map_err(invalid_data)?;
        let json = serde_json::to_vec(&value).map_err(invalid_data)?;
        let json_len = json.len();
        // These events must never be forwarded over IPC (each one would produce
        // another frame). The worker's forwarding layer drops this target.
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
