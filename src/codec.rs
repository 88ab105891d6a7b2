//! Header/body codec boundary
//!
//! The cache never inspects headers or bodies. It only needs a deterministic,
//! reversible mapping to transport-safe strings, supplied by the host.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::error::{CacheError, CacheResult};

/// Converts headers and bodies to and from their stored string form.
///
/// Decoding returns `None` for anything that is not a valid encoding
/// (corrupt entries, entries written by an incompatible engine version,
/// unrelated keys in the same database).
pub trait SegmentCodec: Send + Sync + 'static {
  type Header: Clone + Send + Sync + 'static;
  type Body: Send + Sync + 'static;

  fn encode_header(&self, header: &Self::Header) -> CacheResult<String>;
  fn decode_header(&self, encoded: &str) -> Option<Self::Header>;
  fn encode_body(&self, body: &Self::Body) -> CacheResult<String>;
  fn decode_body(&self, encoded: &str) -> Option<Self::Body>;
}

/// JSON + base64 codec for serde types
pub struct JsonCodec<H, B> {
  _marker: PhantomData<fn() -> (H, B)>,
}

impl<H, B> JsonCodec<H, B> {
  pub fn new() -> Self {
    Self {
      _marker: PhantomData,
    }
  }
}

impl<H, B> Default for JsonCodec<H, B> {
  fn default() -> Self {
    Self::new()
  }
}

impl<H, B> Clone for JsonCodec<H, B> {
  fn clone(&self) -> Self {
    Self::new()
  }
}

fn encode_json<T: Serialize>(value: &T) -> CacheResult<String> {
  let json = serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))?;
  Ok(STANDARD.encode(json))
}

fn decode_json<T: DeserializeOwned>(encoded: &str) -> Option<T> {
  let bytes = STANDARD.decode(encoded.trim()).ok()?;
  serde_json::from_slice(&bytes).ok()
}

impl<H, B> SegmentCodec for JsonCodec<H, B>
where
  H: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
  B: Serialize + DeserializeOwned + Send + Sync + 'static,
{
  type Header = H;
  type Body = B;

  fn encode_header(&self, header: &H) -> CacheResult<String> {
    encode_json(header)
  }

  fn decode_header(&self, encoded: &str) -> Option<H> {
    decode_json(encoded)
  }

  fn encode_body(&self, body: &B) -> CacheResult<String> {
    encode_json(body)
  }

  fn decode_body(&self, encoded: &str) -> Option<B> {
    decode_json(encoded)
  }
}
