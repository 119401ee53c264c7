//! Payload codecs
//!
//! A codec turns a typed value into a body plus a content-type tag and back.
//! The broker only carries the tag as an opaque string, so publishers and
//! subscribers agree on a codec out of band; the tag lets a consumer that was
//! configured with the wrong codec fail fast instead of misreading bytes.
//!
//! - `JsonCodec`: human-readable, schema-less. Unknown fields are ignored on
//!   decode, type mismatches on known fields are errors.
//! - `BinaryCodec`: compact bincode body framed with the payload's type name,
//!   so a body only decodes into the type it was produced from.

mod binary;
mod json;

pub use binary::{BINARY_CONTENT_TYPE, BinaryCodec};
pub use json::{JSON_CONTENT_TYPE, JsonCodec};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::error::CodecError;

/// An encoded body with the tag of the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

pub trait Codec: Send + Sync + 'static {
    /// Content-type tag written on every message this codec produces.
    fn content_type(&self) -> &'static str;

    fn encode_body<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError>;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Encoded, CodecError> {
        Ok(Encoded {
            content_type: self.content_type(),
            body: self.encode_body(value)?,
        })
    }

    /// Decode `body`, rejecting it up front when the sender tagged it with a
    /// different content type. An absent tag is accepted.
    fn decode<T: DeserializeOwned>(
        &self,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<T, CodecError> {
        if let Some(found) = content_type {
            if !found.eq_ignore_ascii_case(self.content_type()) {
                return Err(CodecError::ContentTypeMismatch {
                    expected: self.content_type(),
                    found: found.to_string(),
                });
            }
        }
        self.decode_body(body)
    }
}
