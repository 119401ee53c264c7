//! Bincode codec with a type-name frame.
//!
//! Wire layout: `[u16 big-endian tag length][tag bytes][bincode body]`, where
//! the tag is the payload's type name with module paths removed. Bincode on
//! its own would happily decode any byte soup of the right length into the
//! wrong struct; the tag makes that a `TypeMismatch` instead.
//!
//! Borrowed and owned forms that share a serde encoding share a tag: `str`
//! is tagged `String` and a slice `[T]` is tagged `Vec<T>`, so whatever the
//! publisher passed by reference decodes into its owned counterpart.

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Codec;
use crate::utils::error::CodecError;

pub const BINARY_CONTENT_TYPE: &str = "application/x-bincode";

/// Upper bound on a decoded body, guards against hostile length prefixes.
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl BinaryCodec {
    fn options() -> impl Options {
        bincode::DefaultOptions::new().with_limit(MAX_BODY_BYTES)
    }

    fn type_tag<T: ?Sized>() -> String {
        canonical_tag(std::any::type_name::<T>())
    }

    fn decode_error(reason: impl ToString) -> CodecError {
        CodecError::Decode {
            content_type: BINARY_CONTENT_TYPE,
            reason: reason.to_string(),
        }
    }
}

/// Strip module paths from every segment of `full` and map borrowed
/// unsized forms to the owned type they decode into.
pub(crate) fn canonical_tag(full: &str) -> String {
    let mut short = String::with_capacity(full.len());
    let mut rest = full;
    while let Some(at) = rest.find("::") {
        short.push_str(&rest[..at]);
        let keep = short
            .trim_end_matches(|c: char| c.is_alphanumeric() || c == '_')
            .len();
        short.truncate(keep);
        rest = &rest[at + 2..];
    }
    short.push_str(rest);

    let short = short.replace("&str", "String");
    let short = short.trim_start_matches('&');
    if short == "str" {
        return "String".to_string();
    }
    match short.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Some(element) if !is_array_element(element) => format!("Vec<{element}>"),
        _ => short.to_string(),
    }
}

/// `[T; N]` is a fixed-size array, not a slice.
fn is_array_element(inner: &str) -> bool {
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '<' | '[' | '(' => depth += 1,
            '>' | ']' | ')' => depth -= 1,
            ';' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

impl Codec for BinaryCodec {
    fn content_type(&self) -> &'static str {
        BINARY_CONTENT_TYPE
    }

    fn encode_body<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let tag = Self::type_tag::<T>();
        let tag = tag.as_bytes();
        let tag_len = u16::try_from(tag.len()).map_err(|_| CodecError::Encode {
            content_type: BINARY_CONTENT_TYPE,
            reason: format!("type name of {} bytes is too long", tag.len()),
        })?;

        let body = Self::options()
            .serialize(value)
            .map_err(|e| CodecError::Encode {
                content_type: BINARY_CONTENT_TYPE,
                reason: e.to_string(),
            })?;

        let mut framed = Vec::with_capacity(2 + tag.len() + body.len());
        framed.extend_from_slice(&tag_len.to_be_bytes());
        framed.extend_from_slice(tag);
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        if body.len() < 2 {
            return Err(Self::decode_error("body shorter than frame header"));
        }
        let tag_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let rest = &body[2..];
        if rest.len() < tag_len {
            return Err(Self::decode_error("truncated type tag"));
        }
        let (tag, payload) = rest.split_at(tag_len);
        let tag = std::str::from_utf8(tag).map_err(Self::decode_error)?;

        let expected = Self::type_tag::<T>();
        if tag != expected {
            return Err(CodecError::TypeMismatch {
                expected,
                found: tag.to_string(),
            });
        }

        Self::options()
            .deserialize(payload)
            .map_err(Self::decode_error)
    }
}
