use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Codec;
use crate::utils::error::CodecError;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode_body<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            content_type: JSON_CONTENT_TYPE,
            reason: e.to_string(),
        })
    }

    fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(body).map_err(|e| CodecError::Decode {
            content_type: JSON_CONTENT_TYPE,
            reason: e.to_string(),
        })
    }
}
