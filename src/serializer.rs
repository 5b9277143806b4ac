//! Header serialization.
//!
//! Transports persist headers as opaque bytes. A failure to turn those bytes
//! back into a header map makes the message poison; it never panics.

use crate::error::Result;
use crate::model::Headers;

pub trait HeaderSerializer: Send + Sync {
    fn serialize(&self, headers: &Headers) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Headers>;
}

/// JSON object encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHeaderSerializer;

impl HeaderSerializer for JsonHeaderSerializer {
    fn serialize(&self, headers: &Headers) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(headers)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Headers> {
        if bytes.is_empty() {
            return Ok(Headers::new());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
