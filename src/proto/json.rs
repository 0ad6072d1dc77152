//! Debug JSON codec.
//!
//! Field names are identical to the CBOR codec's keys, which makes captures
//! easy to eyeball, but the encoding is not wire-compatible with the binary
//! protocol and is never used on the hub path.

use std::io::Read;

use thiserror::Error;

use super::Message;

#[derive(Debug, Error)]
pub enum JsonError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, JsonError> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode(bytes: &[u8]) -> Result<Message, JsonError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Streaming decoder over concatenated JSON documents. `None` signals
/// permanent end-of-stream.
pub struct StreamDecoder<R: Read> {
    inner: serde_json::StreamDeserializer<'static, serde_json::de::IoRead<R>, Message>,
    done: bool,
}

impl<R: Read> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: serde_json::Deserializer::from_reader(reader).into_iter(),
            done: false,
        }
    }

    pub fn decode_next(&mut self) -> Option<Message> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(msg)) => Some(msg),
            Some(Err(_)) | None => {
                self.done = true;
                None
            }
        }
    }
}
