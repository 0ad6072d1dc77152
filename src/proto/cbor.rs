//! CBOR wire codec.
//!
//! The envelope is a CBOR map with short text keys; maps are self-delimiting
//! so the encoding doubles as the framing, with no length prefix. The
//! streaming decoder consumes exactly one complete map per call and leaves
//! any following bytes for the next call.

use std::convert::Infallible;
use std::io::Read;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::{
    ClientId, ClientStatusMap, IdentifyRequest, IdentifyResponse, ListRequest, ListResponse,
    Message, RelayIndication, RelayRequest, RelayResponse, Status,
};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("indefinite-length item in envelope")]
    IndefiniteLength,
    #[error("unknown status code {0}")]
    UnknownStatus(u64),
    #[error("trailing bytes after envelope")]
    TrailingBytes,
}

impl DecodeError {
    /// True when the input ended mid-item: the envelope may complete once
    /// more bytes arrive.
    fn needs_more(&self) -> bool {
        match self {
            DecodeError::Cbor(e) => e.is_end_of_input(),
            _ => false,
        }
    }
}

/// Encode one envelope to its wire bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    enc.map(2 + msg.slot_count() as u64)?;
    enc.str("bhubver")?.u64(msg.version)?;
    enc.str("id")?.u32(msg.message_id)?;

    if msg.identify_req.is_some() {
        enc.str("ir")?.map(0)?;
    }
    if let Some(res) = &msg.identify_res {
        enc.str("IR")?.map(1)?;
        enc.str("id")?.u64(res.id.as_u64())?;
    }
    if msg.list_req.is_some() {
        enc.str("lr")?.map(0)?;
    }
    if let Some(res) = &msg.list_res {
        enc.str("LR")?.map(1)?;
        enc.str("o")?.array(res.others.len() as u64)?;
        for cid in &res.others {
            enc.u64(cid.as_u64())?;
        }
    }
    if let Some(req) = &msg.relay_req {
        enc.str("rr")?.map(2)?;
        enc.str("dst")?.array(req.dest.len() as u64)?;
        for cid in &req.dest {
            enc.u64(cid.as_u64())?;
        }
        enc.str("msg")?.bytes(&req.msg)?;
    }
    if let Some(res) = &msg.relay_res {
        enc.str("RR")?.map(2)?;
        enc.str("sta")?.u8(res.status.code())?;
        enc.str("csm")?.map(res.status_map.len() as u64)?;
        for (cid, status) in &res.status_map {
            enc.u64(cid.as_u64())?.u8(status.code())?;
        }
    }
    if let Some(ind) = &msg.relay_ind {
        enc.str("RI")?.map(2)?;
        enc.str("src")?.u64(ind.src.as_u64())?;
        enc.str("msg")?.bytes(&ind.msg)?;
    }

    Ok(buf)
}

/// Decode one envelope from a complete buffer. Rejects trailing bytes; use
/// [`StreamDecoder`] for concatenated envelopes.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let msg = decode_envelope(&mut dec)?;
    if dec.position() != bytes.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(msg)
}

/// Decode the envelope at the decoder's current position.
///
/// Unknown envelope keys are skipped; absent fields decode to their zero
/// values. Every command slot present is decoded independently, so an
/// envelope carrying several slots round-trips intact.
fn decode_envelope(dec: &mut Decoder) -> Result<Message, DecodeError> {
    let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut msg = Message::default();
    for _ in 0..len {
        match dec.str()? {
            "bhubver" => msg.version = dec.u64()?,
            "id" => msg.message_id = dec.u32()?,
            "ir" => {
                dec.skip()?;
                msg.identify_req = Some(IdentifyRequest {});
            }
            "IR" => msg.identify_res = Some(decode_identify_res(dec)?),
            "lr" => {
                dec.skip()?;
                msg.list_req = Some(ListRequest {});
            }
            "LR" => msg.list_res = Some(decode_list_res(dec)?),
            "rr" => msg.relay_req = Some(decode_relay_req(dec)?),
            "RR" => msg.relay_res = Some(decode_relay_res(dec)?),
            "RI" => msg.relay_ind = Some(decode_relay_ind(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(msg)
}

fn decode_identify_res(dec: &mut Decoder) -> Result<IdentifyResponse, DecodeError> {
    let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut id = ClientId(0);
    for _ in 0..len {
        match dec.str()? {
            "id" => id = ClientId(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(IdentifyResponse { id })
}

fn decode_list_res(dec: &mut Decoder) -> Result<ListResponse, DecodeError> {
    let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut others = Vec::new();
    for _ in 0..len {
        match dec.str()? {
            "o" => others = decode_client_ids(dec)?,
            _ => dec.skip()?,
        }
    }
    Ok(ListResponse { others })
}

fn decode_relay_req(dec: &mut Decoder) -> Result<RelayRequest, DecodeError> {
    let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut dest = Vec::new();
    let mut msg = Bytes::new();
    for _ in 0..len {
        match dec.str()? {
            "dst" => dest = decode_client_ids(dec)?,
            "msg" => msg = Bytes::copy_from_slice(dec.bytes()?),
            _ => dec.skip()?,
        }
    }
    Ok(RelayRequest { dest, msg })
}

fn decode_relay_res(dec: &mut Decoder) -> Result<RelayResponse, DecodeError> {
    let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut status = Status::Success;
    let mut status_map = ClientStatusMap::new();
    for _ in 0..len {
        match dec.str()? {
            "sta" => status = decode_status(dec)?,
            "csm" => {
                let entries = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
                for _ in 0..entries {
                    let cid = ClientId(dec.u64()?);
                    status_map.insert(cid, decode_status(dec)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(RelayResponse { status, status_map })
}

fn decode_relay_ind(dec: &mut Decoder) -> Result<RelayIndication, DecodeError> {
    let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut src = ClientId(0);
    let mut msg = Bytes::new();
    for _ in 0..len {
        match dec.str()? {
            "src" => src = ClientId(dec.u64()?),
            "msg" => msg = Bytes::copy_from_slice(dec.bytes()?),
            _ => dec.skip()?,
        }
    }
    Ok(RelayIndication { src, msg })
}

fn decode_client_ids(dec: &mut Decoder) -> Result<Vec<ClientId>, DecodeError> {
    let len = dec.array()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut out = Vec::new();
    for _ in 0..len {
        out.push(ClientId(dec.u64()?));
    }
    Ok(out)
}

fn decode_status(dec: &mut Decoder) -> Result<Status, DecodeError> {
    let code = dec.u64()?;
    Status::from_code(code).ok_or(DecodeError::UnknownStatus(code))
}

const READ_CHUNK: usize = 4096;

/// Streaming decoder over a byte reader. Yields one envelope per call;
/// `None` signals permanent end-of-stream (EOF, read error, or malformed
/// input).
pub struct StreamDecoder<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            done: false,
        }
    }

    pub fn decode_next(&mut self) -> Option<Message> {
        loop {
            if self.done {
                return None;
            }

            if !self.buf.is_empty() {
                let mut dec = Decoder::new(&self.buf);
                match decode_envelope(&mut dec) {
                    Ok(msg) => {
                        let consumed = dec.position();
                        self.buf.drain(..consumed);
                        return Some(msg);
                    }
                    Err(e) if e.needs_more() => {}
                    Err(_) => {
                        self.done = true;
                        return None;
                    }
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
