//! Protocol message schemas for the bhub wire protocol.
//!
//! Every message is an envelope carrying:
//! - `bhubver`: protocol version (currently 1),
//! - `id`: a 32-bit message id, unique per request within one client and
//!   shared by the matching response,
//! - one command slot out of seven. The envelope structure tolerates more
//!   than one slot on receipt; senders always populate exactly one.
//!
//! Terminology: a *request* is an unsolicited client-to-hub message, a
//! *response* is its reply, an *indication* is an unsolicited hub-to-client
//! message (the only kind being the relay indication).

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod cbor;
pub mod json;

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u64 = 1;

/// Maximum relay payload length accepted by either end.
pub const MAX_RELAY_PAYLOAD: usize = 1024;

/// Maximum number of relay destinations accepted by either end.
pub const MAX_RELAY_DESTINATIONS: usize = 255;

/// Hub-assigned client handle. Unique within one hub lifetime, never zero,
/// never reused while the hub runs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ClientId {
    fn from(raw: u64) -> Self {
        ClientId(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Operation status. The integer codes are stable and serialized as-is;
/// only `Success`, `InvalidId`, `NoBuffer` and `TooLong` ever appear on the
/// wire, the rest are local to one end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Success,
    InvalidId,
    NoBuffer,
    ConnectionError,
    EncodingError,
    Timeout,
    TooLong,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::InvalidId => 1,
            Status::NoBuffer => 2,
            Status::ConnectionError => 3,
            Status::EncodingError => 4,
            Status::Timeout => 5,
            Status::TooLong => 6,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Status::Success,
            1 => Status::InvalidId,
            2 => Status::NoBuffer,
            3 => Status::ConnectionError,
            4 => Status::EncodingError,
            5 => Status::Timeout,
            6 => Status::TooLong,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::InvalidId => "INVALID_ID",
            Status::NoBuffer => "NO_BUFFER",
            Status::ConnectionError => "CONNECTION_ERROR",
            Status::EncodingError => "ENCODING_ERROR",
            Status::Timeout => "TIMEOUT",
            Status::TooLong => "TOO_LONG",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        Status::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code {code}")))
    }
}

/// Per-destination relay outcome. Present keys carry the failure for that
/// destination; absent keys mean success (successes are omitted for wire
/// efficiency).
pub type ClientStatusMap = BTreeMap<ClientId, Status>;

/// Identify request, client to hub. Carries no fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyRequest {}

/// Identify response, hub to client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub id: ClientId,
}

/// List request, client to hub. Carries no fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {}

/// List response: every other connected client's handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(rename = "o")]
    pub others: Vec<ClientId>,
}

/// Relay request: forward `msg` to each handle in `dest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    #[serde(rename = "dst")]
    pub dest: Vec<ClientId>,
    pub msg: Bytes,
}

/// Relay response: overall status plus per-destination failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    #[serde(rename = "sta")]
    pub status: Status,
    #[serde(rename = "csm")]
    pub status_map: ClientStatusMap,
}

/// Relay indication: a payload forwarded from `src`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayIndication {
    pub src: ClientId,
    pub msg: Bytes,
}

/// The envelope actually sent over the transport, with one optional slot
/// per command type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "bhubver")]
    pub version: u64,
    #[serde(rename = "id")]
    pub message_id: u32,
    #[serde(rename = "ir", default, skip_serializing_if = "Option::is_none")]
    pub identify_req: Option<IdentifyRequest>,
    #[serde(rename = "IR", default, skip_serializing_if = "Option::is_none")]
    pub identify_res: Option<IdentifyResponse>,
    #[serde(rename = "lr", default, skip_serializing_if = "Option::is_none")]
    pub list_req: Option<ListRequest>,
    #[serde(rename = "LR", default, skip_serializing_if = "Option::is_none")]
    pub list_res: Option<ListResponse>,
    #[serde(rename = "rr", default, skip_serializing_if = "Option::is_none")]
    pub relay_req: Option<RelayRequest>,
    #[serde(rename = "RR", default, skip_serializing_if = "Option::is_none")]
    pub relay_res: Option<RelayResponse>,
    #[serde(rename = "RI", default, skip_serializing_if = "Option::is_none")]
    pub relay_ind: Option<RelayIndication>,
}

impl Message {
    fn envelope(message_id: u32) -> Self {
        Message {
            version: PROTOCOL_VERSION,
            message_id,
            ..Message::default()
        }
    }

    pub fn identify_request(message_id: u32) -> Self {
        Message {
            identify_req: Some(IdentifyRequest {}),
            ..Message::envelope(message_id)
        }
    }

    pub fn identify_response(message_id: u32, id: ClientId) -> Self {
        Message {
            identify_res: Some(IdentifyResponse { id }),
            ..Message::envelope(message_id)
        }
    }

    pub fn list_request(message_id: u32) -> Self {
        Message {
            list_req: Some(ListRequest {}),
            ..Message::envelope(message_id)
        }
    }

    pub fn list_response(message_id: u32, others: Vec<ClientId>) -> Self {
        Message {
            list_res: Some(ListResponse { others }),
            ..Message::envelope(message_id)
        }
    }

    pub fn relay_request(message_id: u32, dest: Vec<ClientId>, msg: Bytes) -> Self {
        Message {
            relay_req: Some(RelayRequest { dest, msg }),
            ..Message::envelope(message_id)
        }
    }

    pub fn relay_response(message_id: u32, status: Status, status_map: ClientStatusMap) -> Self {
        Message {
            relay_res: Some(RelayResponse { status, status_map }),
            ..Message::envelope(message_id)
        }
    }

    pub fn relay_indication(message_id: u32, src: ClientId, msg: Bytes) -> Self {
        Message {
            relay_ind: Some(RelayIndication { src, msg }),
            ..Message::envelope(message_id)
        }
    }

    /// Number of populated command slots. Senders keep this at one; the
    /// decoders tolerate more.
    pub fn slot_count(&self) -> usize {
        usize::from(self.identify_req.is_some())
            + usize::from(self.identify_res.is_some())
            + usize::from(self.list_req.is_some())
            + usize::from(self.list_res.is_some())
            + usize::from(self.relay_req.is_some())
            + usize::from(self.relay_res.is_some())
            + usize::from(self.relay_ind.is_some())
    }
}
