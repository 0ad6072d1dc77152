#![forbid(unsafe_code)]

//! bhub: a broadcast hub.
//!
//! A connection-oriented server that multiplexes long-lived client
//! sessions and lets any client relay an opaque payload to an explicit
//! list of other connected clients. Clients are anonymous peers known
//! only by a hub-assigned numeric handle, valid for the lifetime of the
//! connection. Delivery is best-effort: slow receivers drop at their own
//! bounded queues and fast senders learn about it immediately instead of
//! blocking the hub.

pub mod client;
pub mod conn;
pub mod hub;
pub mod proto;
pub mod telemetry;
pub mod test_harness;

pub use client::{Client, ClientError, RelayOutcome};
pub use hub::Hub;
pub use proto::{ClientId, ClientStatusMap, Message, Status};
