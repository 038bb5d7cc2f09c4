//! A `network-transport`-style reliable, ordered, multi-endpoint TCP
//! transport: many [`LocalEndPoint`]s can share one [`Transport`]'s listening
//! socket, with logical connections multiplexed over a single physical TCP
//! connection per peer pair (spec.md §1-§3).

mod address;
mod codec;
mod connection;
mod control;
mod error;
mod event;
mod incoming;
mod listener;
mod local;
mod remote;
mod signal;
mod transport;

pub use address::EndPointAddress;
pub use connection::Connection;
pub use error::{
    AddressParseError, ConnectErrorCode, EndPointClosedError, FramingError, NewEndPointErrorCode,
    SendErrorCode,
};
pub use event::{ErrorEventKind, Event, Reliability};
pub use local::LocalEndPoint;
pub use transport::{Transport, TransportConfig};
