//! Two-node HTTP forward proxy over a single framed TCP link.
//!
//! The **ship** node accepts local HTTP proxy traffic (absolute-form requests
//! and CONNECT tunnels) and carries every transaction over one persistent TCP
//! connection to the **offshore** node, which performs the actual origin
//! fetches. The link speaks a minimal length-prefixed framing protocol;
//! request/response correlation is positional, so the ship serializes
//! transactions strictly one-at-a-time.

/// Framing codec for the ship↔offshore link.
pub mod frame;
/// Serialized frame sender and frame reader over one TCP connection.
pub mod link;
/// Offshore node: executes framed requests against origin servers.
pub mod offshore;
mod parse;
/// Ship node: client listener, FIFO scheduler, and tunnel switch.
pub mod ship;

pub use offshore::OffshoreProxy;
pub use parse::{Authority, HttpRequest, HttpResponse, RequestKind};
pub use ship::{ShipConfig, ShipProxy};

/// How much data to read for a client's request head before it's considered
/// invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Default port the offshore node listens on for the ship link.
pub const DEFAULT_OFFSHORE_PORT: u16 = 9999;
/// Default port the ship node serves HTTP proxy clients on.
pub const DEFAULT_SHIP_PROXY_PORT: u16 = 8080;
