//! Parent/child message transport.
//!
//! Every agent serves one endpoint that accepts [`message::Envelope`]s and
//! queues them for its reactor; replies are bare acknowledgements. Outbound
//! traffic goes through a [`link::PeerLink`] per peer, owned by whoever
//! talks to that peer.

pub mod link;
pub mod message;
pub mod server;

pub use link::PeerLink;
pub use message::{Envelope, HeartbeatKind, Message, Reply};
pub use server::Inbound;
