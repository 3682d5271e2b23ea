//! Resource keys shared across crates.
//!
//! Keys owned by a single consumer live next to that consumer; only keys
//! that several components look up belong here.

use confab_signal::OutboundSocket;

use crate::ResourceKey;

/// The session's serialized outbound socket. Registered by the upgrade
/// handler, read by the transcriber accept path and the AI worker pool.
pub const OUTBOUND_SOCKET: ResourceKey<OutboundSocket> = ResourceKey::new("outbound_socket");
