//! The recon gossip protocol.
//!
//! A [`Peer`] owns the local prefix tree and reconciles it with partners
//! over TCP.  One side of each session serves (walks its tree and sends
//! requests) and the other gossips (answers them); elements either side
//! lacks are handed to the storage layer through [`Recover`] values.
//!
//! Everything here is gated behind the `net` Cargo feature.

#![cfg(feature = "net")]

mod gossip;
/// Allow list for inbound connections.
pub mod matcher;
/// Recon message types and framing.
pub mod messages;
/// Peer lifecycle, handshake and recovery delivery.
pub mod peer;
mod serve;
/// Peer settings.
pub mod settings;

pub use matcher::{Cidr, CidrError, IpMatcher};
pub use messages::{read_msg, write_msgs, Config, MsgType, ReconMsg};
pub use peer::{
    MutationEvent, Peer, PeerError, PeerStats, PeerStatsSnapshot, Recover, BUSY_REASON,
};
pub use settings::{Partner, PeerMode, Settings, SettingsError, DEFAULT_VERSION};
