//! Switchboard - SIP B2BUA with a distributed RTP media plane
//!
//! Two daemons share this crate: the signaling engine (registrar, dialogs,
//! origination, bridging, dialplan) and the media node (RTP sessions,
//! playback, relay), talking over a typed RPC control plane. A pool
//! coordinator in front of the media nodes provides session affinity,
//! health tracking and live drain migration.

pub mod config;
pub mod core;
pub mod error;
pub mod media;
pub mod protocols;
pub mod rpc;
pub mod services;
pub mod utils;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
