//! Media plane: port allocation, sessions, playback and the RTP relay

pub mod audio;
pub mod bridge;
pub mod node;
pub mod port_pool;
pub mod session;

pub use node::{MediaNode, NodeHealth, SessionInfo};
pub use port_pool::{PortPair, PortPool};
pub use session::{MediaSession, PlaybackEvent, SessionState};
