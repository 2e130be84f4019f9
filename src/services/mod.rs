//! Signaling-plane services: registration, dialogs, legs, bridging,
//! dialplan, media pool and drain

pub mod bridge;
pub mod call;
pub mod dialog;
pub mod dialplan;
pub mod drain;
pub mod leg;
pub mod location;
pub mod media_pool;
pub mod originator;
pub mod registrar;

pub use bridge::{Bridge, BridgeInfo, BridgeState};
pub use call::{CallService, DialOptions};
pub use dialog::{Dialog, DialogDirection, DialogRegistry, DialogState};
pub use dialplan::{CallSession, Dialplan, DialplanAction, DialplanExecutor, DialplanRule};
pub use drain::{DrainCoordinator, DrainMode, DrainRequest, DrainStatus};
pub use leg::{Leg, LegState, TerminationCause};
pub use location::{Binding, LocationStore};
pub use media_pool::{DrainState, MediaPool, PoolMemberStats, PoolSession};
pub use originator::{OriginateRequest, Originator};
pub use registrar::Registrar;
