//! Engine orchestration and SIP transport

pub mod engine;
pub mod transport;

pub use engine::SwitchboardEngine;
pub use transport::{ClientTransaction, IncomingRequest, SipTransport};
