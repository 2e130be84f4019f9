//! Wire protocols: SIP, SDP, RTP and RFC 4733 telephone-events

pub mod dtmf;
pub mod rtp;
pub mod sdp;
pub mod sip;

pub use rtp::{ClockPacedWriter, RtpPacket, SequenceTracker};
pub use sip::{SipMessage, SipMethod, SipRequest, SipResponse};
