//! Minimal SDP offer/answer support
//!
//! The media plane speaks exactly one profile: `m=audio <port> RTP/AVP 0`
//! with PCMU at 8 kHz and 20 ms packetisation. Parsing keeps only what the
//! switchboard needs from a peer description: connection address, audio port
//! and the offered payload types.

use std::net::IpAddr;

use crate::{Error, Result};

/// RTP payload type for G.711 u-law
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

/// The parts of a peer session description the switchboard acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub connection_addr: Option<String>,
    pub audio_port: u16,
    pub payload_types: Vec<u8>,
}

impl SessionDescription {
    pub fn parse(input: &str) -> Result<Self> {
        let mut session_addr: Option<String> = None;
        let mut media_addr: Option<String> = None;
        let mut audio: Option<(u16, Vec<u8>)> = None;
        let mut in_audio_media = false;

        for line in input.lines().map(|l| l.trim_end_matches('\r')) {
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "c" => {
                    let addr = parse_connection(value)?;
                    if in_audio_media {
                        media_addr = Some(addr);
                    } else if audio.is_none() {
                        session_addr = Some(addr);
                    }
                }
                "m" => {
                    let mut parts = value.split_whitespace();
                    let media = parts.next().unwrap_or_default();
                    in_audio_media = media == "audio";
                    if in_audio_media && audio.is_none() {
                        let port = parts
                            .next()
                            .and_then(|p| p.parse::<u16>().ok())
                            .ok_or_else(|| Error::parse("Invalid SDP media port"))?;
                        let proto = parts.next().unwrap_or_default();
                        if proto != "RTP/AVP" {
                            return Err(Error::parse(format!(
                                "Unsupported SDP media profile: {}",
                                proto
                            )));
                        }
                        let pts: Vec<u8> =
                            parts.filter_map(|p| p.parse::<u8>().ok()).collect();
                        audio = Some((port, pts));
                    }
                }
                _ => {}
            }
        }

        let (audio_port, payload_types) =
            audio.ok_or_else(|| Error::parse("SDP has no audio media section"))?;

        Ok(Self {
            connection_addr: media_addr.or(session_addr),
            audio_port,
            payload_types,
        })
    }

    pub fn offers_pcmu(&self) -> bool {
        self.payload_types.contains(&PAYLOAD_TYPE_PCMU)
    }

    /// The remote RTP endpoint this description advertises.
    pub fn remote_endpoint(&self) -> Result<(String, u16)> {
        let addr = self
            .connection_addr
            .clone()
            .ok_or_else(|| Error::parse("SDP has no connection address"))?;
        Ok((addr, self.audio_port))
    }
}

fn parse_connection(value: &str) -> Result<String> {
    // c=<nettype> <addrtype> <connection-address>
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("IN"), Some("IP4"), Some(addr)) => Ok(addr.to_string()),
        _ => Err(Error::parse(format!("Unsupported SDP connection: {}", value))),
    }
}

/// Build the node's PCMU-only description, used both as offer and as answer.
pub fn build_audio_sdp(advertise_addr: IpAddr, rtp_port: u16) -> String {
    let session_id = rand::random::<u32>();
    format!(
        "v=0\r\n\
o=switchboard {sid} {sid} IN IP4 {addr}\r\n\
s=switchboard\r\n\
c=IN IP4 {addr}\r\n\
t=0 0\r\n\
m=audio {port} RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=ptime:20\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n",
        sid = session_id,
        addr = advertise_addr,
        port = rtp_port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 20518 0 IN IP4 192.0.2.5\r\n\
s=-\r\n\
c=IN IP4 192.0.2.5\r\n\
t=0 0\r\n\
m=audio 5004 RTP/AVP 0 8 101\r\n\
a=rtpmap:0 PCMU/8000\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.audio_port, 5004);
        assert_eq!(sdp.payload_types, vec![0, 8, 101]);
        assert!(sdp.offers_pcmu());
        assert_eq!(
            sdp.remote_endpoint().unwrap(),
            ("192.0.2.5".to_string(), 5004)
        );
    }

    #[test]
    fn test_media_level_connection_wins() {
        let raw = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 6000 RTP/AVP 0\r\nc=IN IP4 10.0.0.2\r\n";
        let sdp = SessionDescription::parse(raw).unwrap();
        assert_eq!(sdp.connection_addr.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_no_audio_section() {
        assert!(SessionDescription::parse("v=0\r\nc=IN IP4 1.2.3.4\r\n").is_err());
    }

    #[test]
    fn test_no_pcmu() {
        let raw = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 6000 RTP/AVP 8 18\r\n";
        let sdp = SessionDescription::parse(raw).unwrap();
        assert!(!sdp.offers_pcmu());
    }

    #[test]
    fn test_build_round_trip() {
        let body = build_audio_sdp("127.0.0.1".parse().unwrap(), 10002);
        assert!(body.contains("m=audio 10002 RTP/AVP 0"));
        assert!(body.contains("a=rtpmap:0 PCMU/8000"));
        assert!(body.contains("a=ptime:20"));
        assert!(body.contains("a=rtcp-mux"));
        let parsed = SessionDescription::parse(&body).unwrap();
        assert_eq!(parsed.audio_port, 10002);
        assert!(parsed.offers_pcmu());
        assert_eq!(parsed.connection_addr.as_deref(), Some("127.0.0.1"));
    }
}
