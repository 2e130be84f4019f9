//! Media node: session registry and control-plane operation surface
//!
//! Owns the port pool, all sessions on this node, active bridges and the
//! per-call playback handles. The RPC server is a thin shim over the
//! methods here.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::media::bridge::{BridgeEndpoint, MediaBridge};
use crate::media::port_pool::PortPool;
use crate::media::session::{stream_audio, MediaSession, PlaybackEvent, SessionState};
use crate::protocols::dtmf::{self, TELEPHONE_EVENT_PAYLOAD_TYPE};
use crate::protocols::rtp::{ClockPacedWriter, CodecParams};
use crate::protocols::sdp;
use crate::{Error, Result};

/// What the signaling plane needs back from a session creation.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub codec: u8,
    pub sdp: String,
}

#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub active_sessions: usize,
    pub available_ports: usize,
}

pub struct MediaNode {
    advertise_addr: IpAddr,
    port_pool: PortPool,
    sessions: DashMap<String, MediaSession>,
    /// call-id -> playback cancellation; enforces one playback per call.
    playbacks: DashMap<String, CancellationToken>,
    bridges: DashMap<String, Arc<MediaBridge>>,
    /// session-id -> bridge-id for unbridge-by-session and exclusivity.
    session_bridges: DashMap<String, String>,
}

impl MediaNode {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            advertise_addr: config.advertise_addr,
            port_pool: PortPool::new(config.port_range),
            sessions: DashMap::new(),
            playbacks: DashMap::new(),
            bridges: DashMap::new(),
            session_bridges: DashMap::new(),
        }
    }

    /// Create a session with a known remote endpoint (UAS answering an
    /// offer). Fails unless PCMU was offered.
    pub fn create_session(
        &self,
        call_id: String,
        remote_addr: String,
        remote_port: u16,
        offered_codecs: &[u8],
    ) -> Result<SessionInfo> {
        if !offered_codecs.contains(&sdp::PAYLOAD_TYPE_PCMU) {
            return Err(Error::media("Peer did not offer PCMU (payload type 0)"));
        }

        let mut session = self.allocate_session(call_id)?;
        session.set_remote(remote_addr, remote_port);
        self.finish_create(session)
    }

    /// Create a session whose remote endpoint arrives later (UAC side).
    pub fn create_session_pending_remote(
        &self,
        call_id: String,
        offered_codecs: &[u8],
    ) -> Result<SessionInfo> {
        if !offered_codecs.contains(&sdp::PAYLOAD_TYPE_PCMU) {
            return Err(Error::media("No PCMU in requested codec list"));
        }

        let mut session = self.allocate_session(call_id)?;
        session.state = SessionState::PendingRemote;
        self.finish_create(session)
    }

    fn allocate_session(&self, call_id: String) -> Result<MediaSession> {
        let pair = self.port_pool.allocate()?;
        Ok(MediaSession::new(
            call_id,
            self.advertise_addr,
            pair.rtp,
            pair.rtcp,
            sdp::PAYLOAD_TYPE_PCMU,
        ))
    }

    fn finish_create(&self, session: MediaSession) -> Result<SessionInfo> {
        let info = SessionInfo {
            session_id: session.session_id.clone(),
            local_addr: session.local_addr,
            local_port: session.local_port,
            codec: session.codec,
            sdp: sdp::build_audio_sdp(session.local_addr, session.local_port),
        };
        info!(
            session_id = %info.session_id,
            call_id = %session.call_id,
            port = info.local_port,
            state = ?session.state,
            "media session created"
        );
        self.sessions.insert(session.session_id.clone(), session);
        Ok(info)
    }

    pub fn update_session_remote(
        &self,
        session_id: &str,
        remote_addr: String,
        remote_port: u16,
    ) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;
        session.set_remote(remote_addr, remote_port);
        debug!(session_id = %session_id, "session remote updated");
        Ok(())
    }

    /// Tear down a session: cancel its playback, drop it out of any bridge,
    /// release its ports. Safe to call repeatedly.
    pub fn destroy_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Ok(());
        };

        if let Some((_, cancel)) = self.playbacks.remove(&session.call_id) {
            cancel.cancel();
        }
        if let Some(bridge_id) = self.session_bridges.get(session_id).map(|e| e.value().clone()) {
            let _ = self.unbridge(&bridge_id);
        }
        self.port_pool.release(session.local_port);

        info!(
            session_id = %session_id,
            call_id = %session.call_id,
            reason = %reason,
            "media session destroyed"
        );
        Ok(())
    }

    /// Start playback on a session. One playback per call; a bridged
    /// session cannot play (both need the local port).
    pub fn play(
        &self,
        session_id: &str,
        file_path: String,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;

        if session.state == SessionState::Bridged {
            return Err(Error::invalid_state(
                "Session is bridged; playback and bridging are exclusive",
            ));
        }
        let remote = session.remote_socket_addr()?;
        let call_id = session.call_id.clone();
        let local_port = session.local_port;
        drop(session);

        let cancel = CancellationToken::new();
        match self.playbacks.entry(call_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::invalid_state(format!(
                    "Call {} already has active playback",
                    call_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(cancel.clone());
            }
        }

        let session_id = session_id.to_string();
        tokio::spawn(stream_audio(
            session_id,
            file_path,
            local_port,
            remote,
            cancel,
            events,
        ));
        Ok(())
    }

    /// Stop playback for a session's call. Returns whether anything was
    /// playing.
    pub fn stop(&self, session_id: &str) -> Result<bool> {
        let call_id = self
            .sessions
            .get(session_id)
            .map(|s| s.call_id.clone())
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;

        match self.playbacks.remove(&call_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear a finished playback's single-flight slot.
    pub fn playback_finished(&self, call_id: &str) {
        self.playbacks.remove(call_id);
    }

    /// Send one RFC 4733 digit to the session's remote endpoint. Uses the
    /// session's local port, so it shares the playback/bridging exclusivity
    /// rule.
    pub async fn send_dtmf(&self, session_id: &str, digit: char, duration_ms: u32) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;
        if session.state == SessionState::Bridged {
            return Err(Error::invalid_state(
                "Session is bridged; its port belongs to the relay",
            ));
        }
        if self.playbacks.contains_key(&session.call_id) {
            return Err(Error::invalid_state(
                "Session has active playback; stop it before sending DTMF",
            ));
        }
        let remote = session.remote_socket_addr()?;
        let local_port = session.local_port;
        drop(session);

        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(|e| Error::transport(format!("Cannot bind RTP port {}: {}", local_port, e)))?;
        let mut writer = ClockPacedWriter::new(Arc::new(socket), remote, CodecParams::pcmu());
        dtmf::send_digit(
            &mut writer,
            TELEPHONE_EVENT_PAYLOAD_TYPE,
            digit,
            duration_ms,
            10,
        )
        .await?;
        writer.close();
        info!(session_id = %session_id, digit = %digit, "DTMF sent");
        Ok(())
    }

    /// Relay RTP between two sessions on this node.
    pub async fn bridge(&self, session_a: &str, session_b: &str) -> Result<String> {
        let endpoint_a = self.bridge_endpoint(session_a)?;
        let endpoint_b = self.bridge_endpoint(session_b)?;

        let bridge = MediaBridge::start(endpoint_a, endpoint_b).await?;
        let bridge_id = bridge.bridge_id.clone();

        for sid in [session_a, session_b] {
            if let Some(mut session) = self.sessions.get_mut(sid) {
                session.state = SessionState::Bridged;
            }
            self.session_bridges.insert(sid.to_string(), bridge_id.clone());
        }
        self.bridges.insert(bridge_id.clone(), Arc::new(bridge));
        Ok(bridge_id)
    }

    fn bridge_endpoint(&self, session_id: &str) -> Result<BridgeEndpoint> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;

        if self.playbacks.contains_key(&session.call_id) {
            return Err(Error::invalid_state(format!(
                "Session {} has active playback; stop it before bridging",
                session_id
            )));
        }

        let remote_addr = session
            .remote_addr
            .clone()
            .ok_or_else(|| Error::invalid_state("Session has no remote endpoint"))?;
        let remote_port = session
            .remote_port
            .ok_or_else(|| Error::invalid_state("Session has no remote port"))?;

        Ok(BridgeEndpoint {
            session_id: session.session_id.clone(),
            local_port: session.local_port,
            remote_addr,
            remote_port,
        })
    }

    /// Tear down a bridge by id. Idempotent.
    pub fn unbridge(&self, bridge_id: &str) -> Result<()> {
        let Some((_, bridge)) = self.bridges.remove(bridge_id) else {
            return Ok(());
        };
        bridge.stop();

        for sid in [&bridge.endpoint_a.session_id, &bridge.endpoint_b.session_id] {
            self.session_bridges.remove(sid);
            if let Some(mut session) = self.sessions.get_mut(sid) {
                if session.state == SessionState::Bridged {
                    session.state = SessionState::Active;
                }
            }
        }
        Ok(())
    }

    /// Tear down whatever bridge a session participates in. Idempotent.
    pub fn unbridge_session(&self, session_id: &str) -> Result<()> {
        if let Some(bridge_id) = self.session_bridges.get(session_id).map(|e| e.value().clone()) {
            self.unbridge(&bridge_id)
        } else {
            Ok(())
        }
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            healthy: true,
            active_sessions: self.sessions.len(),
            available_ports: self.port_pool.available(),
        }
    }

    pub fn session(&self, session_id: &str) -> Option<MediaSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop everything; used at daemon shutdown.
    pub fn shutdown(&self) {
        for entry in self.bridges.iter() {
            entry.value().stop();
        }
        self.bridges.clear();
        self.session_bridges.clear();
        for entry in self.playbacks.iter() {
            entry.value().cancel();
        }
        self.playbacks.clear();
        let ids: Vec<String> = self.sessions.iter().map(|s| s.session_id.clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                self.port_pool.release(session.local_port);
            }
        }
        warn!("media node shut down, all sessions dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn node(port_base: u16) -> MediaNode {
        MediaNode::new(&MediaConfig {
            rpc_listen_addr: "127.0.0.1".parse().unwrap(),
            rpc_listen_port: 0,
            advertise_addr: "127.0.0.1".parse().unwrap(),
            port_range: PortRange {
                min: port_base,
                max: port_base + 40,
            },
        })
    }

    #[test]
    fn test_create_requires_pcmu() {
        let node = node(41000);
        let err = node
            .create_session("c1".to_string(), "192.0.2.5".to_string(), 5004, &[8, 18])
            .unwrap_err();
        assert!(matches!(err, Error::Media(_)));

        let info = node
            .create_session("c1".to_string(), "192.0.2.5".to_string(), 5004, &[0, 8])
            .unwrap();
        assert_eq!(info.codec, 0);
        assert!(info.sdp.contains(&format!("m=audio {} RTP/AVP 0", info.local_port)));
    }

    #[test]
    fn test_pending_remote_lifecycle() {
        let node = node(41050);
        let info = node
            .create_session_pending_remote("c2".to_string(), &[0])
            .unwrap();
        let session = node.session(&info.session_id).unwrap();
        assert_eq!(session.state, SessionState::PendingRemote);

        node.update_session_remote(&info.session_id, "192.0.2.9".to_string(), 6000)
            .unwrap();
        let session = node.session(&info.session_id).unwrap();
        assert_eq!(session.state, SessionState::Active);
    }

    #[test]
    fn test_destroy_releases_ports_and_is_idempotent() {
        let node = node(41100);
        let before = node.port_pool.available();
        let info = node
            .create_session("c3".to_string(), "192.0.2.5".to_string(), 5004, &[0])
            .unwrap();
        assert_eq!(node.port_pool.available(), before - 1);

        node.destroy_session(&info.session_id, "normal").unwrap();
        assert_eq!(node.port_pool.available(), before);
        node.destroy_session(&info.session_id, "normal").unwrap();
        assert_eq!(node.port_pool.available(), before);
        assert_eq!(node.session_count(), 0);
    }

    #[tokio::test]
    async fn test_bridge_then_unbridge() {
        let node = node(41150);
        let a = node
            .create_session("ca".to_string(), "127.0.0.1".to_string(), 46000, &[0])
            .unwrap();
        let b = node
            .create_session("cb".to_string(), "127.0.0.1".to_string(), 46002, &[0])
            .unwrap();

        let bridge_id = node.bridge(&a.session_id, &b.session_id).await.unwrap();
        assert_eq!(
            node.session(&a.session_id).unwrap().state,
            SessionState::Bridged
        );

        node.unbridge(&bridge_id).unwrap();
        assert_eq!(
            node.session(&a.session_id).unwrap().state,
            SessionState::Active
        );
        // idempotent
        node.unbridge(&bridge_id).unwrap();
    }

    #[tokio::test]
    async fn test_play_single_flight_and_bridge_exclusivity() {
        let node = node(41200);
        let a = node
            .create_session("cd".to_string(), "127.0.0.1".to_string(), 46010, &[0])
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        // missing file is fine here: single-flight is claimed before the task runs
        node.play(&a.session_id, "/no/such/file.wav".to_string(), tx.clone())
            .unwrap();
        let err = node
            .play(&a.session_id, "/no/such/file.wav".to_string(), tx)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        assert!(node.stop(&a.session_id).unwrap());
        assert!(!node.stop(&a.session_id).unwrap());

        // a session with pending playback refuses to bridge
        let b = node
            .create_session("ce".to_string(), "127.0.0.1".to_string(), 46012, &[0])
            .unwrap();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        node.play(&b.session_id, "/no/such/file.wav".to_string(), tx2)
            .unwrap();
        let err = node.bridge(&a.session_id, &b.session_id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_send_dtmf_emits_event_train() {
        use crate::protocols::dtmf::{DtmfReceiver, TelephoneEvent};
        use crate::protocols::rtp::RtpPacket;

        let node = node(41250);
        let receiver_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_port = receiver_sock.local_addr().unwrap().port();

        let a = node
            .create_session("cf".to_string(), "127.0.0.1".to_string(), remote_port, &[0])
            .unwrap();
        node.send_dtmf(&a.session_id, '5', 100).await.unwrap();

        let mut receiver = DtmfReceiver::default();
        let mut decoded = None;
        let mut first_marker = None;
        let mut buf = [0u8; 1500];
        // 5 intermediate + 3 end packets
        for _ in 0..8 {
            let (n, _) = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                receiver_sock.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            let packet = RtpPacket::decode(bytes::Bytes::copy_from_slice(&buf[..n])).unwrap();
            assert_eq!(packet.payload_type, TELEPHONE_EVENT_PAYLOAD_TYPE);
            first_marker.get_or_insert(packet.marker);
            if let Some(d) = receiver.on_event(TelephoneEvent::decode(&packet.payload).unwrap()) {
                decoded = Some(d);
            }
        }
        assert_eq!(first_marker, Some(true));
        assert_eq!(decoded, Some('5'));

        // a bridged session refuses DTMF (its port belongs to the relay)
        let b = node
            .create_session("cg".to_string(), "127.0.0.1".to_string(), 46020, &[0])
            .unwrap();
        let c = node
            .create_session("ch".to_string(), "127.0.0.1".to_string(), 46022, &[0])
            .unwrap();
        node.bridge(&b.session_id, &c.session_id).await.unwrap();
        assert!(node.send_dtmf(&b.session_id, '1', 100).await.is_err());
    }

    #[test]
    fn test_health_reports_counts() {
        let node = node(41300);
        let ports = node.port_pool.available();
        let health = node.health();
        assert!(health.healthy);
        assert_eq!(health.active_sessions, 0);
        assert_eq!(health.available_ports, ports);
    }
}
