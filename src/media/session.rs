//! Media sessions: one RTP endpoint per call leg
//!
//! A session owns a local RTP/RTCP port pair for its lifetime. The remote
//! endpoint may arrive later (UAC offers before the peer answers), so a
//! session created without one sits in `PendingRemote` until the SDP answer
//! lands. Playback and bridging are mutually exclusive: both want the local
//! port's socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::media::audio;
use crate::protocols::rtp::{ClockPacedWriter, CodecParams};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    PendingRemote,
    Active,
    Bridged,
    Terminated,
}

/// One RTP endpoint owned by the media node.
#[derive(Debug, Clone)]
pub struct MediaSession {
    pub session_id: String,
    pub call_id: String,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub rtcp_port: u16,
    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub codec: u8,
    pub state: SessionState,
    pub created_at: Instant,
}

impl MediaSession {
    pub fn new(
        call_id: String,
        local_addr: IpAddr,
        local_port: u16,
        rtcp_port: u16,
        codec: u8,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            call_id,
            local_addr,
            local_port,
            rtcp_port,
            remote_addr: None,
            remote_port: None,
            codec,
            state: SessionState::Created,
            created_at: Instant::now(),
        }
    }

    pub fn set_remote(&mut self, addr: String, port: u16) {
        self.remote_addr = Some(addr);
        self.remote_port = Some(port);
        if self.state == SessionState::PendingRemote || self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
    }

    pub fn remote_socket_addr(&self) -> Result<SocketAddr> {
        let addr = self
            .remote_addr
            .as_deref()
            .ok_or_else(|| Error::invalid_state("Session has no remote endpoint"))?;
        let port = self
            .remote_port
            .ok_or_else(|| Error::invalid_state("Session has no remote port"))?;
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| Error::parse(format!("Invalid remote address: {}", addr)))?;
        Ok(SocketAddr::new(ip, port))
    }
}

/// Events produced by a playback task, streamed back over the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlaybackEvent {
    Started { session_id: String },
    Completed { session_id: String },
    Error { session_id: String, message: String },
}

/// Stream a WAV file as paced PCMU frames to the session's remote endpoint.
///
/// Binds its own socket on the session's local port; the port can be
/// re-bound by a bridge after this task ends. Runs until the audio is
/// exhausted or `cancel` fires.
pub async fn stream_audio(
    session_id: String,
    file_path: String,
    local_port: u16,
    remote: SocketAddr,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    let result = run_playback(
        &session_id,
        &file_path,
        local_port,
        remote,
        &cancel,
        &events,
    )
    .await;

    match result {
        Ok(true) => {
            info!(session_id = %session_id, file = %file_path, "playback completed");
            let _ = events.send(PlaybackEvent::Completed { session_id });
        }
        Ok(false) => {
            debug!(session_id = %session_id, "playback cancelled");
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "playback failed");
            let _ = events.send(PlaybackEvent::Error {
                session_id,
                message: e.to_string(),
            });
        }
    }
}

/// Returns Ok(true) when the file played to the end, Ok(false) on cancel.
async fn run_playback(
    session_id: &str,
    file_path: &str,
    local_port: u16,
    remote: SocketAddr,
    cancel: &CancellationToken,
    events: &mpsc::UnboundedSender<PlaybackEvent>,
) -> Result<bool> {
    let data = tokio::fs::read(file_path)
        .await
        .map_err(|e| Error::media(format!("Cannot read {}: {}", file_path, e)))?;
    let pcm = audio::decode_wav(&data)?;
    let ulaw = audio::pcm_to_ulaw(&pcm.samples);

    let socket = UdpSocket::bind(("0.0.0.0", local_port))
        .await
        .map_err(|e| Error::transport(format!("Cannot bind RTP port {}: {}", local_port, e)))?;
    let socket = Arc::new(socket);

    let codec = CodecParams::pcmu();
    let frame_len = codec.samples_per_frame as usize;
    let mut writer = ClockPacedWriter::new(socket, remote, codec);

    let _ = events.send(PlaybackEvent::Started {
        session_id: session_id.to_string(),
    });

    for frame in ulaw.chunks(frame_len) {
        // short trailing frame is padded with u-law silence
        let payload = if frame.len() == frame_len {
            Bytes::copy_from_slice(frame)
        } else {
            let mut padded = frame.to_vec();
            padded.resize(frame_len, 0xFF);
            Bytes::from(padded)
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                writer.close();
                return Ok(false);
            }
            result = writer.write(payload) => {
                result?;
            }
        }
    }

    writer.close();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_wav(frames: usize) -> tempfile::NamedTempFile {
        let samples: Vec<i16> = vec![1000; frames * 160];
        let data_len = samples.len() * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&8000u32.to_le_bytes());
        out.extend_from_slice(&16000u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        for s in &samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&out).unwrap();
        file
    }

    #[test]
    fn test_session_remote_transitions() {
        let mut session = MediaSession::new(
            "call-1".to_string(),
            "127.0.0.1".parse().unwrap(),
            10000,
            10001,
            0,
        );
        session.state = SessionState::PendingRemote;
        assert!(session.remote_socket_addr().is_err());

        session.set_remote("192.0.2.5".to_string(), 5004);
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(
            session.remote_socket_addr().unwrap(),
            "192.0.2.5:5004".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_playback_emits_frames_and_completes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap();
        let file = test_wav(3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        drop(local);

        stream_audio(
            "s-1".to_string(),
            file.path().to_string_lossy().to_string(),
            local_port,
            remote,
            cancel,
            tx,
        )
        .await;

        let mut buf = [0u8; 1500];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        // 12-byte RTP header + 160 bytes of u-law
        assert_eq!(n, 172);

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(PlaybackEvent::Started { .. })));
        assert!(matches!(events.last(), Some(PlaybackEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_playback_cancel_suppresses_completion() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap();
        let file = test_wav(200); // 4 seconds of audio

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        drop(local);

        let handle = tokio::spawn(stream_audio(
            "s-2".to_string(),
            file.path().to_string_lossy().to_string(),
            local_port,
            remote,
            cancel_clone,
            tx,
        ));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut saw_completed = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, PlaybackEvent::Completed { .. }) {
                saw_completed = true;
            }
        }
        assert!(!saw_completed);
    }

    #[tokio::test]
    async fn test_playback_missing_file_errors() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream_audio(
            "s-3".to_string(),
            "/nonexistent/audio.wav".to_string(),
            0,
            "127.0.0.1:9".parse().unwrap(),
            CancellationToken::new(),
            tx,
        )
        .await;
        assert!(matches!(rx.try_recv(), Ok(PlaybackEvent::Error { .. })));
    }
}
