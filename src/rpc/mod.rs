//! Control plane between the signaling daemon and media nodes
//!
//! Strongly-typed request/response pairs plus one server-streaming call
//! (PlayAudio) carried as length-prefixed JSON frames over TCP. Every
//! request frame carries a correlation id; response frames echo it, and a
//! stream ends with `done = true`.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::media::PlaybackEvent;
use crate::{Error, Result};

pub use client::MediaRpcClient;

/// Upper bound for one frame; anything larger is a protocol violation.
const MAX_FRAME_BYTES: u32 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    CreateSession {
        call_id: String,
        remote_addr: String,
        remote_port: u16,
        codecs: Vec<u8>,
    },
    CreateSessionPendingRemote {
        call_id: String,
        codecs: Vec<u8>,
    },
    UpdateSessionRemote {
        session_id: String,
        remote_addr: String,
        remote_port: u16,
    },
    DestroySession {
        session_id: String,
        reason: String,
    },
    PlayAudio {
        session_id: String,
        file_path: String,
    },
    StopAudio {
        session_id: String,
    },
    SendDtmf {
        session_id: String,
        digit: char,
        duration_ms: u32,
    },
    BridgeMedia {
        session_a: String,
        session_b: String,
    },
    UnbridgeMedia {
        bridge_id: Option<String>,
        session_id: Option<String>,
    },
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RpcResponse {
    Session {
        session_id: String,
        local_addr: String,
        local_port: u16,
        codec: u8,
        sdp: String,
    },
    Ok,
    StopAudio {
        was_playing: bool,
    },
    Bridge {
        bridge_id: String,
    },
    Health {
        healthy: bool,
        active_sessions: usize,
        available_ports: usize,
    },
    Playback(PlaybackEvent),
    Error {
        message: String,
    },
}

impl RpcResponse {
    /// Collapse an error response into a crate error.
    pub fn into_result(self) -> Result<RpcResponse> {
        match self {
            RpcResponse::Error { message } => Err(Error::transport(message)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: RpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: RpcResponse,
    /// False only for intermediate frames of a streaming response.
    pub done: bool,
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() as u32 > MAX_FRAME_BYTES {
        return Err(Error::transport("RPC frame exceeds size limit"));
    }
    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::transport(format!("RPC write failed: {}", e)))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| Error::transport(format!("RPC write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::transport(format!("RPC flush failed: {}", e)))?;
    Ok(())
}

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::transport(format!("RPC read failed: {}", e))),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::transport("RPC frame exceeds size limit"));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::transport(format!("RPC read failed: {}", e)))?;

    Ok(Some(serde_json::from_slice(&body)?))
}
