//! RPC server side, hosted by the media node daemon

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{read_frame, write_frame, RequestFrame, ResponseFrame, RpcRequest, RpcResponse};
use crate::media::{MediaNode, PlaybackEvent};
use crate::Result;

/// Accept control-plane connections until `shutdown` fires.
pub async fn serve(
    node: Arc<MediaNode>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr(), "media RPC listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("media RPC server stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "control connection accepted");
                        let node = Arc::clone(&node);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(node, stream, shutdown).await {
                                warn!(peer = %peer, error = %e, "control connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    node: Arc<MediaNode>,
    stream: TcpStream,
    shutdown: CancellationToken,
) -> Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame::<_, RequestFrame>(&mut read_half) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(()); // clean EOF
        };

        let node = Arc::clone(&node);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            dispatch(node, writer, frame).await;
        });
    }
}

async fn dispatch(node: Arc<MediaNode>, writer: Arc<Mutex<OwnedWriteHalf>>, frame: RequestFrame) {
    let id = frame.id;

    // PlayAudio streams; everything else is unary.
    if let RpcRequest::PlayAudio {
        session_id,
        file_path,
    } = frame.request
    {
        stream_playback(node, writer, id, session_id, file_path).await;
        return;
    }

    let response = handle_unary(&node, frame.request).await;
    send_frame(
        &writer,
        ResponseFrame {
            id,
            response,
            done: true,
        },
    )
    .await;
}

async fn handle_unary(node: &MediaNode, request: RpcRequest) -> RpcResponse {
    let result = match request {
        RpcRequest::CreateSession {
            call_id,
            remote_addr,
            remote_port,
            codecs,
        } => node
            .create_session(call_id, remote_addr, remote_port, &codecs)
            .map(session_response),
        RpcRequest::CreateSessionPendingRemote { call_id, codecs } => node
            .create_session_pending_remote(call_id, &codecs)
            .map(session_response),
        RpcRequest::UpdateSessionRemote {
            session_id,
            remote_addr,
            remote_port,
        } => node
            .update_session_remote(&session_id, remote_addr, remote_port)
            .map(|_| RpcResponse::Ok),
        RpcRequest::DestroySession { session_id, reason } => node
            .destroy_session(&session_id, &reason)
            .map(|_| RpcResponse::Ok),
        RpcRequest::StopAudio { session_id } => node
            .stop(&session_id)
            .map(|was_playing| RpcResponse::StopAudio { was_playing }),
        RpcRequest::SendDtmf {
            session_id,
            digit,
            duration_ms,
        } => node
            .send_dtmf(&session_id, digit, duration_ms)
            .await
            .map(|_| RpcResponse::Ok),
        RpcRequest::BridgeMedia {
            session_a,
            session_b,
        } => node
            .bridge(&session_a, &session_b)
            .await
            .map(|bridge_id| RpcResponse::Bridge { bridge_id }),
        RpcRequest::UnbridgeMedia {
            bridge_id,
            session_id,
        } => match (bridge_id, session_id) {
            (Some(bridge_id), _) => node.unbridge(&bridge_id).map(|_| RpcResponse::Ok),
            (None, Some(session_id)) => {
                node.unbridge_session(&session_id).map(|_| RpcResponse::Ok)
            }
            (None, None) => Err(crate::Error::parse(
                "UnbridgeMedia needs a bridge or session id",
            )),
        },
        RpcRequest::Health => {
            let health = node.health();
            Ok(RpcResponse::Health {
                healthy: health.healthy,
                active_sessions: health.active_sessions,
                available_ports: health.available_ports,
            })
        }
        RpcRequest::PlayAudio { .. } => unreachable!("handled by dispatch"),
    };

    result.unwrap_or_else(|e| RpcResponse::Error {
        message: e.to_string(),
    })
}

fn session_response(info: crate::media::SessionInfo) -> RpcResponse {
    RpcResponse::Session {
        session_id: info.session_id,
        local_addr: info.local_addr.to_string(),
        local_port: info.local_port,
        codec: info.codec,
        sdp: info.sdp,
    }
}

async fn stream_playback(
    node: Arc<MediaNode>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    id: u64,
    session_id: String,
    file_path: String,
) {
    let call_id = node.session(&session_id).map(|s| s.call_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<PlaybackEvent>();
    if let Err(e) = node.play(&session_id, file_path, tx) {
        send_frame(
            &writer,
            ResponseFrame {
                id,
                response: RpcResponse::Error {
                    message: e.to_string(),
                },
                done: true,
            },
        )
        .await;
        return;
    }

    while let Some(event) = rx.recv().await {
        let done = matches!(
            event,
            PlaybackEvent::Completed { .. } | PlaybackEvent::Error { .. }
        );
        send_frame(
            &writer,
            ResponseFrame {
                id,
                response: RpcResponse::Playback(event),
                done,
            },
        )
        .await;
        if done {
            // free the per-call single-flight slot
            if let Some(call_id) = &call_id {
                node.playback_finished(call_id);
            }
            return;
        }
    }

    // playback task dropped its sender without a terminal event (cancelled)
    if let Some(call_id) = &call_id {
        node.playback_finished(call_id);
    }
    send_frame(
        &writer,
        ResponseFrame {
            id,
            response: RpcResponse::Playback(PlaybackEvent::Error {
                session_id,
                message: "playback cancelled".to_string(),
            }),
            done: true,
        },
    )
    .await;
}

async fn send_frame(writer: &Arc<Mutex<OwnedWriteHalf>>, frame: ResponseFrame) {
    let mut guard = writer.lock().await;
    if let Err(e) = write_frame(&mut *guard, &frame).await {
        warn!(error = %e, "failed to write RPC response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, PortRange};
    use crate::rpc::MediaRpcClient;
    use std::time::Duration;

    async fn start_node() -> (Arc<MediaRpcClient>, CancellationToken) {
        let node = Arc::new(MediaNode::new(&MediaConfig {
            rpc_listen_addr: "127.0.0.1".parse().unwrap(),
            rpc_listen_port: 0,
            advertise_addr: "127.0.0.1".parse().unwrap(),
            port_range: PortRange {
                min: 42000,
                max: 42100,
            },
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(node, listener, shutdown.clone()));

        let client = MediaRpcClient::connect(addr).await;
        (client, shutdown)
    }

    #[tokio::test]
    async fn test_create_update_destroy_over_wire() {
        let (client, _shutdown) = start_node().await;

        let response = client
            .request(
                RpcRequest::CreateSessionPendingRemote {
                    call_id: "c1".to_string(),
                    codecs: vec![0],
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let session_id = match response {
            RpcResponse::Session {
                session_id, sdp, ..
            } => {
                assert!(sdp.contains("RTP/AVP 0"));
                session_id
            }
            other => panic!("unexpected: {:?}", other),
        };

        let response = client
            .request(
                RpcRequest::UpdateSessionRemote {
                    session_id: session_id.clone(),
                    remote_addr: "127.0.0.1".to_string(),
                    remote_port: 45678,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Ok));

        let response = client
            .request(
                RpcRequest::DestroySession {
                    session_id,
                    reason: "test".to_string(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Ok));
    }

    #[tokio::test]
    async fn test_health_over_wire() {
        let (client, _shutdown) = start_node().await;
        let response = client
            .request(RpcRequest::Health, Duration::from_secs(1))
            .await
            .unwrap();
        match response {
            RpcResponse::Health {
                healthy,
                active_sessions,
                ..
            } => {
                assert!(healthy);
                assert_eq!(active_sessions, 0);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_codec_rejection_surfaces_as_error() {
        let (client, _shutdown) = start_node().await;
        let err = client
            .request(
                RpcRequest::CreateSession {
                    call_id: "c1".to_string(),
                    remote_addr: "192.0.2.5".to_string(),
                    remote_port: 5004,
                    codecs: vec![8, 18],
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PCMU"));
    }
}
