//! Bidirectional RTP relay between two co-located sessions
//!
//! One task per direction: read on a session's local socket, forward the
//! datagram out of the peer session's socket to the peer's remote endpoint.
//! Directions are independent; no ordering is imposed between them.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocols::dtmf::{DtmfReceiver, TelephoneEvent, TELEPHONE_EVENT_PAYLOAD_TYPE};
use crate::protocols::rtp::{RtpPacket, SequenceTracker};
use crate::{Error, Result};

/// One side of a bridge: where to listen and where the peer's media goes.
#[derive(Debug, Clone)]
pub struct BridgeEndpoint {
    pub session_id: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
}

#[derive(Debug, Default)]
pub struct DirectionCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub lost: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b_packets: u64,
    pub a_to_b_bytes: u64,
    pub a_to_b_lost: u64,
    pub b_to_a_packets: u64,
    pub b_to_a_bytes: u64,
    pub b_to_a_lost: u64,
}

/// A running media bridge. Dropping it does not stop the relay; call
/// [`MediaBridge::stop`].
#[derive(Debug)]
pub struct MediaBridge {
    pub bridge_id: String,
    pub endpoint_a: BridgeEndpoint,
    pub endpoint_b: BridgeEndpoint,
    active: AtomicBool,
    cancel: CancellationToken,
    a_to_b: Arc<DirectionCounters>,
    b_to_a: Arc<DirectionCounters>,
}

impl MediaBridge {
    /// Validate endpoints, bind both sockets, start both relay directions.
    ///
    /// Remote addresses must be IPv4 literals; this fails before any socket
    /// is bound.
    pub async fn start(endpoint_a: BridgeEndpoint, endpoint_b: BridgeEndpoint) -> Result<Self> {
        let remote_a = parse_remote(&endpoint_a)?;
        let remote_b = parse_remote(&endpoint_b)?;

        let socket_a = Arc::new(
            UdpSocket::bind(("0.0.0.0", endpoint_a.local_port))
                .await
                .map_err(|e| {
                    Error::transport(format!(
                        "Cannot bind bridge port {}: {}",
                        endpoint_a.local_port, e
                    ))
                })?,
        );
        let socket_b = Arc::new(
            UdpSocket::bind(("0.0.0.0", endpoint_b.local_port))
                .await
                .map_err(|e| {
                    Error::transport(format!(
                        "Cannot bind bridge port {}: {}",
                        endpoint_b.local_port, e
                    ))
                })?,
        );

        let bridge_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let a_to_b = Arc::new(DirectionCounters::default());
        let b_to_a = Arc::new(DirectionCounters::default());

        // a -> b: read A's socket, forward out of B's socket to B's remote
        tokio::spawn(relay_direction(
            Arc::clone(&socket_a),
            Arc::clone(&socket_b),
            remote_b,
            cancel.clone(),
            Arc::clone(&a_to_b),
            format!("{}:a->b", bridge_id),
        ));
        tokio::spawn(relay_direction(
            Arc::clone(&socket_b),
            Arc::clone(&socket_a),
            remote_a,
            cancel.clone(),
            Arc::clone(&b_to_a),
            format!("{}:b->a", bridge_id),
        ));

        info!(
            bridge_id = %bridge_id,
            a = %endpoint_a.session_id,
            b = %endpoint_b.session_id,
            "media bridge started"
        );

        Ok(Self {
            bridge_id,
            endpoint_a,
            endpoint_b,
            active: AtomicBool::new(true),
            cancel,
            a_to_b,
            b_to_a,
        })
    }

    /// Stop both relay directions and release the sockets. Idempotent.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
            info!(bridge_id = %self.bridge_id, "media bridge stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            a_to_b_packets: self.a_to_b.packets.load(Ordering::Relaxed),
            a_to_b_bytes: self.a_to_b.bytes.load(Ordering::Relaxed),
            a_to_b_lost: self.a_to_b.lost.load(Ordering::Relaxed),
            b_to_a_packets: self.b_to_a.packets.load(Ordering::Relaxed),
            b_to_a_bytes: self.b_to_a.bytes.load(Ordering::Relaxed),
            b_to_a_lost: self.b_to_a.lost.load(Ordering::Relaxed),
        }
    }
}

/// Inbound statistics and DTMF detection on the relayed stream. Forwarding
/// never depends on this; malformed packets are relayed untouched.
fn inspect_rtp(
    datagram: &[u8],
    tracker: &mut SequenceTracker,
    dtmf: &mut DtmfReceiver,
    counters: &DirectionCounters,
    label: &str,
) {
    let Ok(packet) = RtpPacket::decode(Bytes::copy_from_slice(datagram)) else {
        return;
    };

    let lost_before = tracker.lost();
    tracker.update(packet.sequence_number);
    let newly_lost = tracker.lost() - lost_before;
    if newly_lost > 0 {
        counters.lost.fetch_add(newly_lost, Ordering::Relaxed);
    }

    if packet.payload_type == TELEPHONE_EVENT_PAYLOAD_TYPE {
        if let Ok(event) = TelephoneEvent::decode(&packet.payload) {
            if let Some(digit) = dtmf.on_event(event) {
                info!(direction = %label, digit = %digit, "DTMF digit relayed");
            }
        }
    }
}

fn parse_remote(endpoint: &BridgeEndpoint) -> Result<SocketAddr> {
    let ip: Ipv4Addr = endpoint.remote_addr.parse().map_err(|_| {
        Error::invalid_state(format!(
            "Bridge endpoint {} remote is not an IPv4 address: {}",
            endpoint.session_id, endpoint.remote_addr
        ))
    })?;
    Ok(SocketAddr::new(ip.into(), endpoint.remote_port))
}

async fn relay_direction(
    from: Arc<UdpSocket>,
    via: Arc<UdpSocket>,
    dest: SocketAddr,
    cancel: CancellationToken,
    counters: Arc<DirectionCounters>,
    label: String,
) {
    let mut buf = [0u8; 1500];
    let mut first = true;
    let mut tracker = SequenceTracker::new();
    let mut dtmf = DtmfReceiver::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(direction = %label, "relay stopped");
                return;
            }
            result = from.recv_from(&mut buf) => {
                match result {
                    Ok((n, _source)) => {
                        if first {
                            info!(direction = %label, dest = %dest, bytes = n, "first packet relayed");
                            first = false;
                        }
                        if let Err(e) = via.send_to(&buf[..n], dest).await {
                            warn!(direction = %label, error = %e, "relay send failed");
                            continue;
                        }
                        counters.packets.fetch_add(1, Ordering::Relaxed);
                        counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
                        inspect_rtp(&buf[..n], &mut tracker, &mut dtmf, &counters, &label);
                    }
                    Err(e) => {
                        warn!(direction = %label, error = %e, "relay recv failed");
                        return;
                    }
                }
            }
        }
    }
}
