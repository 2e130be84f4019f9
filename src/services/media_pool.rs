//! Media node pool: selection, session affinity and drain gating
//!
//! The pool fronts every media node the signaling plane knows about. New
//! sessions round-robin over members that are healthy, connected and not
//! draining; per-session operations are routed by the session-to-node
//! affinity map. The affinity map and its reverse index always mutate
//! together inside one critical section.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::rpc::{MediaRpcClient, ResponseFrame, RpcRequest, RpcResponse};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Active,
    Draining,
    Disabled,
}

impl DrainState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DrainState::Draining,
            2 => DrainState::Disabled,
            _ => DrainState::Active,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DrainState::Active => 0,
            DrainState::Draining => 1,
            DrainState::Disabled => 2,
        }
    }
}

pub struct PoolMember {
    pub node_id: String,
    pub address: SocketAddr,
    pub client: Arc<MediaRpcClient>,
    healthy: AtomicBool,
    drain_state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl PoolMember {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn drain_state(&self) -> DrainState {
        DrainState::from_u8(self.drain_state.load(Ordering::SeqCst))
    }

    fn set_drain_state(&self, state: DrainState) {
        self.drain_state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Eligible to host brand-new sessions.
    fn accepts_new_sessions(&self) -> bool {
        self.is_healthy()
            && self.client.is_connected()
            && self.drain_state() == DrainState::Active
    }
}

#[derive(Debug, Clone)]
pub struct PoolSession {
    pub node_id: String,
    pub session_id: String,
    pub local_addr: String,
    pub local_port: u16,
    pub codec: u8,
    pub sdp: String,
}

#[derive(Debug, Clone)]
pub struct PoolMemberStats {
    pub node_id: String,
    pub address: SocketAddr,
    pub healthy: bool,
    pub connected: bool,
    pub drain_state: DrainState,
    pub sessions: usize,
}

/// The four structures that must stay mutually consistent.
#[derive(Default)]
struct PoolIndex {
    members: Vec<Arc<PoolMember>>,
    members_by_id: HashMap<String, Arc<PoolMember>>,
    session_to_node: HashMap<String, String>,
    node_to_sessions: HashMap<String, HashSet<String>>,
    bridge_to_node: HashMap<String, String>,
}

pub struct MediaPool {
    index: RwLock<PoolIndex>,
    rr_counter: AtomicU64,
    rpc_timeout: Duration,
    health_interval: Duration,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl MediaPool {
    pub async fn new(config: &PoolConfig) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            index: RwLock::new(PoolIndex::default()),
            rr_counter: AtomicU64::new(0),
            rpc_timeout: Duration::from_secs(config.rpc_timeout),
            health_interval: Duration::from_secs(config.health_check_interval),
            unhealthy_threshold: config.unhealthy_threshold,
            healthy_threshold: config.healthy_threshold,
        });

        for member in &config.members {
            let address: SocketAddr = member
                .address
                .parse()
                .map_err(|_| Error::parse(format!("Bad member address: {}", member.address)))?;
            pool.add_member(member.node_id.clone(), address).await;
        }

        Ok(pool)
    }

    pub async fn add_member(&self, node_id: String, address: SocketAddr) {
        let client = MediaRpcClient::connect(address).await;
        let member = Arc::new(PoolMember {
            node_id: node_id.clone(),
            address,
            healthy: AtomicBool::new(client.is_connected()),
            client,
            drain_state: AtomicU8::new(DrainState::Active.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        });

        let mut index = self.index.write().unwrap();
        index.members.push(Arc::clone(&member));
        index.members_by_id.insert(node_id.clone(), member);
        index.node_to_sessions.entry(node_id.clone()).or_default();
        info!(node_id = %node_id, address = %address, "pool member added");
    }

    pub fn member(&self, node_id: &str) -> Option<Arc<PoolMember>> {
        self.index
            .read()
            .unwrap()
            .members_by_id
            .get(node_id)
            .cloned()
    }

    /// Round-robin over members able to host new sessions.
    pub fn select_member(&self) -> Result<Arc<PoolMember>> {
        let candidates: Vec<Arc<PoolMember>> = {
            let index = self.index.read().unwrap();
            index
                .members
                .iter()
                .filter(|m| m.accepts_new_sessions())
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return Err(Error::NoAvailableMembers);
        }
        let slot = self.rr_counter.fetch_add(1, Ordering::SeqCst) as usize % candidates.len();
        Ok(Arc::clone(&candidates[slot]))
    }

    pub fn node_of_session(&self, session_id: &str) -> Option<String> {
        self.index
            .read()
            .unwrap()
            .session_to_node
            .get(session_id)
            .cloned()
    }

    pub fn sessions_on_node(&self, node_id: &str) -> Vec<String> {
        self.index
            .read()
            .unwrap()
            .node_to_sessions
            .get(node_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_session(&self, node_id: &str, session_id: &str) {
        let mut index = self.index.write().unwrap();
        index
            .session_to_node
            .insert(session_id.to_string(), node_id.to_string());
        index
            .node_to_sessions
            .entry(node_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    fn forget_session(&self, session_id: &str) {
        let mut index = self.index.write().unwrap();
        if let Some(node_id) = index.session_to_node.remove(session_id) {
            if let Some(set) = index.node_to_sessions.get_mut(&node_id) {
                set.remove(session_id);
            }
        }
    }

    /// UAS path: the caller's SDP is known, allocate a session answering it.
    pub async fn create_session(
        &self,
        call_id: &str,
        remote_addr: &str,
        remote_port: u16,
        codecs: &[u8],
    ) -> Result<PoolSession> {
        let member = self.select_member()?;
        self.create_on_member(
            &member,
            RpcRequest::CreateSession {
                call_id: call_id.to_string(),
                remote_addr: remote_addr.to_string(),
                remote_port,
                codecs: codecs.to_vec(),
            },
        )
        .await
    }

    /// UAC path: allocate before the peer answers.
    pub async fn create_session_pending_remote(
        &self,
        call_id: &str,
        codecs: &[u8],
    ) -> Result<PoolSession> {
        let member = self.select_member()?;
        self.create_on_member(
            &member,
            RpcRequest::CreateSessionPendingRemote {
                call_id: call_id.to_string(),
                codecs: codecs.to_vec(),
            },
        )
        .await
    }

    /// Peer affinity: land the new session on the node that already hosts
    /// `peer_session_id`, draining or not, so the pair can be bridged.
    /// Falls back to round-robin when the peer is unknown.
    pub async fn create_session_pending_remote_on_node(
        &self,
        peer_session_id: &str,
        call_id: &str,
        codecs: &[u8],
    ) -> Result<PoolSession> {
        let member = match self
            .node_of_session(peer_session_id)
            .and_then(|node_id| self.member(&node_id))
        {
            Some(member) => member,
            None => {
                debug!(
                    peer = %peer_session_id,
                    "peer session unknown; falling back to round-robin"
                );
                self.select_member()?
            }
        };
        self.create_on_member(
            &member,
            RpcRequest::CreateSessionPendingRemote {
                call_id: call_id.to_string(),
                codecs: codecs.to_vec(),
            },
        )
        .await
    }

    /// Explicit placement, used by migration. A disabled node refuses; a
    /// draining one accepts (it was asked for by name).
    pub async fn create_session_on_node(
        &self,
        node_id: &str,
        call_id: &str,
        remote: Option<(String, u16)>,
        codecs: &[u8],
    ) -> Result<PoolSession> {
        let member = self
            .member(node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;
        if member.drain_state() == DrainState::Disabled {
            return Err(Error::invalid_state(format!(
                "Node {} is disabled",
                node_id
            )));
        }

        let request = match remote {
            Some((remote_addr, remote_port)) => RpcRequest::CreateSession {
                call_id: call_id.to_string(),
                remote_addr,
                remote_port,
                codecs: codecs.to_vec(),
            },
            None => RpcRequest::CreateSessionPendingRemote {
                call_id: call_id.to_string(),
                codecs: codecs.to_vec(),
            },
        };
        self.create_on_member(&member, request).await
    }

    async fn create_on_member(
        &self,
        member: &Arc<PoolMember>,
        request: RpcRequest,
    ) -> Result<PoolSession> {
        let response = member.client.request(request, self.rpc_timeout).await?;
        match response {
            RpcResponse::Session {
                session_id,
                local_addr,
                local_port,
                codec,
                sdp,
            } => {
                self.record_session(&member.node_id, &session_id);
                Ok(PoolSession {
                    node_id: member.node_id.clone(),
                    session_id,
                    local_addr,
                    local_port,
                    codec,
                    sdp,
                })
            }
            other => Err(Error::transport(format!(
                "Unexpected CreateSession response: {:?}",
                other
            ))),
        }
    }

    fn client_for_session(&self, session_id: &str) -> Result<Arc<MediaRpcClient>> {
        let node_id = self
            .node_of_session(session_id)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;
        let member = self
            .member(&node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;
        Ok(Arc::clone(&member.client))
    }

    pub async fn update_session_remote(
        &self,
        session_id: &str,
        remote_addr: &str,
        remote_port: u16,
    ) -> Result<()> {
        let client = self.client_for_session(session_id)?;
        client
            .request(
                RpcRequest::UpdateSessionRemote {
                    session_id: session_id.to_string(),
                    remote_addr: remote_addr.to_string(),
                    remote_port,
                },
                self.rpc_timeout,
            )
            .await?;
        Ok(())
    }

    /// Destroy a session wherever it lives, draining or disabled included.
    /// Unknown sessions are a no-op.
    pub async fn destroy_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let Some(node_id) = self.node_of_session(session_id) else {
            return Ok(());
        };
        let member = self
            .member(&node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;

        let result = member
            .client
            .request(
                RpcRequest::DestroySession {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                },
                self.rpc_timeout,
            )
            .await;
        // local affinity state goes regardless; the node cleans up on its own
        self.forget_session(session_id);
        result.map(|_| ())
    }

    /// Start playback; the returned stream carries playback events.
    pub async fn play(
        &self,
        session_id: &str,
        file_path: &str,
    ) -> Result<mpsc::UnboundedReceiver<ResponseFrame>> {
        let client = self.client_for_session(session_id)?;
        client
            .request_stream(RpcRequest::PlayAudio {
                session_id: session_id.to_string(),
                file_path: file_path.to_string(),
            })
            .await
    }

    /// Send one DTMF digit out of a session. Pacing happens on the node.
    pub async fn send_dtmf(&self, session_id: &str, digit: char, duration_ms: u32) -> Result<()> {
        let client = self.client_for_session(session_id)?;
        // the digit train itself takes duration_ms plus the end packets
        let deadline = self.rpc_timeout + Duration::from_millis(duration_ms as u64);
        client
            .request(
                RpcRequest::SendDtmf {
                    session_id: session_id.to_string(),
                    digit,
                    duration_ms,
                },
                deadline,
            )
            .await?;
        Ok(())
    }

    pub async fn stop_audio(&self, session_id: &str) -> Result<bool> {
        let client = self.client_for_session(session_id)?;
        match client
            .request(
                RpcRequest::StopAudio {
                    session_id: session_id.to_string(),
                },
                self.rpc_timeout,
            )
            .await?
        {
            RpcResponse::StopAudio { was_playing } => Ok(was_playing),
            _ => Ok(false),
        }
    }

    /// Bridge two sessions. They must live on the same node; the relay has
    /// no cross-node path.
    pub async fn bridge_media(&self, session_a: &str, session_b: &str) -> Result<String> {
        let node_a = self
            .node_of_session(session_a)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_a)))?;
        let node_b = self
            .node_of_session(session_b)
            .ok_or_else(|| Error::not_found(format!("Session {}", session_b)))?;
        if node_a != node_b {
            return Err(Error::invalid_state(format!(
                "Sessions on different nodes ({} vs {}); same-node bridging only",
                node_a, node_b
            )));
        }

        let member = self
            .member(&node_a)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_a)))?;
        let response = member
            .client
            .request(
                RpcRequest::BridgeMedia {
                    session_a: session_a.to_string(),
                    session_b: session_b.to_string(),
                },
                self.rpc_timeout,
            )
            .await?;

        match response {
            RpcResponse::Bridge { bridge_id } => {
                self.index
                    .write()
                    .unwrap()
                    .bridge_to_node
                    .insert(bridge_id.clone(), node_a);
                Ok(bridge_id)
            }
            other => Err(Error::transport(format!(
                "Unexpected BridgeMedia response: {:?}",
                other
            ))),
        }
    }

    /// Tear down a media bridge with a bounded wait. Idempotent.
    pub async fn unbridge_media(&self, bridge_id: &str, deadline: Duration) -> Result<()> {
        let node_id = {
            let mut index = self.index.write().unwrap();
            index.bridge_to_node.remove(bridge_id)
        };
        let Some(node_id) = node_id else {
            return Ok(());
        };
        let member = self
            .member(&node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;
        member
            .client
            .request(
                RpcRequest::UnbridgeMedia {
                    bridge_id: Some(bridge_id.to_string()),
                    session_id: None,
                },
                deadline,
            )
            .await?;
        Ok(())
    }

    // Drain state transitions

    pub fn start_drain(&self, node_id: &str) -> Result<()> {
        let member = self
            .member(node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;
        if member.drain_state() != DrainState::Active {
            return Err(Error::invalid_state(format!(
                "Node {} is not active ({:?})",
                node_id,
                member.drain_state()
            )));
        }
        member.set_drain_state(DrainState::Draining);
        info!(node_id = %node_id, "node draining");
        Ok(())
    }

    pub fn complete_drain(&self, node_id: &str) -> Result<()> {
        let member = self
            .member(node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;
        if member.drain_state() != DrainState::Draining {
            return Err(Error::invalid_state(format!(
                "Node {} is not draining ({:?})",
                node_id,
                member.drain_state()
            )));
        }
        member.set_drain_state(DrainState::Disabled);
        info!(node_id = %node_id, "node disabled");
        Ok(())
    }

    pub fn cancel_drain(&self, node_id: &str) -> Result<()> {
        let member = self
            .member(node_id)
            .ok_or_else(|| Error::not_found(format!("Pool member {}", node_id)))?;
        match member.drain_state() {
            DrainState::Draining | DrainState::Disabled => {
                member.set_drain_state(DrainState::Active);
                info!(node_id = %node_id, "node back to active");
                Ok(())
            }
            DrainState::Active => Err(Error::invalid_state(format!(
                "Node {} is not draining",
                node_id
            ))),
        }
    }

    /// Pick a migration target: healthy, connected, active, and not the
    /// node being drained.
    pub fn select_migration_target(&self, exclude_node: &str) -> Result<Arc<PoolMember>> {
        let index = self.index.read().unwrap();
        index
            .members
            .iter()
            .find(|m| m.node_id != exclude_node && m.accepts_new_sessions())
            .cloned()
            .ok_or(Error::NoAvailableMembers)
    }

    pub fn stats(&self) -> Vec<PoolMemberStats> {
        let index = self.index.read().unwrap();
        index
            .members
            .iter()
            .map(|m| PoolMemberStats {
                node_id: m.node_id.clone(),
                address: m.address,
                healthy: m.is_healthy(),
                connected: m.client.is_connected(),
                drain_state: m.drain_state(),
                sessions: index
                    .node_to_sessions
                    .get(&m.node_id)
                    .map(|s| s.len())
                    .unwrap_or(0),
            })
            .collect()
    }

    fn members_snapshot(&self) -> Vec<Arc<PoolMember>> {
        self.index.read().unwrap().members.clone()
    }

    async fn health_check_member(&self, member: &Arc<PoolMember>) {
        if !member.client.is_connected() {
            if let Err(e) = member.client.reconnect().await {
                debug!(node_id = %member.node_id, error = %e, "reconnect failed");
                self.note_failure(member);
                return;
            }
        }

        match member
            .client
            .request(RpcRequest::Health, self.rpc_timeout)
            .await
        {
            Ok(RpcResponse::Health { healthy: true, .. }) => self.note_success(member),
            Ok(_) => self.note_failure(member),
            Err(e) => {
                debug!(node_id = %member.node_id, error = %e, "health ping failed");
                self.note_failure(member);
            }
        }
    }

    fn note_failure(&self, member: &Arc<PoolMember>) {
        member.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = member.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.unhealthy_threshold && member.is_healthy() {
            member.healthy.store(false, Ordering::SeqCst);
            warn!(node_id = %member.node_id, failures, "pool member unhealthy");
        }
    }

    fn note_success(&self, member: &Arc<PoolMember>) {
        member.consecutive_failures.store(0, Ordering::SeqCst);
        let successes = member.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
        if successes >= self.healthy_threshold && !member.is_healthy() {
            member.healthy.store(true, Ordering::SeqCst);
            info!(node_id = %member.node_id, "pool member healthy again");
        }
    }
}

/// Periodic health checking for every pool member.
pub fn spawn_health_checker(pool: Arc<MediaPool>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(pool.health_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    for member in pool.members_snapshot() {
                        pool.health_check_member(&member).await;
                    }
                }
            }
        }
    });
}
