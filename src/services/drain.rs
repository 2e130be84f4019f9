//! Node drain: live migration of media sessions via re-INVITE
//!
//! Draining a node re-homes every session it carries onto another node by
//! re-INVITing the clients with fresh SDP. Migration is all-or-nothing per
//! call: any new resource acquired on the target is destroyed when a later
//! step fails. Graceful mode leaves stubborn calls where they are;
//! aggressive mode hangs them up so the node always empties.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DrainConfig;
use crate::core::transport::SipTransport;
use crate::services::dialog::{
    send_bye_for_dialog, send_reinvite, Dialog, DialogDirection, DialogRegistry, DialogState,
};
use crate::services::media_pool::MediaPool;
use crate::services::originator::Originator;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    Graceful,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOpState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DrainStatus {
    pub node_id: String,
    pub mode: DrainMode,
    pub state: DrainOpState,
    pub total_sessions: usize,
    pub migrated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DrainRequest {
    pub node_id: String,
    pub mode: DrainMode,
    pub timeout: Option<Duration>,
}

enum MigrationOutcome {
    Migrated,
    /// Outbound leg; it moves together with its A leg.
    SkippedBLeg,
}

struct DrainOperation {
    cancel: CancellationToken,
    status: Mutex<DrainStatus>,
}

impl DrainOperation {
    fn update<F: FnOnce(&mut DrainStatus)>(&self, f: F) {
        f(&mut self.status.lock().unwrap());
    }

    fn snapshot(&self) -> DrainStatus {
        self.status.lock().unwrap().clone()
    }
}

const REINVITE_TIMEOUT: Duration = Duration::from_secs(10);
const BYE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DrainCoordinator {
    pool: Arc<MediaPool>,
    registry: Arc<DialogRegistry>,
    originator: Arc<Originator>,
    transport: Arc<SipTransport>,
    config: DrainConfig,
    ops: DashMap<String, Arc<DrainOperation>>,
}

impl DrainCoordinator {
    pub fn new(
        pool: Arc<MediaPool>,
        registry: Arc<DialogRegistry>,
        originator: Arc<Originator>,
        transport: Arc<SipTransport>,
        config: DrainConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            originator,
            transport,
            config,
            ops: DashMap::new(),
        })
    }

    /// Flip the node to Draining, snapshot its sessions, spawn the drain
    /// task, and return the initial status.
    pub fn start_drain(self: &Arc<Self>, request: DrainRequest) -> Result<DrainStatus> {
        if let Some(op) = self.ops.get(&request.node_id) {
            if op.snapshot().state == DrainOpState::Running {
                return Err(Error::invalid_state(format!(
                    "Drain already active for {}",
                    request.node_id
                )));
            }
        }

        self.pool.start_drain(&request.node_id)?;
        let sessions = self.pool.sessions_on_node(&request.node_id);

        let status = DrainStatus {
            node_id: request.node_id.clone(),
            mode: request.mode,
            state: DrainOpState::Running,
            total_sessions: sessions.len(),
            migrated: 0,
            failed: 0,
            skipped: 0,
            error: None,
        };
        let op = Arc::new(DrainOperation {
            cancel: CancellationToken::new(),
            status: Mutex::new(status.clone()),
        });
        self.ops.insert(request.node_id.clone(), Arc::clone(&op));

        let deadline = request.timeout.unwrap_or(match request.mode {
            DrainMode::Graceful => Duration::from_secs(self.config.graceful_timeout),
            DrainMode::Aggressive => Duration::from_secs(self.config.aggressive_timeout),
        });

        info!(
            node_id = %request.node_id,
            mode = ?request.mode,
            sessions = sessions.len(),
            deadline = ?deadline,
            "drain started"
        );

        let coordinator = Arc::clone(self);
        let node_id = request.node_id.clone();
        let mode = request.mode;
        tokio::spawn(async move {
            coordinator
                .run_drain(node_id, op, sessions, mode, deadline)
                .await;
        });

        Ok(status)
    }

    pub fn status(&self, node_id: &str) -> Option<DrainStatus> {
        self.ops.get(node_id).map(|op| op.snapshot())
    }

    /// Abort in-flight migrations and put the node back into rotation.
    pub fn cancel_drain(&self, node_id: &str) -> Result<()> {
        let (_, op) = self
            .ops
            .remove(node_id)
            .ok_or_else(|| Error::not_found(format!("No drain for {}", node_id)))?;
        op.update(|s| s.state = DrainOpState::Cancelled);
        op.cancel.cancel();
        self.pool.cancel_drain(node_id)?;
        info!(node_id = %node_id, "drain cancelled");
        Ok(())
    }

    async fn run_drain(
        self: Arc<Self>,
        node_id: String,
        op: Arc<DrainOperation>,
        sessions: Vec<String>,
        mode: DrainMode,
        deadline: Duration,
    ) {
        // the deadline simply cancels the shared token
        {
            let cancel = op.cancel.clone();
            let op_timer = Arc::clone(&op);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if op_timer.snapshot().state == DrainOpState::Running {
                    op_timer.update(|s| {
                        s.state = DrainOpState::Failed;
                        s.error = Some("drain deadline exceeded".to_string());
                    });
                    cancel.cancel();
                }
            });
        }

        let target = match self.pool.select_migration_target(&node_id) {
            Ok(member) => member.node_id.clone(),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "no migration target; drain abandoned");
                op.update(|s| {
                    s.state = DrainOpState::Failed;
                    s.error = Some(e.to_string());
                });
                let _ = self.pool.cancel_drain(&node_id);
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_migrations));
        let mut handles = Vec::with_capacity(sessions.len());
        for session_id in sessions {
            let coordinator = Arc::clone(&self);
            let op = Arc::clone(&op);
            let semaphore = Arc::clone(&semaphore);
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if op.cancel.is_cancelled() {
                    return;
                }
                let outcome = tokio::select! {
                    _ = op.cancel.cancelled() => return,
                    outcome = coordinator.migrate_session(&session_id, &target, mode) => outcome,
                };
                match outcome {
                    Ok(MigrationOutcome::Migrated) => op.update(|s| s.migrated += 1),
                    Ok(MigrationOutcome::SkippedBLeg) => op.update(|s| s.skipped += 1),
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "migration failed");
                        op.update(|s| {
                            s.failed += 1;
                            s.error = Some(e.to_string());
                        });
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if op.snapshot().state != DrainOpState::Running {
            return; // cancelled or timed out meanwhile
        }

        let remaining = self.pool.sessions_on_node(&node_id);
        if remaining.is_empty() {
            if let Err(e) = self.pool.complete_drain(&node_id) {
                warn!(node_id = %node_id, error = %e, "complete_drain refused");
            }
            op.update(|s| s.state = DrainOpState::Completed);
            info!(node_id = %node_id, status = ?op.snapshot(), "drain complete");
        } else {
            op.update(|s| {
                s.state = DrainOpState::Failed;
                if s.error.is_none() {
                    s.error = Some(format!("{} sessions remain", remaining.len()));
                }
            });
            info!(node_id = %node_id, remaining = remaining.len(), "drain left node draining");
        }
    }

    /// Migrate one session, resolving whether it drags a bridged peer
    /// along.
    async fn migrate_session(
        &self,
        session_id: &str,
        target_node: &str,
        mode: DrainMode,
    ) -> Result<MigrationOutcome> {
        let dialog = self
            .registry
            .find_by_session(session_id)
            .ok_or_else(|| Error::not_found(format!("No dialog for session {}", session_id)))?;

        // B legs ride along with their A leg's migration
        if dialog.direction == DialogDirection::Outbound {
            return Ok(MigrationOutcome::SkippedBLeg);
        }
        if dialog.state() != DialogState::Confirmed {
            return Err(Error::invalid_state(format!(
                "Dialog {} not confirmed ({:?})",
                dialog.call_id,
                dialog.state()
            )));
        }

        match self.originator.peer_b_call_id(&dialog.call_id) {
            None => {
                self.migrate_single(&dialog, target_node, mode).await?;
                Ok(MigrationOutcome::Migrated)
            }
            Some(b_call_id) => match self.registry.find(&b_call_id) {
                Some(b_dialog) => {
                    self.migrate_bridged(&dialog, &b_dialog, target_node, mode)
                        .await?;
                    Ok(MigrationOutcome::Migrated)
                }
                None => {
                    warn!(
                        call_id = %dialog.call_id,
                        b_call_id = %b_call_id,
                        "bridge link without B dialog; migrating single"
                    );
                    self.migrate_single(&dialog, target_node, mode).await?;
                    Ok(MigrationOutcome::Migrated)
                }
            },
        }
    }

    /// Move one un-bridged call: new session on the target, re-INVITE, then
    /// swap. The new session is destroyed on every failure path.
    async fn migrate_single(
        &self,
        dialog: &Arc<Dialog>,
        target_node: &str,
        mode: DrainMode,
    ) -> Result<()> {
        let old_session = dialog
            .session_id()
            .ok_or_else(|| Error::invalid_state("Dialog has no media session"))?;
        let new_session = self.create_target_session(dialog, target_node).await?;

        match send_reinvite(
            &self.transport,
            dialog,
            new_session.sdp.clone(),
            REINVITE_TIMEOUT,
        )
        .await
        {
            Ok(code) if (200..300).contains(&code) => {}
            outcome => {
                self.rollback_session(&new_session.session_id).await;
                let error = match outcome {
                    Ok(code) => Error::Rejected {
                        code,
                        reason: "re-INVITE refused".to_string(),
                    },
                    Err(e) => e,
                };
                if mode == DrainMode::Aggressive {
                    self.terminate_call(dialog, &old_session).await;
                }
                return Err(error);
            }
        }

        if let Err(e) = self.pool.destroy_session(&old_session, "migrated").await {
            warn!(session_id = %old_session, error = %e, "old session destroy failed");
        }
        self.registry
            .bind_session(&dialog.call_id, new_session.session_id.clone())?;
        info!(
            call_id = %dialog.call_id,
            from = %old_session,
            to = %new_session.session_id,
            node = %target_node,
            "session migrated"
        );
        Ok(())
    }

    /// Move a bridged pair atomically: two sessions, two parallel
    /// re-INVITEs, re-bridge on the target. Rollback destroys everything
    /// acquired so far.
    async fn migrate_bridged(
        &self,
        dialog_a: &Arc<Dialog>,
        dialog_b: &Arc<Dialog>,
        target_node: &str,
        mode: DrainMode,
    ) -> Result<()> {
        let old_a = dialog_a
            .session_id()
            .ok_or_else(|| Error::invalid_state("A dialog has no media session"))?;
        let old_b = dialog_b
            .session_id()
            .ok_or_else(|| Error::invalid_state("B dialog has no media session"))?;

        let new_a = self.create_target_session(dialog_a, target_node).await?;
        let new_b = match self.create_target_session(dialog_b, target_node).await {
            Ok(session) => session,
            Err(e) => {
                self.rollback_session(&new_a.session_id).await;
                return Err(e);
            }
        };

        let (result_a, result_b) = tokio::join!(
            send_reinvite(
                &self.transport,
                dialog_a,
                new_a.sdp.clone(),
                REINVITE_TIMEOUT
            ),
            send_reinvite(
                &self.transport,
                dialog_b,
                new_b.sdp.clone(),
                REINVITE_TIMEOUT
            ),
        );

        let ok_a = matches!(&result_a, Ok(code) if (200..300).contains(code));
        let ok_b = matches!(&result_b, Ok(code) if (200..300).contains(code));
        if !ok_a || !ok_b {
            self.rollback_session(&new_a.session_id).await;
            self.rollback_session(&new_b.session_id).await;
            if mode == DrainMode::Aggressive {
                self.terminate_call(dialog_a, &old_a).await;
                self.terminate_call(dialog_b, &old_b).await;
            }
            return Err(Error::media(format!(
                "bridged re-INVITE failed (a: {:?}, b: {:?})",
                result_a.map_err(|e| e.to_string()),
                result_b.map_err(|e| e.to_string())
            )));
        }

        for old in [&old_a, &old_b] {
            if let Err(e) = self.pool.destroy_session(old, "migrated").await {
                warn!(session_id = %old, error = %e, "old session destroy failed");
            }
        }
        self.registry
            .bind_session(&dialog_a.call_id, new_a.session_id.clone())?;
        self.registry
            .bind_session(&dialog_b.call_id, new_b.session_id.clone())?;

        if let Err(e) = self
            .pool
            .bridge_media(&new_a.session_id, &new_b.session_id)
            .await
        {
            // both re-INVITEs landed but the relay did not come back
            if mode == DrainMode::Aggressive {
                self.terminate_call(dialog_a, &new_a.session_id).await;
                self.terminate_call(dialog_b, &new_b.session_id).await;
            }
            return Err(Error::media(format!(
                "calls migrated but re-bridge failed: {}",
                e
            )));
        }

        info!(
            a = %dialog_a.call_id,
            b = %dialog_b.call_id,
            node = %target_node,
            "bridged pair migrated"
        );
        Ok(())
    }

    async fn create_target_session(
        &self,
        dialog: &Arc<Dialog>,
        target_node: &str,
    ) -> Result<crate::services::media_pool::PoolSession> {
        let (addr, port, codec) = dialog.remote_media();
        let addr = addr.ok_or_else(|| Error::invalid_state("Dialog has no remote media"))?;
        let port = port.ok_or_else(|| Error::invalid_state("Dialog has no remote media port"))?;
        self.pool
            .create_session_on_node(target_node, &dialog.call_id, Some((addr, port)), &[codec])
            .await
    }

    async fn rollback_session(&self, session_id: &str) {
        if let Err(e) = self.pool.destroy_session(session_id, "migration_rollback").await {
            warn!(session_id = %session_id, error = %e, "rollback destroy failed");
        }
    }

    /// Aggressive-mode cleanup: BYE the call and drop its session so the
    /// draining node actually empties.
    async fn terminate_call(&self, dialog: &Arc<Dialog>, session_id: &str) {
        send_bye_for_dialog(
            &self.transport,
            &self.registry,
            &dialog.call_id,
            "drain_terminated",
            BYE_TIMEOUT,
        )
        .await;
        if let Err(e) = self.pool.destroy_session(session_id, "drain_terminated").await {
            warn!(session_id = %session_id, error = %e, "session destroy failed");
        }
    }
}
