//! Two-leg joint lifecycle
//!
//! A bridge joins two answered legs and owns the media-plane relay between
//! their sessions. Construction only wires the termination callbacks, so a
//! leg dying between construction and start is still observed; `start`
//! requires both legs answered and brings up the media bridge.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::leg::{Leg, LegState, TerminationCause};
use crate::services::media_pool::MediaPool;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Created,
    Active,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatedBy {
    LegA,
    LegB,
    Local,
}

impl fmt::Display for TerminatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminatedBy::LegA => "leg_a",
            TerminatedBy::LegB => "leg_b",
            TerminatedBy::Local => "local",
        })
    }
}

#[derive(Debug)]
struct BridgeInner {
    state: BridgeState,
    termination_cause: Option<TerminationCause>,
    terminated_by: Option<TerminatedBy>,
    media_bridge_id: Option<String>,
    started_at: Option<Instant>,
    terminated_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub bridge_id: String,
    pub state: BridgeState,
    pub termination_cause: Option<TerminationCause>,
    pub terminated_by: Option<TerminatedBy>,
    pub media_bridge_id: Option<String>,
}

const UNBRIDGE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Bridge {
    pub bridge_id: String,
    pub leg_a: Arc<Leg>,
    pub leg_b: Arc<Leg>,
    media: Option<Arc<MediaPool>>,
    auto_hangup: bool,
    inner: Mutex<BridgeInner>,
    teardown_claimed: AtomicBool,
    terminated_tx: watch::Sender<bool>,
    done: CancellationToken,
}

impl Bridge {
    /// Wire a bridge over two legs. Termination callbacks are installed
    /// here, not in `start`.
    pub fn new(
        leg_a: Arc<Leg>,
        leg_b: Arc<Leg>,
        media: Option<Arc<MediaPool>>,
        auto_hangup: bool,
    ) -> Arc<Self> {
        let (terminated_tx, _) = watch::channel(false);
        let bridge = Arc::new(Self {
            bridge_id: Uuid::new_v4().to_string(),
            leg_a: Arc::clone(&leg_a),
            leg_b: Arc::clone(&leg_b),
            media,
            auto_hangup,
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Created,
                termination_cause: None,
                terminated_by: None,
                media_bridge_id: None,
                started_at: None,
                terminated_at: None,
            }),
            teardown_claimed: AtomicBool::new(false),
            terminated_tx,
            done: CancellationToken::new(),
        });

        for (leg, name) in [(&leg_a, TerminatedBy::LegA), (&leg_b, TerminatedBy::LegB)] {
            let weak = Arc::downgrade(&bridge);
            leg.on_terminated(Arc::new(move |cause| {
                if let Some(bridge) = weak.upgrade() {
                    tokio::spawn(async move {
                        bridge.handle_leg_terminated(name, cause).await;
                    });
                }
            }));
        }

        bridge
    }

    pub fn state(&self) -> BridgeState {
        self.inner.lock().unwrap().state
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn info(&self) -> BridgeInfo {
        let inner = self.inner.lock().unwrap();
        BridgeInfo {
            bridge_id: self.bridge_id.clone(),
            state: inner.state,
            termination_cause: inner.termination_cause,
            terminated_by: inner.terminated_by,
            media_bridge_id: inner.media_bridge_id.clone(),
        }
    }

    /// Bring the bridge up: both legs must be answered. A configured media
    /// plane is bridged; having none is only a warning.
    pub async fn start(&self) -> Result<()> {
        if self.leg_a.state() != LegState::Answered {
            return Err(Error::invalid_state("A leg is not answered"));
        }
        if self.leg_b.state() != LegState::Answered {
            return Err(Error::invalid_state("B leg is not answered"));
        }

        match (&self.media, self.leg_a.session_id(), self.leg_b.session_id()) {
            (Some(media), Some(session_a), Some(session_b)) => {
                let media_bridge_id = media.bridge_media(&session_a, &session_b).await?;
                self.inner.lock().unwrap().media_bridge_id = Some(media_bridge_id);
            }
            _ => {
                warn!(bridge_id = %self.bridge_id, "no media transport; signaling-only bridge");
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = BridgeState::Active;
            inner.started_at = Some(Instant::now());
        }
        info!(
            bridge_id = %self.bridge_id,
            leg_a = %self.leg_a.leg_id,
            leg_b = %self.leg_b.leg_id,
            "bridge active"
        );
        Ok(())
    }

    /// Tear the bridge down. Idempotent; only the first caller runs the
    /// teardown body.
    pub async fn stop(&self, hangup_legs: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == BridgeState::Terminated {
                return Ok(());
            }
            inner.state = BridgeState::Terminating;
        }
        if self
            .teardown_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let media_bridge_id = self.inner.lock().unwrap().media_bridge_id.clone();
        if let (Some(media), Some(media_bridge_id)) = (&self.media, media_bridge_id) {
            if let Err(e) = media.unbridge_media(&media_bridge_id, UNBRIDGE_TIMEOUT).await {
                warn!(bridge_id = %self.bridge_id, error = %e, "unbridge failed; continuing teardown");
            }
        }

        if hangup_legs {
            for leg in [&self.leg_a, &self.leg_b] {
                if leg.state() == LegState::Answered {
                    if let Err(e) = leg.hangup(TerminationCause::BridgePeer).await {
                        warn!(leg_id = %leg.leg_id, error = %e, "leg hangup failed");
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = BridgeState::Terminated;
            inner.terminated_at = Some(Instant::now());
            if inner.terminated_by.is_none() {
                inner.terminated_by = Some(TerminatedBy::Local);
            }
            if inner.termination_cause.is_none() {
                inner.termination_cause = Some(TerminationCause::Normal);
            }
        }

        self.done.cancel();
        let _ = self.terminated_tx.send(true);
        info!(bridge_id = %self.bridge_id, "bridge terminated");
        Ok(())
    }

    /// A leg's terminated callback lands here. The atomic Created/Active to
    /// Terminating flip picks exactly one winner when both legs die at
    /// once.
    async fn handle_leg_terminated(&self, by: TerminatedBy, cause: TerminationCause) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(
                inner.state,
                BridgeState::Terminating | BridgeState::Terminated
            ) {
                return;
            }
            inner.state = BridgeState::Terminating;
            inner.terminated_by = Some(by);
            inner.termination_cause = Some(TerminationCause::BridgePeer);
        }
        debug!(bridge_id = %self.bridge_id, by = %by, cause = %cause, "leg terminated; stopping bridge");
        let _ = self.stop(self.auto_hangup).await;
    }

    /// Wait for the bridge to finish, or for the caller's context to go
    /// away.
    pub async fn wait_for_termination(&self, ctx: CancellationToken) -> Result<TerminationCause> {
        let mut rx = self.terminated_tx.subscribe();
        loop {
            if *rx.borrow() {
                let inner = self.inner.lock().unwrap();
                return Ok(inner
                    .termination_cause
                    .unwrap_or(TerminationCause::Normal));
            }
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(Error::timeout("Context cancelled while bridge active"));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::internal("Bridge termination channel closed"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dialog::DialogDirection;

    fn answered_leg(call_id: &str) -> Arc<Leg> {
        let leg = Leg::new(
            call_id.to_string(),
            DialogDirection::Inbound,
            "sip:sb@10.0.0.1".to_string(),
            "sip:peer@192.0.2.5".to_string(),
        );
        leg.set_state(LegState::Ringing).unwrap();
        leg.set_state(LegState::Answered).unwrap();
        leg
    }

    #[tokio::test]
    async fn test_start_requires_answered_legs() {
        let leg_a = answered_leg("ca");
        let leg_b = Leg::new(
            "cb".to_string(),
            DialogDirection::Outbound,
            "sip:sb@10.0.0.1".to_string(),
            "sip:bob@192.0.2.7".to_string(),
        );
        let bridge = Bridge::new(leg_a, leg_b, None, true);
        assert!(bridge.start().await.is_err());
        assert_eq!(bridge.state(), BridgeState::Created);
    }

    #[tokio::test]
    async fn test_leg_termination_cascades() {
        let leg_a = answered_leg("ca");
        let leg_b = answered_leg("cb");
        let bridge = Bridge::new(Arc::clone(&leg_a), Arc::clone(&leg_b), None, true);
        bridge.start().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Active);

        // B side hangs up; auto-hangup takes A down with BridgePeer
        leg_b.hangup(TerminationCause::RemoteBye).await.unwrap();
        let cause = bridge
            .wait_for_termination(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cause, TerminationCause::BridgePeer);

        let info = bridge.info();
        assert_eq!(info.terminated_by, Some(TerminatedBy::LegB));
        assert_eq!(leg_a.state(), LegState::Destroyed);
        assert_eq!(leg_a.termination_cause(), Some(TerminationCause::BridgePeer));
    }

    #[tokio::test]
    async fn test_simultaneous_termination_single_winner() {
        let leg_a = answered_leg("ca");
        let leg_b = answered_leg("cb");
        let bridge = Bridge::new(Arc::clone(&leg_a), Arc::clone(&leg_b), None, true);
        bridge.start().await.unwrap();

        let (ra, rb) = tokio::join!(
            leg_a.hangup(TerminationCause::RemoteBye),
            leg_b.hangup(TerminationCause::RemoteBye),
        );
        ra.unwrap();
        rb.unwrap();

        bridge
            .wait_for_termination(CancellationToken::new())
            .await
            .unwrap();

        let info = bridge.info();
        // exactly one attribution, never both
        assert!(matches!(
            info.terminated_by,
            Some(TerminatedBy::LegA) | Some(TerminatedBy::LegB)
        ));
        assert_eq!(info.state, BridgeState::Terminated);
    }

    #[tokio::test]
    async fn test_local_stop_attribution() {
        let leg_a = answered_leg("ca");
        let leg_b = answered_leg("cb");
        let bridge = Bridge::new(Arc::clone(&leg_a), Arc::clone(&leg_b), None, true);
        bridge.start().await.unwrap();

        bridge.stop(true).await.unwrap();
        let info = bridge.info();
        assert_eq!(info.terminated_by, Some(TerminatedBy::Local));
        assert_eq!(info.termination_cause, Some(TerminationCause::Normal));
        assert_eq!(leg_a.state(), LegState::Destroyed);
        assert_eq!(leg_b.state(), LegState::Destroyed);

        // idempotent
        bridge.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_termination_before_start_is_observed() {
        let leg_a = answered_leg("ca");
        let leg_b = answered_leg("cb");
        let bridge = Bridge::new(Arc::clone(&leg_a), Arc::clone(&leg_b), None, true);

        // leg dies between construction and start
        leg_a.hangup(TerminationCause::RemoteBye).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bridge.state(), BridgeState::Terminated);
        assert_eq!(bridge.info().terminated_by, Some(TerminatedBy::LegA));
    }

    #[tokio::test]
    async fn test_wait_honours_context() {
        let leg_a = answered_leg("ca");
        let leg_b = answered_leg("cb");
        let bridge = Bridge::new(leg_a, leg_b, None, false);
        bridge.start().await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(bridge.wait_for_termination(ctx).await.is_err());
    }
}
