//! B2BUA call legs
//!
//! A leg wraps one dialog with the switchboard-side lifecycle: Created,
//! Ringing, optional EarlyMedia, Answered, and the terminal Failed or
//! Destroyed. Waiters observe transitions through a state broadcast rather
//! than polling; termination delivery is exactly-once and callbacks always
//! run with no leg locks held.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::dialog::DialogDirection;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Created,
    Ringing,
    EarlyMedia,
    Answered,
    Failed,
    Destroyed,
}

impl LegState {
    fn rank(self) -> u8 {
        match self {
            LegState::Created => 0,
            LegState::Ringing => 1,
            LegState::EarlyMedia => 2,
            LegState::Answered => 3,
            LegState::Failed => 4,
            LegState::Destroyed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LegState::Failed | LegState::Destroyed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Normal,
    RemoteBye,
    BridgePeer,
    Cancel,
    Timeout,
    Rejected,
    Error,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationCause::Normal => "normal",
            TerminationCause::RemoteBye => "remote_bye",
            TerminationCause::BridgePeer => "bridge_peer",
            TerminationCause::Cancel => "cancel",
            TerminationCause::Timeout => "timeout",
            TerminationCause::Rejected => "rejected",
            TerminationCause::Error => "error",
        };
        f.write_str(s)
    }
}

/// Dialog identification a leg keeps for building its own BYE readback.
/// The registry copy is authoritative; this one exists for observability.
#[derive(Debug, Clone, Default)]
pub struct OutboundDialogState {
    pub remote_contact_uri: String,
    pub remote_to_uri: String,
    pub local_from_uri: String,
    pub remote_tag: String,
    pub local_tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct LegMedia {
    pub session_id: Option<String>,
    pub local_addr: Option<String>,
    pub local_port: Option<u16>,
    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub codec: u8,
}

#[derive(Debug)]
struct LegInner {
    state: LegState,
    termination_cause: Option<TerminationCause>,
    media: LegMedia,
    outbound_dialog: Option<OutboundDialogState>,
    sip_code: Option<u16>,
    sip_reason: Option<String>,
    created_at: Instant,
    ringing_at: Option<Instant>,
    answered_at: Option<Instant>,
    terminated_at: Option<Instant>,
}

type TeardownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TeardownHandler = Box<dyn FnOnce(TerminationCause) -> TeardownFuture + Send>;
type TerminatedCallback = Arc<dyn Fn(TerminationCause) + Send + Sync>;
type StateCallback = Arc<dyn Fn(LegState) + Send + Sync>;

#[derive(Default)]
struct LegCallbacks {
    terminated: HashMap<u64, TerminatedCallback>,
    state: HashMap<u64, StateCallback>,
    terminated_fired: bool,
}

pub struct Leg {
    pub leg_id: String,
    pub call_id: String,
    pub direction: DialogDirection,
    pub local_uri: String,
    pub remote_uri: String,
    inner: Mutex<LegInner>,
    /// Callback registry, separate from the primary lock so handlers can
    /// call back into the leg.
    callbacks: Mutex<LegCallbacks>,
    teardown: Mutex<Option<TeardownHandler>>,
    next_callback_id: AtomicU64,
    state_tx: watch::Sender<LegState>,
    done: CancellationToken,
}

impl Leg {
    pub fn new(
        call_id: String,
        direction: DialogDirection,
        local_uri: String,
        remote_uri: String,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(LegState::Created);
        Arc::new(Self {
            leg_id: Uuid::new_v4().to_string(),
            call_id,
            direction,
            local_uri,
            remote_uri,
            inner: Mutex::new(LegInner {
                state: LegState::Created,
                termination_cause: None,
                media: LegMedia::default(),
                outbound_dialog: None,
                sip_code: None,
                sip_reason: None,
                created_at: Instant::now(),
                ringing_at: None,
                answered_at: None,
                terminated_at: None,
            }),
            callbacks: Mutex::new(LegCallbacks::default()),
            teardown: Mutex::new(None),
            next_callback_id: AtomicU64::new(1),
            state_tx,
            done: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> LegState {
        self.inner.lock().unwrap().state
    }

    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.inner.lock().unwrap().termination_cause
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn media(&self) -> LegMedia {
        self.inner.lock().unwrap().media.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().media.session_id.clone()
    }

    pub fn set_session(&self, session_id: String, local_addr: String, local_port: u16, codec: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.media.session_id = Some(session_id);
        inner.media.local_addr = Some(local_addr);
        inner.media.local_port = Some(local_port);
        inner.media.codec = codec;
    }

    pub fn set_remote_media(&self, addr: String, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.media.remote_addr = Some(addr);
        inner.media.remote_port = Some(port);
    }

    pub fn set_outbound_dialog(&self, state: OutboundDialogState) {
        self.inner.lock().unwrap().outbound_dialog = Some(state);
    }

    pub fn outbound_dialog(&self) -> Option<OutboundDialogState> {
        self.inner.lock().unwrap().outbound_dialog.clone()
    }

    pub fn set_sip_final(&self, code: u16, reason: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.sip_code = Some(code);
        inner.sip_reason = Some(reason);
    }

    pub fn sip_final(&self) -> Option<(u16, String)> {
        let inner = self.inner.lock().unwrap();
        match (&inner.sip_code, &inner.sip_reason) {
            (Some(code), Some(reason)) => Some((*code, reason.clone())),
            _ => None,
        }
    }

    pub fn answered_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().answered_at
    }

    /// Install the handler run exactly once from `hangup`. Callers use this
    /// to send BYE or CANCEL; by the time it runs the leg is already
    /// terminal, so re-entering `hangup` from it is a no-op.
    pub fn set_teardown_handler(&self, handler: TeardownHandler) {
        *self.teardown.lock().unwrap() = Some(handler);
    }

    pub fn on_terminated(&self, callback: TerminatedCallback) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().terminated.insert(id, callback);
        id
    }

    pub fn remove_terminated(&self, id: u64) {
        self.callbacks.lock().unwrap().terminated.remove(&id);
    }

    pub fn on_state_change(&self, callback: StateCallback) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().state.insert(id, callback);
        id
    }

    pub fn remove_state_change(&self, id: u64) {
        self.callbacks.lock().unwrap().state.remove(&id);
    }

    /// Advance to a non-terminal state. Transitions never move backwards
    /// and terminal states are unreachable from here; use `hangup`/`fail`.
    pub fn set_state(&self, next: LegState) -> Result<()> {
        if next.is_terminal() {
            return Err(Error::invalid_state(
                "Terminal transitions go through hangup/fail",
            ));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return Err(Error::invalid_state(format!(
                    "Leg {} is already terminal",
                    self.leg_id
                )));
            }
            if next.rank() <= inner.state.rank() && inner.state != LegState::Created {
                return Err(Error::invalid_state(format!(
                    "Leg {} cannot go {:?} -> {:?}",
                    self.leg_id, inner.state, next
                )));
            }
            inner.state = next;
            match next {
                LegState::Ringing => inner.ringing_at = Some(Instant::now()),
                LegState::Answered => inner.answered_at = Some(Instant::now()),
                _ => {}
            }
        }
        debug!(leg_id = %self.leg_id, state = ?next, "leg state change");
        self.broadcast(next);
        Ok(())
    }

    /// Suspend until the leg reaches `target` (or further). Errors when a
    /// terminal state arrives first.
    pub async fn wait_for_state(&self, target: LegState) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            // authoritative read under the leg lock, not the channel value
            let current = self.state();
            if current.is_terminal() {
                return Err(Error::invalid_state(format!(
                    "Leg {} terminated before reaching {:?}",
                    self.leg_id, target
                )));
            }
            if current.rank() >= target.rank() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(Error::internal("Leg state channel closed"));
            }
        }
    }

    /// Terminate an answered (or any live) leg. Single-flight: the first
    /// caller flips the state and runs teardown, everyone else returns
    /// immediately.
    pub async fn hangup(&self, cause: TerminationCause) -> Result<()> {
        let handler = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return Ok(());
            }
            inner.state = LegState::Destroyed;
            inner.termination_cause = Some(cause);
            inner.terminated_at = Some(Instant::now());
            self.teardown.lock().unwrap().take()
        };

        info!(leg_id = %self.leg_id, call_id = %self.call_id, cause = %cause, "leg hung up");

        // waiters observe the terminal state immediately; callbacks fire
        // only after teardown has run
        let _ = self.state_tx.send(LegState::Destroyed);

        if let Some(handler) = handler {
            handler(cause).await;
        }

        self.done.cancel();
        self.fire_state_callbacks(LegState::Destroyed);
        self.fire_terminated(cause);
        Ok(())
    }

    /// Terminal failure before answer: rejection, cancel or timeout. The
    /// teardown handler is not run; the originator handles CANCEL itself.
    pub fn fail(&self, cause: TerminationCause) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return Ok(());
            }
            inner.state = LegState::Failed;
            inner.termination_cause = Some(cause);
            inner.terminated_at = Some(Instant::now());
        }

        info!(leg_id = %self.leg_id, call_id = %self.call_id, cause = %cause, "leg failed");

        let _ = self.state_tx.send(LegState::Failed);
        self.done.cancel();
        self.fire_state_callbacks(LegState::Failed);
        self.fire_terminated(cause);
        Ok(())
    }

    fn broadcast(&self, state: LegState) {
        let _ = self.state_tx.send(state);
        self.fire_state_callbacks(state);
    }

    fn fire_state_callbacks(&self, state: LegState) {
        let snapshot: Vec<StateCallback> = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks.state.values().cloned().collect()
        };
        for callback in snapshot {
            callback(state);
        }
    }

    /// Deliver terminated callbacks exactly once, lock-free at call time.
    fn fire_terminated(&self, cause: TerminationCause) {
        let snapshot: Vec<TerminatedCallback> = {
            let mut callbacks = self.callbacks.lock().unwrap();
            if callbacks.terminated_fired {
                return;
            }
            callbacks.terminated_fired = true;
            callbacks.terminated.values().cloned().collect()
        };
        for callback in snapshot {
            callback(cause);
        }
    }
}

impl fmt::Debug for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leg")
            .field("leg_id", &self.leg_id)
            .field("call_id", &self.call_id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn leg() -> Arc<Leg> {
        Leg::new(
            "call-1".to_string(),
            DialogDirection::Inbound,
            "sip:switchboard@10.0.0.1".to_string(),
            "sip:bob@192.0.2.5".to_string(),
        )
    }

    #[test]
    fn test_forward_only_transitions() {
        let leg = leg();
        leg.set_state(LegState::Ringing).unwrap();
        leg.set_state(LegState::Answered).unwrap();
        assert!(leg.set_state(LegState::Ringing).is_err());
        assert!(leg.set_state(LegState::Destroyed).is_err());
    }

    #[tokio::test]
    async fn test_wait_for_state_wakes_on_answer() {
        let leg = leg();
        let waiter = Arc::clone(&leg);
        let handle = tokio::spawn(async move { waiter.wait_for_state(LegState::Answered).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        leg.set_state(LegState::Ringing).unwrap();
        leg.set_state(LegState::Answered).unwrap();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_state_errors_on_terminal() {
        let leg = leg();
        let waiter = Arc::clone(&leg);
        let handle = tokio::spawn(async move { waiter.wait_for_state(LegState::Answered).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        leg.fail(TerminationCause::Rejected).unwrap();

        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_wait_already_satisfied() {
        let leg = leg();
        leg.set_state(LegState::Ringing).unwrap();
        leg.wait_for_state(LegState::Ringing).await.unwrap();
        leg.set_state(LegState::Answered).unwrap();
        // EarlyMedia rank is below Answered: already satisfied
        leg.wait_for_state(LegState::EarlyMedia).await.unwrap();
    }

    #[tokio::test]
    async fn test_hangup_single_flight_and_teardown() {
        let leg = leg();
        leg.set_state(LegState::Ringing).unwrap();
        leg.set_state(LegState::Answered).unwrap();

        let teardown_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&teardown_count);
        leg.set_teardown_handler(Box::new(move |_cause| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));

        leg.hangup(TerminationCause::Normal).await.unwrap();
        leg.hangup(TerminationCause::Error).await.unwrap();

        assert_eq!(teardown_count.load(Ordering::SeqCst), 1);
        assert_eq!(leg.state(), LegState::Destroyed);
        // first cause wins
        assert_eq!(leg.termination_cause(), Some(TerminationCause::Normal));
        assert!(leg.done().is_cancelled());
    }

    #[tokio::test]
    async fn test_terminated_callbacks_exactly_once() {
        let leg = leg();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        leg.on_terminated(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        leg.hangup(TerminationCause::Normal).await.unwrap();
        leg.hangup(TerminationCause::Normal).await.unwrap();
        leg.fail(TerminationCause::Error).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_unregistration() {
        let leg = leg();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let id = leg.on_terminated(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        leg.remove_terminated(id);

        leg.hangup(TerminationCause::Normal).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callback_may_reenter_leg() {
        let leg = leg();
        let observed = Arc::new(Mutex::new(None));
        let leg_ref = Arc::clone(&leg);
        let slot = Arc::clone(&observed);
        leg.on_terminated(Arc::new(move |cause| {
            // reading leg state from inside the callback must not deadlock
            *slot.lock().unwrap() = Some((leg_ref.state(), cause));
        }));

        leg.hangup(TerminationCause::RemoteBye).await.unwrap();
        let (state, cause) = observed.lock().unwrap().take().unwrap();
        assert_eq!(state, LegState::Destroyed);
        assert_eq!(cause, TerminationCause::RemoteBye);
    }
}
