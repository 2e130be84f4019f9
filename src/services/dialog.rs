//! SIP dialog state machine and registry
//!
//! A dialog is the (Call-ID, local tag, remote tag) relationship plus the
//! state needed to build mid-dialog requests: the original INVITE, the
//! final response, the remote Contact, and a monotonic local CSeq. State
//! moves only along the authorised edges; everything else is rejected
//! without side effects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocols::sip::{SipMethod, SipRequest, SipResponse};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Initial,
    Early,
    WaitingAck,
    Confirmed,
    Terminating,
    Terminated,
}

impl DialogState {
    fn can_transition_to(self, next: DialogState) -> bool {
        use DialogState::*;
        matches!(
            (self, next),
            (Initial, Early)
                | (Initial, Terminated)
                | (Early, WaitingAck)
                | (Early, Terminated)
                | (WaitingAck, Confirmed)
                | (WaitingAck, Terminated)
                | (Confirmed, Terminating)
                | (Confirmed, Terminated)
                | (Terminating, Terminated)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogDirection {
    Inbound,
    Outbound,
}

#[derive(Debug)]
struct DialogInner {
    state: DialogState,
    remote_tag: Option<String>,
    created_at: Instant,
    state_changed_at: Instant,
    invite: SipRequest,
    final_response: Option<SipResponse>,
    remote_contact_uri: Option<String>,
    remote_target: Option<SocketAddr>,
    session_id: Option<String>,
    remote_media_addr: Option<String>,
    remote_media_port: Option<u16>,
    codec: u8,
    terminate_reason: Option<String>,
}

pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub direction: DialogDirection,
    /// Contact URI we advertise inside this dialog.
    pub local_contact_uri: String,
    local_cseq: AtomicU32,
    reinvite_in_progress: AtomicBool,
    done: CancellationToken,
    inner: Mutex<DialogInner>,
}

impl Dialog {
    /// UAS-side dialog for a received INVITE. Starts in Initial; the local
    /// CSeq counter picks up from the peer's INVITE CSeq.
    pub fn new_inbound(
        invite: SipRequest,
        local_tag: String,
        local_contact_uri: String,
        remote_target: SocketAddr,
    ) -> Result<Self> {
        let call_id = invite.call_id()?.to_string();
        let cseq = invite.cseq()?.seq;
        let remote_tag = invite.from()?.tag().map(|t| t.to_string());
        let remote_contact_uri = invite.contact().ok().map(|c| c.uri.to_string());
        let now = Instant::now();

        Ok(Self {
            call_id,
            local_tag,
            direction: DialogDirection::Inbound,
            local_contact_uri,
            local_cseq: AtomicU32::new(cseq),
            reinvite_in_progress: AtomicBool::new(false),
            done: CancellationToken::new(),
            inner: Mutex::new(DialogInner {
                state: DialogState::Initial,
                remote_tag,
                created_at: now,
                state_changed_at: now,
                invite,
                final_response: None,
                remote_contact_uri,
                remote_target: Some(remote_target),
                session_id: None,
                remote_media_addr: None,
                remote_media_port: None,
                codec: 0,
                terminate_reason: None,
            }),
        })
    }

    /// UAC-side dialog, registered once the 2xx arrived and was ACKed, so it
    /// enters directly in Confirmed.
    pub fn new_outbound(
        invite: SipRequest,
        response: SipResponse,
        local_tag: String,
        remote_target: SocketAddr,
    ) -> Result<Self> {
        let call_id = invite.call_id()?.to_string();
        let cseq = invite.cseq()?.seq;
        let local_contact_uri = invite
            .contact()
            .map(|c| c.uri.to_string())
            .unwrap_or_default();
        let remote_tag = response.to()?.tag().map(|t| t.to_string());
        let remote_contact_uri = response.contact().ok().map(|c| c.uri.to_string());
        let now = Instant::now();

        Ok(Self {
            call_id,
            local_tag,
            direction: DialogDirection::Outbound,
            local_contact_uri,
            local_cseq: AtomicU32::new(cseq),
            reinvite_in_progress: AtomicBool::new(false),
            done: CancellationToken::new(),
            inner: Mutex::new(DialogInner {
                state: DialogState::Confirmed,
                remote_tag,
                created_at: now,
                state_changed_at: now,
                invite,
                final_response: Some(response),
                remote_contact_uri,
                remote_target: Some(remote_target),
                session_id: None,
                remote_media_addr: None,
                remote_media_port: None,
                codec: 0,
                terminate_reason: None,
            }),
        })
    }

    pub fn state(&self) -> DialogState {
        self.inner.lock().unwrap().state
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == DialogState::Terminated
    }

    pub fn terminate_reason(&self) -> Option<String> {
        self.inner.lock().unwrap().terminate_reason.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().session_id.clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        self.inner.lock().unwrap().session_id = session_id;
    }

    pub fn remote_media(&self) -> (Option<String>, Option<u16>, u8) {
        let inner = self.inner.lock().unwrap();
        (
            inner.remote_media_addr.clone(),
            inner.remote_media_port,
            inner.codec,
        )
    }

    pub fn set_remote_media(&self, addr: String, port: u16, codec: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.remote_media_addr = Some(addr);
        inner.remote_media_port = Some(port);
        inner.codec = codec;
    }

    pub fn remote_target(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().remote_target
    }

    pub fn set_remote_target(&self, target: SocketAddr) {
        self.inner.lock().unwrap().remote_target = Some(target);
    }

    pub fn remote_tag(&self) -> Option<String> {
        self.inner.lock().unwrap().remote_tag.clone()
    }

    pub fn set_remote_tag(&self, tag: String) {
        self.inner.lock().unwrap().remote_tag = Some(tag);
    }

    pub fn original_invite(&self) -> SipRequest {
        self.inner.lock().unwrap().invite.clone()
    }

    /// Record the final 2xx we sent (UAS) or received (UAC).
    pub fn set_final_response(&self, response: SipResponse) {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote_contact_uri.is_none() {
            if let Ok(contact) = response.contact() {
                inner.remote_contact_uri = Some(contact.uri.to_string());
            }
        }
        inner.final_response = Some(response);
    }

    /// Move along an authorised edge. Fails without changing state
    /// otherwise.
    pub fn transition(&self, next: DialogState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "Dialog {} cannot go {:?} -> {:?}",
                self.call_id, inner.state, next
            )));
        }
        debug!(call_id = %self.call_id, from = ?inner.state, to = ?next, "dialog transition");
        inner.state = next;
        inner.state_changed_at = Instant::now();
        Ok(())
    }

    /// Force the dialog to Terminated and fire its Done signal. Returns
    /// false when it already was terminated.
    pub fn terminate(&self, reason: &str) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == DialogState::Terminated {
                return false;
            }
            inner.state = DialogState::Terminated;
            inner.state_changed_at = Instant::now();
            inner.terminate_reason = Some(reason.to_string());
        }
        info!(call_id = %self.call_id, reason = %reason, "dialog terminated");
        self.done.cancel();
        true
    }

    /// UAS ACK processing: confirms a WaitingAck dialog, ignores
    /// retransmissions, drops anything else.
    pub fn handle_ack(&self) {
        let state = self.state();
        match state {
            DialogState::WaitingAck => {
                let _ = self.transition(DialogState::Confirmed);
            }
            DialogState::Confirmed => {
                debug!(call_id = %self.call_id, "ACK retransmission ignored");
            }
            other => {
                warn!(call_id = %self.call_id, state = ?other, "ACK dropped in unexpected state");
            }
        }
    }

    pub fn next_cseq(&self) -> u32 {
        self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn local_cseq(&self) -> u32 {
        self.local_cseq.load(Ordering::SeqCst)
    }

    /// Build an in-dialog BYE per RFC 3261 §12.
    ///
    /// Inbound dialogs swap From/To relative to the INVITE; outbound
    /// dialogs keep the INVITE orientation with the remote tag learned from
    /// the 200 OK. The Request-URI is the remote Contact.
    pub fn build_bye(&self) -> Result<SipRequest> {
        self.build_in_dialog_request(SipMethod::Bye, None)
    }

    /// Build an in-dialog re-INVITE carrying a fresh SDP offer.
    ///
    /// Only one re-INVITE may be outstanding; the in-progress flag is taken
    /// here and must be returned via [`Dialog::complete_reinvite`].
    pub fn build_reinvite(&self, sdp: String) -> Result<SipRequest> {
        if self
            .reinvite_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::invalid_state(format!(
                "Dialog {} already has a re-INVITE in flight",
                self.call_id
            )));
        }
        match self.build_in_dialog_request(SipMethod::Invite, Some(sdp)) {
            Ok(request) => Ok(request),
            Err(e) => {
                self.reinvite_in_progress.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Clear the single-flight re-INVITE flag after a final response or a
    /// send error.
    pub fn complete_reinvite(&self) {
        self.reinvite_in_progress.store(false, Ordering::SeqCst);
    }

    pub fn reinvite_in_progress(&self) -> bool {
        self.reinvite_in_progress.load(Ordering::SeqCst)
    }

    fn build_in_dialog_request(
        &self,
        method: SipMethod,
        sdp: Option<String>,
    ) -> Result<SipRequest> {
        let inner = self.inner.lock().unwrap();

        let request_uri = inner
            .remote_contact_uri
            .clone()
            .ok_or_else(|| Error::invalid_state("Dialog has no remote contact"))?;

        let (from, to) = match self.direction {
            DialogDirection::Inbound => {
                // We answered: From is the INVITE's To with our tag, To is
                // the INVITE's From with their tag.
                let mut from = inner.invite.to()?.without_params();
                from.set_tag(&self.local_tag);
                let to = inner.invite.from()?;
                (from, to)
            }
            DialogDirection::Outbound => {
                let from = inner.invite.from()?;
                let mut to = inner.invite.to()?.without_params();
                if let Some(tag) = &inner.remote_tag {
                    to.set_tag(tag);
                }
                (from, to)
            }
        };

        drop(inner);
        let cseq = self.next_cseq();
        let inner = self.inner.lock().unwrap();

        let mut request = SipRequest::new(method.clone(), request_uri);
        request.headers.set("Max-Forwards", "70");
        request.headers.set("From", from.to_string());
        request.headers.set("To", to.to_string());
        request.headers.set("Call-ID", self.call_id.clone());
        request
            .headers
            .set("CSeq", format!("{} {}", cseq, method));
        for route in inner.invite.headers.get_all("Route") {
            request.headers.push("Route", route);
        }

        if let Some(sdp) = sdp {
            request
                .headers
                .set("Contact", format!("<{}>", self.local_contact_uri));
            request.set_body("application/sdp", sdp);
        }

        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct DialogSnapshot {
    pub call_id: String,
    pub direction: DialogDirection,
    pub state: DialogState,
    pub session_id: Option<String>,
    pub age: Duration,
}

/// Call-ID keyed dialog registry with terminated-TTL cleanup.
pub struct DialogRegistry {
    dialogs: DashMap<String, Arc<Dialog>>,
    by_session: DashMap<String, String>,
    terminated_ttl: Duration,
    ack_timeout: Duration,
    evicted: DashMap<String, ()>,
    on_evict: Mutex<Option<Arc<dyn Fn(Arc<Dialog>) + Send + Sync>>>,
}

impl DialogRegistry {
    pub fn new(ack_timeout: Duration, terminated_ttl: Duration) -> Self {
        Self {
            dialogs: DashMap::new(),
            by_session: DashMap::new(),
            terminated_ttl,
            ack_timeout,
            evicted: DashMap::new(),
            on_evict: Mutex::new(None),
        }
    }

    pub fn set_evict_handler(&self, handler: Arc<dyn Fn(Arc<Dialog>) + Send + Sync>) {
        *self.on_evict.lock().unwrap() = Some(handler);
    }

    pub fn register(&self, dialog: Arc<Dialog>) {
        if let Some(session_id) = dialog.session_id() {
            self.by_session.insert(session_id, dialog.call_id.clone());
        }
        self.dialogs.insert(dialog.call_id.clone(), dialog);
    }

    pub fn find(&self, call_id: &str) -> Option<Arc<Dialog>> {
        self.dialogs.get(call_id).map(|d| Arc::clone(d.value()))
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<Arc<Dialog>> {
        let call_id = self.by_session.get(session_id)?.value().clone();
        self.find(&call_id)
    }

    /// Attach a media session to a dialog, replacing any previous binding
    /// (migration rebinds to the new session id).
    pub fn bind_session(&self, call_id: &str, session_id: String) -> Result<()> {
        let dialog = self
            .find(call_id)
            .ok_or_else(|| Error::not_found(format!("Dialog {}", call_id)))?;
        if let Some(old) = dialog.session_id() {
            self.by_session.remove(&old);
        }
        dialog.set_session_id(Some(session_id.clone()));
        self.by_session.insert(session_id, call_id.to_string());
        Ok(())
    }

    /// Terminate a dialog and keep it resolvable for the terminated TTL to
    /// absorb retransmissions, then evict it.
    pub fn terminate(self: &Arc<Self>, call_id: &str, reason: &str) {
        let Some(dialog) = self.find(call_id) else {
            return;
        };
        if dialog.terminate(reason) {
            self.schedule_eviction(dialog);
        }
    }

    /// Arm the UAS ACK guard: if the dialog is still waiting for ACK when
    /// the timer fires, it is terminated with a timeout reason.
    pub fn arm_ack_timeout(self: &Arc<Self>, dialog: Arc<Dialog>) {
        let registry = Arc::clone(self);
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            let done = dialog.done();
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if dialog.state() == DialogState::WaitingAck {
                        warn!(call_id = %dialog.call_id, "no ACK within timeout");
                        if dialog.terminate("ack_timeout") {
                            registry.schedule_eviction(dialog);
                        }
                    }
                }
            }
        });
    }

    fn schedule_eviction(self: &Arc<Self>, dialog: Arc<Dialog>) {
        let registry = Arc::clone(self);
        let ttl = self.terminated_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            registry.evict(&dialog.call_id);
        });
    }

    fn evict(&self, call_id: &str) {
        // fire the eviction hook exactly once per dialog
        if self.evicted.insert(call_id.to_string(), ()).is_some() {
            return;
        }
        if let Some((_, dialog)) = self.dialogs.remove(call_id) {
            if let Some(session_id) = dialog.session_id() {
                self.by_session.remove(&session_id);
            }
            debug!(call_id = %call_id, "dialog evicted");
            let handler = self.on_evict.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(dialog);
            }
        }
        self.evicted.remove(call_id);
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DialogSnapshot> {
        self.dialogs
            .iter()
            .map(|entry| {
                let d = entry.value();
                let inner = d.inner.lock().unwrap();
                DialogSnapshot {
                    call_id: d.call_id.clone(),
                    direction: d.direction,
                    state: inner.state,
                    session_id: inner.session_id.clone(),
                    age: inner.created_at.elapsed(),
                }
            })
            .collect()
    }

    /// All confirmed inbound/outbound dialogs; drain scans this.
    pub fn all_dialogs(&self) -> Vec<Arc<Dialog>> {
        self.dialogs.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

/// Send a dialog's BYE and terminate it locally. BYE failures are logged,
/// never propagated; the dialog ends either way.
pub async fn send_bye_for_dialog(
    transport: &Arc<crate::core::transport::SipTransport>,
    registry: &Arc<DialogRegistry>,
    call_id: &str,
    reason: &str,
    timeout: Duration,
) {
    let Some(dialog) = registry.find(call_id) else {
        return;
    };
    if dialog.is_terminated() {
        return;
    }

    match dialog.build_bye() {
        Ok(bye) => {
            let dest = dialog
                .remote_target()
                .or_else(|| crate::core::transport::SipTransport::resolve_uri(&bye.uri).ok());
            match dest {
                Some(dest) => match transport.send_request(bye, dest) {
                    Ok(mut transaction) => {
                        let outcome = tokio::time::timeout(timeout, async {
                            while let Some(response) = transaction.recv().await {
                                if response.is_final() {
                                    return Some(response.code);
                                }
                            }
                            None
                        })
                        .await;
                        match outcome {
                            Ok(Some(code)) => debug!(call_id = %call_id, code, "BYE answered"),
                            _ => warn!(call_id = %call_id, "BYE went unanswered"),
                        }
                    }
                    Err(e) => warn!(call_id = %call_id, error = %e, "BYE send failed"),
                },
                None => warn!(call_id = %call_id, "no destination for BYE"),
            }
        }
        Err(e) => warn!(call_id = %call_id, error = %e, "cannot build BYE"),
    }

    registry.terminate(call_id, reason);
}

/// Drive one re-INVITE to its final response, ACKing both 2xx and failure
/// finals. Returns the final status code; the caller decides rollback.
/// The dialog's single-flight flag is always released on exit.
pub async fn send_reinvite(
    transport: &Arc<crate::core::transport::SipTransport>,
    dialog: &Arc<Dialog>,
    sdp: String,
    timeout: Duration,
) -> Result<u16> {
    let reinvite = dialog.build_reinvite(sdp)?;

    let result = drive_reinvite(transport, dialog, reinvite, timeout).await;
    dialog.complete_reinvite();
    result
}

async fn drive_reinvite(
    transport: &Arc<crate::core::transport::SipTransport>,
    dialog: &Arc<Dialog>,
    reinvite: SipRequest,
    timeout: Duration,
) -> Result<u16> {
    let dest = dialog
        .remote_target()
        .or_else(|| crate::core::transport::SipTransport::resolve_uri(&reinvite.uri).ok())
        .ok_or_else(|| Error::transport("No destination for re-INVITE"))?;

    let cseq = reinvite.cseq()?.seq;
    let request_uri = reinvite.uri.clone();
    let mut transaction = transport.send_request(reinvite, dest)?;

    let final_response = tokio::time::timeout(timeout, async {
        while let Some(response) = transaction.recv().await {
            if response.is_final() {
                return Some(response);
            }
        }
        None
    })
    .await
    .map_err(|_| Error::timeout(format!("re-INVITE to {} timed out", dialog.call_id)))?
    .ok_or_else(|| Error::transport("re-INVITE transaction closed"))?;

    // ACK both success and failure finals
    let mut ack = SipRequest::new(SipMethod::Ack, request_uri);
    ack.headers.set("Max-Forwards", "70");
    for name in ["From", "Call-ID"] {
        if let Some(value) = transaction.request.headers.get(name) {
            ack.headers.set(name, value);
        }
    }
    if let Some(to) = final_response.headers.get("To") {
        ack.headers.set("To", to);
    }
    ack.headers.set("CSeq", format!("{} ACK", cseq));
    let via = crate::protocols::sip::Via::new(
        transport.advertise_addr(),
        transport.advertise_port(),
        &crate::protocols::sip::generate_branch(),
    );
    ack.headers.push("Via", via.to_string());
    if let Err(e) = transport.send_raw(&ack, dest).await {
        warn!(call_id = %dialog.call_id, error = %e, "re-INVITE ACK failed");
    }

    Ok(final_response.code)
}
