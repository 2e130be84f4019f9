//! Outbound call origination (UAC)
//!
//! Drives one INVITE per B leg: allocates the media session (co-located
//! with the A leg when asked), sends the INVITE through a client
//! transaction, walks the response flow to Answered or a terminal failure,
//! ACKs 2xx directly on the transport, and owns CANCEL/BYE for the legs it
//! created.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SipConfig;
use crate::core::transport::{ClientTransaction, SipTransport};
use crate::protocols::sdp::SessionDescription;
use crate::protocols::sip::{
    generate_branch, generate_call_id, generate_tag, SipMethod, SipRequest, SipResponse, Via,
};
use crate::services::dialog::{Dialog, DialogRegistry};
use crate::services::leg::{Leg, LegState, OutboundDialogState, TerminationCause};
use crate::services::media_pool::MediaPool;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct OriginateRequest {
    /// Fully resolved target, e.g. `sip:bob@192.0.2.7:5070`.
    pub target_uri: String,
    pub caller_id: Option<String>,
    pub caller_name: Option<String>,
    pub codecs: Vec<u8>,
    pub timeout: Duration,
    /// Co-locate the B session with this A-leg session.
    pub a_leg_session_id: Option<String>,
    /// Lets BYE propagation find the peer leg.
    pub a_leg_call_id: Option<String>,
}

pub struct Originator {
    transport: Arc<SipTransport>,
    media: Arc<MediaPool>,
    registry: Arc<DialogRegistry>,
    user_agent: String,
    bye_timeout: Duration,
    cancel_timeout: Duration,
    /// B-leg Call-ID -> leg
    legs: DashMap<String, Arc<Leg>>,
    /// A-leg Call-ID -> B-leg Call-ID
    a_to_b: DashMap<String, String>,
}

impl Originator {
    pub fn new(
        transport: Arc<SipTransport>,
        media: Arc<MediaPool>,
        registry: Arc<DialogRegistry>,
        config: &SipConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            media,
            registry,
            user_agent: config.user_agent.clone(),
            bye_timeout: Duration::from_secs(config.timers.bye_timeout),
            cancel_timeout: Duration::from_secs(config.timers.cancel_timeout),
            legs: DashMap::new(),
            a_to_b: DashMap::new(),
        })
    }

    /// The B leg currently paired with an A-leg call, if any.
    pub fn peer_b_leg(&self, a_call_id: &str) -> Option<Arc<Leg>> {
        let b_call_id = self.a_to_b.get(a_call_id)?.value().clone();
        self.legs.get(&b_call_id).map(|l| Arc::clone(l.value()))
    }

    /// The B-leg Call-ID paired with an A-leg call (drain's bridge mapper).
    pub fn peer_b_call_id(&self, a_call_id: &str) -> Option<String> {
        self.a_to_b.get(a_call_id).map(|e| e.value().clone())
    }

    pub fn active_leg_count(&self) -> usize {
        self.legs.len()
    }

    /// Route an incoming BYE: when its Call-ID names one of our B legs,
    /// answer 200 and hang the leg up as remotely terminated (the teardown
    /// handler then skips sending a BYE of its own).
    pub async fn handle_bye(&self, request: &SipRequest) -> Option<SipResponse> {
        let call_id = request.call_id().ok()?;
        let leg = self.legs.get(call_id).map(|l| Arc::clone(l.value()))?;

        info!(call_id = %call_id, "BYE for originated leg");
        self.registry.terminate(call_id, "remote_bye");
        if let Err(e) = leg.hangup(TerminationCause::RemoteBye).await {
            warn!(call_id = %call_id, error = %e, "hangup after BYE failed");
        }
        Some(SipResponse::for_request(request, 200))
    }

    /// Build and drive an outbound INVITE until answer or failure.
    pub async fn originate(
        self: &Arc<Self>,
        request: OriginateRequest,
        ctx: CancellationToken,
    ) -> Result<Arc<Leg>> {
        let b_call_id = generate_call_id(&self.transport.advertise_addr().to_string());
        let local_tag = generate_tag();
        let caller = request.caller_id.clone().unwrap_or_else(|| "switchboard".to_string());
        let from_uri = format!(
            "sip:{}@{}:{}",
            caller,
            self.transport.advertise_addr(),
            self.transport.advertise_port()
        );

        let leg = Leg::new(
            b_call_id.clone(),
            crate::services::dialog::DialogDirection::Outbound,
            from_uri.clone(),
            request.target_uri.clone(),
        );

        self.install_teardown(&leg, &b_call_id);
        self.install_cleanup(&leg, &b_call_id, request.a_leg_call_id.clone());

        self.legs.insert(b_call_id.clone(), Arc::clone(&leg));
        if let Some(a_call_id) = &request.a_leg_call_id {
            self.a_to_b.insert(a_call_id.clone(), b_call_id.clone());
        }

        let result = self
            .drive_invite(&leg, &b_call_id, &local_tag, &from_uri, &request, ctx)
            .await;

        if result.is_err() && !leg.state().is_terminal() {
            // any failure must leave the leg terminal so the cleanup
            // callback releases the media session
            let _ = leg.fail(TerminationCause::Error);
        }
        result.map(|_| leg)
    }

    /// Teardown handler: send BYE through the registry dialog unless the
    /// remote side already ended the call.
    fn install_teardown(self: &Arc<Self>, leg: &Arc<Leg>, b_call_id: &str) {
        let originator = Arc::clone(self);
        let call_id = b_call_id.to_string();
        leg.set_teardown_handler(Box::new(move |cause| {
            Box::pin(async move {
                if cause == TerminationCause::RemoteBye {
                    debug!(call_id = %call_id, "remote BYE; not sending our own");
                    return;
                }
                originator.send_bye(&call_id).await;
            })
        }));
    }

    /// Terminated callback: destroy the media session, terminate the
    /// dialog, drop the leg out of both maps.
    fn install_cleanup(self: &Arc<Self>, leg: &Arc<Leg>, b_call_id: &str, a_call_id: Option<String>) {
        let originator = Arc::clone(self);
        let call_id = b_call_id.to_string();
        let leg_weak = Arc::downgrade(leg);
        leg.on_terminated(Arc::new(move |cause| {
            let originator = Arc::clone(&originator);
            let call_id = call_id.clone();
            let a_call_id = a_call_id.clone();
            let session_id = leg_weak.upgrade().and_then(|l| l.session_id());
            tokio::spawn(async move {
                if let Some(session_id) = session_id {
                    let reason = cause.to_string();
                    if let Err(e) = originator.media.destroy_session(&session_id, &reason).await {
                        warn!(session_id = %session_id, error = %e, "B session destroy failed");
                    }
                }
                originator.registry.terminate(&call_id, &cause.to_string());
                originator.legs.remove(&call_id);
                if let Some(a_call_id) = a_call_id {
                    originator.a_to_b.remove(&a_call_id);
                }
            });
        }));
    }

    async fn send_bye(&self, call_id: &str) {
        crate::services::dialog::send_bye_for_dialog(
            &self.transport,
            &self.registry,
            call_id,
            "local_bye",
            self.bye_timeout,
        )
        .await;
    }

    async fn drive_invite(
        self: &Arc<Self>,
        leg: &Arc<Leg>,
        b_call_id: &str,
        local_tag: &str,
        from_uri: &str,
        request: &OriginateRequest,
        ctx: CancellationToken,
    ) -> Result<()> {
        // media first; the INVITE carries its SDP offer
        let session = match &request.a_leg_session_id {
            Some(peer) => {
                self.media
                    .create_session_pending_remote_on_node(peer, b_call_id, &request.codecs)
                    .await?
            }
            None => {
                self.media
                    .create_session_pending_remote(b_call_id, &request.codecs)
                    .await?
            }
        };
        leg.set_session(
            session.session_id.clone(),
            session.local_addr.clone(),
            session.local_port,
            session.codec,
        );

        let invite = self.build_invite(b_call_id, local_tag, from_uri, request, &session.sdp)?;
        let dest = SipTransport::resolve_uri(&invite.uri)?;
        let mut transaction = self.transport.send_request(invite, dest)?;
        info!(call_id = %b_call_id, target = %request.target_uri, "INVITE sent");

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        loop {
            let response = tokio::select! {
                _ = ctx.cancelled() => {
                    self.cancel_invite(&mut transaction, leg, TerminationCause::Cancel).await;
                    return Err(Error::timeout("Origination cancelled"));
                }
                _ = &mut deadline => {
                    self.cancel_invite(&mut transaction, leg, TerminationCause::Timeout).await;
                    return Err(Error::timeout(format!(
                        "No answer from {} within {:?}",
                        request.target_uri, request.timeout
                    )));
                }
                response = transaction.recv() => match response {
                    Some(response) => response,
                    None => {
                        leg.fail(TerminationCause::Error)?;
                        return Err(Error::transport("INVITE transaction closed"));
                    }
                },
            };

            match response.code {
                100 => debug!(call_id = %b_call_id, "trying"),
                180 | 181 => {
                    let _ = leg.set_state(LegState::Ringing);
                }
                183 => {
                    let _ = leg.set_state(LegState::EarlyMedia);
                    if let Err(e) = self.apply_remote_sdp(leg, &response).await {
                        warn!(call_id = %b_call_id, error = %e, "early media SDP ignored");
                    }
                }
                code if (200..300).contains(&code) => {
                    return self
                        .complete_answer(leg, b_call_id, local_tag, &transaction, response)
                        .await;
                }
                code if (300..400).contains(&code) => {
                    // no redirect following; treat as rejection
                    leg.set_sip_final(code, response.reason.clone());
                    leg.fail(TerminationCause::Rejected)?;
                    return Err(Error::Rejected {
                        code,
                        reason: response.reason,
                    });
                }
                code if code >= 400 => {
                    info!(call_id = %b_call_id, code, reason = %response.reason, "call rejected");
                    leg.set_sip_final(code, response.reason.clone());
                    leg.fail(TerminationCause::Rejected)?;
                    return Err(Error::Rejected {
                        code,
                        reason: response.reason,
                    });
                }
                other => debug!(call_id = %b_call_id, code = other, "provisional ignored"),
            }
        }
    }

    fn build_invite(
        &self,
        call_id: &str,
        local_tag: &str,
        from_uri: &str,
        request: &OriginateRequest,
        sdp_offer: &str,
    ) -> Result<SipRequest> {
        let mut invite = SipRequest::new(SipMethod::Invite, request.target_uri.clone());
        invite.headers.set("Max-Forwards", "70");

        let from = match &request.caller_name {
            Some(name) => format!("\"{}\" <{}>;tag={}", name, from_uri, local_tag),
            None => format!("<{}>;tag={}", from_uri, local_tag),
        };
        invite.headers.set("From", from);
        invite
            .headers
            .set("To", format!("<{}>", request.target_uri));
        invite.headers.set("Call-ID", call_id.to_string());
        invite.headers.set("CSeq", "1 INVITE");
        invite
            .headers
            .set("Contact", format!("<{}>", self.transport.contact_uri()));
        invite.headers.set("User-Agent", self.user_agent.clone());
        invite.set_body("application/sdp", sdp_offer.to_string());
        Ok(invite)
    }

    async fn apply_remote_sdp(&self, leg: &Arc<Leg>, response: &SipResponse) -> Result<()> {
        if response.body.is_empty() {
            return Ok(());
        }
        let sdp = SessionDescription::parse(&response.body)?;
        let (addr, port) = sdp.remote_endpoint()?;
        let session_id = leg
            .session_id()
            .ok_or_else(|| Error::invalid_state("Leg has no media session"))?;
        self.media
            .update_session_remote(&session_id, &addr, port)
            .await?;
        leg.set_remote_media(addr, port);
        Ok(())
    }

    async fn complete_answer(
        self: &Arc<Self>,
        leg: &Arc<Leg>,
        b_call_id: &str,
        local_tag: &str,
        transaction: &ClientTransaction,
        response: SipResponse,
    ) -> Result<()> {
        if let Err(e) = self.apply_remote_sdp(leg, &response).await {
            warn!(call_id = %b_call_id, error = %e, "2xx SDP could not be applied");
        }

        let ack_dest = self.answer_destination(&response, transaction.dest);
        if let Err(e) = self.send_ack(transaction, &response, ack_dest).await {
            // the call still counts as answered
            warn!(call_id = %b_call_id, error = %e, "ACK send failed");
        }

        let dialog = Arc::new(Dialog::new_outbound(
            transaction.request.clone(),
            response.clone(),
            local_tag.to_string(),
            ack_dest,
        )?);
        if let (Some(addr), Some(port)) = (
            leg.media().remote_addr.clone(),
            leg.media().remote_port,
        ) {
            dialog.set_remote_media(addr, port, leg.media().codec);
        }
        self.registry.register(Arc::clone(&dialog));
        if let Some(session_id) = leg.session_id() {
            self.registry.bind_session(b_call_id, session_id)?;
        }

        let remote_tag = response
            .to()
            .ok()
            .and_then(|to| to.tag().map(|t| t.to_string()))
            .unwrap_or_default();
        leg.set_outbound_dialog(OutboundDialogState {
            remote_contact_uri: response
                .contact()
                .map(|c| c.uri.to_string())
                .unwrap_or_default(),
            remote_to_uri: response.to().map(|t| t.uri.to_string()).unwrap_or_default(),
            local_from_uri: transaction
                .request
                .from()
                .map(|f| f.uri.to_string())
                .unwrap_or_default(),
            remote_tag,
            local_tag: local_tag.to_string(),
        });

        leg.set_state(LegState::Answered)?;
        info!(call_id = %b_call_id, "B leg answered");
        Ok(())
    }

    /// Where the ACK (and later in-dialog requests) go: Via received/rport
    /// when present, else the 2xx Contact, else where we sent the INVITE.
    fn answer_destination(&self, response: &SipResponse, invite_dest: SocketAddr) -> SocketAddr {
        if let Ok(via) = response.top_via() {
            if via.param("received").is_some() {
                if let Ok(addr) = via.response_addr() {
                    return addr;
                }
            }
        }
        response
            .contact()
            .ok()
            .and_then(|contact| SipTransport::resolve_uri(&contact.uri.to_string()).ok())
            .unwrap_or(invite_dest)
    }

    /// ACK for a 2xx goes straight out on the transport as its own tiny
    /// transactionless message.
    async fn send_ack(
        &self,
        transaction: &ClientTransaction,
        response: &SipResponse,
        dest: SocketAddr,
    ) -> Result<()> {
        let request_uri = response
            .contact()
            .map(|c| c.uri.to_string())
            .unwrap_or_else(|_| transaction.request.uri.clone());

        let mut ack = SipRequest::new(SipMethod::Ack, request_uri);
        ack.headers.set("Max-Forwards", "70");
        if let Some(from) = transaction.request.headers.get("From") {
            ack.headers.set("From", from);
        }
        if let Some(to) = response.headers.get("To") {
            ack.headers.set("To", to);
        }
        ack.headers
            .set("Call-ID", transaction.request.call_id()?.to_string());
        ack.headers.set(
            "CSeq",
            format!("{} ACK", transaction.request.cseq()?.seq),
        );
        let via = Via::new(
            self.transport.advertise_addr(),
            self.transport.advertise_port(),
            &generate_branch(),
        );
        ack.headers.push("Via", via.to_string());

        self.transport.send_raw(&ack, dest).await
    }

    /// Give up on a pending INVITE: CANCEL it, wait briefly for the
    /// outcome, mark the leg terminal.
    async fn cancel_invite(
        &self,
        transaction: &mut ClientTransaction,
        leg: &Arc<Leg>,
        cause: TerminationCause,
    ) {
        let invite = &transaction.request;
        let mut cancel = SipRequest::new(SipMethod::Cancel, invite.uri.clone());
        // CANCEL mirrors the INVITE: same Via (same branch), same CSeq number
        for name in ["Via", "From", "To", "Call-ID", "Max-Forwards"] {
            if let Some(value) = invite.headers.get(name) {
                cancel.headers.set(name, value);
            }
        }
        if let Ok(cseq) = invite.cseq() {
            cancel.headers.set("CSeq", format!("{} CANCEL", cseq.seq));
        }

        if let Err(e) = self.transport.send_raw(&cancel, transaction.dest).await {
            warn!(error = %e, "CANCEL send failed");
        } else {
            // responses for the CANCEL (and the INVITE's 487) share our branch
            let _ = tokio::time::timeout(self.cancel_timeout, async {
                while let Some(response) = transaction.recv().await {
                    if response.is_final() {
                        debug!(code = response.code, "post-CANCEL response");
                        if matches!(response.cseq(), Ok(c) if c.method == SipMethod::Cancel) {
                            continue; // wait for the INVITE's 487
                        }
                        break;
                    }
                }
            })
            .await;
        }

        let _ = leg.fail(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, PoolConfig, PoolMemberConfig, PortRange, SipTimers};
    use crate::media::MediaNode;
    use crate::protocols::sip::SipMessage;
    use tokio::net::{TcpListener, UdpSocket};

    struct Rig {
        originator: Arc<Originator>,
        registry: Arc<DialogRegistry>,
        peer: Arc<UdpSocket>,
        peer_uri: String,
    }

    async fn rig(port_base: u16) -> Rig {
        // media node
        let node = Arc::new(MediaNode::new(&MediaConfig {
            rpc_listen_addr: "127.0.0.1".parse().unwrap(),
            rpc_listen_port: 0,
            advertise_addr: "127.0.0.1".parse().unwrap(),
            port_range: PortRange {
                min: port_base,
                max: port_base + 50,
            },
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_addr = listener.local_addr().unwrap();
        tokio::spawn(crate::rpc::server::serve(
            node,
            listener,
            CancellationToken::new(),
        ));

        let pool = MediaPool::new(&PoolConfig {
            members: vec![PoolMemberConfig {
                node_id: "m1".to_string(),
                address: rpc_addr.to_string(),
            }],
            health_check_interval: 60,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            rpc_timeout: 2,
        })
        .await
        .unwrap();

        let sip_config = SipConfig {
            listen_addr: "127.0.0.1".parse().unwrap(),
            listen_port: 0,
            domain: "test.local".to_string(),
            advertise_addr: "127.0.0.1".parse().unwrap(),
            advertise_port: 5060,
            user_agent: "Switchboard/test".to_string(),
            timers: SipTimers::default(),
        };
        let (transport, _requests) = SipTransport::bind(&sip_config, CancellationToken::new())
            .await
            .unwrap();

        let registry = Arc::new(DialogRegistry::new(
            Duration::from_secs(32),
            Duration::from_secs(32),
        ));
        let originator = Originator::new(transport, pool, Arc::clone(&registry), &sip_config);

        let peer = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_addr = peer.local_addr().unwrap();
        let peer_uri = format!("sip:bob@127.0.0.1:{}", peer_addr.port());

        Rig {
            originator,
            registry,
            peer,
            peer_uri,
        }
    }

    async fn peer_recv(peer: &UdpSocket) -> (SipRequest, SocketAddr) {
        let mut buf = vec![0u8; 65535];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match SipMessage::parse(std::str::from_utf8(&buf[..n]).unwrap()).unwrap() {
            SipMessage::Request(r) => (r, from),
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn answer_with_sdp(invite: &SipRequest, rtp_port: u16) -> SipResponse {
        let mut ok = SipResponse::for_request(invite, 200);
        ok.ensure_to_tag("bobtag").unwrap();
        ok.headers
            .set("Contact", invite.uri.replace("sip:", "<sip:") + ">");
        ok.set_body(
            "application/sdp",
            format!(
                "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio {} RTP/AVP 0\r\n",
                rtp_port
            ),
        );
        ok
    }

    fn originate_request(target: &str) -> OriginateRequest {
        OriginateRequest {
            target_uri: target.to_string(),
            caller_id: Some("alice".to_string()),
            caller_name: None,
            codecs: vec![0],
            timeout: Duration::from_secs(5),
            a_leg_session_id: None,
            a_leg_call_id: None,
        }
    }

    #[tokio::test]
    async fn test_answered_call_flow() {
        let rig = rig(44100).await;
        let peer = Arc::clone(&rig.peer);

        let uas = tokio::spawn(async move {
            let (invite, from) = peer_recv(&peer).await;
            assert_eq!(invite.method, SipMethod::Invite);
            assert_eq!(invite.cseq().unwrap().seq, 1);
            assert!(invite.body.contains("m=audio"));

            let mut ringing = SipResponse::for_request(&invite, 180);
            ringing.ensure_to_tag("bobtag").unwrap();
            peer.send_to(ringing.to_string().as_bytes(), from)
                .await
                .unwrap();

            let ok = answer_with_sdp(&invite, 46500);
            peer.send_to(ok.to_string().as_bytes(), from).await.unwrap();

            // the ACK lands here, transactionless
            let (ack, _) = peer_recv(&peer).await;
            assert_eq!(ack.method, SipMethod::Ack);
            assert_eq!(ack.cseq().unwrap().seq, 1);
            invite.call_id().unwrap().to_string()
        });

        let leg = rig
            .originator
            .originate(
                originate_request(&rig.peer_uri),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let call_id = uas.await.unwrap();
        assert_eq!(leg.state(), LegState::Answered);
        assert_eq!(leg.call_id, call_id);

        // outbound dialog registered in Confirmed
        let dialog = rig.registry.find(&call_id).unwrap();
        assert_eq!(
            dialog.state(),
            crate::services::dialog::DialogState::Confirmed
        );
        assert_eq!(rig.originator.active_leg_count(), 1);

        // hangup sends BYE through the dialog
        let peer = Arc::clone(&rig.peer);
        let bye_wait = tokio::spawn(async move {
            let (bye, from) = peer_recv(&peer).await;
            assert_eq!(bye.method, SipMethod::Bye);
            assert_eq!(bye.cseq().unwrap().seq, 2);
            let ok = SipResponse::for_request(&bye, 200);
            peer.send_to(ok.to_string().as_bytes(), from).await.unwrap();
        });

        leg.hangup(TerminationCause::Normal).await.unwrap();
        bye_wait.await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.originator.active_leg_count(), 0);
    }

    #[tokio::test]
    async fn test_rejection_maps_to_failed_leg() {
        let rig = rig(44200).await;
        let peer = Arc::clone(&rig.peer);

        tokio::spawn(async move {
            let (invite, from) = peer_recv(&peer).await;
            let mut busy = SipResponse::for_request(&invite, 486);
            busy.ensure_to_tag("bobtag").unwrap();
            peer.send_to(busy.to_string().as_bytes(), from)
                .await
                .unwrap();
        });

        let err = rig
            .originator
            .originate(
                originate_request(&rig.peer_uri),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            Error::Rejected { code, .. } => assert_eq!(code, 486),
            other => panic!("expected rejection, got {}", other),
        }

        // cleanup ran: nothing tracked anymore
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.originator.active_leg_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_sends_cancel() {
        let rig = rig(44300).await;
        let peer = Arc::clone(&rig.peer);

        let uas = tokio::spawn(async move {
            let (invite, from) = peer_recv(&peer).await;
            // ring forever; never answer
            let mut ringing = SipResponse::for_request(&invite, 180);
            ringing.ensure_to_tag("bobtag").unwrap();
            peer.send_to(ringing.to_string().as_bytes(), from)
                .await
                .unwrap();

            let (cancel, from) = peer_recv(&peer).await;
            assert_eq!(cancel.method, SipMethod::Cancel);
            assert_eq!(
                cancel.top_via().unwrap().branch(),
                invite.top_via().unwrap().branch()
            );
            let ok = SipResponse::for_request(&cancel, 200);
            peer.send_to(ok.to_string().as_bytes(), from).await.unwrap();

            // and the INVITE dies with 487
            let mut terminated = SipResponse::for_request(&invite, 487);
            terminated.ensure_to_tag("bobtag").unwrap();
            peer.send_to(terminated.to_string().as_bytes(), from)
                .await
                .unwrap();
        });

        let mut request = originate_request(&rig.peer_uri);
        request.timeout = Duration::from_millis(300);
        let err = rig
            .originator
            .originate(request, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        uas.await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_bye_routing() {
        let rig = rig(44400).await;
        let peer = Arc::clone(&rig.peer);

        tokio::spawn(async move {
            let (invite, from) = peer_recv(&peer).await;
            let ok = answer_with_sdp(&invite, 46600);
            peer.send_to(ok.to_string().as_bytes(), from).await.unwrap();
            let _ack = peer_recv(&peer).await;
        });

        let leg = rig
            .originator
            .originate(
                originate_request(&rig.peer_uri),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // remote BYE arrives for the B leg
        let bye_raw = format!(
            "BYE sip:switchboard@127.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKbye\r\n\
From: <sip:bob@127.0.0.1>;tag=bobtag\r\nTo: <sip:alice@127.0.0.1>;tag=x\r\n\
Call-ID: {}\r\nCSeq: 2 BYE\r\nContent-Length: 0\r\n\r\n",
            leg.call_id
        );
        let bye = match SipMessage::parse(&bye_raw).unwrap() {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };

        let response = rig.originator.handle_bye(&bye).await.unwrap();
        assert_eq!(response.code, 200);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(leg.state(), LegState::Destroyed);
        assert_eq!(leg.termination_cause(), Some(TerminationCause::RemoteBye));

        // an unrelated Call-ID is not ours
        let other_raw = bye_raw.replace(&leg.call_id, "unknown-call");
        let other = match SipMessage::parse(&other_raw).unwrap() {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        assert!(rig.originator.handle_bye(&other).await.is_none());
    }
}
