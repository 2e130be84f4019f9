//! Signaling engine: UAS flows and subsystem wiring
//!
//! Owns the SIP transport, registrar, dialog registry, originator, call
//! service, dialplan and media pool, and runs the request dispatch loop:
//! REGISTER to the registrar, INVITE through answer and dialplan, ACK/BYE/
//! CANCEL against the dialog registry with the originator consulted first
//! for B-leg BYEs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SwitchboardConfig;
use crate::core::transport::{IncomingRequest, SipTransport};
use crate::protocols::sdp::{self, SessionDescription};
use crate::protocols::sip::{generate_tag, SipMethod, SipRequest, SipResponse};
use crate::services::call::CallService;
use crate::services::dialog::{
    send_bye_for_dialog, Dialog, DialogDirection, DialogRegistry, DialogState,
};
use crate::services::dialplan::{CallSession, Dialplan, DialplanExecutor};
use crate::services::drain::DrainCoordinator;
use crate::services::leg::{Leg, LegState, TerminationCause};
use crate::services::location::{spawn_sweeper, LocationStore};
use crate::services::media_pool::{spawn_health_checker, MediaPool, PoolMemberStats};
use crate::services::originator::Originator;
use crate::services::registrar::Registrar;
use crate::{Error, Result};

/// Point-in-time view of the engine for the admin surface.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub registrations: usize,
    pub dialogs: usize,
    pub outbound_legs: usize,
    pub pool: Vec<PoolMemberStats>,
}

pub struct SwitchboardEngine {
    config: SwitchboardConfig,
    transport: Arc<SipTransport>,
    location: Arc<LocationStore>,
    registrar: Registrar,
    registry: Arc<DialogRegistry>,
    pool: Arc<MediaPool>,
    originator: Arc<Originator>,
    call_service: Arc<CallService>,
    executor: DialplanExecutor,
    dialplan: Dialplan,
    drain: Arc<DrainCoordinator>,
    shutdown: CancellationToken,
}

impl SwitchboardEngine {
    /// Build every subsystem, bind the SIP socket and start the dispatch
    /// loop plus the background sweeper and health checker.
    pub async fn start(config: SwitchboardConfig) -> Result<Arc<Self>> {
        let shutdown = CancellationToken::new();

        let (transport, request_rx) = SipTransport::bind(&config.sip, shutdown.clone()).await?;

        let location = Arc::new(LocationStore::new(&config.registrar));
        spawn_sweeper(
            Arc::clone(&location),
            Duration::from_secs(config.registrar.sweep_interval),
            shutdown.clone(),
        );

        let registrar = Registrar::new(
            Arc::clone(&location),
            config.registrar.default_expires,
            config.sip.user_agent.clone(),
        );

        let registry = Arc::new(DialogRegistry::new(
            Duration::from_secs(config.sip.timers.ack_timeout),
            Duration::from_secs(config.sip.timers.terminated_ttl),
        ));

        let pool = MediaPool::new(&config.pool).await?;
        spawn_health_checker(Arc::clone(&pool), shutdown.clone());

        // evicted dialogs must never leak their media session
        {
            let pool = Arc::clone(&pool);
            registry.set_evict_handler(Arc::new(move |dialog: Arc<Dialog>| {
                if let Some(session_id) = dialog.session_id() {
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move {
                        let _ = pool.destroy_session(&session_id, "dialog_evicted").await;
                    });
                }
            }));
        }

        let originator = Originator::new(
            Arc::clone(&transport),
            Arc::clone(&pool),
            Arc::clone(&registry),
            &config.sip,
        );

        let call_service = CallService::new(
            Arc::clone(&location),
            Arc::clone(&originator),
            Arc::clone(&pool),
            config.sip.domain.clone(),
        );

        let executor = DialplanExecutor::new(
            Arc::clone(&call_service),
            Arc::clone(&pool),
            Duration::from_secs(config.dialplan.default_dial_timeout),
        );

        let dialplan = match &config.dialplan.file {
            Some(path) => {
                let plan = Dialplan::load_from_file(path)?;
                info!(file = %path, rules = plan.rule_count(), "dialplan loaded");
                plan
            }
            None => {
                warn!("no dialplan configured; unmatched calls will be refused");
                Dialplan::default()
            }
        };

        let drain = DrainCoordinator::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&originator),
            Arc::clone(&transport),
            config.drain.clone(),
        );

        let engine = Arc::new(Self {
            config,
            transport,
            location,
            registrar,
            registry,
            pool,
            originator,
            call_service,
            executor,
            dialplan,
            drain,
            shutdown,
        });

        let dispatch = Arc::clone(&engine);
        tokio::spawn(async move {
            dispatch.request_loop(request_rx).await;
        });

        info!(
            addr = ?engine.transport.local_addr(),
            domain = %engine.config.sip.domain,
            "switchboard engine started"
        );
        Ok(engine)
    }

    pub fn stop(&self) {
        info!("switchboard engine stopping");
        self.shutdown.cancel();
    }

    pub fn drain_coordinator(&self) -> &Arc<DrainCoordinator> {
        &self.drain
    }

    pub fn call_service(&self) -> &Arc<CallService> {
        &self.call_service
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            registrations: self.location.snapshot().len(),
            dialogs: self.registry.len(),
            outbound_legs: self.originator.active_leg_count(),
            pool: self.pool.stats(),
        }
    }

    async fn request_loop(self: Arc<Self>, mut request_rx: mpsc::UnboundedReceiver<IncomingRequest>) {
        loop {
            let incoming = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                incoming = request_rx.recv() => match incoming {
                    Some(incoming) => incoming,
                    None => return,
                },
            };

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = engine.handle_request(incoming).await {
                    warn!(error = %e, "request handling failed");
                }
            });
        }
    }

    async fn handle_request(self: &Arc<Self>, incoming: IncomingRequest) -> Result<()> {
        let IncomingRequest { request, source } = incoming;
        match request.method {
            SipMethod::Register => {
                let response = self.registrar.handle_register(&request, source);
                self.transport.send_response(&response, source).await
            }
            SipMethod::Invite => self.handle_invite(request, source).await,
            SipMethod::Ack => {
                self.handle_ack(&request);
                Ok(())
            }
            SipMethod::Bye => self.handle_bye(request, source).await,
            SipMethod::Cancel => self.handle_cancel(request, source).await,
            SipMethod::Options => {
                let response = SipResponse::for_request(&request, 200);
                self.transport.send_response(&response, source).await
            }
        }
    }

    /// UAS INVITE: allocate media, answer 183 then 200, and hand the call
    /// to the dialplan once the ACK confirms the dialog.
    async fn handle_invite(
        self: &Arc<Self>,
        request: SipRequest,
        source: std::net::SocketAddr,
    ) -> Result<()> {
        let call_id = request.call_id()?.to_string();

        if self.registry.find(&call_id).is_some() {
            debug!(call_id = %call_id, "INVITE retransmission ignored");
            return Ok(());
        }

        // the offer must carry PCMU
        let offer = match SessionDescription::parse(&request.body) {
            Ok(offer) if offer.offers_pcmu() => offer,
            Ok(_) => {
                let mut response = SipResponse::for_request(&request, 488);
                response.ensure_to_tag(&generate_tag())?;
                return self.transport.send_response(&response, source).await;
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "unparseable SDP offer");
                let mut response = SipResponse::for_request(&request, 400);
                response.ensure_to_tag(&generate_tag())?;
                return self.transport.send_response(&response, source).await;
            }
        };
        let (remote_addr, remote_port) = offer.remote_endpoint()?;

        let local_tag = generate_tag();
        let dialog = Arc::new(Dialog::new_inbound(
            request.clone(),
            local_tag.clone(),
            self.transport.contact_uri(),
            source,
        )?);
        dialog.set_remote_media(remote_addr.clone(), remote_port, sdp::PAYLOAD_TYPE_PCMU);
        self.registry.register(Arc::clone(&dialog));

        let trying = SipResponse::for_request(&request, 100);
        self.transport.send_response(&trying, source).await?;

        // media session on a pool node; its SDP is our answer
        let session = match self
            .pool
            .create_session(&call_id, &remote_addr, remote_port, &offer.payload_types)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "media allocation failed");
                self.registry.terminate(&call_id, "no_media");
                let code = match e {
                    Error::NoAvailableMembers => 503,
                    _ => 500,
                };
                let mut response = SipResponse::for_request(&request, code);
                response.ensure_to_tag(&local_tag)?;
                return self.transport.send_response(&response, source).await;
            }
        };
        self.registry.bind_session(&call_id, session.session_id.clone())?;

        dialog.transition(DialogState::Early)?;
        let mut progress = SipResponse::for_request(&request, 183);
        progress.ensure_to_tag(&local_tag)?;
        progress.set_body("application/sdp", session.sdp.clone());
        self.transport.send_response(&progress, source).await?;

        let mut ok = SipResponse::for_request(&request, 200);
        ok.ensure_to_tag(&local_tag)?;
        ok.headers
            .set("Contact", format!("<{}>", self.transport.contact_uri()));
        ok.set_body("application/sdp", session.sdp.clone());
        dialog.transition(DialogState::WaitingAck)?;
        dialog.set_final_response(ok.clone());
        self.transport.send_response(&ok, source).await?;
        self.registry.arm_ack_timeout(Arc::clone(&dialog));

        info!(call_id = %call_id, session = %session.session_id, "inbound call answered");
        Ok(())
    }

    fn handle_ack(self: &Arc<Self>, request: &SipRequest) {
        let Ok(call_id) = request.call_id() else {
            return;
        };
        let Some(dialog) = self.registry.find(call_id) else {
            debug!(call_id = %call_id, "ACK for unknown dialog");
            return;
        };

        let was_waiting = dialog.state() == DialogState::WaitingAck;
        dialog.handle_ack();

        // first ACK confirms the dialog and releases the call to the
        // dialplan
        if was_waiting && dialog.state() == DialogState::Confirmed {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.run_dialplan(dialog).await;
            });
        }
    }

    /// Adopt the confirmed dialog as the A leg and execute its dialplan
    /// rule.
    async fn run_dialplan(self: &Arc<Self>, dialog: Arc<Dialog>) {
        let call_id = dialog.call_id.clone();
        let invite = dialog.original_invite();

        let dialed_user = invite
            .to()
            .ok()
            .and_then(|to| to.uri.user.clone())
            .unwrap_or_default();

        let Some(session_id) = dialog.session_id() else {
            warn!(call_id = %call_id, "confirmed dialog without media session");
            return;
        };

        let leg = self.adopt_inbound_leg(&dialog, &invite);

        let Some(rule) = self.dialplan.lookup(&dialed_user) else {
            info!(call_id = %call_id, user = %dialed_user, "no dialplan rule; ending call");
            let _ = leg.hangup(TerminationCause::Normal).await;
            return;
        };
        let rule = rule.clone();

        let session = CallSession {
            call_id: call_id.clone(),
            session_id,
            leg: Arc::clone(&leg),
            dialed_user,
            ctx: dialog.done(),
        };

        if let Err(e) = self.executor.execute(&session, &rule).await {
            warn!(call_id = %call_id, error = %e, "dialplan failed");
        }

        // dialplan finished; anything still up comes down normally
        if !leg.state().is_terminal() {
            let _ = leg.hangup(TerminationCause::Normal).await;
        }
    }

    /// Build the B2BUA-side leg over an answered inbound dialog.
    fn adopt_inbound_leg(self: &Arc<Self>, dialog: &Arc<Dialog>, invite: &SipRequest) -> Arc<Leg> {
        let local_uri = invite.to().map(|t| t.uri.to_string()).unwrap_or_default();
        let remote_uri = invite.from().map(|f| f.uri.to_string()).unwrap_or_default();

        let leg = Leg::new(
            dialog.call_id.clone(),
            DialogDirection::Inbound,
            local_uri,
            remote_uri,
        );

        if let Some(session_id) = dialog.session_id() {
            let media = dialog.remote_media();
            leg.set_session(
                session_id,
                self.transport.advertise_addr().to_string(),
                0,
                media.2,
            );
            if let (Some(addr), Some(port)) = (media.0, media.1) {
                leg.set_remote_media(addr, port);
            }
        }

        // adopted dialogs are already confirmed, so the leg starts answered
        if matches!(
            dialog.state(),
            DialogState::WaitingAck | DialogState::Confirmed
        ) {
            let _ = leg.set_state(LegState::Answered);
        } else {
            let _ = leg.set_state(LegState::Ringing);
        }

        // teardown: BYE the caller unless they hung up first
        {
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            let call_id = dialog.call_id.clone();
            let bye_timeout = Duration::from_secs(self.config.sip.timers.bye_timeout);
            leg.set_teardown_handler(Box::new(move |cause| {
                Box::pin(async move {
                    if cause == TerminationCause::RemoteBye {
                        return;
                    }
                    send_bye_for_dialog(&transport, &registry, &call_id, &cause.to_string(), bye_timeout)
                        .await;
                })
            }));
        }

        // cleanup: the A session dies with the leg
        {
            let pool = Arc::clone(&self.pool);
            let registry = Arc::clone(&self.registry);
            let call_id = dialog.call_id.clone();
            let session_id = dialog.session_id();
            leg.on_terminated(Arc::new(move |cause| {
                let pool = Arc::clone(&pool);
                let registry = Arc::clone(&registry);
                let call_id = call_id.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    if let Some(session_id) = session_id {
                        let _ = pool.destroy_session(&session_id, &cause.to_string()).await;
                    }
                    registry.terminate(&call_id, &cause.to_string());
                });
            }));
        }

        // remote BYE cancels the dialog; fold that into the leg
        {
            let leg = Arc::clone(&leg);
            let done = dialog.done();
            tokio::spawn(async move {
                done.cancelled().await;
                let _ = leg.hangup(TerminationCause::RemoteBye).await;
            });
        }

        leg
    }

    async fn handle_bye(
        self: &Arc<Self>,
        request: SipRequest,
        source: std::net::SocketAddr,
    ) -> Result<()> {
        // B legs first: the originator owns their teardown
        if let Some(response) = self.originator.handle_bye(&request).await {
            return self.transport.send_response(&response, source).await;
        }

        let call_id = request.call_id()?;
        let Some(dialog) = self.registry.find(call_id) else {
            let response = SipResponse::for_request(&request, 481);
            return self.transport.send_response(&response, source).await;
        };

        info!(call_id = %call_id, "BYE received");
        let response = SipResponse::for_request(&request, 200);
        self.transport.send_response(&response, source).await?;

        if let Some(session_id) = dialog.session_id() {
            let _ = self.pool.destroy_session(&session_id, "remote_bye").await;
        }
        self.registry.terminate(call_id, "remote_bye");
        Ok(())
    }

    /// CANCEL an unanswered INVITE: 200 for the CANCEL, 487 for the
    /// INVITE, dialog and media released.
    async fn handle_cancel(
        self: &Arc<Self>,
        request: SipRequest,
        source: std::net::SocketAddr,
    ) -> Result<()> {
        let call_id = request.call_id()?;
        let Some(dialog) = self.registry.find(call_id) else {
            let response = SipResponse::for_request(&request, 481);
            return self.transport.send_response(&response, source).await;
        };

        let response = SipResponse::for_request(&request, 200);
        self.transport.send_response(&response, source).await?;

        match dialog.state() {
            DialogState::Initial | DialogState::Early => {
                let mut terminated = SipResponse::for_request(&dialog.original_invite(), 487);
                terminated.ensure_to_tag(&dialog.local_tag)?;
                self.transport.send_response(&terminated, source).await?;

                if let Some(session_id) = dialog.session_id() {
                    let _ = self.pool.destroy_session(&session_id, "cancelled").await;
                }
                self.registry.terminate(call_id, "cancelled");
            }
            state => {
                debug!(call_id = %call_id, state = ?state, "CANCEL too late");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolMemberConfig, PortRange, SwitchboardConfig};
    use crate::media::MediaNode;
    use crate::protocols::sip::SipMessage;
    use std::io::Write;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, UdpSocket};

    async fn spawn_media_node(port_base: u16) -> SocketAddr {
        let node = Arc::new(MediaNode::new(&crate::config::MediaConfig {
            rpc_listen_addr: "127.0.0.1".parse().unwrap(),
            rpc_listen_port: 0,
            advertise_addr: "127.0.0.1".parse().unwrap(),
            port_range: PortRange {
                min: port_base,
                max: port_base + 60,
            },
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(crate::rpc::server::serve(
            node,
            listener,
            CancellationToken::new(),
        ));
        addr
    }

    fn test_wav_file(frames: usize) -> tempfile::NamedTempFile {
        let samples: Vec<i16> = vec![2000; frames * 160];
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

    async fn start_engine(
        media_rpc: SocketAddr,
        dialplan_json: &str,
        media_port_base: u16,
    ) -> (Arc<SwitchboardEngine>, SocketAddr, tempfile::NamedTempFile) {
        let mut plan_file = tempfile::NamedTempFile::new().unwrap();
        plan_file.write_all(dialplan_json.as_bytes()).unwrap();

        let mut config = SwitchboardConfig::default_config();
        config.sip.listen_addr = "127.0.0.1".parse().unwrap();
        config.sip.listen_port = 0;
        config.sip.domain = "switchboard.local".to_string();
        config.media.port_range = PortRange {
            min: media_port_base,
            max: media_port_base + 60,
        };
        config.pool.members = vec![PoolMemberConfig {
            node_id: "m1".to_string(),
            address: media_rpc.to_string(),
        }];
        config.pool.health_check_interval = 60;
        config.dialplan.file = Some(plan_file.path().to_string_lossy().to_string());

        let engine = SwitchboardEngine::start(config).await.unwrap();
        let addr = engine.local_addr().unwrap();
        (engine, addr, plan_file)
    }

    struct Phone {
        sip: Arc<UdpSocket>,
        media: Arc<UdpSocket>,
    }

    impl Phone {
        async fn new() -> Self {
            Self {
                sip: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
                media: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            }
        }

        fn contact(&self, user: &str) -> String {
            format!("sip:{}@{}", user, self.sip.local_addr().unwrap())
        }

        async fn recv(&self) -> SipMessage {
            let mut buf = vec![0u8; 65535];
            let (n, _) = tokio::time::timeout(Duration::from_secs(3), self.sip.recv_from(&mut buf))
                .await
                .expect("timed out waiting for SIP message")
                .unwrap();
            SipMessage::parse(std::str::from_utf8(&buf[..n]).unwrap()).unwrap()
        }

        async fn recv_response(&self) -> SipResponse {
            match self.recv().await {
                SipMessage::Response(r) => r,
                other => panic!("expected response, got {:?}", other),
            }
        }

        async fn register(&self, user: &str, engine: SocketAddr) {
            let raw = format!(
                "REGISTER sip:switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKreg{user};rport\r\n\
Max-Forwards: 70\r\n\
From: <sip:{user}@switchboard.local>;tag=reg{user}\r\n\
To: <sip:{user}@switchboard.local>\r\n\
Call-ID: reg-{user}\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <{contact}>\r\n\
Expires: 60\r\n\
Content-Length: 0\r\n\r\n",
                port = self.sip.local_addr().unwrap().port(),
                user = user,
                contact = self.contact(user),
            );
            self.sip.send_to(raw.as_bytes(), engine).await.unwrap();
            let response = self.recv_response().await;
            assert_eq!(response.code, 200);
        }

        async fn invite(&self, user: &str, target: &str, engine: SocketAddr) -> (String, SipResponse) {
            let call_id = format!("call-{}-{}", user, self.sip.local_addr().unwrap().port());
            let raw = format!(
                "INVITE sip:{target}@switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKinv{user};rport\r\n\
Max-Forwards: 70\r\n\
From: <sip:{user}@switchboard.local>;tag=tag{user}\r\n\
To: <sip:{target}@switchboard.local>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <{contact}>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {len}\r\n\r\n{sdp}",
                port = self.sip.local_addr().unwrap().port(),
                user = user,
                target = target,
                call_id = call_id,
                contact = self.contact(user),
                len = self.sdp().len(),
                sdp = self.sdp(),
            );
            self.sip.send_to(raw.as_bytes(), engine).await.unwrap();

            // 100, 183, 200
            let trying = self.recv_response().await;
            assert_eq!(trying.code, 100);
            let progress = self.recv_response().await;
            assert_eq!(progress.code, 183);
            assert!(progress.body.contains("m=audio"));
            let ok = self.recv_response().await;
            assert_eq!(ok.code, 200);
            assert_eq!(ok.body, progress.body);
            (call_id, ok)
        }

        fn sdp(&self) -> String {
            format!(
                "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio {} RTP/AVP 0\r\n",
                self.media.local_addr().unwrap().port()
            )
        }

        async fn ack(&self, user: &str, call_id: &str, ok: &SipResponse, engine: SocketAddr) {
            let to = ok.headers.get("To").unwrap();
            let raw = format!(
                "ACK sip:switchboard@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKack{call_id}\r\n\
Max-Forwards: 70\r\n\
From: <sip:{user}@switchboard.local>;tag=tag{user}\r\n\
To: {to}\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 ACK\r\n\
Content-Length: 0\r\n\r\n",
                port = self.sip.local_addr().unwrap().port(),
                user = user,
                call_id = call_id,
                to = to,
            );
            self.sip.send_to(raw.as_bytes(), engine).await.unwrap();
        }

        async fn bye(&self, user: &str, call_id: &str, ok: &SipResponse, engine: SocketAddr) {
            let to = ok.headers.get("To").unwrap();
            let raw = format!(
                "BYE sip:switchboard@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKbye{call_id};rport\r\n\
Max-Forwards: 70\r\n\
From: <sip:{user}@switchboard.local>;tag=tag{user}\r\n\
To: {to}\r\n\
Call-ID: {call_id}\r\n\
CSeq: 2 BYE\r\n\
Content-Length: 0\r\n\r\n",
                port = self.sip.local_addr().unwrap().port(),
                user = user,
                call_id = call_id,
                to = to,
            );
            self.sip.send_to(raw.as_bytes(), engine).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_inbound_call_plays_audio() {
        let media_rpc = spawn_media_node(47000).await;
        let wav = test_wav_file(25); // half a second
        let plan = format!(
            r#"[{{"pattern": "alice", "actions": [{{"action": "play_audio", "file": "{}"}}]}}]"#,
            wav.path().to_string_lossy()
        );
        let (_engine, engine_addr, _plan) = start_engine(media_rpc, &plan, 47100).await;

        let phone = Phone::new().await;
        phone.register("alice", engine_addr).await;

        let (call_id, ok) = phone.invite("alice", "alice", engine_addr).await;
        phone.ack("alice", &call_id, &ok, engine_addr).await;

        // paced PCMU frames arrive on the caller's media port
        let mut buf = [0u8; 1500];
        let (n, _) =
            tokio::time::timeout(Duration::from_secs(3), phone.media.recv_from(&mut buf))
                .await
                .expect("no RTP received")
                .unwrap();
        assert_eq!(n, 172); // 12-byte header + 160 bytes of u-law
        assert_eq!(buf[1] & 0x7F, 0); // payload type 0

        // caller hangs up mid-playback
        phone.bye("alice", &call_id, &ok, engine_addr).await;
        let response = phone.recv_response().await;
        assert_eq!(response.code, 200);
    }

    #[tokio::test]
    async fn test_unknown_callee_gets_bye_after_answer() {
        let media_rpc = spawn_media_node(47200).await;
        let plan = r#"[{"pattern": "alice", "actions": []}]"#;
        let (_engine, engine_addr, _plan) = start_engine(media_rpc, plan, 47300).await;

        let phone = Phone::new().await;
        // call an extension with no dialplan rule: answered, then released
        let (call_id, ok) = phone.invite("carol", "nobody", engine_addr).await;
        phone.ack("carol", &call_id, &ok, engine_addr).await;

        let bye = loop {
            match phone.recv().await {
                SipMessage::Request(r) if r.method == SipMethod::Bye => break r,
                other => panic!("expected BYE, got {:?}", other),
            }
        };
        assert_eq!(bye.call_id().unwrap(), call_id);
        // From/To swapped relative to our INVITE
        assert_eq!(bye.from().unwrap().uri.user(), Some("nobody"));
        assert_eq!(bye.to().unwrap().uri.user(), Some("carol"));
    }

    #[tokio::test]
    async fn test_bye_unknown_call_gets_481() {
        let media_rpc = spawn_media_node(47400).await;
        let plan = r#"[]"#;
        let (_engine, engine_addr, _plan) = start_engine(media_rpc, plan, 47500).await;

        let phone = Phone::new().await;
        let raw = format!(
            "BYE sip:switchboard@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKnope;rport\r\n\
From: <sip:x@y>;tag=1\r\nTo: <sip:z@w>;tag=2\r\n\
Call-ID: no-such-call\r\nCSeq: 1 BYE\r\nContent-Length: 0\r\n\r\n",
            port = phone.sip.local_addr().unwrap().port(),
        );
        phone.sip.send_to(raw.as_bytes(), engine_addr).await.unwrap();
        let response = phone.recv_response().await;
        assert_eq!(response.code, 481);
    }

    #[tokio::test]
    async fn test_invite_without_pcmu_gets_488() {
        let media_rpc = spawn_media_node(47600).await;
        let plan = r#"[]"#;
        let (_engine, engine_addr, _plan) = start_engine(media_rpc, plan, 47700).await;

        let phone = Phone::new().await;
        let sdp = "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio 4000 RTP/AVP 8\r\n";
        let raw = format!(
            "INVITE sip:alice@switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bK488;rport\r\n\
From: <sip:x@switchboard.local>;tag=x\r\nTo: <sip:alice@switchboard.local>\r\n\
Call-ID: no-pcmu\r\nCSeq: 1 INVITE\r\nContact: <sip:x@127.0.0.1:{port}>\r\n\
Content-Type: application/sdp\r\nContent-Length: {len}\r\n\r\n{sdp}",
            port = phone.sip.local_addr().unwrap().port(),
            len = sdp.len(),
            sdp = sdp,
        );
        phone.sip.send_to(raw.as_bytes(), engine_addr).await.unwrap();
        let response = phone.recv_response().await;
        assert_eq!(response.code, 488);
    }

    #[tokio::test]
    async fn test_bridged_call_end_to_end() {
        let media_rpc = spawn_media_node(47800).await;
        let plan = r#"[{"pattern": "bob", "actions": [{"action": "dial", "target": "user/bob", "timeout": 10}]}]"#;
        let (engine, engine_addr, _plan) = start_engine(media_rpc, plan, 47900).await;

        // bob: a UAS phone that answers the switchboard's INVITE
        let bob = Phone::new().await;
        bob.register("bob", engine_addr).await;
        let bob_sip = Arc::clone(&bob.sip);
        let bob_sdp = bob.sdp();
        let bob_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let (n, from) = tokio::time::timeout(
                Duration::from_secs(5),
                bob_sip.recv_from(&mut buf),
            )
            .await
            .expect("bob never got the INVITE")
            .unwrap();
            let invite = match SipMessage::parse(std::str::from_utf8(&buf[..n]).unwrap()).unwrap()
            {
                SipMessage::Request(r) => r,
                other => panic!("expected INVITE, got {:?}", other),
            };
            assert_eq!(invite.method, SipMethod::Invite);

            let mut ok = SipResponse::for_request(&invite, 200);
            ok.ensure_to_tag("bobtag").unwrap();
            ok.headers.set(
                "Contact",
                format!("<sip:bob@{}>", bob_sip.local_addr().unwrap()),
            );
            ok.set_body("application/sdp", bob_sdp);
            bob_sip.send_to(ok.to_string().as_bytes(), from).await.unwrap();

            // consume the ACK
            let _ = tokio::time::timeout(Duration::from_secs(3), bob_sip.recv_from(&mut buf))
                .await
                .expect("bob never got the ACK");
            (invite.call_id().unwrap().to_string(), from)
        });

        // alice calls bob
        let alice = Phone::new().await;
        let (a_call_id, ok) = alice.invite("alice", "bob", engine_addr).await;
        alice.ack("alice", &a_call_id, &ok, engine_addr).await;

        let (b_call_id, switchboard_addr) = bob_task.await.unwrap();
        assert_ne!(a_call_id, b_call_id);

        // give the bridge a moment to come up, then push media A -> B
        tokio::time::sleep(Duration::from_millis(300)).await;
        let a_session_port = SessionDescription::parse(&ok.body).unwrap().audio_port;
        let packet = crate::protocols::rtp::RtpPacket::frame(0, 1, 160, 0xabcd)
            .with_payload(bytes::Bytes::from(vec![0x55u8; 160]));
        alice
            .media
            .send_to(&packet.encode(), ("127.0.0.1", a_session_port))
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = tokio::time::timeout(Duration::from_secs(3), bob.media.recv_from(&mut buf))
            .await
            .expect("relay never delivered to bob")
            .unwrap();
        assert_eq!(n, 172);

        // bob hangs up; alice must receive the switchboard's BYE
        let bye_raw = format!(
            "BYE sip:switchboard@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{port};branch=z9hG4bKbobbye;rport\r\n\
From: <sip:bob@switchboard.local>;tag=bobtag\r\n\
To: <sip:alice@switchboard.local>\r\n\
Call-ID: {call_id}\r\nCSeq: 2 BYE\r\nContent-Length: 0\r\n\r\n",
            port = bob.sip.local_addr().unwrap().port(),
            call_id = b_call_id,
        );
        bob.sip
            .send_to(bye_raw.as_bytes(), switchboard_addr)
            .await
            .unwrap();

        // bob gets 200 for his BYE
        let response = bob.recv_response().await;
        assert_eq!(response.code, 200);

        // alice's side is taken down by the bridge cascade
        let bye = loop {
            match alice.recv().await {
                SipMessage::Request(r) if r.method == SipMethod::Bye => break r,
                SipMessage::Response(_) => continue,
                other => panic!("expected BYE, got {:?}", other),
            }
        };
        assert_eq!(bye.call_id().unwrap(), a_call_id);

        // answer it and let the teardown settle
        let ok_bye = SipResponse::for_request(&bye, 200);
        alice
            .sip
            .send_to(ok_bye.to_string().as_bytes(), engine_addr)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = engine.status();
        assert_eq!(status.outbound_legs, 0);
    }
}
