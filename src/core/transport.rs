//! SIP UDP transport and client transactions
//!
//! One socket serves both directions. Incoming datagrams are parsed and
//! split: requests flow to the engine after RFC 3581 received/rport
//! stamping; responses are routed to the pending client transaction whose
//! branch they carry. ACK is sent directly on the transport, never as a
//! transaction.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SipConfig;
use crate::protocols::sip::{
    generate_branch, stamp_top_via, SipMessage, SipRequest, SipResponse, SipUri, Via,
};
use crate::{Error, Result};

/// A request as received off the wire, with its source address.
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: SipRequest,
    pub source: SocketAddr,
}

pub struct SipTransport {
    socket: Arc<UdpSocket>,
    advertise_addr: IpAddr,
    advertise_port: u16,
    transactions: Arc<DashMap<String, mpsc::UnboundedSender<SipResponse>>>,
}

impl SipTransport {
    /// Bind the SIP socket and start the receive loop. Incoming requests
    /// are handed to the returned channel.
    pub async fn bind(
        config: &SipConfig,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<IncomingRequest>)> {
        let socket = UdpSocket::bind((config.listen_addr, config.listen_port))
            .await
            .map_err(|e| {
                Error::transport(format!(
                    "Cannot bind SIP socket {}:{}: {}",
                    config.listen_addr, config.listen_port, e
                ))
            })?;
        let socket = Arc::new(socket);

        let transport = Arc::new(Self {
            socket: Arc::clone(&socket),
            advertise_addr: config.advertise_addr,
            advertise_port: config.advertise_port,
            transactions: Arc::new(DashMap::new()),
        });

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let recv_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            recv_transport.receive_loop(request_tx, shutdown).await;
        });

        Ok((transport, request_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::transport(e.to_string()))
    }

    pub fn advertise_addr(&self) -> IpAddr {
        self.advertise_addr
    }

    pub fn advertise_port(&self) -> u16 {
        self.advertise_port
    }

    /// Contact URI this transport advertises in dialogs it creates.
    pub fn contact_uri(&self) -> String {
        format!(
            "sip:switchboard@{}:{}",
            self.advertise_addr, self.advertise_port
        )
    }

    async fn receive_loop(
        &self,
        request_tx: mpsc::UnboundedSender<IncomingRequest>,
        shutdown: CancellationToken,
    ) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, source) = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("SIP transport stopping");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "SIP recv failed");
                        continue;
                    }
                },
            };

            let raw = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(_) => {
                    warn!(source = %source, "dropping non-UTF8 datagram");
                    continue;
                }
            };
            // keep-alive CRLF
            if raw.trim().is_empty() {
                continue;
            }

            match SipMessage::parse(raw) {
                Ok(SipMessage::Request(mut request)) => {
                    trace!(method = %request.method, source = %source, "request received");
                    if let Err(e) = stamp_top_via(&mut request.headers, source) {
                        warn!(error = %e, "cannot stamp Via; dropping request");
                        continue;
                    }
                    let _ = request_tx.send(IncomingRequest { request, source });
                }
                Ok(SipMessage::Response(response)) => {
                    self.route_response(response, source);
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "unparseable SIP datagram");
                }
            }
        }
    }

    fn route_response(&self, response: SipResponse, source: SocketAddr) {
        let branch = response
            .top_via()
            .ok()
            .and_then(|via| via.branch().map(|b| b.to_string()));
        let Some(branch) = branch else {
            warn!(source = %source, "response without branch dropped");
            return;
        };

        if let Some(entry) = self.transactions.get(&branch) {
            trace!(code = response.code, branch = %branch, "response routed");
            let _ = entry.value().send(response);
        } else {
            debug!(code = response.code, branch = %branch, "response for unknown transaction");
        }
    }

    /// Send a response to its Via-derived destination, falling back to
    /// `fallback` (usually the request source).
    pub async fn send_response(
        &self,
        response: &SipResponse,
        fallback: SocketAddr,
    ) -> Result<()> {
        let dest = response
            .top_via()
            .ok()
            .and_then(|via| via.response_addr().ok())
            .unwrap_or(fallback);
        self.send_to(&response.to_string(), dest).await
    }

    /// Fire-and-forget request send (ACK). No transaction state is kept.
    pub async fn send_raw(&self, request: &SipRequest, dest: SocketAddr) -> Result<()> {
        self.send_to(&request.to_string(), dest).await
    }

    /// Send a request inside a client transaction. Responses arrive on the
    /// returned handle, matched by the Via branch. A Via is added if the
    /// caller did not provide one (CANCEL must reuse the INVITE's).
    pub fn send_request(
        self: &Arc<Self>,
        mut request: SipRequest,
        dest: SocketAddr,
    ) -> Result<ClientTransaction> {
        if request.headers.get("Via").is_none() {
            let via = Via::new(self.advertise_addr, self.advertise_port, &generate_branch());
            request.headers.push("Via", via.to_string());
        }
        let branch = request
            .top_via()?
            .branch()
            .map(|b| b.to_string())
            .ok_or_else(|| Error::sip("Request Via has no branch"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.transactions.insert(branch.clone(), tx);

        let transaction = ClientTransaction {
            branch,
            request: request.clone(),
            dest,
            rx,
            transport: Arc::clone(self),
        };

        let transport = Arc::clone(self);
        let wire = request.to_string();
        tokio::spawn(async move {
            if let Err(e) = transport.send_to(&wire, dest).await {
                warn!(error = %e, dest = %dest, "request send failed");
            }
        });

        Ok(transaction)
    }

    async fn send_to(&self, payload: &str, dest: SocketAddr) -> Result<()> {
        self.socket
            .send_to(payload.as_bytes(), dest)
            .await
            .map_err(|e| Error::transport(format!("SIP send to {} failed: {}", dest, e)))?;
        Ok(())
    }

    fn end_transaction(&self, branch: &str) {
        self.transactions.remove(branch);
    }

    /// Destination for a request: the URI's host:port.
    pub fn resolve_uri(uri: &str) -> Result<SocketAddr> {
        let parsed = SipUri::parse(uri)?;
        parsed
            .addr()
            .parse()
            .map_err(|_| Error::parse(format!("URI host is not an address: {}", parsed.host)))
    }
}

/// One in-flight client transaction. Dropping it stops response routing.
pub struct ClientTransaction {
    pub branch: String,
    pub request: SipRequest,
    pub dest: SocketAddr,
    rx: mpsc::UnboundedReceiver<SipResponse>,
    transport: Arc<SipTransport>,
}

impl ClientTransaction {
    /// Next response for this transaction (provisional or final).
    pub async fn recv(&mut self) -> Option<SipResponse> {
        self.rx.recv().await
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.transport.end_transaction(&self.branch);
    }
}
