//! REGISTER handling
//!
//! Maps REGISTER requests onto the location store and builds the wire
//! responses: 200 with the current binding set, 423 with Min-Expires, 400
//! for malformed wildcard use.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::protocols::sip::{NameAddr, SipRequest, SipResponse};
use crate::services::location::{Binding, LocationStore};
use crate::{Error, Result};

pub struct Registrar {
    store: Arc<LocationStore>,
    default_expires: u32,
    user_agent: String,
}

impl Registrar {
    pub fn new(store: Arc<LocationStore>, default_expires: u32, user_agent: String) -> Self {
        Self {
            store,
            default_expires,
            user_agent,
        }
    }

    pub fn store(&self) -> &Arc<LocationStore> {
        &self.store
    }

    /// Process one REGISTER; always produces a response to send.
    pub fn handle_register(&self, request: &SipRequest, source: SocketAddr) -> SipResponse {
        match self.process(request, source) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "REGISTER rejected");
                let code = match &e {
                    // stale CSeq and friends are client errors here
                    Error::InvalidState(_) => 400,
                    _ => e.sip_status(),
                };
                let mut response = SipResponse::for_request(request, code);
                if let Error::IntervalTooBrief { min_expires } = e {
                    response
                        .headers
                        .set("Min-Expires", min_expires.to_string());
                }
                self.finish(response)
            }
        }
    }

    fn process(&self, request: &SipRequest, source: SocketAddr) -> Result<SipResponse> {
        let to = request.to()?;
        let aor = to.uri.to_string();
        let header_expires = request.expires();

        let contacts = request.headers.get_all("Contact");
        let has_wildcard = contacts.iter().any(|c| c.trim() == "*");

        if has_wildcard {
            // RFC 3261 §10.2.2: '*' must travel alone with Expires: 0
            if contacts.len() > 1 || header_expires != Some(0) {
                return Err(Error::parse("Wildcard Contact requires Expires 0 and no others"));
            }
            self.store.unregister(&aor, None, true)?;
            return Ok(self.build_ok(request, &aor));
        }

        if contacts.is_empty() {
            // Query: return the current binding set untouched.
            return Ok(self.build_ok(request, &aor));
        }

        let call_id = request.call_id()?.to_string();
        let cseq = request.cseq()?.seq;
        let contacts: Vec<String> = contacts.iter().map(|c| c.to_string()).collect();

        for raw_contact in contacts {
            let contact = NameAddr::parse(&raw_contact)?;
            let contact_uri = contact.uri.to_string();
            let expires = contact
                .expires()
                .or(header_expires)
                .unwrap_or(self.default_expires);

            if expires == 0 {
                let binding_id =
                    Binding::derive_id(&contact_uri, contact.instance_id());
                self.store.unregister(&aor, Some(&binding_id), false)?;
                info!(aor = %aor, contact = %contact_uri, "binding removed");
                continue;
            }

            let binding = Binding {
                aor: aor.clone(),
                contact_uri,
                binding_id: String::new(),
                received_ip: Some(source.ip()),
                received_port: Some(source.port()),
                transport: "udp".to_string(),
                expires,
                expires_at: Utc::now(),
                q_value: contact.q_value(),
                instance_id: contact.instance_id().map(|s| s.to_string()),
                call_id: call_id.clone(),
                cseq,
                user_agent: request.headers.get("User-Agent").map(|s| s.to_string()),
                path: request
                    .headers
                    .get_all("Path")
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            };
            self.store.register(binding)?;
        }

        Ok(self.build_ok(request, &aor))
    }

    /// 200 OK carrying every current binding as a Contact header.
    fn build_ok(&self, request: &SipRequest, aor: &str) -> SipResponse {
        let mut response = SipResponse::for_request(request, 200);
        for binding in self.store.lookup(aor) {
            response.headers.push(
                "Contact",
                format!(
                    "<{}>;expires={}",
                    binding.contact_uri,
                    binding.remaining_secs()
                ),
            );
        }
        self.finish(response)
    }

    fn finish(&self, mut response: SipResponse) -> SipResponse {
        response
            .headers
            .set("Date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        response.headers.set("Server", self.user_agent.clone());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistrarConfig;
    use crate::protocols::sip::SipMessage;

    fn registrar() -> Registrar {
        let store = Arc::new(LocationStore::new(&RegistrarConfig {
            min_expires: 30,
            default_expires: 60,
            max_expires: 120,
            sweep_interval: 15,
        }));
        Registrar::new(store, 60, "Switchboard/test".to_string())
    }

    fn register_request(contact: &str, expires: Option<u32>, cseq: u32) -> SipRequest {
        let expires_line = expires
            .map(|e| format!("Expires: {}\r\n", e))
            .unwrap_or_default();
        let raw = format!(
            "REGISTER sip:switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.5:5060;branch=z9hG4bKreg{cseq}\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@switchboard.local>;tag=regtag\r\n\
To: <sip:alice@switchboard.local>\r\n\
Call-ID: reg-1\r\n\
CSeq: {cseq} REGISTER\r\n\
Contact: {contact}\r\n\
{expires_line}Content-Length: 0\r\n\r\n",
        );
        match SipMessage::parse(&raw).unwrap() {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        }
    }

    fn src() -> SocketAddr {
        "192.0.2.5:5060".parse().unwrap()
    }

    #[test]
    fn test_register_ok_with_contact() {
        let registrar = registrar();
        let request = register_request("<sip:alice@192.0.2.5:5060>", Some(60), 1);
        let response = registrar.handle_register(&request, src());
        assert_eq!(response.code, 200);
        let contact = response.headers.get("Contact").unwrap();
        assert!(contact.contains("sip:alice@192.0.2.5:5060"));
        assert!(contact.contains("expires="));
        assert!(response.headers.get("Date").unwrap().ends_with("GMT"));
    }

    #[test]
    fn test_interval_too_brief_gets_423() {
        let registrar = registrar();
        let request = register_request("<sip:alice@192.0.2.5:5060>", Some(5), 1);
        let response = registrar.handle_register(&request, src());
        assert_eq!(response.code, 423);
        assert_eq!(response.headers.get("Min-Expires"), Some("30"));
    }

    #[test]
    fn test_wildcard_unregister() {
        let registrar = registrar();
        let request = register_request("<sip:alice@192.0.2.5:5060>", Some(60), 1);
        registrar.handle_register(&request, src());
        assert_eq!(registrar.store().lookup("sip:alice@switchboard.local").len(), 1);

        let request = register_request("*", Some(0), 2);
        let response = registrar.handle_register(&request, src());
        assert_eq!(response.code, 200);
        assert!(registrar.store().lookup("sip:alice@switchboard.local").is_empty());
        assert!(response.headers.get("Contact").is_none());
    }

    #[test]
    fn test_wildcard_with_nonzero_expires_rejected() {
        let registrar = registrar();
        let request = register_request("*", Some(60), 1);
        let response = registrar.handle_register(&request, src());
        assert_eq!(response.code, 400);
    }

    #[test]
    fn test_wildcard_with_other_contacts_rejected() {
        let registrar = registrar();
        let raw = "REGISTER sip:switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.5:5060;branch=z9hG4bKw2\r\n\
From: <sip:alice@switchboard.local>;tag=t\r\n\
To: <sip:alice@switchboard.local>\r\n\
Call-ID: reg-w2\r\nCSeq: 1 REGISTER\r\n\
Contact: *\r\n\
Contact: <sip:alice@192.0.2.5:5060>\r\n\
Expires: 0\r\nContent-Length: 0\r\n\r\n";
        let request = match SipMessage::parse(raw).unwrap() {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        let response = registrar.handle_register(&request, src());
        assert_eq!(response.code, 400);
    }

    #[test]
    fn test_query_returns_snapshot() {
        let registrar = registrar();
        let request = register_request("<sip:alice@192.0.2.5:5060>", Some(60), 1);
        registrar.handle_register(&request, src());

        // REGISTER without Contact = query
        let raw = "REGISTER sip:switchboard.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.5:5060;branch=z9hG4bKq\r\n\
From: <sip:alice@switchboard.local>;tag=t\r\n\
To: <sip:alice@switchboard.local>\r\n\
Call-ID: reg-2\r\nCSeq: 1 REGISTER\r\nContent-Length: 0\r\n\r\n";
        let request = match SipMessage::parse(raw).unwrap() {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        };
        let response = registrar.handle_register(&request, src());
        assert_eq!(response.code, 200);
        assert!(response.headers.get("Contact").is_some());
    }

    #[test]
    fn test_per_contact_expires_zero_removes() {
        let registrar = registrar();
        registrar.handle_register(
            &register_request("<sip:alice@192.0.2.5:5060>", Some(60), 1),
            src(),
        );
        let response = registrar.handle_register(
            &register_request("<sip:alice@192.0.2.5:5060>;expires=0", None, 2),
            src(),
        );
        assert_eq!(response.code, 200);
        assert!(registrar.store().lookup("sip:alice@switchboard.local").is_empty());
    }

    #[test]
    fn test_stale_cseq_rejected() {
        let registrar = registrar();
        registrar.handle_register(
            &register_request("<sip:alice@192.0.2.5:5060>", Some(60), 5),
            src(),
        );
        let response = registrar.handle_register(
            &register_request("<sip:alice@192.0.2.5:5060>", Some(60), 4),
            src(),
        );
        assert_eq!(response.code, 400);
    }
}
