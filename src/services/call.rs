//! Call service: lookup, dial, bridge
//!
//! The thin orchestration layer the dialplan talks to. `dial_and_bridge`
//! is the B2BUA's main move: originate a B leg co-located with the A leg,
//! join them, and ride the bridge until one side ends the call.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::protocols::sip::SipUri;
use crate::services::bridge::{Bridge, BridgeInfo};
use crate::services::leg::{Leg, LegState, TerminationCause};
use crate::services::location::LocationStore;
use crate::services::media_pool::MediaPool;
use crate::services::originator::{OriginateRequest, Originator};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub caller_id: Option<String>,
    pub caller_name: Option<String>,
    pub codecs: Vec<u8>,
}

/// Resolve a dialplan target to a dialable URI.
///
/// `user/<name>` and bare names go through the location store: first as the
/// full AOR in our domain, then by user-part scan. Complete SIP URIs pass
/// through untouched. The NAT-observed source address wins over the
/// advertised Contact when both are known.
pub fn resolve_target(location: &LocationStore, domain: &str, target: &str) -> Result<String> {
    if target.starts_with("sip:") || target.starts_with("sips:") {
        return Ok(target.to_string());
    }

    let user = target.strip_prefix("user/").unwrap_or(target);
    let aor = format!("sip:{}@{}", user, domain);

    let binding = location.lookup_one(&aor).or_else(|| {
        location.lookup_by_user(user).into_iter().max_by(|a, b| {
            let qa = a.q_value.unwrap_or(1.0);
            let qb = b.q_value.unwrap_or(1.0);
            qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    let binding = binding.ok_or(Error::NoContacts(aor))?;

    if let (Some(ip), Some(port)) = (binding.received_ip, binding.received_port) {
        let contact_user = SipUri::parse(&binding.contact_uri)
            .ok()
            .and_then(|u| u.user)
            .unwrap_or_else(|| user.to_string());
        return Ok(format!("sip:{}@{}:{}", contact_user, ip, port));
    }
    Ok(binding.contact_uri)
}

pub struct CallService {
    location: Arc<LocationStore>,
    originator: Arc<Originator>,
    media: Arc<MediaPool>,
    domain: String,
}

impl CallService {
    pub fn new(
        location: Arc<LocationStore>,
        originator: Arc<Originator>,
        media: Arc<MediaPool>,
        domain: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            location,
            originator,
            media,
            domain,
        })
    }

    pub fn originator(&self) -> &Arc<Originator> {
        &self.originator
    }

    pub fn resolve_target(&self, target: &str) -> Result<String> {
        resolve_target(&self.location, &self.domain, target)
    }

    /// Lookup, originate and wait for answer.
    pub async fn dial(
        &self,
        a_leg: Option<&Arc<Leg>>,
        target: &str,
        timeout: Duration,
        options: DialOptions,
        ctx: CancellationToken,
    ) -> Result<Arc<Leg>> {
        let target_uri = self.resolve_target(target)?;

        let request = OriginateRequest {
            target_uri,
            caller_id: options.caller_id,
            caller_name: options.caller_name,
            codecs: if options.codecs.is_empty() {
                vec![0]
            } else {
                options.codecs
            },
            timeout,
            a_leg_session_id: a_leg.and_then(|l| l.session_id()),
            a_leg_call_id: a_leg.map(|l| l.call_id.clone()),
        };

        let leg = self.originator.originate(request, ctx).await?;
        leg.wait_for_state(LegState::Answered).await?;
        Ok(leg)
    }

    /// The full B2BUA path: dial the target, bridge it to the answered A
    /// leg, wait the call out on the A leg's context.
    pub async fn dial_and_bridge(
        &self,
        ctx: CancellationToken,
        leg_a: Arc<Leg>,
        target: &str,
        timeout: Duration,
        options: DialOptions,
    ) -> Result<BridgeInfo> {
        if leg_a.state() != LegState::Answered {
            return Err(Error::invalid_state("A leg must be answered before dialing"));
        }

        let leg_b = match self
            .dial(Some(&leg_a), target, timeout, options, ctx.clone())
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                warn!(target = %target, error = %e, "dial failed");
                return Err(e);
            }
        };

        let bridge = Bridge::new(
            Arc::clone(&leg_a),
            Arc::clone(&leg_b),
            Some(Arc::clone(&self.media)),
            true,
        );
        if let Err(e) = bridge.start().await {
            warn!(bridge_id = %bridge.bridge_id, error = %e, "bridge start failed");
            let _ = leg_b.hangup(TerminationCause::Error).await;
            return Err(e);
        }

        info!(
            bridge_id = %bridge.bridge_id,
            a = %leg_a.call_id,
            b = %leg_b.call_id,
            "call bridged"
        );

        // ride the call on the A leg's context, not the dial timeout
        match bridge.wait_for_termination(ctx).await {
            Ok(cause) => {
                info!(bridge_id = %bridge.bridge_id, cause = %cause, "bridge finished");
            }
            Err(_) => {
                // the caller's context went away with the bridge still up
                let _ = bridge.stop(true).await;
            }
        }

        Ok(bridge.info())
    }
}
