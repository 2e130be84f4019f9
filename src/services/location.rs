//! Registered-contact store: AOR to bindings with TTL
//!
//! Each address-of-record owns a set of bindings keyed by a stable binding
//! id (hash of contact and instance). Expiry is enforced opportunistically
//! on every read plus a periodic sweep.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RegistrarConfig;
use crate::{Error, Result};

/// One AOR-to-contact mapping.
#[derive(Debug, Clone)]
pub struct Binding {
    pub aor: String,
    pub contact_uri: String,
    pub binding_id: String,
    pub received_ip: Option<IpAddr>,
    pub received_port: Option<u16>,
    pub transport: String,
    pub expires: u32,
    pub expires_at: DateTime<Utc>,
    pub q_value: Option<f32>,
    pub instance_id: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub user_agent: Option<String>,
    pub path: Vec<String>,
}

impl Binding {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn remaining_secs(&self) -> u32 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u32
    }

    /// Stable id derived from the contact URI and instance id.
    pub fn derive_id(contact_uri: &str, instance_id: Option<&str>) -> String {
        let mut hasher = DefaultHasher::new();
        contact_uri.hash(&mut hasher);
        instance_id.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

pub struct LocationStore {
    min_expires: u32,
    max_expires: u32,
    aors: Mutex<HashMap<String, HashMap<String, Binding>>>,
}

impl LocationStore {
    pub fn new(config: &RegistrarConfig) -> Self {
        Self {
            min_expires: config.min_expires,
            max_expires: config.max_expires,
            aors: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_expires(&self) -> u32 {
        self.min_expires
    }

    /// Insert or refresh a binding. The stored binding is returned with its
    /// expiry normalised into the configured window.
    pub fn register(&self, mut binding: Binding) -> Result<Binding> {
        if binding.aor.is_empty() {
            return Err(Error::parse("Registration without AOR"));
        }
        if binding.contact_uri.is_empty() {
            return Err(Error::parse("Registration without Contact"));
        }

        if binding.expires < self.min_expires {
            return Err(Error::IntervalTooBrief {
                min_expires: self.min_expires,
            });
        }
        binding.expires = binding.expires.min(self.max_expires);
        binding.expires_at = Utc::now() + chrono::Duration::seconds(binding.expires as i64);

        if binding.binding_id.is_empty() {
            binding.binding_id =
                Binding::derive_id(&binding.contact_uri, binding.instance_id.as_deref());
        }

        let mut aors = self.aors.lock().unwrap();
        let bindings = aors.entry(binding.aor.clone()).or_default();

        if let Some(existing) = bindings.get(&binding.binding_id) {
            // Same dialog refreshing: CSeq must strictly increase.
            if !existing.is_expired()
                && existing.call_id == binding.call_id
                && binding.cseq <= existing.cseq
            {
                return Err(Error::invalid_state(format!(
                    "Stale REGISTER CSeq {} (have {}) for {}",
                    binding.cseq, existing.cseq, binding.aor
                )));
            }
        }

        info!(
            aor = %binding.aor,
            contact = %binding.contact_uri,
            expires = binding.expires,
            "binding registered"
        );
        bindings.insert(binding.binding_id.clone(), binding.clone());
        Ok(binding)
    }

    /// Remove a single binding, or the whole AOR with `wildcard`.
    pub fn unregister(&self, aor: &str, binding_id: Option<&str>, wildcard: bool) -> Result<()> {
        let mut aors = self.aors.lock().unwrap();
        if wildcard {
            aors.remove(aor);
            info!(aor = %aor, "all bindings removed");
            return Ok(());
        }

        if let Some(bindings) = aors.get_mut(aor) {
            if let Some(id) = binding_id {
                bindings.remove(id);
                if bindings.is_empty() {
                    aors.remove(aor);
                }
            }
        }
        Ok(())
    }

    /// All live bindings for an AOR. Expired entries are pruned on the way.
    pub fn lookup(&self, aor: &str) -> Vec<Binding> {
        let mut aors = self.aors.lock().unwrap();
        let Some(bindings) = aors.get_mut(aor) else {
            return Vec::new();
        };
        bindings.retain(|_, b| !b.is_expired());
        let result: Vec<Binding> = bindings.values().cloned().collect();
        if bindings.is_empty() {
            aors.remove(aor);
        }
        result
    }

    /// The preferred binding: highest q-value, default 1.0 when unset.
    pub fn lookup_one(&self, aor: &str) -> Option<Binding> {
        self.lookup(aor)
            .into_iter()
            .max_by(|a, b| {
                let qa = a.q_value.unwrap_or(1.0);
                let qb = b.q_value.unwrap_or(1.0);
                qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Scan every AOR for URIs whose user part matches. Used when a dialed
    /// extension does not resolve as a full AOR.
    pub fn lookup_by_user(&self, user: &str) -> Vec<Binding> {
        let aors: Vec<String> = self.aors.lock().unwrap().keys().cloned().collect();
        let needle = format!("sip:{}@", user);
        aors.iter()
            .filter(|aor| aor.starts_with(&needle))
            .flat_map(|aor| self.lookup(aor))
            .collect()
    }

    pub fn aor_count(&self) -> usize {
        self.aors.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<Binding> {
        let aors: Vec<String> = self.aors.lock().unwrap().keys().cloned().collect();
        aors.iter().flat_map(|aor| self.lookup(aor)).collect()
    }

    fn sweep(&self) {
        let mut aors = self.aors.lock().unwrap();
        aors.retain(|aor, bindings| {
            bindings.retain(|_, b| {
                if b.is_expired() {
                    debug!(aor = %aor, contact = %b.contact_uri, "binding expired");
                    false
                } else {
                    true
                }
            });
            !bindings.is_empty()
        });
    }
}

/// Periodic expired-binding sweeper.
pub fn spawn_sweeper(store: Arc<LocationStore>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => store.sweep(),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocationStore {
        LocationStore::new(&RegistrarConfig {
            min_expires: 30,
            default_expires: 60,
            max_expires: 120,
            sweep_interval: 15,
        })
    }

    fn binding(aor: &str, contact: &str, call_id: &str, cseq: u32, expires: u32) -> Binding {
        Binding {
            aor: aor.to_string(),
            contact_uri: contact.to_string(),
            binding_id: String::new(),
            received_ip: None,
            received_port: None,
            transport: "udp".to_string(),
            expires,
            expires_at: Utc::now(),
            q_value: None,
            instance_id: None,
            call_id: call_id.to_string(),
            cseq,
            user_agent: None,
            path: Vec::new(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let store = store();
        let stored = store
            .register(binding("sip:alice@sb", "sip:alice@192.0.2.5:5060", "r1", 1, 60))
            .unwrap();
        assert!(!stored.binding_id.is_empty());
        assert_eq!(stored.expires, 60);

        let found = store.lookup("sip:alice@sb");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].contact_uri, "sip:alice@192.0.2.5:5060");
        assert!(found[0].remaining_secs() > 50);
    }

    #[test]
    fn test_interval_too_brief() {
        let store = store();
        let err = store
            .register(binding("sip:a@sb", "sip:a@1.2.3.4", "r1", 1, 5))
            .unwrap_err();
        assert!(matches!(err, Error::IntervalTooBrief { min_expires: 30 }));
    }

    #[test]
    fn test_expires_clamped_to_max() {
        let store = store();
        let stored = store
            .register(binding("sip:a@sb", "sip:a@1.2.3.4", "r1", 1, 3600))
            .unwrap();
        assert_eq!(stored.expires, 120);
    }

    #[test]
    fn test_cseq_must_increase_within_call() {
        let store = store();
        store
            .register(binding("sip:a@sb", "sip:a@1.2.3.4", "r1", 5, 60))
            .unwrap();
        // same call-id, lower CSeq: rejected
        assert!(store
            .register(binding("sip:a@sb", "sip:a@1.2.3.4", "r1", 5, 60))
            .is_err());
        // higher CSeq: fine
        store
            .register(binding("sip:a@sb", "sip:a@1.2.3.4", "r1", 6, 60))
            .unwrap();
        // new call-id (reboot): CSeq restarts
        store
            .register(binding("sip:a@sb", "sip:a@1.2.3.4", "r2", 1, 60))
            .unwrap();
    }

    #[test]
    fn test_unregister_and_wildcard() {
        let store = store();
        let b1 = store
            .register(binding("sip:a@sb", "sip:a@1.1.1.1", "r1", 1, 60))
            .unwrap();
        store
            .register(binding("sip:a@sb", "sip:a@2.2.2.2", "r2", 1, 60))
            .unwrap();
        assert_eq!(store.lookup("sip:a@sb").len(), 2);

        store.unregister("sip:a@sb", Some(&b1.binding_id), false).unwrap();
        assert_eq!(store.lookup("sip:a@sb").len(), 1);

        store.unregister("sip:a@sb", None, true).unwrap();
        assert!(store.lookup("sip:a@sb").is_empty());

        // idempotent
        store.unregister("sip:a@sb", None, true).unwrap();
    }

    #[test]
    fn test_lookup_one_prefers_q() {
        let store = store();
        let mut low = binding("sip:a@sb", "sip:a@1.1.1.1", "r1", 1, 60);
        low.q_value = Some(0.2);
        store.register(low).unwrap();
        // unset q defaults to 1.0 and wins
        store
            .register(binding("sip:a@sb", "sip:a@2.2.2.2", "r2", 1, 60))
            .unwrap();

        let best = store.lookup_one("sip:a@sb").unwrap();
        assert_eq!(best.contact_uri, "sip:a@2.2.2.2");
    }

    #[test]
    fn test_lookup_by_user() {
        let store = store();
        store
            .register(binding("sip:bob@sb", "sip:bob@3.3.3.3:5070", "r1", 1, 60))
            .unwrap();
        let found = store.lookup_by_user("bob");
        assert_eq!(found.len(), 1);
        assert!(store.lookup_by_user("carol").is_empty());
    }

    #[test]
    fn test_expired_bindings_invisible() {
        let store = store();
        let mut b = binding("sip:a@sb", "sip:a@1.1.1.1", "r1", 1, 60);
        b.binding_id = "fixed".to_string();
        let mut stored = store.register(b).unwrap();
        // force expiry
        stored.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store
            .aors
            .lock()
            .unwrap()
            .get_mut("sip:a@sb")
            .unwrap()
            .insert("fixed".to_string(), stored);

        assert!(store.lookup("sip:a@sb").is_empty());
        assert_eq!(store.aor_count(), 0);
    }
}
