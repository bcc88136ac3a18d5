// Registrar: address-of-record → contact bindings with expiry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::sip::uri::SipUri;

/// One registered contact.
///
/// `source` is the real datagram origin of the REGISTER; together with the
/// contact URI it identifies the binding for refreshes. call_id/cseq/
/// user_agent ride along for CDR reporting.
#[derive(Debug, Clone)]
pub struct Binding {
    pub contact: SipUri,
    pub source: SocketAddr,
    pub expires_at: Instant,
    pub call_id: String,
    pub cseq: String,
    pub user_agent: String,
}

impl Binding {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn matches(&self, contact: &SipUri, source: SocketAddr) -> bool {
        self.contact == *contact && self.source == source
    }
}

/// In-memory location table. Binding lists keep creation order; "first
/// active binding" is the target-selection policy.
pub struct Registrar {
    bindings: DashMap<String, Vec<Binding>>,
}

impl Registrar {
    pub fn new() -> Self {
        Registrar {
            bindings: DashMap::new(),
        }
    }

    /// Insert or refresh a binding. A binding with the same contact URI and
    /// source endpoint is refreshed in place; anything else appends.
    pub fn upsert(&self, aor: &str, binding: Binding) {
        let mut list = self.bindings.entry(aor.to_string()).or_default();
        match list
            .iter_mut()
            .find(|b| b.matches(&binding.contact, binding.source))
        {
            Some(existing) => *existing = binding,
            None => list.push(binding),
        }
    }

    /// Remove one binding (expires=0 deregistration). Removing the last
    /// binding removes the AOR. Returns true when something was removed.
    pub fn remove(&self, aor: &str, contact: &SipUri, source: SocketAddr) -> bool {
        let removed = match self.bindings.get_mut(aor) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|b| !b.matches(contact, source));
                before != list.len()
            }
            None => return false,
        };
        self.bindings.remove_if(aor, |_, list| list.is_empty());
        removed
    }

    /// All bindings for an AOR that are still alive, in creation order.
    pub fn active_bindings(&self, aor: &str, now: Instant) -> Vec<Binding> {
        self.bindings
            .get(aor)
            .map(|list| {
                list.iter()
                    .filter(|b| b.is_active(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First active binding: the forwarding target for this AOR.
    pub fn lookup(&self, aor: &str, now: Instant) -> Option<Binding> {
        self.active_bindings(aor, now).into_iter().next()
    }

    /// Drop every expired binding and every emptied AOR. Returns the number
    /// of bindings removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.bindings.retain(|_, list| {
            let before = list.len();
            list.retain(|b| b.is_active(now));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn aor_count(&self) -> usize {
        self.bindings.len()
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}
