// Dialog and transaction shortcut state, all keyed by Call-ID.
//
// Three independent tables, one lock scope each; no operation touches two
// tables under one lock. Every touch refreshes last_activity so the timer
// sweep can retire stale entries.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Dialog lifecycle: early on INVITE forward, confirmed on 2xx,
/// terminating once a BYE is seen, removed on 200-BYE / terminal failure /
/// idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminating,
}

/// One live call leg pair.
#[derive(Debug, Clone)]
pub struct DialogEntry {
    pub caller: SocketAddr,
    pub callee: SocketAddr,
    pub state: DialogState,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// Call-ID → dialog context.
pub struct DialogTable {
    entries: DashMap<String, DialogEntry>,
}

impl DialogTable {
    pub fn new() -> Self {
        DialogTable {
            entries: DashMap::new(),
        }
    }

    /// Create the dialog for a freshly forwarded initial INVITE.
    pub fn insert(&self, call_id: &str, caller: SocketAddr, callee: SocketAddr) {
        let now = Instant::now();
        self.entries.insert(
            call_id.to_string(),
            DialogEntry {
                caller,
                callee,
                state: DialogState::Early,
                created_at: now,
                last_activity: now,
            },
        );
    }

    pub fn get(&self, call_id: &str) -> Option<DialogEntry> {
        self.entries.get(call_id).map(|e| e.clone())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.entries.contains_key(call_id)
    }

    /// Update state and refresh activity.
    pub fn set_state(&self, call_id: &str, state: DialogState) -> bool {
        match self.entries.get_mut(call_id) {
            Some(mut entry) => {
                entry.state = state;
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Refresh activity on any in-dialog traffic.
    pub fn touch(&self, call_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(call_id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn remove(&self, call_id: &str) -> Option<DialogEntry> {
        self.entries.remove(call_id).map(|(_, e)| e)
    }

    /// Remove dialogs idle longer than `max_idle`; the removed entries are
    /// returned so the caller can emit timeout CDRs.
    pub fn sweep_idle(&self, max_idle: Duration, now: Instant) -> Vec<(String, DialogEntry)> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.last_activity) > max_idle)
            .map(|e| e.key().clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|call_id| self.entries.remove(&call_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DialogTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Source endpoint of the most recent forwarded request per Call-ID, used
/// to route responses whose Via trail no longer reaches back.
pub struct PendingTable {
    entries: DashMap<String, (SocketAddr, Instant)>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            entries: DashMap::new(),
        }
    }

    /// Record (or overwrite) the requester for this Call-ID.
    pub fn insert(&self, call_id: &str, source: SocketAddr) {
        self.entries
            .insert(call_id.to_string(), (source, Instant::now()));
    }

    pub fn get(&self, call_id: &str) -> Option<SocketAddr> {
        self.entries.get(call_id).map(|e| e.0)
    }

    pub fn remove(&self, call_id: &str) {
        self.entries.remove(call_id);
    }

    pub fn sweep_older_than(&self, max_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, created)| now.duration_since(*created) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-Via branch of each forwarded INVITE, kept so a later CANCEL can reuse
/// it and match the downstream server transaction.
pub struct BranchTable {
    entries: DashMap<String, (String, Instant)>,
}

impl BranchTable {
    pub fn new() -> Self {
        BranchTable {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, call_id: &str, branch: &str) {
        self.entries
            .insert(call_id.to_string(), (branch.to_string(), Instant::now()));
    }

    pub fn get(&self, call_id: &str) -> Option<String> {
        self.entries.get(call_id).map(|e| e.0.clone())
    }

    pub fn remove(&self, call_id: &str) {
        self.entries.remove(call_id);
    }

    pub fn sweep_older_than(&self, max_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, created)| now.duration_since(*created) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for BranchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> SocketAddr {
        "10.0.0.2:5062".parse().unwrap()
    }

    fn callee() -> SocketAddr {
        "10.0.0.3:5064".parse().unwrap()
    }

    #[test]
    fn dialog_insert_starts_early() {
        let table = DialogTable::new();
        table.insert("call-1", caller(), callee());
        let entry = table.get("call-1").unwrap();
        assert_eq!(entry.state, DialogState::Early);
        assert_eq!(entry.caller, caller());
        assert_eq!(entry.callee, callee());
    }

    #[test]
    fn dialog_state_transitions() {
        let table = DialogTable::new();
        table.insert("call-1", caller(), callee());
        assert!(table.set_state("call-1", DialogState::Confirmed));
        assert_eq!(table.get("call-1").unwrap().state, DialogState::Confirmed);
        assert!(table.set_state("call-1", DialogState::Terminating));
        assert_eq!(table.get("call-1").unwrap().state, DialogState::Terminating);
    }

    #[test]
    fn dialog_set_state_on_missing_returns_false() {
        let table = DialogTable::new();
        assert!(!table.set_state("nope", DialogState::Confirmed));
    }

    #[test]
    fn dialog_remove_returns_entry_once() {
        let table = DialogTable::new();
        table.insert("call-1", caller(), callee());
        assert!(table.remove("call-1").is_some());
        assert!(table.remove("call-1").is_none());
        assert!(!table.contains("call-1"));
    }

    #[test]
    fn dialog_reinsert_replaces() {
        let table = DialogTable::new();
        table.insert("call-1", caller(), callee());
        table.set_state("call-1", DialogState::Confirmed);
        table.insert("call-1", caller(), callee());
        assert_eq!(table.get("call-1").unwrap().state, DialogState::Early);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dialog_sweep_removes_only_idle() {
        let table = DialogTable::new();
        table.insert("old", caller(), callee());
        table.insert("fresh", caller(), callee());
        // Backdate "old" by sweeping with a future now and a window that
        // only "fresh" survives after touching it later.
        let removed = table.sweep_idle(
            Duration::from_secs(3600),
            Instant::now() + Duration::from_secs(3601),
        );
        assert_eq!(removed.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn dialog_touch_defers_sweep() {
        let table = DialogTable::new();
        table.insert("call-1", caller(), callee());
        let now = Instant::now();
        table.touch("call-1");
        let removed = table.sweep_idle(Duration::from_secs(3600), now);
        assert!(removed.is_empty());
        assert!(table.contains("call-1"));
    }

    #[test]
    fn pending_insert_overwrites() {
        let table = PendingTable::new();
        table.insert("call-1", caller());
        table.insert("call-1", callee());
        assert_eq!(table.get("call-1"), Some(callee()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pending_remove_and_miss() {
        let table = PendingTable::new();
        table.insert("call-1", caller());
        table.remove("call-1");
        assert_eq!(table.get("call-1"), None);
    }

    #[test]
    fn pending_sweep_by_age() {
        let table = PendingTable::new();
        table.insert("call-1", caller());
        let removed = table.sweep_older_than(
            Duration::from_secs(300),
            Instant::now() + Duration::from_secs(301),
        );
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn branch_store_and_consume() {
        let table = BranchTable::new();
        table.insert("call-1", "z9hG4bK-abc123");
        assert_eq!(table.get("call-1").as_deref(), Some("z9hG4bK-abc123"));
        table.remove("call-1");
        assert_eq!(table.get("call-1"), None);
    }

    #[test]
    fn branch_sweep_by_age() {
        let table = BranchTable::new();
        table.insert("call-1", "z9hG4bK-abc123");
        let removed = table.sweep_older_than(
            Duration::from_secs(60),
            Instant::now() + Duration::from_secs(61),
        );
        assert_eq!(removed, 1);
    }
}
