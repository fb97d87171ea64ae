//! Per-kind activator placement strategies
//!
//! TigerStyle: Explicit state owned by the topology tracker, never
//! ambient statics. Each cluster instance has its own registry.
//!
//! When a partition owner needs a member to spawn an actor on, it asks
//! the kind registry. Selection is round-robin over the members hosting
//! the kind, stable-ordered by member id.

use selkie_core::{Member, MemberId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Members able to host one actor kind
#[derive(Debug, Default)]
struct KindMembers {
    /// Members hosting this kind, sorted by id for stable ordering
    members: Vec<Member>,
    /// Round-robin cursor
    cursor: AtomicUsize,
}

impl KindMembers {
    fn insert(&mut self, member: Member) {
        if self.members.iter().any(|m| m.id == member.id) {
            return;
        }
        self.members.push(member);
        self.members.sort_by(|a, b| a.id.cmp(&b.id));
    }

    fn remove(&mut self, member_id: &MemberId) {
        self.members.retain(|m| &m.id != member_id);
    }

    fn select(&self) -> Option<Member> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % self.members.len();
        Some(self.members[idx].clone())
    }
}

/// Registry of per-kind placement strategies
///
/// Thread-safe; shared by handle between the topology tracker (which
/// registers and unregisters members) and the lookup components (which
/// select activators).
#[derive(Debug, Default)]
pub struct KindRegistry {
    kinds: RwLock<HashMap<String, KindMembers>>,
}

impl KindRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a joined member under every kind it hosts
    pub fn register_member(&self, member: &Member) {
        let mut kinds = self.kinds.write().expect("kind registry poisoned");
        for kind in &member.kinds {
            kinds
                .entry(kind.clone())
                .or_default()
                .insert(member.clone());
        }
    }

    /// Remove a left member from every kind strategy
    pub fn unregister_member(&self, member_id: &MemberId) {
        let mut kinds = self.kinds.write().expect("kind registry poisoned");
        for entry in kinds.values_mut() {
            entry.remove(member_id);
        }
        kinds.retain(|_, entry| !entry.members.is_empty());
    }

    /// Select an activator member for the given kind
    ///
    /// Returns `None` when no member hosts the kind.
    pub fn select_for_kind(&self, kind: &str) -> Option<Member> {
        let kinds = self.kinds.read().expect("kind registry poisoned");
        kinds.get(kind).and_then(|entry| entry.select())
    }

    /// Members currently registered for a kind (ordered by id)
    pub fn members_for_kind(&self, kind: &str) -> Vec<Member> {
        let kinds = self.kinds.read().expect("kind registry poisoned");
        kinds
            .get(kind)
            .map(|entry| entry.members.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_member(n: u32, kinds: &[&str]) -> Member {
        Member::new(
            MemberId::new(format!("member-{}", n)).unwrap(),
            "127.0.0.1",
            8000 + n as u16,
            kinds.iter().map(|k| k.to_string()),
        )
    }

    #[test]
    fn test_select_unknown_kind() {
        let registry = KindRegistry::new();
        assert!(registry.select_for_kind("order").is_none());
    }

    #[test]
    fn test_round_robin_cycles() {
        let registry = KindRegistry::new();
        registry.register_member(&test_member(1, &["order"]));
        registry.register_member(&test_member(2, &["order"]));
        registry.register_member(&test_member(3, &["order"]));

        let mut selected = Vec::new();
        for _ in 0..6 {
            selected.push(registry.select_for_kind("order").unwrap().id);
        }

        // Stable order by member id, wrapping
        assert_eq!(selected[0].as_str(), "member-1");
        assert_eq!(selected[1].as_str(), "member-2");
        assert_eq!(selected[2].as_str(), "member-3");
        assert_eq!(selected[3].as_str(), "member-1");
        assert_eq!(selected[4].as_str(), "member-2");
        assert_eq!(selected[5].as_str(), "member-3");
    }

    #[test]
    fn test_selection_respects_kind() {
        let registry = KindRegistry::new();
        registry.register_member(&test_member(1, &["order"]));
        registry.register_member(&test_member(2, &["player"]));

        assert_eq!(
            registry.select_for_kind("player").unwrap().id.as_str(),
            "member-2"
        );
        assert!(registry.select_for_kind("invoice").is_none());
    }

    #[test]
    fn test_unregister_removes_from_all_kinds() {
        let registry = KindRegistry::new();
        registry.register_member(&test_member(1, &["order", "player"]));
        registry.register_member(&test_member(2, &["order"]));

        registry.unregister_member(&MemberId::new("member-1").unwrap());

        assert!(registry.select_for_kind("player").is_none());
        assert_eq!(
            registry.select_for_kind("order").unwrap().id.as_str(),
            "member-2"
        );
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = KindRegistry::new();
        let member = test_member(1, &["order"]);
        registry.register_member(&member);
        registry.register_member(&member);

        assert_eq!(registry.members_for_kind("order").len(), 1);
    }
}
