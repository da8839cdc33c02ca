//! Participant registry: who is present, and what to call them

use std::collections::HashMap;
use std::time::Instant;

use crate::signaling::protocol::{ClientId, ParticipantEntry};

/// Display name used for participants that never announced one
pub const ANONYMOUS: &str = "Anonymous";

/// One present participant
#[derive(Debug, Clone)]
pub struct Participant {
    /// Relay-assigned id
    pub id: ClientId,

    /// Refreshed on every sighting of the id, chat frames included
    pub last_seen_at: Instant,
}

/// Which client ids are currently in the room, plus their display names.
///
/// Presence entries keep insertion order, at most one per id. Roster
/// snapshots are merged additively: unseen ids are inserted and names
/// merged, but entries absent from a snapshot are kept. Removal happens
/// only on presence-leave. Display names are never removed, so a name
/// learned once keeps labelling old chat lines after its owner left.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: Vec<Participant>,
    display_names: HashMap<ClientId, String>,
}

impl ParticipantRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` or refresh its last-seen time. Returns true when the
    /// participant is new.
    pub fn upsert(&mut self, id: &ClientId) -> bool {
        if let Some(existing) = self.participants.iter_mut().find(|p| &p.id == id) {
            existing.last_seen_at = Instant::now();
            return false;
        }
        self.participants.push(Participant {
            id: id.clone(),
            last_seen_at: Instant::now(),
        });
        true
    }

    /// Remove `id`. Returns true when it was present.
    pub fn remove(&mut self, id: &ClientId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| &p.id != id);
        self.participants.len() != before
    }

    /// Merge a roster snapshot: upsert every listed id and merge its
    /// display name. Entries not listed are left alone.
    pub fn merge_snapshot(&mut self, entries: &[ParticipantEntry]) {
        for entry in entries {
            self.upsert(&entry.id);
            if let Some(name) = &entry.display_name {
                self.set_name(&entry.id, name);
            }
        }
    }

    /// Record a display name for `id`. Blank names are ignored.
    pub fn set_name(&mut self, id: &ClientId, name: &str) {
        let name = name.trim();
        if !name.is_empty() {
            self.display_names.insert(id.clone(), name.to_string());
        }
    }

    /// Display name for `id`, defaulting to [`ANONYMOUS`]
    pub fn name_of(&self, id: &ClientId) -> &str {
        self.display_names
            .get(id)
            .map(String::as_str)
            .unwrap_or(ANONYMOUS)
    }

    /// Whether `id` is present
    pub fn contains(&self, id: &ClientId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    /// All present ids, in insertion order
    pub fn list(&self) -> Vec<ClientId> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    /// All present participants, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    /// Ids every peer link should exist for: all present except `local`
    pub fn desired_peers(&self, local: &ClientId) -> Vec<ClientId> {
        self.participants
            .iter()
            .filter(|p| &p.id != local)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Number of present participants
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether the room looks empty from here
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ClientId {
        ClientId::from(s)
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut registry = ParticipantRegistry::new();
        assert!(registry.upsert(&id("a3")));
        assert!(!registry.upsert(&id("a3")));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id("a3")));
    }

    #[test]
    fn test_remove() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&id("a3"));
        assert!(registry.remove(&id("a3")));
        assert!(!registry.remove(&id("a3")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_merge_is_additive() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&id("a3"));

        // A snapshot that does not list a3 must not remove it
        registry.merge_snapshot(&[
            ParticipantEntry {
                id: id("b7"),
                display_name: Some("Bea".to_string()),
            },
            ParticipantEntry {
                id: id("z9"),
                display_name: None,
            },
        ]);

        assert_eq!(registry.list(), vec![id("a3"), id("b7"), id("z9")]);
        assert_eq!(registry.name_of(&id("b7")), "Bea");
        assert_eq!(registry.name_of(&id("z9")), ANONYMOUS);
    }

    #[test]
    fn test_snapshot_merge_refreshes_existing() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&id("b7"));
        registry.merge_snapshot(&[ParticipantEntry {
            id: id("b7"),
            display_name: Some("Bea".to_string()),
        }]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.name_of(&id("b7")), "Bea");
    }

    #[test]
    fn test_name_of_defaults_to_anonymous() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&id("a3"));
        assert_eq!(registry.name_of(&id("a3")), ANONYMOUS);

        registry.set_name(&id("a3"), "Ada");
        assert_eq!(registry.name_of(&id("a3")), "Ada");
    }

    #[test]
    fn test_blank_names_are_ignored() {
        let mut registry = ParticipantRegistry::new();
        registry.set_name(&id("a3"), "   ");
        assert_eq!(registry.name_of(&id("a3")), ANONYMOUS);
    }

    #[test]
    fn test_names_survive_leave() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&id("b7"));
        registry.set_name(&id("b7"), "Bea");
        registry.remove(&id("b7"));
        assert_eq!(registry.name_of(&id("b7")), "Bea");
    }

    #[test]
    fn test_desired_peers_excludes_local() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&id("a3"));
        registry.upsert(&id("b7"));
        registry.upsert(&id("z9"));

        assert_eq!(registry.desired_peers(&id("a3")), vec![id("b7"), id("z9")]);
        assert_eq!(registry.desired_peers(&id("q1")), vec![id("a3"), id("b7"), id("z9")]);
    }
}
