//! Participant presence projection (name, avatar, media flags per user).

use std::collections::HashMap;

use crate::models::{Identity, ParticipantPresenceInfo};

#[derive(Debug, Default)]
pub struct PresenceProjection {
    entries: HashMap<String, ParticipantPresenceInfo>,
}

impl PresenceProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry or refresh its identity, keeping the media flags.
    pub fn upsert_identity(&mut self, identity: &Identity) {
        match self.entries.get_mut(&identity.user_id) {
            Some(entry) => {
                if identity.display_name.is_some() {
                    entry.display_name = identity.display_name.clone();
                }
                if identity.avatar.is_some() {
                    entry.avatar = identity.avatar.clone();
                }
            }
            None => {
                self.entries.insert(
                    identity.user_id.clone(),
                    ParticipantPresenceInfo::from_identity(identity),
                );
            }
        }
    }

    fn entry(&mut self, user_id: &str) -> &mut ParticipantPresenceInfo {
        self.entries
            .entry(user_id.to_string())
            .or_insert_with(|| ParticipantPresenceInfo::from_identity(&Identity::new(user_id)))
    }

    pub fn set_muted(&mut self, user_id: &str, muted: bool) {
        self.entry(user_id).is_muted = muted;
    }

    pub fn set_video_off(&mut self, user_id: &str, video_off: bool) {
        self.entry(user_id).is_video_off = video_off;
    }

    pub fn set_screen_sharing(&mut self, user_id: &str, sharing: bool) {
        self.entry(user_id).is_screen_sharing = sharing;
    }

    pub fn get(&self, user_id: &str) -> Option<&ParticipantPresenceInfo> {
        self.entries.get(user_id)
    }

    pub fn remove(&mut self, user_id: &str) -> Option<ParticipantPresenceInfo> {
        self.entries.remove(user_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by user id.
    pub fn list(&self) -> Vec<ParticipantPresenceInfo> {
        let mut list: Vec<ParticipantPresenceInfo> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_refresh_keeps_flags() {
        let mut presence = PresenceProjection::new();
        presence.set_muted("bob", true);

        presence.upsert_identity(&Identity {
            user_id: "bob".into(),
            display_name: Some("Bob".into()),
            avatar: None,
        });

        let bob = presence.get("bob").unwrap();
        assert!(bob.is_muted);
        assert_eq!(bob.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_list_is_sorted() {
        let mut presence = PresenceProjection::new();
        presence.upsert_identity(&Identity::new("carol"));
        presence.upsert_identity(&Identity::new("bob"));

        let ids: Vec<String> = presence.list().into_iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec!["bob", "carol"]);
        presence.remove("bob");
        assert_eq!(presence.len(), 1);
    }
}
