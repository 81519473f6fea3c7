//! Room membership and event routing for live calls.
//!
//! The registry is plain data. Each operation checks the sender against the
//! room, updates the call record and returns what must be delivered to whom;
//! the websocket layer does the sending and the persistence.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::models::{
    AcceptAck, AddParticipantAck, Call, CallType, Identity, InitiateAck, ParticipantEntry,
    ParticipantStatus, ServerEvent,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub user_id: String,
    pub event: ServerEvent,
}

/// Result of a registry operation: the ack value, the events to push and
/// every call record that changed.
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub deliveries: Vec<Delivery>,
    pub records: Vec<Call>,
}

impl<T> Outcome<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            deliveries: Vec::new(),
            records: Vec::new(),
        }
    }

    fn send(&mut self, user_id: &str, event: ServerEvent) {
        self.deliveries.push(Delivery {
            user_id: user_id.to_string(),
            event,
        });
    }

    fn send_all(&mut self, user_ids: &[String], event: &ServerEvent) {
        for user_id in user_ids {
            self.send(user_id, event.clone());
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            deliveries: self.deliveries,
            records: self.records,
        }
    }
}

struct Invite {
    at: i64,
    by: Identity,
}

struct Room {
    call: Call,
    identities: HashMap<String, Identity>,
    invites: HashMap<String, Invite>,
}

impl Room {
    fn joined(&self) -> Vec<String> {
        self.call.ids_with(|s| s == ParticipantStatus::Joined)
    }

    fn joined_except(&self, user_id: &str) -> Vec<String> {
        let mut ids = self.joined();
        ids.retain(|id| id != user_id);
        ids
    }

    fn pending(&self) -> Vec<String> {
        self.call.ids_with(|s| s.is_pending())
    }

    fn require_joined(&self, user_id: &str) -> RelayResult<()> {
        match self.call.status_of(user_id) {
            Some(ParticipantStatus::Joined) => Ok(()),
            _ => Err(RelayError::NotAMember),
        }
    }

    fn set_status(&mut self, user_id: &str, status: ParticipantStatus, now: i64) {
        let Some(entry) = self.call.participant_mut(user_id) else {
            return;
        };
        entry.status = status;
        match status {
            ParticipantStatus::Joined => entry.joined_at = Some(now),
            ParticipantStatus::Left | ParticipantStatus::Rejected => entry.left_at = Some(now),
            _ => {}
        }

        if status == ParticipantStatus::Joined
            && self.call.connected_at.is_none()
            && self.call.joined_count() >= 2
        {
            self.call.connected_at = Some(now);
        }
        if status != ParticipantStatus::Ringing && status != ParticipantStatus::Invited {
            self.invites.remove(user_id);
        }
    }

    fn invite(&mut self, user_id: &str, by: &Identity, online: bool, now: i64) {
        let status = if online {
            ParticipantStatus::Ringing
        } else {
            ParticipantStatus::Invited
        };
        self.call.participants.push(ParticipantEntry {
            user_id: user_id.to_string(),
            status,
            joined_at: None,
            left_at: None,
        });
        self.invites.insert(
            user_id.to_string(),
            Invite {
                at: now,
                by: by.clone(),
            },
        );
    }

    fn incoming_for(&self, user_id: &str) -> ServerEvent {
        let caller = self
            .invites
            .get(user_id)
            .map(|invite| invite.by.clone())
            .or_else(|| self.identities.get(&self.call.initiator_id).cloned())
            .unwrap_or_else(|| Identity::new(&self.call.initiator_id));
        ServerEvent::Incoming {
            call: self.call.clone(),
            caller,
        }
    }
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    max_participants: usize,
}

impl RoomRegistry {
    pub fn new(max_participants: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_participants: max_participants.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn call(&self, room_id: &str) -> Option<&Call> {
        self.rooms.get(room_id).map(|room| &room.call)
    }

    fn room(&self, room_id: &str) -> RelayResult<&Room> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| RelayError::UnknownRoom(room_id.to_string()))
    }

    fn room_mut(&mut self, room_id: &str) -> RelayResult<&mut Room> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| RelayError::UnknownRoom(room_id.to_string()))
    }

    /// Open a room with the caller joined and every target invited. Online
    /// targets ring right away; the rest are reported back as offline.
    pub fn initiate(
        &mut self,
        caller: Identity,
        target_ids: &[String],
        call_type: CallType,
        is_online: impl Fn(&str) -> bool,
        now: i64,
    ) -> RelayResult<Outcome<InitiateAck>> {
        let mut targets: Vec<&String> = Vec::new();
        for id in target_ids {
            if !targets.contains(&id) {
                targets.push(id);
            }
        }
        if targets.is_empty() {
            return Err(RelayError::NoTargets);
        }
        if targets.iter().any(|id| **id == caller.user_id) {
            return Err(RelayError::SelfTarget);
        }
        if targets.len() + 1 > self.max_participants {
            return Err(RelayError::RoomFull(self.max_participants));
        }

        let room_id = Uuid::new_v4().to_string();
        let mut room = Room {
            call: Call {
                call_id: Uuid::new_v4().to_string(),
                room_id: room_id.clone(),
                call_type,
                initiator_id: caller.user_id.clone(),
                participants: vec![ParticipantEntry {
                    user_id: caller.user_id.clone(),
                    status: ParticipantStatus::Joined,
                    joined_at: Some(now),
                    left_at: None,
                }],
                created_at: now,
                connected_at: None,
                ended_at: None,
            },
            identities: HashMap::from([(caller.user_id.clone(), caller.clone())]),
            invites: HashMap::new(),
        };

        let mut offline_targets = Vec::new();
        for target in &targets {
            let online = is_online(target);
            room.invite(target, &caller, online, now);
            if !online {
                offline_targets.push(target.to_string());
            }
        }

        let mut out = Outcome::new(InitiateAck {
            call: room.call.clone(),
            room_id: room_id.clone(),
            offline_targets,
        });
        for target in room.call.ids_with(|s| s == ParticipantStatus::Ringing) {
            out.send(&target, room.incoming_for(&target));
        }
        out.records.push(room.call.clone());
        self.rooms.insert(room_id, room);
        Ok(out)
    }

    /// Join a call the user was invited to. Already joined members learn
    /// about the newcomer and offer to it; the newcomer gets a confirmation.
    pub fn accept(&mut self, user: Identity, room_id: &str, now: i64) -> RelayResult<Outcome<AcceptAck>> {
        let room = self.room_mut(room_id)?;
        if !room.call.status_of(&user.user_id).is_some_and(|s| s.is_pending()) {
            return Err(RelayError::NotInvited);
        }

        room.set_status(&user.user_id, ParticipantStatus::Joined, now);
        room.identities.insert(user.user_id.clone(), user.clone());

        let mut out = Outcome::new(AcceptAck {
            call: room.call.clone(),
        });
        let joined = ServerEvent::ParticipantJoined {
            user_id: user.user_id.clone(),
            identity: user,
            room_id: Some(room_id.to_string()),
        };
        out.send_all(&room.joined(), &joined);
        out.records.push(room.call.clone());
        Ok(out)
    }

    pub fn reject(
        &mut self,
        user_id: &str,
        room_id: &str,
        reason: Option<String>,
        now: i64,
    ) -> RelayResult<Outcome<()>> {
        let room = self.room(room_id)?;
        if !room.call.status_of(user_id).is_some_and(|s| s.is_pending()) {
            return Err(RelayError::NotInvited);
        }

        let mut out = Outcome::new(());
        self.decline(user_id, room_id, reason, now, &mut out);
        Ok(out)
    }

    /// Initiator aborts the call. Everyone still in it is told it was
    /// cancelled.
    pub fn cancel(&mut self, user_id: &str, room_id: &str, now: i64) -> RelayResult<Outcome<()>> {
        let room = self.room(room_id)?;
        if room.call.initiator_id != user_id {
            return Err(RelayError::NotInitiator);
        }
        room.require_joined(user_id)?;

        let Some(mut room) = self.rooms.remove(room_id) else {
            return Err(RelayError::UnknownRoom(room_id.to_string()));
        };
        let mut out = Outcome::new(());
        let cancelled = ServerEvent::Cancelled {
            room_id: room_id.to_string(),
        };
        let others: Vec<String> = room
            .call
            .ids_with(|s| !s.is_terminal())
            .into_iter()
            .filter(|id| id != user_id)
            .collect();
        out.send_all(&others, &cancelled);
        close(&mut room, now);
        out.records.push(room.call);
        Ok(out)
    }

    pub fn leave(&mut self, user_id: &str, room_id: &str, now: i64) -> RelayResult<Outcome<()>> {
        self.room(room_id)?.require_joined(user_id)?;

        let mut out = Outcome::new(());
        self.depart(user_id, room_id, now, &mut out);
        Ok(out)
    }

    /// Invite one more user into a running call.
    pub fn add_participant(
        &mut self,
        inviter_id: &str,
        room_id: &str,
        user_id: &str,
        online: bool,
        now: i64,
    ) -> RelayResult<Outcome<AddParticipantAck>> {
        let max = self.max_participants;
        let room = self.room_mut(room_id)?;
        room.require_joined(inviter_id)?;

        match room.call.status_of(user_id) {
            Some(status) if status.is_terminal() => {
                return Err(RelayError::ParticipantClosed(user_id.to_string()))
            }
            Some(_) => return Err(RelayError::AlreadyParticipant(user_id.to_string())),
            None => {}
        }
        if room.call.ids_with(|s| !s.is_terminal()).len() >= max {
            return Err(RelayError::RoomFull(max));
        }

        let inviter = room
            .identities
            .get(inviter_id)
            .cloned()
            .unwrap_or_else(|| Identity::new(inviter_id));
        room.invite(user_id, &inviter, online, now);

        let mut out = Outcome::new(AddParticipantAck { offline: !online });
        if online {
            out.send(user_id, room.incoming_for(user_id));
        }
        out.records.push(room.call.clone());
        Ok(out)
    }

    /// Switch the call type. Joined members renegotiate; pending invitees
    /// only need the new type for their ringing screen.
    pub fn upgrade_type(
        &mut self,
        user_id: &str,
        room_id: &str,
        call_type: CallType,
    ) -> RelayResult<Outcome<()>> {
        let room = self.room_mut(room_id)?;
        room.require_joined(user_id)?;
        room.call.call_type = call_type;

        let mut out = Outcome::new(());
        out.send_all(
            &room.joined_except(user_id),
            &ServerEvent::TypeUpgraded {
                user_id: user_id.to_string(),
                call_type,
            },
        );
        out.send_all(&room.pending(), &ServerEvent::TypeChanged { call_type });
        out.records.push(room.call.clone());
        Ok(out)
    }

    /// Route a negotiation payload between two joined members.
    pub fn forward(
        &self,
        from_id: &str,
        room_id: &str,
        target_id: &str,
        event: ServerEvent,
    ) -> RelayResult<Outcome<()>> {
        let room = self.room(room_id)?;
        room.require_joined(from_id)?;
        if target_id == from_id || room.call.status_of(target_id) != Some(ParticipantStatus::Joined) {
            return Err(RelayError::TargetNotInCall(target_id.to_string()));
        }

        let mut out = Outcome::new(());
        out.send(target_id, event);
        Ok(out)
    }

    /// Fan a media state flag out to the other joined members.
    pub fn broadcast(&self, from_id: &str, room_id: &str, event: ServerEvent) -> RelayResult<Outcome<()>> {
        let room = self.room(room_id)?;
        room.require_joined(from_id)?;

        let mut out = Outcome::new(());
        out.send_all(&room.joined_except(from_id), &event);
        Ok(out)
    }

    /// A user's last connection went away: leave every joined call and
    /// decline every ringing one.
    pub fn disconnect(&mut self, user_id: &str, now: i64) -> Outcome<()> {
        let mut out = Outcome::new(());
        let memberships: Vec<(String, ParticipantStatus)> = self
            .rooms
            .iter()
            .filter_map(|(room_id, room)| room.call.status_of(user_id).map(|s| (room_id.clone(), s)))
            .collect();

        for (room_id, status) in memberships {
            match status {
                ParticipantStatus::Joined => self.depart(user_id, &room_id, now, &mut out),
                ParticipantStatus::Ringing => {
                    self.decline(user_id, &room_id, Some("offline".to_string()), now, &mut out)
                }
                _ => {}
            }
        }
        out
    }

    /// Invitations the user should see on connect. Stored invites start
    /// ringing now and their clock restarts.
    pub fn pending_for(&mut self, user_id: &str, now: i64) -> Outcome<()> {
        let mut out = Outcome::new(());
        for room in self.rooms.values_mut() {
            match room.call.status_of(user_id) {
                Some(ParticipantStatus::Invited) => {
                    room.set_status(user_id, ParticipantStatus::Ringing, now);
                    if let Some(invite) = room.invites.get_mut(user_id) {
                        invite.at = now;
                    }
                    out.records.push(room.call.clone());
                }
                Some(ParticipantStatus::Ringing) => {}
                _ => continue,
            }
            out.send(user_id, room.incoming_for(user_id));
        }
        out
    }

    /// Decline every invitation older than `timeout_ms`. The invitee is told
    /// the call was cancelled; the room sees a `timeout` rejection.
    pub fn expire_invites(&mut self, now: i64, timeout_ms: i64) -> Outcome<()> {
        let mut out = Outcome::new(());
        let expired: Vec<(String, String)> = self
            .rooms
            .iter()
            .flat_map(|(room_id, room)| {
                room.invites
                    .iter()
                    .filter(|(_, invite)| now - invite.at >= timeout_ms)
                    .map(|(user_id, _)| (room_id.clone(), user_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (room_id, user_id) in expired {
            if !self.rooms.contains_key(&room_id) {
                continue;
            }
            out.send(
                &user_id,
                ServerEvent::Cancelled {
                    room_id: room_id.clone(),
                },
            );
            self.decline(&user_id, &room_id, Some("timeout".to_string()), now, &mut out);
        }
        out
    }

    fn decline<T>(&mut self, user_id: &str, room_id: &str, reason: Option<String>, now: i64, out: &mut Outcome<T>) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if !room.call.status_of(user_id).is_some_and(|s| s.is_pending()) {
            return;
        }
        room.set_status(user_id, ParticipantStatus::Rejected, now);

        let call_ended = room.call.should_end();
        let rejected = ServerEvent::ParticipantRejected {
            user_id: Some(user_id.to_string()),
            reason,
            call_ended,
        };
        out.send_all(&room.joined(), &rejected);
        self.conclude(room_id, call_ended, now, out);
    }

    fn depart<T>(&mut self, user_id: &str, room_id: &str, now: i64, out: &mut Outcome<T>) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.set_status(user_id, ParticipantStatus::Left, now);

        let call_ended = room.call.should_end();
        let left = ServerEvent::ParticipantLeft {
            user_id: user_id.to_string(),
            call_ended,
        };
        out.send_all(&room.joined(), &left);
        self.conclude(room_id, call_ended, now, out);
    }

    fn conclude<T>(&mut self, room_id: &str, call_ended: bool, now: i64, out: &mut Outcome<T>) {
        if !call_ended {
            if let Some(room) = self.rooms.get(room_id) {
                out.records.push(room.call.clone());
            }
            return;
        }

        let Some(mut room) = self.rooms.remove(room_id) else {
            return;
        };
        let cancelled = ServerEvent::Cancelled {
            room_id: room_id.to_string(),
        };
        out.send_all(&room.pending(), &cancelled);
        close(&mut room, now);
        out.records.push(room.call);
    }
}

fn close(room: &mut Room, now: i64) {
    for entry in room.call.participants.iter_mut() {
        if !entry.status.is_terminal() {
            entry.status = ParticipantStatus::Left;
            entry.left_at = Some(now);
        }
    }
    room.invites.clear();
    room.call.ended_at = Some(now);
}

impl<T> Outcome<T> {
    /// Events addressed to one user, in delivery order.
    pub fn events_for(&self, user_id: &str) -> Vec<&ServerEvent> {
        self.deliveries
            .iter()
            .filter(|d| d.user_id == user_id)
            .map(|d| &d.event)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn who(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            display_name: Some(user_id.to_uppercase()),
            avatar: None,
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn open(registry: &mut RoomRegistry, targets: &[&str], offline: &[&str]) -> String {
        let offline = ids(offline);
        registry
            .initiate(who("alice"), &ids(targets), CallType::Audio, |id| !offline.iter().any(|o| o == id), 0)
            .unwrap()
            .value
            .room_id
    }

    #[test]
    fn test_initiate_rings_online_targets() {
        let mut registry = RoomRegistry::new(8);
        let offline = ids(&["carol"]);
        let out = registry
            .initiate(
                who("alice"),
                &ids(&["bob", "carol", "bob"]),
                CallType::Video,
                |id| !offline.iter().any(|o| o == id),
                100,
            )
            .unwrap();

        assert_eq!(out.value.offline_targets, vec!["carol".to_string()]);
        let call = &out.value.call;
        assert_eq!(call.participants.len(), 3);
        assert_eq!(call.status_of("alice"), Some(ParticipantStatus::Joined));
        assert_eq!(call.status_of("bob"), Some(ParticipantStatus::Ringing));
        assert_eq!(call.status_of("carol"), Some(ParticipantStatus::Invited));

        assert_eq!(out.deliveries.len(), 1);
        match &out.deliveries[0].event {
            ServerEvent::Incoming { caller, call } => {
                assert_eq!(caller.user_id, "alice");
                assert_eq!(call.call_type, CallType::Video);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_initiate_validates_targets() {
        let mut registry = RoomRegistry::new(3);
        let err = |r: RelayResult<Outcome<InitiateAck>>| r.err().unwrap();

        assert_eq!(
            err(registry.initiate(who("alice"), &[], CallType::Audio, |_| true, 0)),
            RelayError::NoTargets
        );
        assert_eq!(
            err(registry.initiate(who("alice"), &ids(&["alice"]), CallType::Audio, |_| true, 0)),
            RelayError::SelfTarget
        );
        assert_eq!(
            err(registry.initiate(who("alice"), &ids(&["b", "c", "d"]), CallType::Audio, |_| true, 0)),
            RelayError::RoomFull(3)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_accept_announces_newcomer_to_joined_members() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);

        let out = registry.accept(who("bob"), &room_id, 10).unwrap();
        assert_eq!(out.value.call.connected_at, Some(10));
        assert_eq!(out.events_for("alice").len(), 1);
        assert_eq!(out.events_for("bob").len(), 1);
        assert!(out.events_for("carol").is_empty());

        let out = registry.accept(who("carol"), &room_id, 20).unwrap();
        assert_eq!(out.value.call.connected_at, Some(10));
        for user in ["alice", "bob", "carol"] {
            match out.events_for(user).as_slice() {
                [ServerEvent::ParticipantJoined { user_id, identity, .. }] => {
                    assert_eq!(user_id, "carol");
                    assert_eq!(identity.display_name.as_deref(), Some("CAROL"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(
            registry.accept(who("carol"), &room_id, 30).err(),
            Some(RelayError::NotInvited)
        );
        assert_eq!(
            registry.accept(who("dave"), &room_id, 30).err(),
            Some(RelayError::NotInvited)
        );
    }

    #[test]
    fn test_one_to_one_reject_ends_call() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob"], &[]);

        let out = registry.reject("bob", &room_id, Some("busy".into()), 5).unwrap();
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantRejected { user_id, reason, call_ended }] => {
                assert_eq!(user_id.as_deref(), Some("bob"));
                assert_eq!(reason.as_deref(), Some("busy"));
                assert!(*call_ended);
            }
            other => panic!("unexpected {:?}", other),
        }

        let record = out.records.last().unwrap();
        assert_eq!(record.ended_at, Some(5));
        assert_eq!(record.status_of("alice"), Some(ParticipantStatus::Left));
        assert_eq!(record.status_of("bob"), Some(ParticipantStatus::Rejected));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_group_reject_keeps_call_while_others_ring() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);

        let out = registry.reject("bob", &room_id, None, 5).unwrap();
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantRejected { call_ended, .. }] => assert!(!*call_ended),
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.events_for("carol").is_empty());

        let out = registry.reject("carol", &room_id, None, 6).unwrap();
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantRejected { call_ended, .. }] => assert!(*call_ended),
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_is_initiator_only() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &["carol"]);

        assert_eq!(
            registry.cancel("bob", &room_id, 1).err(),
            Some(RelayError::NotInitiator)
        );

        let out = registry.cancel("alice", &room_id, 2).unwrap();
        let expected = ServerEvent::Cancelled { room_id: room_id.clone() };
        assert_eq!(out.events_for("bob"), vec![&expected]);
        assert_eq!(out.events_for("carol"), vec![&expected]);
        assert!(out.events_for("alice").is_empty());
        assert_eq!(out.records[0].ended_at, Some(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_leave_ends_call_when_one_member_remains() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);
        registry.accept(who("bob"), &room_id, 1).unwrap();
        registry.accept(who("carol"), &room_id, 2).unwrap();

        let out = registry.leave("bob", &room_id, 3).unwrap();
        for user in ["alice", "carol"] {
            match out.events_for(user).as_slice() {
                [ServerEvent::ParticipantLeft { user_id, call_ended }] => {
                    assert_eq!(user_id, "bob");
                    assert!(!*call_ended);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(registry.leave("bob", &room_id, 4).err(), Some(RelayError::NotAMember));

        let out = registry.leave("carol", &room_id, 5).unwrap();
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantLeft { call_ended, .. }] => assert!(*call_ended),
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_leave_with_pending_invitee_keeps_call_open() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);
        registry.accept(who("bob"), &room_id, 1).unwrap();

        let out = registry.leave("bob", &room_id, 2).unwrap();
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantLeft { call_ended, .. }] => assert!(!*call_ended),
            other => panic!("unexpected {:?}", other),
        }

        // Last joined member leaving ends it regardless of who still rings.
        let out = registry.leave("alice", &room_id, 3).unwrap();
        assert_eq!(
            out.events_for("carol"),
            vec![&ServerEvent::Cancelled { room_id: room_id.clone() }]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_participant_rules() {
        let mut registry = RoomRegistry::new(3);
        let room_id = open(&mut registry, &["bob"], &[]);

        assert_eq!(
            registry.add_participant("bob", &room_id, "carol", true, 1).err(),
            Some(RelayError::NotAMember)
        );
        registry.accept(who("bob"), &room_id, 1).unwrap();

        assert_eq!(
            registry.add_participant("alice", &room_id, "bob", true, 2).err(),
            Some(RelayError::AlreadyParticipant("bob".into()))
        );

        let out = registry.add_participant("bob", &room_id, "carol", false, 2).unwrap();
        assert!(out.value.offline);
        assert!(out.deliveries.is_empty());

        assert_eq!(
            registry.add_participant("alice", &room_id, "dave", true, 3).err(),
            Some(RelayError::RoomFull(3))
        );

        registry.reject("carol", &room_id, None, 4).unwrap();
        assert_eq!(
            registry.add_participant("alice", &room_id, "carol", true, 5).err(),
            Some(RelayError::ParticipantClosed("carol".into()))
        );

        let out = registry.add_participant("bob", &room_id, "dave", true, 6).unwrap();
        match out.events_for("dave").as_slice() {
            [ServerEvent::Incoming { caller, .. }] => assert_eq!(caller.user_id, "bob"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_upgrade_reaches_joined_and_pending() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);
        registry.accept(who("bob"), &room_id, 1).unwrap();

        let out = registry.upgrade_type("bob", &room_id, CallType::Video).unwrap();
        assert_eq!(
            out.events_for("alice"),
            vec![&ServerEvent::TypeUpgraded {
                user_id: "bob".into(),
                call_type: CallType::Video
            }]
        );
        assert_eq!(
            out.events_for("carol"),
            vec![&ServerEvent::TypeChanged {
                call_type: CallType::Video
            }]
        );
        assert!(out.events_for("bob").is_empty());
        assert_eq!(registry.call(&room_id).unwrap().call_type, CallType::Video);
    }

    #[test]
    fn test_forward_requires_both_sides_joined() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);
        let event = ServerEvent::TypeChanged {
            call_type: CallType::Audio,
        };

        assert_eq!(
            registry.forward("alice", &room_id, "bob", event.clone()).err(),
            Some(RelayError::TargetNotInCall("bob".into()))
        );
        registry.accept(who("bob"), &room_id, 1).unwrap();

        let out = registry.forward("alice", &room_id, "bob", event.clone()).unwrap();
        assert_eq!(out.events_for("bob"), vec![&event]);
        assert_eq!(
            registry.forward("carol", &room_id, "alice", event.clone()).err(),
            Some(RelayError::NotAMember)
        );
        assert_eq!(
            registry.forward("alice", "nope", "bob", event).err(),
            Some(RelayError::UnknownRoom("nope".into()))
        );
    }

    #[test]
    fn test_disconnect_leaves_and_declines() {
        let mut registry = RoomRegistry::new(8);
        let first = open(&mut registry, &["bob"], &[]);
        registry.accept(who("bob"), &first, 1).unwrap();
        let second = registry
            .initiate(who("carol"), &ids(&["bob", "dave"]), CallType::Audio, |_| true, 2)
            .unwrap()
            .value
            .room_id;

        let out = registry.disconnect("bob", 3);
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantLeft { call_ended, .. }] => assert!(*call_ended),
            other => panic!("unexpected {:?}", other),
        }
        match out.events_for("carol").as_slice() {
            [ServerEvent::ParticipantRejected { reason, call_ended, .. }] => {
                assert_eq!(reason.as_deref(), Some("offline"));
                assert!(!*call_ended);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.call(&first).is_none());
        assert!(registry.call(&second).is_some());
    }

    #[test]
    fn test_stored_invite_rings_on_connect() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob"], &["bob"]);

        let out = registry.pending_for("bob", 50);
        assert_eq!(out.deliveries.len(), 1);
        assert_eq!(
            registry.call(&room_id).unwrap().status_of("bob"),
            Some(ParticipantStatus::Ringing)
        );

        // Clock restarted at connect time.
        assert!(registry.expire_invites(60, 20).deliveries.is_empty());
        assert!(registry.pending_for("nobody", 60).deliveries.is_empty());
    }

    #[test]
    fn test_unanswered_invites_expire() {
        let mut registry = RoomRegistry::new(8);
        let room_id = open(&mut registry, &["bob", "carol"], &[]);
        registry.accept(who("bob"), &room_id, 10).unwrap();

        assert!(registry.expire_invites(1_000, 45_000).deliveries.is_empty());

        let out = registry.expire_invites(45_000, 45_000);
        assert_eq!(
            out.events_for("carol"),
            vec![&ServerEvent::Cancelled { room_id: room_id.clone() }]
        );
        match out.events_for("alice").as_slice() {
            [ServerEvent::ParticipantRejected { user_id, reason, call_ended }] => {
                assert_eq!(user_id.as_deref(), Some("carol"));
                assert_eq!(reason.as_deref(), Some("timeout"));
                assert!(!*call_ended);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            registry.call(&room_id).unwrap().status_of("carol"),
            Some(ParticipantStatus::Rejected)
        );
    }
}
