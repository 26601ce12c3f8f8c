//! In-process channel hub. Behaves like the relay (self-exclusion, optional
//! confirmations, presence diffs) without a socket in between.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pitchside_common::protocol::{ChannelMessage, PresenceState, RELAY_SENDER};
use tokio::sync::mpsc;

use super::{BroadcastChannel, ChannelInbound, PresenceMember, Subscription};
use crate::error::ChannelError;

struct Member {
    tracker_id: String,
    tx: mpsc::UnboundedSender<ChannelInbound>,
    connected: bool,
    presence: Option<PresenceState>,
    fail_next: u32,
}

#[derive(Default)]
struct Room {
    members: BTreeMap<u64, Member>,
}

impl Room {
    fn presence_set(&self) -> Vec<PresenceMember> {
        self.members
            .values()
            .filter(|m| m.connected)
            .filter_map(|m| {
                m.presence.as_ref().map(|state| PresenceMember {
                    tracker_id: m.tracker_id.clone(),
                    state: Some(state.clone()),
                })
            })
            .collect()
    }

    fn send_to_others(&self, sender: u64, item: &ChannelInbound) {
        for (id, member) in &self.members {
            if *id != sender && member.connected {
                let _ = member.tx.send(item.clone());
            }
        }
    }

    fn send_to_all(&self, item: &ChannelInbound) {
        for member in self.members.values().filter(|m| m.connected) {
            let _ = member.tx.send(item.clone());
        }
    }
}

struct HubState {
    confirm_events: bool,
    next_member: u64,
    rooms: BTreeMap<String, Room>,
}

/// Cloneable hub shared by every in-process client.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Hub that answers every `add_event` with an `event_confirmed`.
    pub fn new() -> Self {
        Self::with_confirmation(true)
    }

    pub fn with_confirmation(confirm_events: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                confirm_events,
                next_member: 1,
                rooms: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, match_id: &str, tracker_id: &str) -> Subscription {
        let (tx, inbound) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let member_id = state.next_member;
        state.next_member += 1;

        let room = state.rooms.entry(match_id.to_string()).or_default();
        let _ = tx.send(ChannelInbound::Connected);
        let _ = tx.send(ChannelInbound::PresenceSync(room.presence_set()));
        room.members.insert(
            member_id,
            Member {
                tracker_id: tracker_id.to_string(),
                tx,
                connected: true,
                presence: None,
                fail_next: 0,
            },
        );

        let channel = MemoryChannel {
            hub: self.clone(),
            match_id: match_id.to_string(),
            member_id,
        };
        Subscription {
            channel: Arc::new(channel),
            inbound,
        }
    }

    /// Drop or restore a tracker's connection. While dropped it sends and
    /// receives nothing and peers see it leave.
    pub fn set_connected(&self, match_id: &str, tracker_id: &str, connected: bool) {
        let mut state = self.state.lock();
        let Some(room) = state.rooms.get_mut(match_id) else {
            return;
        };
        let Some((&member_id, member)) = room
            .members
            .iter_mut()
            .find(|(_, m)| m.tracker_id == tracker_id)
        else {
            return;
        };
        if member.connected == connected {
            return;
        }
        member.connected = connected;
        let had_presence = member.presence.is_some();
        let presence = member.presence.clone();

        if connected {
            let tx = member.tx.clone();
            let _ = tx.send(ChannelInbound::Connected);
            let _ = tx.send(ChannelInbound::PresenceSync(room.presence_set()));
            if let Some(state) = presence {
                room.send_to_others(
                    member_id,
                    &ChannelInbound::PresenceJoin(PresenceMember {
                        tracker_id: tracker_id.to_string(),
                        state: Some(state),
                    }),
                );
            }
        } else {
            let _ = member.tx.send(ChannelInbound::Disconnected);
            if had_presence {
                room.send_to_others(
                    member_id,
                    &ChannelInbound::PresenceLeave {
                        tracker_id: tracker_id.to_string(),
                    },
                );
            }
        }
    }

    /// Make the next `count` `add_event` publishes from `tracker_id` fail with
    /// a rejection. Other topics are unaffected.
    pub fn fail_next_events(&self, match_id: &str, tracker_id: &str, count: u32) {
        let mut state = self.state.lock();
        if let Some(member) = state
            .rooms
            .get_mut(match_id)
            .and_then(|room| room.members.values_mut().find(|m| m.tracker_id == tracker_id))
        {
            member.fail_next = count;
        }
    }

    /// Tracker ids with a tracked presence in the match.
    pub fn present(&self, match_id: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .rooms
            .get(match_id)
            .map(|room| room.presence_set().into_iter().map(|m| m.tracker_id).collect())
            .unwrap_or_default()
    }

    fn publish(&self, match_id: &str, member_id: u64, message: &ChannelMessage) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        let confirm = state.confirm_events;
        let room = state.rooms.get_mut(match_id).ok_or(ChannelError::Closed)?;
        let member = room.members.get_mut(&member_id).ok_or(ChannelError::Closed)?;
        if !member.connected {
            return Err(ChannelError::NotConnected);
        }
        if member.fail_next > 0 && matches!(message, ChannelMessage::AddEvent(_)) {
            member.fail_next -= 1;
            return Err(ChannelError::Rejected("injected failure".to_string()));
        }
        let from = member.tracker_id.clone();

        room.send_to_others(
            member_id,
            &ChannelInbound::Message {
                from,
                message: message.clone(),
            },
        );
        if let (true, ChannelMessage::AddEvent(event)) = (confirm, message) {
            room.send_to_all(&ChannelInbound::Message {
                from: RELAY_SENDER.to_string(),
                message: ChannelMessage::EventConfirmed(event.clone()),
            });
        }
        Ok(())
    }

    fn track(&self, match_id: &str, member_id: u64, presence: Option<PresenceState>) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        let room = state.rooms.get_mut(match_id).ok_or(ChannelError::Closed)?;
        let member = room.members.get_mut(&member_id).ok_or(ChannelError::Closed)?;
        if !member.connected {
            return Err(ChannelError::NotConnected);
        }
        let was_tracked = member.presence.is_some();
        member.presence = presence.clone();
        let tracker_id = member.tracker_id.clone();

        match presence {
            Some(state) => room.send_to_others(
                member_id,
                &ChannelInbound::PresenceJoin(PresenceMember {
                    tracker_id,
                    state: Some(state),
                }),
            ),
            None if was_tracked => {
                room.send_to_others(member_id, &ChannelInbound::PresenceLeave { tracker_id })
            }
            None => {}
        }
        Ok(())
    }

    fn leave(&self, match_id: &str, member_id: u64) {
        let mut state = self.state.lock();
        let Some(room) = state.rooms.get_mut(match_id) else {
            return;
        };
        if let Some(member) = room.members.remove(&member_id) {
            if member.connected && member.presence.is_some() {
                room.send_to_others(
                    member_id,
                    &ChannelInbound::PresenceLeave {
                        tracker_id: member.tracker_id,
                    },
                );
            }
        }
        if room.members.is_empty() {
            state.rooms.remove(match_id);
        }
    }

    fn is_connected(&self, match_id: &str, member_id: u64) -> bool {
        let state = self.state.lock();
        state
            .rooms
            .get(match_id)
            .and_then(|room| room.members.get(&member_id))
            .is_some_and(|m| m.connected)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryChannel {
    hub: MemoryHub,
    match_id: String,
    member_id: u64,
}

#[async_trait]
impl BroadcastChannel for MemoryChannel {
    fn match_id(&self) -> &str {
        &self.match_id
    }

    fn is_connected(&self) -> bool {
        self.hub.is_connected(&self.match_id, self.member_id)
    }

    async fn publish(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        self.hub.publish(&self.match_id, self.member_id, message)
    }

    async fn track(&self, state: &PresenceState) -> Result<(), ChannelError> {
        self.hub.track(&self.match_id, self.member_id, Some(state.clone()))
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        self.hub.track(&self.match_id, self.member_id, None)
    }

    async fn close(&self) {
        self.hub.leave(&self.match_id, self.member_id);
    }
}
