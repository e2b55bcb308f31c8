use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action_cards::{
    ActionCard, ActionCardAudit, ActionCardEngine, TransitionEdge, TransitionOptions,
};
use crate::error::DomainError;
use crate::inbox::ThreadKind;
use crate::DomainResult;

pub const DEFAULT_PRESENCE_TTL_MS: i64 = 60 * 1000;
pub const DEFAULT_SAFE_MODE_BAND_MAX: u8 = 1;
const TEMP_ID_PREFIX: &str = "temp:";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Sending,
    Sent,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub created_at_ms: i64,
    pub author_user_id: Option<String>,
    pub kind: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    pub action: Option<Value>,
    pub nsfw_band: u8,
    pub delivery_state: DeliveryState,
    pub error_code: Option<String>,
    pub moderation: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct MessageInput {
    pub message_id: String,
    pub created_at_ms: i64,
    pub author_user_id: Option<String>,
    pub kind: Option<String>,
    pub body: Option<String>,
    pub attachments: Vec<Value>,
    pub action: Option<Value>,
    pub nsfw_band: Option<u8>,
    pub moderation: Option<Value>,
}

impl MessageInput {
    fn into_message(self, delivery_state: DeliveryState) -> Message {
        Message {
            message_id: self.message_id,
            created_at_ms: self.created_at_ms,
            author_user_id: self.author_user_id,
            kind: self.kind.unwrap_or_else(|| "TEXT".to_string()),
            body: self.body.unwrap_or_default(),
            attachments: self.attachments,
            action: self.action,
            nsfw_band: self.nsfw_band.unwrap_or(0),
            delivery_state,
            error_code: None,
            moderation: self.moderation,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MessagePatch {
    pub message_id: String,
    pub created_at_ms: Option<i64>,
    pub author_user_id: Option<String>,
    pub kind: Option<String>,
    pub body: Option<String>,
    pub attachments: Option<Vec<Value>>,
    pub action: Option<Value>,
    pub nsfw_band: Option<u8>,
    pub moderation: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub role: String,
    pub last_read_msg_id: Option<String>,
    pub last_read_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub last_seen_ms: i64,
    pub typing: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadModeration {
    pub locked: bool,
    pub blocked: bool,
    pub reason: Option<String>,
    pub severity: Option<String>,
    pub audit_trail_id: Option<String>,
    pub updated_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct ModerationPatch {
    pub locked: Option<bool>,
    pub blocked: Option<bool>,
    pub reason: Option<String>,
    pub severity: Option<String>,
    pub audit_trail_id: Option<String>,
    pub status: Option<String>,
    pub updated_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadHeader {
    pub thread_id: String,
    pub kind: ThreadKind,
    pub status: String,
    pub safe_mode_required: bool,
    pub last_message_at_ms: Option<i64>,
    pub moderation: Option<ThreadModeration>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPanel {
    pub version: u64,
    #[serde(default)]
    pub tabs: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafeModeSnapshot {
    pub band_max: u8,
    pub override_enabled: bool,
}

impl Default for SafeModeSnapshot {
    fn default() -> Self {
        Self {
            band_max: DEFAULT_SAFE_MODE_BAND_MAX,
            override_enabled: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub kind: ThreadKind,
    pub status: Option<String>,
    pub safe_mode_required: bool,
    pub last_message_at_ms: Option<i64>,
    pub moderation: Option<ThreadModeration>,
    pub messages: Vec<MessageInput>,
    pub action_cards: Vec<ActionCard>,
    pub participants: Vec<Participant>,
    pub project_panel: Option<ProjectPanel>,
    pub safe_mode: Option<SafeModeSnapshot>,
    pub presence_ttl_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub enum ThreadEvent {
    MessageCreated {
        message: MessageInput,
        client_id: Option<String>,
    },
    MessageUpdated {
        patch: MessagePatch,
    },
    MessageFailed {
        client_id: String,
        error_code: Option<String>,
    },
    MessageModerationUpdated {
        message_id: String,
        moderation: Option<Value>,
    },
    ActionCardUpsert {
        card: ActionCard,
    },
    ReadReceiptUpdated {
        user_id: String,
        role: Option<String>,
        last_read_msg_id: Option<String>,
        last_read_at_ms: Option<i64>,
    },
    Presence {
        user_id: String,
        last_seen_ms: Option<i64>,
        typing: bool,
    },
    ThreadStatusChanged {
        status: Option<String>,
    },
    ThreadModerationUpdated {
        patch: ModerationPatch,
    },
    SafeModeOverride {
        override_enabled: bool,
        band_max: Option<u8>,
    },
    ProjectPanelUpdated {
        version: u64,
        tabs: Map<String, Value>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct OptimisticMessageInput {
    pub client_id: String,
    pub created_at_ms: i64,
    pub author_user_id: String,
    pub kind: Option<String>,
    pub body: Option<String>,
    pub attachments: Vec<Value>,
}

/// Per-conversation projection: timeline, action cards, participants,
/// presence, project panel. Pure value type like the inbox store.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadState {
    pub thread: ThreadHeader,
    messages_by_id: HashMap<String, Message>,
    message_order: Vec<String>,
    optimistic_by_client_id: HashMap<String, String>,
    action_cards_by_id: HashMap<String, ActionCard>,
    action_card_order: Vec<String>,
    participants_by_id: HashMap<String, Participant>,
    presence_by_user_id: HashMap<String, PresenceEntry>,
    project_panel: ProjectPanel,
    safe_mode: SafeModeSnapshot,
    presence_ttl_ms: i64,
    last_event_at_ms: i64,
}

impl ThreadState {
    pub fn new(snapshot: ThreadSnapshot, now_ms: i64) -> DomainResult<Self> {
        if snapshot.thread_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "thread hydration requires threadId".into(),
            ));
        }
        let mut state = Self {
            thread: ThreadHeader {
                thread_id: snapshot.thread_id,
                kind: snapshot.kind,
                status: snapshot.status.unwrap_or_else(|| "OPEN".to_string()),
                safe_mode_required: snapshot.safe_mode_required,
                last_message_at_ms: snapshot.last_message_at_ms,
                moderation: snapshot.moderation,
            },
            messages_by_id: HashMap::new(),
            message_order: Vec::new(),
            optimistic_by_client_id: HashMap::new(),
            action_cards_by_id: HashMap::new(),
            action_card_order: Vec::new(),
            participants_by_id: HashMap::new(),
            presence_by_user_id: HashMap::new(),
            project_panel: snapshot.project_panel.unwrap_or_default(),
            safe_mode: snapshot.safe_mode.unwrap_or_default(),
            presence_ttl_ms: snapshot.presence_ttl_ms.unwrap_or(DEFAULT_PRESENCE_TTL_MS),
            last_event_at_ms: now_ms,
        };

        let mut messages = snapshot.messages;
        messages.sort_by(|a, b| {
            (a.created_at_ms, a.message_id.as_str()).cmp(&(b.created_at_ms, b.message_id.as_str()))
        });
        for input in messages {
            if input.message_id.trim().is_empty() {
                continue;
            }
            state.message_order.push(input.message_id.clone());
            state
                .messages_by_id
                .insert(input.message_id.clone(), input.into_message(DeliveryState::Sent));
        }

        let mut cards = snapshot.action_cards;
        cards.sort_by(|a, b| {
            (a.created_at_ms, a.action_id.as_str()).cmp(&(b.created_at_ms, b.action_id.as_str()))
        });
        for card in cards {
            if card.action_id.trim().is_empty() {
                continue;
            }
            state.action_card_order.push(card.action_id.clone());
            state.action_cards_by_id.insert(card.action_id.clone(), card);
        }

        for participant in snapshot.participants {
            state
                .participants_by_id
                .insert(participant.user_id.clone(), participant);
        }

        // derived lastMessageAt is the max of the header value and the
        // timeline tail
        let tail = state
            .message_order
            .last()
            .and_then(|id| state.messages_by_id.get(id))
            .map(|message| message.created_at_ms);
        state.thread.last_message_at_ms = match (state.thread.last_message_at_ms, tail) {
            (Some(header), Some(tail)) => Some(header.max(tail)),
            (header, tail) => header.or(tail),
        };
        Ok(state)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages_by_id.get(message_id)
    }

    pub fn message_order(&self) -> &[String] {
        &self.message_order
    }

    pub fn messages(&self) -> Vec<&Message> {
        self.message_order
            .iter()
            .filter_map(|id| self.messages_by_id.get(id))
            .collect()
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants_by_id.get(user_id)
    }

    pub fn project_panel(&self) -> &ProjectPanel {
        &self.project_panel
    }

    pub fn safe_mode(&self) -> SafeModeSnapshot {
        self.safe_mode
    }

    pub fn moderation(&self) -> Option<&ThreadModeration> {
        self.thread.moderation.as_ref()
    }

    pub fn optimistic_temp_id(&self, client_id: &str) -> Option<&String> {
        self.optimistic_by_client_id.get(client_id)
    }

    fn insert_message_ordered(&mut self, message: Message) {
        let message_id = message.message_id.clone();
        self.message_order.retain(|id| id != &message_id);
        let key = (message.created_at_ms, message_id.clone());
        let position = self.message_order.iter().position(|other_id| {
            let other_created = self
                .messages_by_id
                .get(other_id)
                .map(|other| other.created_at_ms)
                .unwrap_or(0);
            key < (other_created, other_id.clone())
        });
        match position {
            Some(index) => self.message_order.insert(index, message_id.clone()),
            None => self.message_order.push(message_id.clone()),
        }
        self.messages_by_id.insert(message_id, message);
        // lastMessageAt never moves backwards
        if let Some(last) = self
            .message_order
            .last()
            .and_then(|id| self.messages_by_id.get(id))
        {
            let current = self.thread.last_message_at_ms.unwrap_or(i64::MIN);
            self.thread.last_message_at_ms = Some(current.max(last.created_at_ms));
        }
    }

    fn drop_optimistic_entry(&mut self, client_id: &str) {
        if let Some(temp_id) = self.optimistic_by_client_id.remove(client_id) {
            self.messages_by_id.remove(&temp_id);
            self.message_order.retain(|id| id != &temp_id);
        }
    }

    fn upsert_action_card(&mut self, incoming: &ActionCard) -> bool {
        if let Some(existing) = self.action_cards_by_id.get(&incoming.action_id) {
            // stale by version: discarded, not merged
            if incoming.version <= existing.version {
                return false;
            }
        }
        let action_id = incoming.action_id.clone();
        self.action_card_order.retain(|id| id != &action_id);
        let key = (incoming.created_at_ms, action_id.clone());
        let position = self.action_card_order.iter().position(|other_id| {
            let other_created = self
                .action_cards_by_id
                .get(other_id)
                .map(|other| other.created_at_ms)
                .unwrap_or(0);
            key < (other_created, other_id.clone())
        });
        match position {
            Some(index) => self.action_card_order.insert(index, action_id.clone()),
            None => self.action_card_order.push(action_id.clone()),
        }
        self.action_cards_by_id.insert(action_id, incoming.clone());
        true
    }

    fn prune_presence(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.presence_ttl_ms;
        self.presence_by_user_id
            .retain(|_, presence| presence.last_seen_ms >= cutoff);
    }

    pub fn apply_event(&self, event: &ThreadEvent, now_ms: i64) -> Option<Self> {
        let mut next = self.clone();
        match event {
            ThreadEvent::MessageCreated { message, client_id } => {
                if message.message_id.trim().is_empty() {
                    return None;
                }
                next.insert_message_ordered(message.clone().into_message(DeliveryState::Sent));
                if let Some(client_id) = client_id {
                    next.drop_optimistic_entry(client_id);
                }
            }
            ThreadEvent::MessageUpdated { patch } => {
                let existing = next.messages_by_id.get(&patch.message_id)?.clone();
                let mut updated = existing.clone();
                if let Some(created_at_ms) = patch.created_at_ms {
                    updated.created_at_ms = created_at_ms;
                }
                if patch.author_user_id.is_some() {
                    updated.author_user_id = patch.author_user_id.clone();
                }
                if let Some(kind) = &patch.kind {
                    updated.kind = kind.clone();
                }
                if let Some(body) = &patch.body {
                    updated.body = body.clone();
                }
                if let Some(attachments) = &patch.attachments {
                    updated.attachments = attachments.clone();
                }
                if patch.action.is_some() {
                    updated.action = patch.action.clone();
                }
                if let Some(nsfw_band) = patch.nsfw_band {
                    updated.nsfw_band = nsfw_band;
                }
                if patch.moderation.is_some() {
                    updated.moderation = patch.moderation.clone();
                }
                updated.delivery_state = existing.delivery_state;
                next.insert_message_ordered(updated);
            }
            ThreadEvent::MessageFailed {
                client_id,
                error_code,
            } => {
                let temp_id = next.optimistic_by_client_id.get(client_id)?.clone();
                let message = next.messages_by_id.get_mut(&temp_id)?;
                message.delivery_state = DeliveryState::Failed;
                message.error_code =
                    Some(error_code.clone().unwrap_or_else(|| "UNKNOWN".to_string()));
            }
            ThreadEvent::MessageModerationUpdated {
                message_id,
                moderation,
            } => {
                let message = next.messages_by_id.get_mut(message_id)?;
                message.moderation = moderation.clone();
            }
            ThreadEvent::ActionCardUpsert { card } => {
                if !next.upsert_action_card(card) {
                    return None;
                }
            }
            ThreadEvent::ReadReceiptUpdated {
                user_id,
                role,
                last_read_msg_id,
                last_read_at_ms,
            } => {
                let participant = next
                    .participants_by_id
                    .entry(user_id.clone())
                    .or_insert_with(|| Participant {
                        user_id: user_id.clone(),
                        role: role.clone().unwrap_or_else(|| "GUEST".to_string()),
                        last_read_msg_id: None,
                        last_read_at_ms: None,
                    });
                if last_read_msg_id.is_some() {
                    participant.last_read_msg_id = last_read_msg_id.clone();
                }
                if last_read_at_ms.is_some() {
                    participant.last_read_at_ms = *last_read_at_ms;
                }
            }
            ThreadEvent::Presence {
                user_id,
                last_seen_ms,
                typing,
            } => {
                let last_seen = last_seen_ms
                    .or_else(|| {
                        next.presence_by_user_id
                            .get(user_id)
                            .map(|presence| presence.last_seen_ms)
                    })
                    .unwrap_or(now_ms);
                next.presence_by_user_id.insert(
                    user_id.clone(),
                    PresenceEntry {
                        last_seen_ms: last_seen,
                        typing: *typing,
                    },
                );
                next.prune_presence(now_ms);
            }
            ThreadEvent::ThreadStatusChanged { status } => {
                if let Some(status) = status {
                    next.thread.status = status.clone();
                }
            }
            ThreadEvent::ThreadModerationUpdated { patch } => {
                let mut moderation = next.thread.moderation.clone().unwrap_or_default();
                if let Some(locked) = patch.locked {
                    moderation.locked = locked;
                }
                if let Some(blocked) = patch.blocked {
                    moderation.blocked = blocked;
                }
                if patch.reason.is_some() {
                    moderation.reason = patch.reason.clone();
                }
                if patch.severity.is_some() {
                    moderation.severity = patch.severity.clone();
                }
                if patch.audit_trail_id.is_some() {
                    moderation.audit_trail_id = patch.audit_trail_id.clone();
                }
                moderation.updated_at_ms = patch.updated_at_ms.or(Some(now_ms));
                next.thread.moderation = Some(moderation);
                if let Some(status) = &patch.status {
                    next.thread.status = status.clone();
                }
            }
            ThreadEvent::SafeModeOverride {
                override_enabled,
                band_max,
            } => {
                next.safe_mode.override_enabled = *override_enabled;
                if let Some(band_max) = band_max {
                    next.safe_mode.band_max = *band_max;
                }
            }
            ThreadEvent::ProjectPanelUpdated { version, tabs } => {
                // same monotonic rule as action cards
                if *version <= next.project_panel.version {
                    return None;
                }
                let mut merged = next.project_panel.tabs.clone();
                for (key, value) in tabs {
                    merged.insert(key.clone(), value.clone());
                }
                next.project_panel = ProjectPanel {
                    version: *version,
                    tabs: merged,
                };
            }
        }
        next.last_event_at_ms = now_ms;
        Some(next)
    }

    pub fn enqueue_optimistic(
        &self,
        input: OptimisticMessageInput,
        now_ms: i64,
    ) -> DomainResult<Self> {
        if input.client_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "optimistic message requires clientId".into(),
            ));
        }
        let mut next = self.clone();
        let temp_id = format!("{TEMP_ID_PREFIX}{}", input.client_id);
        next.optimistic_by_client_id
            .insert(input.client_id.clone(), temp_id.clone());
        next.insert_message_ordered(Message {
            message_id: temp_id,
            created_at_ms: input.created_at_ms,
            author_user_id: Some(input.author_user_id),
            kind: input.kind.unwrap_or_else(|| "TEXT".to_string()),
            body: input.body.unwrap_or_default(),
            attachments: input.attachments,
            action: None,
            nsfw_band: 0,
            delivery_state: DeliveryState::Sending,
            error_code: None,
            moderation: None,
        });
        next.last_event_at_ms = now_ms;
        Ok(next)
    }

    /// Atomic swap of the temp entry for the server message. Idempotent
    /// with a MESSAGE_CREATED event carrying the same clientId.
    pub fn resolve_optimistic(
        &self,
        client_id: &str,
        payload: MessageInput,
        now_ms: i64,
    ) -> Option<Self> {
        if !self.optimistic_by_client_id.contains_key(client_id) {
            return self.apply_event(
                &ThreadEvent::MessageCreated {
                    message: payload,
                    client_id: None,
                },
                now_ms,
            );
        }
        let mut next = self.clone();
        next.drop_optimistic_entry(client_id);
        next.insert_message_ordered(payload.into_message(DeliveryState::Sent));
        next.last_event_at_ms = now_ms;
        Some(next)
    }

    /// The failed entry stays visible so the user can retry it.
    pub fn fail_optimistic(
        &self,
        client_id: &str,
        error_code: Option<&str>,
        now_ms: i64,
    ) -> Option<Self> {
        let temp_id = self.optimistic_by_client_id.get(client_id)?;
        if !self.messages_by_id.contains_key(temp_id) {
            return None;
        }
        let temp_id = temp_id.clone();
        let mut next = self.clone();
        if let Some(message) = next.messages_by_id.get_mut(&temp_id) {
            message.delivery_state = DeliveryState::Failed;
            message.error_code = Some(error_code.unwrap_or("UNKNOWN").to_string());
        }
        next.last_event_at_ms = now_ms;
        Some(next)
    }

    pub fn unread_message_ids(&self, user_id: &str) -> Vec<String> {
        let Some(last_read) = self
            .participants_by_id
            .get(user_id)
            .and_then(|participant| participant.last_read_msg_id.as_deref())
        else {
            return self.message_order.clone();
        };
        match self.message_order.iter().position(|id| id == last_read) {
            Some(index) => self.message_order[index + 1..].to_vec(),
            None => self.message_order.clone(),
        }
    }

    pub fn presence_snapshot(&self, now_ms: i64) -> HashMap<String, PresenceEntry> {
        let cutoff = now_ms - self.presence_ttl_ms;
        self.presence_by_user_id
            .iter()
            .filter(|(_, presence)| presence.last_seen_ms >= cutoff)
            .map(|(user_id, presence)| (user_id.clone(), presence.clone()))
            .collect()
    }

    pub fn action_card(&self, action_id: &str) -> Option<&ActionCard> {
        self.action_cards_by_id.get(action_id)
    }

    pub fn action_cards(&self) -> Vec<&ActionCard> {
        self.action_card_order
            .iter()
            .filter_map(|id| self.action_cards_by_id.get(id))
            .collect()
    }

    pub fn action_card_transitions(
        &self,
        engine: &ActionCardEngine,
        action_id: &str,
    ) -> Vec<TransitionEdge> {
        self.action_cards_by_id
            .get(action_id)
            .map(|card| engine.allowed_transitions(card))
            .unwrap_or_default()
    }

    pub fn apply_action_card_intent(
        &self,
        engine: &ActionCardEngine,
        action_id: &str,
        intent: &str,
        now_ms: i64,
        options: &TransitionOptions,
    ) -> DomainResult<(Self, Option<ActionCardAudit>)> {
        let card = self
            .action_cards_by_id
            .get(action_id)
            .ok_or(DomainError::NotFound)?;
        let outcome = engine.transition(card, intent, now_ms, options)?;
        let mut next = self.clone();
        next.action_cards_by_id
            .insert(action_id.to_string(), outcome.card);
        if !next.action_card_order.iter().any(|id| id == action_id) {
            next.action_card_order.push(action_id.to_string());
        }
        next.last_event_at_ms = now_ms;
        Ok((next, outcome.audit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_input(message_id: &str, created_at_ms: i64) -> MessageInput {
        MessageInput {
            message_id: message_id.to_string(),
            created_at_ms,
            author_user_id: Some("peer".to_string()),
            body: Some(format!("body of {message_id}")),
            ..Default::default()
        }
    }

    fn base_state() -> ThreadState {
        ThreadState::new(
            ThreadSnapshot {
                thread_id: "thr-1".to_string(),
                messages: vec![message_input("msg-b", 2_000), message_input("msg-a", 1_000)],
                participants: vec![Participant {
                    user_id: "viewer".to_string(),
                    role: "BUYER".to_string(),
                    last_read_msg_id: Some("msg-a".to_string()),
                    last_read_at_ms: Some(1_500),
                }],
                ..Default::default()
            },
            0,
        )
        .expect("state")
    }

    #[test]
    fn hydration_sorts_the_timeline_and_derives_last_message_at() {
        let state = base_state();
        assert_eq!(state.message_order(), ["msg-a", "msg-b"]);
        assert_eq!(state.thread.last_message_at_ms, Some(2_000));
    }

    #[test]
    fn hydration_without_thread_id_fails_fast() {
        assert!(ThreadState::new(ThreadSnapshot::default(), 0).is_err());
    }

    #[test]
    fn out_of_order_message_events_keep_the_timeline_sorted() {
        let state = base_state();
        let state = state
            .apply_event(
                &ThreadEvent::MessageCreated {
                    message: message_input("msg-d", 9_000),
                    client_id: None,
                },
                9_000,
            )
            .expect("applied");
        let state = state
            .apply_event(
                &ThreadEvent::MessageCreated {
                    message: message_input("msg-c", 1_500),
                    client_id: None,
                },
                9_100,
            )
            .expect("applied");
        assert_eq!(state.message_order(), ["msg-a", "msg-c", "msg-b", "msg-d"]);
        assert_eq!(state.thread.last_message_at_ms, Some(9_000));
    }

    #[test]
    fn equal_timestamps_break_ties_by_message_id() {
        let state = base_state();
        let state = state
            .apply_event(
                &ThreadEvent::MessageCreated {
                    message: message_input("msg-ab", 1_000),
                    client_id: None,
                },
                5_000,
            )
            .expect("applied");
        assert_eq!(state.message_order(), ["msg-a", "msg-ab", "msg-b"]);
    }

    #[test]
    fn optimistic_send_resolves_without_duplicates() {
        let state = base_state();
        let state = state
            .enqueue_optimistic(
                OptimisticMessageInput {
                    client_id: "c-1".to_string(),
                    created_at_ms: 3_000,
                    author_user_id: "viewer".to_string(),
                    body: Some("hello".to_string()),
                    ..Default::default()
                },
                3_000,
            )
            .expect("optimistic");
        assert!(state.message("temp:c-1").is_some());

        let state = state
            .resolve_optimistic("c-1", message_input("msg-real", 3_100), 3_200)
            .expect("resolved");
        assert!(state.message("temp:c-1").is_none());
        assert!(state.message("msg-real").is_some());

        // resolving the same clientId twice must not corrupt the timeline
        let state = state
            .resolve_optimistic("c-1", message_input("msg-real", 3_100), 3_300)
            .expect("idempotent resolve");
        assert_eq!(
            state
                .message_order()
                .iter()
                .filter(|id| id.as_str() == "msg-real")
                .count(),
            1
        );
    }

    #[test]
    fn message_created_with_client_id_is_idempotent_with_resolution() {
        let state = base_state()
            .enqueue_optimistic(
                OptimisticMessageInput {
                    client_id: "c-1".to_string(),
                    created_at_ms: 3_000,
                    author_user_id: "viewer".to_string(),
                    ..Default::default()
                },
                3_000,
            )
            .expect("optimistic");
        let state = state
            .apply_event(
                &ThreadEvent::MessageCreated {
                    message: message_input("msg-real", 3_100),
                    client_id: Some("c-1".to_string()),
                },
                3_200,
            )
            .expect("applied");
        assert!(state.message("temp:c-1").is_none());
        assert!(state.message("msg-real").is_some());
        assert!(state.optimistic_temp_id("c-1").is_none());
    }

    #[test]
    fn failed_optimistic_message_is_retained_and_visible() {
        let state = base_state()
            .enqueue_optimistic(
                OptimisticMessageInput {
                    client_id: "c-1".to_string(),
                    created_at_ms: 3_000,
                    author_user_id: "viewer".to_string(),
                    ..Default::default()
                },
                3_000,
            )
            .expect("optimistic");
        let state = state
            .fail_optimistic("c-1", Some("TIMEOUT"), 4_000)
            .expect("failed");
        let message = state.message("temp:c-1").expect("temp message");
        assert_eq!(message.delivery_state, DeliveryState::Failed);
        assert_eq!(message.error_code.as_deref(), Some("TIMEOUT"));
    }

    fn card(action_id: &str, state: &str, version: u64) -> ActionCard {
        ActionCard {
            action_id: action_id.to_string(),
            card_type: "RESCHEDULE".to_string(),
            state: state.to_string(),
            version,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
            payload: Map::new(),
            metadata: Map::new(),
            last_intent: None,
            allowed_transitions: None,
        }
    }

    #[test]
    fn stale_action_card_versions_are_discarded() {
        let state = base_state();
        let state = state
            .apply_event(
                &ThreadEvent::ActionCardUpsert {
                    card: card("act-1", "ACCEPTED", 2),
                },
                5_000,
            )
            .expect("applied");
        assert!(state
            .apply_event(
                &ThreadEvent::ActionCardUpsert {
                    card: card("act-1", "DECLINED", 1),
                },
                6_000,
            )
            .is_none());
        assert!(state
            .apply_event(
                &ThreadEvent::ActionCardUpsert {
                    card: card("act-1", "DECLINED", 2),
                },
                6_000,
            )
            .is_none());
        assert_eq!(
            state.action_card("act-1").map(|card| card.state.as_str()),
            Some("ACCEPTED")
        );
    }

    #[test]
    fn action_card_intent_goes_through_the_engine() {
        let engine = ActionCardEngine::default();
        let state = base_state()
            .apply_event(
                &ThreadEvent::ActionCardUpsert {
                    card: card("act-1", "PENDING", 0),
                },
                5_000,
            )
            .expect("applied");
        let (state, audit) = state
            .apply_action_card_intent(&engine, "act-1", "accept", 6_000, &TransitionOptions::default())
            .expect("intent");
        assert_eq!(
            state.action_card("act-1").map(|card| card.state.as_str()),
            Some("ACCEPTED")
        );
        assert!(audit.is_some());

        let err = state
            .apply_action_card_intent(&engine, "act-1", "accept", 7_000, &TransitionOptions::default())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn presence_entries_are_pruned_by_ttl() {
        let state = base_state();
        let state = state
            .apply_event(
                &ThreadEvent::Presence {
                    user_id: "peer".to_string(),
                    last_seen_ms: Some(1_000),
                    typing: true,
                },
                1_000,
            )
            .expect("applied");
        assert_eq!(state.presence_snapshot(1_000).len(), 1);
        // beyond the ttl the lazy prune hides the entry
        assert!(state.presence_snapshot(1_000 + DEFAULT_PRESENCE_TTL_MS + 1).is_empty());

        // a later presence event physically removes aged entries
        let state = state
            .apply_event(
                &ThreadEvent::Presence {
                    user_id: "other".to_string(),
                    last_seen_ms: Some(100_000),
                    typing: false,
                },
                100_000,
            )
            .expect("applied");
        assert_eq!(state.presence_snapshot(100_000).len(), 1);
    }

    #[test]
    fn unread_ids_are_the_suffix_after_last_read() {
        let state = base_state();
        assert_eq!(state.unread_message_ids("viewer"), ["msg-b"]);
        assert_eq!(state.unread_message_ids("stranger"), ["msg-a", "msg-b"]);
    }

    #[test]
    fn project_panel_updates_are_version_gated() {
        let state = base_state();
        let mut tabs = Map::new();
        tabs.insert("files".to_string(), serde_json::json!({"count": 2}));
        let state = state
            .apply_event(
                &ThreadEvent::ProjectPanelUpdated {
                    version: 3,
                    tabs: tabs.clone(),
                },
                5_000,
            )
            .expect("applied");
        assert_eq!(state.project_panel().version, 3);
        assert!(state
            .apply_event(
                &ThreadEvent::ProjectPanelUpdated {
                    version: 3,
                    tabs: Map::new(),
                },
                6_000,
            )
            .is_none());
    }

    #[test]
    fn moderation_patch_merges_into_existing_metadata() {
        let state = base_state();
        let state = state
            .apply_event(
                &ThreadEvent::ThreadModerationUpdated {
                    patch: ModerationPatch {
                        locked: Some(true),
                        status: Some("LOCKED".to_string()),
                        reason: Some("reported".to_string()),
                        ..Default::default()
                    },
                },
                5_000,
            )
            .expect("applied");
        assert_eq!(state.thread.status, "LOCKED");
        let moderation = state.moderation().expect("moderation");
        assert!(moderation.locked);
        assert!(!moderation.blocked);

        let state = state
            .apply_event(
                &ThreadEvent::ThreadModerationUpdated {
                    patch: ModerationPatch {
                        blocked: Some(true),
                        ..Default::default()
                    },
                },
                6_000,
            )
            .expect("applied");
        let moderation = state.moderation().expect("moderation");
        assert!(moderation.locked);
        assert!(moderation.blocked);
        assert_eq!(moderation.reason.as_deref(), Some("reported"));
    }

    #[test]
    fn message_update_preserves_delivery_state_and_reorders() {
        let state = base_state();
        let state = state
            .apply_event(
                &ThreadEvent::MessageUpdated {
                    patch: MessagePatch {
                        message_id: "msg-a".to_string(),
                        created_at_ms: Some(8_000),
                        body: Some("edited".to_string()),
                        ..Default::default()
                    },
                },
                8_000,
            )
            .expect("applied");
        assert_eq!(state.message_order(), ["msg-b", "msg-a"]);
        let message = state.message("msg-a").expect("message");
        assert_eq!(message.body, "edited");
        assert_eq!(message.delivery_state, DeliveryState::Sent);
    }
}
