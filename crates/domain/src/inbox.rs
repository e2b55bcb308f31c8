use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_RATE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_MAX_CONVERSATIONS: u32 = 5;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadKind {
    #[default]
    Inquiry,
    Project,
}

impl ThreadKind {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_uppercase()) {
            Some(ref upper) if upper == "PROJECT" => Self::Project,
            _ => Self::Inquiry,
        }
    }
}

/// Denormalized per-thread summary carried by the inbox.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboxThread {
    pub thread_id: String,
    pub kind: ThreadKind,
    pub status: Option<String>,
    pub last_message_at_ms: Option<i64>,
    pub unread_count: u64,
    pub pinned: bool,
    pub archived: bool,
    pub muted: bool,
    pub safe_mode_required: bool,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub moderation: Option<Value>,
}

impl InboxThread {
    fn empty(thread_id: String) -> Self {
        Self {
            thread_id,
            kind: ThreadKind::Inquiry,
            status: None,
            last_message_at_ms: None,
            unread_count: 0,
            pinned: false,
            archived: false,
            muted: false,
            safe_mode_required: false,
            title: None,
            subtitle: None,
            labels: Vec::new(),
            metadata: Map::new(),
            moderation: None,
        }
    }
}

/// Partial thread update; `None` fields leave the entry untouched.
#[derive(Clone, Debug, Default)]
pub struct ThreadPatch {
    pub thread_id: String,
    pub kind: Option<ThreadKind>,
    pub status: Option<String>,
    pub last_message_at_ms: Option<i64>,
    pub unread_count: Option<u64>,
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
    pub muted: Option<bool>,
    pub safe_mode_required: Option<bool>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub labels: Option<Vec<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub moderation: Option<Value>,
}

impl ThreadPatch {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Declined,
    Blocked,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub request_id: String,
    pub thread_id: String,
    pub credit_cost: f64,
    pub expires_at_ms: i64,
    pub created_at_ms: i64,
    pub status: RequestStatus,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimit {
    pub window_ms: i64,
    pub max_conversations: u32,
    pub initiations: Vec<i64>,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RATE_WINDOW_MS,
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
            initiations: Vec::new(),
        }
    }
}

impl RateLimit {
    fn pruned(&self, now_ms: i64) -> Vec<i64> {
        let cutoff = now_ms - self.window_ms;
        let mut kept: Vec<i64> = self
            .initiations
            .iter()
            .copied()
            .filter(|ts| *ts >= cutoff)
            .collect();
        kept.sort_unstable();
        kept
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Credits {
    pub available: f64,
    pub cost_per_request: f64,
    pub floor: f64,
}

impl Default for Credits {
    fn default() -> Self {
        Self {
            available: f64::INFINITY,
            cost_per_request: 0.0,
            floor: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InboxSnapshot {
    pub threads: Vec<ThreadPatch>,
    pub requests: Vec<MessageRequestSeed>,
    pub rate_limit: Option<RateLimitSeed>,
    pub credits: Option<CreditsSeed>,
}

#[derive(Clone, Debug, Default)]
pub struct MessageRequestSeed {
    pub request_id: String,
    pub thread_id: String,
    pub credit_cost: f64,
    pub expires_at_ms: i64,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Default)]
pub struct RateLimitSeed {
    pub window_ms: Option<i64>,
    pub max_conversations: Option<u32>,
    pub initiations: Vec<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct CreditsSeed {
    pub available: Option<f64>,
    pub cost_per_request: Option<f64>,
    pub floor: Option<f64>,
}

#[derive(Clone, Debug)]
pub enum InboxEvent {
    ThreadCreated { thread: ThreadPatch },
    ThreadUpdated { thread: ThreadPatch },
    ThreadRead { thread_id: String },
    ThreadPinned { thread_id: String },
    ThreadUnpinned { thread_id: String },
    ThreadArchived { thread_id: String },
    ThreadUnarchived { thread_id: String },
    ThreadMuted { thread_id: String, muted: bool },
    ThreadBlocked { thread_id: String, status: Option<String>, moderation: Option<Value> },
    ThreadUnblocked { thread_id: String, status: Option<String>, moderation: Option<Value> },
    ThreadMessageReceived {
        thread_id: String,
        last_message_at_ms: Option<i64>,
        increment_unread: u64,
    },
    RequestReceived { request: MessageRequestSeed },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConversationGate {
    Allowed { remaining: u32 },
    InsufficientCredits { available: f64, required: f64 },
    RateLimitExceeded { next_allowed_at_ms: i64 },
}

impl ConversationGate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadFolder {
    #[default]
    Default,
    Pinned,
    Archived,
    Requests,
}

/// Filter for `select_threads`. The requests folder carries a different
/// record shape and is served by `select_requests`.
#[derive(Default)]
pub struct ThreadFilter<'a> {
    pub folder: ThreadFolder,
    pub include_archived: bool,
    pub only_unread: bool,
    pub kinds: Option<Vec<ThreadKind>>,
    pub muted: Option<bool>,
    pub safe_mode_required: Option<bool>,
    pub query: Option<&'a str>,
    pub query_matcher: Option<&'a dyn Fn(&InboxThread, &str) -> bool>,
    pub predicate: Option<&'a dyn Fn(&InboxThread) -> bool>,
}

fn default_query_match(thread: &InboxThread, needle: &str) -> bool {
    let mut haystack: Vec<&str> = vec![&thread.thread_id];
    let kind = match thread.kind {
        ThreadKind::Inquiry => "INQUIRY",
        ThreadKind::Project => "PROJECT",
    };
    haystack.push(kind);
    if let Some(status) = &thread.status {
        haystack.push(status);
    }
    if let Some(title) = &thread.title {
        haystack.push(title);
    }
    if let Some(subtitle) = &thread.subtitle {
        haystack.push(subtitle);
    }
    for label in &thread.labels {
        haystack.push(label);
    }
    let mut metadata_fields = Vec::new();
    if let Some(Value::String(display_name)) = thread.metadata.get("displayName") {
        metadata_fields.push(display_name.clone());
    }
    if let Some(Value::String(search_text)) = thread.metadata.get("searchText") {
        metadata_fields.push(search_text.clone());
    }
    if let Some(Value::Array(tokens)) = thread.metadata.get("searchTokens") {
        for token in tokens {
            if let Value::String(token) = token {
                metadata_fields.push(token.clone());
            }
        }
    }
    haystack
        .iter()
        .map(|value| value.to_ascii_lowercase())
        .chain(metadata_fields.iter().map(|value| value.to_ascii_lowercase()))
        .any(|value| value.contains(needle))
}

/// Conversation list projection. Pure value type: every mutation returns
/// a fresh state (`None` when the event was a no-op) so callers can detect
/// change without diffing.
#[derive(Clone, Debug, PartialEq)]
pub struct InboxState {
    threads_by_id: HashMap<String, InboxThread>,
    ordered_thread_ids: Vec<String>,
    pinned_thread_ids: Vec<String>,
    archived_thread_ids: Vec<String>,
    unread_by_thread_id: HashMap<String, u64>,
    requests_by_id: HashMap<String, MessageRequest>,
    request_order: Vec<String>,
    credits: Credits,
    rate_limit: RateLimit,
    last_updated_at_ms: i64,
}

impl InboxState {
    pub fn from_snapshot(snapshot: InboxSnapshot, now_ms: i64) -> Self {
        let mut state = Self {
            threads_by_id: HashMap::new(),
            ordered_thread_ids: Vec::new(),
            pinned_thread_ids: Vec::new(),
            archived_thread_ids: Vec::new(),
            unread_by_thread_id: HashMap::new(),
            requests_by_id: HashMap::new(),
            request_order: Vec::new(),
            credits: Credits {
                available: snapshot
                    .credits
                    .as_ref()
                    .and_then(|seed| seed.available)
                    .unwrap_or(f64::INFINITY),
                cost_per_request: snapshot
                    .credits
                    .as_ref()
                    .and_then(|seed| seed.cost_per_request)
                    .unwrap_or(0.0),
                floor: snapshot
                    .credits
                    .as_ref()
                    .and_then(|seed| seed.floor)
                    .unwrap_or(0.0),
            },
            rate_limit: RateLimit {
                window_ms: snapshot
                    .rate_limit
                    .as_ref()
                    .and_then(|seed| seed.window_ms)
                    .unwrap_or(DEFAULT_RATE_WINDOW_MS),
                max_conversations: snapshot
                    .rate_limit
                    .as_ref()
                    .and_then(|seed| seed.max_conversations)
                    .unwrap_or(DEFAULT_MAX_CONVERSATIONS),
                initiations: snapshot
                    .rate_limit
                    .as_ref()
                    .map(|seed| seed.initiations.clone())
                    .unwrap_or_default(),
            },
            last_updated_at_ms: now_ms,
        };

        let mut threads = snapshot.threads;
        threads.sort_by(|a, b| {
            b.last_message_at_ms
                .unwrap_or(0)
                .cmp(&a.last_message_at_ms.unwrap_or(0))
        });
        for patch in threads {
            if patch.thread_id.trim().is_empty() {
                continue;
            }
            let mut entry = InboxThread::empty(patch.thread_id.clone());
            apply_patch(&mut entry, &patch);
            state
                .unread_by_thread_id
                .insert(entry.thread_id.clone(), entry.unread_count);
            state.ordered_thread_ids.push(entry.thread_id.clone());
            if entry.pinned {
                state.pinned_thread_ids.push(entry.thread_id.clone());
            }
            if entry.archived {
                state.archived_thread_ids.push(entry.thread_id.clone());
            }
            state.threads_by_id.insert(entry.thread_id.clone(), entry);
        }

        let mut requests = snapshot.requests;
        requests.sort_by_key(|seed| seed.created_at_ms);
        for seed in requests {
            if seed.request_id.trim().is_empty() {
                continue;
            }
            state.request_order.push(seed.request_id.clone());
            state.requests_by_id.insert(
                seed.request_id.clone(),
                MessageRequest {
                    request_id: seed.request_id,
                    thread_id: seed.thread_id,
                    credit_cost: seed.credit_cost,
                    expires_at_ms: seed.expires_at_ms,
                    created_at_ms: seed.created_at_ms,
                    status: RequestStatus::Pending,
                },
            );
        }
        state
    }

    pub fn thread(&self, thread_id: &str) -> Option<&InboxThread> {
        self.threads_by_id.get(thread_id)
    }

    pub fn ordered_thread_ids(&self) -> &[String] {
        &self.ordered_thread_ids
    }

    pub fn pinned_thread_ids(&self) -> &[String] {
        &self.pinned_thread_ids
    }

    pub fn archived_thread_ids(&self) -> &[String] {
        &self.archived_thread_ids
    }

    pub fn request(&self, request_id: &str) -> Option<&MessageRequest> {
        self.requests_by_id.get(request_id)
    }

    pub fn credits(&self) -> &Credits {
        &self.credits
    }

    pub fn rate_limit(&self) -> &RateLimit {
        &self.rate_limit
    }

    pub fn total_unread(&self) -> u64 {
        self.unread_by_thread_id.values().sum()
    }

    fn ensure_thread(&mut self, patch: &ThreadPatch, now_ms: i64) {
        if !self.threads_by_id.contains_key(&patch.thread_id) {
            self.ordered_thread_ids.insert(0, patch.thread_id.clone());
        }
        let entry = self
            .threads_by_id
            .entry(patch.thread_id.clone())
            .or_insert_with(|| InboxThread::empty(patch.thread_id.clone()));
        apply_patch(entry, patch);
        let pinned = entry.pinned;
        let archived = entry.archived;
        let unread = entry.unread_count;
        self.unread_by_thread_id
            .insert(patch.thread_id.clone(), unread);
        reconcile_membership(&mut self.pinned_thread_ids, &patch.thread_id, pinned);
        reconcile_membership(&mut self.archived_thread_ids, &patch.thread_id, archived);
        self.last_updated_at_ms = now_ms;
    }

    fn reorder_thread(&mut self, thread_id: &str, last_message_at_ms: Option<i64>, now_ms: i64) {
        self.ordered_thread_ids.retain(|id| id != thread_id);
        // events without a timestamp keep the stored value
        let effective = last_message_at_ms.or_else(|| {
            self.threads_by_id
                .get(thread_id)
                .and_then(|thread| thread.last_message_at_ms)
        });
        let target = effective.unwrap_or(0);
        let position = self.ordered_thread_ids.iter().position(|id| {
            let current = self
                .threads_by_id
                .get(id)
                .and_then(|thread| thread.last_message_at_ms)
                .unwrap_or(0);
            target >= current
        });
        match position {
            Some(index) => self.ordered_thread_ids.insert(index, thread_id.to_string()),
            None => self.ordered_thread_ids.push(thread_id.to_string()),
        }
        if let Some(entry) = self.threads_by_id.get_mut(thread_id) {
            entry.last_message_at_ms = effective;
        }
        self.last_updated_at_ms = now_ms;
    }

    fn mutate_known_thread<F>(&self, thread_id: &str, now_ms: i64, mutate: F) -> Option<Self>
    where
        F: FnOnce(&mut Self, &mut InboxThread),
    {
        if !self.threads_by_id.contains_key(thread_id) {
            return None;
        }
        let mut next = self.clone();
        let mut entry = next.threads_by_id.get(thread_id).cloned()?;
        mutate(&mut next, &mut entry);
        next.threads_by_id.insert(thread_id.to_string(), entry);
        next.last_updated_at_ms = now_ms;
        Some(next)
    }

    pub fn apply_event(&self, event: &InboxEvent, now_ms: i64) -> Option<Self> {
        match event {
            InboxEvent::ThreadCreated { thread } => {
                let mut next = self.clone();
                next.ensure_thread(thread, now_ms);
                Some(next)
            }
            InboxEvent::ThreadUpdated { thread } => {
                let mut next = self.clone();
                next.ensure_thread(thread, now_ms);
                if thread.last_message_at_ms.is_some() {
                    next.reorder_thread(&thread.thread_id, thread.last_message_at_ms, now_ms);
                }
                Some(next)
            }
            InboxEvent::ThreadRead { thread_id } => {
                self.mutate_known_thread(thread_id, now_ms, |next, entry| {
                    entry.unread_count = 0;
                    next.unread_by_thread_id.insert(thread_id.clone(), 0);
                })
            }
            InboxEvent::ThreadPinned { thread_id } => {
                self.mutate_known_thread(thread_id, now_ms, |next, entry| {
                    entry.pinned = true;
                    reconcile_membership(&mut next.pinned_thread_ids, thread_id, true);
                })
            }
            InboxEvent::ThreadUnpinned { thread_id } => {
                self.mutate_known_thread(thread_id, now_ms, |next, entry| {
                    entry.pinned = false;
                    reconcile_membership(&mut next.pinned_thread_ids, thread_id, false);
                })
            }
            InboxEvent::ThreadArchived { thread_id } => {
                self.mutate_known_thread(thread_id, now_ms, |next, entry| {
                    entry.archived = true;
                    reconcile_membership(&mut next.archived_thread_ids, thread_id, true);
                })
            }
            InboxEvent::ThreadUnarchived { thread_id } => {
                self.mutate_known_thread(thread_id, now_ms, |next, entry| {
                    entry.archived = false;
                    reconcile_membership(&mut next.archived_thread_ids, thread_id, false);
                })
            }
            InboxEvent::ThreadMuted { thread_id, muted } => {
                self.mutate_known_thread(thread_id, now_ms, |_, entry| {
                    entry.muted = *muted;
                })
            }
            InboxEvent::ThreadBlocked {
                thread_id,
                status,
                moderation,
            } => self.mutate_known_thread(thread_id, now_ms, |_, entry| {
                if status.is_some() {
                    entry.status = status.clone();
                }
                if moderation.is_some() {
                    entry.moderation = moderation.clone();
                }
            }),
            InboxEvent::ThreadUnblocked {
                thread_id,
                status,
                moderation,
            } => self.mutate_known_thread(thread_id, now_ms, |_, entry| {
                if status.is_some() {
                    entry.status = status.clone();
                }
                if moderation.is_some() {
                    entry.moderation = moderation.clone();
                }
            }),
            InboxEvent::ThreadMessageReceived {
                thread_id,
                last_message_at_ms,
                increment_unread,
            } => {
                if !self.threads_by_id.contains_key(thread_id) {
                    return None;
                }
                let mut next = self.clone();
                next.reorder_thread(thread_id, *last_message_at_ms, now_ms);
                let unread = next.unread_by_thread_id.get(thread_id).copied().unwrap_or(0)
                    + increment_unread;
                next.unread_by_thread_id.insert(thread_id.clone(), unread);
                if let Some(entry) = next.threads_by_id.get_mut(thread_id) {
                    entry.unread_count = unread;
                }
                Some(next)
            }
            InboxEvent::RequestReceived { request } => {
                if request.request_id.trim().is_empty() {
                    return None;
                }
                let mut next = self.clone();
                if !next.request_order.contains(&request.request_id) {
                    next.request_order.push(request.request_id.clone());
                }
                next.requests_by_id.insert(
                    request.request_id.clone(),
                    MessageRequest {
                        request_id: request.request_id.clone(),
                        thread_id: request.thread_id.clone(),
                        credit_cost: request.credit_cost,
                        expires_at_ms: request.expires_at_ms,
                        created_at_ms: request.created_at_ms,
                        status: RequestStatus::Pending,
                    },
                );
                next.last_updated_at_ms = now_ms;
                Some(next)
            }
        }
    }

    /// Credit balance is checked before the rate-limit window.
    pub fn can_start_conversation(
        &self,
        now_ms: i64,
        required_credits: Option<f64>,
    ) -> ConversationGate {
        let required = required_credits.unwrap_or(self.credits.cost_per_request);
        if self.credits.available < required {
            return ConversationGate::InsufficientCredits {
                available: self.credits.available,
                required,
            };
        }
        let pruned = self.rate_limit.pruned(now_ms);
        if pruned.len() >= self.rate_limit.max_conversations as usize {
            let oldest = pruned.first().copied().unwrap_or(now_ms);
            return ConversationGate::RateLimitExceeded {
                next_allowed_at_ms: oldest + self.rate_limit.window_ms,
            };
        }
        ConversationGate::Allowed {
            remaining: self.rate_limit.max_conversations - pruned.len() as u32,
        }
    }

    pub fn record_conversation_start(&self, now_ms: i64, credits_spent: Option<f64>) -> Self {
        let spent = credits_spent.unwrap_or(self.credits.cost_per_request);
        let mut next = self.clone();
        next.rate_limit.initiations = next.rate_limit.pruned(now_ms);
        next.rate_limit.initiations.push(now_ms);
        next.credits.available = (next.credits.available - spent).max(next.credits.floor);
        next.last_updated_at_ms = now_ms;
        next
    }

    /// Atomic move: the request leaves the request set, credits are
    /// debited (floored), and the thread lands in the default inbox.
    pub fn accept_message_request(&self, request_id: &str, now_ms: i64) -> Option<Self> {
        let request = self.requests_by_id.get(request_id)?.clone();
        let mut next = self.clone();
        next.requests_by_id.remove(request_id);
        next.request_order.retain(|id| id != request_id);
        let unread = next
            .unread_by_thread_id
            .get(&request.thread_id)
            .copied()
            .unwrap_or(0);
        let patch = ThreadPatch {
            thread_id: request.thread_id.clone(),
            last_message_at_ms: Some(now_ms),
            unread_count: Some(unread),
            archived: Some(false),
            pinned: Some(false),
            ..Default::default()
        };
        next.ensure_thread(&patch, now_ms);
        next.credits.available =
            (next.credits.available - request.credit_cost).max(next.credits.floor);
        next.last_updated_at_ms = now_ms;
        Some(next)
    }

    pub fn decline_message_request(
        &self,
        request_id: &str,
        block: bool,
        now_ms: i64,
    ) -> Option<Self> {
        if !self.requests_by_id.contains_key(request_id) {
            return None;
        }
        let mut next = self.clone();
        if let Some(request) = next.requests_by_id.get_mut(request_id) {
            request.status = if block {
                RequestStatus::Blocked
            } else {
                RequestStatus::Declined
            };
        }
        next.last_updated_at_ms = now_ms;
        Some(next)
    }

    pub fn prune_expired_requests(&self, now_ms: i64) -> Self {
        let mut next = self.clone();
        let order = std::mem::take(&mut next.request_order);
        let mut kept = Vec::with_capacity(order.len());
        for request_id in order {
            let Some(request) = next.requests_by_id.get(&request_id) else {
                continue;
            };
            if request.expires_at_ms <= now_ms || request.status != RequestStatus::Pending {
                next.requests_by_id.remove(&request_id);
                continue;
            }
            kept.push(request_id);
        }
        next.request_order = kept;
        next.last_updated_at_ms = now_ms;
        next
    }

    pub fn select_threads(&self, filter: &ThreadFilter<'_>) -> Vec<InboxThread> {
        if filter.folder == ThreadFolder::Requests {
            return Vec::new();
        }
        let candidate_ids = match filter.folder {
            ThreadFolder::Pinned => &self.pinned_thread_ids,
            ThreadFolder::Archived => &self.archived_thread_ids,
            _ => &self.ordered_thread_ids,
        };
        let kind_set: Option<HashSet<ThreadKind>> = filter
            .kinds
            .as_ref()
            .filter(|kinds| !kinds.is_empty())
            .map(|kinds| kinds.iter().copied().collect());
        let query = filter
            .query
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_ascii_lowercase);

        candidate_ids
            .iter()
            .filter_map(|thread_id| {
                let thread = self.threads_by_id.get(thread_id)?;
                if !filter.include_archived
                    && thread.archived
                    && filter.folder != ThreadFolder::Archived
                {
                    return None;
                }
                let unread_count = self
                    .unread_by_thread_id
                    .get(thread_id)
                    .copied()
                    .unwrap_or(thread.unread_count);
                let mut candidate = thread.clone();
                candidate.unread_count = unread_count;
                if filter.only_unread && unread_count == 0 {
                    return None;
                }
                if let Some(kind_set) = &kind_set {
                    if !kind_set.contains(&candidate.kind) {
                        return None;
                    }
                }
                if let Some(muted) = filter.muted {
                    if candidate.muted != muted {
                        return None;
                    }
                }
                if let Some(safe_mode_required) = filter.safe_mode_required {
                    if candidate.safe_mode_required != safe_mode_required {
                        return None;
                    }
                }
                if let Some(query) = &query {
                    let matched = default_query_match(&candidate, query)
                        || filter
                            .query_matcher
                            .map(|matcher| matcher(&candidate, query))
                            .unwrap_or(false);
                    if !matched {
                        return None;
                    }
                }
                if let Some(predicate) = filter.predicate {
                    if !predicate(&candidate) {
                        return None;
                    }
                }
                Some(candidate)
            })
            .collect()
    }

    /// Requests folder companion to `select_threads`.
    pub fn select_requests(&self, query: Option<&str>) -> Vec<MessageRequest> {
        let query = query
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_ascii_lowercase);
        self.request_order
            .iter()
            .filter_map(|request_id| self.requests_by_id.get(request_id))
            .filter(|request| {
                let Some(query) = &query else {
                    return true;
                };
                let status = match request.status {
                    RequestStatus::Pending => "pending",
                    RequestStatus::Declined => "declined",
                    RequestStatus::Blocked => "blocked",
                };
                request.request_id.to_ascii_lowercase().contains(query)
                    || request.thread_id.to_ascii_lowercase().contains(query)
                    || status.contains(query)
                    || request.credit_cost.to_string().contains(query.as_str())
            })
            .cloned()
            .collect()
    }
}

fn apply_patch(entry: &mut InboxThread, patch: &ThreadPatch) {
    if let Some(kind) = patch.kind {
        entry.kind = kind;
    }
    if patch.status.is_some() {
        entry.status = patch.status.clone();
    }
    if patch.last_message_at_ms.is_some() {
        entry.last_message_at_ms = patch.last_message_at_ms;
    }
    if let Some(unread_count) = patch.unread_count {
        entry.unread_count = unread_count;
    }
    if let Some(pinned) = patch.pinned {
        entry.pinned = pinned;
    }
    if let Some(archived) = patch.archived {
        entry.archived = archived;
    }
    if let Some(muted) = patch.muted {
        entry.muted = muted;
    }
    if let Some(safe_mode_required) = patch.safe_mode_required {
        entry.safe_mode_required = safe_mode_required;
    }
    if patch.title.is_some() {
        entry.title = patch.title.clone();
    }
    if patch.subtitle.is_some() {
        entry.subtitle = patch.subtitle.clone();
    }
    if let Some(labels) = &patch.labels {
        entry.labels = labels.clone();
    }
    if let Some(metadata) = &patch.metadata {
        entry.metadata = metadata.clone();
    }
    if patch.moderation.is_some() {
        entry.moderation = patch.moderation.clone();
    }
}

fn reconcile_membership(ids: &mut Vec<String>, thread_id: &str, member: bool) {
    let present = ids.iter().any(|id| id == thread_id);
    if member && !present {
        ids.push(thread_id.to_string());
    } else if !member && present {
        ids.retain(|id| id != thread_id);
    }
}
