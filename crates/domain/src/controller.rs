use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::action_cards::{ActionCard, ActionCardAudit, ActionCardDefinition, ActionCardEngine, TransitionEdge, TransitionOptions};
use crate::error::DomainError;
use crate::inbox::{
    ConversationGate, InboxEvent, InboxSnapshot, InboxState, InboxThread, MessageRequest,
    ThreadFilter, ThreadPatch,
};
use crate::moderation::{
    CaseFilter, CaseInput, CasePatch, DecisionInput, ModerationCase, ModerationQueue, QueueStats,
    ResolutionInput,
};
use crate::notifications::{
    DigestSummary, NotificationInput, NotificationItem, NotificationQueue, NotificationQueueConfig,
};
use crate::thread::{
    MessageInput, ModerationPatch, OptimisticMessageInput, ThreadEvent, ThreadSnapshot,
    ThreadState,
};
use crate::uploads::{
    AttachmentStatusUpdate, CompleteDetails, SignedDetails, UploadDescriptor, UploadItem,
    UploadManager, UploadProgress,
};
use crate::util::{lock_unpoisoned, system_clock, Clock, IdSource, UuidIdSource};
use crate::DomainResult;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChangeScope {
    Inbox,
    Thread,
    Notifications,
    ModerationQueue,
    Uploads,
}

/// Scoped description of one state transition inside a batch.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub scope: ChangeScope,
    pub thread_id: Option<String>,
    pub action: String,
    pub detail: Map<String, Value>,
}

impl ChangeRecord {
    fn new(scope: ChangeScope, action: &str) -> Self {
        Self {
            scope,
            thread_id: None,
            action: action.to_string(),
            detail: Map::new(),
        }
    }

    fn with_thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }
}

/// Borrowed view handed to listeners alongside the change batch.
#[derive(Clone, Copy)]
pub struct ControllerSnapshot<'a> {
    pub inbox: &'a InboxState,
    pub threads: &'a HashMap<String, ThreadState>,
    pub notifications: &'a NotificationQueue,
    pub moderation: &'a ModerationQueue,
    pub uploads: &'a UploadManager,
    pub viewer_user_id: Option<&'a str>,
}

pub type Listener =
    dyn for<'a> Fn(&'a [ChangeRecord], ControllerSnapshot<'a>) -> DomainResult<()> + Send + Sync;

type ListenerList = Arc<Mutex<Vec<(u64, Arc<Listener>)>>>;

pub struct SubscriptionHandle {
    listeners: Weak<Mutex<Vec<(u64, Arc<Listener>)>>>,
    id: u64,
    active: bool,
}

impl SubscriptionHandle {
    pub fn dispose(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(listeners) = self.listeners.upgrade() {
            lock_unpoisoned(&listeners).retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub struct ControllerOptions {
    pub viewer_user_id: Option<String>,
    pub inbox: InboxSnapshot,
    pub threads: Vec<ThreadSnapshot>,
    pub notifications: NotificationQueueConfig,
    pub moderation_cases: Vec<CaseInput>,
    pub upload_ttl_ms: Option<i64>,
    pub definitions: Option<HashMap<String, ActionCardDefinition>>,
    pub clock: Option<Clock>,
    pub ids: Option<Arc<dyn IdSource>>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            viewer_user_id: None,
            inbox: InboxSnapshot::default(),
            threads: Vec::new(),
            notifications: NotificationQueueConfig::default(),
            moderation_cases: Vec::new(),
            upload_ttl_ms: None,
            definitions: None,
            clock: None,
            ids: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MarkReadOptions {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub last_read_msg_id: Option<String>,
    pub read_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct ReportMessageOptions {
    pub state: Option<String>,
    pub reason: Option<String>,
    pub severity: Option<String>,
    pub reported_by: Option<String>,
    pub reported_at_ms: Option<i64>,
    pub audit_trail_id: Option<String>,
    pub notes: Option<String>,
    pub case_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub skip_case: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ReportThreadOptions {
    pub block: bool,
    pub lock: bool,
    pub reason: Option<String>,
    pub severity: Option<String>,
    pub reported_by: Option<String>,
    pub reported_at_ms: Option<i64>,
    pub audit_trail_id: Option<String>,
    pub case_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub skip_case: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LockOptions {
    pub status: Option<String>,
    pub reason: Option<String>,
    pub severity: Option<String>,
    pub reported_by: Option<String>,
    pub audit_trail_id: Option<String>,
    pub case_id: Option<String>,
    pub metadata: Map<String, Value>,
    /// Lock/unlock only enqueue a case when asked to.
    pub enqueue_case: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BlockOptions {
    pub locked: Option<bool>,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub severity: Option<String>,
    pub reported_by: Option<String>,
    pub audit_trail_id: Option<String>,
    pub case_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub skip_case: bool,
}

fn moderation_to_value(state: &ThreadState) -> Option<Value> {
    state
        .moderation()
        .and_then(|moderation| serde_json::to_value(moderation).ok())
}

fn map_thread_event_to_inbox(
    event: &ThreadEvent,
    next: &ThreadState,
    viewer_user_id: Option<&str>,
) -> Option<InboxEvent> {
    let thread_id = next.thread.thread_id.clone();
    match event {
        ThreadEvent::MessageCreated { message, .. } => {
            let from_other_author = match (message.author_user_id.as_deref(), viewer_user_id) {
                (Some(author), Some(viewer)) => author != viewer,
                _ => false,
            };
            Some(InboxEvent::ThreadMessageReceived {
                thread_id,
                last_message_at_ms: next.thread.last_message_at_ms,
                increment_unread: u64::from(from_other_author),
            })
        }
        ThreadEvent::MessageUpdated { .. } => Some(InboxEvent::ThreadUpdated {
            thread: ThreadPatch {
                last_message_at_ms: next.thread.last_message_at_ms,
                ..ThreadPatch::new(thread_id)
            },
        }),
        ThreadEvent::ThreadStatusChanged { .. } => Some(InboxEvent::ThreadUpdated {
            thread: ThreadPatch {
                status: Some(next.thread.status.clone()),
                ..ThreadPatch::new(thread_id)
            },
        }),
        ThreadEvent::ThreadModerationUpdated { patch } => {
            let blocked = patch
                .blocked
                .or_else(|| next.moderation().map(|moderation| moderation.blocked));
            let status = Some(next.thread.status.clone());
            let moderation = moderation_to_value(next);
            match blocked {
                Some(true) => Some(InboxEvent::ThreadBlocked {
                    thread_id,
                    status,
                    moderation,
                }),
                Some(false) => Some(InboxEvent::ThreadUnblocked {
                    thread_id,
                    status,
                    moderation,
                }),
                None => Some(InboxEvent::ThreadUpdated {
                    thread: ThreadPatch {
                        status,
                        moderation,
                        ..ThreadPatch::new(thread_id)
                    },
                }),
            }
        }
        ThreadEvent::SafeModeOverride { .. } => Some(InboxEvent::ThreadUpdated {
            thread: ThreadPatch {
                safe_mode_required: Some(next.thread.safe_mode_required),
                ..ThreadPatch::new(thread_id)
            },
        }),
        ThreadEvent::ReadReceiptUpdated { user_id, .. } => {
            if viewer_user_id == Some(user_id.as_str()) {
                Some(InboxEvent::ThreadRead { thread_id })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Composes the inbox store, per-thread stores, notification queue,
/// moderation queue, and upload manager behind one subscribe/emit
/// surface. Thread-scoped events are translated into inbox side effects
/// so the two stores never diverge.
pub struct MessagingController {
    viewer_user_id: Option<String>,
    inbox: InboxState,
    threads: HashMap<String, ThreadState>,
    notifications: NotificationQueue,
    moderation: ModerationQueue,
    uploads: UploadManager,
    engine: ActionCardEngine,
    clock: Clock,
    ids: Arc<dyn IdSource>,
    listeners: ListenerList,
    listener_seq: AtomicU64,
}

impl MessagingController {
    pub fn new(options: ControllerOptions) -> Self {
        let clock = options.clock.unwrap_or_else(system_clock);
        let ids = options.ids.unwrap_or_else(|| Arc::new(UuidIdSource));
        let now = clock();
        let engine = match options.definitions {
            Some(definitions) => ActionCardEngine::new(definitions),
            None => ActionCardEngine::default(),
        };
        let mut threads = HashMap::new();
        for snapshot in options.threads {
            match ThreadState::new(snapshot, now) {
                Ok(state) => {
                    threads.insert(state.thread.thread_id.clone(), state);
                }
                Err(err) => warn!(error = %err, "dropped unhydratable thread snapshot"),
            }
        }
        Self {
            viewer_user_id: options.viewer_user_id,
            inbox: InboxState::from_snapshot(options.inbox, now),
            threads,
            notifications: NotificationQueue::new(options.notifications, now),
            moderation: ModerationQueue::new(options.moderation_cases, now),
            uploads: UploadManager::new(options.upload_ttl_ms, now),
            engine,
            clock,
            ids,
            listeners: Arc::new(Mutex::new(Vec::new())),
            listener_seq: AtomicU64::new(0),
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn viewer_user_id(&self) -> Option<&str> {
        self.viewer_user_id.as_deref()
    }

    pub fn set_viewer_user_id(&mut self, viewer_user_id: Option<String>) {
        self.viewer_user_id = viewer_user_id;
    }

    pub fn inbox(&self) -> &InboxState {
        &self.inbox
    }

    pub fn thread(&self, thread_id: &str) -> Option<&ThreadState> {
        self.threads.get(thread_id)
    }

    pub fn thread_ids(&self) -> Vec<String> {
        self.threads.keys().cloned().collect()
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    pub fn moderation_queue(&self) -> &ModerationQueue {
        &self.moderation
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn engine(&self) -> &ActionCardEngine {
        &self.engine
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: for<'a> Fn(&'a [ChangeRecord], ControllerSnapshot<'a>) -> DomainResult<()>
            + Send
            + Sync
            + 'static,
    {
        let id = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        let listener: Arc<Listener> = Arc::new(listener);
        lock_unpoisoned(&self.listeners).push((id, listener));
        SubscriptionHandle {
            listeners: Arc::downgrade(&self.listeners),
            id,
            active: true,
        }
    }

    /// Tears down every live subscription.
    pub fn dispose(&self) {
        lock_unpoisoned(&self.listeners).clear();
    }

    /// Every listener runs even when one fails; the first failure is
    /// surfaced to the caller that triggered the mutation.
    fn emit(&self, changes: &[ChangeRecord]) -> DomainResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let listeners: Vec<Arc<Listener>> = lock_unpoisoned(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        let snapshot = ControllerSnapshot {
            inbox: &self.inbox,
            threads: &self.threads,
            notifications: &self.notifications,
            moderation: &self.moderation,
            uploads: &self.uploads,
            viewer_user_id: self.viewer_user_id.as_deref(),
        };
        let mut first_error = None;
        for listener in listeners {
            if let Err(err) = listener(changes, snapshot) {
                warn!(error = %err, "change listener failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- inbox -----------------------------------------------------------

    pub fn hydrate_inbox(&mut self, snapshot: InboxSnapshot) -> DomainResult<()> {
        let now = self.now();
        self.inbox = InboxState::from_snapshot(snapshot, now);
        self.emit(&[ChangeRecord::new(ChangeScope::Inbox, "hydrate")])
    }

    pub fn apply_inbox_event(&mut self, event: &InboxEvent) -> DomainResult<bool> {
        let now = self.now();
        let Some(next) = self.inbox.apply_event(event, now) else {
            return Ok(false);
        };
        self.inbox = next;
        self.emit(&[ChangeRecord::new(ChangeScope::Inbox, "event")])?;
        Ok(true)
    }

    pub fn can_start_conversation(&self, required_credits: Option<f64>) -> ConversationGate {
        self.inbox.can_start_conversation(self.now(), required_credits)
    }

    pub fn record_conversation_start(&mut self, credits_spent: Option<f64>) -> DomainResult<()> {
        let now = self.now();
        self.inbox = self.inbox.record_conversation_start(now, credits_spent);
        self.emit(&[ChangeRecord::new(ChangeScope::Inbox, "conversationStart")])
    }

    pub fn accept_message_request(&mut self, request_id: &str) -> DomainResult<bool> {
        let now = self.now();
        let Some(next) = self.inbox.accept_message_request(request_id, now) else {
            return Ok(false);
        };
        self.inbox = next;
        self.emit(&[
            ChangeRecord::new(ChangeScope::Inbox, "requestAccept")
                .with_detail("requestId", Value::String(request_id.to_string())),
        ])?;
        Ok(true)
    }

    pub fn decline_message_request(&mut self, request_id: &str, block: bool) -> DomainResult<bool> {
        let now = self.now();
        let Some(next) = self.inbox.decline_message_request(request_id, block, now) else {
            return Ok(false);
        };
        self.inbox = next;
        let action = if block { "requestBlock" } else { "requestDecline" };
        self.emit(&[
            ChangeRecord::new(ChangeScope::Inbox, action)
                .with_detail("requestId", Value::String(request_id.to_string())),
        ])?;
        Ok(true)
    }

    pub fn prune_expired_requests(&mut self) -> DomainResult<()> {
        let now = self.now();
        self.inbox = self.inbox.prune_expired_requests(now);
        self.emit(&[ChangeRecord::new(ChangeScope::Inbox, "pruneRequests")])
    }

    pub fn total_unread(&self) -> u64 {
        self.inbox.total_unread()
    }

    pub fn select_inbox_threads(&self, filter: &ThreadFilter<'_>) -> Vec<InboxThread> {
        self.inbox.select_threads(filter)
    }

    pub fn select_requests(&self, query: Option<&str>) -> Vec<MessageRequest> {
        self.inbox.select_requests(query)
    }

    fn mutate_inbox_thread(
        &mut self,
        thread_id: &str,
        event: InboxEvent,
        action: &str,
    ) -> DomainResult<bool> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation(format!(
                "{action} requires threadId"
            )));
        }
        let now = self.now();
        let Some(next) = self.inbox.apply_event(&event, now) else {
            return Ok(false);
        };
        self.inbox = next;
        self.emit(&[ChangeRecord::new(ChangeScope::Inbox, action).with_thread(thread_id)])?;
        Ok(true)
    }

    pub fn pin_thread(&mut self, thread_id: &str) -> DomainResult<bool> {
        self.mutate_inbox_thread(
            thread_id,
            InboxEvent::ThreadPinned {
                thread_id: thread_id.to_string(),
            },
            "threadPinned",
        )
    }

    pub fn unpin_thread(&mut self, thread_id: &str) -> DomainResult<bool> {
        self.mutate_inbox_thread(
            thread_id,
            InboxEvent::ThreadUnpinned {
                thread_id: thread_id.to_string(),
            },
            "threadUnpinned",
        )
    }

    pub fn archive_thread(&mut self, thread_id: &str) -> DomainResult<bool> {
        self.mutate_inbox_thread(
            thread_id,
            InboxEvent::ThreadArchived {
                thread_id: thread_id.to_string(),
            },
            "threadArchived",
        )
    }

    pub fn unarchive_thread(&mut self, thread_id: &str) -> DomainResult<bool> {
        self.mutate_inbox_thread(
            thread_id,
            InboxEvent::ThreadUnarchived {
                thread_id: thread_id.to_string(),
            },
            "threadUnarchived",
        )
    }

    pub fn mute_thread(&mut self, thread_id: &str, muted: bool) -> DomainResult<bool> {
        self.mutate_inbox_thread(
            thread_id,
            InboxEvent::ThreadMuted {
                thread_id: thread_id.to_string(),
                muted,
            },
            if muted { "threadMuted" } else { "threadUnmuted" },
        )
    }

    // ---- threads ---------------------------------------------------------

    pub fn hydrate_thread(
        &mut self,
        snapshot: ThreadSnapshot,
        sync_inbox: bool,
    ) -> DomainResult<()> {
        let now = self.now();
        let state = ThreadState::new(snapshot, now)?;
        let thread_id = state.thread.thread_id.clone();
        let inbox_patch = ThreadPatch {
            kind: Some(state.thread.kind),
            status: Some(state.thread.status.clone()),
            last_message_at_ms: state.thread.last_message_at_ms,
            safe_mode_required: Some(state.thread.safe_mode_required),
            ..ThreadPatch::new(thread_id.clone())
        };
        self.threads.insert(thread_id.clone(), state);
        let mut changes =
            vec![ChangeRecord::new(ChangeScope::Thread, "hydrate").with_thread(&thread_id)];
        if sync_inbox {
            if let Some(next) = self
                .inbox
                .apply_event(&InboxEvent::ThreadUpdated { thread: inbox_patch }, now)
            {
                self.inbox = next;
                changes.push(ChangeRecord::new(ChangeScope::Inbox, "sync").with_thread(&thread_id));
            }
        }
        self.emit(&changes)
    }

    pub fn remove_thread(&mut self, thread_id: &str) -> DomainResult<bool> {
        if self.threads.remove(thread_id).is_none() {
            return Ok(false);
        }
        self.emit(&[ChangeRecord::new(ChangeScope::Thread, "remove").with_thread(thread_id)])?;
        Ok(true)
    }

    fn apply_thread_event_internal(
        &mut self,
        thread_id: &str,
        event: &ThreadEvent,
        skip_inbox: bool,
    ) -> DomainResult<bool> {
        let now = self.now();
        let Some(current) = self.threads.get(thread_id) else {
            warn!(thread_id, "thread event dropped: unknown thread");
            return Ok(false);
        };
        let Some(next) = current.apply_event(event, now) else {
            return Ok(false);
        };
        let inbox_event = if skip_inbox {
            None
        } else {
            map_thread_event_to_inbox(event, &next, self.viewer_user_id.as_deref())
        };
        self.threads.insert(thread_id.to_string(), next);
        let mut changes =
            vec![ChangeRecord::new(ChangeScope::Thread, "event").with_thread(thread_id)];
        if let Some(inbox_event) = inbox_event {
            if let Some(next_inbox) = self.inbox.apply_event(&inbox_event, now) {
                self.inbox = next_inbox;
                changes.push(ChangeRecord::new(ChangeScope::Inbox, "sync").with_thread(thread_id));
            }
        }
        self.emit(&changes)?;
        Ok(true)
    }

    pub fn apply_thread_event(&mut self, thread_id: &str, event: &ThreadEvent) -> DomainResult<bool> {
        self.apply_thread_event_internal(thread_id, event, false)
    }

    pub fn mark_thread_read(
        &mut self,
        thread_id: &str,
        options: MarkReadOptions,
    ) -> DomainResult<bool> {
        let user_id = options
            .user_id
            .or_else(|| self.viewer_user_id.clone())
            .ok_or_else(|| {
                DomainError::Validation("markThreadRead requires a userId or viewer".into())
            })?;
        let read_at_ms = options.read_at_ms.unwrap_or_else(|| self.now());
        self.apply_thread_event_internal(
            thread_id,
            &ThreadEvent::ReadReceiptUpdated {
                user_id,
                role: options.role,
                last_read_msg_id: options.last_read_msg_id,
                last_read_at_ms: Some(read_at_ms),
            },
            false,
        )
    }

    pub fn enqueue_optimistic_message(
        &mut self,
        thread_id: &str,
        input: OptimisticMessageInput,
    ) -> DomainResult<bool> {
        let now = self.now();
        let Some(current) = self.threads.get(thread_id) else {
            warn!(thread_id, "optimistic enqueue dropped: unknown thread");
            return Ok(false);
        };
        let client_id = input.client_id.clone();
        let next = current.enqueue_optimistic(input, now)?;
        let last_message_at_ms = next.thread.last_message_at_ms;
        self.threads.insert(thread_id.to_string(), next);
        let mut changes = vec![ChangeRecord::new(ChangeScope::Thread, "optimistic")
            .with_thread(thread_id)
            .with_detail("clientId", Value::String(client_id))];
        // local sends never bump unread
        if let Some(next_inbox) = self.inbox.apply_event(
            &InboxEvent::ThreadMessageReceived {
                thread_id: thread_id.to_string(),
                last_message_at_ms,
                increment_unread: 0,
            },
            now,
        ) {
            self.inbox = next_inbox;
            changes.push(ChangeRecord::new(ChangeScope::Inbox, "sync").with_thread(thread_id));
        }
        self.emit(&changes)?;
        Ok(true)
    }

    pub fn resolve_optimistic_message(
        &mut self,
        thread_id: &str,
        client_id: &str,
        payload: MessageInput,
    ) -> DomainResult<bool> {
        let now = self.now();
        let Some(current) = self.threads.get(thread_id) else {
            warn!(thread_id, "optimistic resolve dropped: unknown thread");
            return Ok(false);
        };
        let Some(next) = current.resolve_optimistic(client_id, payload, now) else {
            return Ok(false);
        };
        let last_message_at_ms = next.thread.last_message_at_ms;
        self.threads.insert(thread_id.to_string(), next);
        let mut changes = vec![ChangeRecord::new(ChangeScope::Thread, "optimisticResolve")
            .with_thread(thread_id)
            .with_detail("clientId", Value::String(client_id.to_string()))];
        if let Some(next_inbox) = self.inbox.apply_event(
            &InboxEvent::ThreadUpdated {
                thread: ThreadPatch {
                    last_message_at_ms,
                    ..ThreadPatch::new(thread_id)
                },
            },
            now,
        ) {
            self.inbox = next_inbox;
            changes.push(ChangeRecord::new(ChangeScope::Inbox, "sync").with_thread(thread_id));
        }
        self.emit(&changes)?;
        Ok(true)
    }

    pub fn fail_optimistic_message(
        &mut self,
        thread_id: &str,
        client_id: &str,
        error_code: Option<&str>,
    ) -> DomainResult<bool> {
        let now = self.now();
        let Some(current) = self.threads.get(thread_id) else {
            warn!(thread_id, "optimistic fail dropped: unknown thread");
            return Ok(false);
        };
        let Some(next) = current.fail_optimistic(client_id, error_code, now) else {
            return Ok(false);
        };
        self.threads.insert(thread_id.to_string(), next);
        self.emit(&[ChangeRecord::new(ChangeScope::Thread, "optimisticFail")
            .with_thread(thread_id)
            .with_detail("clientId", Value::String(client_id.to_string()))])?;
        Ok(true)
    }

    pub fn apply_action_card_intent(
        &mut self,
        thread_id: &str,
        action_id: &str,
        intent: &str,
        options: &TransitionOptions,
    ) -> DomainResult<Option<ActionCardAudit>> {
        let now = self.now();
        let current = self.threads.get(thread_id).ok_or(DomainError::NotFound)?;
        let (next, audit) =
            current.apply_action_card_intent(&self.engine, action_id, intent, now, options)?;
        let last_message_at_ms = next.thread.last_message_at_ms;
        self.threads.insert(thread_id.to_string(), next);
        let mut changes = vec![ChangeRecord::new(ChangeScope::Thread, "actionCard")
            .with_thread(thread_id)
            .with_detail("actionId", Value::String(action_id.to_string()))
            .with_detail("intent", Value::String(intent.to_string()))];
        if let Some(next_inbox) = self.inbox.apply_event(
            &InboxEvent::ThreadUpdated {
                thread: ThreadPatch {
                    last_message_at_ms,
                    ..ThreadPatch::new(thread_id)
                },
            },
            now,
        ) {
            self.inbox = next_inbox;
            changes.push(ChangeRecord::new(ChangeScope::Inbox, "sync").with_thread(thread_id));
        }
        self.emit(&changes)?;
        Ok(audit)
    }

    pub fn unread_message_ids(&self, thread_id: &str, user_id: &str) -> Vec<String> {
        self.threads
            .get(thread_id)
            .map(|thread| thread.unread_message_ids(user_id))
            .unwrap_or_default()
    }

    pub fn action_cards(&self, thread_id: &str) -> Vec<ActionCard> {
        self.threads
            .get(thread_id)
            .map(|thread| thread.action_cards().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn action_card_transitions(&self, thread_id: &str, action_id: &str) -> Vec<TransitionEdge> {
        self.threads
            .get(thread_id)
            .map(|thread| thread.action_card_transitions(&self.engine, action_id))
            .unwrap_or_default()
    }

    // ---- notifications ---------------------------------------------------

    pub fn enqueue_notification(&mut self, input: NotificationInput) -> DomainResult<()> {
        let now = self.now();
        self.notifications = self.notifications.enqueue(input, now);
        self.emit(&[ChangeRecord::new(ChangeScope::Notifications, "enqueue")])
    }

    pub fn flush_notifications(&mut self) -> DomainResult<Vec<NotificationItem>> {
        let now = self.now();
        let (next, ready) = self.notifications.flush(now);
        self.notifications = next;
        self.emit(&[ChangeRecord::new(ChangeScope::Notifications, "flush")
            .with_detail("count", Value::from(ready.len()))])?;
        Ok(ready)
    }

    pub fn collect_notification_digest(&mut self) -> DomainResult<Vec<DigestSummary>> {
        let now = self.now();
        let (next, digest) = self.notifications.collect_digest(now);
        self.notifications = next;
        self.emit(&[ChangeRecord::new(ChangeScope::Notifications, "digest")
            .with_detail("count", Value::from(digest.len()))])?;
        Ok(digest)
    }

    pub fn pending_notifications(&self) -> Vec<NotificationItem> {
        self.notifications.pending().into_iter().cloned().collect()
    }

    // ---- moderation ------------------------------------------------------

    pub fn hydrate_moderation_queue(&mut self, cases: Vec<CaseInput>) -> DomainResult<()> {
        let now = self.now();
        self.moderation = ModerationQueue::new(cases, now);
        self.emit(&[ChangeRecord::new(ChangeScope::ModerationQueue, "hydrate")])
    }

    /// Used by compensating rollbacks at the client boundary.
    pub fn restore_moderation_queue(&mut self, queue: ModerationQueue) -> DomainResult<()> {
        self.moderation = queue;
        self.emit(&[ChangeRecord::new(ChangeScope::ModerationQueue, "restore")])
    }

    pub fn moderation_case(&self, case_id: &str) -> Option<ModerationCase> {
        self.moderation.get(case_id).cloned()
    }

    pub fn list_moderation_cases(&self, filter: &CaseFilter) -> Vec<ModerationCase> {
        self.moderation.select(filter)
    }

    pub fn pending_moderation_cases(&self) -> Vec<ModerationCase> {
        self.moderation.pending_cases()
    }

    pub fn moderation_stats(&self) -> QueueStats {
        self.moderation.stats()
    }

    pub fn enqueue_moderation_case(
        &mut self,
        input: CaseInput,
    ) -> DomainResult<Option<ModerationCase>> {
        let case_id = input.case_id.clone();
        let mut changes = Vec::new();
        self.enqueue_case_internal(input, "enqueueCase", None, &mut changes);
        self.emit(&changes)?;
        Ok(case_id.as_deref().and_then(|id| self.moderation_case(id)))
    }

    fn enqueue_case_internal(
        &mut self,
        input: CaseInput,
        action: &str,
        thread_id: Option<&str>,
        changes: &mut Vec<ChangeRecord>,
    ) {
        let now = self.now();
        if let Some(next) = self.moderation.enqueue_case(input, now) {
            self.moderation = next;
            let mut record = ChangeRecord::new(ChangeScope::ModerationQueue, action);
            if let Some(thread_id) = thread_id {
                record = record.with_thread(thread_id);
            }
            changes.push(record);
        }
    }

    pub fn report_message(
        &mut self,
        thread_id: &str,
        message_id: &str,
        options: ReportMessageOptions,
    ) -> DomainResult<Option<ModerationCase>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("reportMessage requires threadId".into()));
        }
        if message_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "reportMessage requires messageId".into(),
            ));
        }
        let now = self.now();
        let reported_at_ms = options.reported_at_ms.unwrap_or(now);
        let reporter = options
            .reported_by
            .clone()
            .or_else(|| self.viewer_user_id.clone());
        let moderation = serde_json::json!({
            "state": options
                .state
                .as_deref()
                .map(|state| state.trim().to_ascii_uppercase())
                .unwrap_or_else(|| "REPORTED".to_string()),
            "reason": options.reason.clone(),
            "reportedBy": reporter.clone(),
            "reportedAtMs": reported_at_ms,
            "severity": options.severity.clone(),
            "auditTrailId": options.audit_trail_id.clone(),
            "notes": options.notes.clone(),
        });
        self.apply_thread_event_internal(
            thread_id,
            &ThreadEvent::MessageModerationUpdated {
                message_id: message_id.to_string(),
                moderation: Some(moderation),
            },
            false,
        )?;
        if options.skip_case {
            return Ok(None);
        }
        let case_id = options
            .case_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id(&format!("message-{message_id}")));
        let mut changes = Vec::new();
        self.enqueue_case_internal(
            CaseInput {
                case_id: Some(case_id.clone()),
                case_type: Some("MESSAGE".to_string()),
                thread_id: Some(thread_id.to_string()),
                message_id: Some(message_id.to_string()),
                reason: options.reason.or(Some("REPORT".to_string())),
                severity: options.severity.or(Some("MEDIUM".to_string())),
                reported_by: reporter,
                reported_at_ms: Some(reported_at_ms),
                metadata: options.metadata,
                ..Default::default()
            },
            "reportMessage",
            Some(thread_id),
            &mut changes,
        );
        self.emit(&changes)?;
        Ok(self.moderation_case(&case_id))
    }

    fn apply_thread_moderation(
        &mut self,
        thread_id: &str,
        patch: ModerationPatch,
    ) -> DomainResult<bool> {
        self.apply_thread_event_internal(
            thread_id,
            &ThreadEvent::ThreadModerationUpdated { patch },
            false,
        )
    }

    pub fn report_thread(
        &mut self,
        thread_id: &str,
        options: ReportThreadOptions,
    ) -> DomainResult<Option<ModerationCase>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("reportThread requires threadId".into()));
        }
        if options.block {
            return self.block_thread(
                thread_id,
                BlockOptions {
                    reason: options.reason,
                    severity: options.severity,
                    reported_by: options.reported_by,
                    audit_trail_id: options.audit_trail_id,
                    case_id: options.case_id,
                    metadata: options.metadata,
                    skip_case: options.skip_case,
                    ..Default::default()
                },
            );
        }
        let now = self.now();
        if options.lock {
            self.apply_thread_moderation(
                thread_id,
                ModerationPatch {
                    locked: Some(true),
                    status: Some("LOCKED".to_string()),
                    reason: options.reason.clone(),
                    severity: options.severity.clone(),
                    audit_trail_id: options.audit_trail_id.clone(),
                    updated_at_ms: Some(now),
                    ..Default::default()
                },
            )?;
        } else {
            self.apply_thread_moderation(
                thread_id,
                ModerationPatch {
                    reason: options.reason.clone(),
                    severity: options.severity.clone(),
                    audit_trail_id: options.audit_trail_id.clone(),
                    updated_at_ms: Some(now),
                    ..Default::default()
                },
            )?;
        }
        if options.skip_case {
            return Ok(None);
        }
        let case_id = options
            .case_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id(&format!("thread-{thread_id}")));
        let mut changes = Vec::new();
        self.enqueue_case_internal(
            CaseInput {
                case_id: Some(case_id.clone()),
                case_type: Some("THREAD".to_string()),
                thread_id: Some(thread_id.to_string()),
                reason: options.reason.or(Some("REPORT".to_string())),
                severity: options.severity.or(Some("HIGH".to_string())),
                reported_by: options
                    .reported_by
                    .or_else(|| self.viewer_user_id.clone()),
                reported_at_ms: Some(options.reported_at_ms.unwrap_or(now)),
                metadata: options.metadata,
                ..Default::default()
            },
            "reportThread",
            Some(thread_id),
            &mut changes,
        );
        self.emit(&changes)?;
        Ok(self.moderation_case(&case_id))
    }

    pub fn lock_thread(
        &mut self,
        thread_id: &str,
        options: LockOptions,
    ) -> DomainResult<Option<ModerationCase>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("lockThread requires threadId".into()));
        }
        let now = self.now();
        self.apply_thread_moderation(
            thread_id,
            ModerationPatch {
                locked: Some(true),
                status: Some(options.status.clone().unwrap_or_else(|| "LOCKED".to_string())),
                reason: options.reason.clone(),
                severity: options.severity.clone(),
                audit_trail_id: options.audit_trail_id.clone(),
                updated_at_ms: Some(now),
                ..Default::default()
            },
        )?;
        if !options.enqueue_case {
            return Ok(None);
        }
        let case_id = options
            .case_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id(&format!("lock-{thread_id}")));
        let mut changes = Vec::new();
        self.enqueue_case_internal(
            CaseInput {
                case_id: Some(case_id.clone()),
                case_type: Some("THREAD".to_string()),
                thread_id: Some(thread_id.to_string()),
                reason: options.reason.or(Some("LOCK".to_string())),
                severity: options.severity.or(Some("HIGH".to_string())),
                reported_by: options
                    .reported_by
                    .or_else(|| self.viewer_user_id.clone()),
                reported_at_ms: Some(now),
                metadata: options.metadata,
                ..Default::default()
            },
            "lockThread",
            Some(thread_id),
            &mut changes,
        );
        self.emit(&changes)?;
        Ok(self.moderation_case(&case_id))
    }

    pub fn unlock_thread(
        &mut self,
        thread_id: &str,
        options: LockOptions,
    ) -> DomainResult<Option<ModerationCase>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("unlockThread requires threadId".into()));
        }
        let now = self.now();
        self.apply_thread_moderation(
            thread_id,
            ModerationPatch {
                locked: Some(false),
                status: Some(options.status.clone().unwrap_or_else(|| "OPEN".to_string())),
                reason: options.reason.clone(),
                audit_trail_id: options.audit_trail_id.clone(),
                updated_at_ms: Some(now),
                ..Default::default()
            },
        )?;
        if !options.enqueue_case {
            return Ok(None);
        }
        let case_id = options
            .case_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id(&format!("unlock-{thread_id}")));
        let mut changes = Vec::new();
        self.enqueue_case_internal(
            CaseInput {
                case_id: Some(case_id.clone()),
                case_type: Some("THREAD".to_string()),
                thread_id: Some(thread_id.to_string()),
                reason: options.reason.or(Some("UNLOCK".to_string())),
                severity: options.severity.or(Some("LOW".to_string())),
                reported_by: options
                    .reported_by
                    .or_else(|| self.viewer_user_id.clone()),
                reported_at_ms: Some(now),
                metadata: options.metadata,
                ..Default::default()
            },
            "unlockThread",
            Some(thread_id),
            &mut changes,
        );
        self.emit(&changes)?;
        Ok(self.moderation_case(&case_id))
    }

    pub fn block_thread(
        &mut self,
        thread_id: &str,
        options: BlockOptions,
    ) -> DomainResult<Option<ModerationCase>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("blockThread requires threadId".into()));
        }
        let now = self.now();
        self.apply_thread_moderation(
            thread_id,
            ModerationPatch {
                blocked: Some(true),
                locked: Some(options.locked.unwrap_or(true)),
                status: Some(options.status.clone().unwrap_or_else(|| "LOCKED".to_string())),
                reason: options.reason.clone(),
                severity: options.severity.clone(),
                audit_trail_id: options.audit_trail_id.clone(),
                updated_at_ms: Some(now),
            },
        )?;
        if options.skip_case {
            return Ok(None);
        }
        let case_id = options
            .case_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id(&format!("block-{thread_id}")));
        let mut changes = Vec::new();
        self.enqueue_case_internal(
            CaseInput {
                case_id: Some(case_id.clone()),
                case_type: Some("THREAD".to_string()),
                thread_id: Some(thread_id.to_string()),
                reason: options.reason.or(Some("BLOCK".to_string())),
                severity: options.severity.or(Some("HIGH".to_string())),
                reported_by: options
                    .reported_by
                    .or_else(|| self.viewer_user_id.clone()),
                reported_at_ms: Some(now),
                metadata: options.metadata,
                ..Default::default()
            },
            "blockThread",
            Some(thread_id),
            &mut changes,
        );
        self.emit(&changes)?;
        Ok(self.moderation_case(&case_id))
    }

    pub fn unblock_thread(
        &mut self,
        thread_id: &str,
        options: BlockOptions,
    ) -> DomainResult<Option<ModerationCase>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("unblockThread requires threadId".into()));
        }
        let now = self.now();
        self.apply_thread_moderation(
            thread_id,
            ModerationPatch {
                blocked: Some(false),
                status: Some(options.status.clone().unwrap_or_else(|| "OPEN".to_string())),
                reason: options.reason.clone(),
                audit_trail_id: options.audit_trail_id.clone(),
                updated_at_ms: Some(now),
                ..Default::default()
            },
        )?;
        if options.skip_case {
            return Ok(None);
        }
        let case_id = options
            .case_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id(&format!("unblock-{thread_id}")));
        let mut changes = Vec::new();
        self.enqueue_case_internal(
            CaseInput {
                case_id: Some(case_id.clone()),
                case_type: Some("THREAD".to_string()),
                thread_id: Some(thread_id.to_string()),
                reason: options.reason.or(Some("UNBLOCK".to_string())),
                severity: options.severity.or(Some("LOW".to_string())),
                reported_by: options
                    .reported_by
                    .or_else(|| self.viewer_user_id.clone()),
                reported_at_ms: Some(now),
                metadata: options.metadata,
                ..Default::default()
            },
            "unblockThread",
            Some(thread_id),
            &mut changes,
        );
        self.emit(&changes)?;
        Ok(self.moderation_case(&case_id))
    }

    pub fn update_moderation_case(
        &mut self,
        case_id: &str,
        patch: CasePatch,
    ) -> DomainResult<bool> {
        if case_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "updateModerationCase requires caseId".into(),
            ));
        }
        let now = self.now();
        let Some(next) = self.moderation.update_case(case_id, patch, now) else {
            return Ok(false);
        };
        self.moderation = next;
        self.emit(&[ChangeRecord::new(ChangeScope::ModerationQueue, "updateCase")
            .with_detail("caseId", Value::String(case_id.to_string()))])?;
        Ok(true)
    }

    pub fn submit_moderation_decision(
        &mut self,
        case_id: &str,
        decision: DecisionInput,
        required_approvals: Option<u32>,
    ) -> DomainResult<bool> {
        if case_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "submitModerationDecision requires caseId".into(),
            ));
        }
        let now = self.now();
        let Some(next) = self
            .moderation
            .submit_decision(case_id, decision, required_approvals, now)
        else {
            return Ok(false);
        };
        self.moderation = next;
        self.emit(&[ChangeRecord::new(ChangeScope::ModerationQueue, "decision")
            .with_detail("caseId", Value::String(case_id.to_string()))])?;
        Ok(true)
    }

    pub fn resolve_moderation_case(
        &mut self,
        case_id: &str,
        resolution: ResolutionInput,
    ) -> DomainResult<bool> {
        if case_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "resolveModerationCase requires caseId".into(),
            ));
        }
        let now = self.now();
        let Some(next) = self.moderation.resolve_case(case_id, resolution, now) else {
            return Ok(false);
        };
        self.moderation = next;
        self.emit(&[ChangeRecord::new(ChangeScope::ModerationQueue, "resolveCase")
            .with_detail("caseId", Value::String(case_id.to_string()))])?;
        Ok(true)
    }

    pub fn remove_moderation_case(&mut self, case_id: &str) -> DomainResult<bool> {
        if case_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "removeModerationCase requires caseId".into(),
            ));
        }
        let now = self.now();
        let Some(next) = self.moderation.remove_case(case_id, now) else {
            return Ok(false);
        };
        self.moderation = next;
        self.emit(&[ChangeRecord::new(ChangeScope::ModerationQueue, "removeCase")
            .with_detail("caseId", Value::String(case_id.to_string()))])?;
        Ok(true)
    }

    // ---- uploads ---------------------------------------------------------

    pub fn register_upload(&mut self, descriptor: UploadDescriptor) -> DomainResult<UploadItem> {
        let now = self.now();
        let client_id = descriptor.client_id.clone();
        let next = self.uploads.register(descriptor, now)?;
        self.uploads = next;
        let item = self
            .uploads
            .get(&client_id)
            .cloned()
            .ok_or(DomainError::NotFound)?;
        self.emit(&[ChangeRecord::new(ChangeScope::Uploads, "uploadRegistered")
            .with_detail("clientId", Value::String(client_id))])?;
        Ok(item)
    }

    fn upload_after_mutation(
        &mut self,
        client_id: &str,
        action: &str,
        next: UploadManager,
    ) -> DomainResult<UploadItem> {
        self.uploads = next;
        let item = self
            .uploads
            .get(client_id)
            .cloned()
            .ok_or(DomainError::NotFound)?;
        self.emit(&[ChangeRecord::new(ChangeScope::Uploads, action)
            .with_detail("clientId", Value::String(client_id.to_string()))
            .with_detail(
                "status",
                serde_json::to_value(item.status).unwrap_or(Value::Null),
            )])?;
        Ok(item)
    }

    pub fn mark_upload_signed(
        &mut self,
        client_id: &str,
        details: SignedDetails,
    ) -> DomainResult<UploadItem> {
        let now = self.now();
        let next = self.uploads.mark_signed(client_id, details, now)?;
        self.upload_after_mutation(client_id, "uploadSigned", next)
    }

    pub fn mark_upload_progress(
        &mut self,
        client_id: &str,
        progress: UploadProgress,
    ) -> DomainResult<UploadItem> {
        let now = self.now();
        let next = self.uploads.mark_progress(client_id, progress, now)?;
        self.upload_after_mutation(client_id, "uploadProgress", next)
    }

    pub fn mark_upload_complete(
        &mut self,
        client_id: &str,
        details: CompleteDetails,
    ) -> DomainResult<UploadItem> {
        let now = self.now();
        let next = self.uploads.mark_complete(client_id, details, now)?;
        self.upload_after_mutation(client_id, "uploadComplete", next)
    }

    pub fn mark_upload_failed(
        &mut self,
        client_id: &str,
        error_code: Option<&str>,
    ) -> DomainResult<UploadItem> {
        let now = self.now();
        let next = self
            .uploads
            .mark_failed(client_id, error_code, Map::new(), now)?;
        self.upload_after_mutation(client_id, "uploadFailed", next)
    }

    pub fn cancel_upload(&mut self, client_id: &str) -> DomainResult<Option<UploadItem>> {
        let now = self.now();
        let Some(next) = self.uploads.cancel(client_id, now)? else {
            return Ok(None);
        };
        self.upload_after_mutation(client_id, "uploadCancelled", next)
            .map(Some)
    }

    /// Never fails on an unknown attachment id; that event is a no-op.
    pub fn apply_attachment_status(
        &mut self,
        update: &AttachmentStatusUpdate,
    ) -> DomainResult<Option<UploadItem>> {
        let now = self.now();
        let Some(next) = self.uploads.apply_server_status(update, now) else {
            return Ok(None);
        };
        self.uploads = next;
        let item = self
            .uploads
            .get_by_attachment_id(&update.attachment_id)
            .cloned();
        self.emit(&[ChangeRecord::new(ChangeScope::Uploads, "uploadStatus")
            .with_detail(
                "attachmentId",
                Value::String(update.attachment_id.clone()),
            )])?;
        Ok(item)
    }

    pub fn prune_uploads(&mut self, ttl_override_ms: Option<i64>) -> DomainResult<usize> {
        let now = self.now();
        let before = self.uploads.list().len();
        let Some(next) = self.uploads.prune(now, ttl_override_ms) else {
            return Ok(0);
        };
        self.uploads = next;
        let removed = before - self.uploads.list().len();
        self.emit(&[ChangeRecord::new(ChangeScope::Uploads, "uploadPruned")
            .with_detail("removed", Value::from(removed))])?;
        Ok(removed)
    }

    pub fn upload(&self, client_id: &str) -> Option<UploadItem> {
        self.uploads.get(client_id).cloned()
    }

    pub fn upload_by_attachment_id(&self, attachment_id: &str) -> Option<UploadItem> {
        self.uploads.get_by_attachment_id(attachment_id).cloned()
    }

    pub fn list_uploads(&self, thread_id: Option<&str>) -> Vec<UploadItem> {
        self.uploads
            .list()
            .into_iter()
            .filter(|item| match thread_id {
                Some(thread_id) => item
                    .metadata
                    .get("threadId")
                    .and_then(Value::as_str)
                    .map(|candidate| candidate == thread_id)
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect()
    }
}
