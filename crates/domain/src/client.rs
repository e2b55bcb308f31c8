use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::controller::{
    BlockOptions, LockOptions, MarkReadOptions, MessagingController, ReportMessageOptions,
    ReportThreadOptions,
};
use crate::error::DomainError;
use crate::inbox::InboxThread;
use crate::moderation::{
    CaseInput, CasePatch, DecisionInput, ModerationCase, ResolutionInput,
};
use crate::normalize::{
    case_input_from_value, inbox_event_from_envelope, inbox_snapshot_from_payload,
    message_ack_from_payload, thread_event_from_envelope, thread_snapshot_from_payload,
};
use crate::ports::{
    Disposer, EnvelopeHandlers, MessagingFetch, MessagingMutations, MessagingSubscriptions,
    ProgressSink, SendMessageArgs, UploadStatusPayload, UploadTransport,
};
use crate::thread::{MessageInput, ModerationPatch, OptimisticMessageInput, ThreadEvent};
use crate::uploads::{
    AttachmentStatusUpdate, CompleteDetails, SignedDetails, UploadDescriptor, UploadItem,
    UploadStatus,
};
use crate::util::{lock_unpoisoned, system_clock, Clock, IdSource, UuidIdSource};
use crate::DomainResult;

pub const DEFAULT_STATUS_POLL_INTERVAL_MS: u64 = 1_500;
pub const DEFAULT_STATUS_POLL_MAX_ATTEMPTS: u32 = 10;

pub struct MessagingClientConfig {
    pub fetch: Arc<dyn MessagingFetch>,
    pub subscriptions: Arc<dyn MessagingSubscriptions>,
    pub mutations: Arc<dyn MessagingMutations>,
    pub uploads: Arc<dyn UploadTransport>,
    pub clock: Option<Clock>,
    pub ids: Option<Arc<dyn IdSource>>,
    pub status_poll_interval_ms: Option<u64>,
    pub status_poll_max_attempts: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct HydrateThreadOptions {
    pub sync_inbox: bool,
    pub subscribe: bool,
    pub refresh_on_error: bool,
    pub args: Value,
}

impl Default for HydrateThreadOptions {
    fn default() -> Self {
        Self {
            sync_inbox: true,
            subscribe: false,
            refresh_on_error: true,
            args: Value::Null,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UploadRequest {
    pub client_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub metadata: Map<String, Value>,
}

fn case_input_from(case: &ModerationCase) -> CaseInput {
    CaseInput {
        case_id: Some(case.case_id.clone()),
        case_type: Some(format!("{:?}", case.case_type).to_ascii_uppercase()),
        thread_id: case.thread_id.clone(),
        message_id: case.message_id.clone(),
        status: Some(case.status.clone()),
        severity: Some(case.severity.clone()),
        reason: case.reason.clone(),
        reported_by: case.reported_by.clone(),
        reported_at_ms: Some(case.reported_at_ms),
        audit_trail_id: case.audit_trail_id.clone(),
        requires_dual_approval: case.requires_dual_approval,
        approvals: case
            .approvals
            .iter()
            .map(|record| DecisionInput {
                actor_id: record.actor_id.clone(),
                actor_role: record.actor_role.clone(),
                decision: Some(record.decision.clone()),
                notes: record.notes.clone(),
                decided_at_ms: record.decided_at_ms,
            })
            .collect(),
        metadata: case.metadata.clone(),
        source: case.source.clone(),
        created_at_ms: Some(case.created_at_ms),
        last_updated_at_ms: Some(case.last_updated_at_ms),
        resolution: case.resolution.clone(),
    }
}

fn case_patch_from(case: &ModerationCase) -> CasePatch {
    let input = case_input_from(case);
    CasePatch {
        case_type: input.case_type,
        thread_id: input.thread_id,
        message_id: input.message_id,
        status: input.status,
        severity: input.severity,
        reason: input.reason,
        reported_by: input.reported_by,
        reported_at_ms: input.reported_at_ms,
        audit_trail_id: input.audit_trail_id,
        requires_dual_approval: Some(input.requires_dual_approval),
        approvals: Some(input.approvals),
        metadata: Some(input.metadata),
        source: Some(input.source),
        last_updated_at_ms: input.last_updated_at_ms,
        resolution: input.resolution,
    }
}

/// Drives the controller through the transport ports: one-shot reads,
/// envelope subscriptions, optimistic mutations with compensation, and
/// the attachment upload pipeline.
pub struct MessagingClient {
    controller: Arc<Mutex<MessagingController>>,
    fetch: Arc<dyn MessagingFetch>,
    subscriptions: Arc<dyn MessagingSubscriptions>,
    mutations: Arc<dyn MessagingMutations>,
    uploads: Arc<dyn UploadTransport>,
    clock: Clock,
    ids: Arc<dyn IdSource>,
    poll_interval_ms: u64,
    poll_max_attempts: u32,
    inbox_subscription: Arc<Mutex<Option<Disposer>>>,
    thread_subscriptions: Arc<Mutex<Vec<(String, Disposer)>>>,
}

impl MessagingClient {
    pub fn new(controller: MessagingController, config: MessagingClientConfig) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            fetch: config.fetch,
            subscriptions: config.subscriptions,
            mutations: config.mutations,
            uploads: config.uploads,
            clock: config.clock.unwrap_or_else(system_clock),
            ids: config.ids.unwrap_or_else(|| Arc::new(UuidIdSource)),
            poll_interval_ms: config
                .status_poll_interval_ms
                .unwrap_or(DEFAULT_STATUS_POLL_INTERVAL_MS),
            poll_max_attempts: config
                .status_poll_max_attempts
                .unwrap_or(DEFAULT_STATUS_POLL_MAX_ATTEMPTS),
            inbox_subscription: Arc::new(Mutex::new(None)),
            thread_subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn controller(&self) -> Arc<Mutex<MessagingController>> {
        Arc::clone(&self.controller)
    }

    fn lock(&self) -> MutexGuard<'_, MessagingController> {
        lock_unpoisoned(&self.controller)
    }

    // ---- one-shot reads --------------------------------------------------

    pub async fn refresh_inbox(&self, args: Value) -> DomainResult<()> {
        let payload = self.fetch.fetch_inbox(args).await?;
        let snapshot = inbox_snapshot_from_payload(&payload);
        self.lock().hydrate_inbox(snapshot)
    }

    pub async fn hydrate_thread(
        &self,
        thread_id: &str,
        options: HydrateThreadOptions,
    ) -> DomainResult<()> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("hydrateThread requires threadId".into()));
        }
        let payload = self.fetch.fetch_thread(thread_id, options.args.clone()).await?;
        let snapshot = thread_snapshot_from_payload(&payload).ok_or_else(|| {
            DomainError::Validation("thread payload is missing a threadId".into())
        })?;
        if snapshot.thread_id != thread_id {
            warn!(
                expected = thread_id,
                received = %snapshot.thread_id,
                "fetched thread id mismatch"
            );
        }
        self.lock().hydrate_thread(snapshot, options.sync_inbox)?;
        if options.subscribe {
            self.start_thread_subscription(thread_id, options.refresh_on_error)?;
        }
        Ok(())
    }

    pub async fn hydrate_moderation_queue(&self, args: Value) -> DomainResult<()> {
        let payload = self.fetch.fetch_moderation_queue(args).await?;
        let entries = match payload.get("cases") {
            Some(Value::Array(entries)) => entries.clone(),
            _ => payload.as_array().cloned().unwrap_or_default(),
        };
        let cases = entries.iter().filter_map(case_input_from_value).collect();
        self.lock().hydrate_moderation_queue(cases)
    }

    // ---- subscriptions ---------------------------------------------------

    fn inbox_handlers(&self, refresh_on_error: bool) -> EnvelopeHandlers {
        let controller = Arc::clone(&self.controller);
        let next = Box::new(move |envelope: Value| {
            let Some(event) = inbox_event_from_envelope(&envelope) else {
                return;
            };
            let mut guard = lock_unpoisoned(&controller);
            if let Err(err) = guard.apply_inbox_event(&event) {
                error!(error = %err, "failed to apply inbox event");
            }
        });

        let fetch = Arc::clone(&self.fetch);
        let controller = Arc::clone(&self.controller);
        let on_error = Box::new(move |err: DomainError| {
            error!(error = %err, "inbox subscription error");
            if !refresh_on_error {
                return;
            }
            let fetch = Arc::clone(&fetch);
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                match fetch.fetch_inbox(Value::Null).await {
                    Ok(payload) => {
                        let snapshot = inbox_snapshot_from_payload(&payload);
                        let mut guard = lock_unpoisoned(&controller);
                        if let Err(err) = guard.hydrate_inbox(snapshot) {
                            error!(error = %err, "inbox refresh after subscription error failed");
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "inbox refresh after subscription error failed")
                    }
                }
            });
        });

        let slot = Arc::clone(&self.inbox_subscription);
        let complete = Box::new(move || {
            debug!("inbox subscription completed");
            lock_unpoisoned(&slot).take();
        });

        EnvelopeHandlers {
            next,
            error: on_error,
            complete,
        }
    }

    pub fn start_inbox_subscription(&self, refresh_on_error: bool) -> DomainResult<()> {
        if lock_unpoisoned(&self.inbox_subscription).is_some() {
            return Ok(());
        }
        let disposer = self
            .subscriptions
            .subscribe_inbox(self.inbox_handlers(refresh_on_error))?;
        *lock_unpoisoned(&self.inbox_subscription) = Some(disposer);
        Ok(())
    }

    pub fn stop_inbox_subscription(&self) {
        if let Some(mut disposer) = lock_unpoisoned(&self.inbox_subscription).take() {
            disposer.dispose();
        }
    }

    fn thread_handlers(&self, thread_id: &str, refresh_on_error: bool) -> EnvelopeHandlers {
        let controller = Arc::clone(&self.controller);
        let target = thread_id.to_string();
        let next = Box::new(move |envelope: Value| {
            let Some(event) = thread_event_from_envelope(&envelope) else {
                return;
            };
            let mut guard = lock_unpoisoned(&controller);
            if let Err(err) = guard.apply_thread_event(&target, &event) {
                error!(error = %err, thread_id = %target, "failed to apply thread event");
            }
        });

        let fetch = Arc::clone(&self.fetch);
        let controller = Arc::clone(&self.controller);
        let target = thread_id.to_string();
        let on_error = Box::new(move |err: DomainError| {
            error!(error = %err, thread_id = %target, "thread subscription error");
            if !refresh_on_error {
                return;
            }
            let fetch = Arc::clone(&fetch);
            let controller = Arc::clone(&controller);
            let target = target.clone();
            tokio::spawn(async move {
                match fetch.fetch_thread(&target, Value::Null).await {
                    Ok(payload) => {
                        let Some(snapshot) = thread_snapshot_from_payload(&payload) else {
                            return;
                        };
                        let mut guard = lock_unpoisoned(&controller);
                        if let Err(err) = guard.hydrate_thread(snapshot, true) {
                            error!(error = %err, "thread rehydrate after subscription error failed");
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "thread rehydrate after subscription error failed")
                    }
                }
            });
        });

        let registry = Arc::clone(&self.thread_subscriptions);
        let target = thread_id.to_string();
        let complete = Box::new(move || {
            debug!(thread_id = %target, "thread subscription completed");
            lock_unpoisoned(&registry).retain(|(id, _)| id != &target);
        });

        EnvelopeHandlers {
            next,
            error: on_error,
            complete,
        }
    }

    pub fn start_thread_subscription(
        &self,
        thread_id: &str,
        refresh_on_error: bool,
    ) -> DomainResult<()> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "startThreadSubscription requires threadId".into(),
            ));
        }
        if lock_unpoisoned(&self.thread_subscriptions)
            .iter()
            .any(|(id, _)| id == thread_id)
        {
            return Ok(());
        }
        let disposer = self
            .subscriptions
            .subscribe_thread(thread_id, self.thread_handlers(thread_id, refresh_on_error))?;
        lock_unpoisoned(&self.thread_subscriptions).push((thread_id.to_string(), disposer));
        Ok(())
    }

    pub fn stop_thread_subscription(&self, thread_id: &str) {
        let entry = {
            let mut registry = lock_unpoisoned(&self.thread_subscriptions);
            registry
                .iter()
                .position(|(id, _)| id == thread_id)
                .map(|index| registry.remove(index))
        };
        if let Some((_, mut disposer)) = entry {
            disposer.dispose();
        }
    }

    /// Deterministic teardown: the inbox subscription first, then thread
    /// subscriptions newest-first.
    pub fn dispose(&self) {
        self.stop_inbox_subscription();
        loop {
            let entry = lock_unpoisoned(&self.thread_subscriptions).pop();
            let Some((thread_id, mut disposer)) = entry else {
                break;
            };
            disposer.dispose();
            debug!(thread_id = %thread_id, "disposed thread subscription");
        }
    }

    // ---- optimistic mutations --------------------------------------------

    pub async fn send_message(
        &self,
        thread_id: &str,
        input: SendMessageArgs,
    ) -> DomainResult<Option<MessageInput>> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("sendMessage requires threadId".into()));
        }
        if input.client_id.trim().is_empty() {
            return Err(DomainError::Validation("sendMessage requires clientId".into()));
        }
        let author_user_id = input
            .author_user_id
            .clone()
            .or_else(|| self.lock().viewer_user_id().map(str::to_string))
            .ok_or_else(|| {
                DomainError::Validation("sendMessage requires an author or viewer identity".into())
            })?;
        let created_at_ms = input.created_at_ms.unwrap_or_else(|| (self.clock)());
        self.lock().enqueue_optimistic_message(
            thread_id,
            OptimisticMessageInput {
                client_id: input.client_id.clone(),
                created_at_ms,
                author_user_id,
                kind: input.kind.clone(),
                body: input.body.clone(),
                attachments: input.attachments.clone(),
            },
        )?;

        match self.mutations.send_message(thread_id, &input).await {
            Ok(payload) => {
                let ack = message_ack_from_payload(&payload);
                if let Some(ack) = &ack {
                    self.lock()
                        .resolve_optimistic_message(thread_id, &input.client_id, ack.clone())?;
                }
                Ok(ack)
            }
            Err(err) => {
                let code = err.error_code();
                if let Err(fail_err) = self.lock().fail_optimistic_message(
                    thread_id,
                    &input.client_id,
                    Some(&code),
                ) {
                    warn!(error = %fail_err, "failed to mark optimistic message failed");
                }
                error!(error = %err, thread_id, client_id = %input.client_id, "sendMessage mutation failed");
                Err(err)
            }
        }
    }

    pub async fn mark_thread_read(
        &self,
        thread_id: &str,
        options: MarkReadOptions,
        ctx: Value,
    ) -> DomainResult<()> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("markThreadRead requires threadId".into()));
        }
        self.lock().mark_thread_read(thread_id, options)?;
        match self.mutations.mark_thread_read(thread_id, ctx).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = %err, thread_id, "markThreadRead mutation failed");
                if let Err(refresh_err) = self
                    .hydrate_thread(thread_id, HydrateThreadOptions::default())
                    .await
                {
                    warn!(error = %refresh_err, thread_id, "rehydrate after markThreadRead failure failed");
                }
                Err(err)
            }
        }
    }

    pub async fn accept_message_request(&self, request_id: &str, ctx: Value) -> DomainResult<()> {
        if request_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "acceptMessageRequest requires requestId".into(),
            ));
        }
        self.lock().accept_message_request(request_id)?;
        match self.mutations.accept_message_request(request_id, ctx).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = %err, request_id, "acceptMessageRequest mutation failed");
                if let Err(refresh_err) = self.refresh_inbox(Value::Null).await {
                    warn!(error = %refresh_err, "inbox refresh after request accept failure failed");
                }
                Err(err)
            }
        }
    }

    pub async fn decline_message_request(
        &self,
        request_id: &str,
        block: bool,
        ctx: Value,
    ) -> DomainResult<()> {
        if request_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "declineMessageRequest requires requestId".into(),
            ));
        }
        self.lock().decline_message_request(request_id, block)?;
        match self.mutations.decline_message_request(request_id, ctx).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = %err, request_id, "declineMessageRequest mutation failed");
                if let Err(refresh_err) = self.refresh_inbox(Value::Null).await {
                    warn!(error = %refresh_err, "inbox refresh after request decline failure failed");
                }
                Err(err)
            }
        }
    }

    pub async fn record_conversation_start(&self, ctx: Value) -> DomainResult<()> {
        self.lock().record_conversation_start(None)?;
        if let Err(err) = self.mutations.record_conversation_start(ctx).await {
            error!(error = %err, "recordConversationStart mutation failed");
        }
        Ok(())
    }

    // ---- inbox flags (remote-confirmed first) ----------------------------

    fn inbox_entry(&self, thread_id: &str) -> Option<InboxThread> {
        self.lock().inbox().thread(thread_id).cloned()
    }

    pub async fn pin_thread(&self, thread_id: &str, ctx: Value) -> DomainResult<Option<InboxThread>> {
        self.mutations.pin_thread(thread_id, ctx).await?;
        self.lock().pin_thread(thread_id)?;
        Ok(self.inbox_entry(thread_id))
    }

    pub async fn unpin_thread(
        &self,
        thread_id: &str,
        ctx: Value,
    ) -> DomainResult<Option<InboxThread>> {
        self.mutations.unpin_thread(thread_id, ctx).await?;
        self.lock().unpin_thread(thread_id)?;
        Ok(self.inbox_entry(thread_id))
    }

    pub async fn archive_thread(
        &self,
        thread_id: &str,
        ctx: Value,
    ) -> DomainResult<Option<InboxThread>> {
        self.mutations.archive_thread(thread_id, ctx).await?;
        self.lock().archive_thread(thread_id)?;
        Ok(self.inbox_entry(thread_id))
    }

    pub async fn unarchive_thread(
        &self,
        thread_id: &str,
        ctx: Value,
    ) -> DomainResult<Option<InboxThread>> {
        self.mutations.unarchive_thread(thread_id, ctx).await?;
        self.lock().unarchive_thread(thread_id)?;
        Ok(self.inbox_entry(thread_id))
    }

    pub async fn mute_thread(
        &self,
        thread_id: &str,
        ctx: Value,
    ) -> DomainResult<Option<InboxThread>> {
        self.mutations.mute_thread(thread_id, ctx).await?;
        self.lock().mute_thread(thread_id, true)?;
        Ok(self.inbox_entry(thread_id))
    }

    pub async fn unmute_thread(
        &self,
        thread_id: &str,
        ctx: Value,
    ) -> DomainResult<Option<InboxThread>> {
        self.mutations.unmute_thread(thread_id, ctx).await?;
        self.lock().mute_thread(thread_id, false)?;
        Ok(self.inbox_entry(thread_id))
    }

    // ---- moderation ------------------------------------------------------

    fn stamp_case_failure(&self, case: &ModerationCase, err: &DomainError) {
        let mut metadata = case.metadata.clone();
        metadata.insert(
            "errorCode".to_string(),
            Value::String(err.error_code()),
        );
        metadata.insert("errorMessage".to_string(), Value::String(err.to_string()));
        let patch = CasePatch {
            status: Some("FAILED".to_string()),
            metadata: Some(metadata),
            ..Default::default()
        };
        if let Err(update_err) = self.lock().update_moderation_case(&case.case_id, patch) {
            warn!(error = %update_err, case_id = %case.case_id, "failed to stamp moderation failure");
        }
    }

    pub async fn report_message(
        &self,
        thread_id: &str,
        message_id: &str,
        options: ReportMessageOptions,
        ctx: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let case = self.lock().report_message(thread_id, message_id, options)?;
        match self.mutations.report_message(thread_id, message_id, ctx).await {
            Ok(_) => Ok(case),
            Err(err) => {
                if let Some(case) = &case {
                    self.stamp_case_failure(case, &err);
                }
                Err(err)
            }
        }
    }

    fn thread_moderation_snapshot(
        &self,
        thread_id: &str,
    ) -> (Option<ModerationPatch>, crate::moderation::ModerationQueue) {
        let controller = self.lock();
        let previous = controller
            .thread(thread_id)
            .and_then(|thread| thread.moderation().cloned())
            .map(|moderation| ModerationPatch {
                locked: Some(moderation.locked),
                blocked: Some(moderation.blocked),
                reason: moderation.reason,
                severity: moderation.severity,
                audit_trail_id: moderation.audit_trail_id,
                status: None,
                updated_at_ms: moderation.updated_at_ms,
            });
        (previous, controller.moderation_queue().clone())
    }

    fn rollback_thread_moderation(
        &self,
        thread_id: &str,
        previous: Option<ModerationPatch>,
        queue: crate::moderation::ModerationQueue,
    ) {
        let mut controller = self.lock();
        if let Some(patch) = previous {
            if let Err(err) = controller
                .apply_thread_event(thread_id, &ThreadEvent::ThreadModerationUpdated { patch })
            {
                warn!(error = %err, thread_id, "moderation rollback failed");
            }
        }
        if let Err(err) = controller.restore_moderation_queue(queue) {
            warn!(error = %err, thread_id, "moderation queue rollback failed");
        }
    }

    pub async fn report_thread(
        &self,
        thread_id: &str,
        options: ReportThreadOptions,
        ctx: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let case = self.lock().report_thread(thread_id, options)?;
        match self.mutations.report_thread(thread_id, ctx).await {
            Ok(_) => Ok(case),
            Err(err) => {
                if let Some(case) = &case {
                    self.stamp_case_failure(case, &err);
                }
                Err(err)
            }
        }
    }

    pub async fn lock_thread(
        &self,
        thread_id: &str,
        options: LockOptions,
        ctx: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let (previous, queue) = self.thread_moderation_snapshot(thread_id);
        let case = self.lock().lock_thread(thread_id, options)?;
        match self.mutations.lock_thread(thread_id, ctx).await {
            Ok(_) => Ok(case),
            Err(err) => {
                self.rollback_thread_moderation(thread_id, previous, queue);
                Err(err)
            }
        }
    }

    pub async fn unlock_thread(
        &self,
        thread_id: &str,
        options: LockOptions,
        ctx: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let (previous, queue) = self.thread_moderation_snapshot(thread_id);
        let case = self.lock().unlock_thread(thread_id, options)?;
        match self.mutations.unlock_thread(thread_id, ctx).await {
            Ok(_) => Ok(case),
            Err(err) => {
                self.rollback_thread_moderation(thread_id, previous, queue);
                Err(err)
            }
        }
    }

    pub async fn block_thread(
        &self,
        thread_id: &str,
        options: BlockOptions,
        ctx: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let (previous, queue) = self.thread_moderation_snapshot(thread_id);
        let case = self.lock().block_thread(thread_id, options)?;
        match self.mutations.block_thread(thread_id, ctx).await {
            Ok(_) => Ok(case),
            Err(err) => {
                self.rollback_thread_moderation(thread_id, previous, queue);
                Err(err)
            }
        }
    }

    pub async fn unblock_thread(
        &self,
        thread_id: &str,
        options: BlockOptions,
        ctx: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let (previous, queue) = self.thread_moderation_snapshot(thread_id);
        let case = self.lock().unblock_thread(thread_id, options)?;
        match self.mutations.unblock_thread(thread_id, ctx).await {
            Ok(_) => Ok(case),
            Err(err) => {
                self.rollback_thread_moderation(thread_id, previous, queue);
                Err(err)
            }
        }
    }

    pub async fn update_moderation_case(
        &self,
        case_id: &str,
        patch: CasePatch,
        remote_patch: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let previous = self.lock().moderation_case(case_id);
        self.lock().update_moderation_case(case_id, patch)?;
        match self.mutations.update_moderation_case(case_id, remote_patch).await {
            Ok(_) => Ok(self.lock().moderation_case(case_id)),
            Err(err) => {
                if let Some(previous) = &previous {
                    if let Err(rollback_err) = self
                        .lock()
                        .update_moderation_case(case_id, case_patch_from(previous))
                    {
                        warn!(error = %rollback_err, case_id, "case rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn submit_moderation_decision(
        &self,
        case_id: &str,
        decision: DecisionInput,
        required_approvals: Option<u32>,
        remote_decision: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let previous = self.lock().moderation_case(case_id);
        self.lock()
            .submit_moderation_decision(case_id, decision, required_approvals)?;
        match self
            .mutations
            .submit_moderation_decision(case_id, remote_decision)
            .await
        {
            Ok(_) => Ok(self.lock().moderation_case(case_id)),
            Err(err) => {
                if let Some(previous) = &previous {
                    if let Err(rollback_err) = self
                        .lock()
                        .update_moderation_case(case_id, case_patch_from(previous))
                    {
                        warn!(error = %rollback_err, case_id, "case rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn resolve_moderation_case(
        &self,
        case_id: &str,
        resolution: ResolutionInput,
        remote_resolution: Value,
    ) -> DomainResult<Option<ModerationCase>> {
        let previous = self.lock().moderation_case(case_id);
        self.lock().resolve_moderation_case(case_id, resolution)?;
        match self
            .mutations
            .resolve_moderation_case(case_id, remote_resolution)
            .await
        {
            Ok(_) => Ok(self.lock().moderation_case(case_id)),
            Err(err) => {
                if let Some(previous) = &previous {
                    if let Err(rollback_err) = self
                        .lock()
                        .update_moderation_case(case_id, case_patch_from(previous))
                    {
                        warn!(error = %rollback_err, case_id, "case rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn remove_moderation_case(&self, case_id: &str) -> DomainResult<()> {
        let previous = self.lock().moderation_case(case_id);
        self.lock().remove_moderation_case(case_id)?;
        match self.mutations.remove_moderation_case(case_id).await {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(previous) = &previous {
                    if let Err(rollback_err) = self
                        .lock()
                        .enqueue_moderation_case(case_input_from(previous))
                    {
                        warn!(error = %rollback_err, case_id, "case restore failed");
                    }
                }
                Err(err)
            }
        }
    }

    // ---- uploads ---------------------------------------------------------

    fn apply_status_payload(
        &self,
        attachment_id: &str,
        payload: UploadStatusPayload,
        fallback: UploadStatus,
    ) -> DomainResult<UploadStatus> {
        let status = payload
            .status
            .as_deref()
            .and_then(UploadStatus::parse)
            .unwrap_or(fallback);
        self.lock().apply_attachment_status(&AttachmentStatusUpdate {
            attachment_id: attachment_id.to_string(),
            status,
            nsfw_band: payload.nsfw_band,
            safe_mode_state: payload.safe_mode_state,
            error_code: payload.error_code,
            metadata: payload.metadata,
        })?;
        Ok(status)
    }

    async fn poll_attachment_status(
        &self,
        attachment_id: &str,
        mut status: UploadStatus,
    ) -> DomainResult<UploadStatus> {
        let mut attempt: u32 = 0;
        while !status.is_terminal() && attempt < self.poll_max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
            }
            attempt += 1;
            match self.uploads.get_upload_status(attachment_id).await {
                Ok(Some(payload)) => {
                    status = self.apply_status_payload(attachment_id, payload, status)?;
                }
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %err, attachment_id, "getUploadStatus failed");
                    continue;
                }
            }
        }
        if !status.is_terminal() {
            self.lock().apply_attachment_status(&AttachmentStatusUpdate {
                attachment_id: attachment_id.to_string(),
                status: UploadStatus::Failed,
                error_code: Some("UPLOAD_STATUS_TIMEOUT".to_string()),
                ..Default::default()
            })?;
            return Ok(UploadStatus::Failed);
        }
        Ok(status)
    }

    async fn run_upload(
        &self,
        thread_id: &str,
        client_id: &str,
        request: &UploadRequest,
        metadata: &Map<String, Value>,
    ) -> DomainResult<UploadItem> {
        let descriptor = json!({
            "clientId": client_id,
            "fileName": request.file_name,
            "mimeType": request.mime_type,
            "sizeBytes": request.size_bytes,
            "metadata": metadata,
        });
        let session = self.uploads.create_upload_session(thread_id, descriptor).await?;
        let attachment_id = session
            .attachment_id
            .clone()
            .unwrap_or_else(|| format!("att_{client_id}"));
        self.lock().mark_upload_signed(
            client_id,
            SignedDetails {
                attachment_id: Some(attachment_id.clone()),
                upload_url: session.upload_url.clone(),
                metadata: session.metadata.clone(),
            },
        )?;

        let progress_controller = Arc::clone(&self.controller);
        let progress_client_id = client_id.to_string();
        let sink: ProgressSink = Box::new(move |progress| {
            let mut guard = lock_unpoisoned(&progress_controller);
            if let Err(err) = guard.mark_upload_progress(&progress_client_id, progress) {
                warn!(error = %err, "upload progress update failed");
            }
        });
        self.uploads.perform_upload(&session, sink).await?;

        self.lock().mark_upload_complete(
            client_id,
            CompleteDetails {
                attachment_id: Some(attachment_id.clone()),
                checksum: request.checksum.clone().or(session.checksum.clone()),
                metadata: Map::new(),
            },
        )?;

        let reference = json!({
            "clientId": client_id,
            "attachmentId": attachment_id,
            "metadata": metadata,
        });
        let completion = self.uploads.complete_upload(thread_id, reference).await?;
        let status = match completion {
            Some(payload) => {
                self.apply_status_payload(&attachment_id, payload, UploadStatus::Ready)?
            }
            None => self.apply_status_payload(
                &attachment_id,
                UploadStatusPayload::default(),
                UploadStatus::Ready,
            )?,
        };

        let final_status = if status.is_terminal() {
            status
        } else {
            self.poll_attachment_status(&attachment_id, status).await?
        };
        debug!(attachment_id = %attachment_id, ?final_status, "upload settled");
        self.lock().upload(client_id).ok_or(DomainError::NotFound)
    }

    /// Full attachment pipeline: register, sign, shuttle bytes, complete,
    /// then poll until the server reports a terminal status (or the
    /// attempt ceiling stamps the item FAILED).
    pub async fn prepare_upload(
        &self,
        thread_id: &str,
        request: UploadRequest,
    ) -> DomainResult<UploadItem> {
        if thread_id.trim().is_empty() {
            return Err(DomainError::Validation("prepareUpload requires threadId".into()));
        }
        let client_id = request
            .client_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id("upload"));
        let mut metadata = request.metadata.clone();
        metadata.insert("threadId".to_string(), Value::String(thread_id.to_string()));
        self.lock().register_upload(UploadDescriptor {
            client_id: client_id.clone(),
            file_name: request.file_name.clone(),
            mime_type: request.mime_type.clone(),
            size_bytes: request.size_bytes,
            checksum: request.checksum.clone(),
            metadata: metadata.clone(),
        })?;

        match self.run_upload(thread_id, &client_id, &request, &metadata).await {
            Ok(item) => Ok(item),
            Err(err) => {
                if let Err(fail_err) = self
                    .lock()
                    .mark_upload_failed(&client_id, Some(&err.error_code()))
                {
                    warn!(error = %fail_err, client_id = %client_id, "failed to mark upload failed");
                }
                error!(error = %err, thread_id, client_id = %client_id, "prepareUpload failed");
                Err(err)
            }
        }
    }

    pub fn cancel_upload(&self, client_id: &str) -> DomainResult<Option<UploadItem>> {
        self.lock().cancel_upload(client_id)
    }

    pub fn upload(&self, client_id: &str) -> Option<UploadItem> {
        self.lock().upload(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerOptions;
    use crate::inbox::{CreditsSeed, InboxSnapshot, MessageRequestSeed, ThreadPatch};
    use crate::ports::{BoxFuture, UploadSession};
    use crate::thread::{ThreadSnapshot, ThreadState};
    use crate::util::SequenceIdSource;
    use std::collections::{HashMap, HashSet, VecDeque};

    #[derive(Default)]
    struct MockTransport {
        inbox_payload: Mutex<Value>,
        thread_payloads: Mutex<HashMap<String, Value>>,
        calls: Mutex<Vec<String>>,
        fail_intents: Mutex<HashSet<String>>,
        status_sequence: Mutex<VecDeque<UploadStatusPayload>>,
        thread_handlers: Mutex<Vec<(u64, String, Arc<EnvelopeHandlers>)>>,
        handler_seq: std::sync::atomic::AtomicU64,
    }

    impl MockTransport {
        fn record(&self, call: &str) {
            lock_unpoisoned(&self.calls).push(call.to_string());
        }

        fn fail(&self, intent: &str) {
            lock_unpoisoned(&self.fail_intents).insert(intent.to_string());
        }

        fn calls(&self) -> Vec<String> {
            lock_unpoisoned(&self.calls).clone()
        }

        fn mutate(&self, intent: &str, response: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.record(intent);
            let rejected = lock_unpoisoned(&self.fail_intents).contains(intent);
            Box::pin(async move {
                if rejected {
                    Err(DomainError::transport("LOOPBACK_REJECTED", "mock rejection"))
                } else {
                    Ok(response)
                }
            })
        }

        fn push_thread_envelope(&self, thread_id: &str, envelope: Value) {
            let handlers: Vec<Arc<EnvelopeHandlers>> = lock_unpoisoned(&self.thread_handlers)
                .iter()
                .filter(|(_, id, _)| id == thread_id)
                .map(|(_, _, handlers)| Arc::clone(handlers))
                .collect();
            for handler in handlers {
                (handler.next)(envelope.clone());
            }
        }

        fn thread_handler_count(&self) -> usize {
            lock_unpoisoned(&self.thread_handlers).len()
        }
    }

    impl MessagingFetch for MockTransport {
        fn fetch_inbox(&self, _args: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.record("fetchInbox");
            let payload = lock_unpoisoned(&self.inbox_payload).clone();
            Box::pin(async move { Ok(payload) })
        }

        fn fetch_thread(&self, thread_id: &str, _args: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.record("fetchThread");
            let payload = lock_unpoisoned(&self.thread_payloads)
                .get(thread_id)
                .cloned()
                .unwrap_or(Value::Null);
            Box::pin(async move { Ok(payload) })
        }

        fn fetch_moderation_queue(&self, _args: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.record("fetchModerationQueue");
            Box::pin(async move { Ok(Value::Null) })
        }
    }

    impl MessagingSubscriptions for MockTransport {
        fn subscribe_inbox(&self, _handlers: EnvelopeHandlers) -> DomainResult<Disposer> {
            Ok(Disposer::noop())
        }

        fn subscribe_thread(
            &self,
            thread_id: &str,
            handlers: EnvelopeHandlers,
        ) -> DomainResult<Disposer> {
            let id = self
                .handler_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            lock_unpoisoned(&self.thread_handlers).push((
                id,
                thread_id.to_string(),
                Arc::new(handlers),
            ));
            Ok(Disposer::noop())
        }
    }

    impl MessagingMutations for MockTransport {
        fn send_message(
            &self,
            _thread_id: &str,
            input: &SendMessageArgs,
        ) -> BoxFuture<'_, DomainResult<Value>> {
            let response = json!({
                "message": {
                    "id": format!("srv-{}", input.client_id),
                    "createdAt": 90_000,
                    "authorUserId": input.author_user_id,
                    "body": input.body,
                }
            });
            self.mutate("sendMessage", response)
        }

        fn mark_thread_read(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("markThreadRead", Value::Null)
        }

        fn accept_message_request(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("acceptMessageRequest", Value::Null)
        }

        fn decline_message_request(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("declineMessageRequest", Value::Null)
        }

        fn pin_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("pinThread", Value::Null)
        }

        fn unpin_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("unpinThread", Value::Null)
        }

        fn archive_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("archiveThread", Value::Null)
        }

        fn unarchive_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("unarchiveThread", Value::Null)
        }

        fn mute_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("muteThread", Value::Null)
        }

        fn unmute_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("unmuteThread", Value::Null)
        }

        fn report_message(&self, _: &str, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("reportMessage", Value::Null)
        }

        fn report_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("reportThread", Value::Null)
        }

        fn lock_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("lockThread", Value::Null)
        }

        fn unlock_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("unlockThread", Value::Null)
        }

        fn block_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("blockThread", Value::Null)
        }

        fn unblock_thread(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("unblockThread", Value::Null)
        }

        fn update_moderation_case(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("updateModerationCase", Value::Null)
        }

        fn submit_moderation_decision(
            &self,
            _: &str,
            _: Value,
        ) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("submitModerationDecision", Value::Null)
        }

        fn resolve_moderation_case(&self, _: &str, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("resolveModerationCase", Value::Null)
        }

        fn remove_moderation_case(&self, _: &str) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("removeModerationCase", Value::Null)
        }

        fn record_conversation_start(&self, _: Value) -> BoxFuture<'_, DomainResult<Value>> {
            self.mutate("recordConversationStart", Value::Null)
        }
    }

    impl UploadTransport for MockTransport {
        fn create_upload_session(
            &self,
            _thread_id: &str,
            _descriptor: Value,
        ) -> BoxFuture<'_, DomainResult<UploadSession>> {
            self.record("createUploadSession");
            Box::pin(async move {
                Ok(UploadSession {
                    attachment_id: Some("att-mock".to_string()),
                    upload_url: Some("https://upload.test/att-mock".to_string()),
                    ..Default::default()
                })
            })
        }

        fn perform_upload(
            &self,
            _session: &UploadSession,
            on_progress: ProgressSink,
        ) -> BoxFuture<'_, DomainResult<()>> {
            self.record("performUpload");
            Box::pin(async move {
                on_progress(crate::uploads::UploadProgress {
                    uploaded_bytes: 512,
                    total_bytes: 1_024,
                });
                Ok(())
            })
        }

        fn complete_upload(
            &self,
            _thread_id: &str,
            _reference: Value,
        ) -> BoxFuture<'_, DomainResult<Option<UploadStatusPayload>>> {
            self.record("completeUpload");
            Box::pin(async move {
                Ok(Some(UploadStatusPayload {
                    status: Some("SCANNING".to_string()),
                    ..Default::default()
                }))
            })
        }

        fn get_upload_status(
            &self,
            _attachment_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<UploadStatusPayload>>> {
            self.record("getUploadStatus");
            let next = lock_unpoisoned(&self.status_sequence).pop_front();
            Box::pin(async move { Ok(next) })
        }
    }

    fn seeded_controller() -> MessagingController {
        MessagingController::new(ControllerOptions {
            viewer_user_id: Some("viewer".to_string()),
            inbox: InboxSnapshot {
                threads: vec![ThreadPatch {
                    last_message_at_ms: Some(1_000),
                    ..ThreadPatch::new("thr-1")
                }],
                requests: vec![MessageRequestSeed {
                    request_id: "req-1".to_string(),
                    thread_id: "thr-9".to_string(),
                    credit_cost: 4.0,
                    expires_at_ms: 500_000,
                    created_at_ms: 100,
                }],
                credits: Some(CreditsSeed {
                    available: Some(10.0),
                    cost_per_request: Some(2.0),
                    floor: Some(0.0),
                }),
                ..Default::default()
            },
            threads: vec![ThreadSnapshot {
                thread_id: "thr-1".to_string(),
                ..Default::default()
            }],
            clock: Some(Arc::new(|| 80_000)),
            ids: Some(Arc::new(SequenceIdSource::default())),
            ..Default::default()
        })
    }

    fn client_with(transport: Arc<MockTransport>) -> MessagingClient {
        MessagingClient::new(
            seeded_controller(),
            MessagingClientConfig {
                fetch: Arc::clone(&transport) as Arc<dyn MessagingFetch>,
                subscriptions: Arc::clone(&transport) as Arc<dyn MessagingSubscriptions>,
                mutations: Arc::clone(&transport) as Arc<dyn MessagingMutations>,
                uploads: Arc::clone(&transport) as Arc<dyn UploadTransport>,
                clock: Some(Arc::new(|| 80_000)),
                ids: Some(Arc::new(SequenceIdSource::default())),
                status_poll_interval_ms: Some(1),
                status_poll_max_attempts: Some(3),
            },
        )
    }

    fn thread_state(client: &MessagingClient, thread_id: &str) -> ThreadState {
        lock_unpoisoned(&client.controller)
            .thread(thread_id)
            .cloned()
            .expect("thread state")
    }

    #[tokio::test]
    async fn send_message_resolves_the_optimistic_entry() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(Arc::clone(&transport));
        let ack = client
            .send_message(
                "thr-1",
                SendMessageArgs {
                    client_id: "c-1".to_string(),
                    body: Some("hello".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("sent")
            .expect("ack");
        assert_eq!(ack.message_id, "srv-c-1");
        let state = thread_state(&client, "thr-1");
        assert!(state.message("temp:c-1").is_none());
        assert!(state.message("srv-c-1").is_some());
        assert!(transport.calls().contains(&"sendMessage".to_string()));
    }

    #[tokio::test]
    async fn send_message_failure_marks_the_temp_entry_failed() {
        let transport = Arc::new(MockTransport::default());
        transport.fail("sendMessage");
        let client = client_with(Arc::clone(&transport));
        let err = client
            .send_message(
                "thr-1",
                SendMessageArgs {
                    client_id: "c-1".to_string(),
                    body: Some("hello".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Transport { .. }));
        let state = thread_state(&client, "thr-1");
        let message = state.message("temp:c-1").expect("temp entry retained");
        assert_eq!(message.delivery_state, crate::thread::DeliveryState::Failed);
        assert_eq!(message.error_code.as_deref(), Some("LOOPBACK_REJECTED"));
    }

    #[tokio::test]
    async fn thread_subscription_envelopes_reach_the_store() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(Arc::clone(&transport));
        client
            .start_thread_subscription("thr-1", false)
            .expect("subscribed");
        // duplicate starts are a no-op
        client
            .start_thread_subscription("thr-1", false)
            .expect("subscribed again");
        assert_eq!(transport.thread_handler_count(), 1);

        transport.push_thread_envelope(
            "thr-1",
            json!({
                "type": "messageCreated",
                "payload": {"message": {"id": "msg-55", "createdAt": 85_000,
                                          "authorUserId": "peer", "body": "late"}}
            }),
        );
        let state = thread_state(&client, "thr-1");
        assert!(state.message("msg-55").is_some());

        client.stop_thread_subscription("thr-1");
        client.stop_thread_subscription("thr-1");
        client.dispose();
    }

    #[tokio::test]
    async fn accept_request_failure_refreshes_from_the_authority() {
        let transport = Arc::new(MockTransport::default());
        transport.fail("acceptMessageRequest");
        *lock_unpoisoned(&transport.inbox_payload) = json!({
            "threads": [],
            "requests": [{"id": "req-1", "threadId": "thr-9", "creditCost": 4,
                           "expiresAt": 500_000, "createdAt": 100}],
            "credits": {"available": 10, "costPerRequest": 2}
        });
        let client = client_with(Arc::clone(&transport));
        let err = client
            .accept_message_request("req-1", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Transport { .. }));
        assert!(transport.calls().contains(&"fetchInbox".to_string()));
        let controller = lock_unpoisoned(&client.controller);
        // authoritative state restored the request and the credits
        assert!(controller.inbox().request("req-1").is_some());
        assert_eq!(controller.inbox().credits().available, 10.0);
    }

    #[tokio::test]
    async fn upload_pipeline_polls_to_a_terminal_status() {
        let transport = Arc::new(MockTransport::default());
        lock_unpoisoned(&transport.status_sequence).push_back(UploadStatusPayload {
            status: Some("READY".to_string()),
            nsfw_band: Some(1),
            ..Default::default()
        });
        let client = client_with(Arc::clone(&transport));
        let item = client
            .prepare_upload(
                "thr-1",
                UploadRequest {
                    file_name: Some("photo.jpg".to_string()),
                    size_bytes: Some(1_024),
                    ..Default::default()
                },
            )
            .await
            .expect("upload settled");
        assert_eq!(item.status, UploadStatus::Ready);
        assert_eq!(item.attachment_id.as_deref(), Some("att-mock"));
        assert_eq!(item.nsfw_band, Some(1));
        assert_eq!(
            item.metadata.get("threadId").and_then(Value::as_str),
            Some("thr-1")
        );
        // progress flowed through the sink
        assert_eq!(item.progress.total_bytes, 1_024);
        assert!(transport.calls().contains(&"getUploadStatus".to_string()));
    }

    #[tokio::test]
    async fn upload_status_polling_times_out_as_failed() {
        let transport = Arc::new(MockTransport::default());
        for _ in 0..5 {
            lock_unpoisoned(&transport.status_sequence).push_back(UploadStatusPayload {
                status: Some("SCANNING".to_string()),
                ..Default::default()
            });
        }
        let client = client_with(Arc::clone(&transport));
        let item = client
            .prepare_upload("thr-1", UploadRequest::default())
            .await
            .expect("upload settled");
        assert_eq!(item.status, UploadStatus::Failed);
        assert_eq!(item.error_code.as_deref(), Some("UPLOAD_STATUS_TIMEOUT"));
    }

    #[tokio::test]
    async fn lock_failure_rolls_the_moderation_state_back() {
        let transport = Arc::new(MockTransport::default());
        transport.fail("lockThread");
        let client = client_with(Arc::clone(&transport));
        {
            let mut controller = lock_unpoisoned(&client.controller);
            controller
                .apply_thread_event(
                    "thr-1",
                    &ThreadEvent::ThreadModerationUpdated {
                        patch: ModerationPatch {
                            locked: Some(false),
                            reason: Some("baseline".to_string()),
                            ..Default::default()
                        },
                    },
                )
                .expect("baseline moderation");
        }
        let err = client
            .lock_thread("thr-1", LockOptions::default(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Transport { .. }));
        let state = thread_state(&client, "thr-1");
        let moderation = state.moderation().expect("moderation");
        assert!(!moderation.locked);
        assert_eq!(moderation.reason.as_deref(), Some("baseline"));
    }

    #[tokio::test]
    async fn pin_thread_applies_after_remote_confirmation() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(Arc::clone(&transport));
        let entry = client
            .pin_thread("thr-1", Value::Null)
            .await
            .expect("pinned")
            .expect("entry");
        assert!(entry.pinned);

        transport.fail("unpinThread");
        assert!(client.unpin_thread("thr-1", Value::Null).await.is_err());
        // remote rejection means the local flag never flipped
        let controller = lock_unpoisoned(&client.controller);
        assert!(controller.inbox().thread("thr-1").map(|t| t.pinned).unwrap_or(false));
    }
}

