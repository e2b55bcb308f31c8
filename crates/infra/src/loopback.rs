use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use parley_domain::error::DomainError;
use parley_domain::ports::{
    BoxFuture, Disposer, EnvelopeHandlers, MessagingFetch, MessagingMutations,
    MessagingSubscriptions, ProgressSink, SendMessageArgs, UploadSession, UploadStatusPayload,
    UploadTransport,
};
use parley_domain::uploads::UploadProgress;
use parley_domain::DomainResult;
use serde_json::{json, Value};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type HandlerList = Arc<Mutex<Vec<(u64, Arc<EnvelopeHandlers>)>>>;
type ThreadHandlerList = Arc<Mutex<Vec<(u64, String, Arc<EnvelopeHandlers>)>>>;

/// In-memory transport for tests and local development. Fetches serve
/// canned payloads, mutations are logged and acked (or rejected on
/// request), and subscriptions are fed by `publish_*` calls.
#[derive(Default)]
pub struct LoopbackTransport {
    inbox_payload: Mutex<Value>,
    thread_payloads: Mutex<HashMap<String, Value>>,
    moderation_payload: Mutex<Value>,
    mutation_log: Mutex<Vec<(String, Value)>>,
    rejected_intents: Mutex<HashSet<String>>,
    upload_statuses: Mutex<VecDeque<UploadStatusPayload>>,
    inbox_handlers: HandlerList,
    thread_handlers: ThreadHandlerList,
    seq: AtomicU64,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn set_inbox_payload(&self, payload: Value) {
        *lock(&self.inbox_payload) = payload;
    }

    pub fn set_thread_payload(&self, thread_id: &str, payload: Value) {
        lock(&self.thread_payloads).insert(thread_id.to_string(), payload);
    }

    pub fn set_moderation_payload(&self, payload: Value) {
        *lock(&self.moderation_payload) = payload;
    }

    /// Makes the named intent fail until cleared.
    pub fn reject_intent(&self, intent: &str) {
        lock(&self.rejected_intents).insert(intent.to_string());
    }

    pub fn clear_rejections(&self) {
        lock(&self.rejected_intents).clear();
    }

    pub fn queue_upload_status(&self, payload: UploadStatusPayload) {
        lock(&self.upload_statuses).push_back(payload);
    }

    pub fn mutation_log(&self) -> Vec<(String, Value)> {
        lock(&self.mutation_log).clone()
    }

    pub fn publish_inbox_envelope(&self, envelope: Value) {
        let handlers: Vec<Arc<EnvelopeHandlers>> = lock(&self.inbox_handlers)
            .iter()
            .map(|(_, handlers)| Arc::clone(handlers))
            .collect();
        for handler in handlers {
            (handler.next)(envelope.clone());
        }
    }

    pub fn publish_thread_envelope(&self, thread_id: &str, envelope: Value) {
        let handlers: Vec<Arc<EnvelopeHandlers>> = lock(&self.thread_handlers)
            .iter()
            .filter(|(_, id, _)| id == thread_id)
            .map(|(_, _, handlers)| Arc::clone(handlers))
            .collect();
        for handler in handlers {
            (handler.next)(envelope.clone());
        }
    }

    /// Simulates a dropped stream: every thread subscription for the id
    /// sees the error.
    pub fn fail_thread_subscription(&self, thread_id: &str, code: &str) {
        let handlers: Vec<Arc<EnvelopeHandlers>> = lock(&self.thread_handlers)
            .iter()
            .filter(|(_, id, _)| id == thread_id)
            .map(|(_, _, handlers)| Arc::clone(handlers))
            .collect();
        for handler in handlers {
            (handler.error)(DomainError::transport(code, "loopback stream failure"));
        }
    }

    pub fn subscriber_counts(&self) -> (usize, usize) {
        (
            lock(&self.inbox_handlers).len(),
            lock(&self.thread_handlers).len(),
        )
    }

    fn mutate(&self, intent: &str, args: Value, response: Value) -> BoxFuture<'_, DomainResult<Value>> {
        lock(&self.mutation_log).push((intent.to_string(), args));
        let rejected = lock(&self.rejected_intents).contains(intent);
        Box::pin(async move {
            if rejected {
                Err(DomainError::transport(
                    "LOOPBACK_REJECTED",
                    "intent rejected by loopback transport",
                ))
            } else {
                Ok(response)
            }
        })
    }
}

impl MessagingFetch for LoopbackTransport {
    fn fetch_inbox(&self, _args: Value) -> BoxFuture<'_, DomainResult<Value>> {
        let payload = lock(&self.inbox_payload).clone();
        Box::pin(async move { Ok(payload) })
    }

    fn fetch_thread(&self, thread_id: &str, _args: Value) -> BoxFuture<'_, DomainResult<Value>> {
        let payload = lock(&self.thread_payloads).get(thread_id).cloned();
        Box::pin(async move {
            payload.ok_or_else(|| {
                DomainError::transport("THREAD_NOT_FOUND", "no canned thread payload")
            })
        })
    }

    fn fetch_moderation_queue(&self, _args: Value) -> BoxFuture<'_, DomainResult<Value>> {
        let payload = lock(&self.moderation_payload).clone();
        Box::pin(async move { Ok(payload) })
    }
}

impl MessagingSubscriptions for LoopbackTransport {
    fn subscribe_inbox(&self, handlers: EnvelopeHandlers) -> DomainResult<Disposer> {
        let id = self.next_seq();
        let registry = Arc::clone(&self.inbox_handlers);
        lock(&registry).push((id, Arc::new(handlers)));
        Ok(Disposer::new(move || {
            lock(&registry).retain(|(entry_id, _)| *entry_id != id);
        }))
    }

    fn subscribe_thread(
        &self,
        thread_id: &str,
        handlers: EnvelopeHandlers,
    ) -> DomainResult<Disposer> {
        let id = self.next_seq();
        let registry = Arc::clone(&self.thread_handlers);
        lock(&registry).push((id, thread_id.to_string(), Arc::new(handlers)));
        Ok(Disposer::new(move || {
            lock(&registry).retain(|(entry_id, _, _)| *entry_id != id);
        }))
    }
}

impl MessagingMutations for LoopbackTransport {
    fn send_message(
        &self,
        thread_id: &str,
        input: &SendMessageArgs,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        let message_id = format!("srv_{}", self.next_seq());
        let response = json!({
            "message": {
                "id": message_id,
                "createdAt": input.created_at_ms.unwrap_or(0),
                "authorUserId": input.author_user_id,
                "body": input.body,
                "clientId": input.client_id,
            }
        });
        self.mutate(
            "sendMessage",
            json!({"threadId": thread_id, "clientId": input.client_id}),
            response,
        )
    }

    fn mark_thread_read(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("markThreadRead", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn accept_message_request(
        &self,
        request_id: &str,
        ctx: Value,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "acceptMessageRequest",
            json!({"requestId": request_id, "ctx": ctx}),
            Value::Null,
        )
    }

    fn decline_message_request(
        &self,
        request_id: &str,
        ctx: Value,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "declineMessageRequest",
            json!({"requestId": request_id, "ctx": ctx}),
            Value::Null,
        )
    }

    fn pin_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("pinThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn unpin_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("unpinThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn archive_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("archiveThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn unarchive_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("unarchiveThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn mute_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("muteThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn unmute_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("unmuteThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn report_message(
        &self,
        thread_id: &str,
        message_id: &str,
        ctx: Value,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "reportMessage",
            json!({"threadId": thread_id, "messageId": message_id, "ctx": ctx}),
            Value::Null,
        )
    }

    fn report_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("reportThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn lock_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("lockThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn unlock_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("unlockThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn block_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("blockThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn unblock_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("unblockThread", json!({"threadId": thread_id, "ctx": ctx}), Value::Null)
    }

    fn update_moderation_case(
        &self,
        case_id: &str,
        patch: Value,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "updateModerationQueueCase",
            json!({"caseId": case_id, "patch": patch}),
            Value::Null,
        )
    }

    fn submit_moderation_decision(
        &self,
        case_id: &str,
        decision: Value,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "submitModerationDecision",
            json!({"caseId": case_id, "decision": decision}),
            Value::Null,
        )
    }

    fn resolve_moderation_case(
        &self,
        case_id: &str,
        resolution: Value,
    ) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "resolveModerationQueueCase",
            json!({"caseId": case_id, "resolution": resolution}),
            Value::Null,
        )
    }

    fn remove_moderation_case(&self, case_id: &str) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate(
            "removeModerationQueueCase",
            json!({"caseId": case_id}),
            Value::Null,
        )
    }

    fn record_conversation_start(&self, ctx: Value) -> BoxFuture<'_, DomainResult<Value>> {
        self.mutate("recordConversationStart", json!({"ctx": ctx}), Value::Null)
    }
}

impl UploadTransport for LoopbackTransport {
    fn create_upload_session(
        &self,
        thread_id: &str,
        descriptor: Value,
    ) -> BoxFuture<'_, DomainResult<UploadSession>> {
        lock(&self.mutation_log).push((
            "createUploadSession".to_string(),
            json!({"threadId": thread_id, "descriptor": descriptor}),
        ));
        let rejected = lock(&self.rejected_intents).contains("createUploadSession");
        let attachment_id = format!("att_{}", self.next_seq());
        Box::pin(async move {
            if rejected {
                return Err(DomainError::transport(
                    "LOOPBACK_REJECTED",
                    "upload session rejected",
                ));
            }
            Ok(UploadSession {
                attachment_id: Some(attachment_id.clone()),
                upload_url: Some(format!("loopback://upload/{attachment_id}")),
                ..Default::default()
            })
        })
    }

    fn perform_upload(
        &self,
        _session: &UploadSession,
        on_progress: ProgressSink,
    ) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            on_progress(UploadProgress {
                uploaded_bytes: 1,
                total_bytes: 1,
            });
            Ok(())
        })
    }

    fn complete_upload(
        &self,
        thread_id: &str,
        reference: Value,
    ) -> BoxFuture<'_, DomainResult<Option<UploadStatusPayload>>> {
        lock(&self.mutation_log).push((
            "completeUpload".to_string(),
            json!({"threadId": thread_id, "reference": reference}),
        ));
        let next = lock(&self.upload_statuses).pop_front();
        Box::pin(async move {
            Ok(Some(next.unwrap_or(UploadStatusPayload {
                status: Some("READY".to_string()),
                ..Default::default()
            })))
        })
    }

    fn get_upload_status(
        &self,
        _attachment_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<UploadStatusPayload>>> {
        let next = lock(&self.upload_statuses).pop_front();
        Box::pin(async move { Ok(next) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposers_unregister_and_stay_idempotent() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = Arc::clone(&seen);
        let mut disposer = transport
            .subscribe_thread(
                "thr-1",
                EnvelopeHandlers {
                    next: Box::new(move |_| {
                        *lock(&seen_clone) += 1;
                    }),
                    error: Box::new(|_| {}),
                    complete: Box::new(|| {}),
                },
            )
            .expect("subscribed");
        transport.publish_thread_envelope("thr-1", json!({"type": "PRESENCE"}));
        assert_eq!(*lock(&seen), 1);
        disposer.dispose();
        disposer.dispose();
        transport.publish_thread_envelope("thr-1", json!({"type": "PRESENCE"}));
        assert_eq!(*lock(&seen), 1);
        assert_eq!(transport.subscriber_counts().1, 0);
    }

    #[tokio::test]
    async fn rejected_intents_fail_with_transport_errors() {
        let transport = LoopbackTransport::new();
        transport.reject_intent("pinThread");
        let err = transport
            .pin_thread("thr-1", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Transport { .. }));
        transport.clear_rejections();
        assert!(transport.pin_thread("thr-1", Value::Null).await.is_ok());
        assert_eq!(transport.mutation_log().len(), 2);
    }
}
