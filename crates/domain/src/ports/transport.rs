use serde_json::Value;

use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::DomainResult;

/// One-shot reads. Payloads come back in whatever shape the upstream
/// serves; the normalization layer maps them onto the canonical model.
pub trait MessagingFetch: Send + Sync {
    fn fetch_inbox(&self, args: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn fetch_thread(&self, thread_id: &str, args: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn fetch_moderation_queue(&self, args: Value) -> BoxFuture<'_, DomainResult<Value>>;
}

pub struct EnvelopeHandlers {
    pub next: Box<dyn Fn(Value) + Send + Sync>,
    pub error: Box<dyn Fn(DomainError) + Send + Sync>,
    pub complete: Box<dyn Fn() + Send + Sync>,
}

/// Idempotent teardown for a live subscription.
pub struct Disposer(Option<Box<dyn FnOnce() + Send>>);

impl Disposer {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(teardown)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn dispose(&mut self) {
        if let Some(teardown) = self.0.take() {
            teardown();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.0.is_none()
    }
}

pub trait MessagingSubscriptions: Send + Sync {
    fn subscribe_inbox(&self, handlers: EnvelopeHandlers) -> DomainResult<Disposer>;

    fn subscribe_thread(
        &self,
        thread_id: &str,
        handlers: EnvelopeHandlers,
    ) -> DomainResult<Disposer>;
}

#[derive(Clone, Debug, Default)]
pub struct SendMessageArgs {
    pub client_id: String,
    pub body: Option<String>,
    pub kind: Option<String>,
    pub attachments: Vec<Value>,
    pub created_at_ms: Option<i64>,
    pub author_user_id: Option<String>,
}

/// Intent-keyed mutations. Each is invoked after the optimistic local
/// update has been applied; a failure triggers the compensating action.
pub trait MessagingMutations: Send + Sync {
    fn send_message(
        &self,
        thread_id: &str,
        input: &SendMessageArgs,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn mark_thread_read(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn accept_message_request(
        &self,
        request_id: &str,
        ctx: Value,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn decline_message_request(
        &self,
        request_id: &str,
        ctx: Value,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn pin_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn unpin_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn archive_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn unarchive_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn mute_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn unmute_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn report_message(
        &self,
        thread_id: &str,
        message_id: &str,
        ctx: Value,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn report_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn lock_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn unlock_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn block_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn unblock_thread(&self, thread_id: &str, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;

    fn update_moderation_case(
        &self,
        case_id: &str,
        patch: Value,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn submit_moderation_decision(
        &self,
        case_id: &str,
        decision: Value,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn resolve_moderation_case(
        &self,
        case_id: &str,
        resolution: Value,
    ) -> BoxFuture<'_, DomainResult<Value>>;

    fn remove_moderation_case(&self, case_id: &str) -> BoxFuture<'_, DomainResult<Value>>;

    fn record_conversation_start(&self, ctx: Value) -> BoxFuture<'_, DomainResult<Value>>;
}
