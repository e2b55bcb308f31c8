use serde_json::{Map, Value};

use crate::ports::BoxFuture;
use crate::uploads::UploadProgress;
use crate::DomainResult;

#[derive(Clone, Debug, Default)]
pub struct UploadSession {
    pub attachment_id: Option<String>,
    pub upload_url: Option<String>,
    pub checksum: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct UploadStatusPayload {
    pub status: Option<String>,
    pub nsfw_band: Option<u8>,
    pub safe_mode_state: Option<Value>,
    pub error_code: Option<String>,
    pub metadata: Map<String, Value>,
}

pub type ProgressSink = Box<dyn Fn(UploadProgress) + Send + Sync>;

pub trait UploadTransport: Send + Sync {
    fn create_upload_session(
        &self,
        thread_id: &str,
        descriptor: Value,
    ) -> BoxFuture<'_, DomainResult<UploadSession>>;

    /// Shuttles the bytes to the signed target, reporting progress as it
    /// goes. Adapters without resumable progress may report once.
    fn perform_upload(
        &self,
        session: &UploadSession,
        on_progress: ProgressSink,
    ) -> BoxFuture<'_, DomainResult<()>>;

    fn complete_upload(
        &self,
        thread_id: &str,
        reference: Value,
    ) -> BoxFuture<'_, DomainResult<Option<UploadStatusPayload>>>;

    fn get_upload_status(
        &self,
        attachment_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<UploadStatusPayload>>>;
}
