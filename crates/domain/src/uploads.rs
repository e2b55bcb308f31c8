use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;
use crate::DomainResult;

pub const DEFAULT_UPLOAD_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Requested,
    Signed,
    Uploading,
    Scanning,
    Ready,
    Quarantined,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Quarantined | Self::Failed | Self::Cancelled
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "REQUESTED" => Some(Self::Requested),
            "SIGNED" => Some(Self::Signed),
            "UPLOADING" => Some(Self::Uploading),
            "SCANNING" => Some(Self::Scanning),
            "READY" => Some(Self::Ready),
            "QUARANTINED" => Some(Self::Quarantined),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub client_id: String,
    pub attachment_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub status: UploadStatus,
    pub progress: UploadProgress,
    pub checksum: Option<String>,
    pub upload_url: Option<String>,
    pub nsfw_band: Option<u8>,
    pub safe_mode_state: Option<Value>,
    pub error_code: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Default)]
pub struct UploadDescriptor {
    pub client_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct SignedDetails {
    pub attachment_id: Option<String>,
    pub upload_url: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct CompleteDetails {
    pub attachment_id: Option<String>,
    pub checksum: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct AttachmentStatusUpdate {
    pub attachment_id: String,
    pub status: UploadStatus,
    pub nsfw_band: Option<u8>,
    pub safe_mode_state: Option<Value>,
    pub error_code: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Default for UploadStatus {
    fn default() -> Self {
        Self::Scanning
    }
}

/// Per-attachment lifecycle keyed by the client-generated id, with a
/// bidirectional index once the server attachment id is known.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadManager {
    items_by_client_id: HashMap<String, UploadItem>,
    attachment_index: HashMap<String, String>,
    order: Vec<String>,
    ttl_ms: i64,
    last_updated_at_ms: i64,
}

impl UploadManager {
    pub fn new(ttl_ms: Option<i64>, now_ms: i64) -> Self {
        Self {
            items_by_client_id: HashMap::new(),
            attachment_index: HashMap::new(),
            order: Vec::new(),
            ttl_ms: ttl_ms.unwrap_or(DEFAULT_UPLOAD_TTL_MS),
            last_updated_at_ms: now_ms,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&UploadItem> {
        self.items_by_client_id.get(client_id)
    }

    pub fn get_by_attachment_id(&self, attachment_id: &str) -> Option<&UploadItem> {
        self.attachment_index
            .get(attachment_id)
            .and_then(|client_id| self.items_by_client_id.get(client_id))
    }

    pub fn list(&self) -> Vec<&UploadItem> {
        self.order
            .iter()
            .filter_map(|client_id| self.items_by_client_id.get(client_id))
            .collect()
    }

    pub fn register(&self, descriptor: UploadDescriptor, now_ms: i64) -> DomainResult<Self> {
        if descriptor.client_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "upload registration requires clientId".into(),
            ));
        }
        let mut next = self.clone();
        let total_bytes = descriptor.size_bytes.unwrap_or(0);
        let item = UploadItem {
            client_id: descriptor.client_id.clone(),
            attachment_id: None,
            file_name: descriptor.file_name,
            mime_type: descriptor.mime_type,
            size_bytes: descriptor.size_bytes,
            status: UploadStatus::Requested,
            progress: UploadProgress {
                uploaded_bytes: 0,
                total_bytes,
            },
            checksum: descriptor.checksum,
            upload_url: None,
            nsfw_band: None,
            safe_mode_state: None,
            error_code: None,
            metadata: descriptor.metadata,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        if !next.order.contains(&item.client_id) {
            next.order.push(item.client_id.clone());
        }
        next.items_by_client_id.insert(item.client_id.clone(), item);
        next.last_updated_at_ms = now_ms;
        Ok(next)
    }

    fn with_item<F>(&self, client_id: &str, now_ms: i64, mutate: F) -> DomainResult<Self>
    where
        F: FnOnce(&mut Self, &mut UploadItem),
    {
        let mut next = self.clone();
        let mut item = next
            .items_by_client_id
            .get(client_id)
            .cloned()
            .ok_or(DomainError::NotFound)?;
        mutate(&mut next, &mut item);
        item.updated_at_ms = now_ms;
        next.items_by_client_id.insert(client_id.to_string(), item);
        next.last_updated_at_ms = now_ms;
        Ok(next)
    }

    fn link_attachment(next: &mut Self, item: &mut UploadItem, attachment_id: Option<String>) {
        let Some(attachment_id) = attachment_id else {
            return;
        };
        if let Some(previous) = &item.attachment_id {
            if previous != &attachment_id {
                next.attachment_index.remove(previous);
            }
        }
        next.attachment_index
            .insert(attachment_id.clone(), item.client_id.clone());
        item.attachment_id = Some(attachment_id);
    }

    pub fn mark_signed(
        &self,
        client_id: &str,
        details: SignedDetails,
        now_ms: i64,
    ) -> DomainResult<Self> {
        self.with_item(client_id, now_ms, |next, item| {
            item.status = UploadStatus::Signed;
            if details.upload_url.is_some() {
                item.upload_url = details.upload_url;
            }
            for (key, value) in details.metadata {
                item.metadata.insert(key, value);
            }
            Self::link_attachment(next, item, details.attachment_id);
        })
    }

    pub fn mark_progress(
        &self,
        client_id: &str,
        progress: UploadProgress,
        now_ms: i64,
    ) -> DomainResult<Self> {
        self.with_item(client_id, now_ms, |_, item| {
            item.status = UploadStatus::Uploading;
            let total = if progress.total_bytes > 0 {
                progress.total_bytes
            } else if item.progress.total_bytes > 0 {
                item.progress.total_bytes
            } else {
                item.size_bytes.unwrap_or(progress.uploaded_bytes)
            };
            item.progress = UploadProgress {
                uploaded_bytes: progress.uploaded_bytes,
                total_bytes: total,
            };
        })
    }

    pub fn mark_complete(
        &self,
        client_id: &str,
        details: CompleteDetails,
        now_ms: i64,
    ) -> DomainResult<Self> {
        self.with_item(client_id, now_ms, |next, item| {
            item.status = UploadStatus::Scanning;
            if details.checksum.is_some() {
                item.checksum = details.checksum;
            }
            for (key, value) in details.metadata {
                item.metadata.insert(key, value);
            }
            Self::link_attachment(next, item, details.attachment_id);
        })
    }

    /// Server status for an attachment we never linked (foreign upload, or
    /// the event raced the signing ack) is ignored rather than failing.
    pub fn apply_server_status(
        &self,
        update: &AttachmentStatusUpdate,
        now_ms: i64,
    ) -> Option<Self> {
        let client_id = self.attachment_index.get(&update.attachment_id)?.clone();
        self.with_item(&client_id, now_ms, |_, item| {
            item.status = update.status;
            if update.nsfw_band.is_some() {
                item.nsfw_band = update.nsfw_band;
            }
            if update.safe_mode_state.is_some() {
                item.safe_mode_state = update.safe_mode_state.clone();
            }
            item.error_code = update.error_code.clone();
            for (key, value) in &update.metadata {
                item.metadata.insert(key.clone(), value.clone());
            }
        })
        .ok()
    }

    pub fn mark_failed(
        &self,
        client_id: &str,
        error_code: Option<&str>,
        metadata: Map<String, Value>,
        now_ms: i64,
    ) -> DomainResult<Self> {
        self.with_item(client_id, now_ms, |_, item| {
            item.status = UploadStatus::Failed;
            item.error_code = Some(error_code.unwrap_or("UNKNOWN").to_string());
            for (key, value) in metadata {
                item.metadata.insert(key, value);
            }
        })
    }

    pub fn cancel(&self, client_id: &str, now_ms: i64) -> DomainResult<Option<Self>> {
        let item = self
            .items_by_client_id
            .get(client_id)
            .ok_or(DomainError::NotFound)?;
        if item.status.is_terminal() {
            return Ok(None);
        }
        self.with_item(client_id, now_ms, |_, item| {
            item.status = UploadStatus::Cancelled;
        })
        .map(Some)
    }

    /// Removes terminal items older than the TTL. Non-terminal items are
    /// kept regardless of age.
    pub fn prune(&self, now_ms: i64, ttl_override_ms: Option<i64>) -> Option<Self> {
        let ttl = ttl_override_ms.unwrap_or(self.ttl_ms);
        let cutoff = now_ms - ttl;
        let mut next = self.clone();
        let mut removed = false;
        let order = std::mem::take(&mut next.order);
        let mut remaining = Vec::with_capacity(order.len());
        for client_id in &order {
            let Some(item) = next.items_by_client_id.get(client_id) else {
                continue;
            };
            if item.status.is_terminal() && item.updated_at_ms < cutoff {
                if let Some(attachment_id) = &item.attachment_id {
                    next.attachment_index.remove(attachment_id);
                }
                next.items_by_client_id.remove(client_id);
                removed = true;
                continue;
            }
            remaining.push(client_id.clone());
        }
        if !removed {
            return None;
        }
        next.order = remaining;
        next.last_updated_at_ms = now_ms;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(client_id: &str) -> UploadDescriptor {
        UploadDescriptor {
            client_id: client_id.to_string(),
            file_name: Some("photo.jpg".to_string()),
            mime_type: Some("image/jpeg".to_string()),
            size_bytes: Some(2_048),
            ..Default::default()
        }
    }

    #[test]
    fn lifecycle_walks_requested_to_ready() {
        let manager = UploadManager::new(None, 0)
            .register(descriptor("up-1"), 10)
            .expect("register");
        assert_eq!(manager.get("up-1").map(|item| item.status), Some(UploadStatus::Requested));

        let manager = manager
            .mark_signed(
                "up-1",
                SignedDetails {
                    attachment_id: Some("att-1".to_string()),
                    upload_url: Some("https://upload.test/att-1".to_string()),
                    ..Default::default()
                },
                20,
            )
            .expect("signed");
        assert_eq!(
            manager.get_by_attachment_id("att-1").map(|item| item.client_id.as_str()),
            Some("up-1")
        );

        let manager = manager
            .mark_progress(
                "up-1",
                UploadProgress {
                    uploaded_bytes: 1_024,
                    total_bytes: 0,
                },
                30,
            )
            .expect("progress");
        assert_eq!(manager.get("up-1").map(|item| item.progress.total_bytes), Some(2_048));

        let manager = manager
            .mark_complete("up-1", CompleteDetails::default(), 40)
            .expect("complete");
        assert_eq!(manager.get("up-1").map(|item| item.status), Some(UploadStatus::Scanning));

        let manager = manager
            .apply_server_status(
                &AttachmentStatusUpdate {
                    attachment_id: "att-1".to_string(),
                    status: UploadStatus::Ready,
                    nsfw_band: Some(1),
                    ..Default::default()
                },
                50,
            )
            .expect("status applied");
        let item = manager.get("up-1").expect("item");
        assert_eq!(item.status, UploadStatus::Ready);
        assert_eq!(item.nsfw_band, Some(1));
    }

    #[test]
    fn relinking_attachment_id_drops_the_stale_index_entry() {
        let manager = UploadManager::new(None, 0)
            .register(descriptor("up-1"), 10)
            .expect("register")
            .mark_signed(
                "up-1",
                SignedDetails {
                    attachment_id: Some("att-old".to_string()),
                    ..Default::default()
                },
                20,
            )
            .expect("signed")
            .mark_complete(
                "up-1",
                CompleteDetails {
                    attachment_id: Some("att-new".to_string()),
                    ..Default::default()
                },
                30,
            )
            .expect("complete");
        assert!(manager.get_by_attachment_id("att-old").is_none());
        assert_eq!(
            manager.get_by_attachment_id("att-new").map(|item| item.client_id.as_str()),
            Some("up-1")
        );
    }

    #[test]
    fn unknown_attachment_status_is_a_noop() {
        let manager = UploadManager::new(None, 0)
            .register(descriptor("up-1"), 10)
            .expect("register");
        let update = AttachmentStatusUpdate {
            attachment_id: "att-unknown".to_string(),
            status: UploadStatus::Ready,
            ..Default::default()
        };
        assert!(manager.apply_server_status(&update, 20).is_none());
    }

    #[test]
    fn cancel_is_rejected_once_terminal() {
        let manager = UploadManager::new(None, 0)
            .register(descriptor("up-1"), 10)
            .expect("register")
            .mark_failed("up-1", Some("NETWORK"), Map::new(), 20)
            .expect("failed");
        assert!(manager.cancel("up-1", 30).expect("cancel").is_none());
    }

    #[test]
    fn unknown_client_id_fails_fast() {
        let manager = UploadManager::new(None, 0);
        assert!(matches!(
            manager.mark_progress(
                "missing",
                UploadProgress {
                    uploaded_bytes: 1,
                    total_bytes: 1
                },
                5
            ),
            Err(DomainError::NotFound)
        ));
    }

    #[test]
    fn prune_removes_only_aged_terminal_items() {
        let ttl = 300_000;
        let manager = UploadManager::new(Some(ttl), 0)
            .register(descriptor("done"), 500)
            .expect("register")
            .mark_failed("done", Some("NETWORK"), Map::new(), 1_000)
            .expect("failed")
            .register(descriptor("active"), 600)
            .expect("register");

        let now = ttl + 10_000;
        let pruned = manager.prune(now, None).expect("pruned");
        assert!(pruned.get("done").is_none());
        assert!(pruned.get("active").is_some());

        // nothing left to remove
        assert!(pruned.prune(now, None).is_none());
    }
}
