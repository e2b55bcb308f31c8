use serde::{Deserialize, Serialize};

use crate::uploads::UploadStatus;

pub const DEFAULT_SAFE_MODE_BAND: u8 = 1;

#[derive(Clone, Copy, Debug, Default)]
pub struct SafeModeContext {
    pub thread_safe_mode_required: bool,
    pub thread_band_max: Option<u8>,
    pub user_is_verified_adult: bool,
    pub user_override_requested: bool,
    pub allow_override: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafeModeState {
    pub enabled: bool,
    pub band_max: u8,
    pub override_allowed: bool,
    pub reason: SafeModeReason,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafeModeReason {
    ThreadRequired,
    NotAllowed,
    UserDisabled,
    OverrideActive,
}

/// Effective Safe-Mode state for the current viewer. Overrides are only
/// honoured for verified adults on threads that do not force Safe-Mode.
pub fn compute_safe_mode_state(ctx: SafeModeContext) -> SafeModeState {
    let thread_band_max = ctx.thread_band_max.unwrap_or(DEFAULT_SAFE_MODE_BAND);
    let override_allowed =
        ctx.allow_override && ctx.user_is_verified_adult && !ctx.thread_safe_mode_required;
    let enabled =
        ctx.thread_safe_mode_required || !override_allowed || !ctx.user_override_requested;
    let band_max = if enabled {
        thread_band_max
    } else {
        thread_band_max.max(2)
    };
    let reason = if !enabled {
        SafeModeReason::OverrideActive
    } else if ctx.thread_safe_mode_required {
        SafeModeReason::ThreadRequired
    } else if !override_allowed {
        SafeModeReason::NotAllowed
    } else {
        SafeModeReason::UserDisabled
    };
    SafeModeState {
        enabled,
        band_max,
        override_allowed,
        reason,
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisplayState {
    Visible,
    Blurred,
    Blocked,
    Pending,
    Quarantined,
    Error,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDisplay {
    pub display_state: DisplayState,
    pub reason: &'static str,
}

/// How an attachment should render under Safe-Mode. One band over the
/// limit blurs, anything further blocks.
pub fn attachment_display_state(
    nsfw_band: u8,
    safe_mode: SafeModeState,
    status: Option<UploadStatus>,
) -> AttachmentDisplay {
    match status {
        Some(UploadStatus::Quarantined) => {
            return AttachmentDisplay {
                display_state: DisplayState::Quarantined,
                reason: "SAFETY_REVIEW",
            }
        }
        Some(UploadStatus::Failed) => {
            return AttachmentDisplay {
                display_state: DisplayState::Error,
                reason: "UPLOAD_FAILED",
            }
        }
        Some(UploadStatus::Uploading) => {
            return AttachmentDisplay {
                display_state: DisplayState::Pending,
                reason: "UPLOADING",
            }
        }
        Some(UploadStatus::Scanning) => {
            return AttachmentDisplay {
                display_state: DisplayState::Pending,
                reason: "SCANNING",
            }
        }
        _ => {}
    }
    if !safe_mode.enabled {
        return AttachmentDisplay {
            display_state: DisplayState::Visible,
            reason: "SAFE_MODE_OFF",
        };
    }
    if nsfw_band <= safe_mode.band_max {
        AttachmentDisplay {
            display_state: DisplayState::Visible,
            reason: "WITHIN_THRESHOLD",
        }
    } else if nsfw_band == safe_mode.band_max + 1 {
        AttachmentDisplay {
            display_state: DisplayState::Blurred,
            reason: "SOFT_EXCEEDANCE",
        }
    } else {
        AttachmentDisplay {
            display_state: DisplayState::Blocked,
            reason: "HARD_EXCEEDANCE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilteredBody {
    pub body: String,
    pub redacted: bool,
}

pub fn filter_message_body(body: &str, safe_mode: SafeModeState, nsfw_band: u8) -> FilteredBody {
    if !safe_mode.enabled || nsfw_band <= safe_mode.band_max {
        return FilteredBody {
            body: body.to_string(),
            redacted: false,
        };
    }
    FilteredBody {
        body: "[Safe-Mode protected message]".to_string(),
        redacted: true,
    }
}
