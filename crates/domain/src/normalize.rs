use serde_json::{Map, Value};

use crate::action_cards::ActionCard;
use crate::inbox::{
    CreditsSeed, InboxEvent, InboxSnapshot, MessageRequestSeed, RateLimitSeed, ThreadKind,
    ThreadPatch, DEFAULT_MAX_CONVERSATIONS, DEFAULT_RATE_WINDOW_MS,
};
use crate::thread::{
    MessageInput, MessagePatch, ModerationPatch, Participant, ProjectPanel, SafeModeSnapshot,
    ThreadEvent, ThreadSnapshot,
};
use crate::util::parse_rfc3339_ms;

// Upstream envelopes arrive with inconsistent casing and field names.
// Everything is canonicalized here, before it can reach a store.

fn string_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn bool_of(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(raw)) => raw.eq_ignore_ascii_case("true") || raw == "1",
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn f64_of(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn u64_of(value: Option<&Value>) -> Option<u64> {
    f64_of(value).filter(|n| *n >= 0.0).map(|n| n as u64)
}

fn band_of(value: Option<&Value>) -> Option<u8> {
    match value? {
        Value::Number(number) => number.as_u64().map(|n| n.min(u8::MAX as u64) as u8),
        _ => None,
    }
}

/// RFC3339 strings or epoch milliseconds.
fn epoch_ms_of(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(raw) => parse_rfc3339_ms(raw),
        Value::Number(number) => number.as_i64(),
        _ => None,
    }
}

fn map_of(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

fn first<'a>(source: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        let mut cursor = source;
        let mut found = true;
        for part in key.split('.') {
            match cursor.get(part) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found && !cursor.is_null() {
            return Some(cursor);
        }
    }
    None
}

/// Accepts plain arrays, `{edges: [{node}]}` connections, and `{items}`.
fn array_of(source: Option<&Value>) -> Vec<Value> {
    let Some(source) = source else {
        return Vec::new();
    };
    let raw = if let Value::Array(entries) = source {
        entries.clone()
    } else if let Some(Value::Array(edges)) = source.get("edges") {
        edges
            .iter()
            .map(|edge| edge.get("node").unwrap_or(edge).clone())
            .collect()
    } else if let Some(Value::Array(items)) = source.get("items") {
        items.clone()
    } else {
        Vec::new()
    };
    raw.into_iter()
        .map(|entry| match entry.get("node") {
            Some(node) if node.is_object() => node.clone(),
            _ => entry,
        })
        .collect()
}

/// Strips `Event`/`_EVENT` suffixes, splits camelCase, and uppercases.
pub fn canonicalize_event_type(raw: &str) -> Option<String> {
    let mut value = raw.trim().to_string();
    if value.is_empty() {
        return None;
    }
    for suffix in ["_EVENT", "_event", "Event"] {
        if let Some(stripped) = value.strip_suffix(suffix) {
            value = stripped.to_string();
            break;
        }
    }
    let mut out = String::with_capacity(value.len() + 4);
    let mut previous_breaks = false;
    for ch in value.chars() {
        if ch.is_ascii_uppercase() && previous_breaks {
            if !out.ends_with('_') {
                out.push('_');
            }
        }
        previous_breaks = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        out.push(ch.to_ascii_uppercase());
    }
    let mut collapsed = String::with_capacity(out.len());
    for ch in out.chars() {
        if ch == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(ch);
    }
    Some(collapsed)
}

fn envelope_type(envelope: &Value) -> Option<String> {
    let raw = first(
        envelope,
        &["type", "eventType", "__typename", "event.type", "payload.type"],
    )?;
    canonicalize_event_type(raw.as_str()?)
}

fn message_from_value(node: &Value) -> Option<MessageInput> {
    if !node.is_object() {
        return None;
    }
    let message_id = string_id(first(node, &["messageId", "id", "messageID", "nodeId"]))
        .or_else(|| {
            string_id(first(node, &["clientId"])).map(|client_id| format!("temp:{client_id}"))
        })?;
    Some(MessageInput {
        message_id,
        created_at_ms: epoch_ms_of(first(node, &["createdAt", "timestamp", "sentAt"])).unwrap_or(0),
        author_user_id: string_id(first(
            node,
            &["authorUserId", "author.userId", "author.id", "authorId", "senderId"],
        )),
        kind: first(node, &["type", "messageType", "kind"])
            .and_then(Value::as_str)
            .map(|kind| kind.to_ascii_uppercase()),
        body: first(node, &["body"]).and_then(Value::as_str).map(str::to_string),
        attachments: array_of(first(node, &["attachments", "assets"])),
        action: first(node, &["action", "actionCard"]).cloned(),
        nsfw_band: band_of(first(node, &["nsfwBand", "safeModeBand", "nsfwLevel"])),
        moderation: first(node, &["moderation", "moderationState", "moderationMetadata"]).cloned(),
    })
}

fn message_patch_from_value(node: &Value) -> Option<MessagePatch> {
    let message_id = string_id(first(node, &["messageId", "id", "messageID", "nodeId"]))?;
    Some(MessagePatch {
        message_id,
        created_at_ms: epoch_ms_of(first(node, &["createdAt", "timestamp", "sentAt"])),
        author_user_id: string_id(first(
            node,
            &["authorUserId", "author.userId", "author.id", "authorId", "senderId"],
        )),
        kind: first(node, &["type", "messageType", "kind"])
            .and_then(Value::as_str)
            .map(|kind| kind.to_ascii_uppercase()),
        body: first(node, &["body"]).and_then(Value::as_str).map(str::to_string),
        attachments: first(node, &["attachments", "assets"]).map(|value| array_of(Some(value))),
        action: first(node, &["action", "actionCard"]).cloned(),
        nsfw_band: band_of(first(node, &["nsfwBand", "safeModeBand", "nsfwLevel"])),
        moderation: first(node, &["moderation", "moderationState"]).cloned(),
    })
}

fn action_card_from_value(node: &Value) -> Option<ActionCard> {
    if !node.is_object() {
        return None;
    }
    let action_id = string_id(first(node, &["actionId", "id"]))?;
    let created_at_ms =
        epoch_ms_of(first(node, &["createdAt", "timestamp", "insertedAt"])).unwrap_or(0);
    Some(ActionCard {
        action_id,
        card_type: first(node, &["type", "actionType", "kind"])
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        state: first(node, &["state", "status"])
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        version: u64_of(first(node, &["version", "revision", "actionVersion"])).unwrap_or(0),
        created_at_ms,
        updated_at_ms: epoch_ms_of(first(
            node,
            &["updatedAt", "modifiedAt", "lastUpdatedAt", "timestamp"],
        ))
        .unwrap_or(created_at_ms),
        payload: map_of(first(node, &["payload", "data"])),
        metadata: map_of(first(node, &["metadata"])),
        last_intent: None,
        allowed_transitions: None,
    })
}

fn participant_from_value(node: &Value) -> Option<Participant> {
    let user_id = string_id(first(node, &["userId", "id"]))?;
    Some(Participant {
        user_id,
        role: first(node, &["role", "participantRole"])
            .and_then(Value::as_str)
            .map(|role| role.to_ascii_uppercase())
            .unwrap_or_else(|| "GUEST".to_string()),
        last_read_msg_id: string_id(first(node, &["lastReadMsgId", "lastReadMessageId"])),
        last_read_at_ms: epoch_ms_of(first(node, &["lastReadAt"])),
    })
}

fn request_from_value(node: &Value) -> Option<MessageRequestSeed> {
    let request_id = string_id(first(node, &["requestId", "id"]))?;
    let thread_id = string_id(first(node, &["threadId", "thread.threadId", "thread.id"]))?;
    Some(MessageRequestSeed {
        request_id,
        thread_id,
        credit_cost: f64_of(first(node, &["creditCost", "cost", "creditPrice"])).unwrap_or(0.0),
        expires_at_ms: epoch_ms_of(first(node, &["expiresAt", "expiration"])).unwrap_or(0),
        created_at_ms: epoch_ms_of(first(node, &["createdAt", "requestedAt", "insertedAt"]))
            .unwrap_or(0),
    })
}

fn thread_patch_from_value(node: &Value) -> Option<ThreadPatch> {
    let thread_id = string_id(first(node, &["threadId", "id"]))?;
    Some(ThreadPatch {
        thread_id,
        kind: first(node, &["kind"])
            .and_then(Value::as_str)
            .map(|kind| ThreadKind::parse(Some(kind))),
        status: first(node, &["status", "state"])
            .and_then(Value::as_str)
            .map(|status| status.to_ascii_uppercase()),
        last_message_at_ms: epoch_ms_of(first(
            node,
            &["lastMessageAt", "lastMessage.createdAt", "updatedAt", "createdAt"],
        )),
        unread_count: u64_of(first(node, &["unreadCount", "unread"])),
        pinned: first(node, &["pinned", "isPinned"]).map(|value| bool_of(Some(value))),
        archived: first(node, &["archived", "isArchived"]).map(|value| bool_of(Some(value))),
        muted: first(node, &["muted", "isMuted"]).map(|value| bool_of(Some(value))),
        safe_mode_required: first(node, &["safeModeRequired", "requiresSafeMode"])
            .map(|value| bool_of(Some(value))),
        title: first(node, &["title"]).and_then(Value::as_str).map(str::to_string),
        subtitle: first(node, &["subtitle"]).and_then(Value::as_str).map(str::to_string),
        labels: first(node, &["labels"]).map(|value| {
            array_of(Some(value))
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
        metadata: first(node, &["metadata"]).map(|value| map_of(Some(value))),
        moderation: first(node, &["moderation"]).cloned(),
    })
}

fn safe_mode_from_value(node: Option<&Value>) -> SafeModeSnapshot {
    let Some(node) = node else {
        return SafeModeSnapshot::default();
    };
    SafeModeSnapshot {
        band_max: band_of(first(node, &["bandMax", "band", "nsfwBandMax"]))
            .unwrap_or(crate::thread::DEFAULT_SAFE_MODE_BAND_MAX),
        override_enabled: bool_of(first(node, &["override", "hasOverride", "safeModeOverride"])),
    }
}

fn project_panel_from_value(node: Option<&Value>) -> Option<ProjectPanel> {
    let node = node?;
    if !node.is_object() {
        return None;
    }
    Some(ProjectPanel {
        version: u64_of(first(node, &["version", "revision"])).unwrap_or(0),
        tabs: map_of(first(node, &["tabs"])),
    })
}

fn moderation_patch_from_value(node: Option<&Value>, status: Option<String>) -> ModerationPatch {
    let Some(node) = node else {
        return ModerationPatch {
            status,
            ..Default::default()
        };
    };
    ModerationPatch {
        locked: first(node, &["locked"]).map(|value| bool_of(Some(value))),
        blocked: first(node, &["blocked"]).map(|value| bool_of(Some(value))),
        reason: first(node, &["reason"]).and_then(Value::as_str).map(str::to_string),
        severity: first(node, &["severity"]).and_then(Value::as_str).map(str::to_string),
        audit_trail_id: string_id(first(node, &["auditTrailId"])),
        status: status.or_else(|| {
            first(node, &["status", "state"])
                .and_then(Value::as_str)
                .map(str::to_string)
        }),
        updated_at_ms: epoch_ms_of(first(node, &["updatedAt"])),
    }
}

/// One-shot inbox read payload into the shape the inbox store hydrates
/// from. Missing sections fall back to defaults.
pub fn inbox_snapshot_from_payload(payload: &Value) -> InboxSnapshot {
    let threads = array_of(first(payload, &["threads", "edges", "items"]))
        .iter()
        .filter_map(thread_patch_from_value)
        .collect();
    let requests = array_of(first(payload, &["messageRequests", "requests"]))
        .iter()
        .filter_map(request_from_value)
        .collect();
    let rate_limit = first(payload, &["rateLimit", "rateLimitInfo"]).map(|node| RateLimitSeed {
        window_ms: f64_of(first(node, &["windowMs", "windowMilliseconds"]))
            .map(|n| n as i64)
            .or(Some(DEFAULT_RATE_WINDOW_MS)),
        max_conversations: u64_of(first(node, &["maxConversations", "limit", "max"]))
            .map(|n| n as u32)
            .or(Some(DEFAULT_MAX_CONVERSATIONS)),
        initiations: first(node, &["initiations"])
            .map(|value| {
                array_of(Some(value))
                    .iter()
                    .filter_map(|ts| epoch_ms_of(Some(ts)))
                    .collect()
            })
            .unwrap_or_default(),
    });
    let credits = first(payload, &["credits", "creditSummary"]).map(|node| CreditsSeed {
        available: f64_of(first(node, &["available", "remaining", "balance"])),
        cost_per_request: f64_of(first(node, &["costPerRequest", "cost", "price"])),
        floor: f64_of(first(node, &["floor", "minimum", "minBalance"])),
    });
    InboxSnapshot {
        threads,
        requests,
        rate_limit,
        credits,
    }
}

/// One-shot thread read payload into a hydration snapshot.
pub fn thread_snapshot_from_payload(payload: &Value) -> Option<ThreadSnapshot> {
    let header = first(payload, &["thread"]).unwrap_or(payload);
    let thread_id = string_id(first(header, &["threadId", "id"]))?;
    let messages = array_of(first(payload, &["messages"]).or_else(|| first(header, &["messages"])))
        .iter()
        .filter_map(message_from_value)
        .collect();
    let action_cards = array_of(
        first(payload, &["actionCards"]).or_else(|| first(header, &["actionCards"])),
    )
    .iter()
    .filter_map(action_card_from_value)
    .collect();
    let participants = array_of(
        first(payload, &["participants"]).or_else(|| first(header, &["participants"])),
    )
    .iter()
    .filter_map(participant_from_value)
    .collect();
    Some(ThreadSnapshot {
        thread_id,
        kind: ThreadKind::parse(first(header, &["kind"]).and_then(Value::as_str)),
        status: first(header, &["status", "state"])
            .and_then(Value::as_str)
            .map(|status| status.to_ascii_uppercase()),
        safe_mode_required: bool_of(first(header, &["safeModeRequired", "requiresSafeMode"])),
        last_message_at_ms: epoch_ms_of(first(
            header,
            &["lastMessageAt", "lastMessage.createdAt", "updatedAt", "createdAt"],
        )),
        moderation: first(header, &["moderation"])
            .and_then(|value| serde_json::from_value(value.clone()).ok()),
        messages,
        action_cards,
        participants,
        project_panel: project_panel_from_value(
            first(payload, &["projectPanel"]).or_else(|| first(header, &["projectPanel"])),
        ),
        safe_mode: Some(safe_mode_from_value(
            first(payload, &["safeMode"]).or_else(|| first(header, &["safeMode"])),
        )),
        presence_ttl_ms: f64_of(
            first(payload, &["presenceTtlMs", "presenceTTL"])
                .or_else(|| first(header, &["presenceTtlMs", "presenceTTL"])),
        )
        .map(|n| n as i64),
    })
}

fn decision_input_from_value(node: &Value) -> Option<crate::moderation::DecisionInput> {
    let decision = first(node, &["decision"]).and_then(Value::as_str)?;
    Some(crate::moderation::DecisionInput {
        actor_id: string_id(first(node, &["actorId", "userId"])),
        actor_role: first(node, &["actorRole", "role"])
            .and_then(Value::as_str)
            .map(str::to_string),
        decision: Some(decision.to_string()),
        notes: first(node, &["notes"]).and_then(Value::as_str).map(str::to_string),
        decided_at_ms: epoch_ms_of(first(node, &["decidedAt"])),
    })
}

/// Moderation queue payload entries into case seeds.
pub fn case_input_from_value(node: &Value) -> Option<crate::moderation::CaseInput> {
    let case_id = string_id(first(node, &["caseId", "id"]))?;
    Some(crate::moderation::CaseInput {
        case_id: Some(case_id),
        case_type: first(node, &["type", "caseType"])
            .and_then(Value::as_str)
            .map(str::to_string),
        thread_id: string_id(first(node, &["threadId", "thread.threadId"])),
        message_id: string_id(first(node, &["messageId", "message.messageId"])),
        status: first(node, &["status"]).and_then(Value::as_str).map(str::to_string),
        severity: first(node, &["severity"]).and_then(Value::as_str).map(str::to_string),
        reason: first(node, &["reason", "category"])
            .and_then(Value::as_str)
            .map(str::to_string),
        reported_by: string_id(first(node, &["reportedBy", "reporter"])),
        reported_at_ms: epoch_ms_of(first(node, &["reportedAt", "createdAt"])),
        audit_trail_id: string_id(first(node, &["auditTrailId"])),
        requires_dual_approval: bool_of(first(node, &["requiresDualApproval", "dualApproval"])),
        approvals: array_of(first(node, &["approvals"]))
            .iter()
            .filter_map(decision_input_from_value)
            .collect(),
        metadata: map_of(first(node, &["metadata"])),
        source: map_of(first(node, &["source"])),
        created_at_ms: epoch_ms_of(first(node, &["createdAt"])),
        last_updated_at_ms: epoch_ms_of(first(node, &["lastUpdatedAt"])),
        resolution: None,
    })
}

/// Mutation acknowledgements come back as `{message: {...}}` or the bare
/// message node.
pub fn message_ack_from_payload(payload: &Value) -> Option<MessageInput> {
    let node = first(payload, &["message"]).unwrap_or(payload);
    let ack = message_from_value(node)?;
    if ack.message_id.starts_with("temp:") {
        return None;
    }
    Some(ack)
}

pub fn thread_event_from_envelope(envelope: &Value) -> Option<ThreadEvent> {
    let event_type = envelope_type(envelope)?;
    let canonical = match event_type.as_str() {
        "MESSAGE_CREATED" | "MESSAGE_NEW" => "MESSAGE_CREATED",
        "MESSAGE_UPDATED" | "MESSAGE_EDITED" => "MESSAGE_UPDATED",
        "MESSAGE_FAILED" | "MESSAGE_ERROR" => "MESSAGE_FAILED",
        "MESSAGE_FLAGGED" | "MESSAGE_REPORTED" | "MESSAGE_MODERATION_UPDATED" => {
            "MESSAGE_MODERATION_UPDATED"
        }
        "ACTION_CARD_UPDATED" | "ACTION_CARD_CREATED" | "ACTION_CARD_UPSERT"
        | "ACTION_CARD_STATE_CHANGED" | "ACTION_CARD_PATCHED" => "ACTION_CARD_UPSERT",
        "READ_RECEIPT_UPDATED" | "PARTICIPANT_READ_RECEIPT_UPDATED" => "READ_RECEIPT_UPDATED",
        "PRESENCE" | "TYPING" => "PRESENCE",
        "THREAD_STATUS_CHANGED" | "THREAD_STATUS_UPDATED" => "THREAD_STATUS_CHANGED",
        "THREAD_LOCK_STATE" | "THREAD_BLOCK_STATE" | "THREAD_MODERATION_UPDATED" => {
            "THREAD_MODERATION_UPDATED"
        }
        "SAFE_MODE_OVERRIDE" | "SAFE_MODE_CHANGED" => "SAFE_MODE_OVERRIDE",
        "PROJECT_PANEL_UPDATED" | "PROJECT_PANEL_CHANGE" => "PROJECT_PANEL_UPDATED",
        _ => return None,
    };

    match canonical {
        "MESSAGE_CREATED" => {
            let node = first(envelope, &["message", "payload.message", "payload", "data"])?;
            let message = message_from_value(node)?;
            let client_id = string_id(
                first(envelope, &["clientId"])
                    .or_else(|| first(node, &["clientId", "localId", "optimisticId"]))
                    .or_else(|| first(envelope, &["payload.clientId"])),
            );
            Some(ThreadEvent::MessageCreated { message, client_id })
        }
        "MESSAGE_UPDATED" => {
            let node = first(envelope, &["message", "payload.message", "payload", "data"])
                .unwrap_or(envelope);
            Some(ThreadEvent::MessageUpdated {
                patch: message_patch_from_value(node)?,
            })
        }
        "MESSAGE_FAILED" => {
            let client_id = string_id(first(
                envelope,
                &["clientId", "payload.clientId", "data.clientId"],
            ))?;
            Some(ThreadEvent::MessageFailed {
                client_id,
                error_code: string_id(first(
                    envelope,
                    &["errorCode", "payload.errorCode", "data.errorCode"],
                )),
            })
        }
        "MESSAGE_MODERATION_UPDATED" => {
            let node = first(envelope, &["message", "payload.message", "payload", "data"])?;
            let message_id =
                string_id(first(node, &["messageId", "id"]).or_else(|| first(envelope, &["messageId"])))?;
            Some(ThreadEvent::MessageModerationUpdated {
                message_id,
                moderation: first(node, &["moderation"]).cloned(),
            })
        }
        "ACTION_CARD_UPSERT" => {
            let node = first(
                envelope,
                &["actionCard", "payload.actionCard", "payload", "data"],
            )?;
            Some(ThreadEvent::ActionCardUpsert {
                card: action_card_from_value(node)?,
            })
        }
        "READ_RECEIPT_UPDATED" => {
            let node = first(
                envelope,
                &["readReceipt", "payload.readReceipt", "payload", "data"],
            )?;
            Some(ThreadEvent::ReadReceiptUpdated {
                user_id: string_id(first(node, &["userId", "participantId"]))?,
                role: first(node, &["role", "participantRole"])
                    .and_then(Value::as_str)
                    .map(|role| role.to_ascii_uppercase()),
                last_read_msg_id: string_id(first(node, &["lastReadMsgId", "lastReadMessageId"])),
                last_read_at_ms: epoch_ms_of(first(node, &["lastReadAt"])),
            })
        }
        "PRESENCE" => {
            let node = first(envelope, &["presence", "payload.presence", "payload", "data"])?;
            Some(ThreadEvent::Presence {
                user_id: string_id(first(node, &["userId", "participantId"]))?,
                last_seen_ms: epoch_ms_of(first(node, &["lastSeen"])),
                typing: bool_of(first(node, &["typing", "isTyping"])),
            })
        }
        "THREAD_STATUS_CHANGED" => {
            let node = first(envelope, &["payload", "data", "thread"])?;
            Some(ThreadEvent::ThreadStatusChanged {
                status: first(node, &["status", "thread.status"])
                    .and_then(Value::as_str)
                    .map(|status| status.to_ascii_uppercase()),
            })
        }
        "THREAD_MODERATION_UPDATED" => {
            let node = first(envelope, &["thread", "payload.thread", "payload", "data"])?;
            let status = first(node, &["status", "state"])
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(ThreadEvent::ThreadModerationUpdated {
                patch: moderation_patch_from_value(first(node, &["moderation"]), status),
            })
        }
        "SAFE_MODE_OVERRIDE" => {
            let node = first(envelope, &["safeMode", "payload.safeMode", "payload", "data"])?;
            Some(ThreadEvent::SafeModeOverride {
                override_enabled: bool_of(first(node, &["override", "hasOverride"])),
                band_max: band_of(first(node, &["bandMax", "band", "nsfwBandMax"])),
            })
        }
        "PROJECT_PANEL_UPDATED" => {
            let node = first(
                envelope,
                &["projectPanel", "payload.projectPanel", "payload", "data"],
            )?;
            if !node.is_object() {
                return None;
            }
            Some(ThreadEvent::ProjectPanelUpdated {
                version: u64_of(first(node, &["version", "revision"])).unwrap_or(0),
                tabs: map_of(first(node, &["tabs"])),
            })
        }
        _ => None,
    }
}

pub fn inbox_event_from_envelope(envelope: &Value) -> Option<InboxEvent> {
    let event_type = envelope_type(envelope)?;
    let canonical = match event_type.as_str() {
        "THREAD_CREATED" | "THREAD_NEW" => "THREAD_CREATED",
        "THREAD_UPDATED" | "THREAD_EDITED" => "THREAD_UPDATED",
        "THREAD_MESSAGE_RECEIVED" | "THREAD_MESSAGE" => "THREAD_MESSAGE_RECEIVED",
        "THREAD_PINNED" => "THREAD_PINNED",
        "THREAD_UNPINNED" => "THREAD_UNPINNED",
        "THREAD_ARCHIVED" => "THREAD_ARCHIVED",
        "THREAD_UNARCHIVED" => "THREAD_UNARCHIVED",
        "THREAD_MUTED" | "THREAD_UNMUTED" => "THREAD_MUTED",
        "THREAD_BLOCKED" => "THREAD_BLOCKED",
        "THREAD_UNBLOCKED" => "THREAD_UNBLOCKED",
        "THREAD_READ" => "THREAD_READ",
        "REQUEST_RECEIVED" | "MESSAGE_REQUEST_CREATED" => "REQUEST_RECEIVED",
        _ => return None,
    };

    let payload = first(envelope, &["payload", "data"]);
    let payload_thread_id = payload
        .and_then(|node| string_id(first(node, &["threadId", "thread.threadId"])));

    match canonical {
        "THREAD_CREATED" | "THREAD_UPDATED" => {
            let node = first(envelope, &["thread", "payload.thread", "payload", "data"])?;
            let thread = thread_patch_from_value(node)?;
            if canonical == "THREAD_CREATED" {
                Some(InboxEvent::ThreadCreated { thread })
            } else {
                Some(InboxEvent::ThreadUpdated { thread })
            }
        }
        "THREAD_MESSAGE_RECEIVED" => {
            let node = payload?;
            Some(InboxEvent::ThreadMessageReceived {
                thread_id: payload_thread_id?,
                last_message_at_ms: epoch_ms_of(first(
                    node,
                    &["lastMessageAt", "message.createdAt"],
                )),
                increment_unread: u64_of(first(node, &["incrementUnread", "unreadDelta"]))
                    .unwrap_or(1),
            })
        }
        "THREAD_PINNED" => Some(InboxEvent::ThreadPinned {
            thread_id: payload_thread_id?,
        }),
        "THREAD_UNPINNED" => Some(InboxEvent::ThreadUnpinned {
            thread_id: payload_thread_id?,
        }),
        "THREAD_ARCHIVED" => Some(InboxEvent::ThreadArchived {
            thread_id: payload_thread_id?,
        }),
        "THREAD_UNARCHIVED" => Some(InboxEvent::ThreadUnarchived {
            thread_id: payload_thread_id?,
        }),
        "THREAD_MUTED" => {
            let node = payload?;
            Some(InboxEvent::ThreadMuted {
                thread_id: payload_thread_id?,
                muted: bool_of(first(node, &["muted", "isMuted"])),
            })
        }
        "THREAD_BLOCKED" | "THREAD_UNBLOCKED" => {
            let node = payload?;
            let status = first(node, &["status", "thread.status"])
                .and_then(Value::as_str)
                .map(str::to_string);
            let moderation = first(node, &["moderation"]).cloned();
            if canonical == "THREAD_BLOCKED" {
                Some(InboxEvent::ThreadBlocked {
                    thread_id: payload_thread_id?,
                    status,
                    moderation,
                })
            } else {
                Some(InboxEvent::ThreadUnblocked {
                    thread_id: payload_thread_id?,
                    status,
                    moderation,
                })
            }
        }
        "THREAD_READ" => Some(InboxEvent::ThreadRead {
            thread_id: payload_thread_id?,
        }),
        "REQUEST_RECEIVED" => {
            let node = first(envelope, &["request", "payload.request", "payload", "data"])?;
            Some(InboxEvent::RequestReceived {
                request: request_from_value(node)?,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_canonicalization_accepts_varied_spellings() {
        assert_eq!(
            canonicalize_event_type("messageCreatedEvent").as_deref(),
            Some("MESSAGE_CREATED")
        );
        assert_eq!(
            canonicalize_event_type("MESSAGE_CREATED_EVENT").as_deref(),
            Some("MESSAGE_CREATED")
        );
        assert_eq!(
            canonicalize_event_type("ThreadStatusChanged").as_deref(),
            Some("THREAD_STATUS_CHANGED")
        );
        assert_eq!(canonicalize_event_type("   "), None);
    }

    #[test]
    fn message_created_envelope_maps_with_client_id() {
        let envelope = json!({
            "eventType": "messageNew",
            "payload": {
                "message": {
                    "id": 42,
                    "createdAt": "2024-03-01T10:00:00Z",
                    "author": {"userId": "user-9"},
                    "messageType": "text",
                    "body": "hi",
                    "clientId": "c-7"
                }
            }
        });
        let Some(ThreadEvent::MessageCreated { message, client_id }) =
            thread_event_from_envelope(&envelope)
        else {
            panic!("expected MessageCreated");
        };
        assert_eq!(message.message_id, "42");
        assert_eq!(message.author_user_id.as_deref(), Some("user-9"));
        assert_eq!(message.kind.as_deref(), Some("TEXT"));
        assert_eq!(client_id.as_deref(), Some("c-7"));
    }

    #[test]
    fn action_card_envelope_maps_versions_from_aliases() {
        let envelope = json!({
            "__typename": "ActionCardStateChangedEvent",
            "payload": {
                "actionCard": {
                    "id": "act-1",
                    "actionType": "reschedule",
                    "status": "accepted",
                    "revision": 4,
                    "createdAt": "2024-03-01T10:00:00Z"
                }
            }
        });
        let Some(ThreadEvent::ActionCardUpsert { card }) = thread_event_from_envelope(&envelope)
        else {
            panic!("expected ActionCardUpsert");
        };
        assert_eq!(card.card_type, "RESCHEDULE");
        assert_eq!(card.state, "ACCEPTED");
        assert_eq!(card.version, 4);
    }

    #[test]
    fn typing_envelope_maps_to_presence() {
        let envelope = json!({
            "type": "typing",
            "payload": {"presence": {"participantId": "user-3", "isTyping": true}}
        });
        let Some(ThreadEvent::Presence { user_id, typing, .. }) =
            thread_event_from_envelope(&envelope)
        else {
            panic!("expected Presence");
        };
        assert_eq!(user_id, "user-3");
        assert!(typing);
    }

    #[test]
    fn unknown_envelope_types_are_dropped() {
        assert!(thread_event_from_envelope(&json!({"type": "SOMETHING_ELSE"})).is_none());
        assert!(inbox_event_from_envelope(&json!({"type": "SOMETHING_ELSE"})).is_none());
    }

    #[test]
    fn inbox_snapshot_unwraps_graphql_connections() {
        let payload = json!({
            "threads": {"edges": [
                {"node": {"id": "thr-1", "kind": "project", "isPinned": true,
                          "lastMessageAt": "2024-03-01T10:00:00Z", "unread": 3}},
                {"node": {"id": "thr-2", "updatedAt": "2024-03-02T10:00:00Z"}}
            ]},
            "requests": [{"id": "req-1", "threadId": "thr-3", "cost": 4,
                           "expiresAt": "2024-03-05T10:00:00Z",
                           "createdAt": "2024-03-01T09:00:00Z"}],
            "credits": {"balance": 12, "price": 2},
            "rateLimit": {"limit": 3}
        });
        let snapshot = inbox_snapshot_from_payload(&payload);
        assert_eq!(snapshot.threads.len(), 2);
        assert_eq!(snapshot.threads[0].thread_id, "thr-1");
        assert_eq!(snapshot.threads[0].kind, Some(ThreadKind::Project));
        assert_eq!(snapshot.threads[0].pinned, Some(true));
        assert_eq!(snapshot.threads[0].unread_count, Some(3));
        assert_eq!(snapshot.requests.len(), 1);
        assert_eq!(snapshot.requests[0].credit_cost, 4.0);
        let credits = snapshot.credits.expect("credits");
        assert_eq!(credits.available, Some(12.0));
        assert_eq!(credits.cost_per_request, Some(2.0));
        let rate = snapshot.rate_limit.expect("rate limit");
        assert_eq!(rate.max_conversations, Some(3));
    }

    #[test]
    fn thread_snapshot_tolerates_flat_and_nested_shapes() {
        let payload = json!({
            "thread": {"id": "thr-1", "kind": "PROJECT", "state": "open"},
            "messages": [
                {"id": "msg-1", "createdAt": "2024-03-01T10:00:00Z", "senderId": 7}
            ],
            "participants": [{"id": "user-1", "participantRole": "buyer"}],
            "projectPanel": {"revision": 2, "tabs": {"files": {}}},
            "safeMode": {"band": 2, "hasOverride": true}
        });
        let snapshot = thread_snapshot_from_payload(&payload).expect("snapshot");
        assert_eq!(snapshot.thread_id, "thr-1");
        assert_eq!(snapshot.kind, ThreadKind::Project);
        assert_eq!(snapshot.status.as_deref(), Some("OPEN"));
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].author_user_id.as_deref(), Some("7"));
        assert_eq!(snapshot.participants[0].role, "BUYER");
        assert_eq!(snapshot.project_panel.as_ref().map(|panel| panel.version), Some(2));
        let safe_mode = snapshot.safe_mode.expect("safe mode");
        assert_eq!(safe_mode.band_max, 2);
        assert!(safe_mode.override_enabled);
    }

    #[test]
    fn message_ack_accepts_wrapped_and_bare_payloads() {
        let wrapped = json!({"message": {"id": "msg-1", "createdAt": "2024-03-01T10:00:00Z"}});
        assert_eq!(
            message_ack_from_payload(&wrapped).map(|ack| ack.message_id),
            Some("msg-1".to_string())
        );
        let bare = json!({"id": "msg-2", "createdAt": "2024-03-01T10:00:00Z"});
        assert_eq!(
            message_ack_from_payload(&bare).map(|ack| ack.message_id),
            Some("msg-2".to_string())
        );
        // an ack without a server id is not an ack
        assert!(message_ack_from_payload(&json!({"clientId": "c-1"})).is_none());
    }

    #[test]
    fn blocked_envelope_maps_status_and_moderation() {
        let envelope = json!({
            "type": "THREAD_BLOCKED",
            "payload": {"threadId": "thr-1", "status": "LOCKED",
                         "moderation": {"blocked": true}}
        });
        let Some(InboxEvent::ThreadBlocked { thread_id, status, moderation }) =
            inbox_event_from_envelope(&envelope)
        else {
            panic!("expected ThreadBlocked");
        };
        assert_eq!(thread_id, "thr-1");
        assert_eq!(status.as_deref(), Some("LOCKED"));
        assert!(moderation.is_some());
    }

    #[test]
    fn request_envelope_normalizes_aliases() {
        let envelope = json!({
            "type": "MESSAGE_REQUEST_CREATED",
            "payload": {"request": {"id": "req-1", "thread": {"id": "thr-9"},
                                      "creditPrice": "5",
                                      "expiresAt": "2024-03-09T10:00:00Z"}}
        });
        let Some(InboxEvent::RequestReceived { request }) = inbox_event_from_envelope(&envelope)
        else {
            panic!("expected RequestReceived");
        };
        assert_eq!(request.request_id, "req-1");
        assert_eq!(request.thread_id, "thr-9");
        assert_eq!(request.credit_cost, 5.0);
    }
}
