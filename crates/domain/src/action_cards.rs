use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;
use crate::util::immutable_event_hash;
use crate::DomainResult;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEdge {
    pub intent: String,
    pub to_state: String,
}

impl TransitionEdge {
    pub fn new(intent: impl Into<String>, to_state: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            to_state: to_state.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionCard {
    pub action_id: String,
    #[serde(rename = "type")]
    pub card_type: String,
    pub state: String,
    pub version: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub last_intent: Option<String>,
    /// Card-embedded transition table; wins over the type+state lookup.
    #[serde(default)]
    pub allowed_transitions: Option<Vec<TransitionEdge>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActionCardDefinition {
    pub category: String,
    pub states: HashMap<String, Vec<TransitionEdge>>,
    pub terminal: Vec<String>,
}

fn definition(
    category: &str,
    states: &[(&str, &[(&str, &str)])],
    terminal: &[&str],
) -> ActionCardDefinition {
    ActionCardDefinition {
        category: category.to_string(),
        states: states
            .iter()
            .map(|(state, edges)| {
                (
                    state.to_string(),
                    edges
                        .iter()
                        .map(|(intent, to_state)| TransitionEdge::new(*intent, *to_state))
                        .collect(),
                )
            })
            .collect(),
        terminal: terminal.iter().map(|value| value.to_string()).collect(),
    }
}

pub fn default_definitions() -> HashMap<String, ActionCardDefinition> {
    let mut table = HashMap::new();
    table.insert(
        "RESCHEDULE".to_string(),
        definition(
            "booking.schedule",
            &[(
                "PENDING",
                &[
                    ("accept", "ACCEPTED"),
                    ("decline", "DECLINED"),
                    ("expire", "EXPIRED"),
                ],
            )],
            &["ACCEPTED", "DECLINED", "EXPIRED"],
        ),
    );
    table.insert(
        "REQUEST_EXTRA".to_string(),
        definition(
            "booking.extras",
            &[
                (
                    "PENDING",
                    &[
                        ("approve", "PAID"),
                        ("decline", "DECLINED"),
                        ("fail", "FAILED"),
                    ],
                ),
                ("PAID", &[("refund", "REFUNDED")]),
            ],
            &["PAID", "DECLINED", "FAILED", "REFUNDED"],
        ),
    );
    table.insert(
        "OVERTIME_START".to_string(),
        definition(
            "booking.overtime",
            &[
                ("PENDING", &[("confirm", "RUNNING"), ("cancel", "CANCELLED")]),
                ("RUNNING", &[("stop", "STOPPED")]),
            ],
            &["STOPPED", "CANCELLED"],
        ),
    );
    table.insert(
        "OVERTIME_STOP".to_string(),
        definition(
            "booking.overtime",
            &[("PENDING", &[("confirm", "STOPPED"), ("fail", "FAILED")])],
            &["STOPPED", "FAILED"],
        ),
    );
    table.insert(
        "DELIVERABLE_PROOF".to_string(),
        definition(
            "deliverables.proof",
            &[
                (
                    "SUBMITTED",
                    &[
                        ("approve", "APPROVED"),
                        ("request_revisions", "REVISION_REQUESTED"),
                    ],
                ),
                (
                    "REVISION_REQUESTED",
                    &[("resubmit", "SUBMITTED"), ("cancel", "CANCELLED")],
                ),
            ],
            &["APPROVED", "CANCELLED"],
        ),
    );
    table.insert(
        "DELIVERABLE_FINAL".to_string(),
        definition(
            "deliverables.final",
            &[
                (
                    "SUBMITTED",
                    &[
                        ("acknowledge", "ACCEPTED"),
                        ("request_revisions", "REVISION_REQUESTED"),
                    ],
                ),
                (
                    "REVISION_REQUESTED",
                    &[("resubmit", "SUBMITTED"), ("cancel", "CANCELLED")],
                ),
            ],
            &["ACCEPTED", "CANCELLED"],
        ),
    );
    table.insert(
        "CANCEL_REQUEST".to_string(),
        definition(
            "booking.cancellation",
            &[
                (
                    "PENDING",
                    &[
                        ("approve", "APPROVED"),
                        ("decline", "DECLINED"),
                        ("escalate", "ESCALATED"),
                    ],
                ),
                ("ESCALATED", &[("resolve", "RESOLVED")]),
            ],
            &["APPROVED", "DECLINED", "RESOLVED"],
        ),
    );
    table.insert(
        "REFUND_REQUEST".to_string(),
        definition(
            "booking.refund",
            &[
                (
                    "PENDING",
                    &[
                        ("approve", "APPROVED"),
                        ("decline", "DECLINED"),
                        ("escalate", "ESCALATED"),
                    ],
                ),
                ("APPROVED", &[("settle", "SETTLED")]),
                ("ESCALATED", &[("resolve", "RESOLVED")]),
            ],
            &["DECLINED", "SETTLED", "RESOLVED"],
        ),
    );
    table.insert(
        "ACCEPTANCE_ACK".to_string(),
        definition(
            "booking.completion",
            &[("PENDING", &[("acknowledge", "COMPLETED")])],
            &["COMPLETED"],
        ),
    );
    table.insert(
        "DEPOSIT_CLAIM_OPEN".to_string(),
        definition(
            "finance.deposit_claim",
            &[
                (
                    "PENDING",
                    &[
                        ("approve", "APPROVED"),
                        ("deny", "DENIED"),
                        ("escalate", "ESCALATED"),
                    ],
                ),
                ("ESCALATED", &[("resolve", "RESOLVED")]),
            ],
            &["APPROVED", "DENIED", "RESOLVED"],
        ),
    );
    table.insert(
        "DISPUTE_OPEN".to_string(),
        definition(
            "finance.dispute",
            &[
                ("OPEN", &[("settle", "SETTLED"), ("escalate", "ESCALATED")]),
                ("ESCALATED", &[("resolve", "RESOLVED")]),
            ],
            &["SETTLED", "RESOLVED"],
        ),
    );
    table
}

#[derive(Clone, Debug, Default)]
pub struct TransitionOptions {
    pub updated_at_ms: Option<i64>,
    pub version: Option<u64>,
    pub version_increment: Option<u64>,
    pub metadata: Option<Map<String, Value>>,
    /// Merged over the existing payload. Absent means the payload is kept.
    pub payload_patch: Option<Map<String, Value>>,
    pub actor_user_id: Option<String>,
    pub thread_id: Option<String>,
    pub audit_metadata: Option<Value>,
    pub suppress_audit: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionCardAudit {
    pub action_id: String,
    pub action_type: String,
    pub from_state: String,
    pub to_state: String,
    pub intent: String,
    pub version: u64,
    pub actor_user_id: Option<String>,
    pub thread_id: Option<String>,
    pub occurred_at_ms: i64,
    pub category: Option<String>,
    pub metadata: Option<Value>,
    pub digest: String,
}

#[derive(Clone, Debug)]
pub struct TransitionOutcome {
    pub card: ActionCard,
    pub audit: Option<ActionCardAudit>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionCardSummary {
    pub card_type: String,
    pub state: String,
    pub pending: bool,
    pub category: Option<String>,
    pub last_updated_at_ms: i64,
}

/// Stateless transition evaluator over an immutable definition table.
/// The table is injected at construction and never mutated.
#[derive(Clone)]
pub struct ActionCardEngine {
    definitions: HashMap<String, ActionCardDefinition>,
}

impl Default for ActionCardEngine {
    fn default() -> Self {
        Self {
            definitions: default_definitions(),
        }
    }
}

impl ActionCardEngine {
    pub fn new(definitions: HashMap<String, ActionCardDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definition(&self, card_type: &str) -> Option<&ActionCardDefinition> {
        self.definitions.get(card_type)
    }

    pub fn allowed_transitions(&self, card: &ActionCard) -> Vec<TransitionEdge> {
        if let Some(embedded) = &card.allowed_transitions {
            return embedded.clone();
        }
        self.definitions
            .get(&card.card_type)
            .and_then(|definition| definition.states.get(&card.state))
            .cloned()
            .unwrap_or_default()
    }

    pub fn transition(
        &self,
        card: &ActionCard,
        intent: &str,
        now_ms: i64,
        options: &TransitionOptions,
    ) -> DomainResult<TransitionOutcome> {
        if intent.trim().is_empty() {
            return Err(DomainError::Validation("intent is required".into()));
        }
        let edges = self.allowed_transitions(card);
        let matched = edges
            .iter()
            .find(|edge| edge.intent.eq_ignore_ascii_case(intent))
            .ok_or_else(|| DomainError::InvalidTransition {
                intent: intent.to_string(),
                card_type: card.card_type.clone(),
                state: card.state.clone(),
            })?;

        let updated_at_ms = options.updated_at_ms.unwrap_or(now_ms);
        let version = match options.version {
            Some(version) => version,
            None => card.version + options.version_increment.unwrap_or(1),
        };

        let mut payload = card.payload.clone();
        if let Some(patch) = &options.payload_patch {
            for (key, value) in patch {
                payload.insert(key.clone(), value.clone());
            }
        }
        let mut metadata = card.metadata.clone();
        if let Some(extra) = &options.metadata {
            for (key, value) in extra {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let next = ActionCard {
            action_id: card.action_id.clone(),
            card_type: card.card_type.clone(),
            state: matched.to_state.clone(),
            version,
            created_at_ms: card.created_at_ms,
            updated_at_ms,
            payload,
            metadata,
            last_intent: Some(intent.to_string()),
            allowed_transitions: card.allowed_transitions.clone(),
        };

        let audit = if options.suppress_audit {
            None
        } else {
            let category = self
                .definitions
                .get(&card.card_type)
                .map(|definition| definition.category.clone());
            let digest = immutable_event_hash(&serde_json::json!({
                "actionId": card.action_id,
                "actionType": card.card_type,
                "fromState": card.state,
                "toState": matched.to_state,
                "intent": intent,
                "version": version,
                "occurredAtMs": updated_at_ms,
            }))?;
            Some(ActionCardAudit {
                action_id: card.action_id.clone(),
                action_type: card.card_type.clone(),
                from_state: card.state.clone(),
                to_state: matched.to_state.clone(),
                intent: intent.to_string(),
                version,
                actor_user_id: options.actor_user_id.clone(),
                thread_id: options.thread_id.clone(),
                occurred_at_ms: updated_at_ms,
                category,
                metadata: options.audit_metadata.clone(),
                digest,
            })
        };

        Ok(TransitionOutcome { card: next, audit })
    }

    pub fn is_terminal(&self, card: &ActionCard) -> bool {
        self.definitions
            .get(&card.card_type)
            .map(|definition| definition.terminal.iter().any(|state| state == &card.state))
            .unwrap_or(false)
    }

    pub fn describe(&self, card: &ActionCard) -> ActionCardSummary {
        ActionCardSummary {
            card_type: card.card_type.clone(),
            state: card.state.clone(),
            pending: !self.is_terminal(card),
            category: self
                .definitions
                .get(&card.card_type)
                .map(|definition| definition.category.clone()),
            last_updated_at_ms: card.updated_at_ms.max(card.created_at_ms),
        }
    }
}
