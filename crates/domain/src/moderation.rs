use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_SEVERITY: &str = "MEDIUM";
const DEFAULT_STATUS: &str = "PENDING";
const DEFAULT_REQUIRED_APPROVALS: u32 = 2;

pub const CASE_STATUS_PENDING: &str = "PENDING";
pub const CASE_STATUS_AWAITING_SECOND_APPROVAL: &str = "AWAITING_SECOND_APPROVAL";
pub const CASE_STATUS_RESOLVED: &str = "RESOLVED";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseType {
    #[default]
    Message,
    Thread,
}

impl CaseType {
    pub fn parse(value: Option<&str>, fallback: CaseType) -> CaseType {
        match value.map(|value| value.trim().to_ascii_uppercase()) {
            Some(ref upper) if upper == "THREAD" => CaseType::Thread,
            Some(ref upper) if upper == "MESSAGE" => CaseType::Message,
            _ => fallback,
        }
    }
}

// Status and severity are free-form upstream; they are trimmed and
// uppercased here but otherwise accepted as-is.
fn normalize_token(value: Option<&str>, fallback: &str) -> String {
    match value {
        Some(raw) => {
            let upper = raw.trim().to_ascii_uppercase();
            if upper.is_empty() {
                fallback.to_string()
            } else {
                upper
            }
        }
        None => fallback.to_string(),
    }
}

fn normalize_id(value: Option<&str>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub decision: String,
    pub notes: Option<String>,
    pub decided_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct DecisionInput {
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub decision: Option<String>,
    pub notes: Option<String>,
    pub decided_at_ms: Option<i64>,
}

impl DecisionInput {
    fn normalize(&self) -> Option<DecisionRecord> {
        let decision = self.decision.as_deref()?.trim().to_ascii_uppercase();
        if decision.is_empty() {
            return None;
        }
        Some(DecisionRecord {
            actor_id: normalize_id(self.actor_id.as_deref()),
            actor_role: self.actor_role.clone(),
            decision,
            notes: self.notes.clone(),
            decided_at_ms: self.decided_at_ms,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseResolution {
    pub outcome: Option<String>,
    pub notes: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModerationCase {
    pub case_id: String,
    pub case_type: CaseType,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub status: String,
    pub severity: String,
    pub reason: Option<String>,
    pub reported_by: Option<String>,
    pub reported_at_ms: i64,
    pub audit_trail_id: Option<String>,
    pub requires_dual_approval: bool,
    pub approvals: Vec<DecisionRecord>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub source: Map<String, Value>,
    pub created_at_ms: i64,
    pub last_updated_at_ms: i64,
    pub resolution: Option<CaseResolution>,
}

#[derive(Clone, Debug, Default)]
pub struct CaseInput {
    pub case_id: Option<String>,
    pub case_type: Option<String>,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub status: Option<String>,
    pub severity: Option<String>,
    pub reason: Option<String>,
    pub reported_by: Option<String>,
    pub reported_at_ms: Option<i64>,
    pub audit_trail_id: Option<String>,
    pub requires_dual_approval: bool,
    pub approvals: Vec<DecisionInput>,
    pub metadata: Map<String, Value>,
    pub source: Map<String, Value>,
    pub created_at_ms: Option<i64>,
    pub last_updated_at_ms: Option<i64>,
    pub resolution: Option<CaseResolution>,
}

impl CaseInput {
    fn normalize(&self, now_ms: i64) -> Option<ModerationCase> {
        let case_id = normalize_id(self.case_id.as_deref())?;
        let created_at_ms = self.created_at_ms.or(self.reported_at_ms).unwrap_or(now_ms);
        let reported_at_ms = self.reported_at_ms.unwrap_or(created_at_ms);
        Some(ModerationCase {
            case_id,
            case_type: CaseType::parse(self.case_type.as_deref(), CaseType::Message),
            thread_id: normalize_id(self.thread_id.as_deref()),
            message_id: normalize_id(self.message_id.as_deref()),
            status: normalize_token(self.status.as_deref(), DEFAULT_STATUS),
            severity: normalize_token(self.severity.as_deref(), DEFAULT_SEVERITY),
            reason: self.reason.clone(),
            reported_by: self.reported_by.clone(),
            reported_at_ms,
            audit_trail_id: self.audit_trail_id.clone(),
            requires_dual_approval: self.requires_dual_approval,
            approvals: self
                .approvals
                .iter()
                .filter_map(DecisionInput::normalize)
                .collect(),
            metadata: self.metadata.clone(),
            source: self.source.clone(),
            created_at_ms,
            last_updated_at_ms: self.last_updated_at_ms.unwrap_or(reported_at_ms),
            resolution: self.resolution.clone(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct CasePatch {
    pub case_type: Option<String>,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub status: Option<String>,
    pub severity: Option<String>,
    pub reason: Option<String>,
    pub reported_by: Option<String>,
    pub reported_at_ms: Option<i64>,
    pub audit_trail_id: Option<String>,
    pub requires_dual_approval: Option<bool>,
    pub approvals: Option<Vec<DecisionInput>>,
    pub metadata: Option<Map<String, Value>>,
    pub source: Option<Map<String, Value>>,
    pub last_updated_at_ms: Option<i64>,
    pub resolution: Option<CaseResolution>,
}

#[derive(Clone, Debug, Default)]
pub struct ResolutionInput {
    pub outcome: Option<String>,
    pub notes: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub dual_approval: usize,
    pub awaiting_second: usize,
    pub resolved: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CaseFilter {
    pub status: Option<Vec<String>>,
    pub severity: Option<Vec<String>>,
    pub case_type: Option<Vec<String>>,
    pub requires_dual_approval: Option<bool>,
    pub thread_id: Option<String>,
}

fn filter_set(values: &Option<Vec<String>>) -> Option<HashSet<String>> {
    let values = values.as_ref()?;
    let set: HashSet<String> = values
        .iter()
        .filter_map(|value| {
            let upper = value.trim().to_ascii_uppercase();
            if upper.is_empty() {
                None
            } else {
                Some(upper)
            }
        })
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn map_decision_outcome(decision: &str) -> String {
    match decision.trim().to_ascii_uppercase().as_str() {
        "APPROVE" | "APPROVED" => "APPROVED".to_string(),
        "REJECT" | "REJECTED" | "DENY" | "DENIED" => "REJECTED".to_string(),
        "ESCALATE" | "ESCALATED" => "ESCALATED".to_string(),
        "OVERRIDE" | "OVERRIDDEN" => "OVERRIDDEN".to_string(),
        other => other.to_string(),
    }
}

fn is_terminal_outcome(outcome: &str) -> bool {
    matches!(outcome, "REJECTED" | "ESCALATED" | "OVERRIDDEN" | "BLOCKED")
}

fn count_distinct_actors(approvals: &[DecisionRecord]) -> usize {
    let mut seen = HashSet::new();
    for record in approvals {
        if let Some(actor_id) = &record.actor_id {
            seen.insert(actor_id.clone());
        } else if let Some(decided_at) = record.decided_at_ms {
            seen.insert(format!("{}:{decided_at}", record.decision));
        } else {
            seen.insert(format!("{}:{:?}", record.decision, record.notes));
        }
    }
    seen.len()
}

/// Case queue ordered most-recently-touched-first; resolved cases sink to
/// the back. Stats are recomputed from scratch on every mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct ModerationQueue {
    cases_by_id: HashMap<String, ModerationCase>,
    order: Vec<String>,
    stats: QueueStats,
    last_updated_at_ms: i64,
}

impl ModerationQueue {
    pub fn new(cases: Vec<CaseInput>, now_ms: i64) -> Self {
        let mut cases_by_id = HashMap::new();
        let mut order = Vec::new();
        for input in &cases {
            if let Some(case) = input.normalize(now_ms) {
                if !cases_by_id.contains_key(&case.case_id) {
                    order.push(case.case_id.clone());
                }
                cases_by_id.insert(case.case_id.clone(), case);
            }
        }
        let mut queue = Self {
            cases_by_id,
            order,
            stats: QueueStats::default(),
            last_updated_at_ms: now_ms,
        };
        queue.refresh_stats(now_ms);
        queue
    }

    fn refresh_stats(&mut self, now_ms: i64) {
        let mut stats = QueueStats::default();
        for case in self.cases_by_id.values() {
            if case.status == CASE_STATUS_RESOLVED {
                stats.resolved += 1;
                continue;
            }
            stats.pending += 1;
            if case.requires_dual_approval {
                stats.dual_approval += 1;
            }
            if case.status == CASE_STATUS_AWAITING_SECOND_APPROVAL {
                stats.awaiting_second += 1;
            }
        }
        self.stats = stats;
        self.last_updated_at_ms = now_ms;
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn get(&self, case_id: &str) -> Option<&ModerationCase> {
        self.cases_by_id.get(case_id)
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    fn move_to_front(&mut self, case_id: &str) {
        self.order.retain(|id| id != case_id);
        self.order.insert(0, case_id.to_string());
    }

    fn move_to_back(&mut self, case_id: &str) {
        self.order.retain(|id| id != case_id);
        self.order.push(case_id.to_string());
    }

    pub fn enqueue_case(&self, input: CaseInput, now_ms: i64) -> Option<Self> {
        let case = input.normalize(now_ms)?;
        let mut next = self.clone();
        let case_id = case.case_id.clone();
        next.cases_by_id.insert(case_id.clone(), case);
        next.move_to_front(&case_id);
        next.refresh_stats(now_ms);
        Some(next)
    }

    pub fn update_case(&self, case_id: &str, patch: CasePatch, now_ms: i64) -> Option<Self> {
        let current = self.cases_by_id.get(case_id)?;
        let mut updated = current.clone();
        if patch.case_type.is_some() {
            updated.case_type = CaseType::parse(patch.case_type.as_deref(), current.case_type);
        }
        if let Some(thread_id) = &patch.thread_id {
            updated.thread_id = normalize_id(Some(thread_id));
        }
        if let Some(message_id) = &patch.message_id {
            updated.message_id = normalize_id(Some(message_id));
        }
        if patch.status.is_some() {
            updated.status = normalize_token(patch.status.as_deref(), &current.status);
        }
        if patch.severity.is_some() {
            updated.severity = normalize_token(patch.severity.as_deref(), &current.severity);
        }
        if patch.reason.is_some() {
            updated.reason = patch.reason;
        }
        if patch.reported_by.is_some() {
            updated.reported_by = patch.reported_by;
        }
        if let Some(reported_at_ms) = patch.reported_at_ms {
            updated.reported_at_ms = reported_at_ms;
        }
        if patch.audit_trail_id.is_some() {
            updated.audit_trail_id = patch.audit_trail_id;
        }
        if let Some(requires_dual_approval) = patch.requires_dual_approval {
            updated.requires_dual_approval = requires_dual_approval;
        }
        if let Some(approvals) = &patch.approvals {
            updated.approvals = approvals
                .iter()
                .filter_map(DecisionInput::normalize)
                .collect();
        }
        if let Some(metadata) = patch.metadata {
            updated.metadata = metadata;
        }
        if let Some(source) = patch.source {
            updated.source = source;
        }
        if let Some(resolution) = patch.resolution {
            updated.resolution = Some(resolution);
        }
        updated.last_updated_at_ms = patch.last_updated_at_ms.unwrap_or(now_ms);

        let mut next = self.clone();
        next.cases_by_id.insert(case_id.to_string(), updated);
        next.move_to_front(case_id);
        next.refresh_stats(now_ms);
        Some(next)
    }

    pub fn submit_decision(
        &self,
        case_id: &str,
        decision: DecisionInput,
        required_approvals: Option<u32>,
        now_ms: i64,
    ) -> Option<Self> {
        let current = self.cases_by_id.get(case_id)?;
        let record = decision.normalize()?;
        let decided_at_ms = record.decided_at_ms.unwrap_or(now_ms);
        let record = DecisionRecord {
            decided_at_ms: Some(decided_at_ms),
            ..record
        };

        let mut next = self.clone();
        let mut entry = current.clone();
        // a repeat decision from the same actor replaces their earlier one
        let existing = entry.approvals.iter().position(|candidate| {
            candidate.actor_id.is_some() && candidate.actor_id == record.actor_id
        });
        match existing {
            Some(index) => entry.approvals[index] = record.clone(),
            None => entry.approvals.push(record.clone()),
        }
        entry.last_updated_at_ms = decided_at_ms;

        let outcome = map_decision_outcome(&record.decision);
        let required =
            required_approvals.filter(|value| *value > 0).unwrap_or(DEFAULT_REQUIRED_APPROVALS);
        let distinct = count_distinct_actors(&entry.approvals);

        let mut finalize = |entry: &mut ModerationCase, final_outcome: String| {
            entry.status = CASE_STATUS_RESOLVED.to_string();
            entry.requires_dual_approval = false;
            entry.resolution = Some(CaseResolution {
                outcome: Some(final_outcome),
                notes: record.notes.clone(),
                resolved_by: record.actor_id.clone(),
                resolved_at_ms: Some(decided_at_ms),
            });
        };

        let mut resolved = false;
        if is_terminal_outcome(&outcome) {
            finalize(&mut entry, outcome);
            resolved = true;
        } else if entry.requires_dual_approval {
            if distinct >= required as usize {
                finalize(&mut entry, "APPROVED".to_string());
                resolved = true;
            } else {
                entry.status = CASE_STATUS_AWAITING_SECOND_APPROVAL.to_string();
                entry.resolution = None;
            }
        } else {
            finalize(&mut entry, "APPROVED".to_string());
            resolved = true;
        }

        next.cases_by_id.insert(case_id.to_string(), entry);
        if resolved {
            next.move_to_back(case_id);
        } else {
            next.move_to_front(case_id);
        }
        next.refresh_stats(now_ms);
        Some(next)
    }

    pub fn resolve_case(
        &self,
        case_id: &str,
        resolution: ResolutionInput,
        now_ms: i64,
    ) -> Option<Self> {
        let current = self.cases_by_id.get(case_id)?;
        let resolved_at_ms = resolution.resolved_at_ms.unwrap_or(now_ms);
        let mut entry = current.clone();
        entry.status = CASE_STATUS_RESOLVED.to_string();
        entry.requires_dual_approval = false;
        entry.last_updated_at_ms = resolved_at_ms;
        entry.resolution = Some(CaseResolution {
            outcome: Some(normalize_token(
                resolution.outcome.as_deref(),
                CASE_STATUS_RESOLVED,
            )),
            notes: resolution.notes,
            resolved_by: resolution.resolved_by,
            resolved_at_ms: Some(resolved_at_ms),
        });
        let mut next = self.clone();
        next.cases_by_id.insert(case_id.to_string(), entry);
        next.move_to_back(case_id);
        next.refresh_stats(now_ms);
        Some(next)
    }

    pub fn remove_case(&self, case_id: &str, now_ms: i64) -> Option<Self> {
        if !self.cases_by_id.contains_key(case_id) {
            return None;
        }
        let mut next = self.clone();
        next.cases_by_id.remove(case_id);
        next.order.retain(|id| id != case_id);
        next.refresh_stats(now_ms);
        Some(next)
    }

    pub fn select(&self, filter: &CaseFilter) -> Vec<ModerationCase> {
        let status_set = filter_set(&filter.status);
        let severity_set = filter_set(&filter.severity);
        let type_set = filter_set(&filter.case_type);
        let thread_id = normalize_id(filter.thread_id.as_deref());

        self.order
            .iter()
            .filter_map(|case_id| self.cases_by_id.get(case_id))
            .filter(|case| {
                if let Some(set) = &status_set {
                    if !set.contains(&case.status) {
                        return false;
                    }
                }
                if let Some(set) = &severity_set {
                    if !set.contains(&case.severity) {
                        return false;
                    }
                }
                if let Some(set) = &type_set {
                    let type_token = match case.case_type {
                        CaseType::Message => "MESSAGE",
                        CaseType::Thread => "THREAD",
                    };
                    if !set.contains(type_token) {
                        return false;
                    }
                }
                if let Some(requires) = filter.requires_dual_approval {
                    if case.requires_dual_approval != requires {
                        return false;
                    }
                }
                if let Some(thread_id) = &thread_id {
                    if case.thread_id.as_ref() != Some(thread_id) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    pub fn pending_cases(&self) -> Vec<ModerationCase> {
        self.select(&CaseFilter {
            status: Some(vec![CASE_STATUS_PENDING.to_string()]),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(case_id: &str, dual: bool) -> CaseInput {
        CaseInput {
            case_id: Some(case_id.to_string()),
            case_type: Some("THREAD".to_string()),
            thread_id: Some("thr-1".to_string()),
            severity: Some("high".to_string()),
            reported_at_ms: Some(1_000),
            requires_dual_approval: dual,
            ..Default::default()
        }
    }

    fn approval(actor: &str) -> DecisionInput {
        DecisionInput {
            actor_id: Some(actor.to_string()),
            decision: Some("approve".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn dual_approval_requires_two_distinct_actors() {
        let queue = ModerationQueue::new(vec![case("case-1", true)], 0);
        let queue = queue
            .submit_decision("case-1", approval("mod-a"), None, 2_000)
            .expect("first approval");
        assert_eq!(
            queue.get("case-1").map(|entry| entry.status.as_str()),
            Some(CASE_STATUS_AWAITING_SECOND_APPROVAL)
        );

        // the same actor approving again must not resolve the case
        let queue = queue
            .submit_decision("case-1", approval("mod-a"), None, 3_000)
            .expect("repeat approval");
        let entry = queue.get("case-1").expect("case");
        assert_eq!(entry.status, CASE_STATUS_AWAITING_SECOND_APPROVAL);
        assert_eq!(entry.approvals.len(), 1);

        let queue = queue
            .submit_decision("case-1", approval("mod-b"), None, 4_000)
            .expect("second approval");
        let entry = queue.get("case-1").expect("case");
        assert_eq!(entry.status, CASE_STATUS_RESOLVED);
        assert_eq!(
            entry.resolution.as_ref().and_then(|r| r.outcome.as_deref()),
            Some("APPROVED")
        );
    }

    #[test]
    fn terminal_decision_short_circuits_dual_approval() {
        let queue = ModerationQueue::new(vec![case("case-1", true)], 0);
        let queue = queue
            .submit_decision(
                "case-1",
                DecisionInput {
                    actor_id: Some("mod-a".to_string()),
                    decision: Some("deny".to_string()),
                    ..Default::default()
                },
                None,
                2_000,
            )
            .expect("decision");
        let entry = queue.get("case-1").expect("case");
        assert_eq!(entry.status, CASE_STATUS_RESOLVED);
        assert_eq!(
            entry.resolution.as_ref().and_then(|r| r.outcome.as_deref()),
            Some("REJECTED")
        );
    }

    #[test]
    fn single_approval_resolves_non_dual_cases() {
        let queue = ModerationQueue::new(vec![case("case-1", false)], 0);
        let queue = queue
            .submit_decision("case-1", approval("mod-a"), None, 2_000)
            .expect("decision");
        assert_eq!(
            queue.get("case-1").map(|entry| entry.status.as_str()),
            Some(CASE_STATUS_RESOLVED)
        );
    }

    #[test]
    fn resolve_moves_case_to_the_back_and_updates_stats() {
        let queue = ModerationQueue::new(vec![case("case-1", false), case("case-2", false)], 0);
        let queue = queue
            .resolve_case("case-1", ResolutionInput::default(), 5_000)
            .expect("resolve");
        assert_eq!(queue.order(), ["case-2", "case-1"]);
        let stats = queue.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.resolved, 1);
    }

    #[test]
    fn enqueue_and_update_move_cases_to_the_front() {
        let queue = ModerationQueue::new(vec![case("case-1", false)], 0);
        let queue = queue.enqueue_case(case("case-2", false), 1_000).expect("enqueue");
        assert_eq!(queue.order(), ["case-2", "case-1"]);
        let queue = queue
            .update_case(
                "case-1",
                CasePatch {
                    severity: Some("critical".to_string()),
                    ..Default::default()
                },
                2_000,
            )
            .expect("update");
        assert_eq!(queue.order(), ["case-1", "case-2"]);
        assert_eq!(
            queue.get("case-1").map(|entry| entry.severity.as_str()),
            Some("CRITICAL")
        );
    }

    #[test]
    fn stats_track_dual_and_awaiting_counts() {
        let queue = ModerationQueue::new(vec![case("case-1", true), case("case-2", false)], 0);
        let queue = queue
            .submit_decision("case-1", approval("mod-a"), None, 1_000)
            .expect("decision");
        let stats = queue.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dual_approval, 1);
        assert_eq!(stats.awaiting_second, 1);
        assert_eq!(stats.resolved, 0);
    }

    #[test]
    fn select_filters_by_status_severity_and_thread() {
        let queue = ModerationQueue::new(
            vec![
                case("case-1", false),
                CaseInput {
                    thread_id: Some("thr-2".to_string()),
                    severity: Some("low".to_string()),
                    ..case("case-2", false)
                },
            ],
            0,
        );
        let by_severity = queue.select(&CaseFilter {
            severity: Some(vec!["HIGH".to_string()]),
            ..Default::default()
        });
        assert_eq!(by_severity.len(), 1);
        assert_eq!(by_severity[0].case_id, "case-1");

        let by_thread = queue.select(&CaseFilter {
            thread_id: Some("thr-2".to_string()),
            ..Default::default()
        });
        assert_eq!(by_thread.len(), 1);
        assert_eq!(by_thread[0].case_id, "case-2");
    }

    #[test]
    fn unknown_case_ids_are_noops() {
        let queue = ModerationQueue::new(vec![], 0);
        assert!(queue.submit_decision("nope", approval("mod-a"), None, 0).is_none());
        assert!(queue.remove_case("nope", 0).is_none());
        assert!(queue
            .update_case("nope", CasePatch::default(), 0)
            .is_none());
    }
}
