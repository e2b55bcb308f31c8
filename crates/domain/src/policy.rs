use regex::Regex;
use serde::Serialize;

const DEFAULT_SOFT_ESCALATION_LIMIT: usize = 2;
const DEFAULT_SOFT_ESCALATION_WINDOW_MS: i64 = 6 * 60 * 60 * 1000;

fn default_hard_patterns() -> Vec<Regex> {
    [
        r"(?i)\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b",
        r"(?i)\b[A-Z0-9._%+-]+@(?:gmail|yahoo|outlook|icloud|protonmail)\.com\b",
        r"(?i)\b(?:cashapp|venmo|paypal|zelle)\b",
        r"(?i)\b(?:onlyfans|fansly)\.com\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
}

fn default_soft_patterns() -> Vec<Regex> {
    [
        r"(?i)\btext me\b",
        r"(?i)\bcall me\b",
        r"(?i)\boff-platform\b",
        r"(?i)\bwire transfer\b",
        r"(?i)\bdirect payment\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
}

#[derive(Clone, Debug)]
pub struct PolicyOptions {
    pub hard_patterns: Vec<Regex>,
    pub soft_patterns: Vec<Regex>,
    pub soft_escalation_limit: usize,
    pub soft_escalation_window_ms: i64,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            hard_patterns: default_hard_patterns(),
            soft_patterns: default_soft_patterns(),
            soft_escalation_limit: DEFAULT_SOFT_ESCALATION_LIMIT,
            soft_escalation_window_ms: DEFAULT_SOFT_ESCALATION_WINDOW_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyStatus {
    Allow,
    Nudge,
    Block,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchSeverity {
    Hard,
    Soft,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMatch {
    pub pattern: String,
    pub matched: String,
    pub severity: MatchSeverity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Violation {
    timestamp_ms: i64,
    severity: MatchSeverity,
}

/// Sliding window of recent violations; repeated soft matches escalate
/// to a block inside the window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyState {
    violations: Vec<Violation>,
}

#[derive(Clone, Debug)]
pub struct PolicyVerdict {
    pub status: PolicyStatus,
    pub matches: Vec<PolicyMatch>,
    pub state: PolicyState,
}

fn test_patterns(text: &str, patterns: &[Regex], severity: MatchSeverity) -> Vec<PolicyMatch> {
    patterns
        .iter()
        .filter_map(|pattern| {
            pattern.find(text).map(|found| PolicyMatch {
                pattern: pattern.as_str().to_string(),
                matched: found.as_str().to_string(),
                severity,
            })
        })
        .collect()
}

fn pruned(violations: &[Violation], now_ms: i64, window_ms: i64) -> Vec<Violation> {
    let cutoff = now_ms - window_ms;
    violations
        .iter()
        .copied()
        .filter(|violation| violation.timestamp_ms >= cutoff)
        .collect()
}

pub fn evaluate_text(
    state: &PolicyState,
    text: &str,
    now_ms: i64,
    options: &PolicyOptions,
) -> PolicyVerdict {
    let normalized = text.trim();
    let mut violations = pruned(
        &state.violations,
        now_ms,
        options.soft_escalation_window_ms,
    );
    if normalized.is_empty() {
        return PolicyVerdict {
            status: PolicyStatus::Allow,
            matches: Vec::new(),
            state: PolicyState { violations },
        };
    }

    let hard_matches = test_patterns(normalized, &options.hard_patterns, MatchSeverity::Hard);
    if !hard_matches.is_empty() {
        violations.push(Violation {
            timestamp_ms: now_ms,
            severity: MatchSeverity::Hard,
        });
        return PolicyVerdict {
            status: PolicyStatus::Block,
            matches: hard_matches,
            state: PolicyState { violations },
        };
    }

    let soft_matches = test_patterns(normalized, &options.soft_patterns, MatchSeverity::Soft);
    if !soft_matches.is_empty() {
        let soft_count = violations
            .iter()
            .filter(|violation| violation.severity == MatchSeverity::Soft)
            .count()
            + 1;
        violations.push(Violation {
            timestamp_ms: now_ms,
            severity: MatchSeverity::Soft,
        });
        let status = if soft_count >= options.soft_escalation_limit {
            PolicyStatus::Block
        } else {
            PolicyStatus::Nudge
        };
        return PolicyVerdict {
            status,
            matches: soft_matches,
            state: PolicyState { violations },
        };
    }

    PolicyVerdict {
        status: PolicyStatus::Allow,
        matches: Vec::new(),
        state: PolicyState { violations },
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAuditEvent {
    pub status: PolicyStatus,
    pub matches: Vec<PolicyMatch>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    pub occurred_at_ms: i64,
}

pub fn evaluate_with_audit(
    state: &PolicyState,
    text: &str,
    now_ms: i64,
    options: &PolicyOptions,
    thread_id: Option<&str>,
    user_id: Option<&str>,
) -> (PolicyVerdict, Option<PolicyAuditEvent>) {
    let verdict = evaluate_text(state, text, now_ms, options);
    let audit = if verdict.status == PolicyStatus::Allow {
        None
    } else {
        Some(PolicyAuditEvent {
            status: verdict.status,
            matches: verdict.matches.clone(),
            thread_id: thread_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
            occurred_at_ms: now_ms,
        })
    };
    (verdict, audit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_pattern_blocks_immediately() {
        let options = PolicyOptions::default();
        let verdict = evaluate_text(&PolicyState::default(), "pay me on venmo", 0, &options);
        assert_eq!(verdict.status, PolicyStatus::Block);
        assert_eq!(verdict.matches.len(), 1);
        assert_eq!(verdict.matches[0].severity, MatchSeverity::Hard);
    }

    #[test]
    fn phone_numbers_are_a_hard_match() {
        let options = PolicyOptions::default();
        let verdict = evaluate_text(&PolicyState::default(), "reach me at 555-123-4567", 0, &options);
        assert_eq!(verdict.status, PolicyStatus::Block);
    }

    #[test]
    fn soft_pattern_nudges_then_escalates_within_the_window() {
        let options = PolicyOptions::default();
        let first = evaluate_text(&PolicyState::default(), "text me later", 0, &options);
        assert_eq!(first.status, PolicyStatus::Nudge);
        let second = evaluate_text(&first.state, "just call me", 1_000, &options);
        assert_eq!(second.status, PolicyStatus::Block);
    }

    #[test]
    fn soft_violations_expire_after_the_window() {
        let options = PolicyOptions::default();
        let first = evaluate_text(&PolicyState::default(), "text me later", 0, &options);
        let much_later = options.soft_escalation_window_ms + 1_000;
        let second = evaluate_text(&first.state, "just call me", much_later, &options);
        assert_eq!(second.status, PolicyStatus::Nudge);
    }

    #[test]
    fn clean_text_is_allowed_and_prunes_stale_state() {
        let options = PolicyOptions::default();
        let first = evaluate_text(&PolicyState::default(), "text me later", 0, &options);
        let verdict = evaluate_text(
            &first.state,
            "the proofs look great",
            options.soft_escalation_window_ms + 1,
            &options,
        );
        assert_eq!(verdict.status, PolicyStatus::Allow);
        assert!(verdict.state.violations.is_empty());
    }

    #[test]
    fn audit_event_is_emitted_only_for_violations() {
        let options = PolicyOptions::default();
        let (_, audit) = evaluate_with_audit(
            &PolicyState::default(),
            "hello there",
            0,
            &options,
            Some("thr-1"),
            Some("user-1"),
        );
        assert!(audit.is_none());
        let (_, audit) = evaluate_with_audit(
            &PolicyState::default(),
            "pay me on venmo",
            0,
            &options,
            Some("thr-1"),
            Some("user-1"),
        );
        let audit = audit.expect("audit event");
        assert_eq!(audit.thread_id.as_deref(), Some("thr-1"));
    }
}
