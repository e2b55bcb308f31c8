use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_DEDUPE_WINDOW_MS: i64 = 2 * 60 * 1000;
pub const DEFAULT_DIGEST_WINDOW_MS: i64 = 10 * 60 * 1000;
pub const DEFAULT_MAX_ITEMS: usize = 200;
const MINUTES_PER_DAY: i64 = 1440;
const DIGEST_SAMPLE_LIMIT: usize = 3;

#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Severity {
    /// Unknown severities collapse to NORMAL rather than being rejected.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_uppercase()) {
            Some(ref upper) if upper == "LOW" => Self::Low,
            Some(ref upper) if upper == "NORMAL" => Self::Normal,
            Some(ref upper) if upper == "HIGH" => Self::High,
            Some(ref upper) if upper == "CRITICAL" => Self::Critical,
            _ => Self::Normal,
        }
    }
}

/// Minute-of-day interval that may wrap past midnight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuietHours {
    pub start_minutes: Option<u16>,
    pub end_minutes: Option<u16>,
    pub timezone_offset_minutes: i32,
    pub bypass_severities: BTreeSet<Severity>,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            start_minutes: None,
            end_minutes: None,
            timezone_offset_minutes: 0,
            bypass_severities: BTreeSet::from([Severity::Critical]),
        }
    }
}

/// Parses "HH:MM" into minutes of day.
pub fn parse_time_of_day(value: &str) -> Option<u16> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours >= 24 || minutes >= 60 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn minutes_of_day(now_ms: i64, offset_minutes: i32) -> i64 {
    let utc_minutes = now_ms.div_euclid(60_000);
    (utc_minutes + offset_minutes as i64).rem_euclid(MINUTES_PER_DAY)
}

fn within_interval(minutes: i64, start: u16, end: u16) -> bool {
    let start = start as i64;
    let end = end as i64;
    if start == end {
        return true;
    }
    if start < end {
        minutes >= start && minutes < end
    } else {
        minutes >= start || minutes < end
    }
}

#[derive(Clone, Debug, Default)]
pub struct QuietHoursConfig {
    pub start: Option<String>,
    pub end: Option<String>,
    pub timezone_offset_minutes: i32,
    pub bypass_severities: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default)]
pub struct NotificationQueueConfig {
    pub quiet_hours: QuietHoursConfig,
    pub dedupe_window_ms: Option<i64>,
    pub digest_window_ms: Option<i64>,
    pub max_items: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: String,
    pub key: String,
    pub thread_id: Option<String>,
    pub kind: String,
    pub severity: Severity,
    pub message: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub count: u64,
    pub deferred: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub digest_notified_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct NotificationInput {
    pub id: Option<String>,
    pub dedupe_key: Option<String>,
    pub thread_id: Option<String>,
    pub kind: Option<String>,
    pub severity: Option<String>,
    pub message: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub count: Option<u64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DigestSummary {
    pub thread_id: Option<String>,
    pub count: u64,
    pub highest_severity: Severity,
    pub first_at_ms: i64,
    pub last_at_ms: i64,
    pub sample_messages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
struct DedupeRecord {
    item_id: String,
    last_seen_ms: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NotificationQueue {
    items_by_id: HashMap<String, NotificationItem>,
    order: Vec<String>,
    dedupe: HashMap<String, DedupeRecord>,
    quiet_hours: QuietHours,
    dedupe_window_ms: i64,
    digest_window_ms: i64,
    max_items: usize,
    last_updated_at_ms: i64,
}

impl NotificationQueue {
    pub fn new(config: NotificationQueueConfig, now_ms: i64) -> Self {
        let bypass = match config.quiet_hours.bypass_severities {
            Some(values) => values
                .iter()
                .map(|value| Severity::parse(Some(value)))
                .collect(),
            None => BTreeSet::from([Severity::Critical]),
        };
        Self {
            items_by_id: HashMap::new(),
            order: Vec::new(),
            dedupe: HashMap::new(),
            quiet_hours: QuietHours {
                start_minutes: config
                    .quiet_hours
                    .start
                    .as_deref()
                    .and_then(parse_time_of_day),
                end_minutes: config.quiet_hours.end.as_deref().and_then(parse_time_of_day),
                timezone_offset_minutes: config.quiet_hours.timezone_offset_minutes,
                bypass_severities: bypass,
            },
            dedupe_window_ms: config.dedupe_window_ms.unwrap_or(DEFAULT_DEDUPE_WINDOW_MS),
            digest_window_ms: config.digest_window_ms.unwrap_or(DEFAULT_DIGEST_WINDOW_MS),
            max_items: config.max_items.unwrap_or(DEFAULT_MAX_ITEMS),
            last_updated_at_ms: now_ms,
        }
    }

    pub fn is_within_quiet_hours(&self, now_ms: i64) -> bool {
        let (Some(start), Some(end)) = (
            self.quiet_hours.start_minutes,
            self.quiet_hours.end_minutes,
        ) else {
            return false;
        };
        let minutes = minutes_of_day(now_ms, self.quiet_hours.timezone_offset_minutes);
        within_interval(minutes, start, end)
    }

    fn should_defer(&self, severity: Severity, now_ms: i64) -> bool {
        self.is_within_quiet_hours(now_ms) && !self.quiet_hours.bypass_severities.contains(&severity)
    }

    pub fn enqueue(&self, notification: NotificationInput, now_ms: i64) -> Self {
        let severity = Severity::parse(notification.severity.as_deref());
        let kind = notification.kind.clone().unwrap_or_else(|| "generic".to_string());
        let key = notification.dedupe_key.clone().unwrap_or_else(|| {
            format!(
                "{}:{kind}",
                notification.thread_id.as_deref().unwrap_or("global")
            )
        });

        let mut next = self.clone();
        next.last_updated_at_ms = now_ms;

        let merged = next
            .dedupe
            .get(&key)
            .filter(|record| now_ms - record.last_seen_ms <= next.dedupe_window_ms)
            .map(|record| record.item_id.clone());
        if let Some(item_id) = merged {
            if let Some(item) = next.items_by_id.get_mut(&item_id) {
                item.count += notification.count.unwrap_or(1);
                item.updated_at_ms = now_ms;
                if severity > item.severity {
                    item.severity = severity;
                }
                if notification.message.is_some() {
                    item.message = notification.message;
                }
                if let Some(data) = notification.data {
                    for (field, value) in data {
                        item.data.insert(field, value);
                    }
                }
                let effective = item.severity;
                let keep_deferred = item.deferred;
                item.deferred = keep_deferred && self.should_defer(effective, now_ms);
                if let Some(record) = next.dedupe.get_mut(&key) {
                    record.last_seen_ms = now_ms;
                }
                return next;
            }
        }

        let deferred = next.should_defer(severity, now_ms);
        let item = NotificationItem {
            id: notification
                .id
                .unwrap_or_else(|| format!("{key}:{now_ms}")),
            key: key.clone(),
            thread_id: notification.thread_id,
            kind,
            severity,
            message: notification.message,
            data: notification.data.unwrap_or_default(),
            count: notification.count.unwrap_or(1),
            deferred,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            digest_notified_at_ms: None,
        };
        next.dedupe.insert(
            key,
            DedupeRecord {
                item_id: item.id.clone(),
                last_seen_ms: now_ms,
            },
        );
        next.order.push(item.id.clone());
        next.items_by_id.insert(item.id.clone(), item);
        next.ensure_capacity();
        next
    }

    fn ensure_capacity(&mut self) {
        while self.order.len() > self.max_items {
            let dropped_id = self.order.remove(0);
            if let Some(dropped) = self.items_by_id.remove(&dropped_id) {
                self.dedupe.remove(&dropped.key);
            }
        }
    }

    /// Un-defers items whose deferral no longer matches the current
    /// quiet-hours state, then drains everything ready for display.
    pub fn flush(&self, now_ms: i64) -> (Self, Vec<NotificationItem>) {
        let mut next = self.clone();
        let currently_quiet = next.is_within_quiet_hours(now_ms);
        let order = std::mem::take(&mut next.order);
        let mut remaining = Vec::with_capacity(order.len());
        let mut ready = Vec::new();
        for id in order {
            let Some(mut item) = next.items_by_id.remove(&id) else {
                continue;
            };
            if item.deferred && !currently_quiet {
                item.deferred = false;
            }
            if item.deferred {
                next.items_by_id.insert(id.clone(), item);
                remaining.push(id);
            } else {
                next.dedupe.remove(&item.key);
                ready.push(item);
            }
        }
        next.order = remaining;
        next.last_updated_at_ms = now_ms;
        (next, ready)
    }

    /// Summarizes deferred items older than the digest window, grouped by
    /// thread. Items re-summarized within half the window are skipped.
    pub fn collect_digest(&self, now_ms: i64) -> (Self, Vec<DigestSummary>) {
        let mut next = self.clone();
        let mut groups: BTreeMap<String, DigestSummary> = BTreeMap::new();
        for id in next.order.clone() {
            let Some(item) = next.items_by_id.get_mut(&id) else {
                continue;
            };
            if !item.deferred {
                continue;
            }
            if now_ms - item.created_at_ms < next.digest_window_ms {
                continue;
            }
            if let Some(notified_at) = item.digest_notified_at_ms {
                if notified_at >= item.created_at_ms
                    && now_ms - notified_at < next.digest_window_ms / 2
                {
                    continue;
                }
            }
            let group_key = item
                .thread_id
                .clone()
                .unwrap_or_else(|| "global".to_string());
            let entry = groups.entry(group_key).or_insert_with(|| DigestSummary {
                thread_id: item.thread_id.clone(),
                count: 0,
                highest_severity: item.severity,
                first_at_ms: item.created_at_ms,
                last_at_ms: item.updated_at_ms,
                sample_messages: Vec::new(),
            });
            entry.count += item.count;
            entry.first_at_ms = entry.first_at_ms.min(item.created_at_ms);
            entry.last_at_ms = entry.last_at_ms.max(item.updated_at_ms);
            entry.highest_severity = entry.highest_severity.max(item.severity);
            if let Some(message) = &item.message {
                if entry.sample_messages.len() < DIGEST_SAMPLE_LIMIT
                    && !entry.sample_messages.contains(message)
                {
                    entry.sample_messages.push(message.clone());
                }
            }
            item.digest_notified_at_ms = Some(now_ms);
        }
        next.last_updated_at_ms = now_ms;
        (next, groups.into_values().collect())
    }

    pub fn pending(&self) -> Vec<&NotificationItem> {
        self.order
            .iter()
            .filter_map(|id| self.items_by_id.get(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_queue(start: &str, end: &str) -> NotificationQueue {
        NotificationQueue::new(
            NotificationQueueConfig {
                quiet_hours: QuietHoursConfig {
                    start: Some(start.to_string()),
                    end: Some(end.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            0,
        )
    }

    fn at_minutes(minutes: i64) -> i64 {
        minutes * 60_000
    }

    fn input(thread_id: &str, kind: &str) -> NotificationInput {
        NotificationInput {
            thread_id: Some(thread_id.to_string()),
            kind: Some(kind.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn quiet_hours_wrap_past_midnight() {
        let queue = quiet_queue("22:00", "06:00");
        assert!(queue.is_within_quiet_hours(at_minutes(23 * 60 + 15)));
        assert!(!queue.is_within_quiet_hours(at_minutes(8 * 60)));
        assert!(queue.is_within_quiet_hours(at_minutes(2 * 60)));
    }

    #[test]
    fn timezone_offset_shifts_the_interval() {
        let queue = NotificationQueue::new(
            NotificationQueueConfig {
                quiet_hours: QuietHoursConfig {
                    start: Some("22:00".to_string()),
                    end: Some("06:00".to_string()),
                    timezone_offset_minutes: -120,
                    ..Default::default()
                },
                ..Default::default()
            },
            0,
        );
        // 23:15 UTC is 21:15 local with a -120 offset
        assert!(!queue.is_within_quiet_hours(at_minutes(23 * 60 + 15)));
    }

    #[test]
    fn duplicate_within_window_merges_into_one_item() {
        let queue = NotificationQueue::new(NotificationQueueConfig::default(), 0);
        let queue = queue.enqueue(input("thr-1", "message"), 1_000);
        let queue = queue.enqueue(
            NotificationInput {
                severity: Some("HIGH".to_string()),
                message: Some("second".to_string()),
                ..input("thr-1", "message")
            },
            2_000,
        );
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].count, 2);
        assert_eq!(pending[0].severity, Severity::High);
        assert_eq!(pending[0].message.as_deref(), Some("second"));
    }

    #[test]
    fn duplicate_outside_window_creates_a_fresh_item() {
        let queue = NotificationQueue::new(
            NotificationQueueConfig {
                dedupe_window_ms: Some(1_000),
                ..Default::default()
            },
            0,
        );
        let queue = queue.enqueue(input("thr-1", "message"), 1_000);
        let queue = queue.enqueue(input("thr-1", "message"), 5_000);
        assert_eq!(queue.pending().len(), 2);
    }

    #[test]
    fn capacity_overflow_evicts_oldest_with_its_dedupe_mapping() {
        let queue = NotificationQueue::new(
            NotificationQueueConfig {
                max_items: Some(2),
                dedupe_window_ms: Some(i64::MAX / 2),
                ..Default::default()
            },
            0,
        );
        let queue = queue.enqueue(input("thr-1", "a"), 1_000);
        let queue = queue.enqueue(input("thr-2", "b"), 2_000);
        let queue = queue.enqueue(input("thr-3", "c"), 3_000);
        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|item| item.thread_id.as_deref() != Some("thr-1")));

        // the evicted key no longer merges
        let queue = queue.enqueue(input("thr-1", "a"), 4_000);
        assert_eq!(queue.pending().len(), 2);
    }

    #[test]
    fn critical_bypasses_quiet_hours() {
        let queue = quiet_queue("22:00", "06:00");
        let during_quiet = at_minutes(23 * 60);
        let queue = queue.enqueue(
            NotificationInput {
                severity: Some("CRITICAL".to_string()),
                ..input("thr-1", "alert")
            },
            during_quiet,
        );
        let queue = queue.enqueue(input("thr-2", "message"), during_quiet);
        let (queue, ready) = queue.flush(during_quiet);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].thread_id.as_deref(), Some("thr-1"));
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn flush_releases_deferred_items_after_quiet_hours_end() {
        let queue = quiet_queue("22:00", "06:00");
        let queue = queue.enqueue(input("thr-1", "message"), at_minutes(23 * 60));
        assert!(queue.pending()[0].deferred);
        let (queue, ready) = queue.flush(at_minutes(30 * 60)); // 06:00 next day
        assert_eq!(ready.len(), 1);
        assert!(queue.pending().is_empty());
    }

    #[test]
    fn digest_groups_by_thread_and_throttles_restamping() {
        let queue = quiet_queue("00:00", "00:00"); // always quiet
        let queue = queue.enqueue(
            NotificationInput {
                message: Some("one".to_string()),
                ..input("thr-1", "message")
            },
            0,
        );
        let queue = queue.enqueue(
            NotificationInput {
                message: Some("two".to_string()),
                severity: Some("HIGH".to_string()),
                ..input("thr-1", "reaction")
            },
            1_000,
        );
        let at = DEFAULT_DIGEST_WINDOW_MS + 2_000;
        let (queue, digest) = queue.collect_digest(at);
        assert_eq!(digest.len(), 1);
        assert_eq!(digest[0].count, 2);
        assert_eq!(digest[0].highest_severity, Severity::High);
        assert_eq!(digest[0].sample_messages.len(), 2);

        // re-collecting inside half the window yields nothing
        let (_, digest) = queue.collect_digest(at + 1_000);
        assert!(digest.is_empty());
    }
}
