use parley_domain::notifications::{NotificationQueueConfig, QuietHoursConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub presence_ttl_ms: i64,
    pub dedupe_window_ms: i64,
    pub digest_window_ms: i64,
    pub notification_max_items: usize,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub quiet_hours_tz_offset_minutes: i32,
    pub quiet_hours_bypass: String,
    pub upload_ttl_ms: i64,
    pub upload_poll_interval_ms: u64,
    pub upload_poll_max_attempts: u32,
    pub rate_window_ms: i64,
    pub rate_max_conversations: u32,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("presence_ttl_ms", 60_000)?
            .set_default("dedupe_window_ms", 120_000)?
            .set_default("digest_window_ms", 600_000)?
            .set_default("notification_max_items", 200)?
            .set_default("quiet_hours_tz_offset_minutes", 0)?
            .set_default("quiet_hours_bypass", "CRITICAL")?
            .set_default("upload_ttl_ms", 3_600_000)?
            .set_default("upload_poll_interval_ms", 1_500)?
            .set_default("upload_poll_max_attempts", 10)?
            .set_default("rate_window_ms", 86_400_000)?
            .set_default("rate_max_conversations", 5)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn notification_config(&self) -> NotificationQueueConfig {
        NotificationQueueConfig {
            quiet_hours: QuietHoursConfig {
                start: self.quiet_hours_start.clone(),
                end: self.quiet_hours_end.clone(),
                timezone_offset_minutes: self.quiet_hours_tz_offset_minutes,
                bypass_severities: Some(
                    self.quiet_hours_bypass
                        .split(',')
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                        .collect(),
                ),
            },
            dedupe_window_ms: Some(self.dedupe_window_ms),
            digest_window_ms: Some(self.digest_window_ms),
            max_items: Some(self.notification_max_items),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_environment() {
        let config = AppConfig::load().expect("defaults");
        assert_eq!(config.rate_max_conversations, 5);
        assert_eq!(config.dedupe_window_ms, 120_000);
        assert_eq!(config.upload_poll_max_attempts, 10);
    }

    #[test]
    fn bypass_list_is_split_and_trimmed() {
        let config = AppConfig {
            app_env: "test".to_string(),
            log_level: "info".to_string(),
            presence_ttl_ms: 60_000,
            dedupe_window_ms: 120_000,
            digest_window_ms: 600_000,
            notification_max_items: 200,
            quiet_hours_start: Some("22:00".to_string()),
            quiet_hours_end: Some("06:00".to_string()),
            quiet_hours_tz_offset_minutes: 0,
            quiet_hours_bypass: "critical, high".to_string(),
            upload_ttl_ms: 3_600_000,
            upload_poll_interval_ms: 1_500,
            upload_poll_max_attempts: 10,
            rate_window_ms: 86_400_000,
            rate_max_conversations: 5,
        };
        let notification = config.notification_config();
        assert_eq!(
            notification.quiet_hours.bypass_severities,
            Some(vec!["critical".to_string(), "high".to_string()])
        );
        assert_eq!(notification.quiet_hours.start.as_deref(), Some("22:00"));
    }
}
