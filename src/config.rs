use std::env;
use std::path::PathBuf;

use chrono::NaiveTime;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub token_key: String,
    pub image_dir: PathBuf,
    pub site_url: String,
    pub scheduler: SchedulerConfig,
    pub dingtalk: DingTalkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Master switch: when off, every job is cancelled.
    pub enabled: bool,
    /// Local `HH:MM` at which expired meals are purged.
    pub cleanup_time: String,
    pub reminder_before_end_hours: u32,
    pub cleanup_enabled: bool,
    pub reminder_enabled: bool,
    pub auto_select_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cleanup_time: "02:00".into(),
            reminder_before_end_hours: 6,
            cleanup_enabled: true,
            reminder_enabled: true,
            auto_select_enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn cleanup_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.cleanup_time.trim(), "%H:%M").map_err(|_| {
            Error::Config(format!(
                "invalid cleanup time '{}', expected HH:MM",
                self.cleanup_time
            ))
        })
    }
}

#[derive(Debug, Clone)]
pub struct DingTalkConfig {
    pub api_base: String,
    pub app_key: String,
    pub app_secret: String,
    pub agent_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let scheduler = SchedulerConfig {
            enabled: flag("SCHEDULER_ENABLED", false)?,
            cleanup_time: env::var("SCHEDULER_CLEANUP_TIME").unwrap_or_else(|_| "02:00".into()),
            reminder_before_end_hours: env::var("SCHEDULER_REMINDER_BEFORE_END_HOURS")
                .unwrap_or_else(|_| "6".into())
                .parse()
                .map_err(|_| {
                    Error::Config("SCHEDULER_REMINDER_BEFORE_END_HOURS must be a non-negative integer".into())
                })?,
            cleanup_enabled: flag("SCHEDULER_CLEANUP_ENABLED", true)?,
            reminder_enabled: flag("SCHEDULER_REMINDER_ENABLED", true)?,
            auto_select_enabled: flag("SCHEDULER_AUTO_SELECT_ENABLED", true)?,
        };
        // Fail at startup rather than when the first reconciliation runs.
        scheduler.cleanup_time()?;

        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/canteen.db".into())
                .into(),
            token_key: required("TOKEN_KEY")?,
            image_dir: env::var("IMAGE_DIR").unwrap_or_else(|_| "./data".into()).into(),
            site_url: env::var("SITE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into())
                .trim_end_matches('/')
                .to_string(),
            scheduler,
            dingtalk: DingTalkConfig {
                api_base: env::var("DINGTALK_API_BASE")
                    .unwrap_or_else(|_| "https://oapi.dingtalk.com".into())
                    .trim_end_matches('/')
                    .to_string(),
                app_key: env::var("DINGTALK_APP_KEY").unwrap_or_default(),
                app_secret: env::var("DINGTALK_APP_SECRET").unwrap_or_default(),
                agent_id: env::var("DINGTALK_AGENT_ID").unwrap_or_default(),
            },
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::Config(format!("missing required env var: {key}")))
}

fn flag(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(v) => parse_flag(&v).ok_or_else(|| Error::Config(format!("{key} must be true or false"))),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
