use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::application::scheduler::{RateLimitConfig, SchedulerConfig};
use crate::application::usecases::DispatchConfig;
use crate::domain::{Platform, SchedulePolicy, UserId};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub telegram: Option<TelegramCfg>,
    #[serde(default)]
    pub scheduler: SchedulerCfg,
    #[serde(default)]
    pub limits: LimitsCfg,
    /// Upstream request budget per platform; unlisted platforms use the default bucket.
    #[serde(default)]
    pub platforms: HashMap<Platform, RateLimitConfig>,
    #[serde(default = "default_parse_alert_threshold")]
    pub parse_alert_threshold: u32,
    /// Identical searches within this window share one request. 0 disables.
    #[serde(default = "default_fetch_cache_seconds")]
    pub fetch_cache_seconds: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub http: Option<HttpCfg>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramCfg {
    pub bot_token: String,
    #[serde(default)]
    pub admin_chat_ids: Vec<i64>,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerCfg {
    pub base_interval_seconds: u64,
    pub min_interval_seconds: u64,
    pub max_backoff_seconds: u64,
    pub parallelism: usize,
    pub first_check_delay_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            base_interval_seconds: 120,
            min_interval_seconds: 30,
            max_backoff_seconds: 1800,
            parallelism: 4,
            first_check_delay_seconds: 15,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsCfg {
    pub max_watches_per_user: usize,
    /// 0 = unbounded
    pub seen_history_cap: usize,
    pub seen_retention_days: Option<u64>,
    pub max_delivery_attempts: u32,
    pub send_spacing_millis: u64,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            max_watches_per_user: 10,
            seen_history_cap: 0,
            seen_retention_days: None,
            max_delivery_attempts: 3,
            send_spacing_millis: 1200,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HttpCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_database_url() -> String {
    "sqlite:./zenwatch.db".to_string()
}

fn default_parse_alert_threshold() -> u32 {
    3
}

fn default_fetch_cache_seconds() -> u64 {
    60
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let raw = expand_env(raw);
        let cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scheduler;
        if s.parallelism == 0 {
            bail!("scheduler.parallelism must be at least 1");
        }
        if s.base_interval_seconds == 0 {
            bail!("scheduler.base_interval_seconds must be positive");
        }
        if s.min_interval_seconds > s.base_interval_seconds {
            bail!(
                "scheduler.min_interval_seconds ({}) exceeds base_interval_seconds ({})",
                s.min_interval_seconds,
                s.base_interval_seconds
            );
        }
        if s.base_interval_seconds > s.max_backoff_seconds {
            bail!(
                "scheduler.base_interval_seconds ({}) exceeds max_backoff_seconds ({})",
                s.base_interval_seconds,
                s.max_backoff_seconds
            );
        }
        if self.limits.max_watches_per_user == 0 {
            bail!("limits.max_watches_per_user must be at least 1");
        }
        if self.limits.max_delivery_attempts == 0 {
            bail!("limits.max_delivery_attempts must be at least 1");
        }
        for (platform, limit) in &self.platforms {
            if limit.requests_per_minute == 0 || limit.burst == 0 {
                bail!("platforms.{platform}: requests_per_minute and burst must be positive");
            }
        }
        if let Some(tg) = &self.telegram {
            if tg.bot_token.trim().is_empty() {
                bail!("telegram.bot_token is empty");
            }
        }
        Ok(())
    }

    pub fn admin_destinations(&self) -> Vec<UserId> {
        self.telegram
            .as_ref()
            .map(|t| t.admin_chat_ids.iter().copied().map(UserId).collect())
            .unwrap_or_default()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            policy: SchedulePolicy {
                base_interval: Duration::from_secs(s.base_interval_seconds),
                min_interval: Duration::from_secs(s.min_interval_seconds),
                max_backoff: Duration::from_secs(s.max_backoff_seconds),
            },
            parallelism: s.parallelism,
            first_check_delay: Duration::from_secs(s.first_check_delay_seconds),
            shutdown_grace: Duration::from_secs(s.shutdown_grace_seconds),
            rate_limits: self.platforms.clone(),
            parse_alert_threshold: self.parse_alert_threshold,
            admin_destinations: self.admin_destinations(),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let l = &self.limits;
        DispatchConfig {
            send_spacing: Duration::from_millis(l.send_spacing_millis),
            max_delivery_attempts: l.max_delivery_attempts,
            seen_history_cap: l.seen_history_cap,
            seen_retention: l
                .seen_retention_days
                .map(|d| Duration::from_secs(d * 24 * 60 * 60)),
        }
    }
}

/// very small ${VAR} expansion to keep config simple; unknown variables are left as-is
fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => out.push_str(&rest[start..start + 3 + end]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
