//! # config — read Config from environment variables
//!
//! Read once at startup (after `dotenvy`).  Absent settings take their
//! defaults; present but unparsable ones fail startup.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::engine::differ::FillTolerance;
use crate::engine::policy::{PolicyConfig, QuietHours, QuietMode};
use crate::engine::risk::RiskConfig;
use crate::engine::suggest::SuggestionConfig;
use crate::engine::EngineConfig;
use crate::models::AlertCategory;
use crate::notify::email::EmailConfig;
use crate::notify::DispatchConfig;
use crate::scheduler::SchedulerConfig;

/// Notification channels; at least one must be set.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// (bot token, chat id)
    pub telegram: Option<(String, String)>,
    pub discord_webhook: Option<String>,
    pub webhook: Option<String>,
    pub email: Option<EmailConfig>,
}

impl ChannelConfig {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_none()
            && self.discord_webhook.is_none()
            && self.webhook.is_none()
            && self.email.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP surface binds to
    pub bind_addr:       String,
    /// Required `X-API-Key`; `None` = open (dev mode)
    pub api_key:         Option<String>,
    /// MT5 bridge base URL, or `mock`
    pub mt5_base_url:    String,
    pub command_timeout: Duration,
    pub scheduler:       SchedulerConfig,
    pub engine:          EngineConfig,
    pub dispatch:        DispatchConfig,
    pub channels:        ChannelConfig,
    pub levels_file:     PathBuf,
    pub state_file:      PathBuf,
    /// External profit advisor endpoint
    pub advisor_url:     Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(&lookup);

        let channels = ChannelConfig {
            telegram: match (env.text("TELEGRAM_BOT_TOKEN"), env.text("TELEGRAM_CHAT_ID")) {
                (Some(token), Some(chat)) => Some((token, chat)),
                (None, None) => None,
                _ => bail!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together"),
            },
            discord_webhook: env.text("DISCORD_WEBHOOK_URL"),
            webhook:         env.text("WEBHOOK_URL"),
            email:           match env.text("SMTP_HOST") {
                Some(host) => Some(EmailConfig {
                    host,
                    port:     env.parse("SMTP_PORT", 587u16)?,
                    username: env.text("SMTP_USERNAME"),
                    password: env.text("SMTP_PASSWORD"),
                    from:     env.text("EMAIL_FROM").context("EMAIL_FROM is required with SMTP_HOST")?,
                    to:       env
                        .text("EMAIL_TO")
                        .context("EMAIL_TO is required with SMTP_HOST")?
                        .split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect(),
                    tls:      env.flag("SMTP_TLS", true)?,
                }),
                None => None,
            },
        };
        if channels.is_empty() {
            bail!("No notification channel configured: set TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID, DISCORD_WEBHOOK_URL, WEBHOOK_URL or SMTP_HOST");
        }

        let fetch_timeout = env.secs("FETCH_TIMEOUT_SECS", 5)?;
        let scheduler = SchedulerConfig {
            poll_interval:   env.secs("POLL_INTERVAL_SECS", 5)?,
            backoff_base:    env.secs("BACKOFF_BASE_SECS", 2)?,
            backoff_max:     env.secs("BACKOFF_MAX_SECS", 120)?,
            fetch_timeout,
            levels_reload:   env.secs("LEVELS_RELOAD_SECS", 30)?,
            advisor_timeout: env.secs("ADVISOR_TIMEOUT_SECS", 3)?,
        };
        if scheduler.poll_interval.is_zero() {
            bail!("POLL_INTERVAL_SECS must be at least 1");
        }
        if scheduler.backoff_max < scheduler.backoff_base {
            bail!("BACKOFF_MAX_SECS must not be smaller than BACKOFF_BASE_SECS");
        }

        let quiet_hours = match env.text("QUIET_HOURS") {
            Some(window) => Some(
                QuietHours::parse(&window, env.parse("QUIET_HOURS_UTC_OFFSET_MINUTES", 0i32)?)
                    .context("QUIET_HOURS")?,
            ),
            None => None,
        };
        let quiet_mode = match env.text("QUIET_HOURS_MODE").map(|m| m.to_lowercase()).as_deref() {
            None | Some("suppress") => QuietMode::Suppress,
            Some("defer") => QuietMode::Defer,
            Some(other) => bail!("Unknown QUIET_HOURS_MODE: '{other}'. Use 'suppress' or 'defer'"),
        };

        let mut disabled = HashSet::new();
        for (key, category) in [
            ("ENABLE_TRADE_ALERTS", AlertCategory::Trade),
            ("ENABLE_ORDER_ALERTS", AlertCategory::Order),
            ("ENABLE_PRICE_ALERTS", AlertCategory::PriceLevel),
            ("ENABLE_PROFIT_SUGGESTIONS", AlertCategory::Advisory),
        ] {
            if !env.flag(key, true)? {
                disabled.insert(category);
            }
        }

        let policy = PolicyConfig {
            dedup_window:    chrono::Duration::seconds(env.parse("DEDUP_WINDOW_SECS", 10i64)?),
            rate_per_window: env.parse("RATE_LIMIT_PER_MINUTE", 10u32)?,
            rate_window:     chrono::Duration::seconds(60),
            hourly_cap:      env.parse("RATE_LIMIT_PER_HOUR", 100u32)?,
            quiet_hours,
            quiet_mode,
            disabled,
        };

        let risk = RiskConfig {
            margin_warning:  env.parse("MARGIN_LEVEL_WARNING", 150.0)?,
            margin_critical: env.parse("MARGIN_LEVEL_CRITICAL", 100.0)?,
            drawdown_pct:    env.parse("DRAWDOWN_LIMIT_PCT", 10.0)?,
            daily_loss_pct:  env.parse("DAILY_LOSS_LIMIT_PCT", 5.0)?,
        };
        if risk.margin_critical > risk.margin_warning {
            bail!("MARGIN_LEVEL_CRITICAL must not exceed MARGIN_LEVEL_WARNING");
        }

        let engine = EngineConfig {
            tolerance: FillTolerance {
                price_pct: env.parse("FILL_PRICE_TOLERANCE_PCT", 0.5)?,
                volume:    env.parse("FILL_VOLUME_TOLERANCE", 0.000001)?,
            },
            policy,
            risk,
            suggestions: SuggestionConfig {
                enabled:        env.flag("ENABLE_PROFIT_SUGGESTIONS", true)?,
                min_profit:     env.parse("MIN_PROFIT_FOR_SUGGESTION", 10.0)?,
                min_profit_pct: env.parse("PROFIT_PERCENTAGE_THRESHOLD", 5.0)?,
            },
        };

        let dispatch = DispatchConfig {
            timeout:      env.secs("DELIVERY_TIMEOUT_SECS", 10)?,
            max_attempts: env.parse("DELIVERY_MAX_ATTEMPTS", 3u32)?,
            retry_delay:  Duration::from_millis(env.parse("DELIVERY_RETRY_DELAY_MS", 500u64)?),
            grouping:     env.flag("ALERT_GROUPING", true)?,
        };

        Ok(Self {
            bind_addr:       env.text("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            api_key:         env.text("API_KEY"),
            mt5_base_url:    env.text("MT5_BASE_URL").unwrap_or_else(|| "http://localhost:8081".to_string()),
            command_timeout: env.secs("COMMAND_TIMEOUT_SECS", 10)?,
            scheduler,
            engine,
            dispatch,
            channels,
            levels_file:     PathBuf::from(env.text("PRICE_LEVELS_FILE").unwrap_or_else(|| "price_levels.json".into())),
            state_file:      PathBuf::from(env.text("STATE_FILE").unwrap_or_else(|| "sentinel_state.json".into())),
            advisor_url:     env.text("ADVISOR_URL"),
        })
    }
}

// ─── Lookup helpers ───────────────────────────────────────────────────────────

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Trimmed value; empty counts as unset.
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.text(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("{key} must be a valid number, got '{raw}': {e}")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> anyhow::Result<Duration> {
        Ok(Duration::from_secs(self.parse(key, default)?))
    }

    fn flag(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        match self.text(key).map(|v| v.to_lowercase()).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => bail!("{key} must be true or false, got '{other}'"),
        }
    }
}
