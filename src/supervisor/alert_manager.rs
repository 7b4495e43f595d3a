//! Alert Manager
//!
//! Routes engine alerts by severity to the log, in-process subscribers and an
//! optional chat channel. Includes rate limiting to prevent alert storms.
//! Delivery is best-effort and never blocks the caller on the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational - log only
    Info,
    /// Warning - chat notification
    Warning,
    /// Error - rejected or failed operation
    Error,
    /// Critical - kill switch, split-brain store, startup failure
    Critical,
}

impl AlertLevel {
    pub fn emoji(&self) -> &'static str {
        match self {
            AlertLevel::Info => "\u{2139}\u{fe0f}",
            AlertLevel::Warning => "\u{26a0}\u{fe0f}",
            AlertLevel::Error => "\u{274c}",
            AlertLevel::Critical => "\u{1f6a8}",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Plain-text rendering for chat channels
    pub fn format_text(&self) -> String {
        let mut text = format!(
            "{} {}\n\nComponent: {}\nTime: {}\n\n{}",
            self.level.emoji(),
            self.title,
            self.component,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.message
        );
        if let Some(ctx) = &self.context {
            text.push_str(&format!("\n\n{}", ctx));
        }
        text
    }
}

/// Outbound notification channel
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, text: &str) -> Result<(), String>;
}

/// Configuration for alert manager
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate alerts (default: 60s)
    pub rate_limit_secs: u64,
    /// Whether to send alerts for info level (default: false)
    pub notify_info: bool,
    /// Maximum alerts per minute before throttling (default: 10)
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            notify_info: false,
            max_alerts_per_minute: 10,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

pub struct AlertManager {
    config: AlertManagerConfig,
    channel: Option<Arc<dyn AlertChannel>>,
    rate_limits: RwLock<HashMap<String, RateLimitState>>,
    alerts_this_minute: RwLock<Vec<DateTime<Utc>>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            channel: None,
            rate_limits: RwLock::new(HashMap::new()),
            alerts_this_minute: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    pub fn with_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Subscribe to alerts
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.component, alert.level, alert.title)
    }

    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let key = Self::rate_limit_key(alert);
        let now = Utc::now();

        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return true;
            }

            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    /// Global alerts-per-minute limit
    async fn is_throttled(&self) -> bool {
        let now = Utc::now();
        let minute_ago = now - chrono::Duration::minutes(1);

        let mut alerts = self.alerts_this_minute.write().await;
        alerts.retain(|t| *t > minute_ago);

        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }

        alerts.push(now);
        false
    }

    /// Send an alert
    pub async fn alert(&self, alert: Alert) {
        let _ = self.event_tx.send(alert.clone());

        match alert.level {
            AlertLevel::Info => info!("[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }

        let should_notify = match alert.level {
            AlertLevel::Info => self.config.notify_info,
            AlertLevel::Warning | AlertLevel::Error | AlertLevel::Critical => true,
        };
        if !should_notify {
            return;
        }

        if self.should_rate_limit(&alert).await {
            return;
        }
        if self.is_throttled().await {
            return;
        }

        if let Some(channel) = self.channel.clone() {
            let text = alert.format_text();
            tokio::spawn(async move {
                if let Err(e) = channel.send(&text).await {
                    error!("Failed to deliver alert via {}: {}", channel.name(), e);
                }
            });
        }
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Warning, component, title, message))
            .await;
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Error, component, title, message))
            .await;
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await;
    }

    /// Kill switch engaged
    pub async fn kill_switch_engaged(&self, reason: &str, equity: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "risk_governor",
                "Kill Switch Engaged",
                &format!("Trading halted: {}", reason),
            )
            .with_context(serde_json::json!({
                "action": "new_entries_rejected",
                "equity": equity,
            })),
        )
        .await;
    }

    /// Compare-and-set retries exhausted; store and writers disagree
    pub async fn store_split_brain(&self, key: &str, attempts: u32) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "state_store",
                "State Store Conflict Unresolved",
                &format!(
                    "Compare-and-set on {} failed after {} attempts",
                    key, attempts
                ),
            )
            .with_context(serde_json::json!({
                "action": "manual_intervention_required",
                "key": key,
            })),
        )
        .await;
    }

    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }
}
