//! Panther CLI
//!
//! `run` starts the engine in this process. `status`, `stop`,
//! `reset-kill-switch` and `trigger-exit` talk to a running engine through
//! its control server.

use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PantherError, Result};
use crate::services::control::{EngineStatus, KillSwitchView};

#[derive(Parser, Debug)]
#[command(name = "panther")]
#[command(author, version, about = "Multi-strategy execution engine with a shared kill switch")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml, then $PANTHER_ENV.toml)
    #[arg(short, long, default_value = "config", global = true)]
    pub config: PathBuf,

    /// Control server base URL; defaults to http://<control.bind>
    #[arg(long, env = "PANTHER_CONTROL_URL", global = true)]
    pub control_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine and run until stopped
    Run,
    /// Show mode, kill switch, open positions and daily PnL
    Status,
    /// Gracefully drain and stop a running engine
    Stop,
    /// Clear an engaged kill switch
    ResetKillSwitch {
        /// Recorded as the operator who cleared the halt
        #[arg(long, default_value = "operator")]
        operator: String,
    },
    /// Ask a strategy to exit its position on a symbol
    TriggerExit {
        /// Strategy id (funding_arb, momentum, anomaly)
        strategy: String,
        symbol: String,
    },
    /// Re-read configuration and rewrite capital allocations
    Reload,
    /// Load and validate configuration without starting
    CheckConfig,
}

/// HTTP client for the engine's control server
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Client for a `host:port` bind address
    pub fn for_bind(bind: &str) -> Result<Self> {
        Self::new(format!("http://{}", bind))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed");
        let problems = body
            .get("problems")
            .and_then(|p| p.as_array())
            .map(|p| {
                p.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY && !problems.is_empty() {
            return Err(PantherError::InvalidConfig(problems));
        }
        Err(PantherError::Internal(format!("{} ({})", message, status)))
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let response = self.http.get(self.url("/status")).send().await?;
        Self::decode(response).await
    }

    pub async fn stop(&self) -> Result<()> {
        let response = self.http.post(self.url("/stop")).send().await?;
        let _: serde_json::Value = Self::decode(response).await?;
        Ok(())
    }

    pub async fn reset_kill_switch(&self, operator: &str) -> Result<KillSwitchView> {
        let response = self
            .http
            .post(self.url("/kill-switch/reset"))
            .json(&serde_json::json!({ "operator": operator }))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn reload(&self) -> Result<Vec<String>> {
        let response = self.http.post(self.url("/reload")).send().await?;
        let body: serde_json::Value = Self::decode(response).await?;
        Ok(body
            .get("allocations")
            .and_then(|a| a.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    pub async fn trigger_exit(&self, strategy: &str, symbol: &str) -> Result<String> {
        let response = self
            .http
            .post(self.url(&format!("/strategies/{}/exit/{}", strategy, symbol)))
            .send()
            .await?;
        let body: serde_json::Value = Self::decode(response).await?;
        Ok(body
            .get("result")
            .and_then(|r| r.as_str())
            .unwrap_or("accepted")
            .to_string())
    }
}

/// Render `status` for a terminal
pub fn format_status(status: &EngineStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("Mode:            {}\n", status.mode));
    if status.kill_switch.engaged {
        out.push_str(&format!(
            "Kill switch:     ENGAGED ({})\n",
            status.kill_switch.reason.as_deref().unwrap_or("no reason recorded")
        ));
        if let Some(at) = status.kill_switch.engaged_at {
            out.push_str(&format!("Engaged at:      {}\n", at.to_rfc3339()));
        }
    } else {
        out.push_str("Kill switch:     clear\n");
    }
    out.push_str(&format!("Open positions:  {}\n", status.open_positions_count));
    out.push_str(&format!("Daily PnL:       {}\n", status.daily_pnl.round_dp(2)));
    out.push_str(&format!("Equity:          {}\n", status.equity.round_dp(2)));
    out.push_str(&format!("Strategies:      {}\n", status.strategies.join(", ")));
    for venue in &status.venues {
        out.push_str(&format!(
            "Venue {:<10} {}ms{}\n",
            venue.venue,
            venue.average_ms,
            if venue.high { " (HIGH LATENCY)" } else { "" }
        ));
    }
    out
}
