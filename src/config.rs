use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::coordination::RetryPolicy;
use crate::domain::allocation::validate_fractions;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: TradingMode,
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub gateway: GatewayConfig,
    pub venues: BTreeMap<String, VenueConfig>,
    pub strategies: StrategiesConfig,
    pub alerts: AlertsConfig,
    pub journal: JournalConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
    pub paper: PaperConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut venues = BTreeMap::new();
        venues.insert("paper".to_string(), VenueConfig::default());
        Self {
            mode: TradingMode::Paper,
            engine: EngineConfig::default(),
            risk: RiskConfig::default(),
            gateway: GatewayConfig::default(),
            venues,
            strategies: StrategiesConfig::default(),
            alerts: AlertsConfig::default(),
            journal: JournalConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated venues, real engine
    #[default]
    Paper,
    /// Real venues; requires a registered connector per venue
    Live,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

/// Credential string wiped from memory on drop and never printed
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// State snapshot file (source of truth across restarts)
    pub state_path: PathBuf,
    /// Total graceful shutdown budget
    pub shutdown_timeout_secs: u64,
    /// Time allowed for in-flight placements to ack during shutdown
    pub drain_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/state.json"),
            shutdown_timeout_secs: 60,
            drain_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Max notional / allocated equity per strategy
    pub max_leverage: Decimal,
    /// Fractional drop from the day's high-water-mark that halts trading
    pub max_daily_drawdown: Decimal,
    /// Max perp/spot spread on a hedge before it is force-closed
    pub max_basis_risk: Decimal,
    /// Governor evaluation cadence
    pub evaluation_interval_ms: u64,
    /// Rolling average round-trip above which a venue reports HighLatency
    pub latency_threshold_ms: u64,
    /// Consecutive evaluations with HighLatency before halting
    pub sustained_latency_ticks: u32,
    /// Close every position once halted
    pub flatten_on_halt: bool,
    /// Scheduled reset: clear a HALT at the UTC day boundary
    pub auto_reset_on_new_day: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: dec!(5),
            max_daily_drawdown: dec!(0.10),
            max_basis_risk: dec!(0.01),
            evaluation_interval_ms: 5_000,
            latency_threshold_ms: 500,
            sustained_latency_ticks: 3,
            flatten_on_halt: true,
            auto_reset_on_new_day: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Timeout for a single venue call
    pub call_timeout_ms: u64,
    /// How long to poll an acknowledged order for its fill
    pub fill_timeout_ms: u64,
    pub fill_poll_interval_ms: u64,
    /// Longest a caller waits on an empty rate-limit bucket
    pub rate_limit_max_wait_ms: u64,
    /// Number of round-trip samples in the rolling latency average
    pub latency_window: usize,
    /// How long completed placements are remembered by key
    pub idempotency_ttl_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            fill_timeout_ms: 10_000,
            fill_poll_interval_ms: 200,
            rate_limit_max_wait_ms: 2_000,
            latency_window: 20,
            idempotency_ttl_secs: 3_600,
            retry: RetryPolicy::network(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VenueCredentials {
    pub api_key: Secret,
    pub api_secret: Secret,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    /// Token bucket capacity (burst)
    pub rate_limit_burst: u32,
    /// Token refill per second
    pub rate_limit_per_sec: u32,
    pub credentials: Option<VenueCredentials>,
    /// Paper mode: starting quote balance
    pub paper_balance: Decimal,
    /// Paper mode: slippage applied to every fill, in basis points
    pub paper_slippage_bps: Decimal,
    /// Paper mode: gross exposure / equity the simulated account allows
    pub paper_max_account_leverage: Decimal,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            rate_limit_burst: 20,
            rate_limit_per_sec: 10,
            credentials: None,
            paper_balance: dec!(10000),
            paper_slippage_bps: dec!(2),
            paper_max_account_leverage: dec!(20),
        }
    }
}

/// Settings every strategy shares
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySection<P> {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_venue")]
    pub venue: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub capital_fraction: Decimal,
    /// Evaluation cycle interval
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Budget for one cycle (signal + placement)
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,
    /// Notional / allocated equity targeted per entry
    #[serde(default = "default_target_leverage")]
    pub target_leverage: Decimal,
    /// Venue size increment; sizes are rounded down to it
    #[serde(default = "default_size_step")]
    pub size_step: Decimal,
    /// Entries below this notional skip the cycle
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Market order protection
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    #[serde(default)]
    pub params: P,
}

fn default_true() -> bool {
    true
}

fn default_venue() -> String {
    "paper".to_string()
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_cycle_timeout_ms() -> u64 {
    15_000
}

fn default_target_leverage() -> Decimal {
    dec!(1)
}

fn default_size_step() -> Decimal {
    dec!(0.001)
}

fn default_min_notional() -> Decimal {
    dec!(10)
}

fn default_max_slippage() -> Decimal {
    dec!(0.005)
}

impl<P: Default> StrategySection<P> {
    fn new(capital_fraction: Decimal, target_leverage: Decimal, symbols: &[&str]) -> Self {
        Self {
            enabled: true,
            venue: default_venue(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            capital_fraction,
            interval_ms: default_interval_ms(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
            target_leverage,
            size_step: default_size_step(),
            min_notional: default_min_notional(),
            max_slippage: default_max_slippage(),
            params: P::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FundingArbParams {
    /// Funding rate per interval required to open a hedge
    pub min_funding_rate: Decimal,
    /// Entry only while |basis| <= entry_basis_fraction * max_basis
    pub entry_basis_fraction: Decimal,
    /// Rate reversion: close once funding < exit_funding_fraction * min_funding_rate
    pub exit_funding_fraction: Decimal,
    /// Per-strategy basis limit; defaults to risk.max_basis_risk
    pub max_basis: Option<Decimal>,
}

impl Default for FundingArbParams {
    fn default() -> Self {
        Self {
            min_funding_rate: dec!(0.0001),
            entry_basis_fraction: dec!(0.5),
            exit_funding_fraction: dec!(0.5),
            max_basis: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MomentumParams {
    /// Open interest ratio over the lookback that counts as a surge
    pub oi_surge_threshold: Decimal,
    /// Retrace from the best price since entry that exits
    pub trailing_stop_pct: Decimal,
    /// Allow short entries on the mirrored setup
    pub allow_short: bool,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            oi_surge_threshold: dec!(1.05),
            trailing_stop_pct: dec!(0.05),
            allow_short: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyParams {
    /// Relative volume spike that triggers a candidate
    pub rvol_threshold: Decimal,
    /// Candidates that already moved more than this are skipped
    pub price_change_max: Decimal,
    /// Minimum external sentiment score (0-100)
    pub sentiment_threshold: Decimal,
    /// Fixed exit after this long
    pub hold_timeout_secs: u64,
    /// Hard stop; the symbol is blacklisted afterwards
    pub stop_loss_pct: Decimal,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            rvol_threshold: dec!(5),
            price_change_max: dec!(0.05),
            sentiment_threshold: dec!(70),
            hold_timeout_secs: 4 * 3600,
            stop_loss_pct: dec!(0.20),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub funding_arb: StrategySection<FundingArbParams>,
    pub momentum: StrategySection<MomentumParams>,
    pub anomaly: StrategySection<AnomalyParams>,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            funding_arb: StrategySection::new(dec!(0.4), dec!(1), &["BTCUSDT", "ETHUSDT"]),
            momentum: StrategySection::new(dec!(0.3), dec!(3), &["SOLUSDT"]),
            anomaly: StrategySection::new(dec!(0.3), dec!(1), &["DOGEUSDT"]),
        }
    }
}

impl StrategiesConfig {
    /// (strategy_id, enabled, venue, capital_fraction) for every section
    pub fn sections(&self) -> Vec<(&'static str, bool, &str, Decimal)> {
        vec![
            (
                "funding_arb",
                self.funding_arb.enabled,
                self.funding_arb.venue.as_str(),
                self.funding_arb.capital_fraction,
            ),
            (
                "momentum",
                self.momentum.enabled,
                self.momentum.venue.as_str(),
                self.momentum.capital_fraction,
            ),
            (
                "anomaly",
                self.anomaly.enabled,
                self.anomaly.venue.as_str(),
                self.anomaly.capital_fraction,
            ),
        ]
    }

    /// Capital fractions of enabled strategies
    pub fn enabled_fractions(&self) -> Vec<(&'static str, Decimal)> {
        self.sections()
            .into_iter()
            .filter(|(_, enabled, _, _)| *enabled)
            .map(|(id, _, _, fraction)| (id, fraction))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<Secret>,
    pub chat_id: Option<String>,
    /// Override for tests and proxies
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub rate_limit_secs: u64,
    pub notify_info: bool,
    pub max_alerts_per_minute: u32,
    pub telegram: TelegramConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            notify_info: false,
            max_alerts_per_minute: 10,
            telegram: TelegramConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    /// JSON-lines file; log-only sink when unset
    pub path: Option<PathBuf>,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Some(PathBuf::from("data/journal.jsonl")),
            queue_capacity: 1_024,
            retry: RetryPolicy::journal(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8089".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Daily rolling log files go here when writable
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,panther=debug".to_string(),
            json: false,
            dir: Some(PathBuf::from("logs")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperSymbol {
    pub symbol: String,
    pub price: Decimal,
    /// Perp premium over spot as a fraction
    #[serde(default)]
    pub basis: Decimal,
    #[serde(default)]
    pub funding_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Random walk step interval
    pub tick_ms: u64,
    /// Per-tick price volatility as a fraction
    pub volatility: Decimal,
    pub symbols: Vec<PaperSymbol>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        let symbol = |symbol: &str, price: Decimal, funding_rate: Decimal| PaperSymbol {
            symbol: symbol.to_string(),
            price,
            basis: dec!(0.002),
            funding_rate,
        };
        Self {
            tick_ms: 1_000,
            volatility: dec!(0.002),
            symbols: vec![
                symbol("BTCUSDT", dec!(60000), dec!(0.0003)),
                symbol("ETHUSDT", dec!(3000), dec!(0.0002)),
                symbol("SOLUSDT", dec!(150), dec!(0.0001)),
                symbol("DOGEUSDT", dec!(0.15), dec!(0.0001)),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from `./config` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PANTHER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PANTHER__RISK__MAX_LEVERAGE, etc.)
            .add_source(
                Environment::with_prefix("PANTHER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Risk limits
        if self.risk.max_leverage <= Decimal::ZERO {
            errors.push("risk.max_leverage must be positive".to_string());
        }
        if self.risk.max_daily_drawdown <= Decimal::ZERO || self.risk.max_daily_drawdown >= Decimal::ONE
        {
            errors.push("risk.max_daily_drawdown must be between 0 and 1".to_string());
        }
        if self.risk.max_basis_risk <= Decimal::ZERO {
            errors.push("risk.max_basis_risk must be positive".to_string());
        }
        if self.risk.evaluation_interval_ms == 0 {
            errors.push("risk.evaluation_interval_ms must be positive".to_string());
        }
        if self.risk.sustained_latency_ticks == 0 {
            errors.push("risk.sustained_latency_ticks must be >= 1".to_string());
        }

        // Gateway
        if self.gateway.call_timeout_ms == 0 {
            errors.push("gateway.call_timeout_ms must be positive".to_string());
        }
        if self.gateway.fill_poll_interval_ms == 0 {
            errors.push("gateway.fill_poll_interval_ms must be positive".to_string());
        }
        if self.gateway.latency_window == 0 {
            errors.push("gateway.latency_window must be positive".to_string());
        }
        errors.extend(self.gateway.retry.validate("gateway.retry"));
        errors.extend(self.journal.retry.validate("journal.retry"));

        // Venues
        if self.venues.is_empty() {
            errors.push("at least one venue must be configured".to_string());
        }
        for (name, venue) in &self.venues {
            if venue.rate_limit_burst == 0 || venue.rate_limit_per_sec == 0 {
                errors.push(format!("venues.{name}: rate limiter capacity must be positive"));
            }
            if self.mode == TradingMode::Live {
                let has_creds = venue
                    .credentials
                    .as_ref()
                    .map(|c| !c.api_key.is_empty() && !c.api_secret.is_empty())
                    .unwrap_or(false);
                if !has_creds {
                    errors.push(format!("venues.{name}: live mode requires credentials"));
                }
            }
        }

        // Strategies and the allocation invariant
        for (id, enabled, venue, _) in self.strategies.sections() {
            if enabled && !self.venues.contains_key(venue) {
                errors.push(format!("strategies.{id}: venue '{venue}' is not configured"));
            }
        }
        self.validate_strategy(
            "funding_arb",
            self.strategies.funding_arb.enabled,
            &self.strategies.funding_arb,
            &mut errors,
        );
        self.validate_strategy(
            "momentum",
            self.strategies.momentum.enabled,
            &self.strategies.momentum,
            &mut errors,
        );
        self.validate_strategy(
            "anomaly",
            self.strategies.anomaly.enabled,
            &self.strategies.anomaly,
            &mut errors,
        );
        let fa = &self.strategies.funding_arb.params;
        if fa.entry_basis_fraction <= Decimal::ZERO || fa.entry_basis_fraction > Decimal::ONE {
            errors.push("strategies.funding_arb.params.entry_basis_fraction must be in (0, 1]".into());
        }
        if self.strategies.anomaly.params.stop_loss_pct <= Decimal::ZERO
            || self.strategies.anomaly.params.stop_loss_pct >= Decimal::ONE
        {
            errors.push("strategies.anomaly.params.stop_loss_pct must be between 0 and 1".into());
        }
        if self.strategies.momentum.params.trailing_stop_pct <= Decimal::ZERO {
            errors.push("strategies.momentum.params.trailing_stop_pct must be positive".into());
        }
        if let Err(e) = validate_fractions(self.strategies.enabled_fractions()) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_strategy<P>(
        &self,
        id: &str,
        enabled: bool,
        section: &StrategySection<P>,
        errors: &mut Vec<String>,
    ) {
        if !enabled {
            return;
        }
        if section.symbols.is_empty() {
            errors.push(format!("strategies.{id}: at least one symbol is required"));
        }
        if section.interval_ms == 0 || section.cycle_timeout_ms == 0 {
            errors.push(format!("strategies.{id}: interval and cycle timeout must be positive"));
        }
        if section.target_leverage <= Decimal::ZERO {
            errors.push(format!("strategies.{id}: target_leverage must be positive"));
        }
        if section.target_leverage > self.risk.max_leverage {
            errors.push(format!(
                "strategies.{id}: target_leverage {} exceeds risk.max_leverage {}",
                section.target_leverage, self.risk.max_leverage
            ));
        }
        if section.size_step <= Decimal::ZERO {
            errors.push(format!("strategies.{id}: size_step must be positive"));
        }
    }
}
