//! Engine: wires the store, gateway, governor and strategy runners from
//! config and drives them from startup reconciliation to graceful drain.
//!
//! Startup order matters: the store is reconciled against every venue, then
//! allocations are rebuilt from venue equity, before the governor publishes
//! its first evaluation. Only then do strategies start. Any failure before
//! that point aborts the run.

use async_trait::async_trait;
use futures::future::{join_all, FutureExt};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{spawn_journal, JournalHandle, JournalSink, JsonlJournal, TelegramNotifier, TracingJournal};
use crate::config::{AppConfig, TradingMode};
use crate::coordination::{
    GracefulShutdown, RetryPolicy, ShutdownConfig, ShutdownSignal, ShutdownSteps,
};
use crate::domain::{Allocation, KillSwitchState};
use crate::error::PantherError;
use crate::exchange::{ExchangeGateway, GatewaySettings, PaperMarket, PaperVenue, VenueConnector};
use crate::persistence::{update_allocation, FileStateStore, StateStore};
use crate::risk::{unrealized_pnl, GovernorHandle, RiskGovernor};
use crate::services::control::{self, EngineControl, EngineStatus, KillSwitchView};
use crate::strategy::{
    reconcile, AnomalyEntry, FundingArb, MarketFeed, Momentum, ReconciliationReport, RunnerHandle,
    RunnerSettings, RuntimeServices, SentimentOracle, StrategyKind, StrategyRunner, ANOMALY,
    FUNDING_ARB, MOMENTUM,
};
use crate::supervisor::{AlertManager, AlertManagerConfig};

/// Process outcome, mapped to the exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal shutdown
    Clean,
    /// Startup or reconciliation failure
    StartupFailure,
    /// The kill switch was engaged when the engine stopped
    KillSwitchEngaged,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::StartupFailure => 1,
            ExitStatus::KillSwitchEngaged => 2,
        }
    }
}

/// Collaborators the caller may supply instead of the config defaults
#[derive(Default)]
pub struct EngineOptions {
    /// Directory `reload` re-reads; `./config` when unset
    pub config_dir: Option<PathBuf>,
    /// Overrides the file store at `engine.state_path`
    pub store: Option<Arc<dyn StateStore>>,
    /// Venue connectors by name. Required for every venue in live mode;
    /// paper mode falls back to a simulated venue.
    pub connectors: HashMap<String, Arc<dyn VenueConnector>>,
    /// Market data for live mode
    pub feed: Option<Arc<dyn MarketFeed>>,
    pub sentiment: Option<Arc<dyn SentimentOracle>>,
    /// Paper market to trade against; disables the built-in random walk
    pub paper_market: Option<Arc<PaperMarket>>,
}

/// State shared with the control server
struct EngineShared {
    config: RwLock<Arc<AppConfig>>,
    config_dir: Option<PathBuf>,
    store: Arc<dyn StateStore>,
    gateway: Arc<ExchangeGateway>,
    feed: Arc<dyn MarketFeed>,
    governor: GovernorHandle,
    runners: HashMap<String, RunnerHandle>,
    shutdown: Arc<GracefulShutdown>,
    cas_policy: RetryPolicy,
}

impl EngineShared {
    fn config(&self) -> Arc<AppConfig> {
        let guard = self.config.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn replace_config(&self, config: AppConfig) {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }

    async fn kill_switch(&self) -> KillSwitchState {
        match self.store.get_kill_switch_state().await {
            Ok(Some(v)) => v.value,
            Ok(None) => self.governor.status().kill_switch,
            Err(e) => {
                warn!(error = %e, "Kill switch unreadable, reporting governor view");
                self.governor.status().kill_switch
            }
        }
    }
}

#[async_trait]
impl EngineControl for EngineShared {
    async fn status(&self) -> Result<EngineStatus, PantherError> {
        let config = self.config();
        let kill_switch = self.kill_switch().await;
        let open_positions = self.store.list_open_positions().await?;
        let mut strategies: Vec<String> = self.runners.keys().cloned().collect();
        strategies.sort();

        Ok(EngineStatus {
            mode: config.mode,
            kill_switch: KillSwitchView::from(&kill_switch),
            open_positions_count: open_positions.len(),
            daily_pnl: kill_switch.daily_pnl,
            equity: self.governor.status().equity,
            strategies,
            venues: self.gateway.latency_snapshot(),
        })
    }

    fn request_stop(&self) {
        self.shutdown.request_shutdown(ShutdownSignal::Graceful);
    }

    async fn reset_kill_switch(&self, operator: &str) -> Result<KillSwitchState, PantherError> {
        self.governor.reset(operator).await
    }

    async fn reload(&self) -> Result<Vec<String>, PantherError> {
        let config = match &self.config_dir {
            Some(dir) => AppConfig::load_from(dir)?,
            None => AppConfig::load()?,
        };
        config.validate().map_err(PantherError::InvalidConfig)?;

        let written =
            write_allocations(
                &config,
                self.store.as_ref(),
                &self.gateway,
                self.feed.as_ref(),
                &self.cas_policy,
            )
            .await?;
        info!(strategies = ?written, "Configuration reloaded, allocations rewritten");
        self.replace_config(config);
        Ok(written)
    }

    async fn trigger_exit(&self, strategy_id: &str, symbol: &str) -> Result<String, String> {
        let runner = self
            .runners
            .get(strategy_id)
            .ok_or_else(|| format!("strategy {} is not running", strategy_id))?;
        runner.trigger_exit(symbol).await
    }
}

/// Allocate capital to every enabled strategy as a fraction of the total
/// equity across the venues they trade on.
///
/// Venue equity is marked to market. The governor adds unrealized PnL of
/// stored positions on top of allocations, so that PnL is taken out here.
async fn write_allocations(
    config: &AppConfig,
    store: &dyn StateStore,
    gateway: &ExchangeGateway,
    feed: &dyn MarketFeed,
    policy: &RetryPolicy,
) -> Result<Vec<String>, PantherError> {
    let venues: BTreeSet<&str> = config
        .strategies
        .sections()
        .into_iter()
        .filter(|(_, enabled, _, _)| *enabled)
        .map(|(_, _, venue, _)| venue)
        .collect();

    let mut total_equity = Decimal::ZERO;
    for venue in venues {
        let balances = gateway.get_balances(venue).await?;
        total_equity += balances.total_equity;
    }
    let open = store.list_open_positions().await?;
    let unrealized = unrealized_pnl(&open, feed).await;
    total_equity -= unrealized;
    debug!(equity = %total_equity, unrealized = %unrealized, "Equity net of open positions");

    let mut written = Vec::new();
    for (strategy_id, fraction) in config.strategies.enabled_fractions() {
        let allocation = Allocation::new(strategy_id, fraction, total_equity);
        info!(
            strategy = strategy_id,
            fraction = %fraction,
            equity = %allocation.current_equity,
            "Allocation written"
        );
        update_allocation(store, strategy_id, policy, |_| Some(allocation.clone())).await?;
        written.push(strategy_id.to_string());
    }
    Ok(written)
}

pub struct Engine {
    shared: Arc<EngineShared>,
    governor: RiskGovernor,
    runners: Vec<StrategyRunner>,
    random_walk: Option<Arc<PaperMarket>>,
    alerts: Arc<AlertManager>,
    journal: Option<(JournalHandle, JoinHandle<()>)>,
    reconciliation: ReconciliationReport,
}

impl Engine {
    /// Build every component and run startup reconciliation. An error here
    /// means the process must exit with a startup failure.
    pub async fn start(config: AppConfig, options: EngineOptions) -> Result<Self, PantherError> {
        config.validate().map_err(PantherError::InvalidConfig)?;
        let config = Arc::new(config);
        info!(mode = %config.mode, "Starting engine");

        let store: Arc<dyn StateStore> = match options.store {
            Some(store) => store,
            None => Arc::new(FileStateStore::open(&config.engine.state_path).await?),
        };

        let alerts = {
            let manager = AlertManager::new(AlertManagerConfig {
                rate_limit_secs: config.alerts.rate_limit_secs,
                notify_info: config.alerts.notify_info,
                max_alerts_per_minute: config.alerts.max_alerts_per_minute,
            });
            let manager = match TelegramNotifier::from_config(&config.alerts.telegram) {
                Some(telegram) => manager.with_channel(telegram),
                None => manager,
            };
            Arc::new(manager)
        };

        // Market data and venues
        let (feed, sentiment, paper_market, random_walk) = match config.mode {
            TradingMode::Paper => {
                let (market, walk) = match options.paper_market {
                    Some(market) => (market, None),
                    None => {
                        let market = PaperMarket::from_config(&config.paper);
                        (market.clone(), Some(market))
                    }
                };
                let feed: Arc<dyn MarketFeed> = options
                    .feed
                    .unwrap_or_else(|| market.clone() as Arc<dyn MarketFeed>);
                let sentiment: Arc<dyn SentimentOracle> =
                    options
                    .sentiment
                    .unwrap_or_else(|| market.clone() as Arc<dyn SentimentOracle>);
                (feed, Some(sentiment), Some(market), walk)
            }
            TradingMode::Live => {
                let feed = options.feed.ok_or_else(|| {
                    PantherError::Internal("live mode requires a market data feed".into())
                })?;
                (feed, options.sentiment, None, None)
            }
        };

        let (mut governor, governor_handle) =
            RiskGovernor::new(config.risk.clone(), Arc::clone(&store), Arc::clone(&feed));
        governor = governor.with_alerts(Arc::clone(&alerts));

        let mut gateway = ExchangeGateway::new(GatewaySettings::from_config(&config.gateway, &config.risk))
            .with_halt_signal(governor_handle.halt_signal())
            .with_risk_events(governor_handle.event_sender());
        for (name, venue_config) in &config.venues {
            let connector: Arc<dyn VenueConnector> = match (options.connectors.get(name), &paper_market) {
                (Some(connector), _) => Arc::clone(connector),
                (None, Some(market)) => Arc::new(PaperVenue::new(name.clone(), Arc::clone(market), venue_config)),
                (None, None) => {
                    return Err(PantherError::Internal(format!(
                        "no connector registered for live venue {}",
                        name
                    )))
                }
            };
            gateway = gateway.with_venue(connector, venue_config);
        }
        let gateway = Arc::new(gateway);

        let journal = if config.journal.enabled {
            let sink: Arc<dyn JournalSink> = match &config.journal.path {
                Some(path) => Arc::new(JsonlJournal::new(path.clone())),
                None => Arc::new(TracingJournal),
            };
            Some(spawn_journal(
                sink,
                config.journal.queue_capacity,
                config.journal.retry.clone(),
            ))
        } else {
            None
        };

        let cas_policy = RetryPolicy::store();
        let reconciliation = reconcile(
            store.as_ref(),
            &gateway,
            feed.as_ref(),
            Some(&alerts),
            &cas_policy,
        )
        .await?;

        // Venue equity already reflects fills reconciliation just recorded
        write_allocations(&config, store.as_ref(), &gateway, feed.as_ref(), &cas_policy).await?;

        let status = governor.initialize().await?;
        info!(
            equity = %status.equity,
            kill_switch = status.kill_switch.engaged,
            "Risk governor initialized"
        );

        let services = RuntimeServices {
            store: Arc::clone(&store),
            gateway: Arc::clone(&gateway),
            governor: governor_handle.clone(),
            feed: Arc::clone(&feed),
            sentiment,
            journal: journal.as_ref().map(|(handle, _)| handle.clone()),
            alerts: Some(Arc::clone(&alerts)),
            cas_policy: cas_policy.clone(),
        };
        let (runners, handles) = build_runners(&config, &services);

        let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig {
            total_timeout_secs: config.engine.shutdown_timeout_secs,
            order_drain_timeout_secs: config.engine.drain_timeout_secs,
            ..ShutdownConfig::default()
        }));

        let shared = Arc::new(EngineShared {
            config: RwLock::new(config),
            config_dir: options.config_dir,
            store,
            gateway,
            feed,
            governor: governor_handle,
            runners: handles,
            shutdown,
            cas_policy,
        });

        Ok(Self {
            shared,
            governor,
            runners,
            random_walk,
            alerts,
            journal,
            reconciliation,
        })
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        Arc::clone(&self.shared.shutdown)
    }

    pub fn control(&self) -> Arc<dyn EngineControl> {
        self.shared.clone()
    }

    pub fn governor(&self) -> GovernorHandle {
        self.shared.governor.clone()
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.shared.store)
    }

    pub fn gateway(&self) -> Arc<ExchangeGateway> {
        Arc::clone(&self.shared.gateway)
    }

    pub fn reconciliation(&self) -> &ReconciliationReport {
        &self.reconciliation
    }

    /// Run until a stop is requested, then drain and report the exit status
    pub async fn run(self) -> ExitStatus {
        let Engine {
            shared,
            governor,
            runners,
            random_walk,
            alerts,
            journal,
            reconciliation: _,
        } = self;
        let shutdown = Arc::clone(&shared.shutdown);
        let config = shared.config();

        let governor_task = tokio::spawn(governor.run(shutdown.subscribe()));
        let runner_tasks: Vec<JoinHandle<()>> = runners
            .into_iter()
            .map(|runner| tokio::spawn(runner.run(shutdown.subscribe())))
            .collect();

        if config.control.enabled {
            let control: Arc<dyn EngineControl> = shared.clone();
            let bind = config.control.bind.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = control::serve(control, &bind, rx).await {
                    error!(error = %e, "Control server stopped");
                }
            });
        }

        if let Some(market) = random_walk {
            tokio::spawn(market.run_random_walk(
                Duration::from_millis(config.paper.tick_ms.max(1)),
                config.paper.volatility,
                shutdown.subscribe(),
            ));
        }

        tokio::spawn(expire_placements(
            Arc::clone(&shared.gateway),
            shutdown.subscribe(),
        ));

        alerts
            .info(
                "engine",
                "Engine Started",
                &format!("mode {}, {} strategies", config.mode, shared.runners.len()),
            )
            .await;

        let signal = shutdown.wait_for_request().await;
        info!(signal = %signal, "Stopping engine");

        let gateway = Arc::clone(&shared.gateway);
        let store = Arc::clone(&shared.store);
        let drain_timeout = Duration::from_secs(config.engine.drain_timeout_secs);

        let steps = ShutdownSteps {
            stop_new_orders: async {
                gateway.inflight().close();
            }
            .boxed(),
            drain_orders: async {
                // Runners settle their own placements before exiting
                let runners_done =
                    tokio::time::timeout(drain_timeout, join_all(runner_tasks)).await.is_ok();
                gateway.inflight().drain(drain_timeout).await && runners_done
            }
            .boxed(),
            flush: async {
                if let Err(e) = governor_task.await {
                    error!(error = %e, "Risk governor task failed");
                }
                if let Some((handle, worker)) = journal {
                    drop(handle);
                    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
                        warn!("Journal worker still delivering at shutdown");
                    }
                }
                store.flush().await.map_err(|e| e.to_string())
            }
            .boxed(),
            close_venues: async {
                gateway.close_all(Duration::ZERO).await;
            }
            .boxed(),
        };

        if let Err(e) = shutdown.execute(steps).await {
            warn!(error = %e, "Shutdown finished with problems");
        }

        let kill_switch = shared.kill_switch().await;
        if kill_switch.engaged {
            warn!(
                reason = kill_switch.reason.as_deref().unwrap_or(""),
                "Engine stopped with the kill switch engaged"
            );
            ExitStatus::KillSwitchEngaged
        } else {
            info!("Engine stopped");
            ExitStatus::Clean
        }
    }
}

fn build_runners(
    config: &AppConfig,
    services: &RuntimeServices,
) -> (Vec<StrategyRunner>, HashMap<String, RunnerHandle>) {
    let strategies = &config.strategies;
    let mut built: Vec<(RunnerSettings, StrategyKind)> = Vec::new();

    if strategies.funding_arb.enabled {
        built.push((
            RunnerSettings::from_section(FUNDING_ARB, &strategies.funding_arb, &config.risk),
            StrategyKind::FundingArb(FundingArb::new(
                strategies.funding_arb.params.clone(),
                config.risk.max_basis_risk,
            )),
        ));
    }
    if strategies.momentum.enabled {
        built.push((
            RunnerSettings::from_section(MOMENTUM, &strategies.momentum, &config.risk),
            StrategyKind::Momentum(Momentum::new(strategies.momentum.params.clone())),
        ));
    }
    if strategies.anomaly.enabled {
        built.push((
            RunnerSettings::from_section(ANOMALY, &strategies.anomaly, &config.risk),
            StrategyKind::Anomaly(AnomalyEntry::new(strategies.anomaly.params.clone())),
        ));
    }

    let mut runners = Vec::new();
    let mut handles = HashMap::new();
    for (settings, strategy) in built {
        let (runner, handle) = StrategyRunner::new(settings, strategy, services.clone());
        handles.insert(handle.strategy_id().to_string(), handle);
        runners.push(runner);
    }
    (runners, handles)
}

/// Periodically forget completed placement keys past their TTL
async fn expire_placements(
    gateway: Arc<ExchangeGateway>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let removed = gateway.cleanup_idempotency();
                if removed > 0 {
                    info!(removed, "Expired idempotency records");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
