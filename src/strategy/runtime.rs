//! Strategy runtime
//!
//! One [`StrategyRunner`] task per enabled strategy. Each cycle walks the
//! strategy's symbols: fetch a snapshot, read the owned position from the
//! store, ask the strategy for a signal, size it, get risk approval and hand
//! the intent to a detached placement task. Placements outlive the cycle
//! timeout so a slow venue never leaves a half-written position; the runner
//! skips a symbol while its placement is pending. An entry whose outcome is
//! unknown is resubmitted under the same key before the symbol trades again.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::feeds::{MarketFeed, SentimentOracle};
use super::sizing::SizingRules;
use super::traits::{Signal, Strategy, StrategyKind};
use crate::adapters::{JournalHandle, TradeRecord};
use crate::config::{RiskConfig, StrategySection};
use crate::coordination::{RetryPolicy, ShutdownSignal};
use crate::domain::{
    Fill, IdempotencyKey, IntentKind, MarketKind, MarketSnapshot, OrderIntent, Position,
    PositionKey, PositionSide, PositionStatus, PriceConstraint,
};
use crate::error::{OrderError, PantherError, RiskError, StoreError};
use crate::exchange::{as_millis_u64, ExchangeGateway};
use crate::persistence::{update_allocation, update_position, StateStore};
use crate::risk::GovernorHandle;
use crate::supervisor::AlertManager;

/// Per-strategy runtime knobs
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub strategy_id: String,
    pub venue: String,
    pub symbols: Vec<String>,
    pub interval: Duration,
    pub cycle_timeout: Duration,
    pub max_slippage: Decimal,
    pub sizing: SizingRules,
    /// Close OPEN positions while the kill switch is engaged
    pub flatten_on_halt: bool,
}

impl RunnerSettings {
    pub fn from_section<P>(strategy_id: &str, section: &StrategySection<P>, risk: &RiskConfig) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            venue: section.venue.clone(),
            symbols: section.symbols.clone(),
            interval: Duration::from_millis(section.interval_ms.max(1)),
            cycle_timeout: Duration::from_millis(section.cycle_timeout_ms.max(1)),
            max_slippage: section.max_slippage,
            sizing: SizingRules {
                target_leverage: section.target_leverage,
                max_leverage: risk.max_leverage,
                size_step: section.size_step,
                min_notional: section.min_notional,
                slots: section.symbols.len(),
            },
            flatten_on_halt: risk.flatten_on_halt,
        }
    }
}

/// Shared services handed to every runner
#[derive(Clone)]
pub struct RuntimeServices {
    pub store: Arc<dyn StateStore>,
    pub gateway: Arc<ExchangeGateway>,
    pub governor: GovernorHandle,
    pub feed: Arc<dyn MarketFeed>,
    pub sentiment: Option<Arc<dyn SentimentOracle>>,
    pub journal: Option<JournalHandle>,
    pub alerts: Option<Arc<AlertManager>>,
    pub cas_policy: RetryPolicy,
}

pub enum RunnerCommand {
    /// Operator-requested exit of one symbol
    Exit {
        symbol: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
}

/// Control-plane access to a running strategy
#[derive(Clone)]
pub struct RunnerHandle {
    strategy_id: String,
    tx: mpsc::Sender<RunnerCommand>,
}

impl RunnerHandle {
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub async fn trigger_exit(&self, symbol: &str) -> Result<String, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RunnerCommand::Exit {
                symbol: symbol.to_string(),
                reply,
            })
            .await
            .map_err(|_| format!("strategy {} is not running", self.strategy_id))?;
        rx.await
            .map_err(|_| format!("strategy {} dropped the request", self.strategy_id))?
    }
}

/// Intent plus what is needed to persist its fill
struct PlacementJob {
    intent: OrderIntent,
    /// Market of the primary leg
    market: MarketKind,
}

struct PlacementOutcome {
    symbol: String,
    intent: OrderIntent,
    result: Result<Fill, OrderError>,
}

pub struct StrategyRunner {
    settings: RunnerSettings,
    strategy: StrategyKind,
    services: RuntimeServices,
    commands: mpsc::Receiver<RunnerCommand>,
    outcomes_tx: mpsc::Sender<PlacementOutcome>,
    outcomes_rx: mpsc::Receiver<PlacementOutcome>,
    pending: HashSet<String>,
    cooldown: HashMap<String, Instant>,
    /// Entries that may have filled on the venue, by symbol
    unresolved: HashMap<String, OrderIntent>,
}

impl StrategyRunner {
    pub fn new(
        settings: RunnerSettings,
        strategy: StrategyKind,
        services: RuntimeServices,
    ) -> (Self, RunnerHandle) {
        let (tx, commands) = mpsc::channel(16);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(64);
        let handle = RunnerHandle {
            strategy_id: settings.strategy_id.clone(),
            tx,
        };
        let runner = Self {
            settings,
            strategy,
            services,
            commands,
            outcomes_tx,
            outcomes_rx,
            pending: HashSet::new(),
            cooldown: HashMap::new(),
            unresolved: HashMap::new(),
        };
        (runner, handle)
    }

    pub fn strategy(&self) -> &StrategyKind {
        &self.strategy
    }

    pub fn pending_placements(&self) -> usize {
        self.pending.len()
    }

    pub fn unresolved_entries(&self) -> usize {
        self.unresolved.len()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut tick = tokio::time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            strategy = %self.settings.strategy_id,
            symbols = ?self.settings.symbols,
            interval_ms = as_millis_u64(self.settings.interval),
            "Strategy runner started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => self.run_cycle().await,
                Some(outcome) = self.outcomes_rx.recv() => self.on_outcome(outcome),
                Some(command) = self.commands.recv() => self.on_command(command).await,
                _ = shutdown.recv() => {
                    info!(strategy = %self.settings.strategy_id, "Strategy runner: shutdown signal received");
                    break;
                }
            }
        }

        // Let in-flight placements report back so strategy state sees their fills
        let settled = self.settle(self.settings.cycle_timeout).await;
        if !settled {
            warn!(
                strategy = %self.settings.strategy_id,
                pending = self.pending.len(),
                "Runner stopped with placements still pending"
            );
        }
        info!(strategy = %self.settings.strategy_id, "Strategy runner stopped");
    }

    /// One pass over every symbol of the strategy
    pub async fn run_cycle(&mut self) {
        let now = Instant::now();
        self.cooldown.retain(|_, until| *until > now);

        for symbol in self.settings.symbols.clone() {
            if self.pending.contains(&symbol) {
                debug!(strategy = %self.settings.strategy_id, symbol = %symbol, "Placement pending, skipping");
                continue;
            }
            if self.cooldown.contains_key(&symbol) {
                debug!(strategy = %self.settings.strategy_id, symbol = %symbol, "Backing off after rate limit");
                continue;
            }

            match tokio::time::timeout(self.settings.cycle_timeout, self.evaluate_symbol(&symbol)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.on_cycle_error(&symbol, e).await,
                Err(_) => {
                    warn!(
                        strategy = %self.settings.strategy_id,
                        symbol = %symbol,
                        timeout_ms = as_millis_u64(self.settings.cycle_timeout),
                        "Strategy cycle timed out"
                    );
                    self.strategy.on_timeout(&symbol);
                }
            }
        }
    }

    /// Wait until every pending placement has reported back
    pub async fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.outcomes_rx.recv()).await {
                Ok(Some(outcome)) => self.on_outcome(outcome),
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    async fn on_cycle_error(&self, symbol: &str, e: PantherError) {
        warn!(strategy = %self.settings.strategy_id, symbol, error = %e, "Strategy cycle failed");
        if let PantherError::Store(StoreError::RetriesExhausted { key, attempts }) = &e {
            if let Some(alerts) = &self.services.alerts {
                alerts.store_split_brain(key, *attempts).await;
            }
        }
    }

    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, PantherError> {
        let mut snapshot = self.services.feed.snapshot(symbol).await?;
        if self.strategy.needs_sentiment() && snapshot.sentiment.is_none() {
            if let Some(oracle) = &self.services.sentiment {
                match oracle.score(symbol).await {
                    Ok(score) => snapshot.sentiment = score,
                    Err(e) => warn!(symbol, error = %e, "Sentiment score unavailable"),
                }
            }
        }
        Ok(snapshot)
    }

    async fn load_position(&self, symbol: &str) -> Result<Option<Position>, PantherError> {
        let key = PositionKey::new(&self.settings.strategy_id, symbol);
        Ok(self
            .services
            .store
            .get_position(&key)
            .await?
            .map(|v| v.value))
    }

    async fn evaluate_symbol(&mut self, symbol: &str) -> Result<(), PantherError> {
        let snapshot = self.snapshot(symbol).await?;
        let position = self.load_position(symbol).await?;

        if let Some(intent) = self.unresolved.remove(symbol) {
            if position.is_none() {
                // Same key: the gateway looks the order up before sending anything
                info!(
                    strategy = %self.settings.strategy_id,
                    symbol,
                    key = %intent.idempotency_key,
                    "Resolving entry with unknown outcome"
                );
                let market = intent.side.primary_market(intent.long_market);
                self.spawn_placement(PlacementJob { intent, market });
                return Ok(());
            }
        }

        if let Some(p) = position.as_ref().filter(|p| p.status == PositionStatus::Closing) {
            let reason = p.close_reason.clone().unwrap_or_else(|| "resume exit".into());
            return self.begin_exit(p.clone(), &snapshot, reason).await;
        }

        if self.settings.flatten_on_halt && self.services.governor.is_halted() {
            if let Some(p) = position.clone() {
                info!(strategy = %self.settings.strategy_id, symbol, "Kill switch engaged, flattening");
                return self.begin_exit(p, &snapshot, "kill switch engaged".into()).await;
            }
        }

        let signal = self
            .strategy
            .generate_signal(&snapshot, position.as_ref(), Utc::now());
        for event in self.strategy.drain_risk_reports() {
            self.services.governor.report(event).await;
        }

        match signal {
            None => Ok(()),
            Some(Signal::Exit { reason }) => match position {
                Some(p) => self.begin_exit(p, &snapshot, reason).await,
                None => Ok(()),
            },
            Some(Signal::Enter {
                side,
                long_market,
                reason,
            }) => {
                if position.is_some() {
                    return Ok(());
                }
                self.begin_entry(&snapshot, side, long_market, reason).await
            }
        }
    }

    async fn begin_entry(
        &mut self,
        snapshot: &MarketSnapshot,
        side: PositionSide,
        long_market: MarketKind,
        reason: String,
    ) -> Result<(), PantherError> {
        let strategy_id = self.settings.strategy_id.clone();
        let allocation = self
            .services
            .store
            .get_allocation(&strategy_id)
            .await?
            .ok_or_else(|| RiskError::NoAllocation(strategy_id.clone()))?;

        let market = side.primary_market(long_market);
        let price = snapshot.price_for(market);
        let Some(size) = self
            .settings
            .sizing
            .size_for(allocation.value.current_equity, price)
        else {
            debug!(strategy = %strategy_id, symbol = %snapshot.symbol, "Entry below minimum notional, skipping");
            return Ok(());
        };

        let intent = OrderIntent {
            strategy_id: strategy_id.clone(),
            venue: self.settings.venue.clone(),
            symbol: snapshot.symbol.clone(),
            side,
            kind: IntentKind::Open,
            long_market,
            size,
            reference_price: price,
            hedge_reference_price: (side == PositionSide::Hedge)
                .then_some(snapshot.spot_price)
                .flatten(),
            price_constraint: PriceConstraint::Market {
                max_slippage: self.settings.max_slippage,
            },
            idempotency_key: IdempotencyKey::generate(&strategy_id),
            reason,
        };

        if let Err(e) = self.services.governor.approve(&intent).await {
            warn!(
                strategy = %strategy_id,
                symbol = %intent.symbol,
                size = %intent.size,
                error = %e,
                "Intent rejected by risk governor"
            );
            if let Some(alerts) = &self.services.alerts {
                alerts
                    .warning(
                        &format!("strategy:{}", strategy_id),
                        "Intent Rejected",
                        &format!("{} {}: {}", intent.side, intent.symbol, e),
                    )
                    .await;
            }
            return Ok(());
        }

        info!(
            strategy = %strategy_id,
            symbol = %intent.symbol,
            side = %intent.side,
            size = %intent.size,
            price = %price,
            reason = %intent.reason,
            "Entering position"
        );
        self.spawn_placement(PlacementJob { intent, market });
        Ok(())
    }

    /// Move the position to CLOSING and place the exit
    async fn begin_exit(
        &mut self,
        position: Position,
        snapshot: &MarketSnapshot,
        reason: String,
    ) -> Result<(), PantherError> {
        let position = if position.status == PositionStatus::Open {
            let key = position.key();
            let marked = update_position(
                self.services.store.as_ref(),
                &key,
                &self.services.cas_policy,
                |current| {
                    let current = current.filter(|p| p.status == PositionStatus::Open)?;
                    let mut next = current.clone();
                    next.transition(PositionStatus::Closing).ok()?;
                    next.close_reason = Some(reason.clone());
                    Some(next)
                },
            )
            .await?;
            match marked {
                Some(p) => p,
                // Someone else moved it; act on what the store says now
                None => match self.load_position(&position.symbol).await? {
                    Some(p) if p.status == PositionStatus::Closing => p,
                    _ => return Ok(()),
                },
            }
        } else {
            position
        };

        let market = position.market;
        let intent = OrderIntent {
            strategy_id: position.strategy_id.clone(),
            venue: position.venue.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            kind: IntentKind::Close,
            long_market: position.market,
            size: position.size,
            reference_price: snapshot.price_for(market),
            hedge_reference_price: (position.side == PositionSide::Hedge)
                .then_some(snapshot.spot_price)
                .flatten(),
            price_constraint: PriceConstraint::Market {
                max_slippage: self.settings.max_slippage,
            },
            idempotency_key: close_key(&position),
            reason: reason.clone(),
        };

        // Closing intents are never refused; the call keeps every intent on one path
        self.services.governor.approve(&intent).await?;

        info!(
            strategy = %position.strategy_id,
            symbol = %position.symbol,
            size = %position.size,
            reason = %reason,
            "Exiting position"
        );
        self.spawn_placement(PlacementJob { intent, market });
        Ok(())
    }

    fn spawn_placement(&mut self, job: PlacementJob) {
        let symbol = job.intent.symbol.clone();
        self.pending.insert(symbol.clone());
        let services = self.services.clone();
        let tx = self.outcomes_tx.clone();

        tokio::spawn(async move {
            // Hold the drain open until the fill is persisted, not just placed
            let Some(_guard) = services.gateway.inflight().enter() else {
                let _ = tx
                    .send(PlacementOutcome {
                        symbol,
                        intent: job.intent,
                        result: Err(OrderError::Blocked("gateway is shutting down".into())),
                    })
                    .await;
                return;
            };

            let result = services.gateway.place_order(&job.intent).await;
            if let Ok(fill) = &result {
                if let Err(e) = apply_fill(&services, &job, fill).await {
                    error!(
                        key = %job.intent.idempotency_key,
                        error = %e,
                        "Fill executed but not persisted; reconciliation will repair"
                    );
                    if let (StoreError::RetriesExhausted { key, attempts }, Some(alerts)) =
                        (&e, &services.alerts)
                    {
                        alerts.store_split_brain(key, *attempts).await;
                    }
                }
            }
            let _ = tx
                .send(PlacementOutcome {
                    symbol,
                    intent: job.intent,
                    result,
                })
                .await;
        });
    }

    fn on_outcome(&mut self, outcome: PlacementOutcome) {
        self.pending.remove(&outcome.symbol);
        match outcome.result {
            Ok(fill) => self.strategy.on_fill(&fill),
            Err(e) if e.is_ambiguous() && outcome.intent.kind == IntentKind::Open => {
                warn!(
                    strategy = %self.settings.strategy_id,
                    symbol = %outcome.symbol,
                    key = %outcome.intent.idempotency_key,
                    error = %e,
                    "Entry outcome unknown, resolving next cycle"
                );
                self.unresolved.insert(outcome.symbol, outcome.intent);
            }
            Err(e) if e.is_rate_limited() => {
                warn!(strategy = %self.settings.strategy_id, symbol = %outcome.symbol, error = %e, "Rate limited, backing off");
                self.cooldown
                    .insert(outcome.symbol, Instant::now() + self.settings.interval);
            }
            Err(e) => {
                warn!(strategy = %self.settings.strategy_id, symbol = %outcome.symbol, error = %e, "Placement failed, cycle skipped");
            }
        }
    }

    async fn on_command(&mut self, command: RunnerCommand) {
        match command {
            RunnerCommand::Exit { symbol, reply } => {
                let result = self.external_exit(&symbol).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn external_exit(&mut self, symbol: &str) -> Result<String, String> {
        if !self.settings.symbols.iter().any(|s| s == symbol) {
            return Err(format!(
                "{} does not trade {}",
                self.settings.strategy_id, symbol
            ));
        }
        if self.pending.contains(symbol) {
            return Err(format!("placement already in progress for {}", symbol));
        }
        let position = self
            .load_position(symbol)
            .await
            .map_err(|e| e.to_string())?
            .filter(|p| p.is_live())
            .ok_or_else(|| format!("no open position on {}", symbol))?;

        info!(strategy = %self.settings.strategy_id, symbol, "External exit trigger");
        let result = if self.strategy.on_external_trigger(symbol) {
            self.evaluate_symbol(symbol).await
        } else {
            match self.snapshot(symbol).await {
                Ok(snapshot) => {
                    self.begin_exit(position, &snapshot, "external trigger".into())
                        .await
                }
                Err(e) => Err(e),
            }
        };
        result.map_err(|e| e.to_string())?;

        if self.pending.contains(symbol) {
            Ok(format!("closing {}", symbol))
        } else {
            Err(format!("no exit placed for {}", symbol))
        }
    }
}

/// Deterministic key so a retried exit of the same position reuses it
fn close_key(position: &Position) -> IdempotencyKey {
    IdempotencyKey::new(format!(
        "close-{}-{}-{}-{}",
        position.strategy_id,
        position.symbol,
        position.opened_at.timestamp_millis(),
        position.size.normalize()
    ))
}

/// Persist a confirmed fill: open a position, or close (fully or partly) the
/// one being exited, credit realized PnL to the allocation and journal it
async fn apply_fill(
    services: &RuntimeServices,
    job: &PlacementJob,
    fill: &Fill,
) -> Result<(), StoreError> {
    let store = services.store.as_ref();
    let policy = &services.cas_policy;
    let key = PositionKey::new(&fill.strategy_id, &fill.symbol);

    match fill.kind {
        IntentKind::Open => {
            let opened = Position::from_fill(fill, job.market);
            let written = update_position(store, &key, policy, |current| match current {
                Some(p) if p.is_live() => None,
                _ => Some(opened.clone()),
            })
            .await?;
            match written {
                Some(p) => info!(
                    position = %key,
                    side = %p.side,
                    size = %p.size,
                    entry = %p.entry_price,
                    "Position opened"
                ),
                None => error!(position = %key, "Live position already recorded; entry fill not stored"),
            }
        }
        IntentKind::Close => {
            let mut closed_part: Option<(Position, Decimal)> = None;
            let reason = job.intent.reason.clone();
            update_position(store, &key, policy, |current| {
                closed_part = None;
                let current = current.filter(|p| p.is_live())?;
                let mut next = current.clone();
                if fill.size < current.size {
                    let mut part = current.clone();
                    part.size = fill.size;
                    let pnl = part.pnl_at(fill.price, fill.hedge_price);
                    next.size = current.size - fill.size;
                    closed_part = Some((part, pnl));
                } else {
                    let pnl = next
                        .close_with(fill.price, fill.hedge_price, reason.clone(), fill.filled_at)
                        .ok()?;
                    closed_part = Some((next.clone(), pnl));
                }
                Some(next)
            })
            .await?;

            let Some((position, pnl)) = closed_part else {
                warn!(position = %key, "Exit fill for a position that is no longer live");
                return Ok(());
            };
            info!(
                position = %key,
                size = %fill.size,
                exit = %fill.price,
                pnl = %pnl,
                "Position closed"
            );

            update_allocation(store, &fill.strategy_id, policy, |current| {
                current.map(|a| {
                    let mut a = a.clone();
                    a.apply_realized(pnl);
                    a
                })
            })
            .await?;

            if let Some(journal) = &services.journal {
                journal.record(TradeRecord {
                    record_id: Uuid::new_v4(),
                    strategy: fill.strategy_id.clone(),
                    symbol: fill.symbol.clone(),
                    side: position.side,
                    size: fill.size,
                    entry_price: position.entry_price,
                    exit_price: fill.price,
                    pnl,
                    opened_at: position.opened_at,
                    closed_at: fill.filled_at,
                    metadata: serde_json::json!({
                        "reason": job.intent.reason,
                        "venue": fill.venue,
                        "hedge_entry_price": position.hedge_entry_price,
                        "hedge_exit_price": fill.hedge_price,
                        "order_id": fill.primary_order_id(),
                    }),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MomentumParams, VenueConfig};
    use crate::domain::{Allocation, HaltCause, KillSwitchState};
    use crate::exchange::{GatewaySettings, PaperMarket, PaperVenue};
    use crate::persistence::MemoryStateStore;
    use crate::risk::RiskGovernor;
    use crate::strategy::momentum::Momentum;
    use rust_decimal_macros::dec;

    struct Harness {
        runner: StrategyRunner,
        handle: RunnerHandle,
        store: Arc<MemoryStateStore>,
        market: Arc<PaperMarket>,
        venue: Arc<PaperVenue>,
        _governor: RiskGovernor,
    }

    fn breakout(price: Decimal, trend: Decimal) -> MarketSnapshot {
        let mut s = MarketSnapshot::new("SOLUSDT", price);
        s.trend_line = Some(trend);
        s.open_interest_ratio = Some(dec!(1.2));
        s.order_flow_delta = Some(dec!(10));
        s
    }

    async fn harness() -> Harness {
        harness_with(GatewaySettings::default()).await
    }

    async fn harness_with(gateway_settings: GatewaySettings) -> Harness {
        let store = Arc::new(MemoryStateStore::new());
        store
            .put_allocation(Allocation::new("momentum", dec!(1), dec!(10000)), None)
            .await
            .unwrap();
        let market = PaperMarket::new();
        market.set(breakout(dec!(100), dec!(95))).await;

        let venue_config = VenueConfig::default();
        let venue = Arc::new(PaperVenue::new("paper", market.clone(), &venue_config));
        let gateway = Arc::new(
            ExchangeGateway::new(gateway_settings).with_venue(venue.clone(), &venue_config),
        );
        let (governor, governor_handle) =
            RiskGovernor::new(RiskConfig::default(), store.clone(), market.clone());

        let settings = RunnerSettings {
            strategy_id: "momentum".into(),
            venue: "paper".into(),
            symbols: vec!["SOLUSDT".into()],
            interval: Duration::from_millis(50),
            cycle_timeout: Duration::from_secs(1),
            max_slippage: dec!(0.01),
            sizing: SizingRules {
                target_leverage: dec!(1),
                max_leverage: dec!(5),
                size_step: dec!(0.001),
                min_notional: dec!(10),
                slots: 1,
            },
            flatten_on_halt: true,
        };
        let services = RuntimeServices {
            store: store.clone(),
            gateway,
            governor: governor_handle,
            feed: market.clone(),
            sentiment: None,
            journal: None,
            alerts: None,
            cas_policy: RetryPolicy::store(),
        };
        let (runner, handle) = StrategyRunner::new(
            settings,
            StrategyKind::Momentum(Momentum::new(MomentumParams::default())),
            services,
        );
        Harness {
            runner,
            handle,
            store,
            market,
            venue,
            _governor: governor,
        }
    }

    fn key() -> PositionKey {
        PositionKey::new("momentum", "SOLUSDT")
    }

    #[tokio::test]
    async fn test_entry_then_trend_reversal_exit() {
        let mut h = harness().await;

        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);

        let opened = h.store.get_position(&key()).await.unwrap().unwrap().value;
        assert_eq!(opened.status, PositionStatus::Open);
        assert_eq!(opened.side, PositionSide::Long);
        // 10000 equity at 1x over one symbol at 100
        assert_eq!(opened.size, dec!(100));
        assert_eq!(h.venue.position("SOLUSDT", MarketKind::Perp).await, dec!(100));

        h.market.set(breakout(dec!(90), dec!(95))).await;
        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);

        assert!(h.store.get_position(&key()).await.unwrap().is_none());
        let closed = h.store.list_closed_positions(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, PositionStatus::Closed);
        let pnl = closed[0].realized_pnl.unwrap();
        assert!(pnl < Decimal::ZERO);

        let allocation = h.store.get_allocation("momentum").await.unwrap().unwrap().value;
        assert_eq!(allocation.current_equity, dec!(10000) + pnl);
        assert_eq!(h.venue.position("SOLUSDT", MarketKind::Perp).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_entry_lost_in_timeouts_is_resolved_with_same_key() {
        // One attempt per placement: a dropped ack exhausts the gateway's retries
        let mut h = harness_with(GatewaySettings {
            fill_poll_interval: Duration::from_millis(5),
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        })
        .await;
        h.venue.faults().drop_next_acks(1);

        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);
        // The venue filled the order but the runner never heard back
        assert!(h.store.get_position(&key()).await.unwrap().is_none());
        assert_eq!(h.venue.position("SOLUSDT", MarketKind::Perp).await, dec!(100));
        assert_eq!(h.runner.unresolved_entries(), 1);

        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);

        assert_eq!(h.runner.unresolved_entries(), 0);
        assert_eq!(h.venue.submissions(), 1);
        assert_eq!(h.venue.order_count().await, 1);
        let opened = h.store.get_position(&key()).await.unwrap().unwrap().value;
        assert_eq!(opened.status, PositionStatus::Open);
        assert_eq!(opened.size, dec!(100));
        assert_eq!(h.venue.position("SOLUSDT", MarketKind::Perp).await, dec!(100));

        // Position recorded: further cycles place nothing new
        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);
        assert_eq!(h.venue.submissions(), 1);
    }

    #[tokio::test]
    async fn test_definite_rejection_is_not_resubmitted() {
        let mut h = harness().await;
        h.venue.faults().reject_next(OrderError::InsufficientMargin {
            required: dec!(10000),
            available: dec!(0),
        });

        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);
        assert_eq!(h.runner.unresolved_entries(), 0);
        assert!(h.store.get_position(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engaged_kill_switch_blocks_entry() {
        let mut h = harness().await;
        let mut state = KillSwitchState::new(Utc::now().date_naive());
        state.engage(
            vec![HaltCause::HighLatency {
                venue: "paper".into(),
                avg_latency_ms: 900,
                threshold_ms: 500,
            }],
            Utc::now(),
        );
        h.store.set_kill_switch_state(state, None).await.unwrap();

        h.runner.run_cycle().await;
        assert_eq!(h.runner.pending_placements(), 0);
        assert!(h.store.get_position(&key()).await.unwrap().is_none());
        assert_eq!(h.venue.submissions(), 0);
    }

    #[tokio::test]
    async fn test_closing_position_resumes_exit() {
        let mut h = harness().await;
        h.venue
            .set_position("SOLUSDT", MarketKind::Perp, dec!(10), dec!(100))
            .await;
        let position = Position {
            strategy_id: "momentum".into(),
            symbol: "SOLUSDT".into(),
            venue: "paper".into(),
            side: PositionSide::Long,
            market: MarketKind::Perp,
            size: dec!(10),
            entry_price: dec!(100),
            hedge_entry_price: None,
            opened_at: Utc::now(),
            status: PositionStatus::Closing,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: Some("trailing stop".into()),
        };
        h.store.put_position(position, None).await.unwrap();

        h.runner.run_cycle().await;
        assert!(h.runner.settle(Duration::from_secs(2)).await);

        assert!(h.store.get_position(&key()).await.unwrap().is_none());
        let closed = h.store.list_closed_positions(1).await.unwrap();
        assert_eq!(closed[0].close_reason.as_deref(), Some("trailing stop"));
    }

    #[tokio::test]
    async fn test_external_exit_without_position_is_refused() {
        let h = harness().await;
        // No indicators, so the running loop never enters on its own
        h.market.set(MarketSnapshot::new("SOLUSDT", dec!(100))).await;
        let handle = h.handle.clone();
        let (_tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(h.runner.run(rx));

        let err = handle.trigger_exit("SOLUSDT").await.unwrap_err();
        assert!(err.contains("no open position"));
        let err = handle.trigger_exit("DOGEUSDT").await.unwrap_err();
        assert!(err.contains("does not trade"));
        task.abort();
    }

    #[test]
    fn test_close_key_is_stable_for_a_position() {
        let opened_at = Utc::now();
        let mut p = Position {
            strategy_id: "momentum".into(),
            symbol: "SOLUSDT".into(),
            venue: "paper".into(),
            side: PositionSide::Long,
            market: MarketKind::Perp,
            size: dec!(1.50),
            entry_price: dec!(100),
            hedge_entry_price: None,
            opened_at,
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: None,
        };
        let first = close_key(&p);
        p.status = PositionStatus::Closing;
        assert_eq!(first, close_key(&p));
        p.size = dec!(0.5);
        assert_ne!(first, close_key(&p));
    }
}
