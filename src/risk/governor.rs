//! Risk governor: owner and only writer of the kill switch.
//!
//! The governor task re-derives equity from the state store on every
//! evaluation tick (allocations plus unrealized PnL of live positions at
//! feed marks), tracks the day's high-water-mark and engages the kill switch
//! when any trigger fires. Strategies talk to it through [`GovernorHandle`].

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::events::RiskEvent;
use crate::config::RiskConfig;
use crate::coordination::{RetryPolicy, ShutdownSignal};
use crate::domain::{HaltCause, KillSwitchState, Mark, OrderIntent, Position};
use crate::error::{PantherError, RiskError, StoreError};
use crate::persistence::StateStore;
use crate::strategy::feeds::MarketFeed;
use crate::supervisor::AlertManager;

/// Unrealized PnL of `positions` at current feed marks. A symbol without a
/// mark contributes nothing.
pub async fn unrealized_pnl(positions: &[Position], feed: &dyn MarketFeed) -> Decimal {
    let symbols: BTreeSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for symbol in symbols {
        match feed.snapshot(symbol).await {
            Ok(snapshot) => {
                marks.insert(symbol, snapshot.mark());
            }
            Err(e) => warn!(symbol, error = %e, "No mark for symbol, valuing at entry"),
        }
    }

    positions
        .iter()
        .map(|p| {
            marks
                .get(p.symbol.as_str())
                .map(|m| p.unrealized_pnl(m))
                .unwrap_or_default()
        })
        .sum()
}

/// Latest governor view, published after every evaluation
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub kill_switch: KillSwitchState,
    pub equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub high_latency_venues: Vec<String>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl GovernorStatus {
    fn initial() -> Self {
        Self {
            kill_switch: KillSwitchState::new(Utc::now().date_naive()),
            equity: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            high_latency_venues: Vec::new(),
            evaluated_at: None,
        }
    }
}

enum GovernorCommand {
    Reset {
        operator: String,
        reply: oneshot::Sender<Result<KillSwitchState, PantherError>>,
    },
    Evaluate {
        reply: oneshot::Sender<Result<GovernorStatus, PantherError>>,
    },
}

#[derive(Debug, Default)]
struct VenueLatencyWatch {
    high: bool,
    average_ms: u64,
    /// Consecutive evaluation ticks spent above the threshold
    ticks: u32,
}

/// Clonable access to the governor for strategies, the engine and the
/// control server
#[derive(Clone)]
pub struct GovernorHandle {
    store: Arc<dyn StateStore>,
    max_leverage: Decimal,
    commands: mpsc::Sender<GovernorCommand>,
    events: mpsc::Sender<RiskEvent>,
    status: watch::Receiver<GovernorStatus>,
    halted: watch::Receiver<bool>,
}

impl GovernorHandle {
    /// Gate an intent before it reaches the gateway.
    ///
    /// The kill switch is read from the store, not from the cached status,
    /// so a halt written by the governor is visible immediately. Closing
    /// intents are always allowed.
    pub async fn approve(&self, intent: &OrderIntent) -> Result<(), RiskError> {
        if intent.is_closing() {
            return Ok(());
        }

        match self.store.get_kill_switch_state().await {
            Ok(Some(v)) if v.value.engaged => {
                return Err(RiskError::KillSwitchEngaged {
                    reason: v.value.reason.unwrap_or_else(|| "engaged".into()),
                })
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Kill switch unreadable, rejecting new exposure");
                return Err(RiskError::KillSwitchEngaged {
                    reason: format!("kill switch state unavailable: {}", e),
                });
            }
        }

        let equity = match self.store.get_allocation(&intent.strategy_id).await {
            Ok(Some(v)) if v.value.current_equity > Decimal::ZERO => v.value.current_equity,
            Ok(_) => return Err(RiskError::NoAllocation(intent.strategy_id.clone())),
            Err(e) => {
                warn!(error = %e, strategy = %intent.strategy_id, "Allocation unreadable");
                return Err(RiskError::NoAllocation(intent.strategy_id.clone()));
            }
        };

        let existing: Decimal = match self.store.list_open_positions().await {
            Ok(positions) => positions
                .iter()
                .filter(|p| p.strategy_id == intent.strategy_id)
                .map(|p| p.notional())
                .sum(),
            Err(e) => {
                warn!(error = %e, "Open positions unreadable, rejecting new exposure");
                return Err(RiskError::NoAllocation(intent.strategy_id.clone()));
            }
        };

        check_leverage(
            &intent.strategy_id,
            existing + intent.notional(),
            equity,
            self.max_leverage,
        )
    }

    /// Report a basis breach; the governor evaluates immediately
    pub async fn report(&self, event: RiskEvent) {
        if self.events.send(event).await.is_err() {
            warn!("Risk governor stopped, event dropped");
        }
    }

    /// Sender the gateway uses for latency events
    pub fn event_sender(&self) -> mpsc::Sender<RiskEvent> {
        self.events.clone()
    }

    /// Explicit operator reset of the kill switch
    pub async fn reset(&self, operator: &str) -> Result<KillSwitchState, PantherError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(GovernorCommand::Reset {
                operator: operator.to_string(),
                reply,
            })
            .await
            .map_err(|_| PantherError::Internal("risk governor stopped".into()))?;
        rx.await
            .map_err(|_| PantherError::Internal("risk governor dropped reset".into()))?
    }

    /// Run an evaluation now instead of waiting for the next tick
    pub async fn evaluate_now(&self) -> Result<GovernorStatus, PantherError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(GovernorCommand::Evaluate { reply })
            .await
            .map_err(|_| PantherError::Internal("risk governor stopped".into()))?;
        rx.await
            .map_err(|_| PantherError::Internal("risk governor dropped evaluation".into()))?
    }

    pub fn status(&self) -> GovernorStatus {
        self.status.borrow().clone()
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.borrow()
    }

    pub fn halt_signal(&self) -> watch::Receiver<bool> {
        self.halted.clone()
    }
}

/// `exposure / equity <= max_leverage`
pub fn check_leverage(
    strategy_id: &str,
    exposure: Decimal,
    equity: Decimal,
    max_leverage: Decimal,
) -> Result<(), RiskError> {
    if equity <= Decimal::ZERO {
        return Err(RiskError::NoAllocation(strategy_id.to_string()));
    }
    let leverage = exposure / equity;
    if leverage > max_leverage {
        return Err(RiskError::LeverageExceeded {
            strategy_id: strategy_id.to_string(),
            leverage: leverage.round_dp(4),
            max_leverage,
        });
    }
    Ok(())
}

pub struct RiskGovernor {
    config: RiskConfig,
    store: Arc<dyn StateStore>,
    feed: Arc<dyn MarketFeed>,
    alerts: Option<Arc<AlertManager>>,
    cas_policy: RetryPolicy,
    events_rx: mpsc::Receiver<RiskEvent>,
    commands_rx: mpsc::Receiver<GovernorCommand>,
    status_tx: watch::Sender<GovernorStatus>,
    halted_tx: watch::Sender<bool>,
    latency: HashMap<String, VenueLatencyWatch>,
    pending_basis: Vec<HaltCause>,
}

/// Equity derived from store records at feed marks
struct EquityView {
    equity: Decimal,
    unrealized: Decimal,
}

impl RiskGovernor {
    pub fn new(
        config: RiskConfig,
        store: Arc<dyn StateStore>,
        feed: Arc<dyn MarketFeed>,
    ) -> (Self, GovernorHandle) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(GovernorStatus::initial());
        let (halted_tx, halted_rx) = watch::channel(false);

        let handle = GovernorHandle {
            store: Arc::clone(&store),
            max_leverage: config.max_leverage,
            commands: commands_tx,
            events: events_tx,
            status: status_rx,
            halted: halted_rx,
        };

        let governor = Self {
            config,
            store,
            feed,
            alerts: None,
            cas_policy: RetryPolicy::store(),
            events_rx,
            commands_rx,
            status_tx,
            halted_tx,
            latency: HashMap::new(),
            pending_basis: Vec::new(),
        };
        (governor, handle)
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Load or create the kill switch record and publish it before any
    /// strategy starts
    pub async fn initialize(&mut self) -> Result<GovernorStatus, PantherError> {
        let status = self.evaluate(Utc::now()).await?;
        if status.kill_switch.engaged {
            warn!(
                reason = status.kill_switch.reason.as_deref().unwrap_or(""),
                "Kill switch engaged from previous run; new entries blocked until reset"
            );
        }
        Ok(status)
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let period = Duration::from_millis(self.config.evaluation_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.evaluation_interval_ms,
            max_drawdown = %self.config.max_daily_drawdown,
            "Risk governor started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.evaluate(Utc::now()).await {
                        error!(error = %e, "Risk evaluation failed");
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    let immediate = self.on_event(event);
                    if immediate {
                        if let Err(e) = self.evaluate(Utc::now()).await {
                            error!(error = %e, "Risk evaluation failed");
                        }
                    }
                }
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
                _ = shutdown.recv() => {
                    info!("Risk governor: shutdown signal received");
                    break;
                }
            }
        }

        // Last evaluation so the persisted state matches what status reports
        if let Err(e) = self.evaluate(Utc::now()).await {
            warn!(error = %e, "Final risk evaluation failed");
        }
        info!("Risk governor stopped");
    }

    /// Returns true when the event warrants an immediate evaluation
    fn on_event(&mut self, event: RiskEvent) -> bool {
        debug!(kind = event.kind(), "Risk event");
        match event {
            RiskEvent::HighLatency { venue, average_ms } => {
                let watch = self.latency.entry(venue).or_default();
                watch.high = true;
                watch.average_ms = average_ms;
                false
            }
            RiskEvent::LatencyRecovered { venue, average_ms } => {
                let watch = self.latency.entry(venue).or_default();
                watch.high = false;
                watch.average_ms = average_ms;
                watch.ticks = 0;
                false
            }
            RiskEvent::BasisBreach {
                strategy_id,
                symbol,
                basis,
            } => {
                warn!(strategy = %strategy_id, symbol = %symbol, basis = %basis, "Basis breach reported");
                self.pending_basis.push(HaltCause::BasisBreach {
                    strategy_id,
                    symbol,
                    basis,
                    limit: self.config.max_basis_risk,
                });
                true
            }
        }
    }

    async fn on_command(&mut self, command: GovernorCommand) {
        match command {
            GovernorCommand::Reset { operator, reply } => {
                let result = self.reset(&operator, Utc::now()).await;
                let _ = reply.send(result);
            }
            GovernorCommand::Evaluate { reply } => {
                let result = self.evaluate(Utc::now()).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn equity_view(&self) -> Result<EquityView, StoreError> {
        let allocations = self.store.list_allocations().await?;
        let positions = self.store.list_open_positions().await?;
        let unrealized = unrealized_pnl(&positions, self.feed.as_ref()).await;
        let allocated: Decimal = allocations.iter().map(|a| a.current_equity).sum();

        Ok(EquityView {
            equity: allocated + unrealized,
            unrealized,
        })
    }

    fn sustained_latency_causes(&mut self) -> Vec<HaltCause> {
        let required = self.config.sustained_latency_ticks.max(1);
        let threshold_ms = self.config.latency_threshold_ms;
        let mut causes = Vec::new();
        for (venue, watch) in self.latency.iter_mut() {
            if !watch.high {
                watch.ticks = 0;
                continue;
            }
            watch.ticks += 1;
            if watch.ticks >= required {
                causes.push(HaltCause::HighLatency {
                    venue: venue.clone(),
                    avg_latency_ms: watch.average_ms,
                    threshold_ms,
                });
            }
        }
        causes.sort_by_key(|c| c.to_string());
        causes
    }

    /// One evaluation: roll the day if needed, update the high-water-mark,
    /// collect every trigger that fired and persist the result
    async fn evaluate(&mut self, now: DateTime<Utc>) -> Result<GovernorStatus, PantherError> {
        let view = self.equity_view().await?;
        let mut triggers = self.sustained_latency_causes();
        triggers.append(&mut self.pending_basis);

        let config = self.config.clone();
        let today = now.date_naive();
        let equity = view.equity;

        let mut newly_engaged = false;
        let state = self
            .write_kill_switch(|state| {
                newly_engaged = apply_evaluation(state, &config, today, equity, &triggers, now);
            })
            .await?;

        if newly_engaged {
            error!(
                reason = state.reason.as_deref().unwrap_or(""),
                equity = %equity,
                high_water_mark = %state.high_water_mark,
                causes = state.causes.len(),
                "KILL SWITCH ENGAGED"
            );
            if let Some(alerts) = &self.alerts {
                alerts
                    .kill_switch_engaged(state.reason.as_deref().unwrap_or(""), &equity.to_string())
                    .await;
            }
        } else if !triggers.is_empty() {
            debug!(triggers = triggers.len(), "Triggers fired while already halted");
        }

        Ok(self.publish(state, &view, now))
    }

    async fn reset(
        &mut self,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<KillSwitchState, PantherError> {
        let view = self.equity_view().await?;
        self.pending_basis.clear();
        for watch in self.latency.values_mut() {
            watch.ticks = 0;
        }

        let equity = view.equity;
        let operator_name = operator.to_string();
        let state = self
            .write_kill_switch(|state| {
                state.reset(&operator_name, now);
                // Re-base so the drawdown that caused the halt does not re-trigger at once
                state.high_water_mark = equity;
            })
            .await?;

        info!(operator, equity = %equity, "Kill switch reset");
        if let Some(alerts) = &self.alerts {
            alerts
                .warning(
                    "risk_governor",
                    "Kill Switch Reset",
                    &format!("Reset by {}; new entries allowed", operator),
                )
                .await;
        }
        self.publish(state.clone(), &view, now);
        Ok(state)
    }

    /// Compare-and-set loop over the kill switch record
    async fn write_kill_switch<F>(&self, mut mutate: F) -> Result<KillSwitchState, PantherError>
    where
        F: FnMut(&mut KillSwitchState),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.get_kill_switch_state().await?;
            let expected = current.as_ref().map(|v| v.version);
            let mut state = current
                .map(|v| v.value)
                .unwrap_or_else(|| KillSwitchState::new(Utc::now().date_naive()));
            mutate(&mut state);

            match self
                .store
                .set_kill_switch_state(state.clone(), expected)
                .await
            {
                Ok(_) => return Ok(state),
                Err(e) if e.is_conflict() && self.cas_policy.should_retry(attempt) => {
                    debug!(attempt, "Kill switch CAS conflict, re-reading");
                    tokio::time::sleep(self.cas_policy.delay_for(attempt)).await;
                }
                Err(e) if e.is_conflict() => {
                    error!(attempt, "Kill switch CAS retries exhausted");
                    if let Some(alerts) = &self.alerts {
                        alerts.store_split_brain("kill_switch", attempt).await;
                    }
                    return Err(StoreError::RetriesExhausted {
                        key: "kill_switch".into(),
                        attempts: attempt,
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn publish(&self, state: KillSwitchState, view: &EquityView, now: DateTime<Utc>) -> GovernorStatus {
        let mut high_latency_venues: Vec<String> = self
            .latency
            .iter()
            .filter(|(_, w)| w.high)
            .map(|(v, _)| v.clone())
            .collect();
        high_latency_venues.sort();

        let engaged = state.engaged;
        let status = GovernorStatus {
            kill_switch: state,
            equity: view.equity,
            unrealized_pnl: view.unrealized,
            high_latency_venues,
            evaluated_at: Some(now),
        };
        self.halted_tx.send_replace(engaged);
        self.status_tx.send_replace(status.clone());
        status
    }
}

/// Apply one evaluation to the kill switch record; returns true when this
/// evaluation engaged it
fn apply_evaluation(
    state: &mut KillSwitchState,
    config: &RiskConfig,
    today: NaiveDate,
    equity: Decimal,
    triggers: &[HaltCause],
    now: DateTime<Utc>,
) -> bool {
    if state.trading_day != today || state.high_water_mark <= Decimal::ZERO {
        let new_day = state.trading_day != today;
        state.roll_day(today, equity);
        if new_day {
            info!(day = %today, equity = %equity, "New trading day");
            if state.engaged && config.auto_reset_on_new_day {
                state.reset("scheduled", now);
                info!("Kill switch reset by day rollover");
            }
        }
    }

    state.high_water_mark = state.high_water_mark.max(equity);
    state.daily_pnl = equity - state.day_start_equity;

    let mut causes = Vec::new();
    let drawdown = state.drawdown(equity);
    if drawdown > config.max_daily_drawdown {
        causes.push(HaltCause::Drawdown {
            drawdown: drawdown.round_dp(6),
            limit: config.max_daily_drawdown,
            equity,
            high_water_mark: state.high_water_mark,
        });
    }
    causes.extend(triggers.iter().cloned());

    if causes.is_empty() {
        return false;
    }
    state.engage(causes, now)
}
