//! Simulated venue and market used in paper mode and tests.
//!
//! `PaperMarket` holds one snapshot per symbol and can random-walk them.
//! `PaperVenue` fills market orders against those prices in memory and
//! exposes fault injection for lost acks, 5xx responses, auth failures,
//! rejections and artificial latency.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use super::latency::as_millis_u64;
use super::traits::{Balances, VenueConnector, VenuePosition};
use crate::config::{PaperConfig, VenueConfig};
use crate::coordination::ShutdownSignal;
use crate::domain::{MarketKind, MarketSnapshot, OrderSide, OrderStatus, VenueOrder, VenueOrderState};
use crate::error::{ConnError, OrderError};
use crate::strategy::feeds::{MarketFeed, SentimentOracle};

/// In-memory market shared by paper venues and strategies
#[derive(Default)]
pub struct PaperMarket {
    snapshots: RwLock<HashMap<String, MarketSnapshot>>,
}

impl PaperMarket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn from_config(config: &PaperConfig) -> Arc<Self> {
        let mut snapshots = HashMap::new();
        for s in &config.symbols {
            let mut snap = MarketSnapshot::new(&s.symbol, s.price);
            snap.spot_price = Some(s.price / (Decimal::ONE + s.basis));
            snap.funding_rate = Some(s.funding_rate);
            snap.trend_line = Some(s.price);
            snap.open_interest_ratio = Some(Decimal::ONE);
            snap.order_flow_delta = Some(Decimal::ZERO);
            snap.relative_volume = Some(Decimal::ONE);
            snap.price_change = Some(Decimal::ZERO);
            snap.sentiment = Some(dec!(50));
            snapshots.insert(s.symbol.clone(), snap);
        }
        Arc::new(Self {
            snapshots: RwLock::new(snapshots),
        })
    }

    pub async fn set(&self, snapshot: MarketSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.symbol.clone(), snapshot);
    }

    /// Mutate one symbol's snapshot in place
    pub async fn update<F>(&self, symbol: &str, f: F)
    where
        F: FnOnce(&mut MarketSnapshot),
    {
        let mut snapshots = self.snapshots.write().await;
        let snap = snapshots
            .entry(symbol.to_string())
            .or_insert_with(|| MarketSnapshot::new(symbol, Decimal::ZERO));
        f(snap);
        snap.timestamp = Utc::now();
    }

    pub async fn get(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.snapshots.read().await.get(symbol).cloned()
    }

    /// Execution price for a market segment
    pub async fn price(&self, symbol: &str, market: MarketKind) -> Option<Decimal> {
        let snapshots = self.snapshots.read().await;
        let snap = snapshots.get(symbol)?;
        let price = match market {
            MarketKind::Perp => snap.price,
            MarketKind::Spot => snap.spot_price.unwrap_or(snap.price),
        };
        (price > Decimal::ZERO).then_some(price)
    }

    /// Advance every symbol by one random step
    pub async fn step(&self, volatility: f64) {
        let mut snapshots = self.snapshots.write().await;
        let mut rng = rand::thread_rng();
        for snap in snapshots.values_mut() {
            let prev = snap.price;
            let shock = rng.gen_range(-volatility..=volatility);
            let price = prev * decimal(1.0 + shock);
            if price <= Decimal::ZERO {
                continue;
            }

            let basis = snap.basis().unwrap_or_default() + decimal(rng.gen_range(-0.0005..=0.0005));
            let funding = snap.funding_rate.unwrap_or_default()
                + decimal(rng.gen_range(-0.00002..=0.00002));
            let trend = snap.trend_line.unwrap_or(prev);
            let rvol = if rng.gen_bool(0.01) {
                decimal(rng.gen_range(5.0..12.0))
            } else {
                decimal(rng.gen_range(0.5..1.5))
            };

            snap.price = price;
            snap.spot_price = Some(price / (Decimal::ONE + basis.clamp(dec!(-0.05), dec!(0.05))));
            snap.funding_rate = Some(funding.clamp(dec!(-0.003), dec!(0.003)));
            // Slow EMA as the trend line
            snap.trend_line = Some(trend + (price - trend) * dec!(0.1));
            snap.order_flow_delta = Some((price - prev) * rvol);
            snap.open_interest_ratio = Some(decimal(1.0 + rng.gen_range(-0.03..0.08)));
            snap.relative_volume = Some(rvol);
            snap.price_change = Some(
                snap.price_change.unwrap_or_default() * dec!(0.99) + decimal(shock),
            );
            snap.sentiment = Some(decimal(rng.gen_range(30.0..95.0)).round());
            snap.timestamp = Utc::now();
        }
    }

    /// Random-walk prices until shutdown
    pub async fn run_random_walk(
        self: Arc<Self>,
        tick: Duration,
        volatility: Decimal,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) {
        let vol = volatility.to_f64().unwrap_or(0.002).abs();
        let mut interval = tokio::time::interval(tick);
        info!(tick_ms = as_millis_u64(tick), "Paper market simulator started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.step(vol).await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("Paper market simulator stopped");
    }
}

fn decimal(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or_default()
}

#[async_trait]
impl MarketFeed for PaperMarket {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ConnError> {
        self.get(symbol).await.ok_or_else(|| ConnError::Network {
            venue: "paper".into(),
            message: format!("no market data for {}", symbol),
        })
    }
}

#[async_trait]
impl SentimentOracle for PaperMarket {
    async fn score(&self, symbol: &str) -> Result<Option<Decimal>, ConnError> {
        Ok(self.get(symbol).await.and_then(|s| s.sentiment))
    }
}

/// Failure switches for a paper venue
#[derive(Debug, Default)]
pub struct FaultInjector {
    /// Process the next N orders but report a timeout instead of the ack
    drop_acks: AtomicU32,
    /// Fail the next N calls with a 503 before processing
    server_errors: AtomicU32,
    auth_failure: AtomicBool,
    /// Fail the next N balance/position queries with a network error
    query_failures: AtomicU32,
    latency_ms: AtomicU64,
    reject_next: std::sync::Mutex<Option<OrderError>>,
}

impl FaultInjector {
    pub fn drop_next_acks(&self, n: u32) {
        self.drop_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_with_server_error(&self, n: u32) {
        self.server_errors.store(n, Ordering::SeqCst);
    }

    pub fn set_auth_failure(&self, on: bool) {
        self.auth_failure.store(on, Ordering::SeqCst);
    }

    pub fn fail_next_queries(&self, n: u32) {
        self.query_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(as_millis_u64(latency), Ordering::SeqCst);
    }

    pub fn reject_next(&self, error: OrderError) {
        if let Ok(mut slot) = self.reject_next.lock() {
            *slot = Some(error);
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_rejection(&self) -> Option<OrderError> {
        self.reject_next.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PaperPosition {
    size: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    next_order_id: u64,
    orders: HashMap<String, VenueOrderState>,
    positions: HashMap<(String, MarketKind), PaperPosition>,
}

/// Simulated venue filling market orders against a [`PaperMarket`]
pub struct PaperVenue {
    name: String,
    market: Arc<PaperMarket>,
    slippage: Decimal,
    max_account_leverage: Decimal,
    size_step: Decimal,
    state: Mutex<PaperState>,
    faults: FaultInjector,
    submissions: AtomicU64,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>, market: Arc<PaperMarket>, config: &VenueConfig) -> Self {
        Self {
            name: name.into(),
            market,
            slippage: config.paper_slippage_bps / dec!(10000),
            max_account_leverage: config.paper_max_account_leverage,
            size_step: dec!(0.001),
            state: Mutex::new(PaperState {
                cash: config.paper_balance,
                ..Default::default()
            }),
            faults: FaultInjector::default(),
            submissions: AtomicU64::new(0),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Orders the venue accepted, including ones whose ack was dropped
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Orders accepted for client ids starting with `prefix`
    pub async fn orders_with_prefix(&self, prefix: &str) -> Vec<VenueOrderState> {
        let state = self.state.lock().await;
        let mut orders: Vec<_> = state
            .orders
            .values()
            .filter(|o| o.client_order_id.starts_with(prefix))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.client_order_id.cmp(&b.client_order_id));
        orders
    }

    /// Submit attempts that reached the venue
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Force a position, e.g. to simulate exposure opened elsewhere
    pub async fn set_position(&self, symbol: &str, market: MarketKind, size: Decimal, entry: Decimal) {
        let mut state = self.state.lock().await;
        let key = (symbol.to_string(), market);
        if size.is_zero() {
            state.positions.remove(&key);
        } else {
            state.positions.insert(
                key,
                PaperPosition {
                    size,
                    entry_price: entry,
                },
            );
        }
    }

    pub async fn position(&self, symbol: &str, market: MarketKind) -> Decimal {
        let state = self.state.lock().await;
        state
            .positions
            .get(&(symbol.to_string(), market))
            .map(|p| p.size)
            .unwrap_or_default()
    }

    async fn marks(&self, state: &PaperState) -> HashMap<(String, MarketKind), Decimal> {
        let mut marks = HashMap::new();
        for (key, pos) in &state.positions {
            let mark = self
                .market
                .price(&key.0, key.1)
                .await
                .unwrap_or(pos.entry_price);
            marks.insert(key.clone(), mark);
        }
        marks
    }

    async fn equity_and_gross(&self, state: &PaperState) -> (Decimal, Decimal) {
        let marks = self.marks(state).await;
        let mut equity = state.cash;
        let mut gross = Decimal::ZERO;
        for (key, pos) in &state.positions {
            let mark = marks.get(key).copied().unwrap_or(pos.entry_price);
            equity += pos.size * mark;
            gross += pos.size.abs() * mark;
        }
        (equity, gross)
    }

    fn check_ambient_faults(&self) -> Result<(), OrderError> {
        if self.faults.auth_failure.load(Ordering::SeqCst) {
            return Err(ConnError::Auth {
                venue: self.name.clone(),
                message: "invalid signature".into(),
            }
            .into());
        }
        if FaultInjector::take(&self.faults.server_errors) {
            return Err(ConnError::Server {
                venue: self.name.clone(),
                status: 503,
                message: "service unavailable".into(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl VenueConnector for PaperVenue {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn submit_order(&self, order: &VenueOrder) -> Result<VenueOrderState, OrderError> {
        self.faults.delay().await;
        self.check_ambient_faults()?;
        if let Some(rejection) = self.faults.take_rejection() {
            return Err(rejection);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);

        if order.size <= Decimal::ZERO || !(order.size % self.size_step).is_zero() {
            return Err(OrderError::InvalidSymbolPrecision {
                symbol: order.symbol.clone(),
                size: order.size,
            });
        }
        let mark = self
            .market
            .price(&order.symbol, order.market)
            .await
            .ok_or_else(|| OrderError::Rejected(format!("unknown symbol {}", order.symbol)))?;

        let fill_price = match order.side {
            OrderSide::Buy => mark * (Decimal::ONE + self.slippage),
            OrderSide::Sell => mark * (Decimal::ONE - self.slippage),
        };
        if let Some(limit) = order.price_limit {
            let breached = match order.side {
                OrderSide::Buy => fill_price > limit,
                OrderSide::Sell => fill_price < limit,
            };
            if breached {
                return Err(OrderError::SlippageExceeded {
                    limit,
                    actual: fill_price,
                });
            }
        }

        let signed = match order.side {
            OrderSide::Buy => order.size,
            OrderSide::Sell => -order.size,
        };

        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.client_order_id) {
            return Err(OrderError::Rejected(format!(
                "duplicate client order id {}",
                order.client_order_id
            )));
        }

        let key = (order.symbol.clone(), order.market);
        let current = state.positions.get(&key).copied().unwrap_or_default();
        if order.reduce_only {
            let reduces = !current.size.is_zero()
                && current.size.is_sign_positive() != signed.is_sign_positive()
                && current.size.abs() >= order.size;
            if !reduces {
                return Err(OrderError::Rejected(format!(
                    "reduce-only order would increase {} {} exposure",
                    order.symbol, order.market
                )));
            }
        } else {
            let (equity, gross) = self.equity_and_gross(&state).await;
            let new_gross = gross + order.size * fill_price;
            let required = new_gross / self.max_account_leverage;
            if equity <= Decimal::ZERO || required > equity {
                return Err(OrderError::InsufficientMargin {
                    required,
                    available: equity,
                });
            }
        }

        // Apply the fill
        state.cash -= signed * fill_price;
        let new_size = current.size + signed;
        if new_size.is_zero() {
            state.positions.remove(&key);
        } else {
            let entry_price = if current.size.is_zero()
                || current.size.is_sign_positive() != new_size.is_sign_positive()
            {
                fill_price
            } else if current.size.is_sign_positive() == signed.is_sign_positive() {
                (current.size * current.entry_price + signed * fill_price) / new_size
            } else {
                current.entry_price
            };
            state.positions.insert(
                key,
                PaperPosition {
                    size: new_size,
                    entry_price,
                },
            );
        }

        state.next_order_id += 1;
        let ack = VenueOrderState {
            order_id: format!("{}-{}", self.name, state.next_order_id),
            client_order_id: order.client_order_id.clone(),
            status: OrderStatus::Filled,
            filled_size: order.size,
            avg_price: Some(fill_price),
        };
        state
            .orders
            .insert(order.client_order_id.clone(), ack.clone());
        drop(state);

        debug!(
            venue = %self.name,
            client_order_id = %order.client_order_id,
            side = %order.side,
            size = %order.size,
            price = %fill_price,
            "Paper fill"
        );

        if FaultInjector::take(&self.faults.drop_acks) {
            return Err(ConnError::Timeout {
                venue: self.name.clone(),
                elapsed_ms: 0,
            }
            .into());
        }
        Ok(ack)
    }

    async fn order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<VenueOrderState>, OrderError> {
        self.faults.delay().await;
        self.check_ambient_faults()?;
        Ok(self.state.lock().await.orders.get(client_order_id).cloned())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), OrderError> {
        self.faults.delay().await;
        self.check_ambient_faults()?;
        let mut state = self.state.lock().await;
        match state.orders.values_mut().find(|o| o.order_id == order_id) {
            Some(order) if order.status.is_active() => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(OrderError::Rejected(format!("unknown order {}", order_id))),
        }
    }

    async fn balances(&self) -> Result<Balances, ConnError> {
        self.faults.delay().await;
        if FaultInjector::take(&self.faults.query_failures) {
            return Err(ConnError::Network {
                venue: self.name.clone(),
                message: "connection reset".into(),
            });
        }
        let state = self.state.lock().await;
        let (equity, gross) = self.equity_and_gross(&state).await;
        let mut assets = std::collections::BTreeMap::new();
        assets.insert("USDT".to_string(), state.cash);
        Ok(Balances {
            venue: self.name.clone(),
            total_equity: equity,
            available: (equity - gross / self.max_account_leverage).max(Decimal::ZERO),
            assets,
        })
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>, ConnError> {
        self.faults.delay().await;
        if FaultInjector::take(&self.faults.query_failures) {
            return Err(ConnError::Network {
                venue: self.name.clone(),
                message: "connection reset".into(),
            });
        }
        let state = self.state.lock().await;
        let mut positions: Vec<_> = state
            .positions
            .iter()
            .filter(|(_, p)| !p.size.is_zero())
            .map(|((symbol, market), p)| VenuePosition {
                symbol: symbol.clone(),
                market: *market,
                size: p.size,
                entry_price: p.entry_price,
            })
            .collect();
        positions.sort_by(|a, b| (a.symbol.as_str(), a.market as u8).cmp(&(b.symbol.as_str(), b.market as u8)));
        Ok(positions)
    }
}
