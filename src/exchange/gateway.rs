//! Exchange gateway: the single path from strategies to venues.
//!
//! Every placement goes through here so that rate limits, idempotency,
//! bounded retries and latency tracking apply uniformly. A placement is
//! keyed by its idempotency key; an ambiguous failure (timeout) is followed
//! by an order lookup by client id before anything is re-sent, so a retry
//! never produces a second live order.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::idempotency::{IdempotencyResult, PlacementRegistry};
use super::latency::{as_millis_u64, LatencyTracker, LatencyTransition};
use super::rate_limit::TokenBucket;
use super::traits::{Balances, VenueConnector, VenuePosition};
use crate::config::{GatewayConfig, RiskConfig, VenueConfig};
use crate::coordination::{InFlightTracker, RetryPolicy};
use crate::domain::{
    Fill, IntentKind, LegFill, MarketKind, OrderIntent, OrderSide, OrderStatus,
    PositionSide, VenueOrder, VenueOrderState,
};
use crate::error::{ConnError, OrderError};
use crate::risk::RiskEvent;

/// Timing knobs for the gateway
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub call_timeout: Duration,
    pub fill_timeout: Duration,
    pub fill_poll_interval: Duration,
    pub rate_limit_max_wait: Duration,
    pub latency_window: usize,
    pub latency_threshold: Duration,
    pub idempotency_ttl_secs: u64,
    pub retry: RetryPolicy,
}

impl GatewaySettings {
    pub fn from_config(gateway: &GatewayConfig, risk: &RiskConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(gateway.call_timeout_ms),
            fill_timeout: Duration::from_millis(gateway.fill_timeout_ms),
            fill_poll_interval: Duration::from_millis(gateway.fill_poll_interval_ms),
            rate_limit_max_wait: Duration::from_millis(gateway.rate_limit_max_wait_ms),
            latency_window: gateway.latency_window,
            latency_threshold: Duration::from_millis(risk.latency_threshold_ms),
            idempotency_ttl_secs: gateway.idempotency_ttl_secs,
            retry: gateway.retry.clone(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default(), &RiskConfig::default())
    }
}

/// Per-venue latency view for status reporting
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VenueLatency {
    pub venue: String,
    pub average_ms: u64,
    pub high: bool,
}

struct VenueSession {
    connector: Arc<dyn VenueConnector>,
    bucket: TokenBucket,
    latency: Mutex<LatencyTracker>,
}

/// One order of a placement
#[derive(Debug, Clone)]
struct LegSpec {
    order: VenueOrder,
    /// New exposure; refused while the kill switch is engaged
    opening: bool,
}

pub struct ExchangeGateway {
    sessions: HashMap<String, Arc<VenueSession>>,
    registry: PlacementRegistry,
    settings: GatewaySettings,
    inflight: Arc<InFlightTracker>,
    halted: Option<watch::Receiver<bool>>,
    risk_events: Option<mpsc::Sender<RiskEvent>>,
}

impl ExchangeGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            sessions: HashMap::new(),
            registry: PlacementRegistry::new(settings.idempotency_ttl_secs),
            settings,
            inflight: InFlightTracker::new(),
            halted: None,
            risk_events: None,
        }
    }

    /// Register a venue connector with its rate limit
    pub fn with_venue(mut self, connector: Arc<dyn VenueConnector>, config: &VenueConfig) -> Self {
        let name = connector.venue().to_string();
        let session = VenueSession {
            connector,
            bucket: TokenBucket::new(config.rate_limit_burst, config.rate_limit_per_sec),
            latency: Mutex::new(LatencyTracker::new(
                self.settings.latency_window,
                self.settings.latency_threshold,
            )),
        };
        self.sessions.insert(name, Arc::new(session));
        self
    }

    /// Kill switch flag published by the risk governor
    pub fn with_halt_signal(mut self, halted: watch::Receiver<bool>) -> Self {
        self.halted = Some(halted);
        self
    }

    pub fn with_risk_events(mut self, tx: mpsc::Sender<RiskEvent>) -> Self {
        self.risk_events = Some(tx);
        self
    }

    pub fn venues(&self) -> Vec<String> {
        let mut venues: Vec<_> = self.sessions.keys().cloned().collect();
        venues.sort();
        venues
    }

    pub fn inflight(&self) -> Arc<InFlightTracker> {
        Arc::clone(&self.inflight)
    }

    pub fn latency_snapshot(&self) -> Vec<VenueLatency> {
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .map(|(venue, session)| {
                let (average, high) = session
                    .latency
                    .lock()
                    .map(|t| (t.average(), t.is_high()))
                    .unwrap_or((Duration::ZERO, false));
                VenueLatency {
                    venue: venue.clone(),
                    average_ms: as_millis_u64(average),
                    high,
                }
            })
            .collect();
        out.sort_by(|a, b| a.venue.cmp(&b.venue));
        out
    }

    /// Drop settled idempotency records past their TTL
    pub fn cleanup_idempotency(&self) -> usize {
        self.registry.cleanup_expired()
    }

    fn is_halted(&self) -> bool {
        self.halted.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn session(&self, venue: &str) -> Result<Arc<VenueSession>, ConnError> {
        self.sessions
            .get(venue)
            .cloned()
            .ok_or_else(|| ConnError::UnknownVenue(venue.to_string()))
    }

    /// Execute an intent and wait for its fill.
    ///
    /// Re-submitting an intent whose key already completed returns the
    /// recorded fill without touching the venue.
    #[instrument(skip(self, intent), fields(key = %intent.idempotency_key, strategy = %intent.strategy_id, symbol = %intent.symbol))]
    pub async fn place_order(&self, intent: &OrderIntent) -> Result<Fill, OrderError> {
        let _guard = self
            .inflight
            .enter()
            .ok_or_else(|| OrderError::Blocked("gateway is shutting down".into()))?;
        let session = self.session(&intent.venue)?;

        if intent.size <= Decimal::ZERO {
            return Err(OrderError::Rejected(format!(
                "non-positive size {} for {}",
                intent.size, intent.symbol
            )));
        }

        let recovering = match self.registry.check_or_create(intent) {
            IdempotencyResult::New => false,
            IdempotencyResult::Recover { previous_error } => {
                info!(previous_error = %previous_error, "Resuming placement after earlier failure");
                true
            }
            IdempotencyResult::Completed(fill) => return Ok(fill),
            IdempotencyResult::InFlight => {
                return Err(OrderError::Blocked(format!(
                    "placement {} already in flight",
                    intent.idempotency_key
                )))
            }
            IdempotencyResult::Conflict => {
                return Err(OrderError::IdempotencyConflict {
                    key: intent.idempotency_key.to_string(),
                })
            }
        };

        if !intent.is_closing() && !recovering && self.is_halted() {
            self.registry.release(&intent.idempotency_key);
            return Err(OrderError::Blocked("kill switch engaged".into()));
        }

        let result = match intent.side {
            PositionSide::Hedge => self.execute_hedge(&session, intent, recovering).await,
            PositionSide::Long | PositionSide::Short => {
                self.execute_single(&session, intent, recovering).await
            }
        };

        match &result {
            Ok(fill) => {
                self.registry.mark_completed(&intent.idempotency_key, fill);
                info!(
                    size = %fill.size,
                    price = %fill.price,
                    kind = ?fill.kind,
                    "Placement filled"
                );
            }
            Err(e) => {
                self.registry
                    .mark_failed(&intent.idempotency_key, &e.to_string());
                warn!(error = %e, "Placement failed");
            }
        }
        result
    }

    async fn execute_single(
        &self,
        session: &VenueSession,
        intent: &OrderIntent,
        recovering: bool,
    ) -> Result<Fill, OrderError> {
        let market = intent.side.primary_market(intent.long_market);
        let side = leg_side(intent, intent.side.entry_order_side());
        let leg = self.leg_spec(
            intent,
            intent.idempotency_key.as_str().to_string(),
            market,
            side,
            intent.size,
            Some(intent.reference_price),
        );
        let primary = self.execute_leg(session, &leg, recovering).await?;
        Ok(build_fill(intent, primary, None))
    }

    /// Perp leg first, then spot; a failed spot entry unwinds the perp leg
    async fn execute_hedge(
        &self,
        session: &VenueSession,
        intent: &OrderIntent,
        recovering: bool,
    ) -> Result<Fill, OrderError> {
        let key = &intent.idempotency_key;
        let perp_side = leg_side(intent, OrderSide::Sell);
        let perp_leg = self.leg_spec(
            intent,
            key.leg("perp").as_str().to_string(),
            MarketKind::Perp,
            perp_side,
            intent.size,
            Some(intent.reference_price),
        );
        let perp = self.execute_leg(session, &perp_leg, recovering).await?;

        let spot_leg = self.leg_spec(
            intent,
            key.leg("spot").as_str().to_string(),
            MarketKind::Spot,
            perp_side.opposite(),
            perp.size,
            intent.hedge_reference_price,
        );
        match self.execute_leg(session, &spot_leg, recovering).await {
            Ok(spot) => Ok(build_fill(intent, perp, Some(spot))),
            Err(e) if intent.kind == IntentKind::Open => {
                error!(error = %e, "Spot leg failed, unwinding perp leg");
                self.unwind_leg(session, intent, &perp).await;
                // Terminal for this key: a retry must not recover the unwound perp leg
                Err(OrderError::Rejected(format!(
                    "hedge entry unwound after spot leg failed: {}",
                    e
                )))
            }
            Err(e) => {
                error!(error = %e, "Spot leg of hedge exit failed; perp leg already closed");
                Err(e)
            }
        }
    }

    async fn unwind_leg(&self, session: &VenueSession, intent: &OrderIntent, leg: &LegFill) {
        let spec = LegSpec {
            order: VenueOrder {
                client_order_id: intent
                    .idempotency_key
                    .leg(&format!("{}-unwind", leg.market))
                    .as_str()
                    .to_string(),
                symbol: intent.symbol.clone(),
                market: leg.market,
                side: leg.side.opposite(),
                size: leg.size,
                price_limit: None,
                reduce_only: true,
            },
            opening: false,
        };
        match self.execute_leg(session, &spec, true).await {
            Ok(fill) => info!(
                order_id = %fill.order_id,
                size = %fill.size,
                price = %fill.price,
                "Perp leg unwound"
            ),
            Err(e) => error!(
                error = %e,
                size = %leg.size,
                "Failed to unwind perp leg; exposure left unhedged"
            ),
        }
    }

    fn leg_spec(
        &self,
        intent: &OrderIntent,
        client_order_id: String,
        market: MarketKind,
        side: OrderSide,
        size: Decimal,
        reference: Option<Decimal>,
    ) -> LegSpec {
        let closing = intent.is_closing();
        LegSpec {
            order: VenueOrder {
                client_order_id,
                symbol: intent.symbol.clone(),
                market,
                side,
                size,
                price_limit: reference.map(|r| intent.price_limit(side, r)),
                reduce_only: closing,
            },
            opening: !closing,
        }
    }

    /// Submit one order with bounded retries and wait for its fill.
    ///
    /// After any transient failure the next attempt first looks the order up
    /// by client id, so a lost ack is resolved instead of re-sent.
    async fn execute_leg(
        &self,
        session: &VenueSession,
        leg: &LegSpec,
        recovering: bool,
    ) -> Result<LegFill, OrderError> {
        let policy = &self.settings.retry;
        let order = &leg.order;
        let mut check_existing = recovering;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = self.attempt_leg(session, leg, check_existing).await;
            let err = match outcome {
                Ok(state) => return self.await_fill(session, order, state).await,
                Err(e) => e,
            };

            let transient = matches!(&err, OrderError::Conn(c) if c.is_transient());
            if !transient {
                return Err(err);
            }
            check_existing = true;

            if !policy.should_retry(attempt) {
                return Err(OrderError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
            let delay = policy.delay_for(attempt);
            warn!(
                client_order_id = %order.client_order_id,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = as_millis_u64(delay),
                error = %err,
                "Transient venue error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_leg(
        &self,
        session: &VenueSession,
        leg: &LegSpec,
        check_existing: bool,
    ) -> Result<VenueOrderState, OrderError> {
        let order = &leg.order;
        if check_existing {
            let existing = self
                .call(session, session.connector.order_by_client_id(&order.client_order_id))
                .await?;
            if let Some(state) = existing {
                info!(
                    client_order_id = %order.client_order_id,
                    order_id = %state.order_id,
                    status = %state.status,
                    "Found order from earlier attempt"
                );
                return Ok(state);
            }
            debug!(client_order_id = %order.client_order_id, "No earlier order found, submitting");
        }

        self.permit::<OrderError>(session).await?;
        // The rate-limit wait may have outlasted a halt
        if leg.opening && self.is_halted() {
            return Err(OrderError::Blocked("kill switch engaged".into()));
        }
        self.timed(session, session.connector.submit_order(order)).await
    }

    /// Poll until the order reaches a terminal state or the fill timeout passes
    async fn await_fill(
        &self,
        session: &VenueSession,
        order: &VenueOrder,
        mut state: VenueOrderState,
    ) -> Result<LegFill, OrderError> {
        let deadline = Instant::now() + self.settings.fill_timeout;
        loop {
            if state.status == OrderStatus::Filled
                || (state.status.is_terminal() && state.filled_size > Decimal::ZERO)
            {
                return leg_fill(order, &state);
            }
            if state.status.is_terminal() {
                return Err(OrderError::Unfilled {
                    order_id: state.order_id.clone(),
                    status: state.status.to_string(),
                });
            }

            if Instant::now() >= deadline {
                warn!(
                    order_id = %state.order_id,
                    filled = %state.filled_size,
                    "Fill timeout, cancelling remainder"
                );
                if let Err(e) = self
                    .call(session, session.connector.cancel_order(&state.order_id))
                    .await
                {
                    warn!(order_id = %state.order_id, error = %e, "Cancel after fill timeout failed");
                }
                if state.filled_size > Decimal::ZERO {
                    return leg_fill(order, &state);
                }
                return Err(OrderError::Unfilled {
                    order_id: state.order_id.clone(),
                    status: state.status.to_string(),
                });
            }

            tokio::time::sleep(self.settings.fill_poll_interval).await;
            match self
                .call(session, session.connector.order_by_client_id(&order.client_order_id))
                .await
            {
                Ok(Some(next)) => state = next,
                Ok(None) => {}
                Err(OrderError::Conn(e)) if e.is_transient() => {
                    debug!(error = %e, "Order status poll failed");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn permit<E: From<ConnError>>(&self, session: &VenueSession) -> Result<(), E> {
        let max_wait = self.settings.rate_limit_max_wait;
        match session.bucket.acquire(max_wait).await {
            Ok(waited) => {
                if waited > Duration::ZERO {
                    debug!(venue = session.connector.venue(), waited_ms = as_millis_u64(waited), "Rate limited, waited for token");
                }
                Ok(())
            }
            Err(waited) => Err(ConnError::RateLimited {
                venue: session.connector.venue().to_string(),
                waited_ms: as_millis_u64(waited),
            }
            .into()),
        }
    }

    /// Run a venue call under the call timeout and record its latency
    async fn timed<T, E, F>(&self, session: &VenueSession, fut: F) -> Result<T, E>
    where
        E: From<ConnError>,
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = tokio::time::timeout(self.settings.call_timeout, fut).await;
        let elapsed = started.elapsed();
        self.record_latency(session, elapsed);
        match result {
            Ok(r) => r,
            Err(_) => Err(ConnError::Timeout {
                venue: session.connector.venue().to_string(),
                elapsed_ms: as_millis_u64(elapsed),
            }
            .into()),
        }
    }

    async fn call<T, E, F>(&self, session: &VenueSession, fut: F) -> Result<T, E>
    where
        E: From<ConnError>,
        F: Future<Output = Result<T, E>>,
    {
        self.permit::<E>(session).await?;
        self.timed(session, fut).await
    }

    fn record_latency(&self, session: &VenueSession, sample: Duration) {
        let transition = match session.latency.lock() {
            Ok(mut tracker) => tracker.record(sample),
            Err(_) => None,
        };
        let venue = session.connector.venue().to_string();
        let event = match transition {
            Some(LatencyTransition::BecameHigh { average }) => {
                warn!(venue = %venue, average_ms = as_millis_u64(average), "Venue latency above threshold");
                RiskEvent::HighLatency {
                    venue,
                    average_ms: as_millis_u64(average),
                }
            }
            Some(LatencyTransition::Recovered { average }) => {
                info!(venue = %venue, average_ms = as_millis_u64(average), "Venue latency recovered");
                RiskEvent::LatencyRecovered {
                    venue,
                    average_ms: as_millis_u64(average),
                }
            }
            None => return,
        };
        if let Some(tx) = &self.risk_events {
            if tx.try_send(event).is_err() {
                warn!("Risk event channel full, latency transition dropped");
            }
        }
    }

    /// Retry a read-only venue query on transient errors
    async fn query<T, F, Fut>(&self, venue: &str, op: &str, mut f: F) -> Result<T, ConnError>
    where
        F: FnMut(Arc<dyn VenueConnector>) -> Fut,
        Fut: Future<Output = Result<T, ConnError>>,
    {
        let session = self.session(venue)?;
        let policy = &self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .call(&session, f(Arc::clone(&session.connector)))
                .await;
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for(attempt);
                    warn!(venue, op, attempt, error = %e, "Venue query failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn cancel_order(&self, venue: &str, order_id: &str) -> Result<(), OrderError> {
        let session = self.session(venue)?;
        self.call(&session, session.connector.cancel_order(order_id))
            .await
    }

    pub async fn get_balances(&self, venue: &str) -> Result<Balances, ConnError> {
        self.query(venue, "balances", |c| async move { c.balances().await })
            .await
    }

    pub async fn get_open_positions(&self, venue: &str) -> Result<Vec<VenuePosition>, ConnError> {
        self.query(venue, "open_positions", |c| async move {
            c.open_positions().await
        })
        .await
    }

    /// Refuse new placements, wait for in-flight ones, then close sessions
    pub async fn close_all(&self, drain_timeout: Duration) -> bool {
        self.inflight.close();
        let drained = self.inflight.drain(drain_timeout).await;
        if !drained {
            warn!(
                in_flight = self.inflight.in_flight(),
                "Placements still in flight at venue close"
            );
        }
        for (venue, session) in &self.sessions {
            session.connector.close().await;
            debug!(venue = %venue, "Venue session closed");
        }
        drained
    }
}

/// Order side of a leg given the side that opens it
fn leg_side(intent: &OrderIntent, entry_side: OrderSide) -> OrderSide {
    match intent.kind {
        IntentKind::Open => entry_side,
        IntentKind::Close => entry_side.opposite(),
    }
}

fn leg_fill(order: &VenueOrder, state: &VenueOrderState) -> Result<LegFill, OrderError> {
    let price = state.avg_price.ok_or_else(|| {
        OrderError::Rejected(format!("order {} filled without a price", state.order_id))
    })?;
    Ok(LegFill {
        order_id: state.order_id.clone(),
        market: order.market,
        side: order.side,
        size: state.filled_size,
        price,
    })
}

fn build_fill(intent: &OrderIntent, primary: LegFill, hedge: Option<LegFill>) -> Fill {
    let hedge_price = hedge.as_ref().map(|l| l.price);
    let size = primary.size;
    let price = primary.price;
    let mut legs = vec![primary];
    legs.extend(hedge);
    Fill {
        idempotency_key: intent.idempotency_key.clone(),
        strategy_id: intent.strategy_id.clone(),
        venue: intent.venue.clone(),
        symbol: intent.symbol.clone(),
        side: intent.side,
        kind: intent.kind,
        size,
        price,
        hedge_price,
        legs,
        filled_at: Utc::now(),
    }
}
