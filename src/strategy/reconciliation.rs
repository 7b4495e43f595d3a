//! Startup reconciliation
//!
//! Every live position in the store is checked against what the venue
//! actually holds. The venue wins: positions it no longer has are closed at
//! the current mark and sizes are corrected. A CLOSING position the venue
//! still holds stays CLOSING so its exit resumes. Exposure on the venue that
//! no strategy owns is only reported.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::feeds::MarketFeed;
use crate::coordination::RetryPolicy;
use crate::domain::{MarketKind, Position, PositionSide, PositionStatus};
use crate::error::PantherError;
use crate::exchange::ExchangeGateway;
use crate::persistence::{update_allocation, update_position, StateStore};
use crate::supervisor::AlertManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Store says live, venue is flat
    FlatOnExchange,
    /// Venue holds a different size than the store
    SizeDiffers,
    /// Store says CLOSING, venue still holds the position
    ClosingStillLive,
    /// Venue exposure no stored position accounts for
    Orphan,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MismatchKind::FlatOnExchange => "flat on exchange",
            MismatchKind::SizeDiffers => "size differs",
            MismatchKind::ClosingStillLive => "closing but still live",
            MismatchKind::Orphan => "orphan exposure",
        };
        write!(f, "{}", s)
    }
}

/// A divergence between the store and a venue, and what was done about it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationMismatch {
    /// Empty for orphans
    pub strategy_id: String,
    pub symbol: String,
    pub venue: String,
    pub kind: MismatchKind,
    pub store_size: Decimal,
    pub exchange_size: Decimal,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub positions_checked: usize,
    pub mismatches: Vec<ReconciliationMismatch>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

type ExposureKey = (String, String, MarketKind);

/// Signed venue exposure each leg of a stored position expects
fn expected_legs(position: &Position) -> Vec<(MarketKind, Decimal)> {
    match position.side {
        PositionSide::Long => vec![(position.market, position.size)],
        PositionSide::Short => vec![(MarketKind::Perp, -position.size)],
        PositionSide::Hedge => vec![
            (MarketKind::Perp, -position.size),
            (MarketKind::Spot, position.size),
        ],
    }
}

/// Portion of `expected` (signed) covered by `available` (signed)
fn covered(available: Decimal, expected: Decimal) -> Decimal {
    if available.is_sign_negative() != expected.is_sign_negative() || available.is_zero() {
        return Decimal::ZERO;
    }
    available.abs().min(expected.abs())
}

/// Reconcile the store against every venue before strategies start.
///
/// A venue that cannot be queried fails the whole run; trading on
/// unverified state is never allowed.
pub async fn reconcile(
    store: &dyn StateStore,
    gateway: &ExchangeGateway,
    feed: &dyn MarketFeed,
    alerts: Option<&AlertManager>,
    policy: &RetryPolicy,
) -> Result<ReconciliationReport, PantherError> {
    let mut positions = store.list_open_positions().await?;
    positions.sort_by_key(|p| p.opened_at);

    let venues: BTreeSet<String> = gateway
        .venues()
        .into_iter()
        .chain(positions.iter().map(|p| p.venue.clone()))
        .collect();

    let mut exposure: BTreeMap<ExposureKey, Decimal> = BTreeMap::new();
    for venue in &venues {
        let live = gateway.get_open_positions(venue).await.map_err(|e| {
            PantherError::Reconciliation(format!("cannot query positions on {}: {}", venue, e))
        })?;
        for p in live {
            *exposure
                .entry((venue.clone(), p.symbol, p.market))
                .or_default() += p.size;
        }
    }

    let mut report = ReconciliationReport {
        positions_checked: positions.len(),
        mismatches: Vec::new(),
    };

    for position in positions {
        let legs = expected_legs(&position);
        let live_size = legs
            .iter()
            .map(|(market, expected)| {
                let key = (position.venue.clone(), position.symbol.clone(), *market);
                covered(exposure.get(&key).copied().unwrap_or_default(), *expected)
            })
            .min()
            .unwrap_or_default();

        // Claim what this position accounts for so leftovers show up as orphans
        for (market, expected) in &legs {
            let key = (position.venue.clone(), position.symbol.clone(), *market);
            if let Some(available) = exposure.get_mut(&key) {
                let claimed = if expected.is_sign_negative() { -live_size } else { live_size };
                *available -= claimed;
            }
        }

        let mismatch = if live_size.is_zero() {
            Some(close_flat(store, feed, policy, &position).await?)
        } else if live_size != position.size || position.status == PositionStatus::Closing {
            Some(correct_live(store, policy, &position, live_size).await?)
        } else {
            None
        };

        if let Some(m) = mismatch {
            report.mismatches.push(m);
        }
    }

    for ((venue, symbol, market), size) in exposure {
        if size.is_zero() {
            continue;
        }
        report.mismatches.push(ReconciliationMismatch {
            strategy_id: String::new(),
            symbol: format!("{} ({})", symbol, market),
            venue,
            kind: MismatchKind::Orphan,
            store_size: Decimal::ZERO,
            exchange_size: size,
            action: "left untouched".into(),
        });
    }

    for m in &report.mismatches {
        warn!(
            strategy = %m.strategy_id,
            symbol = %m.symbol,
            venue = %m.venue,
            kind = %m.kind,
            store_size = %m.store_size,
            exchange_size = %m.exchange_size,
            action = %m.action,
            "Reconciliation mismatch"
        );
        if let Some(alerts) = alerts {
            alerts
                .warning(
                    "reconciliation",
                    "Reconciliation Mismatch",
                    &format!(
                        "{} {} on {}: {} (store {}, exchange {}), {}",
                        m.strategy_id, m.symbol, m.venue, m.kind, m.store_size, m.exchange_size, m.action
                    ),
                )
                .await;
        }
    }

    info!(
        checked = report.positions_checked,
        mismatches = report.mismatches.len(),
        "Reconciliation complete"
    );
    Ok(report)
}

/// The venue is flat: close the stored position at the current mark
async fn close_flat(
    store: &dyn StateStore,
    feed: &dyn MarketFeed,
    policy: &RetryPolicy,
    position: &Position,
) -> Result<ReconciliationMismatch, PantherError> {
    let (price, spot) = match feed.snapshot(&position.symbol).await {
        Ok(s) => (s.price_for(position.market), s.spot_price),
        Err(e) => {
            warn!(symbol = %position.symbol, error = %e, "No mark for reconciliation close, using entry");
            (position.entry_price, position.hedge_entry_price)
        }
    };

    let now = chrono::Utc::now();
    let mut pnl = Decimal::ZERO;
    let closed = update_position(store, &position.key(), policy, |current| {
        let mut next = current.filter(|p| p.is_live())?.clone();
        pnl = next
            .close_with(price, spot, "reconciliation: flat on exchange", now)
            .ok()?;
        Some(next)
    })
    .await?;

    if closed.is_some() {
        update_allocation(store, &position.strategy_id, policy, |current| {
            current.map(|a| {
                let mut a = a.clone();
                a.apply_realized(pnl);
                a
            })
        })
        .await?;
    }

    Ok(ReconciliationMismatch {
        strategy_id: position.strategy_id.clone(),
        symbol: position.symbol.clone(),
        venue: position.venue.clone(),
        kind: MismatchKind::FlatOnExchange,
        store_size: position.size,
        exchange_size: Decimal::ZERO,
        action: format!("marked CLOSED at {} (pnl {})", price, pnl),
    })
}

/// The venue still holds (part of) the position: trust its size. A CLOSING
/// position stays CLOSING; the runner resumes its exit with the same key.
async fn correct_live(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    position: &Position,
    live_size: Decimal,
) -> Result<ReconciliationMismatch, PantherError> {
    let was_closing = position.status == PositionStatus::Closing;
    if live_size != position.size {
        update_position(store, &position.key(), policy, |current| {
            let mut next = current.filter(|p| p.is_live())?.clone();
            next.size = live_size;
            Some(next)
        })
        .await?;
    }

    let (kind, action) = if was_closing {
        (
            MismatchKind::ClosingStillLive,
            format!("kept CLOSING with size {}, exit resumes", live_size),
        )
    } else {
        (
            MismatchKind::SizeDiffers,
            format!("size corrected to {}", live_size),
        )
    };

    Ok(ReconciliationMismatch {
        strategy_id: position.strategy_id.clone(),
        symbol: position.symbol.clone(),
        venue: position.venue.clone(),
        kind,
        store_size: position.size,
        exchange_size: live_size,
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueConfig;
    use crate::domain::{Allocation, MarketSnapshot, PositionKey};
    use crate::exchange::{GatewaySettings, PaperMarket, PaperVenue};
    use crate::persistence::MemoryStateStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn position(symbol: &str, side: PositionSide, size: Decimal, status: PositionStatus) -> Position {
        Position {
            strategy_id: "momentum".into(),
            symbol: symbol.into(),
            venue: "paper".into(),
            side,
            market: MarketKind::Perp,
            size,
            entry_price: dec!(100),
            hedge_entry_price: None,
            opened_at: Utc::now(),
            status,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
            close_reason: None,
        }
    }

    async fn setup() -> (Arc<MemoryStateStore>, Arc<PaperMarket>, Arc<PaperVenue>, ExchangeGateway) {
        let store = Arc::new(MemoryStateStore::new());
        store
            .put_allocation(Allocation::new("momentum", dec!(1), dec!(10000)), None)
            .await
            .unwrap();
        let market = PaperMarket::new();
        market.set(MarketSnapshot::new("SOLUSDT", dec!(110))).await;
        market.set(MarketSnapshot::new("ETHUSDT", dec!(2000))).await;
        let config = VenueConfig::default();
        let venue = Arc::new(PaperVenue::new("paper", market.clone(), &config));
        let gateway = ExchangeGateway::new(GatewaySettings::default()).with_venue(venue.clone(), &config);
        (store, market, venue, gateway)
    }

    #[tokio::test]
    async fn test_flat_on_exchange_closes_at_mark() {
        let (store, market, _venue, gateway) = setup().await;
        store
            .put_position(position("SOLUSDT", PositionSide::Long, dec!(10), PositionStatus::Open), None)
            .await
            .unwrap();

        let report = reconcile(store.as_ref(), &gateway, market.as_ref(), None, &RetryPolicy::store())
            .await
            .unwrap();

        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].kind, MismatchKind::FlatOnExchange);
        assert!(store
            .get_position(&PositionKey::new("momentum", "SOLUSDT"))
            .await
            .unwrap()
            .is_none());
        let closed = store.list_closed_positions(1).await.unwrap();
        assert_eq!(closed[0].status, PositionStatus::Closed);
        assert_eq!(closed[0].realized_pnl, Some(dec!(100)));

        let allocation = store.get_allocation("momentum").await.unwrap().unwrap().value;
        assert_eq!(allocation.current_equity, dec!(10100));
    }

    #[tokio::test]
    async fn test_closing_position_still_live_stays_closing() {
        let (store, market, venue, gateway) = setup().await;
        venue.set_position("SOLUSDT", MarketKind::Perp, dec!(-4), dec!(100)).await;
        let mut p = position("SOLUSDT", PositionSide::Short, dec!(5), PositionStatus::Closing);
        p.close_reason = Some("trend reversal".into());
        store.put_position(p, None).await.unwrap();

        let report = reconcile(store.as_ref(), &gateway, market.as_ref(), None, &RetryPolicy::store())
            .await
            .unwrap();

        assert_eq!(report.mismatches[0].kind, MismatchKind::ClosingStillLive);
        let stored = store
            .get_position(&PositionKey::new("momentum", "SOLUSDT"))
            .await
            .unwrap()
            .unwrap()
            .value;
        assert_eq!(stored.status, PositionStatus::Closing);
        assert_eq!(stored.size, dec!(4));
        assert_eq!(stored.close_reason.as_deref(), Some("trend reversal"));
    }

    #[tokio::test]
    async fn test_closing_position_at_full_size_is_left_as_is() {
        let (store, market, venue, gateway) = setup().await;
        venue.set_position("SOLUSDT", MarketKind::Perp, dec!(10), dec!(100)).await;
        let mut p = position("SOLUSDT", PositionSide::Long, dec!(10), PositionStatus::Closing);
        p.close_reason = Some("external trigger".into());
        store.put_position(p, None).await.unwrap();
        let key = PositionKey::new("momentum", "SOLUSDT");
        let before = store.get_position(&key).await.unwrap().unwrap().version;

        let report = reconcile(store.as_ref(), &gateway, market.as_ref(), None, &RetryPolicy::store())
            .await
            .unwrap();

        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].kind, MismatchKind::ClosingStillLive);
        let stored = store.get_position(&key).await.unwrap().unwrap();
        assert_eq!(stored.version, before);
        assert_eq!(stored.value.status, PositionStatus::Closing);
        assert_eq!(stored.value.close_reason.as_deref(), Some("external trigger"));
    }

    #[tokio::test]
    async fn test_matching_state_is_clean_and_orphans_reported() {
        let (store, market, venue, gateway) = setup().await;
        venue.set_position("SOLUSDT", MarketKind::Perp, dec!(10), dec!(100)).await;
        venue.set_position("ETHUSDT", MarketKind::Perp, dec!(-1), dec!(2000)).await;
        store
            .put_position(position("SOLUSDT", PositionSide::Long, dec!(10), PositionStatus::Open), None)
            .await
            .unwrap();

        let report = reconcile(store.as_ref(), &gateway, market.as_ref(), None, &RetryPolicy::store())
            .await
            .unwrap();

        assert_eq!(report.positions_checked, 1);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].kind, MismatchKind::Orphan);
        assert_eq!(report.mismatches[0].exchange_size, dec!(-1));
    }

    #[tokio::test]
    async fn test_unreachable_venue_fails_reconciliation() {
        let (store, market, venue, gateway) = setup().await;
        venue.faults().fail_next_queries(10);

        let err = reconcile(store.as_ref(), &gateway, market.as_ref(), None, &RetryPolicy::store())
            .await
            .unwrap_err();
        assert!(matches!(err, PantherError::Reconciliation(_)));
    }

    #[test]
    fn test_hedge_expects_both_legs() {
        let p = position("BTCUSDT", PositionSide::Hedge, dec!(2), PositionStatus::Open);
        assert_eq!(
            expected_legs(&p),
            vec![(MarketKind::Perp, dec!(-2)), (MarketKind::Spot, dec!(2))]
        );
        assert_eq!(covered(dec!(-1.5), dec!(-2)), dec!(1.5));
        assert_eq!(covered(dec!(3), dec!(-2)), Decimal::ZERO);
    }
}
