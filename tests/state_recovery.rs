use chrono::Utc;
use panther::config::{AppConfig, VenueConfig};
use panther::coordination::RetryPolicy;
use panther::coordinator::{Engine, EngineOptions};
use panther::domain::{
    Allocation, KillSwitchState, MarketKind, MarketSnapshot, Position, PositionKey, PositionSide,
    PositionStatus,
};
use panther::exchange::{
    ExchangeGateway, GatewaySettings, PaperMarket, PaperVenue, VenueConnector,
};
use panther::persistence::{
    update_allocation, update_position, FileStateStore, MemoryStateStore, StateStore,
};
use panther::strategy::{reconcile, MismatchKind};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;

fn open_position(strategy: &str, symbol: &str, market: MarketKind, size: Decimal, entry: Decimal) -> Position {
    Position {
        strategy_id: strategy.into(),
        symbol: symbol.into(),
        venue: "paper".into(),
        side: PositionSide::Long,
        market,
        size,
        entry_price: entry,
        hedge_entry_price: None,
        opened_at: Utc::now(),
        status: PositionStatus::Open,
        exit_price: None,
        realized_pnl: None,
        closed_at: None,
        close_reason: None,
    }
}

#[tokio::test]
async fn restart_reconciles_store_against_venue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    // State as a crashed process left it
    {
        let store = FileStateStore::open(&path).await.unwrap();
        store
            .put_allocation(Allocation::new("momentum", dec!(0.5), dec!(20000)), None)
            .await
            .unwrap();
        store
            .put_allocation(Allocation::new("anomaly", dec!(0.5), dec!(20000)), None)
            .await
            .unwrap();
        store
            .put_position(open_position("momentum", "SOLUSDT", MarketKind::Perp, dec!(10), dec!(100)), None)
            .await
            .unwrap();
        store
            .put_position(open_position("anomaly", "DOGEUSDT", MarketKind::Spot, dec!(1000), dec!(0.15)), None)
            .await
            .unwrap();
    }

    let market = PaperMarket::new();
    market.set(MarketSnapshot::new("SOLUSDT", dec!(95))).await;
    market.set(MarketSnapshot::new("DOGEUSDT", dec!(0.16))).await;
    let config = VenueConfig::default();
    let venue = Arc::new(PaperVenue::new("paper", market.clone(), &config));
    // The SOL exit filled before the crash; DOGE is still held
    venue
        .set_position("DOGEUSDT", MarketKind::Spot, dec!(1000), dec!(0.15))
        .await;
    let gateway = ExchangeGateway::new(GatewaySettings::default()).with_venue(venue, &config);

    let store = FileStateStore::open(&path).await.unwrap();
    let report = reconcile(&store, &gateway, market.as_ref(), None, &RetryPolicy::store())
        .await
        .unwrap();
    assert_eq!(report.positions_checked, 2);
    assert_eq!(report.mismatches.len(), 1);
    let mismatch = &report.mismatches[0];
    assert_eq!(mismatch.kind, MismatchKind::FlatOnExchange);
    assert_eq!(mismatch.symbol, "SOLUSDT");
    assert_eq!(mismatch.store_size, dec!(10));
    assert_eq!(mismatch.exchange_size, Decimal::ZERO);
    drop(store);

    let store = FileStateStore::open(&path).await.unwrap();
    let open = store.list_open_positions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].symbol, "DOGEUSDT");
    let closed = store.list_closed_positions(10).await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].realized_pnl, Some(dec!(-50)));
    let momentum = store.get_allocation("momentum").await.unwrap().unwrap().value;
    assert_eq!(momentum.current_equity, dec!(9950));
}

#[tokio::test]
async fn concurrent_allocation_updates_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::open(dir.path().join("state.json")).await.unwrap());
    store
        .put_allocation(Allocation::new("momentum", dec!(1), dec!(1000)), None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            update_allocation(store.as_ref(), "momentum", &RetryPolicy::store(), |current| {
                let mut next = current?.clone();
                next.apply_realized(Decimal::ONE);
                Some(next)
            })
            .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().unwrap().is_some());
    }

    let allocation = store.get_allocation("momentum").await.unwrap().unwrap();
    assert_eq!(allocation.value.current_equity, dec!(1016));
}

#[tokio::test]
async fn only_one_writer_moves_a_position_to_closing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::open(dir.path().join("state.json")).await.unwrap());
    store
        .put_position(open_position("momentum", "SOLUSDT", MarketKind::Perp, dec!(10), dec!(100)), None)
        .await
        .unwrap();
    let key = PositionKey::new("momentum", "SOLUSDT");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            update_position(store.as_ref(), &key, &RetryPolicy::store(), |current| {
                let current = current.filter(|p| p.status == PositionStatus::Open)?;
                let mut next = current.clone();
                next.transition(PositionStatus::Closing).ok()?;
                next.close_reason = Some(format!("writer {}", i));
                Some(next)
            })
            .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    let stored = store.get_position(&key).await.unwrap().unwrap().value;
    assert_eq!(stored.status, PositionStatus::Closing);
}

fn paper_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.control.enabled = false;
    config.journal.enabled = false;
    config.logging.dir = None;
    config
}

/// Store left by a run that opened 100 SOL at 100 with equity at 10000
async fn store_with_sol_long(status: PositionStatus) -> Arc<MemoryStateStore> {
    let store = Arc::new(MemoryStateStore::new());
    let today = Utc::now().date_naive();
    let mut state = KillSwitchState::new(today);
    state.roll_day(today, dec!(10000));
    store.set_kill_switch_state(state, None).await.unwrap();

    let mut position = open_position("momentum", "SOLUSDT", MarketKind::Perp, dec!(100), dec!(100));
    if status == PositionStatus::Closing {
        position.transition(PositionStatus::Closing).unwrap();
        position.close_reason = Some("trend reversal".into());
    }
    store.put_position(position, None).await.unwrap();
    store
}

/// Venue holding the same 100 SOL, with all cash spent on it
async fn venue_with_sol_long(market: &Arc<PaperMarket>) -> HashMap<String, Arc<dyn VenueConnector>> {
    let config = VenueConfig {
        paper_balance: Decimal::ZERO,
        ..VenueConfig::default()
    };
    let venue = PaperVenue::new("paper", market.clone(), &config);
    venue
        .set_position("SOLUSDT", MarketKind::Perp, dec!(100), dec!(100))
        .await;
    let mut connectors: HashMap<String, Arc<dyn VenueConnector>> = HashMap::new();
    connectors.insert("paper".into(), Arc::new(venue));
    connectors
}

#[tokio::test]
async fn restart_with_losing_position_counts_the_loss_once() {
    let store = store_with_sol_long(PositionStatus::Open).await;
    let market = PaperMarket::new();
    market.set(MarketSnapshot::new("SOLUSDT", dec!(94.5))).await;

    let engine = Engine::start(
        paper_config(),
        EngineOptions {
            store: Some(store.clone()),
            connectors: venue_with_sol_long(&market).await,
            paper_market: Some(market.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // 100 x 94.5 held on the venue; a 5.5% drawdown stays under the 10% limit
    let status = engine.governor().status();
    assert_eq!(status.equity, dec!(9450));
    assert!(!status.kill_switch.engaged);

    let allocated: Decimal = store
        .list_allocations()
        .await
        .unwrap()
        .iter()
        .map(|a| a.current_equity)
        .sum();
    assert_eq!(allocated, dec!(10000));
}

#[tokio::test]
async fn restart_keeps_exit_in_progress() {
    let store = store_with_sol_long(PositionStatus::Closing).await;
    let market = PaperMarket::new();
    market.set(MarketSnapshot::new("SOLUSDT", dec!(100))).await;

    let engine = Engine::start(
        paper_config(),
        EngineOptions {
            store: Some(store.clone()),
            connectors: venue_with_sol_long(&market).await,
            paper_market: Some(market.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(!engine.governor().status().kill_switch.engaged);

    let key = PositionKey::new("momentum", "SOLUSDT");
    let stored = store.get_position(&key).await.unwrap().unwrap().value;
    assert_eq!(stored.status, PositionStatus::Closing);
    assert_eq!(stored.size, dec!(100));
    assert_eq!(stored.close_reason.as_deref(), Some("trend reversal"));
}

#[tokio::test]
async fn concurrent_entry_and_exit_fills_stay_coherent() {
    let store = Arc::new(MemoryStateStore::new());
    store
        .put_position(open_position("momentum", "SOLUSDT", MarketKind::Perp, dec!(10), dec!(100)), None)
        .await
        .unwrap();
    let key = PositionKey::new("momentum", "SOLUSDT");

    // Nine partial exits of 1 race five late entry fills for the same key
    let mut exits = Vec::new();
    for _ in 0..9 {
        let store = store.clone();
        let key = key.clone();
        exits.push(tokio::spawn(async move {
            update_position(store.as_ref(), &key, &RetryPolicy::store(), |current| {
                let current = current.filter(|p| p.is_live())?;
                let mut next = current.clone();
                next.size = current.size - Decimal::ONE;
                Some(next)
            })
            .await
        }));
    }
    let mut entries = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        let key = key.clone();
        let fresh = open_position("momentum", "SOLUSDT", MarketKind::Perp, dec!(7), dec!(120));
        entries.push(tokio::spawn(async move {
            update_position(store.as_ref(), &key, &RetryPolicy::store(), |current| match current {
                Some(p) if p.is_live() => None,
                _ => Some(fresh.clone()),
            })
            .await
        }));
    }

    for task in exits {
        assert!(task.await.unwrap().unwrap().is_some());
    }
    for task in entries {
        assert!(task.await.unwrap().unwrap().is_none());
    }

    let stored = store.get_position(&key).await.unwrap().unwrap().value;
    assert_eq!(stored.status, PositionStatus::Open);
    assert_eq!(stored.size, dec!(1));
    assert_eq!(stored.entry_price, dec!(100));
}
