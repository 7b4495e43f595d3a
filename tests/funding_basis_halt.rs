use panther::config::{FundingArbParams, RiskConfig, VenueConfig};
use panther::coordination::{RetryPolicy, ShutdownSignal};
use panther::domain::{Allocation, MarketKind, MarketSnapshot, PositionKey, PositionSide, PositionStatus};
use panther::exchange::{ExchangeGateway, GatewaySettings, PaperMarket, PaperVenue};
use panther::persistence::{MemoryStateStore, StateStore};
use panther::risk::RiskGovernor;
use panther::strategy::{
    FundingArb, RunnerSettings, RuntimeServices, SizingRules, StrategyKind, StrategyRunner,
    FUNDING_ARB,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn btc(basis: Decimal, funding: Decimal) -> MarketSnapshot {
    let mut snapshot = MarketSnapshot::new("BTCUSDT", dec!(60000));
    snapshot.spot_price = Some(dec!(60000) / (Decimal::ONE + basis));
    snapshot.funding_rate = Some(funding);
    snapshot
}

#[tokio::test]
async fn basis_blowout_closes_hedge_and_halts_trading() {
    let store = Arc::new(MemoryStateStore::new());
    store
        .put_allocation(Allocation::new(FUNDING_ARB, dec!(1), dec!(10000)), None)
        .await
        .unwrap();
    let market = PaperMarket::new();
    market.set(btc(dec!(0.003), dec!(0.0003))).await;

    let risk = RiskConfig::default();
    let (mut governor, handle) = RiskGovernor::new(risk.clone(), store.clone(), market.clone());
    governor.initialize().await.unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let governor_task = tokio::spawn(governor.run(shutdown_rx));

    let venue_config = VenueConfig::default();
    let venue = Arc::new(PaperVenue::new("paper", market.clone(), &venue_config));
    let gateway = Arc::new(
        ExchangeGateway::new(GatewaySettings::default())
            .with_venue(venue.clone(), &venue_config)
            .with_halt_signal(handle.halt_signal()),
    );

    let settings = RunnerSettings {
        strategy_id: FUNDING_ARB.into(),
        venue: "paper".into(),
        symbols: vec!["BTCUSDT".into()],
        interval: Duration::from_millis(50),
        cycle_timeout: Duration::from_secs(2),
        max_slippage: dec!(0.01),
        sizing: SizingRules {
            target_leverage: dec!(1),
            max_leverage: risk.max_leverage,
            size_step: dec!(0.001),
            min_notional: dec!(10),
            slots: 1,
        },
        flatten_on_halt: true,
    };
    let services = RuntimeServices {
        store: store.clone(),
        gateway,
        governor: handle.clone(),
        feed: market.clone(),
        sentiment: None,
        journal: None,
        alerts: None,
        cas_policy: RetryPolicy::store(),
    };
    let strategy = StrategyKind::FundingArb(FundingArb::new(
        FundingArbParams::default(),
        risk.max_basis_risk,
    ));
    let (mut runner, _runner_handle) = StrategyRunner::new(settings, strategy, services);
    let key = PositionKey::new(FUNDING_ARB, "BTCUSDT");

    // Funding pays shorts and basis is 0.3%: open the hedge
    runner.run_cycle().await;
    assert!(runner.settle(Duration::from_secs(5)).await);
    let hedge = store.get_position(&key).await.unwrap().unwrap().value;
    assert_eq!(hedge.status, PositionStatus::Open);
    assert_eq!(hedge.side, PositionSide::Hedge);
    assert_eq!(hedge.size, dec!(0.166));
    assert_eq!(venue.position("BTCUSDT", MarketKind::Perp).await, dec!(-0.166));
    assert_eq!(venue.position("BTCUSDT", MarketKind::Spot).await, dec!(0.166));

    // Basis widens to 1.6% against a 1% limit
    market.set(btc(dec!(0.016), dec!(0.0003))).await;
    runner.run_cycle().await;
    assert!(runner.settle(Duration::from_secs(5)).await);

    assert!(store.get_position(&key).await.unwrap().is_none());
    let closed = store.list_closed_positions(10).await.unwrap();
    assert_eq!(closed.len(), 1);
    assert!(closed[0]
        .close_reason
        .as_deref()
        .unwrap_or("")
        .starts_with("basis"));
    assert_eq!(venue.position("BTCUSDT", MarketKind::Perp).await, Decimal::ZERO);
    assert_eq!(venue.position("BTCUSDT", MarketKind::Spot).await, Decimal::ZERO);

    let mut halted = handle.halt_signal();
    tokio::time::timeout(Duration::from_secs(5), halted.wait_for(|h| *h))
        .await
        .unwrap()
        .unwrap();
    let status = handle.status();
    assert!(status.kill_switch.engaged);
    assert!(status
        .kill_switch
        .reason
        .as_deref()
        .unwrap_or("")
        .contains("BTCUSDT"));

    // Basis back in range, but the halt holds: no new hedge
    market.set(btc(dec!(0.003), dec!(0.0003))).await;
    runner.run_cycle().await;
    assert_eq!(runner.pending_placements(), 0);
    assert!(store.get_position(&key).await.unwrap().is_none());

    let _ = shutdown_tx.send(ShutdownSignal::Graceful);
    governor_task.await.unwrap();
}
