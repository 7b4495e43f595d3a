use chrono::Utc;
use panther::config::RiskConfig;
use panther::coordination::ShutdownSignal;
use panther::domain::{
    Allocation, IdempotencyKey, IntentKind, MarketKind, MarketSnapshot, OrderIntent, Position,
    PositionSide, PositionStatus, PriceConstraint,
};
use panther::error::RiskError;
use panther::exchange::PaperMarket;
use panther::persistence::{FileStateStore, StateStore};
use panther::risk::{check_leverage, GovernorHandle, RiskGovernor};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn long_sol(size: Decimal, entry: Decimal) -> Position {
    Position {
        strategy_id: "momentum".into(),
        symbol: "SOLUSDT".into(),
        venue: "paper".into(),
        side: PositionSide::Long,
        market: MarketKind::Perp,
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

fn intent(kind: IntentKind, size: Decimal) -> OrderIntent {
    OrderIntent {
        strategy_id: "momentum".into(),
        venue: "paper".into(),
        symbol: "SOLUSDT".into(),
        side: PositionSide::Long,
        kind,
        long_market: MarketKind::Perp,
        size,
        reference_price: dec!(100),
        hedge_reference_price: None,
        price_constraint: PriceConstraint::Market {
            max_slippage: dec!(0.01),
        },
        idempotency_key: IdempotencyKey::generate("momentum"),
        reason: "test".into(),
    }
}

struct RunningGovernor {
    handle: GovernorHandle,
    shutdown: broadcast::Sender<ShutdownSignal>,
    task: JoinHandle<()>,
}

impl RunningGovernor {
    async fn start(store: Arc<dyn StateStore>, market: Arc<PaperMarket>) -> Self {
        let (mut governor, handle) = RiskGovernor::new(RiskConfig::default(), store, market);
        governor.initialize().await.unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(governor.run(rx));
        Self {
            handle,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(ShutdownSignal::Graceful);
        self.task.await.unwrap();
    }
}

async fn seeded_store(path: &Path) -> Arc<FileStateStore> {
    let store = Arc::new(FileStateStore::open(path).await.unwrap());
    store
        .put_allocation(Allocation::new("momentum", dec!(1), dec!(10000)), None)
        .await
        .unwrap();
    store
        .put_position(long_sol(dec!(100), dec!(100)), None)
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn drawdown_past_limit_halts_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = seeded_store(&path).await;
    let market = PaperMarket::new();
    market.set(MarketSnapshot::new("SOLUSDT", dec!(100))).await;

    let governor = RunningGovernor::start(store.clone(), market.clone()).await;
    let status = governor.handle.evaluate_now().await.unwrap();
    assert_eq!(status.equity, dec!(10000));
    assert_eq!(status.kill_switch.high_water_mark, dec!(10000));

    // Exactly 10% down does not trip a 10% limit
    market.set(MarketSnapshot::new("SOLUSDT", dec!(90))).await;
    let status = governor.handle.evaluate_now().await.unwrap();
    assert!(!status.kill_switch.engaged);

    market.set(MarketSnapshot::new("SOLUSDT", dec!(89))).await;
    let status = governor.handle.evaluate_now().await.unwrap();
    assert!(status.kill_switch.engaged);
    assert_eq!(status.equity, dec!(8900));
    assert!(status
        .kill_switch
        .reason
        .as_deref()
        .unwrap_or("")
        .contains("drawdown"));
    assert!(governor.handle.is_halted());

    let err = governor
        .handle
        .approve(&intent(IntentKind::Open, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, RiskError::KillSwitchEngaged { .. }));
    governor
        .handle
        .approve(&intent(IntentKind::Close, dec!(100)))
        .await
        .unwrap();

    // Recovery alone does not clear the halt
    market.set(MarketSnapshot::new("SOLUSDT", dec!(100))).await;
    assert!(governor.handle.evaluate_now().await.unwrap().kill_switch.engaged);
    governor.stop().await;
    drop(store);

    let reopened: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&path).await.unwrap());
    let persisted = reopened.get_kill_switch_state().await.unwrap().unwrap().value;
    assert!(persisted.engaged);

    let governor = RunningGovernor::start(reopened.clone(), market.clone()).await;
    assert!(governor.handle.is_halted());
    let state = governor.handle.reset("alice").await.unwrap();
    assert!(!state.engaged);
    assert_eq!(state.last_reset_by.as_deref(), Some("alice"));
    assert!(!governor.handle.is_halted());
    governor
        .handle
        .approve(&intent(IntentKind::Open, dec!(1)))
        .await
        .unwrap();
    governor.stop().await;
}

#[tokio::test]
async fn leverage_gate_counts_open_exposure() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir.path().join("state.json")).await;
    let market = PaperMarket::new();
    market.set(MarketSnapshot::new("SOLUSDT", dec!(100))).await;
    let governor = RunningGovernor::start(store, market).await;

    // 10000 already open against 10000 equity; 5x leaves room for 40000 more
    governor
        .handle
        .approve(&intent(IntentKind::Open, dec!(400)))
        .await
        .unwrap();
    let err = governor
        .handle
        .approve(&intent(IntentKind::Open, dec!(401)))
        .await
        .unwrap_err();
    assert!(matches!(err, RiskError::LeverageExceeded { .. }));
    governor.stop().await;
}

proptest! {
    #[test]
    fn leverage_gate_matches_ratio(
        exposure in 0u64..2_000_000,
        equity in 1u64..200_000,
        max in 1u32..25,
    ) {
        let exposure = Decimal::from(exposure);
        let equity = Decimal::from(equity);
        let max = Decimal::from(max);
        let allowed = check_leverage("momentum", exposure, equity, max).is_ok();
        prop_assert_eq!(allowed, exposure <= equity * max);
    }

    #[test]
    fn no_equity_never_allows_exposure(exposure in 0u64..1_000_000) {
        let result = check_leverage("momentum", Decimal::from(exposure), Decimal::ZERO, dec!(5));
        prop_assert!(matches!(result, Err(RiskError::NoAllocation(_))));
    }
}
