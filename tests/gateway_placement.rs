use panther::config::VenueConfig;
use panther::coordination::RetryPolicy;
use panther::domain::{
    IdempotencyKey, IntentKind, MarketKind, MarketSnapshot, OrderIntent, PositionSide,
    PriceConstraint,
};
use panther::error::{ConnError, OrderError};
use panther::exchange::{ExchangeGateway, GatewaySettings, PaperMarket, PaperVenue};
use panther::risk::RiskEvent;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn settings(retry: RetryPolicy) -> GatewaySettings {
    GatewaySettings {
        fill_poll_interval: Duration::from_millis(5),
        retry,
        ..Default::default()
    }
}

async fn paper(config: &VenueConfig) -> (Arc<PaperMarket>, Arc<PaperVenue>) {
    let market = PaperMarket::new();
    let mut btc = MarketSnapshot::new("BTCUSDT", dec!(60000));
    btc.spot_price = Some(dec!(59880));
    market.set(btc).await;
    market.set(MarketSnapshot::new("SOLUSDT", dec!(100))).await;
    let venue = Arc::new(PaperVenue::new("paper", market.clone(), config));
    (market, venue)
}

fn intent(key: &str, kind: IntentKind, size: Decimal) -> OrderIntent {
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
        idempotency_key: IdempotencyKey::new(key),
        reason: "test".into(),
    }
}

#[tokio::test]
async fn lost_ack_is_recovered_by_lookup_not_resent() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    let gateway = ExchangeGateway::new(settings(RetryPolicy::immediate(3)))
        .with_venue(venue.clone(), &config);

    venue.faults().drop_next_acks(1);
    let fill = gateway
        .place_order(&intent("momentum-a", IntentKind::Open, dec!(2)))
        .await
        .unwrap();

    assert_eq!(fill.size, dec!(2));
    assert_eq!(venue.submissions(), 1);
    assert_eq!(venue.order_count().await, 1);
    assert_eq!(venue.position("SOLUSDT", MarketKind::Perp).await, dec!(2));
}

#[tokio::test]
async fn failed_placement_retried_with_same_key_yields_one_order() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    // A single attempt: the dropped ack exhausts the retry budget
    let gateway = ExchangeGateway::new(settings(RetryPolicy::immediate(1)))
        .with_venue(venue.clone(), &config);

    let order = intent("momentum-b", IntentKind::Open, dec!(3));
    venue.faults().drop_next_acks(1);
    let err = gateway.place_order(&order).await.unwrap_err();
    assert!(matches!(err, OrderError::MaxRetriesExceeded { attempts: 1, .. }));

    let fill = gateway.place_order(&order).await.unwrap();
    assert_eq!(fill.size, dec!(3));
    assert_eq!(venue.submissions(), 1);
    assert_eq!(venue.orders_with_prefix("momentum-b").await.len(), 1);
    assert_eq!(venue.position("SOLUSDT", MarketKind::Perp).await, dec!(3));
}

#[tokio::test]
async fn completed_key_returns_cached_fill() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    let gateway = ExchangeGateway::new(settings(RetryPolicy::immediate(3)))
        .with_venue(venue.clone(), &config);

    let order = intent("momentum-c", IntentKind::Open, dec!(1));
    let first = gateway.place_order(&order).await.unwrap();
    let second = gateway.place_order(&order).await.unwrap();
    assert_eq!(first.primary_order_id(), second.primary_order_id());
    assert_eq!(venue.submissions(), 1);

    let mut changed = order.clone();
    changed.size = dec!(5);
    let err = gateway.place_order(&changed).await.unwrap_err();
    assert!(matches!(err, OrderError::IdempotencyConflict { .. }));
}

#[tokio::test]
async fn server_errors_are_retried_auth_errors_are_not() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    let gateway = ExchangeGateway::new(settings(RetryPolicy::immediate(4)))
        .with_venue(venue.clone(), &config);

    venue.faults().fail_next_with_server_error(2);
    gateway
        .place_order(&intent("momentum-d", IntentKind::Open, dec!(1)))
        .await
        .unwrap();
    assert_eq!(venue.submissions(), 1);

    venue.faults().set_auth_failure(true);
    let err = gateway
        .place_order(&intent("momentum-e", IntentKind::Open, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Conn(ConnError::Auth { .. })));
    assert_eq!(venue.submissions(), 1);
}

#[tokio::test]
async fn empty_bucket_surfaces_rate_limit_exceeded() {
    let config = VenueConfig {
        rate_limit_burst: 1,
        rate_limit_per_sec: 1,
        ..Default::default()
    };
    let (_market, venue) = paper(&config).await;
    let gateway = ExchangeGateway::new(GatewaySettings {
        rate_limit_max_wait: Duration::ZERO,
        ..settings(RetryPolicy::immediate(3))
    })
    .with_venue(venue.clone(), &config);

    gateway
        .place_order(&intent("momentum-f", IntentKind::Open, dec!(1)))
        .await
        .unwrap();
    let err = gateway
        .place_order(&intent("momentum-g", IntentKind::Open, dec!(1)))
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(venue.submissions(), 1);
}

#[tokio::test]
async fn halt_blocks_opening_but_not_closing() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    let (_halt_tx, halt_rx) = watch::channel(true);
    let gateway = ExchangeGateway::new(settings(RetryPolicy::immediate(3)))
        .with_venue(venue.clone(), &config)
        .with_halt_signal(halt_rx);

    let err = gateway
        .place_order(&intent("momentum-h", IntentKind::Open, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Blocked(_)));
    assert_eq!(venue.submissions(), 0);

    venue
        .set_position("SOLUSDT", MarketKind::Perp, dec!(4), dec!(100))
        .await;
    let fill = gateway
        .place_order(&intent("close-momentum-h", IntentKind::Close, dec!(4)))
        .await
        .unwrap();
    assert_eq!(fill.size, dec!(4));
    assert_eq!(venue.position("SOLUSDT", MarketKind::Perp).await, Decimal::ZERO);
}

#[tokio::test]
async fn hedge_opens_short_perp_and_long_spot() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    let gateway = ExchangeGateway::new(settings(RetryPolicy::immediate(3)))
        .with_venue(venue.clone(), &config);

    let mut hedge = intent("funding_arb-a", IntentKind::Open, dec!(0.1));
    hedge.strategy_id = "funding_arb".into();
    hedge.symbol = "BTCUSDT".into();
    hedge.side = PositionSide::Hedge;
    hedge.long_market = MarketKind::Spot;
    hedge.reference_price = dec!(60000);
    hedge.hedge_reference_price = Some(dec!(59880));

    let fill = gateway.place_order(&hedge).await.unwrap();
    assert_eq!(fill.legs.len(), 2);
    assert!(fill.hedge_price.is_some());
    assert_eq!(venue.position("BTCUSDT", MarketKind::Perp).await, dec!(-0.1));
    assert_eq!(venue.position("BTCUSDT", MarketKind::Spot).await, dec!(0.1));
}

#[tokio::test]
async fn slow_venue_reports_latency_transitions() {
    let config = VenueConfig::default();
    let (_market, venue) = paper(&config).await;
    let (tx, mut rx) = mpsc::channel(8);
    let gateway = ExchangeGateway::new(GatewaySettings {
        latency_window: 1,
        latency_threshold: Duration::from_millis(10),
        ..settings(RetryPolicy::immediate(3))
    })
    .with_venue(venue.clone(), &config)
    .with_risk_events(tx);

    venue.faults().set_latency(Duration::from_millis(40));
    gateway
        .place_order(&intent("momentum-i", IntentKind::Open, dec!(1)))
        .await
        .unwrap();
    match rx.try_recv().unwrap() {
        RiskEvent::HighLatency { venue, average_ms } => {
            assert_eq!(venue, "paper");
            assert!(average_ms >= 40);
        }
        other => panic!("expected HighLatency, got {:?}", other),
    }
    assert!(gateway.latency_snapshot()[0].high);

    venue.faults().set_latency(Duration::ZERO);
    gateway
        .place_order(&intent("momentum-j", IntentKind::Open, dec!(1)))
        .await
        .unwrap();
    assert!(matches!(
        rx.try_recv().unwrap(),
        RiskEvent::LatencyRecovered { .. }
    ));
    assert!(!gateway.latency_snapshot()[0].high);
}
