use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum PantherError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Exchange connectivity
    #[error("Connection error: {0}")]
    Conn(#[from] ConnError),

    // Order placement
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    // Risk gate
    #[error("Risk rejection: {0}")]
    Risk(#[from] RiskError),

    // State store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for PantherError
pub type Result<T> = std::result::Result<T, PantherError>;

/// Network and session failures talking to a venue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    #[error("request to {venue} timed out after {elapsed_ms}ms")]
    Timeout { venue: String, elapsed_ms: u64 },

    #[error("{venue} returned server error {status}: {message}")]
    Server {
        venue: String,
        status: u16,
        message: String,
    },

    #[error("network failure talking to {venue}: {message}")]
    Network { venue: String, message: String },

    #[error("authentication rejected by {venue}: {message}")]
    Auth { venue: String, message: String },

    #[error("rate limit exceeded for {venue} after waiting {waited_ms}ms")]
    RateLimited { venue: String, waited_ms: u64 },

    #[error("unknown venue: {0}")]
    UnknownVenue(String),
}

impl ConnError {
    /// Transient errors are retried with backoff; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnError::Timeout { .. } | ConnError::Server { .. } | ConnError::Network { .. }
        )
    }

    /// A timeout means the request may have reached the venue.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ConnError::Timeout { .. })
    }
}

/// Placement failures surfaced to the owning strategy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid size precision for {symbol}: {size}")]
    InvalidSymbolPrecision { symbol: String, size: Decimal },

    #[error("price slippage exceeded: limit {limit}, actual {actual}")]
    SlippageExceeded { limit: Decimal, actual: Decimal },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("idempotency key {key} reused for a different request")]
    IdempotencyConflict { key: String },

    #[error("order {order_id} ended without a fill ({status})")]
    Unfilled { order_id: String, status: String },

    #[error("rate limit exceeded for {venue} after waiting {waited_ms}ms")]
    RateLimitExceeded { venue: String, waited_ms: u64 },

    #[error("max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u32, last: String },

    #[error("placement blocked before submission: {0}")]
    Blocked(String),

    #[error(transparent)]
    Conn(ConnError),
}

impl From<ConnError> for OrderError {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::RateLimited { venue, waited_ms } => {
                OrderError::RateLimitExceeded { venue, waited_ms }
            }
            other => OrderError::Conn(other),
        }
    }
}

impl OrderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, OrderError::RateLimitExceeded { .. })
    }

    /// The venue may hold an order for the key; only a lookup by client id
    /// settles whether it filled
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, OrderError::MaxRetriesExceeded { .. } | OrderError::Conn(_))
    }
}

/// Hard rejections from the risk governor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("kill switch engaged: {reason}")]
    KillSwitchEngaged { reason: String },

    #[error("leverage exceeded for {strategy_id}: {leverage} > {max_leverage}")]
    LeverageExceeded {
        strategy_id: String,
        leverage: Decimal,
        max_leverage: Decimal,
    },

    #[error("no capital allocated to {0}")]
    NoAllocation(String),
}

/// State store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("compare-and-set conflict on {key}: expected version {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("compare-and-set retries exhausted on {key} after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("store io failure: {0}")]
    Io(String),

    #[error("store snapshot corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_error_classification() {
        let timeout = ConnError::Timeout {
            venue: "binance".into(),
            elapsed_ms: 10_000,
        };
        assert!(timeout.is_transient());
        assert!(timeout.is_ambiguous());

        let server = ConnError::Server {
            venue: "binance".into(),
            status: 503,
            message: "busy".into(),
        };
        assert!(server.is_transient());
        assert!(!server.is_ambiguous());

        let auth = ConnError::Auth {
            venue: "binance".into(),
            message: "bad signature".into(),
        };
        assert!(!auth.is_transient());
    }

    #[test]
    fn test_rate_limit_surfaces_as_order_error() {
        let err: OrderError = ConnError::RateLimited {
            venue: "paper".into(),
            waited_ms: 2000,
        }
        .into();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_invalid_config_message_joins_problems() {
        let err = PantherError::InvalidConfig(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Invalid configuration: a; b");
    }
}
