// =============================================================================
// Error taxonomy — classified errors surfaced across the connector
// =============================================================================
//
// Every variant here corresponds to one entry of the error taxonomy the
// connector publishes to embedders. Fields are chosen so callers can match
// on the *reason*, not just a string: a risk engine deciding whether to
// retry a cancel needs `temporary`, not a formatted message.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Caller supplied invalid input.
    #[error("validation failed: field={field} value={value} constraint={constraint}")]
    Validation {
        field: String,
        value: String,
        constraint: String,
    },

    /// Transport failure. `temporary` drives circuit-breaker accounting.
    #[error("connection error: {message} (temporary={temporary})")]
    Connection { message: String, temporary: bool },

    /// The WebSocket reconnect loop exhausted its attempt budget.
    #[error("websocket reconnect exhausted after {attempts} attempts")]
    WebSocketReconnect { attempts: u32 },

    /// Admission denied by the venue. Not counted as a circuit failure.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Duration },

    /// Call rejected locally by an open circuit.
    #[error("circuit open, half-open in {time_to_half_open:?}")]
    CircuitOpen { time_to_half_open: Duration },

    /// Clock drift exceeded the configured threshold.
    #[error("clock sync failed: offset {offset_ms}ms exceeds max {max_offset_ms}ms")]
    ClockSync { offset_ms: i64, max_offset_ms: i64 },

    /// The venue rejected the request signature.
    #[error("signature rejected by venue: {message}")]
    Signature { message: String },

    /// A venue-specified business error (not a transport failure).
    #[error("exchange error {code}: {message}")]
    Exchange {
        code: i64,
        message: String,
        retryable: bool,
    },

    /// The referenced entity (order, symbol, ...) is not known.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The operation was canceled via a user-supplied deadline or shutdown.
    #[error("canceled")]
    Canceled,

    /// A public method was called before `start()` or after `stop()`.
    #[error("connector is not running")]
    NotRunning,

    /// The supplied configuration failed eager validation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Failed to serialize or deserialize a wire message.
    #[error("wire format error: {0}")]
    Wire(#[from] serde_json::Error),

    /// Underlying HTTP transport error.
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Underlying WebSocket transport error.
    #[error("websocket transport error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ConnectorError {
    /// Whether the breaker should count this error as a failure.
    ///
    /// Rate-limit rejections are expected backpressure (§4.5) and never
    /// count; everything else that reaches the breaker does.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, ConnectorError::RateLimit { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Connection { temporary, .. } => *temporary,
            ConnectorError::Exchange { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
