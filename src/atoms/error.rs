// ── Honyaku Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the translation core, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by failure domain (network, timeout,
//     session, plan, quota, …), mirroring what backends can actually report.
//   • Every variant carries owned `String` detail rather than a source error
//     so the enum stays `Clone` — responses and the relay's call coalescer
//     share errors by value.
//   • Retryability is a property of the variant (`is_retryable`), not of the
//     call site. The router consults it to decide fallback vs. fail-fast.
//   • No variant carries secret material (session tokens, API keys).

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Endpoint unreachable, connection reset, DNS failure.
    #[error("network error: {0}")]
    Network(String),

    /// A deadline elapsed before the backend answered.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Bearer session token missing, expired, or rejected (HTTP 401).
    /// Not retryable at this layer; the caller must re-authenticate.
    #[error("session token missing or expired")]
    SessionInvalid,

    /// The current license plan forbids this backend (HTTP 403).
    #[error("plan does not allow this operation: {0}")]
    PlanNotSupported(String),

    /// Monthly cap reached with no bonus tokens left.
    #[error("monthly token quota exceeded")]
    QuotaExceeded,

    /// HTTP 429 — retryable after backoff.
    #[error("rate limited by the relay")]
    RateLimited,

    /// Unexpected relay failure (5xx or otherwise unmapped status).
    #[error("relay API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A peer answered with something that does not parse as the protocol.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// Local inference fault (tokenizer, ONNX session, tensor shape).
    #[error("local inference error: {0}")]
    Processing(String),

    /// The circuit breaker is black-holing this backend.
    #[error("translation backend unavailable (circuit open)")]
    CircuitOpen,

    /// The caller cancelled the operation. Never retried, never counted as
    /// a backend failure.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid or missing configuration / model files. Fatal at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Internal(String),
}

// ── Classification ─────────────────────────────────────────────────────────

impl CoreError {
    /// Whether the router may advance to the next backend (or retry) after
    /// this error. Timeouts and network faults are transient; session, plan,
    /// and quota rejections are not fixed by trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Network(_)
                | CoreError::Timeout(_)
                | CoreError::RateLimited
                | CoreError::Api { .. }
                | CoreError::Protocol(_)
                | CoreError::CircuitOpen
        )
    }

    /// Stable machine-readable code, matching what the relay and the UI
    /// layer key on.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Network(_) => "NETWORK_ERROR",
            CoreError::Timeout(_) => "TIMEOUT",
            CoreError::SessionInvalid => "SESSION_INVALID",
            CoreError::PlanNotSupported(_) => "PLAN_NOT_SUPPORTED",
            CoreError::QuotaExceeded => "QUOTA_EXCEEDED",
            CoreError::RateLimited => "RATE_LIMITED",
            CoreError::Api { .. } => "API_ERROR",
            CoreError::Protocol(_) => "PROTOCOL_ERROR",
            CoreError::Processing(_) => "OPUSMT_ERROR",
            CoreError::CircuitOpen => "CIRCUIT_OPEN",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// ── Convenience constructors ───────────────────────────────────────────────

impl CoreError {
    pub fn network(detail: impl std::fmt::Display) -> Self {
        CoreError::Network(detail.to_string())
    }

    pub fn timeout(waited: std::time::Duration) -> Self {
        CoreError::Timeout(waited.as_millis() as u64)
    }

    pub fn processing(detail: impl std::fmt::Display) -> Self {
        CoreError::Processing(detail.to_string())
    }

    pub fn protocol(detail: impl std::fmt::Display) -> Self {
        CoreError::Protocol(detail.to_string())
    }

    pub fn config(detail: impl std::fmt::Display) -> Self {
        CoreError::Config(detail.to_string())
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        CoreError::Internal(detail.to_string())
    }
}

// ── External error conversions ─────────────────────────────────────────────
// Converted eagerly to strings so `CoreError` stays `Clone`.

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not expose the elapsed duration; callers that know
            // their deadline use `CoreError::timeout` directly.
            CoreError::Timeout(0)
        } else {
            CoreError::Network(e.to_string())
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All core operations should return this type.
pub type CoreResult<T> = Result<T, CoreError>;

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::Network("down".into()).is_retryable());
        assert!(CoreError::Timeout(1500).is_retryable());
        assert!(CoreError::RateLimited.is_retryable());
        assert!(CoreError::CircuitOpen.is_retryable());
        assert!(CoreError::Api { status: 502, message: "bad gateway".into() }.is_retryable());

        assert!(!CoreError::SessionInvalid.is_retryable());
        assert!(!CoreError::PlanNotSupported("free".into()).is_retryable());
        assert!(!CoreError::QuotaExceeded.is_retryable());
        assert!(!CoreError::Processing("shape mismatch".into()).is_retryable());
        assert!(!CoreError::Config("missing model".into()).is_retryable());
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(CoreError::QuotaExceeded.code(), "QUOTA_EXCEEDED");
        assert_eq!(CoreError::SessionInvalid.code(), "SESSION_INVALID");
        assert_eq!(CoreError::Processing("x".into()).code(), "OPUSMT_ERROR");
        assert_eq!(CoreError::CircuitOpen.code(), "CIRCUIT_OPEN");
    }

    #[test]
    fn test_io_error_converts_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Network(_)));
    }
}
