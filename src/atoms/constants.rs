// ── Honyaku Atoms: Constants ───────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Local MT (OPUS-MT / ONNX) ──────────────────────────────────────────────
// Helsinki OPUS-MT models ship without an explicit pad id in some exports;
// 60715 is the padding row those vocabularies reserve. Treat as a stable
// model-family identifier, not a tunable.
pub(crate) const HELSINKI_PAD_SENTINEL: i64 = 60715;

/// Encoder input longer than this is truncated before inference.
pub(crate) const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 256;

/// Hard cap on the greedy decode loop.
pub(crate) const DEFAULT_MAX_OUTPUT_LENGTH: usize = 100;

/// Logit divisor for already-emitted ids. 1.0 disables the penalty.
pub(crate) const DEFAULT_REPETITION_PENALTY: f32 = 1.2;

/// Models with `BOS == EOS` (Helsinki convention) would otherwise terminate
/// at step 0. EOS is not honored before this many decode steps.
pub(crate) const DEFAULT_MIN_STEPS_BEFORE_EOS: usize = 3;

// ── NLLB-200 subprocess server ─────────────────────────────────────────────
pub(crate) const DEFAULT_NLLB_PORT: u16 = 5555;
pub(crate) const NLLB_READY_MARKER: &str = "MODEL_READY:";
pub(crate) const NLLB_STARTUP_TIMEOUT_SECS: u64 = 120;
pub(crate) const NLLB_STOP_GRACE_SECS: u64 = 5;
pub(crate) const NLLB_RESTART_DELAY_SECS: u64 = 2;

/// Send/receive buffer size for one framed connection. Typical payloads are
/// a few hundred bytes; 8 KiB absorbs batch responses without reallocating.
pub(crate) const CONNECTION_BUF_BYTES: usize = 8 * 1024;
pub(crate) const CONNECTION_IO_TIMEOUT_SECS: u64 = 10;

/// Read deadline for a single (non-batch) translate RPC.
pub(crate) const SINGLE_READ_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_MAX_BATCH_SIZE: usize = 50;
pub(crate) const DEFAULT_POOL_CAPACITY: usize = 10;

// ── Circuit breaker ────────────────────────────────────────────────────────
pub(crate) const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub(crate) const BREAKER_COOL_DOWN_SECS: u64 = 30;

// ── Cloud relay ────────────────────────────────────────────────────────────
pub(crate) const RELAY_TIMEOUT_SECS: u64 = 30;
pub(crate) const RELAY_MAX_RETRIES: u32 = 3;
pub(crate) const RELAY_RETRY_DELAY_MS: u64 = 1000;

/// Responses larger than this are rejected before parsing.
pub(crate) const RELAY_MAX_BODY_BYTES: usize = 1024 * 1024;

/// TTL for coalesced metadata calls (quota status, sync init, bonus status).
pub(crate) const COALESCE_TTL_SECS: u64 = 30;

// ── License / quota ────────────────────────────────────────────────────────
/// Month key format for monthly usage buckets, e.g. "2025-01".
pub(crate) const MONTH_KEY_FORMAT: &str = "%Y-%m";
