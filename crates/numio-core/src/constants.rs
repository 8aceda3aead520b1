//! Protocol constants. Timings are seconds unless the name says otherwise.

/// Base window an acquired number stays live without an SMS (≈10 min).
pub const NUMBER_BASE_TIMEOUT_SECS: i64 = 600;

/// Extended window after the first SMS arrives (≈15 min total).
pub const NUMBER_EXTENDED_TIMEOUT_SECS: i64 = 900;

/// Age after which a RESERVED activation is considered a zombie.
pub const ZOMBIE_RESERVATION_AGE_SECS: i64 = 600;

/// Delay before the first poll of a freshly activated order.
pub const INITIAL_POLL_DELAY_SECS: i64 = 2;

// ── Poll manager ─────────────────────────────────────────────────────────────

/// TTL of the distributed poll-cycle lock.
pub const POLL_CYCLE_LOCK_TTL_SECS: i64 = 30;

/// Cache key of the poll-cycle lock.
pub const POLL_CYCLE_LOCK_KEY: &str = "poll_cycle_lock";

/// Minimum provider group size for the batched status path.
pub const BATCH_MIN_GROUP: usize = 5;

/// Ids per batched status call.
pub const BATCH_CHUNK_SIZE: usize = 20;

/// Concurrent chunks in flight per provider.
pub const BATCH_MAX_PARALLEL_CHUNKS: usize = 3;

/// Per-chunk timeout.
pub const BATCH_CHUNK_TIMEOUT_SECS: u64 = 10;

/// Per-adapter-call timeout.
pub const ADAPTER_CALL_TIMEOUT_SECS: u64 = 5;

/// Pre-SMS items older than this prefer the batched path.
pub const BATCH_ELIGIBLE_AGE_SECS: i64 = 60;

// ── Circuit breaker ──────────────────────────────────────────────────────────

/// Calls in the rolling window before the error rate is meaningful.
pub const BREAKER_VOLUME_THRESHOLD: usize = 10;

/// Error percentage over the window that opens the breaker.
pub const BREAKER_ERROR_PERCENT: u32 = 50;

/// Open-to-half-open cooldown.
pub const BREAKER_HALF_OPEN_SECS: i64 = 30;

// ── Outbox ───────────────────────────────────────────────────────────────────

/// Retry budget before a row is parked as FAILED.
pub const OUTBOX_MAX_RETRIES: u32 = 5;

/// Backoff ceiling (5 min).
pub const OUTBOX_BACKOFF_CAP_SECS: i64 = 300;

/// A PUBLISHED claim older than this with no completion is reclaimable.
pub const OUTBOX_CLAIM_LEASE_SECS: i64 = 60;

// ── Reaper ───────────────────────────────────────────────────────────────────

/// Sweep interval.
pub const REAPER_INTERVAL_SECS: u64 = 30;

/// Rows per sweep, per category.
pub const REAPER_BATCH_SIZE: usize = 100;

/// Probability of the housekeeping sweep per cycle (1 %).
pub const HOUSEKEEPING_PROBABILITY: f64 = 0.01;

/// Purge horizon for dead reservations and settled outbox rows.
pub const HOUSEKEEPING_PURGE_AGE_SECS: i64 = 7 * 24 * 3600;
