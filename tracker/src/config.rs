//! Application configuration constants
//!
//! Central location for all configuration constants, resource limits,
//! and defaults used throughout the tracker core.

// ===== Sync Engine =====

/// Interval between periodic sync cycles in seconds
pub const SYNC_INTERVAL_SECS: u64 = 30;

/// Maximum outbox entries replayed per sync cycle
pub const OUTBOX_BATCH_LIMIT: i64 = 50;

/// Maximum location pings uploaded per sync cycle
pub const PING_BATCH_LIMIT: i64 = 100;

/// Outbox entries whose retry count exceeds this are dropped.
/// Dropping is a permanent data loss and is logged at error level.
pub const MAX_OUTBOX_RETRIES: i64 = 10;

/// Synced location pings older than this many days are purged locally
pub const PING_RETENTION_DAYS: i64 = 30;

// ===== Remote API =====

/// Total attempts for a direct API call (first try included)
pub const API_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between API attempts (1s, 2s, 4s)
pub const API_BASE_BACKOFF_MS: u64 = 1_000;

/// Transport-level timeout for a single HTTP request
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Longest response body kept in error messages and logs
pub const MAX_LOG_BODY_CHARS: usize = 512;

// ===== Shift Lifecycle =====

/// How long the shift summary stays up before returning to idle
pub const SHIFT_SUMMARY_DELAY_SECS: u64 = 5;

/// Category used when an expense is saved without one
pub const DEFAULT_EXPENSE_CATEGORY: &str = "General";

// ===== Location Tracking =====

/// Fix interval while waiting for a ride (milliseconds)
pub const WAITING_INTERVAL_MS: u64 = 15_000;

/// Distance filter while waiting for a ride (meters)
pub const WAITING_DISTANCE_FILTER_M: f64 = 15.0;

/// Fix interval during a ride (milliseconds)
pub const RIDE_INTERVAL_MS: u64 = 4_000;

/// Distance filter during a ride (meters)
pub const RIDE_DISTANCE_FILTER_M: f64 = 5.0;

// ===== Settings Keys =====

/// Key/value settings row holding the API base URL
pub const API_BASE_URL_KEY: &str = "api_base_url";

/// Key/value settings row holding the device bearer token
pub const DEVICE_TOKEN_KEY: &str = "device_token";

/// File name of the engine tunables inside the app data directory
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// File name of the SQLite database inside the app data directory
pub const DATABASE_FILE_NAME: &str = "tracker.db";
