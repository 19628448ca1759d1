use std::time::Duration;

use crate::model::Ms;

// ── Per-tenant caps ─────────────────────────────────────────────

pub const MAX_UNITS_PER_TENANT: usize = 10_000;
pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 64;

// ── Field bounds ────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 500;
pub const MAX_REASON_LEN: usize = 500;

// ── Stay and query bounds ───────────────────────────────────────

/// Longest bookable stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 30;

/// Widest window accepted by availability/occupancy/free-range queries.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 730;

/// Furthest ahead the calendar seeding routine will pre-populate.
pub const MAX_SEED_DAYS_AHEAD: i64 = 365;

/// Day rows older than this are pruned by the lifecycle sweeper.
pub const CALENDAR_RETENTION_DAYS: i64 = 365;

/// Dates outside [2000-01-01, 2200-01-01) are rejected outright.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;

/// Cleaning buffer after checkout when the caller does not set one.
pub const DEFAULT_CLEANING_DAYS: u32 = 1;

// ── Holds and locking ───────────────────────────────────────────

/// Default hold TTL when the caller does not supply one (15 minutes).
pub const DEFAULT_HOLD_TTL_MS: Ms = 15 * 60 * 1000;

/// Longest hold a caller may request (offline-payment bot flows use ~3h).
pub const MAX_HOLD_TTL_MS: Ms = 24 * 60 * 60 * 1000;

/// Bounded wait for a unit's write lock; exceeding it surfaces `LockTimeout`.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);

// ── Background cadence ──────────────────────────────────────────

pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const LIFECYCLE_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const COMPACTOR_INTERVAL: Duration = Duration::from_secs(60);
