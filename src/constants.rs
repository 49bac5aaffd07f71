//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Bucketron.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

// ============================================================================
// Interval Shortcut Constants
// ============================================================================

/// Milliseconds in one second, the `per_second` shortcut interval.
pub const INTERVAL_PER_SECOND_MS: u64 = 1_000;

/// Milliseconds in one minute, the `per_minute` shortcut interval.
pub const INTERVAL_PER_MINUTE_MS: u64 = 60_000;

/// Milliseconds in one hour, the `per_hour` shortcut interval.
pub const INTERVAL_PER_HOUR_MS: u64 = 3_600_000;

/// Milliseconds in one day, the `per_day` shortcut interval.
pub const INTERVAL_PER_DAY_MS: u64 = 86_400_000;

// ============================================================================
// Bucket Lifetime Constants
// ============================================================================

/// Upper bound for a bucket instance TTL (one week).
///
/// A derived TTL never exceeds this value, so an abandoned key is always
/// reclaimed by the store within a week of its last mutation.
pub const DEFAULT_GLOBAL_TTL_SECS: u64 = 604_800;

/// Capacity of the per-type regex-override cache.
///
/// Bounds memory growth when bucket keys are unique (e.g. one key per
/// client IP). Eviction is LRU.
pub const OVERRIDE_CACHE_CAPACITY: usize = 50;

// ============================================================================
// Key Validation Constants
// ============================================================================

/// Maximum length of a bucket key supplied by the caller.
pub const MAX_KEY_LENGTH: usize = 255;

// ============================================================================
// Resilience Constants
// ============================================================================

/// Default number of retries after the first failed attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 1;

/// Minimum backoff between attempts, in milliseconds.
pub const DEFAULT_RETRY_MIN_BACKOFF_MS: u64 = 10;

/// Maximum backoff between attempts, in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 30;

/// Default per-attempt command timeout, in milliseconds.
///
/// Kept tight because the retry budget above re-dispatches quickly; a slow
/// store answer is worth less than a fresh attempt.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 75;

/// Consecutive counted failures that trip the circuit breaker.
pub const DEFAULT_BREAKER_MAX_FAILURES: u32 = 10;

/// Rolling window within which failures are considered consecutive.
pub const DEFAULT_BREAKER_WINDOW_MS: u64 = 1_000;

/// Initial cooldown after the breaker opens, in milliseconds.
pub const DEFAULT_BREAKER_COOLDOWN_MS: u64 = 1_000;

/// Ceiling for the escalating cooldown, in milliseconds.
pub const DEFAULT_BREAKER_MAX_COOLDOWN_MS: u64 = 3_000;

// ============================================================================
// Ping Monitor Constants
// ============================================================================

/// Default interval between liveness pings, in milliseconds.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 3_000;

/// Failed pings tolerated before the monitor escalates.
pub const DEFAULT_PING_MAX_FAILED_ATTEMPTS: u32 = 5;

/// Upper bound of the reconnect jitter factor.
///
/// The jitter before a forced reconnect is drawn from
/// `[0, PING_RECONNECT_JITTER_FACTOR] * interval * max_failed_attempts`.
pub const PING_RECONNECT_JITTER_FACTOR: f64 = 0.1;

// ============================================================================
// Store Driver Constants
// ============================================================================

/// SCAN batch size used when listing bucket instances.
pub const SCAN_COUNT: usize = 100;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
