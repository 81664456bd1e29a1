//! Hard limits. Anything a client controls is bounded here.

use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

// ── Tenants ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_EXPERIENCES_PER_TENANT: usize = 10_000;
pub const MAX_TICKET_TYPES_PER_EXPERIENCE: usize = 64;
pub const MAX_SESSIONS_PER_EVENT: usize = 5_000;
pub const MAX_GUESTS_PER_TENANT: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 8_192;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 32;

// ── Capacity and orders ──────────────────────────────────────────

pub const MAX_CAPACITY: u32 = 100_000;
pub const MAX_TICKETS_PER_ORDER: u32 = 100;
pub const MAX_LINES_PER_ORDER: usize = 16;
/// 1,000,000.00 in minor units.
pub const MAX_PRICE_CENTS: i64 = 100_000_000;
pub const MAX_HOLD_TTL_MS: Ms = DAY_MS;

// ── Time ─────────────────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Longest single session.
pub const MAX_SESSION_DURATION_MS: Ms = 7 * DAY_MS;
/// Longest event date range.
pub const MAX_EVENT_RANGE_MS: Ms = 2 * 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;
