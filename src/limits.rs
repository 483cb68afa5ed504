use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_CLIENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EXTERNAL_REF_LEN: usize = 512;

/// Calendar entries kept per room/staff member (including cancelled history).
pub const MAX_ENTRIES_PER_RESOURCE: usize = 100_000;

pub const MAX_CLASS_CAPACITY: u32 = 1_000;
pub const MAX_REGISTRATIONS_PER_CLASS: usize = 10_000;
pub const MAX_CREDITS_PER_CLASS: u32 = 100;
pub const MAX_PASS_CREDITS: u32 = 10_000;
pub const MAX_PASSES_PER_CLIENT: usize = 1_000;
pub const MAX_PRICE_CENTS: i64 = 100_000_000;

/// A single session or class may not run longer than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
