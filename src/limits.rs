use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PARTICIPANT_ID_LEN: usize = 256;
pub const MAX_POLICY_LEN: usize = 64;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 1000;
pub const MAX_IN_CLAUSE_IDS: usize = 1000;

/// Unix epoch.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_RESERVATIONS_PER_SOURCE: usize = 1_000_000;

/// Sources a new customer may own until the limit is raised.
pub const DEFAULT_MAX_SOURCE_LIMIT: u32 = 1;

/// API tokens are valid for one year from issuance.
pub const TOKEN_TTL_MS: Ms = 365 * 24 * 3_600_000;
