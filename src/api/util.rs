use chrono::{DateTime, Duration, Utc};

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const MAX_VOTING_PERIOD_DAYS: u32 = 365;

pub fn voting_end(now: DateTime<Utc>, voting_period_days: u32) -> DateTime<Utc> {
    now + Duration::seconds(i64::from(voting_period_days) * SECONDS_PER_DAY)
}
