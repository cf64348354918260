//! Approval rules for predictions.
//!
//! Everything in here is pure. Ratios are compared with integers so that a
//! tally sitting exactly on the threshold (7 yes out of 10) is decided the
//! same way every time.
use crate::api::Status;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Share of yes votes, in percent, a prediction needs to be approved.
pub const APPROVAL_THRESHOLD_PERCENT: u64 = 70;

pub fn meets_threshold(yes_votes: u64, no_votes: u64) -> bool {
    let yes = u128::from(yes_votes);
    let total = yes + u128::from(no_votes);
    total > 0 && yes * 100 >= total * u128::from(APPROVAL_THRESHOLD_PERCENT)
}

pub fn decide_status(
    yes_votes: u64,
    no_votes: u64,
    now: DateTime<Utc>,
    end_time: DateTime<Utc>,
    current: Status,
) -> Status {
    if current.is_terminal() {
        return current;
    }
    if meets_threshold(yes_votes, no_votes) {
        Status::Approved
    } else if now >= end_time {
        Status::Closed
    } else {
        Status::Active
    }
}

/// Display value only, rounded to two decimals. Never feed this back into
/// [`decide_status`].
pub fn approval_percentage(yes_votes: u64, no_votes: u64) -> Decimal {
    let total = Decimal::from(yes_votes) + Decimal::from(no_votes);
    if total.is_zero() {
        return Decimal::ZERO;
    }
    (Decimal::from(yes_votes) * Decimal::ONE_HUNDRED / total).round_dp(2)
}
