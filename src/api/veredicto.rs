use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type RowId = i64;
pub type VoterId = String;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum Status {
    Active,
    Approved,
    Closed,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: RowId,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub end_time: DateTime<Utc>,
    pub status: Status,
    pub yes_votes: u64,
    pub no_votes: u64,
    pub total_votes: u64,
    pub is_approved: bool,
    pub authority_id: Option<RowId>,
    pub created_at: DateTime<Utc>,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub voter: VoterId,
    pub support: bool,
    pub timestamp: DateTime<Utc>,
}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub yes_votes: u64,
    pub no_votes: u64,
    pub total_votes: u64,
    pub status: Status,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VotingStats {
    pub yes_votes: u64,
    pub no_votes: u64,
    pub total_votes: u64,
    pub approval_percentage: Decimal,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub creator: String,
    pub predictions_created: u64,
    pub predictions_approved: u64,
    pub reputation: i64,
}
