use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::*;

/// Envelope every endpoint answers with.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            count: None,
            message: None,
            error: None,
        }
    }
    pub fn failure(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            count: None,
            message: Some(message.into()),
            error,
        }
    }
}
impl<T> ApiResponse<Vec<T>> {
    pub fn list(data: Vec<T>) -> Self {
        let count = data.len();
        Self {
            success: true,
            data: Some(data),
            count: Some(count),
            message: None,
            error: None,
        }
    }
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreatePredictionResponse {
    pub id: RowId,
    pub authority_id: Option<RowId>,
    pub message: String,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub prediction_id: RowId,
    pub voter: VoterId,
    pub support: bool,
    pub total_votes: u64,
    pub yes_votes: u64,
    pub no_votes: u64,
    pub is_approved: bool,
    pub status: Status,
    pub message: String,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub total_predictions: u64,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PredictionDetailResponse {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub votes: Vec<Vote>,
    pub voting_stats: VotingStats,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HasVotedResponse {
    pub has_voted: bool,
    pub prediction_id: RowId,
    #[serde(rename = "userAddress", alias = "voter")]
    pub voter: VoterId,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub authority_configured: bool,
    pub authority_reachable: bool,
    pub timestamp: DateTime<Utc>,
}
