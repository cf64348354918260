use serde::{Deserialize, Serialize};

// Fields are optional so that missing ones are reported as validation
// errors by the handlers instead of being rejected by the extractor.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreatePredictionRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    #[serde(alias = "votingPeriod")]
    pub voting_period_days: Option<u32>,
    pub creator: Option<String>,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub voter: Option<String>,
    pub support: Option<bool>,
}
