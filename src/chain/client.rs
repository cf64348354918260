use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::api::{Prediction, RowId, Status};
use crate::client::bail_if_err;

/// HTTP client for the gateway that relays calls to the prediction
/// contract. The gateway reports contract integers as decimal strings.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    pub url: String,
    api_key: Option<String>,
}
impl GatewayClient {
    pub fn new(url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::new();
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
    async fn post(
        &self,
        path: String,
        request: impl Serialize,
        expected_code: StatusCode,
    ) -> Result<Response> {
        let mut builder = self.client.post(self.url.clone() + path.as_str());
        if let Some(api_key) = &self.api_key {
            builder = builder.header("X-Api-Key", api_key);
        }
        let response = builder.json(&request).send().await?;
        bail_if_err(response, expected_code).await
    }
    async fn get(&self, path: &str, expected_code: StatusCode) -> Result<Response> {
        let mut builder = self.client.get(self.url.clone() + path);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("X-Api-Key", api_key);
        }
        let response = builder.send().await?;
        bail_if_err(response, expected_code).await
    }
    pub async fn create_prediction(
        &self,
        title: &str,
        description: &str,
        category: &str,
        voting_period_seconds: i64,
    ) -> Result<RowId> {
        let request = CreateRequest {
            title,
            description,
            category,
            voting_period_seconds,
        };
        let response = self
            .post("/predictions".to_string(), request, StatusCode::CREATED)
            .await?;
        let json = response.json::<CreateResponse>().await?;
        parse_number(&json.prediction_id, "predictionId")
    }
    pub async fn vote(&self, prediction: RowId, voter: &str, support: bool) -> Result<()> {
        let request = VoteRequest { voter, support };
        self.post(
            format!("/predictions/{}/vote", prediction),
            request,
            StatusCode::OK,
        )
        .await?;
        Ok(())
    }
    pub async fn get_predictions(&self, filter: &str) -> Result<Vec<ChainPrediction>> {
        let response = self
            .get(&format!("/predictions/{}", filter), StatusCode::OK)
            .await?;
        Ok(response.json::<Vec<ChainPrediction>>().await?)
    }
    pub async fn get_prediction_count(&self) -> Result<u64> {
        let response = self.get("/predictions/count", StatusCode::OK).await?;
        let json = response.json::<CountResponse>().await?;
        parse_number(&json.count, "count")
    }
    pub async fn is_reachable(&self) -> Result<()> {
        self.get("/status", StatusCode::OK).await?;
        Ok(())
    }
}
fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("gateway sent invalid {}: {}", field, value))
}
fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    let seconds: i64 = parse_number(value, field)?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .with_context(|| format!("gateway sent out of range {}: {}", field, value))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    title: &'a str,
    description: &'a str,
    category: &'a str,
    voting_period_seconds: i64,
}
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    prediction_id: String,
}
#[derive(Debug, Clone, Serialize)]
struct VoteRequest<'a> {
    voter: &'a str,
    support: bool,
}
#[derive(Debug, Clone, Deserialize)]
struct CountResponse {
    count: String,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChainPrediction {
    pub id: String,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub end_time: String,
    pub is_active: bool,
    pub is_approved: bool,
    pub total_votes: String,
    pub yes_votes: String,
    pub no_votes: String,
    pub created_at: String,
}
impl TryFrom<ChainPrediction> for Prediction {
    type Error = anyhow::Error;

    fn try_from(chain: ChainPrediction) -> Result<Self> {
        let id = parse_number(&chain.id, "id")?;
        let yes_votes = parse_number(&chain.yes_votes, "yesVotes")?;
        let no_votes = parse_number(&chain.no_votes, "noVotes")?;
        let status = if chain.is_approved {
            Status::Approved
        } else if chain.is_active {
            Status::Active
        } else {
            Status::Closed
        };
        Ok(Prediction {
            id,
            creator: chain.creator,
            title: chain.title,
            description: chain.description,
            category: chain.category,
            end_time: parse_timestamp(&chain.end_time, "endTime")?,
            status,
            yes_votes,
            no_votes,
            total_votes: parse_number(&chain.total_votes, "totalVotes")?,
            is_approved: chain.is_approved,
            authority_id: Some(id),
            created_at: parse_timestamp(&chain.created_at, "createdAt")?,
        })
    }
}
