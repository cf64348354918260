use anyhow::{bail, Context, Result};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::*;

pub struct Client {
    url: String,
    client: reqwest::Client,
}
impl Client {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::new();
        Self { url, client }
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub async fn post_create(&self, request: &CreatePredictionRequest) -> Result<Response> {
        Ok(self
            .client
            .post(self.url.clone() + "/predictions/create")
            .json(request)
            .send()
            .await?)
    }
    pub async fn post_vote(&self, prediction: RowId, request: &VoteRequest) -> Result<Response> {
        Ok(self
            .client
            .post(format!("{}/predictions/{}/vote", self.url, prediction))
            .json(request)
            .send()
            .await?)
    }
    pub async fn get(&self, path: &str) -> Result<Response> {
        Ok(self.client.get(self.url.clone() + path).send().await?)
    }
    pub async fn create_prediction(
        &self,
        request: &CreatePredictionRequest,
    ) -> Result<CreatePredictionResponse> {
        data(self.post_create(request).await?, StatusCode::OK).await
    }
    pub async fn vote(&self, prediction: RowId, voter: &str, support: bool) -> Result<VoteResponse> {
        let request = VoteRequest {
            voter: Some(voter.to_string()),
            support: Some(support),
        };
        data(self.post_vote(prediction, &request).await?, StatusCode::OK).await
    }
    pub async fn get_active_predictions(&self) -> Result<Vec<Prediction>> {
        data(self.get("/predictions/active").await?, StatusCode::OK).await
    }
    pub async fn get_approved_predictions(&self) -> Result<Vec<Prediction>> {
        data(self.get("/predictions/approved").await?, StatusCode::OK).await
    }
    pub async fn get_prediction_count(&self) -> Result<u64> {
        let count: CountResponse =
            data(self.get("/predictions/count").await?, StatusCode::OK).await?;
        Ok(count.total_predictions)
    }
    pub async fn get_prediction(&self, prediction: RowId) -> Result<PredictionDetailResponse> {
        let path = format!("/predictions/{}", prediction);
        data(self.get(&path).await?, StatusCode::OK).await
    }
    pub async fn get_voting_stats(&self, prediction: RowId) -> Result<VotingStats> {
        let path = format!("/predictions/{}/voting-stats", prediction);
        data(self.get(&path).await?, StatusCode::OK).await
    }
    pub async fn has_voted(&self, prediction: RowId, voter: &str) -> Result<bool> {
        let path = format!("/predictions/{}/has-voted/{}", prediction, voter);
        let response: HasVotedResponse = data(self.get(&path).await?, StatusCode::OK).await?;
        Ok(response.has_voted)
    }
    pub async fn get_profile(&self, creator: &str) -> Result<Profile> {
        let path = format!("/profiles/{}", creator);
        data(self.get(&path).await?, StatusCode::OK).await
    }
    pub async fn health(&self) -> Result<HealthResponse> {
        data(self.get("/health").await?, StatusCode::OK).await
    }
}

async fn data<T: DeserializeOwned>(response: Response, expected_code: StatusCode) -> Result<T> {
    let response = bail_if_err(response, expected_code).await?;
    response
        .json::<ApiResponse<T>>()
        .await?
        .data
        .context("Response carried no data")
}

pub async fn bail_if_err(response: Response, expected_code: StatusCode) -> Result<Response> {
    if response.status() != expected_code {
        bail!("{}: {}", response.status(), response.text().await?)
    } else {
        Ok(response)
    }
}
