use crate::{
    api::{Prediction, RowId},
    authority::{Authority, AuthorityPrediction},
};
use anyhow::Result;
use chrono::Utc;

use super::client::GatewayClient;

pub struct GatewayAuthority {
    gateway: GatewayClient,
}
impl GatewayAuthority {
    pub fn new(url: String, api_key: Option<String>) -> Self {
        Self {
            gateway: GatewayClient::new(url, api_key),
        }
    }
    async fn predictions(&self, filter: &str) -> Result<Vec<Prediction>> {
        self.gateway
            .get_predictions(filter)
            .await?
            .into_iter()
            .map(Prediction::try_from)
            .collect()
    }
}
#[async_trait::async_trait]
impl Authority for GatewayAuthority {
    async fn create_prediction(&self, prediction: &AuthorityPrediction) -> Result<RowId> {
        // The contract takes a period, not a deadline.
        let period = (prediction.end_time - Utc::now()).num_seconds().max(1);
        self.gateway
            .create_prediction(
                &prediction.title,
                &prediction.description,
                &prediction.category,
                period,
            )
            .await
    }
    async fn vote(&self, prediction: RowId, voter: &str, support: bool) -> Result<()> {
        self.gateway.vote(prediction, voter, support).await
    }
    async fn get_active_predictions(&self) -> Result<Vec<Prediction>> {
        self.predictions("active").await
    }
    async fn get_approved_predictions(&self) -> Result<Vec<Prediction>> {
        self.predictions("approved").await
    }
    async fn get_prediction_count(&self) -> Result<u64> {
        self.gateway.get_prediction_count().await
    }
    async fn is_reachable(&self) -> Result<()> {
        self.gateway.is_reachable().await
    }
}
