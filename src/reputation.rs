//! Creator profiles, fed by ledger events.
use crate::api::*;
use crate::db::DB;
use crate::ledger::{ApprovalEvent, Observer};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::sync::Arc;

/// Reputation a creator earns per approved prediction.
pub const APPROVAL_REPUTATION: i64 = 5;

#[derive(Clone)]
pub struct ReputationBook {
    db: Arc<Box<dyn DB + Send + Sync>>,
}
impl ReputationBook {
    pub fn new(db: Box<dyn DB + Send + Sync>) -> Self {
        Self { db: Arc::new(db) }
    }
    pub async fn get_profile(&self, creator: &str) -> Result<Option<Profile>> {
        self.db.get_profile(creator).await
    }
}
#[async_trait]
impl Observer for ReputationBook {
    async fn prediction_created(&self, prediction: &Prediction) -> Result<()> {
        self.db.add_created_prediction(&prediction.creator).await
    }
    async fn prediction_approved(&self, event: &ApprovalEvent) -> Result<()> {
        let credited = self
            .db
            .credit_approval(
                event.prediction,
                &event.creator,
                APPROVAL_REPUTATION,
                Utc::now(),
            )
            .await?;
        if credited {
            debug!(
                "Credited {} reputation to {} for prediction {}",
                APPROVAL_REPUTATION, event.creator, event.prediction
            );
        } else {
            debug!(
                "Approval of prediction {} was already credited to {}",
                event.prediction, event.creator
            );
        }
        Ok(())
    }
}
