use crate::api::*;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// What gets mirrored to the authoritative ledger on creation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityPrediction {
    pub creator: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub end_time: DateTime<Utc>,
}

/// The external ledger (a contract behind some gateway). Every call may fail
/// and callers must never depend on it for correctness.
#[async_trait]
pub trait Authority {
    async fn create_prediction(&self, prediction: &AuthorityPrediction) -> Result<RowId>;
    async fn vote(&self, prediction: RowId, voter: &str, support: bool) -> Result<()>;
    async fn get_active_predictions(&self) -> Result<Vec<Prediction>>;
    async fn get_approved_predictions(&self) -> Result<Vec<Prediction>>;
    async fn get_prediction_count(&self) -> Result<u64>;
    async fn is_reachable(&self) -> Result<()>;
    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum UpstreamUnavailable {
    #[error("authoritative ledger failed during {operation}: {source:#}")]
    Failed {
        operation: &'static str,
        source: anyhow::Error,
    },
    #[error("authoritative ledger timed out during {operation} after {after:?}")]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },
}

/// Used when no contract gateway is configured.
#[derive(Debug, Default)]
pub struct Unavailable;
#[async_trait]
impl Authority for Unavailable {
    async fn create_prediction(&self, _prediction: &AuthorityPrediction) -> Result<RowId> {
        bail!("Authoritative ledger not configured")
    }
    async fn vote(&self, _prediction: RowId, _voter: &str, _support: bool) -> Result<()> {
        bail!("Authoritative ledger not configured")
    }
    async fn get_active_predictions(&self) -> Result<Vec<Prediction>> {
        bail!("Authoritative ledger not configured")
    }
    async fn get_approved_predictions(&self) -> Result<Vec<Prediction>> {
        bail!("Authoritative ledger not configured")
    }
    async fn get_prediction_count(&self) -> Result<u64> {
        bail!("Authoritative ledger not configured")
    }
    async fn is_reachable(&self) -> Result<()> {
        bail!("Authoritative ledger not configured")
    }
    fn is_configured(&self) -> bool {
        false
    }
}
