use crate::api::*;
use crate::authority::{Authority, AuthorityPrediction, UpstreamUnavailable};
use crate::ledger::{Ledger, LedgerError, NewPrediction};
use anyhow::Result;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Which store produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Authority,
    Ledger,
}
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: Source,
}
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub prediction: Prediction,
    pub authority_id: Option<RowId>,
}

/// Fronts the ledger with best-effort mirroring to the authoritative
/// ledger. Only ledger errors ever reach the caller.
pub struct Reconciler {
    ledger: Arc<Ledger>,
    authority: Arc<dyn Authority + Send + Sync>,
    timeout: Duration,
}
impl Reconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        authority: Arc<dyn Authority + Send + Sync>,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            authority,
            timeout,
        }
    }
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
    async fn attempt<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T, UpstreamUnavailable> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(UpstreamUnavailable::Failed { operation, source }),
            Err(_) => Err(UpstreamUnavailable::TimedOut {
                operation,
                after: self.timeout,
            }),
        }
    }
    fn degrade<T>(result: Result<T, UpstreamUnavailable>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{}, continuing with the ledger only", e);
                None
            }
        }
    }
    /// Authority records carry contract ids. Rewrites them to the ledger rows
    /// they mirror and drops those the ledger never linked.
    async fn to_ledger_ids(
        &self,
        records: Vec<Prediction>,
    ) -> Result<Vec<Prediction>, LedgerError> {
        let mut predictions = Vec::with_capacity(records.len());
        for record in records {
            let authority_id = record.id;
            match self.ledger.find_by_authority_id(authority_id).await? {
                Some(row) => predictions.push(Prediction {
                    id: row.id,
                    creator: row.creator,
                    authority_id: Some(authority_id),
                    ..record
                }),
                None => debug!(
                    "Authority prediction {} has no ledger row, leaving it out",
                    authority_id
                ),
            }
        }
        Ok(predictions)
    }
    pub async fn create_prediction(&self, new: NewPrediction) -> Result<Created, LedgerError> {
        let mirror = AuthorityPrediction {
            creator: new.creator.clone(),
            title: new.title.clone(),
            description: new.description.clone(),
            category: new.category.clone(),
            end_time: new.end_time,
        };
        let authority_id = Self::degrade(
            self.attempt("create_prediction", self.authority.create_prediction(&mirror))
                .await,
        );
        let mut prediction = self.ledger.create_prediction(new).await?;
        if let Some(authority_id) = authority_id {
            match self
                .ledger
                .set_authority_id(prediction.id, authority_id)
                .await
            {
                Ok(()) => prediction.authority_id = Some(authority_id),
                Err(e) => warn!(
                    "Couldn't link prediction {} to authority id {}: {}",
                    prediction.id, authority_id, e
                ),
            }
        }
        Ok(Created {
            authority_id: prediction.authority_id,
            prediction,
        })
    }
    pub async fn submit_vote(
        &self,
        prediction: RowId,
        voter: &str,
        support: bool,
    ) -> Result<Tally, LedgerError> {
        // Without a mirrored id there is nothing to vote on upstream; the
        // ledger still decides.
        let authority_id = match self.ledger.get_prediction(prediction).await {
            Ok(found) => found.authority_id,
            Err(_) => None,
        };
        match authority_id {
            Some(authority_id) => {
                if Self::degrade(
                    self.attempt("vote", self.authority.vote(authority_id, voter, support))
                        .await,
                )
                .is_some()
                {
                    debug!(
                        "Mirrored vote by {} on prediction {} to authority id {}",
                        voter, prediction, authority_id
                    );
                }
            }
            None => debug!(
                "Prediction {} has no authority id, voting in the ledger only",
                prediction
            ),
        }
        self.ledger.apply_vote(prediction, voter, support).await
    }
    pub async fn get_active_predictions(&self) -> Result<Sourced<Vec<Prediction>>, LedgerError> {
        if let Some(value) = Self::degrade(
            self.attempt(
                "get_active_predictions",
                self.authority.get_active_predictions(),
            )
            .await,
        ) {
            return Ok(Sourced {
                value: self.to_ledger_ids(value).await?,
                source: Source::Authority,
            });
        }
        Ok(Sourced {
            value: self.ledger.get_active().await?,
            source: Source::Ledger,
        })
    }
    pub async fn get_approved_predictions(
        &self,
    ) -> Result<Sourced<Vec<Prediction>>, LedgerError> {
        if let Some(value) = Self::degrade(
            self.attempt(
                "get_approved_predictions",
                self.authority.get_approved_predictions(),
            )
            .await,
        ) {
            return Ok(Sourced {
                value: self.to_ledger_ids(value).await?,
                source: Source::Authority,
            });
        }
        Ok(Sourced {
            value: self.ledger.get_approved().await?,
            source: Source::Ledger,
        })
    }
    pub async fn get_prediction_count(&self) -> Result<Sourced<u64>, LedgerError> {
        if let Some(value) = Self::degrade(
            self.attempt("get_prediction_count", self.authority.get_prediction_count())
                .await,
        ) {
            return Ok(Sourced {
                value,
                source: Source::Authority,
            });
        }
        Ok(Sourced {
            value: self.ledger.count().await?,
            source: Source::Ledger,
        })
    }
    /// (configured, reachable)
    pub async fn authority_status(&self) -> (bool, bool) {
        if !self.authority.is_configured() {
            return (false, false);
        }
        let reachable = self
            .attempt("is_reachable", self.authority.is_reachable())
            .await
            .is_ok();
        (true, reachable)
    }
}
