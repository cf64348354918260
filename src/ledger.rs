use crate::api::*;
use crate::db::{VoteRecord, DB};
use crate::policy;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq)]
pub struct NewPrediction {
    pub creator: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub end_time: DateTime<Utc>,
}
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalEvent {
    pub prediction: RowId,
    pub creator: String,
    pub approved_at: DateTime<Utc>,
}
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Prediction {0} not found")]
    NotFound(RowId),
    #[error("Voting on prediction {0} is closed")]
    VotingClosed(RowId),
    #[error("{voter} already voted on prediction {prediction}")]
    DuplicateVote { prediction: RowId, voter: VoterId },
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Receives ledger events. Approvals are delivered at least once, so
/// implementations have to tolerate seeing the same approval again.
#[async_trait]
pub trait Observer {
    async fn prediction_created(&self, prediction: &Prediction) -> Result<()>;
    async fn prediction_approved(&self, event: &ApprovalEvent) -> Result<()>;
}

/// Per-prediction async locks. Entries live only while someone holds or
/// waits for them.
#[derive(Default)]
struct PredictionLocks {
    locks: Mutex<HashMap<RowId, Arc<tokio::sync::Mutex<()>>>>,
}
impl PredictionLocks {
    async fn lock(&self, prediction: RowId) -> PredictionGuard<'_> {
        let handle = self
            .entries()
            .entry(prediction)
            .or_default()
            .clone();
        PredictionGuard {
            locks: self,
            prediction,
            guard: Some(handle.lock_owned().await),
        }
    }
    fn entries(&self) -> MutexGuard<'_, HashMap<RowId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries().len()
    }
}
struct PredictionGuard<'a> {
    locks: &'a PredictionLocks,
    prediction: RowId,
    guard: Option<OwnedMutexGuard<()>>,
}
impl Drop for PredictionGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.locks.entries();
        self.guard.take();
        // Only the map itself still points at an idle lock.
        let idle = entries
            .get(&self.prediction)
            .map(|handle| Arc::strong_count(handle) == 1)
            .unwrap_or(false);
        if idle {
            entries.remove(&self.prediction);
        }
    }
}

/// Keeper of predictions and their tallies. The only place that mutates them.
pub struct Ledger {
    db: Arc<Box<dyn DB + Send + Sync>>,
    observer: Arc<Box<dyn Observer + Send + Sync>>,
    locks: PredictionLocks,
}
impl Ledger {
    pub fn new(db: Box<dyn DB + Send + Sync>, observer: Box<dyn Observer + Send + Sync>) -> Self {
        Self {
            db: Arc::new(db),
            observer: Arc::new(observer),
            locks: PredictionLocks::default(),
        }
    }
    pub async fn create_prediction(
        &self,
        prediction: NewPrediction,
    ) -> Result<Prediction, LedgerError> {
        let prediction = self.db.add_prediction(prediction, Utc::now()).await?;
        debug!(
            "Created prediction {} by {}: {}",
            prediction.id, prediction.creator, prediction.title
        );
        if let Err(e) = self.observer.prediction_created(&prediction).await {
            warn!(
                "Couldn't record creation of prediction {} for {}: {:#}",
                prediction.id, prediction.creator, e
            );
        }
        Ok(prediction)
    }
    pub async fn apply_vote(
        &self,
        prediction: RowId,
        voter: &str,
        support: bool,
    ) -> Result<Tally, LedgerError> {
        self.apply_vote_at(prediction, voter, support, Utc::now())
            .await
    }
    pub async fn apply_vote_at(
        &self,
        prediction: RowId,
        voter: &str,
        support: bool,
        now: DateTime<Utc>,
    ) -> Result<Tally, LedgerError> {
        if voter.trim().is_empty() {
            return Err(LedgerError::Validation("Voter must not be empty".into()));
        }
        self.ensure_exists(prediction).await?;
        let guard = self.locks.lock(prediction).await;
        let current = self
            .db
            .get_prediction(prediction)
            .await?
            .ok_or(LedgerError::NotFound(prediction))?;
        if current.status.is_terminal() {
            return Err(LedgerError::VotingClosed(prediction));
        }
        if now >= current.end_time {
            self.close(&current, now).await?;
            debug!("Closed prediction {} because someone voted after its end", prediction);
            return Err(LedgerError::VotingClosed(prediction));
        }
        let duplicate = || LedgerError::DuplicateVote {
            prediction,
            voter: voter.to_string(),
        };
        if self.db.has_voted(prediction, voter).await? {
            return Err(duplicate());
        }
        let (yes_votes, no_votes) = if support {
            (current.yes_votes + 1, current.no_votes)
        } else {
            (current.yes_votes, current.no_votes + 1)
        };
        let status = policy::decide_status(
            yes_votes,
            no_votes,
            now,
            current.end_time,
            current.status,
        );
        let vote = Vote {
            voter: voter.to_string(),
            support,
            timestamp: now,
        };
        match self.db.record_vote(prediction, &vote, status).await? {
            VoteRecord::Recorded => {}
            VoteRecord::Duplicate => return Err(duplicate()),
            VoteRecord::NotActive => {
                error!(
                    "Prediction {} stopped being Active while its lock was held",
                    prediction
                );
                return Err(LedgerError::VotingClosed(prediction));
            }
        }
        drop(guard);
        trace!(
            "Vote {} by {} on prediction {}: {}/{}",
            support,
            voter,
            prediction,
            yes_votes,
            no_votes
        );
        if status == Status::Approved {
            debug!(
                "Prediction {} approved with {} yes and {} no votes",
                prediction, yes_votes, no_votes
            );
            self.signal_approval(ApprovalEvent {
                prediction,
                creator: current.creator,
                approved_at: now,
            })
            .await;
        }
        Ok(Tally {
            yes_votes,
            no_votes,
            total_votes: yes_votes + no_votes,
            status,
        })
    }
    async fn close(&self, prediction: &Prediction, now: DateTime<Utc>) -> Result<()> {
        let status = policy::decide_status(
            prediction.yes_votes,
            prediction.no_votes,
            now,
            prediction.end_time,
            prediction.status,
        );
        if status == Status::Closed {
            self.db
                .set_prediction_status(prediction.id, Status::Active, Status::Closed)
                .await?;
        }
        Ok(())
    }
    async fn signal_approval(&self, event: ApprovalEvent) {
        match self.observer.prediction_approved(&event).await {
            Ok(()) => {
                if let Err(e) = self.db.mark_approval_delivered(event.prediction).await {
                    // Stays pending and gets delivered again.
                    warn!(
                        "Couldn't mark approval of prediction {} as delivered: {:#}",
                        event.prediction, e
                    );
                }
            }
            Err(e) => warn!(
                "Delivering approval of prediction {} failed, will retry: {:#}",
                event.prediction, e
            ),
        }
    }
    /// Sends approval events that were never acknowledged. Returns how many
    /// were attempted.
    pub async fn redeliver_approvals(&self) -> Result<usize, LedgerError> {
        let pending = self.db.get_undelivered_approvals().await?;
        let count = pending.len();
        for prediction in pending {
            debug!("Redelivering approval of prediction {}", prediction.id);
            self.signal_approval(ApprovalEvent {
                prediction: prediction.id,
                creator: prediction.creator,
                approved_at: Utc::now(),
            })
            .await;
        }
        Ok(count)
    }
    pub async fn get_prediction(&self, prediction: RowId) -> Result<Prediction, LedgerError> {
        self.get_prediction_at(prediction, Utc::now()).await
    }
    /// Reads a prediction and settles a deadline that passed since the last
    /// vote.
    pub async fn get_prediction_at(
        &self,
        prediction: RowId,
        now: DateTime<Utc>,
    ) -> Result<Prediction, LedgerError> {
        let current = self
            .db
            .get_prediction(prediction)
            .await?
            .ok_or(LedgerError::NotFound(prediction))?;
        let status = policy::decide_status(
            current.yes_votes,
            current.no_votes,
            now,
            current.end_time,
            current.status,
        );
        if status != current.status {
            let _guard = self.locks.lock(prediction).await;
            if self
                .db
                .set_prediction_status(prediction, current.status, status)
                .await?
            {
                debug!("Prediction {} is now {}", prediction, status);
            }
            return self
                .db
                .get_prediction(prediction)
                .await?
                .ok_or(LedgerError::NotFound(prediction));
        }
        Ok(current)
    }
    /// The ledger row mirrored to `authority_id` upstream, if any.
    pub async fn find_by_authority_id(
        &self,
        authority_id: RowId,
    ) -> Result<Option<Prediction>, LedgerError> {
        Ok(self.db.get_prediction_by_authority_id(authority_id).await?)
    }
    pub async fn get_active(&self) -> Result<Vec<Prediction>, LedgerError> {
        Ok(self.db.get_open_predictions(Utc::now()).await?)
    }
    pub async fn get_approved(&self) -> Result<Vec<Prediction>, LedgerError> {
        Ok(self.db.get_predictions_by_status(Status::Approved).await?)
    }
    pub async fn count(&self) -> Result<u64, LedgerError> {
        Ok(self.db.count_predictions().await?)
    }
    pub async fn get_votes(&self, prediction: RowId) -> Result<Vec<Vote>, LedgerError> {
        self.ensure_exists(prediction).await?;
        Ok(self.db.get_votes(prediction).await?)
    }
    pub async fn has_voted(&self, prediction: RowId, voter: &str) -> Result<bool, LedgerError> {
        self.ensure_exists(prediction).await?;
        Ok(self.db.has_voted(prediction, voter).await?)
    }
    pub async fn voting_stats(&self, prediction: RowId) -> Result<VotingStats, LedgerError> {
        let prediction = self.get_prediction(prediction).await?;
        Ok(VotingStats {
            yes_votes: prediction.yes_votes,
            no_votes: prediction.no_votes,
            total_votes: prediction.total_votes,
            approval_percentage: policy::approval_percentage(
                prediction.yes_votes,
                prediction.no_votes,
            ),
        })
    }
    pub async fn set_authority_id(
        &self,
        prediction: RowId,
        authority_id: RowId,
    ) -> Result<(), LedgerError> {
        self.ensure_exists(prediction).await?;
        self.db.set_authority_id(prediction, authority_id).await?;
        Ok(())
    }
    async fn ensure_exists(&self, prediction: RowId) -> Result<(), LedgerError> {
        match self.db.get_prediction(prediction).await? {
            Some(_) => Ok(()),
            None => Err(LedgerError::NotFound(prediction)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::db::SQLite;
    use anyhow::bail;
    use chrono::Duration;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) approvals: Arc<Mutex<Vec<ApprovalEvent>>>,
        pub(crate) failing: Arc<AtomicBool>,
    }
    #[async_trait]
    impl Observer for RecordingObserver {
        async fn prediction_created(&self, _prediction: &Prediction) -> Result<()> {
            Ok(())
        }
        async fn prediction_approved(&self, event: &ApprovalEvent) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                bail!("profile store unreachable")
            }
            self.approvals.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    pub(crate) async fn test_ledger() -> Ledger {
        Ledger::new(
            Box::new(SQLite::new(None).await.unwrap()),
            Box::new(RecordingObserver::default()),
        )
    }
    pub(crate) fn new_prediction(days: i64) -> NewPrediction {
        NewPrediction {
            creator: "0xcreator".to_string(),
            title: "ETH flips BTC".to_string(),
            description: "Market cap of ETH exceeds BTC".to_string(),
            category: "crypto".to_string(),
            end_time: Utc::now() + Duration::days(days),
        }
    }

    #[tokio::test]
    async fn no_double_voting() {
        let ledger = test_ledger().await;
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        ledger.apply_vote(id, "0xv1", true).await.unwrap();
        let err = ledger.apply_vote(id, "0xv1", false).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVote { prediction, .. } if prediction == id));
        let prediction = ledger.get_prediction(id).await.unwrap();
        assert_eq!((prediction.yes_votes, prediction.no_votes), (1, 0));
        assert_eq!(ledger.get_votes(id).await.unwrap().len(), 1);
    }
    #[tokio::test]
    async fn no_double_voting_under_concurrency() {
        let ledger = Arc::new(test_ledger().await);
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        let results = join_all((0..16).map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply_vote(id, "0xsame", i % 2 == 0).await })
        }))
        .await;
        let results: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LedgerError::DuplicateVote { .. })));
        assert_eq!(ledger.get_prediction(id).await.unwrap().total_votes, 1);
    }
    #[tokio::test]
    async fn votes_on_different_predictions_all_count() {
        let ledger = Arc::new(test_ledger().await);
        let a = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        let b = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        let results = join_all((0..20).map(|i| {
            let ledger = ledger.clone();
            let prediction = if i % 2 == 0 { a } else { b };
            tokio::spawn(async move {
                ledger
                    .apply_vote(prediction, &format!("0xv{}", i), false)
                    .await
            })
        }))
        .await;
        assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
        assert_eq!(ledger.get_prediction(a).await.unwrap().no_votes, 10);
        assert_eq!(ledger.get_prediction(b).await.unwrap().no_votes, 10);
    }
    #[tokio::test]
    async fn threshold_crossing_vote_approves() {
        let ledger = test_ledger().await;
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        // Open with the no votes so the ratio climbs towards 70%.
        let sequence = [false, false, false, true, true, true, true, true, true];
        for (i, support) in sequence.into_iter().enumerate() {
            let tally = ledger
                .apply_vote(id, &format!("0xv{}", i), support)
                .await
                .unwrap();
            assert_eq!(tally.status, Status::Active, "vote {}", i);
        }
        let tally = ledger.apply_vote(id, "0xv9", true).await.unwrap();
        assert_eq!(tally.yes_votes, 7);
        assert_eq!(tally.no_votes, 3);
        assert_eq!(tally.status, Status::Approved);
        let prediction = ledger.get_prediction(id).await.unwrap();
        assert!(prediction.is_approved);
        assert_eq!(ledger.get_approved().await.unwrap().len(), 1);
        assert!(ledger.get_active().await.unwrap().is_empty());
    }
    #[tokio::test]
    async fn deadline_closes_voting() {
        let ledger = test_ledger().await;
        let prediction = ledger.create_prediction(new_prediction(1)).await.unwrap();
        let id = prediction.id;
        let now = Utc::now();
        for i in 0..13 {
            ledger
                .apply_vote_at(id, &format!("0xv{}", i), i >= 10, now)
                .await
                .unwrap();
        }
        let after_end = prediction.end_time + Duration::seconds(1);
        let closed = ledger.get_prediction_at(id, after_end).await.unwrap();
        assert_eq!(closed.status, Status::Closed);
        assert_eq!((closed.yes_votes, closed.no_votes), (3, 10));
        let err = ledger
            .apply_vote_at(id, "0xlate", true, after_end)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VotingClosed(p) if p == id));
        assert!(ledger.get_approved().await.unwrap().is_empty());
    }
    #[tokio::test]
    async fn late_vote_closes_stale_prediction() {
        let ledger = test_ledger().await;
        let prediction = ledger.create_prediction(new_prediction(1)).await.unwrap();
        let after_end = prediction.end_time + Duration::seconds(1);
        let err = ledger
            .apply_vote_at(prediction.id, "0xv", true, after_end)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VotingClosed(_)));
        let stored = ledger.get_prediction(prediction.id).await.unwrap();
        assert_eq!(stored.status, Status::Closed);
        assert_eq!(stored.total_votes, 0);
        assert!(!ledger.has_voted(prediction.id, "0xv").await.unwrap());
    }
    #[tokio::test]
    async fn vote_at_the_deadline_is_too_late() {
        let ledger = test_ledger().await;
        let prediction = ledger.create_prediction(new_prediction(1)).await.unwrap();
        let err = ledger
            .apply_vote_at(prediction.id, "0xv", true, prediction.end_time)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VotingClosed(p) if p == prediction.id));
        let stored = ledger.get_prediction(prediction.id).await.unwrap();
        assert_eq!(stored.status, Status::Closed);
        assert_eq!(stored.total_votes, 0);
    }
    #[tokio::test]
    async fn locks_do_not_outlive_votes() {
        let ledger = Arc::new(test_ledger().await);
        for unknown in 1000..2000 {
            assert!(matches!(
                ledger.apply_vote(unknown, "0xv", true).await.unwrap_err(),
                LedgerError::NotFound(_)
            ));
        }
        assert_eq!(ledger.locks.len(), 0);
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        let results = join_all((0..8).map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .apply_vote(id, &format!("0xv{}", i), false)
                    .await
            })
        }))
        .await;
        assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
        assert_eq!(ledger.get_prediction(id).await.unwrap().no_votes, 8);
        assert_eq!(ledger.locks.len(), 0);
    }
    #[tokio::test]
    async fn approval_is_sticky() {
        let ledger = test_ledger().await;
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        assert_eq!(
            ledger.apply_vote(id, "0xv1", true).await.unwrap().status,
            Status::Approved
        );
        let err = ledger.apply_vote(id, "0xv2", false).await.unwrap_err();
        assert!(matches!(err, LedgerError::VotingClosed(_)));
        let prediction = ledger.get_prediction(id).await.unwrap();
        assert_eq!(prediction.status, Status::Approved);
        assert_eq!(prediction.total_votes, 1);
    }
    #[tokio::test]
    async fn unknown_prediction() {
        let ledger = test_ledger().await;
        assert!(matches!(
            ledger.apply_vote(42, "0xv", true).await.unwrap_err(),
            LedgerError::NotFound(42)
        ));
        assert!(matches!(
            ledger.voting_stats(42).await.unwrap_err(),
            LedgerError::NotFound(42)
        ));
        assert!(matches!(
            ledger.has_voted(42, "0xv").await.unwrap_err(),
            LedgerError::NotFound(42)
        ));
    }
    #[tokio::test]
    async fn empty_voter_is_rejected() {
        let ledger = test_ledger().await;
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        assert!(matches!(
            ledger.apply_vote(id, "  ", true).await.unwrap_err(),
            LedgerError::Validation(_)
        ));
    }
    #[tokio::test]
    async fn count_and_listings() {
        let ledger = test_ledger().await;
        assert_eq!(ledger.count().await.unwrap(), 0);
        let first = ledger.create_prediction(new_prediction(3)).await.unwrap();
        let second = ledger.create_prediction(new_prediction(3)).await.unwrap();
        assert_eq!(ledger.count().await.unwrap(), 2);
        let active: Vec<RowId> = ledger
            .get_active()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(active, vec![second.id, first.id]);
        ledger.set_authority_id(first.id, 77).await.unwrap();
        assert_eq!(
            ledger.get_prediction(first.id).await.unwrap().authority_id,
            Some(77)
        );
    }
    #[tokio::test]
    async fn approval_is_redelivered_until_acknowledged() {
        let observer = RecordingObserver::default();
        let approvals = observer.approvals.clone();
        let failing = observer.failing.clone();
        failing.store(true, Ordering::SeqCst);
        let ledger = Ledger::new(
            Box::new(SQLite::new(None).await.unwrap()),
            Box::new(observer),
        );
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        assert_eq!(
            ledger.apply_vote(id, "0xv1", true).await.unwrap().status,
            Status::Approved
        );
        assert!(approvals.lock().unwrap().is_empty());
        failing.store(false, Ordering::SeqCst);
        assert_eq!(ledger.redeliver_approvals().await.unwrap(), 1);
        assert_eq!(ledger.redeliver_approvals().await.unwrap(), 0);
        let approvals = approvals.lock().unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].prediction, id);
        assert_eq!(approvals[0].creator, "0xcreator");
    }
    #[tokio::test]
    async fn voting_stats_report_percentage() {
        let ledger = test_ledger().await;
        let id = ledger.create_prediction(new_prediction(3)).await.unwrap().id;
        ledger.apply_vote(id, "0xv1", false).await.unwrap();
        ledger.apply_vote(id, "0xv2", true).await.unwrap();
        let stats = ledger.voting_stats(id).await.unwrap();
        assert_eq!(stats.total_votes, 2);
        assert_eq!(stats.approval_percentage, rust_decimal_macros::dec!(50));
        assert!(ledger.has_voted(id, "0xv2").await.unwrap());
    }
}
