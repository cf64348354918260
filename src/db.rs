use crate::api::*;
use crate::ledger::NewPrediction;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{query, Executor, Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// Outcome of the conditional vote insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteRecord {
    Recorded,
    Duplicate,
    NotActive,
}

#[async_trait]
pub trait DB {
    async fn add_prediction(
        &self,
        prediction: NewPrediction,
        created_at: DateTime<Utc>,
    ) -> Result<Prediction>;
    async fn get_prediction(&self, prediction: RowId) -> Result<Option<Prediction>>;
    async fn get_prediction_by_authority_id(
        &self,
        authority_id: RowId,
    ) -> Result<Option<Prediction>>;
    async fn get_predictions_by_status(&self, status: Status) -> Result<Vec<Prediction>>;
    async fn get_open_predictions(&self, now: DateTime<Utc>) -> Result<Vec<Prediction>>;
    async fn count_predictions(&self) -> Result<u64>;
    /// Inserts the vote and bumps the tally in one transaction. Nothing is
    /// written unless the voter is new and the prediction is still Active.
    async fn record_vote(
        &self,
        prediction: RowId,
        vote: &Vote,
        status: Status,
    ) -> Result<VoteRecord>;
    /// Compare-and-set on the status column.
    async fn set_prediction_status(&self, prediction: RowId, from: Status, to: Status)
        -> Result<bool>;
    async fn set_authority_id(&self, prediction: RowId, authority_id: RowId) -> Result<()>;
    async fn get_votes(&self, prediction: RowId) -> Result<Vec<Vote>>;
    async fn has_voted(&self, prediction: RowId, voter: &str) -> Result<bool>;
    async fn get_undelivered_approvals(&self) -> Result<Vec<Prediction>>;
    async fn mark_approval_delivered(&self, prediction: RowId) -> Result<()>;

    async fn add_created_prediction(&self, creator: &str) -> Result<()>;
    /// Returns false when the approval of `prediction` was already credited.
    async fn credit_approval(
        &self,
        prediction: RowId,
        creator: &str,
        reputation: i64,
        credited_at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn get_profile(&self, creator: &str) -> Result<Option<Profile>>;
}
#[derive(Clone)]
pub struct SQLite {
    connection: SqlitePool,
}
impl SQLite {
    pub async fn new(db_conn: Option<String>) -> Result<Self> {
        let url = db_conn.unwrap_or_else(|| "sqlite::memory:".to_string());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database url {}", url))?
            .create_if_missing(true);
        // Every pooled connection to an in-memory url opens its own database,
        // so those get exactly one connection that is never recycled.
        let connection = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .connect_with(
                    options
                        .journal_mode(SqliteJournalMode::Wal)
                        .busy_timeout(Duration::from_secs(5)),
                )
                .await?
        };
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS predictions (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                creator TEXT NOT NULL,\
                title TEXT NOT NULL,\
                description TEXT NOT NULL,\
                category TEXT NOT NULL,\
                end_time INTEGER NOT NULL,\
                status TEXT NOT NULL DEFAULT 'Active',\
                yes_votes INTEGER NOT NULL DEFAULT 0,\
                no_votes INTEGER NOT NULL DEFAULT 0,\
                authority_id INTEGER,\
                approval_delivered INTEGER NOT NULL DEFAULT 0,\
                created_at INTEGER NOT NULL\
                )",
            )
            .await
            .context("couldn't create predictions table")?;
        connection
            .execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS predictions_authority_id \
                ON predictions (authority_id)",
            )
            .await
            .context("couldn't create authority id index")?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS votes (\
                prediction INTEGER NOT NULL,\
                voter TEXT NOT NULL,\
                support INTEGER NOT NULL,\
                timestamp INTEGER NOT NULL,\
                PRIMARY KEY (prediction, voter)\
                )",
            )
            .await
            .context("couldn't create votes table")?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS profiles (\
                creator TEXT PRIMARY KEY,\
                predictions_created INTEGER NOT NULL DEFAULT 0,\
                predictions_approved INTEGER NOT NULL DEFAULT 0,\
                reputation INTEGER NOT NULL DEFAULT 0\
                )",
            )
            .await
            .context("couldn't create profiles table")?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS credited_approvals (\
                prediction INTEGER PRIMARY KEY,\
                creator TEXT NOT NULL,\
                credited_at INTEGER NOT NULL\
                )",
            )
            .await
            .context("couldn't create credited_approvals table")?;
        Ok(Self { connection })
    }
}
fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .with_context(|| format!("timestamp {} out of range", millis))
}
fn to_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative count {} in db", value))
}
fn prediction_from_row(row: &SqliteRow) -> Result<Prediction> {
    let yes_votes = to_count(row.try_get("yes_votes")?)?;
    let no_votes = to_count(row.try_get("no_votes")?)?;
    let status = Status::from_str(row.try_get("status")?)?;
    Ok(Prediction {
        id: row.try_get("id")?,
        creator: row.try_get("creator")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        end_time: from_millis(row.try_get("end_time")?)?,
        status,
        yes_votes,
        no_votes,
        total_votes: yes_votes + no_votes,
        is_approved: status == Status::Approved,
        authority_id: row.try_get("authority_id")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}
const PREDICTION_COLUMNS: &str = "id, creator, title, description, category, end_time, \
    status, yes_votes, no_votes, authority_id, created_at";

#[async_trait]
impl DB for SQLite {
    async fn add_prediction(
        &self,
        prediction: NewPrediction,
        created_at: DateTime<Utc>,
    ) -> Result<Prediction> {
        let id = self
            .connection
            .execute(
                query(
                    "INSERT INTO predictions (\
                creator,\
                title,\
                description,\
                category,\
                end_time,\
                status,\
                created_at)\
                VALUES (?,?,?,?,?,?,?)",
                )
                .bind(prediction.creator)
                .bind(prediction.title)
                .bind(prediction.description)
                .bind(prediction.category)
                .bind(prediction.end_time.timestamp_millis())
                .bind(Status::Active.to_string())
                .bind(created_at.timestamp_millis()),
            )
            .await?
            .last_insert_rowid();
        self.get_prediction(id)
            .await?
            .with_context(|| format!("prediction {} vanished after insert", id))
    }
    async fn get_prediction(&self, prediction: RowId) -> Result<Option<Prediction>> {
        let statement = format!("SELECT {} FROM predictions WHERE id = ?", PREDICTION_COLUMNS);
        let row = self
            .connection
            .fetch_optional(query(&statement).bind(prediction))
            .await
            .with_context(|| format!("couldn't get prediction {}", prediction))?;
        row.as_ref().map(prediction_from_row).transpose()
    }
    async fn get_prediction_by_authority_id(
        &self,
        authority_id: RowId,
    ) -> Result<Option<Prediction>> {
        let statement = format!(
            "SELECT {} FROM predictions WHERE authority_id = ?",
            PREDICTION_COLUMNS
        );
        let row = self
            .connection
            .fetch_optional(query(&statement).bind(authority_id))
            .await
            .with_context(|| format!("couldn't get prediction for authority id {}", authority_id))?;
        row.as_ref().map(prediction_from_row).transpose()
    }
    async fn get_predictions_by_status(&self, status: Status) -> Result<Vec<Prediction>> {
        let statement = format!(
            "SELECT {} FROM predictions WHERE status = ? ORDER BY created_at DESC, id DESC",
            PREDICTION_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(query(&statement).bind(status.to_string()))
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }
    async fn get_open_predictions(&self, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
        let statement = format!(
            "SELECT {} FROM predictions WHERE status = ? AND end_time > ? \
            ORDER BY created_at DESC, id DESC",
            PREDICTION_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(
                query(&statement)
                    .bind(Status::Active.to_string())
                    .bind(now.timestamp_millis()),
            )
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }
    async fn count_predictions(&self) -> Result<u64> {
        let count = self
            .connection
            .fetch_one(query("SELECT COUNT(*) FROM predictions"))
            .await?
            .try_get(0)?;
        to_count(count)
    }
    async fn record_vote(
        &self,
        prediction: RowId,
        vote: &Vote,
        status: Status,
    ) -> Result<VoteRecord> {
        let mut tx = self.connection.begin().await?;
        let inserted = query(
            "INSERT OR IGNORE INTO votes (\
            prediction,\
            voter,\
            support,\
            timestamp)\
            VALUES (?,?,?,?)",
        )
        .bind(prediction)
        .bind(vote.voter.as_str())
        .bind(vote.support)
        .bind(vote.timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("couldn't insert vote on prediction {}", prediction))?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(VoteRecord::Duplicate);
        }
        let (yes, no) = if vote.support { (1, 0) } else { (0, 1) };
        let updated = query(
            "UPDATE predictions SET \
            yes_votes = yes_votes + ?, \
            no_votes = no_votes + ?, \
            status = ? \
            WHERE id = ? AND status = ?",
        )
        .bind(yes)
        .bind(no)
        .bind(status.to_string())
        .bind(prediction)
        .bind(Status::Active.to_string())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("couldn't update tally of prediction {}", prediction))?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Ok(VoteRecord::NotActive);
        }
        tx.commit().await?;
        Ok(VoteRecord::Recorded)
    }
    async fn set_prediction_status(
        &self,
        prediction: RowId,
        from: Status,
        to: Status,
    ) -> Result<bool> {
        let updated = self
            .connection
            .execute(
                query(
                    "UPDATE predictions \
                SET status = ? \
                WHERE id = ? AND status = ?",
                )
                .bind(to.to_string())
                .bind(prediction)
                .bind(from.to_string()),
            )
            .await?
            .rows_affected();
        Ok(updated == 1)
    }
    async fn set_authority_id(&self, prediction: RowId, authority_id: RowId) -> Result<()> {
        self.connection
            .execute(
                query("UPDATE predictions SET authority_id = ? WHERE id = ?")
                    .bind(authority_id)
                    .bind(prediction),
            )
            .await?;
        Ok(())
    }
    async fn get_votes(&self, prediction: RowId) -> Result<Vec<Vote>> {
        let rows = self
            .connection
            .fetch_all(
                query(
                    "SELECT voter, support, timestamp FROM votes \
                WHERE prediction = ? ORDER BY timestamp, rowid",
                )
                .bind(prediction),
            )
            .await?;
        let mut votes = Vec::with_capacity(rows.len());
        for row in rows {
            votes.push(Vote {
                voter: row.try_get("voter")?,
                support: row.try_get("support")?,
                timestamp: from_millis(row.try_get("timestamp")?)?,
            });
        }
        Ok(votes)
    }
    async fn has_voted(&self, prediction: RowId, voter: &str) -> Result<bool> {
        let row = self
            .connection
            .fetch_optional(
                query("SELECT 1 FROM votes WHERE prediction = ? AND voter = ?")
                    .bind(prediction)
                    .bind(voter),
            )
            .await?;
        Ok(row.is_some())
    }
    async fn get_undelivered_approvals(&self) -> Result<Vec<Prediction>> {
        let statement = format!(
            "SELECT {} FROM predictions \
            WHERE status = ? AND approval_delivered = 0 ORDER BY id",
            PREDICTION_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(query(&statement).bind(Status::Approved.to_string()))
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }
    async fn mark_approval_delivered(&self, prediction: RowId) -> Result<()> {
        self.connection
            .execute(
                query("UPDATE predictions SET approval_delivered = 1 WHERE id = ?")
                    .bind(prediction),
            )
            .await?;
        Ok(())
    }
    async fn add_created_prediction(&self, creator: &str) -> Result<()> {
        self.connection
            .execute(
                query(
                    "INSERT INTO profiles (creator, predictions_created) VALUES (?, 1) \
                ON CONFLICT(creator) DO UPDATE SET \
                predictions_created = predictions_created + 1",
                )
                .bind(creator),
            )
            .await
            .with_context(|| format!("couldn't update profile of {}", creator))?;
        Ok(())
    }
    async fn credit_approval(
        &self,
        prediction: RowId,
        creator: &str,
        reputation: i64,
        credited_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.connection.begin().await?;
        let inserted = query(
            "INSERT OR IGNORE INTO credited_approvals (prediction, creator, credited_at) \
            VALUES (?,?,?)",
        )
        .bind(prediction)
        .bind(creator)
        .bind(credited_at.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        query(
            "INSERT INTO profiles (creator, predictions_approved, reputation) VALUES (?, 1, ?) \
            ON CONFLICT(creator) DO UPDATE SET \
            predictions_approved = predictions_approved + 1, \
            reputation = reputation + excluded.reputation",
        )
        .bind(creator)
        .bind(reputation)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("couldn't credit approval to {}", creator))?;
        tx.commit().await?;
        Ok(true)
    }
    async fn get_profile(&self, creator: &str) -> Result<Option<Profile>> {
        let row = self
            .connection
            .fetch_optional(
                query(
                    "SELECT creator, predictions_created, predictions_approved, reputation \
                FROM profiles WHERE creator = ?",
                )
                .bind(creator),
            )
            .await?;
        match row {
            Some(row) => Ok(Some(Profile {
                creator: row.try_get("creator")?,
                predictions_created: to_count(row.try_get("predictions_created")?)?,
                predictions_approved: to_count(row.try_get("predictions_approved")?)?,
                reputation: row.try_get("reputation")?,
            })),
            None => Ok(None),
        }
    }
}
