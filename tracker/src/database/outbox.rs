//! Outbox (pending request queue)
//!
//! Durable queue of mutating requests the server has not confirmed yet.
//! Entries are replayed by the sync engine, rewritten in place when an
//! identifier they embed gets remapped, and dropped on success or once
//! their retry budget is exhausted.

use super::models::{HttpMethod, OutboxMeta, PendingRequest};
use crate::error::Result;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;

/// In-place rewrite of an outbox entry. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboxUpdate {
    pub url: Option<String>,
    pub body: Option<String>,
    pub meta: Option<String>,
}

#[derive(Clone)]
pub struct Outbox {
    pool: SqlitePool,
}

impl Outbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a request with a zero retry count
    pub async fn enqueue(
        &self,
        method: HttpMethod,
        url: &str,
        body: &serde_json::Value,
        meta: Option<&OutboxMeta>,
    ) -> Result<PendingRequest> {
        let body = serde_json::to_string(body)?;
        let meta = meta.map(serde_json::to_string).transpose()?;

        let request = sqlx::query_as::<_, PendingRequest>(
            r#"
            INSERT INTO pending_requests (method, url, body, meta, retry_count, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            RETURNING *
            "#,
        )
        .bind(method)
        .bind(url)
        .bind(&body)
        .bind(&meta)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Enqueued request {}: {} {}", request.id, method, url);
        Ok(request)
    }

    /// Pending entries, fewest failures first, then oldest first.
    ///
    /// A persistently failing entry sinks below healthy ones so it cannot
    /// crowd them out of the per-cycle limit.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<PendingRequest>> {
        let requests = sqlx::query_as::<_, PendingRequest>(
            r#"
            SELECT * FROM pending_requests
            ORDER BY retry_count ASC, created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(requests)
    }

    /// Queued create requests, oldest first, regardless of retry count
    pub async fn list_creates(&self) -> Result<Vec<PendingRequest>> {
        let requests = sqlx::query_as::<_, PendingRequest>(
            "SELECT * FROM pending_requests WHERE meta IS NOT NULL ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(requests
            .into_iter()
            .filter(|request| {
                request
                    .parsed_meta()
                    .and_then(|meta| meta.kind)
                    .is_some_and(|kind| kind.created_entity().is_some())
            })
            .collect())
    }

    pub async fn get(&self, id: i64) -> Result<Option<PendingRequest>> {
        let request =
            sqlx::query_as::<_, PendingRequest>("SELECT * FROM pending_requests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(request)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_requests")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Local ids of entities whose create request is still queued
    pub async fn queued_creates(&self) -> Result<HashSet<String>> {
        let metas: Vec<String> = sqlx::query_scalar(
            "SELECT meta FROM pending_requests WHERE meta IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let ids = metas
            .iter()
            .filter_map(|raw| serde_json::from_str::<OutboxMeta>(raw).ok())
            .filter(|meta| meta.kind.and_then(|kind| kind.created_entity()).is_some())
            .filter_map(|meta| meta.local_id)
            .collect();

        Ok(ids)
    }

    /// Delete an entry the server has confirmed
    pub async fn mark_complete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pending_requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Completed request {}", id);
        Ok(())
    }

    /// Record a failed replay attempt
    pub async fn increment_retry(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE pending_requests SET retry_count = retry_count + 1, last_attempt_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rewrite url/body/meta in place. Never touches the retry count.
    pub async fn update(&self, id: i64, update: &OutboxUpdate) -> Result<()> {
        if update.url.is_none() && update.body.is_none() && update.meta.is_none() {
            return Ok(());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pending_requests SET ");
        let mut fields = query.separated(", ");

        if let Some(url) = &update.url {
            fields.push("url = ").push_bind_unseparated(url);
        }
        if let Some(body) = &update.body {
            fields.push("body = ").push_bind_unseparated(body);
        }
        if let Some(meta) = &update.meta {
            fields.push("meta = ").push_bind_unseparated(meta);
        }

        query.push(" WHERE id = ").push_bind(id);
        query.build().execute(&self.pool).await?;

        tracing::debug!("Rewrote request {}", id);
        Ok(())
    }

    /// Drop entries whose retry count exceeds `max_retries`.
    ///
    /// Each dropped entry is a lost mutation and is logged as such.
    pub async fn purge_exhausted(&self, max_retries: i64) -> Result<u64> {
        let purged = sqlx::query_as::<_, PendingRequest>(
            "DELETE FROM pending_requests WHERE retry_count > ? RETURNING *",
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        for request in &purged {
            tracing::error!(
                "Dropping request {} after {} failed attempts: {} {} meta={}",
                request.id,
                request.retry_count,
                request.method,
                request.url,
                request.meta.as_deref().unwrap_or("-")
            );
        }

        Ok(purged.len() as u64)
    }
}
