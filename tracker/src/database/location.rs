//! Location ping storage
//!
//! Pings are appended as fixes arrive and uploaded in batches. Synced pings
//! are kept for a retention window, then purged.

use super::models::{LocationPing, NewPing};
use super::repository::{Repository, CURRENT_ID};
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

impl Repository {
    /// Append a ping. Its shift and ride ids may be stale; the row stores
    /// their current form.
    pub async fn save_ping(&self, ping: &NewPing) -> Result<LocationPing> {
        let sql = format!(
            "INSERT INTO location_pings \
                 (shift_id, ride_id, ts, lat, lng, speed_mps, heading_deg, accuracy_m, source, synced) \
             VALUES ({current}, {current}, ?, ?, ?, ?, ?, ?, ?, 0) \
             RETURNING *",
            current = CURRENT_ID
        );
        let saved = sqlx::query_as::<_, LocationPing>(&sql)
            .bind(&ping.shift_id)
            .bind(&ping.shift_id)
            .bind(&ping.ride_id)
            .bind(&ping.ride_id)
            .bind(ping.ts)
            .bind(ping.lat)
            .bind(ping.lng)
            .bind(ping.speed_mps)
            .bind(ping.heading_deg)
            .bind(ping.accuracy_m)
            .bind(ping.source)
            .fetch_one(&self.pool)
            .await?;

        tracing::trace!("Saved ping {} for shift {}", saved.id, saved.shift_id);
        Ok(saved)
    }

    /// Unsynced pings, oldest first
    pub async fn pending_pings(&self, limit: i64) -> Result<Vec<LocationPing>> {
        let pings = sqlx::query_as::<_, LocationPing>(
            "SELECT * FROM location_pings WHERE synced = 0 ORDER BY ts ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(pings)
    }

    pub async fn pending_ping_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM location_pings WHERE synced = 0")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    pub async fn mark_pings_synced(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE location_pings SET synced = 1 WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        query.build().execute(&self.pool).await?;

        tracing::debug!("Marked {} pings synced", ids.len());
        Ok(())
    }

    /// Delete synced pings recorded before `before`. Unsynced pings are kept.
    pub async fn purge_synced_pings(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM location_pings WHERE synced = 1 AND ts < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!("Purged {} synced pings older than {}", purged, before);
        }
        Ok(purged)
    }

    pub async fn pings_for_shift(&self, shift_id: &str) -> Result<Vec<LocationPing>> {
        let pings = sqlx::query_as::<_, LocationPing>(
            "SELECT * FROM location_pings WHERE shift_id = ? ORDER BY ts ASC, id ASC",
        )
        .bind(shift_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(pings)
    }

    pub async fn pings_for_ride(&self, ride_id: &str) -> Result<Vec<LocationPing>> {
        let pings = sqlx::query_as::<_, LocationPing>(
            "SELECT * FROM location_pings WHERE ride_id = ? ORDER BY ts ASC, id ASC",
        )
        .bind(ride_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(pings)
    }
}
