//! Repository layer for the local entity store
//!
//! Shifts and rides are created under locally generated UUIDs so the app
//! keeps working offline. When the server assigns its own id, `replace_id`
//! swaps it in everywhere the old id is referenced, in one transaction.
//! Pings and expenses live in `location.rs` and `expenses.rs`.

use super::id_map;
use super::models::*;
use crate::error::{AppError, Result};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// SQL for the current form of a bound id: its mapped server id, or the id
/// itself. Bind the id twice. A NULL id stays NULL.
///
/// Resolving inside the write statement means a `replace_id` committed
/// after the caller read the id cannot make the write miss its row.
pub(super) const CURRENT_ID: &str =
    "COALESCE((SELECT server_id FROM id_mappings WHERE local_id = ?), ?)";

/// Repository for local entity storage
#[derive(Clone)]
pub struct Repository {
    pub(super) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ===== Shifts =====

    /// Create a new active shift under a local id
    pub async fn create_shift(&self) -> Result<Shift> {
        let id = Uuid::new_v4().to_string();

        let shift = sqlx::query_as::<_, Shift>(
            r#"
            INSERT INTO shifts (id, started_at, synced)
            VALUES (?, ?, 0)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Created shift: {}", id);
        Ok(shift)
    }

    pub async fn get_shift(&self, id: &str) -> Result<Option<Shift>> {
        let shift = sqlx::query_as::<_, Shift>("SELECT * FROM shifts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(shift)
    }

    /// The shift without an end timestamp, if any
    pub async fn get_active_shift(&self) -> Result<Option<Shift>> {
        let shift = sqlx::query_as::<_, Shift>(
            "SELECT * FROM shifts WHERE ended_at IS NULL ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(shift)
    }

    /// Set the end timestamp of an active shift. `id` may be stale.
    pub async fn end_shift(&self, id: &str) -> Result<Shift> {
        let sql = format!(
            "UPDATE shifts SET ended_at = ?, synced = 0 \
             WHERE id = {} AND ended_at IS NULL RETURNING *",
            CURRENT_ID
        );
        let shift = sqlx::query_as::<_, Shift>(&sql)
            .bind(Utc::now())
            .bind(id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::ShiftNotFound(id.to_string()))?;

        tracing::debug!("Ended shift: {}", shift.id);
        Ok(shift)
    }

    /// Partially update shift totals. Always clears the synced flag.
    pub async fn update_shift_totals(&self, id: &str, totals: &ShiftTotals) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_totals_with(&mut conn, id, totals).await
    }

    pub async fn mark_shift_synced(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE shifts SET synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Most recent ended shifts, newest first
    pub async fn shift_history(&self, limit: i64) -> Result<Vec<Shift>> {
        let shifts = sqlx::query_as::<_, Shift>(
            r#"
            SELECT * FROM shifts
            WHERE ended_at IS NOT NULL
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(shifts)
    }

    // ===== Rides =====

    /// Create a ride heading to pickup under a local id.
    ///
    /// `shift_id` may be stale; the ride is filed under its current form.
    pub async fn create_ride(&self, shift_id: &str, pickup: Option<LatLng>) -> Result<Ride> {
        let id = Uuid::new_v4().to_string();

        let sql = format!(
            "INSERT INTO rides (id, shift_id, status, started_at, pickup_lat, pickup_lng, synced) \
             VALUES (?, {}, ?, ?, ?, ?, 0) RETURNING *",
            CURRENT_ID
        );
        let ride = sqlx::query_as::<_, Ride>(&sql)
            .bind(&id)
            .bind(shift_id)
            .bind(shift_id)
            .bind(RideStatus::EnRoute)
            .bind(Utc::now())
            .bind(pickup.map(|p| p.lat))
            .bind(pickup.map(|p| p.lng))
            .fetch_one(&self.pool)
            .await?;

        tracing::debug!("Created ride: {} for shift: {}", id, ride.shift_id);
        Ok(ride)
    }

    pub async fn get_ride(&self, id: &str) -> Result<Option<Ride>> {
        let ride = sqlx::query_as::<_, Ride>("SELECT * FROM rides WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(ride)
    }

    /// The ride of `shift_id` that is not completed, if any
    pub async fn get_active_ride(&self, shift_id: &str) -> Result<Option<Ride>> {
        let ride = sqlx::query_as::<_, Ride>(
            r#"
            SELECT * FROM rides
            WHERE shift_id = ? AND status != 'completed'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(shift_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ride)
    }

    /// All rides of a shift, oldest first
    pub async fn rides_for_shift(&self, shift_id: &str) -> Result<Vec<Ride>> {
        let rides = sqlx::query_as::<_, Ride>(
            "SELECT * FROM rides WHERE shift_id = ? ORDER BY started_at ASC, rowid ASC",
        )
        .bind(shift_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rides)
    }

    /// The most recently created ride of a shift. `shift_id` may be stale.
    pub async fn last_ride_for_shift(&self, shift_id: &str) -> Result<Option<Ride>> {
        let sql = format!(
            "SELECT * FROM rides WHERE shift_id = {} \
             ORDER BY started_at DESC, rowid DESC LIMIT 1",
            CURRENT_ID
        );
        let ride = sqlx::query_as::<_, Ride>(&sql)
            .bind(shift_id)
            .bind(shift_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(ride)
    }

    /// Rider is in the car. `id` may be stale.
    pub async fn mark_picked_up(&self, id: &str) -> Result<Ride> {
        let sql = format!(
            "UPDATE rides SET status = ?, pickup_at = ?, synced = 0 \
             WHERE id = {} AND status = 'en_route' RETURNING *",
            CURRENT_ID
        );
        let ride = sqlx::query_as::<_, Ride>(&sql)
            .bind(RideStatus::InProgress)
            .bind(Utc::now())
            .bind(id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::RideNotFound(id.to_string()))?;

        tracing::debug!("Picked up rider for ride: {}", ride.id);
        Ok(ride)
    }

    /// Complete a ride and fold its fare into the owning shift's totals.
    ///
    /// Ride and shift are updated in one transaction. `ride_id` may be stale.
    pub async fn complete_ride(
        &self,
        ride_id: &str,
        completion: &RideCompletion,
    ) -> Result<(Ride, Shift)> {
        let now = Utc::now();
        let distance = completion.distance_miles.unwrap_or(0.0);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE rides \
             SET status = ?, ended_at = ?, dropoff_at = ?, gross_cents = ?, \
                 dropoff_lat = ?, dropoff_lng = ?, distance_miles = distance_miles + ?, synced = 0 \
             WHERE id = {} AND status != 'completed' RETURNING *",
            CURRENT_ID
        );
        let ride = sqlx::query_as::<_, Ride>(&sql)
            .bind(RideStatus::Completed)
            .bind(now)
            .bind(now)
            .bind(completion.gross_cents)
            .bind(completion.dropoff.map(|p| p.lat))
            .bind(completion.dropoff.map(|p| p.lng))
            .bind(distance)
            .bind(ride_id)
            .bind(ride_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::RideNotFound(ride_id.to_string()))?;

        let shift = fetch_shift_with(&mut tx, &ride.shift_id).await?;
        let totals = ShiftTotals {
            earnings_cents: Some(shift.earnings_cents + completion.gross_cents),
            ride_count: Some(shift.ride_count + 1),
            distance_miles: Some(shift.distance_miles + distance),
            tips_cents: None,
        };
        update_totals_with(&mut tx, &shift.id, &totals).await?;
        let shift = fetch_shift_with(&mut tx, &shift.id).await?;

        tx.commit().await?;

        tracing::debug!(
            "Completed ride: {} ({} cents) for shift: {}",
            ride.id,
            completion.gross_cents,
            shift.id
        );
        Ok((ride, shift))
    }

    /// Add a tip to a ride and to its shift's tip total, in one transaction.
    /// `ride_id` may be stale.
    pub async fn add_tip(&self, ride_id: &str, tip_cents: i64) -> Result<(Ride, Shift)> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE rides SET tip_cents = tip_cents + ?, synced = 0 WHERE id = {} RETURNING *",
            CURRENT_ID
        );
        let ride = sqlx::query_as::<_, Ride>(&sql)
            .bind(tip_cents)
            .bind(ride_id)
            .bind(ride_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::RideNotFound(ride_id.to_string()))?;

        let shift = fetch_shift_with(&mut tx, &ride.shift_id).await?;
        let totals = ShiftTotals {
            tips_cents: Some(shift.tips_cents + tip_cents),
            ..ShiftTotals::default()
        };
        update_totals_with(&mut tx, &shift.id, &totals).await?;
        let shift = fetch_shift_with(&mut tx, &shift.id).await?;

        tx.commit().await?;

        tracing::debug!("Added {} cents tip to ride: {}", tip_cents, ride.id);
        Ok((ride, shift))
    }

    pub async fn mark_ride_synced(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE rides SET synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ===== Identifier replacement =====

    /// Replace a local id with its server id, cascading to every row that
    /// references it, and record the mapping. All or nothing.
    pub async fn replace_id(&self, entity: EntityKind, old_id: &str, new_id: &str) -> Result<()> {
        if old_id == new_id {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        match entity {
            EntityKind::Shift => {
                sqlx::query("UPDATE rides SET shift_id = ? WHERE shift_id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE location_pings SET shift_id = ? WHERE shift_id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE shifts SET id = ? WHERE id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
            }
            EntityKind::Ride => {
                sqlx::query("UPDATE location_pings SET ride_id = ? WHERE ride_id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE rides SET id = ? WHERE id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
            }
            EntityKind::Expense => {
                sqlx::query("UPDATE expenses SET id = ? WHERE id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        id_map::save_with(&mut tx, entity, old_id, new_id).await?;

        tx.commit().await?;

        tracing::info!("Replaced {} id {} with {}", entity, old_id, new_id);
        Ok(())
    }

    // ===== Settings =====

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Set setting: {}", key);
        Ok(())
    }
}

async fn fetch_shift_with(conn: &mut SqliteConnection, id: &str) -> Result<Shift> {
    sqlx::query_as::<_, Shift>("SELECT * FROM shifts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::ShiftNotFound(id.to_string()))
}

async fn update_totals_with(
    conn: &mut SqliteConnection,
    id: &str,
    totals: &ShiftTotals,
) -> Result<()> {
    if totals.is_empty() {
        return Ok(());
    }

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE shifts SET synced = 0");

    if let Some(earnings) = totals.earnings_cents {
        query.push(", earnings_cents = ").push_bind(earnings);
    }
    if let Some(tips) = totals.tips_cents {
        query.push(", tips_cents = ").push_bind(tips);
    }
    if let Some(distance) = totals.distance_miles {
        query.push(", distance_miles = ").push_bind(distance);
    }
    if let Some(rides) = totals.ride_count {
        query.push(", ride_count = ").push_bind(rides);
    }
    query.push(" WHERE id = ").push_bind(id);

    let rows = query.build().execute(&mut *conn).await?.rows_affected();
    if rows == 0 {
        return Err(AppError::ShiftNotFound(id.to_string()));
    }

    Ok(())
}
