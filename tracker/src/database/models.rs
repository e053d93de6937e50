//! Database models
//!
//! Rust structs representing locally persisted entities.
//! All models use serde so they can be handed to the UI layer as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Kind of entity whose identifier can be replaced by a server-assigned one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntityKind {
    Shift,
    Ride,
    Expense,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Shift => "shift",
            EntityKind::Ride => "ride",
            EntityKind::Expense => "expense",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One work session, from start to end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Shift {
    /// Local UUID until the server assigns its own id
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the shift is active
    pub ended_at: Option<DateTime<Utc>>,
    pub earnings_cents: i64,
    pub tips_cents: i64,
    pub distance_miles: f64,
    pub ride_count: i64,
    /// Local-only: the server has acknowledged the current field values
    pub synced: bool,
}

impl Shift {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Partial update of a shift's running totals.
/// Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShiftTotals {
    pub earnings_cents: Option<i64>,
    pub tips_cents: Option<i64>,
    pub distance_miles: Option<f64>,
    pub ride_count: Option<i64>,
}

impl ShiftTotals {
    pub fn is_empty(&self) -> bool {
        self.earnings_cents.is_none()
            && self.tips_cents.is_none()
            && self.distance_miles.is_none()
            && self.ride_count.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RideStatus {
    EnRoute,
    InProgress,
    Completed,
}

/// A coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// One passenger trip within a shift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Ride {
    pub id: String,
    pub shift_id: String,
    pub status: RideStatus,
    pub started_at: DateTime<Utc>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub dropoff_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub gross_cents: i64,
    pub tip_cents: i64,
    pub distance_miles: f64,
    pub pickup_lat: Option<f64>,
    pub pickup_lng: Option<f64>,
    pub dropoff_lat: Option<f64>,
    pub dropoff_lng: Option<f64>,
    pub synced: bool,
}

impl Ride {
    pub fn is_active(&self) -> bool {
        self.status != RideStatus::Completed
    }
}

/// Values recorded when a ride is completed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RideCompletion {
    pub gross_cents: i64,
    pub dropoff: Option<LatLng>,
    pub distance_miles: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PingSource {
    Gps,
    Network,
    Fused,
}

impl PingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PingSource::Gps => "gps",
            PingSource::Network => "network",
            PingSource::Fused => "fused",
        }
    }
}

/// A recorded location fix. The id is local-only and never remapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LocationPing {
    pub id: i64,
    pub shift_id: String,
    pub ride_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
    pub accuracy_m: f64,
    pub source: PingSource,
    pub synced: bool,
}

/// Insert request for a location ping
#[derive(Debug, Clone, PartialEq)]
pub struct NewPing {
    pub shift_id: String,
    pub ride_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
    pub accuracy_m: f64,
    pub source: PingSource,
}

/// A work expense, optionally with a receipt image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Expense {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub category: String,
    pub amount_cents: i64,
    pub note: Option<String>,
    /// Receipt payload, kept only until the server returns a receipt URL
    pub receipt_base64: Option<String>,
    pub receipt_mime: Option<String>,
    pub receipt_url: Option<String>,
    pub synced: bool,
}

/// Receipt image captured before sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub base64: String,
    pub mime: String,
}

/// Create expense request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewExpense {
    pub ts: Option<DateTime<Utc>>,
    pub category: String,
    pub amount_cents: i64,
    pub note: Option<String>,
    pub receipt: Option<Receipt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Patch,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a queued mutation does once the server accepts it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    ShiftCreate,
    ShiftEnd,
    RideCreate,
    RideEnd,
    RideTip,
    ExpenseCreate,
}

impl MutationKind {
    /// Entity whose server id comes back in the response body, if any
    pub fn created_entity(self) -> Option<EntityKind> {
        match self {
            MutationKind::ShiftCreate => Some(EntityKind::Shift),
            MutationKind::RideCreate => Some(EntityKind::Ride),
            MutationKind::ExpenseCreate => Some(EntityKind::Expense),
            MutationKind::ShiftEnd | MutationKind::RideEnd | MutationKind::RideTip => None,
        }
    }
}

/// Metadata stored next to an outbox entry.
///
/// Declares which identifiers embedded in the URL/body may need remapping
/// and what entity the request creates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMeta {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MutationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<String>,
}

impl OutboxMeta {
    pub fn new(kind: MutationKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    pub fn with_shift_id(mut self, id: impl Into<String>) -> Self {
        self.shift_id = Some(id.into());
        self
    }

    pub fn with_ride_id(mut self, id: impl Into<String>) -> Self {
        self.ride_id = Some(id.into());
        self
    }

    /// Identifiers that may have been replaced since the entry was queued
    pub fn referenced_ids(&self) -> Vec<&str> {
        let mut ids = Vec::with_capacity(3);
        for id in [&self.shift_id, &self.ride_id, &self.local_id]
            .into_iter()
            .flatten()
        {
            if !ids.contains(&id.as_str()) {
                ids.push(id.as_str());
            }
        }
        ids
    }
}

/// A not-yet-confirmed mutating request (outbox entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingRequest {
    pub id: i64,
    pub method: HttpMethod,
    /// Path relative to the API base URL, or an absolute URL
    pub url: String,
    /// Serialized JSON body
    pub body: String,
    /// Serialized `OutboxMeta`
    pub meta: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingRequest {
    /// Parse the stored metadata. Malformed metadata is treated as absent.
    pub fn parsed_meta(&self) -> Option<OutboxMeta> {
        let raw = self.meta.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!("Ignoring malformed meta on request {}: {}", self.id, e);
                None
            }
        }
    }
}

/// Local id replaced by a server id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct IdMapping {
    pub local_id: String,
    pub server_id: String,
    pub entity: EntityKind,
}
