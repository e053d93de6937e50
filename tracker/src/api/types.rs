//! Wire types for the tracker API

use crate::database::{LocationPing, PingSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRideRequest {
    pub shift_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndRideRequest {
    pub gross_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropoff_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropoff_lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_miles: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTipRequest {
    pub tip_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateExpenseRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    pub category: String,
    pub amount_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_mime: Option<String>,
}

/// Response of any create endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
    #[serde(default)]
    pub receipt_url: Option<String>,
}

/// One ping inside a location batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPing {
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    pub accuracy_m: f64,
    pub source: PingSource,
}

impl From<&LocationPing> for BatchPing {
    fn from(ping: &LocationPing) -> Self {
        Self {
            ts: ping.ts,
            lat: ping.lat,
            lng: ping.lng,
            speed_mps: ping.speed_mps,
            heading_deg: ping.heading_deg,
            accuracy_m: ping.accuracy_m,
            source: ping.source,
        }
    }
}

/// `POST /v1/location` body. All pings belong to one shift and at most one ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationBatch {
    pub shift_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<String>,
    pub pings: Vec<BatchPing>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationUploadResponse {
    #[serde(default)]
    pub inserted: i64,
}
