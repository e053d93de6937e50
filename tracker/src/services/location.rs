//! Location tracking service
//!
//! Holds the tracking session for the current shift and turns fixes from
//! the platform location provider into stored pings.

use super::settings::TrackingSettings;
use crate::database::{LocationPing, NewPing, PingSource, Repository};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    Waiting,
    Ride,
}

/// Fix cadence requested from the location provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingProfile {
    pub interval: Duration,
    pub distance_filter_m: f64,
    pub high_accuracy: bool,
}

impl TrackingProfile {
    pub fn for_mode(mode: TrackingMode, settings: &TrackingSettings) -> Self {
        match mode {
            TrackingMode::Waiting => Self {
                interval: Duration::from_millis(settings.waiting_interval_ms),
                distance_filter_m: settings.waiting_distance_filter_m,
                high_accuracy: false,
            },
            TrackingMode::Ride => Self {
                interval: Duration::from_millis(settings.ride_interval_ms),
                distance_filter_m: settings.ride_distance_filter_m,
                high_accuracy: true,
            },
        }
    }
}

/// One fix delivered by the location provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub bearing_deg: Option<f64>,
    #[serde(default = "default_source")]
    pub source: PingSource,
    /// Fix time; defaults to arrival time
    pub ts: Option<DateTime<Utc>>,
}

fn default_source() -> PingSource {
    PingSource::Gps
}

#[derive(Debug)]
struct Session {
    shift_id: Option<String>,
    ride_id: Option<String>,
    mode: TrackingMode,
    running: bool,
}

#[derive(Clone)]
pub struct LocationService {
    repo: Repository,
    settings: TrackingSettings,
    session: Arc<Mutex<Session>>,
}

impl LocationService {
    pub fn new(repo: Repository, settings: TrackingSettings) -> Self {
        Self {
            repo,
            settings,
            session: Arc::new(Mutex::new(Session {
                shift_id: None,
                ride_id: None,
                mode: TrackingMode::Waiting,
                running: false,
            })),
        }
    }

    /// Start (or retarget) tracking for a shift and optional ride
    pub async fn start(&self, shift_id: &str, ride_id: Option<&str>, mode: TrackingMode) {
        let mut session = self.session.lock().await;
        session.shift_id = Some(shift_id.to_string());
        session.ride_id = ride_id.map(str::to_string);
        session.mode = mode;
        session.running = true;

        tracing::info!("Location tracking started for shift {} ({:?})", shift_id, mode);
    }

    /// Switch cadence when a ride starts or ends. Ignored when not running.
    pub async fn set_mode(&self, mode: TrackingMode, ride_id: Option<&str>) {
        let mut session = self.session.lock().await;
        if !session.running {
            return;
        }
        session.mode = mode;
        session.ride_id = ride_id.map(str::to_string);

        tracing::debug!("Location tracking mode set to {:?}", mode);
    }

    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if !session.running {
            return;
        }
        session.shift_id = None;
        session.ride_id = None;
        session.running = false;

        tracing::info!("Location tracking stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.running
    }

    pub async fn mode(&self) -> TrackingMode {
        self.session.lock().await.mode
    }

    /// Provider configuration for the current mode
    pub async fn profile(&self) -> TrackingProfile {
        TrackingProfile::for_mode(self.mode().await, &self.settings)
    }

    /// Store a fix as a ping. Returns `None` when tracking is off.
    ///
    /// The store resolves session ids as it writes, so a ping never
    /// references a shift or ride id that has already been replaced.
    pub async fn record_fix(&self, fix: &LocationFix) -> Result<Option<LocationPing>> {
        let mut session = self.session.lock().await;
        if !session.running {
            return Ok(None);
        }
        let Some(shift_id) = session.shift_id.clone() else {
            return Ok(None);
        };

        let ping = self
            .repo
            .save_ping(&NewPing {
                shift_id,
                ride_id: session.ride_id.clone(),
                ts: fix.ts.unwrap_or_else(Utc::now),
                lat: fix.lat,
                lng: fix.lng,
                speed_mps: fix.speed_mps,
                heading_deg: fix.bearing_deg,
                accuracy_m: fix.accuracy_m.unwrap_or(0.0),
                source: fix.source,
            })
            .await?;
        session.shift_id = Some(ping.shift_id.clone());
        session.ride_id = ping.ride_id.clone();

        Ok(Some(ping))
    }
}
