//! Tracker service
//!
//! Runs the shift/ride actions. Each action checks the state machine,
//! writes locally, advances the state, then dispatches the matching remote
//! call. The UI reads a `TrackerView` published on a watch channel.

use super::dispatch::{Dispatcher, Mutation, Outcome};
use super::location::{LocationService, TrackingMode};
use super::state_machine::{self, transition, Action, TrackerState};
use super::sync::SyncEngine;
use crate::api::{EndRideRequest, StartRideRequest};
use crate::database::{IdMappings, LatLng, Repository, Ride, RideCompletion, Shift};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Running figures for the current shift
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShiftStats {
    pub rides: i64,
    pub earnings_cents: i64,
    pub tips_cents: i64,
    /// Seconds from start to end, or to now while active
    pub duration_secs: i64,
    /// Earnings in dollars per hour
    pub rate_per_hour: f64,
    pub distance_miles: f64,
}

impl ShiftStats {
    pub fn from_shift(shift: &Shift, now: DateTime<Utc>) -> Self {
        let end = shift.ended_at.unwrap_or(now);
        let duration_secs = (end - shift.started_at).num_seconds().max(0);
        let hours = duration_secs as f64 / 3600.0;
        let rate_per_hour = if hours > 0.0 {
            (shift.earnings_cents as f64 / 100.0) / hours
        } else {
            0.0
        };

        Self {
            rides: shift.ride_count,
            earnings_cents: shift.earnings_cents,
            tips_cents: shift.tips_cents,
            duration_secs,
            rate_per_hour,
            distance_miles: shift.distance_miles,
        }
    }
}

/// Everything the UI shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerView {
    pub state: TrackerState,
    pub shift: Option<Shift>,
    pub ride: Option<Ride>,
    pub stats: ShiftStats,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl Default for TrackerView {
    fn default() -> Self {
        Self {
            state: TrackerState::Idle,
            shift: None,
            ride: None,
            stats: ShiftStats::default(),
            is_loading: false,
            error: None,
        }
    }
}

#[derive(Debug)]
struct Session {
    state: TrackerState,
    shift_id: Option<String>,
    ride_id: Option<String>,
}

struct Inner {
    repo: Repository,
    ids: IdMappings,
    dispatcher: Dispatcher,
    sync: SyncEngine,
    location: LocationService,
    summary_delay: Duration,
    session: Mutex<Session>,
    view: watch::Sender<TrackerView>,
}

#[derive(Clone)]
pub struct TrackerService {
    inner: Arc<Inner>,
}

impl TrackerService {
    pub fn new(
        repo: Repository,
        ids: IdMappings,
        dispatcher: Dispatcher,
        sync: SyncEngine,
        location: LocationService,
        summary_delay: Duration,
    ) -> Self {
        let (view, _) = watch::channel(TrackerView::default());

        Self {
            inner: Arc::new(Inner {
                repo,
                ids,
                dispatcher,
                sync,
                location,
                summary_delay,
                session: Mutex::new(Session {
                    state: TrackerState::Idle,
                    shift_id: None,
                    ride_id: None,
                }),
                view,
            }),
        }
    }

    /// Rebuild state from the store and resume background work
    pub async fn restore(&self) -> Result<TrackerState> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;

        let shift = inner.repo.get_active_shift().await?;
        let ride = match &shift {
            Some(shift) => inner.repo.get_active_ride(&shift.id).await?,
            None => None,
        };

        session.state = state_machine::restore(shift.as_ref(), ride.as_ref());
        session.shift_id = shift.as_ref().map(|s| s.id.clone());
        session.ride_id = ride.as_ref().map(|r| r.id.clone());
        inner.publish(&session).await?;

        if let Some(shift) = &shift {
            let mode = if ride.is_some() {
                TrackingMode::Ride
            } else {
                TrackingMode::Waiting
            };
            inner
                .location
                .start(&shift.id, session.ride_id.as_deref(), mode)
                .await;
            inner.sync.start().await;
            tracing::info!("Restored {} for shift {}", session.state, shift.id);
        }

        Ok(session.state)
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> TrackerView {
        self.inner.view.borrow().clone()
    }

    pub async fn state(&self) -> TrackerState {
        self.inner.session.lock().await.state
    }

    pub fn clear_error(&self) {
        self.inner.view.send_modify(|view| view.error = None);
    }

    pub async fn shift_history(&self, limit: i64) -> Result<Vec<Shift>> {
        self.inner.repo.shift_history(limit).await
    }

    pub async fn rides_for_shift(&self, shift_id: &str) -> Result<Vec<Ride>> {
        let shift_id = self.inner.ids.current(shift_id).await?;
        self.inner.repo.rides_for_shift(&shift_id).await
    }

    pub async fn start_shift(&self) -> Result<Outcome> {
        self.guarded(self.inner.start_shift()).await
    }

    pub async fn start_ride(&self, pickup: Option<LatLng>) -> Result<Outcome> {
        self.guarded(self.inner.start_ride(pickup)).await
    }

    pub async fn mark_pickup(&self) -> Result<()> {
        self.guarded(self.inner.mark_pickup()).await
    }

    pub async fn end_ride(
        &self,
        gross_cents: i64,
        dropoff: Option<LatLng>,
        distance_miles: Option<f64>,
    ) -> Result<Outcome> {
        let completion = RideCompletion {
            gross_cents,
            dropoff,
            distance_miles,
        };
        self.guarded(self.inner.end_ride(completion)).await
    }

    pub async fn add_tip(&self, tip_cents: i64) -> Result<Outcome> {
        self.guarded(self.inner.add_tip(tip_cents)).await
    }

    pub async fn end_shift(&self) -> Result<Outcome> {
        let outcome = self.guarded(self.inner.end_shift()).await?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.summary_delay).await;
            if let Err(e) = inner.reset_after_summary().await {
                tracing::error!("Failed to return to idle: {}", e);
            }
        });

        Ok(outcome)
    }

    /// Mark the view busy while `action` runs and surface its error
    async fn guarded<T>(&self, action: impl Future<Output = Result<T>>) -> Result<T> {
        self.inner.view.send_modify(|view| {
            view.is_loading = true;
            view.error = None;
        });

        let result = action.await;

        self.inner.view.send_modify(|view| {
            view.is_loading = false;
            if let Err(e) = &result {
                view.error = Some(e.to_string());
            }
        });
        result
    }
}

impl Inner {
    async fn start_shift(&self) -> Result<Outcome> {
        let mut session = self.session.lock().await;
        let next = transition(session.state, Action::StartShift)?;

        let shift = self.repo.create_shift().await?;
        session.state = next;
        session.shift_id = Some(shift.id.clone());
        session.ride_id = None;
        self.publish(&session).await?;
        tracing::info!("Shift {} started", shift.id);

        self.location
            .start(&shift.id, None, TrackingMode::Waiting)
            .await;
        self.sync.start().await;

        let outcome = self
            .dispatcher
            .dispatch(Mutation::shift_create(&shift.id))
            .await?;
        self.finish(&mut session).await?;
        Ok(outcome)
    }

    async fn start_ride(&self, pickup: Option<LatLng>) -> Result<Outcome> {
        let mut session = self.session.lock().await;
        self.refresh_ids(&mut session).await?;
        let next = transition(session.state, Action::StartRide)?;
        let shift_id = session.shift_id.clone().ok_or(AppError::NoActiveShift)?;

        let ride = self.repo.create_ride(&shift_id, pickup).await?;
        session.state = next;
        session.shift_id = Some(ride.shift_id.clone());
        session.ride_id = Some(ride.id.clone());
        self.publish(&session).await?;
        tracing::info!("Ride {} started", ride.id);

        self.location
            .set_mode(TrackingMode::Ride, Some(&ride.id))
            .await;

        let request = StartRideRequest {
            shift_id: ride.shift_id.clone(),
            pickup_lat: pickup.map(|p| p.lat),
            pickup_lng: pickup.map(|p| p.lng),
        };
        let outcome = self
            .dispatcher
            .dispatch(Mutation::ride_create(&ride.id, &request)?)
            .await?;
        self.finish(&mut session).await?;
        Ok(outcome)
    }

    async fn mark_pickup(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.refresh_ids(&mut session).await?;
        let next = transition(session.state, Action::MarkPickup)?;
        let ride_id = session.ride_id.clone().ok_or(AppError::NoRideFound)?;

        let ride = self.repo.mark_picked_up(&ride_id).await?;
        session.state = next;
        session.ride_id = Some(ride.id.clone());
        self.publish(&session).await?;
        tracing::info!("Rider picked up for ride {}", ride.id);

        Ok(())
    }

    async fn end_ride(&self, completion: RideCompletion) -> Result<Outcome> {
        if completion.gross_cents < 0 {
            return Err(AppError::Validation("Fare cannot be negative".to_string()));
        }

        let mut session = self.session.lock().await;
        self.refresh_ids(&mut session).await?;
        let next = transition(session.state, Action::EndRide)?;
        let ride_id = session.ride_id.clone().ok_or(AppError::NoRideFound)?;

        let (ride, shift) = self.repo.complete_ride(&ride_id, &completion).await?;
        session.state = next;
        session.shift_id = Some(shift.id.clone());
        session.ride_id = None;
        self.publish(&session).await?;
        tracing::info!(
            "Ride {} ended: {} cents, shift {} now at {} cents",
            ride.id,
            completion.gross_cents,
            shift.id,
            shift.earnings_cents
        );

        self.location.set_mode(TrackingMode::Waiting, None).await;

        let request = EndRideRequest {
            gross_cents: completion.gross_cents,
            dropoff_lat: completion.dropoff.map(|p| p.lat),
            dropoff_lng: completion.dropoff.map(|p| p.lng),
            distance_miles: completion.distance_miles,
        };
        let outcome = self
            .dispatcher
            .dispatch(Mutation::ride_end(&ride.id, &shift.id, &request)?)
            .await?;
        self.finish(&mut session).await?;
        Ok(outcome)
    }

    async fn add_tip(&self, tip_cents: i64) -> Result<Outcome> {
        if tip_cents <= 0 {
            return Err(AppError::Validation("Tip must be positive".to_string()));
        }

        let mut session = self.session.lock().await;
        self.refresh_ids(&mut session).await?;
        transition(session.state, Action::AddTip)?;
        let shift_id = session.shift_id.clone().ok_or(AppError::NoActiveShift)?;

        let ride = self
            .repo
            .last_ride_for_shift(&shift_id)
            .await?
            .ok_or(AppError::NoRideFound)?;
        let (ride, shift) = self.repo.add_tip(&ride.id, tip_cents).await?;
        session.shift_id = Some(shift.id.clone());
        self.publish(&session).await?;
        tracing::info!("Added {} cents tip to ride {}", tip_cents, ride.id);

        let outcome = self
            .dispatcher
            .dispatch(Mutation::ride_tip(&ride.id, &shift.id, tip_cents)?)
            .await?;
        self.finish(&mut session).await?;
        Ok(outcome)
    }

    async fn end_shift(&self) -> Result<Outcome> {
        let mut session = self.session.lock().await;
        self.refresh_ids(&mut session).await?;
        let next = transition(session.state, Action::EndShift)?;
        let shift_id = session.shift_id.clone().ok_or(AppError::NoActiveShift)?;

        let shift = self.repo.end_shift(&shift_id).await?;
        session.state = next;
        session.shift_id = Some(shift.id.clone());
        self.publish(&session).await?;
        tracing::info!("Shift {} ended", shift.id);

        let outcome = self
            .dispatcher
            .dispatch(Mutation::shift_end(&shift.id))
            .await?;

        match self.sync.trigger().await {
            Ok(report) => tracing::info!("Final sync after shift end: {:?}", report),
            Err(e) => tracing::error!("Final sync after shift end failed: {}", e),
        }
        self.sync.stop().await;
        self.location.stop().await;

        self.refresh_ids(&mut session).await?;
        self.publish(&session).await?;
        Ok(outcome)
    }

    /// Leave the shift summary. No-op unless the shift is still ended.
    async fn reset_after_summary(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.state != TrackerState::ShiftEnded {
            return Ok(());
        }

        session.state = TrackerState::Idle;
        session.shift_id = None;
        session.ride_id = None;
        self.publish(&session).await?;
        tracing::info!("Returned to idle");

        Ok(())
    }

    /// After a dispatch: pick up any remap and wake the sync loop
    async fn finish(&self, session: &mut Session) -> Result<()> {
        self.refresh_ids(session).await?;
        self.publish(session).await?;
        self.sync.nudge();
        Ok(())
    }

    /// Replace session ids that have been remapped since they were set
    async fn refresh_ids(&self, session: &mut Session) -> Result<()> {
        if let Some(shift_id) = session.shift_id.take() {
            session.shift_id = Some(self.ids.current(&shift_id).await?);
        }
        if let Some(ride_id) = session.ride_id.take() {
            session.ride_id = Some(self.ids.current(&ride_id).await?);
        }
        Ok(())
    }

    async fn publish(&self, session: &Session) -> Result<()> {
        let shift = match &session.shift_id {
            Some(id) => self.repo.get_shift(id).await?,
            None => None,
        };
        let ride = match &session.ride_id {
            Some(id) => self.repo.get_ride(id).await?,
            None => None,
        };
        let stats = shift
            .as_ref()
            .map(|shift| ShiftStats::from_shift(shift, Utc::now()))
            .unwrap_or_default();
        let state = session.state;

        self.view.send_modify(|view| {
            view.state = state;
            view.shift = shift;
            view.ride = ride;
            view.stats = stats;
        });
        Ok(())
    }
}
