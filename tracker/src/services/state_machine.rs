//! Shift/ride state machine
//!
//! Pure transition table. `TrackerService` applies it before touching the
//! store, so an illegal action never has side effects.

use crate::database::{Ride, RideStatus, Shift};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Idle,
    ShiftActive,
    EnRoute,
    InRide,
    ShiftEnded,
}

impl TrackerState {
    pub const ALL: [TrackerState; 5] = [
        TrackerState::Idle,
        TrackerState::ShiftActive,
        TrackerState::EnRoute,
        TrackerState::InRide,
        TrackerState::ShiftEnded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackerState::Idle => "idle",
            TrackerState::ShiftActive => "shift_active",
            TrackerState::EnRoute => "en_route",
            TrackerState::InRide => "in_ride",
            TrackerState::ShiftEnded => "shift_ended",
        }
    }

    /// Whether a shift is open and background work should run
    pub fn has_open_shift(self) -> bool {
        matches!(
            self,
            TrackerState::ShiftActive | TrackerState::EnRoute | TrackerState::InRide
        )
    }
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    StartShift,
    StartRide,
    MarkPickup,
    EndRide,
    AddTip,
    EndShift,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::StartShift,
        Action::StartRide,
        Action::MarkPickup,
        Action::EndRide,
        Action::AddTip,
        Action::EndShift,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::StartShift => "start shift",
            Action::StartRide => "start ride",
            Action::MarkPickup => "mark pickup",
            Action::EndRide => "end ride",
            Action::AddTip => "add tip",
            Action::EndShift => "end shift",
        }
    }
}

/// State after `action`, or the error it raises from `state`
pub fn transition(state: TrackerState, action: Action) -> Result<TrackerState> {
    use TrackerState::*;

    match (action, state) {
        (Action::StartShift, Idle) => Ok(ShiftActive),
        (Action::StartRide, ShiftActive) => Ok(EnRoute),
        (Action::MarkPickup, EnRoute) => Ok(InRide),
        (Action::EndRide, InRide) => Ok(ShiftActive),
        (Action::AddTip, ShiftActive | EnRoute | InRide | ShiftEnded) => Ok(state),
        (Action::EndShift, ShiftActive) => Ok(ShiftEnded),
        (Action::EndShift, EnRoute | InRide) => Err(AppError::RideInProgress),
        (Action::EndShift, Idle | ShiftEnded) | (Action::AddTip, Idle) => {
            Err(AppError::NoActiveShift)
        }
        _ => Err(AppError::InvalidState {
            action: action.as_str().to_string(),
            state: state.as_str().to_string(),
        }),
    }
}

/// Rebuild the state from persisted rows at startup
pub fn restore(shift: Option<&Shift>, ride: Option<&Ride>) -> TrackerState {
    match (shift, ride) {
        (None, _) => TrackerState::Idle,
        (Some(shift), _) if !shift.is_active() => TrackerState::Idle,
        (Some(_), Some(ride)) => match ride.status {
            RideStatus::EnRoute => TrackerState::EnRoute,
            RideStatus::InProgress => TrackerState::InRide,
            RideStatus::Completed => TrackerState::ShiftActive,
        },
        (Some(_), None) => TrackerState::ShiftActive,
    }
}
