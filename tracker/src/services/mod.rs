//! Services module
//!
//! Business logic services that coordinate between the tracker actions,
//! the local store and the remote API.

pub mod dispatch;
pub mod expenses;
pub mod location;
pub mod rewrite;
pub mod settings;
pub mod state_machine;
pub mod sync;
pub mod tracker;

pub use dispatch::{Dispatcher, Mutation, Outcome};
pub use expenses::ExpensesService;
pub use location::{LocationFix, LocationService, TrackingMode, TrackingProfile};
pub use settings::{AppSettings, SettingsService};
pub use state_machine::{Action, TrackerState};
pub use sync::{AppLifecycle, SyncEngine, SyncReport};
pub use tracker::{ShiftStats, TrackerService, TrackerView};
